//! Token bucket rate shaper.
//!
//! Packets leave the shaper only while the bucket holds enough bits for
//! them. The bucket refills at the target rate published by the congestion
//! controller and holds at most `burst` bits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace};
use sansio::Protocol;
use shared::error::{Error, Result};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::attributes::{Attributes, Info};
use crate::chain::{MultiWriter, Processor, Writer};
use crate::codec::RateSink;

pub const DEFAULT_RATE: u64 = 750_000;
pub const DEFAULT_BURST: u64 = 1200 * 8 * 2;
pub const DEFAULT_TICK: Duration = Duration::from_millis(5);
pub const DEFAULT_QUEUE_SIZE: usize = 4096;

/// Sans-IO token bucket. Writes queue packets, events change the rate in bits
/// per second, and timeouts release what the bucket allows.
pub struct TokenBucket {
    rate: u64,
    burst: i64,
    tokens: i64,
    last_refill: Option<Instant>,
    tick: Duration,
    queue: VecDeque<(Bytes, Attributes)>,
    queue_size: usize,
    released: VecDeque<(Bytes, Attributes)>,
}

impl TokenBucket {
    pub fn new(rate: u64, burst: u64, tick: Duration, queue_size: usize) -> Self {
        Self {
            rate,
            burst: burst as i64,
            tokens: burst as i64,
            last_refill: None,
            tick,
            queue: VecDeque::new(),
            queue_size: queue_size.max(1),
            released: VecDeque::new(),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.queue_size
    }

    fn refill(&mut self, now: Instant) {
        if let Some(last) = self.last_refill {
            let elapsed = now.saturating_duration_since(last).as_nanos();
            let earned = (elapsed * self.rate as u128 / 1_000_000_000) as i64;
            self.tokens = self.tokens.saturating_add(earned).min(self.burst);
        }
        self.last_refill = Some(now);
    }

    fn release(&mut self, now: Instant) {
        self.refill(now);
        while let Some((packet, _)) = self.queue.front() {
            let bits = (packet.len() * 8) as i64;
            // a packet larger than the burst goes out on a full bucket
            if self.tokens < bits && self.tokens < self.burst {
                break;
            }
            self.tokens -= bits;
            if let Some(entry) = self.queue.pop_front() {
                self.released.push_back(entry);
            }
        }
    }
}

impl Protocol<(), (Bytes, Attributes), u64> for TokenBucket {
    type Rout = ();
    type Wout = (Bytes, Attributes);
    type Eout = ();
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, msg: (Bytes, Attributes)) -> Result<()> {
        if self.is_full() {
            return Err(Error::ErrQueueOverflow);
        }
        self.queue.push_back(msg);
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.released.pop_front()
    }

    /// Sets a new rate in bits per second, applied from the next refill.
    fn handle_event(&mut self, rate: u64) -> Result<()> {
        trace!("token bucket rate {} -> {} bps", self.rate, rate);
        self.rate = rate;
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        None
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.release(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        if self.queue.is_empty() {
            None
        } else {
            self.last_refill.map(|last| last + self.tick)
        }
    }

    fn close(&mut self) -> Result<()> {
        self.queue.clear();
        self.released.clear();
        Ok(())
    }
}

/// Builder for [`RateShaper`].
#[derive(Debug, Clone)]
pub struct RateShaperBuilder {
    rate: u64,
    burst: u64,
    tick: Duration,
    queue_size: usize,
}

impl Default for RateShaperBuilder {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            burst: DEFAULT_BURST,
            tick: DEFAULT_TICK,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl RateShaperBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial rate in bits per second.
    pub fn with_rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// Bucket size in bits.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn build(self) -> RateShaper {
        let (rate_tx, rate_rx) = watch::channel(self.rate);
        RateShaper {
            config: self,
            rate_tx: Arc::new(rate_tx),
            rate_rx: Some(rate_rx),
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

/// Stage that shapes outgoing packets to the current target rate.
pub struct RateShaper {
    config: RateShaperBuilder,
    rate_tx: Arc<watch::Sender<u64>>,
    rate_rx: Option<watch::Receiver<u64>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Rate handle of a [`RateShaper`], registered with the transport.
#[derive(Debug, Clone)]
pub struct ShaperHandle {
    rate_tx: Arc<watch::Sender<u64>>,
}

impl RateSink for ShaperHandle {
    fn set_target_rate(&self, bps: u64) {
        self.rate_tx.send_replace(bps);
    }
}

impl RateShaper {
    pub fn handle(&self) -> ShaperHandle {
        ShaperHandle {
            rate_tx: Arc::clone(&self.rate_tx),
        }
    }

    pub fn set_target_rate(&self, bps: u64) {
        self.rate_tx.send_replace(bps);
    }

    pub fn target_rate(&self) -> u64 {
        *self.rate_tx.borrow()
    }

    pub fn close(&mut self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("shaper task failed: {err}");
            }
        }
    }
}

impl Drop for RateShaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Processor for RateShaper {
    fn link(&mut self, next: Box<dyn Writer>, _info: &Info) -> Result<Box<dyn Writer>> {
        let rate_rx = self
            .rate_rx
            .take()
            .ok_or_else(|| Error::Other("rate shaper already linked".to_owned()))?;
        let config = &self.config;
        let bucket = TokenBucket::new(
            *rate_rx.borrow(),
            config.burst,
            config.tick,
            config.queue_size,
        );
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));

        debug!(
            "rate shaper linked: rate {} bps burst {} bits",
            bucket.rate(),
            config.burst
        );
        self.task = Some(tokio::spawn(run_shaper(
            bucket,
            rx,
            rate_rx,
            next,
            self.cancel.clone(),
        )));

        Ok(Box::new(ShaperWriter { tx }))
    }
}

struct ShaperWriter {
    tx: mpsc::Sender<(Bytes, Attributes)>,
}

impl ShaperWriter {
    fn enqueue(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        match self.tx.try_send((buf, attributes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!("shaper queue full, rejecting packet");
                Err(Error::ErrQueueOverflow)
            }
            Err(TrySendError::Closed(_)) => Err(Error::ErrClosedPipe),
        }
    }
}

#[async_trait]
impl Writer for ShaperWriter {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        self.enqueue(buf, attributes)
    }

    fn as_multi_writer(&mut self) -> Option<&mut dyn MultiWriter> {
        Some(self)
    }
}

#[async_trait]
impl MultiWriter for ShaperWriter {
    async fn write_all(&mut self, bufs: Vec<Bytes>, attributes: Attributes) -> Result<()> {
        for buf in bufs {
            self.enqueue(buf, attributes.clone())?;
        }
        Ok(())
    }
}

async fn run_shaper(
    mut bucket: TokenBucket,
    mut rx: mpsc::Receiver<(Bytes, Attributes)>,
    mut rate_rx: watch::Receiver<u64>,
    mut next: Box<dyn Writer>,
    cancel: CancellationToken,
) {
    let mut rate_open = true;
    loop {
        while let Some((packet, attributes)) = bucket.poll_write() {
            if let Err(err) = next.write(packet, attributes).await {
                error!("shaper failed to forward packet: {err}");
            }
        }

        let deadline = bucket.poll_timeout();
        let sleep = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };
        let accepting = !bucket.is_full();

        tokio::select! {
            _ = cancel.cancelled() => break,
            entry = rx.recv(), if accepting => {
                let Some(entry) = entry else {
                    break;
                };
                if let Err(err) = bucket.handle_write(entry) {
                    error!("shaper dropped packet: {err}");
                }
                while !bucket.is_full() {
                    let Ok(entry) = rx.try_recv() else {
                        break;
                    };
                    if let Err(err) = bucket.handle_write(entry) {
                        error!("shaper dropped packet: {err}");
                    }
                }
                if let Err(err) = bucket.handle_timeout(tokio::time::Instant::now().into_std()) {
                    error!("shaper refill failed: {err}");
                }
            }
            changed = rate_rx.changed(), if rate_open => {
                if changed.is_err() {
                    rate_open = false;
                    continue;
                }
                let rate = *rate_rx.borrow_and_update();
                debug!("shaper rate set to {rate} bps");
                if let Err(err) = bucket.handle_event(rate) {
                    error!("shaper rate update failed: {err}");
                }
            }
            _ = sleep => {
                if let Err(err) = bucket.handle_timeout(tokio::time::Instant::now().into_std()) {
                    error!("shaper refill failed: {err}");
                }
            }
        }
    }

    if let Err(err) = bucket.close() {
        error!("closing shaper failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(len: usize) -> (Bytes, Attributes) {
        (Bytes::from(vec![0u8; len]), Attributes::new())
    }

    fn drain(bucket: &mut TokenBucket) -> usize {
        std::iter::from_fn(|| bucket.poll_write()).count()
    }

    #[test]
    fn test_token_bucket_burst_then_rate() -> Result<()> {
        // 2 packets of 1200 bytes fit the default burst
        let mut bucket = TokenBucket::new(960_000, DEFAULT_BURST, DEFAULT_TICK, 64);
        let t0 = Instant::now();
        for _ in 0..5 {
            bucket.handle_write(make_packet(1200))?;
        }
        bucket.handle_timeout(t0)?;
        assert_eq!(drain(&mut bucket), 2);
        assert_eq!(bucket.poll_timeout(), Some(t0 + DEFAULT_TICK));

        // 960 kbps refills one 9600-bit packet every 10ms
        bucket.handle_timeout(t0 + Duration::from_millis(5))?;
        assert_eq!(drain(&mut bucket), 0);
        bucket.handle_timeout(t0 + Duration::from_millis(10))?;
        assert_eq!(drain(&mut bucket), 1);

        Ok(())
    }

    #[test]
    fn test_token_bucket_rate_change() -> Result<()> {
        let mut bucket = TokenBucket::new(96_000, DEFAULT_BURST, DEFAULT_TICK, 64);
        let t0 = Instant::now();
        for _ in 0..4 {
            bucket.handle_write(make_packet(1200))?;
        }
        bucket.handle_timeout(t0)?;
        assert_eq!(drain(&mut bucket), 2);

        bucket.handle_event(9_600_000)?;
        assert_eq!(bucket.rate(), 9_600_000);
        bucket.handle_timeout(t0 + Duration::from_millis(2))?;
        assert_eq!(drain(&mut bucket), 2);
        assert_eq!(bucket.poll_timeout(), None);

        Ok(())
    }

    #[test]
    fn test_token_bucket_oversized_packet() -> Result<()> {
        let mut bucket = TokenBucket::new(1_000, 800, DEFAULT_TICK, 64);
        bucket.handle_write(make_packet(1000))?;
        bucket.handle_timeout(Instant::now())?;
        assert_eq!(drain(&mut bucket), 1);

        Ok(())
    }

    #[test]
    fn test_token_bucket_overflow() -> Result<()> {
        let mut bucket = TokenBucket::new(1_000, 800, DEFAULT_TICK, 1);
        bucket.handle_write(make_packet(10))?;
        assert_eq!(
            bucket.handle_write(make_packet(10)),
            Err(Error::ErrQueueOverflow)
        );

        Ok(())
    }

    #[test]
    fn test_shaper_handle_publishes_rate() {
        let shaper = RateShaperBuilder::new().with_rate(100).build();
        let handle = shaper.handle();
        handle.set_target_rate(2_000_000);
        assert_eq!(shaper.target_rate(), 2_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shaper_task_keeps_running_after_overflow() -> Result<()> {
        use crate::chain::WriterFn;
        use std::sync::Mutex;

        let sent = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&sent);
        let sink = WriterFn(move |_buf: Bytes, _attributes: Attributes| {
            *counter.lock()? += 1;
            Ok(())
        });

        // 100-byte packets leave one per 100ms
        let mut shaper = RateShaperBuilder::new()
            .with_rate(8_000)
            .with_burst(800)
            .with_queue_size(2)
            .build();
        let mut writer = shaper.link(Box::new(sink), &Info::new(64, 48, 30, 1))?;

        writer.write(make_packet(100).0, Attributes::new()).await?;
        writer.write(make_packet(100).0, Attributes::new()).await?;
        assert_eq!(
            writer.write(make_packet(100).0, Attributes::new()).await,
            Err(Error::ErrQueueOverflow)
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*sent.lock()?, 2);

        writer.write(make_packet(100).0, Attributes::new()).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*sent.lock()?, 3);

        shaper.shutdown().await;
        Ok(())
    }
}
