//! Frame pacer.
//!
//! A packetized frame leaves the packetizer as one burst. The spacer releases
//! it over a fraction of the frame duration instead, one packet per
//! `fraction * frame_duration / packet_count`. When frames pile up faster
//! than they can be spaced, queued frames are flushed without pacing until
//! the backlog is back under the catch-up threshold.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace};
use sansio::Protocol;
use shared::error::{Error, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::attributes::{Attributes, Info};
use crate::chain::{MultiWriter, Processor, Writer};

pub const DEFAULT_FRACTION: f64 = 0.3;
pub const DEFAULT_CATCH_UP_THRESHOLD: usize = 2;
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// The packets of one frame.
#[derive(Debug, Clone)]
pub struct Batch {
    pub now: Instant,
    pub packets: Vec<Bytes>,
    pub attributes: Attributes,
    pub frame_duration: Duration,
}

struct Active {
    packets: VecDeque<Bytes>,
    attributes: Attributes,
    interval: Duration,
    next_release: Instant,
}

/// Sans-IO pacing core. Batches go in through `handle_write`, packets come
/// out of `poll_write` once their release time has passed.
pub struct Spacer {
    queue: VecDeque<Batch>,
    active: Option<Active>,
    released: VecDeque<(Bytes, Attributes)>,
    fraction: f64,
    catch_up_threshold: usize,
    queue_size: usize,
    catching_up: bool,
}

impl Spacer {
    pub fn new(fraction: f64, catch_up_threshold: usize, queue_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            released: VecDeque::new(),
            fraction,
            catch_up_threshold,
            queue_size: queue_size.max(1),
            catching_up: false,
        }
    }

    /// Batches waiting behind the one being paced.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.queue_size
    }

    fn release(&mut self, now: Instant) {
        loop {
            if let Some(active) = self.active.as_mut() {
                while active.next_release <= now {
                    let Some(packet) = active.packets.pop_front() else {
                        break;
                    };
                    self.released
                        .push_back((packet, active.attributes.clone()));
                    active.next_release += active.interval;
                }
                if !active.packets.is_empty() {
                    return;
                }
                self.active = None;
            }

            let Some(batch) = self.queue.pop_front() else {
                return;
            };
            if batch.packets.is_empty() {
                continue;
            }

            if self.queue.len() > self.catch_up_threshold {
                if !self.catching_up {
                    debug!(
                        "spacer catching up: {} frames queued, flushing without pacing",
                        self.queue.len()
                    );
                    self.catching_up = true;
                }
                for packet in batch.packets {
                    self.released.push_back((packet, batch.attributes.clone()));
                }
                continue;
            }
            if self.catching_up {
                debug!("spacer caught up");
                self.catching_up = false;
            }

            let count = batch.packets.len() as u32;
            let spread = (batch.frame_duration.as_nanos() as f64 * self.fraction).round() as u64;
            let interval = Duration::from_nanos(spread) / count;
            trace!("spacing {count} packets every {interval:?}");
            self.active = Some(Active {
                packets: batch.packets.into(),
                attributes: batch.attributes,
                interval,
                next_release: now,
            });
        }
    }
}

impl Protocol<(), Batch, ()> for Spacer {
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

    fn handle_write(&mut self, msg: Batch) -> Result<()> {
        if self.is_full() {
            return Err(Error::ErrQueueOverflow);
        }
        let now = msg.now;
        self.queue.push_back(msg);
        self.release(now);
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.released.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
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
        self.active.as_ref().map(|active| active.next_release)
    }

    fn close(&mut self) -> Result<()> {
        self.queue.clear();
        self.active = None;
        self.released.clear();
        Ok(())
    }
}

/// Builder for [`FrameSpacer`].
#[derive(Debug, Clone)]
pub struct FrameSpacerBuilder {
    fraction: f64,
    catch_up_threshold: usize,
    queue_size: usize,
}

impl Default for FrameSpacerBuilder {
    fn default() -> Self {
        Self {
            fraction: DEFAULT_FRACTION,
            catch_up_threshold: DEFAULT_CATCH_UP_THRESHOLD,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl FrameSpacerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of the frame duration a frame's packets are spread over.
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Queued frames beyond which frames are flushed without pacing.
    pub fn with_catch_up_threshold(mut self, threshold: usize) -> Self {
        self.catch_up_threshold = threshold;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn build(self) -> FrameSpacer {
        FrameSpacer {
            config: self,
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

/// Stage wrapping a [`Spacer`] in a tokio task.
pub struct FrameSpacer {
    config: FrameSpacerBuilder,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FrameSpacer {
    pub fn close(&mut self) {
        self.cancel.cancel();
    }

    /// Stops the pacing task and waits for it to finish.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("spacer task failed: {err}");
            }
        }
    }
}

impl Drop for FrameSpacer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Processor for FrameSpacer {
    fn link(&mut self, next: Box<dyn Writer>, info: &Info) -> Result<Box<dyn Writer>> {
        let frame_duration = info.frame_duration()?;
        let config = &self.config;
        let spacer = Spacer::new(
            config.fraction,
            config.catch_up_threshold,
            config.queue_size,
        );
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        self.task = Some(tokio::spawn(run_spacer(
            spacer,
            rx,
            next,
            self.cancel.clone(),
        )));

        Ok(Box::new(FrameSpacerWriter { tx, frame_duration }))
    }
}

struct FrameSpacerWriter {
    tx: mpsc::Sender<Batch>,
    frame_duration: Duration,
}

impl FrameSpacerWriter {
    fn enqueue(&mut self, packets: Vec<Bytes>, attributes: Attributes) -> Result<()> {
        let frame_duration = attributes
            .optional(Attributes::frame_duration)?
            .unwrap_or(self.frame_duration);
        let batch = Batch {
            now: tokio::time::Instant::now().into_std(),
            packets,
            attributes,
            frame_duration,
        };
        match self.tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(batch)) => {
                error!(
                    "spacer queue full, rejecting frame of {} packets",
                    batch.packets.len()
                );
                Err(Error::ErrQueueOverflow)
            }
            Err(TrySendError::Closed(_)) => Err(Error::ErrClosedPipe),
        }
    }
}

#[async_trait]
impl Writer for FrameSpacerWriter {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        self.enqueue(vec![buf], attributes)
    }

    fn as_multi_writer(&mut self) -> Option<&mut dyn MultiWriter> {
        Some(self)
    }
}

#[async_trait]
impl MultiWriter for FrameSpacerWriter {
    async fn write_all(&mut self, bufs: Vec<Bytes>, attributes: Attributes) -> Result<()> {
        self.enqueue(bufs, attributes)
    }
}

async fn run_spacer(
    mut spacer: Spacer,
    mut rx: mpsc::Receiver<Batch>,
    mut next: Box<dyn Writer>,
    cancel: CancellationToken,
) {
    loop {
        while let Some((packet, attributes)) = spacer.poll_write() {
            if let Err(err) = next.write(packet, attributes).await {
                error!("spacer failed to forward packet: {err}");
            }
        }

        let deadline = spacer.poll_timeout();
        let sleep = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };
        let accepting = !spacer.is_full();

        tokio::select! {
            _ = cancel.cancelled() => break,
            batch = rx.recv(), if accepting => {
                let Some(batch) = batch else {
                    break;
                };
                let mut batches = vec![batch];
                while batches.len() + spacer.queued() < spacer.queue_size {
                    match rx.try_recv() {
                        Ok(batch) => batches.push(batch),
                        Err(_) => break,
                    }
                }
                for batch in batches {
                    if let Err(err) = spacer.handle_write(batch) {
                        error!("spacer dropped frame: {err}");
                    }
                }
            }
            _ = sleep => {
                if let Err(err) = spacer.handle_timeout(tokio::time::Instant::now().into_std()) {
                    error!("spacer release failed: {err}");
                }
            }
        }
    }

    if let Err(err) = spacer.close() {
        error!("closing spacer failed: {err}");
    }
}
