//! Congestion-controlled transport on top of a [`Session`].
//!
//! A transport plays one of two roles on the feedback side channel:
//!
//! * [`Role::RateController`] (the media sender) records every packet the
//!   session sends, accepts the feedback flow, resolves each feedback batch
//!   against its ledger, runs the congestion controller and pushes the new
//!   target rate into every registered [`RateSink`].
//! * [`Role::FeedbackSender`] (the media receiver) records every arrival and
//!   ships the accumulated events every feedback interval.
//!
//! Media flows are opened through the transport but never wait for
//! feedback; rate changes reach the encoder and shaper asynchronously.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use pipeline::RateSink;
use shared::error::{Error, Result};
use shared::marshal::unmarshal_bytes;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::controller::{AimdController, CongestionController};
use crate::events::PacketEvent;
use crate::feedback::{DEFAULT_MAX_EVENTS_PER_MESSAGE, FeedbackBatch, marshal_batches};
use crate::flow::{PacketObserver, ReceiveFlow, SendFlow, Session};
use crate::ledger::{ArrivalRecorder, DEFAULT_ARRIVAL_QUEUE_CAPACITY, PacketLedger};
use crate::rtp_flow::{MAX_DATAGRAM_SIZE, RtpReceiveFlow, RtpSendFlow};
use crate::rtp_logger::RtpLogger;

pub const DEFAULT_FEEDBACK_FLOW_ID: u64 = 42;
pub const DEFAULT_FEEDBACK_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives feedback and drives the congestion controller.
    RateController,
    /// Records arrivals and sends feedback.
    FeedbackSender,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::RateController => "rate-controller",
            Role::FeedbackSender => "feedback-sender",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub role: Role,
    pub feedback_flow_id: u64,
    pub feedback_interval: Duration,
    pub max_events_per_message: usize,
    pub arrival_queue_capacity: usize,
    /// Logs every RTP packet of media flows opened through the transport.
    pub log_rtp_packets: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            role: Role::RateController,
            feedback_flow_id: DEFAULT_FEEDBACK_FLOW_ID,
            feedback_interval: DEFAULT_FEEDBACK_INTERVAL,
            max_events_per_message: DEFAULT_MAX_EVENTS_PER_MESSAGE,
            arrival_queue_capacity: DEFAULT_ARRIVAL_QUEUE_CAPACITY,
            log_rtp_packets: false,
        }
    }
}

/// Builder for [`Transport`].
///
/// # Example
///
/// ```ignore
/// let transport = TransportBuilder::new()
///     .with_role(Role::RateController)
///     .with_controller(AimdControllerBuilder::new().build())
///     .with_rate_sink(encoder.rate_sink())
///     .with_rate_sink(Arc::new(shaper.handle()))
///     .build(session)
///     .await?;
/// ```
pub struct TransportBuilder {
    config: TransportConfig,
    controller: Option<Box<dyn CongestionController>>,
    rate_sinks: Vec<Arc<dyn RateSink>>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self {
            config: TransportConfig::default(),
            controller: None,
            rate_sinks: vec![],
        }
    }
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    pub fn with_feedback_flow_id(mut self, id: u64) -> Self {
        self.config.feedback_flow_id = id;
        self
    }

    pub fn with_feedback_interval(mut self, interval: Duration) -> Self {
        self.config.feedback_interval = interval;
        self
    }

    pub fn with_max_events_per_message(mut self, max: usize) -> Self {
        self.config.max_events_per_message = max;
        self
    }

    pub fn with_arrival_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.arrival_queue_capacity = capacity;
        self
    }

    pub fn with_rtp_logging(mut self, enabled: bool) -> Self {
        self.config.log_rtp_packets = enabled;
        self
    }

    /// Controller used in the rate-controlling role. Defaults to
    /// [`AimdController`].
    pub fn with_controller(mut self, controller: impl CongestionController + 'static) -> Self {
        self.controller = Some(Box::new(controller));
        self
    }

    pub fn with_rate_sink(mut self, sink: Arc<dyn RateSink>) -> Self {
        self.rate_sinks.push(sink);
        self
    }

    /// Installs the packet observer and starts the feedback loop of the
    /// configured role.
    pub async fn build(self, session: Arc<dyn Session>) -> Result<Transport> {
        let config = self.config;
        let cancel = CancellationToken::new();
        let errors = Arc::new(FirstError::default());
        let rates = Arc::new(RatePublisher {
            target_rate: AtomicU64::new(0),
            sinks: Mutex::new(self.rate_sinks),
        });

        let task = match config.role {
            Role::RateController => {
                let controller = self
                    .controller
                    .unwrap_or_else(|| Box::new(AimdController::default()));
                rates.publish(controller.target_rate());

                let ledger = Arc::new(Mutex::new(PacketLedger::new()));
                let last_rtt_us = Arc::new(AtomicU64::new(0));
                session.set_packet_observer(Arc::new(LedgerObserver {
                    ledger: Arc::clone(&ledger),
                    last_rtt_us: Arc::clone(&last_rtt_us),
                }));
                let flow = session
                    .accept_receive_flow(config.feedback_flow_id)
                    .await?;

                tokio::spawn(run_feedback_receiver(FeedbackReceiver {
                    flow,
                    ledger,
                    last_rtt_us,
                    controller,
                    rates: Arc::clone(&rates),
                    errors: Arc::clone(&errors),
                    cancel: cancel.child_token(),
                }))
            }
            Role::FeedbackSender => {
                let recorder = Arc::new(Mutex::new(ArrivalRecorder::new(
                    config.arrival_queue_capacity,
                )));
                let stop = cancel.child_token();
                session.set_packet_observer(Arc::new(ArrivalObserver {
                    recorder: Arc::clone(&recorder),
                    errors: Arc::clone(&errors),
                    stop: stop.clone(),
                }));
                let flow = session.open_send_flow(config.feedback_flow_id).await?;

                tokio::spawn(run_feedback_sender(FeedbackSender {
                    flow,
                    recorder,
                    interval: config.feedback_interval,
                    max_events_per_message: config.max_events_per_message,
                    errors: Arc::clone(&errors),
                    cancel: stop,
                }))
            }
        };

        info!(
            "transport started as {} (feedback flow {}, interval {:?})",
            config.role, config.feedback_flow_id, config.feedback_interval
        );

        Ok(Transport {
            config,
            session,
            rates,
            errors,
            cancel,
            tasks: vec![task],
        })
    }
}

/// Keeps the first error that terminated a loop.
#[derive(Default)]
struct FirstError(Mutex<Option<Error>>);

impl FirstError {
    fn record(&self, err: Error) {
        if let Ok(mut slot) = self.0.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    fn take(&self) -> Option<Error> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

struct RatePublisher {
    target_rate: AtomicU64,
    sinks: Mutex<Vec<Arc<dyn RateSink>>>,
}

impl RatePublisher {
    fn publish(&self, bps: u64) {
        let previous = self.target_rate.swap(bps, Ordering::Relaxed);
        if previous != bps {
            info!("target rate {previous} -> {bps} bps");
        }
        let sinks = match self.sinks.lock() {
            Ok(sinks) => sinks.clone(),
            Err(err) => {
                error!("rate sinks lock poisoned: {err}");
                return;
            }
        };
        for sink in sinks {
            sink.set_target_rate(bps);
        }
    }
}

struct LedgerObserver {
    ledger: Arc<Mutex<PacketLedger>>,
    last_rtt_us: Arc<AtomicU64>,
}

impl PacketObserver for LedgerObserver {
    fn on_packet_sent(&self, seq_nr: u64, departure: Duration, size_bits: u64) {
        match self.ledger.lock() {
            Ok(mut ledger) => ledger.on_sent(seq_nr, departure, size_bits),
            Err(err) => error!("ledger lock poisoned: {err}"),
        }
    }

    fn on_packet_lost(&self, seq_nr: u64) {
        match self.ledger.lock() {
            Ok(mut ledger) => ledger.on_lost(seq_nr),
            Err(err) => error!("ledger lock poisoned: {err}"),
        }
    }

    fn on_rtt_update(&self, rtt: Duration) {
        self.last_rtt_us
            .store(rtt.as_micros() as u64, Ordering::Relaxed);
    }
}

struct ArrivalObserver {
    recorder: Arc<Mutex<ArrivalRecorder>>,
    errors: Arc<FirstError>,
    stop: CancellationToken,
}

impl PacketObserver for ArrivalObserver {
    fn on_packet_received(&self, event: PacketEvent) {
        let result = self
            .recorder
            .lock()
            .map_err(Error::from)
            .and_then(|mut recorder| recorder.record(event));
        if let Err(err) = result {
            if !self.stop.is_cancelled() {
                error!("stopping feedback: {err}");
                self.errors.record(err);
                self.stop.cancel();
            }
        }
    }
}

struct FeedbackReceiver {
    flow: Box<dyn ReceiveFlow>,
    ledger: Arc<Mutex<PacketLedger>>,
    last_rtt_us: Arc<AtomicU64>,
    controller: Box<dyn CongestionController>,
    rates: Arc<RatePublisher>,
    errors: Arc<FirstError>,
    cancel: CancellationToken,
}

fn resolve(ledger: &Mutex<PacketLedger>, events: Vec<PacketEvent>) -> Result<Vec<PacketEvent>> {
    ledger.lock()?.resolve(events)
}

async fn run_feedback_receiver(mut rx: FeedbackReceiver) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let n = tokio::select! {
            _ = rx.cancel.cancelled() => break,
            n = rx.flow.read(&mut buf) => match n {
                Ok(n) => n,
                Err(Error::ErrFlowClosed) => break,
                Err(err) => {
                    error!("feedback flow read failed: {err}");
                    rx.errors.record(err);
                    break;
                }
            },
        };

        let batch = match unmarshal_bytes::<FeedbackBatch>(&buf[..n]) {
            Ok(batch) => batch,
            Err(err) => {
                error!("malformed feedback ({n} bytes): {err}");
                rx.errors.record(err);
                break;
            }
        };
        let events = match resolve(&rx.ledger, batch.events) {
            Ok(events) => events,
            Err(err) => {
                rx.errors.record(err);
                break;
            }
        };

        let rtt = Duration::from_micros(rx.last_rtt_us.load(Ordering::Relaxed));
        trace!("feedback: {} events, rtt {:?}", events.len(), rtt);
        let rate = rx.controller.on_acknowledgments(rtt, &events);
        rx.rates.publish(rate);
    }
    debug!("feedback receiver stopped");
}

struct FeedbackSender {
    flow: Box<dyn SendFlow>,
    recorder: Arc<Mutex<ArrivalRecorder>>,
    interval: Duration,
    max_events_per_message: usize,
    errors: Arc<FirstError>,
    cancel: CancellationToken,
}

fn drain(recorder: &Mutex<ArrivalRecorder>) -> Result<Vec<PacketEvent>> {
    Ok(recorder.lock()?.drain())
}

async fn run_feedback_sender(mut tx: FeedbackSender) {
    let mut ticker = tokio::time::interval(tx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'feedback: loop {
        tokio::select! {
            _ = tx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let messages = match drain(&tx.recorder)
            .and_then(|events| marshal_batches(events, tx.max_events_per_message))
        {
            Ok(messages) => messages,
            Err(err) => {
                error!("building feedback failed: {err}");
                tx.errors.record(err);
                break;
            }
        };
        for message in messages {
            match tx.flow.write(&message).await {
                Ok(_) => {}
                Err(Error::ErrFlowClosed) => break 'feedback,
                Err(err) => {
                    warn!("sending feedback failed: {err}");
                    tx.errors.record(err);
                    break 'feedback;
                }
            }
        }
    }
    debug!("feedback sender stopped");
}

/// Handle to a running transport.
pub struct Transport {
    config: TransportConfig,
    session: Arc<dyn Session>,
    rates: Arc<RatePublisher>,
    errors: Arc<FirstError>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn session(&self) -> Arc<dyn Session> {
        Arc::clone(&self.session)
    }

    /// Latest rate computed by the controller, zero for a feedback sender.
    pub fn target_rate(&self) -> u64 {
        self.rates.target_rate.load(Ordering::Relaxed)
    }

    /// Registers another consumer of rate updates and hands it the current
    /// rate.
    pub fn add_rate_sink(&self, sink: Arc<dyn RateSink>) -> Result<()> {
        let rate = self.target_rate();
        if rate > 0 {
            sink.set_target_rate(rate);
        }
        self.rates.sinks.lock()?.push(sink);
        Ok(())
    }

    pub async fn open_rtp_send_flow(&self, id: u64) -> Result<RtpSendFlow> {
        let flow = RtpSendFlow::new(self.session.open_send_flow(id).await?);
        Ok(if self.config.log_rtp_packets {
            flow.with_logger(RtpLogger::new(format!("rtp send flow {id}")))
        } else {
            flow
        })
    }

    pub async fn accept_rtp_receive_flow(&self, id: u64) -> Result<RtpReceiveFlow> {
        let flow = RtpReceiveFlow::new(
            self.session.accept_receive_flow(id).await?,
            self.cancel.child_token(),
        );
        Ok(if self.config.log_rtp_packets {
            flow.with_logger(RtpLogger::new(format!("rtp receive flow {id}")))
        } else {
            flow
        })
    }

    /// Stops every loop and returns the first error one of them ended with.
    pub async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!("transport task failed: {err}");
            }
        }
        match self.errors.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::AimdControllerBuilder;
    use crate::loopback::{LinkConditions, pair};
    use bytes::Bytes;
    use pipeline::{Attributes, Writer};
    use shared::marshal::Marshal;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<u64>>);

    impl RateSink for RecordingSink {
        fn set_target_rate(&self, bps: u64) {
            self.0.lock().unwrap().push(bps);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_feedback_loop_updates_rate() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        let (a, b) = pair(LinkConditions::default());
        let sink = Arc::new(RecordingSink::default());
        let mut controller = TransportBuilder::new()
            .with_role(Role::RateController)
            .with_controller(
                AimdControllerBuilder::new()
                    .with_initial_rate(300_000)
                    .with_additive_increase(10_000)
                    .build(),
            )
            .with_rate_sink(sink.clone())
            .build(Arc::new(a))
            .await?;
        let mut feedback = TransportBuilder::new()
            .with_role(Role::FeedbackSender)
            .build(Arc::new(b))
            .await?;
        assert_eq!(controller.target_rate(), 300_000);
        assert_eq!(feedback.target_rate(), 0);

        let mut media = controller.open_rtp_send_flow(0).await?;
        let mut rx = feedback.session().accept_receive_flow(0).await?;
        for i in 0..10u8 {
            media
                .write(Bytes::from(vec![i; 500]), Attributes::new())
                .await?;
        }
        let mut buf = [0u8; 1024];
        for _ in 0..10 {
            rx.read(&mut buf).await?;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(controller.target_rate() > 300_000);
        let seen = sink.0.lock().unwrap().clone();
        assert_eq!(seen[0], 300_000);
        assert_eq!(seen.last().copied(), Some(controller.target_rate()));

        controller.close().await?;
        feedback.close().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_unknown_feedback_is_fatal() -> Result<()> {
        let (a, b) = pair(LinkConditions::default());
        let mut controller = TransportBuilder::new().build(Arc::new(a)).await?;

        // feedback for a packet the controller never sent
        let mut flow = b.open_send_flow(DEFAULT_FEEDBACK_FLOW_ID).await?;
        let bogus = FeedbackBatch::new(vec![PacketEvent::received(
            1234,
            Duration::from_secs(1),
            Duration::from_secs(2),
            8,
        )]);
        flow.write(&bogus.marshal()?).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            controller.close().await,
            Err(Error::ErrUnknownPendingPacket(1234))
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_malformed_feedback_ends_loop() -> Result<()> {
        let (a, b) = pair(LinkConditions::default());
        let mut controller = TransportBuilder::new().build(Arc::new(a)).await?;

        let mut flow = b.open_send_flow(DEFAULT_FEEDBACK_FLOW_ID).await?;
        flow.write(&[0x05, 0x01]).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            controller.close().await,
            Err(Error::ErrFeedbackCountExceedsInput {
                count: 5,
                remaining: 1
            })
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_arrival_overflow_is_fatal() -> Result<()> {
        let (a, b) = pair(LinkConditions::default());
        let mut feedback = TransportBuilder::new()
            .with_role(Role::FeedbackSender)
            .with_arrival_queue_capacity(4)
            .with_feedback_interval(Duration::from_secs(10))
            .build(Arc::new(b))
            .await?;

        let mut flow = a.open_send_flow(1).await?;
        for _ in 0..8 {
            flow.write(&[0u8; 10]).await?;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(feedback.close().await, Err(Error::ErrQueueOverflow));
        Ok(())
    }
}
