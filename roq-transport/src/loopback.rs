//! In-process session pair connected by a simulated link.
//!
//! Every datagram gets a connection-wide sequence number, is held back for
//! the configured one-way delay, and is then either delivered to the peer's
//! flow or, every `drop_every`-th datagram, declared lost to the sender. The
//! sender's observer sees an RTT of twice the delay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use shared::time::SystemInstant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::PacketEvent;
use crate::flow::{PacketObserver, ReceiveFlow, SendFlow, Session};

pub const DEFAULT_LINK_CAPACITY: usize = 4096;
pub const DEFAULT_FLOW_QUEUE_SIZE: usize = 1024;

/// Properties of both directions of a loopback link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConditions {
    pub delay: Duration,
    /// Drops every n-th datagram of a direction when set.
    pub drop_every: Option<u64>,
    /// Datagrams in flight before the link starts dropping.
    pub capacity: usize,
    /// Undelivered datagrams buffered per receive flow.
    pub flow_queue_size: usize,
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(10),
            drop_every: None,
            capacity: DEFAULT_LINK_CAPACITY,
            flow_queue_size: DEFAULT_FLOW_QUEUE_SIZE,
        }
    }
}

impl LinkConditions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_drop_every(mut self, n: u64) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_flow_queue_size(mut self, size: usize) -> Self {
        self.flow_queue_size = size;
        self
    }
}

#[derive(Default)]
struct Flows {
    slots: HashMap<u64, FlowSlot>,
    closed: bool,
}

struct FlowSlot {
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

/// Routes inbound datagrams to receive flows by flow id.
///
/// Datagrams for a flow nobody accepted yet are buffered until it is
/// accepted or the queue fills up.
pub struct FlowRegistry {
    flows: Mutex<Flows>,
    queue_size: usize,
}

impl FlowRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            flows: Mutex::new(Flows::default()),
            queue_size: queue_size.max(1),
        }
    }

    fn new_slot(&self) -> FlowSlot {
        let (tx, rx) = mpsc::channel(self.queue_size);
        FlowSlot { tx, rx: Some(rx) }
    }

    /// Hands `payload` to flow `id`. Returns false when it was dropped.
    pub fn deliver(&self, id: u64, payload: Bytes) -> Result<bool> {
        let mut flows = self.flows.lock()?;
        if flows.closed {
            return Ok(false);
        }
        let slot = flows.slots.entry(id).or_insert_with(|| self.new_slot());
        match slot.tx.try_send(payload) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                warn!("flow {id}: receive queue full, dropping datagram");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                debug!("flow {id}: receiver gone, dropping datagram");
                Ok(false)
            }
        }
    }

    pub fn accept(&self, id: u64) -> Result<mpsc::Receiver<Bytes>> {
        let mut flows = self.flows.lock()?;
        if flows.closed {
            return Err(Error::ErrFlowClosed);
        }
        flows
            .slots
            .entry(id)
            .or_insert_with(|| self.new_slot())
            .rx
            .take()
            .ok_or(Error::ErrFlowAlreadyOpen(id))
    }

    /// Drops every flow; pending reads fail with `ErrFlowClosed`.
    pub fn close(&self) -> Result<()> {
        let mut flows = self.flows.lock()?;
        flows.closed = true;
        flows.slots.clear();
        Ok(())
    }
}

struct Endpoint {
    registry: FlowRegistry,
    observer: RwLock<Option<Arc<dyn PacketObserver>>>,
}

impl Endpoint {
    fn observer(&self) -> Option<Arc<dyn PacketObserver>> {
        self.observer.read().ok().and_then(|o| o.clone())
    }
}

struct Datagram {
    flow_id: u64,
    seq_nr: u64,
    payload: Bytes,
    sent_at: Instant,
    departure: Duration,
}

/// One end of a loopback connection.
pub struct LoopbackSession {
    local: Arc<Endpoint>,
    link: mpsc::Sender<Datagram>,
    next_seq: Arc<AtomicU64>,
    send_flows: Mutex<HashSet<u64>>,
    clock: SystemInstant,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Creates two connected sessions. Must be called from a tokio runtime.
pub fn pair(conditions: LinkConditions) -> (LoopbackSession, LoopbackSession) {
    let clock = SystemInstant::at(Instant::now().into_std());
    let cancel = CancellationToken::new();
    let a = Arc::new(Endpoint {
        registry: FlowRegistry::new(conditions.flow_queue_size),
        observer: RwLock::new(None),
    });
    let b = Arc::new(Endpoint {
        registry: FlowRegistry::new(conditions.flow_queue_size),
        observer: RwLock::new(None),
    });

    let (a_tx, a_rx) = mpsc::channel(conditions.capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(conditions.capacity.max(1));
    let a_to_b = tokio::spawn(run_link(
        a_rx,
        conditions,
        Arc::clone(&a),
        Arc::clone(&b),
        clock,
        cancel.clone(),
    ));
    let b_to_a = tokio::spawn(run_link(
        b_rx,
        conditions,
        Arc::clone(&b),
        Arc::clone(&a),
        clock,
        cancel.clone(),
    ));

    let session = |local: Arc<Endpoint>, link: mpsc::Sender<Datagram>, task: JoinHandle<()>| {
        LoopbackSession {
            local,
            link,
            next_seq: Arc::new(AtomicU64::new(0)),
            send_flows: Mutex::new(HashSet::new()),
            clock,
            cancel: cancel.clone(),
            task: Mutex::new(Some(task)),
        }
    };
    (session(a, a_tx, a_to_b), session(b, b_tx, b_to_a))
}

async fn run_link(
    mut rx: mpsc::Receiver<Datagram>,
    conditions: LinkConditions,
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    clock: SystemInstant,
    cancel: CancellationToken,
) {
    let mut count = 0u64;
    loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            datagram = rx.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(datagram.sent_at + conditions.delay) => {}
        }

        count += 1;
        let size_bits = datagram.payload.len() as u64 * 8;
        if conditions.drop_every.is_some_and(|n| count % n == 0) {
            trace!("link: dropping #{}", datagram.seq_nr);
            if let Some(observer) = local.observer() {
                observer.on_packet_lost(datagram.seq_nr);
            }
            continue;
        }

        let arrival = clock.unix(Instant::now().into_std());
        if let Some(observer) = remote.observer() {
            observer.on_packet_received(PacketEvent::received(
                datagram.seq_nr,
                datagram.departure,
                arrival,
                size_bits,
            ));
        }
        if let Some(observer) = local.observer() {
            observer.on_rtt_update(conditions.delay * 2);
        }
        if let Err(err) = remote.registry.deliver(datagram.flow_id, datagram.payload) {
            warn!("link: delivery failed: {err}");
        }
    }

    if let Err(err) = remote.registry.close() {
        warn!("link: closing flows failed: {err}");
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Session for LoopbackSession {
    async fn open_send_flow(&self, id: u64) -> Result<Box<dyn SendFlow>> {
        if self.cancel.is_cancelled() {
            return Err(Error::ErrFlowClosed);
        }
        if !self.send_flows.lock()?.insert(id) {
            return Err(Error::ErrFlowAlreadyOpen(id));
        }
        Ok(Box::new(LoopbackSendFlow {
            id,
            link: self.link.clone(),
            local: Arc::clone(&self.local),
            next_seq: Arc::clone(&self.next_seq),
            clock: self.clock,
            cancel: self.cancel.clone(),
        }))
    }

    async fn accept_receive_flow(&self, id: u64) -> Result<Box<dyn ReceiveFlow>> {
        let rx = self.local.registry.accept(id)?;
        Ok(Box::new(LoopbackReceiveFlow {
            id,
            rx,
            cancel: self.cancel.clone(),
        }))
    }

    fn set_packet_observer(&self, observer: Arc<dyn PacketObserver>) {
        match self.local.observer.write() {
            Ok(mut slot) => *slot = Some(observer),
            Err(err) => warn!("loopback: observer lock poisoned: {err}"),
        }
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.local.registry.close()?;
        let task = self.task.lock()?.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                return Err(Error::Other(format!("loopback link task failed: {err}")));
            }
        }
        Ok(())
    }
}

struct LoopbackSendFlow {
    id: u64,
    link: mpsc::Sender<Datagram>,
    local: Arc<Endpoint>,
    next_seq: Arc<AtomicU64>,
    clock: SystemInstant,
    cancel: CancellationToken,
}

#[async_trait]
impl SendFlow for LoopbackSendFlow {
    fn id(&self) -> u64 {
        self.id
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Error::ErrFlowClosed);
        }
        let seq_nr = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let sent_at = Instant::now();
        let departure = self.clock.unix(sent_at.into_std());
        let observer = self.local.observer();
        if let Some(observer) = &observer {
            observer.on_packet_sent(seq_nr, departure, buf.len() as u64 * 8);
        }

        let datagram = Datagram {
            flow_id: self.id,
            seq_nr,
            payload: Bytes::copy_from_slice(buf),
            sent_at,
            departure,
        };
        match self.link.try_send(datagram) {
            Ok(()) => Ok(buf.len()),
            Err(TrySendError::Full(datagram)) => {
                debug!("link full, dropping #{}", datagram.seq_nr);
                if let Some(observer) = &observer {
                    observer.on_packet_lost(datagram.seq_nr);
                }
                Ok(buf.len())
            }
            Err(TrySendError::Closed(_)) => Err(Error::ErrFlowClosed),
        }
    }
}

struct LoopbackReceiveFlow {
    id: u64,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

#[async_trait]
impl ReceiveFlow for LoopbackReceiveFlow {
    fn id(&self) -> u64 {
        self.id
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let payload = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::ErrFlowClosed),
            payload = self.rx.recv() => payload.ok_or(Error::ErrFlowClosed)?,
        };
        if payload.len() > buf.len() {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[..payload.len()].copy_from_slice(&payload);
        Ok(payload.len())
    }
}
