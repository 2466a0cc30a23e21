//! Bookkeeping that turns raw network observations into feedback events.
//!
//! The sending side keeps a [`PacketLedger`] of packets in flight and
//! resolves each feedback batch against it. The receiving side keeps an
//! [`ArrivalRecorder`] that the feedback loop drains every interval.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::{error, trace, warn};
use shared::error::{Error, Result};

use crate::events::PacketEvent;

pub const DEFAULT_ARRIVAL_QUEUE_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingPacket {
    departure: Duration,
    size_bits: u64,
}

/// Packets sent but not yet acknowledged or declared lost, keyed by the
/// network layer's sequence number.
#[derive(Debug, Default)]
pub struct PacketLedger {
    pending: HashMap<u64, PendingPacket>,
    losses: Vec<PacketEvent>,
}

impl PacketLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sent(&mut self, seq_nr: u64, departure: Duration, size_bits: u64) {
        trace!("ledger: sent #{seq_nr} ({size_bits} bit)");
        self.pending.insert(
            seq_nr,
            PendingPacket {
                departure,
                size_bits,
            },
        );
    }

    /// Promotes a pending packet to a loss event, reported with the next
    /// resolved batch.
    pub fn on_lost(&mut self, seq_nr: u64) {
        match self.pending.remove(&seq_nr) {
            Some(p) => self
                .losses
                .push(PacketEvent::lost(seq_nr, p.departure, p.size_bits)),
            None => warn!("ledger: loss reported for unknown packet #{seq_nr}"),
        }
    }

    /// Completes acknowledged events with their departure time and size,
    /// then appends every loss seen since the previous call.
    ///
    /// An acknowledgment for a packet the ledger never saw is an invariant
    /// violation and fails the whole batch with
    /// [`Error::ErrUnknownPendingPacket`].
    pub fn resolve(&mut self, mut events: Vec<PacketEvent>) -> Result<Vec<PacketEvent>> {
        for event in events.iter_mut() {
            let Some(p) = self.pending.remove(&event.seq_nr) else {
                error!("ledger: feedback for unknown packet #{}", event.seq_nr);
                return Err(Error::ErrUnknownPendingPacket(event.seq_nr));
            };
            event.departure = p.departure;
            event.size_bits = p.size_bits;
        }

        events.append(&mut self.losses);
        Ok(events)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn losses_len(&self) -> usize {
        self.losses.len()
    }
}

/// Bounded queue of arrivals waiting for the next feedback message.
#[derive(Debug)]
pub struct ArrivalRecorder {
    queue: VecDeque<PacketEvent>,
    capacity: usize,
}

impl Default for ArrivalRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_ARRIVAL_QUEUE_CAPACITY)
    }
}

impl ArrivalRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, event: PacketEvent) -> Result<()> {
        if self.queue.len() >= self.capacity {
            error!(
                "arrival queue full ({} events), feedback is not draining",
                self.capacity
            );
            return Err(Error::ErrQueueOverflow);
        }
        self.queue.push_back(event);
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<PacketEvent> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_ledger_resolves_and_merges_losses() -> Result<()> {
        let mut ledger = PacketLedger::new();
        for seq in 0..5 {
            ledger.on_sent(seq, ms(1000 + seq), 8000 + seq);
        }
        ledger.on_lost(2);
        ledger.on_lost(99);
        assert_eq!(ledger.pending_len(), 4);
        assert_eq!(ledger.losses_len(), 1);

        // the receiver does not know departure or size
        let acks = vec![
            PacketEvent::received(1, Duration::ZERO, ms(1030), 0),
            PacketEvent::received(0, Duration::ZERO, ms(1020), 0),
        ];
        let events = ledger.resolve(acks)?;

        assert_eq!(
            events,
            vec![
                PacketEvent::received(1, ms(1001), ms(1030), 8001),
                PacketEvent::received(0, ms(1000), ms(1020), 8000),
                PacketEvent::lost(2, ms(1002), 8002),
            ]
        );
        assert_eq!(ledger.pending_len(), 2);
        assert_eq!(ledger.losses_len(), 0);

        // losses are reported once
        let events = ledger.resolve(vec![PacketEvent::received(3, ms(0), ms(1040), 0)])?;
        assert_eq!(events.len(), 1);

        Ok(())
    }

    #[test]
    fn test_ledger_unknown_packet_is_fatal() {
        let mut ledger = PacketLedger::new();
        ledger.on_sent(1, ms(1), 100);

        let err = ledger
            .resolve(vec![
                PacketEvent::received(1, ms(1), ms(2), 100),
                PacketEvent::received(7, ms(1), ms(2), 100),
            ])
            .unwrap_err();
        assert_eq!(err, Error::ErrUnknownPendingPacket(7));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ledger_acknowledged_twice() -> Result<()> {
        let mut ledger = PacketLedger::new();
        ledger.on_sent(5, ms(1), 100);
        ledger.resolve(vec![PacketEvent::received(5, ms(1), ms(2), 100)])?;
        assert_eq!(
            ledger.resolve(vec![PacketEvent::received(5, ms(1), ms(2), 100)]),
            Err(Error::ErrUnknownPendingPacket(5))
        );
        Ok(())
    }

    #[test]
    fn test_arrival_recorder_overflow() -> Result<()> {
        let mut recorder = ArrivalRecorder::new(2);
        recorder.record(PacketEvent::received(1, ms(1), ms(2), 8))?;
        recorder.record(PacketEvent::received(2, ms(1), ms(2), 8))?;
        assert_eq!(
            recorder.record(PacketEvent::received(3, ms(1), ms(2), 8)),
            Err(Error::ErrQueueOverflow)
        );

        let drained = recorder.drain();
        assert_eq!(drained.len(), 2);
        assert!(recorder.is_empty());
        recorder.record(PacketEvent::received(3, ms(1), ms(2), 8))?;
        assert_eq!(recorder.len(), 1);

        Ok(())
    }
}
