//! Reordering buffer keyed by unwrapped RTP sequence number.
//!
//! The buffer holds packets until the consumer pops them in sequence order.
//! The playout head is the next sequence number the consumer expects. Playout
//! starts once `min_start_count` packets are buffered or the owner calls
//! [`JitterBuffer::start`]. Until the first pop the head tracks the lowest
//! sequence number seen; after that it only moves forward, and packets that
//! arrive behind it are dropped.

use std::collections::BTreeMap;

use log::{debug, trace, warn};
use shared::error::{Error, Result};

use crate::packet::Packet;
use crate::sequence::SequenceUnwrapper;

/// Default number of packets held before the oldest ones are evicted.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default number of packets collected before the first pop succeeds.
pub const DEFAULT_MIN_START_COUNT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not enough packets seen to start playout.
    Buffering,
    /// Packets may be popped.
    Emitting,
}

/// Counters kept for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub received: u64,
    pub duplicates: u64,
    pub late: u64,
    pub overflow: u64,
    pub underflow: u64,
    pub skipped: u64,
}

#[derive(Debug)]
pub struct JitterBuffer {
    packets: BTreeMap<i64, Packet>,
    unwrapper: SequenceUnwrapper,
    playout_head: Option<i64>,
    head_moved: bool,
    state: State,
    capacity: usize,
    min_start_count: usize,
    stats: Stats,
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MIN_START_COUNT)
    }
}

impl JitterBuffer {
    pub fn new(capacity: usize, min_start_count: usize) -> Self {
        Self {
            packets: BTreeMap::new(),
            unwrapper: SequenceUnwrapper::new(),
            playout_head: None,
            head_moved: false,
            state: State::Buffering,
            capacity: capacity.max(1),
            min_start_count: min_start_count.max(1),
            stats: Stats::default(),
        }
    }

    /// Inserts a packet. Returns false when the packet was dropped as late or
    /// duplicate.
    pub fn push(&mut self, packet: Packet) -> bool {
        let seq = self.unwrapper.unwrap(packet.header.sequence_number);
        self.stats.received += 1;

        match self.playout_head {
            None => self.playout_head = Some(seq),
            // until the head first moves it follows the lowest sequence number seen
            Some(head) if seq < head && !self.head_moved => self.playout_head = Some(seq),
            Some(head) if seq < head => {
                self.stats.late += 1;
                trace!(
                    "dropping late packet {} behind playout head {}",
                    packet.header.sequence_number, head as u16
                );
                return false;
            }
            _ => {}
        }

        if self.packets.contains_key(&seq) {
            self.stats.duplicates += 1;
            trace!("dropping duplicate packet {}", packet.header.sequence_number);
            return false;
        }
        self.packets.insert(seq, packet);

        if self.packets.len() > self.capacity {
            if let Some((oldest, _)) = self.packets.pop_first() {
                self.stats.overflow += 1;
                warn!(
                    "jitter buffer over capacity {}, evicted packet {}",
                    self.capacity, oldest as u16
                );
            }
        }

        if self.state == State::Buffering && self.packets.len() >= self.min_start_count {
            debug!(
                "jitter buffer emitting from sequence number {:?}",
                self.playout_head()
            );
            self.state = State::Emitting;
        }

        true
    }

    /// Starts playout before `min_start_count` packets were collected, such as
    /// when the start window timed out.
    pub fn start(&mut self) {
        if self.state == State::Buffering {
            debug!(
                "jitter buffer started with {} packets from sequence number {:?}",
                self.packets.len(),
                self.playout_head()
            );
            self.state = State::Emitting;
        }
    }

    /// Returns the packet at the playout head, or the newest packet when
    /// `playout_head` is false.
    pub fn peek(&self, playout_head: bool) -> Result<&Packet> {
        if self.packets.is_empty() {
            return Err(Error::ErrBufferUnderrun);
        }

        if playout_head {
            self.playout_head
                .and_then(|head| self.packets.get(&head))
                .ok_or(Error::ErrNotFound)
        } else {
            self.packets
                .last_key_value()
                .map(|(_, packet)| packet)
                .ok_or(Error::ErrBufferUnderrun)
        }
    }

    /// Removes and returns the packet at the playout head, advancing the head.
    pub fn pop(&mut self) -> Result<Packet> {
        if self.state != State::Emitting {
            return Err(Error::ErrPopWhileBuffering);
        }

        let head = self.playout_head.ok_or(Error::ErrBufferUnderrun)?;
        match self.packets.remove(&head) {
            Some(packet) => {
                self.playout_head = Some(head + 1);
                self.head_moved = true;
                Ok(packet)
            }
            None => {
                self.stats.underflow += 1;
                Err(Error::ErrNotFound)
            }
        }
    }

    /// Moves the playout head past a gap to the oldest buffered packet and
    /// returns how many sequence numbers were given up. With nothing buffered
    /// the head advances by one.
    pub fn skip(&mut self) -> u64 {
        let Some(head) = self.playout_head else {
            return 0;
        };

        let next = match self.packets.first_key_value() {
            Some((&oldest, _)) if oldest > head => oldest,
            Some(_) => return 0,
            None => head + 1,
        };
        let skipped = (next - head) as u64;
        self.playout_head = Some(next);
        self.head_moved = true;
        self.stats.skipped += skipped;
        skipped
    }

    /// Moves the playout head forward to `seq`, dropping anything behind it.
    /// Requests that would move the head backwards are ignored.
    pub fn set_playout_head(&mut self, seq: u16) {
        let Some(head) = self.playout_head else {
            self.playout_head = Some(self.unwrapper.unwrap(seq));
            return;
        };

        let diff = seq.wrapping_sub(head as u16);
        if diff >= 0x8000 {
            return;
        }
        let target = head + diff as i64;
        self.packets = self.packets.split_off(&target);
        self.stats.skipped += diff as u64;
        self.playout_head = Some(target);
        self.head_moved = true;
    }

    /// Sequence number of the next packet expected by the consumer.
    pub fn playout_head(&self) -> Option<u16> {
        self.playout_head.map(|head| head as u16)
    }

    /// Drops every buffered packet, keeping the playout head.
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use bytes::Bytes;

    fn make_packet(seq: u16) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number: seq,
                ..Default::default()
            },
            payload: Bytes::from(vec![seq as u8]),
        }
    }

    fn emitting() -> JitterBuffer {
        JitterBuffer::new(DEFAULT_CAPACITY, 1)
    }

    fn pop_seq(jb: &mut JitterBuffer) -> Result<u16> {
        jb.pop().map(|p| p.header.sequence_number)
    }

    #[test]
    fn test_jitter_buffer_reorders() -> Result<()> {
        let mut jb = emitting();
        assert!(jb.push(make_packet(5000)));
        assert!(jb.push(make_packet(5002)));
        assert!(jb.push(make_packet(5001)));

        assert_eq!(pop_seq(&mut jb)?, 5000);
        assert_eq!(pop_seq(&mut jb)?, 5001);
        assert_eq!(pop_seq(&mut jb)?, 5002);
        assert_eq!(jb.peek(true).err(), Some(Error::ErrBufferUnderrun));

        Ok(())
    }

    #[test]
    fn test_jitter_buffer_wraps() -> Result<()> {
        let mut jb = emitting();
        for seq in [65534u16, 0, 65535, 1] {
            jb.push(make_packet(seq));
        }

        assert_eq!(pop_seq(&mut jb)?, 65534);
        assert_eq!(pop_seq(&mut jb)?, 65535);
        assert_eq!(pop_seq(&mut jb)?, 0);
        assert_eq!(pop_seq(&mut jb)?, 1);

        Ok(())
    }

    #[test]
    fn test_jitter_buffer_drops_late_and_duplicate() -> Result<()> {
        let mut jb = emitting();
        jb.push(make_packet(10));
        jb.push(make_packet(11));
        assert_eq!(pop_seq(&mut jb)?, 10);

        assert!(!jb.push(make_packet(10)), "behind the playout head");
        assert!(!jb.push(make_packet(11)), "duplicate");

        let stats = jb.stats();
        assert_eq!(stats.late, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.received, 4);

        Ok(())
    }

    #[test]
    fn test_jitter_buffer_gap_and_skip() -> Result<()> {
        let mut jb = emitting();
        jb.push(make_packet(100));
        jb.push(make_packet(103));
        jb.push(make_packet(104));

        assert_eq!(pop_seq(&mut jb)?, 100);
        assert_eq!(jb.pop().err(), Some(Error::ErrNotFound));
        assert_eq!(jb.peek(true).err(), Some(Error::ErrNotFound));
        assert_eq!(jb.peek(false)?.header.sequence_number, 104);

        assert_eq!(jb.skip(), 2);
        assert_eq!(jb.playout_head(), Some(103));
        assert_eq!(pop_seq(&mut jb)?, 103);
        assert_eq!(jb.stats().skipped, 2);

        Ok(())
    }

    #[test]
    fn test_jitter_buffer_min_start_count() -> Result<()> {
        let mut jb = JitterBuffer::new(DEFAULT_CAPACITY, 3);
        jb.push(make_packet(7));
        jb.push(make_packet(6));
        assert_eq!(jb.state(), State::Buffering);
        assert_eq!(jb.pop().err(), Some(Error::ErrPopWhileBuffering));

        jb.push(make_packet(8));
        assert_eq!(jb.state(), State::Emitting);
        // the head moved back to the lowest packet seen while buffering
        assert_eq!(pop_seq(&mut jb)?, 6);

        Ok(())
    }

    #[test]
    fn test_jitter_buffer_reordered_start() -> Result<()> {
        let mut jb = emitting();
        jb.push(make_packet(42));
        assert!(jb.push(make_packet(40)));
        assert!(jb.push(make_packet(41)));

        assert_eq!(pop_seq(&mut jb)?, 40);
        assert!(!jb.push(make_packet(39)), "late once playout started");

        Ok(())
    }

    #[test]
    fn test_jitter_buffer_start_window_absorbs_reordering() -> Result<()> {
        let mut jb = JitterBuffer::default();
        jb.push(make_packet(301));
        assert_eq!(jb.pop().err(), Some(Error::ErrPopWhileBuffering));

        // the first packet of the stream shows up second
        assert!(jb.push(make_packet(300)));
        jb.push(make_packet(302));
        jb.start();
        assert_eq!(jb.state(), State::Emitting);

        assert_eq!(pop_seq(&mut jb)?, 300);
        assert_eq!(pop_seq(&mut jb)?, 301);
        assert_eq!(pop_seq(&mut jb)?, 302);
        assert_eq!(jb.stats().late, 0);

        Ok(())
    }

    #[test]
    fn test_jitter_buffer_starts_at_min_start_count() {
        let mut jb = JitterBuffer::default();
        for seq in 0..DEFAULT_MIN_START_COUNT as u16 - 1 {
            jb.push(make_packet(seq));
        }
        assert_eq!(jb.state(), State::Buffering);
        jb.push(make_packet(1000));
        assert_eq!(jb.state(), State::Emitting);
    }

    #[test]
    fn test_jitter_buffer_capacity_evicts_oldest() {
        let mut jb = JitterBuffer::new(2, 1);
        jb.push(make_packet(1));
        jb.push(make_packet(2));
        jb.push(make_packet(3));

        assert_eq!(jb.len(), 2);
        assert_eq!(jb.stats().overflow, 1);
        assert_eq!(jb.peek(true).err(), Some(Error::ErrNotFound));
    }

    #[test]
    fn test_jitter_buffer_set_playout_head_forward_only() -> Result<()> {
        let mut jb = emitting();
        for seq in 20..25u16 {
            jb.push(make_packet(seq));
        }

        jb.set_playout_head(23);
        assert_eq!(jb.len(), 2);
        jb.set_playout_head(21);
        assert_eq!(jb.playout_head(), Some(23));
        assert_eq!(pop_seq(&mut jb)?, 23);

        Ok(())
    }
}
