//! Sans-IO frame reassembly on top of the jitter buffer.
//!
//! Packets go in through `handle_read`, complete frames come out of
//! `poll_read`. Playout starts once the jitter buffer holds its start count
//! or one reorder timeout after the first packet, so a stream whose first
//! packets arrive out of order still starts at its lowest sequence number.
//! When the next expected packet is missing the reassembler arms a deadline
//! (`poll_timeout`); once it passes, the frame in progress is given up and
//! the playout head jumps to the oldest buffered packet.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use rtp::Packet;
use rtp::jitter_buffer::{self, JitterBuffer};
use rtp::packetizer::Depacketizer;
use rtp::sequence::TimestampUnwrapper;
use shared::error::{Error, Result};

use crate::attributes::{Attributes, Frame};

pub const DEFAULT_REORDER_TIMEOUT: Duration = Duration::from_millis(10);

/// A packet and the time it was received.
#[derive(Debug, Clone)]
pub struct TimedPacket {
    pub now: Instant,
    pub packet: Packet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// Waiting for the first packet of a frame.
    Buffering,
    /// Accumulating the payload of a frame.
    InFrame,
    /// Discarding the rest of a frame that lost packets.
    DroppingFrame,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub frames_emitted: u64,
    pub frames_dropped: u64,
    pub packets_discarded: u64,
}

pub struct Reassembler {
    jitter_buffer: JitterBuffer,
    depacketizer: Box<dyn Depacketizer + Send>,
    frame: BytesMut,
    frame_timestamp: u32,
    state: ReassemblyState,
    start_deadline: Option<Instant>,
    gap_deadline: Option<Instant>,
    timeout: Duration,
    clock_rate: u32,
    timestamps: TimestampUnwrapper,
    frames: VecDeque<Frame>,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(
        depacketizer: Box<dyn Depacketizer + Send>,
        clock_rate: u32,
        timeout: Duration,
        capacity: usize,
        min_start_count: usize,
    ) -> Self {
        Self {
            jitter_buffer: JitterBuffer::new(capacity, min_start_count),
            depacketizer,
            frame: BytesMut::new(),
            frame_timestamp: 0,
            state: ReassemblyState::Buffering,
            start_deadline: None,
            gap_deadline: None,
            timeout,
            clock_rate: clock_rate.max(1),
            timestamps: TimestampUnwrapper::new(),
            frames: VecDeque::new(),
            stats: ReassemblyStats::default(),
        }
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    pub fn jitter_buffer(&self) -> &JitterBuffer {
        &self.jitter_buffer
    }

    /// Buffers a packet without running reassembly. Used to queue a burst of
    /// packets before a single `handle_timeout`.
    pub fn push(&mut self, packet: Packet) -> bool {
        self.jitter_buffer.push(packet)
    }

    fn process(&mut self, now: Instant) {
        loop {
            if self.jitter_buffer.state() == jitter_buffer::State::Buffering {
                if self.jitter_buffer.is_empty() {
                    return;
                }
                let deadline = *self.start_deadline.get_or_insert(now + self.timeout);
                if now < deadline {
                    return;
                }
                self.jitter_buffer.start();
            }
            self.start_deadline = None;

            match self.jitter_buffer.peek(true) {
                Ok(_) => {}
                Err(Error::ErrNotFound) => {
                    let deadline = *self.gap_deadline.get_or_insert(now + self.timeout);
                    if now < deadline {
                        return;
                    }
                    self.gap_deadline = None;
                    let skipped = self.jitter_buffer.skip();
                    if self.state != ReassemblyState::DroppingFrame {
                        self.stats.frames_dropped += 1;
                        debug!(
                            "reorder timeout: dropping frame, skipped {} packets to {:?}",
                            skipped,
                            self.jitter_buffer.playout_head()
                        );
                    }
                    self.frame.clear();
                    self.state = ReassemblyState::DroppingFrame;
                    continue;
                }
                Err(_) => {
                    self.gap_deadline = None;
                    return;
                }
            }

            let packet = match self.jitter_buffer.pop() {
                Ok(packet) => packet,
                Err(err) => {
                    trace!("jitter buffer pop failed: {err}");
                    return;
                }
            };
            self.gap_deadline = None;
            self.consume(packet);
        }
    }

    fn consume(&mut self, packet: Packet) {
        if self.depacketizer.is_partition_head(&packet.payload) {
            if self.state == ReassemblyState::InFrame {
                self.stats.frames_dropped += 1;
                debug!(
                    "frame at timestamp {} never completed, restarting at {}",
                    self.frame_timestamp, packet.header.sequence_number
                );
            }
            self.frame.clear();
            self.frame_timestamp = packet.header.timestamp;
            self.state = ReassemblyState::InFrame;
        }

        if self.state != ReassemblyState::InFrame {
            self.stats.packets_discarded += 1;
            trace!(
                "discarding packet {} in {:?}",
                packet.header.sequence_number, self.state
            );
            return;
        }

        match self.depacketizer.depacketize(&packet.payload) {
            Ok(payload) => self.frame.extend_from_slice(&payload),
            Err(err) => {
                warn!(
                    "failed to depacketize packet {}: {}",
                    packet.header.sequence_number, err
                );
                self.stats.frames_dropped += 1;
                self.frame.clear();
                self.state = ReassemblyState::DroppingFrame;
                return;
            }
        }

        if self
            .depacketizer
            .is_partition_tail(packet.header.marker, &packet.payload)
        {
            self.emit();
        }
    }

    fn emit(&mut self) {
        let payload: Bytes = self.frame.split().freeze();
        let unwrapped = self.timestamps.unwrap(self.frame_timestamp);
        let pts = (unwrapped as i128 * 1_000_000 / self.clock_rate as i128) as i64;

        let mut attributes = Attributes::new();
        attributes.set_pts(pts);
        attributes.set_rtp_timestamp(self.frame_timestamp);

        trace!(
            "frame complete: {} bytes, rtp timestamp {} pts {}",
            payload.len(),
            self.frame_timestamp,
            pts
        );
        self.stats.frames_emitted += 1;
        self.frames.push_back(Frame::new(payload, attributes));
        self.state = ReassemblyState::Buffering;
    }
}

impl sansio::Protocol<TimedPacket, (), ()> for Reassembler {
    type Rout = Frame;
    type Wout = ();
    type Eout = ();
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TimedPacket) -> Result<()> {
        self.push(msg.packet);
        self.process(msg.now);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.frames.pop_front()
    }

    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        None
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        None
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.process(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        match (self.start_deadline, self.gap_deadline) {
            (Some(start), Some(gap)) => Some(start.min(gap)),
            (start, gap) => start.or(gap),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.jitter_buffer.clear();
        self.frame.clear();
        self.frames.clear();
        self.start_deadline = None;
        self.gap_deadline = None;
        self.state = ReassemblyState::Buffering;
        Ok(())
    }
}
