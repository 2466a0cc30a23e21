use std::fmt;

use bytes::Bytes;
use shared::error::{Error, Result};

use crate::header::{FIXED_HEADER_LENGTH, Header};
use crate::packet::Packet;
use crate::sequence::Sequencer;

/// Payloader payloads a byte array for use as rtp.Packet payloads
pub trait Payloader: fmt::Debug {
    fn payload(&mut self, mtu: usize, b: &Bytes) -> Result<Vec<Bytes>>;
}

/// Depacketizer depacketizes a RTP payload, removing any RTP specific data from the payload
pub trait Depacketizer {
    fn depacketize(&mut self, b: &Bytes) -> Result<Bytes>;

    /// Checks if the packet is at the beginning of a frame.
    fn is_partition_head(&self, payload: &Bytes) -> bool;

    /// Checks if the packet is at the end of a frame.
    fn is_partition_tail(&self, marker: bool, payload: &Bytes) -> bool;
}

/// Packetizer packetizes a payload
pub trait Packetizer: fmt::Debug {
    /// Packetizes at the current timestamp, then advances it by `samples`.
    fn packetize(&mut self, payload: &Bytes, samples: u32) -> Result<Vec<Packet>>;
    /// Packetizes with an explicit RTP timestamp and leaves the running
    /// timestamp pointing at it.
    fn packetize_at(&mut self, payload: &Bytes, timestamp: u32) -> Result<Vec<Packet>>;
    fn skip_samples(&mut self, skipped_samples: u32);
    fn timestamp(&self) -> u32;
    fn roll_over_count(&self) -> u64;
}

/// NewPacketizer returns a new instance of a Packetizer for a specific payloader
pub fn new_packetizer(
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    payloader: Box<dyn Payloader + Send + Sync>,
    sequencer: Box<dyn Sequencer + Send + Sync>,
    clock_rate: u32,
) -> impl Packetizer {
    PacketizerImpl {
        mtu,
        payload_type,
        ssrc,
        payloader,
        sequencer,
        timestamp: rand::random::<u32>(),
        clock_rate,
    }
}

/// Same as [`new_packetizer`] with a caller chosen first timestamp.
pub fn new_packetizer_with_timestamp(
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    payloader: Box<dyn Payloader + Send + Sync>,
    sequencer: Box<dyn Sequencer + Send + Sync>,
    clock_rate: u32,
    timestamp: u32,
) -> impl Packetizer {
    PacketizerImpl {
        mtu,
        payload_type,
        ssrc,
        payloader,
        sequencer,
        timestamp,
        clock_rate,
    }
}

struct PacketizerImpl {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    payloader: Box<dyn Payloader + Send + Sync>,
    sequencer: Box<dyn Sequencer + Send + Sync>,
    timestamp: u32,
    clock_rate: u32,
}

impl fmt::Debug for PacketizerImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketizerImpl")
            .field("mtu", &self.mtu)
            .field("payload_type", &self.payload_type)
            .field("ssrc", &self.ssrc)
            .field("timestamp", &self.timestamp)
            .field("clock_rate", &self.clock_rate)
            .finish()
    }
}

impl Packetizer for PacketizerImpl {
    fn packetize(&mut self, payload: &Bytes, samples: u32) -> Result<Vec<Packet>> {
        let packets = self.packetize_at(payload, self.timestamp)?;
        self.timestamp = self.timestamp.wrapping_add(samples);
        Ok(packets)
    }

    fn packetize_at(&mut self, payload: &Bytes, timestamp: u32) -> Result<Vec<Packet>> {
        // Guard against an empty payload
        if payload.is_empty() {
            return Ok(vec![]);
        }
        if self.mtu <= FIXED_HEADER_LENGTH {
            return Err(Error::ErrMtuTooSmall(self.mtu));
        }

        let payloads = self
            .payloader
            .payload(self.mtu - FIXED_HEADER_LENGTH, payload)?;
        let payloads_len = payloads.len();
        let mut packets = Vec::with_capacity(payloads_len);
        for (i, pp) in payloads.into_iter().enumerate() {
            packets.push(Packet {
                header: Header {
                    version: 2,
                    padding: false,
                    extension: false,
                    marker: i == payloads_len - 1,
                    payload_type: self.payload_type,
                    sequence_number: self.sequencer.next_sequence_number(),
                    timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload: pp,
            });
        }
        self.timestamp = timestamp;

        Ok(packets)
    }

    /// SkipSamples causes a gap in sample count between Packetize requests so the
    /// RTP payloads produced have a gap in timestamps
    fn skip_samples(&mut self, skipped_samples: u32) {
        self.timestamp = self.timestamp.wrapping_add(skipped_samples);
    }

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn roll_over_count(&self) -> u64 {
        self.sequencer.roll_over_count()
    }
}
