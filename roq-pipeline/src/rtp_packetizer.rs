//! Stage that turns encoded frames into marshaled RTP packets.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use rtp::codec::Codec;
use rtp::packetizer::{Packetizer, new_packetizer_with_timestamp};
use rtp::sequence::{SequenceUnwrapper, new_fixed_sequencer, new_random_sequencer};
use shared::error::Result;
use shared::marshal::Marshal;

use crate::attributes::{Attributes, Info};
use crate::chain::{Processor, Writer, forward_all};

pub const DEFAULT_MTU: usize = 1200;
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;
pub const DEFAULT_CLOCK_RATE: u32 = 90_000;

/// Builder for [`RtpPacketizer`].
#[derive(Debug, Clone)]
pub struct RtpPacketizerBuilder {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    clock_rate: u32,
    codec: Codec,
    initial_sequence_number: Option<u16>,
    initial_timestamp: Option<u32>,
}

impl Default for RtpPacketizerBuilder {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: rand::random::<u32>(),
            clock_rate: DEFAULT_CLOCK_RATE,
            codec: Codec::default(),
            initial_sequence_number: None,
            initial_timestamp: None,
        }
    }
}

impl RtpPacketizerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum packet size including the 12-byte RTP header.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = ssrc;
        self
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Starts the sequence at `seq` instead of a random value.
    pub fn with_initial_sequence_number(mut self, seq: u16) -> Self {
        self.initial_sequence_number = Some(seq);
        self
    }

    /// Starts the RTP clock at `timestamp` instead of a random value.
    pub fn with_initial_timestamp(mut self, timestamp: u32) -> Self {
        self.initial_timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> RtpPacketizer {
        RtpPacketizer { config: self }
    }
}

/// Packetizes frames into MTU-bounded RTP packets sharing one timestamp.
///
/// With a `Pts` attribute the RTP timestamp is
/// `initial_timestamp + pts_us * clock_rate / 1_000_000`; without it the
/// timestamp advances by one frame duration per frame.
#[derive(Debug, Clone)]
pub struct RtpPacketizer {
    config: RtpPacketizerBuilder,
}

impl RtpPacketizer {
    pub fn ssrc(&self) -> u32 {
        self.config.ssrc
    }

    pub fn codec(&self) -> Codec {
        self.config.codec
    }
}

impl Processor for RtpPacketizer {
    fn link(&mut self, next: Box<dyn Writer>, info: &Info) -> Result<Box<dyn Writer>> {
        let config = &self.config;
        let samples = samples_per_frame(info.frame_duration()?, config.clock_rate);
        let initial_timestamp = config
            .initial_timestamp
            .unwrap_or_else(rand::random::<u32>);
        let sequencer: Box<dyn rtp::sequence::Sequencer + Send + Sync> =
            match config.initial_sequence_number {
                Some(seq) => Box::new(new_fixed_sequencer(seq)),
                None => Box::new(new_random_sequencer()),
            };

        let packetizer = new_packetizer_with_timestamp(
            config.mtu,
            config.payload_type,
            config.ssrc,
            config.codec.payloader(),
            sequencer,
            config.clock_rate,
            initial_timestamp,
        );

        debug!(
            "rtp packetizer linked: codec {} ssrc {} mtu {} samples/frame {} initial timestamp {}",
            config.codec, config.ssrc, config.mtu, samples, initial_timestamp
        );

        Ok(Box::new(RtpPacketizerWriter {
            packetizer: Box::new(packetizer),
            samples,
            initial_timestamp,
            clock_rate: config.clock_rate,
            unwrapper: SequenceUnwrapper::new(),
            next,
        }))
    }
}

fn samples_per_frame(frame_duration: Duration, clock_rate: u32) -> u32 {
    (frame_duration.as_secs_f64() * clock_rate as f64).round() as u32
}

/// Maps a presentation timestamp in microseconds onto the RTP clock.
pub fn pts_to_rtp_timestamp(initial_timestamp: u32, pts_us: i64, clock_rate: u32) -> u32 {
    let ticks = pts_us as i128 * clock_rate as i128 / 1_000_000;
    initial_timestamp.wrapping_add(ticks as u32)
}

struct RtpPacketizerWriter {
    packetizer: Box<dyn Packetizer + Send>,
    samples: u32,
    initial_timestamp: u32,
    clock_rate: u32,
    unwrapper: SequenceUnwrapper,
    next: Box<dyn Writer>,
}

#[async_trait]
impl Writer for RtpPacketizerWriter {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        let pts = attributes.optional(Attributes::pts)?;
        let packets = match pts {
            Some(pts) => {
                let timestamp = pts_to_rtp_timestamp(self.initial_timestamp, pts, self.clock_rate);
                self.packetizer.packetize_at(&buf, timestamp)?
            }
            None => self.packetizer.packetize(&buf, self.samples)?,
        };
        if packets.is_empty() {
            return Ok(());
        }

        let mut bufs = Vec::with_capacity(packets.len());
        for packet in &packets {
            let seq = self.unwrapper.unwrap(packet.header.sequence_number);
            trace!(
                "rtp seq {} (unwrapped {}) ts {} pts {:?} marker {}",
                packet.header.sequence_number,
                seq,
                packet.header.timestamp,
                pts,
                packet.header.marker
            );
            bufs.push(packet.marshal()?.freeze());
        }

        let mut out = attributes;
        out.set_rtp_timestamp(packets[0].header.timestamp);
        forward_all(self.next.as_mut(), bufs, out).await
    }
}
