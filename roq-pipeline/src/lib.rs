//! Composable media processing stages for RTP over QUIC.
//!
//! A pipeline is a chain of [`Writer`]s. Each stage is a [`Processor`] that,
//! when linked, wraps the writer of the stage after it. Buffers travel with
//! typed [`Attributes`] (presentation timestamp, frame duration, key frame
//! flag and so on) that stages read and extend.
//!
//! # Stages
//!
//! ## Sender side
//!
//! | Processor | Description |
//! |-----------|-------------|
//! | [`EncoderProcessor`] | Encodes raw frames through an [`Encoder`] capability |
//! | [`RtpPacketizer`] | Splits frames into MTU-bounded RTP packets, mapping PTS onto the RTP clock |
//! | [`FrameSpacer`] | Spreads a frame's packets over a fraction of the frame duration |
//! | [`RateShaper`] | Token bucket releasing packets at the congestion controller's target rate |
//!
//! ## Receiver side
//!
//! | Processor | Description |
//! |-----------|-------------|
//! | [`RtpDepacketizer`] | Reorders packets in a jitter buffer and rebuilds complete frames |
//! | [`DecoderProcessor`] | Decodes frames through a [`Decoder`] capability |
//!
//! ## Sources and sinks
//!
//! [`IvfSource`] writes the frames of an IVF file into a chain at their
//! presentation times. [`DataSource`] writes chunks no faster than a target
//! rate. Chains end in a [`WriterFn`], a [`ChannelWriter`] or an [`IvfSink`].
//!
//! # Design
//!
//! Timing-sensitive stages keep their state machine sans-IO
//! ([`Reassembler`], [`Spacer`], [`TokenBucket`] implement
//! [`sansio::Protocol`]) and run it from a tokio task that sleeps until the
//! next `poll_timeout` deadline. Stages that own a task are closed through
//! their handle; the handle stays with the caller because processors are
//! linked by mutable reference.
//!
//! # Quick Start
//!
//! ```ignore
//! let info = Info::new(1280, 720, 30, 1);
//! let mut encoder = EncoderProcessor::new(my_encoder);
//! let mut packetizer = RtpPacketizerBuilder::new().build();
//! let mut spacer = FrameSpacerBuilder::new().build();
//!
//! let mut writer = Registry::new(info)
//!     .with(&mut spacer)
//!     .with(&mut packetizer)
//!     .with(&mut encoder)
//!     .build(Box::new(send_flow))?;
//!
//! writer.write(raw_frame, attributes).await?;
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod attributes;
pub mod chain;
pub mod codec;
pub mod frame_spacer;
pub mod ivf;
pub mod reassembler;
pub mod registry;
pub mod rtp_depacketizer;
pub mod rtp_packetizer;
pub mod shaper;
pub mod source;

pub use attributes::{AttributeKey, AttributeValue, Attributes, ChromaSubsampling, Frame, Info};
pub use chain::{ChannelWriter, MultiWriter, Processor, Writer, WriterFn, chain};
pub use codec::{
    DecodedFrame, Decoder, DecoderProcessor, EncodedFrame, Encoder, EncoderProcessor, RateSink,
};
pub use frame_spacer::{FrameSpacer, FrameSpacerBuilder, Spacer};
pub use ivf::{IvfFileHeader, IvfFrameHeader, IvfReader, IvfSink, IvfWriter};
pub use reassembler::Reassembler;
pub use registry::Registry;
pub use rtp_depacketizer::{RtpDepacketizer, RtpDepacketizerBuilder};
pub use rtp_packetizer::{RtpPacketizer, RtpPacketizerBuilder};
pub use shaper::{RateShaper, RateShaperBuilder, ShaperHandle, TokenBucket};
pub use source::{DataRateHandle, DataSource, DataSourceBuilder, IvfSource};
