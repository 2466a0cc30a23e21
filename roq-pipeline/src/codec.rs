//! Encoder and decoder capabilities and the stages that drive them.
//!
//! Codec implementations live outside this workspace; the pipeline only
//! needs the narrow traits below.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace};
use shared::error::{Error, Result};

use crate::attributes::{Attributes, ChromaSubsampling, Info};
use crate::chain::{Processor, Writer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedFrame {
    pub payload: Bytes,
    pub is_key_frame: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub chroma: ChromaSubsampling,
}

pub trait Encoder: Send {
    /// Encodes one raw frame. An empty payload means the encoder held the
    /// frame back and nothing is forwarded.
    fn encode(&mut self, raw: &Bytes, pts: i64, duration: Duration) -> Result<EncodedFrame>;

    fn set_target_rate(&mut self, bps: u64);
}

pub trait Decoder: Send {
    fn decode(&mut self, payload: &Bytes) -> Result<DecodedFrame>;
}

/// Receives target rate updates from the congestion controller.
pub trait RateSink: Send + Sync {
    fn set_target_rate(&self, bps: u64);
}

/// Stage that encodes raw frames before handing them to the next writer.
///
/// Raw frames must carry a `Pts` attribute. `FrameDuration` falls back to the
/// duration derived from the linked [`Info`].
pub struct EncoderProcessor<E: Encoder> {
    encoder: Arc<Mutex<E>>,
}

impl<E: Encoder + 'static> EncoderProcessor<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder: Arc::new(Mutex::new(encoder)),
        }
    }

    /// Handle the transport uses to push target rates into the encoder.
    pub fn rate_sink(&self) -> Arc<dyn RateSink> {
        Arc::new(EncoderRateSink {
            encoder: Arc::clone(&self.encoder),
        })
    }
}

struct EncoderRateSink<E: Encoder> {
    encoder: Arc<Mutex<E>>,
}

impl<E: Encoder> RateSink for EncoderRateSink<E> {
    fn set_target_rate(&self, bps: u64) {
        match self.encoder.lock() {
            Ok(mut encoder) => {
                debug!("encoder target rate {bps} bps");
                encoder.set_target_rate(bps);
            }
            Err(err) => error!("encoder lock poisoned: {err}"),
        }
    }
}

impl<E: Encoder + 'static> Processor for EncoderProcessor<E> {
    fn link(&mut self, next: Box<dyn Writer>, info: &Info) -> Result<Box<dyn Writer>> {
        Ok(Box::new(EncoderWriter {
            encoder: Arc::clone(&self.encoder),
            frame_duration: info.frame_duration()?,
            next,
        }))
    }
}

struct EncoderWriter<E: Encoder> {
    encoder: Arc<Mutex<E>>,
    frame_duration: Duration,
    next: Box<dyn Writer>,
}

#[async_trait]
impl<E: Encoder + 'static> Writer for EncoderWriter<E> {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        let pts = attributes.pts()?;
        let duration = attributes
            .optional(Attributes::frame_duration)?
            .unwrap_or(self.frame_duration);

        let encoded = {
            let mut encoder = self.encoder.lock()?;
            encoder.encode(&buf, pts, duration)?
        };
        if encoded.payload.is_empty() {
            trace!("encoder held back frame at pts {pts}");
            return Ok(());
        }

        let mut out = attributes;
        out.set_is_key_frame(encoded.is_key_frame);
        out.set_frame_duration(duration);
        self.next.write(encoded.payload, out).await
    }
}

/// Stage that decodes frames and tags them with their geometry.
pub struct DecoderProcessor<D: Decoder> {
    decoder: Option<D>,
}

impl<D: Decoder + 'static> DecoderProcessor<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder: Some(decoder),
        }
    }
}

impl<D: Decoder + 'static> Processor for DecoderProcessor<D> {
    fn link(&mut self, next: Box<dyn Writer>, _info: &Info) -> Result<Box<dyn Writer>> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| Error::Other("decoder already linked".to_owned()))?;
        Ok(Box::new(DecoderWriter { decoder, next }))
    }
}

struct DecoderWriter<D: Decoder> {
    decoder: D,
    next: Box<dyn Writer>,
}

#[async_trait]
impl<D: Decoder + 'static> Writer for DecoderWriter<D> {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        let decoded = self.decoder.decode(&buf)?;

        let mut out = attributes;
        out.set_dimensions(decoded.width as u64, decoded.height as u64);
        out.set_chroma_subsampling(decoded.chroma);
        self.next.write(decoded.data, out).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::WriterFn;

    #[derive(Default)]
    struct FakeEncoder {
        frames: usize,
        target_rate: u64,
    }

    impl Encoder for FakeEncoder {
        fn encode(&mut self, raw: &Bytes, _pts: i64, _duration: Duration) -> Result<EncodedFrame> {
            self.frames += 1;
            Ok(EncodedFrame {
                payload: raw.clone(),
                is_key_frame: self.frames == 1,
            })
        }

        fn set_target_rate(&mut self, bps: u64) {
            self.target_rate = bps;
        }
    }

    struct FakeDecoder;

    impl Decoder for FakeDecoder {
        fn decode(&mut self, payload: &Bytes) -> Result<DecodedFrame> {
            Ok(DecodedFrame {
                data: payload.clone(),
                width: 64,
                height: 48,
                chroma: ChromaSubsampling::I420,
            })
        }
    }

    fn make_sink() -> (Box<dyn Writer>, Arc<Mutex<Vec<Attributes>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink_seen = Arc::clone(&seen);
        let sink = WriterFn(move |_buf: Bytes, attributes: Attributes| {
            sink_seen.lock()?.push(attributes);
            Ok(())
        });
        (Box::new(sink), seen)
    }

    #[tokio::test]
    async fn test_encoder_processor() -> Result<()> {
        let (sink, seen) = make_sink();
        let mut encoder = EncoderProcessor::new(FakeEncoder::default());
        let rate_sink = encoder.rate_sink();
        let mut writer = encoder.link(sink, &Info::new(64, 48, 25, 1))?;

        let mut attributes = Attributes::new();
        attributes.set_pts(0);
        writer.write(Bytes::from_static(b"raw"), attributes.clone()).await?;
        attributes.set_pts(40_000);
        writer.write(Bytes::from_static(b"raw"), attributes).await?;

        {
            let seen = seen.lock()?;
            assert_eq!(seen.len(), 2);
            assert!(seen[0].is_key_frame()?);
            assert!(!seen[1].is_key_frame()?);
            assert_eq!(seen[1].frame_duration()?, Duration::from_millis(40));
            assert_eq!(seen[1].pts()?, 40_000);
        }

        rate_sink.set_target_rate(500_000);
        assert_eq!(encoder.encoder.lock()?.target_rate, 500_000);

        // pts is mandatory
        assert_eq!(
            writer.write(Bytes::from_static(b"raw"), Attributes::new()).await,
            Err(Error::ErrAttributeNotFound("PTS".to_owned()))
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_decoder_processor() -> Result<()> {
        let (sink, seen) = make_sink();
        let mut decoder = DecoderProcessor::new(FakeDecoder);
        let mut writer = decoder.link(sink, &Info::default())?;

        writer.write(Bytes::from_static(b"enc"), Attributes::new()).await?;

        let seen = seen.lock()?;
        assert_eq!(seen[0].width()?, 64);
        assert_eq!(seen[0].height()?, 48);
        assert_eq!(seen[0].chroma_subsampling()?, ChromaSubsampling::I420);

        Ok(())
    }
}
