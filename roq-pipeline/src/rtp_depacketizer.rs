//! Stage that rebuilds frames from RTP packets.
//!
//! The writer side only parses packets and queues them; a reassembly task
//! owns the [`Reassembler`] and wakes up on new packets or on the reorder
//! deadline.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace};
use rtp::Packet;
use rtp::codec::Codec;
use rtp::jitter_buffer;
use sansio::Protocol;
use shared::error::{Error, Result};
use shared::marshal::Unmarshal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::attributes::{Attributes, Info};
use crate::chain::{Processor, Writer};
use crate::reassembler::{DEFAULT_REORDER_TIMEOUT, Reassembler};
use crate::rtp_packetizer::DEFAULT_CLOCK_RATE;

pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Builder for [`RtpDepacketizer`].
#[derive(Debug, Clone)]
pub struct RtpDepacketizerBuilder {
    timeout: Duration,
    codec: Codec,
    clock_rate: u32,
    queue_size: usize,
    jitter_buffer_capacity: usize,
    min_start_count: usize,
}

impl Default for RtpDepacketizerBuilder {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REORDER_TIMEOUT,
            codec: Codec::default(),
            clock_rate: DEFAULT_CLOCK_RATE,
            queue_size: DEFAULT_QUEUE_SIZE,
            jitter_buffer_capacity: jitter_buffer::DEFAULT_CAPACITY,
            min_start_count: jitter_buffer::DEFAULT_MIN_START_COUNT,
        }
    }
}

impl RtpDepacketizerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a gap in the sequence is waited on before the frame is dropped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_jitter_buffer_capacity(mut self, capacity: usize) -> Self {
        self.jitter_buffer_capacity = capacity;
        self
    }

    /// Packets collected before playout starts. Playout also starts one
    /// timeout after the first packet when fewer arrive.
    pub fn with_min_start_count(mut self, count: usize) -> Self {
        self.min_start_count = count;
        self
    }

    pub fn build(self) -> RtpDepacketizer {
        RtpDepacketizer {
            config: self,
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

pub struct RtpDepacketizer {
    config: RtpDepacketizerBuilder,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RtpDepacketizer {
    /// Stops the reassembly task. Frames still buffered are discarded.
    pub fn close(&mut self) {
        self.cancel.cancel();
    }

    /// Stops the reassembly task and waits for it to finish.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!("reassembly task failed: {err}");
            }
        }
    }
}

impl Drop for RtpDepacketizer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Processor for RtpDepacketizer {
    fn link(&mut self, next: Box<dyn Writer>, _info: &Info) -> Result<Box<dyn Writer>> {
        let config = &self.config;
        let reassembler = Reassembler::new(
            config.codec.depacketizer(),
            config.clock_rate,
            config.timeout,
            config.jitter_buffer_capacity,
            config.min_start_count,
        );
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));

        debug!(
            "rtp depacketizer linked: codec {} timeout {:?}",
            config.codec, config.timeout
        );
        self.task = Some(tokio::spawn(run_reassembly(
            reassembler,
            rx,
            next,
            self.cancel.clone(),
        )));

        Ok(Box::new(RtpDepacketizerWriter { tx }))
    }
}

struct RtpDepacketizerWriter {
    tx: mpsc::Sender<Packet>,
}

#[async_trait]
impl Writer for RtpDepacketizerWriter {
    async fn write(&mut self, buf: Bytes, _attributes: Attributes) -> Result<()> {
        // detach from the network buffer before queueing
        let mut raw = Bytes::copy_from_slice(&buf);
        let packet = Packet::unmarshal(&mut raw)?;
        trace!(
            "rtp depacketizer received seq {} ts {}",
            packet.header.sequence_number, packet.header.timestamp
        );
        self.tx.send(packet).await.map_err(|_| Error::ErrClosedPipe)
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn run_reassembly(
    mut reassembler: Reassembler,
    mut rx: mpsc::Receiver<Packet>,
    mut next: Box<dyn Writer>,
    cancel: CancellationToken,
) {
    loop {
        while let Some(frame) = reassembler.poll_read() {
            if let Err(err) = next.write(frame.payload, frame.attributes).await {
                error!("depacketizer failed to forward frame: {err}");
            }
        }

        let deadline = reassembler.poll_timeout();
        let sleep = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => {
                let Some(packet) = packet else {
                    break;
                };
                reassembler.push(packet);
                while let Ok(packet) = rx.try_recv() {
                    reassembler.push(packet);
                }
                if let Err(err) = reassembler.handle_timeout(now()) {
                    error!("reassembly failed: {err}");
                }
            }
            _ = sleep => {
                if let Err(err) = reassembler.handle_timeout(now()) {
                    error!("reassembly timeout failed: {err}");
                }
            }
        }
    }

    let stats = reassembler.stats();
    debug!(
        "reassembly task exiting: {} frames emitted, {} dropped",
        stats.frames_emitted, stats.frames_dropped
    );
    if let Err(err) = reassembler.close() {
        error!("closing reassembler failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChannelWriter;
    use rtp::packetizer::{Packetizer, new_packetizer_with_timestamp};
    use rtp::sequence::new_fixed_sequencer;
    use shared::marshal::Marshal;

    #[tokio::test(start_paused = true)]
    async fn test_depacketizer_task() -> Result<()> {
        let (sink, mut frames) = ChannelWriter::channel(16);
        let mut depacketizer = RtpDepacketizerBuilder::new().build();
        let mut writer = depacketizer.link(Box::new(sink), &Info::new(640, 480, 30, 1))?;

        let mut packetizer = new_packetizer_with_timestamp(
            300,
            96,
            7,
            Codec::Vp8.payloader(),
            Box::new(new_fixed_sequencer(10)),
            90_000,
            0,
        );
        let frame = Bytes::from(vec![0x42; 1000]);
        let mut packets = packetizer.packetize(&frame, 3000)?;
        // out of order
        packets.swap(0, 2);
        for p in &packets {
            writer.write(p.marshal()?.freeze(), Attributes::new()).await?;
        }

        let out = frames.recv().await.ok_or(Error::ErrClosedPipe)?;
        assert_eq!(out.payload, frame);
        assert_eq!(out.attributes.rtp_timestamp()?, 0);

        depacketizer.shutdown().await;
        assert_eq!(
            writer.write(packets[0].marshal()?.freeze(), Attributes::new()).await,
            Err(Error::ErrClosedPipe)
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_depacketizer_rejects_malformed() -> Result<()> {
        let (sink, _frames) = ChannelWriter::channel(1);
        let mut depacketizer = RtpDepacketizerBuilder::new().build();
        let mut writer = depacketizer.link(Box::new(sink), &Info::new(640, 480, 30, 1))?;

        assert_eq!(
            writer
                .write(Bytes::from_static(&[0x80, 0x60]), Attributes::new())
                .await,
            Err(Error::ErrHeaderSizeInsufficient)
        );
        depacketizer.close();

        Ok(())
    }
}
