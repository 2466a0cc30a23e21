//! Sources that feed a chain: IVF files paced by presentation time and a
//! rate-limited data source.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, trace};
use sansio::Protocol;
use shared::error::{Error, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::attributes::{Attributes, Frame, Info};
use crate::chain::Writer;
use crate::codec::RateSink;
use crate::ivf::{IvfFileHeader, IvfReader};
use crate::shaper::{DEFAULT_TICK, TokenBucket};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_DATA_RATE: u64 = 1_000_000;

/// Writes the frames of an IVF file into a chain.
///
/// Every frame carries `Pts` in microseconds, converted from the container
/// timebase, and `FrameDuration` from the container frame rate. VP8 frames
/// also carry `IsKeyFrame`.
pub struct IvfSource<R: Read> {
    reader: IvfReader<R>,
    header: IvfFileHeader,
    frame_duration: Duration,
}

impl<R: Read + Send> IvfSource<R> {
    pub fn new(reader: R) -> Result<Self> {
        let (reader, header) = IvfReader::new(reader)?;
        let frame_duration = header.info().frame_duration()?;
        debug!(
            "ivf source {}x{} {}/{} {} frames",
            header.width,
            header.height,
            header.timebase_denominator,
            header.timebase_numerator,
            header.num_frames
        );
        Ok(Self {
            reader,
            header,
            frame_duration,
        })
    }

    pub fn header(&self) -> &IvfFileHeader {
        &self.header
    }

    pub fn info(&self) -> Info {
        self.header.info()
    }

    /// Reads the next frame, `None` once the file ends.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let (payload, frame_header) = match self.reader.parse_next_frame() {
            Ok(frame) => frame,
            Err(Error::Io(err)) if err.0.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let mut attributes = Attributes::new();
        attributes.set_pts(self.header.pts(frame_header.timestamp));
        attributes.set_frame_duration(self.frame_duration);
        if &self.header.four_cc == b"VP80" {
            // P bit of the VP8 frame tag
            attributes.set_is_key_frame(payload.first().is_some_and(|b| b & 0x01 == 0));
        }
        Ok(Some(Frame::new(payload.freeze(), attributes)))
    }

    /// Writes every frame into `writer` at its presentation time, relative to
    /// the first frame, until the file ends or `cancel` fires. Returns the
    /// number of frames written.
    ///
    /// A failed write drops that frame only, unless the error is fatal.
    pub async fn run(
        mut self,
        mut writer: Box<dyn Writer>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let start = tokio::time::Instant::now();
        let mut first_pts = None;
        let mut count = 0;

        while let Some(frame) = self.next_frame()? {
            let pts = frame.attributes.pts()?;
            let first = *first_pts.get_or_insert(pts);
            let due = start + Duration::from_micros((pts - first).max(0) as u64);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(due) => {}
            }

            if let Err(err) = writer.write(frame.payload, frame.attributes).await {
                if err.is_fatal() {
                    return Err(err);
                }
                error!("ivf source dropped frame {count}: {err}");
                continue;
            }
            count += 1;
        }

        debug!("ivf source done after {count} frames");
        Ok(count)
    }
}

/// Builder for [`DataSource`].
#[derive(Debug, Clone)]
pub struct DataSourceBuilder {
    chunk_size: usize,
    rate: u64,
    burst: Option<u64>,
    start_delay: Duration,
}

impl Default for DataSourceBuilder {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            rate: DEFAULT_DATA_RATE,
            burst: None,
            start_delay: Duration::ZERO,
        }
    }
}

impl DataSourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes per write.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Initial rate in bits per second.
    pub fn with_rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// Bucket size in bits. Defaults to one chunk.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self
    }

    pub fn build(self) -> DataSource {
        let (rate_tx, rate_rx) = watch::channel(self.rate);
        DataSource {
            config: self,
            rate_tx: Arc::new(rate_tx),
            rate_rx,
        }
    }
}

/// Writes chunks into a chain no faster than a target rate, which the
/// congestion controller may change through [`DataSource::handle`].
pub struct DataSource {
    config: DataSourceBuilder,
    rate_tx: Arc<watch::Sender<u64>>,
    rate_rx: watch::Receiver<u64>,
}

/// Rate handle of a [`DataSource`].
#[derive(Debug, Clone)]
pub struct DataRateHandle {
    rate_tx: Arc<watch::Sender<u64>>,
}

impl RateSink for DataRateHandle {
    fn set_target_rate(&self, bps: u64) {
        self.rate_tx.send_replace(bps);
    }
}

impl DataSource {
    pub fn handle(&self) -> DataRateHandle {
        DataRateHandle {
            rate_tx: Arc::clone(&self.rate_tx),
        }
    }

    pub fn target_rate(&self) -> u64 {
        *self.rate_tx.borrow()
    }

    /// Writes random chunks until `cancel` fires. Returns the bytes written.
    pub async fn run(
        &mut self,
        writer: Box<dyn Writer>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let chunk = (0..self.config.chunk_size.max(1))
            .map(|_| rand::random::<u8>())
            .collect::<Bytes>();
        self.pump(writer, cancel, move || Ok(Some(chunk.clone()))).await
    }

    /// Copies `reader` chunk by chunk until it ends or `cancel` fires.
    /// Returns the bytes written.
    pub async fn run_reader<R: Read + Send>(
        &mut self,
        mut reader: R,
        writer: Box<dyn Writer>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let chunk_size = self.config.chunk_size.max(1);
        self.pump(writer, cancel, move || {
            let mut buf = BytesMut::zeroed(chunk_size);
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some(buf.freeze()))
        })
        .await
    }

    async fn pump<F>(
        &mut self,
        mut writer: Box<dyn Writer>,
        cancel: CancellationToken,
        mut next_chunk: F,
    ) -> Result<u64>
    where
        F: FnMut() -> Result<Option<Bytes>> + Send,
    {
        if !self.config.start_delay.is_zero() {
            debug!("data source start delay {:?}", self.config.start_delay);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(0),
                _ = tokio::time::sleep(self.config.start_delay) => {}
            }
        }

        let burst = self
            .config
            .burst
            .unwrap_or(self.config.chunk_size.max(1) as u64 * 8);
        let rate = *self.rate_rx.borrow_and_update();
        let mut bucket = TokenBucket::new(rate, burst, DEFAULT_TICK, 1);
        let mut rate_open = true;
        let mut sent = 0u64;

        'chunks: while let Some(chunk) = next_chunk()? {
            bucket.handle_write((chunk, Attributes::new()))?;
            loop {
                bucket.handle_timeout(tokio::time::Instant::now().into_std())?;
                if let Some((chunk, attributes)) = bucket.poll_write() {
                    let len = chunk.len() as u64;
                    writer.write(chunk, attributes).await?;
                    sent += len;
                    trace!("data source sent {len} bytes");
                    break;
                }

                let deadline = bucket.poll_timeout();
                let sleep = async {
                    match deadline {
                        Some(deadline) => {
                            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
                                .await
                        }
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => break 'chunks,
                    changed = self.rate_rx.changed(), if rate_open => {
                        if changed.is_err() {
                            rate_open = false;
                            continue;
                        }
                        let rate = *self.rate_rx.borrow_and_update();
                        debug!("data source rate set to {rate} bps");
                        bucket.handle_event(rate)?;
                    }
                    _ = sleep => {}
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        bucket.close()?;
        debug!("data source done after {sent} bytes");
        Ok(sent)
    }
}
