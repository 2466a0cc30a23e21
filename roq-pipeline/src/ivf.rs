//! IVF container reader, writer and pipeline sink.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use rtp::codec::Codec;
use shared::error::{Error, Result};

use crate::attributes::{Attributes, Info};
use crate::chain::Writer;

pub const IVF_FILE_HEADER_SIGNATURE: &[u8; 4] = b"DKIF";
pub const IVF_FILE_HEADER_SIZE: usize = 32;
pub const IVF_FRAME_HEADER_SIZE: usize = 12;

const FRAME_COUNT_OFFSET: u64 = 24;

/// IVF file header. `timebase_denominator / timebase_numerator` is the frame
/// rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub signature: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub four_cc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase_denominator: u32,
    pub timebase_numerator: u32,
    pub num_frames: u32,
    pub unused: u32,
}

impl IvfFileHeader {
    pub fn new(codec: Codec, info: &Info) -> Self {
        Self {
            signature: *IVF_FILE_HEADER_SIGNATURE,
            version: 0,
            header_size: IVF_FILE_HEADER_SIZE as u16,
            four_cc: fourcc(codec),
            width: info.width as u16,
            height: info.height as u16,
            timebase_denominator: info.timebase_num,
            timebase_numerator: info.timebase_den,
            num_frames: 0,
            unused: 0,
        }
    }

    /// Stream description carrying the container's frame rate.
    pub fn info(&self) -> Info {
        Info::new(
            self.width as u32,
            self.height as u32,
            self.timebase_denominator,
            self.timebase_numerator,
        )
    }

    /// Converts a frame timestamp in timebase ticks into microseconds.
    pub fn pts(&self, timestamp: u64) -> i64 {
        let den = self.timebase_denominator.max(1) as i128;
        (timestamp as i128 * self.timebase_numerator as i128 * 1_000_000 / den) as i64
    }

    pub fn codec(&self) -> Result<Codec> {
        match &self.four_cc {
            b"VP80" => Ok(Codec::Vp8),
            b"VP90" => Ok(Codec::Vp9),
            other => Err(Error::ErrUnsupportedCodec(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// Header in front of every frame of an IVF container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfFrameHeader {
    pub frame_size: u32,
    pub timestamp: u64,
}

pub fn fourcc(codec: Codec) -> [u8; 4] {
    match codec {
        Codec::Vp8 => *b"VP80",
        Codec::Vp9 => *b"VP90",
    }
}

/// Writes frames into an IVF container.
pub struct IvfWriter<W: Write + Seek> {
    writer: W,
    header: IvfFileHeader,
    count: u64,
    first_pts: Option<i64>,
}

impl<W: Write + Seek> IvfWriter<W> {
    pub fn new(writer: W, header: IvfFileHeader) -> Result<Self> {
        let mut w = IvfWriter {
            writer,
            header,
            count: 0,
            first_pts: None,
        };
        w.write_header()?;
        Ok(w)
    }

    fn write_header(&mut self) -> Result<()> {
        let header = self.header;
        self.writer.write_all(&header.signature)?;
        self.writer.write_u16::<LittleEndian>(header.version)?;
        self.writer.write_u16::<LittleEndian>(header.header_size)?;
        self.writer.write_all(&header.four_cc)?;
        self.writer.write_u16::<LittleEndian>(header.width)?;
        self.writer.write_u16::<LittleEndian>(header.height)?;
        self.writer
            .write_u32::<LittleEndian>(header.timebase_denominator)?;
        self.writer
            .write_u32::<LittleEndian>(header.timebase_numerator)?;
        // patched on close
        self.writer.write_u32::<LittleEndian>(header.num_frames)?;
        self.writer.write_u32::<LittleEndian>(header.unused)?;
        Ok(())
    }

    /// Converts a presentation time in microseconds into the nearest IVF
    /// timebase tick, counted from the first frame. Frames without a pts use
    /// their index.
    fn timestamp(&mut self, pts: Option<i64>) -> u64 {
        let Some(pts) = pts else {
            return self.count;
        };
        let first = *self.first_pts.get_or_insert(pts);
        let rate = self.header.timebase_denominator as i128;
        let scale = self.header.timebase_numerator.max(1) as i128;
        let denom = scale * 1_000_000;
        let ticks = ((pts - first) as i128 * rate * 2 + denom) / (2 * denom);
        ticks.max(0) as u64
    }

    pub fn write_frame(&mut self, frame: &[u8], pts: Option<i64>) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        let timestamp = self.timestamp(pts);
        self.writer.write_u32::<LittleEndian>(frame.len() as u32)?;
        self.writer.write_u64::<LittleEndian>(timestamp)?;
        self.writer.write_all(frame)?;
        self.count += 1;
        trace!("ivf frame {} at {} ({} bytes)", self.count, timestamp, frame.len());
        Ok(())
    }

    pub fn frame_count(&self) -> u64 {
        self.count
    }

    /// Patches the frame count into the header and flushes.
    pub fn close(&mut self) -> Result<()> {
        let end = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(FRAME_COUNT_OFFSET))?;
        self.writer.write_u32::<LittleEndian>(self.count as u32)?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;
        debug!("ivf writer closed after {} frames", self.count);
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads frames out of an IVF container.
pub struct IvfReader<R: Read> {
    reader: R,
    bytes_read: usize,
}

impl<R: Read> IvfReader<R> {
    /// Parses the file header and leaves the reader at the first frame.
    pub fn new(reader: R) -> Result<(IvfReader<R>, IvfFileHeader)> {
        let mut r = IvfReader {
            reader,
            bytes_read: 0,
        };

        let header = r.parse_file_header()?;

        Ok((r, header))
    }

    fn parse_file_header(&mut self) -> Result<IvfFileHeader> {
        let mut h = [0u8; IVF_FILE_HEADER_SIZE];
        self.reader.read_exact(&mut h)?;
        self.bytes_read += h.len();

        let mut head_reader = Cursor::new(h);
        let mut signature = [0u8; 4]; //0-3
        head_reader.read_exact(&mut signature)?;
        let version = head_reader.read_u16::<LittleEndian>()?; //4-5
        let header_size = head_reader.read_u16::<LittleEndian>()?; //6-7
        let mut four_cc = [0u8; 4]; //8-11
        head_reader.read_exact(&mut four_cc)?;
        let width = head_reader.read_u16::<LittleEndian>()?; //12-13
        let height = head_reader.read_u16::<LittleEndian>()?; //14-15
        let timebase_denominator = head_reader.read_u32::<LittleEndian>()?; //16-19
        let timebase_numerator = head_reader.read_u32::<LittleEndian>()?; //20-23
        let num_frames = head_reader.read_u32::<LittleEndian>()?; //24-27
        let unused = head_reader.read_u32::<LittleEndian>()?; //28-31

        if &signature != IVF_FILE_HEADER_SIGNATURE {
            return Err(Error::ErrIvfSignatureMismatch);
        }
        if version != 0 {
            return Err(Error::ErrUnknownIvfVersion(version));
        }

        // a longer header carries fields this reader does not know
        let extra = (header_size as usize).saturating_sub(IVF_FILE_HEADER_SIZE);
        if extra > 0 {
            io::copy(&mut (&mut self.reader).take(extra as u64), &mut io::sink())?;
            self.bytes_read += extra;
        }

        Ok(IvfFileHeader {
            signature,
            version,
            header_size,
            four_cc,
            width,
            height,
            timebase_denominator,
            timebase_numerator,
            num_frames,
            unused,
        })
    }

    /// Reads the next frame and its header. The end of the stream surfaces as
    /// an `UnexpectedEof` io error.
    pub fn parse_next_frame(&mut self) -> Result<(BytesMut, IvfFrameHeader)> {
        let mut h = [0u8; IVF_FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut h)?;

        let mut head_reader = Cursor::new(h);
        let frame_size = head_reader.read_u32::<LittleEndian>()?; //0-3
        let timestamp = head_reader.read_u64::<LittleEndian>()?; //4-11

        let mut payload = BytesMut::zeroed(frame_size as usize);
        self.reader.read_exact(&mut payload)?;
        self.bytes_read += IVF_FRAME_HEADER_SIZE + payload.len();

        Ok((
            payload,
            IvfFrameHeader {
                frame_size,
                timestamp,
            },
        ))
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

/// Pipeline sink writing every frame it receives into an [`IvfWriter`].
///
/// Clones share the writer, so one clone can be linked into a chain while
/// another is kept to close the file.
pub struct IvfSink<W: Write + Seek> {
    inner: Arc<Mutex<IvfWriter<W>>>,
}

impl<W: Write + Seek> Clone for IvfSink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write + Seek + Send> IvfSink<W> {
    pub fn new(writer: W, codec: Codec, info: &Info) -> Result<Self> {
        let writer = IvfWriter::new(writer, IvfFileHeader::new(codec, info))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn frame_count(&self) -> Result<u64> {
        Ok(self.inner.lock()?.frame_count())
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock()?.close()
    }

    /// Runs `f` on the underlying output, for example to inspect an in-memory
    /// buffer.
    pub fn with_output<T>(&self, f: impl FnOnce(&W) -> T) -> Result<T> {
        Ok(f(&self.inner.lock()?.writer))
    }
}

#[async_trait]
impl<W: Write + Seek + Send> Writer for IvfSink<W> {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        let pts = attributes.optional(Attributes::pts)?;
        self.inner.lock()?.write_frame(&buf, pts)
    }
}
