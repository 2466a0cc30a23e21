use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use shared::error::{Error, Result};

/// Keys of the per-buffer side data carried next to every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKey {
    ChromaSubsampling,
    IsKeyFrame,
    SampleDuration,
    Width,
    Height,
    /// Presentation timestamp in microseconds.
    Pts,
    FrameDuration,
    /// RTP timestamp of the packets a frame was rebuilt from.
    RtpTimestamp,
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttributeKey::ChromaSubsampling => "ChromaSubsampling",
            AttributeKey::IsKeyFrame => "IsKeyFrame",
            AttributeKey::SampleDuration => "SampleDuration",
            AttributeKey::Width => "Width",
            AttributeKey::Height => "Height",
            AttributeKey::Pts => "PTS",
            AttributeKey::FrameDuration => "FrameDuration",
            AttributeKey::RtpTimestamp => "RtpTimestamp",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChromaSubsampling {
    #[default]
    I420,
    I422,
    I444,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Duration(Duration),
    Chroma(ChromaSubsampling),
}

/// Typed side data attached to a buffer.
///
/// Stages read the keys they need through the typed getters, which fail when
/// the key is missing or holds a value of another type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(HashMap<AttributeKey, AttributeValue>);

macro_rules! typed_getter {
    ($name:ident, $key:expr, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Result<$ty> {
            match self.0.get(&$key) {
                Some(AttributeValue::$variant(v)) => Ok(*v),
                Some(_) => Err(Error::ErrAttributeType($key.to_string())),
                None => Err(Error::ErrAttributeNotFound($key.to_string())),
            }
        }
    };
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: AttributeKey, value: AttributeValue) -> Option<AttributeValue> {
        self.0.insert(key, value)
    }

    pub fn get(&self, key: AttributeKey) -> Option<&AttributeValue> {
        self.0.get(&key)
    }

    pub fn contains(&self, key: AttributeKey) -> bool {
        self.0.contains_key(&key)
    }

    pub fn remove(&mut self, key: AttributeKey) -> Option<AttributeValue> {
        self.0.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder style insert.
    pub fn with(mut self, key: AttributeKey, value: AttributeValue) -> Self {
        self.0.insert(key, value);
        self
    }

    typed_getter!(pts, AttributeKey::Pts, Int, i64);
    typed_getter!(frame_duration, AttributeKey::FrameDuration, Duration, Duration);
    typed_getter!(sample_duration, AttributeKey::SampleDuration, Duration, Duration);
    typed_getter!(is_key_frame, AttributeKey::IsKeyFrame, Bool, bool);
    typed_getter!(width, AttributeKey::Width, UInt, u64);
    typed_getter!(height, AttributeKey::Height, UInt, u64);
    typed_getter!(rtp_timestamp, AttributeKey::RtpTimestamp, UInt, u64);
    typed_getter!(
        chroma_subsampling,
        AttributeKey::ChromaSubsampling,
        Chroma,
        ChromaSubsampling
    );

    /// Reads an optional key: a missing key is `None`, a mistyped one is an error.
    pub fn optional<T>(&self, getter: impl Fn(&Self) -> Result<T>) -> Result<Option<T>> {
        match getter(self) {
            Ok(v) => Ok(Some(v)),
            Err(Error::ErrAttributeNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn set_pts(&mut self, pts: i64) {
        self.0.insert(AttributeKey::Pts, AttributeValue::Int(pts));
    }

    pub fn set_frame_duration(&mut self, d: Duration) {
        self.0
            .insert(AttributeKey::FrameDuration, AttributeValue::Duration(d));
    }

    pub fn set_is_key_frame(&mut self, key_frame: bool) {
        self.0
            .insert(AttributeKey::IsKeyFrame, AttributeValue::Bool(key_frame));
    }

    pub fn set_dimensions(&mut self, width: u64, height: u64) {
        self.0.insert(AttributeKey::Width, AttributeValue::UInt(width));
        self.0
            .insert(AttributeKey::Height, AttributeValue::UInt(height));
    }

    pub fn set_chroma_subsampling(&mut self, chroma: ChromaSubsampling) {
        self.0.insert(
            AttributeKey::ChromaSubsampling,
            AttributeValue::Chroma(chroma),
        );
    }

    pub fn set_rtp_timestamp(&mut self, ts: u32) {
        self.0
            .insert(AttributeKey::RtpTimestamp, AttributeValue::UInt(ts as u64));
    }
}

/// A media unit and its side data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub payload: Bytes,
    pub attributes: Attributes,
}

impl Frame {
    pub fn new(payload: Bytes, attributes: Attributes) -> Self {
        Self {
            payload,
            attributes,
        }
    }
}

/// Static description of a stream, handed to every stage when it is linked.
///
/// `timebase_num / timebase_den` is the frame rate, so 30 fps is `30/1` and
/// NTSC is `30000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Info {
    pub width: u32,
    pub height: u32,
    pub timebase_num: u32,
    pub timebase_den: u32,
}

impl Info {
    pub fn new(width: u32, height: u32, timebase_num: u32, timebase_den: u32) -> Self {
        Self {
            width,
            height,
            timebase_num,
            timebase_den,
        }
    }

    /// Duration of one frame at the stream's frame rate.
    pub fn frame_duration(&self) -> Result<Duration> {
        if self.timebase_num == 0 || self.timebase_den == 0 {
            return Err(Error::ErrInvalidTimebase {
                num: self.timebase_num,
                den: self.timebase_den,
            });
        }
        Ok(Duration::from_nanos(
            self.timebase_den as u64 * 1_000_000_000 / self.timebase_num as u64,
        ))
    }
}
