#![allow(dead_code)]

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer too small")]
    ErrBufferTooSmall,

    //RTP errors
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("RTP version {0} is not supported")]
    ErrUnsupportedRtpVersion(u8),
    #[error("RTP padding length exceeds payload")]
    ErrInvalidPadding,
    #[error("header extension id must be 0 for none RFC 5285 extensions")]
    ErrRfc3550headerIdrange,
    #[error("extension_payload must be in 32-bit words")]
    HeaderExtensionPayloadNot32BitWords,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("too many PDiff")]
    ErrTooManyPDiff,
    #[error("too many spatial layers")]
    ErrTooManySpatialLayers,
    #[error("mtu {0} leaves no room for payload")]
    ErrMtuTooSmall(usize),
    #[error("codec {0} is not supported")]
    ErrUnsupportedCodec(String),

    //IVF errors
    #[error("IVF signature mismatch")]
    ErrIvfSignatureMismatch,
    #[error("IVF version {0} is not supported")]
    ErrUnknownIvfVersion(u16),

    //Jitter buffer errors
    #[error("jitter buffer: underrun")]
    ErrBufferUnderrun,
    #[error("jitter buffer: pop while buffering")]
    ErrPopWhileBuffering,
    #[error("jitter buffer: packet not found")]
    ErrNotFound,

    //Feedback errors
    #[error("varint: truncated input")]
    ErrVarIntTruncated,
    #[error("varint: value {0} exceeds 2^62-1")]
    ErrVarIntOverflow(u64),
    #[error("feedback: declared count {count} exceeds remaining {remaining} bytes")]
    ErrFeedbackCountExceedsInput { count: u64, remaining: usize },
    #[error("feedback: {0} trailing bytes after last event")]
    ErrFeedbackTrailingBytes(usize),

    //Pipeline errors
    #[error("attribute {0} not found")]
    ErrAttributeNotFound(String),
    #[error("attribute {0} has unexpected type")]
    ErrAttributeType(String),
    #[error("invalid timebase {num}/{den}")]
    ErrInvalidTimebase { num: u32, den: u32 },
    #[error("queue overflow")]
    ErrQueueOverflow,
    #[error("pipe closed")]
    ErrClosedPipe,

    //Transport errors
    #[error("feedback references unknown pending packet {0}")]
    ErrUnknownPendingPacket(u64),
    #[error("flow {0} already open")]
    ErrFlowAlreadyOpen(u64),
    #[error("flow closed")]
    ErrFlowClosed,

    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Std(#[source] StdError),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn from_std<T>(error: T) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        Error::Std(StdError(Box::new(error)))
    }

    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        if let Error::Std(s) = self {
            return s.0.downcast_ref();
        }

        None
    }

    /// Invariant violations that must terminate the owning loop instead of
    /// being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ErrQueueOverflow | Error::ErrUnknownPendingPacket(_) | Error::PoisonError(_)
        )
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

/// An escape hatch to preserve stack traces when we don't know the error.
///
/// Encoder and decoder implementations live outside this workspace and report
/// their own error types; `Error::from_std` keeps the source available through
/// [`Error::downcast_ref`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StdError(pub Box<dyn std::error::Error + Send + Sync>);

impl PartialEq for StdError {
    fn eq(&self, _: &Self) -> bool {
        false
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}
