pub mod vp8;
pub mod vp9;

use std::fmt;
use std::str::FromStr;

use shared::error::Error;

use crate::packetizer::{Depacketizer, Payloader};

/// Video codecs the pipeline knows how to carry over RTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    #[default]
    Vp8,
    Vp9,
}

impl Codec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::Vp8 => "video/VP8",
            Codec::Vp9 => "video/VP9",
        }
    }

    pub fn payloader(&self) -> Box<dyn Payloader + Send + Sync> {
        match self {
            Codec::Vp8 => Box::<vp8::Vp8Payloader>::default(),
            Codec::Vp9 => Box::<vp9::Vp9Payloader>::default(),
        }
    }

    pub fn depacketizer(&self) -> Box<dyn Depacketizer + Send> {
        match self {
            Codec::Vp8 => Box::<vp8::Vp8Packet>::default(),
            Codec::Vp9 => Box::<vp9::Vp9Packet>::default(),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime_type())
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("video/").unwrap_or(s);
        if name.eq_ignore_ascii_case("vp8") {
            Ok(Codec::Vp8)
        } else if name.eq_ignore_ascii_case("vp9") {
            Ok(Codec::Vp9)
        } else {
            Err(Error::ErrUnsupportedCodec(s.to_owned()))
        }
    }
}
