#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod codec;
pub mod header;
pub mod jitter_buffer;
pub mod packet;
pub mod packetizer;
pub mod sequence;

pub use header::Header;
pub use jitter_buffer::JitterBuffer;
pub use packet::Packet;
