#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[cfg(feature = "marshal")]
pub mod marshal;

#[cfg(feature = "varint")]
pub mod varint;

pub mod error;
pub mod time;
