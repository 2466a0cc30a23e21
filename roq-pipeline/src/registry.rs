//! Registry - builder for processor chains.

use shared::error::Result;

use crate::attributes::Info;
use crate::chain::{Processor, Writer, chain};

/// Collects processors and links them into a chain on [`build`](Registry::build).
///
/// Processors are borrowed so the caller keeps its handles (for closing a
/// depacketizer or retuning a shaper) after the chain is built.
///
/// # Example
///
/// ```ignore
/// let mut packetizer = RtpPacketizerBuilder::new().build();
/// let mut spacer = FrameSpacerBuilder::new().build();
///
/// let writer = Registry::new(info)
///     .with(&mut packetizer)
///     .with(&mut spacer)
///     .build(sink)?;
/// ```
///
/// The first processor added sits next to the sink, the last one receives
/// the writes.
pub struct Registry<'a> {
    info: Info,
    processors: Vec<&'a mut dyn Processor>,
}

impl<'a> Registry<'a> {
    pub fn new(info: Info) -> Self {
        Self {
            info,
            processors: vec![],
        }
    }

    pub fn with(mut self, processor: &'a mut dyn Processor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Links the processors on top of `sink`.
    pub fn build(mut self, sink: Box<dyn Writer>) -> Result<Box<dyn Writer>> {
        chain(&self.info, sink, &mut self.processors)
    }
}
