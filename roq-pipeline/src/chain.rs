//! Writers, processors and the fold that links them into a chain.
//!
//! A chain is built back to front: the sink is linked first and every
//! [`Processor`] wraps the writer produced by the one before it. Writes enter
//! the outermost stage and flow towards the sink.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use shared::error::{Error, Result};
use tokio::sync::mpsc;

use crate::attributes::{Attributes, Frame, Info};

/// Consumes one buffer and its attributes.
#[async_trait]
pub trait Writer: Send {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()>;

    /// Returns the batch interface when the writer accepts several buffers
    /// that share one set of attributes.
    fn as_multi_writer(&mut self) -> Option<&mut dyn MultiWriter> {
        None
    }
}

/// Consumes a group of buffers sharing one set of attributes, such as all
/// packets of a frame.
#[async_trait]
pub trait MultiWriter: Send {
    async fn write_all(&mut self, bufs: Vec<Bytes>, attributes: Attributes) -> Result<()>;
}

/// A stage that wraps the next writer of the chain.
pub trait Processor: Send {
    fn link(&mut self, next: Box<dyn Writer>, info: &Info) -> Result<Box<dyn Writer>>;
}

/// Links `processors` in order on top of `sink`.
///
/// The returned writer is `P_n(...P_1(sink))`. The first failing link aborts
/// the construction.
pub fn chain(
    info: &Info,
    sink: Box<dyn Writer>,
    processors: &mut [&mut dyn Processor],
) -> Result<Box<dyn Writer>> {
    let mut writer = sink;
    for processor in processors.iter_mut() {
        writer = processor.link(writer, info)?;
    }
    Ok(writer)
}

/// Writes every buffer to `writer`, in one batch when it supports it.
pub(crate) async fn forward_all(
    writer: &mut dyn Writer,
    bufs: Vec<Bytes>,
    attributes: Attributes,
) -> Result<()> {
    if let Some(multi) = writer.as_multi_writer() {
        return multi.write_all(bufs, attributes).await;
    }
    for buf in bufs {
        writer.write(buf, attributes.clone()).await?;
    }
    Ok(())
}

/// Sink backed by a closure.
pub struct WriterFn<F>(pub F);

impl<F> fmt::Debug for WriterFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterFn").finish()
    }
}

#[async_trait]
impl<F> Writer for WriterFn<F>
where
    F: FnMut(Bytes, Attributes) -> Result<()> + Send,
{
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        (self.0)(buf, attributes)
    }
}

/// Sink that forwards every buffer into a bounded channel.
///
/// Backpressure comes from the channel: a full channel makes `write` wait. A
/// dropped receiver fails with [`Error::ErrClosedPipe`].
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    tx: mpsc::Sender<Frame>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Creates a writer and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Writer for ChannelWriter {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        trace!("channel writer forwarding {} bytes", buf.len());
        self.tx
            .send(Frame::new(buf, attributes))
            .await
            .map_err(|_| Error::ErrClosedPipe)
    }

    fn as_multi_writer(&mut self) -> Option<&mut dyn MultiWriter> {
        Some(self)
    }
}

#[async_trait]
impl MultiWriter for ChannelWriter {
    async fn write_all(&mut self, bufs: Vec<Bytes>, attributes: Attributes) -> Result<()> {
        for buf in bufs {
            self.tx
                .send(Frame::new(buf, attributes.clone()))
                .await
                .map_err(|_| Error::ErrClosedPipe)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Appends its tag to every buffer before passing it on.
    struct Tag(&'static str);

    struct TagWriter {
        tag: &'static str,
        next: Box<dyn Writer>,
    }

    #[async_trait]
    impl Writer for TagWriter {
        async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
            let mut out = buf.to_vec();
            out.extend_from_slice(self.tag.as_bytes());
            self.next.write(Bytes::from(out), attributes).await
        }
    }

    impl Processor for Tag {
        fn link(&mut self, next: Box<dyn Writer>, _info: &Info) -> Result<Box<dyn Writer>> {
            Ok(Box::new(TagWriter {
                tag: self.0,
                next,
            }))
        }
    }

    struct Broken;

    impl Processor for Broken {
        fn link(&mut self, _next: Box<dyn Writer>, info: &Info) -> Result<Box<dyn Writer>> {
            info.frame_duration()?;
            Err(Error::Other("unreachable".to_owned()))
        }
    }

    fn make_recorder() -> (Box<dyn Writer>, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink_seen = Arc::clone(&seen);
        let sink = WriterFn(move |buf: Bytes, _attributes: Attributes| {
            sink_seen.lock()?.push(buf);
            Ok(())
        });
        (Box::new(sink), seen)
    }

    #[tokio::test]
    async fn test_chain_order() -> Result<()> {
        let (sink, seen) = make_recorder();
        let mut a = Tag("a");
        let mut b = Tag("b");
        let mut writer = chain(&Info::new(1, 1, 30, 1), sink, &mut [&mut a, &mut b])?;

        writer.write(Bytes::from_static(b"x"), Attributes::new()).await?;

        // b wraps a, so b tags first
        assert_eq!(seen.lock()?.as_slice(), &[Bytes::from_static(b"xba")]);

        Ok(())
    }

    #[tokio::test]
    async fn test_chain_link_error_aborts() {
        let (sink, _) = make_recorder();
        let mut a = Tag("a");
        let mut broken = Broken;
        let result = chain(
            &Info::new(1, 1, 0, 1),
            sink,
            &mut [&mut a, &mut broken],
        );
        assert_eq!(
            result.err(),
            Some(Error::ErrInvalidTimebase { num: 0, den: 1 })
        );
    }

    #[tokio::test]
    async fn test_channel_writer_closed() -> Result<()> {
        let (mut writer, mut rx) = ChannelWriter::channel(4);
        forward_all(
            &mut writer,
            vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")],
            Attributes::new(),
        )
        .await?;
        assert_eq!(rx.recv().await.map(|f| f.payload), Some(Bytes::from_static(b"1")));
        assert_eq!(rx.recv().await.map(|f| f.payload), Some(Bytes::from_static(b"2")));

        drop(rx);
        assert_eq!(
            writer.write(Bytes::new(), Attributes::new()).await,
            Err(Error::ErrClosedPipe)
        );

        Ok(())
    }
}
