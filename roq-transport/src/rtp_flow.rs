//! Media flows carrying one RTP packet per datagram.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use pipeline::{Attributes, Writer};
use shared::error::{Error, Result};
use tokio_util::sync::CancellationToken;

use crate::flow::{ReceiveFlow, SendFlow};
use crate::rtp_logger::RtpLogger;

/// Largest datagram a receive flow accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Pipeline sink writing every packet it is given to a send flow.
pub struct RtpSendFlow {
    flow: Box<dyn SendFlow>,
    logger: Option<RtpLogger>,
}

impl RtpSendFlow {
    pub fn new(flow: Box<dyn SendFlow>) -> Self {
        Self { flow, logger: None }
    }

    pub fn with_logger(mut self, logger: RtpLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn id(&self) -> u64 {
        self.flow.id()
    }
}

#[async_trait]
impl Writer for RtpSendFlow {
    async fn write(&mut self, buf: Bytes, _attributes: Attributes) -> Result<()> {
        if let Some(logger) = self.logger.as_mut() {
            if let Err(err) = logger.log_packet(&buf) {
                debug!("rtp flow {}: packet not logged: {}", self.flow.id(), err);
            }
        }
        self.flow.write(&buf).await?;
        Ok(())
    }
}

/// Reads RTP packets from a receive flow and pushes them into a pipeline.
pub struct RtpReceiveFlow {
    flow: Box<dyn ReceiveFlow>,
    logger: Option<RtpLogger>,
    cancel: CancellationToken,
}

impl RtpReceiveFlow {
    pub fn new(flow: Box<dyn ReceiveFlow>, cancel: CancellationToken) -> Self {
        Self {
            flow,
            logger: None,
            cancel,
        }
    }

    pub fn with_logger(mut self, logger: RtpLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn id(&self) -> u64 {
        self.flow.id()
    }

    /// Runs until the flow closes or the transport is cancelled. A packet
    /// the pipeline rejects ends the flow with that error.
    pub async fn run(mut self, mut writer: Box<dyn Writer>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => break,
                n = self.flow.read(&mut buf) => match n {
                    Ok(n) => n,
                    Err(Error::ErrFlowClosed) => break,
                    Err(err) => return Err(err),
                },
            };

            if let Some(logger) = self.logger.as_mut() {
                if let Err(err) = logger.log_packet(&buf[..n]) {
                    debug!("rtp flow {}: packet not logged: {}", self.flow.id(), err);
                }
            }
            if let Err(err) = writer
                .write(Bytes::copy_from_slice(&buf[..n]), Attributes::new())
                .await
            {
                warn!("rtp flow {}: dropping flow: {}", self.flow.id(), err);
                return Err(err);
            }
        }

        debug!("rtp flow {} closed", self.flow.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Session;
    use crate::loopback::{LinkConditions, pair};
    use pipeline::{ChannelWriter, WriterFn};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_rtp_flows_carry_packets() -> Result<()> {
        let (a, b) = pair(LinkConditions::default());
        let mut sender = RtpSendFlow::new(a.open_send_flow(0).await?)
            .with_logger(RtpLogger::new("sender"));
        let receiver = RtpReceiveFlow::new(b.accept_receive_flow(0).await?, CancellationToken::new());
        assert_eq!(sender.id(), 0);

        let (sink, mut rx) = ChannelWriter::channel(8);
        let task = tokio::spawn(receiver.run(Box::new(sink)));

        sender
            .write(Bytes::from_static(b"first"), Attributes::new())
            .await?;
        sender
            .write(Bytes::from_static(b"second"), Attributes::new())
            .await?;

        let first = rx.recv().await.ok_or(Error::ErrClosedPipe)?;
        let second = rx.recv().await.ok_or(Error::ErrClosedPipe)?;
        assert_eq!(&first.payload[..], b"first");
        assert_eq!(&second.payload[..], b"second");

        a.close().await?;
        let result = task.await.map_err(|e| Error::Other(e.to_string()))?;
        assert_eq!(result, Ok(()));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtp_receive_flow_stops_on_pipeline_error() -> Result<()> {
        let (a, b) = pair(LinkConditions::default().with_delay(Duration::from_millis(1)));
        let mut tx = a.open_send_flow(5).await?;
        let receiver = RtpReceiveFlow::new(b.accept_receive_flow(5).await?, CancellationToken::new());

        tx.write(b"junk").await?;
        let sink = WriterFn(|_buf: Bytes, _attributes: Attributes| Err(Error::ErrShortPacket));
        assert_eq!(receiver.run(Box::new(sink)).await, Err(Error::ErrShortPacket));

        Ok(())
    }
}
