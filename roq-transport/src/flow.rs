//! The network substrate as seen by the transport: a session that opens
//! numbered flows and reports per-packet events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared::error::Result;

use crate::events::PacketEvent;

/// Outbound half of a flow. Each write is one datagram.
#[async_trait]
pub trait SendFlow: Send {
    fn id(&self) -> u64;

    async fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

/// Inbound half of a flow. Each read returns one datagram; a closed flow
/// fails with `Error::ErrFlowClosed`.
#[async_trait]
pub trait ReceiveFlow: Send {
    fn id(&self) -> u64;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Connection-level callbacks. The substrate calls them from its own tasks,
/// so implementations must not block.
pub trait PacketObserver: Send + Sync {
    fn on_packet_sent(&self, _seq_nr: u64, _departure: Duration, _size_bits: u64) {}

    fn on_packet_lost(&self, _seq_nr: u64) {}

    fn on_rtt_update(&self, _rtt: Duration) {}

    fn on_packet_received(&self, _event: PacketEvent) {}
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn open_send_flow(&self, id: u64) -> Result<Box<dyn SendFlow>>;

    async fn accept_receive_flow(&self, id: u64) -> Result<Box<dyn ReceiveFlow>>;

    /// Replaces the observer notified about every packet of the session.
    fn set_packet_observer(&self, observer: Arc<dyn PacketObserver>);

    async fn close(&self) -> Result<()>;
}
