//! Congestion-controlled RTP over QUIC.
//!
//! The transport sits between media pipelines and a multiplexed session
//! (a QUIC connection or the in-process [`loopback`] pair). Media travels on
//! numbered flows, one RTP packet per datagram. A dedicated feedback flow
//! carries batches of [`PacketEvent`]s from the receiver back to the sender,
//! where a [`CongestionController`] turns them into a target rate for the
//! encoder and the rate shaper.
//!
//! ```text
//!  sender                                              receiver
//!  encoder -> packetizer -> spacer -> shaper -> flow ===> flow -> depacketizer
//!     ^                                 ^                   |
//!     +---------- target rate ----------+                   | arrivals
//!                     ^                                     v
//!              controller <===== feedback flow ===== feedback sender
//! ```
//!
//! # Example
//!
//! ```ignore
//! let (a, b) = loopback::pair(LinkConditions::default());
//!
//! let mut sender = TransportBuilder::new()
//!     .with_role(Role::RateController)
//!     .with_rate_sink(Arc::new(shaper.handle()))
//!     .build(Arc::new(a))
//!     .await?;
//! let mut receiver = TransportBuilder::new()
//!     .with_role(Role::FeedbackSender)
//!     .build(Arc::new(b))
//!     .await?;
//!
//! let media = sender.open_rtp_send_flow(0).await?;
//! let incoming = receiver.accept_rtp_receive_flow(0).await?;
//! ```

#![warn(rust_2018_idioms)]

pub mod controller;
pub mod events;
pub mod feedback;
pub mod flow;
pub mod ledger;
pub mod loopback;
pub mod rtp_flow;
pub mod rtp_logger;
pub mod transport;

pub use controller::{AimdController, AimdControllerBuilder, CongestionController};
pub use events::PacketEvent;
pub use feedback::{FeedbackBatch, marshal_batches};
pub use flow::{PacketObserver, ReceiveFlow, SendFlow, Session};
pub use ledger::{ArrivalRecorder, PacketLedger};
pub use loopback::{LinkConditions, LoopbackSession, pair};
pub use rtp_flow::{RtpReceiveFlow, RtpSendFlow};
pub use rtp_logger::RtpLogger;
pub use transport::{Role, Transport, TransportBuilder, TransportConfig};
