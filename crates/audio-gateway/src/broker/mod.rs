//! Message broker integration: publisher queue, pattern subscriber and the
//! reconnect policy that governs the subscriber.

pub mod client;
pub mod policy;

pub use client::{BrokerClient, BrokerPublisher, InboundMessage, OutboundMessage};
pub use policy::ReconnectPolicy;
