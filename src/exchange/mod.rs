//! The message exchange layer: everything between the raw datagram transport and
//!  application request / response semantics.
//!
//! Outbound, [client::ClientDispatcher] allocates tokens and hands confirmable messages
//!  to [reliability::ReliabilityScheduler] for retransmission until acknowledged.
//!  Inbound, [dedup::DedupTable] suppresses duplicate confirmable requests and decides
//!  between piggybacked and separate responses, while [observe::ObserveRegistry] keeps
//!  per-peer resource subscriptions and fans out update notifications.

pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod message_id;
pub mod observe;
pub mod reliability;
pub mod token;
