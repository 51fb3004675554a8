//! This module contains utilities that are useful for testing code built on the exchange
//!  layer. They are used for testing the crate itself, but they are also exported for
//!  application testing.

pub mod resource;
pub mod transport;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub use resource::TestResources;
pub use transport::RecordingTransport;

/// convenience method for unit test code: create a peer address based on a number, the
///  same number generating the same address and different numbers different addresses
pub fn peer_addr(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}
