pub mod endpoint;
pub mod exchange;
pub mod message;
pub mod resource;
pub mod transport;
pub mod test_util;
