pub mod address;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod retransmit;
pub mod transport;
pub mod wire;
