pub mod agent;
pub mod config;
pub mod controller;
mod error;
pub mod http;
pub mod metrics;
pub mod ovs;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Container network shared by the whole fleet; every node receives one
/// fixed-size slice of it.
pub const CONTAINER_NETWORK: &str = "10.1.0.0/16";

/// Host bits per node subnet: 8 bits makes /24 slices.
pub const CONTAINER_SUBNET_HOST_BITS: u32 = 8;
