use ipnetwork::Ipv4Network;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("subnet range {0} exhausted")]
    Exhausted(Ipv4Network),

    #[error("invalid seed subnet {cidr}: {reason}")]
    Seed { cidr: String, reason: String },

    #[error("invalid parent network: {0}")]
    InvalidNetwork(String),

    #[error("cidr error: {0}")]
    Cidr(#[from] ipnetwork::IpNetworkError),
}
