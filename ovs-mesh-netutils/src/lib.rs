mod allocator;
mod error;

pub use allocator::{SubnetAllocator, default_gateway};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
