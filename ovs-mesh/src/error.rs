use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry error: {0}")]
    Registry(#[from] ovs_mesh_registry::Error),

    #[error("allocator error: {0}")]
    Allocator(#[from] ovs_mesh_netutils::Error),

    #[error("cidr error: {0}")]
    Cidr(#[from] ipnetwork::IpNetworkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("etcd not reachable within {0:?}")]
    RegistryUnreachable(Duration),

    #[error("setup script exited with {status}: {output}")]
    SetupScript { status: ExitStatus, output: String },

    #[error("task error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
