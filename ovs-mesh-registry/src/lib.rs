mod error;
mod etcd;
mod types;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

pub use error::Error;
pub use etcd::{EtcdConfig, EtcdRegistry};
pub use types::{MemberEvent, MemberRecord, SubnetAssignment, SubnetEvent};

pub type Result<T> = std::result::Result<T, Error>;

/// Coordination surface between the master, the nodes, and the replicated
/// store. Watch streams run until cancelled and must survive broken
/// connections without losing events; `from_index` 0 means "from now" and
/// callers are expected to list first and treat every event idempotently.
#[async_trait]
pub trait SubnetRegistry: Send + Sync {
    /// Probes the store once per second until it answers or the deadline
    /// elapses.
    async fn check_alive(&self, timeout: Duration) -> bool;

    /// Creates the membership namespace. `Error::AlreadyExists` when a
    /// previous process got there first.
    async fn init_members(&self) -> Result<()>;

    /// Creates the subnet namespace. `Error::AlreadyExists` signals that
    /// persisted assignments may exist and the allocator must be seeded.
    async fn init_subnets(&self) -> Result<()>;

    async fn list_members(&self) -> Result<Vec<String>>;

    async fn list_subnets(&self) -> Result<Vec<(String, SubnetAssignment)>>;

    /// `Error::NotFound` when the node has no assignment yet.
    async fn get_subnet(&self, node_id: &str) -> Result<SubnetAssignment>;

    /// Overwrites are permitted; the caller guarantees subnet uniqueness.
    async fn create_subnet(&self, node_id: &str, assignment: &SubnetAssignment) -> Result<()>;

    async fn delete_subnet(&self, node_id: &str) -> Result<()>;

    /// Node self-registration (sync mode).
    async fn create_member(&self, node_id: &str, node_ip: &str) -> Result<()>;

    async fn watch_members(
        &self,
        from_index: i64,
        tx: Sender<MemberEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;

    async fn watch_subnets(
        &self,
        from_index: i64,
        tx: Sender<SubnetEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
