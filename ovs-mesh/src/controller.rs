use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use ovs_mesh_netutils::SubnetAllocator;
use ovs_mesh_registry::{self as registry, MemberEvent, SubnetAssignment, SubnetRegistry};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::ControllerMetrics;
use crate::{CONTAINER_NETWORK, CONTAINER_SUBNET_HOST_BITS, Error, Result};

const ETCD_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Master role: owns the allocator and reconciles membership into subnet
/// assignments until cancelled.
pub async fn start<R>(
    registry: Arc<R>,
    sync: bool,
    metrics: ControllerMetrics,
    cancel: CancellationToken,
) -> Result<()>
where
    R: SubnetRegistry + 'static,
{
    let allocator = bootstrap(registry.as_ref(), sync, &metrics).await?;

    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watch_registry = registry.clone();
    let watch_cancel = cancel.child_token();
    let watcher =
        tokio::spawn(async move { watch_registry.watch_members(0, tx, watch_cancel).await });

    info!("watching membership");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => {
                    handle_member_event(registry.as_ref(), &allocator, &metrics, event).await
                }
                None => break,
            }
        }
    }

    match watcher.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("member watch ended with error: {e}"),
        Err(e) => warn!("member watch task failed: {e}"),
    }
    Ok(())
}

/// Gates on etcd, initializes the namespaces, rebuilds the allocator from
/// persisted assignments, and serves members that joined while no master was
/// running.
async fn bootstrap<R>(
    registry: &R,
    sync: bool,
    metrics: &ControllerMetrics,
) -> Result<Arc<Mutex<SubnetAllocator>>>
where
    R: SubnetRegistry,
{
    if !registry.check_alive(ETCD_ALIVE_TIMEOUT).await {
        return Err(Error::RegistryUnreachable(ETCD_ALIVE_TIMEOUT));
    }

    if sync {
        match registry.init_members().await {
            Ok(()) => {}
            Err(registry::Error::AlreadyExists(_)) => {
                info!("member namespace already initialized")
            }
            Err(e) => return Err(e.into()),
        }
    }

    // a freshly created namespace has nothing to seed; only AlreadyExists
    // makes us re-read persisted assignments
    let seeds = match registry.init_subnets().await {
        Ok(()) => Vec::new(),
        Err(registry::Error::AlreadyExists(_)) => {
            let subnets = registry.list_subnets().await?;
            info!("seeding allocator with {} persisted subnets", subnets.len());
            subnets
                .into_iter()
                .map(|(_, assignment)| assignment.subnet)
                .collect()
        }
        Err(e) => return Err(e.into()),
    };

    let parent: Ipv4Network = CONTAINER_NETWORK.parse()?;
    let allocator = Arc::new(Mutex::new(SubnetAllocator::new(
        parent,
        CONTAINER_SUBNET_HOST_BITS,
        &seeds,
    )?));

    match registry.list_members().await {
        Ok(members) => {
            for member in members {
                match registry.get_subnet(&member).await {
                    Ok(_) => {}
                    Err(registry::Error::NotFound(_)) => {
                        add_node(registry, &allocator, metrics, &member).await
                    }
                    Err(e) => warn!("failed to check subnet for {member}: {e}"),
                }
            }
        }
        Err(e) => warn!("failed to list existing members: {e}"),
    }

    Ok(allocator)
}

async fn handle_member_event<R>(
    registry: &R,
    allocator: &Mutex<SubnetAllocator>,
    metrics: &ControllerMetrics,
    event: MemberEvent,
) where
    R: SubnetRegistry,
{
    match event {
        MemberEvent::Added(node) => match registry.get_subnet(&node).await {
            // replayed or duplicate event, the assignment already exists
            Ok(_) => {}
            Err(registry::Error::NotFound(_)) => {
                add_node(registry, allocator, metrics, &node).await
            }
            Err(e) => warn!("failed to check subnet for {node}: {e}"),
        },
        MemberEvent::Deleted(node) => delete_node(registry, allocator, metrics, &node).await,
    }
}

async fn add_node<R>(
    registry: &R,
    allocator: &Mutex<SubnetAllocator>,
    metrics: &ControllerMetrics,
    node: &str,
) where
    R: SubnetRegistry,
{
    let node_ip = resolve_node_ip(node).await;
    let subnet = match allocator.lock().await.allocate() {
        Ok(subnet) => subnet,
        Err(e) => {
            // the node stays unserved until another member releases a slot
            error!("no subnet available for {node}: {e}");
            return;
        }
    };
    let assignment = SubnetAssignment {
        node_ip,
        subnet: subnet.to_string(),
    };
    info!("assigning {} to {node}", assignment.subnet);
    if let Err(e) = registry.create_subnet(node, &assignment).await {
        // best-effort write; a replayed membership event retries it
        error!("failed to write subnet {} for {node}: {e}", assignment.subnet);
        return;
    }
    metrics.subnets_allocated.inc();
}

async fn delete_node<R>(
    registry: &R,
    allocator: &Mutex<SubnetAllocator>,
    metrics: &ControllerMetrics,
    node: &str,
) where
    R: SubnetRegistry,
{
    let assignment = match registry.get_subnet(node).await {
        Ok(assignment) => assignment,
        Err(e) => {
            error!("failed to fetch subnet for departed node {node}: {e}");
            return;
        }
    };
    let subnet: Ipv4Network = match assignment.subnet.parse() {
        Ok(subnet) => subnet,
        Err(e) => {
            error!(
                "stored subnet {} for {node} does not parse: {e}",
                assignment.subnet
            );
            return;
        }
    };
    allocator.lock().await.release(&subnet);
    if let Err(e) = registry.delete_subnet(node).await {
        error!("failed to remove subnet record for {node}: {e}");
        return;
    }
    metrics.subnets_released.inc();
    info!("released {} from departed node {node}", assignment.subnet);
}

/// Identifiers that already are IP literals are used as-is; otherwise the
/// first resolved address wins. Resolution failure falls back to the
/// identifier so a later membership event can still correct the record.
pub async fn resolve_node_ip(node: &str) -> String {
    if node.parse::<IpAddr>().is_ok() {
        return node.to_string();
    }
    match tokio::net::lookup_host((node, 0)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr.ip().to_string(),
            None => {
                warn!("no addresses found for {node}, using the name as-is");
                node.to_string()
            }
        },
        Err(e) => {
            warn!("failed to look up {node} ({e}), using the name as-is");
            node.to_string()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::MemoryRegistry;

    const NODE_A: &str = "192.168.1.5";
    const NODE_B: &str = "192.168.1.6";
    const NODE_C: &str = "192.168.1.7";

    fn assignment(ip: &str, subnet: &str) -> SubnetAssignment {
        SubnetAssignment {
            node_ip: ip.into(),
            subnet: subnet.into(),
        }
    }

    #[tokio::test]
    async fn bootstrap_assigns_subnets_to_existing_members() {
        let registry = MemoryRegistry::default();
        registry
            .members
            .lock()
            .unwrap()
            .extend([NODE_A.to_string(), NODE_B.to_string()]);

        bootstrap(&registry, true, &ControllerMetrics::default())
            .await
            .unwrap();

        let subnets = registry.subnets.lock().unwrap();
        assert_eq!(subnets[NODE_A], assignment(NODE_A, "10.1.0.0/24"));
        assert_eq!(subnets[NODE_B], assignment(NODE_B, "10.1.1.0/24"));
    }

    #[tokio::test]
    async fn bootstrap_twice_yields_the_same_assignments() {
        let registry = MemoryRegistry::default();
        registry.members.lock().unwrap().push(NODE_A.to_string());
        let metrics = ControllerMetrics::default();

        bootstrap(&registry, true, &metrics).await.unwrap();
        let first = registry.subnets.lock().unwrap().clone();

        let allocator = bootstrap(&registry, true, &metrics).await.unwrap();

        assert_eq!(*registry.subnets.lock().unwrap(), first);
        // the second allocator was seeded, so the next slot is a fresh one
        assert_eq!(
            allocator.lock().await.allocate().unwrap().to_string(),
            "10.1.1.0/24"
        );
    }

    #[tokio::test]
    async fn restart_seeds_the_allocator_from_persisted_subnets() {
        let registry = MemoryRegistry::default();
        *registry.subnets_initialized.lock().unwrap() = true;
        registry
            .subnets
            .lock()
            .unwrap()
            .insert(NODE_A.to_string(), assignment(NODE_A, "10.1.2.0/24"));
        registry
            .members
            .lock()
            .unwrap()
            .extend([NODE_A.to_string(), NODE_C.to_string()]);

        bootstrap(&registry, true, &ControllerMetrics::default())
            .await
            .unwrap();

        let subnets = registry.subnets.lock().unwrap();
        assert_eq!(subnets[NODE_A].subnet, "10.1.2.0/24");
        assert_eq!(subnets[NODE_C].subnet, "10.1.0.0/24");
    }

    #[tokio::test]
    async fn added_event_is_a_noop_when_the_assignment_exists() {
        let registry = MemoryRegistry::default();
        registry
            .subnets
            .lock()
            .unwrap()
            .insert(NODE_A.to_string(), assignment(NODE_A, "10.1.0.0/24"));
        let metrics = ControllerMetrics::default();
        let allocator = bootstrap(&registry, true, &metrics).await.unwrap();

        handle_member_event(
            &registry,
            &allocator,
            &metrics,
            MemberEvent::Added(NODE_A.to_string()),
        )
        .await;

        assert_eq!(registry.subnets.lock().unwrap().len(), 1);
        // no slot was consumed for the duplicate
        assert_eq!(
            allocator.lock().await.allocate().unwrap().to_string(),
            "10.1.0.0/24"
        );
    }

    #[tokio::test]
    async fn deleted_event_releases_the_subnet_for_reuse() {
        let registry = MemoryRegistry::default();
        registry.members.lock().unwrap().push(NODE_A.to_string());
        let metrics = ControllerMetrics::default();
        let allocator = bootstrap(&registry, true, &metrics).await.unwrap();
        assert_eq!(
            registry.subnets.lock().unwrap()[NODE_A].subnet,
            "10.1.0.0/24"
        );

        handle_member_event(
            &registry,
            &allocator,
            &metrics,
            MemberEvent::Deleted(NODE_A.to_string()),
        )
        .await;
        assert!(registry.subnets.lock().unwrap().is_empty());

        handle_member_event(
            &registry,
            &allocator,
            &metrics,
            MemberEvent::Added(NODE_C.to_string()),
        )
        .await;
        assert_eq!(
            registry.subnets.lock().unwrap()[NODE_C].subnet,
            "10.1.0.0/24"
        );
    }

    #[tokio::test]
    async fn exhaustion_leaves_later_members_unserved() {
        let registry = MemoryRegistry::default();
        let metrics = ControllerMetrics::default();
        let allocator = bootstrap(&registry, true, &metrics).await.unwrap();

        for i in 0..256u32 {
            let node = format!("10.9.{}.{}", i / 250, i % 250);
            handle_member_event(&registry, &allocator, &metrics, MemberEvent::Added(node)).await;
        }
        assert_eq!(registry.subnets.lock().unwrap().len(), 256);

        handle_member_event(
            &registry,
            &allocator,
            &metrics,
            MemberEvent::Added("10.9.200.200".to_string()),
        )
        .await;
        assert!(!registry.subnets.lock().unwrap().contains_key("10.9.200.200"));
    }

    #[tokio::test]
    async fn start_stops_promptly_on_cancel() {
        let registry = Arc::new(MemoryRegistry::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(start(
            registry,
            true,
            ControllerMetrics::default(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("controller did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn ip_literal_identifiers_resolve_to_themselves() {
        assert_eq!(resolve_node_ip("192.168.1.6").await, "192.168.1.6");
        assert_eq!(resolve_node_ip("fd00::1").await, "fd00::1");
    }
}
