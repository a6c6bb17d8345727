use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use ovs_mesh_netutils::default_gateway;
use ovs_mesh_registry::{SubnetAssignment, SubnetEvent, SubnetRegistry};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::AgentMetrics;
use crate::ovs::{FlowProgrammer, OfCtl};
use crate::{CONTAINER_NETWORK, Error, Result};

const SETUP_SCRIPT: &str = "ovs-mesh-setup-node.sh";
const SUBNET_POLL_INTERVAL: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Node role: waits for this host's assignment, runs the one-shot bridge
/// setup, then keeps the flow table converged with the subnet map until
/// cancelled. Assignments are never mutated from here.
pub async fn start<R, C>(
    registry: Arc<R>,
    programmer: FlowProgrammer<C>,
    hostname: String,
    sync: bool,
    skip_setup: bool,
    metrics: AgentMetrics,
    cancel: CancellationToken,
) -> Result<()>
where
    R: SubnetRegistry + 'static,
    C: OfCtl,
{
    if sync {
        registry
            .create_member(&hostname, programmer.local_ip())
            .await?;
    }

    let Some(local) = await_local_subnet(registry.as_ref(), &hostname, &cancel).await else {
        // cancelled while waiting
        return Ok(());
    };
    let local_subnet: Ipv4Network = local.subnet.parse()?;
    info!("local subnet {local_subnet}");

    if !skip_setup {
        run_setup_script(&local_subnet).await?;
    }

    programmer.flush().await;
    match registry.list_subnets().await {
        Ok(subnets) => {
            for (_, assignment) in subnets {
                programmer
                    .install_rules(&assignment.node_ip, &assignment.subnet)
                    .await;
                metrics.flows_installed.inc();
            }
        }
        Err(e) => error!("could not fetch existing subnets: {e}"),
    }

    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watch_registry = registry.clone();
    let watch_cancel = cancel.child_token();
    let watcher =
        tokio::spawn(async move { watch_registry.watch_subnets(0, tx, watch_cancel).await });

    info!("watching subnet assignments");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => handle_subnet_event(&programmer, &metrics, event).await,
                None => break,
            }
        }
    }

    match watcher.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("subnet watch ended with error: {e}"),
        Err(e) => error!("subnet watch task failed: {e}"),
    }
    Ok(())
}

/// Polls until the master hands this host a subnet. `None` on cancellation.
async fn await_local_subnet<R>(
    registry: &R,
    hostname: &str,
    cancel: &CancellationToken,
) -> Option<SubnetAssignment>
where
    R: SubnetRegistry,
{
    loop {
        match registry.get_subnet(hostname).await {
            Ok(assignment) => return Some(assignment),
            Err(e) => info!("no subnet assigned to {hostname} yet ({e}), waiting"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(SUBNET_POLL_INTERVAL) => {}
        }
    }
}

async fn handle_subnet_event<C>(
    programmer: &FlowProgrammer<C>,
    metrics: &AgentMetrics,
    event: SubnetEvent,
) where
    C: OfCtl,
{
    match event {
        SubnetEvent::Added(_, assignment) => {
            programmer
                .install_rules(&assignment.node_ip, &assignment.subnet)
                .await;
            metrics.flows_installed.inc();
        }
        SubnetEvent::Deleted(_, assignment) => {
            programmer.delete_rules(&assignment.node_ip).await;
            metrics.flows_deleted.inc();
        }
    }
}

async fn run_setup_script(subnet: &Ipv4Network) -> Result<()> {
    let gateway = default_gateway(subnet);
    info!("running {SETUP_SCRIPT} {gateway} {subnet} {CONTAINER_NETWORK}");
    let output = Command::new(SETUP_SCRIPT)
        .arg(gateway.to_string())
        .arg(subnet.to_string())
        .arg(CONTAINER_NETWORK)
        .output()
        .await?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    info!("setup script output: {}", combined.trim());
    if !output.status.success() {
        return Err(Error::SetupScript {
            status: output.status,
            output: combined,
        });
    }
    Ok(())
}
