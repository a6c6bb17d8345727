pub mod flows;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

pub use flows::{CookieFn, FlowProgrammer, md5_cookie};

/// Canonical bridge established by the node setup script. Port 9 is the veth
/// into the container bridge, port 10 the tunnel port.
pub const BRIDGE: &str = "br0";

const OPENFLOW_DIALECT: &str = "OpenFlow13";

/// Seam over `ovs-ofctl`. Failures are logged, never propagated: the bridge
/// may end up incomplete and a later watch event re-converges it.
#[async_trait]
pub trait OfCtl: Send + Sync {
    async fn add_flow(&self, spec: &str);

    /// `None` drops every flow on the bridge.
    async fn del_flows(&self, spec: Option<&str>);
}

pub struct OvsOfctl;

#[async_trait]
impl OfCtl for OvsOfctl {
    async fn add_flow(&self, spec: &str) {
        run_ofctl(&["add-flow", BRIDGE, spec]).await;
    }

    async fn del_flows(&self, spec: Option<&str>) {
        match spec {
            Some(spec) => run_ofctl(&["del-flows", BRIDGE, spec]).await,
            None => run_ofctl(&["del-flows", BRIDGE]).await,
        }
    }
}

async fn run_ofctl(args: &[&str]) {
    let result = Command::new("ovs-ofctl")
        .arg("-O")
        .arg(OPENFLOW_DIALECT)
        .args(args)
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {
            debug!("ovs-ofctl {}: ok", args.join(" "));
        }
        Ok(output) => {
            error!(
                "ovs-ofctl {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => error!("failed to run ovs-ofctl {}: {e}", args.join(" ")),
    }
}
