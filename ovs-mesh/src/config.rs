use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use ovs_mesh_registry::EtcdConfig;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Comma-delimited list of etcd endpoints
    #[arg(long, value_delimiter = ',', default_value = "http://127.0.0.1:4001")]
    pub etcd_endpoints: Vec<String>,

    /// etcd namespace for subnet state
    #[arg(long, default_value = "/registry/sdn/")]
    pub etcd_path: String,

    /// SSL key file used to secure etcd communication
    #[arg(long)]
    pub etcd_keyfile: Option<PathBuf>,

    /// SSL certification file used to secure etcd communication
    #[arg(long)]
    pub etcd_certfile: Option<PathBuf>,

    /// SSL Certificate Authority file used to secure etcd communication
    #[arg(long)]
    pub etcd_cafile: Option<PathBuf>,

    /// Publicly reachable IP address of this host (node mode)
    #[arg(long)]
    pub public_ip: Option<String>,

    /// Hostname as registered with the master, defaults to `hostname -f`
    #[arg(long)]
    pub hostname: Option<String>,

    /// Run in master mode
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub master: bool,

    /// Run in minion mode (takes precedence over --master)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub minion: bool,

    /// Skip the node setup script (minion mode)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub skip_setup: bool,

    /// Register this host under the sdn namespace instead of waiting for an
    /// external orchestrator to publish membership
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub sync: bool,

    /// Metrics listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Node,
}

impl Cli {
    pub fn role(&self) -> Option<Role> {
        if self.minion {
            Some(Role::Node)
        } else if self.master {
            Some(Role::Master)
        } else {
            None
        }
    }

    pub fn subnet_path(&self) -> String {
        join(&self.etcd_path, "subnets")
    }

    /// Sync mode keeps membership under our own namespace; otherwise the
    /// external orchestrator's registry is authoritative.
    pub fn member_path(&self) -> String {
        if self.sync {
            join(&self.etcd_path, "minions")
        } else {
            "/registry/minions".to_string()
        }
    }

    pub fn etcd_config(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.etcd_endpoints.clone(),
            subnet_path: self.subnet_path(),
            member_path: self.member_path(),
            keyfile: self.etcd_keyfile.clone(),
            certfile: self.etcd_certfile.clone(),
            cafile: self.etcd_cafile.clone(),
        }
    }
}

fn join(base: &str, leaf: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), leaf)
}
