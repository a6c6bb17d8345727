use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ovs_mesh::config::{Cli, Role};
use ovs_mesh::metrics::Metrics;
use ovs_mesh::ovs::{FlowProgrammer, OvsOfctl};
use ovs_mesh::{Result, agent, controller, http};
use ovs_mesh_registry::EtcdRegistry;
use tokio::process::Command;
use tokio::task::JoinError;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();

    let hostname = match &cli.hostname {
        Some(hostname) => hostname.clone(),
        None => default_hostname().await?,
    };
    let local_ip = match &cli.public_ip {
        Some(ip) => ip.clone(),
        None => controller::resolve_node_ip(&hostname).await,
    };
    info!("self ip {local_ip}");

    let registry = Arc::new(connect_registry(&cli).await);
    let metrics = Metrics::default();
    let cancel = tokio_util::sync::CancellationToken::new();

    let mut metrics_handle = tokio::spawn(http::serve(
        cli.metrics_address,
        Arc::new(http::State::new(metrics.clone())),
        cancel.child_token(),
    ));
    let role = cli.role();
    let mut role_handle = match role {
        Some(Role::Node) => {
            let programmer = FlowProgrammer::new(OvsOfctl, local_ip);
            tokio::spawn(agent::start(
                registry,
                programmer,
                hostname,
                cli.sync,
                cli.skip_setup,
                metrics.agent.clone(),
                cancel.child_token(),
            ))
        }
        Some(Role::Master) => tokio::spawn(controller::start(
            registry,
            cli.sync,
            metrics.controller.clone(),
            cancel.child_token(),
        )),
        None => {
            warn!("neither master nor minion mode selected, idling");
            let idle = cancel.child_token();
            tokio::spawn(async move {
                idle.cancelled().await;
                Ok::<_, ovs_mesh::Error>(())
            })
        }
    };
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });

    // watch for shutdown and errors
    tokio::select! {
        h = &mut role_handle => {
            cancel.cancel();
            let _ = metrics_handle.await;
            exit(role_name(role), h)
        }
        h = &mut metrics_handle => {
            cancel.cancel();
            let _ = role_handle.await;
            exit("metrics", h)
        }
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (role_out, metrics_out) = tokio::join!(role_handle, metrics_handle);
            let _ = exit(role_name(role), role_out);
            let _ = exit("metrics", metrics_out);
            info!("Exiting...");
            Ok(())
        }
    }
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ovs_mesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect_registry(cli: &Cli) -> EtcdRegistry {
    let config = cli.etcd_config();
    loop {
        match EtcdRegistry::connect(config.clone()).await {
            Ok(registry) => return registry,
            Err(e) => {
                error!("failed to create subnet registry: {e}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn default_hostname() -> Result<String> {
    let output = Command::new("hostname").arg("-f").output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn role_name(role: Option<Role>) -> &'static str {
    match role {
        Some(Role::Node) => "agent",
        Some(Role::Master) => "controller",
        None => "idle",
    }
}

fn exit(task: &str, out: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(())) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            Err(e)
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            Err(e.into())
        }
    }
}
