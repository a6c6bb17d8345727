use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, Event, EventType, GetOptions,
    Identity, TlsOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc::Sender;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{MemberEvent, MemberRecord, SubnetAssignment, SubnetEvent};
use crate::{Error, Result, SubnetRegistry};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REWATCH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub subnet_path: String,
    pub member_path: String,
    pub keyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
}

impl EtcdConfig {
    fn connect_options(&self) -> Result<Option<ConnectOptions>> {
        if self.cafile.is_none() && self.certfile.is_none() && self.keyfile.is_none() {
            return Ok(None);
        }
        let mut tls = TlsOptions::new();
        if let Some(ca) = &self.cafile {
            tls = tls.ca_certificate(Certificate::from_pem(std::fs::read(ca)?));
        }
        if let (Some(cert), Some(key)) = (&self.certfile, &self.keyfile) {
            tls = tls.identity(Identity::from_pem(std::fs::read(cert)?, std::fs::read(key)?));
        }
        Ok(Some(ConnectOptions::new().with_tls(tls)))
    }
}

pub struct EtcdRegistry {
    client: Client,
    subnet_path: String,
    member_path: String,
}

impl EtcdRegistry {
    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        let options = config.connect_options()?;
        let client = Client::connect(&config.endpoints, options).await?;
        Ok(Self {
            client,
            subnet_path: config.subnet_path,
            member_path: config.member_path,
        })
    }

    /// Transactional marker put: succeeds only when the namespace key has
    /// never been created, so a second master sees `AlreadyExists`.
    async fn init_namespace(&self, path: &str) -> Result<()> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, "", None)]);
        let resp = self.client.kv_client().txn(txn).await?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(Error::AlreadyExists(path.to_string()))
        }
    }

    async fn watch_prefix<T, F>(
        &self,
        path: &str,
        from_index: i64,
        tx: Sender<T>,
        cancel: CancellationToken,
        map: F,
    ) -> Result<()>
    where
        T: Send + 'static,
        F: Fn(&Event, &str) -> Option<T> + Send,
    {
        let prefix = format!("{path}/");
        let mut next_rev = from_index;
        loop {
            let mut options = WatchOptions::new().with_prefix().with_prev_key();
            if next_rev > 0 {
                options = options.with_start_revision(next_rev);
            }
            let mut watch_client = self.client.watch_client();
            let established = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = watch_client.watch(prefix.as_str(), Some(options)) => res,
            };
            let (mut watcher, mut stream) = match established {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("failed to establish watch on {prefix}: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(REWATCH_DELAY) => continue,
                    }
                }
            };
            debug!("watching {prefix} from revision {next_rev}");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = watcher.cancel().await;
                        return Ok(());
                    }
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) => {
                            if let Some(header) = resp.header() {
                                next_rev = header.revision() + 1;
                            }
                            if resp.canceled() {
                                // events before the compaction point are gone;
                                // resume as early as the server still allows
                                if resp.compact_revision() > 0 {
                                    next_rev = resp.compact_revision();
                                }
                                warn!("watch on {prefix} cancelled by the server, re-establishing");
                                break;
                            }
                            for event in resp.events() {
                                let Some(mapped) = map(event, &prefix) else {
                                    continue;
                                };
                                if tx.send(mapped).await.is_err() {
                                    // consumer is gone, the watch has no audience
                                    let _ = watcher.cancel().await;
                                    return Ok(());
                                }
                            }
                        }
                        Ok(None) => {
                            warn!("watch stream on {prefix} closed, re-establishing");
                            break;
                        }
                        Err(e) => {
                            warn!("watch stream on {prefix} failed: {e}");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(REWATCH_DELAY) => {}
            }
        }
    }
}

#[async_trait]
impl SubnetRegistry for EtcdRegistry {
    async fn check_alive(&self, alive_timeout: Duration) -> bool {
        let deadline = Instant::now() + alive_timeout;
        let mut maintenance = self.client.maintenance_client();
        loop {
            match timeout(PROBE_TIMEOUT, maintenance.status()).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => debug!("etcd status probe failed: {e}"),
                Err(_) => debug!("etcd status probe timed out"),
            }
            if Instant::now() + PROBE_INTERVAL >= deadline {
                return false;
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    async fn init_members(&self) -> Result<()> {
        self.init_namespace(&self.member_path).await
    }

    async fn init_subnets(&self) -> Result<()> {
        self.init_namespace(&self.subnet_path).await
    }

    async fn list_members(&self) -> Result<Vec<String>> {
        let prefix = format!("{}/", self.member_path);
        let resp = self
            .client
            .kv_client()
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| node_id_from_key(kv.key(), &prefix))
            .collect())
    }

    async fn list_subnets(&self) -> Result<Vec<(String, SubnetAssignment)>> {
        let prefix = format!("{}/", self.subnet_path);
        let resp = self
            .client
            .kv_client()
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut subnets = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let Some(node) = node_id_from_key(kv.key(), &prefix) else {
                continue;
            };
            subnets.push((node, serde_json::from_slice(kv.value())?));
        }
        Ok(subnets)
    }

    async fn get_subnet(&self, node_id: &str) -> Result<SubnetAssignment> {
        let key = format!("{}/{node_id}", self.subnet_path);
        let resp = self.client.kv_client().get(key.as_str(), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(serde_json::from_slice(kv.value())?),
            None => Err(Error::NotFound(node_id.to_string())),
        }
    }

    async fn create_subnet(&self, node_id: &str, assignment: &SubnetAssignment) -> Result<()> {
        let key = format!("{}/{node_id}", self.subnet_path);
        let value = serde_json::to_vec(assignment)?;
        self.client.kv_client().put(key, value, None).await?;
        Ok(())
    }

    async fn delete_subnet(&self, node_id: &str) -> Result<()> {
        let key = format!("{}/{node_id}", self.subnet_path);
        self.client.kv_client().delete(key, None).await?;
        Ok(())
    }

    async fn create_member(&self, node_id: &str, node_ip: &str) -> Result<()> {
        let key = format!("{}/{node_id}", self.member_path);
        let value = serde_json::to_vec(&MemberRecord {
            ip: node_ip.to_string(),
        })?;
        self.client.kv_client().put(key, value, None).await?;
        Ok(())
    }

    async fn watch_members(
        &self,
        from_index: i64,
        tx: Sender<MemberEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.watch_prefix(&self.member_path, from_index, tx, cancel, map_member_event)
            .await
    }

    async fn watch_subnets(
        &self,
        from_index: i64,
        tx: Sender<SubnetEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.watch_prefix(&self.subnet_path, from_index, tx, cancel, map_subnet_event)
            .await
    }
}

fn map_member_event(event: &Event, prefix: &str) -> Option<MemberEvent> {
    let kv = event.kv()?;
    let node = node_id_from_key(kv.key(), prefix)?;
    match event.event_type() {
        EventType::Put => Some(MemberEvent::Added(node)),
        EventType::Delete => Some(MemberEvent::Deleted(node)),
    }
}

fn map_subnet_event(event: &Event, prefix: &str) -> Option<SubnetEvent> {
    let kv = event.kv()?;
    let node = node_id_from_key(kv.key(), prefix)?;
    match event.event_type() {
        EventType::Put => match serde_json::from_slice(kv.value()) {
            Ok(assignment) => Some(SubnetEvent::Added(node, assignment)),
            Err(e) => {
                warn!("ignoring undecodable subnet record for {node}: {e}");
                None
            }
        },
        EventType::Delete => {
            // the deleted value only survives in prev_kv
            let prev = event.prev_kv()?;
            match serde_json::from_slice(prev.value()) {
                Ok(assignment) => Some(SubnetEvent::Deleted(node, assignment)),
                Err(e) => {
                    warn!("ignoring undecodable deleted subnet record for {node}: {e}");
                    None
                }
            }
        }
    }
}

fn node_id_from_key(key: &[u8], prefix: &str) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    let id = key.strip_prefix(prefix)?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
