use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ovs_mesh_registry::{
    Error, MemberEvent, Result, SubnetAssignment, SubnetEvent, SubnetRegistry,
};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::ovs::OfCtl;

/// In-memory bridge with ovs semantics: add-flow with an identical match
/// overwrites, del-flows removes whatever matches the given fields.
#[derive(Default)]
pub struct FakeBridge {
    pub flows: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl OfCtl for Arc<FakeBridge> {
    async fn add_flow(&self, spec: &str) {
        self.flows.lock().unwrap().insert(spec.to_string());
    }

    async fn del_flows(&self, spec: Option<&str>) {
        let mut flows = self.flows.lock().unwrap();
        let Some(spec) = spec else {
            flows.clear();
            return;
        };
        let wanted: Vec<&str> = spec
            .split(',')
            .map(|field| field.split('/').next().unwrap_or(field))
            .collect();
        flows.retain(|flow| {
            let fields: Vec<&str> = flow.split(',').collect();
            !wanted.iter().all(|w| fields.contains(w))
        });
    }
}

/// Registry backed by plain maps; the watch streams idle until cancelled so
/// tests drive the event handlers directly.
#[derive(Default)]
pub struct MemoryRegistry {
    pub members: Mutex<Vec<String>>,
    pub subnets: Mutex<BTreeMap<String, SubnetAssignment>>,
    pub members_initialized: Mutex<bool>,
    pub subnets_initialized: Mutex<bool>,
}

#[async_trait]
impl SubnetRegistry for MemoryRegistry {
    async fn check_alive(&self, _timeout: Duration) -> bool {
        true
    }

    async fn init_members(&self) -> Result<()> {
        let mut initialized = self.members_initialized.lock().unwrap();
        if *initialized {
            return Err(Error::AlreadyExists("members".into()));
        }
        *initialized = true;
        Ok(())
    }

    async fn init_subnets(&self) -> Result<()> {
        let mut initialized = self.subnets_initialized.lock().unwrap();
        if *initialized {
            return Err(Error::AlreadyExists("subnets".into()));
        }
        *initialized = true;
        Ok(())
    }

    async fn list_members(&self) -> Result<Vec<String>> {
        Ok(self.members.lock().unwrap().clone())
    }

    async fn list_subnets(&self) -> Result<Vec<(String, SubnetAssignment)>> {
        Ok(self
            .subnets
            .lock()
            .unwrap()
            .iter()
            .map(|(node, assignment)| (node.clone(), assignment.clone()))
            .collect())
    }

    async fn get_subnet(&self, node_id: &str) -> Result<SubnetAssignment> {
        self.subnets
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(node_id.to_string()))
    }

    async fn create_subnet(&self, node_id: &str, assignment: &SubnetAssignment) -> Result<()> {
        self.subnets
            .lock()
            .unwrap()
            .insert(node_id.to_string(), assignment.clone());
        Ok(())
    }

    async fn delete_subnet(&self, node_id: &str) -> Result<()> {
        self.subnets.lock().unwrap().remove(node_id);
        Ok(())
    }

    async fn create_member(&self, node_id: &str, _node_ip: &str) -> Result<()> {
        self.members.lock().unwrap().push(node_id.to_string());
        Ok(())
    }

    async fn watch_members(
        &self,
        _from_index: i64,
        _tx: Sender<MemberEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn watch_subnets(
        &self,
        _from_index: i64,
        _tx: Sender<SubnetEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}
