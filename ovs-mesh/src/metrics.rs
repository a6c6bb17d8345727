use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct Metrics {
    pub controller: ControllerMetrics,
    pub agent: AgentMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("ovs_mesh");
        let controller = ControllerMetrics::default().register(&mut registry);
        let agent = AgentMetrics::default().register(&mut registry);
        Self {
            controller,
            agent,
            registry: Arc::new(registry),
        }
    }
}

#[derive(Clone, Default)]
pub struct ControllerMetrics {
    pub subnets_allocated: Counter,
    pub subnets_released: Counter,
}

impl ControllerMetrics {
    fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "subnets_allocated",
            "Subnets allocated to nodes",
            self.subnets_allocated.clone(),
        );
        registry.register(
            "subnets_released",
            "Subnets released by departing nodes",
            self.subnets_released.clone(),
        );
        self
    }
}

#[derive(Clone, Default)]
pub struct AgentMetrics {
    pub flows_installed: Counter,
    pub flows_deleted: Counter,
}

impl AgentMetrics {
    fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "flows_installed",
            "Flow rule sets installed on the bridge",
            self.flows_installed.clone(),
        );
        registry.register(
            "flows_deleted",
            "Flow rule sets deleted from the bridge",
            self.flows_deleted.clone(),
        );
        self
    }
}
