use serde::{Deserialize, Serialize};

/// A node's slice of the container network, stored under the subnets key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetAssignment {
    /// Reachable IP of the owning node.
    #[serde(rename = "minion")]
    pub node_ip: String,
    /// CIDR assigned to the node's container bridge.
    #[serde(rename = "sub")]
    pub subnet: String,
}

/// Membership record written by a self-registering node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Added(String),
    Deleted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetEvent {
    Added(String, SubnetAssignment),
    Deleted(String, SubnetAssignment),
}
