use tracing::info;

use super::OfCtl;

const VETH_PORT: u8 = 9;
const TUNNEL_PORT: u8 = 10;
const FLOW_PRIORITY: u16 = 200;

/// Derives the rule cookie for a node IP. Swappable so a wider cookie can be
/// adopted later without touching the match syntax.
pub type CookieFn = fn(&str) -> String;

/// First byte of MD5 over the node IP, lowercase hex. A single byte keeps
/// the delete syntax compatible with the deployed tooling at the cost of a
/// ~1/256 collision chance across nodes.
pub fn md5_cookie(node_ip: &str) -> String {
    format!("{:x}", md5::compute(node_ip)[0])
}

/// Translates subnet assignments into OpenFlow rules on the bridge.
pub struct FlowProgrammer<C> {
    ofctl: C,
    local_ip: String,
    cookie: CookieFn,
}

impl<C: OfCtl> FlowProgrammer<C> {
    pub fn new(ofctl: C, local_ip: String) -> Self {
        Self {
            ofctl,
            local_ip,
            cookie: md5_cookie,
        }
    }

    pub fn with_cookie_fn(mut self, cookie: CookieFn) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    /// Installs the IP and ARP rules steering `subnet` either to the local
    /// veth port or through the tunnel to `node_ip`.
    pub async fn install_rules(&self, node_ip: &str, subnet: &str) {
        let cookie = (self.cookie)(node_ip);
        let rules = if node_ip == self.local_ip {
            local_rules(&cookie, subnet)
        } else {
            remote_rules(&cookie, node_ip, subnet)
        };
        for rule in &rules {
            info!("adding flow {rule}");
            self.ofctl.add_flow(rule).await;
        }
    }

    /// Drops the node's rules by cookie; the subnet no longer needs to be
    /// known at this point.
    pub async fn delete_rules(&self, node_ip: &str) {
        let cookie = (self.cookie)(node_ip);
        for spec in &delete_specs(&cookie, node_ip == self.local_ip) {
            info!("deleting flows {spec}");
            self.ofctl.del_flows(Some(spec.as_str())).await;
        }
    }

    /// Clean slate at node start; flows persist on the bridge across process
    /// restarts otherwise.
    pub async fn flush(&self) {
        self.ofctl.del_flows(None).await;
    }
}

fn local_rules(cookie: &str, subnet: &str) -> [String; 2] {
    ["ip", "arp"].map(|proto| {
        format!(
            "table=0,cookie=0x{cookie},priority={FLOW_PRIORITY},{proto},in_port={TUNNEL_PORT},nw_dst={subnet},actions=output:{VETH_PORT}"
        )
    })
}

fn remote_rules(cookie: &str, node_ip: &str, subnet: &str) -> [String; 2] {
    ["ip", "arp"].map(|proto| {
        format!(
            "table=0,cookie=0x{cookie},priority={FLOW_PRIORITY},{proto},in_port={VETH_PORT},nw_dst={subnet},actions=set_field:{node_ip}->tun_dst,output:{TUNNEL_PORT}"
        )
    })
}

fn delete_specs(cookie: &str, local: bool) -> [String; 2] {
    let in_port = if local { TUNNEL_PORT } else { VETH_PORT };
    ["ip", "arp"]
        .map(|proto| format!("table=0,cookie=0x{cookie}/0xffffffff,{proto},in_port={in_port}"))
}
