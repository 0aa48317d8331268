use std::collections::BTreeMap;
use std::net::IpAddr;
use sha2::{Digest, Sha256};
use shared::protocol::{INIT_SERVICE_AGENT, VIP_AGENT};
use shared::relation::{DataBag, RelationTransport};
use shared::Result;

const VIP6_AGENT: &str = "ocf:heartbeat:IPv6addr";

/// Cluster resources requested from the HA subordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaResources {
    resources: BTreeMap<String, String>,
    resource_params: BTreeMap<String, String>,
    clones: BTreeMap<String, String>,
    init_services: Vec<String>,
}

impl HaResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a floating VIP. The resource name carries a short hash of the
    /// address so several VIPs can coexist.
    pub fn add_vip(&mut self, app: &str, vip: &IpAddr) {
        let digest = hex::encode(Sha256::digest(vip.to_string().as_bytes()));
        let name = format!("res_{}_{}_vip", app, &digest[..7]);

        let (agent, params) = match vip {
            IpAddr::V4(ip) => (VIP_AGENT, format!("params ip=\"{}\"", ip)),
            IpAddr::V6(ip) => (VIP6_AGENT, format!("params ipv6addr=\"{}\"", ip)),
        };
        self.resources.insert(name.clone(), agent.to_string());
        self.resource_params.insert(name, params);
    }

    /// Add an init service, cloned so it runs on every cluster member.
    pub fn add_init_service(&mut self, app: &str, service: &str) {
        let name = format!("res_{}_{}", app.replace('-', "_"), service);
        self.resources
            .insert(name.clone(), format!("{}:{}", INIT_SERVICE_AGENT, service));
        self.clones.insert(format!("cl_{}", name), name);
        if !self.init_services.iter().any(|s| s == service) {
            self.init_services.push(service.to_string());
        }
    }

    /// Data bag contents understood by the HA subordinate.
    pub fn relation_data(&self) -> Result<DataBag> {
        Ok(DataBag::from([
            ("json_resources".to_string(), serde_json::to_string(&self.resources)?),
            ("json_resource_params".to_string(), serde_json::to_string(&self.resource_params)?),
            ("json_clones".to_string(), serde_json::to_string(&self.clones)?),
            ("json_init_services".to_string(), serde_json::to_string(&self.init_services)?),
        ]))
    }

    /// Write the resources into the local unit bag of every connection on
    /// `endpoint`. Returns the number of connections written.
    pub fn bind_resources<T>(&self, transport: &mut T, endpoint: &str) -> Result<usize>
    where
        T: RelationTransport + ?Sized,
    {
        let data = self.relation_data()?;
        let bag = transport.local_unit_bag();
        let peers = transport.peers(endpoint)?;

        for peer in &peers {
            for (key, value) in &data {
                transport.write(peer.relation_id, &bag, key, value)?;
            }
            tracing::info!("Bound HA resources on relation {}", peer.relation_id);
        }
        Ok(peers.len())
    }
}
