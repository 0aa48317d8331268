pub mod aggregator;
pub mod readiness;

use std::collections::BTreeSet;
use shared::codec;
use shared::events::{EndpointEvent, RelationEvent};
use shared::hash::content_hash;
use shared::protocol::FRONTENDS_KEY;
use shared::relation::{RelationTransport, WriteAuthority};
use shared::types::{LoadbalancerRequests, PublishOutcome};
use shared::Result;
use crate::network::PartitionVips;
use self::aggregator::Aggregator;
use self::readiness::ReadinessRecord;

/// Protocol advertised for every listener; the balancer proxies at TCP level
/// and the backends decide what runs on top.
pub const ADVERTISED_PROTOCOL: &str = "http";

/// Provider side of the load balancer relation.
#[derive(Debug, Clone)]
pub struct Provider {
    aggregator: Aggregator,
    readiness: ReadinessRecord,
    requests_hash: Option<String>,
}

impl Provider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            aggregator: Aggregator::new(endpoint),
            readiness: ReadinessRecord::new(),
            requests_hash: None,
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn readiness(&self) -> &ReadinessRecord {
        &self.readiness
    }

    pub fn get_loadbalancer_requests<T>(&self, transport: &T) -> Result<LoadbalancerRequests>
    where
        T: RelationTransport + ?Sized,
    {
        self.aggregator.get_loadbalancer_requests(transport)
    }

    pub fn loadbalancer_ready(
        &mut self,
        service_name: &str,
        partition: &str,
        addresses: Vec<String>,
        port: u16,
        protocol: &str,
    ) {
        self.readiness
            .loadbalancer_ready(service_name, partition, addresses, port, protocol);
    }

    /// Forget readiness for services no peer requests any more.
    pub fn prune_withdrawn<T>(&mut self, transport: &T) -> Result<usize>
    where
        T: RelationTransport + ?Sized,
    {
        let requested: BTreeSet<String> = self
            .aggregator
            .collect_frontend_requests(transport)?
            .into_keys()
            .collect();
        Ok(self.readiness.retain_requested(&requested))
    }

    /// Publish readiness to every peer, each peer seeing only the services
    /// it requested itself. Without write authority nothing is written.
    pub fn advertise_loadbalancers<T>(
        &self,
        transport: &mut T,
        authority: &dyn WriteAuthority,
    ) -> Result<PublishOutcome>
    where
        T: RelationTransport + ?Sized,
    {
        if !authority.is_writer() {
            tracing::info!("Not sending response, not leader");
            return Ok(PublishOutcome::NotWriter);
        }

        let peers = transport.peers(self.aggregator.endpoint())?;
        let bag = transport.local_app_bag();

        for peer in &peers {
            let names = self.aggregator.requested_service_names(transport, peer)?;
            let response = self.readiness.response_for(&names);
            let wire = codec::encode_response(&response)?;

            let current = transport.read_key(peer.relation_id, &bag, FRONTENDS_KEY)?;
            if current.as_deref() != Some(wire.as_str()) {
                transport.write(peer.relation_id, &bag, FRONTENDS_KEY, &wire)?;
                tracing::debug!(
                    "Advertised {} services to {} on relation {}",
                    response.len(),
                    peer.app,
                    peer.relation_id
                );
            }
        }

        Ok(PublishOutcome::Published { peers: peers.len() })
    }

    /// Mark every requested service ready on each partition that has VIPs,
    /// then publish.
    pub fn send_loadbalancer_response<T>(
        &mut self,
        transport: &mut T,
        authority: &dyn WriteAuthority,
        vips: &PartitionVips,
    ) -> Result<PublishOutcome>
    where
        T: RelationTransport + ?Sized,
    {
        let requests = self.get_loadbalancer_requests(transport)?;
        for (service_name, service) in &requests.endpoints {
            for (partition, addresses) in vips.iter().filter(|(_, a)| !a.is_empty()) {
                self.readiness.loadbalancer_ready(
                    service_name,
                    partition,
                    addresses.clone(),
                    service.frontend_port,
                    ADVERTISED_PROTOCOL,
                );
            }
        }

        self.prune_withdrawn(transport)?;
        self.advertise_loadbalancers(transport, authority)
    }

    /// Recompute the aggregated request hash. Returns the new hash when it
    /// differs from the last one seen.
    pub fn refresh_requests_hash<T>(&mut self, transport: &T) -> Result<Option<String>>
    where
        T: RelationTransport + ?Sized,
    {
        let hash = content_hash(&self.get_loadbalancer_requests(transport)?)?;
        if self.requests_hash.as_deref() == Some(hash.as_str()) {
            return Ok(None);
        }
        self.requests_hash = Some(hash.clone());
        Ok(Some(hash))
    }

    /// React to a relation lifecycle event.
    pub fn handle<T>(&mut self, event: &RelationEvent, transport: &T) -> Result<Vec<EndpointEvent>>
    where
        T: RelationTransport + ?Sized,
    {
        let mut events = Vec::new();
        if let RelationEvent::Joined { relation_id } = event {
            events.push(EndpointEvent::RelationReady {
                relation_id: *relation_id,
            });
        }
        if let Some(hash) = self.refresh_requests_hash(transport)? {
            tracing::info!("Load balancer requests changed (relation {})", event.relation_id());
            events.push(EndpointEvent::RequestsChanged { hash });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use serde_json::json;
    use loadbalancer_client::{LoadbalancerRequest, Requirer};
    use shared::memory::{MemoryRelations, MemoryTransport};
    use shared::protocol::LOADBALANCER_ENDPOINT;
    use shared::relation::Bag;

    const LB: &str = "openstack-loadbalancer";

    fn provider_view(world: &MemoryRelations) -> MemoryTransport {
        world.view(LB, "openstack-loadbalancer/0")
    }

    fn request(world: &MemoryRelations, unit: &str, leader: bool, req: &LoadbalancerRequest) {
        let app = unit.split('/').next().unwrap();
        let mut view = world.view(app, unit);
        Requirer::new(LOADBALANCER_ENDPOINT)
            .request_loadbalancer(&mut view, &leader, req)
            .unwrap();
    }

    fn frontends(world: &MemoryRelations, id: u64) -> Option<serde_json::Value> {
        world
            .get(id, &Bag::App(LB.to_string()), FRONTENDS_KEY)
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    fn vips() -> PartitionVips {
        BTreeMap::from([
            ("admin".to_string(), vec!["10.10.0.100".to_string()]),
            ("internal".to_string(), vec!["10.30.0.100".to_string()]),
            ("public".to_string(), vec!["10.20.0.100".to_string()]),
        ])
    }

    #[test]
    fn test_end_to_end_ceph_dashboard() {
        let world = MemoryRelations::new();
        let id = world.relate(LOADBALANCER_ENDPOINT, LB, "ceph-dashboard");
        world.add_unit(id, "ceph-dashboard/0").unwrap();
        world.add_unit(id, "ceph-dashboard/1").unwrap();

        // Follower first, so the leader's app write is not what orders members
        request(
            &world,
            "ceph-dashboard/1",
            false,
            &LoadbalancerRequest::new("ceph-dashboard", 8443, 8443, "10.0.0.11")
                .with_check_type("https"),
        );
        request(
            &world,
            "ceph-dashboard/0",
            true,
            &LoadbalancerRequest::new("ceph-dashboard", 8443, 8443, "10.0.0.10")
                .with_check_type("https"),
        );

        let provider = Provider::new(LOADBALANCER_ENDPOINT);
        let requests = provider.get_loadbalancer_requests(&provider_view(&world)).unwrap();
        assert_eq!(
            serde_json::to_value(&requests).unwrap(),
            json!({"endpoints": {"ceph-dashboard": {
                "frontend_port": 8443,
                "check_type": "https",
                "members": [
                    {"unit_name": "ceph-dashboard_0", "backend_ip": "10.0.0.10", "backend_port": 8443},
                    {"unit_name": "ceph-dashboard_1", "backend_ip": "10.0.0.11", "backend_port": 8443}
                ]
            }}})
        );
    }

    #[test]
    fn test_response_round_trip() {
        let world = MemoryRelations::new();
        let id = world.relate(LOADBALANCER_ENDPOINT, LB, "svc");
        world.add_unit(id, "svc/0").unwrap();
        request(&world, "svc/0", true, &LoadbalancerRequest::new("svc-a", 80, 8080, "10.0.0.1"));

        let mut provider = Provider::new(LOADBALANCER_ENDPOINT);
        let mut view = provider_view(&world);
        provider.loadbalancer_ready("svc-a", "public", vec!["1.2.3.4".to_string()], 80, "http");
        let outcome = provider.advertise_loadbalancers(&mut view, &true).unwrap();
        assert_eq!(outcome, PublishOutcome::Published { peers: 1 });

        let requester_view = world.view("svc", "svc/0");
        let mut requirer = Requirer::new(LOADBALANCER_ENDPOINT);
        let endpoint = requirer
            .get_lb_public_endpoint(&requester_view, "svc-a")
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::to_value(&endpoint).unwrap(),
            json!({"ip": ["1.2.3.4"], "port": 80, "protocol": "http"})
        );
        assert!(requirer.process_response(&requester_view).unwrap().is_some());
    }

    #[test]
    fn test_per_peer_confidentiality() {
        let world = MemoryRelations::new();
        let a = world.relate(LOADBALANCER_ENDPOINT, LB, "alpha");
        let b = world.relate(LOADBALANCER_ENDPOINT, LB, "beta");
        world.add_unit(a, "alpha/0").unwrap();
        world.add_unit(b, "beta/0").unwrap();
        request(&world, "alpha/0", true, &LoadbalancerRequest::new("svc-a", 80, 80, "10.0.0.1"));
        request(&world, "beta/0", true, &LoadbalancerRequest::new("svc-b", 81, 81, "10.0.0.2"));

        let mut provider = Provider::new(LOADBALANCER_ENDPOINT);
        provider.loadbalancer_ready("svc-a", "public", vec!["1.1.1.1".to_string()], 80, "http");
        provider.loadbalancer_ready("svc-b", "public", vec!["2.2.2.2".to_string()], 81, "http");
        provider.advertise_loadbalancers(&mut provider_view(&world), &true).unwrap();

        let alpha = frontends(&world, a).unwrap();
        let beta = frontends(&world, b).unwrap();
        assert!(alpha.get("svc-a").is_some());
        assert!(alpha.get("svc-b").is_none());
        assert!(beta.get("svc-b").is_some());
        assert!(beta.get("svc-a").is_none());
    }

    #[test]
    fn test_not_writer_leaves_slots_unchanged() {
        let world = MemoryRelations::new();
        let id = world.relate(LOADBALANCER_ENDPOINT, LB, "svc");
        request(&world, "svc/0", true, &LoadbalancerRequest::new("svc-a", 80, 80, "10.0.0.1"));

        let mut provider = Provider::new(LOADBALANCER_ENDPOINT);
        provider.loadbalancer_ready("svc-a", "public", vec!["1.2.3.4".to_string()], 80, "http");

        let outcome = provider.advertise_loadbalancers(&mut provider_view(&world), &false).unwrap();
        assert_eq!(outcome, PublishOutcome::NotWriter);
        assert_eq!(frontends(&world, id), None);
    }

    #[test]
    fn test_unready_services_are_omitted() {
        let world = MemoryRelations::new();
        let id = world.relate(LOADBALANCER_ENDPOINT, LB, "svc");
        request(&world, "svc/0", true, &LoadbalancerRequest::new("svc-a", 80, 80, "10.0.0.1"));
        request(&world, "svc/0", true, &LoadbalancerRequest::new("svc-b", 81, 81, "10.0.0.1"));

        let mut provider = Provider::new(LOADBALANCER_ENDPOINT);
        provider.loadbalancer_ready("svc-a", "public", vec!["1.2.3.4".to_string()], 80, "http");
        provider.advertise_loadbalancers(&mut provider_view(&world), &true).unwrap();

        let published = frontends(&world, id).unwrap();
        assert_eq!(published.as_object().unwrap().len(), 1);
        assert!(published.get("svc-a").is_some());
    }

    #[test]
    fn test_withdrawn_service_is_no_longer_advertised() {
        let world = MemoryRelations::new();
        let id = world.relate(LOADBALANCER_ENDPOINT, LB, "svc");
        let mut provider = Provider::new(LOADBALANCER_ENDPOINT);
        let mut view = provider_view(&world);

        request(&world, "svc/0", true, &LoadbalancerRequest::new("svc-a", 80, 80, "10.0.0.1"));
        provider.send_loadbalancer_response(&mut view, &true, &vips()).unwrap();
        assert!(frontends(&world, id).unwrap().get("svc-a").is_some());

        let mut requester = world.view("svc", "svc/0");
        Requirer::new(LOADBALANCER_ENDPOINT)
            .withdraw_loadbalancer(&mut requester, &true, "svc-a")
            .unwrap();
        provider.send_loadbalancer_response(&mut view, &true, &vips()).unwrap();

        assert_eq!(frontends(&world, id).unwrap(), json!({}));
        assert!(provider.readiness().services().is_empty());
    }

    #[test]
    fn test_send_loadbalancer_response() {
        let world = MemoryRelations::new();
        let dash = world.relate(LOADBALANCER_ENDPOINT, LB, "ceph-dashboard");
        let glance = world.relate(LOADBALANCER_ENDPOINT, LB, "glance");
        let units = [(dash, "ceph-dashboard/0"), (dash, "ceph-dashboard/1"), (glance, "glance/0")];
        for (id, unit) in units {
            world.add_unit(id, unit).unwrap();
        }
        request(
            &world,
            "ceph-dashboard/0",
            true,
            &LoadbalancerRequest::new("ceph-dashboard", 8443, 8443, "10.0.0.10")
                .with_check_type("https"),
        );
        request(
            &world,
            "ceph-dashboard/0",
            true,
            &LoadbalancerRequest::new("ceph-api", 9443, 9443, "10.0.0.10").with_check_type("https"),
        );
        let glance_api = LoadbalancerRequest::new("glance-api", 9292, 9292, "10.0.0.50");
        request(&world, "glance/0", true, &glance_api);

        let mut provider = Provider::new(LOADBALANCER_ENDPOINT);
        let outcome = provider
            .send_loadbalancer_response(&mut provider_view(&world), &true, &vips())
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Published { peers: 2 });

        let partitions = |port: u16| {
            json!({
                "admin": {"ip": ["10.10.0.100"], "port": port, "protocol": "http"},
                "internal": {"ip": ["10.30.0.100"], "port": port, "protocol": "http"},
                "public": {"ip": ["10.20.0.100"], "port": port, "protocol": "http"}
            })
        };
        assert_eq!(frontends(&world, glance).unwrap(), json!({"glance-api": partitions(9292)}));
        assert_eq!(
            frontends(&world, dash).unwrap(),
            json!({"ceph-dashboard": partitions(8443), "ceph-api": partitions(9443)})
        );
    }

    #[test]
    fn test_requests_changed_fires_on_content_change() {
        let world = MemoryRelations::new();
        let id = world.relate(LOADBALANCER_ENDPOINT, LB, "svc");
        let view = provider_view(&world);
        let mut provider = Provider::new(LOADBALANCER_ENDPOINT);

        let joined = provider.handle(&RelationEvent::Joined { relation_id: id }, &view).unwrap();
        assert_eq!(joined[0], EndpointEvent::RelationReady { relation_id: id });
        // First observation always reports the current view
        assert!(matches!(joined[1], EndpointEvent::RequestsChanged { .. }));

        let changed = RelationEvent::Changed { relation_id: id };
        assert!(provider.handle(&changed, &view).unwrap().is_empty());

        request(&world, "svc/0", true, &LoadbalancerRequest::new("svc-a", 80, 80, "10.0.0.1"));
        let events = provider.handle(&changed, &view).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EndpointEvent::RequestsChanged { .. }));
    }
}
