use std::collections::{BTreeMap, BTreeSet, HashMap};
use shared::codec;
use shared::protocol::ENDPOINTS_KEY;
use shared::relation::{Bag, PeerHandle, RelationTransport};
use shared::types::{
    unit_slug, AggregatedService, BackendMember, BackendRegistration, FrontendRequest,
    LoadbalancerRequests, ServiceRequest,
};
use shared::Result;

/// Merges every peer's registrations into one view per service name.
///
/// Nothing is cached: each call recomputes from the transport, so units that
/// left the relation disappear from the next read.
#[derive(Debug, Clone)]
pub struct Aggregator {
    endpoint: String,
}

impl Aggregator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Requests published in one peer's app bag, in publication order.
    /// Records that fail to convert are logged and skipped.
    pub fn peer_requests<T>(&self, transport: &T, peer: &PeerHandle) -> Result<Vec<ServiceRequest>>
    where
        T: RelationTransport + ?Sized,
    {
        let wire = transport.read_key(peer.relation_id, &peer.app_bag(), ENDPOINTS_KEY)?;
        let records = codec::decode(wire.as_deref())?;

        Ok(records
            .iter()
            .filter_map(|record| match ServiceRequest::from_record(record) {
                Ok(request) => Some(request),
                Err(e) => {
                    tracing::warn!("Skipping request from {}: {}", peer.app, e);
                    None
                }
            })
            .collect())
    }

    /// Service names one peer currently asks for.
    pub fn requested_service_names<T>(
        &self,
        transport: &T,
        peer: &PeerHandle,
    ) -> Result<BTreeSet<String>>
    where
        T: RelationTransport + ?Sized,
    {
        Ok(self
            .peer_requests(transport, peer)?
            .into_iter()
            .map(|r| r.service_name)
            .collect())
    }

    /// Frontend settings per service across all peers. When two peers ask
    /// for the same name, the later peer in transport order wins.
    pub fn collect_frontend_requests<T>(
        &self,
        transport: &T,
    ) -> Result<BTreeMap<String, FrontendRequest>>
    where
        T: RelationTransport + ?Sized,
    {
        let mut requests = BTreeMap::new();
        let mut requested_by: HashMap<String, String> = HashMap::new();

        for peer in transport.peers(&self.endpoint)? {
            for request in self.peer_requests(transport, &peer)? {
                let previous = requested_by.insert(request.service_name.clone(), peer.app.clone());
                if let Some(previous) = previous {
                    if previous != peer.app {
                        tracing::warn!(
                            "Service {} requested by both {} and {}; using {}",
                            request.service_name,
                            previous,
                            peer.app,
                            peer.app
                        );
                    }
                }
                requests.insert(
                    request.service_name,
                    FrontendRequest {
                        frontend_port: request.frontend_port,
                        check_type: request.check_type,
                    },
                );
            }
        }
        Ok(requests)
    }

    /// Backends per service across all units of all peers, ordered by unit name.
    pub fn collect_backend_members<T>(
        &self,
        transport: &T,
    ) -> Result<BTreeMap<String, Vec<BackendMember>>>
    where
        T: RelationTransport + ?Sized,
    {
        let mut members: BTreeMap<String, Vec<BackendMember>> = BTreeMap::new();

        for peer in transport.peers(&self.endpoint)? {
            for unit in peer.sorted_units() {
                let bag = Bag::Unit(unit.to_string());
                let wire = transport.read_key(peer.relation_id, &bag, ENDPOINTS_KEY)?;

                for record in codec::decode(wire.as_deref())? {
                    match BackendRegistration::from_record(&record) {
                        Ok(backend) => {
                            members.entry(backend.service_name).or_default().push(BackendMember {
                                unit_name: unit_slug(unit),
                                backend_ip: backend.backend_ip,
                                backend_port: backend.backend_port,
                            })
                        }
                        Err(e) => tracing::warn!("Skipping backend from {}: {}", unit, e),
                    }
                }
            }
        }

        // Stable, so entries from one unit keep their published order
        for service_members in members.values_mut() {
            service_members.sort_by(|a, b| a.unit_name.cmp(&b.unit_name));
        }
        Ok(members)
    }

    /// Requested services with their current backends. Backends for services
    /// nobody requested are dropped; requests without backends get no members.
    pub fn get_loadbalancer_requests<T>(&self, transport: &T) -> Result<LoadbalancerRequests>
    where
        T: RelationTransport + ?Sized,
    {
        let mut backends = self.collect_backend_members(transport)?;

        let endpoints = self
            .collect_frontend_requests(transport)?
            .into_iter()
            .map(|(name, frontend)| {
                let members = backends.remove(&name).unwrap_or_default();
                let service = AggregatedService {
                    frontend_port: frontend.frontend_port,
                    check_type: frontend.check_type,
                    members,
                };
                (name, service)
            })
            .collect();

        for orphan in backends.keys() {
            tracing::debug!("Ignoring backends for unrequested service {}", orphan);
        }

        Ok(LoadbalancerRequests { endpoints })
    }
}
