use shared::codec::{self, Record};
use shared::events::{EndpointEvent, RelationEvent};
use shared::hash::content_hash;
use shared::protocol::{
    ADMIN_PARTITION, DEFAULT_CHECK_TYPE, ENDPOINTS_KEY, FRONTENDS_KEY, INTERNAL_PARTITION,
    PUBLIC_PARTITION,
};
use shared::relation::{Bag, RelationTransport, WriteAuthority};
use shared::types::{BackendRegistration, FrontendResponse, PartitionEndpoint, ServiceRequest};
use shared::Result;

/// Everything a requester says about one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadbalancerRequest {
    pub service_name: String,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub backend_ip: String,
    pub check_type: String,
}

impl LoadbalancerRequest {
    pub fn new(
        service_name: impl Into<String>,
        frontend_port: u16,
        backend_port: u16,
        backend_ip: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            frontend_port,
            backend_port,
            backend_ip: backend_ip.into(),
            check_type: DEFAULT_CHECK_TYPE.to_string(),
        }
    }

    pub fn with_check_type(mut self, check_type: impl Into<String>) -> Self {
        self.check_type = check_type.into();
        self
    }

    /// App-scoped half of the request
    pub fn service_request(&self) -> ServiceRequest {
        ServiceRequest {
            service_name: self.service_name.clone(),
            frontend_port: self.frontend_port,
            check_type: self.check_type.clone(),
        }
    }

    /// Unit-scoped half of the request
    pub fn backend(&self) -> BackendRegistration {
        BackendRegistration {
            service_name: self.service_name.clone(),
            backend_port: self.backend_port,
            backend_ip: self.backend_ip.clone(),
        }
    }
}

/// Whether a provider response has been seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseState {
    NoResponse,
    ResponseAvailable { hash: String },
}

/// Requester side of the load balancer relation.
///
/// Holds no relation data of its own; every call reads or writes through
/// the transport it is given. The only state kept between calls is the hash
/// of the last response seen, so `ResponseAvailable` fires once per payload.
#[derive(Debug, Clone)]
pub struct Requirer {
    endpoint: String,
    state: ResponseState,
}

impl Requirer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: ResponseState::NoResponse,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> &ResponseState {
        &self.state
    }

    /// Register or update a load balancer request on every connection.
    ///
    /// The unit bag is always updated, since every unit advertises its own
    /// backend. The app bag is only written with write authority.
    pub fn request_loadbalancer<T>(
        &self,
        transport: &mut T,
        authority: &dyn WriteAuthority,
        request: &LoadbalancerRequest,
    ) -> Result<()>
    where
        T: RelationTransport + ?Sized,
    {
        let app_record = request.service_request().to_record()?;
        let unit_record = request.backend().to_record()?;
        let name = request.service_name.as_str();

        for peer in transport.peers(&self.endpoint)? {
            if authority.is_writer() {
                let bag = transport.local_app_bag();
                update_bag(transport, peer.relation_id, &bag, name, Some(app_record.clone()))?;
            }
            let bag = transport.local_unit_bag();
            update_bag(transport, peer.relation_id, &bag, name, Some(unit_record.clone()))?;

            tracing::debug!(
                "Requested load balancer for {} on relation {}",
                name,
                peer.relation_id
            );
        }
        Ok(())
    }

    /// Remove a service from the app and unit bags on every connection.
    pub fn withdraw_loadbalancer<T>(
        &self,
        transport: &mut T,
        authority: &dyn WriteAuthority,
        service_name: &str,
    ) -> Result<()>
    where
        T: RelationTransport + ?Sized,
    {
        for peer in transport.peers(&self.endpoint)? {
            if authority.is_writer() {
                let bag = transport.local_app_bag();
                update_bag(transport, peer.relation_id, &bag, service_name, None)?;
            }
            let bag = transport.local_unit_bag();
            update_bag(transport, peer.relation_id, &bag, service_name, None)?;
        }
        Ok(())
    }

    /// The first non-empty `frontends` response published by a provider.
    pub fn get_frontend_data<T>(&self, transport: &T) -> Result<Option<FrontendResponse>>
    where
        T: RelationTransport + ?Sized,
    {
        for peer in transport.peers(&self.endpoint)? {
            let wire = transport.read_key(peer.relation_id, &peer.app_bag(), FRONTENDS_KEY)?;
            let response = codec::decode_response(wire.as_deref())?;
            if !response.is_empty() {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Where `service_name` is reachable on `partition`, once the provider says so.
    pub fn get_lb_endpoint<T>(
        &self,
        transport: &T,
        service_name: &str,
        partition: &str,
    ) -> Result<Option<PartitionEndpoint>>
    where
        T: RelationTransport + ?Sized,
    {
        Ok(self
            .get_frontend_data(transport)?
            .and_then(|mut response| response.remove(service_name))
            .and_then(|mut partitions| partitions.remove(partition)))
    }

    pub fn get_lb_public_endpoint<T>(
        &self,
        transport: &T,
        service_name: &str,
    ) -> Result<Option<PartitionEndpoint>>
    where
        T: RelationTransport + ?Sized,
    {
        self.get_lb_endpoint(transport, service_name, PUBLIC_PARTITION)
    }

    pub fn get_lb_internal_endpoint<T>(
        &self,
        transport: &T,
        service_name: &str,
    ) -> Result<Option<PartitionEndpoint>>
    where
        T: RelationTransport + ?Sized,
    {
        self.get_lb_endpoint(transport, service_name, INTERNAL_PARTITION)
    }

    pub fn get_lb_admin_endpoint<T>(
        &self,
        transport: &T,
        service_name: &str,
    ) -> Result<Option<PartitionEndpoint>>
    where
        T: RelationTransport + ?Sized,
    {
        self.get_lb_endpoint(transport, service_name, ADMIN_PARTITION)
    }

    /// React to a relation lifecycle event.
    pub fn handle<T>(&mut self, event: &RelationEvent, transport: &T) -> Result<Vec<EndpointEvent>>
    where
        T: RelationTransport + ?Sized,
    {
        match event {
            RelationEvent::Joined { relation_id } => Ok(vec![EndpointEvent::RelationReady {
                relation_id: *relation_id,
            }]),
            RelationEvent::Changed { .. } | RelationEvent::Departed { .. } => {
                Ok(self.process_response(transport)?.into_iter().collect())
            }
        }
    }

    /// Check for a provider response. Returns `ResponseAvailable` only when
    /// the payload differs from the last one seen.
    pub fn process_response<T>(&mut self, transport: &T) -> Result<Option<EndpointEvent>>
    where
        T: RelationTransport + ?Sized,
    {
        let Some(response) = self.get_frontend_data(transport)? else {
            if self.state != ResponseState::NoResponse {
                tracing::info!("Load balancer response withdrawn");
            }
            self.state = ResponseState::NoResponse;
            return Ok(None);
        };

        let hash = content_hash(&response)?;
        if matches!(&self.state, ResponseState::ResponseAvailable { hash: seen } if *seen == hash) {
            return Ok(None);
        }

        tracing::info!("Load balancer response available for {} services", response.len());
        self.state = ResponseState::ResponseAvailable { hash: hash.clone() };
        Ok(Some(EndpointEvent::ResponseAvailable { hash }))
    }
}

/// Replace the entry for `service_name` in the `endpoints` list of one bag,
/// or drop it when `record` is `None`. Other entries keep their order and
/// the updated entry goes to the end.
fn update_bag<T>(
    transport: &mut T,
    relation_id: u64,
    bag: &Bag,
    service_name: &str,
    record: Option<Record>,
) -> Result<()>
where
    T: RelationTransport + ?Sized,
{
    let existing = transport.read_key(relation_id, bag, ENDPOINTS_KEY)?;
    let mut records = codec::decode(existing.as_deref())?;
    records.retain(|r| codec::record_service_name(r) != Some(service_name));
    records.extend(record);

    let wire = codec::encode(&records)?;
    if existing.as_deref() != Some(wire.as_str()) {
        transport.write(relation_id, bag, ENDPOINTS_KEY, &wire)?;
    }
    Ok(())
}
