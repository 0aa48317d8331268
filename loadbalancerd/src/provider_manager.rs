use std::thread;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use shared::events::{EndpointEvent, RelationEvent};
use shared::protocol::HA_ENDPOINT;
use shared::relation::{Bag, DataBag, RelationTransport};
use shared::types::{FrontendResponse, LoadbalancerRequests, PublishOutcome};
use shared::EndpointError;
use crate::ha::HaResources;
use crate::network::PartitionVips;
use crate::provider::Provider;
use crate::store::RelationDb;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("provider thread is not running")]
    Unavailable,
}

/// How the control thread reacts to relation changes
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub leader: bool,
    pub respond_automatically: bool,
    pub vips: PartitionVips,
    /// Resources to hand the HA subordinate, if clustering is enabled
    pub ha: Option<HaResources>,
}

type Reply<T> = oneshot::Sender<shared::Result<T>>;

/// Readiness announced for one service on one partition
#[derive(Debug, Clone)]
pub struct Readiness {
    pub service_name: String,
    pub partition: String,
    pub addresses: Vec<String>,
    pub port: u16,
    pub protocol: String,
}

/// Commands sent to the provider thread
pub enum ProviderCommand {
    Requests(Reply<LoadbalancerRequests>),
    Ready(Readiness, Reply<()>),
    ReadyServices(Reply<FrontendResponse>),
    Advertise(Reply<PublishOutcome>),
    CreateRelation {
        endpoint: String,
        remote_app: String,
        reply: Reply<u64>,
    },
    RemoveRelation(u64, Reply<()>),
    JoinUnit(u64, String, Reply<bool>),
    DepartUnit(u64, String, Reply<bool>),
    PeerData {
        relation_id: u64,
        bag: Bag,
        data: DataBag,
        reply: Reply<bool>,
    },
    ReadBag(u64, Bag, Reply<DataBag>),
    Shutdown,
}

/// Handle to the thread owning the relation store and readiness record
#[derive(Clone)]
pub struct ProviderHandle {
    tx: mpsc::Sender<ProviderCommand>,
}

struct Worker {
    db: RelationDb,
    provider: Provider,
    settings: ProviderSettings,
    hash_tx: watch::Sender<String>,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::Receiver<ProviderCommand>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                ProviderCommand::Requests(reply) => {
                    let _ = reply.send(self.provider.get_loadbalancer_requests(&self.db));
                }
                ProviderCommand::Ready(r, reply) => {
                    self.provider.loadbalancer_ready(
                        &r.service_name,
                        &r.partition,
                        r.addresses,
                        r.port,
                        &r.protocol,
                    );
                    let _ = reply.send(Ok(()));
                }
                ProviderCommand::ReadyServices(reply) => {
                    let _ = reply.send(Ok(self.provider.readiness().services().clone()));
                }
                ProviderCommand::Advertise(reply) => {
                    let result = self.provider.prune_withdrawn(&self.db).and_then(|_| {
                        self.provider
                            .advertise_loadbalancers(&mut self.db, &self.settings.leader)
                    });
                    let _ = reply.send(result);
                }
                ProviderCommand::CreateRelation { endpoint, remote_app, reply } => {
                    let result = self.db.create_relation(&endpoint, &remote_app);
                    if let Ok(relation_id) = result {
                        tracing::info!(
                            "Relation {} joined on {} by {}",
                            relation_id,
                            endpoint,
                            remote_app
                        );
                        self.after_change(&endpoint, RelationEvent::Joined { relation_id });
                    }
                    let _ = reply.send(result);
                }
                ProviderCommand::RemoveRelation(relation_id, reply) => {
                    let result = self.db.relation(relation_id).and_then(|(endpoint, _)| {
                        self.db.remove_relation(relation_id)?;
                        Ok(endpoint)
                    });
                    let result = result.map(|endpoint| {
                        tracing::info!("Relation {} broken", relation_id);
                        self.after_change(&endpoint, RelationEvent::Changed { relation_id });
                    });
                    let _ = reply.send(result);
                }
                ProviderCommand::JoinUnit(relation_id, unit, reply) => {
                    let result = self.db.join_unit(relation_id, &unit);
                    if matches!(&result, Ok(true)) {
                        self.after_relation_change(RelationEvent::Changed { relation_id });
                    }
                    let _ = reply.send(result);
                }
                ProviderCommand::DepartUnit(relation_id, unit, reply) => {
                    let result = self.db.depart_unit(relation_id, &unit);
                    if matches!(&result, Ok(true)) {
                        self.after_relation_change(RelationEvent::Departed { relation_id, unit });
                    }
                    let _ = reply.send(result);
                }
                ProviderCommand::PeerData { relation_id, bag, data, reply } => {
                    let result = self.db.put_bag(relation_id, &bag, &data);
                    // Only recompute when a peer actually changed something
                    if matches!(&result, Ok(true)) {
                        self.after_relation_change(RelationEvent::Changed { relation_id });
                    }
                    let _ = reply.send(result);
                }
                ProviderCommand::ReadBag(relation_id, bag, reply) => {
                    let _ = reply.send(self.db.read(relation_id, &bag));
                }
                ProviderCommand::Shutdown => {
                    tracing::info!("Provider thread shutting down");
                    break;
                }
            }
        }
    }

    fn after_relation_change(&mut self, event: RelationEvent) {
        match self.db.relation(event.relation_id()) {
            Ok((endpoint, _)) => self.after_change(&endpoint, event),
            Err(e) => tracing::error!("Failed to look up relation {}: {}", event.relation_id(), e),
        }
    }

    fn after_change(&mut self, endpoint: &str, event: RelationEvent) {
        let result = if endpoint == self.provider.aggregator().endpoint() {
            self.on_loadbalancer_change(&event)
        } else if endpoint == HA_ENDPOINT {
            self.on_ha_change()
        } else {
            Ok(())
        };
        if let Err(e) = result {
            tracing::error!("Failed to process change on relation {}: {}", event.relation_id(), e);
        }
    }

    fn on_loadbalancer_change(&mut self, event: &RelationEvent) -> shared::Result<()> {
        for event in self.provider.handle(event, &self.db)? {
            if let EndpointEvent::RequestsChanged { hash } = event {
                let _ = self.hash_tx.send(hash);
            }
        }

        // The aggregate does not record which peer asked for what, so a
        // peer can change its requests without moving the hash.
        if self.settings.respond_automatically {
            let outcome = self.provider.send_loadbalancer_response(
                &mut self.db,
                &self.settings.leader,
                &self.settings.vips,
            )?;
            tracing::debug!("Automatic response: {:?}", outcome);
        }
        Ok(())
    }

    fn on_ha_change(&mut self) -> shared::Result<()> {
        if let Some(ha) = &self.settings.ha {
            ha.bind_resources(&mut self.db, HA_ENDPOINT)?;
        }
        Ok(())
    }
}

impl ProviderHandle {
    /// Spawn the provider thread. `hash_tx` receives the aggregated request
    /// hash every time it changes.
    pub fn spawn(
        db: RelationDb,
        provider: Provider,
        settings: ProviderSettings,
        hash_tx: watch::Sender<String>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ProviderCommand>(256);

        let worker = Worker {
            db,
            provider,
            settings,
            hash_tx,
        };
        thread::spawn(move || worker.run(rx));

        Self { tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> ProviderCommand,
    ) -> Result<T, ProviderError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| ProviderError::Unavailable)?;
        Ok(rx.await.map_err(|_| ProviderError::Unavailable)??)
    }

    /// Aggregated requests across every connected peer
    pub async fn requests(&self) -> Result<LoadbalancerRequests, ProviderError> {
        self.request(ProviderCommand::Requests).await
    }

    pub async fn ready(&self, readiness: Readiness) -> Result<(), ProviderError> {
        self.request(|reply| ProviderCommand::Ready(readiness, reply)).await
    }

    /// Everything marked ready so far, whether or not it was published
    pub async fn ready_services(&self) -> Result<FrontendResponse, ProviderError> {
        self.request(ProviderCommand::ReadyServices).await
    }

    /// Drop readiness for withdrawn services and publish the rest
    pub async fn advertise(&self) -> Result<PublishOutcome, ProviderError> {
        self.request(ProviderCommand::Advertise).await
    }

    pub async fn create_relation(
        &self,
        endpoint: String,
        remote_app: String,
    ) -> Result<u64, ProviderError> {
        self.request(|reply| ProviderCommand::CreateRelation {
            endpoint,
            remote_app,
            reply,
        })
        .await
    }

    pub async fn remove_relation(&self, relation_id: u64) -> Result<(), ProviderError> {
        self.request(|reply| ProviderCommand::RemoveRelation(relation_id, reply)).await
    }

    pub async fn join_unit(&self, relation_id: u64, unit: String) -> Result<bool, ProviderError> {
        self.request(|reply| ProviderCommand::JoinUnit(relation_id, unit, reply)).await
    }

    pub async fn depart_unit(&self, relation_id: u64, unit: String) -> Result<bool, ProviderError> {
        self.request(|reply| ProviderCommand::DepartUnit(relation_id, unit, reply)).await
    }

    /// Store data pushed by a peer. Returns true if anything changed.
    pub async fn peer_data(
        &self,
        relation_id: u64,
        bag: Bag,
        data: DataBag,
    ) -> Result<bool, ProviderError> {
        self.request(|reply| ProviderCommand::PeerData {
            relation_id,
            bag,
            data,
            reply,
        })
        .await
    }

    pub async fn read_bag(&self, relation_id: u64, bag: Bag) -> Result<DataBag, ProviderError> {
        self.request(|reply| ProviderCommand::ReadBag(relation_id, bag, reply)).await
    }

    /// Shutdown the provider thread
    pub async fn shutdown(&self) -> Result<(), ProviderError> {
        self.tx
            .send(ProviderCommand::Shutdown)
            .await
            .map_err(|_| ProviderError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use shared::protocol::{FRONTENDS_KEY, LOADBALANCER_ENDPOINT};

    const LB: &str = "openstack-loadbalancer";

    fn spawn(settings: ProviderSettings) -> (ProviderHandle, watch::Receiver<String>) {
        let db = RelationDb::open(":memory:", LB, "openstack-loadbalancer/0").unwrap();
        let (hash_tx, hash_rx) = watch::channel(String::new());
        let provider = Provider::new(LOADBALANCER_ENDPOINT);
        let handle = ProviderHandle::spawn(db, provider, settings, hash_tx);
        (handle, hash_rx)
    }

    fn leader_settings() -> ProviderSettings {
        ProviderSettings {
            leader: true,
            respond_automatically: true,
            vips: BTreeMap::from([("public".to_string(), vec!["10.20.0.100".to_string()])]),
            ha: None,
        }
    }

    async fn publish(handle: &ProviderHandle, id: u64, bag: Bag, endpoints: &str) -> bool {
        let data = DataBag::from([("endpoints".to_string(), endpoints.to_string())]);
        handle.peer_data(id, bag, data).await.unwrap()
    }

    async fn register_glance(handle: &ProviderHandle) -> u64 {
        let id = handle
            .create_relation(LOADBALANCER_ENDPOINT.to_string(), "glance".to_string())
            .await
            .unwrap();
        handle.join_unit(id, "glance/0".to_string()).await.unwrap();
        publish(
            handle,
            id,
            Bag::App("glance".to_string()),
            r#"[{"check-type": "http", "frontend-port": 9292, "service-name": "glance-api"}]"#,
        )
        .await;
        publish(
            handle,
            id,
            Bag::Unit("glance/0".to_string()),
            r#"[{"backend-ip": "10.0.0.50", "backend-port": 9292, "service-name": "glance-api"}]"#,
        )
        .await;
        id
    }

    async fn frontends(handle: &ProviderHandle, id: u64) -> serde_json::Value {
        let bag = handle.read_bag(id, Bag::App(LB.to_string())).await.unwrap();
        serde_json::from_str(&bag[FRONTENDS_KEY]).unwrap()
    }

    #[tokio::test]
    async fn test_requests_and_hash_updates() {
        let (handle, hash_rx) = spawn(ProviderSettings::default());
        register_glance(&handle).await;

        let requests = handle.requests().await.unwrap();
        let glance = &requests.endpoints["glance-api"];
        assert_eq!(glance.frontend_port, 9292);
        assert_eq!(glance.members.len(), 1);
        assert_eq!(glance.members[0].unit_name, "glance_0");

        let expected = shared::hash::content_hash(&requests).unwrap();
        assert_eq!(*hash_rx.borrow(), expected);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_automatic_response() {
        let (handle, _hash_rx) = spawn(leader_settings());
        let id = register_glance(&handle).await;

        assert_eq!(
            frontends(&handle, id).await,
            serde_json::json!({"glance-api": {"public": {
                "ip": ["10.20.0.100"], "port": 9292, "protocol": "http"
            }}})
        );
    }

    #[tokio::test]
    async fn test_identical_request_from_second_peer_is_answered() {
        let (handle, hash_rx) = spawn(leader_settings());
        let svc = r#"[{"check-type": "http", "frontend-port": 80, "service-name": "svc"}]"#;

        let mut ids = Vec::new();
        for app in ["alpha", "beta"] {
            let id = handle
                .create_relation(LOADBALANCER_ENDPOINT.to_string(), app.to_string())
                .await
                .unwrap();
            publish(&handle, id, Bag::App(app.to_string()), svc).await;
            ids.push(id);
        }
        let (alpha, beta) = (ids[0], ids[1]);

        // beta's request leaves the aggregate untouched
        let hash = hash_rx.borrow().clone();
        assert!(frontends(&handle, alpha).await.get("svc").is_some());
        assert!(frontends(&handle, beta).await.get("svc").is_some());

        // Withdrawing from beta must clear beta's slot but not alpha's
        assert!(publish(&handle, beta, Bag::App("beta".to_string()), "").await);
        assert_eq!(*hash_rx.borrow(), hash);
        assert_eq!(frontends(&handle, beta).await, serde_json::json!({}));
        assert!(frontends(&handle, alpha).await.get("svc").is_some());
    }

    #[tokio::test]
    async fn test_manual_ready_and_advertise() {
        let settings = ProviderSettings {
            respond_automatically: false,
            ..leader_settings()
        };
        let (handle, _hash_rx) = spawn(settings);
        let id = register_glance(&handle).await;

        let lb_bag = Bag::App(LB.to_string());
        assert!(handle.read_bag(id, lb_bag.clone()).await.unwrap().is_empty());

        handle
            .ready(Readiness {
                service_name: "glance-api".to_string(),
                partition: "internal".to_string(),
                addresses: vec!["10.30.0.100".to_string()],
                port: 9292,
                protocol: "http".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(handle.advertise().await.unwrap(), PublishOutcome::Published { peers: 1 });

        let bag = handle.read_bag(id, lb_bag).await.unwrap();
        assert!(bag[FRONTENDS_KEY].contains("10.30.0.100"));
    }

    #[tokio::test]
    async fn test_follower_does_not_publish() {
        let settings = ProviderSettings {
            leader: false,
            ..leader_settings()
        };
        let (handle, _hash_rx) = spawn(settings);
        let id = register_glance(&handle).await;

        assert_eq!(handle.advertise().await.unwrap(), PublishOutcome::NotWriter);
        assert!(handle.read_bag(id, Bag::App(LB.to_string())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unit_departure_drops_backend() {
        let (handle, _hash_rx) = spawn(ProviderSettings::default());
        let id = register_glance(&handle).await;

        assert!(handle.depart_unit(id, "glance/0".to_string()).await.unwrap());
        let requests = handle.requests().await.unwrap();
        assert!(requests.endpoints["glance-api"].members.is_empty());

        handle.remove_relation(id).await.unwrap();
        assert!(handle.requests().await.unwrap().endpoints.is_empty());
        assert!(matches!(
            handle.read_bag(id, Bag::App("glance".to_string())).await,
            Err(ProviderError::Endpoint(EndpointError::UnknownRelation(_)))
        ));
    }

    #[tokio::test]
    async fn test_ha_resources_bound_on_join() {
        let mut ha = HaResources::new();
        ha.add_init_service(LB, "haproxy");
        let settings = ProviderSettings {
            ha: Some(ha),
            ..ProviderSettings::default()
        };
        let (handle, _hash_rx) = spawn(settings);

        let id = handle
            .create_relation(HA_ENDPOINT.to_string(), "hacluster".to_string())
            .await
            .unwrap();
        let bag = handle
            .read_bag(id, Bag::Unit("openstack-loadbalancer/0".to_string()))
            .await
            .unwrap();
        assert_eq!(bag["json_init_services"], "[\"haproxy\"]");
    }

    #[tokio::test]
    async fn test_unavailable_after_shutdown() {
        let (handle, _hash_rx) = spawn(ProviderSettings::default());
        handle.shutdown().await.unwrap();
        assert!(matches!(handle.requests().await, Err(ProviderError::Unavailable)));
    }
}
