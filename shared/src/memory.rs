//! In-process relation transport.
//!
//! `MemoryRelations` holds every connection and bag; `MemoryTransport` is the
//! view one unit has of it. Views of both sides share the same state, so a
//! requester and a provider can talk to each other in one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use crate::error::{EndpointError, Result};
use crate::relation::{Bag, DataBag, PeerHandle, RelationTransport};

#[derive(Debug)]
struct Relation {
    endpoint: String,
    apps: [String; 2],
    /// Units of both sides, in join order
    units: Vec<String>,
    bags: HashMap<Bag, DataBag>,
}

impl Relation {
    fn remote_app(&self, local_app: &str) -> Option<&str> {
        match &self.apps {
            [a, b] if a == local_app => Some(b.as_str()),
            [a, b] if b == local_app => Some(a.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct World {
    next_id: u64,
    relations: BTreeMap<u64, Relation>,
}

/// Shared relation state
#[derive(Debug, Clone, Default)]
pub struct MemoryRelations {
    inner: Arc<Mutex<World>>,
}

fn app_of(unit: &str) -> &str {
    unit.split('/').next().unwrap_or(unit)
}

impl MemoryRelations {
    pub fn new() -> Self {
        Self::default()
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect two applications on `endpoint`. Returns the relation id.
    pub fn relate(&self, endpoint: &str, app_a: &str, app_b: &str) -> u64 {
        let mut world = self.world();
        world.next_id += 1;
        let id = world.next_id;
        world.relations.insert(
            id,
            Relation {
                endpoint: endpoint.to_string(),
                apps: [app_a.to_string(), app_b.to_string()],
                units: Vec::new(),
                bags: HashMap::new(),
            },
        );
        id
    }

    pub fn add_unit(&self, relation_id: u64, unit: &str) -> Result<()> {
        let mut world = self.world();
        let relation = world
            .relations
            .get_mut(&relation_id)
            .ok_or(EndpointError::UnknownRelation(relation_id))?;
        if !relation.units.iter().any(|u| u == unit) {
            relation.units.push(unit.to_string());
        }
        Ok(())
    }

    /// Remove a unit from a connection. Its bag goes with it.
    pub fn remove_unit(&self, relation_id: u64, unit: &str) -> Result<()> {
        let mut world = self.world();
        let relation = world
            .relations
            .get_mut(&relation_id)
            .ok_or(EndpointError::UnknownRelation(relation_id))?;
        relation.units.retain(|u| u != unit);
        relation.bags.remove(&Bag::Unit(unit.to_string()));
        Ok(())
    }

    pub fn remove_relation(&self, relation_id: u64) -> Result<()> {
        self.world()
            .relations
            .remove(&relation_id)
            .map(|_| ())
            .ok_or(EndpointError::UnknownRelation(relation_id))
    }

    /// Write a key into any bag, bypassing ownership checks.
    pub fn set(&self, relation_id: u64, bag: Bag, key: &str, value: &str) -> Result<()> {
        let mut world = self.world();
        let relation = world
            .relations
            .get_mut(&relation_id)
            .ok_or(EndpointError::UnknownRelation(relation_id))?;
        relation
            .bags
            .entry(bag)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, relation_id: u64, bag: &Bag, key: &str) -> Option<String> {
        self.world()
            .relations
            .get(&relation_id)
            .and_then(|r| r.bags.get(bag))
            .and_then(|b| b.get(key).cloned())
    }

    /// The relations as seen by `unit` of application `app`.
    pub fn view(&self, app: &str, unit: &str) -> MemoryTransport {
        MemoryTransport {
            relations: self.clone(),
            app: app.to_string(),
            unit: unit.to_string(),
        }
    }
}

/// One unit's view of `MemoryRelations`
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    relations: MemoryRelations,
    app: String,
    unit: String,
}

impl RelationTransport for MemoryTransport {
    fn local_app(&self) -> &str {
        &self.app
    }

    fn local_unit(&self) -> &str {
        &self.unit
    }

    fn peers(&self, endpoint: &str) -> Result<Vec<PeerHandle>> {
        let world = self.relations.world();
        let peers = world
            .relations
            .iter()
            .filter(|(_, r)| r.endpoint == endpoint)
            .filter_map(|(id, r)| {
                let remote = r.remote_app(&self.app)?;
                Some(PeerHandle {
                    relation_id: *id,
                    app: remote.to_string(),
                    units: r
                        .units
                        .iter()
                        .filter(|u| app_of(u) == remote)
                        .cloned()
                        .collect(),
                })
            })
            .collect();
        Ok(peers)
    }

    fn read(&self, relation_id: u64, bag: &Bag) -> Result<DataBag> {
        let world = self.relations.world();
        let relation = world
            .relations
            .get(&relation_id)
            .filter(|r| r.remote_app(&self.app).is_some())
            .ok_or(EndpointError::UnknownRelation(relation_id))?;
        Ok(relation.bags.get(bag).cloned().unwrap_or_default())
    }

    fn write(&mut self, relation_id: u64, bag: &Bag, key: &str, value: &str) -> Result<()> {
        let owned = match bag {
            Bag::App(name) => *name == self.app,
            Bag::Unit(name) => *name == self.unit,
        };
        if !owned {
            return Err(EndpointError::ForeignBag(bag.owner().to_string()));
        }

        let mut world = self.relations.world();
        let relation = world
            .relations
            .get_mut(&relation_id)
            .filter(|r| r.remote_app(&self.app).is_some())
            .ok_or(EndpointError::UnknownRelation(relation_id))?;
        relation
            .bags
            .entry(bag.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
