//! Seams to the relation-data transport and the leadership oracle.
//!
//! Every connection on a relation endpoint exposes one app bag per side and
//! one bag per unit. A process reads any bag it can see but only writes the
//! bags it owns: its application's bag and its own unit's bag.

use std::collections::BTreeMap;
use crate::error::Result;

/// Key/value data published by one owner on one connection
pub type DataBag = BTreeMap<String, String>;

/// Owner of a data bag on a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bag {
    App(String),
    Unit(String),
}

impl Bag {
    pub fn owner(&self) -> &str {
        match self {
            Bag::App(name) | Bag::Unit(name) => name,
        }
    }
}

/// The remote side of one connection on a relation endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub relation_id: u64,

    /// Remote application name
    pub app: String,

    /// Remote unit names, in whatever order the transport reports them
    pub units: Vec<String>,
}

impl PeerHandle {
    pub fn app_bag(&self) -> Bag {
        Bag::App(self.app.clone())
    }

    /// Remote units ordered by name
    pub fn sorted_units(&self) -> Vec<&str> {
        let mut units: Vec<&str> = self.units.iter().map(String::as_str).collect();
        units.sort_unstable();
        units
    }
}

/// Snapshot access to relation data.
pub trait RelationTransport {
    fn local_app(&self) -> &str;

    fn local_unit(&self) -> &str;

    /// Connections on `endpoint`, in a stable order.
    fn peers(&self, endpoint: &str) -> Result<Vec<PeerHandle>>;

    /// Read a bag. Bags nobody has written yet read as empty.
    fn read(&self, relation_id: u64, bag: &Bag) -> Result<DataBag>;

    /// Write one key of a bag owned by the local app or unit.
    fn write(&mut self, relation_id: u64, bag: &Bag, key: &str, value: &str) -> Result<()>;

    fn read_key(&self, relation_id: u64, bag: &Bag, key: &str) -> Result<Option<String>> {
        Ok(self.read(relation_id, bag)?.remove(key))
    }

    fn local_app_bag(&self) -> Bag {
        Bag::App(self.local_app().to_string())
    }

    fn local_unit_bag(&self) -> Bag {
        Bag::Unit(self.local_unit().to_string())
    }
}

/// Answers whether this process may currently publish application data.
pub trait WriteAuthority {
    fn is_writer(&self) -> bool;
}

impl WriteAuthority for bool {
    fn is_writer(&self) -> bool {
        *self
    }
}
