use std::path::Path;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use shared::relation::{Bag, DataBag, PeerHandle, RelationTransport};
use shared::EndpointError;

/// Relation data as seen by the provider, persisted in SQLite.
///
/// Remote peers push their bags in through `put_bag`; the provider reads
/// them and writes its own bags through `RelationTransport`.
pub struct RelationDb {
    conn: Connection,
    app: String,
    unit: String,
}

fn transport_err(e: rusqlite::Error) -> EndpointError {
    EndpointError::Transport(e.to_string())
}

fn app_of(unit: &str) -> &str {
    unit.split('/').next().unwrap_or(unit)
}

fn bag_key(bag: &Bag) -> (&'static str, &str) {
    match bag {
        Bag::App(name) => ("app", name),
        Bag::Unit(name) => ("unit", name),
    }
}

impl RelationDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>, app: &str, unit: &str) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS relations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint    TEXT NOT NULL,
                remote_app  TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS relation_units (
                relation_id INTEGER NOT NULL,
                unit        TEXT NOT NULL,
                joined_at   TEXT NOT NULL,
                PRIMARY KEY (relation_id, unit)
            );

            CREATE TABLE IF NOT EXISTS relation_data (
                relation_id INTEGER NOT NULL,
                owner_kind  TEXT NOT NULL,
                owner       TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (relation_id, owner_kind, owner, key)
            );

            CREATE INDEX IF NOT EXISTS idx_relations_endpoint ON relations(endpoint);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self {
            conn,
            app: app.to_string(),
            unit: unit.to_string(),
        })
    }

    /// Register a new connection from `remote_app` on `endpoint`.
    pub fn create_relation(&self, endpoint: &str, remote_app: &str) -> shared::Result<u64> {
        self.conn
            .execute(
                "INSERT INTO relations (endpoint, remote_app, created_at) VALUES (?1, ?2, ?3)",
                params![endpoint, remote_app, Utc::now().to_rfc3339()],
            )
            .map_err(transport_err)?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    /// Endpoint and remote application of a connection
    pub fn relation(&self, relation_id: u64) -> shared::Result<(String, String)> {
        self.conn
            .query_row(
                "SELECT endpoint, remote_app FROM relations WHERE id = ?1",
                params![relation_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(transport_err)?
            .ok_or(EndpointError::UnknownRelation(relation_id))
    }

    /// Remove a connection with all its units and data.
    pub fn remove_relation(&self, relation_id: u64) -> shared::Result<()> {
        self.relation(relation_id)?;
        let id = relation_id as i64;
        self.conn
            .execute("DELETE FROM relation_data WHERE relation_id = ?1", params![id])
            .map_err(transport_err)?;
        self.conn
            .execute("DELETE FROM relation_units WHERE relation_id = ?1", params![id])
            .map_err(transport_err)?;
        self.conn
            .execute("DELETE FROM relations WHERE id = ?1", params![id])
            .map_err(transport_err)?;
        Ok(())
    }

    /// Add a remote unit to a connection. Returns false if already present.
    pub fn join_unit(&self, relation_id: u64, unit: &str) -> shared::Result<bool> {
        self.ensure_remote(relation_id, &Bag::Unit(unit.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO relation_units (relation_id, unit, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![relation_id as i64, unit, Utc::now().to_rfc3339()],
            )
            .map_err(transport_err)?;
        Ok(inserted > 0)
    }

    /// Remove a remote unit and its bag. Returns false if it was not joined.
    pub fn depart_unit(&self, relation_id: u64, unit: &str) -> shared::Result<bool> {
        self.relation(relation_id)?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM relation_units WHERE relation_id = ?1 AND unit = ?2",
                params![relation_id as i64, unit],
            )
            .map_err(transport_err)?;
        self.conn
            .execute(
                "DELETE FROM relation_data
                 WHERE relation_id = ?1 AND owner_kind = 'unit' AND owner = ?2",
                params![relation_id as i64, unit],
            )
            .map_err(transport_err)?;
        Ok(removed > 0)
    }

    /// Store keys pushed by a remote peer. An empty value deletes the key.
    /// Returns true if the bag changed.
    pub fn put_bag(&self, relation_id: u64, bag: &Bag, data: &DataBag) -> shared::Result<bool> {
        self.ensure_remote(relation_id, bag)?;
        let current = self.read(relation_id, bag)?;
        let mut changed = false;

        for (key, value) in data {
            if current.get(key) == Some(value) || (value.is_empty() && !current.contains_key(key)) {
                continue;
            }
            self.store_key(relation_id, bag, key, value)?;
            changed = true;
        }
        Ok(changed)
    }

    /// Bags may only be pushed by the side that owns them.
    fn ensure_remote(&self, relation_id: u64, bag: &Bag) -> shared::Result<()> {
        let (_, remote_app) = self.relation(relation_id)?;
        let owner = match bag {
            Bag::App(name) => name.as_str(),
            Bag::Unit(name) => app_of(name),
        };
        if owner != remote_app {
            return Err(EndpointError::ForeignBag(bag.owner().to_string()));
        }
        Ok(())
    }

    fn store_key(&self, relation_id: u64, bag: &Bag, key: &str, value: &str) -> shared::Result<()> {
        let (kind, owner) = bag_key(bag);
        if value.is_empty() {
            self.conn
                .execute(
                    "DELETE FROM relation_data
                     WHERE relation_id = ?1 AND owner_kind = ?2 AND owner = ?3 AND key = ?4",
                    params![relation_id as i64, kind, owner, key],
                )
                .map_err(transport_err)?;
            return Ok(());
        }

        self.conn
            .execute(
                r#"
                INSERT INTO relation_data (relation_id, owner_kind, owner, key, value, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(relation_id, owner_kind, owner, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![relation_id as i64, kind, owner, key, value, Utc::now().to_rfc3339()],
            )
            .map_err(transport_err)?;
        Ok(())
    }

    fn units(&self, relation_id: u64) -> shared::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT unit FROM relation_units WHERE relation_id = ?1 ORDER BY rowid")
            .map_err(transport_err)?;
        let units = stmt
            .query_map(params![relation_id as i64], |row| row.get(0))
            .map_err(transport_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(transport_err)?;
        Ok(units)
    }
}

impl RelationTransport for RelationDb {
    fn local_app(&self) -> &str {
        &self.app
    }

    fn local_unit(&self) -> &str {
        &self.unit
    }

    fn peers(&self, endpoint: &str) -> shared::Result<Vec<PeerHandle>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, remote_app FROM relations WHERE endpoint = ?1 ORDER BY id")
            .map_err(transport_err)?;
        let relations = stmt
            .query_map(params![endpoint], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })
            .map_err(transport_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(transport_err)?;

        relations
            .into_iter()
            .map(|(relation_id, app)| {
                Ok(PeerHandle {
                    relation_id,
                    app,
                    units: self.units(relation_id)?,
                })
            })
            .collect()
    }

    fn read(&self, relation_id: u64, bag: &Bag) -> shared::Result<DataBag> {
        self.relation(relation_id)?;
        let (kind, owner) = bag_key(bag);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key, value FROM relation_data
                 WHERE relation_id = ?1 AND owner_kind = ?2 AND owner = ?3",
            )
            .map_err(transport_err)?;
        let data = stmt
            .query_map(params![relation_id as i64, kind, owner], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(transport_err)?
            .collect::<Result<DataBag, _>>()
            .map_err(transport_err)?;
        Ok(data)
    }

    fn write(&mut self, relation_id: u64, bag: &Bag, key: &str, value: &str) -> shared::Result<()> {
        let owned = match bag {
            Bag::App(name) => *name == self.app,
            Bag::Unit(name) => *name == self.unit,
        };
        if !owned {
            return Err(EndpointError::ForeignBag(bag.owner().to_string()));
        }
        self.relation(relation_id)?;
        self.store_key(relation_id, bag, key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> RelationDb {
        RelationDb::open(":memory:", "openstack-loadbalancer", "openstack-loadbalancer/0").unwrap()
    }

    fn bag(entries: &[(&str, &str)]) -> DataBag {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_create_and_list_peers() {
        let db = test_db();
        let glance = db.create_relation("loadbalancer", "glance").unwrap();
        let dash = db.create_relation("loadbalancer", "ceph-dashboard").unwrap();
        db.create_relation("ha", "hacluster").unwrap();
        db.join_unit(dash, "ceph-dashboard/1").unwrap();
        db.join_unit(dash, "ceph-dashboard/0").unwrap();

        let peers = db.peers("loadbalancer").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].relation_id, glance);
        assert_eq!(peers[1].app, "ceph-dashboard");
        assert_eq!(peers[1].units, vec!["ceph-dashboard/1", "ceph-dashboard/0"]);
    }

    #[test]
    fn test_put_bag_detects_changes() {
        let db = test_db();
        let id = db.create_relation("loadbalancer", "glance").unwrap();
        let app = Bag::App("glance".to_string());

        assert!(db.put_bag(id, &app, &bag(&[("endpoints", "[]")])).unwrap());
        assert!(!db.put_bag(id, &app, &bag(&[("endpoints", "[]")])).unwrap());
        assert!(db.put_bag(id, &app, &bag(&[("endpoints", "[1]")])).unwrap());

        assert_eq!(db.read_key(id, &app, "endpoints").unwrap(), Some("[1]".to_string()));

        // Empty value removes the key
        assert!(db.put_bag(id, &app, &bag(&[("endpoints", "")])).unwrap());
        assert!(db.read(id, &app).unwrap().is_empty());
        assert!(!db.put_bag(id, &app, &bag(&[("endpoints", "")])).unwrap());
    }

    #[test]
    fn test_put_bag_rejects_foreign_owner() {
        let db = test_db();
        let id = db.create_relation("loadbalancer", "glance").unwrap();

        let err = db
            .put_bag(
                id,
                &Bag::App("openstack-loadbalancer".to_string()),
                &bag(&[("frontends", "{}")]),
            )
            .unwrap_err();
        assert!(matches!(err, EndpointError::ForeignBag(_)));

        let err = db
            .put_bag(id, &Bag::Unit("nova/0".to_string()), &bag(&[("endpoints", "[]")]))
            .unwrap_err();
        assert!(matches!(err, EndpointError::ForeignBag(_)));
    }

    #[test]
    fn test_local_write_and_ownership() {
        let mut db = test_db();
        let id = db.create_relation("loadbalancer", "glance").unwrap();
        let local = db.local_app_bag();

        db.write(id, &local, "frontends", "{}").unwrap();
        assert_eq!(db.read_key(id, &local, "frontends").unwrap(), Some("{}".to_string()));

        assert!(matches!(
            db.write(id, &Bag::App("glance".to_string()), "endpoints", "[]"),
            Err(EndpointError::ForeignBag(_))
        ));
        assert!(matches!(
            db.write(99, &local, "frontends", "{}"),
            Err(EndpointError::UnknownRelation(99))
        ));
    }

    #[test]
    fn test_depart_unit_removes_bag() {
        let db = test_db();
        let id = db.create_relation("loadbalancer", "glance").unwrap();
        let unit = Bag::Unit("glance/0".to_string());
        db.join_unit(id, "glance/0").unwrap();
        db.put_bag(id, &unit, &bag(&[("endpoints", "[]")])).unwrap();

        assert!(db.depart_unit(id, "glance/0").unwrap());
        assert!(db.read(id, &unit).unwrap().is_empty());
        assert!(db.peers("loadbalancer").unwrap()[0].units.is_empty());
        assert!(!db.depart_unit(id, "glance/0").unwrap());
    }

    #[test]
    fn test_remove_relation() {
        let db = test_db();
        let id = db.create_relation("loadbalancer", "glance").unwrap();
        db.join_unit(id, "glance/0").unwrap();

        db.remove_relation(id).unwrap();
        assert!(db.peers("loadbalancer").unwrap().is_empty());
        assert!(matches!(db.relation(id), Err(EndpointError::UnknownRelation(_))));
    }
}
