use super::{NetworkId, NetworkPublisher};
use crate::{
    error::{Error, Result},
    technology::TechnologyType,
};
use dashmap::DashMap;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub id: NetworkId,
    pub key: String,
    pub kind: TechnologyType,
    pub device: Option<String>,
    pub name: String,
    pub strength: u8,
    pub group: String,
    pub connected: bool,
    pub flags: BTreeMap<String, bool>,
    pub updates: u32,
}

/// In-process [`NetworkPublisher`]. The daemon binary uses it as its network list.
#[derive(Debug, Default)]
pub struct NetworkTable {
    drivers: DashMap<String, TechnologyType>,
    records: DashMap<NetworkId, NetworkRecord>,
    next_id: AtomicU64,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NetworkId) -> Option<NetworkRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// All records, ordered by id.
    pub fn records(&self) -> Vec<NetworkRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.id);

        records
    }

    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.iter().map(|d| d.key().clone()).collect();
        names.sort();

        names
    }

    fn with_record(&self, id: NetworkId, f: impl FnOnce(&mut NetworkRecord)) {
        match self.records.get_mut(&id) {
            Some(mut record) => f(&mut record),
            None => trace!(%id, "ignoring update for unknown network"),
        }
    }
}

impl NetworkPublisher for NetworkTable {
    fn register_network_driver(&self, name: &str, kind: TechnologyType) -> Result<()> {
        if self.drivers.contains_key(name) {
            return Err(Error::AlreadyExists(format!("network driver {name}")));
        }

        debug!(name, %kind, "network driver registered");
        self.drivers.insert(name.to_string(), kind);

        Ok(())
    }

    fn unregister_network_driver(&self, name: &str) {
        if self.drivers.remove(name).is_some() {
            debug!(name, "network driver unregistered");
        }
    }

    fn create_network(&self, key: &str, kind: TechnologyType) -> Result<NetworkId> {
        if !self.drivers.iter().any(|d| *d.value() == kind) {
            return Err(Error::NotFound(format!("network driver for {kind}")));
        }

        let id = NetworkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records.insert(
            id,
            NetworkRecord {
                id,
                key: key.to_string(),
                kind,
                device: None,
                name: String::new(),
                strength: 0,
                group: String::new(),
                connected: false,
                flags: BTreeMap::new(),
                updates: 0,
            },
        );

        Ok(id)
    }

    fn set_name(&self, id: NetworkId, name: &str) {
        self.with_record(id, |r| r.name = name.to_string());
    }

    fn set_strength(&self, id: NetworkId, strength: u8) {
        self.with_record(id, |r| r.strength = strength);
    }

    fn set_group(&self, id: NetworkId, group: &str) {
        self.with_record(id, |r| r.group = group.to_string());
    }

    fn set_bool(&self, id: NetworkId, key: &str, value: bool) {
        self.with_record(id, |r| {
            r.flags.insert(key.to_string(), value);
        });
    }

    fn set_connected(&self, id: NetworkId, connected: bool) {
        self.with_record(id, |r| r.connected = connected);
    }

    fn add_network(&self, device: &str, id: NetworkId) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if record.device.is_some() {
            return Err(Error::AlreadyExists(id.to_string()));
        }

        record.device = Some(device.to_string());

        Ok(())
    }

    fn remove_network(&self, device: &str, id: NetworkId) {
        if self.records.remove(&id).is_some() {
            debug!(device, %id, "network removed");
        }
    }

    fn update(&self, id: NetworkId) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.updates += 1;

        Ok(())
    }
}
