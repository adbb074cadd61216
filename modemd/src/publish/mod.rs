//! Network records published to the host connection daemon.

use crate::{error::Result, technology::TechnologyType};
use derive_more::Display;

mod table;

pub use table::{NetworkRecord, NetworkTable};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("network{_0}")]
pub struct NetworkId(pub u64);

/// Host-side registry of network records.
///
/// Setters on unknown ids are ignored. Fallible calls return [`crate::Error`].
pub trait NetworkPublisher: 'static + Send + Sync {
    fn register_network_driver(&self, name: &str, kind: TechnologyType) -> Result<()>;

    fn unregister_network_driver(&self, name: &str);

    fn create_network(&self, key: &str, kind: TechnologyType) -> Result<NetworkId>;

    fn set_name(&self, id: NetworkId, name: &str);

    fn set_strength(&self, id: NetworkId, strength: u8);

    fn set_group(&self, id: NetworkId, group: &str);

    fn set_bool(&self, id: NetworkId, key: &str, value: bool);

    fn set_connected(&self, id: NetworkId, connected: bool);

    /// Attaches a created record to the device with the given path.
    fn add_network(&self, device: &str, id: NetworkId) -> Result<()>;

    /// Detaches and drops the record.
    fn remove_network(&self, device: &str, id: NetworkId);

    /// Signals that a batch of setter calls is complete.
    fn update(&self, id: NetworkId) -> Result<()>;
}
