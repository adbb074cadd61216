//! The modem control service, seen through an async trait so the session machinery can
//! be driven by [`mmcli::MmcliTransport`] in production and by fakes in tests.

use crate::session::{ModemDevice, ModemProperties, PropertyUpdate};
use async_trait::async_trait;
use color_eyre::Result;
use derive_more::Display;

pub mod mmcli;

/// Opaque per-session handle issued by the transport when a modem is opened.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
pub struct TransportHandle(String);

impl TransportHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransportHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub apn: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ServiceAppeared,
    ServiceVanished,
    DeviceAdded(ModemDevice),
    DeviceRemoved(String),
    Signal(Signal),
}

/// Unsolicited notification about an opened modem.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub handle: TransportHandle,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    Property(PropertyUpdate),
    State { online: bool },
    /// Access technology changed.
    Technology(Option<String>),
}

#[async_trait]
pub trait ModemTransport: 'static + Send + Sync {
    /// Starts watching for service availability, devices and signals.
    async fn watch(&self) -> Result<flume::Receiver<TransportEvent>>;

    /// Maps a device onto the service-side object path. `None` means the service does
    /// not know about the device.
    async fn resolve_path(&self, device: &ModemDevice) -> Result<Option<String>>;

    async fn open(&self, transport_path: &str) -> Result<TransportHandle>;

    async fn properties(&self, handle: &TransportHandle) -> Result<ModemProperties>;

    async fn connect(
        &self,
        handle: &TransportHandle,
        credentials: &Credentials,
    ) -> Result<()>;

    async fn disconnect(&self, handle: &TransportHandle) -> Result<()>;

    /// Best effort. Called when a session goes away while the service is still up.
    async fn release(&self, handle: &TransportHandle) -> Result<()>;
}
