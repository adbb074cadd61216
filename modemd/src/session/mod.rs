//! Per-modem session state machine.
//!
//! A [`ModemSession`] is a plain value: it never performs I/O on its own. The
//! [`crate::manager::SessionManager`] drives it by calling the `begin_*` methods,
//! performing the transport call with no lock held, and then feeding the outcome back
//! through the matching `finish_*` method together with the [`Ticket`] it was handed.
//! A ticket is only honored while the session is still in the in-flight state it was
//! issued for and has not been closed since.

use crate::{
    error::{Error, Result},
    provisioning::{ServiceConfig, ServiceConfigStore},
    publish::NetworkPublisher,
    transport::{Credentials, TransportHandle},
};
use derive_more::Display;
use std::sync::Arc;
use tracing::{debug, info, warn};

mod attachment;
mod telemetry;

pub use attachment::NetworkAttachment;
pub use telemetry::{display_name, group_ident, strength_from_quality, Refresh, Telemetry};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[display("discovered")]
    Discovered,
    #[display("opening")]
    Opening,
    #[display("opened")]
    Opened,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("disconnecting")]
    Disconnecting,
    #[display("closed")]
    Closed,
}

/// Physical identity of a modem as reported by device discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModemDevice {
    /// Stable device path, e.g. `/dev/cdc-wdm0`. Used as the registry key.
    pub path: String,
    /// Network interface carrying the data bearer, e.g. `wwan0`.
    pub interface: String,
    pub ifindex: u32,
}

/// Snapshot of everything the transport reports about an opened modem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModemProperties {
    pub imsi: Option<String>,
    /// Equipment identifier (IMEI).
    pub serial: Option<String>,
    pub operator_name: Option<String>,
    pub mcc: Option<String>,
    pub mnc: Option<String>,
    /// Radio Access Technology -- e.g.: gsm, lte
    pub access_tech: Option<String>,
    /// Raw quality metric (RSRQ, dB).
    pub quality: Option<f64>,
    pub roaming: bool,
    pub online: bool,
}

/// A single property change pushed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyUpdate {
    Quality(f64),
    Roaming(bool),
    OperatorName(Option<String>),
    Mcc(Option<String>),
    Mnc(Option<String>),
    AccessTech(Option<String>),
    Imsi(Option<String>),
    Serial(Option<String>),
}

/// What to do with the connected flag when a disconnect is requested.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DisconnectPolicy {
    /// Clear the flag as soon as the request is issued. The session returns to
    /// `Opened` whatever the transport replies.
    #[display("optimistic")]
    Optimistic,
    /// Clear the flag only once the transport confirms. A failed disconnect leaves
    /// the session `Connected`.
    #[default]
    #[display("confirmed")]
    Confirmed,
}

/// Proof that a request was issued against a specific incarnation of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    epoch: u64,
}

/// Leftovers of a session that was just closed, for the caller to clean up.
#[derive(Debug)]
pub struct Closed {
    pub handle: Option<TransportHandle>,
    pub interface: String,
    pub was_connected: bool,
}

#[derive(Debug)]
pub struct ModemSession {
    device: ModemDevice,
    transport_path: Option<String>,
    state: SessionState,
    epoch: u64,
    handle: Option<TransportHandle>,
    telemetry: Telemetry,
    config: ServiceConfig,
    powered: bool,
    connected: bool,
    attachment: Option<NetworkAttachment>,
}

impl ModemSession {
    /// A session without a `transport_path` is kept around but is never opened.
    pub fn new(device: ModemDevice, transport_path: Option<String>) -> Self {
        Self {
            device,
            transport_path,
            state: SessionState::Discovered,
            epoch: 0,
            handle: None,
            telemetry: Telemetry::default(),
            config: ServiceConfig::default(),
            powered: false,
            connected: false,
            attachment: None,
        }
    }

    pub fn device(&self) -> &ModemDevice {
        &self.device
    }

    pub fn path(&self) -> &str {
        &self.device.path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_usable(&self) -> bool {
        self.transport_path.is_some()
    }

    /// Waiting for the worker to open it.
    pub fn is_pending(&self) -> bool {
        self.state == SessionState::Discovered && self.is_usable()
    }

    pub fn handle(&self) -> Option<&TransportHandle> {
        self.handle.as_ref()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn attachment(&self) -> Option<&NetworkAttachment> {
        self.attachment.as_ref()
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn set_powered(&mut self, powered: bool) {
        self.powered = powered;
    }

    pub fn set_online(&mut self, online: bool) {
        if self.telemetry.online != online {
            debug!(path = %self.device.path, online, "modem online state changed");
            self.telemetry.online = online;
        }
    }

    fn ticket(&self) -> Ticket {
        Ticket { epoch: self.epoch }
    }

    /// Whether a completion carrying `ticket` may still be applied.
    pub fn is_current(&self, ticket: Ticket, state: SessionState) -> bool {
        self.epoch == ticket.epoch && self.state == state
    }

    fn invalid(&self, op: &'static str) -> Error {
        Error::InvalidState {
            op,
            state: self.state,
        }
    }

    /// Discovered -> Opening. Returns the transport path to open.
    pub fn begin_open(&mut self) -> Result<(Ticket, String)> {
        if self.state != SessionState::Discovered {
            return Err(self.invalid("open"));
        }

        let transport_path = self
            .transport_path
            .clone()
            .ok_or_else(|| Error::PathUnresolved(self.device.path.clone()))?;

        self.state = SessionState::Opening;

        Ok((self.ticket(), transport_path))
    }

    /// Records the handle returned by a successful open request.
    pub fn handle_acquired(&mut self, ticket: Ticket, handle: TransportHandle) -> bool {
        if !self.is_current(ticket, SessionState::Opening) {
            return false;
        }

        self.handle = Some(handle);
        true
    }

    /// Opening -> Discovered. Hands back the handle, if one was already acquired, so
    /// the caller can release it.
    pub fn open_failed(&mut self, ticket: Ticket) -> Option<TransportHandle> {
        if !self.is_current(ticket, SessionState::Opening) {
            return None;
        }

        self.state = SessionState::Discovered;
        self.handle.take()
    }

    /// Opening -> Opened. Publishes the network attachment and snapshots the
    /// provisioned service config for it.
    pub fn finish_open(
        &mut self,
        ticket: Ticket,
        properties: ModemProperties,
        publisher: &Arc<dyn NetworkPublisher>,
        provisioning: &dyn ServiceConfigStore,
    ) -> Result<()> {
        if !self.is_current(ticket, SessionState::Opening) || self.handle.is_none() {
            return Err(Error::Cancelled);
        }

        let mut telemetry = self.telemetry.clone();
        telemetry.apply_properties(properties);

        let attachment = NetworkAttachment::create(
            Arc::clone(publisher),
            &self.device.path,
            &telemetry,
        )?;

        self.config = provisioning
            .lookup_config_for_network(attachment.group())
            .unwrap_or_default();

        info!(
            path = %self.device.path,
            group = attachment.group(),
            name = %telemetry.display_name(),
            "modem opened"
        );

        self.telemetry = telemetry;
        self.attachment = Some(attachment);
        self.state = SessionState::Opened;

        Ok(())
    }

    /// Opened -> Connecting. Falls back to the provisioned credentials when none are
    /// given.
    pub fn begin_connect(
        &mut self,
        credentials: Option<Credentials>,
    ) -> Result<(Ticket, TransportHandle, Credentials)> {
        if self.state != SessionState::Opened {
            return Err(self.invalid("connect"));
        }

        let handle = self.handle.clone().ok_or_else(|| self.invalid("connect"))?;
        let credentials = credentials.unwrap_or_else(|| self.config.credentials());
        self.state = SessionState::Connecting;

        Ok((self.ticket(), handle, credentials))
    }

    /// Connecting -> Connected on success, back to Opened on failure.
    pub fn finish_connect(&mut self, ticket: Ticket, result: Result<()>) -> Result<()> {
        if !self.is_current(ticket, SessionState::Connecting) {
            return Err(Error::Cancelled);
        }

        match result {
            Ok(()) => {
                self.state = SessionState::Connected;
                self.set_connected(true);
                info!(path = %self.device.path, "modem connected");

                Ok(())
            }

            Err(e) => {
                self.state = SessionState::Opened;
                self.set_connected(false);
                warn!(path = %self.device.path, "modem connect failed: {e}");

                Err(e)
            }
        }
    }

    /// Connected -> Disconnecting.
    pub fn begin_disconnect(
        &mut self,
        policy: DisconnectPolicy,
    ) -> Result<(Ticket, TransportHandle)> {
        if self.state != SessionState::Connected {
            return Err(self.invalid("disconnect"));
        }

        let handle = self
            .handle
            .clone()
            .ok_or_else(|| self.invalid("disconnect"))?;

        self.state = SessionState::Disconnecting;

        if policy == DisconnectPolicy::Optimistic {
            self.set_connected(false);
        }

        Ok((self.ticket(), handle))
    }

    /// Disconnecting -> Opened, or back to Connected when a confirmed disconnect fails.
    pub fn finish_disconnect(
        &mut self,
        ticket: Ticket,
        policy: DisconnectPolicy,
        result: Result<()>,
    ) -> Result<()> {
        if !self.is_current(ticket, SessionState::Disconnecting) {
            return Err(Error::Cancelled);
        }

        match (result, policy) {
            (Ok(()), _) => {
                self.state = SessionState::Opened;
                self.set_connected(false);
                info!(path = %self.device.path, "modem disconnected");

                Ok(())
            }

            (Err(e), DisconnectPolicy::Optimistic) => {
                self.state = SessionState::Opened;
                warn!(
                    path = %self.device.path,
                    "modem disconnect failed, flag already cleared: {e}"
                );

                Err(e)
            }

            (Err(e), DisconnectPolicy::Confirmed) => {
                self.state = SessionState::Connected;
                warn!(
                    path = %self.device.path,
                    "modem disconnect failed, still connected: {e}"
                );

                Err(e)
            }
        }
    }

    /// Applies a pushed property change and propagates it to the attachment.
    pub fn receive_property_update(&mut self, update: PropertyUpdate) -> Result<Refresh> {
        if self.handle.is_none() {
            return Err(self.invalid("update properties"));
        }

        let refresh = self.telemetry.apply(update);

        if let Some(attachment) = &mut self.attachment {
            attachment.refresh(refresh, &self.telemetry);
        }

        Ok(refresh)
    }

    /// Any state -> Closed. Returns `None` when the session was already closed.
    pub fn close(&mut self) -> Option<Closed> {
        if self.state == SessionState::Closed {
            return None;
        }

        // An optimistic disconnect has already released the connection.
        let was_connected = self.connected;
        self.connected = false;

        self.epoch += 1;

        if let Some(attachment) = self.attachment.take() {
            attachment.teardown();
        }

        let handle = self.handle.take();
        self.state = SessionState::Closed;
        self.telemetry.online = false;

        info!(path = %self.device.path, "modem session closed");

        Some(Closed {
            handle,
            interface: self.device.interface.clone(),
            was_connected,
        })
    }

    /// Closed -> Discovered, so the worker picks the session up again once the
    /// transport is back.
    pub fn reset(&mut self) -> bool {
        if self.state != SessionState::Closed {
            return false;
        }

        self.state = SessionState::Discovered;
        true
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;

        if let Some(attachment) = &self.attachment {
            attachment.set_connected(connected);
        }
    }
}
