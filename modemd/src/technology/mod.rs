//! Radio technologies: one per type while a driver for that type is registered.
//!
//! A technology aggregates the devices and rfkill switches of its type, persists the
//! user's power choice, and mediates power requests, tethering and offline mode.
//! All state lives behind a single async lock. Device and driver callbacks are awaited
//! with that lock held, so they must not call back into the manager; asynchronous
//! outcomes are reported afterwards through [`TechnologyManager::notify_powered`] and
//! [`TechnologyManager::tethering_notify`].

use crate::{
    error::{Error, Result},
    settings::SettingsStore,
};
use bon::bon;
use derive_more::Display;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{oneshot, Mutex},
    time,
};
use tracing::{debug, info, warn};

mod driver;
mod rfkill;
mod store;

pub use driver::{TechDevice, TechnologyDriver};
pub use rfkill::{RfkillCli, RfkillControl, RfkillEvent, RfkillSwitch};

const MAX_IDENTIFIER_LEN: usize = 32;
const PASSPHRASE_LEN: std::ops::RangeInclusive<usize> = 8..=63;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TechnologyType {
    #[display("ethernet")]
    Ethernet,
    #[display("wifi")]
    Wifi,
    #[display("bluetooth")]
    Bluetooth,
    #[display("cellular")]
    Cellular,
    #[display("gps")]
    Gps,
    #[display("vpn")]
    Vpn,
    #[display("gadget")]
    Gadget,
}

impl TechnologyType {
    /// Human readable name, also the settings group.
    pub fn name(self) -> &'static str {
        match self {
            TechnologyType::Ethernet => "Wired",
            TechnologyType::Wifi => "WiFi",
            TechnologyType::Bluetooth => "Bluetooth",
            TechnologyType::Cellular => "Cellular",
            TechnologyType::Gps => "GPS",
            TechnologyType::Vpn => "VPN",
            TechnologyType::Gadget => "Gadget",
        }
    }

    pub fn rfkill_type(self) -> Option<&'static str> {
        match self {
            TechnologyType::Wifi => Some("wlan"),
            TechnologyType::Bluetooth => Some("bluetooth"),
            TechnologyType::Cellular => Some("wwan"),
            TechnologyType::Gps => Some("gps"),
            _ => None,
        }
    }

    pub fn from_rfkill_type(rfkill_type: &str) -> Option<Self> {
        match rfkill_type {
            "wlan" => Some(TechnologyType::Wifi),
            "bluetooth" => Some(TechnologyType::Bluetooth),
            "wwan" => Some(TechnologyType::Cellular),
            "gps" => Some(TechnologyType::Gps),
            _ => None,
        }
    }
}

/// Outcome of a power or tethering toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Done,
    /// Completes later.
    InProgress,
    /// Already in the requested state.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBinding {
    Bound,
    /// No driver for the device's type yet. Bound once one registers.
    Parked,
}

#[derive(Debug)]
pub enum PowerOutcome {
    Done,
    InProgress(PowerRequest),
}

/// An asynchronous power change that is still in flight.
#[derive(Debug)]
pub struct PowerRequest {
    rx: oneshot::Receiver<Result<()>>,
}

impl PowerRequest {
    /// Resolves once the technology reaches the requested state, or with
    /// [`Error::Timeout`], or with [`Error::Cancelled`] if the technology went away.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TechnologyInfo {
    pub kind: TechnologyType,
    pub name: &'static str,
    pub powered: bool,
    pub enable_persistent: bool,
    pub connected: bool,
    pub tethering: bool,
    pub tethering_identifier: Option<String>,
    pub tethering_passphrase: Option<String>,
    pub registered: bool,
    pub rfkill_driven: bool,
    pub softblocked: bool,
    pub hardblocked: bool,
    pub devices: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TechnologyProperty {
    Powered(bool),
    Connected(bool),
    Tethering(bool),
    TetheringIdentifier(String),
    TetheringPassphrase(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TechnologyEvent {
    Added(TechnologyInfo),
    Removed(TechnologyType),
    Changed {
        kind: TechnologyType,
        property: TechnologyProperty,
    },
}

struct Pending {
    id: u64,
    tx: oneshot::Sender<Result<()>>,
}

struct Technology {
    kind: TechnologyType,
    drivers: Vec<Arc<dyn TechnologyDriver>>,
    devices: Vec<Arc<dyn TechDevice>>,
    rfkills: BTreeSet<u32>,
    enabled: bool,
    enable_persistent: bool,
    connected: bool,
    tethering: bool,
    tethering_identifier: Option<String>,
    tethering_passphrase: Option<String>,
    registered: bool,
    rfkill_driven: bool,
    softblocked: bool,
    hardblocked: bool,
    pending: Option<Pending>,
}

impl Technology {
    fn new(kind: TechnologyType, drivers: Vec<Arc<dyn TechnologyDriver>>) -> Self {
        Self {
            kind,
            drivers,
            devices: Vec::new(),
            rfkills: BTreeSet::new(),
            enabled: false,
            enable_persistent: false,
            connected: false,
            tethering: false,
            tethering_identifier: None,
            tethering_passphrase: None,
            registered: false,
            rfkill_driven: false,
            softblocked: false,
            hardblocked: false,
            pending: None,
        }
    }

    fn is_hidden(&self) -> bool {
        self.rfkill_driven && self.hardblocked
    }

    fn is_unused(&self) -> bool {
        self.devices.is_empty() && self.rfkills.is_empty()
    }

    fn info(&self) -> TechnologyInfo {
        TechnologyInfo {
            kind: self.kind,
            name: self.kind.name(),
            powered: self.enabled,
            enable_persistent: self.enable_persistent,
            connected: self.connected,
            tethering: self.tethering,
            tethering_identifier: self.tethering_identifier.clone(),
            tethering_passphrase: self.tethering_passphrase.clone(),
            registered: self.registered,
            rfkill_driven: self.rfkill_driven,
            softblocked: self.softblocked,
            hardblocked: self.hardblocked,
            devices: self.devices.len(),
        }
    }
}

#[derive(Default)]
struct Techs {
    technologies: BTreeMap<TechnologyType, Technology>,
    /// Sorted by descending priority.
    drivers: Vec<Arc<dyn TechnologyDriver>>,
    /// Devices whose type has no driver yet.
    techless: Vec<Arc<dyn TechDevice>>,
    /// Every known switch, including those of types without a technology.
    rfkills: HashMap<u32, RfkillSwitch>,
    offline_mode: bool,
    next_request: u64,
}

impl Techs {
    fn get_mut(&mut self, kind: TechnologyType) -> Result<&mut Technology> {
        self.technologies
            .get_mut(&kind)
            .ok_or_else(|| Error::NotFound(format!("{kind} technology")))
    }

    fn hardblocks(&self, kind: TechnologyType) -> Vec<bool> {
        self.rfkills
            .values()
            .filter(|r| r.kind == kind)
            .map(|r| r.hardblocked)
            .collect()
    }
}

struct Inner {
    state: Mutex<Techs>,
    settings: Arc<dyn SettingsStore>,
    rfkill: Arc<dyn RfkillControl>,
    events_tx: flume::Sender<TechnologyEvent>,
    events_rx: flume::Receiver<TechnologyEvent>,
    power_timeout: Duration,
    tethering_bridge: Option<String>,
}

#[derive(Clone)]
pub struct TechnologyManager {
    inner: Arc<Inner>,
}

#[bon]
impl TechnologyManager {
    /// Restores the persisted offline mode.
    #[builder(finish_fn = init)]
    pub async fn new(
        settings: Arc<dyn SettingsStore>,
        rfkill: Arc<dyn RfkillControl>,
        #[builder(default = Duration::from_secs(10))] power_timeout: Duration,
        tethering_bridge: Option<String>,
    ) -> Self {
        let offline_mode = store::load_offline_mode(settings.as_ref()).await;
        store::save_offline_mode(settings.as_ref(), offline_mode).await;
        info!("offline mode is {}", if offline_mode { "on" } else { "off" });

        let (events_tx, events_rx) = flume::unbounded();
        let techs = Techs {
            offline_mode,
            ..Default::default()
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(techs),
                settings,
                rfkill,
                events_tx,
                events_rx,
                power_timeout,
                tethering_bridge,
            }),
        }
    }
}

impl TechnologyManager {
    /// Technology change notifications.
    pub fn events(&self) -> flume::Receiver<TechnologyEvent> {
        self.inner.events_rx.clone()
    }

    /// Visible technologies. Hardblocked rfkill-driven ones are hidden.
    pub async fn list(&self) -> Vec<TechnologyInfo> {
        let techs = self.inner.state.lock().await;

        techs
            .technologies
            .values()
            .filter(|t| t.registered && !t.is_hidden())
            .map(Technology::info)
            .collect()
    }

    pub async fn info(&self, kind: TechnologyType) -> Option<TechnologyInfo> {
        let techs = self.inner.state.lock().await;

        techs.technologies.get(&kind).map(Technology::info)
    }

    pub async fn offline_mode(&self) -> bool {
        self.inner.state.lock().await.offline_mode
    }

    /// Returns the technology of `kind`, creating it if a driver supports the type.
    pub async fn get_or_create(&self, kind: TechnologyType) -> Result<TechnologyInfo> {
        let mut techs = self.inner.state.lock().await;
        if !self.inner.technology_get(&mut techs, kind).await {
            return Err(Error::NotFound(format!("driver for {kind}")));
        }

        Ok(techs.get_mut(kind)?.info())
    }

    pub async fn register_driver(&self, driver: Arc<dyn TechnologyDriver>) {
        let mut techs = self.inner.state.lock().await;
        let kind = driver.kind();
        info!("registering technology driver {} for {kind}", driver.name());

        let pos = techs
            .drivers
            .iter()
            .position(|d| d.priority() < driver.priority())
            .unwrap_or(techs.drivers.len());
        techs.drivers.insert(pos, driver);

        let (claimed, parked): (Vec<_>, Vec<_>) = std::mem::take(&mut techs.techless)
            .into_iter()
            .partition(|d| d.kind() == kind);
        techs.techless = parked;

        for device in claimed {
            debug!("binding parked device {}", device.ident());
            if let Err(e) = self.inner.bind_device(&mut techs, device).await {
                warn!("failed to bind parked device: {e}");
            }
        }

        let orphans: Vec<_> = techs
            .rfkills
            .values()
            .filter(|r| r.kind == kind)
            .copied()
            .collect();

        for switch in orphans {
            if let Err(e) = self.inner.bind_rfkill(&mut techs, switch, false).await {
                warn!("failed to bind rfkill switch {}: {e}", switch.index);
            }
        }
    }

    pub async fn unregister_driver(&self, name: &str) {
        let mut techs = self.inner.state.lock().await;

        for tech in techs.technologies.values_mut() {
            if let Some(pos) = tech.drivers.iter().position(|d| d.name() == name) {
                let driver = tech.drivers.remove(pos);
                driver.remove(tech.kind);
            }
        }

        techs.drivers.retain(|d| d.name() != name);
        info!("technology driver {name} unregistered");
    }

    /// Binds a device to its technology, or parks it until a driver for its type
    /// registers.
    pub async fn add_device(&self, device: Arc<dyn TechDevice>) -> Result<DeviceBinding> {
        let mut techs = self.inner.state.lock().await;

        self.inner.bind_device(&mut techs, device).await
    }

    /// Unbinds a device. The technology is destroyed with its last device and switch.
    pub async fn remove_device(&self, ident: &str) -> Result<()> {
        let mut techs = self.inner.state.lock().await;

        let found = techs.technologies.values_mut().find_map(|tech| {
            let pos = tech.devices.iter().position(|d| d.ident() == ident)?;
            tech.devices.remove(pos);
            Some(tech.kind)
        });

        match found {
            Some(kind) => {
                debug!("device {ident} removed from {kind}");
                self.inner.put(&mut techs, kind);
                Ok(())
            }

            None => {
                let before = techs.techless.len();
                techs.techless.retain(|d| d.ident() != ident);
                if techs.techless.len() == before {
                    return Err(Error::NotFound(ident.to_string()));
                }

                Ok(())
            }
        }
    }

    /// Powers a technology on or off and persists the choice.
    ///
    /// [`PowerOutcome::InProgress`] resolves when a device reports back through
    /// [`Self::notify_powered`], or with [`Error::Timeout`] after the power timeout.
    pub async fn set_powered(
        &self,
        kind: TechnologyType,
        powered: bool,
    ) -> Result<PowerOutcome> {
        let mut techs = self.inner.state.lock().await;
        techs.next_request += 1;
        let id = techs.next_request;
        let tech = techs.get_mut(kind)?;

        if tech.is_hidden() {
            return Err(Error::AccessDenied);
        }

        let result = if powered {
            self.inner.enable(tech).await
        } else {
            self.inner.disable(tech).await
        };

        if !matches!(result, Err(Error::Busy)) {
            tech.enable_persistent = powered;
            store::save(self.inner.settings.as_ref(), tech).await;
        }

        match result? {
            Toggle::InProgress => {
                let (tx, rx) = oneshot::channel();
                tech.pending = Some(Pending { id, tx });
                self.spawn_power_timeout(kind, id);

                Ok(PowerOutcome::InProgress(PowerRequest { rx }))
            }

            Toggle::Done | Toggle::Unchanged => Ok(PowerOutcome::Done),
        }
    }

    /// A device of `kind` finished powering on or off.
    ///
    /// The technology only counts as disabled once none of its devices is powered.
    /// Ignored for rfkill-driven technologies, whose state follows their switches.
    pub async fn notify_powered(
        &self,
        kind: TechnologyType,
        powered: bool,
    ) -> Result<()> {
        let mut techs = self.inner.state.lock().await;
        let tech = techs.get_mut(kind)?;

        if tech.rfkill_driven {
            return Ok(());
        }

        if powered {
            self.inner.technology_enabled(tech);
        } else if !tech.devices.iter().any(|d| d.is_powered()) {
            self.inner.technology_disabled(tech);
        }

        Ok(())
    }

    pub async fn add_rfkill(&self, switch: RfkillSwitch) -> Result<()> {
        let mut techs = self.inner.state.lock().await;

        let new = !techs.rfkills.contains_key(&switch.index);
        if new {
            techs.rfkills.insert(switch.index, switch);
        }

        self.inner.bind_rfkill(&mut techs, switch, new).await
    }

    pub async fn update_rfkill(&self, switch: RfkillSwitch) -> Result<()> {
        let mut techs = self.inner.state.lock().await;

        let Some(known) = techs.rfkills.get_mut(&switch.index) else {
            return Err(Error::NotFound(format!("rfkill switch {}", switch.index)));
        };

        if known.softblocked == switch.softblocked
            && known.hardblocked == switch.hardblocked
        {
            return Ok(());
        }

        known.softblocked = switch.softblocked;
        known.hardblocked = switch.hardblocked;

        let offline = techs.offline_mode;
        let hardblocks = techs.hardblocks(switch.kind);
        let tech = techs.get_mut(switch.kind)?;

        let hardblocked = self
            .inner
            .apply_rfkill_change(
                tech,
                &hardblocks,
                switch.softblocked,
                switch.hardblocked,
                false,
            )
            .await;

        if hardblocked || offline {
            return Ok(());
        }

        self.inner.sync_softblock(tech).await;

        Ok(())
    }

    pub async fn remove_rfkill(&self, index: u32, kind: TechnologyType) -> Result<()> {
        let mut techs = self.inner.state.lock().await;

        if techs.rfkills.remove(&index).is_none() {
            return Err(Error::NotFound(format!("rfkill switch {index}")));
        }

        let hardblocks = techs.hardblocks(kind);
        let tech = techs.get_mut(kind)?;
        tech.rfkills.remove(&index);

        if tech.rfkills.is_empty() {
            tech.rfkill_driven = false;
        }

        // the remaining switches of the type decide, none left means unblocked
        let hard = !hardblocks.is_empty() && hardblocks.iter().all(|h| *h);
        let soft = tech.softblocked;
        self.inner
            .apply_rfkill_change(tech, &hardblocks, soft, hard, false)
            .await;

        self.inner.put(&mut techs, kind);

        Ok(())
    }

    /// Disables every technology, or re-enables those persisted as enabled.
    /// On failure the persisted offline mode is restored.
    pub async fn set_offline_mode(&self, offline: bool) -> Result<()> {
        let mut techs = self.inner.state.lock().await;

        if techs.offline_mode == offline {
            return Ok(());
        }

        info!("offline mode {}", if offline { "on" } else { "off" });
        techs.offline_mode = offline;

        let mut failure = None;
        for tech in techs.technologies.values_mut() {
            let result = if offline {
                self.inner.disable(tech).await
            } else if tech.enable_persistent {
                self.inner.enable(tech).await
            } else {
                continue;
            };

            match result {
                Ok(_) | Err(Error::AlreadyEnabled) | Err(Error::AlreadyDisabled) => {}
                Err(e) => {
                    warn!("failed to toggle {} for offline mode: {e}", tech.kind);
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            None => {
                store::save_offline_mode(self.inner.settings.as_ref(), offline).await;
                Ok(())
            }

            Some(e) => {
                techs.offline_mode =
                    store::load_offline_mode(self.inner.settings.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Records whether any service of the technology is connected.
    pub async fn set_connected(
        &self,
        kind: TechnologyType,
        connected: bool,
    ) -> Result<()> {
        let mut techs = self.inner.state.lock().await;
        let tech = techs.get_mut(kind)?;

        if tech.connected != connected {
            tech.connected = connected;
            self.inner.property_changed(tech, TechnologyProperty::Connected(connected));
        }

        Ok(())
    }

    pub async fn set_tethering(
        &self,
        kind: TechnologyType,
        enabled: bool,
    ) -> Result<Toggle> {
        let mut techs = self.inner.state.lock().await;
        let tech = techs.get_mut(kind)?;

        if tech.tethering == enabled {
            return Err(if enabled {
                Error::AlreadyEnabled
            } else {
                Error::AlreadyDisabled
            });
        }

        self.inner.set_tethering(tech, enabled).await
    }

    /// A driver finished switching tethering on or off.
    pub async fn tethering_notify(
        &self,
        kind: TechnologyType,
        enabled: bool,
    ) -> Result<()> {
        let mut techs = self.inner.state.lock().await;
        let tech = techs.get_mut(kind)?;
        self.inner.tethering_changed(tech, enabled);

        let any = techs.technologies.values().any(|t| t.tethering);
        debug!("tethering active on any technology: {any}");

        Ok(())
    }

    /// WiFi only. 1 to 32 characters.
    pub async fn set_tethering_identifier(
        &self,
        kind: TechnologyType,
        identifier: &str,
    ) -> Result<()> {
        if kind != TechnologyType::Wifi {
            return Err(Error::NotSupported);
        }

        if identifier.is_empty() || identifier.chars().count() > MAX_IDENTIFIER_LEN {
            return Err(Error::InvalidArguments(format!(
                "tethering identifier must be 1 to {MAX_IDENTIFIER_LEN} characters"
            )));
        }

        let mut techs = self.inner.state.lock().await;
        let tech = techs.get_mut(kind)?;

        if tech.tethering_identifier.as_deref() != Some(identifier) {
            tech.tethering_identifier = Some(identifier.to_string());
            store::save(self.inner.settings.as_ref(), tech).await;
            self.inner.property_changed(
                tech,
                TechnologyProperty::TetheringIdentifier(identifier.to_string()),
            );
        }

        Ok(())
    }

    /// WiFi only. 8 to 63 characters.
    pub async fn set_tethering_passphrase(
        &self,
        kind: TechnologyType,
        passphrase: &str,
    ) -> Result<()> {
        if kind != TechnologyType::Wifi {
            return Err(Error::NotSupported);
        }

        if !PASSPHRASE_LEN.contains(&passphrase.chars().count()) {
            return Err(Error::PassphraseRequired);
        }

        let mut techs = self.inner.state.lock().await;
        let tech = techs.get_mut(kind)?;

        if tech.tethering_passphrase.as_deref() != Some(passphrase) {
            tech.tethering_passphrase = Some(passphrase.to_string());
            store::save(self.inner.settings.as_ref(), tech).await;
            self.inner.property_changed(
                tech,
                TechnologyProperty::TetheringPassphrase(passphrase.to_string()),
            );
        }

        Ok(())
    }

    fn spawn_power_timeout(&self, kind: TechnologyType, id: u64) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.power_timeout;

        tokio::spawn(async move {
            time::sleep(timeout).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };

            let mut techs = inner.state.lock().await;
            let Some(tech) = techs.technologies.get_mut(&kind) else {
                return;
            };

            if tech.pending.as_ref().is_some_and(|p| p.id == id) {
                if let Some(pending) = tech.pending.take() {
                    warn!("power request for {kind} timed out");
                    let _ = pending.tx.send(Err(Error::Timeout));
                }
            }
        });
    }
}

impl Inner {
    fn emit(&self, event: TechnologyEvent) {
        let _ = self.events_tx.send(event);
    }

    fn property_changed(&self, tech: &Technology, property: TechnologyProperty) {
        if tech.registered {
            self.emit(TechnologyEvent::Changed {
                kind: tech.kind,
                property,
            });
        }
    }

    fn register(&self, tech: &mut Technology) {
        if tech.registered || tech.is_hidden() {
            return;
        }

        tech.registered = true;
        debug!("{} technology registered", tech.kind);
        self.emit(TechnologyEvent::Added(tech.info()));
    }

    fn unregister(&self, tech: &mut Technology) {
        if !tech.registered {
            return;
        }

        tech.registered = false;
        debug!("{} technology unregistered", tech.kind);
        self.emit(TechnologyEvent::Removed(tech.kind));
    }

    fn powered_changed(&self, tech: &mut Technology) {
        if let Some(pending) = tech.pending.take() {
            let _ = pending.tx.send(Ok(()));
        }

        self.property_changed(tech, TechnologyProperty::Powered(tech.enabled));
    }

    fn technology_enabled(&self, tech: &mut Technology) -> bool {
        if tech.enabled {
            return false;
        }

        tech.enabled = true;
        info!("{} enabled", tech.kind);
        self.powered_changed(tech);

        true
    }

    fn technology_disabled(&self, tech: &mut Technology) -> bool {
        if !tech.enabled {
            return false;
        }

        tech.enabled = false;
        info!("{} disabled", tech.kind);
        self.powered_changed(tech);

        true
    }

    fn tethering_changed(&self, tech: &mut Technology, enabled: bool) {
        if tech.tethering == enabled {
            return;
        }

        tech.tethering = enabled;
        self.property_changed(tech, TechnologyProperty::Tethering(enabled));
    }

    /// Finds or creates the technology for `kind`. Returns false when no driver
    /// supports the type.
    async fn technology_get(&self, techs: &mut Techs, kind: TechnologyType) -> bool {
        if techs.technologies.contains_key(&kind) {
            return true;
        }

        let drivers: Vec<_> = techs
            .drivers
            .iter()
            .filter(|d| d.kind() == kind)
            .cloned()
            .collect();

        if drivers.is_empty() {
            debug!("no technology driver for {kind}");
            return false;
        }

        let mut tech = Technology::new(kind, drivers);
        store::load(self.settings.as_ref(), &mut tech).await;
        self.register(&mut tech);

        for driver in &tech.drivers {
            if let Err(e) = driver.probe(kind) {
                warn!("technology driver {} failed to probe {kind}: {e}", driver.name());
            }
        }

        techs.technologies.insert(kind, tech);

        true
    }

    /// Destroys the technology once nothing references it. A pending power request
    /// is dropped and resolves as cancelled.
    fn put(&self, techs: &mut Techs, kind: TechnologyType) {
        let unused = techs
            .technologies
            .get(&kind)
            .is_some_and(Technology::is_unused);

        if !unused {
            return;
        }

        if let Some(mut tech) = techs.technologies.remove(&kind) {
            for driver in &tech.drivers {
                driver.remove(kind);
            }

            self.unregister(&mut tech);
            info!("{kind} technology destroyed");
        }
    }

    async fn bind_device(
        &self,
        techs: &mut Techs,
        device: Arc<dyn TechDevice>,
    ) -> Result<DeviceBinding> {
        let kind = device.kind();

        if !self.technology_get(techs, kind).await {
            info!("parking device {} until a {kind} driver registers", device.ident());
            techs.techless.push(device);
            return Ok(DeviceBinding::Parked);
        }

        let offline = techs.offline_mode;
        let tech = techs.get_mut(kind)?;

        if tech.devices.iter().any(|d| d.ident() == device.ident()) {
            return Err(Error::AlreadyExists(device.ident().to_string()));
        }

        if tech.rfkill_driven {
            let result = if tech.enabled {
                device.enable().await
            } else {
                device.disable().await
            };

            if let Err(e) = result {
                warn!("failed to sync device {} with {kind}: {e}", device.ident());
            }
        } else if tech.enable_persistent && !offline {
            match device.enable().await {
                Ok(Toggle::Done | Toggle::Unchanged) => {
                    self.technology_enabled(tech);
                }
                Ok(Toggle::InProgress) => {}
                Err(e) => warn!("failed to enable device {}: {e}", device.ident()),
            }
        } else if !tech.enable_persistent {
            if let Err(e) = device.disable().await {
                warn!("failed to disable device {}: {e}", device.ident());
            }
        }

        debug!("device {} bound to {kind}", device.ident());
        tech.devices.push(device);

        Ok(DeviceBinding::Bound)
    }

    async fn bind_rfkill(
        &self,
        techs: &mut Techs,
        switch: RfkillSwitch,
        new_rfkill: bool,
    ) -> Result<()> {
        if !self.technology_get(techs, switch.kind).await {
            debug!("rfkill switch {} has no technology yet", switch.index);
            return Err(Error::NotFound(format!("{} technology", switch.kind)));
        }

        let offline = techs.offline_mode;
        let hardblocks = techs.hardblocks(switch.kind);
        let tech = techs.get_mut(switch.kind)?;
        tech.rfkills.insert(switch.index);
        tech.rfkill_driven = true;

        let hardblocked = self
            .apply_rfkill_change(
                tech,
                &hardblocks,
                switch.softblocked,
                switch.hardblocked,
                new_rfkill,
            )
            .await;

        if hardblocked {
            return Ok(());
        }

        if tech.softblocked && !offline && tech.enable_persistent {
            self.block(tech.kind, false).await;
        } else if !tech.softblocked && (offline || !tech.enable_persistent) {
            self.block(tech.kind, true).await;
        }

        Ok(())
    }

    /// Brings the softblock in line with the persisted power choice.
    async fn sync_softblock(&self, tech: &Technology) {
        if tech.softblocked && tech.enable_persistent {
            self.block(tech.kind, false).await;
        } else if !tech.softblocked && !tech.enable_persistent {
            self.block(tech.kind, true).await;
        }
    }

    async fn block(&self, kind: TechnologyType, blocked: bool) {
        if let Err(e) = self.rfkill.block(kind, blocked).await {
            warn!("failed to {} {kind}: {e}", if blocked { "block" } else { "unblock" });
        }
    }

    /// Applies a switch change to the technology and returns whether it is
    /// hardblocked afterwards.
    ///
    /// A hardblock change only takes effect when every switch of the type agrees
    /// with it, except for a newly added switch that is not hardblocked.
    async fn apply_rfkill_change(
        &self,
        tech: &mut Technology,
        hardblocks: &[bool],
        softblock: bool,
        hardblock: bool,
        new_rfkill: bool,
    ) -> bool {
        let mut hardblock_changed = false;
        let mut apply = true;

        if tech.hardblocked != hardblock {
            let unanimous = hardblocks.iter().all(|h| *h == hardblock);
            if !(new_rfkill && !hardblock) && !unanimous {
                apply = false;
            }

            if apply {
                tech.hardblocked = hardblock;
                hardblock_changed = true;
            }
        }

        if !apply && tech.softblocked != softblock {
            apply = true;
        }

        if !apply {
            return tech.hardblocked;
        }

        tech.softblocked = softblock;

        if tech.hardblocked || tech.softblocked {
            if self.technology_disabled(tech) {
                let _ = self.affect_devices(tech, false).await;
            }
        } else if self.technology_enabled(tech) {
            let _ = self.affect_devices(tech, true).await;
        }

        if hardblock_changed {
            if tech.hardblocked {
                debug!("{} is hardblocked", tech.kind);
                self.unregister(tech);
            } else {
                debug!("{} is no longer hardblocked", tech.kind);
                self.register(tech);
            }
        }

        tech.hardblocked
    }

    /// Toggles every device. Asynchronous if any device is, otherwise the first
    /// failure wins.
    async fn affect_devices(&self, tech: &Technology, enable: bool) -> Result<Toggle> {
        let mut outcome = Ok(Toggle::Done);
        let mut in_progress = false;

        for device in &tech.devices {
            let result = if enable {
                device.enable().await
            } else {
                device.disable().await
            };

            match result {
                Ok(Toggle::InProgress) => in_progress = true,
                Ok(_) => {}
                Err(e) => {
                    warn!("failed to toggle device {}: {e}", device.ident());
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
        }

        if in_progress {
            return Ok(Toggle::InProgress);
        }

        outcome
    }

    async fn enable(&self, tech: &mut Technology) -> Result<Toggle> {
        if tech.enabled {
            return Err(Error::AlreadyEnabled);
        }

        if tech.pending.is_some() {
            return Err(Error::Busy);
        }

        let unblocked = if tech.rfkill_driven {
            Some(self.rfkill.block(tech.kind, false).await.map_err(Error::device))
        } else {
            None
        };

        let devices = self.affect_devices(tech, true).await;

        match unblocked {
            // the switch event will flip the state
            Some(unblocked) => unblocked.map(|()| Toggle::Done),
            None => {
                if matches!(devices, Ok(Toggle::Done | Toggle::Unchanged)) {
                    self.technology_enabled(tech);
                }

                devices
            }
        }
    }

    async fn disable(&self, tech: &mut Technology) -> Result<Toggle> {
        if !tech.enabled {
            return Err(Error::AlreadyDisabled);
        }

        if tech.pending.is_some() {
            return Err(Error::Busy);
        }

        if tech.tethering {
            if let Err(e) = self.set_tethering(tech, false).await {
                warn!("failed to stop tethering on {}: {e}", tech.kind);
            }
        }

        let devices = self.affect_devices(tech, false).await;

        if tech.rfkill_driven {
            return self
                .rfkill
                .block(tech.kind, true)
                .await
                .map(|()| Toggle::Done)
                .map_err(Error::device);
        }

        if matches!(devices, Ok(Toggle::Done | Toggle::Unchanged)) {
            self.technology_disabled(tech);
        }

        devices
    }

    async fn set_tethering(
        &self,
        tech: &mut Technology,
        enabled: bool,
    ) -> Result<Toggle> {
        if !tech.enabled {
            return Err(Error::AccessDenied);
        }

        let Some(bridge) = self.tethering_bridge.as_deref() else {
            return Err(Error::NotSupported);
        };

        let identifier = tech.tethering_identifier.as_deref();
        let passphrase = tech.tethering_passphrase.as_deref();

        let incomplete = identifier.is_none() || passphrase.is_none();
        if tech.kind == TechnologyType::Wifi && incomplete {
            return Err(Error::InvalidArguments(
                "wifi tethering needs an identifier and a passphrase".into(),
            ));
        }

        let mut result = Err(Error::NotSupported);
        for driver in &tech.drivers {
            let outcome = driver
                .set_tethering(tech.kind, identifier, passphrase, bridge, enabled)
                .await;

            if matches!(result, Ok(Toggle::InProgress)) {
                continue;
            }

            if outcome.is_ok() {
                result = outcome;
            }
        }

        if matches!(result, Ok(Toggle::Done)) {
            self.tethering_changed(tech, enabled);
        }

        result
    }
}
