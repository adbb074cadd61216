#![allow(dead_code)]
use async_trait::async_trait;
use bon::bon;
use color_eyre::{eyre::eyre, Result};
use mockall::mock;
use modemd::{
    error,
    keyfile::KeyFile,
    link::LinkControl,
    manager::SessionManager,
    nat::NatControl,
    provisioning::ServiceConfig,
    publish::{NetworkId, NetworkPublisher, NetworkTable},
    session::{DisconnectPolicy, ModemDevice, ModemProperties},
    settings::SettingsStore,
    technology::{RfkillControl, TechDevice, TechnologyType, Toggle},
    transport::{Credentials, ModemTransport, TransportEvent, TransportHandle},
    CELLULAR_NETWORK_DRIVER,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::Notify, time};

pub const IMSI: &str = "262021234567890";

pub fn device(n: u32) -> ModemDevice {
    ModemDevice {
        path: format!("/dev/cdc-wdm{n}"),
        interface: format!("wwan{n}"),
        ifindex: 10 + n,
    }
}

pub fn transport_path(n: u32) -> String {
    format!("/org/freedesktop/ModemManager1/Modem/{n}")
}

pub fn properties() -> ModemProperties {
    ModemProperties {
        imsi: Some(IMSI.into()),
        serial: Some("356938035643809".into()),
        operator_name: Some("Vodafone".into()),
        mcc: Some("262".into()),
        mnc: Some("02".into()),
        access_tech: Some("lte".into()),
        quality: Some(-10.0),
        roaming: false,
        online: true,
    }
}

pub fn home_config() -> ServiceConfig {
    ServiceConfig {
        apn: Some("internet".into()),
        username: Some("web".into()),
        passphrase: Some("secret".into()),
        provider: Some("Vodafone".into()),
    }
}

/// Polls `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }

        time::sleep(Duration::from_millis(2)).await;
    }

    panic!("condition was not met in time");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(String),
    Properties(String),
    Connect(String, Credentials),
    Disconnect(String),
    Release(String),
}

/// Scriptable modem transport. Handles are the transport path.
pub struct FakeTransport {
    events_tx: flume::Sender<TransportEvent>,
    events_rx: flume::Receiver<TransportEvent>,
    paths: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<Call>>,
    pub fail_watch: AtomicBool,
    pub fail_open: AtomicBool,
    pub fail_properties: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_disconnect: AtomicBool,
    pub hold_open: AtomicBool,
    pub hold_disconnect: AtomicBool,
    open_gate: Notify,
    disconnect_gate: Notify,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = flume::unbounded();

        Self {
            events_tx,
            events_rx,
            paths: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_watch: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_properties: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            hold_open: AtomicBool::new(false),
            hold_disconnect: AtomicBool::new(false),
            open_gate: Notify::new(),
            disconnect_gate: Notify::new(),
        }
    }

    /// Makes `device(n)` resolvable.
    pub fn knows(&self, n: u32) {
        self.paths
            .lock()
            .unwrap()
            .insert(device(n).path, transport_path(n));
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events_tx.send(event).unwrap();
    }

    /// Lets one held open request complete.
    pub fn release_open(&self) {
        self.open_gate.notify_one();
    }

    /// Lets one held disconnect request complete.
    pub fn release_disconnect(&self) {
        self.disconnect_gate.notify_one();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn fail(flag: &AtomicBool, what: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(eyre!("{what} failed"));
    }

    Ok(())
}

#[async_trait]
impl ModemTransport for FakeTransport {
    async fn watch(&self) -> Result<flume::Receiver<TransportEvent>> {
        fail(&self.fail_watch, "watch")?;

        Ok(self.events_rx.clone())
    }

    async fn resolve_path(&self, device: &ModemDevice) -> Result<Option<String>> {
        Ok(self.paths.lock().unwrap().get(&device.path).cloned())
    }

    async fn open(&self, transport_path: &str) -> Result<TransportHandle> {
        self.record(Call::Open(transport_path.to_string()));

        if self.hold_open.load(Ordering::SeqCst) {
            self.open_gate.notified().await;
        }

        fail(&self.fail_open, "open")?;

        Ok(TransportHandle::new(transport_path))
    }

    async fn properties(&self, handle: &TransportHandle) -> Result<ModemProperties> {
        self.record(Call::Properties(handle.to_string()));
        fail(&self.fail_properties, "properties")?;

        Ok(properties())
    }

    async fn connect(
        &self,
        handle: &TransportHandle,
        credentials: &Credentials,
    ) -> Result<()> {
        self.record(Call::Connect(handle.to_string(), credentials.clone()));

        fail(&self.fail_connect, "connect")
    }

    async fn disconnect(&self, handle: &TransportHandle) -> Result<()> {
        self.record(Call::Disconnect(handle.to_string()));

        if self.hold_disconnect.load(Ordering::SeqCst) {
            self.disconnect_gate.notified().await;
        }

        fail(&self.fail_disconnect, "disconnect")
    }

    async fn release(&self, handle: &TransportHandle) -> Result<()> {
        self.record(Call::Release(handle.to_string()));

        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLink {
    pub calls: Mutex<Vec<(u32, bool)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl LinkControl for FakeLink {
    async fn ifup(&self, ifindex: u32) -> Result<()> {
        fail(&self.fail, "ifup")?;
        self.calls.lock().unwrap().push((ifindex, true));

        Ok(())
    }

    async fn ifdown(&self, ifindex: u32) -> Result<()> {
        fail(&self.fail, "ifdown")?;
        self.calls.lock().unwrap().push((ifindex, false));

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nat {
    Enable(String),
    Disable(String),
}

#[derive(Default)]
pub struct RecordingNat {
    pub calls: Mutex<Vec<Nat>>,
    pub hold_enable: AtomicBool,
    pub enabling: AtomicBool,
    enable_gate: Notify,
}

impl RecordingNat {
    pub fn calls(&self) -> Vec<Nat> {
        self.calls.lock().unwrap().clone()
    }

    pub fn disables(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Nat::Disable(_)))
            .count()
    }

    /// Lets one held enable request complete.
    pub fn release_enable(&self) {
        self.enable_gate.notify_one();
    }
}

#[async_trait]
impl NatControl for RecordingNat {
    async fn enable(&self, interface: &str) -> Result<()> {
        if self.hold_enable.load(Ordering::SeqCst) {
            self.enabling.store(true, Ordering::SeqCst);
            self.enable_gate.notified().await;
        }

        self.calls
            .lock()
            .unwrap()
            .push(Nat::Enable(interface.to_string()));

        Ok(())
    }

    async fn disable(&self, interface: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Nat::Disable(interface.to_string()));

        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySettings {
    pub keyfile: Mutex<Option<KeyFile>>,
    pub fail_save: AtomicBool,
}

impl MemorySettings {
    pub fn with(contents: &str) -> Self {
        Self {
            keyfile: Mutex::new(Some(KeyFile::parse(contents).unwrap())),
            fail_save: AtomicBool::new(false),
        }
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Option<bool> {
        self.keyfile.lock().unwrap().as_ref()?.get_bool(group, key)
    }

    pub fn get_string(&self, group: &str, key: &str) -> Option<String> {
        let keyfile = self.keyfile.lock().unwrap();

        keyfile.as_ref()?.get_string(group, key).map(str::to_string)
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn load_global(&self) -> Result<Option<KeyFile>> {
        Ok(self.keyfile.lock().unwrap().clone())
    }

    async fn save_global(&self, keyfile: &KeyFile) -> Result<()> {
        fail(&self.fail_save, "save")?;
        *self.keyfile.lock().unwrap() = Some(keyfile.clone());

        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRfkill {
    pub calls: Mutex<Vec<(TechnologyType, bool)>>,
    pub fail: AtomicBool,
}

impl FakeRfkill {
    pub fn calls(&self) -> Vec<(TechnologyType, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RfkillControl for FakeRfkill {
    async fn block(&self, kind: TechnologyType, blocked: bool) -> Result<()> {
        fail(&self.fail, "rfkill")?;
        self.calls.lock().unwrap().push((kind, blocked));

        Ok(())
    }
}

/// A device that answers every toggle with a fixed outcome.
pub struct FakeTechDevice {
    ident: String,
    kind: TechnologyType,
    pub powered: AtomicBool,
    pub outcome: Mutex<error::Result<Toggle>>,
    pub toggles: Mutex<Vec<bool>>,
}

impl FakeTechDevice {
    pub fn new(ident: &str, kind: TechnologyType) -> Arc<Self> {
        Arc::new(Self {
            ident: ident.to_string(),
            kind,
            powered: AtomicBool::new(false),
            outcome: Mutex::new(Ok(Toggle::Done)),
            toggles: Mutex::new(Vec::new()),
        })
    }

    pub fn answer(&self, outcome: error::Result<Toggle>) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn toggles(&self) -> Vec<bool> {
        self.toggles.lock().unwrap().clone()
    }

    pub fn is_powered_now(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    /// Simulates the device changing power on its own.
    pub fn set_powered_now(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    fn toggle(&self, on: bool) -> error::Result<Toggle> {
        self.toggles.lock().unwrap().push(on);
        let outcome = self.outcome.lock().unwrap().clone();
        if matches!(outcome, Ok(Toggle::Done)) {
            self.powered.store(on, Ordering::SeqCst);
        }

        outcome
    }
}

#[async_trait]
impl TechDevice for FakeTechDevice {
    fn ident(&self) -> &str {
        &self.ident
    }

    fn kind(&self) -> TechnologyType {
        self.kind
    }

    fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn enable(&self) -> error::Result<Toggle> {
        self.toggle(true)
    }

    async fn disable(&self) -> error::Result<Toggle> {
        self.toggle(false)
    }
}

mock! {
    pub Publisher {}
    impl NetworkPublisher for Publisher {
        fn register_network_driver(&self, name: &str, kind: TechnologyType) -> error::Result<()>;
        fn unregister_network_driver(&self, name: &str);
        fn create_network(&self, key: &str, kind: TechnologyType) -> error::Result<NetworkId>;
        fn set_name(&self, id: NetworkId, name: &str);
        fn set_strength(&self, id: NetworkId, strength: u8);
        fn set_group(&self, id: NetworkId, group: &str);
        fn set_bool(&self, id: NetworkId, key: &str, value: bool);
        fn set_connected(&self, id: NetworkId, connected: bool);
        fn add_network(&self, device: &str, id: NetworkId) -> error::Result<()>;
        fn remove_network(&self, device: &str, id: NetworkId);
        fn update(&self, id: NetworkId) -> error::Result<()>;
    }
}

/// A session manager wired to fakes, with the cellular network driver registered.
pub struct Fixture {
    pub transport: Arc<FakeTransport>,
    pub table: Arc<NetworkTable>,
    pub link: Arc<FakeLink>,
    pub nat: Arc<RecordingNat>,
    pub sessions: SessionManager,
}

#[bon]
impl Fixture {
    #[builder(finish_fn = build)]
    pub fn new(
        #[builder(default)] disconnect_policy: DisconnectPolicy,
        #[builder(default = Duration::from_secs(10))] open_retry_backoff: Duration,
        #[builder(default)] provisioning: HashMap<String, ServiceConfig>,
        #[builder(default = false)] log: bool,
    ) -> Self {
        if log {
            let _ = modemd_telemetry::TelemetryConfig::new().try_init();
        }

        let transport = Arc::new(FakeTransport::new());
        let table = Arc::new(NetworkTable::new());
        table
            .register_network_driver(CELLULAR_NETWORK_DRIVER, TechnologyType::Cellular)
            .unwrap();
        let link = Arc::new(FakeLink::default());
        let nat = Arc::new(RecordingNat::default());

        let sessions = SessionManager::builder()
            .transport(transport.clone())
            .publisher(table.clone())
            .provisioning(Arc::new(provisioning))
            .link(link.clone())
            .nat(nat.clone())
            .disconnect_policy(disconnect_policy)
            .open_retry_backoff(open_retry_backoff)
            .build();

        Self {
            transport,
            table,
            link,
            nat,
            sessions,
        }
    }
}

impl Fixture {
    /// Probes `device(n)` and waits until its session is opened. Brings the service
    /// up first if needed.
    pub async fn opened(&self, n: u32) -> String {
        if !self.sessions.is_transport_connected() {
            self.sessions.service_appeared();
        }

        self.transport.knows(n);
        let path = device(n).path;
        self.sessions.probe(device(n)).await.unwrap();

        let sessions = self.sessions.clone();
        let waiting_for = path.clone();
        wait_for(move || {
            sessions.state(&waiting_for) == Some(modemd::session::SessionState::Opened)
        })
        .await;

        path
    }

    pub async fn connected(&self, n: u32) -> String {
        let path = self.opened(n).await;
        self.sessions.connect(&path, None).await.unwrap();

        path
    }
}
