//! Owns all modem sessions and drives them against the transport.
//!
//! Requests are issued with the session lock held only long enough to take a
//! [`Ticket`]. Open requests complete in spawned tasks that hold a weak reference to
//! the session cell, so a session removed in the meantime is simply skipped.

use crate::{
    error::{Error, Result},
    link::LinkControl,
    nat::NatControl,
    provisioning::ServiceConfigStore,
    publish::{NetworkId, NetworkPublisher},
    registry::{DeviceRegistry, SessionCell},
    session::{
        Closed, DisconnectPolicy, ModemDevice, ModemSession, SessionState, Telemetry,
        Ticket,
    },
    technology::Toggle,
    transport::{Credentials, ModemTransport, TransportHandle},
};
use bon::bon;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time};
use tracing::{debug, error, info, warn};

mod router;
mod watcher;
mod worker;

/// Wake-ups for the session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Scan,
    Shutdown,
}

pub(crate) struct Shared {
    registry: DeviceRegistry,
    connected: AtomicBool,
    transport: Arc<dyn ModemTransport>,
    publisher: Arc<dyn NetworkPublisher>,
    provisioning: Arc<dyn ServiceConfigStore>,
    link: Arc<dyn LinkControl>,
    nat: Arc<dyn NatControl>,
    disconnect_policy: DisconnectPolicy,
    open_retry_backoff: Duration,
    wake_tx: flume::Sender<Wake>,
}

struct WorkerSlot {
    wake_rx: flume::Receiver<Wake>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
    worker: Arc<WorkerSlot>,
}

#[bon]
impl SessionManager {
    #[builder]
    pub fn new(
        transport: Arc<dyn ModemTransport>,
        publisher: Arc<dyn NetworkPublisher>,
        provisioning: Arc<dyn ServiceConfigStore>,
        link: Arc<dyn LinkControl>,
        nat: Arc<dyn NatControl>,
        #[builder(default)] disconnect_policy: DisconnectPolicy,
        #[builder(default = Duration::from_secs(10))] open_retry_backoff: Duration,
    ) -> Self {
        // a single pending scan is enough, the worker always scans the whole registry
        let (wake_tx, wake_rx) = flume::bounded(1);

        let shared = Arc::new(Shared {
            registry: DeviceRegistry::new(),
            connected: AtomicBool::new(false),
            transport,
            publisher,
            provisioning,
            link,
            nat,
            disconnect_policy,
            open_retry_backoff,
            wake_tx,
        });

        Self {
            shared,
            worker: Arc::new(WorkerSlot {
                wake_rx,
                handle: Mutex::new(None),
            }),
        }
    }
}

impl SessionManager {
    /// Registers a newly discovered device.
    ///
    /// A device the transport cannot resolve is still registered so that it can be
    /// removed later, but it is never opened and this returns
    /// [`Error::PathUnresolved`].
    pub async fn probe(&self, device: ModemDevice) -> Result<()> {
        let path = device.path.clone();
        if self.shared.registry.get(&path).is_some() {
            return Err(Error::AlreadyExists(path));
        }

        let transport_path = match self.shared.transport.resolve_path(&device).await {
            Ok(transport_path) => transport_path,
            Err(e) => {
                warn!("failed to resolve transport path for {path}: {e}");
                None
            }
        };

        let usable = transport_path.is_some();
        self.shared
            .registry
            .insert(ModemSession::new(device, transport_path))?;

        if !usable {
            error!("modem {path} is unknown to the transport, it will not be opened");
            return Err(Error::PathUnresolved(path));
        }

        info!("modem {path} probed");
        self.shared.wake();

        Ok(())
    }

    /// Unregisters a device, closing its session.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let cell = self
            .shared
            .registry
            .remove(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        let closed = cell.lock().close();
        if let Some(closed) = closed {
            self.shared.cleanup(closed, true).await;
        }

        info!("modem {path} removed");

        Ok(())
    }

    /// Issues an open request for a discovered session. Completion is asynchronous.
    pub fn open(&self, path: &str) -> Result<()> {
        let cell = self.shared.cell(path)?;

        self.shared.issue_open(&cell)
    }

    /// Connects an opened session, with the provisioned credentials unless
    /// `credentials` are given.
    pub async fn connect(
        &self,
        path: &str,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let cell = self.shared.cell(path)?;
        let (ticket, handle, credentials) = cell.lock().begin_connect(credentials)?;
        debug!("connecting modem {path} to apn {}", credentials.apn);

        let result = self
            .shared
            .transport
            .connect(&handle, &credentials)
            .await
            .map_err(Error::transport);

        let interface = {
            let mut session = cell.lock();
            session.finish_connect(ticket, result)?;
            session.device().interface.clone()
        };

        if let Err(e) = self.shared.nat.enable(&interface).await {
            warn!("failed to enable NAT on {interface}: {e}");
        }

        // Closed or disconnected while NAT was being set up.
        if !cell.lock().is_current(ticket, SessionState::Connected) {
            debug!("modem {path} left Connected during NAT setup, rolling back");
            self.shared.disable_nat(&interface).await;
        }

        Ok(())
    }

    pub async fn disconnect(&self, path: &str) -> Result<()> {
        let policy = self.shared.disconnect_policy;
        let cell = self.shared.cell(path)?;
        let (ticket, handle, interface) = {
            let mut session = cell.lock();
            let (ticket, handle) = session.begin_disconnect(policy)?;
            (ticket, handle, session.device().interface.clone())
        };

        if policy == DisconnectPolicy::Optimistic {
            self.shared.disable_nat(&interface).await;
        }

        let result = self
            .shared
            .transport
            .disconnect(&handle)
            .await
            .map_err(Error::transport);

        cell.lock().finish_disconnect(ticket, policy, result)?;

        if policy == DisconnectPolicy::Confirmed {
            self.shared.disable_nat(&interface).await;
        }

        Ok(())
    }

    /// Brings the data interface of a session up.
    pub async fn enable_device(&self, path: &str) -> Result<Toggle> {
        self.set_device_powered(path, true).await
    }

    /// Brings the data interface of a session down.
    pub async fn disable_device(&self, path: &str) -> Result<Toggle> {
        self.set_device_powered(path, false).await
    }

    async fn set_device_powered(&self, path: &str, powered: bool) -> Result<Toggle> {
        let cell = self.shared.cell(path)?;
        let ifindex = {
            let session = cell.lock();
            if !session.is_usable() {
                return Err(Error::PathUnresolved(path.to_string()));
            }

            if session.is_powered() == powered {
                return Ok(Toggle::Unchanged);
            }

            session.device().ifindex
        };

        let link = &self.shared.link;
        let result = if powered {
            link.ifup(ifindex).await
        } else {
            link.ifdown(ifindex).await
        };
        result.map_err(Error::device)?;

        cell.lock().set_powered(powered);

        Ok(Toggle::Done)
    }

    pub fn is_powered(&self, path: &str) -> bool {
        self.shared
            .registry
            .get(path)
            .is_some_and(|cell| cell.lock().is_powered())
    }

    pub fn state(&self, path: &str) -> Option<SessionState> {
        self.shared.registry.get(path).map(|cell| cell.lock().state())
    }

    pub fn telemetry(&self, path: &str) -> Option<Telemetry> {
        let cell = self.shared.registry.get(path)?;
        let telemetry = cell.lock().telemetry().clone();

        Some(telemetry)
    }

    pub fn network(&self, path: &str) -> Option<NetworkId> {
        let cell = self.shared.registry.get(path)?;
        let id = cell.lock().attachment().map(|a| a.id());

        id
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self
            .shared
            .registry
            .all()
            .iter()
            .map(|cell| cell.path().to_string())
            .collect();
        paths.sort();

        paths
    }

    pub fn is_transport_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Stops the worker and closes every session.
    pub async fn shutdown(&self) {
        info!("shutting down session manager");

        let handle = self
            .worker
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if self.shared.wake_tx.send_async(Wake::Shutdown).await.is_ok() {
                if let Err(e) = handle.await {
                    error!("session worker failed: {e}");
                }
            } else {
                handle.abort();
            }
        }

        for cell in self.shared.registry.drain() {
            let closed = cell.lock().close();
            if let Some(closed) = closed {
                self.shared.cleanup(closed, true).await;
            }
        }
    }

    fn ensure_worker(&self) {
        let mut slot = self
            .worker
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        debug!("starting session worker");
        *slot = Some(tokio::spawn(worker::run(
            Arc::clone(&self.shared),
            self.worker.wake_rx.clone(),
        )));
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn cell(&self, path: &str) -> Result<Arc<SessionCell>> {
        self.registry
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// Coalescing: a scan that is already queued covers this one.
    fn wake(&self) {
        let _ = self.wake_tx.try_send(Wake::Scan);
    }

    fn schedule_retry(self: &Arc<Self>) {
        let shared = Arc::downgrade(self);
        let backoff = self.open_retry_backoff;

        tokio::spawn(async move {
            time::sleep(backoff).await;
            if let Some(shared) = shared.upgrade() {
                shared.wake();
            }
        });
    }

    /// The cell, if it is still the one registered under its path.
    fn live(&self, cell: &Weak<SessionCell>) -> Option<Arc<SessionCell>> {
        let cell = cell.upgrade()?;

        self.registry.contains(&cell).then_some(cell)
    }

    fn open_pending(self: &Arc<Self>) {
        for cell in self.registry.pending() {
            if let Err(e) = self.issue_open(&cell) {
                debug!("not opening {}: {e}", cell.path());
            }
        }
    }

    fn issue_open(self: &Arc<Self>, cell: &Arc<SessionCell>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportUnavailable);
        }

        let (ticket, transport_path) = cell.lock().begin_open()?;
        debug!("opening modem {} at {transport_path}", cell.path());

        let shared = Arc::clone(self);
        let cell = Arc::downgrade(cell);
        tokio::spawn(async move {
            shared.complete_open(cell, ticket, transport_path).await
        });

        Ok(())
    }

    async fn complete_open(
        self: Arc<Self>,
        cell: Weak<SessionCell>,
        ticket: Ticket,
        transport_path: String,
    ) {
        let handle = match self.transport.open(&transport_path).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("failed to open modem at {transport_path}: {e}");
                if let Some(cell) = self.live(&cell) {
                    cell.lock().open_failed(ticket);
                }
                self.schedule_retry();
                return;
            }
        };

        let acquired = self
            .live(&cell)
            .is_some_and(|cell| cell.lock().handle_acquired(ticket, handle.clone()));

        if !acquired {
            debug!("modem at {transport_path} went away while opening");
            self.release(&handle).await;
            return;
        }

        let properties = match self.transport.properties(&handle).await {
            Ok(properties) => properties,
            Err(e) => {
                warn!("failed to read properties of modem at {transport_path}: {e}");
                self.abandon_open(&cell, ticket).await;
                self.schedule_retry();
                return;
            }
        };

        let Some(live) = self.live(&cell) else {
            self.release(&handle).await;
            return;
        };

        let finished = live.lock().finish_open(
            ticket,
            properties,
            &self.publisher,
            self.provisioning.as_ref(),
        );

        match finished {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                debug!("open of modem at {transport_path} was superseded");
                self.release(&handle).await;
            }
            Err(e) => {
                error!("failed to publish modem at {transport_path}: {e}");
                self.abandon_open(&cell, ticket).await;
                self.schedule_retry();
            }
        }
    }

    async fn abandon_open(&self, cell: &Weak<SessionCell>, ticket: Ticket) {
        let handle = self
            .live(cell)
            .and_then(|cell| cell.lock().open_failed(ticket));

        if let Some(handle) = handle {
            self.release(&handle).await;
        }
    }

    async fn release(&self, handle: &TransportHandle) {
        if !self.is_connected() {
            return;
        }

        if let Err(e) = self.transport.release(handle).await {
            debug!("failed to release transport handle {handle}: {e}");
        }
    }

    async fn disable_nat(&self, interface: &str) {
        if let Err(e) = self.nat.disable(interface).await {
            warn!("failed to disable NAT on {interface}: {e}");
        }
    }

    async fn cleanup(&self, closed: Closed, release: bool) {
        if closed.was_connected {
            self.disable_nat(&closed.interface).await;
        }

        if let Some(handle) = closed.handle.filter(|_| release) {
            self.release(&handle).await;
        }
    }
}
