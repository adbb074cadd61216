use cellular::{CellularDevice, CellularDriver};
use color_eyre::eyre::{Result, WrapErr as _};
use link::LinkControl;
use manager::SessionManager;
use nat::NatControl;
use provisioning::ServiceConfigStore;
use publish::NetworkPublisher;
use registration::Registrations;
use session::{DisconnectPolicy, SessionState};
use settings::SettingsStore;
use std::{sync::Arc, time::Duration};
use technology::{RfkillControl, RfkillEvent, TechnologyManager, TechnologyType};
use tokio::{
    task::{self, JoinHandle},
    time,
};
use transport::{Credentials, ModemTransport, TransportEvent};
use tracing::{debug, info, warn};

pub mod cellular;
pub mod error;
pub mod keyfile;
pub mod link;
pub mod manager;
pub mod nat;
pub mod provisioning;
pub mod publish;
pub mod registration;
pub mod registry;
pub mod session;
pub mod settings;
pub mod technology;
pub mod transport;

mod utils;

pub use error::Error;

/// Name under which modem networks are published.
pub const CELLULAR_NETWORK_DRIVER: &str = "cellular";

pub type Tasks = Vec<JoinHandle<Result<()>>>;

/// A running daemon.
pub struct Modemd {
    pub sessions: SessionManager,
    pub technologies: TechnologyManager,
    tasks: Tasks,
    registrations: Registrations,
}

#[bon::builder(finish_fn = run)]
pub async fn program(
    transport: Arc<dyn ModemTransport>,
    publisher: Arc<dyn NetworkPublisher>,
    provisioning: Arc<dyn ServiceConfigStore>,
    settings: Arc<dyn SettingsStore>,
    link: Arc<dyn LinkControl>,
    nat: Arc<dyn NatControl>,
    rfkill: Arc<dyn RfkillControl>,
    #[builder(default)] disconnect_policy: DisconnectPolicy,
    #[builder(default = Duration::from_secs(10))] open_retry_backoff: Duration,
    #[builder(default = Duration::from_secs(10))] power_timeout: Duration,
    tethering_bridge: Option<String>,
    /// Connect opened and powered modems with their provisioned credentials.
    autoconnect: Option<Duration>,
) -> Result<Modemd> {
    if autoconnect.is_some_and(|interval| interval.is_zero()) {
        return Err(Error::InvalidArguments(
            "autoconnect interval must be non-zero".into(),
        ))
        .wrap_err("invalid modemd configuration");
    }

    let technologies = TechnologyManager::builder()
        .settings(settings)
        .rfkill(rfkill)
        .power_timeout(power_timeout)
        .maybe_tethering_bridge(tethering_bridge)
        .init()
        .await;

    let sessions = SessionManager::builder()
        .transport(Arc::clone(&transport))
        .publisher(Arc::clone(&publisher))
        .provisioning(provisioning)
        .link(link)
        .nat(nat)
        .disconnect_policy(disconnect_policy)
        .open_retry_backoff(open_retry_backoff)
        .build();

    let mut registrations = Registrations::default();

    technologies.register_driver(Arc::new(CellularDriver)).await;
    let techs = technologies.clone();
    registrations.push("cellular technology driver", move || async move {
        techs.unregister_driver(CellularDriver::NAME).await
    });

    if let Err(e) = publisher
        .register_network_driver(CELLULAR_NETWORK_DRIVER, TechnologyType::Cellular)
    {
        registrations.unwind().await;
        return Err(e).wrap_err("failed to register cellular network driver");
    }

    let networks = Arc::clone(&publisher);
    registrations.push("cellular network driver", move || async move {
        networks.unregister_network_driver(CELLULAR_NETWORK_DRIVER)
    });

    let events = match transport.watch().await {
        Ok(events) => events,
        Err(e) => {
            registrations.unwind().await;
            return Err(e.wrap_err("failed to watch modem transport"));
        }
    };

    let mut tasks: Tasks = vec![task::spawn(pump_transport_events(
        sessions.clone(),
        technologies.clone(),
        events,
    ))];

    if let Some(interval) = autoconnect {
        tasks.push(task::spawn(autoconnect_task(
            sessions.clone(),
            technologies.clone(),
            interval,
        )));
    }

    info!("modemd started");

    Ok(Modemd {
        sessions,
        technologies,
        tasks,
        registrations,
    })
}

impl Modemd {
    pub async fn connect(
        &self,
        path: &str,
        credentials: Option<Credentials>,
    ) -> error::Result<()> {
        let result = self.sessions.connect(path, credentials).await;
        sync_connected(&self.sessions, &self.technologies).await;

        result
    }

    pub async fn disconnect(&self, path: &str) -> error::Result<()> {
        let result = self.sessions.disconnect(path).await;
        sync_connected(&self.sessions, &self.technologies).await;

        result
    }

    /// Feeds rfkill switch changes into the technology manager.
    pub fn spawn_rfkill_events(&mut self, events: flume::Receiver<RfkillEvent>) {
        let technologies = self.technologies.clone();

        self.tasks.push(task::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let result = match event {
                    RfkillEvent::Added(switch) => technologies.add_rfkill(switch).await,
                    RfkillEvent::Changed(switch) => technologies.update_rfkill(switch).await,
                    RfkillEvent::Removed { index, kind } => {
                        technologies.remove_rfkill(index, kind).await
                    }
                };

                if let Err(e) = result {
                    debug!("rfkill event not applied: {e}");
                }
            }

            Ok(())
        }));
    }

    /// Stops background tasks, closes all sessions and undoes startup registrations.
    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.sessions.shutdown().await;
        self.registrations.unwind().await;
        info!("modemd stopped");
    }
}

/// Dispatches one transport event.
pub async fn handle_transport_event(
    sessions: &SessionManager,
    technologies: &TechnologyManager,
    event: TransportEvent,
) {
    match event {
        TransportEvent::ServiceAppeared => sessions.service_appeared(),

        TransportEvent::ServiceVanished => {
            sessions.service_vanished().await;
            sync_connected(sessions, technologies).await;
        }

        TransportEvent::DeviceAdded(device) => {
            let path = device.path.clone();
            if let Err(e) = sessions.probe(device).await {
                warn!("failed to probe modem {path}: {e}");
                return;
            }

            let device = Arc::new(CellularDevice::new(sessions.clone(), &path));
            if let Err(e) = technologies.add_device(device).await {
                warn!("failed to add modem {path} to cellular technology: {e}");
            }
        }

        TransportEvent::DeviceRemoved(path) => {
            if let Err(e) = technologies.remove_device(&path).await {
                debug!("modem {path} was not bound to a technology: {e}");
            }

            if let Err(e) = sessions.remove(&path).await {
                warn!("failed to remove modem {path}: {e}");
            }

            sync_connected(sessions, technologies).await;
        }

        TransportEvent::Signal(signal) => {
            sessions.route_signal(signal);
        }
    }
}

async fn pump_transport_events(
    sessions: SessionManager,
    technologies: TechnologyManager,
    events: flume::Receiver<TransportEvent>,
) -> Result<()> {
    while let Ok(event) = events.recv_async().await {
        handle_transport_event(&sessions, &technologies, event).await;
    }

    warn!("modem transport event stream ended");

    Ok(())
}

async fn autoconnect_task(
    sessions: SessionManager,
    technologies: TechnologyManager,
    interval: Duration,
) -> Result<()> {
    let mut ticker = time::interval(interval);

    loop {
        ticker.tick().await;

        for path in sessions.paths() {
            let ready = sessions.state(&path) == Some(SessionState::Opened)
                && sessions.is_powered(&path);

            if !ready {
                continue;
            }

            match sessions.connect(&path, None).await {
                Ok(()) => sync_connected(&sessions, &technologies).await,
                Err(e) => warn!("failed to autoconnect modem {path}: {e}"),
            }
        }
    }
}

async fn sync_connected(sessions: &SessionManager, technologies: &TechnologyManager) {
    let connected = sessions
        .paths()
        .iter()
        .any(|path| sessions.state(path) == Some(SessionState::Connected));

    if let Err(e) = technologies
        .set_connected(TechnologyType::Cellular, connected)
        .await
    {
        debug!("cellular technology not available: {e}");
    }
}
