//! [`ModemTransport`] backed by ModemManager's `mmcli`.
//!
//! `mmcli` has no push interface, so [`MmcliTransport::watch`] polls: service
//! availability is inferred from `mmcli -L` succeeding, devices from the modem list,
//! and signals from diffing the properties of every opened modem.

use super::{
    Credentials, ModemTransport, Signal, SignalKind, TransportEvent, TransportHandle,
};
use crate::{
    link,
    session::{ModemDevice, ModemProperties, PropertyUpdate},
    utils::run_cmd,
};
use async_trait::async_trait;
use color_eyre::{
    eyre::{ContextCompat, WrapErr},
    Result,
};
use dashmap::DashMap;
use regex::Regex;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio::{task, time};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SIGNAL_REFRESH: Duration = Duration::from_secs(10);

pub struct MmcliTransport {
    poll_interval: Duration,
    opened: Arc<DashMap<TransportHandle, ModemProperties>>,
}

impl MmcliTransport {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            opened: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl ModemTransport for MmcliTransport {
    async fn watch(&self) -> Result<flume::Receiver<TransportEvent>> {
        let (tx, rx) = flume::unbounded();
        let mut poller = Poller {
            tx,
            opened: Arc::clone(&self.opened),
            available: false,
            devices: HashMap::new(),
        };
        let interval = self.poll_interval;

        task::spawn(async move {
            loop {
                if poller.poll().await.is_err() {
                    debug!("transport event receiver dropped, stopping mmcli poller");
                    break;
                }

                time::sleep(interval).await;
            }
        });

        Ok(rx)
    }

    async fn resolve_path(&self, device: &ModemDevice) -> Result<Option<String>> {
        let listing = run_cmd("mmcli", &["-L"]).await?;

        for modem in parse_mmcli_modem_list(&listing) {
            let info = modem_info(&modem.id).await?;
            if info.device_path().as_deref() == Some(device.path.as_str()) {
                return Ok(Some(modem.id));
            }
        }

        Ok(None)
    }

    async fn open(&self, transport_path: &str) -> Result<TransportHandle> {
        run_cmd("mmcli", &["-m", transport_path, "--enable"])
            .await
            .wrap_err_with(|| format!("failed to enable modem {transport_path}"))?;

        let rate = SIGNAL_REFRESH.as_secs().to_string();
        if let Err(e) =
            run_cmd("mmcli", &["-m", transport_path, "--signal-setup", &rate]).await
        {
            warn!("failed to set up signal refresh on modem {transport_path}: {e}");
        }

        Ok(TransportHandle::from(transport_path))
    }

    async fn properties(&self, handle: &TransportHandle) -> Result<ModemProperties> {
        let props = fetch_properties(handle.as_str()).await?;
        self.opened.insert(handle.clone(), props.clone());

        Ok(props)
    }

    async fn connect(
        &self,
        handle: &TransportHandle,
        credentials: &Credentials,
    ) -> Result<()> {
        let timeout = format!("--timeout={}", CONNECT_TIMEOUT.as_secs());
        let connect = simple_connect_arg(credentials);

        run_cmd("mmcli", &["-m", handle.as_str(), &timeout, &connect]).await?;

        Ok(())
    }

    async fn disconnect(&self, handle: &TransportHandle) -> Result<()> {
        run_cmd("mmcli", &["-m", handle.as_str(), "--simple-disconnect"]).await?;

        Ok(())
    }

    async fn release(&self, handle: &TransportHandle) -> Result<()> {
        self.opened.remove(handle);

        Ok(())
    }
}

struct Poller {
    tx: flume::Sender<TransportEvent>,
    opened: Arc<DashMap<TransportHandle, ModemProperties>>,
    available: bool,
    /// modem id -> device
    devices: HashMap<String, ModemDevice>,
}

type Disconnected = flume::SendError<TransportEvent>;

impl Poller {
    async fn poll(&mut self) -> Result<(), Disconnected> {
        let listing = match run_cmd("mmcli", &["-L"]).await {
            Ok(listing) => listing,
            Err(e) => {
                if self.available {
                    warn!("ModemManager went away: {e}");
                    self.available = false;
                    self.opened.clear();
                    self.tx.send(TransportEvent::ServiceVanished)?;
                }

                return Ok(());
            }
        };

        if !self.available {
            info!("ModemManager is available");
            self.available = true;
            self.tx.send(TransportEvent::ServiceAppeared)?;
        }

        let mut seen = HashSet::new();
        for modem in parse_mmcli_modem_list(&listing) {
            seen.insert(modem.id.clone());
            if self.devices.contains_key(&modem.id) {
                continue;
            }

            match discover_device(&modem.id).await {
                Ok(Some(device)) => {
                    info!(
                        "found modem {} [{}] {} at {}",
                        modem.id, modem.vendor, modem.model, device.path
                    );
                    self.tx.send(TransportEvent::DeviceAdded(device.clone()))?;
                    self.devices.insert(modem.id, device);
                }

                Ok(None) => debug!("modem {} has no data port yet", modem.id),
                Err(e) => warn!("failed to inspect modem {}: {e}", modem.id),
            }
        }

        let gone: Vec<_> = self
            .devices
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();

        for id in gone {
            if let Some(device) = self.devices.remove(&id) {
                self.opened.remove(&TransportHandle::new(id));
                self.tx.send(TransportEvent::DeviceRemoved(device.path))?;
            }
        }

        let handles: Vec<_> = self.opened.iter().map(|e| e.key().clone()).collect();
        for handle in handles {
            let props = match fetch_properties(handle.as_str()).await {
                Ok(props) => props,
                Err(e) => {
                    debug!("failed to refresh modem {handle}: {e}");
                    continue;
                }
            };

            let Some(mut previous) = self.opened.get_mut(&handle) else {
                continue;
            };

            let changes = diff_properties(&previous, &props);
            *previous = props;
            drop(previous);

            for kind in changes {
                self.tx.send(TransportEvent::Signal(Signal {
                    handle: handle.clone(),
                    kind,
                }))?;
            }
        }

        Ok(())
    }
}

async fn discover_device(modem_id: &str) -> Result<Option<ModemDevice>> {
    let info = modem_info(modem_id).await?;
    let (Some(path), Some(interface)) = (info.device_path(), info.net_port) else {
        return Ok(None);
    };

    let ifindex = link::index_of(&interface).await?;

    Ok(Some(ModemDevice {
        path,
        interface,
        ifindex,
    }))
}

async fn modem_info(modem_id: &str) -> Result<ModemInfo> {
    let output = run_cmd("mmcli", &["-m", modem_id, "-J"]).await?;

    parse_modem_info(&output)
}

async fn fetch_properties(modem_id: &str) -> Result<ModemProperties> {
    let info = modem_info(modem_id).await?;

    let quality = match run_cmd("mmcli", &["-m", modem_id, "--signal-get", "-J"]).await
    {
        Ok(output) => parse_signal_quality(&output)?,
        Err(e) => {
            debug!("no signal reading for modem {modem_id}: {e}");
            None
        }
    };

    let imsi = match &info.sim {
        Some(sim) => {
            let output = run_cmd("mmcli", &["-i", sim.as_str(), "-J"]).await?;
            Some(parse_sim_imsi(&output)?)
        }

        None => None,
    };

    let (mcc, mnc) = info
        .operator_code
        .as_deref()
        .and_then(split_operator_code)
        .unzip();

    Ok(ModemProperties {
        imsi,
        serial: Some(info.imei),
        operator_name: info.operator_name,
        mcc,
        mnc,
        access_tech: info.access_tech,
        quality,
        roaming: info.roaming,
        online: info.online,
    })
}

/// Splits a 3GPP operator code into MCC and MNC.
fn split_operator_code(code: &str) -> Option<(String, String)> {
    let (mcc, mnc) = code.split_at_checked(3)?;
    if mnc.is_empty() {
        return None;
    }

    Some((mcc.to_string(), mnc.to_string()))
}

fn simple_connect_arg(credentials: &Credentials) -> String {
    let mut arg = format!("--simple-connect=apn={}", credentials.apn);

    if let Some(user) = &credentials.username {
        arg.push_str(&format!(",user={user}"));
    }

    if let Some(password) = &credentials.password {
        arg.push_str(&format!(",password={password}"));
    }

    arg
}

/// Signals to emit for the transition from `old` to `new`.
fn diff_properties(old: &ModemProperties, new: &ModemProperties) -> Vec<SignalKind> {
    let mut changes = Vec::new();
    let mut property = |update| changes.push(SignalKind::Property(update));

    if old.quality != new.quality {
        if let Some(quality) = new.quality {
            property(PropertyUpdate::Quality(quality));
        }
    }

    if old.roaming != new.roaming {
        property(PropertyUpdate::Roaming(new.roaming));
    }

    if old.operator_name != new.operator_name {
        property(PropertyUpdate::OperatorName(new.operator_name.clone()));
    }

    if old.mcc != new.mcc {
        property(PropertyUpdate::Mcc(new.mcc.clone()));
    }

    if old.mnc != new.mnc {
        property(PropertyUpdate::Mnc(new.mnc.clone()));
    }

    if old.imsi != new.imsi {
        property(PropertyUpdate::Imsi(new.imsi.clone()));
    }

    if old.serial != new.serial {
        property(PropertyUpdate::Serial(new.serial.clone()));
    }

    if old.access_tech != new.access_tech {
        changes.push(SignalKind::Technology(new.access_tech.clone()));
    }

    if old.online != new.online {
        changes.push(SignalKind::State { online: new.online });
    }

    changes
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedModem {
    id: String,
    vendor: String,
    model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ModemInfo {
    imei: String,
    operator_code: Option<String>,
    operator_name: Option<String>,
    access_tech: Option<String>,
    online: bool,
    roaming: bool,
    sim: Option<String>,
    primary_port: Option<String>,
    net_port: Option<String>,
}

impl ModemInfo {
    fn device_path(&self) -> Option<String> {
        self.primary_port.as_ref().map(|port| format!("/dev/{port}"))
    }
}

macro_rules! jerr {
    ($s:expr) => {
        format!("could not get {}", $s)
    };
}

fn parse_mmcli_modem_list(str: &str) -> Vec<ListedModem> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^/org/freedesktop/ModemManager\d+/Modem/(?P<id>\d+)\s+\[(?P<vendor>[^\]]+)]\s+(?P<model>.+)$").unwrap()
    });

    str.lines()
        .map(|line| line.trim())
        .filter(|line| line.starts_with("/org/freedesktop"))
        .filter_map(|line| {
            let captures = RE.captures(line)?;
            let id = captures.name("id")?.as_str().to_string();
            let vendor = captures.name("vendor")?.as_str().to_string();
            let model = captures.name("model")?.as_str().to_string();

            Some(ListedModem { id, vendor, model })
        })
        .collect()
}

fn parse_modem_info(str: &str) -> Result<ModemInfo> {
    let json: serde_json::Value = serde_json::from_str(str)?;
    let generic = &json["modem"]["generic"];
    let threegpp = &json["modem"]["3gpp"];

    let state = generic["state"]
        .as_str()
        .wrap_err(jerr!("modem.generic.state"))?
        .trim();

    let online = matches!(
        state,
        "enabled"
            | "searching"
            | "registered"
            | "disconnecting"
            | "connecting"
            | "connected"
    );

    let imei = threegpp["imei"]
        .as_str()
        .or_else(|| generic["equipment-identifier"].as_str())
        .wrap_err(jerr!("modem.3gpp.imei"))?
        .to_string();

    let text = |v: &serde_json::Value| {
        v.as_str()
            .filter(|s| *s != "--" && !s.is_empty())
            .map(|s| s.to_string())
    };

    let access_tech = generic["access-technologies"]
        .as_array()
        .and_then(|a| a.first()?.as_str())
        .map(|at| at.to_string());

    let sim = generic["sim"]
        .as_str()
        .filter(|s| *s != "/")
        .and_then(|s| s.rsplit('/').next())
        .map(|s| s.to_string());

    let net_port = generic["ports"].as_array().and_then(|ports| {
        ports.iter().filter_map(|p| p.as_str()).find_map(|p| {
            p.strip_suffix(" (net)").map(|name| name.trim().to_string())
        })
    });

    Ok(ModemInfo {
        imei,
        operator_code: text(&threegpp["operator-code"]),
        operator_name: text(&threegpp["operator-name"]),
        access_tech,
        online,
        roaming: threegpp["registration-state"].as_str() == Some("roaming"),
        sim,
        primary_port: text(&generic["primary-port"]),
        net_port,
    })
}

/// RSRQ of the first access technology that reports one.
fn parse_signal_quality(str: &str) -> Result<Option<f64>> {
    let json: serde_json::Value = serde_json::from_str(str)?;

    let rsrq = ["5g", "lte", "gsm", "umts", "cdma1x", "evdo"]
        .iter()
        .find_map(|access_tech| {
            json["modem"]["signal"][access_tech]["rsrq"]
                .as_str()
                .and_then(|x| x.parse().ok())
        });

    Ok(rsrq)
}

fn parse_sim_imsi(str: &str) -> Result<String> {
    let json: serde_json::Value = serde_json::from_str(str)?;

    let imsi = json["sim"]["properties"]["imsi"]
        .as_str()
        .wrap_err(jerr!("sim.properties.imsi"))?
        .to_string();

    Ok(imsi)
}
