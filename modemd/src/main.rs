use clap::Parser;
use color_eyre::eyre::Result;
use modemd::{
    link::IpLink,
    nat::{ExternalNat, IptablesNat, NatControl},
    provisioning::KeyFileProvisioning,
    publish::NetworkTable,
    session::DisconnectPolicy,
    settings::FileSettings,
    technology::RfkillCli,
    transport::mmcli::MmcliTransport,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, warn};

const SYSLOG_IDENTIFIER: &str = "modemd";

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory holding `settings`.
    #[arg(long, env = "MODEMD_STATE_DIR", default_value = "/var/lib/modemd")]
    state_dir: PathBuf,

    /// Directory of `*.config` service provisioning files.
    #[arg(
        long,
        env = "MODEMD_PROVISIONING_DIR",
        default_value = "/var/lib/modemd/provisioning"
    )]
    provisioning_dir: PathBuf,

    /// How often ModemManager is polled, in seconds.
    #[arg(
        long,
        env = "MODEMD_POLL_INTERVAL",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval: u64,

    /// How often rfkill switches are polled, in seconds.
    #[arg(
        long,
        env = "MODEMD_RFKILL_POLL_INTERVAL",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    rfkill_poll_interval: u64,

    /// How long a pending power change may take, in seconds.
    #[arg(long, env = "MODEMD_POWER_TIMEOUT", default_value_t = 10)]
    power_timeout: u64,

    /// Delay before a failed modem open is retried, in seconds.
    #[arg(long, env = "MODEMD_OPEN_RETRY", default_value_t = 10)]
    open_retry: u64,

    #[arg(long, env = "MODEMD_DISCONNECT_POLICY", value_enum, default_value_t)]
    disconnect_policy: DisconnectPolicy,

    /// Bridge used for tethering. Tethering is unsupported without one.
    #[arg(long, env = "MODEMD_TETHERING_BRIDGE")]
    tethering_bridge: Option<String>,

    /// Masquerade traffic leaving a connected modem with iptables.
    #[arg(long, env = "MODEMD_MASQUERADE")]
    masquerade: bool,

    /// Connect opened modems automatically, checking every N seconds.
    #[arg(
        long,
        env = "MODEMD_AUTOCONNECT",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    autoconnect: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let tel_flusher = modemd_telemetry::TelemetryConfig::new()
        .with_journald(SYSLOG_IDENTIFIER)
        .init();

    let args = Args::parse();

    let result = async {
        let provisioning = KeyFileProvisioning::load(&args.provisioning_dir).await?;
        info!(
            "loaded {} provisioned services from {}",
            provisioning.len(),
            args.provisioning_dir.display()
        );

        let nat: Arc<dyn NatControl> = if args.masquerade {
            Arc::new(IptablesNat)
        } else {
            Arc::new(ExternalNat)
        };

        let mut daemon = modemd::program()
            .transport(Arc::new(MmcliTransport::new(Duration::from_secs(
                args.poll_interval,
            ))))
            .publisher(Arc::new(NetworkTable::new()))
            .provisioning(Arc::new(provisioning))
            .settings(Arc::new(FileSettings::new(args.state_dir.join("settings"))))
            .link(Arc::new(IpLink))
            .nat(nat)
            .rfkill(Arc::new(RfkillCli))
            .disconnect_policy(args.disconnect_policy)
            .open_retry_backoff(Duration::from_secs(args.open_retry))
            .power_timeout(Duration::from_secs(args.power_timeout))
            .maybe_tethering_bridge(args.tethering_bridge)
            .maybe_autoconnect(args.autoconnect.map(Duration::from_secs))
            .run()
            .await?;

        daemon.spawn_rfkill_events(RfkillCli::watch(Duration::from_secs(
            args.rfkill_poll_interval,
        )));

        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigint = unix::signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => warn!("received SIGTERM"),
            _ = sigint.recv()  => warn!("received SIGINT"),
        }

        info!("shutting down and exiting gracefully");
        daemon.shutdown().await;

        Ok(())
    }
    .await;

    tel_flusher.flush().await;

    result
}
