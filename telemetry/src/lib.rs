//! Logging setup for modemd. Start with [`TelemetryConfig::new()`].

use std::io::{IsTerminal as _, Write as _};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter,
};

/// The toplevel logging config.
#[derive(Debug)]
pub struct TelemetryConfig {
    syslog_identifier: Option<String>,
    global_filter: EnvFilter,
}

impl TelemetryConfig {
    /// Logs at `INFO` unless `RUST_LOG` says otherwise.
    #[expect(clippy::new_without_default, reason = "may add required args later")]
    #[must_use]
    pub fn new() -> Self {
        Self {
            syslog_identifier: None,
            global_filter: EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        }
    }

    /// Enables journald, and uses the provided syslog identifier.
    ///
    /// If you run the application in a tty, stderr will be used instead.
    #[must_use]
    pub fn with_journald(self, syslog_identifier: &str) -> Self {
        Self {
            syslog_identifier: Some(syslog_identifier.to_owned()),
            ..self
        }
    }

    pub fn try_init(
        self,
    ) -> Result<TelemetryFlusher, tracing_subscriber::util::TryInitError> {
        let registry = tracing_subscriber::registry();
        // The type is only there to get it to compile.
        let tokio_console_layer: Option<tracing_subscriber::layer::Identity> = None;
        #[cfg(tokio_unstable)]
        let tokio_console_layer = console_subscriber::spawn();
        // No terminal means we are running under systemd.
        let journald_layer = if !std::io::stderr().is_terminal() {
            self.syslog_identifier.and_then(|syslog_identifier| {
                tracing_journald::layer()
                    .inspect_err(|err| {
                        eprintln!(
                            "failed connecting to journald socket. \
                        will write to stderr: {err}"
                        );
                    })
                    .map(|layer| layer.with_syslog_identifier(syslog_identifier))
                    .ok()
            })
        } else {
            None
        };
        let stderr_layer = journald_layer
            .is_none()
            .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

        registry
            .with(tokio_console_layer)
            .with(stderr_layer)
            .with(journald_layer)
            .with(self.global_filter)
            .try_init()?;

        Ok(TelemetryFlusher { _priv: () })
    }

    /// Call this only once, at the beginning of the program.
    ///
    /// Panics when another tracing subscriber is already registered.
    pub fn init(self) -> TelemetryFlusher {
        self.try_init().expect("failed to initialize modemd-telemetry")
    }
}

/// Flushes buffered log output on exit.
#[must_use = "call .flush at the end of the program, otherwise logs may get lost"]
pub struct TelemetryFlusher {
    _priv: (),
}

impl TelemetryFlusher {
    pub async fn flush(self) {
        // technically blocks, but no one really cares for stderr/out.
        std::io::stderr().flush().ok();
        std::io::stdout().flush().ok();
    }
}
