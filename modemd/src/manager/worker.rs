use super::{Shared, Wake};
use std::sync::Arc;
use tracing::{debug, info};

/// Opens pending sessions whenever it is woken up, for as long as the transport is
/// connected. Exits on [`Wake::Shutdown`].
pub(super) async fn run(shared: Arc<Shared>, wake_rx: flume::Receiver<Wake>) {
    info!("session worker started");

    while let Ok(wake) = wake_rx.recv_async().await {
        match wake {
            Wake::Shutdown => break,

            Wake::Scan if !shared.is_connected() => {
                debug!("transport unavailable, session worker idle");
            }

            Wake::Scan => shared.open_pending(),
        }
    }

    info!("session worker stopped");
}
