use super::SessionManager;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

impl SessionManager {
    /// The modem control service is reachable: sessions closed by an earlier
    /// disappearance are rediscovered and the worker opens everything pending.
    pub fn service_appeared(&self) {
        info!("modem transport connected");
        self.shared.connected.store(true, Ordering::SeqCst);

        for cell in self.shared.registry.all() {
            if cell.lock().reset() {
                debug!("modem {} rediscovered", cell.path());
            }
        }

        self.ensure_worker();
        self.shared.wake();
    }

    /// The modem control service went away. Every session is closed; the handles it
    /// issued are gone with it, so nothing is released.
    pub async fn service_vanished(&self) {
        info!("modem transport disconnected");
        self.shared.connected.store(false, Ordering::SeqCst);

        for cell in self.shared.registry.all() {
            let closed = cell.lock().close();
            if let Some(closed) = closed {
                self.shared.cleanup(closed, false).await;
            }
        }

        self.shared.wake();
    }
}
