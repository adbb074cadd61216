use super::SessionManager;
use crate::{
    session::PropertyUpdate,
    transport::{Signal, SignalKind},
};
use tracing::{debug, trace, warn};

impl SessionManager {
    /// Delivers a transport signal to the session holding its handle. Returns whether
    /// a session was found; signals for unknown handles are dropped.
    pub fn route_signal(&self, signal: Signal) -> bool {
        let Some(cell) = self.shared.registry.find_by_handle(&signal.handle) else {
            warn!("dropping signal for unknown handle {}", signal.handle);
            return false;
        };

        let mut session = cell.lock();
        let update = match signal.kind {
            SignalKind::State { online } => {
                session.set_online(online);
                return true;
            }

            SignalKind::Technology(rat) => PropertyUpdate::AccessTech(rat),
            SignalKind::Property(update) => update,
        };

        match session.receive_property_update(update) {
            Ok(refresh) => trace!("modem {} refreshed: {refresh:?}", cell.path()),
            Err(e) => debug!("dropping signal for modem {}: {e}", cell.path()),
        }

        true
    }
}
