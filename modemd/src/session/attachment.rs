use super::{Refresh, Telemetry};
use crate::{
    error::{Error, Result},
    publish::{NetworkId, NetworkPublisher},
    technology::TechnologyType,
};
use std::{fmt, sync::Arc};
use tracing::warn;

/// The network record a session publishes to the host daemon while it is open.
pub struct NetworkAttachment {
    publisher: Arc<dyn NetworkPublisher>,
    device: String,
    id: NetworkId,
    group: String,
}

impl fmt::Debug for NetworkAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkAttachment")
            .field("device", &self.device)
            .field("id", &self.id)
            .field("group", &self.group)
            .finish()
    }
}

impl NetworkAttachment {
    pub(crate) fn create(
        publisher: Arc<dyn NetworkPublisher>,
        device: &str,
        telemetry: &Telemetry,
    ) -> Result<Self> {
        let id = publisher
            .create_network(device, TechnologyType::Cellular)
            .map_err(|e| Error::AllocationFailure(format!("network for {device}: {e}")))?;

        let group = telemetry.group();
        publisher.set_name(id, &telemetry.display_name());
        publisher.set_strength(id, telemetry.strength);
        publisher.set_group(id, &group);
        publisher.set_bool(id, "Roaming", telemetry.roaming);

        if let Err(e) = publisher.add_network(device, id) {
            publisher.remove_network(device, id);
            return Err(Error::AllocationFailure(format!(
                "network for {device}: {e}"
            )));
        }

        Ok(Self {
            publisher,
            device: device.to_string(),
            id,
            group,
        })
    }

    pub fn id(&self) -> NetworkId {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub(crate) fn refresh(&mut self, refresh: Refresh, telemetry: &Telemetry) {
        match refresh {
            Refresh::None => return,
            Refresh::Strength => self.publisher.set_strength(self.id, telemetry.strength),
            Refresh::Full => {
                self.publisher.set_name(self.id, &telemetry.display_name());
                self.publisher.set_strength(self.id, telemetry.strength);
                self.publisher.set_bool(self.id, "Roaming", telemetry.roaming);

                let group = telemetry.group();
                if group != self.group {
                    self.publisher.set_group(self.id, &group);
                    self.group = group;
                }
            }
        }

        if let Err(e) = self.publisher.update(self.id) {
            warn!(device = self.device, "failed to update network record: {e}");
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.publisher.set_connected(self.id, connected);
    }

    pub(crate) fn teardown(self) {
        self.publisher.set_connected(self.id, false);
        self.publisher.remove_network(&self.device, self.id);
    }
}
