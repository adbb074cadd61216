//! Glue between modem sessions and the cellular technology.

use crate::{
    error::Result,
    manager::SessionManager,
    technology::{TechDevice, TechnologyDriver, TechnologyType, Toggle},
};
use async_trait::async_trait;

/// A probed modem as seen by the technology manager. Powering it brings its data
/// interface up or down.
pub struct CellularDevice {
    sessions: SessionManager,
    path: String,
}

impl CellularDevice {
    pub fn new(sessions: SessionManager, path: impl Into<String>) -> Self {
        Self {
            sessions,
            path: path.into(),
        }
    }
}

#[async_trait]
impl TechDevice for CellularDevice {
    fn ident(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> TechnologyType {
        TechnologyType::Cellular
    }

    fn is_powered(&self) -> bool {
        self.sessions.is_powered(&self.path)
    }

    async fn enable(&self) -> Result<Toggle> {
        self.sessions.enable_device(&self.path).await
    }

    async fn disable(&self) -> Result<Toggle> {
        self.sessions.disable_device(&self.path).await
    }
}

/// Backs the cellular technology. Tethering over a modem is not supported.
pub struct CellularDriver;

impl CellularDriver {
    pub const NAME: &str = "cellular";
}

#[async_trait]
impl TechnologyDriver for CellularDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> TechnologyType {
        TechnologyType::Cellular
    }
}
