use super::{TechnologyType, Toggle};
use crate::error::{Error, Result};
use async_trait::async_trait;

/// A device that belongs to a technology and can be powered on or off.
#[async_trait]
pub trait TechDevice: 'static + Send + Sync {
    /// Unique among all devices.
    fn ident(&self) -> &str;

    fn kind(&self) -> TechnologyType;

    fn is_powered(&self) -> bool;

    /// [`Toggle::InProgress`] means the outcome is reported later through
    /// [`super::TechnologyManager::notify_powered`].
    async fn enable(&self) -> Result<Toggle>;

    async fn disable(&self) -> Result<Toggle>;
}

/// Backs a technology type. A technology only exists while a driver for its type is
/// registered.
#[async_trait]
pub trait TechnologyDriver: 'static + Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TechnologyType;

    /// Higher goes first.
    fn priority(&self) -> i32 {
        0
    }

    /// Called when a technology of this driver's type is created.
    fn probe(&self, _kind: TechnologyType) -> Result<()> {
        Ok(())
    }

    /// Called when the technology is destroyed or the driver unregistered.
    fn remove(&self, _kind: TechnologyType) {}

    async fn set_tethering(
        &self,
        _kind: TechnologyType,
        _identifier: Option<&str>,
        _passphrase: Option<&str>,
        _bridge: &str,
        _enabled: bool,
    ) -> Result<Toggle> {
        Err(Error::NotSupported)
    }
}
