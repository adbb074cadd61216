use super::{Technology, TechnologyType};
use crate::{keyfile::KeyFile, settings::SettingsStore};
use tracing::{debug, error, warn};

const GLOBAL: &str = "global";
const OFFLINE_MODE: &str = "OfflineMode";
const ENABLE: &str = "Enable";
const TETHERING_IDENTIFIER: &str = "Tethering.Identifier";
const TETHERING_PASSPHRASE: &str = "Tethering.Passphrase";

/// Wired technologies are enabled unless configured otherwise.
fn default_enabled(kind: TechnologyType) -> bool {
    kind == TechnologyType::Ethernet
}

async fn load_keyfile(settings: &dyn SettingsStore) -> Option<KeyFile> {
    match settings.load_global().await {
        Ok(keyfile) => keyfile,
        Err(e) => {
            warn!("failed to load settings: {e}");
            None
        }
    }
}

/// Restores the persisted state of `tech`. A missing `Enable` key is filled in with
/// the default and written back.
pub(super) async fn load(settings: &dyn SettingsStore, tech: &mut Technology) {
    let name = tech.kind.name();

    let Some(keyfile) = load_keyfile(settings).await else {
        tech.enable_persistent = default_enabled(tech.kind);
        return;
    };

    match keyfile.get_bool(name, ENABLE) {
        Some(enabled) => tech.enable_persistent = enabled,
        None => {
            tech.enable_persistent = default_enabled(tech.kind);
            save(settings, tech).await;
        }
    }

    tech.tethering_identifier = keyfile
        .get_string(name, TETHERING_IDENTIFIER)
        .map(|s| s.to_string());
    tech.tethering_passphrase = keyfile
        .get_string(name, TETHERING_PASSPHRASE)
        .map(|s| s.to_string());

    debug!(
        "loaded {name}: enable {}, tethering identifier set: {}",
        tech.enable_persistent,
        tech.tethering_identifier.is_some()
    );
}

pub(super) async fn save(settings: &dyn SettingsStore, tech: &Technology) {
    let name = tech.kind.name();
    let mut keyfile = load_keyfile(settings).await.unwrap_or_default();

    keyfile.set_bool(name, ENABLE, tech.enable_persistent);

    if let Some(identifier) = &tech.tethering_identifier {
        keyfile.set_string(name, TETHERING_IDENTIFIER, identifier);
    }

    if let Some(passphrase) = &tech.tethering_passphrase {
        keyfile.set_string(name, TETHERING_PASSPHRASE, passphrase);
    }

    if let Err(e) = settings.save_global(&keyfile).await {
        error!("failed to save {name} settings: {e}");
    }
}

pub(super) async fn load_offline_mode(settings: &dyn SettingsStore) -> bool {
    load_keyfile(settings)
        .await
        .and_then(|keyfile| keyfile.get_bool(GLOBAL, OFFLINE_MODE))
        .unwrap_or(false)
}

pub(super) async fn save_offline_mode(settings: &dyn SettingsStore, offline: bool) {
    let mut keyfile = load_keyfile(settings).await.unwrap_or_default();
    keyfile.set_bool(GLOBAL, OFFLINE_MODE, offline);

    if let Err(e) = settings.save_global(&keyfile).await {
        error!("failed to save offline mode: {e}");
    }
}
