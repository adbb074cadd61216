//! Provisioned per-network service configuration.
//!
//! Provisioning files are key files named `*.config`. Each `[service_*]` group with
//! `Type=cellular` provisions the network whose group is `<IMSI>_none`:
//!
//! ```text
//! [service_home]
//! Type=cellular
//! IMSI=262021234567890
//! APN=internet
//! Username=web
//! Passphrase=web
//! Provider=Vodafone
//! ```

use crate::{keyfile::KeyFile, session::group_ident, transport::Credentials};
use color_eyre::{eyre::WrapErr, Result};
use std::{collections::HashMap, io, path::Path};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub apn: Option<String>,
    pub username: Option<String>,
    pub passphrase: Option<String>,
    pub provider: Option<String>,
}

impl ServiceConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            apn: self.apn.clone().unwrap_or_default(),
            username: self.username.clone(),
            password: self.passphrase.clone(),
        }
    }
}

pub trait ServiceConfigStore: 'static + Send + Sync {
    fn lookup_config_for_network(&self, group: &str) -> Option<ServiceConfig>;
}

impl ServiceConfigStore for HashMap<String, ServiceConfig> {
    fn lookup_config_for_network(&self, group: &str) -> Option<ServiceConfig> {
        self.get(group).cloned()
    }
}

/// Service configs loaded once from a directory of provisioning files.
#[derive(Debug, Default)]
pub struct KeyFileProvisioning {
    configs: HashMap<String, ServiceConfig>,
}

impl KeyFileProvisioning {
    /// A missing directory provisions nothing. Unparsable files are skipped.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut provisioning = Self::default();

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no provisioning directory at {}", dir.display());
                return Ok(provisioning);
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to read {}", dir.display()));
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("config") {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .await
                .map_err(color_eyre::Report::from)
                .and_then(|contents| KeyFile::parse(&contents));

            match parsed {
                Ok(keyfile) => provisioning.add_keyfile(&keyfile),
                Err(e) => warn!("skipping provisioning file {}: {e}", path.display()),
            }
        }

        info!(
            "loaded {} cellular service configs from {}",
            provisioning.configs.len(),
            dir.display()
        );

        Ok(provisioning)
    }

    pub fn add_keyfile(&mut self, keyfile: &KeyFile) {
        for group in keyfile.groups().filter(|g| g.starts_with("service_")) {
            if keyfile.get_string(group, "Type") != Some("cellular") {
                continue;
            }

            let Some(imsi) = keyfile.get_string(group, "IMSI") else {
                warn!("provisioning group {group} has no IMSI, ignoring");
                continue;
            };

            let get = |key| keyfile.get_string(group, key).map(|v| v.to_string());
            let config = ServiceConfig {
                apn: get("APN"),
                username: get("Username"),
                passphrase: get("Passphrase"),
                provider: get("Provider"),
            };

            self.configs.insert(group_ident(Some(imsi), None), config);
        }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl ServiceConfigStore for KeyFileProvisioning {
    fn lookup_config_for_network(&self, group: &str) -> Option<ServiceConfig> {
        self.configs.get(group).cloned()
    }
}
