//! Minimal INI-style key file, the format of the settings and provisioning files.
//!
//! ```text
//! [Cellular]
//! Enable=true
//! ```

use color_eyre::{eyre::bail, Result};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    groups: Vec<Group>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut keyfile = KeyFile::default();
        let mut current: Option<String> = None;

        for (lineno, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    bail!("line {}: unterminated group header", lineno + 1);
                };

                keyfile.group_mut(name.trim());
                current = Some(name.trim().to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected key=value", lineno + 1);
            };

            let Some(group) = current.as_deref() else {
                bail!("line {}: key outside of a group", lineno + 1);
            };

            keyfile.set_string(group, key.trim(), value.trim());
        }

        Ok(keyfile)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    pub fn get_string(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.name == group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Accepts `true`/`false` and `1`/`0`. Anything else reads as missing.
    pub fn get_bool(&self, group: &str, key: &str) -> Option<bool> {
        match self.get_string(group, key)? {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn set_string(&mut self, group: &str, key: &str, value: &str) {
        let group = self.group_mut(group);
        match group.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => group.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set_string(group, key, if value { "true" } else { "false" });
    }

    pub fn remove_key(&mut self, group: &str, key: &str) {
        if let Some(group) = self.groups.iter_mut().find(|g| g.name == group) {
            group.entries.retain(|(k, _)| k != key);
        }
    }

    fn group_mut(&mut self, name: &str) -> &mut Group {
        let pos = match self.groups.iter().position(|g| g.name == name) {
            Some(pos) => pos,
            None => {
                self.groups.push(Group {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.groups.len() - 1
            }
        };

        &mut self.groups[pos]
    }
}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }

            writeln!(f, "[{}]", group.name)?;
            for (key, value) in &group.entries {
                writeln!(f, "{key}={value}")?;
            }
        }

        Ok(())
    }
}
