use super::TechnologyType;
use crate::utils::run_cmd;
use async_trait::async_trait;
use color_eyre::{
    eyre::{bail, ContextCompat},
    Result,
};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tokio::{task, time};
use tracing::{debug, warn};

/// A kill switch and its last known block state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfkillSwitch {
    pub index: u32,
    pub kind: TechnologyType,
    pub softblocked: bool,
    pub hardblocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfkillEvent {
    Added(RfkillSwitch),
    Changed(RfkillSwitch),
    Removed { index: u32, kind: TechnologyType },
}

/// Soft-blocks or unblocks every switch of a radio type.
#[async_trait]
pub trait RfkillControl: 'static + Send + Sync {
    async fn block(&self, kind: TechnologyType, blocked: bool) -> Result<()>;
}

/// [`RfkillControl`] through util-linux `rfkill`.
pub struct RfkillCli;

#[async_trait]
impl RfkillControl for RfkillCli {
    async fn block(&self, kind: TechnologyType, blocked: bool) -> Result<()> {
        let Some(rfkill_type) = kind.rfkill_type() else {
            bail!("{kind} has no rfkill switch");
        };

        let action = if blocked { "block" } else { "unblock" };
        run_cmd("rfkill", &[action, rfkill_type]).await?;
        debug!("rfkill {action} {rfkill_type}");

        Ok(())
    }
}

impl RfkillCli {
    /// Polls `rfkill -J` and reports switch changes. The first poll reports every
    /// switch as added.
    pub fn watch(interval: Duration) -> flume::Receiver<RfkillEvent> {
        let (tx, rx) = flume::unbounded();

        task::spawn(async move {
            let mut known: HashMap<u32, RfkillSwitch> = HashMap::new();

            loop {
                match list().await {
                    Ok(switches) => {
                        for event in diff_switches(&mut known, switches) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }

                    Err(e) => warn!("failed to list rfkill switches: {e}"),
                }

                time::sleep(interval).await;
            }
        });

        rx
    }
}

async fn list() -> Result<Vec<RfkillSwitch>> {
    let output = run_cmd("rfkill", &["-J"]).await?;

    parse_rfkill_list(&output)
}

#[derive(Debug, Deserialize)]
struct RfkillEntry {
    id: u32,
    #[serde(rename = "type")]
    kind: String,
    soft: String,
    hard: String,
}

/// Older util-linux versions key the device list with an empty string, newer ones
/// with `rfkilldevices`.
fn parse_rfkill_list(output: &str) -> Result<Vec<RfkillSwitch>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    let json: serde_json::Value = serde_json::from_str(output)?;
    let devices = json
        .as_object()
        .and_then(|o| o.values().find(|v| v.is_array()))
        .cloned()
        .wrap_err("could not find rfkill device list")?;

    let entries: Vec<RfkillEntry> = serde_json::from_value(devices)?;

    let switches = entries
        .into_iter()
        .filter_map(|e| {
            let kind = TechnologyType::from_rfkill_type(&e.kind)?;
            Some(RfkillSwitch {
                index: e.id,
                kind,
                softblocked: e.soft == "blocked",
                hardblocked: e.hard == "blocked",
            })
        })
        .collect();

    Ok(switches)
}

fn diff_switches(
    known: &mut HashMap<u32, RfkillSwitch>,
    current: Vec<RfkillSwitch>,
) -> Vec<RfkillEvent> {
    let mut events = Vec::new();
    let mut seen = Vec::with_capacity(current.len());

    for switch in current {
        seen.push(switch.index);
        match known.insert(switch.index, switch) {
            None => events.push(RfkillEvent::Added(switch)),
            Some(previous) if previous != switch => {
                events.push(RfkillEvent::Changed(switch))
            }
            Some(_) => {}
        }
    }

    known.retain(|index, switch| {
        let keep = seen.contains(index);
        if !keep {
            events.push(RfkillEvent::Removed {
                index: *index,
                kind: switch.kind,
            });
        }

        keep
    });

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_rfkill_json() {
        let old = r#"{"": [{"id":0,"type":"wlan","device":"phy0","soft":"unblocked","hard":"unblocked"},{"id":1,"type":"bluetooth","device":"hci0","soft":"blocked","hard":"unblocked"},{"id":2,"type":"nfc","device":"nfc0","soft":"unblocked","hard":"unblocked"}]}"#;
        let new = r#"{"rfkilldevices": [{"id":3,"type":"wwan","device":"wwan0","soft":"unblocked","hard":"blocked"}]}"#;

        let old = parse_rfkill_list(old).unwrap();
        let new = parse_rfkill_list(new).unwrap();

        assert_eq!(
            old,
            vec![
                RfkillSwitch {
                    index: 0,
                    kind: TechnologyType::Wifi,
                    softblocked: false,
                    hardblocked: false,
                },
                RfkillSwitch {
                    index: 1,
                    kind: TechnologyType::Bluetooth,
                    softblocked: true,
                    hardblocked: false,
                },
            ]
        );
        assert_eq!(
            new,
            vec![RfkillSwitch {
                index: 3,
                kind: TechnologyType::Cellular,
                softblocked: false,
                hardblocked: true,
            }]
        );
        assert!(parse_rfkill_list("").unwrap().is_empty());
    }

    #[test]
    fn it_diffs_switch_lists() {
        // Arrange
        let wifi = RfkillSwitch {
            index: 0,
            kind: TechnologyType::Wifi,
            softblocked: false,
            hardblocked: false,
        };
        let blocked = RfkillSwitch {
            softblocked: true,
            ..wifi
        };
        let mut known = HashMap::new();

        // Act
        let first = diff_switches(&mut known, vec![wifi]);
        let same = diff_switches(&mut known, vec![wifi]);
        let changed = diff_switches(&mut known, vec![blocked]);
        let removed = diff_switches(&mut known, vec![]);

        // Assert
        assert_eq!(first, vec![RfkillEvent::Added(wifi)]);
        assert!(same.is_empty());
        assert_eq!(changed, vec![RfkillEvent::Changed(blocked)]);
        assert_eq!(
            removed,
            vec![RfkillEvent::Removed {
                index: 0,
                kind: TechnologyType::Wifi
            }]
        );
        assert!(known.is_empty());
    }
}
