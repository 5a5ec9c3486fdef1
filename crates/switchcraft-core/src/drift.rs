use crate::desired::{ApplyMode, DesiredState, VlanAction};
use crate::model::{DeviceConfig, Port, DEFAULT_VLAN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-entity drift verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftVerdict {
    InSync,
    /// Desired but not on the device.
    Missing,
    /// On the device but not desired; only meaningful in full mode.
    Extra,
    /// Present on both but attributes disagree.
    Differs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEntry {
    /// `vlan:100`, `port:1/1/5`, `setting:hostname`
    pub entity: String,
    pub verdict: DriftVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Side-effect-free comparison of stored desired state against a freshly
/// fetched device config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub device_id: String,
    pub generated_at: DateTime<Utc>,
    pub mode: ApplyMode,
    pub entries: Vec<DriftEntry>,
    pub in_sync: usize,
    pub missing: usize,
    pub extra: usize,
    pub differs: usize,
}

impl DriftReport {
    pub fn clean(&self) -> bool {
        self.missing == 0 && self.extra == 0 && self.differs == 0
    }
}

pub fn detect_drift(desired: &DesiredState, observed: &DeviceConfig) -> DriftReport {
    let mut entries = Vec::new();

    for (&id, desired_vlan) in &desired.vlans {
        let entity = format!("vlan:{}", id);
        match (desired_vlan.action, observed.vlans.get(&id)) {
            (VlanAction::Absent, Some(_)) => entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::Extra,
                detail: Some("marked absent but present on device".to_string()),
            }),
            (VlanAction::Absent, None) => entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::InSync,
                detail: None,
            }),
            (VlanAction::Ensure, None) => entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::Missing,
                detail: None,
            }),
            (VlanAction::Ensure, Some(on_device)) => {
                let target = desired_vlan.to_vlan(id);
                let mut details = Vec::new();
                if target.name != on_device.name {
                    details.push(format!(
                        "name {:?} != {:?}",
                        on_device.name, target.name
                    ));
                }
                if target.untagged_ports != on_device.untagged_ports {
                    details.push("untagged membership differs".to_string());
                }
                if target.tagged_ports != on_device.tagged_ports {
                    details.push("tagged membership differs".to_string());
                }
                if target.l3_interface != on_device.l3_interface {
                    details.push("l3 interface differs".to_string());
                }
                if details.is_empty() {
                    entries.push(DriftEntry {
                        entity,
                        verdict: DriftVerdict::InSync,
                        detail: None,
                    });
                } else {
                    entries.push(DriftEntry {
                        entity,
                        verdict: DriftVerdict::Differs,
                        detail: Some(details.join("; ")),
                    });
                }
            }
        }
    }

    if desired.mode == ApplyMode::Full {
        for &id in observed.vlans.keys() {
            if id != DEFAULT_VLAN && !desired.vlans.contains_key(&id) {
                entries.push(DriftEntry {
                    entity: format!("vlan:{}", id),
                    verdict: DriftVerdict::Extra,
                    detail: None,
                });
            }
        }
    }

    for (id, desired_port) in &desired.ports {
        let entity = format!("port:{}", id);
        match observed.ports.get(id) {
            None => entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::Missing,
                detail: None,
            }),
            Some(on_device) => {
                let mut target = Port::new(id.clone());
                target.enabled = desired_port.enabled;
                target.description = desired_port.description.clone();
                target.speed = desired_port.speed;
                if on_device.managed_eq(&target) {
                    entries.push(DriftEntry {
                        entity,
                        verdict: DriftVerdict::InSync,
                        detail: None,
                    });
                } else {
                    entries.push(DriftEntry {
                        entity,
                        verdict: DriftVerdict::Differs,
                        detail: Some("managed attributes differ".to_string()),
                    });
                }
            }
        }
    }

    for (key, value) in &desired.settings {
        let entity = format!("setting:{}", key);
        match observed.settings.get(key) {
            None => entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::Missing,
                detail: None,
            }),
            Some(observed_value) if observed_value == value => entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::InSync,
                detail: None,
            }),
            Some(observed_value) => entries.push(DriftEntry {
                entity,
                verdict: DriftVerdict::Differs,
                detail: Some(format!("{} != {}", observed_value, value)),
            }),
        }
    }

    let count = |v: DriftVerdict| entries.iter().filter(|e| e.verdict == v).count();
    let report = DriftReport {
        device_id: desired.device_id.clone(),
        generated_at: Utc::now(),
        mode: desired.mode,
        in_sync: count(DriftVerdict::InSync),
        missing: count(DriftVerdict::Missing),
        extra: count(DriftVerdict::Extra),
        differs: count(DriftVerdict::Differs),
        entries,
    };
    debug!(
        target: "drift::detect_drift",
        device_id = %report.device_id,
        in_sync = report.in_sync,
        missing = report.missing,
        extra = report.extra,
        differs = report.differs,
        "drift report generated"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredVlan;
    use crate::model::{PortId, Vlan};

    fn desired_with_vlan(id: u16, untagged: &[&str]) -> DesiredState {
        let mut desired = DesiredState::new("sw1");
        desired.vlans.insert(
            id,
            DesiredVlan {
                name: None,
                untagged_ports: untagged.iter().map(|p| p.parse().unwrap()).collect(),
                tagged_ports: Default::default(),
                l3_interface: None,
                action: VlanAction::Ensure,
            },
        );
        desired
    }

    #[test]
    fn in_sync_device_reports_clean() {
        let desired = desired_with_vlan(100, &["5"]);
        let mut observed = DeviceConfig::new("sw1");
        let mut vlan = Vlan::new(100);
        vlan.untagged_ports.insert(PortId::Plain(5));
        observed.insert_vlan(vlan);

        let report = detect_drift(&desired, &observed);
        assert!(report.clean());
        assert_eq!(report.in_sync, 1);
    }

    #[test]
    fn missing_vlan_detected() {
        let desired = desired_with_vlan(100, &["5"]);
        let observed = DeviceConfig::new("sw1");
        let report = detect_drift(&desired, &observed);
        assert_eq!(report.missing, 1);
        assert_eq!(report.entries[0].entity, "vlan:100");
    }

    #[test]
    fn differs_when_membership_disagrees() {
        let desired = desired_with_vlan(100, &["5", "6"]);
        let mut observed = DeviceConfig::new("sw1");
        let mut vlan = Vlan::new(100);
        vlan.untagged_ports.insert(PortId::Plain(5));
        observed.insert_vlan(vlan);

        let report = detect_drift(&desired, &observed);
        assert_eq!(report.differs, 1);
        assert!(report.entries[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("untagged"));
    }

    #[test]
    fn extra_only_reported_in_full_mode() {
        let mut observed = DeviceConfig::new("sw1");
        observed.insert_vlan(Vlan::new(1));
        observed.insert_vlan(Vlan::new(200));

        let mut desired = DesiredState::new("sw1");
        let patch_report = detect_drift(&desired, &observed);
        assert_eq!(patch_report.extra, 0);

        desired.mode = ApplyMode::Full;
        let full_report = detect_drift(&desired, &observed);
        assert_eq!(full_report.extra, 1);
        // VLAN 1 is never extra.
        assert!(full_report.entries.iter().all(|e| e.entity != "vlan:1"));
    }
}
