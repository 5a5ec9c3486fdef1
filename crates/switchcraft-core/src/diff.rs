use crate::desired::{ApplyMode, DesiredState, VlanAction};
use crate::model::{DeviceConfig, Port, PortId, Vlan, DEFAULT_VLAN};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A VLAN present on both sides whose attributes disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanChange {
    pub before: Vlan,
    pub after: Vlan,
}

/// A managed-attribute change on one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChange {
    pub before: Option<Port>,
    pub after: Port,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingChange {
    pub key: String,
    pub before: Option<serde_json::Value>,
    pub after: serde_json::Value,
}

/// Difference between observed device state and a desired state.
///
/// Produced without I/O; all fields empty means "no change".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDiff {
    pub vlans_to_create: Vec<Vlan>,
    pub vlans_to_modify: Vec<VlanChange>,
    pub vlans_to_delete: Vec<Vlan>,
    pub ports_to_configure: Vec<PortChange>,
    pub settings_to_change: Vec<SettingChange>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.vlans_to_create.is_empty()
            && self.vlans_to_modify.is_empty()
            && self.vlans_to_delete.is_empty()
            && self.ports_to_configure.is_empty()
            && self.settings_to_change.is_empty()
    }

    /// Every VLAN id the diff touches, in ascending order.
    pub fn touched_vlans(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .vlans_to_create
            .iter()
            .map(|v| v.id)
            .chain(self.vlans_to_modify.iter().map(|c| c.after.id))
            .chain(self.vlans_to_delete.iter().map(|v| v.id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Every port the diff touches: configured ports plus membership moves.
    pub fn touched_ports(&self) -> Vec<PortId> {
        let mut ports: Vec<PortId> = self
            .ports_to_configure
            .iter()
            .map(|c| c.after.id.clone())
            .collect();
        for vlan in &self.vlans_to_create {
            ports.extend(vlan.untagged_ports.iter().cloned());
            ports.extend(vlan.tagged_ports.iter().cloned());
        }
        for change in &self.vlans_to_modify {
            ports.extend(
                change
                    .after
                    .untagged_ports
                    .symmetric_difference(&change.before.untagged_ports)
                    .cloned(),
            );
            ports.extend(
                change
                    .after
                    .tagged_ports
                    .symmetric_difference(&change.before.tagged_ports)
                    .cloned(),
            );
        }
        ports.sort();
        ports.dedup();
        ports
    }
}

/// Two VLANs are equal iff name, untagged set, tagged set, and L3 interface
/// all match. Port ordering is already normalized by the set types.
fn vlan_eq(a: &Vlan, b: &Vlan) -> bool {
    a.name == b.name
        && a.untagged_ports == b.untagged_ports
        && a.tagged_ports == b.tagged_ports
        && a.l3_interface == b.l3_interface
}

/// Compute the diff between the observed config and a desired state.
///
/// Ports untagged into a VLAN here may still be untagged elsewhere on the
/// device; the planner resolves those evictions because they are ordering
/// decisions, not state decisions.
pub fn diff_states(current: &DeviceConfig, desired: &DesiredState) -> ConfigDiff {
    let mut diff = ConfigDiff::default();

    for (&id, desired_vlan) in &desired.vlans {
        let target = desired_vlan.to_vlan(id);
        match (desired_vlan.action, current.vlans.get(&id)) {
            (VlanAction::Absent, Some(existing)) => {
                if id != DEFAULT_VLAN {
                    diff.vlans_to_delete.push(existing.clone());
                }
            }
            (VlanAction::Absent, None) => {}
            (VlanAction::Ensure, Some(existing)) => {
                if !vlan_eq(existing, &target) {
                    diff.vlans_to_modify.push(VlanChange {
                        before: existing.clone(),
                        after: target,
                    });
                }
            }
            (VlanAction::Ensure, None) => diff.vlans_to_create.push(target),
        }
    }

    if desired.mode == ApplyMode::Full {
        for (&id, existing) in &current.vlans {
            if id == DEFAULT_VLAN {
                continue;
            }
            if !desired.vlans.contains_key(&id) {
                diff.vlans_to_delete.push(existing.clone());
            }
        }
        diff.vlans_to_delete.sort_by_key(|v| v.id);
    }

    for (id, desired_port) in &desired.ports {
        let mut target = Port::new(id.clone());
        target.enabled = desired_port.enabled;
        target.description = desired_port.description.clone();
        target.speed = desired_port.speed;

        match current.ports.get(id) {
            Some(existing) if existing.managed_eq(&target) => {}
            Some(existing) => diff.ports_to_configure.push(PortChange {
                before: Some(existing.clone()),
                after: target,
            }),
            None => diff.ports_to_configure.push(PortChange {
                before: None,
                after: target,
            }),
        }
    }

    for (key, value) in &desired.settings {
        match current.settings.get(key) {
            Some(existing) if existing == value => {}
            existing => diff.settings_to_change.push(SettingChange {
                key: key.clone(),
                before: existing.cloned(),
                after: value.clone(),
            }),
        }
    }

    debug!(
        target: "diff::diff_states",
        device_id = %desired.device_id,
        create = diff.vlans_to_create.len(),
        modify = diff.vlans_to_modify.len(),
        delete = diff.vlans_to_delete.len(),
        ports = diff.ports_to_configure.len(),
        "computed diff"
    );
    diff
}

/// Diff an observed config against a plain `DeviceConfig` snapshot (used by
/// rollback verification). Ensure-only, patch semantics.
pub fn diff_configs(current: &DeviceConfig, target: &DeviceConfig) -> ConfigDiff {
    let mut desired = DesiredState::new(target.device_id.clone());
    for (&id, vlan) in &target.vlans {
        desired.vlans.insert(
            id,
            crate::desired::DesiredVlan {
                name: vlan.name.clone(),
                untagged_ports: vlan.untagged_ports.clone(),
                tagged_ports: vlan.tagged_ports.clone(),
                l3_interface: vlan.l3_interface.clone(),
                action: VlanAction::Ensure,
            },
        );
    }
    diff_states(current, &desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredVlan;
    use crate::model::PortId;
    use std::collections::BTreeSet;

    fn device_with_vlans(vlans: Vec<Vlan>) -> DeviceConfig {
        let mut config = DeviceConfig::new("sw1");
        for vlan in vlans {
            config.insert_vlan(vlan);
        }
        config
    }

    fn desired_vlan(untagged: &[&str], tagged: &[&str]) -> DesiredVlan {
        DesiredVlan {
            name: None,
            untagged_ports: untagged.iter().map(|p| p.parse().unwrap()).collect(),
            tagged_ports: tagged.iter().map(|p| p.parse().unwrap()).collect(),
            l3_interface: None,
            action: VlanAction::Ensure,
        }
    }

    #[test]
    fn identical_states_produce_empty_diff() {
        let mut vlan = Vlan::new(100);
        vlan.untagged_ports.insert(PortId::Plain(5));
        let current = device_with_vlans(vec![Vlan::new(1), vlan]);

        let mut desired = DesiredState::new("sw1");
        desired.vlans.insert(100, desired_vlan(&["5"], &[]));

        assert!(diff_states(&current, &desired).is_empty());
    }

    #[test]
    fn new_vlan_scheduled_for_create() {
        let current = device_with_vlans(vec![Vlan::new(1)]);
        let mut desired = DesiredState::new("sw1");
        desired.vlans.insert(100, desired_vlan(&["5", "6"], &[]));

        let diff = diff_states(&current, &desired);
        assert_eq!(diff.vlans_to_create.len(), 1);
        assert_eq!(diff.vlans_to_create[0].id, 100);
        assert!(diff.vlans_to_modify.is_empty());
    }

    #[test]
    fn attribute_change_scheduled_for_modify() {
        let mut existing = Vlan::new(100).with_name("Old");
        existing.untagged_ports.insert(PortId::Plain(5));
        let current = device_with_vlans(vec![existing]);

        let mut desired = DesiredState::new("sw1");
        let mut want = desired_vlan(&["5"], &[]);
        want.name = Some("New".to_string());
        desired.vlans.insert(100, want);

        let diff = diff_states(&current, &desired);
        assert_eq!(diff.vlans_to_modify.len(), 1);
        assert_eq!(diff.vlans_to_modify[0].before.name.as_deref(), Some("Old"));
        assert_eq!(diff.vlans_to_modify[0].after.name.as_deref(), Some("New"));
    }

    #[test]
    fn patch_mode_ignores_unlisted_device_vlans() {
        let current = device_with_vlans(vec![Vlan::new(1), Vlan::new(254)]);
        let desired = DesiredState::new("sw1");
        assert!(diff_states(&current, &desired).is_empty());
    }

    #[test]
    fn full_mode_deletes_unlisted_vlans_but_never_vlan_1() {
        let current = device_with_vlans(vec![Vlan::new(1), Vlan::new(254)]);
        let mut desired = DesiredState::new("sw1");
        desired.mode = ApplyMode::Full;

        let diff = diff_states(&current, &desired);
        assert_eq!(diff.vlans_to_delete.len(), 1);
        assert_eq!(diff.vlans_to_delete[0].id, 254);
    }

    #[test]
    fn absent_action_deletes_when_present() {
        let current = device_with_vlans(vec![Vlan::new(1), Vlan::new(50)]);
        let mut desired = DesiredState::new("sw1");
        let mut gone = desired_vlan(&[], &[]);
        gone.action = VlanAction::Absent;
        desired.vlans.insert(50, gone.clone());
        desired.vlans.insert(60, gone);

        let diff = diff_states(&current, &desired);
        assert_eq!(diff.vlans_to_delete.len(), 1);
        assert_eq!(diff.vlans_to_delete[0].id, 50);
    }

    #[test]
    fn diff_is_order_insensitive_for_port_sets() {
        let mut existing = Vlan::new(100);
        for p in [8u16, 5, 7, 6] {
            existing.untagged_ports.insert(PortId::Plain(p));
        }
        let current = device_with_vlans(vec![existing]);

        let mut desired = DesiredState::new("sw1");
        desired.vlans.insert(100, desired_vlan(&["5", "6", "7", "8"], &[]));
        assert!(diff_states(&current, &desired).is_empty());
    }

    #[test]
    fn port_changes_compare_managed_attributes_only() {
        let mut current = DeviceConfig::new("sw1");
        let mut port = Port::new(PortId::Plain(3));
        port.pvid = Some(100);
        current.ports.insert(port.id.clone(), port);

        let mut desired = DesiredState::new("sw1");
        desired.ports.insert(
            PortId::Plain(3),
            crate::desired::DesiredPort {
                enabled: true,
                description: None,
                speed: None,
            },
        );
        assert!(diff_states(&current, &desired).is_empty());
    }
}
