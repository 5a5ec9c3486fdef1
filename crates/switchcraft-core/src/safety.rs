use crate::device::DeviceSpec;
use crate::diff::ConfigDiff;
use crate::error::SwitchcraftError;
use crate::model::PortId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

pub const HIL_MODE_ENV: &str = "SWITCHCRAFT_HIL_MODE";
pub const HIL_VLAN_ENV: &str = "SWITCHCRAFT_HIL_VLAN";
pub const HIL_ALLOWED_DEVICES_ENV: &str = "SWITCHCRAFT_HIL_ALLOWED_DEVICES";

/// Hardware-in-the-loop constraint profile. When active, every write is
/// pre-checked against it before any planner work or connection attempt.
#[derive(Debug, Clone)]
pub struct HilConstraints {
    /// VLANs a write may touch. Default {999}.
    pub allowed_vlans: BTreeSet<u16>,
    /// Hosts writes are allowed against; `None` allows all.
    pub allowed_devices: Option<BTreeSet<String>>,
    /// Per-device allowed ports; devices absent from the map have no port
    /// restriction.
    pub allowed_ports: BTreeMap<String, BTreeSet<PortId>>,
    /// VLANs no write may ever touch.
    pub protected_vlans: BTreeSet<u16>,
    /// Upper bound on ports changed by a single call.
    pub max_ports_per_call: usize,
}

impl Default for HilConstraints {
    fn default() -> Self {
        Self {
            allowed_vlans: [999].into_iter().collect(),
            allowed_devices: None,
            allowed_ports: BTreeMap::new(),
            protected_vlans: [1].into_iter().collect(),
            max_ports_per_call: 8,
        }
    }
}

impl HilConstraints {
    /// Read the profile from the environment. Returns `None` when HIL mode
    /// is off.
    pub fn from_env() -> Option<Self> {
        let mode = std::env::var(HIL_MODE_ENV).ok()?;
        if mode != "1" && !mode.eq_ignore_ascii_case("true") {
            return None;
        }

        let mut constraints = HilConstraints::default();
        if let Ok(raw) = std::env::var(HIL_VLAN_ENV) {
            let vlans: BTreeSet<u16> = raw
                .split(',')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            if !vlans.is_empty() {
                constraints.allowed_vlans = vlans;
            }
        }
        if let Ok(raw) = std::env::var(HIL_ALLOWED_DEVICES_ENV) {
            let devices: BTreeSet<String> = raw
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
            if !devices.is_empty() {
                constraints.allowed_devices = Some(devices);
            }
        }
        info!(target: "HilConstraints::from_env", allowed_vlans = ?constraints.allowed_vlans, "HIL mode active");
        Some(constraints)
    }

    /// Check one write against the profile. Called with the operation's
    /// touched entities, before any wire activity.
    pub fn check_write(
        &self,
        spec: &DeviceSpec,
        touched_vlans: &[u16],
        touched_ports: &[PortId],
    ) -> Result<(), SwitchcraftError> {
        if let Some(allowed) = &self.allowed_devices {
            if !allowed.contains(&spec.host) && !allowed.contains(&spec.id) {
                warn!(target: "HilConstraints::check_write", device = %spec.id, host = %spec.host, "write blocked: device not in allowlist");
                return Err(SwitchcraftError::SafetyViolation(format!(
                    "device {} ({}) is not in the HIL device allowlist",
                    spec.id, spec.host
                )));
            }
        }

        for &vlan in touched_vlans {
            if self.protected_vlans.contains(&vlan) {
                return Err(SwitchcraftError::SafetyViolation(format!(
                    "VLAN {} is protected and may not be modified",
                    vlan
                )));
            }
            if !self.allowed_vlans.contains(&vlan) {
                return Err(SwitchcraftError::SafetyViolation(format!(
                    "VLAN {} is not in the HIL VLAN allowlist {:?}",
                    vlan, self.allowed_vlans
                )));
            }
        }

        if touched_ports.len() > self.max_ports_per_call {
            return Err(SwitchcraftError::SafetyViolation(format!(
                "operation touches {} ports, limit is {}",
                touched_ports.len(),
                self.max_ports_per_call
            )));
        }
        if let Some(allowed) = self.allowed_ports.get(&spec.id) {
            for port in touched_ports {
                if !allowed.contains(port) {
                    return Err(SwitchcraftError::SafetyViolation(format!(
                        "port {} on {} is not in the HIL port allowlist",
                        port, spec.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Convenience wrapper over a computed diff.
    pub fn check_diff(&self, spec: &DeviceSpec, diff: &ConfigDiff) -> Result<(), SwitchcraftError> {
        self.check_write(spec, &diff.touched_vlans(), &diff.touched_ports())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TransportKind;

    fn spec(id: &str, host: &str) -> DeviceSpec {
        DeviceSpec {
            id: id.into(),
            transport: TransportKind::BrocadeTelnet,
            host: host.into(),
            port: 23,
            username: "admin".into(),
            password_env: "NETWORK_PASSWORD".into(),
            enable_password_required: false,
            capabilities: Default::default(),
        }
    }

    #[test]
    fn default_profile_allows_vlan_999_only() {
        let hil = HilConstraints::default();
        let device = spec("sw1", "192.168.254.2");
        assert!(hil.check_write(&device, &[999], &[]).is_ok());
        let err = hil.check_write(&device, &[100], &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SafetyViolation);
    }

    #[test]
    fn protected_vlan_always_blocked() {
        let mut hil = HilConstraints::default();
        hil.allowed_vlans.insert(1);
        let err = hil.check_write(&spec("sw1", "h"), &[1], &[]).unwrap_err();
        assert!(err.to_string().contains("protected"));
    }

    #[test]
    fn device_allowlist_enforced() {
        let mut hil = HilConstraints::default();
        hil.allowed_devices = Some(["192.168.254.10".to_string()].into_iter().collect());
        let blocked = spec("sw1", "192.168.254.2");
        assert!(hil.check_write(&blocked, &[999], &[]).is_err());
        let allowed = spec("sw2", "192.168.254.10");
        assert!(hil.check_write(&allowed, &[999], &[]).is_ok());
    }

    #[test]
    fn port_limit_enforced() {
        let hil = HilConstraints {
            max_ports_per_call: 2,
            ..Default::default()
        };
        let ports: Vec<PortId> = (1..=3).map(PortId::Plain).collect();
        let err = hil.check_write(&spec("sw1", "h"), &[999], &ports).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn per_device_port_allowlist() {
        let mut hil = HilConstraints::default();
        hil.allowed_ports.insert(
            "sw1".to_string(),
            [PortId::Plain(7)].into_iter().collect(),
        );
        assert!(hil
            .check_write(&spec("sw1", "h"), &[999], &[PortId::Plain(7)])
            .is_ok());
        assert!(hil
            .check_write(&spec("sw1", "h"), &[999], &[PortId::Plain(8)])
            .is_err());
    }
}
