use crate::error::SwitchcraftError;
use crate::model::{
    validate_vlan_id, L3Interface, PortId, PortSpeed, Vlan, DEFAULT_VLAN,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// How unlisted entities are treated when applying a desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Entities on the device but absent from the document are deleted.
    Full,
    /// Unlisted entities are left untouched.
    #[default]
    Patch,
}

/// Per-VLAN intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VlanAction {
    #[default]
    Ensure,
    Absent,
}

/// One VLAN entry in a desired-state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredVlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub untagged_ports: BTreeSet<PortId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tagged_ports: BTreeSet<PortId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3_interface: Option<L3Interface>,
    #[serde(default)]
    pub action: VlanAction,
}

impl DesiredVlan {
    pub fn to_vlan(&self, id: u16) -> Vlan {
        Vlan {
            id,
            name: self.name.clone(),
            untagged_ports: self.untagged_ports.clone(),
            tagged_ports: self.tagged_ports.clone(),
            l3_interface: self.l3_interface.clone(),
        }
    }
}

/// One port entry in a desired-state document. Only managed attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredPort {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<PortSpeed>,
}

fn default_enabled() -> bool {
    true
}

/// Declarative target configuration for one device.
///
/// The recognized top-level keys are fixed; anything else rejects the
/// document at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredState {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub mode: ApplyMode,
    #[serde(default)]
    pub vlans: BTreeMap<u16, DesiredVlan>,
    #[serde(default)]
    pub ports: BTreeMap<PortId, DesiredPort>,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl DesiredState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            version: None,
            checksum: None,
            mode: ApplyMode::Patch,
            vlans: BTreeMap::new(),
            ports: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    /// Parse a JSON document, then validate it.
    pub fn from_json(raw: &str) -> Result<Self, SwitchcraftError> {
        let state: DesiredState = serde_json::from_str(raw)
            .map_err(|e| SwitchcraftError::validation(format!("desired state rejected: {}", e)))?;
        state.validate()?;
        Ok(state)
    }

    /// Parse a YAML document, then validate it.
    pub fn from_yaml(raw: &str) -> Result<Self, SwitchcraftError> {
        let state: DesiredState = serde_yaml::from_str(raw)
            .map_err(|e| SwitchcraftError::validation(format!("desired state rejected: {}", e)))?;
        state.validate()?;
        Ok(state)
    }

    /// Canonical serialization: the document without its checksum field,
    /// emitted with sorted keys. Idempotent by construction.
    pub fn canonical_form(&self) -> Result<String, SwitchcraftError> {
        let mut stripped = self.clone();
        stripped.checksum = None;
        Ok(serde_json::to_string(&stripped)?)
    }

    /// sha256 hex over the canonical form.
    pub fn compute_checksum(&self) -> Result<String, SwitchcraftError> {
        let canonical = self.canonical_form()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Schema and invariant checks. Never touches the wire.
    pub fn validate(&self) -> Result<(), SwitchcraftError> {
        if self.device_id.is_empty() {
            return Err(SwitchcraftError::validation("device_id must not be empty"));
        }

        if let Some(expected) = &self.checksum {
            let actual = self.compute_checksum()?;
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(SwitchcraftError::validation(format!(
                    "checksum mismatch: document says {}, canonical form hashes to {}",
                    expected, actual
                )));
            }
        }

        let mut untagged_owner: BTreeMap<&PortId, u16> = BTreeMap::new();
        for (&id, vlan) in &self.vlans {
            validate_vlan_id(id)?;
            if id == DEFAULT_VLAN && vlan.action == VlanAction::Absent {
                return Err(SwitchcraftError::validation("Cannot delete VLAN 1"));
            }
            if let Some(port) = vlan.untagged_ports.intersection(&vlan.tagged_ports).next() {
                return Err(SwitchcraftError::validation(format!(
                    "port {} is both untagged and tagged in VLAN {}",
                    port, id
                )));
            }
            for port in &vlan.untagged_ports {
                if let Some(other) = untagged_owner.insert(port, id) {
                    return Err(SwitchcraftError::validation(format!(
                        "port {} untagged in both VLAN {} and VLAN {}",
                        port, other, id
                    )));
                }
            }
        }

        for value in self.settings.values() {
            if value.is_object() || value.is_array() {
                return Err(SwitchcraftError::validation(
                    "settings values must be scalars",
                ));
            }
        }

        debug!(target: "DesiredState::validate", device_id = %self.device_id, vlans = self.vlans.len(), "desired state validated");
        Ok(())
    }

    /// VLAN ids named by the document, deletions included.
    pub fn vlan_ids(&self) -> Vec<u16> {
        self.vlans.keys().copied().collect()
    }

    /// Ports named anywhere in the document.
    pub fn named_ports(&self) -> BTreeSet<PortId> {
        let mut out: BTreeSet<PortId> = self.ports.keys().cloned().collect();
        for vlan in self.vlans.values() {
            out.extend(vlan.untagged_ports.iter().cloned());
            out.extend(vlan.tagged_ports.iter().cloned());
        }
        out
    }
}
