use crate::error::SwitchcraftError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub const VLAN_MIN: u16 = 1;
pub const VLAN_MAX: u16 = 4094;
pub const DEFAULT_VLAN: u16 = 1;

/// VLAN ids the Brocade firmware reserves for internal use.
pub const BROCADE_RESERVED_VLANS: [u16; 4] = [4087, 4090, 4093, 4094];

/// Vendor-normalized port identifier.
///
/// Ordering is numeric-tuple ordering within a variant; all ports of one
/// device share a variant, so canonical sorting is well defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortId {
    /// Brocade stacked identifier `unit/module/port`, e.g. `1/1/24`
    Stacked { unit: u8, module: u8, port: u16 },
    /// OpenWrt DSA-style name, e.g. `lan4`
    Lan(u16),
    /// Zyxel front-panel port number
    Plain(u16),
    /// Zyxel link aggregation group, e.g. `lag2`
    Lag(u16),
}

impl PortId {
    pub fn stacked(unit: u8, module: u8, port: u16) -> Self {
        PortId::Stacked { unit, module, port }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortId::Stacked { unit, module, port } => write!(f, "{}/{}/{}", unit, module, port),
            PortId::Lan(n) => write!(f, "lan{}", n),
            PortId::Plain(n) => write!(f, "{}", n),
            PortId::Lag(n) => write!(f, "lag{}", n),
        }
    }
}

impl FromStr for PortId {
    type Err = SwitchcraftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("lan") {
            let n = rest
                .parse::<u16>()
                .map_err(|_| SwitchcraftError::validation(format!("invalid port name: {}", s)))?;
            return Ok(PortId::Lan(n));
        }
        if let Some(rest) = s.strip_prefix("lag") {
            let n = rest
                .parse::<u16>()
                .map_err(|_| SwitchcraftError::validation(format!("invalid port name: {}", s)))?;
            return Ok(PortId::Lag(n));
        }
        if s.contains('/') {
            let parts: Vec<&str> = s.split('/').collect();
            if parts.len() != 3 {
                return Err(SwitchcraftError::validation(format!(
                    "invalid port name: {}",
                    s
                )));
            }
            let unit = parts[0]
                .parse::<u8>()
                .map_err(|_| SwitchcraftError::validation(format!("invalid port name: {}", s)))?;
            let module = parts[1]
                .parse::<u8>()
                .map_err(|_| SwitchcraftError::validation(format!("invalid port name: {}", s)))?;
            let port = parts[2]
                .parse::<u16>()
                .map_err(|_| SwitchcraftError::validation(format!("invalid port name: {}", s)))?;
            return Ok(PortId::Stacked { unit, module, port });
        }
        let n = s
            .parse::<u16>()
            .map_err(|_| SwitchcraftError::validation(format!("invalid port name: {}", s)))?;
        Ok(PortId::Plain(n))
    }
}

impl TryFrom<String> for PortId {
    type Error = SwitchcraftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortId> for String {
    fn from(value: PortId) -> Self {
        value.to_string()
    }
}

/// Managed port speed / duplex setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSpeed {
    Auto,
    TenHalf,
    TenFull,
    HundredHalf,
    HundredFull,
    GigFull,
    TenGig,
}

impl fmt::Display for PortSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortSpeed::Auto => "auto",
            PortSpeed::TenHalf => "10-half",
            PortSpeed::TenFull => "10-full",
            PortSpeed::HundredHalf => "100-half",
            PortSpeed::HundredFull => "100-full",
            PortSpeed::GigFull => "1000-full",
            PortSpeed::TenGig => "10G",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PortSpeed {
    type Err = SwitchcraftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(PortSpeed::Auto),
            "10-half" => Ok(PortSpeed::TenHalf),
            "10-full" => Ok(PortSpeed::TenFull),
            "100-half" => Ok(PortSpeed::HundredHalf),
            "100-full" => Ok(PortSpeed::HundredFull),
            "1000-full" => Ok(PortSpeed::GigFull),
            "10G" => Ok(PortSpeed::TenGig),
            other => Err(SwitchcraftError::validation(format!(
                "invalid port speed: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for PortSpeed {
    type Error = SwitchcraftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSpeed> for String {
    fn from(value: PortSpeed) -> Self {
        value.to_string()
    }
}

/// Observed link state; read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

/// Normalized switch port.
///
/// `description` and `speed` are managed; `link_state` and `pvid` are
/// observations and never compared when diffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<PortSpeed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_state: Option<LinkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvid: Option<u16>,
}

fn default_true() -> bool {
    true
}

impl Port {
    pub fn new(id: PortId) -> Self {
        Self {
            id,
            enabled: true,
            description: None,
            speed: None,
            link_state: None,
            pvid: None,
        }
    }

    /// Equality over the managed attributes only.
    pub fn managed_eq(&self, other: &Port) -> bool {
        self.enabled == other.enabled
            && self.description == other.description
            && self.speed == other.speed
    }
}

/// Optional L3 interface bound to a VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L3Interface {
    pub address: String,
    pub mask: String,
}

/// Normalized VLAN. Port sets are kept sorted; `untagged_ports` and
/// `tagged_ports` are disjoint on a valid device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    pub id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub untagged_ports: BTreeSet<PortId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tagged_ports: BTreeSet<PortId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3_interface: Option<L3Interface>,
}

impl Vlan {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            name: None,
            untagged_ports: BTreeSet::new(),
            tagged_ports: BTreeSet::new(),
            l3_interface: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn contains_port(&self, port: &PortId) -> bool {
        self.untagged_ports.contains(port) || self.tagged_ports.contains(port)
    }
}

/// Validate a VLAN id against the universal range. Vendor-specific reserved
/// ranges are checked by the handlers.
pub fn validate_vlan_id(id: u16) -> Result<(), SwitchcraftError> {
    if id < VLAN_MIN || id > VLAN_MAX {
        return Err(SwitchcraftError::validation(format!(
            "VLAN id {} out of range {}..={}",
            id, VLAN_MIN, VLAN_MAX
        )));
    }
    Ok(())
}

/// Complete normalized configuration of one device.
///
/// Structural equality after normalization: VLANs keyed by id, ports keyed by
/// id, port sets sorted by numeric tuple (`BTreeSet`/`BTreeMap` keep both
/// properties by construction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    pub device_id: String,
    #[serde(default)]
    pub vlans: BTreeMap<u16, Vlan>,
    #[serde(default)]
    pub ports: BTreeMap<PortId, Port>,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            vlans: BTreeMap::new(),
            ports: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn insert_vlan(&mut self, vlan: Vlan) {
        self.vlans.insert(vlan.id, vlan);
    }

    /// The VLAN a port is untagged in, if any. At most one on a valid device.
    pub fn untagged_vlan_of(&self, port: &PortId) -> Option<&Vlan> {
        self.vlans.values().find(|v| v.untagged_ports.contains(port))
    }

    /// VLANs carrying the port tagged.
    pub fn tagged_vlans_of(&self, port: &PortId) -> Vec<&Vlan> {
        self.vlans
            .values()
            .filter(|v| v.tagged_ports.contains(port))
            .collect()
    }

    /// Canonical JSON serialization. BTree maps/sets make this stable, so
    /// `canon(canon(x)) == canon(x)` holds trivially.
    pub fn canonical_json(&self) -> Result<String, SwitchcraftError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check the one-untagged-VLAN-per-port invariant across the device.
    pub fn validate_port_membership(&self) -> Result<(), SwitchcraftError> {
        let mut seen: BTreeMap<&PortId, u16> = BTreeMap::new();
        for vlan in self.vlans.values() {
            for port in &vlan.untagged_ports {
                if let Some(first) = seen.insert(port, vlan.id) {
                    return Err(SwitchcraftError::validation(format!(
                        "port {} untagged in both VLAN {} and VLAN {}",
                        port, first, vlan.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_id_round_trips() {
        for raw in ["1/1/24", "lan4", "7", "lag2"] {
            let id: PortId = raw.parse().unwrap();
            assert_eq!(id.to_string(), raw);
        }
    }

    #[test]
    fn port_id_orders_by_numeric_tuple() {
        let a = PortId::stacked(1, 1, 2);
        let b = PortId::stacked(1, 1, 10);
        let c = PortId::stacked(1, 2, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(PortId::Plain(2) < PortId::Plain(10));
    }

    #[test]
    fn invalid_port_names_rejected() {
        assert!("1/1".parse::<PortId>().is_err());
        assert!("eth0/abc".parse::<PortId>().is_err());
        assert!("lanX".parse::<PortId>().is_err());
    }

    #[test]
    fn vlan_id_bounds() {
        assert!(validate_vlan_id(0).is_err());
        assert!(validate_vlan_id(1).is_ok());
        assert!(validate_vlan_id(4094).is_ok());
        assert!(validate_vlan_id(4095).is_err());
    }

    #[test]
    fn untagged_membership_invariant() {
        let mut config = DeviceConfig::new("sw1");
        let mut v1 = Vlan::new(1);
        v1.untagged_ports.insert(PortId::Plain(1));
        let mut v2 = Vlan::new(2);
        v2.untagged_ports.insert(PortId::Plain(1));
        config.insert_vlan(v1);
        config.insert_vlan(v2);
        assert!(config.validate_port_membership().is_err());
    }

    #[test]
    fn canonical_json_is_idempotent() {
        let mut config = DeviceConfig::new("sw1");
        let mut vlan = Vlan::new(100);
        vlan.untagged_ports.insert(PortId::stacked(1, 1, 8));
        vlan.untagged_ports.insert(PortId::stacked(1, 1, 5));
        config.insert_vlan(vlan);

        let first = config.canonical_json().unwrap();
        let reparsed: DeviceConfig = serde_json::from_str(&first).unwrap();
        assert_eq!(reparsed.canonical_json().unwrap(), first);
    }

    #[test]
    fn managed_port_equality_ignores_observations() {
        let mut a = Port::new(PortId::Plain(1));
        let mut b = Port::new(PortId::Plain(1));
        a.link_state = Some(LinkState::Up);
        b.link_state = Some(LinkState::Down);
        a.pvid = Some(1);
        b.pvid = Some(100);
        assert!(a.managed_eq(&b));
        b.description = Some("uplink".to_string());
        assert!(!a.managed_eq(&b));
    }
}
