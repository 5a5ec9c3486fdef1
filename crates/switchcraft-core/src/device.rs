use crate::error::SwitchcraftError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

/// Management surface a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportKind {
    /// Brocade FastIron line-oriented Telnet CLI
    BrocadeTelnet,
    /// Zyxel GS1900 SSH CLI (read-only legacy shell)
    ZyxelCli,
    /// Zyxel GS1900 web management (write path)
    ZyxelHttps,
    /// OpenWrt UCI over SSH exec + SCP
    OpenWrtSsh,
}

impl FromStr for TransportKind {
    type Err = SwitchcraftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "brocade-telnet" => Ok(TransportKind::BrocadeTelnet),
            "zyxel-cli" => Ok(TransportKind::ZyxelCli),
            "zyxel-https" => Ok(TransportKind::ZyxelHttps),
            "openwrt-ssh" => Ok(TransportKind::OpenWrtSsh),
            other => Err(SwitchcraftError::UnsupportedDeviceType(other.to_string())),
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::BrocadeTelnet => write!(f, "brocade-telnet"),
            TransportKind::ZyxelCli => write!(f, "zyxel-cli"),
            TransportKind::ZyxelHttps => write!(f, "zyxel-https"),
            TransportKind::OpenWrtSsh => write!(f, "openwrt-ssh"),
        }
    }
}

impl TryFrom<String> for TransportKind {
    type Error = SwitchcraftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransportKind> for String {
    fn from(value: TransportKind) -> Self {
        value.to_string()
    }
}

impl TransportKind {
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::BrocadeTelnet => 23,
            TransportKind::ZyxelCli => 22,
            TransportKind::ZyxelHttps => 443,
            TransportKind::OpenWrtSsh => 22,
        }
    }

    /// Telnet cannot multiplex; one reader slot. SSH exec tolerates a few.
    pub fn reader_slots(&self) -> usize {
        match self {
            TransportKind::BrocadeTelnet | TransportKind::ZyxelCli => 1,
            TransportKind::ZyxelHttps | TransportKind::OpenWrtSsh => 4,
        }
    }
}

/// Capability flags from the inventory. Never mutated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    #[serde(default)]
    pub supports_batch: bool,
    #[serde(default)]
    pub supports_scp_config: bool,
    #[serde(default)]
    pub supports_rollback: bool,
    #[serde(default)]
    pub write_memory_required: bool,
}

/// One device as described by the inventory: identity, transport, address,
/// credential reference, capabilities. Created at startup, destroyed at
/// shutdown, never mutated in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Name of the environment variable holding the password.
    pub password_env: String,
    #[serde(default)]
    pub enable_password_required: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl DeviceSpec {
    /// Resolve the password from the referenced environment variable.
    pub fn password(&self) -> Result<String, SwitchcraftError> {
        std::env::var(&self.password_env).map_err(|_| {
            SwitchcraftError::ConfigError(format!(
                "environment variable {} not set for device {}",
                self.password_env, self.id
            ))
        })
    }

    /// Build a spec from one inventory entry.
    ///
    /// Unknown keys are warnings; an unknown `type` is fatal.
    pub fn from_inventory_entry(
        id: &str,
        entry: &serde_yaml::Mapping,
    ) -> Result<Self, SwitchcraftError> {
        const KNOWN_KEYS: [&str; 8] = [
            "type",
            "host",
            "port",
            "protocol",
            "username",
            "password_env",
            "enable_password_required",
            "capabilities",
        ];

        for key in entry.keys() {
            if let Some(key) = key.as_str() {
                if !KNOWN_KEYS.contains(&key) {
                    warn!(target: "DeviceSpec::from_inventory_entry", device = id, key, "ignoring unknown inventory key");
                }
            }
        }

        let get_str = |key: &str| -> Option<String> {
            entry
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        let type_str = get_str("type").ok_or_else(|| {
            SwitchcraftError::validation(format!("inventory entry {} has no type", id))
        })?;
        let transport: TransportKind = type_str.parse()?;

        let host = get_str("host").ok_or_else(|| {
            SwitchcraftError::validation(format!("inventory entry {} has no host", id))
        })?;

        let port = entry
            .get("port")
            .and_then(|v| v.as_u64())
            .map(|p| p as u16)
            .unwrap_or_else(|| transport.default_port());

        let username = get_str("username").unwrap_or_else(|| "admin".to_string());
        let password_env = get_str("password_env").unwrap_or_else(|| "NETWORK_PASSWORD".to_string());

        let enable_password_required = entry
            .get("enable_password_required")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let capabilities = entry
            .get("capabilities")
            .map(|v| {
                serde_yaml::from_value(v.clone()).map_err(|e| {
                    SwitchcraftError::validation(format!(
                        "inventory entry {} capabilities rejected: {}",
                        id, e
                    ))
                })
            })
            .transpose()?
            .unwrap_or_default();

        Ok(DeviceSpec {
            id: id.to_string(),
            transport,
            host,
            port,
            username,
            password_env,
            enable_password_required,
            capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(yaml: &str) -> serde_yaml::Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn transport_kind_round_trips() {
        for raw in ["brocade-telnet", "zyxel-cli", "zyxel-https", "openwrt-ssh"] {
            let kind: TransportKind = raw.parse().unwrap();
            assert_eq!(kind.to_string(), raw);
        }
    }

    #[test]
    fn unknown_type_is_fatal() {
        let mapping = entry("type: cisco-ios\nhost: 10.0.0.1\n");
        let err = DeviceSpec::from_inventory_entry("sw1", &mapping).unwrap_err();
        assert!(matches!(err, SwitchcraftError::UnsupportedDeviceType(_)));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let mapping = entry(
            "type: brocade-telnet\nhost: 10.0.0.1\nlocation: rack 3\n",
        );
        let spec = DeviceSpec::from_inventory_entry("sw1", &mapping).unwrap();
        assert_eq!(spec.transport, TransportKind::BrocadeTelnet);
        assert_eq!(spec.port, 23);
        assert_eq!(spec.password_env, "NETWORK_PASSWORD");
    }

    #[test]
    fn capabilities_parsed() {
        let mapping = entry(
            "type: openwrt-ssh\nhost: 192.168.1.1\ncapabilities:\n  supports_scp_config: true\n",
        );
        let spec = DeviceSpec::from_inventory_entry("gw", &mapping).unwrap();
        assert!(spec.capabilities.supports_scp_config);
        assert!(!spec.capabilities.write_memory_required);
    }
}
