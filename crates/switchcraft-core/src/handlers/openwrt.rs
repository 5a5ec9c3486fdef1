use crate::config::EngineConfig;
use crate::device::{DeviceSpec, TransportKind};
use crate::error::SwitchcraftError;
use crate::error_patterns::check_command_output;
use crate::handlers::{BatchOutcome, CommandOutcome, DeviceHandler};
use crate::model::{DeviceConfig, LinkState, Port, PortId, PortSpeed, Vlan};
use crate::session::ssh_exec::OpenWrtSession;
use crate::session::{connect_with_backoff, BackoffPolicy};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const NETWORK_CONFIG_PATH: &str = "/etc/config/network";

lazy_static! {
    static ref UCI_LINE: Regex =
        Regex::new(r"^network\.([^.=]+?)(?:\.([\w-]+))?=(.*)$").unwrap();
    static ref SECTION_INDEX: Regex = Regex::new(r"^@([\w-]+)\[(\d+)\]$").unwrap();
    static ref STRICT_PORT: Regex = Regex::new(r"^lan\d{1,2}$").unwrap();
    static ref MEMBER: Regex = Regex::new(r"^([\w.]+?)(?::([ut])(\*)?)?$").unwrap();
}

/// Handler for OpenWrt devices: UCI over SSH exec, whole-file edits over SCP,
/// port observations from sysfs.
pub struct OpenWrtHandler {
    spec: DeviceSpec,
    config: EngineConfig,
    session: OpenWrtSession,
}

impl OpenWrtHandler {
    pub fn new(spec: DeviceSpec, config: EngineConfig) -> Self {
        let session = OpenWrtSession::new(spec.host.clone(), spec.port, config.read_timeout);
        Self {
            spec,
            config,
            session,
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            retries: self.config.connect_retries,
            base: self.config.backoff_base,
            cap: self.config.backoff_cap,
        }
    }

    fn ensure_connected(&mut self) -> Result<(), SwitchcraftError> {
        if self.session.is_connected() {
            return Ok(());
        }
        self.connect()
    }

    fn run_and_check(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        let output = self.session.execute(command)?;
        if output.exit_status != 0 {
            return Err(SwitchcraftError::vendor_reject(
                &self.spec.id,
                command,
                format!("exit status {}: {}", output.exit_status, output.combined()),
            ));
        }
        check_command_output(
            &output.combined(),
            TransportKind::OpenWrtSsh,
            &self.spec.id,
            command,
        )?;
        Ok(output.stdout)
    }

    fn commit_and_reload(&mut self) -> Result<(), SwitchcraftError> {
        self.run_and_check("uci commit network")?;
        self.run_and_check("/etc/init.d/network reload")?;
        Ok(())
    }

    /// Download `/etc/config/network`, apply an in-memory edit, upload the
    /// result, reload. The upload path refuses blank content: a blank
    /// network config bricks the device.
    pub fn edit_network_config<F>(&mut self, mutate: F) -> Result<(), SwitchcraftError>
    where
        F: FnOnce(&mut UciDocument),
    {
        self.ensure_connected()?;
        let raw = self.session.scp_download(NETWORK_CONFIG_PATH)?;
        let mut doc = UciDocument::parse(&raw)?;
        mutate(&mut doc);
        let rendered = doc.render();
        if rendered.trim().is_empty() {
            return Err(SwitchcraftError::validation(
                "refusing to upload empty network configuration",
            ));
        }
        self.session.scp_upload(NETWORK_CONFIG_PATH, &rendered)?;
        self.run_and_check("/etc/init.d/network reload")?;
        Ok(())
    }

    /// Upload a complete `/etc/config/network`; blank content is rejected
    /// before any transfer.
    pub fn replace_network_config(&mut self, content: &str) -> Result<(), SwitchcraftError> {
        if content.trim().is_empty() {
            return Err(SwitchcraftError::validation(
                "refusing to upload empty network configuration",
            ));
        }
        self.ensure_connected()?;
        self.session.scp_upload(NETWORK_CONFIG_PATH, content)?;
        self.run_and_check("/etc/init.d/network reload")?;
        Ok(())
    }
}

/// Parse `uci show network` into normalized VLANs plus the settings the
/// planner needs (bridge device, filtering flag, per-VLAN section indices).
pub fn parse_uci_show(
    output: &str,
) -> Result<(Vec<Vlan>, BTreeMap<String, serde_json::Value>), SwitchcraftError> {
    struct Section {
        stype: String,
        index: usize,
        options: BTreeMap<String, String>,
    }
    let mut sections: Vec<Section> = Vec::new();
    let mut by_key: BTreeMap<String, usize> = BTreeMap::new();

    for line in output.lines() {
        let Some(caps) = UCI_LINE.captures(line.trim()) else {
            continue;
        };
        let section_key = caps[1].to_string();
        let option = caps.get(2).map(|m| m.as_str().to_string());
        let value = caps[3].trim().to_string();

        match option {
            None => {
                let index = SECTION_INDEX
                    .captures(&section_key)
                    .and_then(|c| c[2].parse().ok())
                    .unwrap_or(sections.len());
                by_key.insert(section_key, sections.len());
                sections.push(Section {
                    stype: value,
                    index,
                    options: BTreeMap::new(),
                });
            }
            Some(opt) => {
                if let Some(&i) = by_key.get(&section_key) {
                    sections[i].options.insert(opt, value);
                }
            }
        }
    }

    let mut settings: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    let mut vlans: Vec<Vlan> = Vec::new();

    for section in &sections {
        if section.stype == "device"
            && section.options.get("type").map(|v| unquote(v)) == Some("bridge".to_string())
        {
            if let Some(name) = section.options.get("name") {
                settings.insert(
                    "bridge_device".to_string(),
                    serde_json::Value::String(unquote(name)),
                );
            }
            let filtering = section
                .options
                .get("vlan_filtering")
                .map(|v| unquote(v))
                .unwrap_or_else(|| "0".to_string());
            settings.insert(
                "vlan_filtering".to_string(),
                serde_json::Value::String(filtering),
            );
        }
    }

    for section in &sections {
        match section.stype.as_str() {
            "bridge-vlan" => {
                let Some(id) = section
                    .options
                    .get("vlan")
                    .and_then(|v| unquote(v).parse::<u16>().ok())
                else {
                    continue;
                };
                let mut vlan = Vlan::new(id);
                if let Some(ports) = section.options.get("ports") {
                    for member in split_uci_list(ports) {
                        let (port, tagged) = parse_bridge_member(&member)?;
                        if tagged {
                            vlan.tagged_ports.insert(port);
                        } else {
                            vlan.untagged_ports.insert(port);
                        }
                    }
                }
                settings.insert(
                    format!("bridge_vlan_index.{}", id),
                    serde_json::Value::Number(section.index.into()),
                );
                vlans.push(vlan);
            }
            "switch_vlan" => {
                let Some(id) = section
                    .options
                    .get("vlan")
                    .and_then(|v| unquote(v).parse::<u16>().ok())
                else {
                    continue;
                };
                let cpu_port: u16 = settings
                    .get("cpu_port")
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let mut vlan = Vlan::new(id);
                if let Some(ports) = section.options.get("ports") {
                    for token in unquote(ports).split_whitespace() {
                        let tagged = token.ends_with('t');
                        let num: u16 = token
                            .trim_end_matches('t')
                            .parse()
                            .map_err(|_| {
                                SwitchcraftError::ParseError(format!(
                                    "bad switch_vlan port token {:?}",
                                    token
                                ))
                            })?;
                        if num == cpu_port {
                            // CPU port carries management traffic; preserved
                            // on rewrite, never surfaced as a member.
                            settings.insert(
                                format!("switch_vlan_cpu.{}", id),
                                serde_json::Value::String(token.to_string()),
                            );
                            continue;
                        }
                        let port = PortId::Lan(num);
                        if tagged {
                            vlan.tagged_ports.insert(port);
                        } else {
                            vlan.untagged_ports.insert(port);
                        }
                    }
                }
                settings.insert(
                    format!("bridge_vlan_index.{}", id),
                    serde_json::Value::Number(section.index.into()),
                );
                vlans.push(vlan);
            }
            _ => {}
        }
    }

    vlans.sort_by_key(|v| v.id);
    Ok((vlans, settings))
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('\'').to_string()
}

/// `uci show` renders lists as space-separated single-quoted items.
fn split_uci_list(value: &str) -> Vec<String> {
    value
        .split('\'')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_bridge_member(member: &str) -> Result<(PortId, bool), SwitchcraftError> {
    let caps = MEMBER.captures(member).ok_or_else(|| {
        SwitchcraftError::ParseError(format!("bad bridge-vlan member {:?}", member))
    })?;
    let port: PortId = caps[1].parse()?;
    let tagged = caps.get(2).map(|m| m.as_str()) == Some("t");
    Ok((port, tagged))
}

/// Parse the output of the sysfs status sweep:
/// `lan1 up 1000 full` per line.
pub fn parse_port_status(output: &str) -> BTreeMap<PortId, Port> {
    let mut ports = BTreeMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let Ok(id) = fields[0].parse::<PortId>() else {
            continue;
        };
        if !matches!(id, PortId::Lan(_)) {
            continue;
        }
        let mut port = Port::new(id.clone());
        port.link_state = Some(match fields.get(1).copied() {
            Some("up") => LinkState::Up,
            Some("down") => LinkState::Down,
            _ => LinkState::Unknown,
        });
        port.speed = match (fields.get(2).copied(), fields.get(3).copied()) {
            (Some("1000"), _) => Some(PortSpeed::GigFull),
            (Some("10000"), _) => Some(PortSpeed::TenGig),
            (Some("100"), Some("full")) => Some(PortSpeed::HundredFull),
            (Some("100"), Some("half")) => Some(PortSpeed::HundredHalf),
            (Some("10"), Some("full")) => Some(PortSpeed::TenFull),
            (Some("10"), Some("half")) => Some(PortSpeed::TenHalf),
            _ => None,
        };
        ports.insert(id, port);
    }
    ports
}

impl DeviceHandler for OpenWrtHandler {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn connect(&mut self) -> Result<(), SwitchcraftError> {
        let password = self.spec.password()?;
        let username = self.spec.username.clone();
        let policy = self.backoff();
        let connect_timeout = self.config.connect_timeout;
        let session = &mut self.session;
        connect_with_backoff(policy, "openwrt ssh connect", || {
            session.connect(&username, &password, connect_timeout)
        })?;
        info!(target: "OpenWrtHandler::connect", device_id = %self.spec.id, "connected");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SwitchcraftError> {
        self.session.close()
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn get_vlans(&mut self) -> Result<Vec<Vlan>, SwitchcraftError> {
        self.ensure_connected()?;
        let output = self.run_and_check("uci show network")?;
        let (vlans, _) = parse_uci_show(&output)?;
        Ok(vlans)
    }

    /// Port status comes from sysfs, not from CLI parsing: each DSA port is
    /// a plain Linux netdev.
    fn get_ports(&mut self) -> Result<BTreeMap<PortId, Port>, SwitchcraftError> {
        self.ensure_connected()?;
        let sweep = "for p in /sys/class/net/lan*; do \
n=$(basename $p); \
echo \"$n $(cat $p/operstate 2>/dev/null) $(cat $p/speed 2>/dev/null) $(cat $p/duplex 2>/dev/null)\"; \
done";
        let output = self.run_and_check(sweep)?;
        Ok(parse_port_status(&output))
    }

    fn get_config(&mut self) -> Result<DeviceConfig, SwitchcraftError> {
        self.ensure_connected()?;
        let output = self.run_and_check("uci show network")?;
        let (vlans, settings) = parse_uci_show(&output)?;
        let mut config = DeviceConfig::new(self.spec.id.clone());
        for vlan in vlans {
            config.insert_vlan(vlan);
        }
        config.settings = settings;
        config.ports = self.get_ports()?;
        Ok(config)
    }

    fn create_vlan(&mut self, vlan: &Vlan) -> Result<(), SwitchcraftError> {
        self.ensure_connected()?;
        let current = self.get_config()?;
        let filtering_on = current
            .settings
            .get("vlan_filtering")
            .and_then(|v| v.as_str())
            .map(|v| v == "1")
            .unwrap_or(false);
        if !filtering_on {
            debug!(target: "OpenWrtHandler::create_vlan", device_id = %self.spec.id, "enabling bridge vlan_filtering");
            self.run_and_check("uci set network.@device[0].vlan_filtering='1'")?;
        }
        let bridge = current
            .settings
            .get("bridge_device")
            .and_then(|v| v.as_str())
            .unwrap_or("br-lan")
            .to_string();

        self.run_and_check("uci add network bridge-vlan")?;
        self.run_and_check(&format!(
            "uci set network.@bridge-vlan[-1].device='{}'",
            bridge
        ))?;
        self.run_and_check(&format!(
            "uci set network.@bridge-vlan[-1].vlan='{}'",
            vlan.id
        ))?;
        for port in &vlan.untagged_ports {
            self.run_and_check(&format!(
                "uci add_list network.@bridge-vlan[-1].ports='{}:u*'",
                port
            ))?;
        }
        for port in &vlan.tagged_ports {
            self.run_and_check(&format!(
                "uci add_list network.@bridge-vlan[-1].ports='{}:t'",
                port
            ))?;
        }
        self.commit_and_reload()
    }

    fn delete_vlan(&mut self, vlan_id: u16) -> Result<(), SwitchcraftError> {
        self.ensure_connected()?;
        let current = self.get_config()?;
        let idx = current
            .settings
            .get(&format!("bridge_vlan_index.{}", vlan_id))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                SwitchcraftError::validation(format!("VLAN {} not present on device", vlan_id))
            })?;
        self.run_and_check(&format!("uci delete network.@bridge-vlan[{}]", idx))?;
        self.commit_and_reload()
    }

    fn configure_port(&mut self, port: &Port) -> Result<(), SwitchcraftError> {
        self.ensure_connected()?;
        let action = if port.enabled { "up" } else { "down" };
        self.run_and_check(&format!("ip link set {} {}", port.id, action))?;
        Ok(())
    }

    fn save_config(&mut self) -> Result<(), SwitchcraftError> {
        self.ensure_connected()?;
        self.commit_and_reload()
    }

    fn execute(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        self.ensure_connected()?;
        self.run_and_check(command)
    }

    /// No persistent shell on this transport; a "config batch" is a sequence
    /// of exec calls followed by nothing (the plan carries commit/reload).
    fn execute_config_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
    ) -> Result<BatchOutcome, SwitchcraftError> {
        self.ensure_connected()?;
        let mut outcome = BatchOutcome::default();
        for (i, command) in commands.iter().enumerate() {
            if outcome.stopped_at.is_some() {
                outcome.push(CommandOutcome::skipped(command));
                continue;
            }
            match self.run_and_check(command) {
                Ok(output) => outcome.push(CommandOutcome::success(command, output)),
                Err(err) => {
                    warn!(target: "OpenWrtHandler::execute_config_batch", device_id = %self.spec.id, command, error = %err, "command failed");
                    outcome.push(CommandOutcome::failure(command, "", err.to_string()));
                    if stop_on_error {
                        outcome.stopped_at = Some(i);
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn idle_for(&self) -> Option<std::time::Duration> {
        if self.session.is_connected() {
            Some(self.session.idle_for())
        } else {
            None
        }
    }

    fn validate_port_name(&self, raw: &str) -> Result<PortId, SwitchcraftError> {
        if !STRICT_PORT.is_match(raw.trim()) {
            return Err(SwitchcraftError::validation(format!(
                "invalid port {:?} for {}: expected lanN",
                raw, self.spec.id
            )));
        }
        raw.parse()
    }
}

// ---------------------------------------------------------------------------
// On-disk UCI file model, for whole-file SCP edits
// ---------------------------------------------------------------------------

/// One `config <type> ['<name>']` section with its options and lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UciSection {
    pub stype: String,
    pub name: Option<String>,
    /// Options keep file order; keys are unique within a section.
    pub options: IndexMap<String, String>,
    /// Lists keep file order and may repeat keys.
    pub lists: Vec<(String, String)>,
}

impl UciSection {
    pub fn new(stype: impl Into<String>) -> Self {
        Self {
            stype: stype.into(),
            name: None,
            options: IndexMap::new(),
            lists: Vec::new(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|v| v.as_str())
    }

    pub fn set_option(&mut self, key: &str, value: impl Into<String>) {
        self.options.insert(key.to_string(), value.into());
    }
}

/// Parsed `/etc/config/network`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UciDocument {
    pub sections: Vec<UciSection>,
}

impl UciDocument {
    pub fn parse(raw: &str) -> Result<Self, SwitchcraftError> {
        let mut doc = UciDocument::default();
        for (lineno, line) in raw.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut tokens = trimmed.splitn(3, char::is_whitespace);
            match tokens.next() {
                Some("config") => {
                    let stype = tokens
                        .next()
                        .ok_or_else(|| {
                            SwitchcraftError::ParseError(format!(
                                "line {}: config without a type",
                                lineno + 1
                            ))
                        })?
                        .to_string();
                    let name = tokens.next().map(|n| unquote(n));
                    doc.sections.push(UciSection {
                        stype,
                        name,
                        options: IndexMap::new(),
                        lists: Vec::new(),
                    });
                }
                Some(kind @ ("option" | "list")) => {
                    let section = doc.sections.last_mut().ok_or_else(|| {
                        SwitchcraftError::ParseError(format!(
                            "line {}: {} before any config section",
                            lineno + 1,
                            kind
                        ))
                    })?;
                    let key = tokens
                        .next()
                        .ok_or_else(|| {
                            SwitchcraftError::ParseError(format!(
                                "line {}: {} without a key",
                                lineno + 1,
                                kind
                            ))
                        })?
                        .to_string();
                    let value = unquote(tokens.next().unwrap_or(""));
                    if kind == "option" {
                        section.options.insert(key, value);
                    } else {
                        section.lists.push((key, value));
                    }
                }
                _ => {
                    return Err(SwitchcraftError::ParseError(format!(
                        "line {}: unrecognized UCI line {:?}",
                        lineno + 1,
                        trimmed
                    )));
                }
            }
        }
        Ok(doc)
    }

    /// Render in the on-disk format: sections separated by blank lines,
    /// values single-quoted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            match &section.name {
                Some(name) => out.push_str(&format!("config {} '{}'\n", section.stype, name)),
                None => out.push_str(&format!("config {}\n", section.stype)),
            }
            for (key, value) in &section.options {
                out.push_str(&format!("\toption {} '{}'\n", key, value));
            }
            for (key, value) in &section.lists {
                out.push_str(&format!("\tlist {} '{}'\n", key, value));
            }
        }
        out
    }

    pub fn sections_of_type_mut(&mut self, stype: &str) -> Vec<&mut UciSection> {
        self.sections
            .iter_mut()
            .filter(|s| s.stype == stype)
            .collect()
    }
}
