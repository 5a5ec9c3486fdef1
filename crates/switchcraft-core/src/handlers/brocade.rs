use crate::config::EngineConfig;
use crate::device::{DeviceSpec, TransportKind};
use crate::error::SwitchcraftError;
use crate::error_patterns::check_command_output;
use crate::handlers::{BatchOutcome, CommandOutcome, DeviceHandler};
use crate::model::{DeviceConfig, LinkState, Port, PortId, PortSpeed, Vlan, BROCADE_RESERVED_VLANS};
use crate::plan::brocade_ethe_clauses;
use crate::session::telnet::{split_batch_output, TelnetSession};
use crate::session::{connect_with_backoff, BackoffPolicy};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

lazy_static! {
    static ref VLAN_HEADER: Regex =
        Regex::new(r"(?m)^PORT-VLAN\s+(\d+),\s+Name\s+(\S+)").unwrap();
    static ref PORT_LINE: Regex =
        Regex::new(r"^\s*(Untagged|Tagged)\s+Ports:\s+\(U(\d+)/M(\d+)\)\s*(.*)$").unwrap();
    static ref STRICT_PORT: Regex = Regex::new(r"^\d{1,2}/\d{1,2}/\d{1,3}$").unwrap();
    static ref INT_BRIEF: Regex = Regex::new(
        r"(?m)^(\d+/\d+/\d+)\s+(Up|Down|Disabled?)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(Yes|No|N/A)\s+(\d+)\s+(\d+)\s+(\S+)(?:[ \t]+(\S.*))?$"
    )
    .unwrap();
}

/// Handler for Brocade FastIron switches over Telnet.
pub struct BrocadeHandler {
    spec: DeviceSpec,
    config: EngineConfig,
    session: TelnetSession,
}

impl BrocadeHandler {
    pub fn new(spec: DeviceSpec, config: EngineConfig) -> Self {
        let mut session = TelnetSession::new(spec.host.clone(), spec.port, config.read_timeout);
        if config.enable_session_log {
            let path = format!("{}/{}.log", config.session_log_dir, spec.id);
            if let Err(e) = session.session_log.enable(&path) {
                warn!(target: "BrocadeHandler::new", device_id = %spec.id, error = %e, "failed to enable session log");
            }
        }
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

    fn run_config_commands(&mut self, commands: Vec<String>) -> Result<(), SwitchcraftError> {
        let outcome = self.execute_config_batch(&commands, true)?;
        if let Some((_, failed)) = outcome.first_failure() {
            return Err(SwitchcraftError::vendor_reject(
                &self.spec.id,
                failed.command.clone(),
                failed.error.clone().unwrap_or_default(),
            ));
        }
        self.exit_config()?;
        Ok(())
    }
}

/// Parse `show vlan` output into normalized VLANs.
///
/// Each VLAN block opens with `PORT-VLAN <id>, Name <name>, ...`; membership
/// lines carry the unit/module in a `(U1/M2)` prefix and bare port numbers
/// after it, with `1 to 8` ranges expanded.
pub fn parse_show_vlan(output: &str) -> Result<Vec<Vlan>, SwitchcraftError> {
    let mut vlans: Vec<Vlan> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = VLAN_HEADER.captures(line) {
            let id: u16 = caps[1]
                .parse()
                .map_err(|_| SwitchcraftError::ParseError(format!("bad VLAN id in {:?}", line)))?;
            let name = match &caps[2] {
                "DEFAULT-VLAN" | "[None]" => None,
                other => Some(other.to_string()),
            };
            let mut vlan = Vlan::new(id);
            vlan.name = name;
            vlans.push(vlan);
            continue;
        }
        if let Some(caps) = PORT_LINE.captures(line) {
            let vlan = vlans.last_mut().ok_or_else(|| {
                SwitchcraftError::ParseError("membership line before any PORT-VLAN header".into())
            })?;
            let unit: u8 = caps[2].parse().unwrap_or(1);
            let module: u8 = caps[3].parse().unwrap_or(1);
            let ports = expand_port_numbers(&caps[4])?;
            let target = if &caps[1] == "Untagged" {
                &mut vlan.untagged_ports
            } else {
                &mut vlan.tagged_ports
            };
            for p in ports {
                target.insert(PortId::stacked(unit, module, p));
            }
        }
    }

    Ok(vlans)
}

/// Expand `1 2 5 to 8 24` into individual numbers.
fn expand_port_numbers(raw: &str) -> Result<Vec<u16>, SwitchcraftError> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "None" {
            break;
        }
        let start: u16 = tokens[i]
            .parse()
            .map_err(|_| SwitchcraftError::ParseError(format!("bad port number {:?}", tokens[i])))?;
        if i + 2 < tokens.len() && tokens[i + 1] == "to" {
            let end: u16 = tokens[i + 2].parse().map_err(|_| {
                SwitchcraftError::ParseError(format!("bad range end {:?}", tokens[i + 2]))
            })?;
            out.extend(start..=end);
            i += 3;
        } else {
            out.push(start);
            i += 1;
        }
    }
    Ok(out)
}

/// Parse `show interfaces brief` into normalized ports.
pub fn parse_interfaces_brief(output: &str) -> BTreeMap<PortId, Port> {
    let mut ports = BTreeMap::new();
    for caps in INT_BRIEF.captures_iter(output) {
        let Ok(id) = caps[1].parse::<PortId>() else {
            continue;
        };
        let mut port = Port::new(id.clone());
        port.link_state = Some(match &caps[2] {
            "Up" => LinkState::Up,
            "Down" => LinkState::Down,
            _ => LinkState::Unknown,
        });
        port.enabled = &caps[2] != "Disabled" && &caps[2] != "Disable";
        port.speed = match &caps[5] {
            "1G" => Some(PortSpeed::GigFull),
            "10G" => Some(PortSpeed::TenGig),
            "100M" => Some(PortSpeed::HundredFull),
            "10M" => Some(PortSpeed::TenFull),
            _ => None,
        };
        port.pvid = caps[8].parse().ok();
        if let Some(name) = caps.get(11) {
            let name = name.as_str().trim();
            if !name.is_empty() && name != "None" {
                port.description = Some(name.to_string());
            }
        }
        ports.insert(id, port);
    }
    ports
}

impl DeviceHandler for BrocadeHandler {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn connect(&mut self) -> Result<(), SwitchcraftError> {
        let password = self.spec.password()?;
        let enable = if self.spec.enable_password_required {
            Some(password.clone())
        } else {
            None
        };
        let policy = self.backoff();
        let connect_timeout = self.config.connect_timeout;
        let session = &mut self.session;
        connect_with_backoff(policy, "brocade telnet connect", || {
            session.connect(&password, enable.as_deref(), connect_timeout)
        })?;
        info!(target: "BrocadeHandler::connect", device_id = %self.spec.id, "connected");
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
        let output = self.session.execute("show vlan")?;
        parse_show_vlan(&output)
    }

    fn get_ports(&mut self) -> Result<BTreeMap<PortId, Port>, SwitchcraftError> {
        self.ensure_connected()?;
        let output = self.session.execute("show interfaces brief")?;
        Ok(parse_interfaces_brief(&output))
    }

    fn get_config(&mut self) -> Result<DeviceConfig, SwitchcraftError> {
        let mut config = DeviceConfig::new(self.spec.id.clone());
        for vlan in self.get_vlans()? {
            config.insert_vlan(vlan);
        }
        config.ports = self.get_ports()?;
        Ok(config)
    }

    fn create_vlan(&mut self, vlan: &Vlan) -> Result<(), SwitchcraftError> {
        if BROCADE_RESERVED_VLANS.contains(&vlan.id) {
            return Err(SwitchcraftError::validation(format!(
                "VLAN {} is reserved on this platform",
                vlan.id
            )));
        }
        let header = match &vlan.name {
            Some(name) => format!("vlan {} name {} by port", vlan.id, name),
            None => format!("vlan {} by port", vlan.id),
        };
        let mut commands = vec![header];
        if !vlan.untagged_ports.is_empty() {
            commands.push(format!(
                "untagged {}",
                brocade_ethe_clauses(&vlan.untagged_ports)
            ));
        }
        if !vlan.tagged_ports.is_empty() {
            commands.push(format!("tagged {}", brocade_ethe_clauses(&vlan.tagged_ports)));
        }
        commands.push("exit".to_string());
        self.run_config_commands(commands)
    }

    fn delete_vlan(&mut self, vlan_id: u16) -> Result<(), SwitchcraftError> {
        self.run_config_commands(vec![format!("no vlan {}", vlan_id)])
    }

    fn configure_port(&mut self, port: &Port) -> Result<(), SwitchcraftError> {
        let mut commands = vec![format!("interface ethe {}", port.id)];
        commands.push(if port.enabled { "enable" } else { "disable" }.to_string());
        if let Some(desc) = &port.description {
            commands.push(format!("port-name {}", desc));
        }
        if let Some(speed) = port.speed {
            let value = match speed {
                PortSpeed::TenGig => "10g-full".to_string(),
                other => other.to_string(),
            };
            commands.push(format!("speed-duplex {}", value));
        }
        commands.push("exit".to_string());
        self.run_config_commands(commands)
    }

    fn save_config(&mut self) -> Result<(), SwitchcraftError> {
        self.ensure_connected()?;
        self.session.exit_config_mode()?;
        let output = self.session.execute("write memory")?;
        check_command_output(&output, TransportKind::BrocadeTelnet, &self.spec.id, "write memory")
    }

    fn execute(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        self.ensure_connected()?;
        match command.trim() {
            "configure terminal" => {
                self.session.enter_config_mode()?;
                Ok(String::new())
            }
            "end" => {
                self.session.exit_config_mode()?;
                Ok(String::new())
            }
            cmd => {
                let output = self.session.execute(cmd)?;
                check_command_output(&output, TransportKind::BrocadeTelnet, &self.spec.id, cmd)?;
                Ok(output)
            }
        }
    }

    /// Batch mode: one write, one read to the column-0 privileged prompt,
    /// then per-command attribution by echo splitting.
    fn execute_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
    ) -> Result<BatchOutcome, SwitchcraftError> {
        self.ensure_connected()?;
        let raw = self
            .session
            .execute_batch(commands, self.config.batch_deadline)?;
        let segments = split_batch_output(&raw, commands);

        let mut outcome = BatchOutcome::default();
        for (i, (command, segment)) in commands.iter().zip(segments.iter()).enumerate() {
            if outcome.stopped_at.is_some() {
                outcome.push(CommandOutcome::skipped(command));
                continue;
            }
            match check_command_output(
                segment,
                TransportKind::BrocadeTelnet,
                &self.spec.id,
                command,
            ) {
                Ok(()) => outcome.push(CommandOutcome::success(command, segment.clone())),
                Err(err) => {
                    warn!(target: "BrocadeHandler::execute_batch", device_id = %self.spec.id, command, "batch command failed");
                    outcome.push(CommandOutcome::failure(command, segment.clone(), err.to_string()));
                    if stop_on_error {
                        outcome.stopped_at = Some(i);
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn execute_config_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
    ) -> Result<BatchOutcome, SwitchcraftError> {
        self.ensure_connected()?;
        self.session.enter_config_mode()?;
        debug!(target: "BrocadeHandler::execute_config_batch", device_id = %self.spec.id, count = commands.len(), "running config batch");
        self.execute_batch(commands, stop_on_error)
    }

    fn exit_config(&mut self) -> Result<(), SwitchcraftError> {
        self.session.exit_config_mode()
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
                "invalid port {:?} for {}: expected unit/module/port",
                raw, self.spec.id
            )));
        }
        raw.parse()
    }
}
