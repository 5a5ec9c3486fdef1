use crate::config::EngineConfig;
use crate::device::{DeviceSpec, TransportKind};
use crate::error::SwitchcraftError;
use crate::error_patterns::check_command_output;
use crate::handlers::{BatchOutcome, CommandOutcome, DeviceHandler};
use crate::model::{DeviceConfig, LinkState, Port, PortId, PortSpeed, Vlan};
use crate::plan::zyxel_port_list;
use crate::session::https::ZyxelHttpsSession;
use crate::session::ssh_shell::ZyxelShellSession;
use crate::session::{connect_with_backoff, BackoffPolicy};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

lazy_static! {
    static ref VLAN_ROW: Regex =
        Regex::new(r"(?m)^\s*(\d+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s*$").unwrap();
    static ref PORT_ROW: Regex = Regex::new(
        r"(?m)^\s*(\d+|lag\d+)\s+(Enable|Disable)\s+(\S+)\s+(Up|Down)\s+(\d+)(?:[ \t]+(\S.*))?$"
    )
    .unwrap();
    static ref STRICT_PORT: Regex = Regex::new(r"^(?:\d{1,2}|lag\d{1,2})$").unwrap();
    static ref VLAN_CREATE: Regex =
        Regex::new(r"^vlan (create|update) (\d+) name (\S+) untagged (\S+) tagged (\S+)$").unwrap();
    static ref VLAN_DELETE: Regex = Regex::new(r"^vlan delete (\d+)$").unwrap();
    static ref PORT_UPDATE: Regex =
        Regex::new(r"^port update (\S+) state (enable|disable) speed (\S+) name (\S+)$").unwrap();
}

/// Handler for Zyxel GS1900 switches.
///
/// The SSH CLI on this firmware is read-only; every write is routed to the
/// web management surface. A write arriving with no web session configured
/// is rejected as unsupported on the transport.
pub struct ZyxelHandler {
    spec: DeviceSpec,
    config: EngineConfig,
    shell: ZyxelShellSession,
    web: ZyxelHttpsSession,
    web_ready: bool,
}

impl ZyxelHandler {
    pub fn new(spec: DeviceSpec, config: EngineConfig) -> Result<Self, SwitchcraftError> {
        // Reads always ride the CLI; the web port is fixed at 443 unless the
        // inventory points the whole transport at HTTPS.
        let (cli_port, web_port) = match spec.transport {
            TransportKind::ZyxelHttps => (22, spec.port),
            _ => (spec.port, 443),
        };
        let mut shell = ZyxelShellSession::new(spec.host.clone(), cli_port, config.read_timeout);
        if config.enable_session_log {
            let path = format!("{}/{}.log", config.session_log_dir, spec.id);
            if let Err(e) = shell.session_log.enable(&path) {
                warn!(target: "ZyxelHandler::new", device_id = %spec.id, error = %e, "failed to enable session log");
            }
        }
        let web = ZyxelHttpsSession::new(spec.host.clone(), web_port, config.command_deadline)?;
        Ok(Self {
            spec,
            config,
            shell,
            web,
            web_ready: false,
        })
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            retries: self.config.connect_retries,
            base: self.config.backoff_base,
            cap: self.config.backoff_cap,
        }
    }

    fn ensure_connected(&mut self) -> Result<(), SwitchcraftError> {
        if self.shell.is_connected() {
            return Ok(());
        }
        self.connect()
    }

    fn ensure_web(&mut self) -> Result<(), SwitchcraftError> {
        if self.web_ready && self.web.is_connected() {
            return Ok(());
        }
        let password = self.spec.password()?;
        let username = self.spec.username.clone();
        let policy = self.backoff();
        let web = &mut self.web;
        connect_with_backoff(policy, "zyxel https login", || {
            web.login(&username, &password)
        })?;
        self.web_ready = true;
        Ok(())
    }

    /// Route one engine write operation to the web surface.
    fn dispatch_write(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        self.ensure_web()?;
        if let Some(caps) = VLAN_CREATE.captures(command) {
            let fields = vec![
                ("cmd".to_string(), "5001".to_string()),
                (
                    "sysSubmitId".to_string(),
                    if &caps[1] == "create" {
                        "vlan_static_add".to_string()
                    } else {
                        "vlan_static_mod".to_string()
                    },
                ),
                ("vid".to_string(), caps[2].to_string()),
                ("vname".to_string(), dash_empty(&caps[3])),
                ("untaggedPorts".to_string(), dash_empty(&caps[4])),
                ("taggedPorts".to_string(), dash_empty(&caps[5])),
            ];
            return self.post_and_check(command, fields);
        }
        if let Some(caps) = VLAN_DELETE.captures(command) {
            let fields = vec![
                ("cmd".to_string(), "5001".to_string()),
                ("sysSubmitId".to_string(), "vlan_static_del".to_string()),
                ("vid".to_string(), caps[1].to_string()),
            ];
            return self.post_and_check(command, fields);
        }
        if let Some(caps) = PORT_UPDATE.captures(command) {
            let fields = vec![
                ("cmd".to_string(), "7700".to_string()),
                ("sysSubmitId".to_string(), "port_setting".to_string()),
                ("port".to_string(), caps[1].to_string()),
                (
                    "state".to_string(),
                    if &caps[2] == "enable" { "1" } else { "0" }.to_string(),
                ),
                ("speed".to_string(), caps[3].to_string()),
                ("name".to_string(), dash_empty(&caps[4])),
            ];
            return self.post_and_check(command, fields);
        }
        Err(SwitchcraftError::UnsupportedOnTransport(format!(
            "unrecognized write operation {:?} for {}",
            command, self.spec.id
        )))
    }

    fn post_and_check(
        &mut self,
        command: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, SwitchcraftError> {
        let body = self.web.post_form(&fields)?;
        check_command_output(&body, TransportKind::ZyxelHttps, &self.spec.id, command)?;
        Ok(body)
    }
}

fn dash_empty(value: &str) -> String {
    if value == "-" || value == "---" {
        String::new()
    } else {
        value.to_string()
    }
}

/// Recognize engine write operations; everything else is a CLI read.
pub fn is_write_command(command: &str) -> bool {
    VLAN_CREATE.is_match(command) || VLAN_DELETE.is_match(command) || PORT_UPDATE.is_match(command)
}

/// Expand `1-4,7,10-12,lag1-2` into port ids; `---` is the empty list.
pub fn parse_port_list(raw: &str) -> Result<Vec<PortId>, SwitchcraftError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "---" {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(rest) = token.strip_prefix("lag") {
            match rest.split_once('-') {
                Some((start, end)) => {
                    let start: u16 = start.parse().map_err(|_| bad_list(token))?;
                    let end: u16 = end.trim_start_matches("lag").parse().map_err(|_| bad_list(token))?;
                    out.extend((start..=end).map(PortId::Lag));
                }
                None => out.push(PortId::Lag(rest.parse().map_err(|_| bad_list(token))?)),
            }
        } else {
            match token.split_once('-') {
                Some((start, end)) => {
                    let start: u16 = start.parse().map_err(|_| bad_list(token))?;
                    let end: u16 = end.parse().map_err(|_| bad_list(token))?;
                    out.extend((start..=end).map(PortId::Plain));
                }
                None => out.push(PortId::Plain(token.parse().map_err(|_| bad_list(token))?)),
            }
        }
    }
    Ok(out)
}

fn bad_list(token: &str) -> SwitchcraftError {
    SwitchcraftError::ParseError(format!("bad port list token {:?}", token))
}

/// Parse the CLI `show vlan` table.
pub fn parse_show_vlan(output: &str) -> Result<Vec<Vlan>, SwitchcraftError> {
    let mut vlans = Vec::new();
    for caps in VLAN_ROW.captures_iter(output) {
        let id: u16 = caps[1]
            .parse()
            .map_err(|_| SwitchcraftError::ParseError(format!("bad VLAN id {:?}", &caps[1])))?;
        let mut vlan = Vlan::new(id);
        match &caps[2] {
            "-" | "---" => {}
            name => vlan.name = Some(name.to_string()),
        }
        for port in parse_port_list(&caps[3])? {
            vlan.untagged_ports.insert(port);
        }
        for port in parse_port_list(&caps[4])? {
            vlan.tagged_ports.insert(port);
        }
        vlans.push(vlan);
    }
    Ok(vlans)
}

/// Parse the CLI port status table.
pub fn parse_show_port(output: &str) -> BTreeMap<PortId, Port> {
    let mut ports = BTreeMap::new();
    for caps in PORT_ROW.captures_iter(output) {
        let Ok(id) = caps[1].parse::<PortId>() else {
            continue;
        };
        let mut port = Port::new(id.clone());
        port.enabled = &caps[2] == "Enable";
        port.speed = caps[3].parse::<PortSpeed>().ok();
        port.link_state = Some(if &caps[4] == "Up" {
            LinkState::Up
        } else {
            LinkState::Down
        });
        port.pvid = caps[5].parse().ok();
        if let Some(name) = caps.get(6) {
            let name = name.as_str().trim();
            if !name.is_empty() {
                port.description = Some(name.to_string());
            }
        }
        ports.insert(id, port);
    }
    ports
}

impl DeviceHandler for ZyxelHandler {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn connect(&mut self) -> Result<(), SwitchcraftError> {
        let password = self.spec.password()?;
        let username = self.spec.username.clone();
        let policy = self.backoff();
        let connect_timeout = self.config.connect_timeout;
        let shell = &mut self.shell;
        connect_with_backoff(policy, "zyxel ssh connect", || {
            shell.connect(&username, &password, connect_timeout)
        })?;
        info!(target: "ZyxelHandler::connect", device_id = %self.spec.id, "connected");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SwitchcraftError> {
        let _ = self.web.close();
        self.web_ready = false;
        self.shell.close()
    }

    fn is_connected(&self) -> bool {
        self.shell.is_connected()
    }

    fn get_vlans(&mut self) -> Result<Vec<Vlan>, SwitchcraftError> {
        self.ensure_connected()?;
        let output = self.shell.execute("show vlan")?;
        parse_show_vlan(&output)
    }

    fn get_ports(&mut self) -> Result<BTreeMap<PortId, Port>, SwitchcraftError> {
        self.ensure_connected()?;
        let output = self.shell.execute("show interfaces status")?;
        Ok(parse_show_port(&output))
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
        let command = format!(
            "vlan create {} name {} untagged {} tagged {}",
            vlan.id,
            vlan.name.as_deref().unwrap_or("-"),
            zyxel_port_list(&vlan.untagged_ports),
            zyxel_port_list(&vlan.tagged_ports),
        );
        self.dispatch_write(&command)?;
        Ok(())
    }

    fn delete_vlan(&mut self, vlan_id: u16) -> Result<(), SwitchcraftError> {
        self.dispatch_write(&format!("vlan delete {}", vlan_id))?;
        Ok(())
    }

    fn configure_port(&mut self, port: &Port) -> Result<(), SwitchcraftError> {
        let command = format!(
            "port update {} state {} speed {} name {}",
            port.id,
            if port.enabled { "enable" } else { "disable" },
            port.speed.map(|s| s.to_string()).unwrap_or_else(|| "auto".into()),
            port.description.as_deref().unwrap_or("-"),
        );
        self.dispatch_write(&command)?;
        Ok(())
    }

    /// The web UI persists as it goes; saving to startup config is one more
    /// form post.
    fn save_config(&mut self) -> Result<(), SwitchcraftError> {
        self.ensure_web()?;
        let fields = vec![
            ("cmd".to_string(), "5002".to_string()),
            ("sysSubmitId".to_string(), "save_running".to_string()),
        ];
        self.post_and_check("save config", fields)?;
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        if is_write_command(command) {
            return self.dispatch_write(command);
        }
        self.ensure_connected()?;
        let output = self.shell.execute(command)?;
        check_command_output(&output, TransportKind::ZyxelCli, &self.spec.id, command)?;
        Ok(output)
    }

    fn execute_config_batch(
        &mut self,
        commands: &[String],
        stop_on_error: bool,
    ) -> Result<BatchOutcome, SwitchcraftError> {
        let mut outcome = BatchOutcome::default();
        for (i, command) in commands.iter().enumerate() {
            if outcome.stopped_at.is_some() {
                outcome.push(CommandOutcome::skipped(command));
                continue;
            }
            debug!(target: "ZyxelHandler::execute_config_batch", device_id = %self.spec.id, command, "dispatching");
            match self.execute(command) {
                Ok(output) => outcome.push(CommandOutcome::success(command, output)),
                Err(err) => {
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
        if self.shell.is_connected() {
            Some(self.shell.idle_for())
        } else {
            None
        }
    }

    fn validate_port_name(&self, raw: &str) -> Result<PortId, SwitchcraftError> {
        if !STRICT_PORT.is_match(raw.trim()) {
            return Err(SwitchcraftError::validation(format!(
                "invalid port {:?} for {}: expected N or lagN",
                raw, self.spec.id
            )));
        }
        raw.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_VLAN: &str = "\
  VID  Name             Untagged Ports      Tagged Ports        Type\n\
  ---  ----             --------------      ------------        ----\n\
    1  default          1-4,7,10-12         ---                 Static\n\
  100  Servers          5-6                 8,lag1-2            Static\n";

    #[test]
    fn parses_vlan_table() {
        let vlans = parse_show_vlan(SHOW_VLAN).unwrap();
        assert_eq!(vlans.len(), 2);

        let v1 = &vlans[0];
        assert_eq!(v1.id, 1);
        assert_eq!(v1.name.as_deref(), Some("default"));
        assert_eq!(v1.untagged_ports.len(), 8);
        assert!(v1.tagged_ports.is_empty());

        let v100 = &vlans[1];
        assert!(v100.untagged_ports.contains(&PortId::Plain(5)));
        assert!(v100.tagged_ports.contains(&PortId::Plain(8)));
        assert!(v100.tagged_ports.contains(&PortId::Lag(1)));
        assert!(v100.tagged_ports.contains(&PortId::Lag(2)));
    }

    #[test]
    fn port_list_notation_round_trip() {
        let ports = parse_port_list("1-4,7,10-12,lag1-2").unwrap();
        assert_eq!(ports.len(), 10);
        assert!(parse_port_list("---").unwrap().is_empty());
        assert!(parse_port_list("x-y").is_err());
    }

    #[test]
    fn parses_port_table() {
        let output = "\
Port  State    Speed      Link   PVID  Name\n\
1     Enable   auto       Up     1     uplink\n\
2     Disable  100-full   Down   1\n\
lag1  Enable   auto       Up     100\n";
        let ports = parse_show_port(output);
        assert_eq!(ports.len(), 3);
        assert!(ports[&PortId::Plain(1)].enabled);
        assert_eq!(
            ports[&PortId::Plain(1)].description.as_deref(),
            Some("uplink")
        );
        assert!(!ports[&PortId::Plain(2)].enabled);
        assert_eq!(ports[&PortId::Plain(2)].speed, Some(PortSpeed::HundredFull));
        assert_eq!(ports[&PortId::Lag(1)].pvid, Some(100));
    }

    #[test]
    fn write_commands_recognized() {
        assert!(is_write_command(
            "vlan create 100 name Servers untagged 5-6 tagged 8"
        ));
        assert!(is_write_command("vlan delete 100"));
        assert!(is_write_command(
            "port update 5 state enable speed auto name uplink"
        ));
        assert!(!is_write_command("show vlan"));
        assert!(!is_write_command("show interfaces status"));
    }
}
