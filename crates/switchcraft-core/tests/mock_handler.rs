//! Scripted in-memory device used by the engine tests. Interprets the
//! Brocade command dialect against a mutable `DeviceConfig` so applies,
//! verification re-fetches, and rollbacks all see consistent state.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use switchcraft_core::handlers::{BatchOutcome, CommandOutcome, DeviceHandler};
use switchcraft_core::{
    Capabilities, DeviceConfig, DeviceSpec, Port, PortId, SwitchcraftError, TransportKind, Vlan,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MockState {
    pub config: DeviceConfig,
    pub connected: bool,
    pub saved: bool,
    /// Every command delivered to the "wire", in order.
    pub wire_writes: Vec<String>,
    pub get_config_calls: usize,
    pub connect_calls: usize,
    /// Exact command -> error output, consumed on first hit.
    pub fail_once: HashMap<String, String>,
    /// Cancel this token once wire_writes reaches the bound.
    pub cancel_after: Option<(usize, CancellationToken)>,
    current_vlan: Option<u16>,
    current_port: Option<PortId>,
}

pub struct MockHandler {
    spec: DeviceSpec,
    pub state: Arc<Mutex<MockState>>,
}

pub fn brocade_spec(id: &str, host: &str) -> DeviceSpec {
    DeviceSpec {
        id: id.to_string(),
        transport: TransportKind::BrocadeTelnet,
        host: host.to_string(),
        port: 23,
        username: "admin".to_string(),
        password_env: "NETWORK_PASSWORD".to_string(),
        enable_password_required: true,
        capabilities: Capabilities {
            supports_batch: true,
            write_memory_required: true,
            ..Default::default()
        },
    }
}

impl MockHandler {
    pub fn new(spec: DeviceSpec, config: DeviceConfig) -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState {
            config,
            ..Default::default()
        }));
        (
            Self {
                spec,
                state: Arc::clone(&state),
            },
            state,
        )
    }

    fn run(&self, command: &str) -> Result<String, String> {
        let mut state = self.state.lock().unwrap();
        state.wire_writes.push(command.to_string());
        if let Some((bound, token)) = &state.cancel_after {
            if state.wire_writes.len() >= *bound {
                token.cancel();
            }
        }
        if let Some(output) = state.fail_once.remove(command) {
            return Err(output);
        }
        interpret(&mut state, command)
    }
}

fn parse_ethe(clause: &str) -> Vec<PortId> {
    let tokens: Vec<&str> = clause.split_whitespace().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] != "ethe" {
            i += 1;
            continue;
        }
        let start: PortId = tokens[i + 1].parse().unwrap();
        if i + 3 < tokens.len() && tokens[i + 2] == "to" {
            let end: PortId = tokens[i + 3].parse().unwrap();
            if let (PortId::Stacked { unit, module, port: p1 }, PortId::Stacked { port: p2, .. }) =
                (start.clone(), end)
            {
                for p in p1..=p2 {
                    out.push(PortId::Stacked { unit, module, port: p });
                }
            }
            i += 4;
        } else {
            out.push(start);
            i += 2;
        }
    }
    out
}

fn interpret(state: &mut MockState, command: &str) -> Result<String, String> {
    let cmd = command.trim();

    if cmd == "configure terminal" || cmd == "end" || cmd == "exit" {
        if cmd != "configure terminal" {
            state.current_vlan = None;
            state.current_port = None;
        }
        return Ok(String::new());
    }
    if cmd == "write memory" {
        state.saved = true;
        return Ok("Write startup-config done.".to_string());
    }
    if let Some(rest) = cmd.strip_prefix("no vlan ") {
        let id: u16 = rest.trim().parse().map_err(|_| "Invalid input".to_string())?;
        state.config.vlans.remove(&id);
        return Ok(String::new());
    }
    if let Some(rest) = cmd.strip_prefix("vlan ") {
        let mut parts = rest.split_whitespace();
        let id: u16 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| "Invalid input".to_string())?;
        let name = match parts.next() {
            Some("name") => parts.next().map(|n| n.to_string()),
            _ => None,
        };
        let vlan = state.config.vlans.entry(id).or_insert_with(|| Vlan::new(id));
        if name.is_some() {
            vlan.name = name;
        }
        state.current_vlan = Some(id);
        return Ok(String::new());
    }
    if let Some(rest) = cmd.strip_prefix("no untagged ") {
        let vid = state.current_vlan.ok_or("Invalid input")?;
        let ports = parse_ethe(rest);
        if let Some(vlan) = state.config.vlans.get_mut(&vid) {
            for port in ports {
                vlan.untagged_ports.remove(&port);
            }
        }
        return Ok(String::new());
    }
    if let Some(rest) = cmd.strip_prefix("no tagged ") {
        let vid = state.current_vlan.ok_or("Invalid input")?;
        let ports = parse_ethe(rest);
        if let Some(vlan) = state.config.vlans.get_mut(&vid) {
            for port in ports {
                vlan.tagged_ports.remove(&port);
            }
        }
        return Ok(String::new());
    }
    if let Some(rest) = cmd.strip_prefix("untagged ") {
        let vid = state.current_vlan.ok_or("Invalid input")?;
        let ports = parse_ethe(rest);
        // The device enforces one untagged membership per port.
        for port in &ports {
            for (other_id, other) in &state.config.vlans {
                if *other_id != vid && other.untagged_ports.contains(port) {
                    return Err(format!(
                        "Error - port {} is an untagged member of vlan {}",
                        port, other_id
                    ));
                }
            }
        }
        if let Some(vlan) = state.config.vlans.get_mut(&vid) {
            vlan.untagged_ports.extend(ports);
        }
        return Ok(String::new());
    }
    if let Some(rest) = cmd.strip_prefix("tagged ") {
        let vid = state.current_vlan.ok_or("Invalid input")?;
        let ports = parse_ethe(rest);
        if let Some(vlan) = state.config.vlans.get_mut(&vid) {
            vlan.tagged_ports.extend(ports);
        }
        return Ok(String::new());
    }
    if let Some(rest) = cmd.strip_prefix("interface ethe ") {
        let port: PortId = rest.trim().parse().map_err(|_| "Invalid input".to_string())?;
        state.current_port = Some(port);
        return Ok(String::new());
    }
    if cmd == "no dual-mode"
        || cmd == "no spanning-tree"
        || cmd == "spanning-tree"
        || cmd == "enable"
        || cmd == "disable"
        || cmd.starts_with("port-name ")
        || cmd.starts_with("speed-duplex ")
    {
        if let Some(port_id) = state.current_port.clone() {
            let port = state
                .config
                .ports
                .entry(port_id.clone())
                .or_insert_with(|| Port::new(port_id));
            match cmd {
                "enable" => port.enabled = true,
                "disable" => port.enabled = false,
                _ => {
                    if let Some(name) = cmd.strip_prefix("port-name ") {
                        port.description = Some(name.to_string());
                    }
                }
            }
        }
        return Ok(String::new());
    }
    if cmd.starts_with("show ") {
        return Ok(String::new());
    }
    Err(format!("Invalid input -> {}", cmd))
}

impl DeviceHandler for MockHandler {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn connect(&mut self) -> Result<(), SwitchcraftError> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        state.connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SwitchcraftError> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn get_vlans(&mut self) -> Result<Vec<Vlan>, SwitchcraftError> {
        Ok(self.get_config()?.vlans.into_values().collect())
    }

    fn get_ports(&mut self) -> Result<BTreeMap<PortId, Port>, SwitchcraftError> {
        Ok(self.get_config()?.ports)
    }

    fn get_config(&mut self) -> Result<DeviceConfig, SwitchcraftError> {
        let mut state = self.state.lock().unwrap();
        state.get_config_calls += 1;
        Ok(state.config.clone())
    }

    fn create_vlan(&mut self, vlan: &Vlan) -> Result<(), SwitchcraftError> {
        let mut state = self.state.lock().unwrap();
        state.config.vlans.insert(vlan.id, vlan.clone());
        Ok(())
    }

    fn delete_vlan(&mut self, vlan_id: u16) -> Result<(), SwitchcraftError> {
        self.state.lock().unwrap().config.vlans.remove(&vlan_id);
        Ok(())
    }

    fn configure_port(&mut self, port: &Port) -> Result<(), SwitchcraftError> {
        let mut state = self.state.lock().unwrap();
        state.config.ports.insert(port.id.clone(), port.clone());
        Ok(())
    }

    fn save_config(&mut self) -> Result<(), SwitchcraftError> {
        self.state.lock().unwrap().saved = true;
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        let device_id = self.spec.id.clone();
        self.run(command)
            .map_err(|output| SwitchcraftError::vendor_reject(device_id, command, output))
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
            match self.run(command) {
                Ok(output) => outcome.push(CommandOutcome::success(command, output)),
                Err(error_output) => {
                    outcome.push(CommandOutcome::failure(
                        command,
                        error_output.clone(),
                        error_output,
                    ));
                    if stop_on_error {
                        outcome.stopped_at = Some(i);
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn validate_port_name(&self, raw: &str) -> Result<PortId, SwitchcraftError> {
        raw.parse()
    }
}
