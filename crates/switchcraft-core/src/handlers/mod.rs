pub mod brocade;
pub mod openwrt;
pub mod zyxel;

use crate::config::EngineConfig;
use crate::device::{DeviceSpec, TransportKind};
use crate::error::SwitchcraftError;
use crate::model::{DeviceConfig, Port, PortId, Vlan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Execution status of one command within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
    /// Not attempted because an earlier command failed with stop_on_error.
    Skipped,
}

/// Result of one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub output: String,
    pub status: CommandStatus,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CommandOutcome {
    pub fn success(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            status: CommandStatus::Success,
            error: None,
            start_time: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn failure(
        command: impl Into<String>,
        output: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            status: CommandStatus::Failed,
            error: Some(error.into()),
            start_time: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn skipped(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: String::new(),
            status: CommandStatus::Skipped,
            error: None,
            start_time: Utc::now(),
            duration_ms: 0,
        }
    }
}

/// Ordered results for one batch; outputs come back in submission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: Vec<CommandOutcome>,
    /// Index of the command the batch stopped at, if it stopped.
    pub stopped_at: Option<usize>,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == CommandStatus::Success)
    }

    pub fn first_failure(&self) -> Option<(usize, &CommandOutcome)> {
        self.results
            .iter()
            .enumerate()
            .find(|(_, r)| r.status == CommandStatus::Failed)
    }

    pub fn push(&mut self, outcome: CommandOutcome) {
        self.results.push(outcome);
    }
}

/// Vendor handler contract: normalized model in, normalized model out.
/// Parsing and command emission never leak past this boundary.
pub trait DeviceHandler: Send {
    fn spec(&self) -> &DeviceSpec;

    fn transport_kind(&self) -> TransportKind {
        self.spec().transport
    }

    fn device_id(&self) -> String {
        self.spec().id.clone()
    }

    /// Connect and authenticate, retrying per the engine backoff policy.
    fn connect(&mut self) -> Result<(), SwitchcraftError>;

    fn close(&mut self) -> Result<(), SwitchcraftError>;

    fn is_connected(&self) -> bool;

    /// Drop and re-establish the session; used by the reconnect recovery.
    fn reconnect(&mut self) -> Result<(), SwitchcraftError> {
        self.close()?;
        self.connect()
    }

    fn get_vlans(&mut self) -> Result<Vec<Vlan>, SwitchcraftError>;

    fn get_ports(&mut self) -> Result<BTreeMap<PortId, Port>, SwitchcraftError>;

    fn get_config(&mut self) -> Result<DeviceConfig, SwitchcraftError>;

    fn create_vlan(&mut self, vlan: &Vlan) -> Result<(), SwitchcraftError>;

    fn delete_vlan(&mut self, vlan_id: u16) -> Result<(), SwitchcraftError>;

    fn configure_port(&mut self, port: &Port) -> Result<(), SwitchcraftError>;

    fn save_config(&mut self) -> Result<(), SwitchcraftError>;

    /// Execute a single command in operational context.
    fn execute(&mut self, command: &str) -> Result<String, SwitchcraftError>;

    /// Execute commands in operational context, in order.
    fn execute_batch(
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

    /// Execute commands in configuration context. Transports without a
    /// config mode reject this.
    fn execute_config_batch(
        &mut self,
        _commands: &[String],
        _stop_on_error: bool,
    ) -> Result<BatchOutcome, SwitchcraftError> {
        Err(SwitchcraftError::UnsupportedOnTransport(format!(
            "{} has no configuration batch support",
            self.transport_kind()
        )))
    }

    /// Leave configuration context if the transport has one. Called by the
    /// executor after post-commands regardless of outcome.
    fn exit_config(&mut self) -> Result<(), SwitchcraftError> {
        Ok(())
    }

    /// Strict per-vendor port syntax check; unknown formats fail before any
    /// wire operation.
    fn validate_port_name(&self, raw: &str) -> Result<PortId, SwitchcraftError>;

    /// How long the underlying session has been idle, when connected.
    fn idle_for(&self) -> Option<std::time::Duration> {
        None
    }
}

/// Maps inventory `type` strings to handler constructors.
pub struct HandlerFactory;

impl HandlerFactory {
    #[instrument(skip(spec, config), fields(device_id = %spec.id, transport = %spec.transport), level = "debug")]
    pub fn create(
        spec: &DeviceSpec,
        config: &EngineConfig,
    ) -> Result<Box<dyn DeviceHandler + Send>, SwitchcraftError> {
        debug!(
            "Creating handler for {} of type {}",
            spec.id, spec.transport
        );
        match spec.transport {
            TransportKind::BrocadeTelnet => Ok(Box::new(brocade::BrocadeHandler::new(
                spec.clone(),
                config.clone(),
            ))),
            TransportKind::OpenWrtSsh => Ok(Box::new(openwrt::OpenWrtHandler::new(
                spec.clone(),
                config.clone(),
            ))),
            TransportKind::ZyxelCli | TransportKind::ZyxelHttps => Ok(Box::new(
                zyxel::ZyxelHandler::new(spec.clone(), config.clone())?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_outcome_tracks_first_failure() {
        let mut outcome = BatchOutcome::default();
        outcome.push(CommandOutcome::success("a", ""));
        outcome.push(CommandOutcome::failure("b", "", "boom"));
        outcome.push(CommandOutcome::skipped("c"));
        assert!(!outcome.all_succeeded());
        let (idx, failed) = outcome.first_failure().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(failed.command, "b");
    }
}
