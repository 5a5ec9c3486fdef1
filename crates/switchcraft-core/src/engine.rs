use crate::audit::{AuditLog, AuditRecord};
use crate::config::EngineConfig;
use crate::desired::{DesiredPort, DesiredState, DesiredVlan, VlanAction};
use crate::device::{DeviceSpec, TransportKind};
use crate::diff::{diff_states, ConfigDiff};
use crate::drift::{detect_drift, DriftReport};
use crate::error::{ErrorKind, SwitchcraftError};
use crate::executor::{execute_plan, ExecutionContext, ExecutionReport};
use crate::handlers::{BatchOutcome, DeviceHandler, HandlerFactory};
use crate::model::{validate_vlan_id, DeviceConfig, Port, Vlan, BROCADE_RESERVED_VLANS};
use crate::plan::{build_plan, CommandPlan, PlanOptions};
use crate::safety::HilConstraints;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Options for a single engine operation.
#[derive(Clone)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub actor: String,
    pub cancel: CancellationToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            actor: "switchcraft".to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

impl ApplyOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }
}

/// What an apply produced: the diff, the plan, and how execution went.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub device_id: String,
    pub dry_run: bool,
    pub diff: ConfigDiff,
    pub plan: CommandPlan,
    pub recovery_attempts: usize,
    pub verified: bool,
}

struct DeviceEntry {
    spec: DeviceSpec,
    /// Exclusive writer lock; all access to the single session goes through
    /// it. Waiters are served FIFO.
    handler: Mutex<Box<dyn DeviceHandler + Send>>,
    /// Bounded read slots per transport.
    readers: Semaphore,
}

struct EngineInner {
    config: EngineConfig,
    audit: AuditLog,
    hil: Option<HilConstraints>,
    devices: RwLock<HashMap<String, Arc<DeviceEntry>>>,
}

/// The device-agnostic configuration engine: normalized reads, validated and
/// audited writes, drift reports, at-most-one-writer per device.
#[derive(Clone)]
pub struct SwitchcraftEngine {
    inner: Arc<EngineInner>,
}

impl SwitchcraftEngine {
    pub fn new(config: EngineConfig) -> Result<Self, SwitchcraftError> {
        let audit = AuditLog::new(
            config.audit_log_path.clone(),
            config.audit_rotate_size,
            config.audit_backups,
        )?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                audit,
                hil: HilConstraints::from_env(),
                devices: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Override the HIL profile (tests and explicit harness wiring).
    pub fn with_hil(config: EngineConfig, hil: Option<HilConstraints>) -> Result<Self, SwitchcraftError> {
        let audit = AuditLog::new(
            config.audit_log_path.clone(),
            config.audit_rotate_size,
            config.audit_backups,
        )?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                audit,
                hil,
                devices: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a device from its inventory spec.
    #[instrument(skip(self, spec), fields(device_id = %spec.id), level = "debug")]
    pub fn register_device(&self, spec: DeviceSpec) -> Result<(), SwitchcraftError> {
        let handler = HandlerFactory::create(&spec, &self.inner.config)?;
        self.register_handler(handler);
        Ok(())
    }

    /// Register a device with an explicit handler (test harnesses inject
    /// scripted handlers here).
    pub fn register_handler(&self, handler: Box<dyn DeviceHandler + Send>) {
        let spec = handler.spec().clone();
        let readers = spec.transport.reader_slots();
        info!(target: "SwitchcraftEngine::register_handler", device_id = %spec.id, transport = %spec.transport, "device registered");
        self.inner.devices.write().insert(
            spec.id.clone(),
            Arc::new(DeviceEntry {
                spec,
                handler: Mutex::new(handler),
                readers: Semaphore::new(readers),
            }),
        );
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn entry(&self, device_id: &str) -> Result<Arc<DeviceEntry>, SwitchcraftError> {
        self.inner
            .devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| {
                SwitchcraftError::validation(format!("unknown device: {}", device_id))
            })
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    pub async fn get_config(&self, device_id: &str) -> Result<DeviceConfig, SwitchcraftError> {
        let entry = self.entry(device_id)?;
        let _permit = entry.readers.acquire().await.map_err(|_| {
            SwitchcraftError::ConnectionError("reader semaphore closed".to_string())
        })?;
        let mut handler = entry.handler.lock().await;
        handler.get_config()
    }

    pub async fn get_vlans(&self, device_id: &str) -> Result<Vec<Vlan>, SwitchcraftError> {
        let entry = self.entry(device_id)?;
        let _permit = entry.readers.acquire().await.map_err(|_| {
            SwitchcraftError::ConnectionError("reader semaphore closed".to_string())
        })?;
        let mut handler = entry.handler.lock().await;
        handler.get_vlans()
    }

    pub async fn get_ports(
        &self,
        device_id: &str,
    ) -> Result<std::collections::BTreeMap<crate::model::PortId, Port>, SwitchcraftError> {
        let entry = self.entry(device_id)?;
        let _permit = entry.readers.acquire().await.map_err(|_| {
            SwitchcraftError::ConnectionError("reader semaphore closed".to_string())
        })?;
        let mut handler = entry.handler.lock().await;
        handler.get_ports()
    }

    /// Execute one read command verbatim.
    pub async fn execute(&self, device_id: &str, command: &str) -> Result<String, SwitchcraftError> {
        if command.trim().is_empty() {
            return Err(SwitchcraftError::validation("empty command"));
        }
        let entry = self.entry(device_id)?;
        let _permit = entry.readers.acquire().await.map_err(|_| {
            SwitchcraftError::ConnectionError("reader semaphore closed".to_string())
        })?;
        let mut handler = entry.handler.lock().await;
        handler.execute(command)
    }

    /// Compare stored desired state against the live device. Side-effect
    /// free: no audit record, no writes.
    pub async fn drift_report(
        &self,
        device_id: &str,
        desired: &DesiredState,
    ) -> Result<DriftReport, SwitchcraftError> {
        desired.validate()?;
        if desired.device_id != device_id {
            return Err(SwitchcraftError::validation(format!(
                "desired state is for {}, not {}",
                desired.device_id, device_id
            )));
        }
        let observed = self.get_config(device_id).await?;
        Ok(detect_drift(desired, &observed))
    }

    /// Close sessions idle past the configured timeout.
    pub async fn close_idle_sessions(&self) {
        let entries: Vec<Arc<DeviceEntry>> =
            self.inner.devices.read().values().cloned().collect();
        for entry in entries {
            if let Ok(mut handler) = entry.handler.try_lock() {
                if let Some(idle) = handler.idle_for() {
                    if idle >= self.inner.config.session_idle_timeout {
                        debug!(target: "SwitchcraftEngine::close_idle_sessions", device_id = %entry.spec.id, ?idle, "closing idle session");
                        let _ = handler.close();
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Create a VLAN, expressed as a one-entry patch apply.
    pub async fn create_vlan(
        &self,
        device_id: &str,
        vlan: Vlan,
        opts: ApplyOptions,
    ) -> Result<ApplyOutcome, SwitchcraftError> {
        let mut desired = DesiredState::new(device_id);
        desired.vlans.insert(
            vlan.id,
            DesiredVlan {
                name: vlan.name.clone(),
                untagged_ports: vlan.untagged_ports.clone(),
                tagged_ports: vlan.tagged_ports.clone(),
                l3_interface: vlan.l3_interface.clone(),
                action: VlanAction::Ensure,
            },
        );
        self.apply_named(device_id, desired, "create_vlan", json!({"vlan": vlan.id}), opts)
            .await
    }

    /// Delete a VLAN. VLAN 1 is rejected before any wire activity.
    pub async fn delete_vlan(
        &self,
        device_id: &str,
        vlan_id: u16,
        opts: ApplyOptions,
    ) -> Result<ApplyOutcome, SwitchcraftError> {
        // Deleting VLAN 1 fails validation inside the shared pipeline, so
        // the rejection still produces its audit record.
        let mut desired = DesiredState::new(device_id);
        desired.vlans.insert(
            vlan_id,
            DesiredVlan {
                name: None,
                untagged_ports: Default::default(),
                tagged_ports: Default::default(),
                l3_interface: None,
                action: VlanAction::Absent,
            },
        );
        self.apply_named(device_id, desired, "delete_vlan", json!({"vlan": vlan_id}), opts)
            .await
    }

    /// Configure one port's managed attributes.
    pub async fn configure_port(
        &self,
        device_id: &str,
        port: Port,
        opts: ApplyOptions,
    ) -> Result<ApplyOutcome, SwitchcraftError> {
        let mut desired = DesiredState::new(device_id);
        desired.ports.insert(
            port.id.clone(),
            DesiredPort {
                enabled: port.enabled,
                description: port.description.clone(),
                speed: port.speed,
            },
        );
        let params = json!({"port": port.id.to_string()});
        self.apply_named(device_id, desired, "configure_port", params, opts)
            .await
    }

    /// Persist device configuration (audited write).
    pub async fn save_config(
        &self,
        device_id: &str,
        opts: ApplyOptions,
    ) -> Result<(), SwitchcraftError> {
        let entry = self.entry(device_id)?;
        let mut record = AuditRecord::begin(device_id, "save_config", &opts.actor);
        let mut handler = entry.handler.lock().await;
        let result = handler.save_config();
        drop(handler);
        record.finish(result.is_ok(), result.as_ref().err().map(|e| e.to_string()));
        self.inner.audit.append(&record)?;
        result
    }

    /// Run raw config commands as one audited write.
    pub async fn execute_config_batch(
        &self,
        device_id: &str,
        commands: Vec<String>,
        opts: ApplyOptions,
    ) -> Result<BatchOutcome, SwitchcraftError> {
        for command in &commands {
            if command.trim().is_empty() {
                return Err(SwitchcraftError::validation("empty command in batch"));
            }
        }
        let entry = self.entry(device_id)?;
        if let Some(hil) = &self.inner.hil {
            // Raw batches cannot be entity-checked; HIL mode only allows
            // them against allowlisted devices.
            hil.check_write(&entry.spec, &[], &[])?;
        }

        let mut record = AuditRecord::begin(device_id, "execute_config_batch", &opts.actor);
        record.parameters = Some(json!({"commands": commands.len()}));

        let mut handler = entry.handler.lock().await;
        let result = handler.execute_config_batch(&commands, true);
        let _ = handler.exit_config();
        drop(handler);

        match &result {
            Ok(outcome) => {
                let success = outcome.all_succeeded();
                record.finish(
                    success,
                    outcome
                        .first_failure()
                        .map(|(_, f)| f.error.clone().unwrap_or_default()),
                );
            }
            Err(err) => record.finish(false, Some(err.to_string())),
        }
        self.inner.audit.append(&record)?;
        result
    }

    /// Apply a full desired-state document.
    pub async fn apply_config(
        &self,
        device_id: &str,
        desired: DesiredState,
        opts: ApplyOptions,
    ) -> Result<ApplyOutcome, SwitchcraftError> {
        let params = json!({"mode": desired.mode, "vlans": desired.vlans.len(), "ports": desired.ports.len()});
        self.apply_named(device_id, desired, "apply_config", params, opts)
            .await
    }

    /// Shared write pipeline: validate → HIL → lock → snapshot → diff →
    /// plan → execute → verify → audit.
    async fn apply_named(
        &self,
        device_id: &str,
        desired: DesiredState,
        operation: &str,
        parameters: serde_json::Value,
        opts: ApplyOptions,
    ) -> Result<ApplyOutcome, SwitchcraftError> {
        let mut record = AuditRecord::begin(device_id, operation, &opts.actor);
        record.dry_run = opts.dry_run;
        record.parameters = Some(parameters);

        match self
            .apply_inner(device_id, desired, &opts, &mut record)
            .await
        {
            Ok(outcome) => {
                record.finish(true, None);
                self.inner.audit.append(&record)?;
                Ok(outcome)
            }
            Err(err) => {
                // Cancellation before the first wire write leaves no trace.
                let pre_wire_cancel =
                    err.kind() == ErrorKind::Cancelled && record.before_state.is_none();
                if !pre_wire_cancel {
                    record.finish(false, Some(err.to_string()));
                    if let Err(audit_err) = self.inner.audit.append(&record) {
                        warn!(target: "SwitchcraftEngine::apply_named", error = %audit_err, "failed to write audit record");
                    }
                }
                Err(err)
            }
        }
    }

    async fn apply_inner(
        &self,
        device_id: &str,
        desired: DesiredState,
        opts: &ApplyOptions,
        record: &mut AuditRecord,
    ) -> Result<ApplyOutcome, SwitchcraftError> {
        // Leaf-first: nothing below touches the wire until validation and
        // the safety gate both pass.
        desired.validate()?;
        if desired.device_id != device_id {
            return Err(SwitchcraftError::validation(format!(
                "desired state is for {}, not {}",
                desired.device_id, device_id
            )));
        }
        let entry = self.entry(device_id)?;

        if entry.spec.transport == TransportKind::BrocadeTelnet {
            for &id in desired.vlans.keys() {
                if BROCADE_RESERVED_VLANS.contains(&id) {
                    return Err(SwitchcraftError::validation(format!(
                        "VLAN {} is reserved on this platform",
                        id
                    )));
                }
            }
        }
        for id in desired.vlans.keys() {
            validate_vlan_id(*id)?;
        }

        if let Some(hil) = &self.inner.hil {
            let ports: Vec<_> = desired.named_ports().into_iter().collect();
            hil.check_write(&entry.spec, &desired.vlan_ids(), &ports)?;
        }

        if opts.cancel.is_cancelled() {
            return Err(SwitchcraftError::cancelled("cancelled before execution"));
        }

        // Exclusive writer for the rest of the operation, recovery and
        // verification included.
        let mut handler = match tokio::time::timeout(
            self.inner.config.command_deadline,
            entry.handler.lock(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                return Err(SwitchcraftError::WriterConflict {
                    device_id: device_id.to_string(),
                })
            }
        };

        let before = handler.get_config()?;
        record.before_state = Some(before.clone());

        let diff = diff_states(&before, &desired);
        if diff.is_empty() {
            debug!(target: "SwitchcraftEngine::apply_inner", device_id, "no-change diff, nothing to do");
            record.after_state = Some(before.clone());
            return Ok(ApplyOutcome {
                device_id: device_id.to_string(),
                dry_run: opts.dry_run,
                diff,
                plan: CommandPlan::default(),
                recovery_attempts: 0,
                verified: true,
            });
        }

        if let Some(hil) = &self.inner.hil {
            hil.check_diff(&entry.spec, &diff)?;
        }

        let plan = build_plan(
            entry.spec.transport,
            &diff,
            &before,
            PlanOptions {
                save_on_success: self.inner.config.save_on_success,
            },
        )?;

        if opts.dry_run {
            info!(target: "SwitchcraftEngine::apply_inner", device_id, commands = plan.render().len(), "dry run, skipping execution");
            return Ok(ApplyOutcome {
                device_id: device_id.to_string(),
                dry_run: true,
                diff,
                plan,
                recovery_attempts: 0,
                verified: false,
            });
        }

        let ctx = ExecutionContext {
            cancel: opts.cancel.clone(),
            deadline: Instant::now() + self.inner.config.batch_deadline,
            max_recovery_attempts: self.inner.config.max_recovery_attempts,
            rollback_on_error: self.inner.config.rollback_on_error,
        };
        let report = execute_plan(&mut **handler, &plan, &ctx);
        record.recovery_attempts = report.recovery_trail.clone();

        if let Some(error) = report_error(report, record, &mut **handler, device_id)? {
            return Err(error);
        }

        // Verify: re-fetch and require the diff to be empty.
        let after = handler.get_config()?;
        record.after_state = Some(after.clone());
        let residual = diff_states(&after, &desired);
        if !residual.is_empty() {
            return Err(SwitchcraftError::VerificationFailed(format!(
                "device state still differs after apply: {} VLAN changes outstanding",
                residual.vlans_to_create.len()
                    + residual.vlans_to_modify.len()
                    + residual.vlans_to_delete.len()
            )));
        }

        let recovery_attempts = record.recovery_attempts.len();
        info!(target: "SwitchcraftEngine::apply_inner", device_id, recovery_attempts, "apply complete and verified");
        Ok(ApplyOutcome {
            device_id: device_id.to_string(),
            dry_run: false,
            diff,
            plan,
            recovery_attempts,
            verified: true,
        })
    }

    /// Apply desired states to many devices concurrently; per-device writer
    /// locks serialize each device, a semaphore bounds total concurrency.
    pub async fn apply_config_many(
        &self,
        states: Vec<DesiredState>,
        opts: ApplyOptions,
        max_concurrent: usize,
    ) -> Vec<(String, Result<ApplyOutcome, SwitchcraftError>)> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = Vec::new();

        for desired in states {
            let engine = self.clone();
            let opts = opts.clone();
            let semaphore = Arc::clone(&semaphore);
            let device_id = desired.device_id.clone();
            let task_id = device_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                engine.apply_config(&device_id, desired, opts).await
            });
            tasks.push((task_id, handle));
        }

        let mut results = Vec::new();
        for (device_id, handle) in tasks {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(SwitchcraftError::ConnectionError(format!(
                    "apply task panicked: {}",
                    e
                ))),
            };
            results.push((device_id, result));
        }
        results
    }
}

/// Fold an execution report's failure modes into the audit record; returns
/// the error to surface, if any.
fn report_error(
    report: ExecutionReport,
    record: &mut AuditRecord,
    handler: &mut dyn DeviceHandler,
    device_id: &str,
) -> Result<Option<SwitchcraftError>, SwitchcraftError> {
    let Some(error) = report.error else {
        return Ok(None);
    };

    // Cancelled before anything was written: clean abort, no audit record.
    if error.kind() == ErrorKind::Cancelled && report.wire_writes == 0 {
        record.before_state = None;
        record.after_state = None;
        return Ok(Some(error));
    }

    // Snapshot whatever state the device ended in, rollback included.
    if let Ok(after) = handler.get_config() {
        record.after_state = Some(after);
    }

    if let Some(rollback_error) = report.rollback_error {
        warn!(target: "engine::report_error", device_id, rollback_error, "rollback failed");
        return Ok(Some(SwitchcraftError::rollback_failed(
            device_id,
            format!("{} (original error: {})", rollback_error, error),
        )));
    }
    Ok(Some(error))
}
