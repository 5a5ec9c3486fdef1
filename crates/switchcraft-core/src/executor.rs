use crate::error::SwitchcraftError;
use crate::handlers::{BatchOutcome, CommandOutcome, CommandStatus, DeviceHandler};
use crate::plan::{CommandPlan, CommandTag, TaggedCommand};
use crate::recovery::{
    classify_failure, dual_mode_fix, stp_disable_fix, stp_reenable, RecoveryAction,
    RecoveryAttempt,
};
use chrono::Utc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-execution knobs and signals.
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub max_recovery_attempts: u32,
    pub rollback_on_error: bool,
}

impl ExecutionContext {
    fn interrupted(&self) -> Option<SwitchcraftError> {
        if self.cancel.is_cancelled() {
            return Some(SwitchcraftError::cancelled("cancelled by caller"));
        }
        if Instant::now() >= self.deadline {
            return Some(SwitchcraftError::cancelled("deadline exceeded"));
        }
        None
    }
}

/// Everything that happened while executing one plan. The engine folds this
/// into the audit record.
#[derive(Default)]
pub struct ExecutionReport {
    pub results: Vec<CommandOutcome>,
    pub recovery_trail: Vec<RecoveryAttempt>,
    pub rolled_back: bool,
    pub rollback_error: Option<String>,
    /// Commands actually delivered to the device.
    pub wire_writes: usize,
    pub error: Option<SwitchcraftError>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// VLAN context a retried command needs re-entered: the recovery fix ends
/// with `exit`, which drops the vlan sub-context the command was running in.
fn context_reentry(tag: &CommandTag) -> Option<TaggedCommand> {
    let id = match tag {
        CommandTag::VlanCreate(id) | CommandTag::VlanModify(id) | CommandTag::VlanDelete(id) => *id,
        _ => return None,
    };
    Some(TaggedCommand {
        command: format!("vlan {}", id),
        tag: tag.clone(),
    })
}

/// Rollback subset for a partial execution: inverse commands whose tag
/// belongs to a forward command that actually ran.
fn select_rollback(plan: &CommandPlan, executed_tags: &[CommandTag]) -> Vec<String> {
    plan.rollback_commands
        .iter()
        .filter(|c| c.tag == CommandTag::Session || executed_tags.contains(&c.tag))
        .map(|c| c.command.clone())
        .collect()
}

fn record_attempt(
    report: &mut ExecutionReport,
    command: &str,
    pattern: &str,
    action: RecoveryAction,
    succeeded: bool,
) {
    report.recovery_trail.push(RecoveryAttempt {
        timestamp: Utc::now(),
        command: command.to_string(),
        matched_pattern: pattern.to_string(),
        action,
        succeeded,
    });
}

/// Execute one command with the in-line recovery rules applied.
fn run_single_with_recovery(
    handler: &mut dyn DeviceHandler,
    command: &TaggedCommand,
    ctx: &ExecutionContext,
    report: &mut ExecutionReport,
    attempts: &mut u32,
) -> Result<(), SwitchcraftError> {
    loop {
        if let Some(err) = ctx.interrupted() {
            return Err(err);
        }
        report.wire_writes += 1;
        match handler.execute(&command.command) {
            Ok(output) => {
                report
                    .results
                    .push(CommandOutcome::success(&command.command, output));
                return Ok(());
            }
            Err(err) => {
                let text = err.to_string();
                let classified = classify_failure(&text, &command.command);
                match classified {
                    Some((pattern, RecoveryAction::TreatAsSuccess)) => {
                        record_attempt(
                            report,
                            &command.command,
                            &pattern,
                            RecoveryAction::TreatAsSuccess,
                            true,
                        );
                        report
                            .results
                            .push(CommandOutcome::success(&command.command, text));
                        return Ok(());
                    }
                    Some((pattern, action @ RecoveryAction::DisableDualMode { .. }))
                        if *attempts < ctx.max_recovery_attempts =>
                    {
                        *attempts += 1;
                        let port = match &action {
                            RecoveryAction::DisableDualMode { port } => port.clone(),
                            _ => unreachable!(),
                        };
                        let Some(port) = port else {
                            record_attempt(report, &command.command, &pattern, action, false);
                            return Err(err);
                        };
                        for fix in dual_mode_fix(&port) {
                            report.wire_writes += 1;
                            handler.execute(&fix)?;
                        }
                        record_attempt(
                            report,
                            &command.command,
                            &pattern,
                            RecoveryAction::DisableDualMode { port: Some(port) },
                            true,
                        );
                        continue;
                    }
                    _ => {
                        report
                            .results
                            .push(CommandOutcome::failure(&command.command, "", text));
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Execute a plan against a handler.
///
/// Happy path: pre-commands individually, main commands as one batch with
/// stop_on_error, then post-commands. Failures run the recovery loop; when
/// it is exhausted the rollback commands run with recovery disabled.
pub fn execute_plan(
    handler: &mut dyn DeviceHandler,
    plan: &CommandPlan,
    ctx: &ExecutionContext,
) -> ExecutionReport {
    let mut report = ExecutionReport::default();
    let mut executed_tags: Vec<CommandTag> = Vec::new();
    let mut extra_post: Vec<TaggedCommand> = Vec::new();
    let mut attempts: u32 = 0;

    let error = run_forward(
        handler,
        plan,
        ctx,
        &mut report,
        &mut executed_tags,
        &mut extra_post,
        &mut attempts,
    )
    .err();

    if let Err(e) = handler.exit_config() {
        debug!(target: "executor::execute_plan", error = %e, "exit_config after forward pass failed");
    }

    if let Some(error) = error {
        warn!(target: "executor::execute_plan", error = %error, wire_writes = report.wire_writes, "plan execution failed");
        if ctx.rollback_on_error && report.wire_writes > 0 {
            let commands = select_rollback(plan, &executed_tags);
            if commands.is_empty() {
                debug!(target: "executor::execute_plan", "nothing to roll back");
            } else {
                info!(target: "executor::execute_plan", count = commands.len(), "rolling back");
                // Recovery is disabled here: a rollback that needs rescue is
                // a rollback failure.
                match handler.execute_config_batch(&commands, true) {
                    Ok(outcome) => {
                        report.wire_writes += executed_count(&outcome);
                        match outcome.first_failure() {
                            None => report.rolled_back = true,
                            Some((_, failed)) => {
                                report.rollback_error = Some(format!(
                                    "rollback command {:?} failed: {}",
                                    failed.command,
                                    failed.error.clone().unwrap_or_default()
                                ));
                            }
                        }
                    }
                    Err(e) => {
                        report.rollback_error = Some(e.to_string());
                    }
                }
                let _ = handler.exit_config();
            }
        }
        report.error = Some(error);
    }

    report
}

fn executed_count(outcome: &BatchOutcome) -> usize {
    outcome
        .results
        .iter()
        .filter(|r| r.status != CommandStatus::Skipped)
        .count()
}

#[allow(clippy::too_many_arguments)]
fn run_forward(
    handler: &mut dyn DeviceHandler,
    plan: &CommandPlan,
    ctx: &ExecutionContext,
    report: &mut ExecutionReport,
    executed_tags: &mut Vec<CommandTag>,
    extra_post: &mut Vec<TaggedCommand>,
    attempts: &mut u32,
) -> Result<(), SwitchcraftError> {
    if let Some(err) = ctx.interrupted() {
        return Err(err);
    }

    for command in &plan.pre_commands {
        run_single_with_recovery(handler, command, ctx, report, attempts)?;
        if !executed_tags.contains(&command.tag) {
            executed_tags.push(command.tag.clone());
        }
    }

    // Main commands as a batch; on failure the recovery loop decides whether
    // to resume, retry from the failed command, or give up.
    let mut remaining: Vec<TaggedCommand> = plan.main_commands.clone();
    let mut reconnect_used = false;

    while !remaining.is_empty() {
        if let Some(err) = ctx.interrupted() {
            return Err(err);
        }

        let commands: Vec<String> = remaining.iter().map(|c| c.command.clone()).collect();
        let outcome = match handler.execute_config_batch(&commands, true) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Transport-level failure of the whole batch.
                let text = err.to_string();
                if let Some((pattern, RecoveryAction::Reconnect)) = classify_failure(&text, "") {
                    if !reconnect_used && *attempts < ctx.max_recovery_attempts {
                        *attempts += 1;
                        reconnect_used = true;
                        warn!(target: "executor::run_forward", "session lost mid-batch, reconnecting");
                        handler.reconnect()?;
                        record_attempt(report, "<batch>", &pattern, RecoveryAction::Reconnect, true);
                        continue;
                    }
                }
                return Err(err);
            }
        };
        report.wire_writes += executed_count(&outcome);

        let failure = outcome.first_failure().map(|(i, o)| (i, o.clone()));
        for (i, result) in outcome.results.iter().enumerate() {
            if result.status == CommandStatus::Success {
                report.results.push(result.clone());
                let tag = &remaining[i].tag;
                if !executed_tags.contains(tag) {
                    executed_tags.push(tag.clone());
                }
            }
        }

        // A cancellation raised while the batch was in flight wins over any
        // per-command failure classification.
        if let Some(err) = ctx.interrupted() {
            return Err(err);
        }

        let Some((failed_idx, failed)) = failure else {
            remaining.clear();
            break;
        };

        let failure_text = if failed.output.is_empty() {
            failed.error.clone().unwrap_or_default()
        } else {
            failed.output.clone()
        };
        let classified = classify_failure(&failure_text, &failed.command);
        debug!(target: "executor::run_forward", command = %failed.command, ?classified, "batch command failed");

        match classified {
            Some((pattern, RecoveryAction::TreatAsSuccess)) => {
                record_attempt(
                    report,
                    &failed.command,
                    &pattern,
                    RecoveryAction::TreatAsSuccess,
                    true,
                );
                report
                    .results
                    .push(CommandOutcome::success(&failed.command, failed.output.clone()));
                let tag = &remaining[failed_idx].tag;
                if !executed_tags.contains(tag) {
                    executed_tags.push(tag.clone());
                }
                remaining.drain(..=failed_idx);
            }
            Some((pattern, RecoveryAction::DisableDualMode { port }))
                if *attempts < ctx.max_recovery_attempts =>
            {
                *attempts += 1;
                let Some(port) = port else {
                    report.results.push(failed.clone());
                    return Err(SwitchcraftError::vendor_reject(
                        handler.device_id(),
                        failed.command.clone(),
                        failure_text,
                    ));
                };
                info!(target: "executor::run_forward", port = %port, "disabling dual-mode and retrying");
                for fix in dual_mode_fix(&port) {
                    report.wire_writes += 1;
                    handler.execute(&fix)?;
                }
                record_attempt(
                    report,
                    &failed.command,
                    &pattern,
                    RecoveryAction::DisableDualMode { port: Some(port) },
                    true,
                );
                // Retry the failed command only, then the rest.
                remaining.drain(..failed_idx);
                if let Some(reentry) = context_reentry(&remaining[0].tag) {
                    remaining.insert(0, reentry);
                }
            }
            Some((pattern, RecoveryAction::DisableStp { port }))
                if *attempts < ctx.max_recovery_attempts =>
            {
                *attempts += 1;
                let Some(port) = port else {
                    report.results.push(failed.clone());
                    return Err(SwitchcraftError::vendor_reject(
                        handler.device_id(),
                        failed.command.clone(),
                        failure_text,
                    ));
                };
                info!(target: "executor::run_forward", port = %port, "disabling spanning-tree and retrying");
                for fix in stp_disable_fix(&port) {
                    report.wire_writes += 1;
                    handler.execute(&fix)?;
                }
                for cmd in stp_reenable(&port) {
                    extra_post.push(TaggedCommand {
                        command: cmd,
                        tag: CommandTag::PortConfigure(port.clone()),
                    });
                }
                record_attempt(
                    report,
                    &failed.command,
                    &pattern,
                    RecoveryAction::DisableStp { port: Some(port) },
                    true,
                );
                remaining.drain(..failed_idx);
                if let Some(reentry) = context_reentry(&remaining[0].tag) {
                    remaining.insert(0, reentry);
                }
            }
            Some((pattern, RecoveryAction::Reconnect))
                if !reconnect_used && *attempts < ctx.max_recovery_attempts =>
            {
                *attempts += 1;
                reconnect_used = true;
                warn!(target: "executor::run_forward", "connection lost, reconnecting and retrying from failed command");
                handler.reconnect()?;
                record_attempt(report, &failed.command, &pattern, RecoveryAction::Reconnect, true);
                remaining.drain(..failed_idx);
                if let Some(reentry) = context_reentry(&remaining[0].tag) {
                    remaining.insert(0, reentry);
                }
            }
            Some((pattern, action)) => {
                record_attempt(report, &failed.command, &pattern, action, false);
                report.results.push(failed.clone());
                return Err(SwitchcraftError::vendor_reject(
                    handler.device_id(),
                    failed.command.clone(),
                    failure_text,
                ));
            }
            None => {
                report.results.push(failed.clone());
                return Err(SwitchcraftError::vendor_reject(
                    handler.device_id(),
                    failed.command.clone(),
                    failure_text,
                ));
            }
        }
    }

    for command in plan.post_commands.iter().chain(extra_post.iter()) {
        run_single_with_recovery(handler, command, ctx, report, attempts)?;
    }

    Ok(())
}
