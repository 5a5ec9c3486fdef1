use crate::error::SwitchcraftError;
use crate::model::DeviceConfig;
use crate::recovery::RecoveryAttempt;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One audit record; append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub operation: String,
    pub actor: String,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_state: Option<DeviceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_state: Option<DeviceConfig>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_attempts: Vec<RecoveryAttempt>,
    pub duration_ms: u64,
}

impl AuditRecord {
    pub fn begin(
        device_id: impl Into<String>,
        operation: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: device_id.into(),
            operation: operation.into(),
            actor: actor.into(),
            dry_run: false,
            parameters: None,
            before_state: None,
            after_state: None,
            success: false,
            error: None,
            recovery_attempts: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn finish(&mut self, success: bool, error: Option<String>) {
        self.success = success;
        self.error = error;
        self.duration_ms = Utc::now()
            .signed_duration_since(self.timestamp)
            .num_milliseconds()
            .max(0) as u64;
    }
}

/// Append-only JSONL audit log with size-based rotation.
///
/// Rotation renames `audit.jsonl` → `audit.jsonl.1` → … → `.N` and happens
/// between records, never inside one: a record is a single `write_all` of
/// one line.
pub struct AuditLog {
    path: PathBuf,
    rotate_size: u64,
    backups: usize,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    pub fn new(
        path: impl Into<PathBuf>,
        rotate_size: u64,
        backups: usize,
    ) -> Result<Self, SwitchcraftError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(SwitchcraftError::IoError)?;
            }
        }
        let file = Self::open_file(&path)?;
        Ok(Self {
            path,
            rotate_size,
            backups,
            file: Mutex::new(Some(file)),
        })
    }

    fn open_file(path: &Path) -> Result<File, SwitchcraftError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(SwitchcraftError::IoError)
    }

    /// Append one record. Every engine operation lands here exactly once
    /// before its result is returned to the caller.
    pub fn append(&self, record: &AuditRecord) -> Result<(), SwitchcraftError> {
        let line = serde_json::to_string(record)
            .map_err(|e| SwitchcraftError::AuditError(format!("failed to encode record: {}", e)))?;

        let mut guard = self.file.lock();
        let needs_rotation = match guard.as_ref() {
            Some(file) => file
                .metadata()
                .map(|m| m.len() >= self.rotate_size)
                .unwrap_or(false),
            None => false,
        };
        if needs_rotation {
            self.rotate(&mut guard)?;
        }

        let file = match guard.as_mut() {
            Some(file) => file,
            None => {
                *guard = Some(Self::open_file(&self.path)?);
                guard.as_mut().unwrap()
            }
        };
        file.write_all(format!("{}\n", line).as_bytes())
            .map_err(|e| SwitchcraftError::AuditError(format!("failed to append record: {}", e)))?;
        file.flush()
            .map_err(|e| SwitchcraftError::AuditError(format!("failed to flush log: {}", e)))?;

        debug!(target: "AuditLog::append", device_id = %record.device_id, operation = %record.operation, success = record.success, "audit record written");
        Ok(())
    }

    fn rotate(&self, guard: &mut Option<File>) -> Result<(), SwitchcraftError> {
        guard.take();

        let backup = |n: usize| -> PathBuf {
            let mut os = self.path.clone().into_os_string();
            os.push(format!(".{}", n));
            PathBuf::from(os)
        };

        if self.backups > 0 {
            let oldest = backup(self.backups);
            if oldest.exists() {
                if let Err(e) = std::fs::remove_file(&oldest) {
                    warn!(target: "AuditLog::rotate", error = %e, "failed to remove oldest backup");
                }
            }
            for n in (1..self.backups).rev() {
                let from = backup(n);
                if from.exists() {
                    std::fs::rename(&from, backup(n + 1)).map_err(SwitchcraftError::IoError)?;
                }
            }
            std::fs::rename(&self.path, backup(1)).map_err(SwitchcraftError::IoError)?;
        } else {
            std::fs::remove_file(&self.path).map_err(SwitchcraftError::IoError)?;
        }

        *guard = Some(Self::open_file(&self.path)?);
        debug!(target: "AuditLog::rotate", path = %self.path.display(), "audit log rotated");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(device: &str) -> AuditRecord {
        let mut r = AuditRecord::begin(device, "create_vlan", "test");
        r.finish(true, None);
        r
    }

    #[test]
    fn appends_one_json_line_per_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path, 1024 * 1024, 2).unwrap();

        log.append(&record("sw1")).unwrap();
        log.append(&record("sw2")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.device_id, "sw1");
        assert!(parsed.success);
    }

    #[test]
    fn rotates_at_size_without_dropping_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        // Tiny threshold so every append after the first rotates.
        let log = AuditLog::new(&path, 64, 3).unwrap();

        for i in 0..10 {
            log.append(&record(&format!("sw{}", i))).unwrap();
        }

        let mut total = 0;
        for candidate in [
            path.clone(),
            PathBuf::from(format!("{}.1", path.display())),
            PathBuf::from(format!("{}.2", path.display())),
            PathBuf::from(format!("{}.3", path.display())),
        ] {
            if candidate.exists() {
                let content = std::fs::read_to_string(&candidate).unwrap();
                for line in content.lines() {
                    let _: AuditRecord = serde_json::from_str(line).unwrap();
                    total += 1;
                }
            }
        }
        // The newest files hold intact records; older ones may have been
        // rotated away, but nothing was ever truncated mid-line.
        assert!(total >= 4);
    }

    #[test]
    fn record_round_trips_with_recovery_trail() {
        use crate::recovery::{RecoveryAction, RecoveryAttempt};
        let mut r = AuditRecord::begin("sw1", "apply_config", "engine");
        r.recovery_attempts.push(RecoveryAttempt {
            timestamp: Utc::now(),
            command: "untagged ethe 1/1/10".into(),
            matched_pattern: "please disable dual mode".into(),
            action: RecoveryAction::DisableDualMode {
                port: Some("1/1/10".parse().unwrap()),
            },
            succeeded: true,
        });
        r.finish(true, None);

        let line = serde_json::to_string(&r).unwrap();
        let back: AuditRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.recovery_attempts.len(), 1);
        assert!(back.recovery_attempts[0].succeeded);
    }
}
