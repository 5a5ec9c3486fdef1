use std::time::Duration;

/// Configuration settings for the Switchcraft engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TCP/SSH connection timeout (default: 30)
    pub connect_timeout: Duration,

    /// Read timeout for channel operations (default: 10)
    pub read_timeout: Duration,

    /// Write timeout for channel operations (default: 10)
    pub write_timeout: Duration,

    /// Deadline for a single command (default: 60)
    pub command_deadline: Duration,

    /// Deadline for a batch (default: 300)
    pub batch_deadline: Duration,

    /// Connect/auth attempts before giving up (default: 5)
    pub connect_retries: u32,

    /// First backoff delay between connect attempts (default: 2s)
    pub backoff_base: Duration,

    /// Backoff cap (default: 15s)
    pub backoff_cap: Duration,

    /// Idle sessions are closed after this long (default: 5 min)
    pub session_idle_timeout: Duration,

    /// Recovery attempts per plan execution (default: 3)
    pub max_recovery_attempts: u32,

    /// Run rollback commands when recovery is exhausted (default: true)
    pub rollback_on_error: bool,

    /// Persist device configuration after a successful apply (default: true)
    pub save_on_success: bool,

    /// Path of the append-only audit log
    pub audit_log_path: String,

    /// Rotate the audit log at this size (default: 10 MB)
    pub audit_rotate_size: u64,

    /// Rotated files kept (default: 5)
    pub audit_backups: usize,

    /// Whether to keep raw per-device channel transcripts
    pub enable_session_log: bool,

    /// Directory for channel transcripts
    pub session_log_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            command_deadline: Duration::from_secs(60),
            batch_deadline: Duration::from_secs(300),
            connect_retries: 5,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(15),
            session_idle_timeout: Duration::from_secs(300),
            max_recovery_attempts: 3,
            rollback_on_error: true,
            save_on_success: true,
            audit_log_path: String::from("logs/audit.jsonl"),
            audit_rotate_size: 10 * 1024 * 1024,
            audit_backups: 5,
            enable_session_log: false,
            session_log_dir: String::from("logs/sessions"),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for EngineConfig to allow fluent configuration
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn command_deadline(mut self, deadline: Duration) -> Self {
        self.config.command_deadline = deadline;
        self
    }

    pub fn batch_deadline(mut self, deadline: Duration) -> Self {
        self.config.batch_deadline = deadline;
        self
    }

    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.config.connect_retries = retries;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.config.backoff_base = base;
        self
    }

    pub fn backoff_cap(mut self, cap: Duration) -> Self {
        self.config.backoff_cap = cap;
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout = timeout;
        self
    }

    pub fn max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.config.max_recovery_attempts = attempts;
        self
    }

    pub fn rollback_on_error(mut self, enable: bool) -> Self {
        self.config.rollback_on_error = enable;
        self
    }

    pub fn save_on_success(mut self, enable: bool) -> Self {
        self.config.save_on_success = enable;
        self
    }

    pub fn audit_log_path(mut self, path: String) -> Self {
        self.config.audit_log_path = path;
        self
    }

    pub fn audit_rotate_size(mut self, size: u64) -> Self {
        self.config.audit_rotate_size = size;
        self
    }

    pub fn audit_backups(mut self, backups: usize) -> Self {
        self.config.audit_backups = backups;
        self
    }

    pub fn enable_session_log(mut self, enable: bool) -> Self {
        self.config.enable_session_log = enable;
        self
    }

    pub fn session_log_dir(mut self, dir: String) -> Self {
        self.config.session_log_dir = dir;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
