pub mod audit;
pub mod config;
pub mod desired;
pub mod device;
pub mod diff;
pub mod drift;
pub mod engine;
pub mod error;
pub mod error_patterns;
pub mod executor;
pub mod handlers;
pub mod logging;
pub mod model;
pub mod plan;
pub mod recovery;
pub mod safety;
pub mod session;
pub mod session_log;

// Import lazy_static for common regex patterns
#[macro_use]
extern crate lazy_static;

// Common regex patterns module
pub mod patterns {
    use regex::Regex;

    lazy_static! {
        // Brocade FastIron prompt (user, privileged, or config context)
        pub static ref BROCADE_PROMPT: Regex = Regex::new(r".+[>#]\s*$").unwrap();
        // Zyxel GS1900 shell prompt
        pub static ref ZYXEL_PROMPT: Regex = Regex::new(r".*# $").unwrap();

        // Interactive pager marker, dismissed with SPACE
        pub static ref MORE_PAGER: Regex = Regex::new(r"--More--").unwrap();

        // Common ANSI escape code pattern
        pub static ref ANSI_ESCAPE_PATTERN: Regex = Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").unwrap();

        // Common line ending normalization pattern
        pub static ref CRLF_PATTERN: Regex = Regex::new(r"\r\n").unwrap();
    }
}

// Re-export core types
pub use audit::{AuditLog, AuditRecord};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use desired::{ApplyMode, DesiredPort, DesiredState, DesiredVlan, VlanAction};
pub use device::{Capabilities, DeviceSpec, TransportKind};
pub use diff::{diff_configs, diff_states, ConfigDiff, PortChange, SettingChange, VlanChange};
pub use drift::{detect_drift, DriftEntry, DriftReport, DriftVerdict};
pub use engine::{ApplyOptions, ApplyOutcome, SwitchcraftEngine};
pub use error::{ErrorKind, SwitchcraftError};
pub use executor::{execute_plan, ExecutionContext, ExecutionReport};
pub use logging::init_logging;
pub use model::{
    DeviceConfig, L3Interface, LinkState, Port, PortId, PortSpeed, Vlan, BROCADE_RESERVED_VLANS,
    DEFAULT_VLAN, VLAN_MAX, VLAN_MIN,
};
pub use plan::{build_plan, CommandPlan, CommandTag, PlanOptions, TaggedCommand};
pub use recovery::{RecoveryAction, RecoveryAttempt};
pub use safety::HilConstraints;

// Re-export handler layer
pub use handlers::{
    brocade::BrocadeHandler, openwrt::OpenWrtHandler, zyxel::ZyxelHandler, BatchOutcome,
    CommandOutcome, CommandStatus, DeviceHandler, HandlerFactory,
};

// Re-export session transports
pub use session::https::ZyxelHttpsSession;
pub use session::ssh_exec::OpenWrtSession;
pub use session::ssh_shell::ZyxelShellSession;
pub use session::telnet::TelnetSession;
pub use session::{BackoffPolicy, SessionState};
