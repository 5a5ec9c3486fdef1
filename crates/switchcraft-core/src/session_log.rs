use crate::error::SwitchcraftError;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;

/// Raw per-device channel transcript, for debugging fragile sessions.
/// Distinct from the audit log; disabled by default.
pub struct SessionLog {
    file: Option<File>,
    enabled: bool,
}

impl SessionLog {
    pub fn new() -> Self {
        SessionLog {
            file: None,
            enabled: false,
        }
    }

    pub fn enable(&mut self, path: &str) -> Result<(), SwitchcraftError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).map_err(SwitchcraftError::IoError)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(SwitchcraftError::IoError)?;

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        writeln!(file, "{}", "=".repeat(80)).map_err(SwitchcraftError::IoError)?;
        writeln!(file, "SESSION START: {}", timestamp).map_err(SwitchcraftError::IoError)?;
        writeln!(file, "{}", "=".repeat(80)).map_err(SwitchcraftError::IoError)?;
        file.flush().map_err(SwitchcraftError::IoError)?;

        self.file = Some(file);
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) {
        if self.enabled {
            if let Some(mut file) = self.file.take() {
                let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                let _ = writeln!(file, "\n{}", "=".repeat(80));
                let _ = writeln!(file, "SESSION END: {}", timestamp);
                let _ = writeln!(file, "{}", "=".repeat(80));
            }
            self.enabled = false;
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled
    }

    pub fn log_command(&mut self, command: &str, output: &str) -> Result<(), SwitchcraftError> {
        if let Some(file) = self.file.as_mut() {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
            writeln!(file, "\n[{}] >>> {}", timestamp, command).map_err(SwitchcraftError::IoError)?;
            writeln!(file, "{}", output.trim_end()).map_err(SwitchcraftError::IoError)?;
            file.flush().map_err(SwitchcraftError::IoError)?;
        }
        Ok(())
    }

    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), SwitchcraftError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data).map_err(SwitchcraftError::IoError)?;
            file.flush().map_err(SwitchcraftError::IoError)?;
        }
        Ok(())
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}
