use crate::error::SwitchcraftError;
use crate::session::SessionState;
use crate::session_log::SessionLog;
use lazy_static::lazy_static;
use regex::Regex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8192;

lazy_static! {
    /// Any FastIron prompt: user `>`, privileged `#`, config `(config)#`.
    static ref PROMPT: Regex = Regex::new(r".+[>#]\s*$").unwrap();
    /// Privileged prompt at column 0; batch reads run until this returns.
    static ref PRIV_PROMPT_LINE: Regex = Regex::new(r"(?m)^[^\s>]*#\s*$").unwrap();
    static ref PASSWORD_PROMPT: Regex = Regex::new(r"(?i)password\s*:\s*$").unwrap();
    static ref MORE_PAGER: Regex = Regex::new(r"--More--").unwrap();
    static ref CONFIG_BLOCKED: Regex =
        Regex::new(r"(?i)config mode is in use|session .* in config mode").unwrap();
    static ref SESSION_NUMBER: Regex = Regex::new(r"(?i)(?:console|telnet)\s+(?:session\s+)?(\d+)").unwrap();
}

/// Interactive Telnet session against a Brocade FastIron CLI.
///
/// The device paginates by default; `skip-page-display` is sent
/// unconditionally after enable, otherwise a `--More--` pager deadlocks
/// every reader that waits for a prompt.
pub struct TelnetSession {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    state: SessionState,
    read_timeout: Duration,
    in_config_mode: bool,
    last_activity: Instant,
    pub session_log: SessionLog,
}

impl TelnetSession {
    pub fn new(host: impl Into<String>, port: u16, read_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            state: SessionState::Disconnected,
            read_timeout,
            in_config_mode: false,
            last_activity: Instant::now(),
            session_log: SessionLog::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.state == SessionState::Ready
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Connect and authenticate up to the privileged `#` prompt.
    pub fn connect(
        &mut self,
        password: &str,
        enable_password: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<(), SwitchcraftError> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!(target: "TelnetSession::connect", "Establishing TCP connection to {}", addr);
        self.state = SessionState::Connecting;

        use std::net::ToSocketAddrs;
        let sock_addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| SwitchcraftError::connection_failed(addr.clone(), e))?
            .next()
            .ok_or_else(|| SwitchcraftError::ConnectionError(format!("no address for {}", addr)))?;

        let stream = TcpStream::connect_timeout(&sock_addr, connect_timeout)
            .map_err(|e| SwitchcraftError::connection_failed(&addr, e))?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.read_timeout))?;
        self.stream = Some(stream);

        // Initial banner ends in a login password prompt or directly in a
        // `>`/`#` prompt depending on the device's aaa settings.
        let mut banner = self.read_until_any(&[&PASSWORD_PROMPT, &PROMPT], self.read_timeout)?;
        if PASSWORD_PROMPT.is_match(&banner) {
            self.write_line(password)?;
            banner = self.read_until(&PROMPT, self.read_timeout)?;
        }
        debug!(target: "TelnetSession::connect", banner_len = banner.len(), "received login banner");

        if banner.trim_end().ends_with('>') {
            self.write_line("enable")?;
            let prompt = self.read_until_any(&[&PASSWORD_PROMPT, &PROMPT], self.read_timeout)?;
            if PASSWORD_PROMPT.is_match(&prompt) {
                let secret = enable_password.unwrap_or(password);
                self.write_line(secret)?;
                let after = self.read_until(&PROMPT, self.read_timeout)?;
                if !after.trim_end().ends_with('#') {
                    self.state = SessionState::Disconnected;
                    return Err(SwitchcraftError::AuthenticationError(
                        "enable authentication rejected".to_string(),
                    ));
                }
            }
        }
        self.state = SessionState::Authenticated;

        // Without this the pager truncates output and readers deadlock on
        // --More--.
        self.write_line("skip-page-display")?;
        self.read_until(&PROMPT, self.read_timeout)?;

        self.state = SessionState::Ready;
        self.last_activity = Instant::now();
        info!(target: "TelnetSession::connect", host = %self.host, "telnet session ready");
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), SwitchcraftError> {
        self.state = SessionState::Closing;
        if self.in_config_mode {
            let _ = self.write_line("end");
            self.in_config_mode = false;
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = SessionState::Disconnected;
        debug!(target: "TelnetSession::close", host = %self.host, "session closed");
        Ok(())
    }

    fn write_raw(&mut self, data: &str) -> Result<(), SwitchcraftError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            SwitchcraftError::WriteError("attempt to write with no active connection".to_string())
        })?;
        stream
            .write_all(data.as_bytes())
            .map_err(|e| SwitchcraftError::WriteError(format!("failed to write: {}", e)))?;
        stream
            .flush()
            .map_err(|e| SwitchcraftError::WriteError(format!("failed to flush: {}", e)))?;
        self.session_log.write_raw(data.as_bytes())?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Brocade expects CRLF line terminators.
    pub fn write_line(&mut self, line: &str) -> Result<(), SwitchcraftError> {
        debug!(target: "TelnetSession::write_line", line, "sending");
        self.write_raw(&format!("{}\r\n", line))
    }

    fn read_until_any(
        &mut self,
        patterns: &[&Regex],
        timeout: Duration,
    ) -> Result<String, SwitchcraftError> {
        if self.stream.is_none() {
            return Err(SwitchcraftError::ReadError(
                "attempt to read with no active connection".to_string(),
            ));
        }
        let mut output = String::new();
        let mut buffer = vec![0u8; READ_CHUNK];
        let start = Instant::now();

        loop {
            if start.elapsed() >= timeout {
                return Err(SwitchcraftError::timeout(format!(
                    "waiting for prompt (got {} bytes)",
                    output.len()
                )));
            }
            let read = {
                let stream = self.stream.as_mut().unwrap();
                stream.read(&mut buffer)
            };
            match read {
                Ok(0) => {
                    return Err(SwitchcraftError::ReadError(
                        "connection closed by remote device".to_string(),
                    ));
                }
                Ok(n) => {
                    match std::str::from_utf8(&buffer[..n]) {
                        Ok(s) => output.push_str(s),
                        Err(_) => output.push_str(&String::from_utf8_lossy(&buffer[..n])),
                    }
                    // Dismiss the pager in case a pre-login banner pages.
                    if MORE_PAGER.is_match(&output) {
                        let pos = output.rfind("--More--").unwrap();
                        output.truncate(pos);
                        let stream = self.stream.as_mut().unwrap();
                        stream.write_all(b" ").map_err(SwitchcraftError::IoError)?;
                        continue;
                    }
                    if patterns.iter().any(|p| p.is_match(&output)) {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(SwitchcraftError::IoError(e)),
            }
        }

        self.last_activity = Instant::now();
        self.session_log.write_raw(output.as_bytes())?;
        Ok(output)
    }

    pub fn read_until(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<String, SwitchcraftError> {
        self.read_until_any(&[pattern], timeout)
    }

    /// Execute one command and return its output with echo and trailing
    /// prompt stripped.
    pub fn execute(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        if command.trim().is_empty() {
            return Err(SwitchcraftError::validation("empty command"));
        }
        self.write_line(command)?;
        let raw = self.read_until(&PROMPT, self.read_timeout)?;
        Ok(strip_echo_and_prompt(&raw, command))
    }

    /// Batch mode: write all commands separated by newlines and read until
    /// the privileged prompt returns at column 0. Does NOT wait per command.
    pub fn execute_batch(
        &mut self,
        commands: &[String],
        timeout: Duration,
    ) -> Result<String, SwitchcraftError> {
        if commands.is_empty() {
            return Ok(String::new());
        }
        for command in commands {
            if command.trim().is_empty() {
                return Err(SwitchcraftError::validation("empty command in batch"));
            }
        }
        let blob = commands.join("\r\n");
        self.write_raw(&format!("{}\r\n", blob))?;
        self.read_until(&PRIV_PROMPT_LINE, timeout)
    }

    /// Enter config mode; a stale session holding the config lock is killed
    /// and the entry retried once.
    pub fn enter_config_mode(&mut self) -> Result<(), SwitchcraftError> {
        if self.in_config_mode {
            return Ok(());
        }
        self.write_line("configure terminal")?;
        let output = self.read_until(&PROMPT, self.read_timeout)?;
        if CONFIG_BLOCKED.is_match(&output) {
            warn!(target: "TelnetSession::enter_config_mode", host = %self.host, "config mode blocked by stale session, killing it");
            let session_no = SESSION_NUMBER
                .captures(&output)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "1".to_string());
            self.write_line(&format!("kill console {}", session_no))?;
            self.read_until(&PROMPT, self.read_timeout)?;
            self.write_line("configure terminal")?;
            let retry = self.read_until(&PROMPT, self.read_timeout)?;
            if CONFIG_BLOCKED.is_match(&retry) {
                return Err(SwitchcraftError::ConnectionError(
                    "config mode still blocked after kill console".to_string(),
                ));
            }
        }
        self.in_config_mode = true;
        Ok(())
    }

    pub fn exit_config_mode(&mut self) -> Result<(), SwitchcraftError> {
        if !self.in_config_mode {
            return Ok(());
        }
        self.write_line("end")?;
        self.read_until(&PROMPT, self.read_timeout)?;
        self.in_config_mode = false;
        Ok(())
    }

    pub fn in_config_mode(&self) -> bool {
        self.in_config_mode
    }
}

/// Strip the command echo and the trailing prompt line from raw output.
pub fn strip_echo_and_prompt(raw: &str, command: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    if let Some(last) = lines.last() {
        if PROMPT.is_match(last) {
            lines.pop();
        }
    }
    if let Some(first) = lines.first() {
        if first.trim_end() == command.trim() || first.contains(command.trim()) {
            lines.remove(0);
        }
    }
    lines.join("\n")
}

/// Split batch output into per-command segments by locating each echo.
/// Attribution for error scanning and partial-failure reporting.
pub fn split_batch_output(raw: &str, commands: &[String]) -> Vec<String> {
    let mut segments = Vec::with_capacity(commands.len());
    let mut cursor = 0usize;
    let mut marks: Vec<usize> = Vec::with_capacity(commands.len());
    for command in commands {
        match raw[cursor..].find(command.as_str()) {
            Some(pos) => {
                let absolute = cursor + pos;
                marks.push(absolute);
                cursor = absolute + command.len();
            }
            None => marks.push(cursor),
        }
    }
    for (i, &start) in marks.iter().enumerate() {
        let end = marks.get(i + 1).copied().unwrap_or(raw.len());
        segments.push(raw[start..end].to_string());
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_matches_user_and_privileged() {
        assert!(PROMPT.is_match("SSH@ICX7250>"));
        assert!(PROMPT.is_match("SSH@ICX7250#"));
        assert!(PROMPT.is_match("SSH@ICX7250(config)# "));
        assert!(!PROMPT.is_match("loading..."));
    }

    #[test]
    fn privileged_prompt_must_start_at_column_0() {
        assert!(PRIV_PROMPT_LINE.is_match("output\nICX7250# "));
        assert!(!PRIV_PROMPT_LINE.is_match("  indented# "));
    }

    #[test]
    fn empty_command_rejected_before_wire() {
        let mut session = TelnetSession::new("192.0.2.1", 23, Duration::from_secs(1));
        let err = session.execute("   ").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn strip_echo_and_prompt_removes_both() {
        let raw = "show vlan\nPORT-VLAN 1, Name DEFAULT-VLAN\nICX7250# ";
        assert_eq!(
            strip_echo_and_prompt(raw, "show vlan"),
            "PORT-VLAN 1, Name DEFAULT-VLAN"
        );
    }

    #[test]
    fn batch_output_splits_on_echoes() {
        let commands = vec!["vlan 100 by port".to_string(), "untagged ethe 1/1/5".to_string()];
        let raw = "vlan 100 by port\nok\nuntagged ethe 1/1/5\nerror: Invalid input\nICX# ";
        let segments = split_batch_output(raw, &commands);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].contains("ok"));
        assert!(segments[1].contains("Invalid input"));
    }

    #[test]
    fn config_blocked_pattern_matches() {
        assert!(CONFIG_BLOCKED.is_match("Error - config mode is in use by telnet session 2"));
        let caps = SESSION_NUMBER.captures("config mode is in use by telnet session 2").unwrap();
        assert_eq!(&caps[1], "2");
    }
}
