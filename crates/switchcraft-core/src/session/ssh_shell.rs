use crate::error::SwitchcraftError;
use crate::session::SessionState;
use crate::session_log::SessionLog;
use lazy_static::lazy_static;
use regex::Regex;
use ssh2::{MethodType, Session};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info};

lazy_static! {
    /// Zyxel GS1900 shell prompt.
    static ref PROMPT: Regex = Regex::new(r"(?m).*# $").unwrap();
    static ref MORE_PAGER: Regex = Regex::new(r"--More--").unwrap();
}

/// Key-exchange and cipher preferences for firmware speaking OpenSSH <= 6.2.
/// Modern libssh2 defaults drop these and the handshake fails outright.
const LEGACY_KEX: &str =
    "diffie-hellman-group14-sha1,diffie-hellman-group1-sha1,diffie-hellman-group-exchange-sha1";
const LEGACY_HOSTKEY: &str = "ssh-rsa,ssh-dss";
const LEGACY_CIPHERS: &str = "aes128-ctr,aes128-cbc,3des-cbc";

/// Interactive SSH shell session against a Zyxel GS1900.
///
/// The CLI on this firmware is effectively read-only; writes go through the
/// web management surface. Opens a real shell (not exec): the legacy CLI
/// only speaks through a PTY.
pub struct ZyxelShellSession {
    host: String,
    port: u16,
    session: Option<Session>,
    channel: Option<ssh2::Channel>,
    state: SessionState,
    read_timeout: Duration,
    last_activity: Instant,
    pub session_log: SessionLog,
}

impl ZyxelShellSession {
    pub fn new(host: impl Into<String>, port: u16, read_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            session: None,
            channel: None,
            state: SessionState::Disconnected,
            read_timeout,
            last_activity: Instant::now(),
            session_log: SessionLog::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some() && self.state == SessionState::Ready
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn connect(
        &mut self,
        username: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<(), SwitchcraftError> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!(target: "ZyxelShellSession::connect", "Establishing TCP connection to {}", addr);
        self.state = SessionState::Connecting;

        use std::net::ToSocketAddrs;
        let sock_addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| SwitchcraftError::connection_failed(addr.clone(), e))?
            .next()
            .ok_or_else(|| SwitchcraftError::ConnectionError(format!("no address for {}", addr)))?;
        let tcp = TcpStream::connect_timeout(&sock_addr, connect_timeout)
            .map_err(|e| SwitchcraftError::connection_failed(&addr, e))?;
        tcp.set_read_timeout(Some(self.read_timeout))?;
        tcp.set_write_timeout(Some(self.read_timeout))?;

        let mut session = Session::new()?;

        debug!(target: "ZyxelShellSession::connect", "negotiating legacy algorithms");
        session.method_pref(MethodType::Kex, LEGACY_KEX)?;
        session.method_pref(MethodType::HostKey, LEGACY_HOSTKEY)?;
        session.method_pref(MethodType::CryptCs, LEGACY_CIPHERS)?;
        session.method_pref(MethodType::CryptSc, LEGACY_CIPHERS)?;

        session.set_tcp_stream(tcp);
        session.handshake()?;

        session
            .userauth_password(username, password)
            .map_err(|e| SwitchcraftError::AuthenticationError(format!("{}: {}", username, e)))?;

        let mut channel = session.channel_session()?;
        channel.request_pty("vt100", None, None)?;
        channel.shell()?;
        session.set_blocking(true);
        session.set_timeout(self.read_timeout.as_millis() as u32);

        self.session = Some(session);
        self.channel = Some(channel);
        self.state = SessionState::Authenticated;

        // Swallow the login banner up to the first prompt.
        self.read_until_prompt(self.read_timeout)?;
        self.state = SessionState::Ready;
        self.last_activity = Instant::now();
        info!(target: "ZyxelShellSession::connect", host = %self.host, "shell session ready");
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), SwitchcraftError> {
        self.state = SessionState::Closing;
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.send_eof();
            let _ = channel.close();
            let _ = channel.wait_close();
        }
        self.session = None;
        self.state = SessionState::Disconnected;
        debug!(target: "ZyxelShellSession::close", host = %self.host, "session closed");
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), SwitchcraftError> {
        let channel = self.channel.as_mut().ok_or_else(|| {
            SwitchcraftError::WriteError("attempt to write with no active channel".to_string())
        })?;
        // The GS1900 shell expects CRLF.
        channel
            .write_all(format!("{}\r\n", line).as_bytes())
            .map_err(|e| SwitchcraftError::WriteError(format!("failed to write: {}", e)))?;
        channel
            .flush()
            .map_err(|e| SwitchcraftError::WriteError(format!("failed to flush: {}", e)))?;
        self.session_log.write_raw(line.as_bytes())?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Line-buffered read until the shell prompt matches; `--More--` is
    /// dismissed with a space.
    fn read_until_prompt(&mut self, timeout: Duration) -> Result<String, SwitchcraftError> {
        if self.channel.is_none() {
            return Err(SwitchcraftError::ReadError(
                "attempt to read with no active channel".to_string(),
            ));
        }
        let mut output = String::new();
        let mut buffer = vec![0u8; 8192];
        let start = Instant::now();

        loop {
            if start.elapsed() >= timeout {
                return Err(SwitchcraftError::timeout("waiting for shell prompt"));
            }
            let read = {
                let channel = self.channel.as_mut().unwrap();
                channel.read(&mut buffer)
            };
            match read {
                Ok(0) => {
                    return Err(SwitchcraftError::ReadError(
                        "channel stream closed by remote device".to_string(),
                    ));
                }
                Ok(n) => {
                    match std::str::from_utf8(&buffer[..n]) {
                        Ok(s) => output.push_str(s),
                        Err(_) => output.push_str(&String::from_utf8_lossy(&buffer[..n])),
                    }
                    if MORE_PAGER.is_match(&output) {
                        let pos = output.rfind("--More--").unwrap();
                        output.truncate(pos);
                        let channel = self.channel.as_mut().unwrap();
                        channel.write_all(b" ").map_err(|e| {
                            SwitchcraftError::WriteError(format!("failed to dismiss pager: {}", e))
                        })?;
                        continue;
                    }
                    if PROMPT.is_match(&output) {
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

    /// Execute one read command and return its output with echo and prompt
    /// stripped.
    pub fn execute(&mut self, command: &str) -> Result<String, SwitchcraftError> {
        if command.trim().is_empty() {
            return Err(SwitchcraftError::validation("empty command"));
        }
        self.write_line(command)?;
        let raw = self.read_until_prompt(self.read_timeout)?;
        let mut lines: Vec<&str> = raw.lines().collect();
        if let Some(last) = lines.last() {
            if last.trim_end().ends_with('#') {
                lines.pop();
            }
        }
        if let Some(first) = lines.first() {
            if first.contains(command.trim()) {
                lines.remove(0);
            }
        }
        Ok(lines.join("\n"))
    }
}
