use crate::error::SwitchcraftError;
use crate::session::SessionState;
use ssh2::Session;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// SSH session against an OpenWrt device. No persistent shell: every command
/// is one `exec_command`, and whole-file configuration edits go over SCP.
pub struct OpenWrtSession {
    host: String,
    port: u16,
    session: Option<Session>,
    state: SessionState,
    read_timeout: Duration,
    last_activity: Instant,
}

/// Output of one exec call, exit status included: uci reports failure through
/// the status, not always through text.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl ExecOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

impl OpenWrtSession {
    pub fn new(host: impl Into<String>, port: u16, read_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            session: None,
            state: SessionState::Disconnected,
            read_timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some() && self.state == SessionState::Ready
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
        debug!(target: "OpenWrtSession::connect", "Establishing TCP connection to {}", addr);
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
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session
            .userauth_password(username, password)
            .map_err(|e| SwitchcraftError::AuthenticationError(format!("{}: {}", username, e)))?;
        session.set_keepalive(true, 60);
        session.set_timeout(self.read_timeout.as_millis() as u32);

        self.session = Some(session);
        self.state = SessionState::Ready;
        self.last_activity = Instant::now();
        info!(target: "OpenWrtSession::connect", host = %self.host, "ssh session ready");
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), SwitchcraftError> {
        self.state = SessionState::Closing;
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
        }
        self.state = SessionState::Disconnected;
        debug!(target: "OpenWrtSession::close", host = %self.host, "session closed");
        Ok(())
    }

    /// One command, one channel.
    pub fn execute(&mut self, command: &str) -> Result<ExecOutput, SwitchcraftError> {
        if command.trim().is_empty() {
            return Err(SwitchcraftError::validation("empty command"));
        }
        let session = self.session.as_mut().ok_or_else(|| {
            SwitchcraftError::ConnectionError("no active session".to_string())
        })?;

        debug!(target: "OpenWrtSession::execute", command, "exec");
        let mut channel = session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| SwitchcraftError::ReadError(format!("failed to read stdout: {}", e)))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| SwitchcraftError::ReadError(format!("failed to read stderr: {}", e)))?;

        channel.wait_close()?;
        let exit_status = channel.exit_status()?;
        self.last_activity = Instant::now();

        debug!(target: "OpenWrtSession::execute", exit_status, stdout_len = stdout.len(), "exec complete");
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    /// Download a file over SCP.
    pub fn scp_download(&mut self, remote_path: &str) -> Result<String, SwitchcraftError> {
        let session = self.session.as_mut().ok_or_else(|| {
            SwitchcraftError::ConnectionError("no active session".to_string())
        })?;

        debug!(target: "OpenWrtSession::scp_download", remote_path, "downloading");
        let (mut channel, stat) = session.scp_recv(Path::new(remote_path))?;
        let mut content = Vec::with_capacity(stat.size() as usize);
        channel
            .read_to_end(&mut content)
            .map_err(|e| SwitchcraftError::ReadError(format!("scp read failed: {}", e)))?;
        channel.send_eof()?;
        channel.wait_eof()?;
        channel.wait_close()?;
        self.last_activity = Instant::now();

        String::from_utf8(content)
            .map_err(|e| SwitchcraftError::ParseError(format!("{} is not UTF-8: {}", remote_path, e)))
    }

    /// Upload a file over SCP.
    ///
    /// An empty `/etc/config/network` bricks the device; blank content is
    /// refused here no matter what the caller validated.
    pub fn scp_upload(&mut self, remote_path: &str, content: &str) -> Result<(), SwitchcraftError> {
        if content.trim().is_empty() {
            return Err(SwitchcraftError::validation(format!(
                "refusing to upload empty content to {}",
                remote_path
            )));
        }
        let session = self.session.as_mut().ok_or_else(|| {
            SwitchcraftError::ConnectionError("no active session".to_string())
        })?;

        debug!(target: "OpenWrtSession::scp_upload", remote_path, bytes = content.len(), "uploading");
        let mut channel = session.scp_send(
            Path::new(remote_path),
            0o644,
            content.len() as u64,
            None,
        )?;
        channel
            .write_all(content.as_bytes())
            .map_err(|e| SwitchcraftError::WriteError(format!("scp write failed: {}", e)))?;
        channel.send_eof()?;
        channel.wait_eof()?;
        channel.wait_close()?;
        self.last_activity = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_rejected_before_wire() {
        let mut session = OpenWrtSession::new("192.0.2.1", 22, Duration::from_secs(1));
        let err = session.execute("").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn empty_upload_rejected_before_wire() {
        let mut session = OpenWrtSession::new("192.0.2.1", 22, Duration::from_secs(1));
        for content in ["", "   \n\t  "] {
            let err = session.scp_upload("/etc/config/network", content).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        }
    }

    #[test]
    fn combined_output_merges_streams() {
        let out = ExecOutput {
            stdout: "a".into(),
            stderr: "b".into(),
            exit_status: 0,
        };
        assert_eq!(out.combined(), "a\nb");
    }
}
