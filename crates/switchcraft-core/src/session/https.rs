use crate::error::SwitchcraftError;
use crate::session::SessionState;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DISPATCHER_PATH: &str = "/cgi-bin/dispatcher.cgi";

/// Length of the obfuscated password blob the login form expects.
const OBFUSCATED_LEN: usize = 321;
/// Index carrying the tens digit of the password length.
const TENS_POS: usize = 123;
/// Index carrying the ones digit of the password length.
const ONES_POS: usize = 289;

lazy_static! {
    static ref XSSID: Regex =
        Regex::new(r#"name=["']?XSSID["']?\s+value=["']?([0-9A-Za-z]+)["']?"#).unwrap();
    static ref SESSION_ID: Regex = Regex::new(r"\b([0-9A-Za-z]{32})\b").unwrap();
}

/// Expand a password into the 321-character blob the GS1900 login form
/// expects: password characters at positions divisible by 5 in reverse
/// order, the length's tens digit at 123, ones digit at 289, every other
/// position filled with random alphanumerics.
pub fn obfuscate_password(password: &str) -> Result<String, SwitchcraftError> {
    let chars: Vec<char> = password.chars().collect();
    if chars.len() > 64 {
        return Err(SwitchcraftError::validation(
            "password longer than 64 characters cannot be encoded",
        ));
    }
    const FILLER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let mut reversed = chars.iter().rev();
    let mut out = String::with_capacity(OBFUSCATED_LEN);

    for pos in 0..OBFUSCATED_LEN {
        if pos == TENS_POS {
            out.push(char::from(b'0' + ((chars.len() / 10) % 10) as u8));
        } else if pos == ONES_POS {
            out.push(char::from(b'0' + (chars.len() % 10) as u8));
        } else if pos % 5 == 0 {
            match reversed.next() {
                Some(&c) => out.push(c),
                None => out.push(FILLER[rng.gen_range(0..FILLER.len())] as char),
            }
        } else {
            out.push(FILLER[rng.gen_range(0..FILLER.len())] as char);
        }
    }
    Ok(out)
}

/// Web-management session against a Zyxel GS1900.
///
/// Every form POST must carry the `XSSID` token scraped from the previous
/// page; the token rotates per page load.
pub struct ZyxelHttpsSession {
    base_url: String,
    client: reqwest::blocking::Client,
    state: SessionState,
    session_id: Option<String>,
    xssid: Option<String>,
    last_activity: Instant,
}

impl ZyxelHttpsSession {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Result<Self, SwitchcraftError> {
        let host = host.into();
        let base_url = if port == 443 {
            format!("https://{}", host)
        } else {
            format!("https://{}:{}", host, port)
        };
        // The device ships a self-signed certificate.
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url,
            client,
            state: SessionState::Disconnected,
            session_id: None,
            xssid: None,
            last_activity: Instant::now(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session_id.is_some() && self.state == SessionState::Ready
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn xssid(&self) -> Option<&str> {
        self.xssid.as_deref()
    }

    fn update_tokens(&mut self, body: &str) {
        if let Some(caps) = XSSID.captures(body) {
            self.xssid = Some(caps[1].to_string());
        }
    }

    /// Login with the obfuscated password; yields a 32-character session id.
    pub fn login(&mut self, username: &str, password: &str) -> Result<(), SwitchcraftError> {
        self.state = SessionState::Connecting;
        let obfuscated = obfuscate_password(password)?;
        debug!(target: "ZyxelHttpsSession::login", base_url = %self.base_url, "posting login form");

        let response = self
            .client
            .post(format!("{}{}", self.base_url, DISPATCHER_PATH))
            .form(&[
                ("login", "1"),
                ("username", username),
                ("password", obfuscated.as_str()),
            ])
            .send()?;
        let body = response.text()?;

        let session_id = SESSION_ID
            .captures(&body)
            .map(|c| c[1].to_string())
            .ok_or_else(|| {
                SwitchcraftError::AuthenticationError(
                    "login response carried no session id".to_string(),
                )
            })?;
        self.session_id = Some(session_id);
        self.state = SessionState::Authenticated;

        // First page load seeds the XSSID chain.
        self.refresh_page("login_ok")?;
        self.state = SessionState::Ready;
        self.last_activity = Instant::now();
        info!(target: "ZyxelHttpsSession::login", base_url = %self.base_url, "web session ready");
        Ok(())
    }

    /// Fetch a page, refreshing the XSSID token from its HTML.
    pub fn refresh_page(&mut self, cmd: &str) -> Result<String, SwitchcraftError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, DISPATCHER_PATH))
            .query(&[("cmd", cmd)])
            .send()?;
        let body = response.text()?;
        self.update_tokens(&body);
        self.last_activity = Instant::now();
        Ok(body)
    }

    /// POST a form to the dispatcher; the current XSSID is always included
    /// and the next one harvested from the response.
    pub fn post_form(&mut self, fields: &[(String, String)]) -> Result<String, SwitchcraftError> {
        if self.session_id.is_none() {
            return Err(SwitchcraftError::ConnectionError(
                "not logged in".to_string(),
            ));
        }
        let xssid = self.xssid.clone().ok_or_else(|| {
            SwitchcraftError::PromptError("no XSSID token; page chain broken".to_string())
        })?;

        let mut form: Vec<(String, String)> = vec![("XSSID".to_string(), xssid)];
        form.extend(fields.iter().cloned());

        debug!(target: "ZyxelHttpsSession::post_form", fields = fields.len(), "posting form");
        let response = self
            .client
            .post(format!("{}{}", self.base_url, DISPATCHER_PATH))
            .form(&form)
            .send()?;
        let body = response.text()?;
        self.update_tokens(&body);
        self.last_activity = Instant::now();
        Ok(body)
    }

    pub fn close(&mut self) -> Result<(), SwitchcraftError> {
        self.state = SessionState::Closing;
        if self.session_id.take().is_some() {
            let _ = self
                .client
                .get(format!("{}{}", self.base_url, DISPATCHER_PATH))
                .query(&[("cmd", "logout")])
                .send();
        }
        self.xssid = None;
        self.state = SessionState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscated_blob_has_fixed_length() {
        let blob = obfuscate_password("admin123").unwrap();
        assert_eq!(blob.chars().count(), 321);
        assert!(blob.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn password_recoverable_from_positions_divisible_by_5() {
        let password = "s3cretPW";
        let blob: Vec<char> = obfuscate_password(password).unwrap().chars().collect();
        let extracted: String = (0..password.len())
            .map(|i| blob[i * 5])
            .collect::<Vec<char>>()
            .into_iter()
            .rev()
            .collect();
        assert_eq!(extracted, password);
    }

    #[test]
    fn length_digits_at_fixed_positions() {
        let blob: Vec<char> = obfuscate_password("abcdefghijkl").unwrap().chars().collect();
        // 12 characters: tens digit 1 at 123, ones digit 2 at 289
        assert_eq!(blob[123], '1');
        assert_eq!(blob[289], '2');
    }

    #[test]
    fn xssid_extracted_from_html() {
        let html = r#"<input type="hidden" name="XSSID" value="3fA9c1D2e8">"#;
        let caps = XSSID.captures(html).unwrap();
        assert_eq!(&caps[1], "3fA9c1D2e8");
    }

    #[test]
    fn session_id_is_32_chars() {
        let body = "window.sessionid='0123456789abcdef0123456789abcdef';";
        let caps = SESSION_ID.captures(body).unwrap();
        assert_eq!(caps[1].len(), 32);
    }
}
