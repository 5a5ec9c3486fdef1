use crate::device::TransportKind;
use crate::error::SwitchcraftError;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    // Brocade FastIron error patterns
    pub static ref BROCADE_ERRORS: Vec<Regex> = vec![
        Regex::new(r"(?i)invalid input").unwrap(),
        Regex::new(r"(?i)unrecognized command").unwrap(),
        Regex::new(r"(?i)incomplete command").unwrap(),
        Regex::new(r"(?i)ambiguous input").unwrap(),
        Regex::new(r"(?i)please disable dual mode").unwrap(),
        Regex::new(r"(?i)already a member").unwrap(),
        Regex::new(r"(?i)port is in spanning-tree").unwrap(),
        Regex::new(r"(?i)error - ").unwrap(),
        Regex::new(r"(?i)config mode is in use").unwrap(),
    ];

    // Zyxel GS1900 structural error markers. Counters legitimately contain
    // words like "error" and "fail"; only line-anchored markers count.
    pub static ref ZYXEL_ERRORS: Vec<Regex> = vec![
        Regex::new(r"(?im)^\s*Error\s*:").unwrap(),
        Regex::new(r"(?im)^%\s").unwrap(),
        Regex::new(r"(?im)^\s*Invalid (?:command|input|parameter)").unwrap(),
        Regex::new(r"(?im)^\s*Fail(?:ed)? to\b").unwrap(),
        Regex::new(r"(?i)already a member").unwrap(),
    ];

    // OpenWrt / uci error patterns
    pub static ref OPENWRT_ERRORS: Vec<Regex> = vec![
        Regex::new(r"(?i)uci: Entry not found").unwrap(),
        Regex::new(r"(?i)uci: Invalid argument").unwrap(),
        Regex::new(r"(?i)uci: Parse error").unwrap(),
        Regex::new(r"(?im)^ash: .+: not found").unwrap(),
        Regex::new(r"(?im)^-ash: ").unwrap(),
        Regex::new(r"(?i)command failed").unwrap(),
    ];
}

/// Returns the error patterns for the transport kind.
pub fn get_error_patterns(kind: TransportKind) -> &'static Vec<Regex> {
    match kind {
        TransportKind::BrocadeTelnet => &BROCADE_ERRORS,
        TransportKind::ZyxelCli | TransportKind::ZyxelHttps => &ZYXEL_ERRORS,
        TransportKind::OpenWrtSsh => &OPENWRT_ERRORS,
    }
}

/// Scan command output for a recognized vendor error. Returns the matched
/// text when one is found.
pub fn check_for_errors(output: &str, kind: TransportKind) -> Option<String> {
    let patterns = get_error_patterns(kind);
    for pattern in patterns {
        if let Some(m) = pattern.find(output) {
            debug!(target: "error_patterns::check_for_errors", transport = %kind, matched = m.as_str(), "vendor error pattern matched");
            return Some(m.as_str().to_string());
        }
    }
    None
}

/// Scan output and convert a recognized pattern into a `vendor-reject` error.
pub fn check_command_output(
    output: &str,
    kind: TransportKind,
    device_id: &str,
    command: &str,
) -> Result<(), SwitchcraftError> {
    if let Some(matched) = check_for_errors(output, kind) {
        return Err(SwitchcraftError::vendor_reject(device_id, command, matched));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brocade_invalid_input_detected() {
        let output = "Invalid input -> vlan 5000\nType ? for a list";
        assert!(check_for_errors(output, TransportKind::BrocadeTelnet).is_some());
    }

    #[test]
    fn brocade_dual_mode_detected() {
        let output = "Error - Please disable dual mode on port 1/1/10 first";
        let matched = check_for_errors(output, TransportKind::BrocadeTelnet).unwrap();
        assert!(matched.to_lowercase().contains("dual mode") || matched.to_lowercase().contains("error"));
    }

    #[test]
    fn zyxel_counter_output_is_not_an_error() {
        // Interface statistics legitimately contain the word "error".
        let output = "\
Port 7 statistics\n\
  in octets      102938172\n\
  in errors      5\n\
  out errors     0\n\
  collisions     fail-safe off\n";
        assert!(check_for_errors(output, TransportKind::ZyxelCli).is_none());
    }

    #[test]
    fn zyxel_structural_error_detected() {
        let output = "Error: VLAN 4095 is out of range";
        assert!(check_for_errors(output, TransportKind::ZyxelCli).is_some());
    }

    #[test]
    fn openwrt_uci_errors_detected() {
        assert!(check_for_errors("uci: Entry not found", TransportKind::OpenWrtSsh).is_some());
        assert!(check_for_errors("lan1: link up", TransportKind::OpenWrtSsh).is_none());
    }

    #[test]
    fn clean_output_passes_check() {
        assert!(check_command_output(
            "VLAN 100 added",
            TransportKind::BrocadeTelnet,
            "sw1",
            "vlan 100"
        )
        .is_ok());
    }
}
