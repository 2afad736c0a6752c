//! # Built-in Client Detectors
//!
//! Pattern-based detectors for clients that announce themselves early in
//! the conversation: SSH banners, SMTP greetings, IMAP/POP3 logins, VNC
//! protocol version handshakes. Each detector contributes its patterns to
//! the discovery matcher and validates candidate payloads.

use crate::app_info::{
    APP_ID_IMAP, APP_ID_NONE, APP_ID_OPENSSH, APP_ID_POP3, APP_ID_PUTTY, APP_ID_SMTP, APP_ID_SSH,
    APP_ID_VNC,
};
use crate::discovery::{ClientDetector, DetectorVerdict, DiscoveryArgs};
use crate::matcher::ClientPatternMatcher;
use crate::protocols::Direction;

/// Extract the first line of a payload, or `None` while it is incomplete.
fn first_line(data: &[u8]) -> Option<&[u8]> {
    let end = data.iter().position(|&b| b == b'\n')?;
    let line = &data[..end];
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

/// Identifies SSH clients from the version exchange banner
/// (`SSH-2.0-OpenSSH_9.6p1 ...`).
pub struct SshClientDetector;

impl ClientDetector for SshClientDetector {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn log_name(&self) -> &'static str {
        "SSH client"
    }

    fn precedence(&self) -> u32 {
        2
    }

    fn register_patterns(&self, matcher: &mut ClientPatternMatcher) {
        matcher.register(self.name(), b"SSH-", Some(0));
    }

    fn validate(&self, args: &mut DiscoveryArgs) -> DetectorVerdict {
        if args.direction != Direction::Initiator {
            return DetectorVerdict::InProcess;
        }
        if !args.data.starts_with(b"SSH-") {
            return DetectorVerdict::NoMatch;
        }
        let Some(line) = first_line(args.data) else {
            return DetectorVerdict::InProcess;
        };

        // SSH-<protoversion>-<software> [comments]
        let line = String::from_utf8_lossy(line);
        let mut parts = line.splitn(3, '-');
        let (Some(_), Some(_), Some(rest)) = (parts.next(), parts.next(), parts.next()) else {
            return DetectorVerdict::Error;
        };
        let software = rest.split_whitespace().next().unwrap_or(rest);

        let client_id = if software.starts_with("OpenSSH") {
            APP_ID_OPENSSH
        } else if software.contains("PuTTY") {
            APP_ID_PUTTY
        } else {
            APP_ID_SSH
        };
        let version = software.split_once('_').map(|(_, v)| v);

        args.session.set_client_appid_data(client_id, version, args.app_info, args.change_bits);
        if args.session.client_inferred_service_id == APP_ID_NONE {
            args.session.client_inferred_service_id = APP_ID_SSH;
        }
        DetectorVerdict::Success
    }
}

// ---------------------------------------------------------------------------
// SMTP
// ---------------------------------------------------------------------------

/// Identifies mail submission clients from the SMTP greeting.
pub struct SmtpClientDetector;

impl ClientDetector for SmtpClientDetector {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn log_name(&self) -> &'static str {
        "SMTP client"
    }

    fn precedence(&self) -> u32 {
        1
    }

    fn register_patterns(&self, matcher: &mut ClientPatternMatcher) {
        matcher.register(self.name(), b"HELO ", Some(0));
        matcher.register(self.name(), b"EHLO ", Some(0));
    }

    fn validate(&self, args: &mut DiscoveryArgs) -> DetectorVerdict {
        if args.direction != Direction::Initiator {
            return DetectorVerdict::InProcess;
        }
        if !(args.data.starts_with(b"HELO ") || args.data.starts_with(b"EHLO ")) {
            return DetectorVerdict::NoMatch;
        }
        if first_line(args.data).is_none() {
            return DetectorVerdict::InProcess;
        }

        args.session.set_client_appid_data(APP_ID_SMTP, None, args.app_info, args.change_bits);
        if args.session.client_inferred_service_id == APP_ID_NONE {
            args.session.client_inferred_service_id = APP_ID_SMTP;
        }
        DetectorVerdict::Success
    }
}

// ---------------------------------------------------------------------------
// IMAP
// ---------------------------------------------------------------------------

/// Identifies IMAP clients from tagged LOGIN commands, reporting the user.
pub struct ImapClientDetector;

impl ClientDetector for ImapClientDetector {
    fn name(&self) -> &'static str {
        "imap"
    }

    fn log_name(&self) -> &'static str {
        "IMAP client"
    }

    fn precedence(&self) -> u32 {
        1
    }

    fn register_patterns(&self, matcher: &mut ClientPatternMatcher) {
        matcher.register(self.name(), b" LOGIN ", None);
        matcher.register(self.name(), b" CAPABILITY", None);
    }

    fn validate(&self, args: &mut DiscoveryArgs) -> DetectorVerdict {
        if args.direction != Direction::Initiator {
            return DetectorVerdict::InProcess;
        }
        let Some(line) = first_line(args.data) else {
            return DetectorVerdict::InProcess;
        };
        let line = String::from_utf8_lossy(line);

        if let Some(rest) = line.split_once(" LOGIN ").map(|(_, r)| r) {
            if let Some(user) = rest.split_whitespace().next() {
                let user = user.trim_matches('"');
                if !user.is_empty() {
                    args.session.set_client_user(user, true, args.change_bits);
                }
            }
            args.session.set_client_appid_data(
                APP_ID_IMAP,
                None,
                args.app_info,
                args.change_bits,
            );
            if args.session.client_inferred_service_id == APP_ID_NONE {
                args.session.client_inferred_service_id = APP_ID_IMAP;
            }
            return DetectorVerdict::Success;
        }

        if line.contains(" CAPABILITY") {
            return DetectorVerdict::InProcess;
        }
        DetectorVerdict::NoMatch
    }
}

// ---------------------------------------------------------------------------
// POP3
// ---------------------------------------------------------------------------

/// Identifies POP3 clients from the USER/PASS login sequence.
pub struct Pop3ClientDetector;

impl ClientDetector for Pop3ClientDetector {
    fn name(&self) -> &'static str {
        "pop3"
    }

    fn log_name(&self) -> &'static str {
        "POP3 client"
    }

    fn precedence(&self) -> u32 {
        1
    }

    fn register_patterns(&self, matcher: &mut ClientPatternMatcher) {
        matcher.register(self.name(), b"USER ", Some(0));
        matcher.register(self.name(), b"PASS ", Some(0));
    }

    fn validate(&self, args: &mut DiscoveryArgs) -> DetectorVerdict {
        if args.direction != Direction::Initiator {
            return DetectorVerdict::InProcess;
        }
        let Some(line) = first_line(args.data) else {
            return DetectorVerdict::InProcess;
        };
        let line = String::from_utf8_lossy(line);

        if let Some(user) = line.strip_prefix("USER ") {
            let user = user.trim();
            if !user.is_empty() {
                args.session.set_client_user(user, true, args.change_bits);
            }
            return DetectorVerdict::InProcess;
        }

        if line.starts_with("PASS ") {
            args.session.set_client_appid_data(
                APP_ID_POP3,
                None,
                args.app_info,
                args.change_bits,
            );
            if args.session.client_inferred_service_id == APP_ID_NONE {
                args.session.client_inferred_service_id = APP_ID_POP3;
            }
            return DetectorVerdict::Success;
        }

        DetectorVerdict::NoMatch
    }
}

// ---------------------------------------------------------------------------
// VNC
// ---------------------------------------------------------------------------

/// Identifies VNC clients from the RFB protocol version handshake.
pub struct VncClientDetector;

impl ClientDetector for VncClientDetector {
    fn name(&self) -> &'static str {
        "vnc"
    }

    fn log_name(&self) -> &'static str {
        "VNC client"
    }

    fn precedence(&self) -> u32 {
        1
    }

    fn register_patterns(&self, matcher: &mut ClientPatternMatcher) {
        matcher.register(self.name(), b"RFB ", Some(0));
    }

    fn validate(&self, args: &mut DiscoveryArgs) -> DetectorVerdict {
        if args.direction != Direction::Initiator {
            return DetectorVerdict::InProcess;
        }
        if !args.data.starts_with(b"RFB ") {
            return DetectorVerdict::NoMatch;
        }
        let Some(line) = first_line(args.data) else {
            return DetectorVerdict::InProcess;
        };
        let version = String::from_utf8_lossy(&line[4..]);

        args.session.set_client_appid_data(
            APP_ID_VNC,
            Some(version.trim()),
            args.app_info,
            args.change_bits,
        );
        if args.session.client_inferred_service_id == APP_ID_NONE {
            args.session.client_inferred_service_id = APP_ID_VNC;
        }
        DetectorVerdict::Success
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_info::AppInfoTable;
    use crate::change_bits::ChangeBits;
    use crate::flow::IP_PROTO_TCP;
    use crate::session::AppIdSession;

    fn run(detector: &dyn ClientDetector, data: &[u8]) -> (AppIdSession, DetectorVerdict) {
        let mut asd = AppIdSession::new(
            IP_PROTO_TCP,
            0,
            "10.0.0.1".parse().unwrap(),
            49152,
            "10.0.0.2".parse().unwrap(),
            22,
            1000,
            None,
        );
        let app_info = AppInfoTable::new();
        let mut bits = ChangeBits::new();
        let verdict = detector.validate(&mut DiscoveryArgs {
            data,
            direction: Direction::Initiator,
            session: &mut asd,
            app_info: &app_info,
            change_bits: &mut bits,
            packet_time: 1000,
        });
        (asd, verdict)
    }

    #[test]
    fn test_ssh_openssh_banner() {
        let (asd, verdict) = run(&SshClientDetector, b"SSH-2.0-OpenSSH_9.6p1 Ubuntu-3\r\n");
        assert_eq!(verdict, DetectorVerdict::Success);
        assert_eq!(asd.client.get_id(), APP_ID_OPENSSH);
        assert_eq!(asd.client.version(), Some("9.6p1"));
        assert_eq!(asd.client_inferred_service_id, APP_ID_SSH);
    }

    #[test]
    fn test_ssh_partial_banner_in_process() {
        let (_, verdict) = run(&SshClientDetector, b"SSH-2.0-Open");
        assert_eq!(verdict, DetectorVerdict::InProcess);
    }

    #[test]
    fn test_ssh_non_banner_no_match() {
        let (_, verdict) = run(&SshClientDetector, b"GET / HTTP/1.1\r\n");
        assert_eq!(verdict, DetectorVerdict::NoMatch);
    }

    #[test]
    fn test_smtp_ehlo() {
        let (asd, verdict) = run(&SmtpClientDetector, b"EHLO client.example.org\r\n");
        assert_eq!(verdict, DetectorVerdict::Success);
        assert_eq!(asd.client.get_id(), APP_ID_SMTP);
        assert_eq!(asd.client_inferred_service_id, APP_ID_SMTP);
    }

    #[test]
    fn test_imap_login_reports_user() {
        let (asd, verdict) = run(&ImapClientDetector, b"a001 LOGIN \"alice\" \"secret\"\r\n");
        assert_eq!(verdict, DetectorVerdict::Success);
        assert_eq!(asd.client.get_id(), APP_ID_IMAP);
        assert_eq!(asd.client_username, Some(("alice".to_string(), true)));
    }

    #[test]
    fn test_pop3_user_then_pass() {
        let (asd, verdict) = run(&Pop3ClientDetector, b"USER bob\r\n");
        assert_eq!(verdict, DetectorVerdict::InProcess);
        assert_eq!(asd.client_username, Some(("bob".to_string(), true)));

        let (asd, verdict) = run(&Pop3ClientDetector, b"PASS hunter2\r\n");
        assert_eq!(verdict, DetectorVerdict::Success);
        assert_eq!(asd.client.get_id(), APP_ID_POP3);
    }

    #[test]
    fn test_vnc_handshake() {
        let (asd, verdict) = run(&VncClientDetector, b"RFB 003.008\n");
        assert_eq!(verdict, DetectorVerdict::Success);
        assert_eq!(asd.client.get_id(), APP_ID_VNC);
        assert_eq!(asd.client.version(), Some("003.008"));
    }
}
