//! # Application Registry
//!
//! Numeric application identifiers and the app-info table consulted by the
//! discovery engine. Each known application carries a priority, a flag set
//! governing third-party arbitration, and optionally the name of a client
//! detector that can extract additional client or user information once the
//! application has been identified.
//!
//! The table ships with built-in defaults and can be extended from a JSON
//! file:
//!
//! ```json
//! {
//!   "apps": [
//!     {
//!       "app_id": 707,
//!       "name": "SSH",
//!       "priority": 2,
//!       "flags": ["client-additional", "client-user"],
//!       "client_detector": "ssh"
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;

use serde::Deserialize;

/// Numeric identifier of a recognized application protocol or payload.
pub type AppId = i32;

// ---------------------------------------------------------------------------
// Well-known application ids
// ---------------------------------------------------------------------------

/// No identification was attempted or nothing is known yet.
pub const APP_ID_NONE: AppId = 0;
/// Inspection happened but the application could not be identified.
/// Deliberately below `APP_ID_NONE` so `id > APP_ID_NONE` means "positively
/// identified".
pub const APP_ID_UNKNOWN: AppId = -1;

pub const APP_ID_FTP: AppId = 78;
pub const APP_ID_FTP_DATA: AppId = 79;
pub const APP_ID_FTPS: AppId = 81;
pub const APP_ID_FTPSDATA: AppId = 82;

pub const APP_ID_DNS: AppId = 617;
pub const APP_ID_IMAP: AppId = 621;
pub const APP_ID_IMAPS: AppId = 622;
pub const APP_ID_IRC: AppId = 623;
pub const APP_ID_IRCS: AppId = 624;
pub const APP_ID_LDAP: AppId = 637;
pub const APP_ID_LDAPS: AppId = 638;
pub const APP_ID_NNTP: AppId = 663;
pub const APP_ID_NNTPS: AppId = 664;
pub const APP_ID_HTTP: AppId = 676;
pub const APP_ID_POP3: AppId = 681;
pub const APP_ID_POP3S: AppId = 682;
pub const APP_ID_SMB: AppId = 691;
pub const APP_ID_SMTP: AppId = 693;
pub const APP_ID_SMTPS: AppId = 694;
pub const APP_ID_SHELL: AppId = 704;
pub const APP_ID_SSHELL: AppId = 705;
pub const APP_ID_SSH: AppId = 707;
pub const APP_ID_TELNET: AppId = 715;
pub const APP_ID_TELNETS: AppId = 716;
pub const APP_ID_VNC: AppId = 723;

pub const APP_ID_OPENSSH: AppId = 729;
pub const APP_ID_PUTTY: AppId = 877;
pub const APP_ID_THUNDERBIRD: AppId = 710;

pub const APP_ID_HTTPS: AppId = 1122;
pub const APP_ID_SSL: AppId = 1123;
pub const APP_ID_SSL_CLIENT: AppId = 1124;
pub const APP_ID_HTTP_TUNNEL: AppId = 1695;
pub const APP_ID_FIREFOX: AppId = 1829;
pub const APP_ID_SAFARI: AppId = 2363;
pub const APP_ID_CHROME: AppId = 2372;
pub const APP_ID_CURL: AppId = 2560;
pub const APP_ID_WGET: AppId = 2561;
pub const APP_ID_HTTP2: AppId = 2656;

/// Check whether a service id names an application that runs over SSL/TLS.
///
/// This is the closed set consulted by the SSL restart check: seeing one of
/// these as the picked service means the flow is encrypted even if no
/// explicit encryption upgrade was observed.
pub fn is_service_over_ssl(app_id: AppId) -> bool {
    matches!(
        app_id,
        APP_ID_FTPS
            | APP_ID_FTPSDATA
            | APP_ID_HTTPS
            | APP_ID_IMAPS
            | APP_ID_IRCS
            | APP_ID_LDAPS
            | APP_ID_NNTPS
            | APP_ID_POP3S
            | APP_ID_SMTPS
            | APP_ID_SSHELL
            | APP_ID_TELNETS
    )
}

/// Map a cleartext service to its over-SSL misc variant.
///
/// Used when an encryption upgrade is detected mid-flow: the service seen
/// before the upgrade determines the misc id of the encrypted continuation
/// (FTP becomes FTPS, SMTP becomes SMTPS, and so on). Returns `APP_ID_NONE`
/// for services with no secure variant.
pub fn encrypted_variant(service_id: AppId) -> AppId {
    match service_id {
        APP_ID_HTTP => APP_ID_HTTPS,
        APP_ID_SMTP => APP_ID_SMTPS,
        APP_ID_NNTP => APP_ID_NNTPS,
        APP_ID_IMAP => APP_ID_IMAPS,
        APP_ID_SHELL => APP_ID_SSHELL,
        APP_ID_LDAP => APP_ID_LDAPS,
        APP_ID_FTP_DATA => APP_ID_FTPSDATA,
        APP_ID_FTP => APP_ID_FTPS,
        APP_ID_TELNET => APP_ID_TELNETS,
        APP_ID_IRC => APP_ID_IRCS,
        APP_ID_POP3 => APP_ID_POP3S,
        _ => APP_ID_NONE,
    }
}

/// Check whether a service id names an HTTP-family service. An UNKNOWN
/// payload is a meaningful verdict only on these.
pub fn is_service_http_type(app_id: AppId) -> bool {
    matches!(app_id, APP_ID_HTTP | APP_ID_HTTPS | APP_ID_HTTP2)
}

/// Guess an application id from a well-known port number.
///
/// This is a heuristic used for the port-based service id; actual
/// identification is done by the protocol inspectors and detectors after
/// looking at payload.
pub fn port_app_id(port: u16, proto: u8) -> AppId {
    if proto == crate::flow::IP_PROTO_UDP {
        return match port {
            53 => APP_ID_DNS,
            _ => APP_ID_NONE,
        };
    }

    match port {
        21 | 20 => APP_ID_FTP,
        22 => APP_ID_SSH,
        23 => APP_ID_TELNET,
        25 | 587 => APP_ID_SMTP,
        53 => APP_ID_DNS,
        80 | 8080 | 8000 => APP_ID_HTTP,
        110 => APP_ID_POP3,
        119 => APP_ID_NNTP,
        143 => APP_ID_IMAP,
        389 => APP_ID_LDAP,
        443 | 8443 => APP_ID_HTTPS,
        445 => APP_ID_SMB,
        465 => APP_ID_SMTPS,
        563 => APP_ID_NNTPS,
        636 => APP_ID_LDAPS,
        990 => APP_ID_FTPS,
        993 => APP_ID_IMAPS,
        995 => APP_ID_POP3S,
        5900 => APP_ID_VNC,
        6667 => APP_ID_IRC,
        _ => APP_ID_NONE,
    }
}

// ---------------------------------------------------------------------------
// App-info flags
// ---------------------------------------------------------------------------

/// Defer to the locally detected service id even when third-party classified.
pub const APPINFO_FLAG_DEFER: u32 = 1 << 0;
/// Defer to the third-party payload id over locally detected payloads.
pub const APPINFO_FLAG_DEFER_PAYLOAD: u32 = 1 << 1;
/// A client detector can extract additional client details for this app.
pub const APPINFO_FLAG_CLIENT_ADDITIONAL: u32 = 1 << 2;
/// A client detector can extract user information for this app.
pub const APPINFO_FLAG_CLIENT_USER: u32 = 1 << 3;

// ---------------------------------------------------------------------------
// App-info table
// ---------------------------------------------------------------------------

/// Metadata for one known application.
#[derive(Debug, Clone)]
pub struct AppInfoEntry {
    pub app_id: AppId,
    pub name: String,
    /// Relative priority; a higher-priority app wins identity overwrites.
    pub priority: u32,
    /// APPINFO_FLAG_* bits.
    pub flags: u32,
    /// Name of the client detector to run in direct mode, if any.
    pub client_detector: Option<String>,
    /// Upstream protocol id to align the flow with when this app is picked.
    pub protocol_id: Option<u16>,
}

/// JSON file format for table extension.
#[derive(Debug, Deserialize)]
struct AppInfoFile {
    apps: Vec<AppInfoFileEntry>,
}

#[derive(Debug, Deserialize)]
struct AppInfoFileEntry {
    app_id: AppId,
    name: String,
    #[serde(default = "default_priority")]
    priority: u32,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    client_detector: Option<String>,
    #[serde(default)]
    protocol_id: Option<u16>,
}

fn default_priority() -> u32 {
    1
}

fn parse_flag(name: &str) -> Option<u32> {
    match name {
        "defer" => Some(APPINFO_FLAG_DEFER),
        "defer-payload" => Some(APPINFO_FLAG_DEFER_PAYLOAD),
        "client-additional" => Some(APPINFO_FLAG_CLIENT_ADDITIONAL),
        "client-user" => Some(APPINFO_FLAG_CLIENT_USER),
        _ => None,
    }
}

/// Errors that can occur while loading an app-info file.
#[derive(Debug, thiserror::Error)]
pub enum AppInfoError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),
}

/// Registry of known applications, keyed by app id.
#[derive(Debug, Default)]
pub struct AppInfoTable {
    entries: HashMap<AppId, AppInfoEntry>,
}

impl AppInfoTable {
    /// Create a table populated with the built-in application set.
    pub fn new() -> Self {
        let mut table = Self { entries: HashMap::new() };

        let builtin: &[(AppId, &str, u32, u32, Option<&str>, Option<u16>)] = &[
            (APP_ID_FTP, "FTP", 1, 0, None, Some(10)),
            (APP_ID_FTP_DATA, "FTP Data", 1, 0, None, None),
            (APP_ID_FTPS, "FTPS", 1, 0, None, None),
            (APP_ID_DNS, "DNS", 1, 0, None, Some(11)),
            (APP_ID_IMAP, "IMAP", 1, APPINFO_FLAG_CLIENT_USER, Some("imap"), Some(12)),
            (APP_ID_LDAP, "LDAP", 1, 0, None, None),
            (APP_ID_HTTP, "HTTP", 1, 0, None, Some(13)),
            (APP_ID_POP3, "POP3", 1, APPINFO_FLAG_CLIENT_USER, Some("pop3"), Some(14)),
            (APP_ID_SMB, "SMB", 1, 0, None, Some(15)),
            (APP_ID_SMTP, "SMTP", 1, APPINFO_FLAG_CLIENT_ADDITIONAL, Some("smtp"), Some(16)),
            (
                APP_ID_SSH,
                "SSH",
                2,
                APPINFO_FLAG_CLIENT_ADDITIONAL | APPINFO_FLAG_CLIENT_USER,
                Some("ssh"),
                Some(17),
            ),
            (APP_ID_TELNET, "Telnet", 1, 0, None, None),
            (APP_ID_VNC, "VNC", 1, APPINFO_FLAG_CLIENT_ADDITIONAL, Some("vnc"), None),
            (APP_ID_HTTPS, "HTTPS", 1, 0, None, Some(18)),
            (APP_ID_SSL, "SSL", 1, 0, None, Some(18)),
            (APP_ID_SSL_CLIENT, "SSL Client", 1, 0, None, None),
            (APP_ID_HTTP_TUNNEL, "HTTP Tunnel", 1, APPINFO_FLAG_DEFER_PAYLOAD, None, None),
            (APP_ID_HTTP2, "HTTP/2", 1, 0, None, Some(19)),
        ];

        for &(app_id, name, priority, flags, detector, protocol_id) in builtin {
            table.entries.insert(
                app_id,
                AppInfoEntry {
                    app_id,
                    name: name.to_string(),
                    priority,
                    flags,
                    client_detector: detector.map(str::to_string),
                    protocol_id,
                },
            );
        }

        table
    }

    /// Look up the entry for an app id.
    pub fn get(&self, app_id: AppId) -> Option<&AppInfoEntry> {
        self.entries.get(&app_id)
    }

    /// Return the priority of an app, defaulting to 0 for unknown ids.
    pub fn priority(&self, app_id: AppId) -> u32 {
        self.entries.get(&app_id).map_or(0, |e| e.priority)
    }

    /// Merge entries from a JSON file into the table.
    ///
    /// Existing entries with the same app id are replaced.
    ///
    /// # Returns
    /// The number of entries loaded.
    pub fn load(&mut self, path: &str) -> Result<usize, AppInfoError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppInfoError::Io(format!("{path}: {e}")))?;
        let file: AppInfoFile = serde_json::from_str(&content)
            .map_err(|e| AppInfoError::Parse(format!("{path}: {e}")))?;

        let count = file.apps.len();
        for app in file.apps {
            let mut flags = 0;
            for flag in &app.flags {
                flags |= parse_flag(flag).ok_or_else(|| AppInfoError::UnknownFlag(flag.clone()))?;
            }
            self.entries.insert(
                app.app_id,
                AppInfoEntry {
                    app_id: app.app_id,
                    name: app.name,
                    priority: app.priority,
                    flags,
                    client_detector: app.client_detector,
                    protocol_id: app.protocol_id,
                },
            );
        }

        tracing::debug!(count, "loaded app-info entries");
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_service_set() {
        assert!(is_service_over_ssl(APP_ID_FTPS));
        assert!(is_service_over_ssl(APP_ID_HTTPS));
        assert!(is_service_over_ssl(APP_ID_TELNETS));
        assert!(!is_service_over_ssl(APP_ID_FTP));
        assert!(!is_service_over_ssl(APP_ID_HTTP));
        assert!(!is_service_over_ssl(APP_ID_NONE));
    }

    #[test]
    fn test_encrypted_variant() {
        assert_eq!(encrypted_variant(APP_ID_FTP), APP_ID_FTPS);
        assert_eq!(encrypted_variant(APP_ID_HTTP), APP_ID_HTTPS);
        assert_eq!(encrypted_variant(APP_ID_POP3), APP_ID_POP3S);
        assert_eq!(encrypted_variant(APP_ID_SSH), APP_ID_NONE);
    }

    #[test]
    fn test_port_app_id() {
        assert_eq!(port_app_id(80, crate::flow::IP_PROTO_TCP), APP_ID_HTTP);
        assert_eq!(port_app_id(443, crate::flow::IP_PROTO_TCP), APP_ID_HTTPS);
        assert_eq!(port_app_id(22, crate::flow::IP_PROTO_TCP), APP_ID_SSH);
        assert_eq!(port_app_id(53, crate::flow::IP_PROTO_UDP), APP_ID_DNS);
        assert_eq!(port_app_id(9999, crate::flow::IP_PROTO_TCP), APP_ID_NONE);
    }

    #[test]
    fn test_table_builtin_lookup() {
        let table = AppInfoTable::new();
        let ssh = table.get(APP_ID_SSH).unwrap();
        assert_eq!(ssh.client_detector.as_deref(), Some("ssh"));
        assert!(ssh.flags & APPINFO_FLAG_CLIENT_USER != 0);
        assert_eq!(table.priority(APP_ID_SSH), 2);
        assert_eq!(table.priority(-5), 0);
    }

    #[test]
    fn test_load_missing_file() {
        let mut table = AppInfoTable::new();
        assert!(table.load("/nonexistent/apps.json").is_err());
    }
}
