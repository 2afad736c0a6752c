//! # Detection Restart Controller
//!
//! Mid-flow restarts of app detection. Two conditions trigger one:
//!
//! - **SSL restart** — the flow became (or always was) encrypted and a
//!   decrypting proxy can hand the engine cleartext. The picked ids are
//!   snapshotted into `encrypted.*`, derived state is reinitialized, and
//!   discovery runs again over the decrypted stream.
//! - **Tunnel restart** — the third-party classifier reports HTTP_TUNNEL
//!   as payload: everything identified so far described the tunnel, not
//!   the tunneled traffic, so service/client discovery starts over.
//!
//! When a restart brings a new identity, the prior id is tagged as
//! overwritten so statistics reflect the replacement.

use crate::app_info::{encrypted_variant, is_service_over_ssl, AppInfoTable};
use crate::app_info::{AppId, APP_ID_HTTP_TUNNEL, APP_ID_NONE, APP_ID_SSL_CLIENT, APP_ID_UNKNOWN};
use crate::change_bits::ChangeBits;
use crate::matcher::SslPatternMatchers;
use crate::session::{AppIdSession, DiscoveryState};
use crate::session::{
    APPID_SESSION_APP_REINSPECT, APPID_SESSION_APP_REINSPECT_SSL, APPID_SESSION_CLIENT_DETECTED,
    APPID_SESSION_DECRYPTED, APPID_SESSION_ENCRYPTED, APPID_SESSION_HTTP_SESSION,
    APPID_SESSION_HTTP_TUNNEL, APPID_SESSION_SERVICE_DETECTED, SCAN_CERTVIZ_ENABLED_FLAG,
    SCAN_HTTP_HOST_URL_FLAG, SCAN_SSL_CERTIFICATE_FLAG, SCAN_SSL_HOST_FLAG,
};

impl AppIdSession {
    /// Run both restart checks, in the order the conditions become
    /// observable.
    pub fn check_app_detection_restart(
        &mut self,
        change_bits: &mut ChangeBits,
        curr_tp_version: Option<u32>,
        proxied: bool,
    ) {
        self.check_ssl_detection_restart(change_bits, curr_tp_version, proxied);
        self.check_tunnel_detection_restart();
    }

    /// Restart detection when decrypted traffic is about to become
    /// visible.
    ///
    /// A session either starts as SSL (the picked service is in the
    /// over-SSL set) or upgrades mid-flow (the ENCRYPTED flag was set by a
    /// protocol state machine, e.g. FTP issuing AUTH TLS). Either way the
    /// current picks are snapshotted into `encrypted.*` before
    /// reinitialization. For a began-as-SSL flow the triggering packet is
    /// itself decrypted payload, so APP_REINSPECT_SSL is set to reinspect
    /// it.
    pub fn check_ssl_detection_restart(
        &mut self,
        change_bits: &mut ChangeBits,
        curr_tp_version: Option<u32>,
        proxied: bool,
    ) {
        if self.any_session_flags(APPID_SESSION_DECRYPTED) || !proxied {
            return;
        }

        let service_id = self.pick_service_app_id();
        let is_ssl = is_service_over_ssl(service_id);

        if self.any_session_flags(APPID_SESSION_ENCRYPTED) || is_ssl {
            self.set_session_flags(APPID_SESSION_DECRYPTED);
            self.encrypted.service_id = service_id;
            self.encrypted.payload_id = self.pick_payload_app_id_for(service_id);
            self.encrypted.client_id = self.pick_client_app_id();
            self.encrypted.misc_id = self.pick_misc_app_id();
            self.encrypted.referred_id = self.pick_referred_payload_app_id();

            // New ids detected after decryption override the ones from the
            // encrypted flow; tag the old ones as overwritten so statistics
            // count the replacement.
            if self.encrypted.service_id > APP_ID_NONE
                && self.client_inferred_service_id == APP_ID_NONE
            {
                self.service.set_overwritten_id(self.encrypted.service_id);
            }
            if self.encrypted.client_id > APP_ID_NONE {
                self.client.set_overwritten_id(self.encrypted.client_id);
            }
            if self.encrypted.payload_id > APP_ID_NONE {
                self.payload.set_overwritten_id(self.encrypted.payload_id);
            }

            self.reinit_session_data(change_bits, curr_tp_version);
            self.update_encrypted_app_id(self.encrypted.service_id);
            tracing::debug!("ssl decryption is available, restarting app detection");

            // ENCRYPTED is set by a command that upgrades the session; the
            // packet after the command is the first encrypted one. A
            // session that began as SSL is already looking at decrypted
            // payload, so this very packet must be reinspected.
            if is_ssl {
                self.set_session_flags(APPID_SESSION_APP_REINSPECT_SSL);
            }
        }
    }

    /// Restart detection when the third-party classifier reports that the
    /// flow is an HTTP tunnel.
    pub fn check_tunnel_detection_restart(&mut self) {
        if self.tp_payload_app_id != APP_ID_HTTP_TUNNEL
            || self.any_session_flags(APPID_SESSION_HTTP_TUNNEL)
        {
            return;
        }

        tracing::debug!("found http tunnel, restarting app detection");

        // service
        if self.service.get_id() == self.service.port_service_id() {
            self.service.set_id(APP_ID_NONE);
        }
        self.service.set_port_service_id(APP_ID_NONE);
        self.service.reset();
        self.service_disco_state = DiscoveryState::None;
        self.service_detector = None;
        self.service_candidates.clear();

        // client
        self.client.reset();
        self.client_inferred_service_id = APP_ID_NONE;
        self.client_disco_state = DiscoveryState::None;
        self.client_candidates.clear();

        // payload: what was identified so far described the tunnel itself
        self.payload.reset();

        self.scan_flags &= !SCAN_HTTP_HOST_URL_FLAG;
        self.clear_session_flags(
            APPID_SESSION_SERVICE_DETECTED
                | APPID_SESSION_CLIENT_DETECTED
                | APPID_SESSION_HTTP_SESSION
                | APPID_SESSION_APP_REINSPECT,
        );

        self.set_session_flags(APPID_SESSION_HTTP_TUNNEL);
    }

    /// Map the pre-encryption service onto the misc id of the encrypted
    /// continuation (FTP observed, now encrypted, means FTPS).
    pub fn update_encrypted_app_id(&mut self, service_id: AppId) {
        let variant = encrypted_variant(service_id);
        if variant != APP_ID_NONE {
            self.misc_app_id = variant;
        }
    }

    /// Scan accumulated TLS metadata against the SSL pattern tables.
    ///
    /// The server name and certificate common name may identify the client
    /// and payload even though the stream is opaque. Each scan flag is
    /// consumed once. A completed handshake with no payload identified
    /// settles on UNKNOWN.
    pub fn examine_ssl_metadata(
        &mut self,
        ssl_matchers: &SslPatternMatchers,
        app_info: &AppInfoTable,
        change_bits: &mut ChangeBits,
    ) {
        if self.scan_flags & SCAN_CERTVIZ_ENABLED_FLAG != 0 {
            return;
        }
        let Some(tsession) = self.tsession.as_ref() else {
            return;
        };

        let tls_host = tsession.tls_host.clone();
        let tls_cname = tsession.tls_cname.clone();
        let tls_org_unit = tsession.tls_org_unit.clone();
        let handshake_done = tsession.handshake_done;

        if self.scan_flags & SCAN_SSL_HOST_FLAG != 0 {
            if let Some(host) = &tls_host {
                if let Some((client_id, payload_id)) = ssl_matchers.scan_hostname(host.as_bytes())
                {
                    if self.client.get_id() == APP_ID_NONE
                        || self.client.get_id() == APP_ID_SSL_CLIENT
                    {
                        self.set_client_appid_data(client_id, None, app_info, change_bits);
                    }
                    self.set_payload_appid_data(payload_id, None, app_info);
                }
                self.scan_flags &= !SCAN_SSL_HOST_FLAG;
            }
        }

        if self.scan_flags & SCAN_SSL_CERTIFICATE_FLAG != 0 {
            if let Some(cname) = &tls_cname {
                if let Some((client_id, payload_id)) = ssl_matchers.scan_cname(cname.as_bytes()) {
                    if self.client.get_id() == APP_ID_NONE
                        || self.client.get_id() == APP_ID_SSL_CLIENT
                    {
                        self.set_client_appid_data(client_id, None, app_info, change_bits);
                    }
                    self.set_payload_appid_data(payload_id, None, app_info);
                }
                self.scan_flags &= !SCAN_SSL_CERTIFICATE_FLAG;
            }
        }

        if let Some(org_unit) = &tls_org_unit {
            if let Some((client_id, payload_id)) = ssl_matchers.scan_cname(org_unit.as_bytes()) {
                self.set_client_appid_data(client_id, None, app_info, change_bits);
                self.set_payload_appid_data(payload_id, None, app_info);
            }
            if let Some(tsession) = self.tsession.as_mut() {
                tsession.tls_org_unit = None;
            }
        }

        if handshake_done && self.payload.get_id() == APP_ID_NONE {
            tracing::debug!("tls handshake done with no payload id, settling on unknown");
            self.payload.set_id(APP_ID_UNKNOWN);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
