//! # Picked-Id Resolution
//!
//! Computes the single externally visible service/client/payload/misc/
//! referred id from the session's evidence sources: the locally detected
//! identity, the third-party verdict, the client-inferred service, the
//! port-derived service, and the snapshot captured when encryption was
//! detected. Precedence is fixed and documented on each function.
//!
//! An HTTP/2 service short-circuits the per-flow sub-ids to NONE: HTTP/2
//! carries its own per-stream identities, published with a stream index.

use crate::app_info::{is_service_http_type, AppId, APP_ID_HTTP2, APP_ID_HTTP_TUNNEL};
use crate::app_info::{APP_ID_NONE, APP_ID_UNKNOWN};
use crate::session::{AppIdSession, ApplicationIds};

impl AppIdSession {
    /// Pick the service id.
    ///
    /// Order: locally detected service (unless deferred), third-party
    /// verdict, client-inferred service, port-derived service, encrypted
    /// snapshot. With no third-party context configured only the local
    /// evidence is consulted.
    pub fn pick_service_app_id(&self) -> AppId {
        let mut rval = APP_ID_NONE;

        if self.tp_ctxt_version.is_none() {
            if self.is_service_detected() {
                let id = self.service.get_id();
                if id > APP_ID_NONE {
                    return id;
                }
                rval = APP_ID_UNKNOWN;
            }
        } else if self.is_service_detected() {
            let deferred = self.service.deferred() || self.tp_app_id_deferred;

            if self.service.get_id() > APP_ID_NONE && !deferred {
                return self.service.get_id();
            }
            if self.is_tp_appid_available() {
                if self.tp_app_id > APP_ID_NONE {
                    return self.tp_app_id;
                } else if deferred {
                    return self.service.get_id();
                }
                rval = APP_ID_UNKNOWN;
            } else {
                rval = self.tp_app_id;
            }
        } else if self.tp_app_id > APP_ID_NONE {
            return self.tp_app_id;
        }

        if self.client_inferred_service_id > APP_ID_NONE {
            return self.client_inferred_service_id;
        }

        if self.service.port_service_id() > APP_ID_NONE {
            return self.service.port_service_id();
        }

        if rval == APP_ID_NONE || (rval == APP_ID_UNKNOWN && self.encrypted.service_id > APP_ID_NONE)
        {
            return self.encrypted.service_id;
        }

        rval
    }

    /// Pick the misc id: session misc, then the first HTTP session's misc,
    /// then the encrypted snapshot.
    pub fn pick_misc_app_id(&self) -> AppId {
        if self.service.get_id() == APP_ID_HTTP2 {
            return APP_ID_NONE;
        }

        if self.misc_app_id > APP_ID_NONE {
            return self.misc_app_id;
        }

        let tmp_id = self.hsessions.first().map_or(APP_ID_NONE, |h| h.misc_app_id);
        if tmp_id > APP_ID_NONE {
            return tmp_id;
        }

        self.encrypted.misc_id
    }

    /// Pick the client id: the first HTTP session's client, then the
    /// session client, then the encrypted snapshot.
    pub fn pick_client_app_id(&self) -> AppId {
        if self.service.get_id() == APP_ID_HTTP2 {
            return APP_ID_NONE;
        }

        let tmp_id = self.hsessions.first().map_or(APP_ID_NONE, |h| h.client_id);
        if tmp_id > APP_ID_NONE {
            return tmp_id;
        }

        if self.client.get_id() > APP_ID_NONE {
            return self.client.get_id();
        }

        self.encrypted.client_id
    }

    /// Pick the payload id for a given picked service.
    ///
    /// A deferred third-party payload wins outright. An HTTP-session
    /// payload of HTTP_TUNNEL yields to a positive third-party payload.
    /// UNKNOWN is a valid payload verdict only for HTTP-family services.
    pub fn pick_payload_app_id_for(&self, service_id: AppId) -> AppId {
        if service_id == APP_ID_HTTP2 {
            return APP_ID_NONE;
        }

        if self.tp_payload_app_id_deferred {
            return self.tp_payload_app_id;
        }

        let tmp_id = self.hsessions.first().map_or(APP_ID_NONE, |h| h.payload_id);
        if tmp_id > APP_ID_NONE {
            if tmp_id == APP_ID_HTTP_TUNNEL && self.tp_payload_app_id > APP_ID_NONE {
                return self.tp_payload_app_id;
            }
            return tmp_id;
        }

        if self.payload.get_id() > APP_ID_NONE {
            return self.payload.get_id();
        }

        if self.tp_payload_app_id > APP_ID_NONE {
            return self.tp_payload_app_id;
        }

        if self.encrypted.payload_id > APP_ID_NONE {
            return self.encrypted.payload_id;
        }

        if tmp_id == APP_ID_UNKNOWN {
            return APP_ID_UNKNOWN;
        }

        if self.payload.get_id() == APP_ID_UNKNOWN && is_service_http_type(service_id) {
            return APP_ID_UNKNOWN;
        }

        APP_ID_NONE
    }

    /// Pick the payload id against the currently picked service.
    pub fn pick_payload_app_id(&self) -> AppId {
        self.pick_payload_app_id_for(self.pick_service_app_id())
    }

    /// Pick the referred payload id: the first HTTP session's, then the
    /// encrypted snapshot.
    pub fn pick_referred_payload_app_id(&self) -> AppId {
        if self.service.get_id() == APP_ID_HTTP2 {
            return APP_ID_NONE;
        }

        let tmp_id =
            self.hsessions.first().map_or(APP_ID_NONE, |h| h.referred_payload_app_id);
        if tmp_id > APP_ID_NONE {
            return tmp_id;
        }

        self.encrypted.referred_id
    }

    /// Compute all five picked ids coherently (the payload pick sees the
    /// same service pick the caller publishes).
    pub fn picked_ids(&self) -> ApplicationIds {
        let service = self.pick_service_app_id();
        ApplicationIds {
            service,
            client: self.pick_client_app_id(),
            payload: self.pick_payload_app_id_for(service),
            misc: self.pick_misc_app_id(),
            referred: self.pick_referred_payload_app_id(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
