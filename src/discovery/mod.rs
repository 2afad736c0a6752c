//! # Client Discovery
//!
//! State machine that selects and runs candidate client detectors against
//! the flow's initiator-direction data.
//!
//! On the first data packet from the initiator the machine decides a mode:
//! a midstream flow finishes immediately; a positive third-party verdict
//! either installs the app's dedicated detector (direct mode) or finishes;
//! an HTTP session finishes (HTTP identifies its own clients); everything
//! else goes stateful. In stateful mode, every initiator packet is run
//! through the multi-pattern matcher, matches are ranked into a bounded
//! candidate set, and each candidate's `validate` is called until one
//! succeeds or all drop out.

pub mod detectors;

use std::collections::HashMap;

use crate::app_info::{AppInfoTable, APP_ID_NONE};
use crate::app_info::{APPINFO_FLAG_CLIENT_ADDITIONAL, APPINFO_FLAG_CLIENT_USER};
use crate::change_bits::ChangeBits;
use crate::flow::IP_PROTO_TCP;
use crate::matcher::{ClientPatternMatcher, MatcherError};
use crate::protocols::Direction;
use crate::session::{AppIdSession, DiscoveryState};
use crate::session::{
    APPID_SESSION_CLIENT_GETS_SERVER_PACKETS, APPID_SESSION_DISCOVER_USER, APPID_SESSION_NO_TPI,
};

/// Upper bound on simultaneously tracked client candidates.
pub const MAX_CANDIDATE_CLIENTS: usize = 10;

// ---------------------------------------------------------------------------
// Detector verdicts
// ---------------------------------------------------------------------------

/// Result of one detector validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorVerdict {
    /// The detector identified its client; lock it in.
    Success,
    /// Not enough data yet; keep the detector as a candidate.
    InProcess,
    /// The payload is not this detector's protocol.
    NoMatch,
    /// The payload matched but was malformed beyond use.
    Error,
}

impl DetectorVerdict {
    pub fn code_string(&self) -> &'static str {
        match self {
            DetectorVerdict::Success => "success",
            DetectorVerdict::InProcess => "in-process",
            DetectorVerdict::NoMatch => "no-match",
            DetectorVerdict::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Detector trait
// ---------------------------------------------------------------------------

/// Arguments handed to a detector's validate pass.
pub struct DiscoveryArgs<'a> {
    pub data: &'a [u8],
    pub direction: Direction,
    pub session: &'a mut AppIdSession,
    pub app_info: &'a AppInfoTable,
    pub change_bits: &'a mut ChangeBits,
    pub packet_time: u32,
}

/// A client detector: a named validator with pattern registrations and a
/// selection precedence.
pub trait ClientDetector: Send + Sync {
    /// Registry key; also the name referenced by app-info entries.
    fn name(&self) -> &'static str;

    /// Human-readable name used in log lines.
    fn log_name(&self) -> &'static str {
        self.name()
    }

    /// Tiebreaker among candidates with equal match counts.
    fn precedence(&self) -> u32 {
        0
    }

    /// Matches required before the detector becomes a candidate.
    fn minimum_matches(&self) -> u32 {
        1
    }

    /// Contribute payload patterns to the matcher.
    fn register_patterns(&self, matcher: &mut ClientPatternMatcher);

    /// Inspect a payload and deliver a verdict.
    fn validate(&self, args: &mut DiscoveryArgs) -> DetectorVerdict;
}

// ---------------------------------------------------------------------------
// Registry and state machine
// ---------------------------------------------------------------------------

/// Registry of client detectors plus the compiled pattern matchers.
pub struct ClientDiscovery {
    tcp_detectors: HashMap<&'static str, Box<dyn ClientDetector>>,
    udp_detectors: HashMap<&'static str, Box<dyn ClientDetector>>,
    tcp_patterns: ClientPatternMatcher,
    udp_patterns: ClientPatternMatcher,
}

impl ClientDiscovery {
    /// Build the registry with the built-in detector set and compile the
    /// pattern matchers.
    pub fn new() -> Result<Self, MatcherError> {
        let mut disco = Self {
            tcp_detectors: HashMap::new(),
            udp_detectors: HashMap::new(),
            tcp_patterns: ClientPatternMatcher::new(),
            udp_patterns: ClientPatternMatcher::new(),
        };

        disco.register_tcp(Box::new(detectors::SshClientDetector));
        disco.register_tcp(Box::new(detectors::SmtpClientDetector));
        disco.register_tcp(Box::new(detectors::ImapClientDetector));
        disco.register_tcp(Box::new(detectors::Pop3ClientDetector));
        disco.register_tcp(Box::new(detectors::VncClientDetector));

        disco.finalize_patterns()?;
        Ok(disco)
    }

    fn register_tcp(&mut self, detector: Box<dyn ClientDetector>) {
        detector.register_patterns(&mut self.tcp_patterns);
        self.tcp_detectors.insert(detector.name(), detector);
    }

    #[allow(dead_code)]
    fn register_udp(&mut self, detector: Box<dyn ClientDetector>) {
        detector.register_patterns(&mut self.udp_patterns);
        self.udp_detectors.insert(detector.name(), detector);
    }

    fn finalize_patterns(&mut self) -> Result<(), MatcherError> {
        self.tcp_patterns.prep()?;
        self.udp_patterns.prep()
    }

    fn detector(&self, proto: u8, name: &str) -> Option<&dyn ClientDetector> {
        let table =
            if proto == IP_PROTO_TCP { &self.tcp_detectors } else { &self.udp_detectors };
        table.get(name).map(|d| d.as_ref())
    }

    // -----------------------------------------------------------------------
    // Candidate selection
    // -----------------------------------------------------------------------

    /// Run the multi-pattern matcher over a payload.
    fn find_detector_candidates(&self, data: &[u8], proto: u8) -> HashMap<String, u32> {
        let patterns =
            if proto == IP_PROTO_TCP { &self.tcp_patterns } else { &self.udp_patterns };
        patterns.find_all(data)
    }

    /// Pop the best-ranked eligible detector from the match list.
    ///
    /// Highest count wins; ties break on higher precedence, then on name
    /// so selection stays deterministic. A detector is eligible only once
    /// its count reaches its configured minimum.
    fn next_detector(&self, matches: &mut HashMap<String, u32>, proto: u8) -> Option<String> {
        let mut best: Option<(&str, u32, u32)> = None;

        for (name, &count) in matches.iter() {
            let Some(detector) = self.detector(proto, name) else {
                continue;
            };
            if count < detector.minimum_matches() {
                continue;
            }
            let precedence = detector.precedence();
            let better = match best {
                None => true,
                Some((bname, bcount, bprec)) => {
                    count > bcount
                        || (count == bcount && precedence > bprec)
                        || (count == bcount && precedence == bprec && name.as_str() < bname)
                }
            };
            if better {
                best = Some((name.as_str(), count, precedence));
            }
        }

        let name = best.map(|(n, _, _)| n.to_string())?;
        matches.remove(&name);
        Some(name)
    }

    /// Draw up to [`MAX_CANDIDATE_CLIENTS`] candidates from the payload's
    /// pattern matches.
    fn create_detector_candidates_list(&self, asd: &mut AppIdSession, data: &[u8]) {
        if data.is_empty() || asd.client_detector.is_some() || !asd.client_candidates.is_empty() {
            return;
        }

        let mut matches = self.find_detector_candidates(data, asd.protocol);
        while asd.client_candidates.len() < MAX_CANDIDATE_CLIENTS {
            let Some(name) = self.next_detector(&mut matches, asd.protocol) else {
                break;
            };
            if !asd.client_candidates.contains(&name) {
                asd.client_candidates.push(name);
            }
        }
    }

    fn get_detector_candidates_list(
        &self,
        asd: &mut AppIdSession,
        data: &[u8],
        direction: Direction,
    ) {
        if direction == Direction::Initiator {
            // skip if we have already tried to validate a client app
            if !asd.is_client_detected() {
                self.create_detector_candidates_list(asd, data);
            }
        } else if asd.service_disco_state != DiscoveryState::Stateful
            && asd.any_session_flags(APPID_SESSION_CLIENT_GETS_SERVER_PACKETS)
        {
            self.create_detector_candidates_list(asd, data);
        }
    }

    // -----------------------------------------------------------------------
    // Detector execution
    // -----------------------------------------------------------------------

    /// Run the locked-in detector, or every surviving candidate.
    ///
    /// Candidate verdicts: Success locks the detector in and clears the
    /// list; InProcess keeps the candidate; anything else drops it. An
    /// emptied list means client discovery is done. Discovery state moves
    /// to Finished on anything but InProcess.
    fn exec_client_detectors(
        &self,
        asd: &mut AppIdSession,
        data: &[u8],
        direction: Direction,
        app_info: &AppInfoTable,
        change_bits: &mut ChangeBits,
        packet_time: u32,
    ) {
        let mut ret = DetectorVerdict::InProcess;

        if let Some(name) = asd.client_detector.clone() {
            if let Some(detector) = self.detector(asd.protocol, &name) {
                let mut args = DiscoveryArgs {
                    data,
                    direction,
                    session: &mut *asd,
                    app_info,
                    change_bits: &mut *change_bits,
                    packet_time,
                };
                ret = detector.validate(&mut args);
                tracing::debug!(
                    detector = detector.log_name(),
                    verdict = ret.code_string(),
                    "client detector returned"
                );
            } else {
                ret = DetectorVerdict::Error;
            }
        } else {
            let candidates = std::mem::take(&mut asd.client_candidates);
            let mut surviving = Vec::new();
            let mut locked = None;

            for name in candidates {
                let Some(detector) = self.detector(asd.protocol, &name) else {
                    continue;
                };
                let mut args = DiscoveryArgs {
                    data,
                    direction,
                    session: &mut *asd,
                    app_info,
                    change_bits: &mut *change_bits,
                    packet_time,
                };
                let result = detector.validate(&mut args);
                tracing::debug!(
                    detector = detector.log_name(),
                    verdict = result.code_string(),
                    "client candidate returned"
                );

                match result {
                    DetectorVerdict::Success => {
                        locked = Some(name);
                        break;
                    }
                    DetectorVerdict::InProcess => surviving.push(name),
                    _ => {}
                }
            }

            if let Some(name) = locked {
                asd.client_detector = Some(name);
            } else {
                asd.client_candidates = surviving;
            }

            // Survivors returned InProcess; the rest were dropped. An
            // empty list means we are done.
            if asd.client_candidates.is_empty() {
                ret = DetectorVerdict::Success;
                asd.set_client_detected();
            }
        }

        if ret != DetectorVerdict::InProcess {
            asd.client_disco_state = DiscoveryState::Finished;
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Drive client discovery for one packet.
    ///
    /// Returns whether this packet was consumed by stateful inspection
    /// (the caller uses it to account third-party discovery work).
    #[allow(clippy::too_many_arguments)]
    pub fn do_client_discovery(
        &self,
        asd: &mut AppIdSession,
        data: &[u8],
        direction: Direction,
        midstream: bool,
        app_info: &AppInfoTable,
        change_bits: &mut ChangeBits,
        packet_time: u32,
    ) -> bool {
        let mut stateful_inspection = false;
        let prev_state = asd.client_disco_state;
        let was_service = asd.is_service_detected();
        let tp_app_id = asd.tp_app_id;

        if asd.client_disco_state == DiscoveryState::None
            && !data.is_empty()
            && direction == Direction::Initiator
        {
            if midstream {
                asd.client_disco_state = DiscoveryState::Finished;
            } else if tp_app_id > APP_ID_NONE && asd.is_tp_appid_available() {
                // The third party has positively identified the app; dig
                // deeper only if a dedicated detector can add client or
                // user details.
                let entry = app_info.get(tp_app_id);
                let direct_detector = entry.and_then(|e| {
                    (e.flags & (APPINFO_FLAG_CLIENT_ADDITIONAL | APPINFO_FLAG_CLIENT_USER) != 0
                        && asd.any_session_flags(APPID_SESSION_DISCOVER_USER))
                    .then(|| e.client_detector.clone())
                    .flatten()
                });
                if let Some(name) = direct_detector {
                    asd.client_detector = Some(name);
                    asd.client_disco_state = DiscoveryState::Direct;
                } else {
                    asd.set_client_detected();
                    asd.client_disco_state = DiscoveryState::Finished;
                }
            } else if asd.any_session_flags(crate::session::APPID_SESSION_HTTP_SESSION) {
                asd.client_disco_state = DiscoveryState::Finished;
            } else {
                asd.client_disco_state = DiscoveryState::Stateful;
            }
        }

        // Stop pattern inspection as soon as the third party classifies a
        // valid app that our detectors cannot improve on.
        if tp_app_id > APP_ID_NONE
            && matches!(
                asd.client_disco_state,
                DiscoveryState::Stateful | DiscoveryState::Direct
            )
            && asd.client_disco_state == prev_state
            && !asd.any_session_flags(APPID_SESSION_NO_TPI)
            && asd.is_tp_appid_available()
        {
            let entry = app_info.get(tp_app_id);
            let still_applicable = entry.is_some_and(|e| {
                e.client_detector.is_some()
                    && e.flags & (APPINFO_FLAG_CLIENT_ADDITIONAL | APPINFO_FLAG_CLIENT_USER) != 0
                    && (asd.client_detector.is_none()
                        || asd.client_detector == e.client_detector)
            });
            if !still_applicable {
                asd.client_disco_state = DiscoveryState::Finished;
                asd.set_client_detected();
            }
        }

        match asd.client_disco_state {
            DiscoveryState::Direct => {
                if direction == Direction::Initiator {
                    if !asd.is_client_detected() {
                        self.exec_client_detectors(
                            asd, data, direction, app_info, change_bits, packet_time,
                        );
                    }
                } else if asd.service_disco_state != DiscoveryState::Stateful
                    && asd.any_session_flags(APPID_SESSION_CLIENT_GETS_SERVER_PACKETS)
                {
                    self.exec_client_detectors(
                        asd, data, direction, app_info, change_bits, packet_time,
                    );
                }
            }
            DiscoveryState::Stateful => {
                self.get_detector_candidates_list(asd, data, direction);
                stateful_inspection = true;
                if !asd.client_candidates.is_empty() {
                    if direction == Direction::Initiator {
                        if !asd.is_client_detected() {
                            self.exec_client_detectors(
                                asd, data, direction, app_info, change_bits, packet_time,
                            );
                        }
                    } else if asd.service_disco_state != DiscoveryState::Stateful
                        && asd.any_session_flags(APPID_SESSION_CLIENT_GETS_SERVER_PACKETS)
                    {
                        self.exec_client_detectors(
                            asd, data, direction, app_info, change_bits, packet_time,
                        );
                    }
                } else {
                    asd.set_client_detected();
                    asd.client_disco_state = DiscoveryState::Finished;
                }
            }
            _ => {}
        }

        if !was_service && asd.is_service_detected() {
            asd.sync_with_stream_protocol_id(asd.service.get_id(), app_info, change_bits);
        }

        stateful_inspection
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
