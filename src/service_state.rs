//! # Per-Destination Service Discovery State
//!
//! Shared store of service-discovery outcomes keyed by the service side of
//! flows: (IP, protocol, port, address-space-id, decrypted). A session
//! that is destroyed without concluding service discovery reports a
//! failure here; repeated failures from distinct clients eventually mark
//! the destination's service id as failed so later flows stop burning
//! detector budget on it.

use std::net::IpAddr;

use dashmap::DashMap;

/// Weight added per inconclusive session teardown.
pub const INCONCLUSIVE_SERVICE_WEIGHT: u32 = 3;

/// Failures accumulate until this threshold flips the destination to
/// failed.
const SERVICE_FAIL_THRESHOLD: u32 = 9;

/// Key identifying one service destination.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ServiceKey {
    pub ip: IpAddr,
    pub proto: u8,
    pub port: u16,
    pub asid: u16,
    pub decrypted: bool,
}

/// Discovery verdict recorded for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceIdState {
    #[default]
    New,
    Valid,
    Failed,
}

#[derive(Debug, Default)]
struct DiscoveryState {
    state: ServiceIdState,
    fail_weight: u32,
    last_client: Option<IpAddr>,
}

/// Process-wide per-destination discovery state.
#[derive(Debug, Default)]
pub struct ServiceStateStore {
    states: DashMap<ServiceKey, DiscoveryState>,
}

impl ServiceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful service identification for the destination.
    pub fn set_service_id_valid(&self, key: ServiceKey) {
        let mut entry = self.states.entry(key).or_default();
        entry.state = ServiceIdState::Valid;
        entry.fail_weight = 0;
    }

    /// Record an inconclusive teardown observed from `client`.
    ///
    /// Repeat failures from the same client carry no extra weight; enough
    /// weight from distinct clients marks the destination failed.
    pub fn set_service_id_failed(&self, key: ServiceKey, client: IpAddr, weight: u32) {
        let mut entry = self.states.entry(key).or_default();
        if entry.state == ServiceIdState::Valid {
            return;
        }
        if entry.last_client == Some(client) {
            return;
        }
        entry.last_client = Some(client);
        entry.fail_weight += weight;
        if entry.fail_weight >= SERVICE_FAIL_THRESHOLD {
            entry.state = ServiceIdState::Failed;
            tracing::debug!(ip = %key.ip, port = key.port, "service id failed");
        }
    }

    pub fn state(&self, key: &ServiceKey) -> ServiceIdState {
        self.states.get(key).map_or(ServiceIdState::New, |e| e.state)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey {
            ip: "10.0.0.2".parse().unwrap(),
            proto: crate::flow::IP_PROTO_TCP,
            port: 4444,
            asid: 0,
            decrypted: false,
        }
    }

    #[test]
    fn test_failure_accumulates_across_clients() {
        let store = ServiceStateStore::new();
        let c1: IpAddr = "10.0.0.10".parse().unwrap();
        let c2: IpAddr = "10.0.0.11".parse().unwrap();
        let c3: IpAddr = "10.0.0.12".parse().unwrap();

        store.set_service_id_failed(key(), c1, INCONCLUSIVE_SERVICE_WEIGHT);
        // same client again adds nothing
        store.set_service_id_failed(key(), c1, INCONCLUSIVE_SERVICE_WEIGHT);
        assert_eq!(store.state(&key()), ServiceIdState::New);

        store.set_service_id_failed(key(), c2, INCONCLUSIVE_SERVICE_WEIGHT);
        store.set_service_id_failed(key(), c3, INCONCLUSIVE_SERVICE_WEIGHT);
        assert_eq!(store.state(&key()), ServiceIdState::Failed);
    }

    #[test]
    fn test_valid_wins_over_failures() {
        let store = ServiceStateStore::new();
        store.set_service_id_valid(key());
        store.set_service_id_failed(key(), "10.0.0.10".parse().unwrap(), 100);
        assert_eq!(store.state(&key()), ServiceIdState::Valid);
    }
}
