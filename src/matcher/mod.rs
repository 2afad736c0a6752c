//! # Pattern Matchers
//!
//! Multi-pattern string search engines built on Aho-Corasick automatons.
//! Two are used by discovery:
//!
//! - [`ClientPatternMatcher`]: maps payload patterns registered by client
//!   detectors to match counts per detector. Candidate selection draws
//!   from these counts.
//! - [`SslPatternMatchers`]: maps TLS host / certificate common-name
//!   patterns to (client id, payload id) pairs, used when examining SSL
//!   metadata.
//!
//! Registration happens while detectors initialize; `prep()` compiles the
//! automaton once before traffic flows, mirroring the load-then-match
//! lifecycle of the signature engine.

use std::collections::HashMap;

use aho_corasick::AhoCorasick;

use crate::app_info::AppId;

/// Errors raised while compiling a pattern set.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("automaton build error: {0}")]
    Build(String),
}

// ---------------------------------------------------------------------------
// Client pattern matcher
// ---------------------------------------------------------------------------

/// One payload pattern owned by a client detector.
#[derive(Debug, Clone)]
struct ClientPattern {
    detector: String,
    pattern: Vec<u8>,
    /// Required start offset of the match, or `None` for anywhere.
    position: Option<usize>,
}

/// Multi-pattern search over client-detector payload patterns.
#[derive(Debug, Default)]
pub struct ClientPatternMatcher {
    patterns: Vec<ClientPattern>,
    automaton: Option<AhoCorasick>,
}

impl ClientPatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern for a detector. Call `prep()` after the last
    /// registration.
    pub fn register(&mut self, detector: &str, pattern: &[u8], position: Option<usize>) {
        self.patterns.push(ClientPattern {
            detector: detector.to_string(),
            pattern: pattern.to_vec(),
            position,
        });
    }

    /// Compile the automaton over all registered patterns.
    pub fn prep(&mut self) -> Result<(), MatcherError> {
        if self.patterns.is_empty() {
            self.automaton = None;
            return Ok(());
        }
        let automaton = AhoCorasick::builder()
            .build(self.patterns.iter().map(|p| p.pattern.as_slice()))
            .map_err(|e| MatcherError::Build(e.to_string()))?;
        self.automaton = Some(automaton);
        Ok(())
    }

    /// Scan a payload, returning the number of valid pattern matches per
    /// detector. Position-constrained patterns count only when they match
    /// at their required offset.
    pub fn find_all(&self, data: &[u8]) -> HashMap<String, u32> {
        let mut matches: HashMap<String, u32> = HashMap::new();
        let Some(automaton) = &self.automaton else {
            return matches;
        };

        for mat in automaton.find_overlapping_iter(data) {
            let pattern = &self.patterns[mat.pattern().as_usize()];
            if pattern.position.is_some_and(|pos| mat.start() != pos) {
                continue;
            }
            *matches.entry(pattern.detector.clone()).or_insert(0) += 1;
        }

        matches
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

// ---------------------------------------------------------------------------
// SSL metadata matchers
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SslPatternTable {
    patterns: Vec<(Vec<u8>, AppId, AppId)>,
    automaton: Option<AhoCorasick>,
}

impl SslPatternTable {
    fn register(&mut self, pattern: &[u8], client_id: AppId, payload_id: AppId) {
        self.patterns.push((pattern.to_vec(), client_id, payload_id));
    }

    fn prep(&mut self) -> Result<(), MatcherError> {
        if self.patterns.is_empty() {
            self.automaton = None;
            return Ok(());
        }
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(self.patterns.iter().map(|p| p.0.as_slice()))
            .map_err(|e| MatcherError::Build(e.to_string()))?;
        self.automaton = Some(automaton);
        Ok(())
    }

    /// The longest matching pattern decides the ids.
    fn scan(&self, data: &[u8]) -> Option<(AppId, AppId)> {
        let automaton = self.automaton.as_ref()?;
        let mut best: Option<usize> = None;

        for mat in automaton.find_overlapping_iter(data) {
            let idx = mat.pattern().as_usize();
            if best.map_or(true, |b| self.patterns[idx].0.len() > self.patterns[b].0.len()) {
                best = Some(idx);
            }
        }

        best.map(|i| (self.patterns[i].1, self.patterns[i].2))
    }
}

/// Host and common-name pattern tables for SSL metadata examination.
#[derive(Debug, Default)]
pub struct SslPatternMatchers {
    host: SslPatternTable,
    cname: SslPatternTable,
}

impl SslPatternMatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_host_pattern(&mut self, pattern: &[u8], client_id: AppId, payload_id: AppId) {
        self.host.register(pattern, client_id, payload_id);
    }

    pub fn register_cname_pattern(&mut self, pattern: &[u8], client_id: AppId, payload_id: AppId) {
        self.cname.register(pattern, client_id, payload_id);
    }

    pub fn prep(&mut self) -> Result<(), MatcherError> {
        self.host.prep()?;
        self.cname.prep()
    }

    /// Scan a TLS server name; returns (client id, payload id) on a match.
    pub fn scan_hostname(&self, host: &[u8]) -> Option<(AppId, AppId)> {
        self.host.scan(host)
    }

    /// Scan a certificate common name or organizational unit.
    pub fn scan_cname(&self, cname: &[u8]) -> Option<(AppId, AppId)> {
        self.cname.scan(cname).or_else(|| self.host.scan(cname))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_matcher_counts_per_detector() {
        let mut matcher = ClientPatternMatcher::new();
        matcher.register("smtp", b"HELO ", None);
        matcher.register("smtp", b"EHLO ", None);
        matcher.register("ssh", b"SSH-", Some(0));
        matcher.prep().unwrap();

        let matches = matcher.find_all(b"EHLO mail.example.com\r\nHELO x\r\n");
        assert_eq!(matches.get("smtp"), Some(&2));
        assert_eq!(matches.get("ssh"), None);
    }

    #[test]
    fn test_position_constraint() {
        let mut matcher = ClientPatternMatcher::new();
        matcher.register("ssh", b"SSH-", Some(0));
        matcher.prep().unwrap();

        assert_eq!(matcher.find_all(b"SSH-2.0-OpenSSH_9.0").get("ssh"), Some(&1));
        // not at the required offset
        assert!(matcher.find_all(b"xxSSH-2.0").is_empty());
    }

    #[test]
    fn test_empty_matcher() {
        let mut matcher = ClientPatternMatcher::new();
        matcher.prep().unwrap();
        assert!(matcher.find_all(b"anything").is_empty());
    }

    #[test]
    fn test_ssl_longest_match_wins() {
        let mut matchers = SslPatternMatchers::new();
        matchers.register_host_pattern(b"example.com", 10, 20);
        matchers.register_host_pattern(b"ftp.example.com", 11, 21);
        matchers.prep().unwrap();

        assert_eq!(matchers.scan_hostname(b"ftp.example.com"), Some((11, 21)));
        assert_eq!(matchers.scan_hostname(b"www.example.com"), Some((10, 20)));
        assert_eq!(matchers.scan_hostname(b"other.org"), None);
    }

    #[test]
    fn test_ssl_cname_falls_back_to_host_table() {
        let mut matchers = SslPatternMatchers::new();
        matchers.register_host_pattern(b"example.com", 10, 20);
        matchers.prep().unwrap();
        assert_eq!(matchers.scan_cname(b"example.com"), Some((10, 20)));
    }
}
