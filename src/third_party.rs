//! # Third-Party Classifier Integration
//!
//! Adapter around an opaque out-of-band application classifier. The
//! classifier is hot-reloadable: each reload produces a context with a new
//! version, and every session caches the version it was created under. A
//! session whose cached version no longer matches the thread's current
//! context must tear its third-party state down instead of reusing it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::app_info::{AppId, APP_ID_NONE};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A loaded third-party classifier context.
///
/// The engine holds at most one; reloading swaps it for one with a higher
/// version.
#[derive(Debug)]
pub struct ThirdPartyContext {
    version: AtomicU32,
}

impl ThirdPartyContext {
    pub fn new(version: u32) -> Arc<Self> {
        Arc::new(Self { version: AtomicU32::new(version) })
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Bump the context version, as a classifier reload does.
    pub fn reload(&self) -> u32 {
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(version = v, "third-party classifier reloaded");
        v
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Processing state of the third-party classifier for one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpState {
    Init,
    Monitoring,
    Classified,
    Terminated,
    /// Restored from a high-availability peer; treated as final.
    Ha,
}

/// Per-flow third-party classifier session.
#[derive(Debug)]
pub struct ThirdPartySession {
    state: TpState,
    ctxt_version: u32,
    /// Attribute bits the classifier asked the engine to honor.
    attrs: u32,
}

/// Attribute: keep feeding packets to the classifier after classification.
pub const TP_ATTR_CONTINUE_MONITORING: u32 = 1 << 0;

impl ThirdPartySession {
    pub fn new(ctxt_version: u32) -> Self {
        Self { state: TpState::Init, ctxt_version, attrs: 0 }
    }

    pub fn state(&self) -> TpState {
        self.state
    }

    pub fn set_state(&mut self, state: TpState) {
        self.state = state;
    }

    pub fn ctxt_version(&self) -> u32 {
        self.ctxt_version
    }

    pub fn set_attr(&mut self, attr: u32) {
        self.attrs |= attr;
    }

    pub fn clear_attr(&mut self, attr: u32) {
        self.attrs &= !attr;
    }

    pub fn has_attr(&self, attr: u32) -> bool {
        self.attrs & attr != 0
    }

    /// Put the session back to its initial state for in-place reuse after
    /// a detection restart. Only valid when the context version still
    /// matches; the caller checks.
    pub fn reset(&mut self) {
        self.state = TpState::Init;
        self.attrs = 0;
    }
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// One classification verdict delivered by the third-party classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TpVerdict {
    pub app_id: AppId,
    pub payload_app_id: AppId,
    /// The classifier considers its work on this flow finished.
    pub classified: bool,
}

impl TpVerdict {
    pub fn positive(&self) -> bool {
        self.app_id > APP_ID_NONE
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
