//! # Session Tracking
//!
//! Every pipeline captures the session (chain, signer, contract) it started under and
//! re-validates it at each suspension point. The tracker owns the live session; callers
//! only ever compare against it.

use parking_lot::RwLock;

use crate::types::{Address, ChainId};

/// Identity of the environment a pipeline runs in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub chain_id: Option<ChainId>,
    pub signer_address: Option<Address>,
    pub contract_address: Option<Address>,
}

/// Holds the live session and answers "is this captured session still current?"
#[derive(Debug, Default)]
pub struct SessionTracker {
    live: RwLock<SessionContext>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the live session
    pub fn current(&self) -> SessionContext {
        *self.live.read()
    }

    /// Whether `captured` still describes the live session
    pub fn matches(&self, captured: &SessionContext) -> bool {
        *self.live.read() == *captured
    }

    pub fn is_stale(&self, captured: &SessionContext) -> bool {
        !self.matches(captured)
    }

    pub fn set_chain(&self, chain_id: Option<ChainId>) {
        self.live.write().chain_id = chain_id;
    }

    pub fn set_signer(&self, signer_address: Option<Address>) {
        self.live.write().signer_address = signer_address;
    }

    pub fn set_contract(&self, contract_address: Option<Address>) {
        self.live.write().contract_address = contract_address;
    }

    /// Apply several changes as one update
    pub fn update(&self, f: impl FnOnce(&mut SessionContext)) {
        f(&mut self.live.write());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_until_any_component_changes() {
        let tracker = SessionTracker::new();
        tracker.update(|s| {
            s.chain_id = Some(31337);
            s.signer_address = Some(Address([1; 20]));
            s.contract_address = Some(Address([2; 20]));
        });
        let captured = tracker.current();
        assert_eq!(captured.chain_id, Some(31337));
        assert!(tracker.matches(&captured));

        tracker.set_signer(Some(Address([3; 20])));
        assert!(tracker.is_stale(&captured));

        tracker.set_signer(Some(Address([1; 20])));
        assert!(tracker.matches(&captured));

        tracker.set_chain(Some(11155111));
        assert!(tracker.is_stale(&captured));
    }

    #[test]
    fn test_contract_change_is_stale() {
        let tracker = SessionTracker::new();
        tracker.set_contract(Some(Address([2; 20])));
        let captured = tracker.current();
        tracker.set_contract(None);
        assert!(!tracker.matches(&captured));
    }
}
