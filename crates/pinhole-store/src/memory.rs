//! In-process rule store
//!
//! Behaves like a kernel rule table as far as tickets and positions go, which
//! makes it the backing store for tests and for embedding without a firewall.

use crate::anchor::AnchorRules;
use crate::{
    AnchorHandle, ChangeTicket, CommitOutcome, Enumeration, RulePosition, RuleStore, StoreError,
};
use pinhole_proto::{RuleCounters, RuleSpec, RuleView};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Thread-safe in-memory rule store
pub struct MemoryRuleStore {
    anchors: Mutex<HashMap<String, AnchorRules>>,
    open: AtomicBool,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self {
            anchors: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        }
    }

    /// Make every call fail with [`StoreError::NotOpen`] until [`MemoryRuleStore::reopen`]
    pub fn close(&self) {
        debug!("Closing in-memory rule store");
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Copy of an anchor's current rule list
    pub fn rules(&self, anchor: &str) -> Vec<RuleView> {
        self.lock()
            .get(anchor)
            .map(|rules| rules.rules().to_vec())
            .unwrap_or_default()
    }

    /// Add traffic to the counters of the rules carrying `label`
    ///
    /// Returns how many rules were updated.
    pub fn record_traffic(&self, anchor: &str, label: &str, counters: RuleCounters) -> usize {
        self.lock()
            .get_mut(anchor)
            .map(|rules| rules.record_traffic(label, counters))
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AnchorRules>> {
        self.anchors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self, anchor: &str) -> Result<(), StoreError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotOpen(anchor.to_string()))
        }
    }

    fn with_anchor<T>(
        &self,
        anchor: &str,
        f: impl FnOnce(&mut AnchorRules) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_open(anchor)?;
        let mut anchors = self.lock();
        let rules = anchors
            .get_mut(anchor)
            .ok_or_else(|| StoreError::UnknownAnchor(anchor.to_string()))?;
        f(rules)
    }
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore for MemoryRuleStore {
    fn open(&self, anchor: &str) -> Result<AnchorHandle, StoreError> {
        self.ensure_open(anchor)?;
        self.lock().entry(anchor.to_string()).or_default();
        Ok(AnchorHandle::new(anchor))
    }

    fn begin_enumeration(&self, anchor: &AnchorHandle) -> Result<Enumeration, StoreError> {
        self.with_anchor(anchor.name(), |rules| Ok(rules.enumerate(anchor.name())))
    }

    fn get_rule(&self, position: &RulePosition) -> Result<RuleView, StoreError> {
        self.with_anchor(position.anchor(), |rules| rules.get(position))
    }

    fn request_change_ticket(&self, anchor: &AnchorHandle) -> Result<ChangeTicket, StoreError> {
        self.with_anchor(anchor.name(), |rules| Ok(rules.change_ticket(anchor.name())))
    }

    fn commit_add(
        &self,
        ticket: &ChangeTicket,
        rule: RuleSpec,
    ) -> Result<CommitOutcome, StoreError> {
        self.with_anchor(ticket.anchor(), |rules| Ok(rules.append(ticket, rule)))
    }

    fn commit_remove(
        &self,
        ticket: &ChangeTicket,
        position: &RulePosition,
    ) -> Result<CommitOutcome, StoreError> {
        self.with_anchor(ticket.anchor(), |rules| rules.remove(ticket, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled(label: &str) -> RuleSpec {
        let mut rule = RuleSpec::pass_in();
        rule.label = label.to_string();
        rule
    }

    #[test]
    fn test_open_creates_anchor() {
        let store = MemoryRuleStore::new();
        let handle = store.open("miniupnpd").unwrap();

        let enumeration = store.begin_enumeration(&handle).unwrap();
        assert_eq!(enumeration.count(), 0);
        assert_eq!(enumeration.anchor(), "miniupnpd");
    }

    #[test]
    fn test_closed_store_refuses_everything() {
        let store = MemoryRuleStore::new();
        let handle = store.open("miniupnpd").unwrap();
        store.close();

        assert!(matches!(store.open("miniupnpd"), Err(StoreError::NotOpen(_))));
        assert!(matches!(
            store.begin_enumeration(&handle),
            Err(StoreError::NotOpen(_))
        ));
        assert!(matches!(
            store.request_change_ticket(&handle),
            Err(StoreError::NotOpen(_))
        ));

        store.reopen();
        assert!(store.begin_enumeration(&handle).is_ok());
    }

    #[test]
    fn test_unknown_anchor() {
        let store = MemoryRuleStore::new();
        let handle = AnchorHandle::new("never-opened");
        assert!(matches!(
            store.begin_enumeration(&handle),
            Err(StoreError::UnknownAnchor(_))
        ));
    }

    #[test]
    fn test_anchors_are_isolated() {
        let store = MemoryRuleStore::new();
        let first = store.open("first").unwrap();
        let second = store.open("second").unwrap();

        let ticket = store.request_change_ticket(&first).unwrap();
        store.commit_add(&ticket, labelled("only-in-first")).unwrap();

        assert_eq!(store.begin_enumeration(&first).unwrap().count(), 1);
        assert_eq!(store.begin_enumeration(&second).unwrap().count(), 0);

        // A change to another anchor leaves this anchor's tickets current
        let ticket = store.request_change_ticket(&second).unwrap();
        store.commit_add(&ticket, labelled("x")).unwrap();
        let snapshot = store.begin_enumeration(&first).unwrap();
        assert!(store.get_rule(&snapshot.position(0).unwrap()).is_ok());
    }

    #[test]
    fn test_stale_change_ticket() {
        let store = MemoryRuleStore::new();
        let handle = store.open("miniupnpd").unwrap();

        let early = store.request_change_ticket(&handle).unwrap();
        let late = store.request_change_ticket(&handle).unwrap();

        assert_eq!(
            store.commit_add(&late, labelled("a")).unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(
            store.commit_add(&early, labelled("b")).unwrap(),
            CommitOutcome::Stale
        );
        assert_eq!(store.rules("miniupnpd").len(), 1);
    }

    #[test]
    fn test_record_traffic() {
        let store = MemoryRuleStore::new();
        let handle = store.open("miniupnpd").unwrap();
        let ticket = store.request_change_ticket(&handle).unwrap();
        store.commit_add(&ticket, labelled("a")).unwrap();

        let counters = RuleCounters {
            packets_in: 2,
            bytes_in: 120,
            ..Default::default()
        };
        assert_eq!(store.record_traffic("miniupnpd", "a", counters), 1);
        assert_eq!(store.record_traffic("miniupnpd", "missing", counters), 0);
        assert_eq!(store.rules("miniupnpd")[0].counters.total_bytes(), 120);
    }
}
