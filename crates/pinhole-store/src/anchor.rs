//! Generation-checked rule list shared by the store implementations

use crate::{ChangeTicket, CommitOutcome, Enumeration, RulePosition, StoreError, Ticket};
use pinhole_proto::{RuleCounters, RuleSpec, RuleView};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Rules of one anchor plus the generation that tickets are checked against
///
/// Every committed change advances the generation by one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnchorRules {
    generation: u64,
    rules: Vec<RuleView>,
}

impl AnchorRules {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rules(&self) -> &[RuleView] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enumerate(&self, anchor: &str) -> Enumeration {
        Enumeration::new(anchor, Ticket::new(self.generation), self.count())
    }

    pub fn change_ticket(&self, anchor: &str) -> ChangeTicket {
        ChangeTicket::new(anchor, Ticket::new(self.generation))
    }

    pub fn get(&self, position: &RulePosition) -> Result<RuleView, StoreError> {
        self.check_current(position.snapshot())?;
        self.rules
            .get(position.index() as usize)
            .cloned()
            .ok_or(StoreError::IndexOutOfRange {
                index: position.index(),
                count: self.count(),
            })
    }

    pub fn append(&mut self, ticket: &ChangeTicket, rule: RuleSpec) -> CommitOutcome {
        if ticket.ticket().generation() != self.generation {
            trace!(
                "Rejecting add with ticket {} at generation {}",
                ticket.ticket(),
                self.generation
            );
            return CommitOutcome::Stale;
        }
        self.rules.push(RuleView {
            rule,
            counters: RuleCounters::default(),
        });
        self.generation += 1;
        CommitOutcome::Committed
    }

    pub fn remove(
        &mut self,
        ticket: &ChangeTicket,
        position: &RulePosition,
    ) -> Result<CommitOutcome, StoreError> {
        if ticket.anchor() != position.anchor() {
            return Err(StoreError::AnchorMismatch {
                ticket: ticket.anchor().to_string(),
                target: position.anchor().to_string(),
            });
        }
        // The index is only meaningful in the snapshot it was read from
        if ticket.ticket().generation() != self.generation
            || position.snapshot().generation() != self.generation
        {
            trace!(
                "Rejecting remove with ticket {} (snapshot {}) at generation {}",
                ticket.ticket(),
                position.snapshot(),
                self.generation
            );
            return Ok(CommitOutcome::Stale);
        }
        let index = position.index() as usize;
        if index >= self.rules.len() {
            return Err(StoreError::IndexOutOfRange {
                index: position.index(),
                count: self.count(),
            });
        }
        self.rules.remove(index);
        self.generation += 1;
        Ok(CommitOutcome::Committed)
    }

    /// Add traffic to the counters of every rule carrying `label`
    pub fn record_traffic(&mut self, label: &str, counters: RuleCounters) -> usize {
        let mut touched = 0;
        for view in self.rules.iter_mut().filter(|v| v.rule.label == label) {
            view.counters.packets_in = view.counters.packets_in.saturating_add(counters.packets_in);
            view.counters.packets_out =
                view.counters.packets_out.saturating_add(counters.packets_out);
            view.counters.bytes_in = view.counters.bytes_in.saturating_add(counters.bytes_in);
            view.counters.bytes_out = view.counters.bytes_out.saturating_add(counters.bytes_out);
            touched += 1;
        }
        touched
    }

    fn check_current(&self, ticket: Ticket) -> Result<(), StoreError> {
        if ticket.generation() != self.generation {
            return Err(StoreError::StaleTicket {
                issued: ticket.generation(),
                current: self.generation,
            });
        }
        Ok(())
    }

    fn count(&self) -> u32 {
        u32::try_from(self.rules.len()).unwrap_or(u32::MAX)
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
    fn test_append_advances_generation() {
        let mut anchor = AnchorRules::default();
        let ticket = anchor.change_ticket("a");

        assert_eq!(anchor.append(&ticket, labelled("one")), CommitOutcome::Committed);
        assert_eq!(anchor.generation(), 1);
        assert_eq!(anchor.len(), 1);

        // The same ticket cannot be used twice
        assert_eq!(anchor.append(&ticket, labelled("two")), CommitOutcome::Stale);
        assert_eq!(anchor.len(), 1);
    }

    #[test]
    fn test_snapshot_goes_stale_after_change() {
        let mut anchor = AnchorRules::default();
        let ticket = anchor.change_ticket("a");
        anchor.append(&ticket, labelled("one"));

        let snapshot = anchor.enumerate("a");
        let position = snapshot.position(0).unwrap();
        assert_eq!(anchor.get(&position).unwrap().label(), "one");

        let ticket = anchor.change_ticket("a");
        anchor.append(&ticket, labelled("two"));

        assert!(matches!(
            anchor.get(&position),
            Err(StoreError::StaleTicket { issued: 1, current: 2 })
        ));
    }

    #[test]
    fn test_remove_keeps_lower_indices() {
        let mut anchor = AnchorRules::default();
        for label in ["a", "b", "c"] {
            let ticket = anchor.change_ticket("x");
            anchor.append(&ticket, labelled(label));
        }

        let snapshot = anchor.enumerate("x");
        let ticket = anchor.change_ticket("x");
        let outcome = anchor.remove(&ticket, &snapshot.position(1).unwrap()).unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        let labels: Vec<&str> = anchor.rules().iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec!["a", "c"]);
    }

    #[test]
    fn test_remove_with_outdated_snapshot_is_stale() {
        let mut anchor = AnchorRules::default();
        let ticket = anchor.change_ticket("x");
        anchor.append(&ticket, labelled("a"));

        let snapshot = anchor.enumerate("x");
        let ticket = anchor.change_ticket("x");
        anchor.append(&ticket, labelled("b"));

        let fresh_ticket = anchor.change_ticket("x");
        let outcome = anchor
            .remove(&fresh_ticket, &snapshot.position(0).unwrap())
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Stale);
        assert_eq!(anchor.len(), 2);
    }

    #[test]
    fn test_remove_rejects_foreign_anchor() {
        let mut anchor = AnchorRules::default();
        let ticket = anchor.change_ticket("x");
        anchor.append(&ticket, labelled("a"));

        let snapshot = anchor.enumerate("x");
        let foreign_ticket = anchor.change_ticket("y");
        assert!(matches!(
            anchor.remove(&foreign_ticket, &snapshot.position(0).unwrap()),
            Err(StoreError::AnchorMismatch { .. })
        ));
    }
}
