//! Rule store contract
//!
//! A rule store holds ordered rule lists partitioned into named anchors and
//! guards changes with generation tickets:
//!
//! - [`RuleStore::begin_enumeration`] hands out a snapshot ticket and the rule
//!   count seen at that moment. Rules are fetched one position at a time.
//! - [`RuleStore::request_change_ticket`] hands out a change ticket bound to the
//!   current generation; [`RuleStore::commit_add`] / [`RuleStore::commit_remove`]
//!   report [`CommitOutcome::Stale`] if any change was committed in between.
//!
//! Positions only come from an [`Enumeration`], so an index can never be used
//! against an anchor or snapshot it was not read from.

pub mod anchor;
pub mod file;
pub mod memory;

pub use file::FileRuleStore;
pub use memory::MemoryRuleStore;

use pinhole_proto::{RuleSpec, RuleView};
use std::fmt;
use thiserror::Error;

/// Rule store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Rule store is not open (anchor {0})")]
    NotOpen(String),

    #[error("Unknown anchor: {0}")]
    UnknownAnchor(String),

    #[error("Stale ticket: issued for generation {issued}, store is at {current}")]
    StaleTicket { issued: u64, current: u64 },

    #[error("Rule index {index} out of range (anchor holds {count} rules)")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("Ticket for anchor {ticket} used on anchor {target}")]
    AnchorMismatch { ticket: String, target: String },

    #[error("Rule store I/O error: {0}")]
    Io(String),

    #[error("Rule store serialization error: {0}")]
    Serialization(String),
}

/// Generation token issued by a rule store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn new(generation: u64) -> Self {
        Self(generation)
    }

    pub fn generation(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle on an opened anchor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorHandle {
    anchor: String,
}

impl AnchorHandle {
    pub fn new(anchor: impl Into<String>) -> Self {
        Self {
            anchor: anchor.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.anchor
    }
}

/// A snapshot of an anchor's rule list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumeration {
    anchor: String,
    ticket: Ticket,
    count: u32,
}

impl Enumeration {
    pub fn new(anchor: impl Into<String>, ticket: Ticket, count: u32) -> Self {
        Self {
            anchor: anchor.into(),
            ticket,
            count,
        }
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Number of rules at the time the snapshot was taken
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Position of the rule at `index` in this snapshot
    pub fn position(&self, index: u32) -> Option<RulePosition> {
        (index < self.count).then(|| RulePosition {
            anchor: self.anchor.clone(),
            snapshot: self.ticket,
            index,
        })
    }

    /// All positions, first to last
    pub fn positions(&self) -> impl DoubleEndedIterator<Item = RulePosition> + '_ {
        (0..self.count).filter_map(move |index| self.position(index))
    }
}

/// Position of a rule within one enumeration snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePosition {
    anchor: String,
    snapshot: Ticket,
    index: u32,
}

impl RulePosition {
    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn snapshot(&self) -> Ticket {
        self.snapshot
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Authorization for one change to an anchor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTicket {
    anchor: String,
    ticket: Ticket,
}

impl ChangeTicket {
    pub fn new(anchor: impl Into<String>, ticket: Ticket) -> Self {
        Self {
            anchor: anchor.into(),
            ticket,
        }
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

/// Result of a commit that reached the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The anchor changed since the ticket was issued; nothing was applied
    Stale,
}

/// Ticketed access to an external rule store
pub trait RuleStore: Send + Sync {
    /// Open an anchor, creating it if the store allows
    fn open(&self, anchor: &str) -> Result<AnchorHandle, StoreError>;

    /// Take a snapshot of the anchor's rule list
    fn begin_enumeration(&self, anchor: &AnchorHandle) -> Result<Enumeration, StoreError>;

    /// Fetch one rule of a snapshot
    ///
    /// Fails with [`StoreError::StaleTicket`] once the anchor has changed and
    /// with [`StoreError::IndexOutOfRange`] if the rule list has shrunk.
    fn get_rule(&self, position: &RulePosition) -> Result<RuleView, StoreError>;

    /// Get a ticket authorizing one change to the anchor
    fn request_change_ticket(&self, anchor: &AnchorHandle) -> Result<ChangeTicket, StoreError>;

    /// Append a rule at the end of the anchor's list
    fn commit_add(&self, ticket: &ChangeTicket, rule: RuleSpec)
        -> Result<CommitOutcome, StoreError>;

    /// Remove the rule at a position
    ///
    /// Stale if the anchor changed since the position's snapshot was taken.
    fn commit_remove(
        &self,
        ticket: &ChangeTicket,
        position: &RulePosition,
    ) -> Result<CommitOutcome, StoreError>;
}
