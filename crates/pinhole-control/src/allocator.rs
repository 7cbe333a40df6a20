//! Pinhole id allocation
//!
//! Ids are small integers in `1..=65534` handed out in increasing order and
//! wrapping back to 1. The allocator only remembers the next candidate; the
//! set of live ids lives in the rule store. Two policies keep a wrapped
//! candidate away from live ids:
//!
//! - [`AllocationPolicy::Heuristic`]: after every expiry sweep,
//!   [`IdAllocator::reconcile`] moves the candidate past the live range when it
//!   trails it closely. Cheap, but a still-live id can be reissued under heavy churn.
//! - [`AllocationPolicy::StrictScan`]: every add enumerates the live ids first
//!   and [`IdAllocator::candidate_excluding`] skips them.

use pinhole_proto::{MAX_PINHOLE_ID, MIN_PINHOLE_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// How far behind the lowest live id the candidate may sit before
/// [`IdAllocator::reconcile`] moves it past the live range
pub const RECONCILE_WINDOW: u16 = 32000;

/// How ids are kept clear of pinholes that are still live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    #[default]
    Heuristic,
    StrictScan,
}

/// Issues pinhole ids with wraparound
pub struct IdAllocator {
    next: Mutex<u16>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(MIN_PINHOLE_ID)
    }

    /// Start from a given candidate, clamped into the valid id range
    pub fn starting_at(id: u16) -> Self {
        Self {
            next: Mutex::new(id.clamp(MIN_PINHOLE_ID, MAX_PINHOLE_ID)),
        }
    }

    /// The id [`IdAllocator::allocate`] would return next
    pub fn peek(&self) -> u16 {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the current candidate and advance past it
    pub fn allocate(&self) -> u16 {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        *next = successor(id);
        id
    }

    /// Mark `id` as issued: the next candidate becomes the id after it
    pub fn advance_past(&self, id: u16) {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        *next = successor(id);
    }

    /// First id at or after the current candidate (wrapping) that is not live
    ///
    /// Does not advance the candidate. `None` when every id is live.
    pub fn candidate_excluding(&self, live: &BTreeSet<u16>) -> Option<u16> {
        let mut id = self.peek();
        for _ in MIN_PINHOLE_ID..=MAX_PINHOLE_ID {
            if !live.contains(&id) {
                return Some(id);
            }
            id = successor(id);
        }
        None
    }

    /// Move the candidate past the live range if it trails it within
    /// [`RECONCILE_WINDOW`]
    ///
    /// Called after a sweep has seen every live id; `min_live`/`max_live` are
    /// the smallest and largest of them.
    pub fn reconcile(&self, min_live: u16, max_live: u16) {
        if max_live == 0 {
            return;
        }
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let window_start = i32::from(min_live) - i32::from(RECONCILE_WINDOW);
        if window_start <= i32::from(*next) && *next <= max_live {
            let moved = successor(max_live);
            debug!(
                "Moving next pinhole id from {} to {} (live ids {}..={})",
                *next, moved, min_live, max_live
            );
            *next = moved;
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn successor(id: u16) -> u16 {
    if id >= MAX_PINHOLE_ID {
        MIN_PINHOLE_ID
    } else {
        id + 1
    }
}
