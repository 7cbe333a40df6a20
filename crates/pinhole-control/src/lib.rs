//! Pinhole lifecycle management
//!
//! Creates, finds, deletes, inspects and expires temporary inbound allow rules
//! in a rule store anchor. All pinhole state lives in the store: identity and
//! expiry travel in each rule's label, so a restarted process picks up exactly
//! where the previous one left off.
pub mod allocator;
pub mod config;
pub mod error;
pub mod manager;

pub use allocator::{AllocationPolicy, IdAllocator, RECONCILE_WINDOW};
pub use config::ManagerConfig;
pub use error::{ErrorKind, PinholeError};
pub use manager::{
    CleanReport, PinholeCriteria, PinholeInfo, PinholeManager, PinholeMatch, PinholeSpec,
};
