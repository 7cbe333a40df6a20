//! Pinhole rule model
//!
//! This crate defines the rule representation shared by rule stores and the
//! pinhole manager, the label codec that carries pinhole identity and expiry
//! inside a rule's free-text label, and IPv6 address normalization.

pub mod address;
pub mod label;
pub mod rule;

pub use address::{is_wildcard_host, parse_pinhole_addr, AddressError};
pub use label::{LabelCodec, PinholeLabel, DEFAULT_LABEL_CAPACITY, LABEL_ID_PREFIX};
pub use rule::{
    AddressFamily, Direction, PortMatch, RuleAction, RuleAddr, RuleCounters, RuleEndpoint,
    RuleSpec, RuleView, TcpFlags, IPPROTO_TCP, IPPROTO_UDP,
};

/// Smallest id handed out to a pinhole (0 is reserved)
pub const MIN_PINHOLE_ID: u16 = 1;

/// Largest id handed out to a pinhole (65535 is never used)
pub const MAX_PINHOLE_ID: u16 = 65534;
