//! Pinhole manager
//!
//! Every operation is a short synchronous exchange with the rule store. No lock
//! is held between calls: the store's ticket check is what keeps a concurrent
//! change from being overwritten, and a stale ticket surfaces as
//! [`PinholeError::StoreRejected`] for the caller to retry.
//!
//! Rules created here look like:
//!
//! ```text
//! pass in quick on ep0 inet6 proto udp
//!   from any to dead:beef::42:42 port = 8080
//!   keep state
//!   label "pinhole-2 ts-4321000: description"
//! ```

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use pinhole_proto::{
    is_wildcard_host, parse_pinhole_addr, AddressFamily, Direction, LabelCodec, PortMatch,
    RuleAction, RuleAddr, RuleEndpoint, RuleSpec, RuleView, TcpFlags, IPPROTO_TCP,
};
use pinhole_store::{AnchorHandle, CommitOutcome, Enumeration, RulePosition, RuleStore, StoreError};

use crate::allocator::{AllocationPolicy, IdAllocator};
use crate::config::ManagerConfig;
use crate::error::PinholeError;

/// What a pinhole matches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinholeCriteria {
    /// Inbound interface; only applied when creating a rule
    pub interface: Option<String>,
    /// Remote peer; `None`, empty or `*` matches any peer
    pub remote_host: Option<String>,
    /// Remote port; 0 matches any port
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    /// IANA protocol number
    pub protocol: u8,
}

impl PinholeCriteria {
    pub fn new(local_host: impl Into<String>, local_port: u16, protocol: u8) -> Self {
        Self {
            interface: None,
            remote_host: None,
            remote_port: 0,
            local_host: local_host.into(),
            local_port,
            protocol,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_remote(mut self, host: impl Into<String>, port: u16) -> Self {
        self.remote_host = Some(host.into());
        self.remote_port = port;
        self
    }

    /// Remote and local rule endpoints for these criteria
    ///
    /// An address that does not parse degrades to the all-zero address rather
    /// than failing the operation.
    fn endpoints(&self) -> (RuleEndpoint, RuleEndpoint) {
        let remote_addr = if is_wildcard_host(self.remote_host.as_deref()) {
            RuleAddr::Any
        } else {
            host_or_zero(self.remote_host.as_deref().unwrap_or_default())
        };
        let remote = RuleEndpoint {
            addr: remote_addr,
            port: PortMatch::from_port(self.remote_port),
        };
        let local = RuleEndpoint {
            addr: host_or_zero(&self.local_host),
            port: PortMatch::Eq(self.local_port),
        };
        (remote, local)
    }
}

/// Everything needed to open a pinhole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinholeSpec {
    pub criteria: PinholeCriteria,
    pub description: String,
    /// Absolute expiry, seconds since the epoch
    pub expiry: u32,
}

impl PinholeSpec {
    pub fn new(criteria: PinholeCriteria, description: impl Into<String>, expiry: u32) -> Self {
        Self {
            criteria,
            description: description.into(),
            expiry,
        }
    }
}

/// A pinhole located by [`PinholeManager::find`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinholeMatch {
    pub id: u16,
    pub expiry: u32,
    pub description: String,
}

/// A pinhole as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinholeInfo {
    pub id: u16,
    pub interface: Option<String>,
    pub protocol: u8,
    /// `None` when any peer may connect
    pub remote_addr: Option<IpAddr>,
    /// 0 when any remote port may connect
    pub remote_port: u16,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub description: String,
    pub expiry: u32,
    /// Packets matched in both directions
    pub packets: u64,
    /// Bytes matched in both directions
    pub bytes: u64,
}

/// Outcome of [`PinholeManager::clean_expired`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    pub removed: usize,
    /// Earliest expiry among the pinholes left, `None` if there are none
    pub next_wakeup: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
struct MatchKey {
    direction: Direction,
    action: RuleAction,
    family: AddressFamily,
    protocol: u8,
    remote: RuleEndpoint,
    local: RuleEndpoint,
}

impl MatchKey {
    fn of(rule: &RuleSpec) -> Self {
        Self {
            direction: rule.direction,
            action: rule.action,
            family: rule.family,
            protocol: rule.protocol,
            remote: rule.src,
            local: rule.dst,
        }
    }

    /// Key of the rule [`PinholeManager::add`] would create for `criteria`
    fn pinhole(criteria: &PinholeCriteria) -> Self {
        let (remote, local) = criteria.endpoints();
        Self {
            direction: Direction::In,
            action: RuleAction::Pass,
            family: AddressFamily::Inet6,
            protocol: criteria.protocol,
            remote,
            local,
        }
    }
}

/// Creates, finds and expires pinholes in one anchor of a rule store
pub struct PinholeManager {
    store: Arc<dyn RuleStore>,
    anchor: AnchorHandle,
    config: ManagerConfig,
    codec: LabelCodec,
    allocator: IdAllocator,
}

impl PinholeManager {
    /// Open the configured anchor
    ///
    /// The id allocator is moved past the pinholes already in the anchor, so a
    /// new process does not hand out ids that are still live.
    pub fn open(store: Arc<dyn RuleStore>, config: ManagerConfig) -> Result<Self, PinholeError> {
        let anchor = store.open(&config.anchor).map_err(|e| {
            error!("Failed to open anchor {}: {}", config.anchor, e);
            PinholeError::StoreUnavailable(e.to_string())
        })?;
        debug!("Opened pinhole anchor {}", anchor.name());

        let manager = Self {
            store,
            anchor,
            codec: LabelCodec::new(config.label_capacity),
            config,
            allocator: IdAllocator::new(),
        };

        let live = manager.live_ids("open")?;
        if let (Some(&min_id), Some(&max_id)) = (live.first(), live.last()) {
            manager.allocator.reconcile(min_id, max_id);
            debug!(
                "Found {} live pinhole(s) in {}, next id {}",
                live.len(),
                manager.anchor(),
                manager.allocator.peek()
            );
        }
        Ok(manager)
    }

    /// Replace the id allocator (e.g. to resume from a known candidate)
    pub fn with_allocator(mut self, allocator: IdAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn anchor(&self) -> &str {
        self.anchor.name()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    /// Open a pinhole and return its id
    ///
    /// The rule is appended to the end of the anchor so rules already there
    /// keep their evaluation order. Nothing is left behind if the store
    /// rejects the change, and the id is only consumed once the rule is in.
    pub fn add(&self, spec: &PinholeSpec) -> Result<u16, PinholeError> {
        let id = match self.config.allocation_policy {
            AllocationPolicy::Heuristic => self.allocator.peek(),
            AllocationPolicy::StrictScan => {
                let live = self.live_ids("add")?;
                self.allocator
                    .candidate_excluding(&live)
                    .ok_or(PinholeError::IdsExhausted)?
            }
        };

        let rule = self.build_rule(id, spec);
        trace!("Adding rule to anchor {}: {}", self.anchor(), rule);
        self.append_rule("add", rule)?;
        self.allocator.advance_past(id);

        info!(
            "Opened pinhole {} to [{}]:{} proto {} until {}",
            id,
            spec.criteria.local_host,
            spec.criteria.local_port,
            spec.criteria.protocol,
            spec.expiry
        );
        Ok(id)
    }

    /// Find the pinhole whose match criteria equal `criteria` exactly
    ///
    /// The interface is not compared.
    pub fn find(&self, criteria: &PinholeCriteria) -> Result<PinholeMatch, PinholeError> {
        let wanted = MatchKey::pinhole(criteria);

        let found = self.scan("find", |view| {
            let label = match self.codec.decode(view.label()) {
                Some(label) => label,
                None => {
                    debug!("Rule with label '{}' is not a pinhole", view.label());
                    return None;
                }
            };
            (MatchKey::of(&view.rule) == wanted).then(|| PinholeMatch {
                id: label.id,
                expiry: label.timestamp,
                description: label.description,
            })
        })?;

        found.map(|(_, pinhole)| pinhole).ok_or_else(|| {
            PinholeError::NotFound(format!(
                "proto {} from {} to {}",
                criteria.protocol, wanted.remote, wanted.local
            ))
        })
    }

    /// Remove the pinhole with this id
    pub fn delete(&self, id: u16) -> Result<(), PinholeError> {
        let found = self.scan("delete", |view| {
            (self.codec.decode_id_prefix(view.label()) == Some(id)).then_some(())
        })?;

        let (position, ()) = found.ok_or_else(|| PinholeError::NotFound(format!("id {}", id)))?;
        self.remove_rule("delete", &position)?;
        info!("Deleted pinhole {}", id);
        Ok(())
    }

    /// Read a pinhole's criteria, description, expiry and traffic counters
    pub fn get_info(&self, id: u16) -> Result<PinholeInfo, PinholeError> {
        let found = self.scan("get_info", |view| {
            (self.codec.decode_id_prefix(view.label()) == Some(id))
                .then(|| self.describe(id, view))
        })?;

        found
            .map(|(_, info)| info)
            .ok_or_else(|| PinholeError::NotFound(format!("id {}", id)))
    }

    /// Change a pinhole's expiry
    ///
    /// Always fails: a rule's label cannot be rewritten in place. Callers that
    /// need a new expiry delete and re-add the pinhole, which resets its counters.
    pub fn update(&self, id: u16, expiry: u32) -> Result<(), PinholeError> {
        debug!(
            "Refusing to update pinhole {} to expire at {}: labels are immutable",
            id, expiry
        );
        Err(PinholeError::NotSupported("update"))
    }

    /// Remove every pinhole whose expiry is at or before `now`
    ///
    /// Walks the anchor from the last rule to the first; removing a rule never
    /// moves the rules before it, so the positions still to be visited stay
    /// valid. The snapshot is re-taken after each removal.
    pub fn clean_expired(&self, now: u32) -> Result<CleanReport, PinholeError> {
        let mut enumeration = self.begin("clean_expired")?;
        let mut index = enumeration.count();

        let mut removed = 0;
        let mut min_id = u16::MAX;
        let mut max_id = 0u16;
        let mut next_wakeup: Option<u32> = None;

        while index > 0 {
            index -= 1;
            let Some(position) = enumeration.position(index) else {
                continue;
            };
            let view = match self.store.get_rule(&position) {
                Ok(view) => view,
                Err(StoreError::IndexOutOfRange { index, count }) => {
                    debug!("Rule {} vanished during sweep ({} left)", index, count);
                    continue;
                }
                Err(e) => {
                    error!("Failed to fetch rule {} of {}: {}", index, self.anchor(), e);
                    return Err(PinholeError::from_store("clean_expired", e));
                }
            };

            let Some(label) = self.codec.decode(view.label()) else {
                debug!("Rule with label '{}' is not a pinhole", view.label());
                continue;
            };

            if label.timestamp <= now {
                info!("Removing expired pinhole '{}'", view.label());
                self.remove_rule("clean_expired", &position)?;
                removed += 1;
                enumeration = self.begin("clean_expired")?;
            } else {
                min_id = min_id.min(label.id);
                max_id = max_id.max(label.id);
                next_wakeup =
                    Some(next_wakeup.map_or(label.timestamp, |ts| ts.min(label.timestamp)));
            }
        }

        if max_id > 0 {
            self.allocator.reconcile(min_id, max_id);
        }

        if removed > 0 {
            info!(
                "Removed {} expired pinhole(s) from {}",
                removed,
                self.anchor()
            );
        }
        Ok(CleanReport {
            removed,
            next_wakeup,
        })
    }

    /// Every pinhole currently in the anchor, in rule order
    pub fn list(&self) -> Result<Vec<PinholeInfo>, PinholeError> {
        let mut pinholes = Vec::new();
        self.scan("list", |view| {
            if let Some(label) = self.codec.decode(view.label()) {
                pinholes.push(self.describe(label.id, view));
            }
            None::<()>
        })?;
        Ok(pinholes)
    }

    fn build_rule(&self, id: u16, spec: &PinholeSpec) -> RuleSpec {
        let criteria = &spec.criteria;
        let (remote, local) = criteria.endpoints();

        let mut rule = RuleSpec::pass_in();
        rule.quick = true;
        rule.family = AddressFamily::Inet6;
        rule.protocol = criteria.protocol;
        rule.interface = criteria.interface.clone().filter(|name| !name.is_empty());
        rule.src = remote;
        rule.dst = local;
        rule.keep_state = true;
        rule.tcp_flags = (criteria.protocol == IPPROTO_TCP).then(TcpFlags::syn_only);
        rule.log = self.config.log_packets;
        rule.queue = self.config.queue.clone();
        rule.tag = self.config.tag.clone();
        rule.label = self.codec.encode(id, spec.expiry, &spec.description);
        rule
    }

    fn describe(&self, id: u16, view: &RuleView) -> PinholeInfo {
        let (expiry, description) = match self.codec.decode(view.label()) {
            Some(label) => (label.timestamp, label.description),
            None => {
                warn!("Pinhole {} has a malformed label '{}'", id, view.label());
                (0, String::new())
            }
        };
        let remote_addr = match view.rule.src.addr {
            RuleAddr::Any => None,
            RuleAddr::Masked { addr, .. } => Some(addr),
        };
        let local_addr = match view.rule.dst.addr {
            RuleAddr::Any => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            RuleAddr::Masked { addr, .. } => addr,
        };

        PinholeInfo {
            id,
            interface: view.rule.interface.clone(),
            protocol: view.rule.protocol,
            remote_addr,
            remote_port: view.rule.src.port.port(),
            local_addr,
            local_port: view.rule.dst.port.port(),
            description,
            expiry,
            packets: view.counters.total_packets(),
            bytes: view.counters.total_bytes(),
        }
    }

    fn live_ids(&self, operation: &'static str) -> Result<BTreeSet<u16>, PinholeError> {
        let mut live = BTreeSet::new();
        self.scan(operation, |view| {
            if let Some(label) = self.codec.decode(view.label()) {
                live.insert(label.id);
            }
            None::<()>
        })?;
        Ok(live)
    }

    fn begin(&self, operation: &'static str) -> Result<Enumeration, PinholeError> {
        self.store.begin_enumeration(&self.anchor).map_err(|e| {
            error!("Failed to enumerate rules of {}: {}", self.anchor(), e);
            PinholeError::from_store(operation, e)
        })
    }

    /// Visit the rules of one snapshot first to last until `visit` returns
    /// something
    ///
    /// A fetch past the end of the list ends the scan: the anchor shrank after
    /// the snapshot's count was taken.
    fn scan<T>(
        &self,
        operation: &'static str,
        mut visit: impl FnMut(&RuleView) -> Option<T>,
    ) -> Result<Option<(RulePosition, T)>, PinholeError> {
        let enumeration = self.begin(operation)?;
        trace!(
            "Scanning {} rules of {} (ticket {})",
            enumeration.count(),
            self.anchor(),
            enumeration.ticket()
        );

        for position in enumeration.positions() {
            let view = match self.store.get_rule(&position) {
                Ok(view) => view,
                Err(StoreError::IndexOutOfRange { index, count }) => {
                    debug!(
                        "Anchor {} shrank to {} rules during scan, stopping at {}",
                        self.anchor(),
                        count,
                        index
                    );
                    break;
                }
                Err(e) => {
                    error!(
                        "Failed to fetch rule {} of {}: {}",
                        position.index(),
                        self.anchor(),
                        e
                    );
                    return Err(PinholeError::from_store(operation, e));
                }
            };
            if let Some(found) = visit(&view) {
                return Ok(Some((position, found)));
            }
        }
        Ok(None)
    }

    fn append_rule(&self, operation: &'static str, rule: RuleSpec) -> Result<(), PinholeError> {
        let ticket = self.store.request_change_ticket(&self.anchor).map_err(|e| {
            error!("Failed to get change ticket for {}: {}", self.anchor(), e);
            PinholeError::from_store(operation, e)
        })?;

        match self.store.commit_add(&ticket, rule) {
            Ok(CommitOutcome::Committed) => Ok(()),
            Ok(CommitOutcome::Stale) => {
                warn!(
                    "Add to {} rejected: ticket {} is stale",
                    self.anchor(),
                    ticket.ticket()
                );
                Err(PinholeError::stale(operation))
            }
            Err(e) => {
                error!("Failed to append rule to {}: {}", self.anchor(), e);
                Err(PinholeError::from_store(operation, e))
            }
        }
    }

    fn remove_rule(
        &self,
        operation: &'static str,
        position: &RulePosition,
    ) -> Result<(), PinholeError> {
        let ticket = self.store.request_change_ticket(&self.anchor).map_err(|e| {
            error!("Failed to get change ticket for {}: {}", self.anchor(), e);
            PinholeError::from_store(operation, e)
        })?;

        match self.store.commit_remove(&ticket, position) {
            Ok(CommitOutcome::Committed) => Ok(()),
            Ok(CommitOutcome::Stale) => {
                warn!(
                    "Removal of rule {} from {} rejected: ticket {} is stale",
                    position.index(),
                    self.anchor(),
                    ticket.ticket()
                );
                Err(PinholeError::stale(operation))
            }
            Err(e) => {
                error!(
                    "Failed to remove rule {} from {}: {}",
                    position.index(),
                    self.anchor(),
                    e
                );
                Err(PinholeError::from_store(operation, e))
            }
        }
    }
}

fn host_or_zero(host: &str) -> RuleAddr {
    match parse_pinhole_addr(host) {
        Ok(addr) => RuleAddr::host(addr),
        Err(e) => {
            warn!("{}; matching on the zero address instead", e);
            RuleAddr::host(Ipv6Addr::UNSPECIFIED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use mockall::mock;
    use pinhole_proto::{RuleCounters, IPPROTO_UDP};
    use pinhole_store::{ChangeTicket, MemoryRuleStore, Ticket};

    mock! {
        pub Store {}
        impl RuleStore for Store {
            fn open(&self, anchor: &str) -> Result<AnchorHandle, StoreError>;
            fn begin_enumeration(&self, anchor: &AnchorHandle) -> Result<Enumeration, StoreError>;
            fn get_rule(&self, position: &RulePosition) -> Result<RuleView, StoreError>;
            fn request_change_ticket(&self, anchor: &AnchorHandle) -> Result<ChangeTicket, StoreError>;
            fn commit_add(&self, ticket: &ChangeTicket, rule: RuleSpec) -> Result<CommitOutcome, StoreError>;
            fn commit_remove(&self, ticket: &ChangeTicket, position: &RulePosition) -> Result<CommitOutcome, StoreError>;
        }
    }

    fn memory_manager() -> (Arc<MemoryRuleStore>, PinholeManager) {
        let store = Arc::new(MemoryRuleStore::new());
        let manager = PinholeManager::open(store.clone(), ManagerConfig::default()).unwrap();
        (store, manager)
    }

    fn mock_with_open() -> MockStore {
        let mut store = MockStore::new();
        store
            .expect_open()
            .returning(|anchor| Ok(AnchorHandle::new(anchor)));
        store
    }

    /// Enumerations that find `counts[n]` rules on the n-th call, the last
    /// count repeating
    fn expect_counts(store: &mut MockStore, counts: &'static [u32]) {
        let mut calls = 0usize;
        store.expect_begin_enumeration().returning(move |anchor| {
            let count = counts[calls.min(counts.len() - 1)];
            calls += 1;
            Ok(Enumeration::new(anchor.name(), Ticket::new(calls as u64), count))
        });
    }

    fn web_spec(expiry: u32) -> PinholeSpec {
        PinholeSpec::new(
            PinholeCriteria::new("2001:db8::2", 8080, IPPROTO_TCP).with_remote("2001:db8::1", 0),
            "web",
            expiry,
        )
    }

    fn operator_rule(label: &str) -> RuleView {
        let mut rule = RuleSpec::pass_in();
        rule.label = label.to_string();
        RuleView {
            rule,
            counters: RuleCounters::default(),
        }
    }

    #[test]
    fn test_add_builds_inbound_rule() {
        let (store, manager) = memory_manager();
        let spec = PinholeSpec::new(
            PinholeCriteria::new("2001:db8::2", 8080, IPPROTO_TCP)
                .with_interface("wan0")
                .with_remote("2001:db8::1", 5000),
            "cam",
            1000,
        );

        let id = manager.add(&spec).unwrap();
        assert_eq!(id, 1);

        let rules = store.rules("miniupnpd");
        assert_eq!(rules.len(), 1);
        let rule = &rules[0].rule;
        assert_eq!(rule.direction, pinhole_proto::Direction::In);
        assert_eq!(rule.action, pinhole_proto::RuleAction::Pass);
        assert!(rule.quick);
        assert!(rule.keep_state);
        assert_eq!(rule.family, AddressFamily::Inet6);
        assert_eq!(rule.interface.as_deref(), Some("wan0"));
        assert_eq!(rule.tcp_flags, Some(TcpFlags::syn_only()));
        assert_eq!(
            rule.src,
            RuleEndpoint {
                addr: RuleAddr::host("2001:db8::1".parse().unwrap()),
                port: PortMatch::Eq(5000),
            }
        );
        assert_eq!(
            rule.dst,
            RuleEndpoint {
                addr: RuleAddr::host("2001:db8::2".parse().unwrap()),
                port: PortMatch::Eq(8080),
            }
        );
        assert_eq!(rule.label, "pinhole-1 ts-1000: cam");
    }

    #[test]
    fn test_add_wildcard_remote_and_udp() {
        let (store, manager) = memory_manager();
        let spec = PinholeSpec::new(
            PinholeCriteria::new("2001:db8::2", 5353, IPPROTO_UDP).with_remote("*", 0),
            "mdns",
            50,
        );
        manager.add(&spec).unwrap();

        let rule = &store.rules("miniupnpd")[0].rule;
        assert_eq!(rule.src, RuleEndpoint::any());
        assert_eq!(rule.tcp_flags, None);
    }

    #[test]
    fn test_add_applies_config() {
        let store = Arc::new(MemoryRuleStore::new());
        let config = ManagerConfig {
            log_packets: true,
            queue: Some("igd".to_string()),
            tag: Some("upnp".to_string()),
            ..ManagerConfig::default()
        }
        .with_anchor("igd-anchor");
        let manager = PinholeManager::open(store.clone(), config).unwrap();
        manager.add(&web_spec(10)).unwrap();

        let rule = &store.rules("igd-anchor")[0].rule;
        assert!(rule.log);
        assert_eq!(rule.queue.as_deref(), Some("igd"));
        assert_eq!(rule.tag.as_deref(), Some("upnp"));
        assert!(store.rules("miniupnpd").is_empty());
    }

    #[test]
    fn test_add_invalid_address_degrades_to_zero_filter() {
        let (store, manager) = memory_manager();
        let spec = PinholeSpec::new(
            PinholeCriteria::new("not-an-address", 80, IPPROTO_TCP).with_remote("also bad", 0),
            "broken",
            10,
        );

        let id = manager.add(&spec).unwrap();

        let rule = &store.rules("miniupnpd")[0].rule;
        assert_eq!(rule.src.addr, RuleAddr::host(Ipv6Addr::UNSPECIFIED));
        assert_eq!(rule.dst.addr, RuleAddr::host(Ipv6Addr::UNSPECIFIED));

        // The same degraded criteria find the same rule
        assert_eq!(manager.find(&spec.criteria).unwrap().id, id);
    }

    #[test]
    fn test_add_appends_after_operator_rules() {
        let (store, manager) = memory_manager();
        let handle = store.open("miniupnpd").unwrap();
        let ticket = store.request_change_ticket(&handle).unwrap();
        store
            .commit_add(&ticket, operator_rule("operator: allow ssh").rule)
            .unwrap();

        manager.add(&web_spec(10)).unwrap();

        let labels: Vec<String> = store
            .rules("miniupnpd")
            .iter()
            .map(|r| r.label().to_string())
            .collect();
        assert_eq!(labels, vec!["operator: allow ssh", "pinhole-1 ts-10: web"]);
    }

    #[test]
    fn test_find_requires_exact_match() {
        let (_store, manager) = memory_manager();
        let id = manager.add(&web_spec(10)).unwrap();

        let found = manager.find(&web_spec(10).criteria).unwrap();
        assert_eq!(
            found,
            PinholeMatch {
                id,
                expiry: 10,
                description: "web".to_string()
            }
        );

        // Wildcard remote is a different pinhole
        let wildcard = PinholeCriteria::new("2001:db8::2", 8080, IPPROTO_TCP);
        assert_eq!(
            manager.find(&wildcard).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        // So is a different protocol or port
        let udp = PinholeCriteria::new("2001:db8::2", 8080, IPPROTO_UDP)
            .with_remote("2001:db8::1", 0);
        assert_eq!(manager.find(&udp).unwrap_err().kind(), ErrorKind::NotFound);
        let port = PinholeCriteria::new("2001:db8::2", 8081, IPPROTO_TCP)
            .with_remote("2001:db8::1", 0);
        assert_eq!(manager.find(&port).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_find_ignores_interface() {
        let (_store, manager) = memory_manager();
        let mut spec = web_spec(10);
        spec.criteria = spec.criteria.with_interface("wan0");
        let id = manager.add(&spec).unwrap();

        let criteria = web_spec(10).criteria.with_interface("wan1");
        assert_eq!(manager.find(&criteria).unwrap().id, id);
    }

    #[test]
    fn test_find_skips_look_alike_foreign_rule() {
        let (store, manager) = memory_manager();
        let handle = store.open("miniupnpd").unwrap();

        // Operator rule with identical criteria but no pinhole label
        let mut rule = manager.build_rule(1, &web_spec(10));
        rule.label = "operator rule".to_string();
        let ticket = store.request_change_ticket(&handle).unwrap();
        store.commit_add(&ticket, rule).unwrap();

        assert_eq!(
            manager.find(&web_spec(10).criteria).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_find_requires_inbound_pass_rule() {
        let (store, manager) = memory_manager();
        let handle = store.open("miniupnpd").unwrap();

        let mut rule = manager.build_rule(1, &web_spec(10));
        rule.direction = pinhole_proto::Direction::Out;
        rule.action = pinhole_proto::RuleAction::Block;
        let ticket = store.request_change_ticket(&handle).unwrap();
        store.commit_add(&ticket, rule).unwrap();

        let mut rule = manager.build_rule(2, &web_spec(10));
        rule.family = AddressFamily::Inet;
        let ticket = store.request_change_ticket(&handle).unwrap();
        store.commit_add(&ticket, rule).unwrap();

        assert_eq!(
            manager.find(&web_spec(10).criteria).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let id = manager.add(&web_spec(10)).unwrap();
        assert_eq!(manager.find(&web_spec(10).criteria).unwrap().id, id);
    }

    #[test]
    fn test_open_skips_live_ids() {
        let store = Arc::new(MemoryRuleStore::new());
        let first = PinholeManager::open(store.clone(), ManagerConfig::default()).unwrap();
        assert_eq!(first.add(&web_spec(10)).unwrap(), 1);
        assert_eq!(first.add(&web_spec(20)).unwrap(), 2);
        first.delete(1).unwrap();

        let second = PinholeManager::open(store.clone(), ManagerConfig::default()).unwrap();
        assert_eq!(second.allocator().peek(), 3);
        assert_eq!(second.add(&web_spec(30)).unwrap(), 3);

        let ids: Vec<u16> = second.list().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_delete_then_find() {
        let (store, manager) = memory_manager();
        let first = manager.add(&web_spec(10)).unwrap();
        let other = PinholeSpec::new(
            PinholeCriteria::new("2001:db8::3", 22, IPPROTO_TCP),
            "ssh",
            20,
        );
        let second = manager.add(&other).unwrap();

        manager.delete(first).unwrap();

        assert_eq!(
            manager.find(&web_spec(10).criteria).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(manager.find(&other.criteria).unwrap().id, second);
        assert_eq!(store.rules("miniupnpd").len(), 1);

        assert_eq!(manager.delete(first).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_get_info_sums_counters() {
        let (store, manager) = memory_manager();
        let id = manager.add(&web_spec(1000)).unwrap();
        store.record_traffic(
            "miniupnpd",
            "pinhole-1 ts-1000: web",
            RuleCounters {
                packets_in: 10,
                packets_out: 5,
                bytes_in: 1000,
                bytes_out: 500,
            },
        );

        let info = manager.get_info(id).unwrap();
        assert_eq!(info.packets, 15);
        assert_eq!(info.bytes, 1500);
        assert_eq!(info.expiry, 1000);
        assert_eq!(info.description, "web");
        assert_eq!(info.remote_addr, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(info.remote_port, 0);
        assert_eq!(info.local_port, 8080);
        assert_eq!(info.protocol, IPPROTO_TCP);

        assert_eq!(manager.get_info(99).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_update_is_not_supported() {
        let (store, manager) = memory_manager();
        let id = manager.add(&web_spec(10)).unwrap();
        let before = store.rules("miniupnpd");

        let err = manager.update(id, 500).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!(manager.update(4242, 1).unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(store.rules("miniupnpd"), before);
    }

    #[test]
    fn test_clean_expired_keeps_survivors() {
        let (store, manager) = memory_manager();
        let handle = store.open("miniupnpd").unwrap();

        for (port, expiry) in [(1u16, 100u32), (2, 300), (3, 50), (4, 200)] {
            let spec = PinholeSpec::new(
                PinholeCriteria::new("2001:db8::2", port, IPPROTO_TCP),
                format!("p{}", port),
                expiry,
            );
            manager.add(&spec).unwrap();
            // Foreign rule between pinholes
            let ticket = store.request_change_ticket(&handle).unwrap();
            store
                .commit_add(&ticket, operator_rule("keep me").rule)
                .unwrap();
        }

        let report = manager.clean_expired(100).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.next_wakeup, Some(200));

        let labels: Vec<String> = store
            .rules("miniupnpd")
            .iter()
            .map(|r| r.label().to_string())
            .collect();
        assert_eq!(
            labels,
            vec![
                "keep me",
                "pinhole-2 ts-300: p2",
                "keep me",
                "keep me",
                "pinhole-4 ts-200: p4",
                "keep me",
            ]
        );
    }

    #[test]
    fn test_clean_expired_empty_anchor() {
        let (_store, manager) = memory_manager();
        let report = manager.clean_expired(100).unwrap();
        assert_eq!(
            report,
            CleanReport {
                removed: 0,
                next_wakeup: None
            }
        );
    }

    #[test]
    fn test_clean_expired_reconciles_allocator() {
        let (_store, manager) = memory_manager();
        for expiry in [500u32, 500, 500] {
            manager.add(&web_spec(expiry)).unwrap();
        }
        // Rewind the candidate as if the counter had wrapped
        manager.allocator().advance_past(pinhole_proto::MAX_PINHOLE_ID);
        assert_eq!(manager.allocator().peek(), 1);

        manager.clean_expired(100).unwrap();
        assert_eq!(manager.allocator().peek(), 4);
    }

    #[test]
    fn test_strict_scan_skips_live_ids() {
        let store = Arc::new(MemoryRuleStore::new());
        let config = ManagerConfig::default().with_allocation_policy(AllocationPolicy::StrictScan);
        let manager = PinholeManager::open(store.clone(), config)
            .unwrap()
            .with_allocator(IdAllocator::starting_at(pinhole_proto::MAX_PINHOLE_ID));

        assert_eq!(manager.add(&web_spec(10)).unwrap(), pinhole_proto::MAX_PINHOLE_ID);
        assert_eq!(manager.add(&web_spec(10)).unwrap(), 1);

        // Wrap back onto the live ids
        manager.allocator().advance_past(pinhole_proto::MAX_PINHOLE_ID - 1);
        assert_eq!(manager.add(&web_spec(10)).unwrap(), 2);
    }

    #[test]
    fn test_list_returns_only_pinholes() {
        let (store, manager) = memory_manager();
        let handle = store.open("miniupnpd").unwrap();
        let ticket = store.request_change_ticket(&handle).unwrap();
        store
            .commit_add(&ticket, operator_rule("operator").rule)
            .unwrap();
        manager.add(&web_spec(10)).unwrap();
        manager.add(&web_spec(20)).unwrap();

        let ids: Vec<u16> = manager.list().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_closed_store_is_unavailable() {
        let (store, manager) = memory_manager();
        store.close();

        assert_eq!(
            manager.add(&web_spec(10)).unwrap_err().kind(),
            ErrorKind::StoreUnavailable
        );
        assert_eq!(
            manager.find(&web_spec(10).criteria).unwrap_err().kind(),
            ErrorKind::StoreUnavailable
        );
        assert_eq!(
            manager.clean_expired(0).unwrap_err().kind(),
            ErrorKind::StoreUnavailable
        );

        assert!(matches!(
            PinholeManager::open(store.clone(), ManagerConfig::default()),
            Err(PinholeError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_stale_commit_keeps_id() {
        let mut store = mock_with_open();
        expect_counts(&mut store, &[0]);
        store
            .expect_request_change_ticket()
            .times(2)
            .returning(|anchor| Ok(ChangeTicket::new(anchor.name(), Ticket::new(7))));
        let mut outcomes = vec![CommitOutcome::Committed, CommitOutcome::Stale];
        store
            .expect_commit_add()
            .times(2)
            .returning(move |_, _| Ok(outcomes.pop().unwrap()));

        let manager = PinholeManager::open(Arc::new(store), ManagerConfig::default()).unwrap();

        let err = manager.add(&web_spec(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreRejected);
        assert_eq!(manager.allocator().peek(), 1);

        assert_eq!(manager.add(&web_spec(10)).unwrap(), 1);
        assert_eq!(manager.allocator().peek(), 2);
    }

    #[test]
    fn test_ticket_failure_skips_commit() {
        let mut store = mock_with_open();
        expect_counts(&mut store, &[0]);
        store
            .expect_request_change_ticket()
            .returning(|_| Err(StoreError::Io("device busy".to_string())));
        store.expect_commit_add().never();

        let manager = PinholeManager::open(Arc::new(store), ManagerConfig::default()).unwrap();
        let err = manager.add(&web_spec(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreRejected);
        assert!(err.to_string().contains("device busy"));
    }

    #[test]
    fn test_find_tolerates_shrinking_list() {
        let mut store = mock_with_open();
        store
            .expect_begin_enumeration()
            .returning(|anchor| Ok(Enumeration::new(anchor.name(), Ticket::new(3), 5)));
        store.expect_get_rule().returning(|position| {
            if position.index() == 0 {
                Ok(operator_rule("operator"))
            } else {
                Err(StoreError::IndexOutOfRange {
                    index: position.index(),
                    count: 1,
                })
            }
        });

        let manager = PinholeManager::open(Arc::new(store), ManagerConfig::default()).unwrap();
        assert_eq!(
            manager.find(&web_spec(10).criteria).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_fetch_failure_is_rejection() {
        let mut store = mock_with_open();
        expect_counts(&mut store, &[0, 2]);
        store.expect_get_rule().returning(|_| {
            Err(StoreError::StaleTicket {
                issued: 3,
                current: 4,
            })
        });

        let manager = PinholeManager::open(Arc::new(store), ManagerConfig::default()).unwrap();
        assert_eq!(
            manager.delete(1).unwrap_err().kind(),
            ErrorKind::StoreRejected
        );
    }

    #[test]
    fn test_stale_remove_is_rejection() {
        let mut store = mock_with_open();
        store
            .expect_begin_enumeration()
            .returning(|anchor| Ok(Enumeration::new(anchor.name(), Ticket::new(3), 1)));
        store
            .expect_get_rule()
            .returning(|_| Ok(operator_rule("pinhole-9 ts-5: old")));
        store
            .expect_request_change_ticket()
            .returning(|anchor| Ok(ChangeTicket::new(anchor.name(), Ticket::new(3))));
        store
            .expect_commit_remove()
            .times(1)
            .returning(|_, _| Ok(CommitOutcome::Stale));

        let manager = PinholeManager::open(Arc::new(store), ManagerConfig::default()).unwrap();
        assert_eq!(
            manager.delete(9).unwrap_err().kind(),
            ErrorKind::StoreRejected
        );
    }

    fn sweep_rule(index: u32) -> RuleView {
        match index {
            0 => operator_rule("pinhole-1 ts-60: a"),
            1 => operator_rule("pinhole-2 ts-500: b"),
            _ => operator_rule("pinhole-3 ts-50: c"),
        }
    }

    #[test]
    fn test_clean_expired_skips_vanished_rule() {
        let mut store = mock_with_open();
        expect_counts(&mut store, &[0, 3, 2]);
        store.expect_get_rule().returning(|position| match position.index() {
            1 => Err(StoreError::IndexOutOfRange { index: 1, count: 1 }),
            index => Ok(sweep_rule(index)),
        });
        store
            .expect_request_change_ticket()
            .returning(|anchor| Ok(ChangeTicket::new(anchor.name(), Ticket::new(9))));
        store
            .expect_commit_remove()
            .withf(|_, position| position.index() == 2 || position.index() == 0)
            .times(2)
            .returning(|_, _| Ok(CommitOutcome::Committed));

        let manager = PinholeManager::open(Arc::new(store), ManagerConfig::default()).unwrap();
        let report = manager.clean_expired(100).unwrap();

        // Rules on both sides of the missing one were still visited
        assert_eq!(report.removed, 2);
        assert_eq!(report.next_wakeup, None);
    }

    #[test]
    fn test_clean_expired_stale_remove_is_rejection() {
        let mut store = mock_with_open();
        expect_counts(&mut store, &[0, 3, 2]);
        store
            .expect_get_rule()
            .returning(|position| Ok(sweep_rule(position.index())));
        store
            .expect_request_change_ticket()
            .returning(|anchor| Ok(ChangeTicket::new(anchor.name(), Ticket::new(9))));
        let mut outcomes = vec![CommitOutcome::Stale, CommitOutcome::Committed];
        store
            .expect_commit_remove()
            .withf(|_, position| position.index() != 1)
            .times(2)
            .returning(move |_, _| Ok(outcomes.pop().unwrap()));

        let manager = PinholeManager::open(Arc::new(store), ManagerConfig::default()).unwrap();
        let err = manager.clean_expired(100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreRejected);

        // The survivor was never touched and the allocator was left alone
        assert_eq!(manager.allocator().peek(), 1);
    }
}
