//! Firewall rule representation
//!
//! A [`RuleSpec`] is what gets committed to a rule store; a [`RuleView`] is what
//! comes back when enumerating an anchor (the rule plus the counters the store
//! keeps for it). Rules in an anchor may have been written by an operator or by
//! other tooling, so every field allows values the pinhole manager never creates
//! itself (IPv4 addresses, masks, port ranges, outbound rules).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// IANA protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// IANA protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Packet direction a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    Both,
}

/// What a rule does with matching packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Pass,
    Block,
}

/// Address family restriction of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Any,
    Inet,
    Inet6,
}

/// Address part of a rule endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAddr {
    /// No address constraint
    Any,
    /// Address with a prefix length (128 for a single IPv6 host)
    Masked { addr: IpAddr, prefix_len: u8 },
}

impl RuleAddr {
    /// Exact single-host match with a full mask
    pub fn host(addr: Ipv6Addr) -> Self {
        RuleAddr::Masked {
            addr: IpAddr::V6(addr),
            prefix_len: 128,
        }
    }

    /// The address if this is a single-host IPv6 match
    pub fn as_host(&self) -> Option<Ipv6Addr> {
        match self {
            RuleAddr::Masked {
                addr: IpAddr::V6(addr),
                prefix_len: 128,
            } => Some(*addr),
            _ => None,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, RuleAddr::Any)
    }
}

impl fmt::Display for RuleAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAddr::Any => write!(f, "any"),
            RuleAddr::Masked { addr, prefix_len } => match (addr, prefix_len) {
                (IpAddr::V6(_), 128) | (IpAddr::V4(_), 32) => write!(f, "{}", addr),
                _ => write!(f, "{}/{}", addr, prefix_len),
            },
        }
    }
}

/// Port part of a rule endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortMatch {
    Any,
    Eq(u16),
    /// Inclusive range, only ever seen on foreign rules
    Range { low: u16, high: u16 },
}

impl PortMatch {
    /// Port 0 means "any port" on the wire of the remote-control protocols
    pub fn from_port(port: u16) -> Self {
        if port == 0 {
            PortMatch::Any
        } else {
            PortMatch::Eq(port)
        }
    }

    /// Single port of an `=` match, 0 for anything else
    pub fn port(&self) -> u16 {
        match self {
            PortMatch::Eq(port) => *port,
            _ => 0,
        }
    }
}

/// Source or destination side of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEndpoint {
    pub addr: RuleAddr,
    pub port: PortMatch,
}

impl RuleEndpoint {
    pub fn any() -> Self {
        Self {
            addr: RuleAddr::Any,
            port: PortMatch::Any,
        }
    }
}

impl fmt::Display for RuleEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            PortMatch::Any => write!(f, "{}", self.addr),
            PortMatch::Eq(port) => write!(f, "{} port = {}", self.addr, port),
            PortMatch::Range { low, high } => write!(f, "{} port {}:{}", self.addr, low, high),
        }
    }
}

/// TCP flag check (`flags <flags>/<mask>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags {
    pub flags: u8,
    pub mask: u8,
}

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const ACK: u8 = 0x10;

    /// `flags S/SA`: only a connection-opening segment creates state
    pub fn syn_only() -> Self {
        Self {
            flags: Self::SYN,
            mask: Self::SYN | Self::ACK,
        }
    }
}

/// A rule as submitted to a rule store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub direction: Direction,
    pub action: RuleAction,
    /// First match wins (`quick`)
    pub quick: bool,
    pub family: AddressFamily,
    /// IANA protocol number, 0 for any
    pub protocol: u8,
    pub interface: Option<String>,
    pub src: RuleEndpoint,
    pub dst: RuleEndpoint,
    /// Stateful tracking (`keep state`)
    pub keep_state: bool,
    pub tcp_flags: Option<TcpFlags>,
    pub log: bool,
    pub queue: Option<String>,
    pub tag: Option<String>,
    pub label: String,
}

impl RuleSpec {
    /// A `pass in` rule matching anything, to be narrowed by the caller
    pub fn pass_in() -> Self {
        Self {
            direction: Direction::In,
            action: RuleAction::Pass,
            quick: false,
            family: AddressFamily::Any,
            protocol: 0,
            interface: None,
            src: RuleEndpoint::any(),
            dst: RuleEndpoint::any(),
            keep_state: false,
            tcp_flags: None,
            log: false,
            queue: None,
            tag: None,
            label: String::new(),
        }
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RuleAction::Pass => "pass",
            RuleAction::Block => "block",
        };
        let direction = match self.direction {
            Direction::In => " in",
            Direction::Out => " out",
            Direction::Both => "",
        };
        write!(f, "{}{}", action, direction)?;
        if self.log {
            write!(f, " log")?;
        }
        if self.quick {
            write!(f, " quick")?;
        }
        if let Some(interface) = &self.interface {
            write!(f, " on {}", interface)?;
        }
        match self.family {
            AddressFamily::Inet => write!(f, " inet")?,
            AddressFamily::Inet6 => write!(f, " inet6")?,
            AddressFamily::Any => {}
        }
        match self.protocol {
            0 => {}
            IPPROTO_TCP => write!(f, " proto tcp")?,
            IPPROTO_UDP => write!(f, " proto udp")?,
            other => write!(f, " proto {}", other)?,
        }
        write!(f, " from {} to {}", self.src, self.dst)?;
        if let Some(flags) = self.tcp_flags {
            if flags == TcpFlags::syn_only() {
                write!(f, " flags S/SA")?;
            } else {
                write!(f, " flags {:#04x}/{:#04x}", flags.flags, flags.mask)?;
            }
        }
        if self.keep_state {
            write!(f, " keep state")?;
        }
        if let Some(queue) = &self.queue {
            write!(f, " queue {}", queue)?;
        }
        if let Some(tag) = &self.tag {
            write!(f, " tag {}", tag)?;
        }
        if !self.label.is_empty() {
            write!(f, " label \"{}\"", self.label)?;
        }
        Ok(())
    }
}

/// Per-direction packet and byte counters kept by the store for a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounters {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl RuleCounters {
    pub fn total_packets(&self) -> u64 {
        self.packets_in.saturating_add(self.packets_out)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}

/// A rule as read back from a rule store enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleView {
    pub rule: RuleSpec,
    #[serde(default)]
    pub counters: RuleCounters,
}

impl RuleView {
    pub fn label(&self) -> &str {
        &self.rule.label
    }
}
