//! Pinhole label codec
//!
//! Rule stores have no notion of a pinhole id or an expiry; the only free-form
//! metadata a rule carries is a short label. Pinholes are recognised by labels
//! of the form:
//!
//! ```text
//! pinhole-<id> ts-<timestamp>: <description>
//! ```
//!
//! Any label that does not have this shape belongs to someone else (an operator
//! rule, another tool) and decodes to `None`.

use tracing::trace;

/// First token of every pinhole label, followed by the decimal id
pub const LABEL_ID_PREFIX: &str = "pinhole-";

const TIMESTAMP_PREFIX: &str = "ts-";

/// pf keeps labels in a 64 byte buffer including the terminating NUL
pub const DEFAULT_LABEL_CAPACITY: usize = 63;

/// Metadata decoded from a pinhole label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinholeLabel {
    pub id: u16,
    /// Expiry, seconds since the epoch
    pub timestamp: u32,
    pub description: String,
}

/// Encodes and decodes pinhole labels within a fixed byte capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelCodec {
    capacity: usize,
}

impl Default for LabelCodec {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL_CAPACITY)
    }
}

impl LabelCodec {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Build the label for a pinhole
    ///
    /// The `pinhole-<id> ts-<timestamp>: ` prefix is always kept whole; the
    /// description is cut (on a character boundary) to fit what remains.
    pub fn encode(&self, id: u16, timestamp: u32, description: &str) -> String {
        let mut label = format!("{}{} {}{}: ", LABEL_ID_PREFIX, id, TIMESTAMP_PREFIX, timestamp);
        let room = self.capacity.saturating_sub(label.len());
        label.push_str(truncate_to_boundary(description, room));
        label
    }

    /// Decode a full pinhole label, `None` if the label is not a pinhole's
    pub fn decode(&self, label: &str) -> Option<PinholeLabel> {
        let rest = label.strip_prefix(LABEL_ID_PREFIX)?;
        let (id_token, rest) = rest.split_once(' ')?;
        let id = parse_id(id_token)?;

        let rest = rest.strip_prefix(TIMESTAMP_PREFIX)?;
        let (ts_token, rest) = rest.split_once(':')?;
        let timestamp = match ts_token.parse::<u32>() {
            Ok(ts) => ts,
            Err(_) => {
                trace!("Label '{}' has a malformed timestamp", label);
                return None;
            }
        };

        let description = rest.strip_prefix(' ').unwrap_or(rest).to_string();

        Some(PinholeLabel {
            id,
            timestamp,
            description,
        })
    }

    /// Read only the id from the first token of a label
    ///
    /// Cheaper than [`LabelCodec::decode`]: the timestamp is not looked at.
    pub fn decode_id_prefix(&self, label: &str) -> Option<u16> {
        let first = label.split(char::is_whitespace).next()?;
        parse_id(first.strip_prefix(LABEL_ID_PREFIX)?)
    }
}

fn parse_id(token: &str) -> Option<u16> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match token.parse::<u16>() {
        Ok(id) if (crate::MIN_PINHOLE_ID..=crate::MAX_PINHOLE_ID).contains(&id) => Some(id),
        _ => None,
    }
}

fn truncate_to_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
