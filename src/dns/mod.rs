// DNS naming and transport for the tunnel
//
// Upstream tunnel packets ride in base32 labels of TXT queries under the
// tunnel domain; downstream packets come back in TXT answers.

pub mod message;
pub mod packet_conn;

pub use message::{DnsMessage, DnsQuestion, DnsRecord};
pub use packet_conn::{ClientId, DnsPacketConn};

use std::fmt;
use thiserror::Error;

/// Maximum length of a single DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum encoded length of a DNS name, including length octets and the
/// terminating root label
pub const MAX_NAME_LEN: usize = 255;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("name contains a zero-length label")]
    EmptyLabel,

    #[error("label too long: {0} bytes")]
    LabelTooLong(usize),

    #[error("name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("Invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("Packet too large: {0} bytes (max: {1})")]
    PacketTooLarge(usize, usize),
}

pub type Result<T> = std::result::Result<T, DnsError>;

/// A structured domain name: a sequence of labels, most specific first.
///
/// The empty sequence is the root name.
#[derive(Debug, Clone, Default)]
pub struct DomainName {
    labels: Vec<Vec<u8>>,
}

impl DomainName {
    /// Build a name from labels, checking label and total length limits.
    pub fn from_labels(labels: Vec<Vec<u8>>) -> Result<Self> {
        let mut encoded_len = 1; // root terminator
        for label in &labels {
            if label.is_empty() {
                return Err(DnsError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(DnsError::LabelTooLong(label.len()));
            }
            encoded_len += label.len() + 1;
        }
        if encoded_len > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong(encoded_len));
        }
        Ok(Self { labels })
    }

    /// Parse a dotted name such as `t.example.com` or `t.example.com.`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Self::default());
        }
        Self::from_labels(s.split('.').map(|l| l.as_bytes().to_vec()).collect())
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Length of the name in wire format (without compression).
    pub fn encoded_len(&self) -> usize {
        1 + self.labels.iter().map(|l| l.len() + 1).sum::<usize>()
    }

    /// If `suffix` is a suffix of this name (ASCII case-insensitive), return
    /// the labels that precede it.
    pub fn trim_suffix(&self, suffix: &DomainName) -> Option<&[Vec<u8>]> {
        if suffix.labels.len() > self.labels.len() {
            return None;
        }
        let split = self.labels.len() - suffix.labels.len();
        let matches = self.labels[split..]
            .iter()
            .zip(&suffix.labels)
            .all(|(a, b)| a.eq_ignore_ascii_case(b));
        matches.then(|| &self.labels[..split])
    }

    /// A new name with `prefix` labels prepended to this one.
    pub fn with_prefix(&self, prefix: Vec<Vec<u8>>) -> Result<Self> {
        let mut labels = prefix;
        labels.extend(self.labels.iter().cloned());
        Self::from_labels(labels)
    }
}

impl PartialEq for DomainName {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len() && self.trim_suffix(other).is_some()
    }
}

impl Eq for DomainName {}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&String::from_utf8_lossy(label))?;
        }
        Ok(())
    }
}

/// Number of payload bytes that fit into the labels of a DNS name ending in
/// `domain`, once base32-encoded and split into 63-byte labels.
pub fn name_capacity(domain: &DomainName) -> usize {
    // 255 total, minus the root terminator, minus the suffix labels
    let mut capacity = MAX_NAME_LEN as isize - 1;
    for label in domain.labels() {
        capacity -= label.len() as isize + 1;
    }
    if capacity <= 0 {
        return 0;
    }
    let capacity = capacity as usize;
    // each 63-byte label costs 64 bytes with its length octet
    let capacity = capacity * MAX_LABEL_LEN / (MAX_LABEL_LEN + 1);
    // base32 expands 5 bytes to 8
    capacity * 5 / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain() {
        let name = DomainName::parse("t.example.com.").unwrap();
        assert_eq!(name.labels().len(), 3);
        assert_eq!(name.to_string(), "t.example.com");
        assert_eq!(name.encoded_len(), 15);
    }

    #[test]
    fn test_parse_root() {
        assert!(DomainName::parse("").unwrap().is_root());
        assert!(DomainName::parse(".").unwrap().is_root());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            DomainName::parse("a..b"),
            Err(DnsError::EmptyLabel)
        ));
        let long_label = "x".repeat(64);
        assert!(matches!(
            DomainName::parse(&long_label),
            Err(DnsError::LabelTooLong(64))
        ));
        let long_name = vec!["y".repeat(63); 4].join(".");
        assert!(matches!(
            DomainName::parse(&long_name),
            Err(DnsError::NameTooLong(257))
        ));
    }

    #[test]
    fn test_trim_suffix_case_insensitive() {
        let suffix = DomainName::parse("T.Example.COM").unwrap();
        let name = DomainName::parse("abc.def.t.example.com").unwrap();
        let prefix = name.trim_suffix(&suffix).unwrap();
        assert_eq!(prefix, &[b"abc".to_vec(), b"def".to_vec()]);

        let other = DomainName::parse("abc.example.org").unwrap();
        assert!(other.trim_suffix(&suffix).is_none());
        assert_eq!(suffix, DomainName::parse("t.example.com").unwrap());
    }

    #[test]
    fn test_name_capacity() {
        // 255 - 1 - 14 = 240; 240 * 63 / 64 = 236; 236 * 5 / 8 = 147
        let name = DomainName::parse("t.example.com").unwrap();
        assert_eq!(name_capacity(&name), 147);

        // root leaves the whole name: 254 * 63 / 64 = 250; 250 * 5 / 8 = 156
        assert_eq!(name_capacity(&DomainName::default()), 156);
    }

    #[test]
    fn test_name_capacity_shrinks_with_suffix() {
        let short = DomainName::parse("t.co").unwrap();
        let long = DomainName::parse(&format!("{}.example.com", "z".repeat(60))).unwrap();
        assert!(name_capacity(&long) < name_capacity(&short));
    }
}
