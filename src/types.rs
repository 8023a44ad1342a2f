use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Record types the resolver understands. Anything else decodes to `OTHER`;
/// the raw wire code is kept on the record for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    MX,
    AAAA,
    OTHER,
}

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::MX => 15,
            RecordType::AAAA => 28,
            RecordType::OTHER => 0,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            15 => RecordType::MX,
            28 => RecordType::AAAA,
            _ => RecordType::OTHER,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::A => "A",
            RecordType::NS => "NS",
            RecordType::CNAME => "CNAME",
            RecordType::SOA => "SOA",
            RecordType::MX => "MX",
            RecordType::AAAA => "AAAA",
            RecordType::OTHER => "OTHER",
        };
        f.pad(name)
    }
}

/// What is being resolved: a hostname plus a record type. This is the cache
/// key. Comparison and hashing are case-insensitive on the hostname and
/// ignore surrounding whitespace and a single trailing dot, so a query for
/// "Example.COM." matches records cached under "example.com"; the caller's
/// spelling is preserved for display.
#[derive(Debug, Clone)]
pub struct SearchNode {
    host: String,
    rtype: RecordType,
}

impl SearchNode {
    pub fn new(host: impl Into<String>, rtype: RecordType) -> Self {
        Self { host: host.into(), rtype }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn rtype(&self) -> RecordType {
        self.rtype
    }

    fn key_host(&self) -> &str {
        let trimmed = self.host.trim();
        trimmed.strip_suffix('.').unwrap_or(trimmed)
    }

    fn key_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.key_host().bytes().map(|b| b.to_ascii_lowercase())
    }
}

impl PartialEq for SearchNode {
    fn eq(&self, other: &Self) -> bool {
        self.rtype == other.rtype && self.key_host().eq_ignore_ascii_case(other.key_host())
    }
}

impl Eq for SearchNode {}

impl Hash for SearchNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.key_bytes() {
            state.write_u8(b);
        }
        self.rtype.hash(state);
    }
}

impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_bytes()
            .cmp(other.key_bytes())
            .then(self.rtype.cmp(&other.rtype))
    }
}

impl fmt::Display for SearchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host, self.rtype)
    }
}

/// One cached DNS fact. Equality and hashing cover the node and the payload
/// but not the expiration, so two sightings of the same fact dedup and the
/// later expiry wins in the cache.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    node: SearchNode,
    type_code: u16,
    expires_at: Instant,
    text: String,
    addr: Option<IpAddr>,
}

impl ResourceRecord {
    pub fn text_record(host: &str, type_code: u16, ttl_secs: u64, text: impl Into<String>) -> Self {
        Self {
            node: SearchNode::new(host, RecordType::from_code(type_code)),
            type_code,
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            text: text.into(),
            addr: None,
        }
    }

    pub fn address_record(host: &str, type_code: u16, ttl_secs: u64, addr: IpAddr) -> Self {
        Self {
            node: SearchNode::new(host, RecordType::from_code(type_code)),
            type_code,
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            text: addr.to_string(),
            addr: Some(addr),
        }
    }

    pub fn node(&self) -> &SearchNode {
        &self.node
    }

    pub fn host(&self) -> &str {
        self.node.host()
    }

    pub fn rtype(&self) -> RecordType {
        self.node.rtype()
    }

    /// Wire type for display; differs from `rtype().code()` only for OTHER.
    pub fn type_label(&self) -> String {
        match self.rtype() {
            RecordType::OTHER => self.type_code.to_string(),
            known => known.to_string(),
        }
    }

    /// Remaining TTL in whole seconds, rounded up. Zero once expired.
    pub fn ttl(&self) -> u64 {
        let remaining = self.expires_at.saturating_duration_since(Instant::now());
        (remaining.as_millis() as u64 + 999) / 1000
    }

    pub fn is_still_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }

    pub fn expires_before(&self, other: &ResourceRecord) -> bool {
        self.expires_at < other.expires_at
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn addr(&self) -> Option<IpAddr> {
        self.addr
    }
}

impl PartialEq for ResourceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.text == other.text && self.addr == other.addr
    }
}

impl Eq for ResourceRecord {}

impl Hash for ResourceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state);
        self.text.hash(state);
        self.addr.hash(state);
    }
}
