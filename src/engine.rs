use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::cache::RecordCache;
use crate::codec::{self, DecodedPacket};
use crate::transport::{DNS_PORT, Transport, TransportError};
use crate::types::{RecordType, ResourceRecord, SearchNode};

/// Cap on consecutive cache-driven CNAME chases for one resolution.
const MAX_INDIRECTIONS: u32 = 10;
/// Datagram sends per query; only a timeout consumes an attempt.
const QUERY_ATTEMPTS: u32 = 2;

/// Observer for the resolution dialogue. Purely informational; implementors
/// must not assume an observation changes the outcome.
pub trait TraceSink: Send + Sync {
    fn on_query(&self, id: u16, node: &SearchNode, server: IpAddr);
    fn on_response(&self, packet: &DecodedPacket);
}

/// Outcome of one leg of the delegation walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Abandon this resolution branch.
    Halt,
    /// The cache moved forward; re-probe it.
    Continue,
}

/// Iterative resolver: walks the delegation hierarchy itself, starting at
/// `root`, caching every record it sees along the way.
pub struct Resolver<T> {
    root: IpAddr,
    cache: Arc<RecordCache>,
    transport: T,
    attempts: u32,
    trace: Option<Arc<dyn TraceSink>>,
}

impl<T: Transport> Resolver<T> {
    pub fn new(root: IpAddr, cache: Arc<RecordCache>, transport: T) -> Self {
        Self {
            root,
            cache,
            transport,
            attempts: QUERY_ATTEMPTS,
            trace: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Resolves `hostname`/`rtype` to its terminal record set. A branch that
    /// halts for any reason yields an empty set, never an error.
    pub async fn resolve(&self, hostname: &str, rtype: RecordType) -> Vec<ResourceRecord> {
        self.search(SearchNode::new(hostname, rtype), 0).await
    }

    fn search(&self, node: SearchNode, indirections: u32) -> BoxFuture<'_, Vec<ResourceRecord>> {
        async move {
            if indirections >= MAX_INDIRECTIONS {
                warn!(node = %node, "maximum indirection depth reached, query cancelled");
                return Vec::new();
            }

            if let Some(hit) = self.result_from_cache(&node) {
                if hit.rtype() == RecordType::CNAME && node.rtype() != RecordType::CNAME {
                    let target = SearchNode::new(hit.host(), node.rtype());
                    return self.search(target, indirections + 1).await;
                }
                return self.cache.lookup(&hit);
            }

            if self.query_server(&node, self.root).await == Step::Halt {
                return Vec::new();
            }

            // The exchange fed the cache; the walk itself restarts clean.
            self.search(node, 0).await
        }
        .boxed()
    }

    /// A node the cache can already answer: `node` itself, or the target of
    /// a CNAME covering its hostname.
    fn result_from_cache(&self, node: &SearchNode) -> Option<SearchNode> {
        if !self.cache.lookup(node).is_empty() {
            return Some(node.clone());
        }

        let alias = SearchNode::new(node.host(), RecordType::CNAME);
        self.cache
            .lookup(&alias)
            .first()
            .map(|record| SearchNode::new(record.text(), RecordType::CNAME))
    }

    fn query_server<'a>(&'a self, node: &'a SearchNode, server: IpAddr) -> BoxFuture<'a, Step> {
        async move {
            match self.query_and_cache(node, server).await {
                Some(nameservers) => self.next_level(node, nameservers).await,
                None => Step::Halt,
            }
        }
        .boxed()
    }

    /// Decides where the walk goes after one exchange handed back the
    /// authority section in `nameservers`.
    async fn next_level(&self, node: &SearchNode, nameservers: Vec<ResourceRecord>) -> Step {
        if self.result_from_cache(node).is_some() {
            return Step::Continue;
        }
        if nameservers.is_empty() {
            debug!(node = %node, "response carried no answer and no referral");
            return Step::Halt;
        }
        if nameservers.iter().any(|r| r.rtype() == RecordType::SOA) {
            debug!(node = %node, "authority section carries an SOA, terminal answer");
            return Step::Halt;
        }

        // Prefer a referral whose address we already know.
        let mut reachable = Vec::new();
        for ns in &nameservers {
            reachable.extend(self.cache.lookup(&SearchNode::new(ns.text(), RecordType::A)));
        }
        if let Some(glue) = reachable.first() {
            return match glue.addr() {
                Some(ip) => self.query_server(node, ip).await,
                None => Step::Halt,
            };
        }

        // No glue: resolve the first referral's own address, then retry.
        let ns = &nameservers[0];
        let found = self.search(SearchNode::new(ns.text(), RecordType::A), 0).await;
        match found.first().and_then(ResourceRecord::addr) {
            Some(ip) => self.query_server(node, ip).await,
            None => Step::Halt,
        }
    }

    /// One query against one server: encode, exchange within the attempt
    /// budget, decode, cache. Returns the authority section, or None when
    /// the branch must halt.
    async fn query_and_cache(&self, node: &SearchNode, server: IpAddr) -> Option<Vec<ResourceRecord>> {
        let (query, id) = codec::encode_query(node.host(), node.rtype());
        let server_addr = SocketAddr::new(server, DNS_PORT);
        let mut attempts = self.attempts;

        while attempts > 0 {
            if let Some(sink) = &self.trace {
                sink.on_query(id, node, server);
            }
            match self.transport.exchange(server_addr, &query).await {
                Ok(response) => return self.decode_and_cache(&response),
                Err(TransportError::TimedOut) => {
                    attempts -= 1;
                    debug!(node = %node, server = %server, attempts_left = attempts, "query timed out");
                }
                Err(err) => {
                    debug!(node = %node, server = %server, error = %err, "transport failure, aborting query");
                    break;
                }
            }
        }

        None
    }

    fn decode_and_cache(&self, response: &[u8]) -> Option<Vec<ResourceRecord>> {
        match codec::decode_response(response) {
            Ok(packet) => {
                debug!(
                    id = packet.id,
                    opcode = packet.opcode,
                    authoritative = packet.flags.authoritative,
                    question = %packet.question.name,
                    "decoded response"
                );
                if let Some(sink) = &self.trace {
                    sink.on_response(&packet);
                }
                for record in packet
                    .answers
                    .iter()
                    .chain(packet.authorities.iter())
                    .chain(packet.additionals.iter())
                {
                    self.cache.insert(record.clone());
                }
                Some(packet.authorities)
            }
            Err(err) => {
                debug!(error = %err, "response rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ROOT: Ipv4Addr = Ipv4Addr::new(198, 41, 0, 4);

    enum Rdata {
        V4(Ipv4Addr),
        Name(&'static str),
    }

    struct Rr {
        host: &'static str,
        type_code: u16,
        ttl: u32,
        rdata: Rdata,
    }

    fn rr(host: &'static str, type_code: u16, ttl: u32, rdata: Rdata) -> Rr {
        Rr { host, type_code, ttl, rdata }
    }

    fn push_name(out: &mut Vec<u8>, name: &str) {
        for label in name.split('.').filter(|label| !label.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    /// Answers `query` with the given sections, echoing id and question.
    fn response(query: &[u8], answers: &[Rr], authorities: &[Rr], additionals: &[Rr]) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(&query[..2]);
        out.extend_from_slice(&0x8400u16.to_be_bytes()); // QR + AA
        out.extend_from_slice(&1u16.to_be_bytes());
        for section in [answers, authorities, additionals] {
            out.extend_from_slice(&(section.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&query[12..]);

        for record in answers.iter().chain(authorities).chain(additionals) {
            push_name(&mut out, record.host);
            out.extend_from_slice(&record.type_code.to_be_bytes());
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&record.ttl.to_be_bytes());
            match &record.rdata {
                Rdata::V4(ip) => {
                    out.extend_from_slice(&4u16.to_be_bytes());
                    out.extend_from_slice(&ip.octets());
                }
                Rdata::Name(name) => {
                    let mut encoded = Vec::new();
                    push_name(&mut encoded, name);
                    out.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
                    out.extend_from_slice(&encoded);
                }
            }
        }

        Bytes::from(out)
    }

    /// Question name of an encoded query, for routing inside handlers.
    fn qname(query: &[u8]) -> String {
        codec::decode_response(query).expect("parse query").question.name
    }

    type Handler = Box<dyn Fn(SocketAddr, &[u8]) -> Result<Bytes, TransportError> + Send + Sync>;

    struct ScriptedTransport {
        handler: Handler,
    }

    impl ScriptedTransport {
        fn new(
            handler: impl Fn(SocketAddr, &[u8]) -> Result<Bytes, TransportError> + Send + Sync + 'static,
        ) -> Self {
            Self { handler: Box::new(handler) }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn exchange(&self, server: SocketAddr, query: &[u8]) -> Result<Bytes, TransportError> {
            (self.handler)(server, query)
        }
    }

    fn resolver(
        cache: Arc<RecordCache>,
        handler: impl Fn(SocketAddr, &[u8]) -> Result<Bytes, TransportError> + Send + Sync + 'static,
    ) -> Resolver<ScriptedTransport> {
        Resolver::new(IpAddr::V4(ROOT), cache, ScriptedTransport::new(handler))
    }

    #[tokio::test]
    async fn direct_answer_is_cached_and_returned() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let resolver = resolver(cache.clone(), move |_, query| {
            counted.fetch_add(1, Ordering::Relaxed);
            Ok(response(
                query,
                &[rr("example.com", 1, 300, Rdata::V4(Ipv4Addr::new(93, 184, 216, 34)))],
                &[],
                &[],
            ))
        });

        let records = resolver.resolve("example.com", RecordType::A).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr(), Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(
            cache.lookup(&SearchNode::new("example.com", RecordType::A)).len(),
            1
        );
    }

    #[tokio::test]
    async fn referral_with_glue_reaches_the_authoritative_server() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let child = Ipv4Addr::new(203, 0, 113, 5);
        let resolver = resolver(cache.clone(), move |server, query| {
            counted.fetch_add(1, Ordering::Relaxed);
            if server.ip() == IpAddr::V4(ROOT) {
                Ok(response(
                    query,
                    &[],
                    &[rr("com", 2, 172_800, Rdata::Name("a.gtld-servers.net"))],
                    &[rr("a.gtld-servers.net", 1, 172_800, Rdata::V4(child))],
                ))
            } else {
                assert_eq!(server.ip(), IpAddr::V4(child));
                Ok(response(
                    query,
                    &[rr("example.com", 1, 300, Rdata::V4(Ipv4Addr::new(93, 184, 216, 34)))],
                    &[],
                    &[],
                ))
            }
        });

        let records = resolver.resolve("example.com.", RecordType::A).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr(), Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        // the walk left its tracks: referral NS, its glue, the final answer
        assert_eq!(cache.lookup(&SearchNode::new("com.", RecordType::NS)).len(), 1);
        assert_eq!(
            cache.lookup(&SearchNode::new("a.gtld-servers.net", RecordType::A)).len(),
            1
        );
        assert_eq!(
            cache.lookup(&SearchNode::new("example.com.", RecordType::A)).len(),
            1
        );
    }

    #[tokio::test]
    async fn glueless_referral_resolves_the_nameserver_first() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let child = Ipv4Addr::new(203, 0, 113, 9);
        let resolver = resolver(cache.clone(), move |server, query| {
            counted.fetch_add(1, Ordering::Relaxed);
            match (server.ip(), qname(query).as_str()) {
                (ip, "example.net") if ip == IpAddr::V4(ROOT) => Ok(response(
                    query,
                    &[],
                    &[rr("net", 2, 86_400, Rdata::Name("ns1.gtld.test"))],
                    &[],
                )),
                (ip, "ns1.gtld.test") if ip == IpAddr::V4(ROOT) => Ok(response(
                    query,
                    &[rr("ns1.gtld.test", 1, 86_400, Rdata::V4(child))],
                    &[],
                    &[],
                )),
                (ip, "example.net") if ip == IpAddr::V4(child) => Ok(response(
                    query,
                    &[rr("example.net", 1, 60, Rdata::V4(Ipv4Addr::new(192, 0, 2, 80)))],
                    &[],
                    &[],
                )),
                other => panic!("unexpected query {other:?}"),
            }
        });

        let records = resolver.resolve("example.net", RecordType::A).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr(), Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 80))));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn soa_authority_terminates_with_no_further_queries() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let resolver = resolver(cache, move |_, query| {
            counted.fetch_add(1, Ordering::Relaxed);
            Ok(response(
                query,
                &[],
                &[rr("example.com", 6, 900, Rdata::Name("ns.icann.org"))],
                &[],
            ))
        });

        let records = resolver.resolve("missing.example.com", RecordType::A).await;
        assert!(records.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn name_error_rcode_halts_and_caches_nothing() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let resolver = resolver(cache.clone(), move |_, query| {
            counted.fetch_add(1, Ordering::Relaxed);
            let mut out = Vec::new();
            out.extend_from_slice(&query[..2]);
            out.extend_from_slice(&0x8403u16.to_be_bytes()); // QR + AA + rcode 3
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
            Ok(Bytes::from(out))
        });

        let records = resolver.resolve("nope.example", RecordType::A).await;
        assert!(records.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(cache.lookup(&SearchNode::new("nope.example", RecordType::A)).is_empty());
        assert!(cache.lookup(&SearchNode::new("nope.example", RecordType::CNAME)).is_empty());
    }

    #[tokio::test]
    async fn empty_response_is_a_dead_end() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let resolver = resolver(cache, move |_, query| {
            counted.fetch_add(1, Ordering::Relaxed);
            Ok(response(query, &[], &[], &[]))
        });

        let records = resolver.resolve("example.org", RecordType::A).await;
        assert!(records.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn timeout_spends_exactly_two_attempts() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let resolver = resolver(cache, move |_, _| {
            counted.fetch_add(1, Ordering::Relaxed);
            Err(TransportError::TimedOut)
        });

        let records = resolver.resolve("example.com", RecordType::A).await;
        assert!(records.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn io_error_aborts_without_retry() {
        let cache = Arc::new(RecordCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let resolver = resolver(cache, move |_, _| {
            counted.fetch_add(1, Ordering::Relaxed);
            Err(TransportError::Io(io::Error::new(
                io::ErrorKind::NetworkUnreachable,
                "no route",
            )))
        });

        let records = resolver.resolve("example.com", RecordType::A).await;
        assert!(records.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cname_chain_is_capped_at_ten_chases() {
        let cache = Arc::new(RecordCache::new());
        // Eleven cached links: h0 -> h1 -> ... -> h11.
        for i in 0..=MAX_INDIRECTIONS {
            cache.insert(ResourceRecord::text_record(
                &format!("h{i}.test"),
                RecordType::CNAME.code(),
                600,
                format!("h{}.test", i + 1),
            ));
        }
        let resolver = resolver(cache, |_, _| panic!("chase must stay in the cache"));

        let records = resolver.resolve("h0.test", RecordType::A).await;
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn short_cname_chain_lands_on_the_address() {
        let cache = Arc::new(RecordCache::new());
        cache.insert(ResourceRecord::text_record(
            "www.example.com",
            RecordType::CNAME.code(),
            600,
            "example.com",
        ));
        cache.insert(ResourceRecord::address_record(
            "example.com",
            RecordType::A.code(),
            600,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 44)),
        ));
        let resolver = resolver(cache, |_, _| panic!("everything needed is cached"));

        let records = resolver.resolve("www.example.com", RecordType::A).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr(), Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 44))));
    }
}
