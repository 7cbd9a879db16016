//! The query engine: answers one question per invocation.
//!
//! Control flow for a question: minimal-ANY short-circuit, positive-cache
//! probe, zone selection by longest suffix, then either the in-zone
//! resolution loop or (for out-of-authority names, when enabled) the
//! iterative resolver. Outcomes feed the caches on the way out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use smartdns_cache::ResponseCache;
use smartdns_metrics::metrics;
use smartdns_resolver::IterativeResolver;
use smartdns_zone::{RecordKind, ZoneError, ZoneIndex, ZoneStore};
use tracing::{debug, warn};

use crate::handler::{QueryContext, QueryHandler};

/// CNAME chains longer than this answer ServFail.
const MAX_CNAME_CHAIN: usize = 8;

/// The authoritative query engine.
///
/// Holds shared handles to the zone store and response cache, plus the
/// optional iterative resolver for names outside every local zone. The
/// engine itself is stateless per query and never mutates zone data.
pub struct QueryEngine {
    store: Arc<ZoneStore>,
    cache: Arc<ResponseCache<Message>>,
    resolver: Option<Arc<IterativeResolver>>,
}

/// Result of the in-zone resolution loop.
struct LookupOutcome {
    answers: Vec<Record>,
    additionals: Vec<Record>,
    rcode: ResponseCode,
}

impl LookupOutcome {
    fn positive(answers: Vec<Record>, additionals: Vec<Record>) -> Self {
        Self {
            answers,
            additionals,
            rcode: ResponseCode::NoError,
        }
    }

    fn negative(rcode: ResponseCode) -> Self {
        Self {
            answers: Vec::new(),
            additionals: Vec::new(),
            rcode,
        }
    }
}

impl QueryEngine {
    /// Creates an engine over the given store and cache. Passing a
    /// resolver enables iterative resolution for out-of-authority names.
    pub fn new(
        store: Arc<ZoneStore>,
        cache: Arc<ResponseCache<Message>>,
        resolver: Option<Arc<IterativeResolver>>,
    ) -> Self {
        Self {
            store,
            cache,
            resolver,
        }
    }

    fn reply_to(&self, request: &Message, question: &Query) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(request.op_code());
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(false);
        response.add_query(question.clone());
        response
    }

    fn answer_any(&self, request: &Message, question: &Query, qname: &str) -> Message {
        // Minimal-ANY: never enumerate RRsets. The SOA of the enclosing
        // zone (if any) goes to authority, even off-apex.
        let mut response = self.reply_to(request, question);
        response.set_authoritative(true);
        if let Some((zone, _)) = self.store.get_zone_for_name(qname) {
            match zone.soa_record() {
                Ok(soa) => {
                    response.add_name_server(soa);
                }
                Err(e) => warn!(zone = %zone.zone_fqdn, error = %e, "bad SOA data"),
            }
        }
        response
    }

    /// The in-zone resolution loop: exact/wildcard match, CNAME chasing
    /// with loop detection, then the NODATA/NXDOMAIN decision against the
    /// original qname.
    fn resolve_in_zone(
        &self,
        zone: &ZoneIndex,
        qname: &str,
        qname_wire: &Name,
        qtype: RecordType,
    ) -> Result<LookupOutcome, ZoneError> {
        // The SOA exists implicitly at the apex.
        if qtype == RecordType::SOA && qname == zone.zone_fqdn {
            let answers = vec![zone.soa_record()?];
            return Ok(LookupOutcome::positive(answers, Vec::new()));
        }

        let kind = RecordKind::from_rtype(qtype);
        let mut answers: Vec<Record> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut cur = qname.to_string();

        for _ in 0..MAX_CNAME_CHAIN {
            if let Some(kind) = kind {
                if let Some(rrset) = zone.find_rrset(&cur, kind) {
                    let owner = owner_name(&cur, qname, qname_wire)?;
                    let records = rrset.to_records(&owner)?;
                    let additionals = self.collect_additionals(zone, &records)?;
                    answers.extend(records);
                    return Ok(LookupOutcome::positive(answers, additionals));
                }
            }

            if visited.contains(&cur) {
                debug!(qname, "CNAME loop detected");
                return Ok(LookupOutcome::negative(ResponseCode::ServFail));
            }
            visited.insert(cur.clone());

            match zone.find_rrset(&cur, RecordKind::Cname) {
                Some(rrset) => {
                    let Some(target) = rrset.cname_target() else {
                        break;
                    };
                    let target = target.to_ascii_lowercase();
                    let owner = owner_name(&cur, qname, qname_wire)?;
                    answers.extend(rrset.to_records(&owner)?);
                    cur = target;
                }
                None => break,
            }
        }

        // The chain dead-ended: answers collected so far are discarded and
        // the caller attaches the SOA.
        if zone.contains_name(qname) || zone.has_wildcard_candidate(qname) {
            Ok(LookupOutcome::negative(ResponseCode::NoError))
        } else {
            Ok(LookupOutcome::negative(ResponseCode::NXDomain))
        }
    }

    /// Glue for MX and NS answers: A and AAAA RRsets of the referenced
    /// host, looked up within the same zone only. Duplicates suppressed.
    fn collect_additionals(
        &self,
        zone: &ZoneIndex,
        answers: &[Record],
    ) -> Result<Vec<Record>, ZoneError> {
        let mut additionals = Vec::new();
        let mut seen: HashSet<(String, RecordKind)> = HashSet::new();
        for record in answers {
            let host = match record.data() {
                Some(RData::MX(mx)) => mx.exchange().to_string(),
                Some(RData::NS(ns)) => ns.0.to_string(),
                _ => continue,
            };
            let host = host.to_ascii_lowercase();
            let Some(node) = zone.node(&host) else {
                continue;
            };
            for kind in [RecordKind::A, RecordKind::Aaaa] {
                if let Some(rrset) = node.get(&kind) {
                    if seen.insert((host.clone(), kind)) {
                        additionals.extend(rrset.to_records(&Name::from_ascii(&host)?)?);
                    }
                }
            }
        }
        Ok(additionals)
    }
}

/// Owner name for an answer record: the wire qname (case preserved) while
/// the chain is still at the original name, the chased name afterwards.
fn owner_name(cur: &str, qname: &str, qname_wire: &Name) -> Result<Name, ZoneError> {
    if cur == qname {
        Ok(qname_wire.clone())
    } else {
        Ok(Name::from_ascii(cur)?)
    }
}

fn lowercase_fqdn(name: &Name) -> String {
    let mut s = name.to_string().to_ascii_lowercase();
    if !s.ends_with('.') {
        s.push('.');
    }
    s
}

#[async_trait]
impl QueryHandler for QueryEngine {
    async fn handle(&self, query: Message, _context: QueryContext) -> Option<Message> {
        metrics().record_request();

        let Some(question) = query.queries().first().cloned() else {
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(query.op_code());
            response.set_response_code(ResponseCode::FormErr);
            return Some(response);
        };

        let qname_wire = question.name().clone();
        let qname = lowercase_fqdn(&qname_wire);
        let qtype = question.query_type();

        if qtype == RecordType::ANY {
            return Some(self.answer_any(&query, &question, &qname));
        }

        if let Some(mut cached) = self.cache.get_positive(&qname, qtype) {
            metrics().record_cache_hit();
            cached.set_id(query.id());
            cached.set_recursion_available(false);
            return Some(cached);
        }
        metrics().record_cache_miss();

        let Some((zone, _)) = self.store.get_zone_for_name(&qname) else {
            if let Some(resolver) = &self.resolver {
                return match resolver.resolve(&qname, qtype).await {
                    Some((mut reply, ttl)) => {
                        reply.set_id(query.id());
                        if reply.response_code() == ResponseCode::NoError
                            && (!reply.answers().is_empty() || !reply.name_servers().is_empty())
                        {
                            self.cache.put_positive(
                                &qname,
                                qtype,
                                reply.clone(),
                                Duration::from_secs(u64::from(ttl)),
                            );
                        } else {
                            // Negative upstream results are remembered
                            // under the reply's minimum TTL.
                            self.cache.put_negative(
                                &qname,
                                qtype,
                                reply.response_code(),
                                Duration::from_secs(u64::from(ttl)),
                            );
                        }
                        Some(reply)
                    }
                    // Soft failure: no response at all, the client times
                    // out and retries elsewhere.
                    None => None,
                };
            }
            let mut response = self.reply_to(&query, &question);
            response.set_authoritative(true);
            response.set_response_code(ResponseCode::NXDomain);
            return Some(response);
        };

        let mut response = self.reply_to(&query, &question);
        response.set_authoritative(true);

        match self.resolve_in_zone(&zone, &qname, &qname_wire, qtype) {
            Ok(outcome) => {
                response.set_response_code(outcome.rcode);
                let positive = outcome.rcode == ResponseCode::NoError && !outcome.answers.is_empty();
                for record in outcome.answers {
                    response.add_answer(record);
                }
                for record in outcome.additionals {
                    response.add_additional(record);
                }
                if positive {
                    let ttl = response.answers().iter().map(Record::ttl).min().unwrap_or(0);
                    self.cache.put_positive(
                        &qname,
                        qtype,
                        response.clone(),
                        Duration::from_secs(u64::from(ttl)),
                    );
                } else {
                    // NODATA and error rcodes alike are negative: remember
                    // them for negative_ttl and attach the SOA.
                    self.cache.put_negative(
                        &qname,
                        qtype,
                        outcome.rcode,
                        Duration::from_secs(u64::from(zone.soa.negative_ttl)),
                    );
                    match zone.soa_record() {
                        Ok(soa) => {
                            response.add_name_server(soa);
                        }
                        Err(e) => warn!(zone = %zone.zone_fqdn, error = %e, "bad SOA data"),
                    }
                }
            }
            Err(e) => {
                warn!(qname, error = %e, "in-zone resolution failed");
                response.set_response_code(ResponseCode::ServFail);
            }
        }
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Protocol;
    use smartdns_zone::ZoneFile;

    fn test_zone() -> Arc<ZoneIndex> {
        let zf: ZoneFile = serde_json::from_value(serde_json::json!({
            "zone": "example.com",
            "serial": 11,
            "ttl_default": 600,
            "soa": {
                "mname": "ns1.example.com.",
                "rname": "hostmaster.example.com.",
                "refresh": 3600,
                "retry": 600,
                "expire": 604800,
                "negative_ttl": 120
            },
            "ns": ["ns1.example.com."],
            "records": [
                {"name": "@", "type": "A", "values": ["192.0.2.10"]},
                {"name": "ns1", "type": "A", "values": ["192.0.2.1"]},
                {"name": "www", "type": "CNAME", "value": "@"},
                {"name": "loop-a", "type": "CNAME", "value": "loop-b"},
                {"name": "loop-b", "type": "CNAME", "value": "loop-a"},
                {"name": "text", "type": "TXT", "values": ["v=1"]}
            ]
        }))
        .unwrap();
        Arc::new(zf.to_index().unwrap())
    }

    fn engine() -> QueryEngine {
        let store = Arc::new(ZoneStore::new());
        store.swap_zone(test_zone());
        QueryEngine::new(store, Arc::new(ResponseCache::new(64)), None)
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut message = Message::new();
        message.set_id(0x4242);
        message.set_message_type(MessageType::Query);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        message
    }

    fn ctx() -> QueryContext {
        QueryContext::new("127.0.0.1:53000".parse().unwrap(), Protocol::Udp)
    }

    #[tokio::test]
    async fn empty_question_is_formerr() {
        let engine = engine();
        let mut message = Message::new();
        message.set_id(9);
        let response = engine.handle(message, ctx()).await.unwrap();
        assert_eq!(response.response_code(), ResponseCode::FormErr);
        assert_eq!(response.id(), 9);
    }

    #[tokio::test]
    async fn cname_chain_is_followed() {
        let engine = engine();
        let response = engine
            .handle(query("www.example.com.", RecordType::A), ctx())
            .await
            .unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());
        let answers = response.answers();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].record_type(), RecordType::CNAME);
        assert_eq!(answers[0].name().to_string(), "www.example.com.");
        assert_eq!(answers[1].record_type(), RecordType::A);
        assert_eq!(answers[1].name().to_string(), "example.com.");
    }

    #[tokio::test]
    async fn cname_loop_is_servfail_with_soa() {
        let engine = engine();
        let response = engine
            .handle(query("loop-a.example.com.", RecordType::A), ctx())
            .await
            .unwrap();
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
    }

    #[tokio::test]
    async fn qname_case_is_preserved_in_first_owner() {
        let engine = engine();
        let response = engine
            .handle(query("WWW.Example.COM.", RecordType::A), ctx())
            .await
            .unwrap();
        assert_eq!(response.answers()[0].name().to_string(), "WWW.Example.COM.");
    }

    #[tokio::test]
    async fn ns_answers_carry_glue_additionals() {
        let engine = engine();
        let response = engine
            .handle(query("example.com.", RecordType::NS), ctx())
            .await
            .unwrap();
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.additionals().len(), 1);
        assert_eq!(response.additionals()[0].name().to_string(), "ns1.example.com.");
        assert_eq!(response.additionals()[0].record_type(), RecordType::A);
    }

    #[tokio::test]
    async fn cache_hit_rewrites_message_id() {
        let engine = engine();
        let first = engine
            .handle(query("example.com.", RecordType::A), ctx())
            .await
            .unwrap();
        assert_eq!(first.id(), 0x4242);

        let mut second = query("example.com.", RecordType::A);
        second.set_id(0x7777);
        let cached = engine.handle(second, ctx()).await.unwrap();
        assert_eq!(cached.id(), 0x7777);
        assert_eq!(cached.answers().len(), 1);
    }

    #[tokio::test]
    async fn nodata_is_negative_cached() {
        let engine = engine();
        let response = engine
            .handle(query("text.example.com.", RecordType::A), ctx())
            .await
            .unwrap();
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
        assert!(engine
            .cache
            .get_negative("text.example.com.", RecordType::A, ResponseCode::NoError));
    }

    /// A single-shot upstream answering every query with the given rcode.
    async fn spawn_fake_upstream(rcode: ResponseCode) -> std::net::SocketAddr {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(request) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let mut reply = Message::new();
                reply.set_id(request.id());
                reply.set_message_type(MessageType::Response);
                reply.set_op_code(request.op_code());
                reply.set_response_code(rcode);
                for q in request.queries() {
                    reply.add_query(q.clone());
                }
                let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn negative_resolver_result_is_negative_cached() {
        use smartdns_resolver::ResolverConfig;

        let upstream = spawn_fake_upstream(ResponseCode::NXDomain).await;
        let resolver = Arc::new(IterativeResolver::new(ResolverConfig {
            servers: vec![upstream],
            max_depth: 4,
            udp_timeout: Duration::from_secs(1),
            tcp_timeout: Duration::from_secs(1),
        }));
        let store = Arc::new(ZoneStore::new());
        store.swap_zone(test_zone());
        let engine = QueryEngine::new(store, Arc::new(ResponseCache::new(64)), Some(resolver));

        let response = engine
            .handle(query("missing.other.", RecordType::A), ctx())
            .await
            .unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        // The reply carries no records, so the resolver's 60 s TTL floor
        // backs the negative entry.
        assert!(engine
            .cache
            .get_negative("missing.other.", RecordType::A, ResponseCode::NXDomain));
    }

    #[tokio::test]
    async fn out_of_zone_without_resolver_is_nxdomain() {
        let engine = engine();
        let response = engine
            .handle(query("unknown.example.", RecordType::A), ctx())
            .await
            .unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.authoritative());
        assert!(response.name_servers().is_empty());
    }
}
