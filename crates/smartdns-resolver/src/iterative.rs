//! Iterative resolution state machine.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::roots::root_server_addrs;
use crate::{ResolveError, Result};

/// Upstream replies larger than this are truncated and retried over TCP.
const MAX_REPLY_SIZE: usize = 4096;

/// TTL floor applied to cached iterative results.
const TTL_FLOOR: u32 = 60;

static QUERY_ID: AtomicU16 = AtomicU16::new(0);

/// Configuration for the iterative resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Initial server set, normally the roots.
    pub servers: Vec<SocketAddr>,
    /// Maximum referral depth.
    pub max_depth: usize,
    /// Per-attempt UDP timeout.
    pub udp_timeout: Duration,
    /// Per-attempt TCP timeout.
    pub tcp_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: root_server_addrs(),
            max_depth: 16,
            udp_timeout: Duration::from_secs(3),
            tcp_timeout: Duration::from_secs(5),
        }
    }
}

/// Iterative resolver following referrals from a fixed starting set.
#[derive(Debug)]
pub struct IterativeResolver {
    config: ResolverConfig,
}

impl IterativeResolver {
    /// Creates a resolver with the given configuration.
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Creates a resolver seeded with the IANA root servers.
    pub fn with_roots() -> Self {
        Self::new(ResolverConfig::default())
    }

    /// Resolves `(qname, qtype)` iteratively.
    ///
    /// Returns the final reply and the TTL to cache it under, or `None`
    /// when resolution fails; the caller surfaces that as a soft failure
    /// with no response.
    pub async fn resolve(&self, qname: &str, qtype: RecordType) -> Option<(Message, u32)> {
        let mut name = match Name::from_ascii(qname) {
            Ok(name) => name,
            Err(e) => {
                warn!(qname, error = %e, "unresolvable query name");
                return None;
            }
        };
        let mut servers = self.config.servers.clone();
        if servers.is_empty() {
            return None;
        }
        let mut ttl_min = 0u32;

        for depth in 0..self.config.max_depth {
            let reply = self.query_first(&servers, &name, qtype).await?;

            if reply.response_code() == ResponseCode::NXDomain {
                let ttl = extract_min_ttl(&reply);
                return Some((reply, ttl));
            }

            if !reply.answers().is_empty() {
                let mut has_final = qtype == RecordType::CNAME;
                for record in reply.answers() {
                    if record.record_type() == qtype {
                        has_final = true;
                    }
                    ttl_min = accumulate_ttl(ttl_min, record.ttl());
                }
                if !has_final {
                    if let Some(target) = first_cname_target(&reply) {
                        trace!(depth, target = %target, "following upstream CNAME");
                        name = target;
                        continue;
                    }
                }
                return Some((reply, ttl_or(ttl_min, TTL_FLOOR)));
            }

            let ns_names = referral_targets(&reply);
            if !ns_names.is_empty() {
                let mut next = pick_glue(&reply, &ns_names);
                if next.is_empty() {
                    for ns in &ns_names {
                        let addrs = self.lookup_glue_a(&servers, ns).await;
                        if !addrs.is_empty() {
                            next = addrs
                                .into_iter()
                                .map(|ip| SocketAddr::new(ip, 53))
                                .collect();
                            break;
                        }
                    }
                }
                if next.is_empty() {
                    debug!(depth, qname, "referral without resolvable glue");
                    return None;
                }
                trace!(depth, servers = next.len(), "following referral");
                servers = next;
                continue;
            }

            // Neither answer nor referral: hand the reply back as-is.
            let ttl = extract_min_ttl(&reply);
            return Some((reply, ttl));
        }

        debug!(qname, depth = self.config.max_depth, "referral depth exceeded");
        None
    }

    /// Queries each server in order and returns the first reply, retrying
    /// truncated replies over TCP.
    async fn query_first(
        &self,
        servers: &[SocketAddr],
        name: &Name,
        qtype: RecordType,
    ) -> Option<Message> {
        for server in servers {
            match self.exchange_udp(*server, name, qtype).await {
                Ok(reply) if reply.truncated() => {
                    match self.exchange_tcp(*server, name, qtype).await {
                        Ok(reply) => return Some(reply),
                        Err(e) => {
                            debug!(server = %server, error = %e, "TCP retry failed");
                            continue;
                        }
                    }
                }
                Ok(reply) => return Some(reply),
                Err(e) => {
                    debug!(server = %server, error = %e, "upstream query failed");
                    continue;
                }
            }
        }
        None
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        name: &Name,
        qtype: RecordType,
    ) -> Result<Message> {
        let query = build_query(name, qtype);
        let id = query.id();
        let wire = query.to_vec()?;

        let bind_addr: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        socket.send(&wire).await?;

        let mut buf = vec![0u8; MAX_REPLY_SIZE];
        let recv = async {
            loop {
                let len = socket.recv(&mut buf).await?;
                match Message::from_vec(&buf[..len]) {
                    // Datagrams with the wrong id are ignored, not fatal.
                    Ok(reply) if reply.id() == id => return Ok(reply),
                    Ok(_) => continue,
                    Err(_) => continue,
                }
            }
        };
        match timeout(self.config.udp_timeout, recv).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout),
        }
    }

    async fn exchange_tcp(
        &self,
        server: SocketAddr,
        name: &Name,
        qtype: RecordType,
    ) -> Result<Message> {
        let query = build_query(name, qtype);
        let wire = query.to_vec()?;

        let exchange = async {
            let mut stream = TcpStream::connect(server).await?;
            stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
            stream.write_all(&wire).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Ok(Message::from_vec(&body)?)
        };
        match timeout(self.config.tcp_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout),
        }
    }

    /// One-level A lookup of a nameserver host against the current server
    /// set, used when a referral arrives without glue.
    async fn lookup_glue_a(&self, servers: &[SocketAddr], host: &Name) -> Vec<IpAddr> {
        for server in servers {
            let reply = match self.exchange_udp(*server, host, RecordType::A).await {
                Ok(reply) if reply.truncated() => {
                    match self.exchange_tcp(*server, host, RecordType::A).await {
                        Ok(reply) => reply,
                        Err(_) => continue,
                    }
                }
                Ok(reply) => reply,
                Err(_) => continue,
            };

            let answers: Vec<IpAddr> = reply
                .answers()
                .iter()
                .filter_map(|r| match r.data() {
                    Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                    _ => None,
                })
                .collect();
            if !answers.is_empty() {
                return answers;
            }

            // A referral to the glue host may still carry a usable address
            // in its additional section.
            if let Some(addr) = reply.additionals().iter().find_map(|r| match r.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                _ => None,
            }) {
                return vec![addr];
            }
        }
        Vec::new()
    }
}

fn build_query(name: &Name, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(next_query_id());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(false);
    message.add_query(Query::query(name.clone(), qtype));
    message
}

fn next_query_id() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    QUERY_ID.fetch_add(1, Ordering::Relaxed) ^ (nanos as u16)
}

/// NS target names from the authority section of a referral.
fn referral_targets(reply: &Message) -> Vec<Name> {
    reply
        .name_servers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::NS(ns)) => Some(ns.0.clone()),
            _ => None,
        })
        .collect()
}

/// The first CNAME target in the answer section, if any.
fn first_cname_target(reply: &Message) -> Option<Name> {
    reply.answers().iter().find_map(|r| match r.data() {
        Some(RData::CNAME(cname)) => Some(cname.0.clone()),
        _ => None,
    })
}

/// Glue addresses for the referral targets, from the additional section.
/// Owner matching is case-insensitive; addresses are deduplicated. Both
/// IPv4 and IPv6 glue are accepted.
fn pick_glue(reply: &Message, ns_names: &[Name]) -> Vec<SocketAddr> {
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut glue = Vec::new();
    for record in reply.additionals() {
        let ip = match record.data() {
            Some(RData::A(a)) => IpAddr::V4(a.0),
            Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        if ns_names.iter().any(|ns| ns == record.name()) && seen.insert(ip) {
            glue.push(SocketAddr::new(ip, 53));
        }
    }
    glue
}

/// TTL accumulator where zero means "unset": the first nonzero value
/// replaces it, after which a true minimum is taken.
fn accumulate_ttl(current: u32, next: u32) -> u32 {
    if current == 0 {
        next
    } else if next == 0 {
        current
    } else {
        current.min(next)
    }
}

fn ttl_or(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

/// Minimum TTL across all sections of a reply, with the floor applied.
fn extract_min_ttl(reply: &Message) -> u32 {
    let mut ttl = 0u32;
    for record in reply
        .answers()
        .iter()
        .chain(reply.name_servers())
        .chain(reply.additionals())
    {
        ttl = accumulate_ttl(ttl, record.ttl());
    }
    ttl_or(ttl, TTL_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS};
    use hickory_proto::rr::Record;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    #[test]
    fn ttl_accumulator_treats_zero_as_unset() {
        assert_eq!(accumulate_ttl(0, 300), 300);
        assert_eq!(accumulate_ttl(300, 0), 300);
        assert_eq!(accumulate_ttl(300, 60), 60);
        assert_eq!(ttl_or(0, 60), 60);
        assert_eq!(ttl_or(30, 60), 30);
    }

    #[test]
    fn min_ttl_spans_all_sections_with_floor() {
        let mut reply = Message::new();
        reply.add_answer(Record::from_rdata(
            name("a.example."),
            120,
            RData::A(A("192.0.2.1".parse().unwrap())),
        ));
        reply.add_name_server(Record::from_rdata(
            name("example."),
            90,
            RData::NS(NS(name("ns.example."))),
        ));
        assert_eq!(extract_min_ttl(&reply), 90);

        let empty = Message::new();
        assert_eq!(extract_min_ttl(&empty), 60);
    }

    #[test]
    fn glue_matches_referral_targets_case_insensitively() {
        let mut reply = Message::new();
        reply.add_name_server(Record::from_rdata(
            name("example."),
            60,
            RData::NS(NS(name("NS1.example."))),
        ));
        reply.add_additional(Record::from_rdata(
            name("ns1.Example."),
            60,
            RData::A(A("192.0.2.10".parse().unwrap())),
        ));
        reply.add_additional(Record::from_rdata(
            name("ns1.example."),
            60,
            RData::AAAA(AAAA("2001:db8::10".parse().unwrap())),
        ));
        // Unrelated additionals are not glue.
        reply.add_additional(Record::from_rdata(
            name("other.example."),
            60,
            RData::A(A("192.0.2.99".parse().unwrap())),
        ));

        let targets = referral_targets(&reply);
        assert_eq!(targets.len(), 1);

        let glue = pick_glue(&reply, &targets);
        assert_eq!(glue.len(), 2);
        assert!(glue.contains(&"192.0.2.10:53".parse().unwrap()));
        assert!(glue.contains(&"[2001:db8::10]:53".parse().unwrap()));
    }

    #[test]
    fn duplicate_glue_addresses_are_suppressed() {
        let mut reply = Message::new();
        reply.add_name_server(Record::from_rdata(
            name("example."),
            60,
            RData::NS(NS(name("ns1.example."))),
        ));
        for _ in 0..2 {
            reply.add_additional(Record::from_rdata(
                name("ns1.example."),
                60,
                RData::A(A("192.0.2.10".parse().unwrap())),
            ));
        }
        let glue = pick_glue(&reply, &referral_targets(&reply));
        assert_eq!(glue.len(), 1);
    }

    #[test]
    fn cname_target_is_first_in_answer_order() {
        let mut reply = Message::new();
        reply.add_answer(Record::from_rdata(
            name("a.example."),
            60,
            RData::CNAME(CNAME(name("b.example."))),
        ));
        reply.add_answer(Record::from_rdata(
            name("b.example."),
            60,
            RData::CNAME(CNAME(name("c.example."))),
        ));
        assert_eq!(first_cname_target(&reply), Some(name("b.example.")));
    }
}
