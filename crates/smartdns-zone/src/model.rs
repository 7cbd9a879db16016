//! Zone file model and the in-memory zone index.
//!
//! A zone arrives as JSON ([`ZoneFile`]), is validated, and is converted
//! into a [`ZoneIndex`]: a map of lowercase FQDN to per-type [`Rrset`]s.
//! The index is immutable once built; the store publishes it behind an
//! `Arc` and readers never see partial updates.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, SOA, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde::Deserialize;

use crate::{Result, ZoneError};

// ============================================================================
// Zone file (on-disk JSON shape)
// ============================================================================

/// A zone file as decoded from disk.
///
/// Unknown top-level fields are ignored; unknown record types reject the
/// zone during indexing.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneFile {
    /// Zone domain, dot-terminated or coerced during indexing.
    pub zone: String,
    /// Monotonic zone version; strict increase gates hot reloads.
    #[serde(default)]
    pub serial: u32,
    /// Default TTL in seconds for records without an explicit TTL.
    #[serde(default)]
    pub ttl_default: u32,
    /// Start-of-authority parameters.
    pub soa: Soa,
    /// Nameserver FQDNs installed as the apex NS RRset.
    #[serde(default)]
    pub ns: Vec<String>,
    /// The zone's records.
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

/// SOA parameters from the zone file. The SOA record itself exists
/// implicitly at the apex and is synthesized on demand.
#[derive(Debug, Clone, Deserialize)]
pub struct Soa {
    pub mname: String,
    pub rname: String,
    #[serde(default)]
    pub refresh: u32,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub expire: u32,
    /// Negative-caching TTL, emitted as the SOA MINIMUM field.
    #[serde(default)]
    pub negative_ttl: u32,
}

/// One record entry as it appears in the zone file.
///
/// `value` is used by CNAME only; every other type carries `values`, a list
/// whose element shape depends on the type.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    #[serde(default)]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub values: Option<serde_json::Value>,
}

/// An MX entry: `{preference, host}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MxRecord {
    pub preference: u16,
    pub host: String,
}

/// An SRV entry: `{priority, weight, port, target}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

// ============================================================================
// Record kinds and RRsets
// ============================================================================

/// The record types a zone file may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Txt,
    Srv,
}

impl RecordKind {
    /// Parses a zone-file type token. Matching is case-insensitive;
    /// unknown tokens return `None` and reject the zone.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "AAAA" => Some(Self::Aaaa),
            "CNAME" => Some(Self::Cname),
            "MX" => Some(Self::Mx),
            "NS" => Some(Self::Ns),
            "TXT" => Some(Self::Txt),
            "SRV" => Some(Self::Srv),
            _ => None,
        }
    }

    /// Maps a wire query type onto a kind, if the type is served from
    /// zone data.
    pub fn from_rtype(rtype: RecordType) -> Option<Self> {
        match rtype {
            RecordType::A => Some(Self::A),
            RecordType::AAAA => Some(Self::Aaaa),
            RecordType::CNAME => Some(Self::Cname),
            RecordType::MX => Some(Self::Mx),
            RecordType::NS => Some(Self::Ns),
            RecordType::TXT => Some(Self::Txt),
            RecordType::SRV => Some(Self::Srv),
            _ => None,
        }
    }

    /// Returns the wire record type for this kind.
    pub const fn rtype(&self) -> RecordType {
        match self {
            Self::A => RecordType::A,
            Self::Aaaa => RecordType::AAAA,
            Self::Cname => RecordType::CNAME,
            Self::Mx => RecordType::MX,
            Self::Ns => RecordType::NS,
            Self::Txt => RecordType::TXT,
            Self::Srv => RecordType::SRV,
        }
    }

    /// Returns the canonical type token.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
            Self::Mx => "MX",
            Self::Ns => "NS",
            Self::Txt => "TXT",
            Self::Srv => "SRV",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed rdata for one RRset. A tagged variant rather than trait objects;
/// serialization matches on the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RrsetData {
    A(Vec<Ipv4Addr>),
    Aaaa(Vec<Ipv6Addr>),
    /// Single target FQDN.
    Cname(String),
    Ns(Vec<String>),
    Txt(Vec<String>),
    Mx(Vec<MxRecord>),
    Srv(Vec<SrvRecord>),
}

/// All records sharing owner name and type within a zone.
///
/// The TTL is the minimum over the contributing records' effective TTLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrset {
    pub kind: RecordKind,
    pub ttl: u32,
    pub data: RrsetData,
}

impl Rrset {
    fn new(kind: RecordKind, ttl: u32) -> Self {
        let data = match kind {
            RecordKind::A => RrsetData::A(Vec::new()),
            RecordKind::Aaaa => RrsetData::Aaaa(Vec::new()),
            RecordKind::Cname => RrsetData::Cname(String::new()),
            RecordKind::Ns => RrsetData::Ns(Vec::new()),
            RecordKind::Txt => RrsetData::Txt(Vec::new()),
            RecordKind::Mx => RrsetData::Mx(Vec::new()),
            RecordKind::Srv => RrsetData::Srv(Vec::new()),
        };
        Self { kind, ttl, data }
    }

    /// Returns the CNAME target, if this is a CNAME RRset.
    pub fn cname_target(&self) -> Option<&str> {
        match &self.data {
            RrsetData::Cname(target) => Some(target),
            _ => None,
        }
    }

    /// Returns the number of resource records in this set.
    pub fn len(&self) -> usize {
        match &self.data {
            RrsetData::A(v) => v.len(),
            RrsetData::Aaaa(v) => v.len(),
            RrsetData::Cname(_) => 1,
            RrsetData::Ns(v) => v.len(),
            RrsetData::Txt(v) => v.len(),
            RrsetData::Mx(v) => v.len(),
            RrsetData::Srv(v) => v.len(),
        }
    }

    /// Returns true if this set holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes this RRset as wire records with the given owner name.
    ///
    /// The owner is the query name, not the stored name, so wildcard
    /// expansion and case preservation happen here for free.
    pub fn to_records(&self, owner: &Name) -> Result<Vec<Record>> {
        let mut out = Vec::with_capacity(self.len());
        match &self.data {
            RrsetData::A(addrs) => {
                for ip in addrs {
                    out.push(Record::from_rdata(owner.clone(), self.ttl, RData::A(A(*ip))));
                }
            }
            RrsetData::Aaaa(addrs) => {
                for ip in addrs {
                    out.push(Record::from_rdata(
                        owner.clone(),
                        self.ttl,
                        RData::AAAA(AAAA(*ip)),
                    ));
                }
            }
            RrsetData::Cname(target) => {
                out.push(Record::from_rdata(
                    owner.clone(),
                    self.ttl,
                    RData::CNAME(CNAME(Name::from_ascii(target)?)),
                ));
            }
            RrsetData::Ns(targets) => {
                for target in targets {
                    out.push(Record::from_rdata(
                        owner.clone(),
                        self.ttl,
                        RData::NS(NS(Name::from_ascii(target)?)),
                    ));
                }
            }
            RrsetData::Txt(texts) => {
                for text in texts {
                    out.push(Record::from_rdata(
                        owner.clone(),
                        self.ttl,
                        RData::TXT(TXT::new(vec![text.clone()])),
                    ));
                }
            }
            RrsetData::Mx(entries) => {
                for mx in entries {
                    out.push(Record::from_rdata(
                        owner.clone(),
                        self.ttl,
                        RData::MX(MX::new(mx.preference, Name::from_ascii(&mx.host)?)),
                    ));
                }
            }
            RrsetData::Srv(entries) => {
                for srv in entries {
                    out.push(Record::from_rdata(
                        owner.clone(),
                        self.ttl,
                        RData::SRV(SRV::new(
                            srv.priority,
                            srv.weight,
                            srv.port,
                            Name::from_ascii(&srv.target)?,
                        )),
                    ));
                }
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Name normalization
// ============================================================================

/// Appends the trailing dot if missing. Empty input stays empty.
pub fn ensure_fqdn(name: &str) -> String {
    if name.is_empty() || name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Expands a zone-file owner name to a lowercase FQDN.
///
/// `@` and the empty string denote the apex; a trailing dot is taken
/// verbatim; anything else is relative to the zone.
pub fn normalize_fqdn(name: &str, zone: &str) -> String {
    if name == "@" || name.is_empty() {
        zone.to_ascii_lowercase()
    } else if name.ends_with('.') {
        name.to_ascii_lowercase()
    } else {
        format!("{name}.{zone}").to_ascii_lowercase()
    }
}

fn effective_ttl(ttl: Option<u32>, default: u32) -> u32 {
    match ttl {
        Some(t) if t != 0 => t,
        _ => default,
    }
}

// ============================================================================
// Zone index
// ============================================================================

/// An immutable, indexed zone.
///
/// Built once by [`ZoneFile::to_index`] and published through the store;
/// queries read it without locking.
#[derive(Debug, Clone)]
pub struct ZoneIndex {
    /// Lowercase, dot-terminated zone name.
    pub zone_fqdn: String,
    pub serial: u32,
    pub soa: Soa,
    pub ttl_default: u32,
    by_name: HashMap<String, HashMap<RecordKind, Rrset>>,
}

impl ZoneIndex {
    /// Returns all RRsets at a name, keyed by kind.
    pub fn node(&self, name: &str) -> Option<&HashMap<RecordKind, Rrset>> {
        self.by_name.get(name)
    }

    /// Returns the RRset of the given kind at exactly this name.
    pub fn get(&self, name: &str, kind: RecordKind) -> Option<&Rrset> {
        self.by_name.get(name).and_then(|node| node.get(&kind))
    }

    /// Returns true if any records exist at this name.
    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Finds the RRset answering `(name, kind)`.
    ///
    /// If the name exists in the zone, only its own node is consulted.
    /// Otherwise wildcard owners are scanned from fewest labels stripped to
    /// most; the first wildcard carrying the kind wins, and a wildcard
    /// CNAME satisfies any kind (the caller returns it as a terminal
    /// answer).
    pub fn find_rrset(&self, name: &str, kind: RecordKind) -> Option<&Rrset> {
        if let Some(node) = self.by_name.get(name) {
            return node.get(&kind);
        }
        for wc in wildcard_candidates(name) {
            if let Some(node) = self.by_name.get(&wc) {
                if let Some(rrset) = node.get(&kind) {
                    return Some(rrset);
                }
                if let Some(rrset) = node.get(&RecordKind::Cname) {
                    return Some(rrset);
                }
            }
        }
        None
    }

    /// Returns true if any wildcard owner covers this name, regardless of
    /// the types stored there. Used for the NODATA/NXDOMAIN decision.
    pub fn has_wildcard_candidate(&self, name: &str) -> bool {
        wildcard_candidates(name).any(|wc| self.by_name.contains_key(&wc))
    }

    /// Synthesizes the apex SOA record. MINIMUM carries `negative_ttl`.
    pub fn soa_record(&self) -> Result<Record> {
        let owner = Name::from_ascii(&self.zone_fqdn)?;
        let rdata = SOA::new(
            Name::from_ascii(&ensure_fqdn(&self.soa.mname))?,
            Name::from_ascii(&ensure_fqdn(&self.soa.rname))?,
            self.serial,
            self.soa.refresh as i32,
            self.soa.retry as i32,
            self.soa.expire as i32,
            self.soa.negative_ttl,
        );
        Ok(Record::from_rdata(owner, self.ttl_default, RData::SOA(rdata)))
    }

    /// Returns the number of owner names in the zone.
    pub fn name_count(&self) -> usize {
        self.by_name.len()
    }

    /// Returns the total number of resource records in the zone.
    pub fn record_count(&self) -> usize {
        self.by_name
            .values()
            .flat_map(|node| node.values())
            .map(Rrset::len)
            .sum()
    }
}

/// Yields `*.<suffix>` owners for every proper suffix of `name`, stripping
/// the fewest labels first. Never yields the bare `*.`.
fn wildcard_candidates(name: &str) -> impl Iterator<Item = String> + '_ {
    let labels: Vec<&str> = name.split_terminator('.').collect();
    (1..labels.len()).map(move |i| format!("*.{}.", labels[i..].join(".")))
}

// ============================================================================
// Zone file -> index conversion
// ============================================================================

impl ZoneFile {
    /// Validates top-level fields and returns the normalized zone FQDN.
    pub fn validate(&self) -> Result<String> {
        if self.zone.is_empty() {
            return Err(ZoneError::invalid("zone is required"));
        }
        if self.soa.mname.is_empty() || self.soa.rname.is_empty() {
            return Err(ZoneError::invalid("soa.mname and soa.rname required"));
        }
        if self.ns.is_empty() {
            return Err(ZoneError::invalid("at least one NS required"));
        }
        Ok(ensure_fqdn(&self.zone).to_ascii_lowercase())
    }

    /// Converts the zone file into an indexed zone.
    ///
    /// Any record-level error rejects the entire zone.
    pub fn to_index(&self) -> Result<ZoneIndex> {
        let zone_fqdn = self.validate()?;
        let mut index = ZoneIndex {
            zone_fqdn: zone_fqdn.clone(),
            serial: self.serial,
            soa: self.soa.clone(),
            ttl_default: self.ttl_default,
            by_name: HashMap::new(),
        };

        // Apex NS RRset from the top-level list, at the default TTL.
        index.by_name.entry(zone_fqdn.clone()).or_default().insert(
            RecordKind::Ns,
            Rrset {
                kind: RecordKind::Ns,
                ttl: self.ttl_default,
                data: RrsetData::Ns(normalize_targets(&self.ns)),
            },
        );

        for record in &self.records {
            let kind = RecordKind::parse(&record.rtype)
                .ok_or_else(|| ZoneError::invalid(format!("unsupported type: {}", record.rtype)))?;
            let fqdn = normalize_fqdn(&record.name, &zone_fqdn);
            if !fqdn.ends_with(&zone_fqdn) {
                return Err(ZoneError::invalid(format!(
                    "record {fqdn} outside zone {zone_fqdn}"
                )));
            }
            let ttl = effective_ttl(record.ttl, self.ttl_default);
            let node = index.by_name.entry(fqdn.clone()).or_default();

            // CNAME must be the only RRset at a name, in either insertion
            // order.
            if kind == RecordKind::Cname && !node.is_empty() {
                return Err(ZoneError::invalid(format!(
                    "CNAME must be unique at name {fqdn}"
                )));
            }
            if kind != RecordKind::Cname && node.contains_key(&RecordKind::Cname) {
                return Err(ZoneError::invalid(format!(
                    "{kind} conflicts with CNAME at name {fqdn}"
                )));
            }

            let rrset = node.entry(kind).or_insert_with(|| Rrset::new(kind, ttl));
            rrset.ttl = rrset.ttl.min(ttl);

            match (kind, &mut rrset.data) {
                (RecordKind::Cname, RrsetData::Cname(target)) => {
                    let value = record
                        .value
                        .as_deref()
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| {
                            ZoneError::invalid(format!("CNAME requires value for {fqdn}"))
                        })?;
                    *target = normalize_fqdn(value, &zone_fqdn);
                }
                (RecordKind::A, RrsetData::A(list)) => {
                    for s in string_values(record, &fqdn)? {
                        let ip: Ipv4Addr = s
                            .parse()
                            .map_err(|_| ZoneError::invalid(format!("invalid A ip {s}")))?;
                        list.push(ip);
                    }
                }
                (RecordKind::Aaaa, RrsetData::Aaaa(list)) => {
                    for s in string_values(record, &fqdn)? {
                        let ip: Ipv6Addr = s
                            .parse()
                            .map_err(|_| ZoneError::invalid(format!("invalid AAAA ip {s}")))?;
                        if ip.to_ipv4_mapped().is_some() {
                            return Err(ZoneError::invalid(format!("invalid AAAA ip {s}")));
                        }
                        list.push(ip);
                    }
                }
                (RecordKind::Txt, RrsetData::Txt(list)) => {
                    list.extend(string_values(record, &fqdn)?);
                }
                (RecordKind::Ns, RrsetData::Ns(list)) => {
                    list.extend(normalize_targets(&string_values(record, &fqdn)?));
                }
                (RecordKind::Mx, RrsetData::Mx(list)) => {
                    let mut entries: Vec<MxRecord> = typed_values(record, &fqdn)?;
                    for mx in &mut entries {
                        mx.host = ensure_fqdn(&mx.host).to_ascii_lowercase();
                    }
                    list.extend(entries);
                }
                (RecordKind::Srv, RrsetData::Srv(list)) => {
                    let mut entries: Vec<SrvRecord> = typed_values(record, &fqdn)?;
                    for srv in &mut entries {
                        srv.target = ensure_fqdn(&srv.target).to_ascii_lowercase();
                    }
                    list.extend(entries);
                }
                // The entry is created with the matching variant above.
                _ => unreachable!("rrset data variant matches its kind"),
            }
        }

        Ok(index)
    }
}

fn normalize_targets(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| ensure_fqdn(v).to_ascii_lowercase())
        .collect()
}

fn string_values(record: &RawRecord, fqdn: &str) -> Result<Vec<String>> {
    typed_values(record, fqdn)
}

fn typed_values<T: serde::de::DeserializeOwned>(record: &RawRecord, fqdn: &str) -> Result<Vec<T>> {
    let values = record
        .values
        .clone()
        .ok_or_else(|| ZoneError::invalid(format!("values missing for {} {fqdn}", record.rtype)))?;
    serde_json::from_value(values)
        .map_err(|e| ZoneError::invalid(format!("bad values for {} {fqdn}: {e}", record.rtype)))
}

// ============================================================================
// Tests
// ============================================================================
