use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::protocol::types::*;

/// All the zones this server is authoritative for.
#[derive(Debug, Clone, Default)]
pub struct ZoneSet {
    zones: HashMap<DomainName, Zone>,
}

impl ZoneSet {
    pub fn new() -> Self {
        Self {
            zones: HashMap::new(),
        }
    }

    /// Find the most specific zone enclosing a name, if there is one.
    pub fn find(&self, name: &DomainName) -> Option<&Zone> {
        for i in 0..name.labels.len() {
            let labels = &name.labels[i..];
            if let Some(name) = DomainName::from_labels(labels.into()) {
                if let Some(zone) = self.zones.get(&name) {
                    return Some(zone);
                }
            }
        }

        None
    }

    /// Add a zone, replacing any previous zone with the same apex.
    pub fn insert(&mut self, zone: Zone) {
        self.zones.insert(zone.apex().clone(), zone);
    }

    pub fn get(&self, apex: &DomainName) -> Option<&Zone> {
        self.zones.get(apex)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// One authoritative zone: an apex, the SOA rooted there, and a node
/// for every name in the zone.
///
/// Nodes are kept in a B-tree keyed by the canonical form of their
/// names (labels reversed, already lowercased), so an in-order walk
/// visits names in DNSSEC canonical order (RFC 4034 section 6.1) and
/// predecessor queries are a `range` away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    apex: DomainName,
    soa: SOA,
    soa_ttl: u32,
    nodes: BTreeMap<Vec<Label>, Node>,
}

/// The canonical key for a name: its labels, reversed.  Suffixes of
/// the name become prefixes of the key, and the derived ordering on
/// label vectors is exactly the canonical name ordering.
fn name_key(name: &DomainName) -> Vec<Label> {
    name.labels.iter().rev().cloned().collect()
}

// always fits in a label
fn wildcard_label() -> Label {
    Label::try_from(&b"*"[..]).unwrap()
}

impl Zone {
    /// Construct a zone.  The SOA is inserted as an rrset at the apex;
    /// it is the only SOA the zone will ever hold.
    pub fn new(apex: DomainName, soa: SOA, soa_ttl: u32) -> Self {
        let mut nodes = BTreeMap::new();
        let mut apex_node = Node::new(apex.clone());
        apex_node.add(soa.to_rdata(), soa_ttl);
        nodes.insert(name_key(&apex), apex_node);

        Self {
            apex,
            soa,
            soa_ttl,
            nodes,
        }
    }

    pub fn apex(&self) -> &DomainName {
        &self.apex
    }

    pub fn soa(&self) -> &SOA {
        &self.soa
    }

    pub fn soa_rr(&self) -> ResourceRecord {
        self.soa.to_rr(&self.apex, self.soa_ttl)
    }

    /// The TTL for negative answers: the smaller of the SOA rrset TTL
    /// and the SOA MINIMUM field (RFC 2308 section 3).
    pub fn negative_ttl(&self) -> u32 {
        std::cmp::min(self.soa_ttl, self.soa.minimum)
    }

    /// Insert a record.  Empty nodes are materialised for every name
    /// between the owner and the apex, so intermediate names resolve
    /// as no-data rather than NXDOMAIN.
    ///
    /// The first record of an rrset fixes the rrset TTL; duplicate
    /// data is dropped.
    ///
    /// # Errors
    ///
    /// If the owner is not within the zone, or the record is an SOA
    /// (the constructor's SOA is the only one allowed).
    pub fn insert(
        &mut self,
        name: &DomainName,
        rtype_with_data: RecordTypeWithData,
        ttl: u32,
    ) -> Result<(), ZoneInsertError> {
        if !name.is_subdomain_of(&self.apex) {
            return Err(ZoneInsertError::NotSubdomainOfApex {
                apex: self.apex.clone(),
                name: name.clone(),
            });
        }
        if rtype_with_data.rtype() == RecordType::SOA {
            return Err(ZoneInsertError::MultipleSOA);
        }

        let key = name_key(name);
        for prefix_len in self.apex.labels.len()..key.len() {
            let prefix = key[..prefix_len].to_vec();
            self.nodes.entry(prefix).or_insert_with(|| {
                // the owner of an ancestor key is a suffix of `name`
                let labels = name.labels[name.labels.len() - prefix_len..].to_vec();
                Node::new(DomainName::from_labels(labels).unwrap())
            });
        }

        self.nodes
            .entry(key)
            .or_insert_with(|| Node::new(name.clone()))
            .add(rtype_with_data, ttl);

        Ok(())
    }

    /// Resolve a name against this zone's records.  Returns `None` if
    /// the name is not within the zone at all.
    ///
    /// A non-apex node holding NS marks a delegation: names at or
    /// below it produce a referral.  Otherwise the name either matches
    /// a node, matches a wildcard under its closest encloser, or does
    /// not exist.
    pub fn lookup(&self, name: &DomainName) -> Option<Lookup> {
        if !name.is_subdomain_of(&self.apex) {
            return None;
        }

        let key = name_key(name);
        let apex_len = self.apex.labels.len();

        // outermost cut first
        for prefix_len in apex_len + 1..=key.len() {
            if let Some(node) = self.nodes.get(&key[..prefix_len]) {
                if node.has(RecordType::NS) {
                    return Some(Lookup::Referral { node });
                }
            }
        }

        if let Some(node) = self.nodes.get(&key[..]) {
            return Some(Lookup::Exact { node });
        }

        // closest encloser: the longest existing ancestor.  Since
        // empty non-terminals are materialised, the first hit walking
        // up is it.
        for prefix_len in (apex_len..key.len()).rev() {
            if self.nodes.get(&key[..prefix_len]).is_some() {
                let mut candidate = key[..prefix_len].to_vec();
                candidate.push(wildcard_label());
                if let Some(node) = self.nodes.get(&candidate) {
                    return Some(Lookup::Wildcard { node });
                }
                break;
            }
        }

        Some(Lookup::NameError)
    }

    /// The node for exactly this name, with no delegation or wildcard
    /// processing.  Used where raw zone contents are wanted, like glue
    /// for names below a cut.
    pub fn node(&self, name: &DomainName) -> Option<&Node> {
        self.nodes.get(&name_key(name)[..])
    }

    /// The node with the largest canonically-ordered name strictly
    /// before the given name.  This is the NSEC-style walk primitive.
    pub fn predecessor(&self, name: &DomainName) -> Option<&Node> {
        let key = name_key(name);
        self.nodes
            .range(..key)
            .next_back()
            .map(|(_, node)| node)
    }

    /// All nodes, in canonical name order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Total number of records in the zone.
    pub fn record_count(&self) -> usize {
        self.nodes
            .values()
            .flat_map(Node::rrsets)
            .map(|rrset| rrset.data().len())
            .sum()
    }
}

/// The result of looking up a name in a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// The name exists.  It may still hold no rrset of the queried
    /// type (a no-data answer).
    Exact { node: &'a Node },
    /// The name does not exist but a wildcard under its closest
    /// encloser does.  Answers synthesised from this node must be
    /// owned by the queried name, not the wildcard.
    Wildcard { node: &'a Node },
    /// The name is at or below a delegation; the node is the cut point
    /// and holds the NS rrset.
    Referral { node: &'a Node },
    /// The name does not exist.
    NameError,
}

/// One name's records, grouped into rrsets by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    owner: DomainName,
    rrsets: BTreeMap<RecordType, RrSet>,
}

impl Node {
    pub fn new(owner: DomainName) -> Self {
        Self {
            owner,
            rrsets: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> &DomainName {
        &self.owner
    }

    pub fn rrset(&self, rtype: RecordType) -> Option<&RrSet> {
        self.rrsets.get(&rtype)
    }

    pub fn has(&self, rtype: RecordType) -> bool {
        self.rrsets.contains_key(&rtype)
    }

    pub fn rrsets(&self) -> impl Iterator<Item = &RrSet> {
        self.rrsets.values()
    }

    pub fn is_empty(&self) -> bool {
        self.rrsets.is_empty()
    }

    fn add(&mut self, rtype_with_data: RecordTypeWithData, ttl: u32) {
        let rtype = rtype_with_data.rtype();
        if let Some(rrset) = self.rrsets.get_mut(&rtype) {
            rrset.add(rtype_with_data);
        } else {
            self.rrsets.insert(rtype, RrSet::new(rtype_with_data, ttl));
        }
    }
}

/// All the records sharing an owner name, type, and class.  The whole
/// set shares one TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrSet {
    ttl: u32,
    datas: Vec<RecordTypeWithData>,
}

impl RrSet {
    fn new(rtype_with_data: RecordTypeWithData, ttl: u32) -> Self {
        Self {
            ttl,
            datas: vec![rtype_with_data],
        }
    }

    fn add(&mut self, rtype_with_data: RecordTypeWithData) {
        if !self.datas.contains(&rtype_with_data) {
            self.datas.push(rtype_with_data);
        }
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn data(&self) -> &[RecordTypeWithData] {
        &self.datas
    }

    /// Materialise the rrset as records owned by the given name -
    /// which, for wildcard synthesis, is the queried name rather than
    /// the stored owner.
    pub fn to_rrs(&self, owner: &DomainName) -> Vec<ResourceRecord> {
        self.datas
            .iter()
            .map(|rtype_with_data| ResourceRecord {
                name: owner.clone(),
                rtype_with_data: rtype_with_data.clone(),
                rclass: RecordClass::IN,
                ttl: self.ttl,
            })
            .collect()
    }
}

/// Errors from inserting a record into a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneInsertError {
    NotSubdomainOfApex { apex: DomainName, name: DomainName },
    MultipleSOA,
}

impl fmt::Display for ZoneInsertError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ZoneInsertError::NotSubdomainOfApex { apex, name } => {
                write!(f, "'{name}' is not a subdomain of the apex '{apex}'")
            }
            ZoneInsertError::MultipleSOA => write!(f, "a zone has exactly one SOA"),
        }
    }
}

impl std::error::Error for ZoneInsertError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A SOA record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct SOA {
    pub mname: DomainName,
    pub rname: DomainName,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl SOA {
    /// Convert it into a SOA RR.
    pub fn to_rr(&self, name: &DomainName, ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: name.clone(),
            rtype_with_data: self.to_rdata(),
            rclass: RecordClass::IN,
            ttl,
        }
    }

    /// Convert it into a SOA RDATA.
    pub fn to_rdata(&self) -> RecordTypeWithData {
        RecordTypeWithData::SOA {
            mname: self.mname.clone(),
            rname: self.rname.clone(),
            serial: self.serial,
            refresh: self.refresh,
            retry: self.retry,
            expire: self.expire,
            minimum: self.minimum,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;
    use crate::protocol::types::test_util::*;

    pub fn test_soa() -> SOA {
        SOA {
            mname: domain("ns1.example.com."),
            rname: domain("hostmaster.example.com."),
            serial: 2024010100,
            refresh: 10800,
            retry: 3600,
            expire: 604_800,
            minimum: 300,
        }
    }

    /// A zone covering the interesting answer shapes: a plain A
    /// record, a CNAME, a wildcard, and a delegation.
    pub fn test_zone() -> Zone {
        let mut zone = Zone::new(domain("example.com."), test_soa(), 3600);
        for rr in [
            a_record("a.example.com.", std::net::Ipv4Addr::new(192, 0, 2, 1)),
            cname_record("alias.example.com.", "a.example.com."),
            txt_record("*.w.example.com.", "hit"),
            ns_record("sub.example.com.", "ns1.elsewhere."),
            ns_record("glued.example.com.", "ns.glued.example.com."),
            a_record("ns.glued.example.com.", std::net::Ipv4Addr::new(192, 0, 2, 53)),
        ] {
            zone.insert(&rr.name, rr.rtype_with_data, rr.ttl).unwrap();
        }
        zone
    }

    pub fn test_zone_set() -> ZoneSet {
        let mut zones = ZoneSet::new();
        zones.insert(test_zone());
        zones
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::test_util::*;
    use super::*;
    use crate::protocol::types::test_util::*;

    fn exact_node<'a>(zone: &'a Zone, name: &str) -> &'a Node {
        match zone.lookup(&domain(name)) {
            Some(Lookup::Exact { node }) => node,
            other => panic!("expected exact match for {name}, got {other:?}"),
        }
    }

    #[test]
    fn zone_set_finds_most_specific() {
        let mut zones = ZoneSet::new();
        zones.insert(Zone::new(domain("example.com."), test_soa(), 3600));
        zones.insert(Zone::new(domain("sub.example.com."), test_soa(), 3600));

        assert_eq!(
            &domain("example.com."),
            zones.find(&domain("www.example.com.")).unwrap().apex()
        );
        assert_eq!(
            &domain("sub.example.com."),
            zones.find(&domain("www.sub.example.com.")).unwrap().apex()
        );
        assert!(zones.find(&domain("example.org.")).is_none());
    }

    #[test]
    fn lookup_exact_match() {
        let zone = test_zone();
        let node = exact_node(&zone, "a.example.com.");
        let rrset = node.rrset(RecordType::A).unwrap();
        assert_eq!(
            vec![a_record("a.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            rrset.to_rrs(node.owner())
        );
    }

    #[test]
    fn lookup_apex_has_soa() {
        let zone = test_zone();
        let node = exact_node(&zone, "example.com.");
        assert!(node.has(RecordType::SOA));
    }

    #[test]
    fn lookup_missing_name_is_nameerror() {
        let zone = test_zone();
        assert_eq!(
            Some(Lookup::NameError),
            zone.lookup(&domain("missing.example.com."))
        );
    }

    #[test]
    fn lookup_out_of_zone_is_none() {
        let zone = test_zone();
        assert_eq!(None, zone.lookup(&domain("example.org.")));
    }

    #[test]
    fn lookup_empty_nonterminal_is_exact_and_empty() {
        let zone = test_zone();
        // only *.w.example.com. was inserted, but w.example.com. must
        // exist as an empty node
        let node = exact_node(&zone, "w.example.com.");
        assert!(node.is_empty());
    }

    #[test]
    fn lookup_wildcard_under_closest_encloser() {
        let zone = test_zone();
        match zone.lookup(&domain("x.w.example.com.")) {
            Some(Lookup::Wildcard { node }) => {
                assert_eq!(&domain("*.w.example.com."), node.owner());
                assert!(node.has(RecordType::TXT));
            }
            other => panic!("expected wildcard, got {other:?}"),
        }
    }

    #[test]
    fn lookup_wildcard_does_not_cross_explicit_names() {
        let mut zone = test_zone();
        let rr = a_record("explicit.w.example.com.", Ipv4Addr::new(192, 0, 2, 7));
        zone.insert(&rr.name, rr.rtype_with_data, rr.ttl).unwrap();

        // the explicit node wins over the wildcard
        let node = exact_node(&zone, "explicit.w.example.com.");
        assert!(node.has(RecordType::A));

        // but a name under the explicit node has closest encloser
        // explicit.w.example.com., which has no wildcard child
        assert_eq!(
            Some(Lookup::NameError),
            zone.lookup(&domain("deep.explicit.w.example.com."))
        );
    }

    #[test]
    fn lookup_below_cut_is_referral() {
        let zone = test_zone();
        for name in [
            "sub.example.com.",
            "deep.sub.example.com.",
            "very.deep.sub.example.com.",
        ] {
            match zone.lookup(&domain(name)) {
                Some(Lookup::Referral { node }) => {
                    assert_eq!(&domain("sub.example.com."), node.owner());
                    assert!(node.has(RecordType::NS));
                }
                other => panic!("expected referral for {name}, got {other:?}"),
            }
        }
    }

    #[test]
    fn lookup_apex_ns_is_not_a_cut() {
        let mut zone = test_zone();
        let rr = ns_record("example.com.", "ns1.example.com.");
        zone.insert(&rr.name, rr.rtype_with_data, rr.ttl).unwrap();

        let node = exact_node(&zone, "example.com.");
        assert!(node.has(RecordType::NS));
    }

    #[test]
    fn insert_rejects_foreign_names() {
        let mut zone = test_zone();
        let rr = a_record("www.example.org.", Ipv4Addr::new(192, 0, 2, 1));
        assert!(matches!(
            zone.insert(&rr.name, rr.rtype_with_data, rr.ttl),
            Err(ZoneInsertError::NotSubdomainOfApex { .. })
        ));
    }

    #[test]
    fn insert_rejects_second_soa() {
        let mut zone = test_zone();
        let rr = soa_record("example.com.", 1, 300);
        assert_eq!(
            Err(ZoneInsertError::MultipleSOA),
            zone.insert(&rr.name, rr.rtype_with_data, rr.ttl)
        );
    }

    #[test]
    fn insert_deduplicates_and_keeps_first_ttl() {
        let mut zone = Zone::new(domain("example.com."), test_soa(), 3600);
        let rr = a_record("a.example.com.", Ipv4Addr::new(192, 0, 2, 1));
        zone.insert(&rr.name, rr.rtype_with_data.clone(), 60).unwrap();
        zone.insert(&rr.name, rr.rtype_with_data.clone(), 999).unwrap();

        let node = exact_node(&zone, "a.example.com.");
        let rrset = node.rrset(RecordType::A).unwrap();
        assert_eq!(1, rrset.data().len());
        assert_eq!(60, rrset.ttl());
    }

    #[test]
    fn negative_ttl_is_min_of_soa_ttl_and_minimum() {
        let soa = test_soa();
        assert_eq!(300, Zone::new(domain("example.com."), soa.clone(), 3600).negative_ttl());
        assert_eq!(60, Zone::new(domain("example.com."), soa, 60).negative_ttl());
    }

    #[test]
    fn nodes_iterate_in_canonical_order() {
        let mut zone = Zone::new(domain("example.com."), test_soa(), 3600);
        for name in [
            "z.example.com.",
            "a.example.com.",
            "yljkjljk.a.example.com.",
            "*.z.example.com.",
            "zabc.a.example.com.",
        ] {
            let rr = a_record(name, Ipv4Addr::new(192, 0, 2, 1));
            zone.insert(&rr.name, rr.rtype_with_data, rr.ttl).unwrap();
        }

        // the canonical ordering example from RFC 4034 section 6.1
        let visited: Vec<String> = zone
            .nodes()
            .map(|node| node.owner().to_dotted_string())
            .collect();
        assert_eq!(
            vec![
                "example.com.",
                "a.example.com.",
                "yljkjljk.a.example.com.",
                "zabc.a.example.com.",
                "z.example.com.",
                "*.z.example.com.",
            ],
            visited
        );
    }

    #[test]
    fn predecessor_walks_canonical_order() {
        let zone = test_zone();

        // a.example.com. sorts immediately after the apex
        let node = zone.predecessor(&domain("a.example.com.")).unwrap();
        assert_eq!(&domain("example.com."), node.owner());

        // a name before every node has no predecessor... the apex is
        // first, so probe a name sorting before it
        assert!(zone.predecessor(&domain("example.com.")).is_none());

        // nonexistent names still have a well-defined predecessor
        let node = zone.predecessor(&domain("b.example.com.")).unwrap();
        assert_eq!(&domain("alias.example.com."), node.owner());
    }

    #[test]
    fn record_count_counts_data() {
        let zone = test_zone();
        // SOA + A + CNAME + TXT + NS + NS + glue A
        assert_eq!(7, zone.record_count());
    }
}
