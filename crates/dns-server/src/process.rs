//! The server-side query layer: parse classification, policy checks,
//! zone lookup under a snapshot lease, and response synthesis.

use bytes::BytesMut;
use std::cmp;

use dns_types::protocol::types::*;
use dns_types::zones::types::{Lookup, Node, Zone, ZoneSet};

use crate::catalog::Catalog;
use crate::layer::{Layer, LayerState};

/// How many CNAME links an answer will follow within one zone.
pub const MAX_CNAME_CHAIN: usize = 16;

/// The payload size this server advertises and accepts by default:
/// the DNS flag day 2020 value.
pub const DEFAULT_UDP_PAYLOAD_MAX: u16 = 1232;

/// The hard ceiling on any DNS message, from the 16-bit length prefix
/// of the stream transports.
pub const STREAM_MESSAGE_MAX: usize = 65535;

/// BADVERS is extended rcode 16: high bits 1, header nibble 0.
const BADVERS_EXTENDED_RCODE: u8 = 1;

/// What the transport a query arrived over allows its responses to
/// look like.
#[derive(Debug, Clone, Copy)]
pub struct TransportPolicy {
    pub limit: ResponseLimit,
    /// Whether AXFR queries are served on this transport.  Transfer
    /// content is not implemented, so this exists to pick the rcode.
    pub allow_axfr: bool,
    /// Likewise for IXFR.
    pub allow_ixfr: bool,
}

/// The size discipline of a transport.
#[derive(Debug, Clone, Copy)]
pub enum ResponseLimit {
    /// One datagram per response: bounded by the negotiated payload
    /// size, overflowing responses are truncated to the question.
    Datagram { payload_max: u16 },
    /// Length-prefixed stream: bounded only by the prefix, never
    /// truncated.
    Stream,
}

impl TransportPolicy {
    pub fn datagram(payload_max: u16) -> Self {
        Self {
            limit: ResponseLimit::Datagram { payload_max },
            allow_axfr: false,
            allow_ixfr: false,
        }
    }

    pub fn stream() -> Self {
        Self {
            limit: ResponseLimit::Stream,
            allow_axfr: false,
            allow_ixfr: false,
        }
    }

    fn advertised_payload(&self) -> u16 {
        match self.limit {
            ResponseLimit::Datagram { payload_max } => payload_max,
            ResponseLimit::Stream => DEFAULT_UDP_PAYLOAD_MAX,
        }
    }
}

/// The shape of the response most recently produced, for accounting.
#[derive(Debug, Clone, Copy)]
pub struct ResponseSummary {
    pub rcode: Rcode,
    pub authoritative: bool,
    pub truncated: bool,
}

struct Pending {
    response: Message,
    /// `Some` on datagram transports: the encoded size cap.
    datagram_limit: Option<usize>,
}

/// The authoritative query processor.  One per worker; leases the
/// current zone snapshot for the duration of each `consume` and
/// releases it before the response is emitted, so no lease is ever
/// held across a send.
pub struct QueryProcessor<'a> {
    catalog: &'a Catalog,
    policy: TransportPolicy,
    pending: Option<Pending>,
    summary: Option<ResponseSummary>,
}

impl<'a> QueryProcessor<'a> {
    pub fn new(catalog: &'a Catalog, policy: TransportPolicy) -> Self {
        Self {
            catalog,
            policy,
            pending: None,
            summary: None,
        }
    }

    /// The rcode and flags of the last produced response, if any.
    pub fn summary(&self) -> Option<ResponseSummary> {
        self.summary
    }

    fn set_pending(&mut self, response: Message, datagram_limit: Option<usize>) {
        self.pending = Some(Pending {
            response,
            datagram_limit,
        });
    }

    /// The encoded-size cap for this query: the client's EDNS payload
    /// size (at least 512) clamped to the server's own maximum.
    fn datagram_limit(&self, edns: Option<&Edns>) -> Option<usize> {
        match self.policy.limit {
            ResponseLimit::Datagram { payload_max } => {
                let client = edns.map_or(CLASSIC_UDP_PAYLOAD, |edns| {
                    cmp::max(edns.payload_size, CLASSIC_UDP_PAYLOAD)
                });
                Some(usize::from(cmp::min(client, payload_max)))
            }
            ResponseLimit::Stream => None,
        }
    }

    fn reply_opt(&self) -> ResourceRecord {
        Edns {
            payload_size: self.policy.advertised_payload(),
            extended_rcode: 0,
            version: 0,
            dnssec_ok: false,
        }
        .to_rr()
    }

    /// Answer one question from the leased snapshot, filling the
    /// response sections and flags.
    fn resolve(&self, zones: &ZoneSet, question: &Question, response: &mut Message) {
        let Some(zone) = zones.find(&question.name) else {
            tracing::trace!(%question, "refused: no authoritative zone");
            response.header.rcode = Rcode::Refused;
            return;
        };

        response.header.is_authoritative = true;

        let mut owner = question.name.clone();
        let mut chain = 0;
        loop {
            let Some(lookup) = zone.lookup(&owner) else {
                // a CNAME chase left the zone; the chain answers stand
                // on their own and the resolver takes it from there
                break;
            };

            match lookup {
                Lookup::Exact { node } | Lookup::Wildcard { node } => match question.qtype {
                    QueryType::Record(rtype) => {
                        if let Some(rrset) = node.rrset(rtype) {
                            response.answers.append(&mut rrset.to_rrs(&owner));
                            break;
                        }

                        let cname_rrset =
                            (rtype != RecordType::CNAME).then(|| node.rrset(RecordType::CNAME));
                        if let Some(Some(rrset)) = cname_rrset {
                            // answer the alias, then chase the target
                            // within this zone
                            response.answers.append(&mut rrset.to_rrs(&owner));
                            let Some(RecordTypeWithData::CNAME { cname }) = rrset.data().first()
                            else {
                                break;
                            };
                            chain += 1;
                            if chain >= MAX_CNAME_CHAIN {
                                tracing::debug!(%question, "cname chain limit reached");
                                break;
                            }
                            owner = cname.clone();
                            continue;
                        }

                        // the name exists with no data of this type
                        response
                            .authority
                            .push(zone.soa().to_rr(zone.apex(), zone.negative_ttl()));
                        break;
                    }
                    QueryType::Wildcard => {
                        // ANY answers with everything at the name and
                        // never chases
                        for rrset in node.rrsets() {
                            response.answers.append(&mut rrset.to_rrs(&owner));
                        }
                        break;
                    }
                    // transfers were refused before resolution
                    _ => break,
                },
                Lookup::Referral { node } => {
                    referral(zone, node, response);
                    break;
                }
                Lookup::NameError => {
                    // after a chase this applies to the last name of
                    // the chain (RFC 2308 section 2.1)
                    response.header.rcode = Rcode::NameError;
                    response
                        .authority
                        .push(zone.soa().to_rr(zone.apex(), zone.negative_ttl()));
                    break;
                }
            }
        }
    }
}

/// Fill in a referral: NS in authority, any in-zone glue addresses in
/// additional, authority bit cleared.
fn referral(zone: &Zone, node: &Node, response: &mut Message) {
    response.header.is_authoritative = false;

    let Some(ns_rrset) = node.rrset(RecordType::NS) else {
        return;
    };
    response.authority.append(&mut ns_rrset.to_rrs(node.owner()));

    for data in ns_rrset.data() {
        let RecordTypeWithData::NS { nsdname } = data else {
            continue;
        };
        // glue comes from the raw zone contents, below the cut
        // included
        if let Some(glue_node) = zone.node(nsdname) {
            for rtype in [RecordType::A, RecordType::AAAA] {
                if let Some(rrset) = glue_node.rrset(rtype) {
                    response.additional.append(&mut rrset.to_rrs(nsdname));
                }
            }
        }
    }
}

fn servfail(id: u16, opcode: Opcode) -> Message {
    let mut response = Message::make_format_error_response(id);
    response.header.opcode = opcode;
    response.header.rcode = Rcode::ServerFailure;
    response
}

impl Layer for QueryProcessor<'_> {
    fn begin(&mut self) -> LayerState {
        self.pending = None;
        self.summary = None;
        LayerState::Consume
    }

    fn consume(&mut self, wire: &[u8]) -> LayerState {
        let query = match Message::from_octets(wire) {
            Ok(query) => query,
            Err(error) => {
                tracing::debug!(%error, "dropping unparseable query");
                return match error.id() {
                    Some(id) => {
                        self.set_pending(Message::make_format_error_response(id), None);
                        LayerState::Fail
                    }
                    None => LayerState::Fail,
                };
            }
        };

        let id = query.header.id;

        if query.header.is_response {
            self.set_pending(Message::make_format_error_response(id), None);
            return LayerState::Fail;
        }

        let edns = match query.edns() {
            Ok(edns) => edns,
            Err(error) => {
                tracing::debug!(%error, "format error in additional section");
                self.set_pending(Message::make_format_error_response(id), None);
                return LayerState::Fail;
            }
        };

        let datagram_limit = self.datagram_limit(edns.as_ref());

        if query.questions.len() != 1 {
            self.set_pending(Message::make_format_error_response(id), datagram_limit);
            return LayerState::Fail;
        }

        let mut response = query.make_response();

        if let Some(edns) = &edns {
            if edns.version > 0 {
                // only EDNS version 0 is served: BADVERS, echoing an
                // OPT that names the version we do speak
                let mut opt = self.reply_opt();
                opt.ttl |= u32::from(BADVERS_EXTENDED_RCODE) << 24;
                response.additional.push(opt);
                self.set_pending(response, datagram_limit);
                return LayerState::Produce;
            }
        }

        let question = &query.questions[0];

        let refusal = if query.header.opcode != Opcode::Query {
            // NOTIFY is produced outbound only; a server with no
            // secondary role has nothing to do with an inbound one
            Some(Rcode::NotImplemented)
        } else if question.qtype == QueryType::AXFR && !self.policy.allow_axfr
            || question.qtype == QueryType::IXFR && !self.policy.allow_ixfr
        {
            Some(Rcode::NotImplemented)
        } else if question.is_unknown() {
            Some(Rcode::Refused)
        } else {
            None
        };

        if let Some(rcode) = refusal {
            response.header.rcode = rcode;
        } else {
            let lease = self.catalog.lease();
            self.resolve(&lease, question, &mut response);
            // the lease drops here: nothing in the response borrows
            // the snapshot, so emission does not pin it
        }

        if edns.is_some() {
            response.additional.push(self.reply_opt());
        }

        self.set_pending(response, datagram_limit);
        LayerState::Produce
    }

    fn produce(&mut self, out: &mut BytesMut) -> LayerState {
        let Some(Pending {
            response,
            datagram_limit,
        }) = self.pending.take()
        else {
            return LayerState::Fail;
        };

        let mut summary = ResponseSummary {
            rcode: response.header.rcode,
            authoritative: response.header.is_authoritative,
            truncated: false,
        };

        let header = response.header;
        let questions = response.questions.clone();

        let buf = std::mem::take(out);
        let octets = match response.to_octets_in(buf) {
            Ok(octets) => octets,
            Err(error) => {
                tracing::warn!(%error, "could not serialise response");
                summary.rcode = Rcode::ServerFailure;
                summary.authoritative = false;
                match servfail(header.id, header.opcode).to_octets_in(BytesMut::new()) {
                    Ok(octets) => octets,
                    Err(_) => return LayerState::Fail,
                }
            }
        };

        let octets = match datagram_limit {
            Some(limit) if octets.len() > limit => {
                // too big for the transport: strip back to the bare
                // question and let the client retry over a stream
                let truncated = Message {
                    header: Header {
                        is_truncated: true,
                        ..header
                    },
                    questions,
                    answers: Vec::new(),
                    authority: Vec::new(),
                    additional: Vec::new(),
                };
                summary.truncated = true;
                match truncated.to_octets_in(octets) {
                    Ok(octets) => octets,
                    Err(_) => return LayerState::Fail,
                }
            }
            _ => octets,
        };

        *out = octets;
        self.summary = Some(summary);
        LayerState::Done
    }

    fn reset(&mut self) -> LayerState {
        self.pending = None;
        self.summary = None;
        LayerState::Reset
    }

    fn finish(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::layer::serve_exchange;
    use dns_types::protocol::types::test_util::*;
    use dns_types::zones::types::test_util::*;
    use dns_types::zones::types::{Zone, ZoneSet};

    fn question(name: &str, qtype: QueryType) -> Message {
        Message::from_question(
            0x4242,
            Question {
                name: domain(name),
                qtype,
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
    }

    fn a_question(name: &str) -> Message {
        question(name, QueryType::Record(RecordType::A))
    }

    fn run_with(catalog: &Catalog, policy: TransportPolicy, wire: &[u8]) -> Option<Message> {
        let mut processor = QueryProcessor::new(catalog, policy);
        let mut out = BytesMut::new();
        if serve_exchange(&mut processor, wire, &mut out) {
            Some(Message::from_octets(&out).expect("response must parse"))
        } else {
            None
        }
    }

    fn run(query: &Message) -> Option<Message> {
        let catalog = Catalog::new(test_zone_set());
        run_with(
            &catalog,
            TransportPolicy::datagram(DEFAULT_UDP_PAYLOAD_MAX),
            &query.to_octets().unwrap(),
        )
    }

    #[test]
    fn exact_match_answers_authoritatively() {
        let response = run(&a_question("a.example.com.")).unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert!(!response.header.recursion_available);
        assert_eq!(
            vec![a_record("a.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            response.answers
        );
        assert!(response.authority.is_empty());
    }

    #[test]
    fn missing_name_is_nxdomain_with_soa() {
        let response = run(&a_question("missing.example.com.")).unwrap();

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert!(response.answers.is_empty());
        assert_eq!(1, response.authority.len());

        let soa_rr = &response.authority[0];
        assert_eq!(domain("example.com."), soa_rr.name);
        assert_eq!(RecordType::SOA, soa_rr.rtype_with_data.rtype());
        // min(SOA rrset ttl 3600, SOA minimum 300)
        assert_eq!(300, soa_rr.ttl);
    }

    #[test]
    fn wildcard_answer_is_owned_by_the_queried_name() {
        let response = run(&question(
            "x.w.example.com.",
            QueryType::Record(RecordType::TXT),
        ))
        .unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert_eq!(1, response.answers.len());
        assert_eq!(domain("x.w.example.com."), response.answers[0].name);
    }

    #[test]
    fn below_cut_is_a_referral() {
        let response = run(&a_question("deep.sub.example.com.")).unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(!response.header.is_authoritative);
        assert!(response.answers.is_empty());
        assert_eq!(
            vec![ns_record("sub.example.com.", "ns1.elsewhere.")],
            response.authority
        );
    }

    #[test]
    fn referral_carries_in_zone_glue() {
        let response = run(&a_question("deep.glued.example.com.")).unwrap();

        assert!(!response.header.is_authoritative);
        assert_eq!(
            vec![ns_record("glued.example.com.", "ns.glued.example.com.")],
            response.authority
        );
        assert_eq!(
            vec![a_record(
                "ns.glued.example.com.",
                Ipv4Addr::new(192, 0, 2, 53)
            )],
            response.additional
        );
    }

    #[test]
    fn axfr_over_datagram_is_notimp() {
        let response = run(&question("example.com.", QueryType::AXFR)).unwrap();
        assert_eq!(Rcode::NotImplemented, response.header.rcode);

        let response = run(&question("example.com.", QueryType::IXFR)).unwrap();
        assert_eq!(Rcode::NotImplemented, response.header.rcode);
    }

    #[test]
    fn truncated_question_formerrs_with_the_query_id() {
        let mut wire = a_question("a.example.com.").to_octets().unwrap().to_vec();
        wire[0] = 0x12;
        wire[1] = 0x34;
        wire.truncate(16);

        let catalog = Catalog::new(test_zone_set());
        let response = run_with(
            &catalog,
            TransportPolicy::datagram(DEFAULT_UDP_PAYLOAD_MAX),
            &wire,
        )
        .unwrap();

        assert_eq!(0x1234, response.header.id);
        assert_eq!(Rcode::FormatError, response.header.rcode);
        assert!(response.questions.is_empty());
    }

    #[test]
    fn unparseable_header_is_dropped() {
        let catalog = Catalog::new(test_zone_set());
        assert!(run_with(
            &catalog,
            TransportPolicy::datagram(DEFAULT_UDP_PAYLOAD_MAX),
            &[0x99]
        )
        .is_none());
    }

    #[test]
    fn out_of_zone_is_refused() {
        let response = run(&a_question("www.example.org.")).unwrap();

        assert_eq!(Rcode::Refused, response.header.rcode);
        assert!(!response.header.is_authoritative);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn existing_name_without_type_is_nodata() {
        let response = run(&question(
            "a.example.com.",
            QueryType::Record(RecordType::MX),
        ))
        .unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert!(response.answers.is_empty());
        assert_eq!(1, response.authority.len());
        assert_eq!(
            RecordType::SOA,
            response.authority[0].rtype_with_data.rtype()
        );
    }

    #[test]
    fn cname_is_chased_within_the_zone() {
        let response = run(&a_question("alias.example.com.")).unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert_eq!(
            vec![
                cname_record("alias.example.com.", "a.example.com."),
                a_record("a.example.com.", Ipv4Addr::new(192, 0, 2, 1)),
            ],
            response.answers
        );
    }

    #[test]
    fn cname_to_missing_name_is_nxdomain_with_the_chain() {
        let mut zone = test_zone();
        let rr = cname_record("dangling.example.com.", "nowhere.example.com.");
        zone.insert(&rr.name, rr.rtype_with_data, rr.ttl).unwrap();
        let mut zones = ZoneSet::new();
        zones.insert(zone);
        let catalog = Catalog::new(zones);

        let response = run_with(
            &catalog,
            TransportPolicy::datagram(DEFAULT_UDP_PAYLOAD_MAX),
            &a_question("dangling.example.com.").to_octets().unwrap(),
        )
        .unwrap();

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert_eq!(
            vec![cname_record("dangling.example.com.", "nowhere.example.com.")],
            response.answers
        );
        assert_eq!(
            RecordType::SOA,
            response.authority[0].rtype_with_data.rtype()
        );
    }

    #[test]
    fn cname_loops_stop_at_the_chain_limit() {
        let mut zone = test_zone();
        for rr in [
            cname_record("one.example.com.", "two.example.com."),
            cname_record("two.example.com.", "one.example.com."),
        ] {
            zone.insert(&rr.name, rr.rtype_with_data, rr.ttl).unwrap();
        }
        let mut zones = ZoneSet::new();
        zones.insert(zone);
        let catalog = Catalog::new(zones);

        let response = run_with(
            &catalog,
            TransportPolicy::stream(),
            &a_question("one.example.com.").to_octets().unwrap(),
        )
        .unwrap();

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(MAX_CNAME_CHAIN, response.answers.len());
    }

    #[test]
    fn any_answers_everything_at_the_name_without_chasing() {
        let response = run(&question("alias.example.com.", QueryType::Wildcard)).unwrap();

        assert_eq!(
            vec![cname_record("alias.example.com.", "a.example.com.")],
            response.answers
        );
    }

    #[test]
    fn edns_query_gets_an_opt_reply() {
        let mut query = a_question("a.example.com.");
        query.additional.push(
            Edns {
                payload_size: 4096,
                extended_rcode: 0,
                version: 0,
                dnssec_ok: false,
            }
            .to_rr(),
        );

        let response = run(&query).unwrap();
        let edns = response.edns().unwrap().unwrap();
        assert_eq!(DEFAULT_UDP_PAYLOAD_MAX, edns.payload_size);
        assert_eq!(0, edns.version);
        assert_eq!(0, edns.extended_rcode);
    }

    #[test]
    fn plain_query_gets_no_opt() {
        let response = run(&a_question("a.example.com.")).unwrap();
        assert_eq!(Ok(None), response.edns());
    }

    #[test]
    fn unsupported_edns_version_is_badvers() {
        let mut query = a_question("a.example.com.");
        query.additional.push(
            Edns {
                payload_size: 4096,
                extended_rcode: 0,
                version: 1,
                dnssec_ok: false,
            }
            .to_rr(),
        );

        let response = run(&query).unwrap();
        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.answers.is_empty());

        let edns = response.edns().unwrap().unwrap();
        assert_eq!(BADVERS_EXTENDED_RCODE, edns.extended_rcode);
        assert_eq!(0, edns.version);
    }

    #[test]
    fn duplicate_opt_is_formerr() {
        let mut query = a_question("a.example.com.");
        let opt = Edns {
            payload_size: 4096,
            extended_rcode: 0,
            version: 0,
            dnssec_ok: false,
        }
        .to_rr();
        query.additional.push(opt.clone());
        query.additional.push(opt);

        let response = run(&query).unwrap();
        assert_eq!(Rcode::FormatError, response.header.rcode);
    }

    #[test]
    fn multiple_questions_are_formerr() {
        let mut query = a_question("a.example.com.");
        query.questions.push(Question {
            name: domain("b.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        });

        let response = run(&query).unwrap();
        assert_eq!(Rcode::FormatError, response.header.rcode);
    }

    #[test]
    fn inbound_notify_is_notimp() {
        let mut query = question("example.com.", QueryType::Record(RecordType::SOA));
        query.header.opcode = Opcode::Notify;

        let response = run(&query).unwrap();
        assert_eq!(Rcode::NotImplemented, response.header.rcode);
        assert_eq!(Opcode::Notify, response.header.opcode);
    }

    #[test]
    fn responses_are_answered_with_formerr() {
        let mut query = a_question("a.example.com.");
        query.header.is_response = true;

        let response = run(&query).unwrap();
        assert_eq!(Rcode::FormatError, response.header.rcode);
    }

    #[test]
    fn unknown_class_is_refused() {
        let mut query = a_question("a.example.com.");
        query.questions[0].qclass = QueryClass::Record(RecordClass::from(3));

        let response = run(&query).unwrap();
        assert_eq!(Rcode::Refused, response.header.rcode);
    }

    #[test]
    fn oversized_datagram_response_truncates_to_the_question() {
        let mut zone = test_zone();
        for i in 0..60 {
            let rr = txt_record(
                "big.example.com.",
                &format!("record number {i} padding padding padding"),
            );
            zone.insert(&rr.name, rr.rtype_with_data, rr.ttl).unwrap();
        }
        let mut zones = ZoneSet::new();
        zones.insert(zone);
        let catalog = Catalog::new(zones);

        let query = question("big.example.com.", QueryType::Record(RecordType::TXT));

        let wire = {
            let mut processor =
                QueryProcessor::new(&catalog, TransportPolicy::datagram(CLASSIC_UDP_PAYLOAD));
            let mut out = BytesMut::new();
            assert!(serve_exchange(
                &mut processor,
                &query.to_octets().unwrap(),
                &mut out
            ));
            assert!(processor.summary().unwrap().truncated);
            out
        };

        assert!(wire.len() <= usize::from(CLASSIC_UDP_PAYLOAD));
        let response = Message::from_octets(&wire).unwrap();
        assert!(response.header.is_truncated);
        assert_eq!(query.questions, response.questions);
        assert!(response.answers.is_empty());
        assert!(response.authority.is_empty());
        assert!(response.additional.is_empty());

        // the same query over a stream comes back whole
        let response = run_with(
            &catalog,
            TransportPolicy::stream(),
            &query.to_octets().unwrap(),
        )
        .unwrap();
        assert!(!response.header.is_truncated);
        assert_eq!(60, response.answers.len());
    }

    #[test]
    fn summary_reflects_the_response() {
        let catalog = Catalog::new(test_zone_set());
        let mut processor =
            QueryProcessor::new(&catalog, TransportPolicy::datagram(DEFAULT_UDP_PAYLOAD_MAX));
        let mut out = BytesMut::new();

        assert!(serve_exchange(
            &mut processor,
            &a_question("missing.example.com.").to_octets().unwrap(),
            &mut out
        ));

        let summary = processor.summary().unwrap();
        assert_eq!(Rcode::NameError, summary.rcode);
        assert!(summary.authoritative);
        assert!(!summary.truncated);

        // reset clears it for the next exchange
        assert_eq!(LayerState::Reset, processor.reset());
        assert!(processor.summary().is_none());
    }
}
