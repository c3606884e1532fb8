//! Parsing of zone master files: the subset of the RFC 1035 section 5
//! format that real zone files use.  `$ORIGIN` and `$TTL` directives,
//! `@`, relative names, parenthesised record continuations, `;`
//! comments, and quoted strings are supported; `$INCLUDE` is not.
//!
//! A zone file must contain exactly one SOA record, at the name that
//! becomes the zone apex.

use bytes::Bytes;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::protocol::types::*;
use crate::zones::types::*;

impl Zone {
    /// Parse a string of zone data.
    ///
    /// # Errors
    ///
    /// If the string cannot be parsed, or the records do not form a
    /// single well-rooted zone.
    pub fn deserialise(data: &str) -> Result<Self, Error> {
        let mut origin: Option<DomainName> = None;
        let mut default_ttl: Option<u32> = None;
        let mut previous_owner: Option<DomainName> = None;
        let mut previous_ttl: Option<u32> = None;
        let mut apex_soa: Option<(DomainName, SOA, u32)> = None;
        let mut rrs: Vec<(DomainName, RecordTypeWithData, u32)> = Vec::new();

        for entry in logical_entries(data)? {
            let LogicalEntry {
                line,
                continues_owner,
                tokens,
            } = entry;

            let fail = |kind| Error { line, kind };

            if !tokens[0].quoted && tokens[0].text.starts_with('$') {
                match tokens[0].text.as_str() {
                    "$ORIGIN" => {
                        let name = tokens.get(1).ok_or_else(|| fail(ErrorKind::MissingField))?;
                        origin = Some(
                            DomainName::from_dotted_string(&name.text)
                                .filter(|_| name.text.ends_with('.'))
                                .ok_or_else(|| fail(ErrorKind::BadName))?,
                        );
                    }
                    "$TTL" => {
                        let ttl = tokens.get(1).ok_or_else(|| fail(ErrorKind::MissingField))?;
                        default_ttl =
                            Some(u32::from_str(&ttl.text).map_err(|_| fail(ErrorKind::BadTtl))?);
                    }
                    _ => return Err(fail(ErrorKind::UnsupportedDirective)),
                }
                continue;
            }

            let mut idx = 0;
            let owner = if continues_owner {
                previous_owner
                    .clone()
                    .ok_or_else(|| fail(ErrorKind::NoPreviousOwner))?
            } else {
                idx = 1;
                resolve_name(&tokens[0].text, origin.as_ref()).ok_or_else(|| {
                    fail(if origin.is_none() {
                        ErrorKind::NoOrigin
                    } else {
                        ErrorKind::BadName
                    })
                })?
            };
            previous_owner = Some(owner.clone());

            // TTL and class may appear in either order before the type
            let mut ttl = None;
            let mut rtype = None;
            while let Some(token) = tokens.get(idx) {
                idx += 1;
                if token.quoted {
                    return Err(fail(ErrorKind::MissingType));
                } else if let Ok(parsed) = u32::from_str(&token.text) {
                    if ttl.replace(parsed).is_some() {
                        return Err(fail(ErrorKind::MissingType));
                    }
                } else if token.text == "IN" {
                    // the only class this server speaks
                } else if RecordClass::from_str(&token.text).is_ok() {
                    return Err(fail(ErrorKind::UnsupportedClass));
                } else {
                    rtype = Some(
                        RecordType::from_str(&token.text)
                            .map_err(|_| fail(ErrorKind::BadType))?,
                    );
                    break;
                }
            }
            let Some(rtype) = rtype else {
                return Err(fail(ErrorKind::MissingType));
            };

            let rdata_tokens = &tokens[idx..];
            let rtype_with_data = parse_rdata(rtype, rdata_tokens, origin.as_ref())
                .map_err(|kind| fail(kind))?;

            let ttl = ttl
                .or(default_ttl)
                .or(previous_ttl)
                .ok_or_else(|| fail(ErrorKind::MissingTtl))?;
            previous_ttl = Some(ttl);

            if let RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } = rtype_with_data
            {
                if apex_soa.is_some() {
                    return Err(fail(ErrorKind::MultipleSOA));
                }
                if owner.is_wildcard() {
                    return Err(fail(ErrorKind::WildcardSOA));
                }
                apex_soa = Some((
                    owner,
                    SOA {
                        mname,
                        rname,
                        serial,
                        refresh,
                        retry,
                        expire,
                        minimum,
                    },
                    ttl,
                ));
            } else {
                rrs.push((owner, rtype_with_data, ttl));
            }
        }

        let Some((apex, soa, soa_ttl)) = apex_soa else {
            return Err(Error {
                line: 0,
                kind: ErrorKind::MissingSOA,
            });
        };

        let mut zone = Zone::new(apex, soa, soa_ttl);
        for (name, rtype_with_data, ttl) in rrs {
            zone.insert(&name, rtype_with_data, ttl)
                .map_err(|error| Error {
                    line: 0,
                    kind: ErrorKind::BadRecord(error),
                })?;
        }

        Ok(zone)
    }
}

fn resolve_name(s: &str, origin: Option<&DomainName>) -> Option<DomainName> {
    if s == "@" {
        origin.cloned()
    } else if s.ends_with('.') {
        DomainName::from_dotted_string(s)
    } else {
        DomainName::from_relative_dotted_string(origin?, s)
    }
}

fn parse_rdata(
    rtype: RecordType,
    tokens: &[Token],
    origin: Option<&DomainName>,
) -> Result<RecordTypeWithData, ErrorKind> {
    let field = |i: usize| -> Result<&Token, ErrorKind> {
        tokens.get(i).ok_or(ErrorKind::MissingField)
    };
    let name_field = |i: usize| -> Result<DomainName, ErrorKind> {
        resolve_name(&field(i)?.text, origin).ok_or(ErrorKind::BadName)
    };
    let u32_field = |i: usize| -> Result<u32, ErrorKind> {
        u32::from_str(&field(i)?.text).map_err(|_| ErrorKind::BadRdata)
    };
    let u16_field = |i: usize| -> Result<u16, ErrorKind> {
        u16::from_str(&field(i)?.text).map_err(|_| ErrorKind::BadRdata)
    };

    let parsed = match rtype {
        RecordType::A => RecordTypeWithData::A {
            address: Ipv4Addr::from_str(&field(0)?.text).map_err(|_| ErrorKind::BadRdata)?,
        },
        RecordType::AAAA => RecordTypeWithData::AAAA {
            address: Ipv6Addr::from_str(&field(0)?.text).map_err(|_| ErrorKind::BadRdata)?,
        },
        RecordType::NS => RecordTypeWithData::NS {
            nsdname: name_field(0)?,
        },
        RecordType::CNAME => RecordTypeWithData::CNAME {
            cname: name_field(0)?,
        },
        RecordType::PTR => RecordTypeWithData::PTR {
            ptrdname: name_field(0)?,
        },
        RecordType::DNAME => RecordTypeWithData::DNAME {
            target: name_field(0)?,
        },
        RecordType::MX => RecordTypeWithData::MX {
            preference: u16_field(0)?,
            exchange: name_field(1)?,
        },
        RecordType::SRV => RecordTypeWithData::SRV {
            priority: u16_field(0)?,
            weight: u16_field(1)?,
            port: u16_field(2)?,
            target: name_field(3)?,
        },
        RecordType::SOA => RecordTypeWithData::SOA {
            mname: name_field(0)?,
            rname: name_field(1)?,
            serial: u32_field(2)?,
            refresh: u32_field(3)?,
            retry: u32_field(4)?,
            expire: u32_field(5)?,
            minimum: u32_field(6)?,
        },
        RecordType::TXT => {
            if tokens.is_empty() {
                return Err(ErrorKind::MissingField);
            }
            let mut octets = Vec::new();
            for token in tokens {
                let chars = token.text.as_bytes();
                if chars.len() > 255 {
                    return Err(ErrorKind::BadRdata);
                }
                octets.push(u8::try_from(chars.len()).unwrap());
                octets.extend_from_slice(chars);
            }
            RecordTypeWithData::TXT {
                octets: Bytes::from(octets),
            }
        }
        _ => return Err(ErrorKind::UnsupportedType),
    };

    Ok(parsed)
}

/// One logical entry: the tokens of a record or directive, with
/// parenthesised continuations already joined.
struct LogicalEntry {
    line: usize,
    continues_owner: bool,
    tokens: Vec<Token>,
}

struct Token {
    text: String,
    quoted: bool,
}

/// Split zone data into logical entries, stripping comments and
/// resolving parentheses and quoted strings.
fn logical_entries(data: &str) -> Result<Vec<LogicalEntry>, Error> {
    let mut entries = Vec::new();
    let mut tokens: Vec<Token> = Vec::new();
    let mut current = String::new();
    let mut entry_line = 1;
    let mut line = 1;
    let mut continues_owner = false;
    let mut seen_any = false;
    let mut paren_depth = 0u32;
    let mut in_quotes = false;
    let mut in_comment = false;

    let fail = |line, kind| Err(Error { line, kind });

    for c in data.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            } else {
                continue;
            }
        }

        match c {
            '"' if !in_comment => {
                if in_quotes {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        quoted: true,
                    });
                    in_quotes = false;
                } else {
                    if !current.is_empty() {
                        return fail(line, ErrorKind::BadQuote);
                    }
                    in_quotes = true;
                }
            }
            _ if in_quotes => {
                if c == '\n' {
                    return fail(line, ErrorKind::BadQuote);
                }
                current.push(c);
            }
            ';' => in_comment = true,
            '(' => {
                flush_token(&mut tokens, &mut current);
                paren_depth += 1;
            }
            ')' => {
                flush_token(&mut tokens, &mut current);
                if paren_depth == 0 {
                    return fail(line, ErrorKind::BadParenthesis);
                }
                paren_depth -= 1;
            }
            '\n' => {
                flush_token(&mut tokens, &mut current);
                if paren_depth == 0 {
                    if !tokens.is_empty() {
                        entries.push(LogicalEntry {
                            line: entry_line,
                            continues_owner,
                            tokens: std::mem::take(&mut tokens),
                        });
                    }
                    entry_line = line + 1;
                    continues_owner = false;
                    seen_any = false;
                }
                line += 1;
            }
            _ if c.is_whitespace() => {
                flush_token(&mut tokens, &mut current);
                if !seen_any && paren_depth == 0 && tokens.is_empty() {
                    continues_owner = true;
                }
            }
            _ => {
                seen_any = true;
                current.push(c);
            }
        }
    }

    if in_quotes {
        return fail(line, ErrorKind::BadQuote);
    }
    if paren_depth != 0 {
        return fail(line, ErrorKind::BadParenthesis);
    }

    flush_token(&mut tokens, &mut current);
    if !tokens.is_empty() {
        entries.push(LogicalEntry {
            line: entry_line,
            continues_owner,
            tokens,
        });
    }

    Ok(entries)
}

fn flush_token(tokens: &mut Vec<Token>, current: &mut String) {
    if !current.is_empty() {
        tokens.push(Token {
            text: std::mem::take(current),
            quoted: false,
        });
    }
}

/// Errors that can occur when parsing a zone file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// The (1-based) line the entry started on; 0 for whole-file
    /// errors.
    pub line: usize,
    pub kind: ErrorKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "line {}: {}", self.line, self.kind)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// The ways zone parsing can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// `$INCLUDE` or an unrecognised `$` directive.
    UnsupportedDirective,
    /// A record with no SOA yet seen and no `$ORIGIN` for relative
    /// names.
    NoOrigin,
    /// A continuation line with no previous owner.
    NoPreviousOwner,
    /// A name that does not parse (or exceeds the length limits).
    BadName,
    /// A TTL that does not parse.
    BadTtl,
    /// No TTL given, and no `$TTL` or previous record to take one
    /// from.
    MissingTtl,
    /// A record with no type field.
    MissingType,
    /// A type this parser does not handle.
    BadType,
    /// A class other than IN.
    UnsupportedClass,
    /// A record type this server cannot load from a zone file.
    UnsupportedType,
    /// RDATA with a missing field.
    MissingField,
    /// RDATA that does not parse.
    BadRdata,
    /// Mismatched quotes.
    BadQuote,
    /// Mismatched parentheses.
    BadParenthesis,
    /// No SOA record in the file.
    MissingSOA,
    /// More than one SOA record.
    MultipleSOA,
    /// A wildcard SOA owner.
    WildcardSOA,
    /// A record which does not fit the zone.
    BadRecord(ZoneInsertError),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::UnsupportedDirective => write!(f, "unsupported directive"),
            ErrorKind::NoOrigin => write!(f, "relative name with no origin"),
            ErrorKind::NoPreviousOwner => write!(f, "continuation line with no previous owner"),
            ErrorKind::BadName => write!(f, "malformed domain name"),
            ErrorKind::BadTtl => write!(f, "malformed TTL"),
            ErrorKind::MissingTtl => write!(f, "no TTL and no default to fall back to"),
            ErrorKind::MissingType => write!(f, "record with no type"),
            ErrorKind::BadType => write!(f, "unrecognised record type"),
            ErrorKind::UnsupportedClass => write!(f, "only class IN is supported"),
            ErrorKind::UnsupportedType => write!(f, "record type cannot be loaded from a file"),
            ErrorKind::MissingField => write!(f, "RDATA field missing"),
            ErrorKind::BadRdata => write!(f, "malformed RDATA"),
            ErrorKind::BadQuote => write!(f, "mismatched quotes"),
            ErrorKind::BadParenthesis => write!(f, "mismatched parentheses"),
            ErrorKind::MissingSOA => write!(f, "zone has no SOA record"),
            ErrorKind::MultipleSOA => write!(f, "zone has more than one SOA record"),
            ErrorKind::WildcardSOA => write!(f, "SOA owner cannot be a wildcard"),
            ErrorKind::BadRecord(error) => write!(f, "{error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::types::test_util::*;
    use crate::zones::types::Lookup;

    const EXAMPLE_ZONE: &str = r#"
$ORIGIN example.com.
$TTL 3600

@       IN SOA  ns1.example.com. hostmaster.example.com. (
                2024010100 ; serial
                10800      ; refresh
                3600       ; retry
                604800     ; expire
                300 )      ; minimum

        IN NS   ns1.example.com.
ns1     IN A    192.0.2.53
a       600 IN A 192.0.2.1
        IN AAAA 2001:db8::1
*.w     IN TXT  "hit"
sub     IN NS   ns1.elsewhere.
mail    IN MX   10 a
_dns.a  IN SRV  0 0 853 a.example.com.
"#;

    #[test]
    fn parses_a_representative_zone() {
        let zone = Zone::deserialise(EXAMPLE_ZONE).unwrap();

        assert_eq!(&domain("example.com."), zone.apex());
        assert_eq!(2024010100, zone.soa().serial);
        assert_eq!(300, zone.negative_ttl());

        match zone.lookup(&domain("a.example.com.")) {
            Some(Lookup::Exact { node }) => {
                let rrset = node.rrset(RecordType::A).unwrap();
                assert_eq!(600, rrset.ttl());
                assert_eq!(
                    &[RecordTypeWithData::A {
                        address: Ipv4Addr::new(192, 0, 2, 1)
                    }],
                    rrset.data()
                );
                // the AAAA continuation line shares the owner but not
                // the explicit TTL
                assert!(node.has(RecordType::AAAA));
            }
            other => panic!("expected exact match, got {other:?}"),
        }

        match zone.lookup(&domain("x.w.example.com.")) {
            Some(Lookup::Wildcard { node }) => assert!(node.has(RecordType::TXT)),
            other => panic!("expected wildcard, got {other:?}"),
        }

        match zone.lookup(&domain("deep.sub.example.com.")) {
            Some(Lookup::Referral { node }) => {
                assert_eq!(&domain("sub.example.com."), node.owner());
            }
            other => panic!("expected referral, got {other:?}"),
        }

        match zone.lookup(&domain("mail.example.com.")) {
            Some(Lookup::Exact { node }) => {
                assert_eq!(
                    &[RecordTypeWithData::MX {
                        preference: 10,
                        exchange: domain("a.example.com.")
                    }],
                    node.rrset(RecordType::MX).unwrap().data()
                );
            }
            other => panic!("expected exact match, got {other:?}"),
        }
    }

    #[test]
    fn txt_strings_are_length_prefixed() {
        let zone = Zone::deserialise(
            "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1. host. 1 2 3 4 5\nt IN TXT \"one two\" plain\n",
        )
        .unwrap();

        match zone.lookup(&domain("t.example.com.")) {
            Some(Lookup::Exact { node }) => {
                let rrset = node.rrset(RecordType::TXT).unwrap();
                assert_eq!(
                    &[RecordTypeWithData::TXT {
                        octets: Bytes::from_static(b"\x07one two\x05plain")
                    }],
                    rrset.data()
                );
            }
            other => panic!("expected exact match, got {other:?}"),
        }
    }

    #[test]
    fn missing_soa_is_an_error() {
        let err =
            Zone::deserialise("$ORIGIN example.com.\n$TTL 300\nwww IN A 192.0.2.1\n").unwrap_err();
        assert_eq!(ErrorKind::MissingSOA, err.kind);
    }

    #[test]
    fn duplicate_soa_is_an_error() {
        let err = Zone::deserialise(
            "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1. host. 1 2 3 4 5\n@ IN SOA ns1. host. 2 2 3 4 5\n",
        )
        .unwrap_err();
        assert_eq!(ErrorKind::MultipleSOA, err.kind);
    }

    #[test]
    fn out_of_zone_record_is_an_error() {
        let err = Zone::deserialise(
            "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1. host. 1 2 3 4 5\nwww.example.org. IN A 192.0.2.1\n",
        )
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::BadRecord(_)));
    }

    #[test]
    fn relative_name_without_origin_is_an_error() {
        let err = Zone::deserialise("www IN A 192.0.2.1\n").unwrap_err();
        assert_eq!(ErrorKind::NoOrigin, err.kind);
        assert_eq!(1, err.line);
    }

    #[test]
    fn include_is_unsupported() {
        let err = Zone::deserialise("$INCLUDE other.zone\n").unwrap_err();
        assert_eq!(ErrorKind::UnsupportedDirective, err.kind);
    }

    #[test]
    fn non_in_class_is_an_error() {
        let err = Zone::deserialise(
            "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1. host. 1 2 3 4 5\nwww CH A 192.0.2.1\n",
        )
        .unwrap_err();
        assert_eq!(ErrorKind::BadType, err.kind);
    }

    #[test]
    fn unbalanced_parentheses_are_an_error() {
        let err = Zone::deserialise(
            "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1. host. ( 1 2 3 4 5\n",
        )
        .unwrap_err();
        assert_eq!(ErrorKind::BadParenthesis, err.kind);
    }

    #[test]
    fn missing_rdata_field_is_an_error() {
        let err = Zone::deserialise(
            "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1. host. 1 2 3 4 5\nmail IN MX 10\n",
        )
        .unwrap_err();
        assert_eq!(ErrorKind::MissingField, err.kind);
    }

    #[test]
    fn error_lines_point_at_the_entry() {
        let err = Zone::deserialise(
            "$ORIGIN example.com.\n$TTL 300\n@ IN SOA ns1. host. 1 2 3 4 5\nbad IN A not-an-ip\n",
        )
        .unwrap_err();
        assert_eq!(ErrorKind::BadRdata, err.kind);
        assert_eq!(4, err.line);
    }
}
