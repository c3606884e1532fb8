//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.
//!
//! Parsing is total: every octet sequence either decodes to a message
//! or to an [`Error`] locating the failure by byte offset.  Errors
//! raised after the header has been consumed also carry the message
//! ID, so a FORMERR response can still be linked to the query.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

/// How many compression pointers a single name may dereference before
/// it is rejected.  Pointers must also go strictly backwards, so this
/// is a second line of defence, not the only one.
pub const POINTER_DEREF_LIMIT: u8 = 127;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let id = wire_header.header.id;
        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(id, buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let Some(id) = buffer.next_u16() else {
            return Err(buffer.error(ErrorKind::HeaderTooShort, None));
        };
        let fail = |buffer: &ConsumableBuffer| buffer.error(ErrorKind::HeaderTooShort, Some(id));

        let flags1 = buffer.next_u8().ok_or_else(|| fail(buffer))?;
        let flags2 = buffer.next_u8().ok_or_else(|| fail(buffer))?;
        let qdcount = buffer.next_u16().ok_or_else(|| fail(buffer))?;
        let ancount = buffer.next_u16().ok_or_else(|| fail(buffer))?;
        let nscount = buffer.next_u16().ok_or_else(|| fail(buffer))?;
        let arcount = buffer.next_u16().ok_or_else(|| fail(buffer))?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from(flags2 & HEADER_MASK_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer
            .next_u16()
            .map(QueryType::from)
            .ok_or_else(|| buffer.error(ErrorKind::QuestionTooShort, Some(id)))?;
        let qclass = buffer
            .next_u16()
            .map(QueryClass::from)
            .ok_or_else(|| buffer.error(ErrorKind::QuestionTooShort, Some(id)))?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let fail =
            |buffer: &ConsumableBuffer| buffer.error(ErrorKind::ResourceRecordTooShort, Some(id));

        let name = DomainName::deserialise(id, buffer)?;
        let rtype = buffer
            .next_u16()
            .map(RecordType::from)
            .ok_or_else(|| fail(buffer))?;
        let rclass = buffer
            .next_u16()
            .map(RecordClass::from)
            .ok_or_else(|| fail(buffer))?;
        let ttl = buffer.next_u32().ok_or_else(|| fail(buffer))?;
        let rdlength = buffer.next_u16().ok_or_else(|| fail(buffer))?;

        let rdata_start = buffer.position;

        let mut raw_rdata = |buffer: &mut ConsumableBuffer| {
            if let Some(octets) = buffer.take(rdlength as usize) {
                Ok(bytes::Bytes::copy_from_slice(octets))
            } else {
                Err(fail(buffer))
            }
        };

        // records which contain domain names are decoded, so any
        // compression pointers get expanded
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(buffer.next_u32().ok_or_else(|| fail(buffer))?),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(id, buffer)?,
                rname: DomainName::deserialise(id, buffer)?,
                serial: buffer.next_u32().ok_or_else(|| fail(buffer))?,
                refresh: buffer.next_u32().ok_or_else(|| fail(buffer))?,
                retry: buffer.next_u32().ok_or_else(|| fail(buffer))?,
                expire: buffer.next_u32().ok_or_else(|| fail(buffer))?,
                minimum: buffer.next_u32().ok_or_else(|| fail(buffer))?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.next_u16().ok_or_else(|| fail(buffer))?,
                exchange: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: raw_rdata(buffer)?,
            },
            RecordType::AAAA => {
                let mut segments = [0u16; 8];
                for segment in &mut segments {
                    *segment = buffer.next_u16().ok_or_else(|| fail(buffer))?;
                }
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(segments),
                }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.next_u16().ok_or_else(|| fail(buffer))?,
                weight: buffer.next_u16().ok_or_else(|| fail(buffer))?,
                port: buffer.next_u16().ok_or_else(|| fail(buffer))?,
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::DNAME => RecordTypeWithData::DNAME {
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::OPT => RecordTypeWithData::OPT {
                octets: raw_rdata(buffer)?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: raw_rdata(buffer)?,
            },
        };

        let rdata_stop = buffer.position;

        if rdata_stop == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(buffer.error(ErrorKind::ResourceRecordInvalid, Some(id)))
        }
    }
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        Self::deserialise_jumping(id, buffer, POINTER_DEREF_LIMIT)
    }

    #[allow(clippy::missing_panics_doc)]
    fn deserialise_jumping(
        id: u16,
        buffer: &mut ConsumableBuffer,
        jump_budget: u8,
    ) -> Result<Self, Error> {
        let mut octet_count = 0;
        let mut labels = Vec::<Label>::with_capacity(5);
        let start = buffer.position;

        'outer: loop {
            let size = buffer
                .next_u8()
                .ok_or_else(|| buffer.error(ErrorKind::DomainTooShort, Some(id)))?;

            if usize::from(size) <= LABEL_MAX_LEN {
                octet_count += 1;

                if size == 0 {
                    labels.push(Label::new());
                    break 'outer;
                }

                if let Some(os) = buffer.take(size as usize) {
                    // safe because of the bounds check above
                    let label = Label::try_from(os).unwrap();
                    octet_count += usize::from(label.len());
                    labels.push(label);
                } else {
                    return Err(buffer.error(ErrorKind::DomainTooShort, Some(id)));
                }

                if octet_count > DOMAINNAME_MAX_LEN {
                    break 'outer;
                }
            } else if size >= 192 {
                // a compression pointer: the remaining six bits and
                // the next octet index the prior occurrence
                if jump_budget == 0 {
                    return Err(buffer.error(ErrorKind::DomainPointerLimit, Some(id)));
                }

                let hi = size & 0b0011_1111;
                let lo = buffer
                    .next_u8()
                    .ok_or_else(|| buffer.error(ErrorKind::DomainTooShort, Some(id)))?;
                let ptr = u16::from_be_bytes([hi, lo]).into();

                // pointers must be to an earlier occurrence (not
                // merely a different one: an earlier one: RFC 1035
                // section 4.1.4), which also rules out cycles
                if ptr >= start {
                    return Err(buffer.error(ErrorKind::DomainPointerInvalid, Some(id)));
                }

                let mut other = DomainName::deserialise_jumping(
                    id,
                    &mut buffer.at_offset(ptr),
                    jump_budget - 1,
                )?;
                octet_count += other.len;
                labels.append(&mut other.labels);
                break 'outer;
            } else {
                return Err(buffer.error(ErrorKind::DomainLabelInvalid, Some(id)));
            }
        }

        if octet_count <= DOMAINNAME_MAX_LEN {
            // the loop only terminates successfully on the null label,
            // so the `DomainName` invariants hold by construction
            Ok(DomainName {
                labels,
                len: octet_count,
            })
        } else {
            Err(buffer.error(ErrorKind::DomainTooLong, Some(id)))
        }
    }
}

/// Errors encountered when parsing a datagram.
///
/// The `offset` is the position in the octet stream at which parsing
/// stopped; it never exceeds the input length.  The `id` is the header
/// ID, present whenever at least the first two octets were readable -
/// without it, an error response cannot be linked with the query.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Error {
    pub kind: ErrorKind,
    pub offset: usize,
    pub id: Option<u16>,
}

impl Error {
    pub fn id(&self) -> Option<u16> {
        self.id
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} at offset {}", self.kind, self.offset)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// The ways parsing can fail.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The header is missing one or more required fields.
    HeaderTooShort,

    /// A question ends with an incomplete field.
    QuestionTooShort,

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort,

    /// A resource record's RDATA does not match its RDLENGTH.
    ResourceRecordInvalid,

    /// A domain is incomplete.
    DomainTooShort,

    /// A domain is over 255 octets in size.
    DomainTooLong,

    /// A domain pointer points to or after the current name.
    DomainPointerInvalid,

    /// A domain followed too many pointers.
    DomainPointerLimit,

    /// A domain label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::HeaderTooShort => write!(f, "header too short"),
            ErrorKind::QuestionTooShort => write!(f, "question too short"),
            ErrorKind::ResourceRecordTooShort => write!(f, "resource record too short"),
            ErrorKind::ResourceRecordInvalid => write!(f, "resource record invalid"),
            ErrorKind::DomainTooShort => write!(f, "domain too short"),
            ErrorKind::DomainTooLong => write!(f, "domain too long"),
            ErrorKind::DomainPointerInvalid => write!(f, "domain pointer invalid"),
            ErrorKind::DomainPointerLimit => write!(f, "domain pointer limit reached"),
            ErrorKind::DomainLabelInvalid => write!(f, "domain label invalid"),
        }
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    pub position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }

    pub fn error(&self, kind: ErrorKind, id: Option<u16>) -> Error {
        Error {
            kind,
            offset: self.position,
            id,
        }
    }
}
