use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

use crate::error::EngineError;

/// TTL of every record synthesized locally.
pub const DEFAULT_TTL: u32 = 300;

/// Decode a request and make sure it carries a question.
pub fn decode(packet: &[u8]) -> Result<Message, EngineError> {
    let msg = Message::from_bytes(packet).map_err(EngineError::Decode)?;
    if msg.queries().is_empty() {
        return Err(EngineError::MissingQuestion);
    }
    Ok(msg)
}

pub fn encode(msg: &Message) -> Result<Bytes, EngineError> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).map_err(EngineError::Encode)?;
    }
    Ok(Bytes::from(out))
}

/// Textual form of the first question name, with the trailing root label.
pub fn question_name(msg: &Message) -> Option<String> {
    msg.queries().first().map(|q| q.name().to_string())
}

pub fn first_query(msg: &Message) -> Option<&Query> {
    msg.queries().first()
}

/// Replace the name of the first question, leaving type and class alone.
pub fn set_question_name(msg: &mut Message, name: Name) {
    let mut queries = msg.take_queries();
    if let Some(first) = queries.first_mut() {
        first.set_name(name);
    }
    msg.add_queries(queries);
}

/// Give a response the question the client asked. Answers owned by the
/// rewritten name are renamed back so stub resolvers accept them.
pub fn restore_question(resp: &[u8], original: &Name, rewritten: &Name) -> Result<Bytes, EngineError> {
    let mut msg = Message::from_bytes(resp).map_err(EngineError::Decode)?;
    set_question_name(&mut msg, original.clone());
    let answers: Vec<Record> = msg
        .take_answers()
        .into_iter()
        .map(|mut record| {
            if record.name() == rewritten {
                record.set_name(original.clone());
            }
            record
        })
        .collect();
    msg.add_answers(answers);
    encode(&msg)
}

#[inline]
pub fn build_response(
    req: &Message,
    rcode: ResponseCode,
    answers: Vec<Record>,
) -> Result<Bytes, EngineError> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);

    let queries: Vec<Query> = req.queries().iter().cloned().collect();
    msg.add_queries(queries);
    for ans in answers {
        msg.add_answer(ans);
    }
    encode(&msg)
}

/// Append the root label if `name` lacks it.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

pub fn parse_fqdn(name: &str) -> Result<Name, ProtoError> {
    Name::from_str(&fqdn(name))
}

pub fn cname_record(name: Name, destination: Name) -> Record {
    Record::from_rdata(name, DEFAULT_TTL, RData::CNAME(CNAME(destination)))
}

pub fn address_record(name: Name, ip: IpAddr) -> Record {
    let rdata = match ip {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    let mut record = Record::from_rdata(name, DEFAULT_TTL, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

pub fn parse_dns_class(v: &str) -> Option<DNSClass> {
    let upper = v.to_ascii_uppercase();
    let parsed = match upper.as_str() {
        "IN" => DNSClass::IN,
        "CH" | "CHAOS" => DNSClass::CH,
        "HS" => DNSClass::HS,
        "NONE" => DNSClass::NONE,
        "ANY" | "*" => DNSClass::ANY,
        _ => return None,
    };
    Some(parsed)
}
