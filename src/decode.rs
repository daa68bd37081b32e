use anyhow::{Context, Result};
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use std::net::Ipv4Addr;

/// Decoded view of one captured DNS response: just the fields the pipeline
/// consumes, not the full message.
#[derive(Debug)]
pub struct ScanResponse {
    /// Question name as it appears inside the packet, trailing dot trimmed.
    pub question: Option<String>,
    pub recursion_available: bool,
    /// Total answer records of any type.
    pub answer_count: usize,
    /// A-record addresses only.
    pub answers: Vec<Ipv4Addr>,
}

/// Decode a hex-encoded wire-format DNS response.
pub fn decode_response(hex_blob: &str) -> Result<ScanResponse> {
    let bytes = hex::decode(hex_blob.trim()).context("payload is not valid hex")?;
    let message = Message::from_vec(&bytes).context("failed to parse DNS response")?;

    let question = message
        .queries()
        .first()
        .map(|q| q.name().to_utf8().trim_end_matches('.').to_string());

    let answers = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect();

    Ok(ScanResponse {
        question,
        recursion_available: message.recursion_available(),
        answer_count: message.answers().len(),
        answers,
    })
}

/// Build a hex-encoded response packet for fixtures.
#[cfg(test)]
pub(crate) fn encode_response(domain: &str, recursion_available: bool, answers: &[Ipv4Addr]) -> String {
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, Record, RecordType};

    let name = Name::from_ascii(format!("{}.", domain)).unwrap();
    let mut message = Message::new();
    message
        .set_message_type(MessageType::Response)
        .set_recursion_available(recursion_available)
        .add_query(Query::query(name.clone(), RecordType::A));
    for addr in answers {
        message.add_answer(Record::from_rdata(name.clone(), 300, RData::A(A(*addr))));
    }
    hex::encode(message.to_vec().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_question_and_answers() {
        let blob = encode_response(
            "example.com",
            true,
            &[Ipv4Addr::new(93, 184, 216, 34), Ipv4Addr::new(93, 184, 216, 35)],
        );
        let response = decode_response(&blob).unwrap();
        assert_eq!(response.question.as_deref(), Some("example.com"));
        assert!(response.recursion_available);
        assert_eq!(response.answer_count, 2);
        assert_eq!(
            response.answers,
            vec![Ipv4Addr::new(93, 184, 216, 34), Ipv4Addr::new(93, 184, 216, 35)]
        );
    }

    #[test]
    fn empty_answer_section() {
        let blob = encode_response("example.com", false, &[]);
        let response = decode_response(&blob).unwrap();
        assert!(!response.recursion_available);
        assert_eq!(response.answer_count, 0);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_response("zz-not-hex").is_err());
        assert!(decode_response("deadbeef").is_err());
        assert!(decode_response("").is_err());
    }
}
