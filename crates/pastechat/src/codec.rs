//! Plain-text blobs that the two operators copy between each other.
//!
//! Every blob is a single-line JSON object with a `type` discriminator:
//!
//! ```text
//! {"sdp":"v=0\r\no=- ...","type":"offer"}
//! {"candidate":"candidate:1 1 udp ...","sdpMLineIndex":0,"sdpMid":"0","type":"candidate"}
//! ```
//!
//! Descriptions use the same shape a browser produces for
//! `JSON.stringify(RTCSessionDescription)`. A browser's
//! `JSON.stringify(RTCIceCandidate)` carries no `type` field; [`decode`]
//! accepts that form too and treats it as a candidate.

use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::CodecError;

const CANDIDATE_TAG: &str = "candidate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

/// A local or remote offer/answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One network path descriptor, in the shape `RTCIceCandidateInit` uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeBlob {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl From<SessionDescription> for ExchangeBlob {
    fn from(desc: SessionDescription) -> Self {
        ExchangeBlob::Description(desc)
    }
}

impl From<IceCandidate> for ExchangeBlob {
    fn from(candidate: IceCandidate) -> Self {
        ExchangeBlob::Candidate(candidate)
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireBlob {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl From<WireBlob> for ExchangeBlob {
    fn from(wire: WireBlob) -> Self {
        match wire {
            WireBlob::Offer { sdp } => SessionDescription::offer(sdp).into(),
            WireBlob::Answer { sdp } => SessionDescription::answer(sdp).into(),
            WireBlob::Candidate(candidate) => candidate.into(),
        }
    }
}

/// Renders a blob as one line of copyable text. Control characters and the
/// Unicode line/paragraph separators inside string fields come out as
/// `\uXXXX` escapes.
pub fn encode(blob: &ExchangeBlob) -> String {
    let value = match blob {
        ExchangeBlob::Description(desc) => json!({
            "type": desc.kind.as_str(),
            "sdp": desc.sdp,
        }),
        ExchangeBlob::Candidate(candidate) => {
            let mut fields = Map::new();
            fields.insert("type".into(), Value::from(CANDIDATE_TAG));
            fields.insert("candidate".into(), Value::from(candidate.candidate.as_str()));
            if let Some(mid) = &candidate.sdp_mid {
                fields.insert("sdpMid".into(), Value::from(mid.as_str()));
            }
            if let Some(index) = candidate.sdp_mline_index {
                fields.insert("sdpMLineIndex".into(), Value::from(index));
            }
            if let Some(ufrag) = &candidate.username_fragment {
                fields.insert("usernameFragment".into(), Value::from(ufrag.as_str()));
            }
            Value::Object(fields)
        }
    };
    escape_controls(value.to_string())
}

// serde_json already escapes C0 controls; DEL, the C1 range and the Unicode
// line/paragraph separators pass through.
fn escape_controls(text: String) -> String {
    if !text.chars().any(breaks_copy) {
        return text;
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        if breaks_copy(ch) {
            let _ = write!(escaped, "\\u{:04x}", ch as u32);
        } else {
            escaped.push(ch);
        }
    }
    escaped
}

fn breaks_copy(ch: char) -> bool {
    ch.is_control() || matches!(ch, '\u{2028}' | '\u{2029}')
}

pub fn encode_description(desc: &SessionDescription) -> String {
    encode(&ExchangeBlob::Description(desc.clone()))
}

pub fn encode_candidate(candidate: &IceCandidate) -> String {
    encode(&ExchangeBlob::Candidate(candidate.clone()))
}

/// Parses pasted text. Only the shape is checked here; whether the SDP or
/// candidate line makes sense is left to the transport.
pub fn decode(text: &str) -> Result<ExchangeBlob, CodecError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(malformed("input is empty"));
    }
    let mut value: Value =
        serde_json::from_str(trimmed).map_err(|err| malformed(format!("not json: {err}")))?;
    let Value::Object(fields) = &mut value else {
        return Err(malformed("expected a json object"));
    };
    if !fields.contains_key("type") && fields.contains_key(CANDIDATE_TAG) {
        fields.insert("type".into(), Value::from(CANDIDATE_TAG));
    }
    let wire: WireBlob = serde_json::from_value(value).map_err(|err| malformed(err.to_string()))?;
    Ok(wire.into())
}

pub fn decode_description(text: &str) -> Result<SessionDescription, CodecError> {
    match decode(text)? {
        ExchangeBlob::Description(desc) => Ok(desc),
        ExchangeBlob::Candidate(_) => Err(malformed(
            "expected a session description, found a candidate",
        )),
    }
}

pub fn decode_candidate(text: &str) -> Result<IceCandidate, CodecError> {
    match decode(text)? {
        ExchangeBlob::Candidate(candidate) => Ok(candidate),
        ExchangeBlob::Description(desc) => Err(malformed(format!(
            "expected a candidate, found an {}",
            desc.kind.as_str()
        ))),
    }
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedInput(reason.into())
}
