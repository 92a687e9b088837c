//! # Wire Protocol Messages
//!
//! Every frame on the wire is `serialize(header) || tag || serialize(body)`
//! where `tag` is a single byte from a fixed enumeration. Serialization is
//! bincode with fixed-width little-endian integers and size limits;
//! optional fields carry a single presence byte. Addresses and public keys
//! are raw 32-byte strings.
//!
//! | Tag | Body |
//! |-----|------|
//! | 1 | [`Connect`] |
//! | 2 | [`ConnectResponse`] |
//! | 3 | [`FindGroup`] |
//! | 4 | [`FindGroupResponse`] |
//! | 5 | [`GetData`] |
//! | 6 | [`GetDataResponse`] |
//! | 7 | [`PutData`] |
//! | 8 | [`PutDataResponse`] |
//! | 9 | [`Post`] |
//!
//! Signatures, when present in the header, cover exactly the serialized
//! body bytes (domain-prefixed, see [`crate::identity::sign_body`]); the
//! header itself is not covered.
//!
//! ## Security Limits
//!
//! All deserialization of untrusted bytes goes through size-limited
//! bincode options to prevent memory exhaustion from forged length
//! prefixes.

use std::io::Read;

use anyhow::{Context, Result, bail};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::filter::FilterValue;
use crate::identity::{Address, NodeInfo};

/// Maximum size of an application payload (1 MiB).
pub const MAX_DATA_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for frame deserialization.
/// Slightly larger than MAX_DATA_SIZE to allow for header and framing.
pub const MAX_FRAME_SIZE: u64 = (MAX_DATA_SIZE as u64) + 4096;

/// Domain prefix for filter fingerprints.
const FILTER_HASH_DOMAIN: &[u8] = b"weft-filter-v1:";

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization of untrusted bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Message origin: the sending node, plus the group it was speaking for
/// when the message was sent on behalf of a close group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAddress {
    pub node: Address,
    pub group: Option<Address>,
}

impl SourceAddress {
    pub fn node(node: Address) -> Self {
        Self { node, group: None }
    }
}

/// Message destination: the routed-toward address, plus the relay through
/// which an unattached source is reachable (set on requests sent before
/// the sender has acquired routing peers, copied into replies so they can
/// travel back through the relay).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationAddress {
    pub addr: Address,
    pub reply_to: Option<Address>,
}

impl DestinationAddress {
    pub fn direct(addr: Address) -> Self {
        Self {
            addr,
            reply_to: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub source: SourceAddress,
    pub destination: DestinationAddress,
    pub message_id: u64,
    pub signature: Option<Vec<u8>>,
}

impl Header {
    /// Fingerprint for per-hop deduplication, derived from
    /// `(source node, message_id)`.
    pub fn filter_value(&self) -> FilterValue {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FILTER_HASH_DOMAIN);
        hasher.update(self.source.node.as_bytes());
        hasher.update(&self.message_id.to_le_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Single-byte wire tag identifying the body type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Connect = 1,
    ConnectResponse = 2,
    FindGroup = 3,
    FindGroupResponse = 4,
    GetData = 5,
    GetDataResponse = 6,
    PutData = 7,
    PutDataResponse = 8,
    Post = 9,
}

impl TryFrom<u8> for MessageTag {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageTag::Connect,
            2 => MessageTag::ConnectResponse,
            3 => MessageTag::FindGroup,
            4 => MessageTag::FindGroupResponse,
            5 => MessageTag::GetData,
            6 => MessageTag::GetDataResponse,
            7 => MessageTag::PutData,
            8 => MessageTag::PutDataResponse,
            9 => MessageTag::Post,
            other => bail!("unknown message tag {other}"),
        })
    }
}

/// Ask a peer to open a persistent connection to us.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub requester: NodeInfo,
}

/// Accept a connection request; carries the responder's own record so the
/// requester can reach it. Signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub requester: Address,
    pub receiver: NodeInfo,
}

/// Ask the close group of `target` for its membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindGroup {
    pub requester: Address,
    pub target: Address,
}

/// Close-group snapshot of the responding node. Signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindGroupResponse {
    pub requester: Address,
    pub group: Vec<NodeInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetData {
    pub key: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataResponse {
    pub key: Address,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutData {
    pub key: Address,
    pub value: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutDataResponse {
    pub key: Address,
}

/// Application-opaque payload delivered to the destination's close group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub payload: Vec<u8>,
}

/// Closed union of message bodies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Connect(Connect),
    ConnectResponse(ConnectResponse),
    FindGroup(FindGroup),
    FindGroupResponse(FindGroupResponse),
    GetData(GetData),
    GetDataResponse(GetDataResponse),
    PutData(PutData),
    PutDataResponse(PutDataResponse),
    Post(Post),
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Connect(_) => MessageTag::Connect,
            Message::ConnectResponse(_) => MessageTag::ConnectResponse,
            Message::FindGroup(_) => MessageTag::FindGroup,
            Message::FindGroupResponse(_) => MessageTag::FindGroupResponse,
            Message::GetData(_) => MessageTag::GetData,
            Message::GetDataResponse(_) => MessageTag::GetDataResponse,
            Message::PutData(_) => MessageTag::PutData,
            Message::PutDataResponse(_) => MessageTag::PutDataResponse,
            Message::Post(_) => MessageTag::Post,
        }
    }

    /// Length of the embedded application payload, for bodies that carry
    /// one. Used to enforce [`MAX_DATA_SIZE`] on sends.
    pub fn payload_len(&self) -> Option<usize> {
        match self {
            Message::GetDataResponse(r) => Some(r.value.len()),
            Message::PutData(p) => Some(p.value.len()),
            Message::Post(p) => Some(p.payload.len()),
            _ => None,
        }
    }

    /// Is this a response body, correlated to a pending task by the
    /// header's message id?
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::ConnectResponse(_)
                | Message::FindGroupResponse(_)
                | Message::GetDataResponse(_)
                | Message::PutDataResponse(_)
        )
    }

    /// Serialize just the body bytes — the exact bytes a header signature
    /// covers.
    pub fn serialize_body(&self) -> Result<Vec<u8>, bincode::Error> {
        let opts = bincode_options();
        match self {
            Message::Connect(b) => opts.serialize(b),
            Message::ConnectResponse(b) => opts.serialize(b),
            Message::FindGroup(b) => opts.serialize(b),
            Message::FindGroupResponse(b) => opts.serialize(b),
            Message::GetData(b) => opts.serialize(b),
            Message::GetDataResponse(b) => opts.serialize(b),
            Message::PutData(b) => opts.serialize(b),
            Message::PutDataResponse(b) => opts.serialize(b),
            Message::Post(b) => opts.serialize(b),
        }
    }
}

/// Serialize a complete frame: header, tag byte, body.
pub fn serialize_frame(header: &Header, body: &Message) -> Result<Vec<u8>> {
    let mut frame = bincode_options()
        .serialize(header)
        .context("serialize header")?;
    frame.push(body.tag() as u8);
    frame.extend_from_slice(&body.serialize_body().context("serialize body")?);
    Ok(frame)
}

/// Parse a complete frame back into header and typed body.
///
/// Any malformed input — truncated header, unknown tag, truncated or
/// oversized body — is an error; the router drops such frames silently.
pub fn parse_frame(bytes: &[u8]) -> Result<(Header, Message)> {
    let mut reader = bytes;

    let header: Header = bincode_options()
        .deserialize_from(&mut reader)
        .context("parse header")?;

    let mut tag_byte = [0u8; 1];
    reader
        .read_exact(&mut tag_byte)
        .context("frame truncated before tag")?;
    let tag = MessageTag::try_from(tag_byte[0])?;

    let opts = bincode_options();
    let body = match tag {
        MessageTag::Connect => Message::Connect(opts.deserialize_from(&mut reader)?),
        MessageTag::ConnectResponse => {
            Message::ConnectResponse(opts.deserialize_from(&mut reader)?)
        }
        MessageTag::FindGroup => Message::FindGroup(opts.deserialize_from(&mut reader)?),
        MessageTag::FindGroupResponse => {
            Message::FindGroupResponse(opts.deserialize_from(&mut reader)?)
        }
        MessageTag::GetData => Message::GetData(opts.deserialize_from(&mut reader)?),
        MessageTag::GetDataResponse => {
            Message::GetDataResponse(opts.deserialize_from(&mut reader)?)
        }
        MessageTag::PutData => Message::PutData(opts.deserialize_from(&mut reader)?),
        MessageTag::PutDataResponse => {
            Message::PutDataResponse(opts.deserialize_from(&mut reader)?)
        }
        MessageTag::Post => Message::Post(opts.deserialize_from(&mut reader)?),
    };

    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, sign_body, verify_body};

    fn make_address(seed: u8) -> Address {
        Address::from_bytes([seed; 32])
    }

    fn make_info(seed: u8) -> NodeInfo {
        NodeInfo::new(make_address(seed), [seed; 32], format!("10.0.0.{seed}:4000"))
    }

    fn make_header(seed: u8, message_id: u64) -> Header {
        Header {
            source: SourceAddress::node(make_address(seed)),
            destination: DestinationAddress::direct(make_address(seed.wrapping_add(1))),
            message_id,
            signature: None,
        }
    }

    fn all_variants() -> Vec<Message> {
        vec![
            Message::Connect(Connect {
                requester: make_info(3),
            }),
            Message::ConnectResponse(ConnectResponse {
                requester: make_address(4),
                receiver: make_info(5),
            }),
            Message::FindGroup(FindGroup {
                requester: make_address(6),
                target: make_address(7),
            }),
            Message::FindGroupResponse(FindGroupResponse {
                requester: make_address(8),
                group: vec![make_info(9), make_info(10)],
            }),
            Message::GetData(GetData {
                key: make_address(11),
            }),
            Message::GetDataResponse(GetDataResponse {
                key: make_address(12),
                value: b"cached value".to_vec(),
            }),
            Message::PutData(PutData {
                key: make_address(13),
                value: b"stored value".to_vec(),
            }),
            Message::PutDataResponse(PutDataResponse {
                key: make_address(14),
            }),
            Message::Post(Post {
                payload: b"application payload".to_vec(),
            }),
        ]
    }

    #[test]
    fn frame_roundtrip_all_variants() {
        for (i, body) in all_variants().into_iter().enumerate() {
            let header = make_header(i as u8 + 1, 0x0123_4567_89AB_CDEF ^ i as u64);
            let frame = serialize_frame(&header, &body).expect("serialize failed");
            let (parsed_header, parsed_body) = parse_frame(&frame).expect("parse failed");
            assert_eq!(parsed_header, header);
            assert_eq!(parsed_body, body);
        }
    }

    #[test]
    fn frame_roundtrip_with_optional_fields() {
        let header = Header {
            source: SourceAddress {
                node: make_address(1),
                group: Some(make_address(2)),
            },
            destination: DestinationAddress {
                addr: make_address(3),
                reply_to: Some(make_address(4)),
            },
            message_id: 42,
            signature: Some(vec![0xAB; 64]),
        };
        let body = Message::Post(Post {
            payload: vec![1, 2, 3],
        });

        let frame = serialize_frame(&header, &body).unwrap();
        let (parsed_header, parsed_body) = parse_frame(&frame).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_body, body);
    }

    #[test]
    fn tag_byte_values_fixed() {
        assert_eq!(MessageTag::Connect as u8, 1);
        assert_eq!(MessageTag::ConnectResponse as u8, 2);
        assert_eq!(MessageTag::FindGroup as u8, 3);
        assert_eq!(MessageTag::FindGroupResponse as u8, 4);
        assert_eq!(MessageTag::GetData as u8, 5);
        assert_eq!(MessageTag::GetDataResponse as u8, 6);
        assert_eq!(MessageTag::PutData as u8, 7);
        assert_eq!(MessageTag::PutDataResponse as u8, 8);
        assert_eq!(MessageTag::Post as u8, 9);

        for raw in [0u8, 10, 0xFF] {
            assert!(MessageTag::try_from(raw).is_err());
        }
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(parse_frame(&[]).is_err());
        assert!(parse_frame(&[0xFF, 0xFE, 0xFD]).is_err());

        let header = make_header(1, 7);
        let body = Message::Post(Post {
            payload: b"hello".to_vec(),
        });
        let frame = serialize_frame(&header, &body).unwrap();

        // Truncation anywhere in the body fails the parse.
        assert!(parse_frame(&frame[..frame.len() - 3]).is_err());
        // Truncation right after the header leaves no tag.
        let header_len = bincode_options().serialize(&header).unwrap().len();
        assert!(parse_frame(&frame[..header_len]).is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        let header = make_header(1, 7);
        let body = Message::Post(Post {
            payload: b"hello".to_vec(),
        });
        let mut frame = serialize_frame(&header, &body).unwrap();
        let header_len = bincode_options().serialize(&header).unwrap().len();
        frame[header_len] = 0x7F;
        assert!(parse_frame(&frame).is_err());
    }

    #[test]
    fn filter_value_depends_on_source_and_id() {
        let a = make_header(1, 100).filter_value();
        let same = make_header(1, 100).filter_value();
        let other_source = make_header(2, 100).filter_value();
        let other_id = make_header(1, 101).filter_value();

        assert_eq!(a, same);
        assert_ne!(a, other_source);
        assert_ne!(a, other_id);
    }

    #[test]
    fn filter_value_ignores_destination() {
        let mut h1 = make_header(1, 100);
        let mut h2 = make_header(1, 100);
        h1.destination = DestinationAddress::direct(make_address(50));
        h2.destination = DestinationAddress::direct(make_address(51));
        assert_eq!(h1.filter_value(), h2.filter_value());
    }

    #[test]
    fn signature_covers_exactly_the_body() {
        let kp = Keypair::generate();
        let body = Message::ConnectResponse(ConnectResponse {
            requester: make_address(1),
            receiver: kp.node_info("127.0.0.1:4000"),
        });
        let body_bytes = body.serialize_body().unwrap();
        let signature = sign_body(&kp, &body_bytes);

        let header = Header {
            source: SourceAddress::node(kp.address()),
            destination: DestinationAddress::direct(make_address(1)),
            message_id: 9,
            signature: Some(signature),
        };
        let frame = serialize_frame(&header, &body).unwrap();
        let (parsed_header, parsed_body) = parse_frame(&frame).unwrap();

        // The parsed signature verifies against the re-serialized body.
        let parsed_bytes = parsed_body.serialize_body().unwrap();
        assert!(
            verify_body(
                &parsed_header.source.node,
                &parsed_bytes,
                parsed_header.signature.as_deref().unwrap(),
            )
            .is_ok()
        );

        // A different body does not verify.
        let other = Message::Post(Post {
            payload: vec![0xEE],
        })
        .serialize_body()
        .unwrap();
        assert!(
            verify_body(
                &parsed_header.source.node,
                &other,
                parsed_header.signature.as_deref().unwrap(),
            )
            .is_err()
        );
    }

    #[test]
    fn oversized_body_rejected_by_limit() {
        // A forged length prefix beyond MAX_FRAME_SIZE must not allocate.
        let header = make_header(1, 7);
        let mut frame = bincode_options().serialize(&header).unwrap();
        frame.push(MessageTag::Post as u8);
        // Post { payload } starts with a u64 length; claim 1 GiB.
        frame.extend_from_slice(&(1u64 << 30).to_le_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        assert!(parse_frame(&frame).is_err());
    }

    #[test]
    fn payload_len_reported_for_data_bodies() {
        assert_eq!(
            Message::Post(Post {
                payload: vec![0; 10]
            })
            .payload_len(),
            Some(10)
        );
        assert_eq!(
            Message::PutData(PutData {
                key: make_address(1),
                value: vec![0; 20]
            })
            .payload_len(),
            Some(20)
        );
        assert_eq!(
            Message::GetData(GetData {
                key: make_address(1)
            })
            .payload_len(),
            None
        );
    }

    #[test]
    fn response_classification() {
        for body in all_variants() {
            let expect = matches!(
                body.tag(),
                MessageTag::ConnectResponse
                    | MessageTag::FindGroupResponse
                    | MessageTag::GetDataResponse
                    | MessageTag::PutDataResponse
            );
            assert_eq!(body.is_response(), expect, "tag {:?}", body.tag());
        }
    }
}
