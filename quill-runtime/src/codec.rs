//! Wire protocol for node and client RPC.
//!
//! Every frame shares one header, so election, replication, snapshot
//! transfer, and client commands travel over the same framing:
//!
//! - 4 bytes: frame length (u32 little-endian, not including the prefix)
//! - 8 bytes: request id (correlates responses on the caller side)
//! - 1 byte: direction (0 = request, 1 = response)
//! - 1 byte: one-way flag (requests that expect no reply)
//! - 1 byte: frame type
//! - 1 byte: protocol version
//! - 1 byte: status (meaningful on responses)
//! - 8 bytes: destination node id (0 when unaddressed)
//! - 4 bytes + N: error string (empty unless status is an error)
//! - remainder: payload, interpreted per frame type
//!
//! Payload decoding is pluggable: a [`PayloadRegistry`] maps each frame
//! type to a decode function, so new frame types register a decoder
//! instead of extending a match in the transport.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quill_core::{limits, LogIndex, NodeId, PartitionId, RequestId, TermId};
use quill_raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, Message, RequestVoteRequest, RequestVoteResponse, Snapshot,
};
use thiserror::Error;

/// Protocol version carried in every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size.
const MAX_FRAME_SIZE: u32 = limits::FRAME_BYTES_MAX;

/// Frame type tags: consensus messages.
pub const TYPE_REQUEST_VOTE: u8 = 0;
/// Vote response frame type.
pub const TYPE_VOTE_RESPONSE: u8 = 1;
/// Replication request frame type.
pub const TYPE_APPEND_ENTRIES: u8 = 2;
/// Replication response frame type.
pub const TYPE_APPEND_RESPONSE: u8 = 3;
/// Snapshot transfer frame type.
pub const TYPE_INSTALL_SNAPSHOT: u8 = 4;
/// Snapshot acknowledgment frame type.
pub const TYPE_SNAPSHOT_RESPONSE: u8 = 5;

/// Frame type tags: client operations.
pub const TYPE_CLIENT_APPEND: u8 = 16;
/// Client read query frame type.
pub const TYPE_CLIENT_QUERY: u8 = 17;
/// Leader discovery frame type.
pub const TYPE_GET_LEADER: u8 = 18;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size.
        size: u32,
        /// Maximum allowed.
        max: u32,
    },

    /// Unknown frame type tag.
    #[error("unknown frame type: {tag}")]
    UnknownFrameType {
        /// The unknown tag value.
        tag: u8,
    },

    /// Unsupported protocol version.
    #[error("unsupported protocol version: {version}")]
    UnsupportedVersion {
        /// The version received.
        version: u8,
    },

    /// Insufficient data to decode a frame.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Payload bytes are structurally invalid for their frame type.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// What was wrong.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Whether a frame is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller-initiated frame.
    Request,
    /// Reply correlated by request id.
    Response,
}

impl Direction {
    const fn tag(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Response status carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation succeeded.
    Ok,
    /// The receiving node is not the leader; the error string may carry a
    /// leader hint.
    NotLeader,
    /// The node is overloaded; callers should back off before retrying.
    ServerBusy,
    /// The operation missed its deadline on the server side.
    Timeout,
    /// The operation failed; see the error string.
    Error,
}

impl Status {
    const fn tag(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::NotLeader => 1,
            Self::ServerBusy => 2,
            Self::Timeout => 3,
            Self::Error => 4,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Ok),
            1 => Some(Self::NotLeader),
            2 => Some(Self::ServerBusy),
            3 => Some(Self::Timeout),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

/// The shared frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Correlates responses to pending requests.
    pub request_id: RequestId,
    /// Request or response.
    pub direction: Direction,
    /// True if the sender expects no reply.
    pub one_way: bool,
    /// Frame type; selects the payload decoder.
    pub frame_type: u8,
    /// Protocol version.
    pub version: u8,
    /// Response status.
    pub status: Status,
    /// Destination node (0 when unaddressed, e.g. client frames).
    pub destination: NodeId,
    /// Error detail for non-Ok statuses.
    pub error: String,
}

/// A framed message: header plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame header.
    pub header: FrameHeader,
    /// Payload, interpreted per `header.frame_type`.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a request frame.
    #[must_use]
    pub fn request(
        request_id: RequestId,
        frame_type: u8,
        destination: NodeId,
        one_way: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            header: FrameHeader {
                request_id,
                direction: Direction::Request,
                one_way,
                frame_type,
                version: PROTOCOL_VERSION,
                status: Status::Ok,
                destination,
                error: String::new(),
            },
            payload,
        }
    }

    /// Builds a response frame correlated to a request.
    #[must_use]
    pub fn response(request: &FrameHeader, status: Status, error: String, payload: Bytes) -> Self {
        Self {
            header: FrameHeader {
                request_id: request.request_id,
                direction: Direction::Response,
                one_way: false,
                frame_type: request.frame_type,
                version: PROTOCOL_VERSION,
                status,
                destination: NodeId::new(0),
                error,
            },
            payload,
        }
    }
}

/// Encodes a frame with its length prefix.
///
/// # Errors
/// Returns an error if the frame exceeds the size limit.
pub fn encode_frame(frame: &Frame) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(33 + frame.header.error.len() + frame.payload.len());

    // Length prefix filled in at the end.
    buf.put_u32_le(0);

    buf.put_u64_le(frame.header.request_id.get());
    buf.put_u8(frame.header.direction.tag());
    buf.put_u8(u8::from(frame.header.one_way));
    buf.put_u8(frame.header.frame_type);
    buf.put_u8(frame.header.version);
    buf.put_u8(frame.header.status.tag());
    buf.put_u64_le(frame.header.destination.get());
    // Safe cast: error strings are short.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(frame.header.error.len() as u32);
    buf.put_slice(frame.header.error.as_bytes());
    buf.put_slice(&frame.payload);

    // Safe cast: frame size bounded by MAX_FRAME_SIZE below.
    #[allow(clippy::cast_possible_truncation)]
    let len = (buf.len() - 4) as u32;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    buf[0..4].copy_from_slice(&len.to_le_bytes());

    Ok(buf.freeze())
}

/// Decodes one frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed, so a stream reader
/// can decode back-to-back frames from one buffer.
///
/// # Errors
/// `InsufficientData` when the buffer holds only part of a frame; other
/// errors for malformed frames.
pub fn decode_frame(data: &[u8]) -> CodecResult<(Frame, usize)> {
    if data.len() < 4 {
        return Err(CodecError::InsufficientData {
            need: 4,
            have: data.len(),
        });
    }

    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let total_len = 4 + len as usize;
    if data.len() < total_len {
        return Err(CodecError::InsufficientData {
            need: total_len,
            have: data.len(),
        });
    }

    let mut buf = &data[4..total_len];
    ensure_remaining(buf, 25)?;

    let request_id = RequestId::new(buf.get_u64_le());
    let direction_tag = buf.get_u8();
    let direction = Direction::from_tag(direction_tag).ok_or_else(|| CodecError::InvalidPayload {
        reason: format!("bad direction tag {direction_tag}"),
    })?;
    let one_way = buf.get_u8() != 0;
    let frame_type = buf.get_u8();
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion { version });
    }
    let status_tag = buf.get_u8();
    let status = Status::from_tag(status_tag).ok_or_else(|| CodecError::InvalidPayload {
        reason: format!("bad status tag {status_tag}"),
    })?;
    let destination = NodeId::new(buf.get_u64_le());

    let error_len = buf.get_u32_le() as usize;
    ensure_remaining(buf, error_len)?;
    let error = String::from_utf8(buf[..error_len].to_vec()).map_err(|_| {
        CodecError::InvalidPayload {
            reason: "error string is not utf-8".to_string(),
        }
    })?;
    buf.advance(error_len);

    let payload = Bytes::copy_from_slice(buf);

    Ok((
        Frame {
            header: FrameHeader {
                request_id,
                direction,
                one_way,
                frame_type,
                version,
                status,
                destination,
                error,
            },
            payload,
        },
        total_len,
    ))
}

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A consensus message between nodes.
    Raft(Message),
    /// A client batch append.
    Append {
        /// Target partition.
        partition: PartitionId,
        /// Records in the batch.
        batch_size: u32,
        /// Batch payload.
        data: Bytes,
    },
    /// A client read query.
    Query {
        /// True for leader-confirmed linearizable reads.
        linearizable: bool,
        /// Opaque state-machine query.
        request: Bytes,
    },
    /// Leader discovery probe.
    GetLeader,
    /// Opaque state-machine reply (responses to append/query).
    Reply(Bytes),
    /// The node's current leader hint (response to `GetLeader`).
    Leader(Option<NodeId>),
}

/// Decode function for one frame type.
pub type PayloadDecoder = fn(&FrameHeader, &mut &[u8]) -> CodecResult<Payload>;

/// Registry mapping frame types to payload decoders.
///
/// Replaces per-type dispatch hardcoded into the transport: the receive
/// path resolves the decoder by tag and stays ignorant of payload shapes.
pub struct PayloadRegistry {
    decoders: HashMap<u8, PayloadDecoder>,
}

impl PayloadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Creates a registry with every standard frame type registered.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(TYPE_REQUEST_VOTE, decode_request_vote);
        registry.register(TYPE_VOTE_RESPONSE, decode_vote_response);
        registry.register(TYPE_APPEND_ENTRIES, decode_append_entries);
        registry.register(TYPE_APPEND_RESPONSE, decode_append_response);
        registry.register(TYPE_INSTALL_SNAPSHOT, decode_install_snapshot);
        registry.register(TYPE_SNAPSHOT_RESPONSE, decode_snapshot_response);
        registry.register(TYPE_CLIENT_APPEND, decode_client_append);
        registry.register(TYPE_CLIENT_QUERY, decode_client_query);
        registry.register(TYPE_GET_LEADER, decode_get_leader);
        registry
    }

    /// Registers a decoder for a frame type, replacing any existing one.
    pub fn register(&mut self, frame_type: u8, decoder: PayloadDecoder) {
        self.decoders.insert(frame_type, decoder);
    }

    /// Decodes a frame's payload according to its type.
    ///
    /// # Errors
    /// Returns `UnknownFrameType` for unregistered types, or the
    /// decoder's error for malformed payloads.
    pub fn decode(&self, frame: &Frame) -> CodecResult<Payload> {
        let decoder = self
            .decoders
            .get(&frame.header.frame_type)
            .ok_or(CodecError::UnknownFrameType {
                tag: frame.header.frame_type,
            })?;
        let mut buf = &frame.payload[..];
        decoder(&frame.header, &mut buf)
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Wraps a consensus message in a one-way request frame.
#[must_use]
pub fn message_frame(message: &Message) -> Frame {
    let (frame_type, payload) = encode_message_payload(message);
    Frame::request(RequestId::new(0), frame_type, message.to(), true, payload)
}

/// Encodes a consensus message payload, returning its frame type.
#[must_use]
pub fn encode_message_payload(message: &Message) -> (u8, Bytes) {
    let mut buf = BytesMut::with_capacity(64);
    let frame_type = match message {
        Message::RequestVote(req) => {
            buf.put_u64_le(req.term.get());
            buf.put_u64_le(req.candidate_id.get());
            buf.put_u64_le(req.to.get());
            buf.put_u64_le(req.last_log_index.get());
            buf.put_u64_le(req.last_log_term.get());
            TYPE_REQUEST_VOTE
        }
        Message::RequestVoteResponse(resp) => {
            buf.put_u64_le(resp.term.get());
            buf.put_u64_le(resp.from.get());
            buf.put_u64_le(resp.to.get());
            buf.put_u8(u8::from(resp.vote_granted));
            TYPE_VOTE_RESPONSE
        }
        Message::AppendEntries(req) => {
            buf.put_u64_le(req.term.get());
            buf.put_u64_le(req.leader_id.get());
            buf.put_u64_le(req.to.get());
            buf.put_u64_le(req.prev_log_index.get());
            buf.put_u64_le(req.prev_log_term.get());
            buf.put_u64_le(req.leader_commit.get());
            // Safe cast: batch sizes bounded by APPEND_ENTRIES_BATCH_MAX.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(req.entries.len() as u32);
            for entry in &req.entries {
                entry.encode(&mut buf);
            }
            TYPE_APPEND_ENTRIES
        }
        Message::AppendEntriesResponse(resp) => {
            buf.put_u64_le(resp.term.get());
            buf.put_u64_le(resp.from.get());
            buf.put_u64_le(resp.to.get());
            buf.put_u8(u8::from(resp.success));
            buf.put_u64_le(resp.match_index.get());
            TYPE_APPEND_RESPONSE
        }
        Message::InstallSnapshot(req) => {
            buf.put_u64_le(req.term.get());
            buf.put_u64_le(req.leader_id.get());
            buf.put_u64_le(req.to.get());
            let encoded = req.snapshot.encode();
            // Safe cast: snapshot sizes bounded by SNAPSHOT_BYTES_MAX.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(encoded.len() as u32);
            buf.put_slice(&encoded);
            TYPE_INSTALL_SNAPSHOT
        }
        Message::InstallSnapshotResponse(resp) => {
            buf.put_u64_le(resp.term.get());
            buf.put_u64_le(resp.from.get());
            buf.put_u64_le(resp.to.get());
            buf.put_u64_le(resp.match_index.get());
            TYPE_SNAPSHOT_RESPONSE
        }
    };
    (frame_type, buf.freeze())
}

/// Encodes a client append payload.
#[must_use]
pub fn encode_client_append(partition: PartitionId, batch_size: u32, data: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u32_le(partition.get());
    buf.put_u32_le(batch_size);
    buf.put_slice(data);
    buf.freeze()
}

/// Encodes a client query payload.
#[must_use]
pub fn encode_client_query(linearizable: bool, request: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + request.len());
    buf.put_u8(u8::from(linearizable));
    buf.put_slice(request);
    buf.freeze()
}

/// Encodes a leader-hint response payload.
#[must_use]
pub fn encode_leader(leader: Option<NodeId>) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    match leader {
        Some(id) => {
            buf.put_u8(1);
            buf.put_u64_le(id.get());
        }
        None => buf.put_u8(0),
    }
    buf.freeze()
}

/// Decodes a leader-hint payload produced by [`encode_leader`].
///
/// # Errors
/// Returns an error on a truncated payload.
pub fn decode_leader(mut buf: &[u8]) -> CodecResult<Option<NodeId>> {
    ensure_remaining(buf, 1)?;
    if buf.get_u8() == 0 {
        return Ok(None);
    }
    ensure_remaining(buf, 8)?;
    Ok(Some(NodeId::new(buf.get_u64_le())))
}

fn decode_request_vote(_header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    ensure_remaining(buf, 40)?;
    let term = TermId::new(buf.get_u64_le());
    let candidate_id = NodeId::new(buf.get_u64_le());
    let to = NodeId::new(buf.get_u64_le());
    let last_log_index = LogIndex::new(buf.get_u64_le());
    let last_log_term = TermId::new(buf.get_u64_le());
    Ok(Payload::Raft(Message::RequestVote(
        RequestVoteRequest::new(term, candidate_id, to, last_log_index, last_log_term),
    )))
}

fn decode_vote_response(_header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    ensure_remaining(buf, 25)?;
    let term = TermId::new(buf.get_u64_le());
    let from = NodeId::new(buf.get_u64_le());
    let to = NodeId::new(buf.get_u64_le());
    let vote_granted = buf.get_u8() != 0;
    Ok(Payload::Raft(Message::RequestVoteResponse(
        RequestVoteResponse::new(term, from, to, vote_granted),
    )))
}

fn decode_append_entries(_header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    ensure_remaining(buf, 52)?;
    let term = TermId::new(buf.get_u64_le());
    let leader_id = NodeId::new(buf.get_u64_le());
    let to = NodeId::new(buf.get_u64_le());
    let prev_log_index = LogIndex::new(buf.get_u64_le());
    let prev_log_term = TermId::new(buf.get_u64_le());
    let leader_commit = LogIndex::new(buf.get_u64_le());

    let entry_count = buf.get_u32_le();
    if entry_count > limits::APPEND_ENTRIES_BATCH_MAX {
        return Err(CodecError::InvalidPayload {
            reason: format!("entry count {entry_count} exceeds batch limit"),
        });
    }
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let entry = LogEntry::decode(buf).map_err(|e| CodecError::InvalidPayload {
            reason: e.to_string(),
        })?;
        entries.push(entry);
    }

    Ok(Payload::Raft(Message::AppendEntries(
        AppendEntriesRequest::new(
            term,
            leader_id,
            to,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        ),
    )))
}

fn decode_append_response(_header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    ensure_remaining(buf, 33)?;
    let term = TermId::new(buf.get_u64_le());
    let from = NodeId::new(buf.get_u64_le());
    let to = NodeId::new(buf.get_u64_le());
    let success = buf.get_u8() != 0;
    let match_index = LogIndex::new(buf.get_u64_le());
    Ok(Payload::Raft(Message::AppendEntriesResponse(
        AppendEntriesResponse::new(term, from, to, success, match_index),
    )))
}

fn decode_install_snapshot(_header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    ensure_remaining(buf, 28)?;
    let term = TermId::new(buf.get_u64_le());
    let leader_id = NodeId::new(buf.get_u64_le());
    let to = NodeId::new(buf.get_u64_le());
    let len = buf.get_u32_le() as usize;
    ensure_remaining(buf, len)?;
    let snapshot =
        Snapshot::decode(Bytes::copy_from_slice(&buf[..len])).ok_or_else(|| {
            CodecError::InvalidPayload {
                reason: "snapshot failed validation".to_string(),
            }
        })?;
    buf.advance(len);
    Ok(Payload::Raft(Message::InstallSnapshot(
        InstallSnapshotRequest {
            term,
            leader_id,
            to,
            snapshot,
        },
    )))
}

fn decode_snapshot_response(_header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    ensure_remaining(buf, 32)?;
    let term = TermId::new(buf.get_u64_le());
    let from = NodeId::new(buf.get_u64_le());
    let to = NodeId::new(buf.get_u64_le());
    let match_index = LogIndex::new(buf.get_u64_le());
    Ok(Payload::Raft(Message::InstallSnapshotResponse(
        InstallSnapshotResponse {
            term,
            from,
            to,
            match_index,
        },
    )))
}

fn decode_client_append(header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    if header.direction == Direction::Response {
        return Ok(Payload::Reply(Bytes::copy_from_slice(buf)));
    }
    ensure_remaining(buf, 8)?;
    let partition = PartitionId::new(buf.get_u32_le());
    let batch_size = buf.get_u32_le();
    let data = Bytes::copy_from_slice(buf);
    buf.advance(data.len());
    Ok(Payload::Append {
        partition,
        batch_size,
        data,
    })
}

fn decode_client_query(header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    if header.direction == Direction::Response {
        return Ok(Payload::Reply(Bytes::copy_from_slice(buf)));
    }
    ensure_remaining(buf, 1)?;
    let linearizable = buf.get_u8() != 0;
    let request = Bytes::copy_from_slice(buf);
    buf.advance(request.len());
    Ok(Payload::Query {
        linearizable,
        request,
    })
}

fn decode_get_leader(header: &FrameHeader, buf: &mut &[u8]) -> CodecResult<Payload> {
    if header.direction == Direction::Request {
        return Ok(Payload::GetLeader);
    }
    ensure_remaining(buf, 1)?;
    let present = buf.get_u8() != 0;
    if !present {
        return Ok(Payload::Leader(None));
    }
    ensure_remaining(buf, 8)?;
    Ok(Payload::Leader(Some(NodeId::new(buf.get_u64_le()))))
}

/// Ensures the buffer has at least `need` bytes remaining.
const fn ensure_remaining(buf: &[u8], need: usize) -> CodecResult<()> {
    if buf.len() < need {
        return Err(CodecError::InsufficientData {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let encoded = encode_frame(frame).unwrap();
        let (decoded, consumed) = decode_frame(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        decoded
    }

    fn make_vote() -> Message {
        Message::RequestVote(RequestVoteRequest::new(
            TermId::new(5),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(10),
            TermId::new(4),
        ))
    }

    fn make_append_with_entries() -> Message {
        let entries = vec![
            LogEntry::write(
                TermId::new(5),
                LogIndex::new(11),
                PartitionId::new(2),
                3,
                Bytes::from("hello"),
            ),
            LogEntry::noop(TermId::new(5), LogIndex::new(12)),
        ];
        Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(5),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(10),
            TermId::new(4),
            entries,
            LogIndex::new(8),
        ))
    }

    #[test]
    fn test_raft_frames_roundtrip() {
        let registry = PayloadRegistry::standard();

        for message in [
            make_vote(),
            Message::RequestVoteResponse(RequestVoteResponse::new(
                TermId::new(5),
                NodeId::new(2),
                NodeId::new(1),
                true,
            )),
            make_append_with_entries(),
            Message::AppendEntriesResponse(AppendEntriesResponse::new(
                TermId::new(5),
                NodeId::new(2),
                NodeId::new(1),
                false,
                LogIndex::new(9),
            )),
            Message::InstallSnapshot(InstallSnapshotRequest {
                term: TermId::new(6),
                leader_id: NodeId::new(1),
                to: NodeId::new(3),
                snapshot: Snapshot::new(LogIndex::new(4), TermId::new(2), Bytes::from("state")),
            }),
            Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: TermId::new(6),
                from: NodeId::new(3),
                to: NodeId::new(1),
                match_index: LogIndex::new(4),
            }),
        ] {
            let frame = message_frame(&message);
            assert!(frame.header.one_way);
            let decoded = roundtrip(&frame);
            assert_eq!(registry.decode(&decoded).unwrap(), Payload::Raft(message));
        }
    }

    #[test]
    fn test_client_append_frame_roundtrip() {
        let registry = PayloadRegistry::standard();
        let payload = encode_client_append(PartitionId::new(2), 1024, &Bytes::from("records"));
        let frame = Frame::request(
            RequestId::new(77),
            TYPE_CLIENT_APPEND,
            NodeId::new(1),
            false,
            payload,
        );

        let decoded = roundtrip(&frame);
        assert_eq!(decoded.header.request_id, RequestId::new(77));
        assert_eq!(
            registry.decode(&decoded).unwrap(),
            Payload::Append {
                partition: PartitionId::new(2),
                batch_size: 1024,
                data: Bytes::from("records"),
            }
        );
    }

    #[test]
    fn test_response_status_and_error_roundtrip() {
        let registry = PayloadRegistry::standard();
        let request = Frame::request(
            RequestId::new(9),
            TYPE_CLIENT_APPEND,
            NodeId::new(1),
            false,
            Bytes::new(),
        );
        let response = Frame::response(
            &request.header,
            Status::NotLeader,
            "try node-3".to_string(),
            Bytes::new(),
        );

        let decoded = roundtrip(&response);
        assert_eq!(decoded.header.status, Status::NotLeader);
        assert_eq!(decoded.header.error, "try node-3");
        assert_eq!(decoded.header.request_id, RequestId::new(9));
        assert_eq!(registry.decode(&decoded).unwrap(), Payload::Reply(Bytes::new()));
    }

    #[test]
    fn test_get_leader_roundtrip() {
        let registry = PayloadRegistry::standard();
        let request = Frame::request(
            RequestId::new(1),
            TYPE_GET_LEADER,
            NodeId::new(0),
            false,
            Bytes::new(),
        );
        assert_eq!(
            registry.decode(&roundtrip(&request)).unwrap(),
            Payload::GetLeader
        );

        let response = Frame::response(
            &request.header,
            Status::Ok,
            String::new(),
            encode_leader(Some(NodeId::new(3))),
        );
        assert_eq!(
            registry.decode(&roundtrip(&response)).unwrap(),
            Payload::Leader(Some(NodeId::new(3)))
        );
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let frame = message_frame(&make_vote());
        let encoded = encode_frame(&frame).unwrap();

        let result = decode_frame(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(CodecError::InsufficientData { .. })));

        let result = decode_frame(&[0, 1]);
        assert!(matches!(result, Err(CodecError::InsufficientData { .. })));
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let registry = PayloadRegistry::standard();
        let frame = Frame::request(
            RequestId::new(1),
            200,
            NodeId::new(1),
            false,
            Bytes::new(),
        );
        let decoded = roundtrip(&frame);
        assert!(matches!(
            registry.decode(&decoded),
            Err(CodecError::UnknownFrameType { tag: 200 })
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = encode_frame(&message_frame(&make_vote())).unwrap();
        let second = encode_frame(&message_frame(&make_append_with_entries())).unwrap();
        let mut stream = BytesMut::new();
        stream.put_slice(&first);
        stream.put_slice(&second);

        let (_, consumed) = decode_frame(&stream).unwrap();
        assert_eq!(consumed, first.len());
        let (_, consumed2) = decode_frame(&stream[consumed..]).unwrap();
        assert_eq!(consumed2, second.len());
    }
}
