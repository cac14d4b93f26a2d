//! Binary request/response protocol for snapshot queries.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ request_id │ collection │ sequence │ payload  │
//! │ 1 byte   │ varint     │ string     │ varint   │ variable │
//! └──────────┴────────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! A `GetSnapshot` request is answered by zero or more `SnapshotPacket`
//! messages followed by exactly one `SnapshotEnd` (or `Error`), all carrying
//! the request's `request_id`.

use serde::{Deserialize, Serialize};

/// Message types for the query protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Request a full snapshot of a collection
    GetSnapshot = 1,
    /// One chunk of snapshot records
    SnapshotPacket = 2,
    /// Stream terminator: watermark and record total
    SnapshotEnd = 3,
    /// Request the watermark of a collection
    GetSnapshotState = 4,
    /// Watermark response
    SnapshotState = 5,
    /// Collection unknown or never written
    NotFound = 6,
    /// Request all collection names
    ListCollections = 7,
    /// Collection names response
    CollectionList = 8,
    /// Projection event for the ingestion pipeline
    Publish = 9,
    /// Projection committed or discarded
    Ack = 10,
    /// Projection not applied, redeliver
    Nack = 11,
    /// Request failed
    Error = 12,
    /// Heartbeat ping
    Ping = 13,
    /// Heartbeat pong
    Pong = 14,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub msg_type: MessageType,
    /// Correlates responses with their request
    pub request_id: u64,
    pub collection: String,
    /// Watermark or event sequence, depending on `msg_type`
    pub sequence: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl RpcMessage {
    fn new(msg_type: MessageType, request_id: u64) -> Self {
        Self {
            msg_type,
            request_id,
            collection: String::new(),
            sequence: 0,
            payload: Vec::new(),
        }
    }

    fn for_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    fn at(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    // ─── Requests ─────────────────────────────────────────────────────

    pub fn get_snapshot(request_id: u64, collection: impl Into<String>) -> Self {
        Self::new(MessageType::GetSnapshot, request_id).for_collection(collection)
    }

    pub fn get_snapshot_state(request_id: u64, collection: impl Into<String>) -> Self {
        Self::new(MessageType::GetSnapshotState, request_id).for_collection(collection)
    }

    pub fn list_collections(request_id: u64) -> Self {
        Self::new(MessageType::ListCollections, request_id)
    }

    /// Publish a raw projection payload at `sequence`.
    pub fn publish(request_id: u64, sequence: u64, projection: Vec<u8>) -> Self {
        Self::new(MessageType::Publish, request_id)
            .at(sequence)
            .with_payload(projection)
    }

    pub fn ping(request_id: u64) -> Self {
        Self::new(MessageType::Ping, request_id)
    }

    // ─── Responses ────────────────────────────────────────────────────

    /// One chunk of a snapshot stream.
    pub fn snapshot_packet(
        request_id: u64,
        collection: impl Into<String>,
        sequence: u64,
        entries: &[Vec<u8>],
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::SnapshotPacket, request_id)
            .for_collection(collection)
            .at(sequence)
            .with_payload(encode_payload(&entries)?))
    }

    /// End of a snapshot stream; payload is the record total (u64 LE).
    pub fn snapshot_end(
        request_id: u64,
        collection: impl Into<String>,
        sequence: u64,
        total_entries: u64,
    ) -> Self {
        Self::new(MessageType::SnapshotEnd, request_id)
            .for_collection(collection)
            .at(sequence)
            .with_payload(total_entries.to_le_bytes().to_vec())
    }

    pub fn snapshot_state(request_id: u64, collection: impl Into<String>, sequence: u64) -> Self {
        Self::new(MessageType::SnapshotState, request_id)
            .for_collection(collection)
            .at(sequence)
    }

    pub fn not_found(request_id: u64, collection: impl Into<String>) -> Self {
        Self::new(MessageType::NotFound, request_id).for_collection(collection)
    }

    pub fn collection_list(request_id: u64, names: &[String]) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::CollectionList, request_id).with_payload(encode_payload(&names)?))
    }

    pub fn ack(request_id: u64, sequence: u64) -> Self {
        Self::new(MessageType::Ack, request_id).at(sequence)
    }

    pub fn nack(request_id: u64, sequence: u64) -> Self {
        Self::new(MessageType::Nack, request_id).at(sequence)
    }

    pub fn error(request_id: u64, collection: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new(MessageType::Error, request_id)
            .for_collection(collection)
            .with_payload(message.into_bytes())
    }

    pub fn pong(request_id: u64) -> Self {
        Self::new(MessageType::Pong, request_id)
    }

    // ─── Codec ────────────────────────────────────────────────────────

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    // ─── Payload accessors ────────────────────────────────────────────

    /// Records carried by a `SnapshotPacket`.
    pub fn entries(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.require(MessageType::SnapshotPacket)?;
        decode_payload(&self.payload)
    }

    /// Names carried by a `CollectionList`.
    pub fn collections(&self) -> Result<Vec<String>, ProtocolError> {
        self.require(MessageType::CollectionList)?;
        decode_payload(&self.payload)
    }

    /// Record total carried by a `SnapshotEnd`.
    pub fn total_entries(&self) -> Result<u64, ProtocolError> {
        self.require(MessageType::SnapshotEnd)?;
        let bytes: [u8; 8] = self
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::Deserialization("snapshot total must be 8 bytes".into()))?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Message text of an `Error`.
    pub fn error_message(&self) -> Result<String, ProtocolError> {
        self.require(MessageType::Error)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn require(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType {
                expected: msg_type,
                actual: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("Unexpected reply {0:?}")]
    UnexpectedReply(MessageType),
    #[error("Server error: {0}")]
    Remote(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
