//! WebSocket client for the snapshot server.
//!
//! One request is in flight at a time; replies are matched to their request
//! by `request_id` and anything else on the socket is skipped.

use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use snapview_store::{Disposition, Projection};

use crate::protocol::{MessageType, ProtocolError, RpcMessage};

/// Default time to wait for each reply message.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A complete snapshot as received by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub collection: String,
    /// Watermark the snapshot was read at
    pub sequence: u64,
    /// Number of `SnapshotPacket` messages received
    pub packets: usize,
    /// Serialized records, in key order
    pub entries: Vec<Vec<u8>>,
}

impl Snapshot {
    /// Decode every entry as a JSON record.
    pub fn records(&self) -> Result<Vec<Value>, serde_json::Error> {
        self.entries
            .iter()
            .map(|bytes| serde_json::from_slice(bytes))
            .collect()
    }
}

/// The snapshot client.
pub struct SnapshotClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_request_id: u64,
    reply_timeout: Duration,
}

impl SnapshotClient {
    /// Connect to a server at `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        log::debug!("Connected to snapshot server at {url}");
        Ok(Self {
            ws,
            next_request_id: 1,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    /// Override the per-reply timeout.
    pub fn with_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Fetch a whole collection snapshot.
    pub async fn get_snapshot(&mut self, collection: &str) -> Result<Snapshot, ProtocolError> {
        let mut snapshot = Snapshot {
            collection: collection.to_string(),
            ..Snapshot::default()
        };
        let mut entries = Vec::new();
        let (sequence, packets) = self
            .stream_snapshot(collection, |_, chunk| entries.extend(chunk))
            .await?;
        snapshot.sequence = sequence;
        snapshot.packets = packets;
        snapshot.entries = entries;
        Ok(snapshot)
    }

    /// Fetch a snapshot, handing each packet to `on_packet(sequence, entries)`.
    ///
    /// Returns the final watermark and the number of packets.
    pub async fn stream_snapshot<F>(
        &mut self,
        collection: &str,
        mut on_packet: F,
    ) -> Result<(u64, usize), ProtocolError>
    where
        F: FnMut(u64, Vec<Vec<u8>>),
    {
        let request_id = self.request(RpcMessage::get_snapshot(0, collection)).await?;

        let mut packets = 0;
        let mut received = 0u64;
        loop {
            let reply = self.reply(request_id).await?;
            match reply.msg_type {
                MessageType::SnapshotPacket => {
                    let entries = reply.entries()?;
                    received += entries.len() as u64;
                    packets += 1;
                    on_packet(reply.sequence, entries);
                }
                MessageType::SnapshotEnd => {
                    let total = reply.total_entries()?;
                    if total != received {
                        return Err(ProtocolError::Deserialization(format!(
                            "snapshot announced {total} records, received {received}"
                        )));
                    }
                    return Ok((reply.sequence, packets));
                }
                MessageType::Error => return Err(ProtocolError::Remote(reply.error_message()?)),
                other => return Err(ProtocolError::UnexpectedReply(other)),
            }
        }
    }

    /// Watermark of `collection`, `None` if the server does not know it.
    pub async fn get_snapshot_state(&mut self, collection: &str) -> Result<Option<u64>, ProtocolError> {
        let request_id = self
            .request(RpcMessage::get_snapshot_state(0, collection))
            .await?;
        let reply = self.reply(request_id).await?;
        match reply.msg_type {
            MessageType::SnapshotState => Ok(Some(reply.sequence)),
            MessageType::NotFound => Ok(None),
            MessageType::Error => Err(ProtocolError::Remote(reply.error_message()?)),
            other => Err(ProtocolError::UnexpectedReply(other)),
        }
    }

    /// Names of every collection on the server.
    pub async fn list_collections(&mut self) -> Result<Vec<String>, ProtocolError> {
        let request_id = self.request(RpcMessage::list_collections(0)).await?;
        let reply = self.reply(request_id).await?;
        match reply.msg_type {
            MessageType::CollectionList => reply.collections(),
            MessageType::Error => Err(ProtocolError::Remote(reply.error_message()?)),
            other => Err(ProtocolError::UnexpectedReply(other)),
        }
    }

    /// Publish a projection at `sequence` and wait for its disposition.
    pub async fn publish(
        &mut self,
        sequence: u64,
        projection: &Projection,
    ) -> Result<Disposition, ProtocolError> {
        let payload = projection
            .encode()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.publish_raw(sequence, payload).await
    }

    /// Publish raw projection bytes at `sequence`.
    pub async fn publish_raw(
        &mut self,
        sequence: u64,
        payload: Vec<u8>,
    ) -> Result<Disposition, ProtocolError> {
        let request_id = self
            .request(RpcMessage::publish(0, sequence, payload))
            .await?;
        let reply = self.reply(request_id).await?;
        match reply.msg_type {
            MessageType::Ack => Ok(Disposition::Ack),
            MessageType::Nack => Ok(Disposition::Nack),
            MessageType::Error => Err(ProtocolError::Remote(reply.error_message()?)),
            other => Err(ProtocolError::UnexpectedReply(other)),
        }
    }

    /// Round-trip a heartbeat.
    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        let request_id = self.request(RpcMessage::ping(0)).await?;
        let reply = self.reply(request_id).await?;
        match reply.msg_type {
            MessageType::Pong => Ok(()),
            other => Err(ProtocolError::UnexpectedReply(other)),
        }
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Stamp `msg` with a fresh request id and send it.
    async fn request(&mut self, mut msg: RpcMessage) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        msg.request_id = request_id;

        let encoded = msg.encode()?;
        self.ws
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        Ok(request_id)
    }

    /// Next message answering `request_id`.
    async fn reply(&mut self, request_id: u64) -> Result<RpcMessage, ProtocolError> {
        loop {
            let next = tokio::time::timeout(self.reply_timeout, self.ws.next())
                .await
                .map_err(|_| ProtocolError::Timeout)?;
            match next {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let msg = RpcMessage::decode(&bytes)?;
                    if msg.request_id == request_id {
                        return Ok(msg);
                    }
                    log::debug!("Skipping reply to stale request {}", msg.request_id);
                }
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Err(e)) => return Err(ProtocolError::Transport(e.to_string())),
                _ => {}
            }
        }
    }
}
