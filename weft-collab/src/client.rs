//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect; reconnecting is another `connect`)
//! - Operation send with an offline queue replayed on reconnect
//! - Cursor relay and preview saves
//!
//! Inbound frames are surfaced as [`SyncEvent`]s; applying them to a
//! document is the job of a [`Session`](crate::session::Session).

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use weft_core::Operation;

use crate::protocol::{ClientMessage, DocumentId, PeerId, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined; the `Init` frame follows as a `Message`.
    Connected,
    /// Connection lost
    Disconnected,
    /// A frame from the server
    Message(ServerMessage),
    /// The server closed the connection with a reason.
    Closed { code: u16, reason: String },
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    /// The server refused the join.
    #[error("rejected by server ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("offline queue is full")]
    QueueFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Offline queue for operations produced while disconnected.
///
/// Queued operations are replayed in order on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation for later replay.
    pub fn enqueue(&mut self, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(op);
        true
    }

    /// Drain all queued operations, oldest first.
    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Put operations that never reached the server back in front, oldest
    /// first. Capacity is not enforced here.
    pub fn requeue(&mut self, ops: Vec<Operation>) {
        for op in ops.into_iter().rev() {
            self.queue.push_front(op);
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

enum Outgoing {
    /// An encoded operation, kept alongside its frame for requeueing.
    Op { frame: String, op: Operation },
    Frame(String),
    Close,
}

/// The sync client.
pub struct SyncClient {
    /// Server base URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,
    token: String,
    doc_id: DocumentId,

    state: Arc<RwLock<ConnectionState>>,

    /// Assigned by the server in `Init`
    peer_id: Option<PeerId>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Outgoing>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,

    ever_connected: bool,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>, doc_id: DocumentId) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            doc_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            peer_id: None,
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            ever_connected: false,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// The join URL: server URL plus `token` and `doc` query parameters.
    pub fn join_url(&self) -> Result<url::Url, ClientError> {
        let mut url =
            url::Url::parse(&self.server_url).map_err(|e| ClientError::Connect(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("doc", &self.doc_id.to_string());
        Ok(url)
    }

    /// Connect and join the document.
    ///
    /// Resolves once the server has answered with `Init` (emitted as an
    /// event) or refused the join. Queued offline operations are replayed
    /// right after `Init`.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let url = self.join_url()?;
        *self.state.write().await = if self.ever_connected {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (ws_writer, mut ws_reader) = ws_stream.split();

        let init = match await_init(&mut ws_reader).await {
            Ok(init) => init,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        self.peer_id = Some(init.peer_id());

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, out_rx) = mpsc::channel::<Outgoing>(256);
        tokio::spawn(write_outgoing(
            ws_writer,
            out_rx,
            self.offline_queue.clone(),
            self.state.clone(),
        ));

        let _ = self.event_tx.send(SyncEvent::Connected).await;
        let _ = self.event_tx.send(SyncEvent::Message(init)).await;

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
        }
        let mut unsent = Vec::new();
        for op in queued {
            let frame = ClientMessage::Op { op: op.clone() }.encode()?;
            if out_tx.send(Outgoing::Op { frame, op }).await.is_err() {
                unsent.push(op);
            }
        }
        if !unsent.is_empty() {
            self.offline_queue.lock().await.requeue(unsent);
        }

        self.outgoing_tx = Some(out_tx);
        self.ever_connected = true;
        *self.state.write().await = ConnectionState::Connected;

        // Reader task: surface incoming frames as events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            let _ = event_tx.send(SyncEvent::Message(server_msg)).await;
                        }
                        Err(e) => log::warn!("Dropping server frame: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            let _ = event_tx
                                .send(SyncEvent::Closed {
                                    code: u16::from(frame.code),
                                    reason: frame.reason.to_string(),
                                })
                                .await;
                        }
                        break;
                    }
                    Err(e) => {
                        log::debug!("WebSocket read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Operations sent afterwards are queued.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Outgoing::Close).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send an operation to the server.
    ///
    /// If disconnected, queues the operation for replay on reconnect.
    pub async fn send_op(&self, op: Operation) -> Result<(), ClientError> {
        if self.connection_state().await == ConnectionState::Connected {
            if let Some(tx) = &self.outgoing_tx {
                let frame = ClientMessage::Op { op: op.clone() }.encode()?;
                if tx.send(Outgoing::Op { frame, op: op.clone() }).await.is_ok() {
                    return Ok(());
                }
            }
        }

        let mut queue = self.offline_queue.lock().await;
        if !queue.enqueue(op) {
            return Err(ClientError::QueueFull);
        }
        Ok(())
    }

    /// Send a cursor payload. Silently dropped while offline.
    pub async fn send_cursor(&self, payload: serde_json::Value) -> Result<(), ClientError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let frame = ClientMessage::Cursor { payload }.encode()?;
        let _ = self.send_frame(frame).await;
        Ok(())
    }

    /// Ask the server to store a text preview.
    pub async fn save(&self, content: impl Into<String>) -> Result<(), ClientError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let frame = ClientMessage::Save {
            content: content.into(),
        }
        .encode()?;
        self.send_frame(frame).await
    }

    /// Dispatch an outbound message produced by a session.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        match msg {
            ClientMessage::Op { op } => self.send_op(op).await,
            ClientMessage::Cursor { payload } => self.send_cursor(payload).await,
            ClientMessage::Save { content } => self.save(content).await,
        }
    }

    async fn send_frame(&self, frame: String) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Outgoing::Frame(frame))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Peer id from the most recent `Init`.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

/// Forward outgoing frames to the socket until closed.
///
/// On a failed write the connection is marked down, and the failed operation
/// plus every one still buffered behind it go back to the front of the
/// offline queue for the next `connect`.
async fn write_outgoing<W>(
    mut ws_writer: W,
    mut out_rx: mpsc::Receiver<Outgoing>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    state: Arc<RwLock<ConnectionState>>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(outgoing) = out_rx.recv().await {
        let (message, op) = match outgoing {
            Outgoing::Op { frame, op } => (Message::text(frame), Some(op)),
            Outgoing::Frame(frame) => (Message::text(frame), None),
            Outgoing::Close => {
                let _ = ws_writer.send(Message::Close(None)).await;
                return;
            }
        };

        if let Err(e) = ws_writer.send(message).await {
            log::debug!("WebSocket write error: {e}");
            *state.write().await = ConnectionState::Disconnected;
            out_rx.close();

            let mut unsent: Vec<Operation> = op.into_iter().collect();
            while let Ok(outgoing) = out_rx.try_recv() {
                if let Outgoing::Op { op, .. } = outgoing {
                    unsent.push(op);
                }
            }
            if !unsent.is_empty() {
                log::info!("Re-queueing {} unsent operations", unsent.len());
                offline_queue.lock().await.requeue(unsent);
            }
            return;
        }
    }
}

/// Wait for the `Init` frame, or the close frame refusing the join.
async fn await_init<S>(reader: &mut S) -> Result<ServerMessage, ClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str())? {
                init @ ServerMessage::Init { .. } => return Ok(init),
                other => log::warn!("Expected init, got {other:?}"),
            },
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                return Err(ClientError::Rejected { code, reason });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ClientError::Connect(e.to_string())),
            None => return Err(ClientError::Connect("connection closed before init".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use weft_core::SequenceStore;

    fn ops(n: usize) -> Vec<Operation> {
        let mut replica = SequenceStore::new("c");
        (0..n)
            .map(|i| Operation::from(replica.local_insert('a', i).unwrap()))
            .collect()
    }

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new("ws://localhost:9090", "t", doc_id);

        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.peer_id(), None);
    }

    #[test]
    fn test_join_url_encodes_query() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new("ws://localhost:9090", "a b&c", doc_id);
        let url = client.join_url().unwrap();

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_string(), "a b&c".to_string()),
                ("doc".to_string(), doc_id.to_string()),
            ]
        );
    }

    #[test]
    fn test_join_url_invalid_base() {
        let client = SyncClient::new("not a url", "t", Uuid::new_v4());
        assert!(matches!(client.join_url(), Err(ClientError::Connect(_))));
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090", "t", Uuid::new_v4());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_op_offline_queues() {
        let client = SyncClient::new("ws://localhost:9090", "t", Uuid::new_v4());

        for op in ops(2) {
            client.send_op(op).await.unwrap();
        }
        assert_eq!(client.offline_queue_len().await, 2);
    }

    #[tokio::test]
    async fn test_cursor_offline_noop_and_save_offline_fails() {
        let client = SyncClient::new("ws://localhost:9090", "t", Uuid::new_v4());

        client.send_cursor(serde_json::json!({"pos": 1})).await.unwrap();
        assert_eq!(client.save("text").await, Err(ClientError::NotConnected));
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), "t", Uuid::new_v4());
        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        let ops = ops(2);
        queue.enqueue(ops[0].clone());
        queue.enqueue(ops[1].clone());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain(), ops);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        let ops = ops(4);

        assert!(queue.enqueue(ops[0].clone()));
        assert!(queue.enqueue(ops[1].clone()));
        assert!(queue.enqueue(ops[2].clone()));
        assert!(!queue.enqueue(ops[3].clone())); // Full

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.capacity(), 3);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_requeue_goes_first() {
        let mut queue = OfflineQueue::new(2);
        let ops = ops(4);
        queue.enqueue(ops[2].clone());
        queue.enqueue(ops[3].clone());

        queue.requeue(vec![ops[0].clone(), ops[1].clone()]);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.drain(), ops);
    }

    fn op_frame(op: &Operation) -> Outgoing {
        Outgoing::Op {
            frame: ClientMessage::Op { op: op.clone() }.encode().unwrap(),
            op: op.clone(),
        }
    }

    #[tokio::test]
    async fn test_failed_write_requeues_unsent_ops() {
        let ops = ops(4);
        let queue = Arc::new(Mutex::new(OfflineQueue::new(100)));
        // Produced after the reader noticed the drop.
        queue.lock().await.enqueue(ops[3].clone());
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Takes one frame, then the socket is gone.
        let sink = Box::pin(futures_util::sink::unfold(
            0usize,
            |written, _msg: Message| async move {
                if written == 0 {
                    Ok(written + 1)
                } else {
                    Err(WsError::ConnectionClosed)
                }
            },
        ));

        let (tx, rx) = mpsc::channel(16);
        tx.send(op_frame(&ops[0])).await.unwrap();
        tx.send(op_frame(&ops[1])).await.unwrap();
        tx.send(Outgoing::Frame(r#"{"type":"cursor","payload":1}"#.into()))
            .await
            .unwrap();
        tx.send(op_frame(&ops[2])).await.unwrap();

        write_outgoing(sink, rx, queue.clone(), state.clone()).await;

        assert_eq!(*state.read().await, ConnectionState::Disconnected);
        assert_eq!(queue.lock().await.drain(), ops[1..].to_vec());
        // Later sends fail over to the offline queue.
        assert!(tx.send(Outgoing::Frame(String::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:9090", "t", Uuid::new_v4());

        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
