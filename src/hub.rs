pub mod filter;

use crate::logging::event;
use chrono::{DateTime, Utc};
use filter::ClientFilter;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

/// How long a frame may take to reach the peer before the writer gives up.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Interval between WebSocket protocol pings from the writer task.
const PROTOCOL_PING_INTERVAL: Duration = Duration::from_secs(54);
/// Interval between application-level heartbeat messages from the hub loop.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The kinds of server-to-client messages.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    InitialState,
    SystemStatus,
    MetricsUpdate,
    TaskUpdate,
    Alert,
    LogEntry,
    LogStream,
    Ping,
}

/// The envelope for every server-to-client frame.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StreamMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl StreamMessage {
    pub fn new(kind: MessageKind, data: serde_json::Value) -> StreamMessage {
        StreamMessage {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            data,
            metadata: None,
        }
    }
}

/// Client-to-server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { filter: ClientFilter },
    Unsubscribe,
    Pong,
}

/// One connected WebSocket client. The hub owns the registry entry; the
/// reader and writer tasks share the client through an Arc and observe the
/// send queue closing as their shutdown signal.
#[derive(Debug)]
pub struct Client {
    pub id: Uuid,
    sender: mpsc::Sender<StreamMessage>,
    filter: Mutex<Option<ClientFilter>>,
    pub user: Option<String>,
    last_pong: Mutex<DateTime<Utc>>,
}

impl Client {
    fn new(sender: mpsc::Sender<StreamMessage>) -> Client {
        Client {
            id: Uuid::new_v4(),
            sender,
            filter: Mutex::new(None),
            user: None,
            last_pong: Mutex::new(Utc::now()),
        }
    }

    fn set_filter(&self, filter: Option<ClientFilter>) {
        *self.filter.lock().unwrap() = filter;
    }

    fn accepts(&self, message: &StreamMessage) -> bool {
        match &*self.filter.lock().unwrap() {
            Some(filter) => filter.matches(message),
            None => true,
        }
    }

    fn record_pong(&self) {
        *self.last_pong.lock().unwrap() = Utc::now();
    }

    fn seconds_since_pong(&self) -> i64 {
        (Utc::now() - *self.last_pong.lock().unwrap()).num_seconds()
    }
}

enum HubCommand {
    Register(Arc<Client>),
    Unregister(Uuid),
    Broadcast(StreamMessage),
}

/// The WebSocket broadcast coordinator. A single event loop owns all
/// registry mutations; producers hand it commands through an unbounded
/// inbox, so the hot logging path never blocks on a slow client. The only
/// back-pressure signal is a client's full send queue, which evicts that
/// client and nobody else.
pub struct Hub {
    clients: RwLock<HashMap<Uuid, Arc<Client>>>,
    commands: mpsc::UnboundedSender<HubCommand>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>,
    buffer_size: usize,
    version: String,
    logger: Logger,
}

impl Hub {
    pub fn new(buffer_size: usize, version: &str, parent_logger: &Logger) -> Arc<Hub> {
        let (commands, inbox) = mpsc::unbounded_channel();
        Arc::new(Hub {
            clients: RwLock::new(HashMap::new()),
            commands,
            inbox: Mutex::new(Some(inbox)),
            buffer_size: buffer_size.max(1),
            version: version.to_owned(),
            logger: parent_logger.new(o!("component" => "hub")),
        })
    }

    /// The hub event loop. Must be spawned onto the runtime exactly once;
    /// it runs until every command sender (the hub itself) is gone.
    pub async fn run(self: Arc<Hub>) {
        let mut inbox = self
            .inbox
            .lock()
            .unwrap()
            .take()
            .expect("hub event loop started twice");
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        // The first tick of a tokio interval fires immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat(),
            }
        }
    }

    fn handle_command(&self, command: HubCommand) {
        match command {
            HubCommand::Register(client) => {
                let initial = StreamMessage::new(
                    MessageKind::InitialState,
                    serde_json::json!({
                        "server_time": Utc::now().to_rfc3339(),
                        "version": self.version,
                    }),
                );
                if client.sender.try_send(initial).is_err() {
                    warn!(
                        self.logger, "client queue full at registration";
                        event::CLIENT_ID => client.id.to_string(),
                    );
                }
                info!(
                    self.logger, "client registered";
                    event::CLIENT_ID => client.id.to_string(),
                );
                self.clients.write().unwrap().insert(client.id, client);
            }
            HubCommand::Unregister(id) => {
                // Dropping the registry's Arc closes the send queue once the
                // writer task releases its receiver; the writer observes the
                // closure and shuts down.
                if self.clients.write().unwrap().remove(&id).is_some() {
                    info!(
                        self.logger, "client unregistered";
                        event::CLIENT_ID => id.to_string(),
                    );
                }
            }
            HubCommand::Broadcast(message) => self.deliver(message),
        }
    }

    /// Snapshots the client list under the read lock, releases it, then
    /// attempts a non-blocking send to every matching client. Clients whose
    /// queue is full are evicted; everyone else is unaffected.
    fn deliver(&self, message: StreamMessage) {
        let snapshot: Vec<Arc<Client>> =
            self.clients.read().unwrap().values().cloned().collect();

        let mut slow: Vec<Uuid> = Vec::new();
        for client in snapshot {
            if !client.accepts(&message) {
                continue;
            }
            match client.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        self.logger, "evicting slow consumer";
                        event::CLIENT_ID => client.id.to_string(),
                    );
                    slow.push(client.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(client.id);
                }
            }
        }

        if !slow.is_empty() {
            let mut clients = self.clients.write().unwrap();
            for id in slow {
                clients.remove(&id);
            }
        }
    }

    fn heartbeat(&self) {
        let snapshot: Vec<Arc<Client>> =
            self.clients.read().unwrap().values().cloned().collect();
        for client in snapshot {
            let silent_for = client.seconds_since_pong();
            if silent_for > 2 * HEARTBEAT_INTERVAL.as_secs() as i64 {
                debug!(
                    self.logger, "client has not answered recent heartbeats";
                    event::CLIENT_ID => client.id.to_string(),
                    "seconds_since_pong" => silent_for,
                );
            }
            let ping = StreamMessage::new(MessageKind::Ping, serde_json::Value::Null);
            if let Err(error) = client.sender.try_send(ping) {
                debug!(
                    self.logger, "heartbeat not delivered";
                    event::CLIENT_ID => client.id.to_string(),
                    "error" => error.to_string(),
                );
            }
        }
    }

    /// Registers a new client and returns it along with the receiving end
    /// of its send queue, which the writer task drains.
    pub fn register(&self) -> (Arc<Client>, mpsc::Receiver<StreamMessage>) {
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let client = Arc::new(Client::new(sender));
        // The loop owns the insert; an error means the hub is shutting down
        // and the connection will close on its own.
        let _ = self.commands.send(HubCommand::Register(Arc::clone(&client)));
        (client, receiver)
    }

    pub fn unregister(&self, id: Uuid) {
        let _ = self.commands.send(HubCommand::Unregister(id));
    }

    /// Queues a message for fan-out. Never blocks; safe to call from the
    /// synchronous logging hot path.
    pub fn broadcast(&self, message: StreamMessage) {
        let _ = self.commands.send(HubCommand::Broadcast(message));
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}

/// Serves one WebSocket connection: registers the client, pumps its send
/// queue out through the socket (writer) and decodes control frames off the
/// socket (reader). Returns when the peer goes away or the client is
/// evicted.
pub async fn client_connection(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let (client, mut queue) = hub.register();
    let client_id = client.id;
    let logger = hub.logger.new(o!(event::CLIENT_ID => client_id.to_string()));

    // Writer: flush queued messages with a write deadline and send a
    // protocol-level ping periodically.
    let writer_logger = logger.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PROTOCOL_PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                queued = queue.recv() => match queued {
                    Some(message) => {
                        let frame = match serde_json::to_string(&message) {
                            Ok(text) => Message::text(text),
                            Err(error) => {
                                warn!(writer_logger, "dropping unserializable message"; "error" => error.to_string());
                                continue;
                            }
                        };
                        match tokio::time::timeout(WRITE_DEADLINE, sink.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                    // Queue closed: the client was unregistered.
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    // Reader: subscribe updates the filter, unsubscribe clears it, pong
    // refreshes the liveness timestamp.
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                debug!(logger, "read error, closing"; "error" => error.to_string());
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        if frame.is_pong() {
            client.record_pong();
            continue;
        }
        let text = match frame.to_str() {
            Ok(text) => text,
            Err(()) => continue,
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe { filter }) => client.set_filter(Some(filter)),
            Ok(ClientMessage::Unsubscribe) => client.set_filter(None),
            Ok(ClientMessage::Pong) => client.record_pong(),
            Err(error) => {
                debug!(logger, "undecodable client frame"; "error" => error.to_string());
            }
        }
    }

    hub.unregister(client_id);
    drop(client);
    let _ = writer.await;
    info!(logger, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;

    fn test_hub(buffer_size: usize) -> Arc<Hub> {
        Hub::new(buffer_size, "test-version", &setup_test_logging())
    }

    async fn drain_commands() {
        // Give the event loop a chance to process queued commands. The
        // first iterations cooperatively yield so the spawned task gets
        // polled; a couple of real sleeps follow so any timer-driven work
        // (e.g. the heartbeat interval's initial tick) also gets to run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn register_delivers_initial_state() {
        let hub = test_hub(8);
        tokio::spawn(Arc::clone(&hub).run());

        let (_client, mut queue) = hub.register();
        drain_commands().await;

        let message = queue.recv().await.unwrap();
        assert_eq!(message.kind, MessageKind::InitialState);
        assert_eq!(message.data["version"], "test-version");
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_clients() {
        let hub = test_hub(8);
        tokio::spawn(Arc::clone(&hub).run());

        let (_client, mut queue) = hub.register();
        drain_commands().await;
        let _ = queue.recv().await; // initial_state

        hub.broadcast(StreamMessage::new(
            MessageKind::LogEntry,
            serde_json::json!({"message": "hello"}),
        ));
        drain_commands().await;

        let message = queue.recv().await.unwrap();
        assert_eq!(message.kind, MessageKind::LogEntry);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_others_survive() {
        let hub = test_hub(1);
        tokio::spawn(Arc::clone(&hub).run());

        let (slow, _slow_queue) = hub.register();
        let (healthy, mut healthy_queue) = hub.register();
        drain_commands().await;
        assert_eq!(hub.client_count(), 2);

        // Make room in the healthy queue; the slow client's queue still
        // holds its initial_state message and has capacity 1, so the next
        // broadcast finds it full and evicts it.
        let _ = healthy_queue.recv().await;

        hub.broadcast(StreamMessage::new(
            MessageKind::LogEntry,
            serde_json::json!({"n": 1}),
        ));
        drain_commands().await;

        assert_eq!(hub.client_count(), 1);
        assert!(hub.clients.read().unwrap().contains_key(&healthy.id));
        assert!(!hub.clients.read().unwrap().contains_key(&slow.id));

        // The healthy client still receives.
        let message = healthy_queue.recv().await.unwrap();
        assert_eq!(message.data["n"], 1);
    }

    #[tokio::test]
    async fn filtered_client_skips_mismatched_messages() {
        let hub = test_hub(8);
        tokio::spawn(Arc::clone(&hub).run());

        let (client, mut queue) = hub.register();
        drain_commands().await;
        let _ = queue.recv().await; // initial_state

        client.set_filter(Some(ClientFilter {
            message_types: Some(vec![MessageKind::Alert]),
            ..ClientFilter::default()
        }));

        hub.broadcast(StreamMessage::new(
            MessageKind::LogEntry,
            serde_json::json!({"message": "skipped"}),
        ));
        hub.broadcast(StreamMessage::new(
            MessageKind::Alert,
            serde_json::json!({"severity": "high"}),
        ));
        drain_commands().await;

        let message = queue.recv().await.unwrap();
        assert_eq!(message.kind, MessageKind::Alert);
    }

    #[tokio::test]
    async fn unregister_removes_client() {
        let hub = test_hub(8);
        tokio::spawn(Arc::clone(&hub).run());

        let (client, _queue) = hub.register();
        drain_commands().await;
        assert_eq!(hub.client_count(), 1);

        hub.unregister(client.id);
        drain_commands().await;
        assert_eq!(hub.client_count(), 0);
    }
}
