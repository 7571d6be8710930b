// Realtime channel: authenticated STOMP session over a pluggable transport.
//
// The transport (`Connector`) only moves frames. This module owns the STOMP
// conversation on top of it: the CONNECT handshake, the subscription table
// and its replay on reconnect, publishing, and turning transport loss into a
// single `ChannelNotice::Disconnected` per connection.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::Route;
use crate::stomp::{Command, Frame};

/// How long to wait for the server's CONNECTED frame.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open transport: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server refused connection: {0}")]
    Rejected(String),

    #[error("channel is not connected")]
    NotConnected,
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// Bearer credential issued by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Credential(token.into())
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// A frame pipe to the server. Dropping the outbound sender closes the
/// transport; the inbound receiver ends when the server side goes away.
pub struct Link {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl Link {
    pub fn new(outbound: mpsc::Sender<Frame>, inbound: mpsc::Receiver<Frame>) -> Self {
        Link { outbound, inbound }
    }
}

/// Opens transports. The websocket implementation lives in `crate::ws`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Host name announced in the CONNECT frame.
    fn host(&self) -> String;

    async fn open(&self, credential: &Credential) -> Result<Link, ChannelError>;
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Raw event from a connection's reader task, tagged with the connection
/// generation so events from a replaced connection can be discarded.
#[derive(Debug)]
pub enum ChannelEvent {
    Frame { generation: u64, frame: Frame },
    Closed { generation: u64 },
}

/// What the session loop needs to know about channel activity.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    Message { route: Route, body: String },
    /// The server sent an ERROR frame on a live connection.
    ServerError(String),
    /// The connection dropped unexpectedly. Emitted once per connection.
    Disconnected,
}

#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    destination: String,
    route: Route,
}

struct LiveLink {
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// RealtimeChannel
// ---------------------------------------------------------------------------

pub struct RealtimeChannel {
    connector: Box<dyn Connector>,
    credential: Credential,
    events_tx: mpsc::Sender<ChannelEvent>,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    generation: u64,
    link: Option<LiveLink>,
}

impl RealtimeChannel {
    /// Create a disconnected channel. Reader tasks forward raw events into
    /// `events_tx`; feed them back through [`RealtimeChannel::interpret`].
    pub fn new(
        connector: Box<dyn Connector>,
        credential: Credential,
        events_tx: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        RealtimeChannel {
            connector,
            credential,
            events_tx,
            subscriptions: Vec::new(),
            next_subscription: 0,
            generation: 0,
            link: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Open the transport, complete the STOMP handshake and re-issue every
    /// recorded subscription. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<(), ChannelError> {
        if self.link.is_some() {
            return Ok(());
        }

        let Link {
            outbound,
            mut inbound,
        } = self.connector.open(&self.credential).await?;

        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", self.connector.host())
            .header("heart-beat", "0,0")
            .header("Authorization", self.credential.bearer());
        outbound
            .send(connect)
            .await
            .map_err(|_| ChannelError::Handshake("transport closed before CONNECT".into()))?;

        match tokio::time::timeout(CONNECT_TIMEOUT, inbound.recv()).await {
            Ok(Some(frame)) if frame.command == Command::Connected => {
                debug!("STOMP session established (version {:?})", frame.get("version"));
            }
            Ok(Some(frame)) if frame.command == Command::Error => {
                let message = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
                return Err(ChannelError::Rejected(message));
            }
            Ok(Some(frame)) => {
                return Err(ChannelError::Handshake(format!(
                    "expected CONNECTED, got {}",
                    frame.command
                )));
            }
            Ok(None) => {
                return Err(ChannelError::Handshake("transport closed during handshake".into()));
            }
            Err(_) => {
                return Err(ChannelError::Handshake(format!(
                    "no CONNECTED within {CONNECT_TIMEOUT:?}"
                )));
            }
        }

        for sub in &self.subscriptions {
            outbound
                .send(subscribe_frame(sub))
                .await
                .map_err(|_| {
                    ChannelError::Handshake("transport closed while resubscribing".into())
                })?;
        }

        self.generation += 1;
        let generation = self.generation;
        let events_tx = self.events_tx.clone();
        let reader = tokio::spawn(forward_frames(inbound, events_tx, generation));

        self.link = Some(LiveLink { outbound, reader });
        info!(
            "Realtime channel connected (generation {}, {} subscriptions)",
            generation,
            self.subscriptions.len()
        );
        Ok(())
    }

    /// Record a subscription and, when connected, issue it. Subscribing to a
    /// destination that is already recorded does nothing.
    pub async fn subscribe(
        &mut self,
        destination: String,
        route: Route,
    ) -> Result<(), ChannelError> {
        if self.subscriptions.iter().any(|s| s.destination == destination) {
            return Ok(());
        }
        self.next_subscription += 1;
        let sub = Subscription {
            id: format!("sub-{}", self.next_subscription),
            destination,
            route,
        };
        debug!("Subscribing {} to {}", sub.id, sub.destination);
        if let Some(link) = &self.link {
            link.outbound
                .send(subscribe_frame(&sub))
                .await
                .map_err(|_| ChannelError::NotConnected)?;
        }
        self.subscriptions.push(sub);
        Ok(())
    }

    /// Publish `body` to `destination`. Fails fast when disconnected.
    pub async fn publish(&mut self, destination: &str, body: String) -> Result<(), ChannelError> {
        let link = self.link.as_ref().ok_or(ChannelError::NotConnected)?;
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body);
        link.outbound
            .send(frame)
            .await
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Unsubscribe everything, say goodbye and drop the transport. Pending
    /// reader events from this connection are ignored afterwards.
    pub async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            for sub in &self.subscriptions {
                let frame = Frame::new(Command::Unsubscribe).header("id", sub.id.clone());
                if link.outbound.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = link.outbound.send(Frame::new(Command::Disconnect)).await;
            link.reader.abort();
            info!("Realtime channel closed (generation {})", self.generation);
        }
        self.generation += 1;
        self.subscriptions.clear();
    }

    /// Translate a raw reader event into a notice, dropping anything that
    /// belongs to a connection other than the live one.
    pub fn interpret(&mut self, event: ChannelEvent) -> Option<ChannelNotice> {
        match event {
            ChannelEvent::Frame { generation, frame } => {
                if generation != self.generation || self.link.is_none() {
                    debug!("Dropping frame from stale connection generation {generation}");
                    return None;
                }
                match frame.command {
                    Command::Message => {
                        let route = self.route_for(&frame)?;
                        Some(ChannelNotice::Message {
                            route,
                            body: frame.body,
                        })
                    }
                    Command::Error => {
                        let message = frame
                            .get("message")
                            .unwrap_or(frame.body.as_str())
                            .to_string();
                        warn!("Server sent ERROR frame: {message}");
                        Some(ChannelNotice::ServerError(message))
                    }
                    other => {
                        debug!("Ignoring {other} frame");
                        None
                    }
                }
            }
            ChannelEvent::Closed { generation } => {
                if generation != self.generation || self.link.is_none() {
                    return None;
                }
                self.link = None;
                warn!("Realtime channel lost (generation {generation})");
                Some(ChannelNotice::Disconnected)
            }
        }
    }

    fn route_for(&self, frame: &Frame) -> Option<Route> {
        let by_id = frame
            .get("subscription")
            .and_then(|id| self.subscriptions.iter().find(|s| s.id == id));
        let by_destination = || {
            frame
                .get("destination")
                .and_then(|d| self.subscriptions.iter().find(|s| s.destination == d))
        };
        match by_id.or_else(by_destination) {
            Some(sub) => Some(sub.route),
            None => {
                warn!(
                    "Dropping MESSAGE for unknown subscription {:?} / {:?}",
                    frame.get("subscription"),
                    frame.get("destination")
                );
                None
            }
        }
    }
}

fn subscribe_frame(sub: &Subscription) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", sub.id.clone())
        .header("destination", sub.destination.clone())
}

/// Reader task: forward every inbound frame, then report the close once.
async fn forward_frames(
    mut inbound: mpsc::Receiver<Frame>,
    events_tx: mpsc::Sender<ChannelEvent>,
    generation: u64,
) {
    while let Some(frame) = inbound.recv().await {
        if events_tx
            .send(ChannelEvent::Frame { generation, frame })
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = events_tx.send(ChannelEvent::Closed { generation }).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Server half of an in-memory link.
    struct ServerEnd {
        from_client: mpsc::Receiver<Frame>,
        to_client: mpsc::Sender<Frame>,
    }

    /// Connector that hands every opened link's server half to the test and
    /// pre-queues the CONNECTED reply (or a refusal).
    struct MemoryConnector {
        servers: mpsc::UnboundedSender<ServerEnd>,
        refuse: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        fn host(&self) -> String {
            "memory".into()
        }

        async fn open(&self, _credential: &Credential) -> Result<Link, ChannelError> {
            let (client_tx, server_rx) = mpsc::channel(64);
            let (server_tx, client_rx) = mpsc::channel(64);
            let reply = match self.refuse.lock().unwrap().take() {
                Some(message) => Frame::new(Command::Error).header("message", message),
                None => Frame::new(Command::Connected).header("version", "1.2"),
            };
            server_tx.send(reply).await.unwrap();
            self.servers
                .send(ServerEnd {
                    from_client: server_rx,
                    to_client: server_tx,
                })
                .unwrap();
            Ok(Link::new(client_tx, client_rx))
        }
    }

    fn test_channel() -> (
        RealtimeChannel,
        mpsc::UnboundedReceiver<ServerEnd>,
        mpsc::Receiver<ChannelEvent>,
    ) {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(64);
        let connector = MemoryConnector {
            servers: servers_tx,
            refuse: Mutex::new(None),
        };
        let channel = RealtimeChannel::new(Box::new(connector), Credential::new("tok"), events_tx);
        (channel, servers_rx, events_rx)
    }

    #[tokio::test]
    async fn connect_sends_authenticated_connect_frame() {
        let (mut channel, mut servers, _events) = test_channel();
        channel.connect().await.unwrap();
        assert!(channel.is_connected());

        let mut server = servers.recv().await.unwrap();
        let connect = server.from_client.recv().await.unwrap();
        assert_eq!(connect.command, Command::Connect);
        assert_eq!(connect.get("Authorization"), Some("Bearer tok"));
        assert_eq!(connect.get("accept-version"), Some("1.2"));
        assert_eq!(connect.get("host"), Some("memory"));
    }

    #[tokio::test]
    async fn refused_connect_is_an_error() {
        let (servers_tx, _servers_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::channel(8);
        let connector = MemoryConnector {
            servers: servers_tx,
            refuse: Mutex::new(Some("bad token".into())),
        };
        let mut channel =
            RealtimeChannel::new(Box::new(connector), Credential::new("x"), events_tx);
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(ref m) if m == "bad token"));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails_fast() {
        let (mut channel, _servers, _events) = test_channel();
        let err = channel.publish("/app/getDraftState", "1".into()).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_per_destination() {
        let (mut channel, mut servers, _events) = test_channel();
        channel.connect().await.unwrap();
        channel.subscribe("/topic/draft/1".into(), Route::Broadcast).await.unwrap();
        channel.subscribe("/topic/draft/1".into(), Route::Broadcast).await.unwrap();
        assert_eq!(channel.subscription_count(), 1);

        let mut server = servers.recv().await.unwrap();
        let _connect = server.from_client.recv().await.unwrap();
        let sub = server.from_client.recv().await.unwrap();
        assert_eq!(sub.command, Command::Subscribe);
        assert_eq!(sub.get("id"), Some("sub-1"));
        assert!(server.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn messages_are_routed_by_subscription_id() {
        let (mut channel, mut servers, mut events) = test_channel();
        channel.subscribe("/topic/draft/1".into(), Route::Broadcast).await.unwrap();
        channel
            .subscribe("/topic/draft/1/complete".into(), Route::Complete)
            .await
            .unwrap();
        channel.connect().await.unwrap();
        let server = servers.recv().await.unwrap();

        let msg = Frame::new(Command::Message)
            .header("subscription", "sub-2")
            .header("destination", "/topic/draft/1/complete")
            .body("Draft Complete");
        server.to_client.send(msg).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(
            channel.interpret(event),
            Some(ChannelNotice::Message {
                route: Route::Complete,
                body: "Draft Complete".into()
            })
        );
    }

    #[tokio::test]
    async fn transport_loss_is_reported_exactly_once() {
        let (mut channel, mut servers, mut events) = test_channel();
        channel.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        drop(server);

        let event = events.recv().await.unwrap();
        assert_eq!(channel.interpret(event), Some(ChannelNotice::Disconnected));
        assert!(!channel.is_connected());

        // A duplicate close for the same generation is swallowed.
        let dup = ChannelEvent::Closed { generation: 1 };
        assert_eq!(channel.interpret(dup), None);
    }

    #[tokio::test]
    async fn reconnect_replays_subscriptions_before_publish() {
        let (mut channel, mut servers, mut events) = test_channel();
        channel.subscribe("/topic/draft/9".into(), Route::Broadcast).await.unwrap();
        channel
            .subscribe("/user/topic/draft/9".into(), Route::Personal)
            .await
            .unwrap();
        channel.connect().await.unwrap();
        drop(servers.recv().await.unwrap());
        let event = events.recv().await.unwrap();
        assert_eq!(channel.interpret(event), Some(ChannelNotice::Disconnected));

        channel.connect().await.unwrap();
        channel.publish("/app/getDraftState", "9".into()).await.unwrap();

        let mut server = servers.recv().await.unwrap();
        let commands: Vec<_> = (0..4)
            .map(|_| server.from_client.try_recv().unwrap())
            .map(|f| (f.command, f.get("destination").map(str::to_string)))
            .collect();
        assert_eq!(
            commands,
            vec![
                (Command::Connect, None),
                (Command::Subscribe, Some("/topic/draft/9".into())),
                (Command::Subscribe, Some("/user/topic/draft/9".into())),
                (Command::Send, Some("/app/getDraftState".into())),
            ]
        );
    }

    #[tokio::test]
    async fn close_unsubscribes_and_ignores_late_events() {
        let (mut channel, mut servers, _events) = test_channel();
        channel.subscribe("/topic/draft/1".into(), Route::Broadcast).await.unwrap();
        channel.connect().await.unwrap();
        channel.close().await;
        assert!(!channel.is_connected());
        assert_eq!(channel.subscription_count(), 0);

        let mut server = servers.recv().await.unwrap();
        let frames: Vec<Command> = std::iter::from_fn(|| server.from_client.try_recv().ok())
            .map(|f| f.command)
            .collect();
        assert_eq!(
            frames,
            vec![
                Command::Connect,
                Command::Subscribe,
                Command::Unsubscribe,
                Command::Disconnect
            ]
        );

        let late = ChannelEvent::Frame {
            generation: 1,
            frame: Frame::new(Command::Message).header("subscription", "sub-1"),
        };
        assert_eq!(channel.interpret(late), None);
    }

    #[tokio::test]
    async fn server_error_frame_is_surfaced() {
        let (mut channel, mut servers, mut events) = test_channel();
        channel.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        server
            .to_client
            .send(Frame::new(Command::Error).header("message", "session expired"))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(
            channel.interpret(event),
            Some(ChannelNotice::ServerError("session expired".into()))
        );
    }
}
