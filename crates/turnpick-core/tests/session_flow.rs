// Integration tests for the session loop.
//
// Each test runs `session::run` against a scripted in-memory connector and
// plays the scheduler's side: reading the frames the client sends and
// delivering MESSAGE frames on the session topics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use turnpick_core::channel::{ChannelError, Connector, Credential, Link};
use turnpick_core::eligibility::SquadConstraint;
use turnpick_core::error::EngineError;
use turnpick_core::projector::Phase;
use turnpick_core::protocol::{Participant, PlayerId, Route, SessionId};
use turnpick_core::session::{
    self, ConnectionStatus, ReconnectPolicy, SessionCommand, SessionContext, SessionEnd,
    SessionState, SessionUpdate, SnapshotView,
};
use turnpick_core::stomp::{Command, Frame};

const SESSION: SessionId = SessionId(42);

// ===========================================================================
// Scripted scheduler
// ===========================================================================

/// The scheduler's half of one connection.
struct Server {
    from_client: mpsc::Receiver<Frame>,
    to_client: mpsc::Sender<Frame>,
}

impl Server {
    async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("client frame within timeout")
            .expect("client link open")
    }

    /// Skip ahead to the next SEND frame.
    async fn next_send(&mut self) -> Frame {
        loop {
            let frame = self.next_frame().await;
            if frame.command == Command::Send {
                return frame;
            }
        }
    }

    async fn deliver(&self, route: Route, body: &str) {
        let frame = Frame::new(Command::Message)
            .header("destination", route.destination(SESSION))
            .header("message-id", "m")
            .body(body);
        self.to_client.send(frame).await.expect("client reader alive");
    }
}

struct ScriptedConnector {
    servers: mpsc::UnboundedSender<Server>,
    refusals: Arc<AtomicU32>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn host(&self) -> String {
        "scheduler".into()
    }

    async fn open(&self, _credential: &Credential) -> Result<Link, ChannelError> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::Connect("connection refused".into()));
        }
        let (client_tx, server_rx) = mpsc::channel(64);
        let (server_tx, client_rx) = mpsc::channel(64);
        server_tx
            .send(Frame::new(Command::Connected).header("version", "1.2"))
            .await
            .expect("fresh link");
        let _ = self.servers.send(Server {
            from_client: server_rx,
            to_client: server_tx,
        });
        Ok(Link::new(client_tx, client_rx))
    }
}

struct Harness {
    cmd_tx: mpsc::Sender<SessionCommand>,
    ui_rx: mpsc::Receiver<SessionUpdate>,
    servers: mpsc::UnboundedReceiver<Server>,
    refusals: Arc<AtomicU32>,
    handle: JoinHandle<SessionEnd>,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(ReconnectPolicy::default())
    }

    fn start_with(policy: ReconnectPolicy) -> Self {
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let refusals = Arc::new(AtomicU32::new(0));
        let connector = ScriptedConnector {
            servers: servers_tx,
            refusals: refusals.clone(),
        };
        let context = SessionContext {
            session_id: SESSION,
            local: alice(),
            credential: Credential::new("secret"),
        };
        let (events_tx, events_rx) = mpsc::channel(session::EVENT_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (ui_tx, ui_rx) = mpsc::channel(1024);
        let state = SessionState::new(
            context,
            Box::new(connector),
            SquadConstraint::new(3),
            policy,
            events_tx,
        );
        let handle = tokio::spawn(session::run(events_rx, cmd_rx, ui_tx, state));
        Harness {
            cmd_tx,
            ui_rx,
            servers,
            refusals,
            handle,
        }
    }

    /// Wait for the next connection and consume its handshake, subscriptions
    /// and snapshot request.
    async fn accept(&mut self) -> Server {
        let mut server = tokio::time::timeout(Duration::from_secs(30), self.servers.recv())
            .await
            .expect("connection within timeout")
            .expect("connector alive");
        let request = server.next_send().await;
        assert_eq!(request.get("destination"), Some("/app/getDraftState"));
        server
    }

    async fn command(&self, cmd: SessionCommand) {
        self.cmd_tx.send(cmd).await.expect("session loop alive");
    }

    async fn next_raw(&mut self) -> SessionUpdate {
        tokio::time::timeout(Duration::from_secs(30), self.ui_rx.recv())
            .await
            .expect("update within timeout")
            .expect("session loop alive")
    }

    /// Next update that is not a clock tick.
    async fn next_update(&mut self) -> SessionUpdate {
        loop {
            match self.next_raw().await {
                SessionUpdate::TurnClock(_) | SessionUpdate::StartClock(_) => {}
                other => return other,
            }
        }
    }

    async fn next_snapshot(&mut self) -> SnapshotView {
        loop {
            if let SessionUpdate::Snapshot(view) = self.next_update().await {
                return *view;
            }
        }
    }
}

// ===========================================================================
// Fixtures
// ===========================================================================

fn alice() -> Participant {
    Participant::new(1, "alice")
}

fn manager(id: u64, name: &str) -> serde_json::Value {
    json!({"id": id, "username": name})
}

fn pool_player(id: u64, position: &str, club: &str) -> serde_json::Value {
    json!({
        "id": id,
        "firstName": "Player",
        "lastName": format!("No{id}"),
        "position": position,
        "clubName": club,
    })
}

/// Snapshot with `holder` on the clock, ordered by `sequence`.
fn snapshot(holder: (u64, &str), sequence: u64, remaining_ms: i64) -> String {
    json!({
        "sequence": sequence,
        "currentManager": manager(holder.0, holder.1),
        "nextManager": manager(2, "bob"),
        "squads": [
            {"manager": manager(1, "alice"), "players": []},
            {"manager": manager(2, "bob"), "players": []},
        ],
        "draftPool": [
            pool_player(11, "midfielder", "Arsenal"),
            pool_player(12, "forward", "Chelsea"),
        ],
        "lastPickMessage": null,
        "remainingTime": remaining_ms,
    })
    .to_string()
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn join_subscribes_every_topic_then_requests_snapshot() {
    let mut h = Harness::start();
    let mut server = h.servers.recv().await.unwrap();

    let connect = server.next_frame().await;
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(connect.get("Authorization"), Some("Bearer secret"));

    let mut subscribed = Vec::new();
    for _ in 0..Route::ALL.len() {
        let frame = server.next_frame().await;
        assert_eq!(frame.command, Command::Subscribe);
        subscribed.push(frame.get("destination").unwrap().to_string());
    }
    assert_eq!(
        subscribed,
        vec![
            "/topic/draft/42",
            "/user/topic/draft/42/start",
            "/user/topic/draft/42",
            "/topic/draft/42/complete",
            "/user/topic/draft/42/rejected",
        ]
    );

    let request = server.next_frame().await;
    assert_eq!(request.command, Command::Send);
    assert_eq!(request.get("destination"), Some("/app/getDraftState"));
    assert_eq!(request.body, "42");

    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Connected)
    );
}

#[tokio::test]
async fn prepick_is_submitted_exactly_once_when_turn_arrives() {
    let mut h = Harness::start();
    let mut server = h.accept().await;

    server.deliver(Route::Broadcast, &snapshot((2, "bob"), 1, 30_000)).await;
    let view = h.next_snapshot().await;
    assert!(!view.local_turn);

    h.command(SessionCommand::PrePick(PlayerId(11))).await;
    match h.next_update().await {
        SessionUpdate::PrePickQueued(p) => assert_eq!(p.id, PlayerId(11)),
        other => panic!("expected PrePickQueued, got {other:?}"),
    }

    server.deliver(Route::Broadcast, &snapshot((1, "alice"), 2, 30_000)).await;
    let pick = server.next_send().await;
    assert_eq!(pick.get("destination"), Some("/app/pickPlayer"));
    let body: serde_json::Value = serde_json::from_str(&pick.body).unwrap();
    assert_eq!(body, json!({"sessionId": 42, "playerId": 11}));

    let view = h.next_snapshot().await;
    assert!(view.local_turn);
    match h.next_update().await {
        SessionUpdate::PrePickSubmitted(p) => assert_eq!(p.id, PlayerId(11)),
        other => panic!("expected PrePickSubmitted, got {other:?}"),
    }

    // The same turn re-broadcast must not submit again.
    server.deliver(Route::Broadcast, &snapshot((1, "alice"), 2, 25_000)).await;
    let view = h.next_snapshot().await;
    assert!(!view.turn_changed);

    h.command(SessionCommand::RequestSnapshot).await;
    let next = server.next_send().await;
    assert_eq!(next.get("destination"), Some("/app/getDraftState"));
}

#[tokio::test]
async fn failed_prepick_stays_queued_and_is_retried_after_reconnect() {
    tokio::time::pause();
    let mut h = Harness::start();
    let server = h.accept().await;

    server.deliver(Route::Broadcast, &snapshot((2, "bob"), 1, 30_000)).await;
    h.next_snapshot().await;
    h.command(SessionCommand::PrePick(PlayerId(11))).await;
    assert!(matches!(h.next_update().await, SessionUpdate::PrePickQueued(_)));

    // The scheduler stops reading, so the drained pick cannot be written.
    let Server {
        from_client,
        to_client,
    } = server;
    drop(from_client);
    let server = Server {
        from_client: mpsc::channel(1).1,
        to_client,
    };
    server.deliver(Route::Broadcast, &snapshot((1, "alice"), 2, 30_000)).await;

    let view = h.next_snapshot().await;
    assert!(view.local_turn);
    assert!(matches!(
        h.next_update().await,
        SessionUpdate::Error(EngineError::Transport(_))
    ));
    match h.next_update().await {
        SessionUpdate::PrePickQueued(p) => assert_eq!(p.id, PlayerId(11)),
        other => panic!("expected the pick to stay queued, got {other:?}"),
    }

    drop(server);
    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Reconnecting { attempt: 1 })
    );
    let mut server = h.accept().await;
    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Connected)
    );

    // Same turn, still alice: the restored pick goes out once.
    server.deliver(Route::Personal, &snapshot((1, "alice"), 2, 20_000)).await;
    let pick = server.next_send().await;
    assert_eq!(pick.get("destination"), Some("/app/pickPlayer"));
    let body: serde_json::Value = serde_json::from_str(&pick.body).unwrap();
    assert_eq!(body, json!({"sessionId": 42, "playerId": 11}));

    h.next_snapshot().await;
    match h.next_update().await {
        SessionUpdate::PrePickSubmitted(p) => assert_eq!(p.id, PlayerId(11)),
        other => panic!("expected PrePickSubmitted, got {other:?}"),
    }

    server.deliver(Route::Broadcast, &snapshot((1, "alice"), 2, 15_000)).await;
    h.next_snapshot().await;
    h.command(SessionCommand::RequestSnapshot).await;
    let next = server.next_send().await;
    assert_eq!(next.get("destination"), Some("/app/getDraftState"));
}

#[tokio::test]
async fn pick_on_own_turn_is_sent_and_unknown_player_refused() {
    let mut h = Harness::start();
    let mut server = h.accept().await;

    h.command(SessionCommand::Pick(PlayerId(11))).await;
    match h.next_update().await {
        SessionUpdate::Connection(ConnectionStatus::Connected) => {}
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        h.next_update().await,
        SessionUpdate::Error(EngineError::RejectedPick(_))
    ));

    server.deliver(Route::Broadcast, &snapshot((1, "alice"), 1, 30_000)).await;
    h.next_snapshot().await;

    h.command(SessionCommand::Pick(PlayerId(12))).await;
    let pick = server.next_send().await;
    assert_eq!(pick.get("destination"), Some("/app/pickPlayer"));
    match h.next_update().await {
        SessionUpdate::PickSent(p) => assert_eq!(p.id, PlayerId(12)),
        other => panic!("expected PickSent, got {other:?}"),
    }

    h.command(SessionCommand::Pick(PlayerId(999))).await;
    match h.next_update().await {
        SessionUpdate::Error(EngineError::RejectedPick(reason)) => {
            assert!(reason.contains("999"));
        }
        other => panic!("expected RejectedPick, got {other:?}"),
    }
}

#[tokio::test]
async fn pick_out_of_turn_is_queued() {
    let mut h = Harness::start();
    let server = h.accept().await;

    server.deliver(Route::Broadcast, &snapshot((2, "bob"), 1, 30_000)).await;
    h.next_snapshot().await;

    h.command(SessionCommand::Pick(PlayerId(12))).await;
    match h.next_update().await {
        SessionUpdate::PrePickQueued(p) => assert_eq!(p.id, PlayerId(12)),
        other => panic!("expected PrePickQueued, got {other:?}"),
    }

    h.command(SessionCommand::CancelPrePick).await;
    assert_eq!(h.next_update().await, SessionUpdate::PrePickCleared);
}

#[tokio::test]
async fn scheduler_rejection_is_surfaced() {
    let mut h = Harness::start();
    let server = h.accept().await;
    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Connected)
    );

    server.deliver(Route::Rejected, r#""player already taken""#).await;
    assert_eq!(
        h.next_update().await,
        SessionUpdate::Error(EngineError::RejectedPick("player already taken".into()))
    );
}

#[tokio::test]
async fn reconnect_resubscribes_and_refreshes_snapshot() {
    tokio::time::pause();
    let mut h = Harness::start_with(ReconnectPolicy {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
    });
    let server = h.accept().await;
    server.deliver(Route::Broadcast, &snapshot((2, "bob"), 3, 30_000)).await;
    h.next_snapshot().await;

    h.refusals.store(1, Ordering::SeqCst);
    drop(server);

    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Reconnecting { attempt: 1 })
    );
    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Reconnecting { attempt: 2 })
    );

    let mut server = h.servers.recv().await.unwrap();
    let mut commands = Vec::new();
    loop {
        let frame = server.next_frame().await;
        let done = frame.command == Command::Send;
        commands.push((frame.command, frame.get("destination").map(str::to_string)));
        if done {
            break;
        }
    }
    assert_eq!(commands.len(), 2 + Route::ALL.len());
    assert_eq!(commands[0].0, Command::Connect);
    assert!(commands[1..=Route::ALL.len()]
        .iter()
        .all(|(c, _)| *c == Command::Subscribe));
    assert_eq!(
        commands.last().unwrap().1.as_deref(),
        Some("/app/getDraftState")
    );

    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Connected)
    );

    server.deliver(Route::Personal, &snapshot((2, "bob"), 3, 20_000)).await;
    h.next_snapshot().await;
    assert_eq!(h.next_raw().await, SessionUpdate::TurnClock(20_000));
}

#[tokio::test]
async fn malformed_snapshot_is_dropped_without_update() {
    let mut h = Harness::start();
    let server = h.accept().await;

    server.deliver(Route::Broadcast, &snapshot((2, "bob"), 1, 30_000)).await;
    let before = h.next_snapshot().await;

    server
        .deliver(Route::Broadcast, r#"{"currentManager": {"id": 1, "username": "alice"}}"#)
        .await;
    server.deliver(Route::Broadcast, "not json at all").await;
    server.deliver(Route::Rejected, "marker").await;

    // The only thing to come through is the marker.
    assert_eq!(
        h.next_update().await,
        SessionUpdate::Error(EngineError::RejectedPick("marker".into()))
    );

    server.deliver(Route::Personal, &snapshot((2, "bob"), 1, 30_000)).await;
    let after = h.next_snapshot().await;
    assert_eq!(after.state, before.state);
}

#[tokio::test]
async fn snake_order_is_shown_exactly_as_broadcast() {
    let mut h = Harness::start();
    let server = h.accept().await;

    let order = ["A", "B", "C", "D", "D", "C", "B", "A", "A", "B", "C"];
    let ids = |name: &str| match name {
        "A" => 1,
        "B" => 2,
        "C" => 3,
        _ => 4,
    };
    for (i, name) in order.iter().enumerate() {
        server
            .deliver(Route::Broadcast, &snapshot((ids(*name), *name), i as u64 + 1, 30_000))
            .await;
    }

    let mut seen = Vec::new();
    for _ in 0..order.len() {
        let view = h.next_snapshot().await;
        seen.push(view.state.current_holder.username);
    }
    assert_eq!(seen, order);
}

#[tokio::test]
async fn repeated_snapshot_requests_are_idempotent() {
    let mut h = Harness::start();
    let mut server = h.accept().await;

    h.command(SessionCommand::RequestSnapshot).await;
    h.command(SessionCommand::RequestSnapshot).await;
    for _ in 0..2 {
        let req = server.next_send().await;
        assert_eq!(req.get("destination"), Some("/app/getDraftState"));
        assert_eq!(req.body, "42");
    }

    let body = snapshot((2, "bob"), 5, 30_000);
    server.deliver(Route::Personal, &body).await;
    server.deliver(Route::Personal, &body).await;

    let first = h.next_snapshot().await;
    let second = h.next_snapshot().await;
    assert_eq!(first.state, second.state);
    assert_eq!(first.eligible, second.eligible);
    assert!(!second.turn_changed);
}

#[tokio::test]
async fn start_countdown_runs_then_first_snapshot_activates() {
    tokio::time::pause();
    let mut h = Harness::start();
    let server = h.accept().await;
    assert_eq!(
        h.next_raw().await,
        SessionUpdate::Connection(ConnectionStatus::Connected)
    );

    server.deliver(Route::StartsIn, "3000").await;
    assert_eq!(
        h.next_raw().await,
        SessionUpdate::Phase(Phase::CountingDown { waiting: false })
    );
    let mut clock = Vec::new();
    for _ in 0..4 {
        match h.next_raw().await {
            SessionUpdate::StartClock(ms) => clock.push(ms),
            other => panic!("expected StartClock, got {other:?}"),
        }
    }
    assert_eq!(clock, vec![3000, 2000, 1000, 0]);
    assert_eq!(
        h.next_raw().await,
        SessionUpdate::Phase(Phase::CountingDown { waiting: true })
    );

    server.deliver(Route::Broadcast, &snapshot((1, "alice"), 1, 30_000)).await;
    assert_eq!(h.next_raw().await, SessionUpdate::Phase(Phase::Active));
    let view = h.next_snapshot().await;
    assert!(view.local_turn);
}

#[tokio::test]
async fn completion_tears_the_session_down() {
    let mut h = Harness::start();
    let mut server = h.accept().await;
    server.deliver(Route::Broadcast, &snapshot((2, "bob"), 1, 30_000)).await;
    h.next_snapshot().await;

    server.deliver(Route::Complete, "Draft Complete").await;

    let mut teardown = Vec::new();
    while let Some(frame) = server.from_client.recv().await {
        teardown.push(frame.command);
        if frame.command == Command::Disconnect {
            break;
        }
    }
    let unsubscribes = teardown
        .iter()
        .filter(|c| **c == Command::Unsubscribe)
        .count();
    assert_eq!(unsubscribes, Route::ALL.len());
    assert_eq!(teardown.last(), Some(&Command::Disconnect));

    assert_eq!(
        h.next_update().await,
        SessionUpdate::Connection(ConnectionStatus::Closed)
    );
    assert_eq!(h.next_update().await, SessionUpdate::Phase(Phase::Completed));
    assert_eq!(h.handle.await.unwrap(), SessionEnd::Completed);
}

#[tokio::test]
async fn leave_closes_the_channel() {
    let mut h = Harness::start();
    let mut server = h.accept().await;

    h.command(SessionCommand::Leave).await;
    let mut last = None;
    while let Some(frame) = server.from_client.recv().await {
        last = Some(frame.command);
        if frame.command == Command::Disconnect {
            break;
        }
    }
    assert_eq!(last, Some(Command::Disconnect));
    assert_eq!(h.handle.await.unwrap(), SessionEnd::Left);
}
