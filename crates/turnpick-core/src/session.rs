// Session lifecycle: join, the single-task event loop, reconnect, teardown.
//
// Everything that mutates draft state happens inside `run`, one event at a
// time. Timers only produce display values; the turn clock is restarted from
// every applied snapshot and never decides anything on its own.

use std::future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelNotice, Connector, Credential, RealtimeChannel};
use crate::countdown::CountdownTimer;
use crate::eligibility::{PoolEntry, SquadConstraint};
use crate::error::EngineError;
use crate::prepick::PrePickQueue;
use crate::projector::{DraftProjector, Phase, Projection, SnapshotApplied};
use crate::protocol::{
    DraftState, Participant, PickRequest, PlayerId, PlayerRecord, Route, SessionId,
    PICK_DESTINATION, SNAPSHOT_REQUEST_DESTINATION,
};

/// Suggested capacity for the channel-event and update queues.
pub const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Context and policy
// ---------------------------------------------------------------------------

/// Who is joining which draft, with what credential. Passed in explicitly;
/// nothing is read from ambient state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub local: Participant,
    pub credential: Credential,
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

// ---------------------------------------------------------------------------
// Commands and updates
// ---------------------------------------------------------------------------

/// User intent sent into the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Pick now when it is the local turn, otherwise queue as the pre-pick.
    Pick(PlayerId),
    /// Queue for the next turn that becomes the local participant's.
    PrePick(PlayerId),
    CancelPrePick,
    RequestSnapshot,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

/// An applied snapshot with everything the front end derives from it.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotView {
    pub state: DraftState,
    pub eligible: Vec<PlayerRecord>,
    pub annotated: Vec<PoolEntry>,
    pub local_turn: bool,
    pub turn_changed: bool,
}

/// Pushed to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Phase(Phase),
    Connection(ConnectionStatus),
    Snapshot(Box<SnapshotView>),
    TurnClock(u64),
    StartClock(u64),
    PrePickQueued(PlayerRecord),
    PrePickCleared,
    PrePickSubmitted(PlayerRecord),
    PickSent(PlayerRecord),
    Error(EngineError),
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    Left,
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Exclusive owner of the channel, the projected draft, the pre-pick queue
/// and both timers for one session.
pub struct SessionState {
    session_id: SessionId,
    channel: RealtimeChannel,
    projector: DraftProjector,
    prepicks: PrePickQueue,
    turn_timer: CountdownTimer,
    start_timer: CountdownTimer,
    policy: ReconnectPolicy,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    /// A pre-pick was put back after a failed submission and should be
    /// retried by the next snapshot that names the local participant.
    retry_prepick: bool,
}

impl SessionState {
    pub fn new(
        context: SessionContext,
        connector: Box<dyn Connector>,
        constraint: SquadConstraint,
        policy: ReconnectPolicy,
        events_tx: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        let local_id = context.local.id;
        SessionState {
            session_id: context.session_id,
            channel: RealtimeChannel::new(connector, context.credential, events_tx),
            projector: DraftProjector::new(context.local, constraint),
            prepicks: PrePickQueue::new(local_id),
            turn_timer: CountdownTimer::new(),
            start_timer: CountdownTimer::new(),
            policy,
            reconnect_attempt: 0,
            reconnect_at: None,
            retry_prepick: false,
        }
    }

    /// Record every session subscription, connect (which issues them) and
    /// ask for the current snapshot.
    pub async fn join(&mut self) -> Result<(), EngineError> {
        for route in Route::ALL {
            self.channel
                .subscribe(route.destination(self.session_id), route)
                .await?;
        }
        self.channel.connect().await?;
        info!("Joined draft session {}", self.session_id);
        self.request_snapshot().await
    }

    /// Ask the scheduler for a full snapshot. Safe to repeat.
    pub async fn request_snapshot(&mut self) -> Result<(), EngineError> {
        debug!("Requesting snapshot for session {}", self.session_id);
        self.channel
            .publish(SNAPSHOT_REQUEST_DESTINATION, self.session_id.to_string())
            .await?;
        Ok(())
    }

    /// Close the channel and clear every timer and pending pick.
    pub async fn leave(&mut self) {
        self.channel.close().await;
        self.turn_timer.stop();
        self.start_timer.stop();
        self.prepicks.clear_all();
        self.retry_prepick = false;
        self.reconnect_at = None;
        info!("Left draft session {}", self.session_id);
    }

    async fn publish_pick(&mut self, player: &PlayerRecord) -> Result<(), EngineError> {
        let body = PickRequest {
            session_id: self.session_id,
            player_id: player.id,
        }
        .to_body()?;
        self.channel.publish(PICK_DESTINATION, body).await?;
        info!("Submitted pick {} ({})", player.display_name(), player.id);
        Ok(())
    }

    fn schedule_reconnect(&mut self) -> ConnectionStatus {
        let delay = self.policy.delay(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        self.reconnect_at = Some(Instant::now() + delay);
        info!(
            "Reconnect attempt {} in {:?}",
            self.reconnect_attempt, delay
        );
        ConnectionStatus::Reconnecting {
            attempt: self.reconnect_attempt,
        }
    }

    fn lookup(&self, id: PlayerId) -> Result<PlayerRecord, EngineError> {
        let state = self
            .projector
            .state()
            .ok_or_else(|| EngineError::RejectedPick("the draft has not started".into()))?;
        state
            .pool_player(id)
            .cloned()
            .ok_or_else(|| EngineError::RejectedPick(format!("player {id} is not in the pool")))
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Run the session event loop.
///
/// Joins first, then listens with `tokio::select!` on:
/// 1. channel events from the connection's reader task
/// 2. user commands
/// 3. the turn countdown tick
/// 4. the start countdown tick
/// 5. the reconnect timer
///
/// Pushes updates through `ui_tx`. Returns when the draft completes, the user
/// leaves, or the command channel closes.
pub async fn run(
    mut events_rx: mpsc::Receiver<ChannelEvent>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    ui_tx: mpsc::Sender<SessionUpdate>,
    mut state: SessionState,
) -> SessionEnd {
    info!("Session event loop started for draft {}", state.session_id);

    match state.join().await {
        Ok(()) => {
            let _ = ui_tx
                .send(SessionUpdate::Connection(ConnectionStatus::Connected))
                .await;
        }
        Err(e) => {
            warn!("Initial join failed: {e}");
            let status = state.schedule_reconnect();
            let _ = ui_tx.send(SessionUpdate::Connection(status)).await;
            let _ = ui_tx.send(SessionUpdate::Error(e)).await;
        }
    }

    let end = loop {
        tokio::select! {
            // --- Channel events ---
            event = events_rx.recv() => {
                let Some(event) = event else {
                    warn!("Channel event queue closed");
                    break SessionEnd::Left;
                };
                let Some(notice) = state.channel.interpret(event) else {
                    continue;
                };
                if let Some(end) = handle_notice(&mut state, notice, &ui_tx).await {
                    break end;
                }
            }

            // --- User commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Leave) | None => {
                        info!("Leaving session");
                        break SessionEnd::Left;
                    }
                    Some(cmd) => handle_command(&mut state, cmd, &ui_tx).await,
                }
            }

            // --- Turn countdown ---
            ms = state.turn_timer.tick() => {
                let _ = ui_tx.send(SessionUpdate::TurnClock(ms)).await;
            }

            // --- Start countdown ---
            ms = state.start_timer.tick() => {
                let _ = ui_tx.send(SessionUpdate::StartClock(ms)).await;
                if ms == 0 && state.projector.start_countdown_elapsed() {
                    let _ = ui_tx.send(SessionUpdate::Phase(state.projector.phase())).await;
                }
            }

            // --- Reconnect ---
            _ = reconnect_due(state.reconnect_at) => {
                state.reconnect_at = None;
                handle_reconnect(&mut state, &ui_tx).await;
            }
        }
    };

    state.leave().await;
    let _ = ui_tx
        .send(SessionUpdate::Connection(ConnectionStatus::Closed))
        .await;
    let _ = ui_tx
        .send(SessionUpdate::Phase(state.projector.phase()))
        .await;
    info!("Session event loop exiting ({end:?})");
    end
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}

async fn handle_reconnect(state: &mut SessionState, ui_tx: &mpsc::Sender<SessionUpdate>) {
    if let Err(e) = state.channel.connect().await {
        warn!("Reconnect failed: {e}");
        let status = state.schedule_reconnect();
        let _ = ui_tx.send(SessionUpdate::Connection(status)).await;
        return;
    }
    info!("Reconnected after {} attempt(s)", state.reconnect_attempt);
    state.reconnect_attempt = 0;
    let _ = ui_tx
        .send(SessionUpdate::Connection(ConnectionStatus::Connected))
        .await;
    if let Err(e) = state.request_snapshot().await {
        warn!("Snapshot request after reconnect failed: {e}");
    }
}

/// Handle one channel notice. Returns `Some` when the loop should end.
async fn handle_notice(
    state: &mut SessionState,
    notice: ChannelNotice,
    ui_tx: &mpsc::Sender<SessionUpdate>,
) -> Option<SessionEnd> {
    match notice {
        ChannelNotice::Message { route, body } => {
            let projection = match state.projector.ingest(route, &body) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Dropping malformed {route:?} message: {e}");
                    return None;
                }
            };
            handle_projection(state, projection, ui_tx).await
        }
        ChannelNotice::ServerError(message) => {
            let _ = ui_tx
                .send(SessionUpdate::Error(EngineError::Transport(message)))
                .await;
            None
        }
        ChannelNotice::Disconnected => {
            let status = state.schedule_reconnect();
            let _ = ui_tx.send(SessionUpdate::Connection(status)).await;
            None
        }
    }
}

async fn handle_projection(
    state: &mut SessionState,
    projection: Projection,
    ui_tx: &mpsc::Sender<SessionUpdate>,
) -> Option<SessionEnd> {
    match projection {
        Projection::Applied(applied) => {
            handle_applied(state, applied, ui_tx).await;
            None
        }
        Projection::StartsIn(ms) => {
            state.start_timer.start(ms);
            let _ = ui_tx.send(SessionUpdate::Phase(state.projector.phase())).await;
            let _ = ui_tx.send(SessionUpdate::StartClock(ms)).await;
            None
        }
        Projection::Completed => Some(SessionEnd::Completed),
        Projection::Rejected(reason) => {
            let _ = ui_tx
                .send(SessionUpdate::Error(EngineError::RejectedPick(reason)))
                .await;
            None
        }
        Projection::Stale | Projection::Ignored => None,
    }
}

async fn handle_applied(
    state: &mut SessionState,
    applied: SnapshotApplied,
    ui_tx: &mpsc::Sender<SessionUpdate>,
) {
    if applied.entered_active {
        state.start_timer.stop();
        let _ = ui_tx.send(SessionUpdate::Phase(Phase::Active)).await;
    }
    state.turn_timer.start(applied.remaining_ms);

    if let Some(snapshot) = state.projector.state() {
        let view = SnapshotView {
            state: snapshot.clone(),
            eligible: state.projector.eligible().to_vec(),
            annotated: state.projector.annotated().to_vec(),
            local_turn: state.projector.is_local_turn(),
            turn_changed: applied.turn_changed,
        };
        let _ = ui_tx.send(SessionUpdate::Snapshot(Box::new(view))).await;
    }
    let _ = ui_tx
        .send(SessionUpdate::TurnClock(applied.remaining_ms))
        .await;

    if !(applied.turn_changed || state.retry_prepick) {
        return;
    }
    let Some(player) = state.prepicks.on_turn_changed(applied.holder) else {
        return;
    };
    state.retry_prepick = false;
    match state.publish_pick(&player).await {
        Ok(()) => {
            let _ = ui_tx.send(SessionUpdate::PrePickSubmitted(player)).await;
        }
        Err(e) => {
            warn!("Pre-pick submission failed, keeping it queued: {e}");
            state.prepicks.restore(player);
            state.retry_prepick = true;
            let _ = ui_tx.send(SessionUpdate::Error(e)).await;
            if let Some(queued) = state.prepicks.local_pending() {
                let _ = ui_tx.send(SessionUpdate::PrePickQueued(queued.clone())).await;
            }
        }
    }
}

async fn handle_command(
    state: &mut SessionState,
    cmd: SessionCommand,
    ui_tx: &mpsc::Sender<SessionUpdate>,
) {
    let local = state.projector.local().id;
    match cmd {
        SessionCommand::Pick(id) => {
            let player = match state.lookup(id) {
                Ok(p) => p,
                Err(e) => {
                    let _ = ui_tx.send(SessionUpdate::Error(e)).await;
                    return;
                }
            };
            if !state.projector.is_local_turn() {
                state.prepicks.set(local, player.clone());
                let _ = ui_tx.send(SessionUpdate::PrePickQueued(player)).await;
                return;
            }
            match state.publish_pick(&player).await {
                Ok(()) => {
                    let _ = ui_tx.send(SessionUpdate::PickSent(player)).await;
                }
                Err(e) => {
                    let _ = ui_tx.send(SessionUpdate::Error(e)).await;
                }
            }
        }
        SessionCommand::PrePick(id) => match state.lookup(id) {
            Ok(player) => {
                state.prepicks.set(local, player.clone());
                let _ = ui_tx.send(SessionUpdate::PrePickQueued(player)).await;
            }
            Err(e) => {
                let _ = ui_tx.send(SessionUpdate::Error(e)).await;
            }
        },
        SessionCommand::CancelPrePick => {
            if state.prepicks.cancel(local).is_some() {
                state.retry_prepick = false;
                let _ = ui_tx.send(SessionUpdate::PrePickCleared).await;
            }
        }
        SessionCommand::RequestSnapshot => {
            if let Err(e) = state.request_snapshot().await {
                let _ = ui_tx.send(SessionUpdate::Error(e)).await;
            }
        }
        SessionCommand::Leave => {}
    }
}
