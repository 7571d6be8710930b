// Draft state projector: folds authoritative messages into the single live
// `DraftState` and keeps the derived eligibility views in step with it.
//
// Phases move idle -> counting down -> active -> completed. Only inbound
// messages advance the phase, with one exception: the local start countdown
// reaching zero marks the counting-down phase as "waiting", which is a
// display state and never a substitute for the first snapshot.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use crate::eligibility::{self, PoolEntry, SquadConstraint};
use crate::protocol::{
    DraftState, InboundMessage, Participant, ParticipantId, PlayerRecord, ProtocolError, Route,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Counting down to the start. `waiting` is set once the local countdown
    /// has run out and the first snapshot has not arrived yet.
    CountingDown { waiting: bool },
    Active,
    Completed,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::CountingDown { waiting: false } => "starting soon",
            Phase::CountingDown { waiting: true } => "waiting for first turn",
            Phase::Active => "drafting",
            Phase::Completed => "complete",
        }
    }
}

/// Facts about a snapshot that was just applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotApplied {
    /// The turn in progress differs from the previously applied one.
    pub turn_changed: bool,
    /// This snapshot moved the projector into `Active`.
    pub entered_active: bool,
    pub holder: ParticipantId,
    pub remaining_ms: u64,
}

/// Result of feeding one message to the projector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Applied(SnapshotApplied),
    StartsIn(u64),
    Completed,
    Rejected(String),
    /// Older than the applied snapshot; not applied.
    Stale,
    /// Not meaningful in the current phase.
    Ignored,
}

pub struct DraftProjector {
    local: Participant,
    constraint: SquadConstraint,
    phase: Phase,
    state: Option<DraftState>,
    eligible: Vec<PlayerRecord>,
    annotated: Vec<PoolEntry>,
}

impl DraftProjector {
    pub fn new(local: Participant, constraint: SquadConstraint) -> Self {
        DraftProjector {
            local,
            constraint,
            phase: Phase::Idle,
            state: None,
            eligible: Vec::new(),
            annotated: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> Option<&DraftState> {
        self.state.as_ref()
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn constraint(&self) -> SquadConstraint {
        self.constraint
    }

    /// Pool players the local participant may pick right now.
    pub fn eligible(&self) -> &[PlayerRecord] {
        &self.eligible
    }

    /// Every pool player, flagged.
    pub fn annotated(&self) -> &[PoolEntry] {
        &self.annotated
    }

    pub fn is_local_turn(&self) -> bool {
        self.phase == Phase::Active
            && self
                .state
                .as_ref()
                .is_some_and(|s| s.is_turn_of(self.local.id))
    }

    /// Decode `body` for `route` and apply it. A decode failure leaves the
    /// projector untouched.
    pub fn ingest(&mut self, route: Route, body: &str) -> Result<Projection, ProtocolError> {
        let message = InboundMessage::decode(route, body)?;
        Ok(self.apply(message))
    }

    pub fn apply(&mut self, message: InboundMessage) -> Projection {
        if self.phase == Phase::Completed {
            debug!("Ignoring message after completion");
            return Projection::Ignored;
        }
        match message {
            InboundMessage::StartsIn(ms) => self.apply_starts_in(ms),
            InboundMessage::Snapshot(state) => self.apply_snapshot(*state),
            InboundMessage::Complete => {
                info!("Draft complete");
                self.phase = Phase::Completed;
                Projection::Completed
            }
            InboundMessage::Rejected(reason) => {
                warn!("Pick rejected: {reason}");
                Projection::Rejected(reason)
            }
        }
    }

    /// The local start countdown ran out. Returns true when this moved the
    /// projector into the waiting sub-state.
    pub fn start_countdown_elapsed(&mut self) -> bool {
        if self.phase == (Phase::CountingDown { waiting: false }) {
            self.phase = Phase::CountingDown { waiting: true };
            true
        } else {
            false
        }
    }

    fn apply_starts_in(&mut self, ms: u64) -> Projection {
        match self.phase {
            Phase::Idle | Phase::CountingDown { .. } => {
                debug!("Draft starts in {ms} ms");
                self.phase = Phase::CountingDown { waiting: ms == 0 };
                Projection::StartsIn(ms)
            }
            _ => Projection::Ignored,
        }
    }

    fn apply_snapshot(&mut self, next: DraftState) -> Projection {
        let turn_changed = match &self.state {
            Some(prev) => {
                if compare_marker(prev, &next) == Ordering::Greater {
                    warn!(
                        "Ignoring stale snapshot (turn {} after turn {})",
                        next.turn_number(),
                        prev.turn_number()
                    );
                    return Projection::Stale;
                }
                prev.turn_number() != next.turn_number()
                    || prev.current_holder != next.current_holder
            }
            None => true,
        };

        let entered_active = self.phase != Phase::Active;
        if entered_active {
            info!("Draft active, first turn held by {}", next.current_holder);
        }
        self.phase = Phase::Active;

        let own = next.squad_of(self.local.id);
        self.eligible = eligibility::eligible(&next.pool, own, &self.constraint);
        self.annotated = eligibility::annotate(&next.pool, own, &self.constraint);

        let applied = SnapshotApplied {
            turn_changed,
            entered_active,
            holder: next.current_holder.id,
            remaining_ms: next.remaining_ms,
        };
        debug!(
            "Applied snapshot: turn {}, holder {}, {} eligible of {}",
            next.turn_number(),
            next.current_holder,
            self.eligible.len(),
            next.pool.len()
        );
        self.state = Some(next);
        Projection::Applied(applied)
    }
}

/// Ordering of two snapshots. Sequence numbers win when both carry one;
/// otherwise the derived turn number decides. Picks under undecodable squad
/// keys are part of that count, so a skipped key cannot make a newer
/// snapshot look older.
fn compare_marker(prev: &DraftState, next: &DraftState) -> Ordering {
    match (prev.sequence, next.sequence) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => prev.turn_number().cmp(&next.turn_number()),
    }
}
