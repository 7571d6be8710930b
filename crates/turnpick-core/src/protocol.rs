// Wire types exchanged with the authoritative draft scheduler.
//
// Snapshots arrive as JSON over the realtime channel and are decoded into a
// strongly-typed `DraftState`. Decoding never panics: any structural problem
// becomes a `ProtocolError` and the caller keeps its previous state.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies one draft session (the league the draft belongs to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Participants and players
// ---------------------------------------------------------------------------

/// A manager taking part in the draft. Equality is by id only.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub username: String,
}

impl Participant {
    pub fn new(id: u64, username: impl Into<String>) -> Self {
        Participant {
            id: ParticipantId(id),
            username: username.into(),
        }
    }
}

impl PartialEq for Participant {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// Squad position categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Goalkeeper,
    Defender,
    Midfielder,
    Forward,
}

impl Position {
    pub const ALL: [Position; 4] = [
        Position::Goalkeeper,
        Position::Defender,
        Position::Midfielder,
        Position::Forward,
    ];

    /// Number of players of this category a full squad holds (2/5/5/3).
    pub fn quota(self) -> usize {
        match self {
            Position::Goalkeeper => 2,
            Position::Defender => 5,
            Position::Midfielder => 5,
            Position::Forward => 3,
        }
    }

    /// Short display code.
    pub fn code(self) -> &'static str {
        match self {
            Position::Goalkeeper => "GK",
            Position::Defender => "DEF",
            Position::Midfielder => "MID",
            Position::Forward => "FWD",
        }
    }

    /// Parse either the wire name ("defender") or the short code ("DEF").
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "goalkeeper" | "gk" => Some(Position::Goalkeeper),
            "defender" | "def" => Some(Position::Defender),
            "midfielder" | "mid" => Some(Position::Midfielder),
            "forward" | "fwd" => Some(Position::Forward),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Full squad size implied by the position quotas.
pub const SQUAD_SIZE: usize = 15;

/// A player in the shared pool, as broadcast by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub id: PlayerId,
    #[serde(default)]
    pub first_name: String,
    pub last_name: String,
    pub position: Position,
    #[serde(rename = "clubName")]
    pub club: String,
    #[serde(default, rename = "clubShortName")]
    pub club_short: Option<String>,
}

impl PlayerRecord {
    pub fn display_name(&self) -> String {
        if self.first_name.trim().is_empty() {
            self.last_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

/// One participant's already-picked players, in pick order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Squad {
    pub participant: Participant,
    pub players: Vec<PlayerRecord>,
}

// ---------------------------------------------------------------------------
// DraftState
// ---------------------------------------------------------------------------

/// The authoritative snapshot of a draft. Replaced wholesale on every
/// broadcast; never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftState {
    pub current_holder: Participant,
    /// `None` on the final turn of the draft.
    pub next_holder: Option<Participant>,
    pub squads: Vec<Squad>,
    pub pool: Vec<PlayerRecord>,
    pub last_pick: Option<String>,
    /// Server-reported time left in the current turn, in milliseconds.
    pub remaining_ms: u64,
    /// Broadcast sequence number, when the scheduler provides one.
    pub sequence: Option<u64>,
    /// Picks listed under squad entries whose manager could not be decoded.
    /// They are not attributed to anyone but still count towards the turn.
    pub unattributed_picks: usize,
}

impl DraftState {
    /// Decode and validate a snapshot payload.
    pub fn from_json(body: &str) -> Result<Self, ProtocolError> {
        let wire: SnapshotWire = serde_json::from_str(body)?;
        wire.into_state()
    }

    /// Players already picked by `participant` (empty if unknown).
    pub fn squad_of(&self, participant: ParticipantId) -> &[PlayerRecord] {
        self.squads
            .iter()
            .find(|s| s.participant.id == participant)
            .map(|s| s.players.as_slice())
            .unwrap_or(&[])
    }

    /// Total number of picks made so far, including unattributed ones.
    pub fn picks_made(&self) -> usize {
        self.squads.iter().map(|s| s.players.len()).sum::<usize>() + self.unattributed_picks
    }

    /// 1-based number of the turn in progress, derived from the squads.
    pub fn turn_number(&self) -> usize {
        self.picks_made() + 1
    }

    pub fn pool_player(&self, id: PlayerId) -> Option<&PlayerRecord> {
        self.pool.iter().find(|p| p.id == id)
    }

    pub fn is_turn_of(&self, participant: ParticipantId) -> bool {
        self.current_holder.id == participant
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.squads.iter().map(|s| &s.participant)
    }
}

// ---------------------------------------------------------------------------
// Snapshot wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ManagerWire {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    username: Option<String>,
}

impl ManagerWire {
    /// A manager with id 0 or no username is the scheduler's "nobody".
    fn into_participant(self) -> Option<Participant> {
        match (self.id, self.username) {
            (Some(id), Some(name)) if id != 0 && !name.is_empty() => {
                Some(Participant::new(id, name))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SquadWire {
    manager: ManagerWire,
    #[serde(default)]
    players: Vec<PlayerRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotWire {
    #[serde(default)]
    sequence: Option<u64>,
    current_manager: Option<ManagerWire>,
    #[serde(default)]
    next_manager: Option<ManagerWire>,
    #[serde(default)]
    squads: Option<Vec<SquadWire>>,
    #[serde(default)]
    selected_players: Option<HashMap<String, Vec<PlayerRecord>>>,
    draft_pool: Option<Vec<PlayerRecord>>,
    #[serde(default)]
    last_pick_message: Option<String>,
    remaining_time: Option<i64>,
}

static LEGACY_MANAGER_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ManagerDto\(id=(\d+), username=(\w+)\)$").expect("static pattern is valid")
});

/// Decode a legacy `selectedPlayers` map key such as
/// `ManagerDto(id=7, username=alice)`. Returns `None` on any mismatch.
pub fn decode_legacy_manager_key(key: &str) -> Option<Participant> {
    let caps = LEGACY_MANAGER_KEY.captures(key)?;
    let id: u64 = caps.get(1)?.as_str().parse().ok()?;
    let username = caps.get(2)?.as_str();
    Some(Participant::new(id, username))
}

impl SnapshotWire {
    fn into_state(self) -> Result<DraftState, ProtocolError> {
        let current_holder = self
            .current_manager
            .ok_or(ProtocolError::MissingField("currentManager"))?
            .into_participant()
            .ok_or(ProtocolError::Invalid {
                field: "currentManager",
                message: "must carry a non-zero id and a username".into(),
            })?;
        let next_holder = self.next_manager.and_then(ManagerWire::into_participant);
        let pool = self.draft_pool.ok_or(ProtocolError::MissingField("draftPool"))?;
        let remaining = self
            .remaining_time
            .ok_or(ProtocolError::MissingField("remainingTime"))?;

        let mut squads = Vec::new();
        let mut unattributed_picks = 0;
        match (self.squads, self.selected_players) {
            (Some(list), _) => {
                for entry in list {
                    match entry.manager.into_participant() {
                        Some(participant) => squads.push(Squad {
                            participant,
                            players: entry.players,
                        }),
                        None => {
                            warn!("Skipping squad entry without a valid manager");
                            unattributed_picks += entry.players.len();
                        }
                    }
                }
            }
            (None, Some(map)) => {
                for (key, players) in map {
                    match decode_legacy_manager_key(&key) {
                        Some(participant) => squads.push(Squad {
                            participant,
                            players,
                        }),
                        None => {
                            warn!("Skipping unrecognised squad key: {key}");
                            unattributed_picks += players.len();
                        }
                    }
                }
                squads.sort_by_key(|s| s.participant.id);
            }
            (None, None) => return Err(ProtocolError::MissingField("squads")),
        }

        Ok(DraftState {
            current_holder,
            next_holder,
            squads,
            pool,
            last_pick: self.last_pick_message.filter(|m| !m.is_empty()),
            remaining_ms: remaining.max(0) as u64,
            sequence: self.sequence,
            unattributed_picks,
        })
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Destination for pick requests.
pub const PICK_DESTINATION: &str = "/app/pickPlayer";

/// Destination for snapshot requests.
pub const SNAPSHOT_REQUEST_DESTINATION: &str = "/app/getDraftState";

/// The inbound subscriptions a session holds, one per topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Snapshot broadcast to every participant.
    Broadcast,
    /// Participant-scoped milliseconds-until-start.
    StartsIn,
    /// Participant-scoped snapshot reply to a snapshot request.
    Personal,
    /// Terminal completion signal.
    Complete,
    /// Participant-scoped pick rejection reason.
    Rejected,
}

impl Route {
    pub const ALL: [Route; 5] = [
        Route::Broadcast,
        Route::StartsIn,
        Route::Personal,
        Route::Complete,
        Route::Rejected,
    ];

    pub fn destination(self, session: SessionId) -> String {
        match self {
            Route::Broadcast => format!("/topic/draft/{session}"),
            Route::StartsIn => format!("/user/topic/draft/{session}/start"),
            Route::Personal => format!("/user/topic/draft/{session}"),
            Route::Complete => format!("/topic/draft/{session}/complete"),
            Route::Rejected => format!("/user/topic/draft/{session}/rejected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound / outbound messages
// ---------------------------------------------------------------------------

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Snapshot(Box<DraftState>),
    StartsIn(u64),
    Complete,
    Rejected(String),
}

impl InboundMessage {
    pub fn decode(route: Route, body: &str) -> Result<Self, ProtocolError> {
        match route {
            Route::Broadcast | Route::Personal => {
                DraftState::from_json(body).map(|s| InboundMessage::Snapshot(Box::new(s)))
            }
            Route::StartsIn => {
                let ms: i64 = serde_json::from_str(body.trim())?;
                Ok(InboundMessage::StartsIn(ms.max(0) as u64))
            }
            Route::Complete => Ok(InboundMessage::Complete),
            Route::Rejected => {
                let reason = serde_json::from_str::<String>(body)
                    .unwrap_or_else(|_| body.trim().to_string());
                if reason.is_empty() {
                    Ok(InboundMessage::Rejected("pick rejected".into()))
                } else {
                    Ok(InboundMessage::Rejected(reason))
                }
            }
        }
    }
}

/// Body of a `pickPlayer` publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickRequest {
    pub session_id: SessionId,
    pub player_id: PlayerId,
}

impl PickRequest {
    pub fn to_body(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
