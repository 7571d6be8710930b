// League metadata consumed before and around the realtime session: status,
// start time, admin, and the scheduling parameters an admin may submit.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::protocol::Participant;

/// Seconds before the scheduled start from which a participant may join.
pub const JOIN_WINDOW_SECS: i64 = 5 * 60;

pub fn join_window() -> Duration {
    Duration::seconds(JOIN_WINDOW_SECS)
}

/// League lifecycle as reported by the league service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeagueStatus {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "waiting for draft")]
    WaitingForDraft,
    #[serde(rename = "drafting")]
    Drafting,
    #[serde(rename = "in season")]
    InSeason,
}

/// Session phase derived from the league status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unscheduled,
    Scheduled,
    Active,
    Completed,
}

impl From<LeagueStatus> for SessionPhase {
    fn from(status: LeagueStatus) -> Self {
        match status {
            LeagueStatus::Created => SessionPhase::Unscheduled,
            LeagueStatus::WaitingForDraft => SessionPhase::Scheduled,
            LeagueStatus::Drafting => SessionPhase::Active,
            LeagueStatus::InSeason => SessionPhase::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftInfo {
    #[serde(rename = "leagueStatus")]
    pub status: LeagueStatus,
    #[serde(default, deserialize_with = "deserialize_start_time")]
    pub draft_start_time: Option<DateTime<Utc>>,
    #[serde(rename = "leagueAdmin")]
    pub admin: Participant,
}

impl DraftInfo {
    pub fn phase(&self) -> SessionPhase {
        self.status.into()
    }

    pub fn is_admin(&self, participant: &Participant) -> bool {
        self.admin == *participant
    }

    /// Joinable when drafting, or when scheduled and the start is at most
    /// [`join_window`] away.
    pub fn can_join(&self, now: DateTime<Utc>) -> bool {
        match self.phase() {
            SessionPhase::Active => true,
            SessionPhase::Scheduled => self
                .draft_start_time
                .is_some_and(|start| start - now <= join_window()),
            SessionPhase::Unscheduled | SessionPhase::Completed => false,
        }
    }

    /// Time until the join window opens, or `None` when it never will from
    /// the current status.
    pub fn until_joinable(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.can_join(now) {
            return Some(Duration::zero());
        }
        match (self.phase(), self.draft_start_time) {
            (SessionPhase::Scheduled, Some(start)) => Some(start - now - join_window()),
            _ => None,
        }
    }
}

/// Parse an ISO-8601 timestamp with or without offset. A missing offset is
/// read as UTC.
pub fn parse_start_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_start_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_start_time(s.trim())
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid draftStartTime `{s}`"))),
    }
}

fn serialize_naive_utc<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&time.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string())
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Body of a scheduling submission. The league service stores local times,
/// so the start is sent without an offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSettings {
    #[serde(serialize_with = "serialize_naive_utc")]
    pub draft_start_time: DateTime<Utc>,
    #[serde(rename = "turnDuration")]
    pub turn_duration_secs: u32,
}

impl DraftSettings {
    /// Start must be in the future and the turn duration positive.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), String> {
        if self.draft_start_time <= now {
            return Err(format!(
                "draft start time {} is not in the future",
                self.draft_start_time.to_rfc3339()
            ));
        }
        if self.turn_duration_secs == 0 {
            return Err("turn duration must be positive".into());
        }
        Ok(())
    }
}
