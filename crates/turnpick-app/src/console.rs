// Line-oriented front end: parses typed commands and turns session updates
// into printable lines.

use turnpick_core::countdown::format_mm_ss;
use turnpick_core::eligibility::PoolQuery;
use turnpick_core::protocol::{ParticipantId, PlayerId, PlayerRecord, Position};
use turnpick_core::session::{ConnectionStatus, SessionCommand, SessionUpdate, SnapshotView};

/// Rows printed per pool listing.
const POOL_PAGE: usize = 25;

pub const HELP: &str = "\
commands:
  pick <id>        pick now, or queue if it is not your turn
  prepick <id>     queue a pick for your next turn
  cancel           drop the queued pick
  refresh          ask for a fresh snapshot
  pool [all] [pos:GK,DEF] [club:Name_With_Underscores] [name]
                   list pickable players (all: include ineligible)
  squad [name]     show your squad, or another manager's
  squads           list every manager and how many players they have
  help             this text
  quit             leave the draft";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Session(SessionCommand),
    Browse { query: PoolQuery, show_all: bool },
    /// `None` is the local participant's squad.
    Squad(Option<String>),
    Squads,
    Help,
}

/// Parse one typed line.
pub fn parse_line(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".into());
    };
    let player_arg = |arg: Option<&str>| -> Result<PlayerId, String> {
        let raw = arg.ok_or_else(|| format!("`{verb}` needs a player id"))?;
        raw.parse::<u64>()
            .map(PlayerId)
            .map_err(|_| format!("`{raw}` is not a player id"))
    };

    match verb.to_ascii_lowercase().as_str() {
        "pick" | "p" => Ok(Input::Session(SessionCommand::Pick(player_arg(words.next())?))),
        "prepick" | "pp" => Ok(Input::Session(SessionCommand::PrePick(player_arg(words.next())?))),
        "cancel" => Ok(Input::Session(SessionCommand::CancelPrePick)),
        "refresh" => Ok(Input::Session(SessionCommand::RequestSnapshot)),
        "quit" | "leave" | "q" => Ok(Input::Session(SessionCommand::Leave)),
        "pool" => parse_browse(words),
        "squad" => Ok(Input::Squad(words.next().map(str::to_string))),
        "squads" => Ok(Input::Squads),
        "help" | "?" => Ok(Input::Help),
        other => Err(format!("unknown command `{other}` (try `help`)")),
    }
}

fn parse_browse<'a>(words: impl Iterator<Item = &'a str>) -> Result<Input, String> {
    let mut query = PoolQuery::default();
    let mut show_all = false;
    let mut search = Vec::new();
    for word in words {
        if word.eq_ignore_ascii_case("all") {
            show_all = true;
        } else if let Some(list) = word.strip_prefix("pos:") {
            for code in list.split(',').filter(|c| !c.is_empty()) {
                let pos = Position::parse(code)
                    .ok_or_else(|| format!("unknown position `{code}`"))?;
                query.positions.insert(pos);
            }
        } else if let Some(club) = word.strip_prefix("club:") {
            query.clubs.insert(club.replace('_', " "));
        } else {
            search.push(word);
        }
    }
    query.search = search.join(" ");
    Ok(Input::Browse { query, show_all })
}

/// Keeps the latest snapshot so pool listings can be answered locally.
#[derive(Debug, Default)]
pub struct Console {
    latest: Option<SnapshotView>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines to print for `update`. Clock ticks are thinned out.
    pub fn render(&mut self, update: SessionUpdate) -> Vec<String> {
        match update {
            SessionUpdate::Phase(phase) => vec![format!("[draft] {}", phase.label())],
            SessionUpdate::Connection(status) => vec![match status {
                ConnectionStatus::Connected => "[link] connected".to_string(),
                ConnectionStatus::Reconnecting { attempt } => {
                    format!("[link] reconnecting (attempt {attempt})")
                }
                ConnectionStatus::Closed => "[link] closed".to_string(),
            }],
            SessionUpdate::Snapshot(view) => {
                let lines = snapshot_lines(&view);
                self.latest = Some(*view);
                lines
            }
            SessionUpdate::TurnClock(ms) if show_tick(ms) => {
                vec![format!("[clock] {} left in this turn", format_mm_ss(ms))]
            }
            SessionUpdate::StartClock(ms) if show_tick(ms) => {
                vec![format!("[clock] draft starts in {}", format_mm_ss(ms))]
            }
            SessionUpdate::TurnClock(_) | SessionUpdate::StartClock(_) => Vec::new(),
            SessionUpdate::PrePickQueued(p) => {
                vec![format!("[queue] {} queued for your next turn", describe(&p))]
            }
            SessionUpdate::PrePickCleared => vec!["[queue] cleared".to_string()],
            SessionUpdate::PrePickSubmitted(p) => {
                vec![format!("[pick] queued pick {} submitted", describe(&p))]
            }
            SessionUpdate::PickSent(p) => vec![format!("[pick] {} submitted", describe(&p))],
            SessionUpdate::Error(e) => vec![format!("[error] {e} ({})", e.remedy())],
        }
    }

    pub fn browse(&self, query: &PoolQuery, show_all: bool) -> Vec<String> {
        let Some(view) = &self.latest else {
            return vec!["no snapshot yet".to_string()];
        };
        let rows: Vec<String> = if show_all {
            query
                .apply_entries(&view.annotated)
                .into_iter()
                .map(|e| format!("{}{}", if e.eligible { "  " } else { "x " }, describe(&e.player)))
                .collect()
        } else {
            query
                .apply(&view.eligible)
                .into_iter()
                .map(|p| format!("  {}", describe(p)))
                .collect()
        };
        let total = rows.len();
        let mut lines: Vec<String> = rows.into_iter().take(POOL_PAGE).collect();
        if total > POOL_PAGE {
            lines.push(format!("  ... {} more", total - POOL_PAGE));
        }
        if lines.is_empty() {
            lines.push("  no matching players".to_string());
        }
        lines
    }

    /// Squad of `name` (case-insensitive), or of `local` when no name is given.
    pub fn squad(&self, local: ParticipantId, name: Option<&str>) -> Vec<String> {
        let Some(view) = &self.latest else {
            return vec!["no snapshot yet".to_string()];
        };
        let state = &view.state;
        let id = match name {
            None => local,
            Some(name) => match state
                .participants()
                .find(|p| p.username.eq_ignore_ascii_case(name))
            {
                Some(p) => p.id,
                None => return vec![format!("  no manager named `{name}`")],
            },
        };
        let players = state.squad_of(id);
        if players.is_empty() {
            return vec!["  no players yet".to_string()];
        }
        players.iter().map(|p| format!("  {}", describe(p))).collect()
    }

    /// One line per manager in snapshot order, marking who is on the clock.
    pub fn squads(&self) -> Vec<String> {
        let Some(view) = &self.latest else {
            return vec!["no snapshot yet".to_string()];
        };
        let state = &view.state;
        state
            .participants()
            .map(|p| {
                let marker = if state.is_turn_of(p.id) { "*" } else { " " };
                format!("{marker} {p}: {} players", state.squad_of(p.id).len())
            })
            .collect()
    }
}

fn show_tick(ms: u64) -> bool {
    ms % 10_000 == 0 || ms <= 5_000
}

fn describe(p: &PlayerRecord) -> String {
    let club = p.club_short.as_deref().unwrap_or(p.club.as_str());
    format!("#{} {} {} ({club})", p.id, p.position.code(), p.display_name())
}

fn snapshot_lines(view: &SnapshotView) -> Vec<String> {
    let state = &view.state;
    let next = state
        .next_holder
        .as_ref()
        .map(|p| p.username.as_str())
        .unwrap_or("none");
    let mut lines = vec![format!(
        "[turn {}] on the clock: {} | next: {} | {} of {} pool players eligible for you",
        state.turn_number(),
        state.current_holder,
        next,
        view.eligible.len(),
        state.pool.len()
    )];
    if let Some(last) = &state.last_pick {
        lines.push(format!("[turn {}] {last}", state.turn_number()));
    }
    if view.local_turn && view.turn_changed {
        lines.push("[turn] it is your pick".to_string());
    }
    lines
}
