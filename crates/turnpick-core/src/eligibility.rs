// Eligibility filter: which pool players a squad may legally add right now.
//
// Advisory only. The authoritative scheduler enforces the same rules when a
// pick arrives; this mirror exists so the local view can hide or flag
// players that would be refused.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::protocol::{PlayerRecord, Position};

/// Per-league squad composition limits. The per-position quotas are fixed
/// (see [`Position::quota`]); only the club cap varies by league.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquadConstraint {
    pub max_per_club: usize,
}

impl SquadConstraint {
    pub fn new(max_per_club: usize) -> Self {
        SquadConstraint { max_per_club }
    }
}

/// A pool row decorated with its eligibility, for the "show all" view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub player: PlayerRecord,
    pub eligible: bool,
}

/// Open positions and closed clubs derived from one squad.
struct SquadLimits<'a> {
    open_positions: HashSet<Position>,
    closed_clubs: HashSet<&'a str>,
}

impl<'a> SquadLimits<'a> {
    fn from_squad(own_picks: &'a [PlayerRecord], constraint: &SquadConstraint) -> Self {
        let open_positions = Position::ALL
            .into_iter()
            .filter(|pos| own_picks.iter().filter(|p| p.position == *pos).count() < pos.quota())
            .collect();

        let mut per_club: HashMap<&str, usize> = HashMap::new();
        for p in own_picks {
            *per_club.entry(p.club.as_str()).or_default() += 1;
        }
        let closed_clubs = per_club
            .into_iter()
            .filter(|(_, have)| *have >= constraint.max_per_club)
            .map(|(club, _)| club)
            .collect();

        SquadLimits {
            open_positions,
            closed_clubs,
        }
    }

    fn allows(&self, player: &PlayerRecord) -> bool {
        self.open_positions.contains(&player.position)
            && !self.closed_clubs.contains(player.club.as_str())
    }
}

/// Pool players whose position is still open and whose club is not capped
/// out for `own_picks`. Pool order is preserved.
pub fn eligible(
    pool: &[PlayerRecord],
    own_picks: &[PlayerRecord],
    constraint: &SquadConstraint,
) -> Vec<PlayerRecord> {
    let limits = SquadLimits::from_squad(own_picks, constraint);
    pool.iter().filter(|p| limits.allows(p)).cloned().collect()
}

/// Every pool player with an eligible/ineligible flag.
pub fn annotate(
    pool: &[PlayerRecord],
    own_picks: &[PlayerRecord],
    constraint: &SquadConstraint,
) -> Vec<PoolEntry> {
    let limits = SquadLimits::from_squad(own_picks, constraint);
    pool.iter()
        .map(|p| PoolEntry {
            player: p.clone(),
            eligible: limits.allows(p),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Pool browsing
// ---------------------------------------------------------------------------

/// Narrows a pool view by club, position and a name prefix. Empty criteria
/// match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolQuery {
    pub clubs: HashSet<String>,
    pub positions: HashSet<Position>,
    pub search: String,
}

impl PoolQuery {
    pub fn matches(&self, player: &PlayerRecord) -> bool {
        if !self.clubs.is_empty() && !self.clubs.contains(&player.club) {
            return false;
        }
        if !self.positions.is_empty() && !self.positions.contains(&player.position) {
            return false;
        }
        let query = self.search.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        let first = player.first_name.to_lowercase();
        let last = player.last_name.to_lowercase();
        first.starts_with(&query)
            || last.starts_with(&query)
            || format!("{first} {last}").starts_with(&query)
    }

    pub fn apply<'a>(&self, players: &'a [PlayerRecord]) -> Vec<&'a PlayerRecord> {
        players.iter().filter(|p| self.matches(p)).collect()
    }

    pub fn apply_entries<'a>(&self, entries: &'a [PoolEntry]) -> Vec<&'a PoolEntry> {
        entries.iter().filter(|e| self.matches(&e.player)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PlayerId;

    fn player(id: u64, position: Position, club: &str) -> PlayerRecord {
        PlayerRecord {
            id: PlayerId(id),
            first_name: format!("First{id}"),
            last_name: format!("Last{id}"),
            position,
            club: club.to_string(),
            club_short: None,
        }
    }

    fn named(id: u64, first: &str, last: &str) -> PlayerRecord {
        PlayerRecord {
            first_name: first.into(),
            last_name: last.into(),
            ..player(id, Position::Midfielder, "Arsenal")
        }
    }

    fn ids(players: &[PlayerRecord]) -> Vec<u64> {
        players.iter().map(|p| p.id.0).collect()
    }

    #[test]
    fn empty_squad_can_pick_anyone() {
        let pool = vec![
            player(1, Position::Goalkeeper, "Arsenal"),
            player(2, Position::Forward, "Chelsea"),
        ];
        assert_eq!(ids(&eligible(&pool, &[], &SquadConstraint::new(3))), vec![1, 2]);
    }

    #[test]
    fn full_position_is_closed() {
        let squad = vec![
            player(10, Position::Goalkeeper, "Arsenal"),
            player(11, Position::Goalkeeper, "Chelsea"),
        ];
        let pool = vec![
            player(1, Position::Goalkeeper, "Everton"),
            player(2, Position::Defender, "Everton"),
        ];
        assert_eq!(ids(&eligible(&pool, &squad, &SquadConstraint::new(3))), vec![2]);
    }

    #[test]
    fn forward_quota_is_three() {
        let squad: Vec<_> = (0..3)
            .map(|i| player(10 + i, Position::Forward, &format!("Club{i}")))
            .collect();
        let pool = vec![player(1, Position::Forward, "Fulham")];
        assert!(eligible(&pool, &squad, &SquadConstraint::new(3)).is_empty());

        let two: Vec<_> = squad[..2].to_vec();
        assert_eq!(ids(&eligible(&pool, &two, &SquadConstraint::new(3))), vec![1]);
    }

    #[test]
    fn capped_club_is_closed() {
        let squad = vec![
            player(10, Position::Defender, "Liverpool"),
            player(11, Position::Midfielder, "Liverpool"),
        ];
        let pool = vec![
            player(1, Position::Forward, "Liverpool"),
            player(2, Position::Forward, "Brentford"),
        ];
        assert_eq!(ids(&eligible(&pool, &squad, &SquadConstraint::new(2))), vec![2]);
        assert_eq!(ids(&eligible(&pool, &squad, &SquadConstraint::new(3))), vec![1, 2]);
    }

    #[test]
    fn never_returns_player_from_full_category_or_capped_club() {
        let clubs = ["A", "B", "C"];
        let pool: Vec<_> = (0..40u64)
            .map(|i| player(i, Position::ALL[(i % 4) as usize], clubs[(i % 3) as usize]))
            .collect();
        for cap in 1..=3 {
            let constraint = SquadConstraint::new(cap);
            for take in 0..12 {
                let squad: Vec<_> = pool[..take].to_vec();
                for p in eligible(&pool, &squad, &constraint) {
                    let same_pos = squad.iter().filter(|s| s.position == p.position).count();
                    let same_club = squad.iter().filter(|s| s.club == p.club).count();
                    assert!(same_pos < p.position.quota());
                    assert!(same_club < cap);
                }
            }
        }
    }

    #[test]
    fn annotate_keeps_every_row() {
        let squad = vec![player(10, Position::Defender, "Spurs")];
        let pool = vec![
            player(1, Position::Defender, "Spurs"),
            player(2, Position::Defender, "Wolves"),
        ];
        let entries = annotate(&pool, &squad, &SquadConstraint::new(1));
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].eligible);
        assert!(entries[1].eligible);
    }

    #[test]
    fn query_filters_by_club_position_and_prefix() {
        let pool = vec![
            named(1, "Bukayo", "Saka"),
            named(2, "Martin", "Odegaard"),
            PlayerRecord {
                club: "Chelsea".into(),
                position: Position::Forward,
                ..named(3, "Cole", "Palmer")
            },
        ];

        let mut q = PoolQuery::default();
        assert_eq!(q.apply(&pool).len(), 3);

        q.search = "  SA ".into();
        let hits: Vec<u64> = q.apply(&pool).iter().map(|p| p.id.0).collect();
        assert_eq!(hits, vec![1]);

        q.search = "martin ode".into();
        let hits: Vec<u64> = q.apply(&pool).iter().map(|p| p.id.0).collect();
        assert_eq!(hits, vec![2]);

        q.search.clear();
        q.clubs.insert("Chelsea".into());
        let hits: Vec<u64> = q.apply(&pool).iter().map(|p| p.id.0).collect();
        assert_eq!(hits, vec![3]);

        q.clubs.clear();
        q.positions.insert(Position::Midfielder);
        let hits: Vec<u64> = q.apply(&pool).iter().map(|p| p.id.0).collect();
        assert_eq!(hits, vec![1, 2]);
    }
}
