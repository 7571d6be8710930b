// Pre-pick queue: at most one tentative pick per participant, drained when
// the participant's turn arrives.

use std::collections::HashMap;

use crate::protocol::{ParticipantId, PlayerRecord};

#[derive(Debug)]
pub struct PrePickQueue {
    local: ParticipantId,
    pending: HashMap<ParticipantId, PlayerRecord>,
}

impl PrePickQueue {
    pub fn new(local: ParticipantId) -> Self {
        PrePickQueue {
            local,
            pending: HashMap::new(),
        }
    }

    /// Store `player` as `participant`'s pending pick. Last write wins; the
    /// replaced pick, if any, is returned.
    pub fn set(
        &mut self,
        participant: ParticipantId,
        player: PlayerRecord,
    ) -> Option<PlayerRecord> {
        self.pending.insert(participant, player)
    }

    pub fn cancel(&mut self, participant: ParticipantId) -> Option<PlayerRecord> {
        self.pending.remove(&participant)
    }

    pub fn pending_for(&self, participant: ParticipantId) -> Option<&PlayerRecord> {
        self.pending.get(&participant)
    }

    pub fn local_pending(&self) -> Option<&PlayerRecord> {
        self.pending_for(self.local)
    }

    /// Called once per turn change. When the new holder is the local
    /// participant, the pending pick is removed and handed back for
    /// submission. A second call for the same turn finds nothing.
    pub fn on_turn_changed(&mut self, holder: ParticipantId) -> Option<PlayerRecord> {
        if holder != self.local {
            return None;
        }
        self.pending.remove(&self.local)
    }

    /// Put back a pick whose submission never left the process. Does not
    /// overwrite a newer selection made in the meantime.
    pub fn restore(&mut self, player: PlayerRecord) {
        self.pending.entry(self.local).or_insert(player);
    }

    pub fn clear_all(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
