// Draft coordination engine: keeps a participant's view of a live draft in
// step with the authoritative scheduler over a STOMP realtime channel.

pub mod channel;
pub mod countdown;
pub mod eligibility;
pub mod error;
pub mod league;
pub mod prepick;
pub mod projector;
pub mod protocol;
pub mod session;
pub mod stomp;
pub mod ws;
