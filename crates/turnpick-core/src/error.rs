// User-facing error taxonomy. Component errors convert into one of these four
// kinds before they reach the front end.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::protocol::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The channel failed to connect or dropped. Recovered by reconnecting.
    #[error("connection problem: {0}")]
    Transport(String),

    /// An inbound payload failed validation and was dropped.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The scheduler (or the local pool check) refused a pick.
    #[error("pick rejected: {0}")]
    RejectedPick(String),

    /// League metadata could not be loaded; the session cannot be entered.
    #[error("could not load league configuration: {reason}")]
    ConfigurationFetch { reason: String, reauthenticate: bool },
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::ConfigurationFetch { .. })
    }

    /// Short hint for the front end on how the user can recover.
    pub fn remedy(&self) -> &'static str {
        match self {
            EngineError::Transport(_) => "reconnecting",
            EngineError::MalformedMessage(_) => "ignored",
            EngineError::RejectedPick(_) => "choose another player",
            EngineError::ConfigurationFetch {
                reauthenticate: true,
                ..
            } => "sign in again",
            EngineError::ConfigurationFetch { .. } => "retry later",
        }
    }
}

impl From<ChannelError> for EngineError {
    fn from(err: ChannelError) -> Self {
        EngineError::Transport(err.to_string())
    }
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        EngineError::MalformedMessage(err.to_string())
    }
}
