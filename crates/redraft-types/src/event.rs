use serde::{Deserialize, Serialize};

/// Consumer-facing events published by the orchestrator. All events are
/// generation-filtered before publication: a subscriber never observes output
/// from a superseded attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// User-visible notice (e.g. empty shared input); no tasks were started.
    Notice { message: String },
    Chunk { mode: String, text: String },
    ModeError { mode: String, message: String },
    ModeFinished { mode: String },
    RefineChunk { text: String },
    RefineError { message: String },
    RefineFinished,
}

impl EngineEvent {
    /// The mode this event belongs to, if any.
    pub fn mode(&self) -> Option<&str> {
        match self {
            EngineEvent::Chunk { mode, .. }
            | EngineEvent::ModeError { mode, .. }
            | EngineEvent::ModeFinished { mode } => Some(mode),
            _ => None,
        }
    }
}
