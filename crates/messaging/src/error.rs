use parley_storage::{ErrorKind, MessageId, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("invalid input at {stage}: {details}"))]
    Validation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("message store unavailable at {stage}: {source}"))]
    Transport {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("no conversation is open at {stage}"))]
    NoOpenConversation { stage: &'static str },
    #[snafu(display("message '{message_id}' is not in the loaded conversation"))]
    ReplyTargetUnavailable {
        stage: &'static str,
        message_id: MessageId,
    },
}

impl ChatError {
    /// Maps a storage failure into the chat taxonomy, keeping the storage
    /// stage for validation and lookup errors.
    pub fn from_storage(stage: &'static str, error: StorageError) -> Self {
        match error.kind() {
            ErrorKind::Validation => Self::Validation {
                stage: error.stage(),
                details: error.to_string(),
            },
            ErrorKind::NotFound => match error {
                StorageError::NotFound { stage, entity, id } => Self::NotFound { stage, entity, id },
                other => Self::NotFound {
                    stage: other.stage(),
                    entity: "record",
                    id: other.to_string(),
                },
            },
            ErrorKind::Transport => Self::Transport {
                stage,
                source: error,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// `ResultExt`-style adapter so storage calls read like other snafu contexts.
pub(crate) trait StorageResultExt<T> {
    fn chat_context(self, stage: &'static str) -> ChatResult<T>;
}

impl<T> StorageResultExt<T> for Result<T, StorageError> {
    fn chat_context(self, stage: &'static str) -> ChatResult<T> {
        self.map_err(|error| ChatError::from_storage(stage, error))
    }
}
