use uuid::Uuid;

/// Error kinds surfaced by the conversation workflows.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("API key is missing. Please set one before chatting.")]
    MissingCredential,

    #[error("Invalid chat history: {0}")]
    InvalidHistory(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Invalid chat data format: {0}")]
    InvalidImportFormat(String),

    #[error("Chat {0} not found")]
    ChatNotFound(Uuid),

    #[error("Character {0} not found")]
    CharacterNotFound(Uuid),

    #[error("Invalid character: {0}")]
    InvalidCharacter(String),

    #[error("Message text cannot be empty")]
    EmptyMessage,

    #[error("Index {index} is out of range for {len} messages")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Another operation is already running for this chat")]
    Busy,
}

impl ChatError {
    // Wraps an infrastructure failure from the storage layer, keeping the context chain.
    pub fn store(err: anyhow::Error) -> Self {
        ChatError::Store(format!("{:#}", err))
    }

    pub fn generation(err: anyhow::Error) -> Self {
        ChatError::GenerationFailed(format!("{:#}", err))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
