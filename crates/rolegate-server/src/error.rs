use rolegate_kernel::KernelError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("service error: {0}")]
    Service(String),
    #[error("policy error: {0}")]
    Policy(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("interrupted: {0}")]
    Interrupted(String),
}

impl ConversationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConversationError::Transport(_) => "transport_error",
            ConversationError::Parse(_) => "parse_error",
            ConversationError::Service(_) => "service_error",
            ConversationError::Policy(_) => "policy_error",
            ConversationError::Store(_) => "store_error",
            ConversationError::Interrupted(_) => "interrupted",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ConversationError::Transport(v)
            | ConversationError::Parse(v)
            | ConversationError::Service(v)
            | ConversationError::Policy(v)
            | ConversationError::Store(v)
            | ConversationError::Interrupted(v) => v,
        }
    }
}

impl From<KernelError> for ConversationError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Parse(v) => ConversationError::Parse(v),
            KernelError::Policy(v) => ConversationError::Policy(v),
            KernelError::Location(v) => ConversationError::Transport(v),
        }
    }
}
