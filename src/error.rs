use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Payment gateway error: {0}")]
    PaymentGateway(String),
    #[error("Stage handler crashed: {0}")]
    HandlerCrashed(String),
    #[error("Delivery {tag} has already been settled")]
    AlreadySettled { tag: u64 },
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Poison messages are the only failures subject to the redelivery budget.
    pub fn is_malformed(&self) -> bool {
        matches!(self, PipelineError::MalformedMessage(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::MalformedMessage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
