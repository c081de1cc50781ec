// src/rabbitmq/errors.rs

use lapin::Error as LapinError;

use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    /// A value that is not a well-formed envelope was about to be published.
    #[error("Invalid payload format: {0}")]
    InvalidPayload(String),

    /// A reply arrived but is not a well-formed envelope.
    #[error("Invalid reply format: {0}")]
    InvalidReply(String),

    #[error("Timed out after {0:?} while waiting for response from consumer")]
    Timeout(Duration),

    #[error("The message content type must be {expected}, got {found:?}")]
    ContentTypeMismatch {
        expected: String,
        found: Option<String>,
    },

    #[error("Consumer handler failed: {0}")]
    HandlerFailure(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("A request with correlation id {0} is already pending")]
    DuplicateCorrelationId(String),

    #[error("Unexpected send outcome: {0}")]
    UnexpectedOutcome(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RabbitMQError {
    /// Short machine-readable name of the variant, used when the error
    /// crosses a process boundary inside an error envelope.
    pub fn name(&self) -> &'static str {
        match self {
            RabbitMQError::ConnectionError(_) => "ConnectionFailure",
            RabbitMQError::ChannelError(_) => "ChannelError",
            RabbitMQError::SerializationError(_) => "SerializationError",
            RabbitMQError::InvalidPayload(_) => "InvalidPayload",
            RabbitMQError::InvalidReply(_) => "InvalidReply",
            RabbitMQError::Timeout(_) => "Timeout",
            RabbitMQError::ContentTypeMismatch { .. } => "ContentTypeMismatch",
            RabbitMQError::HandlerFailure(_) => "HandlerFailure",
            RabbitMQError::PublishError(_) => "PublishError",
            RabbitMQError::ConsumeError(_) => "ConsumeError",
            RabbitMQError::AckError(_) => "AckError",
            RabbitMQError::DuplicateCorrelationId(_) => "DuplicateCorrelationId",
            RabbitMQError::UnexpectedOutcome(_) => "UnexpectedOutcome",
            RabbitMQError::Unknown(_) => "Error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RabbitMQError::Timeout(_))
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        classify(error.to_string())
    }
}

// lapin does not expose a stable kind for every failure, so classify on the
// rendered text the same way for every transport error.
fn classify(error_text: String) -> RabbitMQError {
    let lowered = error_text.to_lowercase();

    if lowered.contains("connection") || lowered.contains("io error") {
        RabbitMQError::ConnectionError(error_text)
    } else if lowered.contains("channel") {
        RabbitMQError::ChannelError(error_text)
    } else if lowered.contains("publish") {
        RabbitMQError::PublishError(error_text)
    } else if lowered.contains("consume") {
        RabbitMQError::ConsumeError(error_text)
    } else if lowered.contains("ack") || lowered.contains("nack") {
        RabbitMQError::AckError(error_text)
    } else {
        RabbitMQError::Unknown(error_text)
    }
}
