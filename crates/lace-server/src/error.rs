/// Failure to hand a frame to a single output sink.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send queue full")]
    Full,

    #[error("sink closed")]
    Closed,

    #[error("sink error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("sink rejected frame: {0}")]
    Sink(#[from] SendError),

    #[error("connection limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}
