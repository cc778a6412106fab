use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("{entity} '{id}' was not found on `{stage}`"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("conversation '{id}' already exists"))]
    DuplicateConversation { stage: &'static str, id: String },
    #[snafu(display("conversation '{conversation_id}' is still waiting for a reply"))]
    ReplyInFlight {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("engine invariant violation on `{stage}`: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

impl EngineError {
    /// Missing targets are expected under async races and are never user-visible.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
