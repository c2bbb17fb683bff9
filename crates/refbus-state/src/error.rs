/// Errors that can occur in state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A patch passed to `fire` was not a JSON object.
    #[error("state patch must be a JSON object, got {0}")]
    PatchNotObject(&'static str),
}

pub type Result<T> = std::result::Result<T, StateError>;
