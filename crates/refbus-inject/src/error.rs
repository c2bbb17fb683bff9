/// Errors that can occur while building the service graph.
///
/// All of these are fatal at startup — nothing is constructed once any of
/// them is detected.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    /// The dependency graph contains a cycle through the named service.
    #[error("cyclic dependency involving service '{id}'")]
    CyclicDependency { id: String },

    /// A declared dependency id was never registered.
    #[error("service '{required_by}' depends on unregistered service '{id}'")]
    MissingInstance { id: String, required_by: String },

    /// Two descriptors were registered under the same id.
    #[error("duplicate service id '{id}'")]
    DuplicateId { id: String },

    /// A built instance could not be downcast to the requested type.
    #[error("service '{id}' is not a {expected}")]
    TypeMismatch { id: String, expected: &'static str },

    /// A build closure failed.
    #[error("failed to construct service '{id}': {message}")]
    Construction { id: String, message: String },
}

pub type Result<T> = std::result::Result<T, InjectError>;
