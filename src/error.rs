use thiserror::Error;

/// Reasons a chat request cannot reach the model.
///
/// The messages are sent verbatim to clients in the `error` frame of the
/// event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("Model is still loading. Please try again in a moment.")]
    Loading,

    #[error("Model failed to load: {0}")]
    LoadFailed(String),

    #[error("Model is not loaded. Please try again later.")]
    NotLoaded,
}
