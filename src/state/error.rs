use crate::api::ApiError;
use thiserror::Error;

/// Why a controller operation was refused or failed.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a reply is still in progress")]
    Busy,

    #[error("message is empty")]
    EmptyMessage,

    #[error("there is no user message to retry")]
    NothingToRetry,

    #[error("no cached message with id '{0}'")]
    UnknownMessage(String),

    #[error("conversation controller has shut down")]
    Closed,

    #[error(transparent)]
    Api(#[from] ApiError),
}
