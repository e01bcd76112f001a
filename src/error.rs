#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Session is not authenticated")]
    NotAuthenticated,
    #[error("Invalid bind address")]
    InvalidBindAddress,
    #[error("Forwarding not authorized")]
    ForwardingNotAuthorized,
    #[error("Address is already registered")]
    AlreadyRegistered,
    #[error("Invalid target address")]
    InvalidTarget,
    #[error("Invalid file path")]
    InvalidFilePath,
}
