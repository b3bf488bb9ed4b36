use thiserror::Error;

use kernelhub_protocol::{ClientId, ErrorCode, KernelId, SessionId, codec::CodecError};

#[derive(Error, Debug)]
pub enum HubError {
    #[error("kernel not found: {0}")]
    KernelNotFound(KernelId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("no kernel factory registered for type: {0}")]
    UnregisteredKernelType(String),

    #[error("no default kernel type registered")]
    NoDefaultKernel,

    #[error("kernel is dead: {0}")]
    KernelDead(KernelId),

    #[error("no channel endpoint at: {0}")]
    EndpointNotFound(String),

    #[error("channel closed for client {0}")]
    ChannelClosed(ClientId),

    #[error("wire codec error: {0}")]
    Codec(#[from] CodecError),
}

impl HubError {
    /// Convert to a protocol error code and message for the control surface.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            HubError::KernelNotFound(_) => (ErrorCode::KernelNotFound, self.to_string()),
            HubError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            HubError::UnregisteredKernelType(_) | HubError::NoDefaultKernel => {
                (ErrorCode::UnregisteredKernelType, self.to_string())
            }
            HubError::KernelDead(_) => (ErrorCode::KernelDead, self.to_string()),
            HubError::EndpointNotFound(_) => (ErrorCode::KernelNotFound, self.to_string()),
            HubError::ChannelClosed(_) => (ErrorCode::ServerError, self.to_string()),
            HubError::Codec(_) => (ErrorCode::InvalidRequest, self.to_string()),
        }
    }
}
