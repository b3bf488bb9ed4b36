use std::sync::Arc;

use serde::Serialize;

use kernelhub_protocol::{ApiRequest, ApiResponse, ErrorCode};
use libkernelhub::{
    HubError, KernelBroker, SessionBroker, SessionPatchOptions, SessionStartOptions, StartOptions,
};

/// Dispatches control-surface requests onto the brokers. The GET/POST/DELETE
/// route surface maps 1:1 onto these operations.
pub struct Router {
    kernels: Arc<KernelBroker>,
    sessions: Arc<SessionBroker>,
}

impl Router {
    pub fn new(kernels: Arc<KernelBroker>, sessions: Arc<SessionBroker>) -> Self {
        Self { kernels, sessions }
    }

    pub fn kernels(&self) -> &Arc<KernelBroker> {
        &self.kernels
    }

    pub fn sessions(&self) -> &Arc<SessionBroker> {
        &self.sessions
    }

    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match request {
            ApiRequest::KernelList => ok_response(&self.kernels.running().await),

            ApiRequest::KernelStart { id, name, location } => {
                match self
                    .kernels
                    .start_new(StartOptions { id, name, location })
                    .await
                {
                    Ok(model) => ok_response(&model),
                    Err(err) => error_response(err),
                }
            }

            ApiRequest::KernelGet { kernel_id } => {
                match self.kernels.find_by_id(&kernel_id).await {
                    Some(model) => ok_response(&model),
                    None => error_response(HubError::KernelNotFound(kernel_id)),
                }
            }

            ApiRequest::KernelRestart { kernel_id } => {
                match self.kernels.restart(&kernel_id).await {
                    Ok(model) => ok_response(&model),
                    Err(err) => error_response(err),
                }
            }

            ApiRequest::KernelShutdown { kernel_id } => {
                match self.kernels.shutdown(&kernel_id).await {
                    Ok(()) => ApiResponse::ok(None),
                    Err(err) => error_response(err),
                }
            }

            ApiRequest::SessionList => ok_response(&self.sessions.list().await),

            ApiRequest::SessionGet { session_id } => {
                match self.sessions.find_by_id(&session_id).await {
                    Ok(session) => ok_response(&session),
                    Err(err) => error_response(err),
                }
            }

            ApiRequest::SessionStart { path, name, kernel } => {
                match self
                    .sessions
                    .start_new(SessionStartOptions { path, name, kernel })
                    .await
                {
                    Ok(session) => ok_response(&session),
                    Err(err) => error_response(err),
                }
            }

            ApiRequest::SessionPatch {
                session_id,
                path,
                name,
                kernel,
            } => {
                match self
                    .sessions
                    .patch(SessionPatchOptions {
                        id: session_id,
                        path,
                        name,
                        kernel,
                    })
                    .await
                {
                    Ok(session) => ok_response(&session),
                    Err(err) => error_response(err),
                }
            }

            ApiRequest::SessionShutdown { session_id } => {
                match self.sessions.shutdown(&session_id).await {
                    Ok(()) => ApiResponse::ok(None),
                    Err(err) => error_response(err),
                }
            }
        }
    }
}

fn ok_response<T: Serialize>(data: &T) -> ApiResponse {
    match serde_json::to_value(data) {
        Ok(value) => ApiResponse::ok(Some(value)),
        Err(err) => ApiResponse::error(
            format!("failed to encode response: {err}"),
            ErrorCode::ServerError,
        ),
    }
}

fn error_response(err: HubError) -> ApiResponse {
    let (code, message) = err.to_error_code();
    ApiResponse::Error { message, code }
}
