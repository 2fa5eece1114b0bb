/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use thiserror::Error;

use crate::body::replay::ReplayError;
use crate::protocol::HttpResponseParseError;

/// Dispatch failure taxonomy.
///
/// The `Display` output of backend-facing failures never names the backend
/// host or port; full detail is only emitted through the audit logger.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid target url: {0}")]
    InvalidTargetUrl(&'static str),
    #[error("no backend configured for role {0}")]
    NoBackendConfigured(String),
    #[error("failed to connect to backend service")]
    ConnectFailed(#[source] io::Error),
    #[error("failed to send request to backend service")]
    SendFailed(#[source] io::Error),
    #[error("invalid response from backend service")]
    ResponseFailed(#[source] HttpResponseParseError),
    #[error("failed to read response body from backend service")]
    RecvFailed(#[source] io::Error),
    #[error("backend signaled failover condition with status {0}")]
    BackendFailoverSignaled(u16),
    #[error("request body replay failed: {0}")]
    ReplayOverflow(ReplayError),
    #[error("credential injection failed: {0}")]
    CredentialFailed(anyhow::Error),
    #[error("write to client failed: {0:?}")]
    ClientWriteFailed(io::Error),
    #[error("backend failover attempts exhausted")]
    AttemptsExhausted(#[source] Box<DispatchError>),
}

impl DispatchError {
    pub fn brief(&self) -> &'static str {
        match self {
            DispatchError::InvalidTargetUrl(_) => "InvalidTargetUrl",
            DispatchError::NoBackendConfigured(_) => "NoBackendConfigured",
            DispatchError::ConnectFailed(_) => "ConnectFailed",
            DispatchError::SendFailed(_) => "SendFailed",
            DispatchError::ResponseFailed(_) => "ResponseFailed",
            DispatchError::RecvFailed(_) => "RecvFailed",
            DispatchError::BackendFailoverSignaled(_) => "BackendFailoverSignaled",
            DispatchError::ReplayOverflow(_) => "ReplayOverflow",
            DispatchError::CredentialFailed(_) => "CredentialFailed",
            DispatchError::ClientWriteFailed(_) => "ClientWriteFailed",
            DispatchError::AttemptsExhausted(_) => "AttemptsExhausted",
        }
    }

    /// Whether the failover controller may absorb this failure and retry
    /// against another backend URL.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ConnectFailed(_)
                | DispatchError::SendFailed(_)
                | DispatchError::ResponseFailed(_)
        )
    }
}

/// Classify an outbound send error, keeping replay exhaustion distinct
/// from ordinary transport failures.
pub(crate) fn map_send_error(e: io::Error) -> DispatchError {
    match e.downcast::<ReplayError>() {
        Ok(re) => DispatchError::ReplayOverflow(re),
        Err(e) => DispatchError::SendFailed(e),
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
