/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Backend dispatch and HA failover core for the wayline gateway.
//!
//! The hosting HTTP server hands this crate a resolved backend URL, a
//! parsed inbound request head with a one-shot body reader, and the
//! client-side writer. The dispatcher performs the backend exchange and
//! materializes the response back to the client; for roles under HA
//! management a bounded failover loop rotates through the configured
//! backend URLs, replaying already-consumed request-body bytes from a
//! bounded buffer.

pub mod body;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod protocol;
pub mod registry;

mod log;

pub use body::replay::{
    BodyTransfer, BoxBodyReader, EntityReader, ReplayError, RequestEntity,
    DEFAULT_REPLAY_BUFFER_SIZE,
};
pub use config::{BodyProbe, DispatchConfig, ServerDefaults};
pub use dispatch::{CredentialProvider, DispatchOutcome, Dispatcher};
pub use error::{DispatchError, DispatchResult};
pub use failover::BackendPolicy;
pub use protocol::{ClientBody, ClientRequest, OutboundRequest, RemoteResponse, RequestContext};
pub use registry::{BackendRegistry, StaticBackendRegistry};
