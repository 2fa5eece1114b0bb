/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

pub mod parse;
pub mod request;
pub mod response;

pub use request::{ClientBody, ClientRequest, OutboundRequest, RequestContext};
pub use response::{HttpResponseParseError, RemoteResponse};
