/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

use http::Method;
use slog::{Logger, slog_info, slog_warn};
use url::Url;

use crate::error::DispatchError;
use crate::protocol::RequestContext;

pub(crate) fn status_class(code: u16) -> &'static str {
    match code {
        201 => "created",
        200..=299 => "success",
        _ => "other",
    }
}

/// Audit sink for one proxied exchange. Backend addresses only ever show
/// up here, never in client-facing error messages.
pub(crate) struct DispatchAuditLog<'a> {
    pub(crate) logger: &'a Logger,
    pub(crate) role: &'a str,
    pub(crate) ctx: &'a RequestContext,
}

impl DispatchAuditLog<'_> {
    pub(crate) fn log_exchange(&self, method: &Method, target: &Url, status: u16) {
        slog_info!(self.logger, "dispatch";
            "task_id" => self.ctx.id().to_string(),
            "role" => self.role.to_string(),
            "method" => method.as_str().to_string(),
            "target" => target.as_str().to_string(),
            "status" => status,
            "status_class" => status_class(status),
            "attempt" => self.ctx.failover_count(),
        )
    }

    pub(crate) fn log_dispatch_failed(&self, method: &Method, target: &Url, e: &DispatchError) {
        slog_warn!(self.logger, "dispatch failed";
            "task_id" => self.ctx.id().to_string(),
            "role" => self.role.to_string(),
            "method" => method.as_str().to_string(),
            "target" => target.as_str().to_string(),
            "reason" => e.brief(),
            "detail" => format!("{e:?}"),
            "attempt" => self.ctx.failover_count(),
        )
    }

    pub(crate) fn log_failover_retry(
        &self,
        failed: &Url,
        next: &Url,
        attempt: u32,
        backoff: Duration,
    ) {
        slog_info!(self.logger, "failover retry";
            "task_id" => self.ctx.id().to_string(),
            "role" => self.role.to_string(),
            "failed_url" => failed.as_str().to_string(),
            "next_url" => next.as_str().to_string(),
            "attempt" => attempt,
            "backoff_ms" => backoff.as_millis() as u64,
        )
    }

    pub(crate) fn log_failover_exhausted(&self, attempts: u32, buffered_response: bool) {
        slog_warn!(self.logger, "failover attempts exhausted";
            "task_id" => self.ctx.id().to_string(),
            "role" => self.role.to_string(),
            "attempts" => attempts,
            "buffered_response" => buffered_response,
        )
    }
}
