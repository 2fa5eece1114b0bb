/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

use anyhow::anyhow;
use http::header;
use http::HeaderName;
use yaml_rust::{Yaml, yaml};

pub(crate) mod yaml_value;

pub(crate) use yaml_value as value;

use crate::body::replay::DEFAULT_REPLAY_BUFFER_SIZE;

const DEFAULT_MAX_FAILOVER_ATTEMPTS: u32 = 3;
const DEFAULT_FAILOVER_SLEEP: Duration = Duration::from_secs(1);
const DEFAULT_DELEGATION_QUERY_PARAM: &str = "delegation";
const DEFAULT_MAX_PROBE_BYTES: usize = 32 << 10;

/// Server-wide fallbacks shared by every role.
#[derive(Clone, Debug)]
pub struct ServerDefaults {
    pub replay_buffer_size: usize,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        ServerDefaults {
            replay_buffer_size: DEFAULT_REPLAY_BUFFER_SIZE,
        }
    }
}

/// Eager response-body inspection for one designated status code.
///
/// Only a response carrying exactly `status` has its body read ahead of
/// forwarding; a body longer than `max_probe_bytes` is forwarded unprobed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodyProbe {
    pub status: u16,
    pub markers: Vec<String>,
    pub max_probe_bytes: usize,
}

impl BodyProbe {
    fn parse(map: &yaml::Hash) -> anyhow::Result<Self> {
        let mut probe = BodyProbe {
            status: 0,
            markers: Vec::new(),
            max_probe_bytes: DEFAULT_MAX_PROBE_BYTES,
        };
        value::foreach_kv(map, |k, v| match k {
            "status" => {
                probe.status = value::as_u16(v)?;
                Ok(())
            }
            "markers" | "marker" => {
                probe.markers = value::as_list(v, value::as_string)?;
                Ok(())
            }
            "max_probe_bytes" => {
                probe.max_probe_bytes = value::as_usize(v)?;
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k}")),
        })?;
        if probe.status == 0 {
            return Err(anyhow!("no status code set for body probe"));
        }
        if probe.markers.is_empty() {
            return Err(anyhow!("no markers set for body probe"));
        }
        Ok(probe)
    }
}

/// Per-role dispatch configuration.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub role: String,
    pub max_failover_attempts: u32,
    pub failover_sleep: Duration,
    /// per-role override; the server-wide default applies when unset,
    /// an explicit 0 disables replay buffering entirely
    pub replay_buffer_size: Option<usize>,
    /// the backend expects the gateway's own credential negotiation
    pub secured: bool,
    pub delegation_query_param: String,
    /// pseudonym appended to the outbound Via header
    pub gateway_id: Option<String>,
    pub excluded_response_headers: Vec<HeaderName>,
    pub excluded_request_headers: Vec<HeaderName>,
    pub failover_redirect_codes: Vec<u16>,
    pub login_redirect_marker: Option<String>,
    pub body_probe: Option<BodyProbe>,
}

impl DispatchConfig {
    pub fn new(role: impl Into<String>) -> Self {
        DispatchConfig {
            role: role.into(),
            max_failover_attempts: DEFAULT_MAX_FAILOVER_ATTEMPTS,
            failover_sleep: DEFAULT_FAILOVER_SLEEP,
            replay_buffer_size: None,
            secured: false,
            delegation_query_param: DEFAULT_DELEGATION_QUERY_PARAM.to_string(),
            gateway_id: None,
            excluded_response_headers: vec![header::SET_COOKIE, header::WWW_AUTHENTICATE],
            excluded_request_headers: Vec::new(),
            failover_redirect_codes: Vec::new(),
            login_redirect_marker: None,
            body_probe: None,
        }
    }

    pub fn parse(map: &yaml::Hash) -> anyhow::Result<Self> {
        let mut config = DispatchConfig::new(String::new());
        value::foreach_kv(map, |k, v| config.set(k, v))?;
        config.check()?;
        Ok(config)
    }

    fn set(&mut self, k: &str, v: &Yaml) -> anyhow::Result<()> {
        match k {
            "role" | "name" => {
                self.role = value::as_string(v)?;
                Ok(())
            }
            "max_failover_attempts" => {
                self.max_failover_attempts = value::as_u32(v)?;
                Ok(())
            }
            "failover_sleep" | "failover_delay" => {
                self.failover_sleep = value::as_duration(v)?;
                Ok(())
            }
            "replay_buffer_size" => {
                self.replay_buffer_size = Some(value::as_usize(v)?);
                Ok(())
            }
            "secured" => {
                self.secured = value::as_bool(v)?;
                Ok(())
            }
            "delegation_query_param" => {
                self.delegation_query_param = value::as_string(v)?;
                Ok(())
            }
            "gateway_id" => {
                self.gateway_id = Some(value::as_string(v)?);
                Ok(())
            }
            "excluded_response_headers" => {
                self.excluded_response_headers = value::as_list(v, value::as_header_name)?;
                Ok(())
            }
            "excluded_request_headers" => {
                self.excluded_request_headers = value::as_list(v, value::as_header_name)?;
                Ok(())
            }
            "failover_redirect_codes" => {
                self.failover_redirect_codes = value::as_list(v, value::as_u16)?;
                Ok(())
            }
            "login_redirect_marker" => {
                self.login_redirect_marker = Some(value::as_string(v)?);
                Ok(())
            }
            "body_probe" => match v {
                Yaml::Hash(map) => {
                    self.body_probe = Some(BodyProbe::parse(map)?);
                    Ok(())
                }
                _ => Err(anyhow!("yaml value type for body probe should be 'map'")),
            },
            _ => Err(anyhow!("invalid key {k}")),
        }
    }

    fn check(&mut self) -> anyhow::Result<()> {
        if self.role.is_empty() {
            return Err(anyhow!("role is not set"));
        }
        if self.delegation_query_param.is_empty() {
            return Err(anyhow!("delegation query param may not be empty"));
        }
        Ok(())
    }

    /// The effective replay buffer capacity, if replay buffering is enabled.
    pub(crate) fn replay_capacity(&self, server: &ServerDefaults) -> Option<usize> {
        match self.replay_buffer_size {
            Some(0) => None,
            Some(n) => Some(n),
            None => Some(server.replay_buffer_size),
        }
    }
}
