/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use fixedbitset::FixedBitSet;
use foldhash::fast::FixedState;
use log::warn;
use url::Url;

/// Shared bookkeeping of backend URLs per service role.
///
/// Implementations must make `mark_failed` atomic per role: demoting a URL
/// and advancing the active pointer happen under one lock so concurrent
/// failing requests cannot interleave half-finished rotations.
pub trait BackendRegistry {
    fn add_backends(&self, role: &str, urls: Vec<Url>);
    fn get_active_url(&self, role: &str) -> Option<Url>;
    fn mark_failed(&self, role: &str, url: &Url);
    fn is_ha_enabled(&self, role: &str) -> bool;
}

/// Process-lifetime registry over statically configured URL lists.
///
/// A URL marked failed stays failed for the lifetime of the process; when
/// every URL of a role is failed the ring wraps back to the start of the
/// configured list so an active URL is always available.
pub struct StaticBackendRegistry {
    roles: Mutex<HashMap<String, Arc<RoleEntry>, FixedState>>,
}

struct RoleEntry {
    urls: Vec<Url>,
    active: ArcSwap<Url>,
    state: Mutex<RingState>,
}

struct RingState {
    active_idx: usize,
    failed: FixedBitSet,
}

impl StaticBackendRegistry {
    pub fn new() -> Self {
        StaticBackendRegistry {
            roles: Mutex::new(HashMap::with_hasher(FixedState::with_seed(0))),
        }
    }

    fn get_entry(&self, role: &str) -> Option<Arc<RoleEntry>> {
        let ht = self.roles.lock().unwrap();
        ht.get(role).cloned()
    }
}

impl Default for StaticBackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry for StaticBackendRegistry {
    fn add_backends(&self, role: &str, urls: Vec<Url>) {
        if urls.is_empty() {
            return;
        }
        let entry = Arc::new(RoleEntry {
            active: ArcSwap::from_pointee(urls[0].clone()),
            state: Mutex::new(RingState {
                active_idx: 0,
                failed: FixedBitSet::with_capacity(urls.len()),
            }),
            urls,
        });
        let mut ht = self.roles.lock().unwrap();
        ht.insert(role.to_string(), entry);
    }

    fn get_active_url(&self, role: &str) -> Option<Url> {
        let entry = self.get_entry(role)?;
        let url = entry.active.load_full();
        Some(url.as_ref().clone())
    }

    fn mark_failed(&self, role: &str, url: &Url) {
        let Some(entry) = self.get_entry(role) else {
            return;
        };
        let Some(idx) = entry.urls.iter().position(|u| u == url) else {
            return;
        };

        let mut state = entry.state.lock().unwrap();
        state.failed.insert(idx);
        warn!("role {role}: backend url {url} marked failed");
        if state.active_idx != idx {
            // a concurrent request already rotated away from this URL
            return;
        }

        let len = entry.urls.len();
        let mut next = (idx + 1) % len;
        while next != idx {
            if !state.failed.contains(next) {
                break;
            }
            next = (next + 1) % len;
        }
        if next == idx {
            // every URL is failed, wrap to the start of the list
            next = 0;
        }
        state.active_idx = next;
        entry.active.store(Arc::new(entry.urls[next].clone()));
    }

    fn is_ha_enabled(&self, role: &str) -> bool {
        let ht = self.roles.lock().unwrap();
        ht.contains_key(role)
    }
}
