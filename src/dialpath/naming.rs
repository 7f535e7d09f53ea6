//! Dial-path names: `ssh_{host}_{nanos}`
//!
//! `nanos` comes from the wall clock but is forced strictly increasing per
//! namer, so a coarse or repeating clock still yields distinct names. Every
//! manager shares [`global_namer`] unless given its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

static GLOBAL_NAMER: OnceLock<Arc<DialPathNamer>> = OnceLock::new();

/// Process-wide namer, paired with [`global_registry`](super::global_registry)
pub fn global_namer() -> Arc<DialPathNamer> {
    GLOBAL_NAMER
        .get_or_init(|| Arc::new(DialPathNamer::new()))
        .clone()
}

fn wall_clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct DialPathNamer {
    last: AtomicU64,
    clock: fn() -> u64,
}

impl Default for DialPathNamer {
    fn default() -> Self {
        Self::with_clock(wall_clock_nanos)
    }
}

impl DialPathNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namer reading nanoseconds from `clock` instead of the wall clock
    pub fn with_clock(clock: fn() -> u64) -> Self {
        Self {
            last: AtomicU64::new(0),
            clock,
        }
    }

    pub fn next(&self, host: &str) -> String {
        self.name_at(host, (self.clock)())
    }

    pub(crate) fn name_at(&self, host: &str, now_nanos: u64) -> String {
        let stamp = self.claim_stamp(now_nanos);
        format!("ssh_{}_{}", sanitize_host(host), stamp)
    }

    fn claim_stamp(&self, now_nanos: u64) -> u64 {
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let stamp = now_nanos.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange(last, stamp, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return stamp,
                Err(current) => last = current,
            }
        }
    }
}

/// Keep `[A-Za-z0-9.-]`, replace anything else with `_`
fn sanitize_host(host: &str) -> String {
    let cleaned: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "host".to_string()
    } else {
        cleaned
    }
}
