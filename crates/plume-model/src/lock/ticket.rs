use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
    time::Instant,
};

use serde::{Deserialize, Serialize};

use crate::{EpochMs, now_ms};

static ANCHOR: OnceLock<Instant> = OnceLock::new();
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, AtomicOrdering::Relaxed);
}

/// One competitor for a named ticket lock.
///
/// Identity is the tuple `(pid, thread_id, creation_time, nano_time)`: equality and hashing ignore
/// the mutable fields (`working`, `working_since`, `last_active_time`), so a registry can look up
/// its own authoritative copy with the instance a client sends. Tickets order by creation time,
/// then nano time, then pid, then thread id; the smallest ticket is served first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub pid: u32,
    pub thread_id: u64,
    pub creation_time: EpochMs,
    pub nano_time: u64,
    /// Host the ticket was created on. Not part of the identity.
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub last_active_time: EpochMs,
    #[serde(default)]
    pub working: bool,
    /// When the registry elected this ticket. Only meaningful while `working`.
    #[serde(default)]
    pub working_since: EpochMs,
}

impl Ticket {
    /// Create a ticket for the calling thread of the current process.
    pub fn new(description: Option<String>) -> Self {
        let anchor = ANCHOR.get_or_init(Instant::now);
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        let now = now_ms();

        Self {
            pid: std::process::id(),
            thread_id: THREAD_ID.with(|id| *id),
            creation_time: now,
            nano_time: anchor.elapsed().as_nanos() as u64,
            host,
            description,
            last_active_time: now,
            working: false,
            working_since: 0,
        }
    }

    /// Build a ticket with an explicit identity.
    pub fn with_identity(pid: u32, thread_id: u64, creation_time: EpochMs, nano_time: u64) -> Self {
        Self {
            pid,
            thread_id,
            creation_time,
            nano_time,
            host: String::new(),
            description: None,
            last_active_time: creation_time,
            working: false,
            working_since: 0,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[inline]
    fn identity(&self) -> (EpochMs, u64, u32, u64) {
        (self.creation_time, self.nano_time, self.pid, self.thread_id)
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Ticket {}

impl Hash for Ticket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticket(pid={}, thread={}, created={}, working={})",
            self.pid, self.thread_id, self.creation_time, self.working
        )?;
        if let Some(desc) = &self.description {
            write!(f, " {desc}")?;
        }
        Ok(())
    }
}
