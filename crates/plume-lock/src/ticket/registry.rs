use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use plume_model::{EpochMs, Ticket, now_ms};
use tracing::{debug, info, warn};

use crate::pid::ProcessTable;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Minimum delay between two timeout sweeps.
    pub sweep_interval: Duration,
    /// A waiting ticket silent for longer than this is dropped.
    pub dead_timeout: Duration,
    /// A ticket working for longer than this is dropped, whether or not it still polls.
    pub max_working: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(30),
            max_working: Duration::from_secs(120),
        }
    }
}

struct State {
    tickets: BTreeSet<Ticket>,
    last_sweep: EpochMs,
}

/// Arbiter of one named ticket lock.
///
/// Tickets are served in their natural order and at most one of them is `working` at a time.
/// Waiting clients keep their ticket alive by polling [`TicketRegistry::get_tickets`]; the working
/// ticket is bounded by `max_working` from its election instead.
pub struct TicketRegistry {
    lock_name: String,
    host: String,
    cfg: RegistryConfig,
    processes: Arc<dyn ProcessTable>,
    state: Mutex<State>,
}

fn elapsed_ms(now: EpochMs, since: EpochMs) -> u64 {
    now.saturating_sub(since)
}

fn millis(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

impl TicketRegistry {
    pub fn new(
        lock_name: impl Into<String>,
        cfg: RegistryConfig,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        Self {
            lock_name: lock_name.into(),
            host,
            cfg,
            processes,
            state: Mutex::new(State {
                tickets: BTreeSet::new(),
                last_sweep: 0,
            }),
        }
    }

    /// Tickets of this host are evicted as soon as their pid disappears.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// Register or refresh `ticket` and return every known ticket, in service order.
    pub fn get_tickets(&self, ticket: Ticket) -> Vec<Ticket> {
        self.get_tickets_at(ticket, now_ms())
    }

    pub fn get_tickets_at(&self, mut ticket: Ticket, now: EpochMs) -> Vec<Ticket> {
        let live = self.local_pids();
        let mut state = self.state.lock().unwrap();

        match state.tickets.get(&ticket) {
            Some(known) => {
                ticket.working = known.working;
                ticket.working_since = known.working_since;
            }
            None => {
                ticket.working = false;
                ticket.working_since = 0;
            }
        }
        ticket.last_active_time = now;
        let caller = ticket.clone();
        if state.tickets.replace(ticket).is_none() {
            debug!(lock = %self.lock_name, ticket = %caller, "ticket registered");
        }

        if let Some(live) = live {
            state.tickets.retain(|t| {
                let keep = *t == caller || t.host != self.host || live.contains(&t.pid);
                if !keep {
                    warn!(lock = %self.lock_name, ticket = %t, "evicting ticket of dead process");
                }
                keep
            });
        }

        if elapsed_ms(now, state.last_sweep) >= millis(self.cfg.sweep_interval) {
            state.last_sweep = now;
            self.sweep(&mut state.tickets, now);
        }

        self.elect(&mut state.tickets, now);
        state.tickets.iter().cloned().collect()
    }

    /// Drop `ticket`, releasing the lock when it was working.
    pub fn end_work(&self, ticket: &Ticket) {
        self.end_work_at(ticket, now_ms());
    }

    pub fn end_work_at(&self, ticket: &Ticket, now: EpochMs) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.tickets.take(ticket) {
            debug!(lock = %self.lock_name, ticket = %t, "ticket ended");
        }
        self.elect(&mut state.tickets, now);
    }

    pub fn snapshot(&self) -> Vec<Ticket> {
        self.state.lock().unwrap().tickets.iter().cloned().collect()
    }

    fn local_pids(&self) -> Option<HashSet<u32>> {
        match self.processes.live_pids(None) {
            Ok(pids) => Some(pids),
            Err(e) => {
                warn!(lock = %self.lock_name, error = %e, "skipping pid eviction");
                None
            }
        }
    }

    fn sweep(&self, tickets: &mut BTreeSet<Ticket>, now: EpochMs) {
        let dead = millis(self.cfg.dead_timeout);
        let max_working = millis(self.cfg.max_working);

        tickets.retain(|t| {
            if t.working {
                let working = elapsed_ms(now, t.working_since);
                if working > max_working {
                    warn!(lock = %self.lock_name, ticket = %t, working_ms = working, "dropping ticket working past its limit");
                    return false;
                }
                return true;
            }
            let silent = elapsed_ms(now, t.last_active_time);
            if silent > dead {
                warn!(lock = %self.lock_name, ticket = %t, silent_ms = silent, "dropping silent ticket");
                return false;
            }
            true
        });
    }

    fn elect(&self, tickets: &mut BTreeSet<Ticket>, now: EpochMs) {
        if tickets.iter().any(|t| t.working) {
            return;
        }
        if let Some(mut first) = tickets.pop_first() {
            first.working = true;
            first.working_since = now;
            info!(lock = %self.lock_name, ticket = %first, "ticket elected");
            tickets.insert(first);
        }
    }
}
