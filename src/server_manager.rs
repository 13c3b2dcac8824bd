// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, info, warn, Logger};
use timer::Guard;

use crate::cluster::{Cluster, TransportKind};
use crate::connection::{Connection, ConnectionFactory};
use crate::endpoint::Endpoint;

/// The buffer size used for recovery trial connections.
pub const PROBE_BUFFER_SIZE: usize = 1024;

/// A reachability probe for a single endpoint.
///
/// Returns `true` when a throwaway trial connection to the endpoint
/// succeeds. Probes run on the recovery timer thread and must not panic.
pub type ProbeFn = Arc<dyn Fn(&Endpoint) -> bool + Send + Sync>;

/// Build the standard probe from a connection factory: open a trial
/// connection with the simple transport and a minimal buffer, close it, and
/// report whether the open succeeded.
pub fn connection_probe<C>(factory: ConnectionFactory<C>) -> ProbeFn
where
    C: Connection,
{
    Arc::new(move |endpoint: &Endpoint| {
        let mut conn =
            factory(endpoint, TransportKind::Simple, PROBE_BUFFER_SIZE);
        match conn.open() {
            Ok(()) => {
                let _ = conn.close();
                true
            }
            Err(_) => false,
        }
    })
}

/// Tracks which endpoints are currently eligible to hand out and quarantines
/// those that have recently failed.
///
/// The variant is selected once at construction time by endpoint count:
/// a single-endpoint configuration gets the boolean failed/available
/// tracker, anything larger gets the round-robin rotation over the live
/// subset. Callers only use [`get_server`](ServerManager::get_server) and
/// [`error_occurred`](ServerManager::error_occurred).
pub enum ServerManager {
    Single(SingleServerManager),
    RoundRobin(RoundRobinServerManager),
}

impl ServerManager {
    /// Select and build the manager variant for `cluster`.
    pub fn new(cluster: &Cluster, probe: ProbeFn, log: Logger) -> Self {
        if cluster.endpoints.len() == 1 {
            ServerManager::Single(SingleServerManager::new(
                cluster.endpoints[0].clone(),
                cluster.polling_interval,
                probe,
                log,
            ))
        } else {
            ServerManager::RoundRobin(RoundRobinServerManager::new(
                cluster.endpoints.clone(),
                cluster.polling_interval,
                probe,
                log,
            ))
        }
    }

    /// Return the next live endpoint to try, or `None` when every endpoint
    /// is quarantined. `None` is a sentinel, not an error; the caller
    /// decides how to react.
    pub fn get_server(&self) -> Option<Endpoint> {
        match self {
            ServerManager::Single(m) => m.get_server(),
            ServerManager::RoundRobin(m) => m.get_server(),
        }
    }

    /// Report a connection-open failure against `endpoint`, quarantining it.
    pub fn error_occurred(&self, endpoint: &Endpoint) {
        match self {
            ServerManager::Single(m) => m.error_occurred(endpoint),
            ServerManager::RoundRobin(m) => m.error_occurred(endpoint),
        }
    }

    /// Stop recovery probing. No further health transitions occur after
    /// disposal; `get_server` must not be called afterwards.
    pub fn dispose(&self) {
        match self {
            ServerManager::Single(m) => m.dispose(),
            ServerManager::RoundRobin(m) => m.dispose(),
        }
    }
}

struct SingleState {
    failed: bool,
    disposed: bool,
    recovery_guard: Option<Guard>,
}

/// Health tracking for a one-endpoint configuration.
///
/// Two states, available and failed. A failure arms a one-shot recovery
/// probe at the polling interval; a probe that fails does *not* reschedule
/// itself -- only the next reported failure arms a new probe. A server that
/// recovers without a subsequent `error_occurred` call therefore stays
/// marked failed until one arrives.
pub struct SingleServerManager {
    endpoint: Endpoint,
    state: Arc<Mutex<SingleState>>,
    probe: ProbeFn,
    poll_interval: chrono::Duration,
    // The timer lives behind a lock because timer::Timer is not Sync and
    // managers are shared across request and timer threads.
    timer: Mutex<timer::Timer>,
    log: Logger,
}

impl SingleServerManager {
    pub fn new(
        endpoint: Endpoint,
        polling_interval: Duration,
        probe: ProbeFn,
        log: Logger,
    ) -> Self {
        SingleServerManager {
            endpoint,
            state: Arc::new(Mutex::new(SingleState {
                failed: false,
                disposed: false,
                recovery_guard: None,
            })),
            probe,
            poll_interval: chrono::Duration::milliseconds(
                polling_interval.as_millis() as i64,
            ),
            timer: Mutex::new(timer::Timer::new()),
            log,
        }
    }

    pub fn get_server(&self) -> Option<Endpoint> {
        let state = self.state.lock().unwrap();
        if state.failed {
            None
        } else {
            Some(self.endpoint.clone())
        }
    }

    pub fn error_occurred(&self, _endpoint: &Endpoint) {
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed || state.failed {
                return;
            }
            state.failed = true;
        }
        warn!(
            self.log,
            "endpoint {} failed, arming recovery probe", self.endpoint
        );

        let state = Arc::clone(&self.state);
        let probe = Arc::clone(&self.probe);
        let endpoint = self.endpoint.clone();
        let log = self.log.clone();
        let guard = self
            .timer
            .lock()
            .unwrap()
            .schedule_with_delay(self.poll_interval, move || {
                let mut state = state.lock().unwrap();
                if state.disposed || !state.failed {
                    return;
                }
                if probe(&endpoint) {
                    state.failed = false;
                    info!(log, "endpoint {} recovered", endpoint);
                } else {
                    // Single attempt per failure. The probe is not
                    // rescheduled; the next error_occurred call arms a new
                    // one.
                    debug!(log, "recovery probe for {} failed", endpoint);
                }
            });
        self.state.lock().unwrap().recovery_guard = Some(guard);
    }

    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap();
        state.disposed = true;
        state.recovery_guard.take();
    }
}

struct RotationState {
    live: Vec<Endpoint>,
    blacklisted: HashSet<Endpoint>,
    cursor: usize,
    disposed: bool,
}

/// Health tracking and rotation for a multi-endpoint configuration.
///
/// Live endpoints are handed out round robin. A failure moves the endpoint
/// to the blacklist; a periodic recovery pass probes every blacklisted
/// endpoint and moves the reachable ones back to the live tail. The cursor
/// is re-clamped by modulo on every call, so the rotation can skip or
/// repeat an entry immediately after a membership change -- round robin here
/// is a load-spreading heuristic, not a fairness guarantee.
pub struct RoundRobinServerManager {
    state: Arc<Mutex<RotationState>>,
    recovery_guard: Mutex<Option<Guard>>,
    _timer: Mutex<timer::Timer>,
    log: Logger,
}

impl RoundRobinServerManager {
    pub fn new(
        endpoints: Vec<Endpoint>,
        polling_interval: Duration,
        probe: ProbeFn,
        log: Logger,
    ) -> Self {
        let state = Arc::new(Mutex::new(RotationState {
            live: endpoints,
            blacklisted: HashSet::new(),
            cursor: usize::MAX,
            disposed: false,
        }));

        let timer = timer::Timer::new();
        let tick_state = Arc::clone(&state);
        let tick_log = log.clone();
        let guard = timer.schedule_repeating(
            chrono::Duration::milliseconds(polling_interval.as_millis() as i64),
            move || recover_blacklisted(&tick_state, &probe, &tick_log),
        );

        RoundRobinServerManager {
            state,
            recovery_guard: Mutex::new(Some(guard)),
            _timer: Mutex::new(timer),
            log,
        }
    }

    pub fn get_server(&self) -> Option<Endpoint> {
        let mut state = self.state.lock().unwrap();
        if state.live.is_empty() {
            return None;
        }
        state.cursor = state.cursor.wrapping_add(1);
        if state.cursor >= state.live.len() {
            state.cursor = 0;
        }
        Some(state.live[state.cursor].clone())
    }

    pub fn error_occurred(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return;
        }
        if state.blacklisted.insert(endpoint.clone()) {
            state.live.retain(|e| e != endpoint);
            warn!(self.log, "endpoint {} blacklisted", endpoint);
        }
    }

    pub fn dispose(&self) {
        self.state.lock().unwrap().disposed = true;
        self.recovery_guard.lock().unwrap().take();
    }
}

// One recovery pass: snapshot the blacklist, probe each entry, and move the
// reachable ones back to live. Trial connections are made outside the lock
// so request threads are not serialized behind a slow probe. A failed probe
// is retried on the next period.
fn recover_blacklisted(
    state: &Arc<Mutex<RotationState>>,
    probe: &ProbeFn,
    log: &Logger,
) {
    let snapshot: Vec<Endpoint> = {
        let state = state.lock().unwrap();
        if state.disposed || state.blacklisted.is_empty() {
            return;
        }
        state.blacklisted.iter().cloned().collect()
    };

    for endpoint in snapshot {
        if probe(&endpoint) {
            let mut state = state.lock().unwrap();
            if state.disposed {
                return;
            }
            if state.blacklisted.remove(&endpoint) {
                info!(log, "endpoint {} recovered", endpoint);
                state.live.push(endpoint);
            }
        } else {
            debug!(log, "recovery probe for {} failed", endpoint);
        }
    }
}
