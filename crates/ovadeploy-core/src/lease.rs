//! Waiting for a transfer lease to become ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::vim::{HostApi, LeaseSnapshot, LeaseState, ManagedObjectRef};

/// Default pause between lease polls (2 s).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default limit on how long a lease may stay initializing (30 min).
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How often and how long to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub poll_interval: Duration,
    /// Give up once this much time has passed; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Give up after this many polls.
    pub max_polls: Option<u32>,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: Some(DEFAULT_LEASE_TIMEOUT),
            max_polls: None,
        }
    }
}

impl LeasePolicy {
    /// Poll every `poll_interval` without any limit.
    pub fn unbounded(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            timeout: None,
            max_polls: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = Some(max_polls);
        self
    }
}

/// Shared flag to stop a running wait from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Poll `lease` until the host reports it ready.
///
/// The lease is only read, never changed. An `error` state ends the wait
/// with [`Error::Lease`]; states this client does not know are logged and
/// waited out like `initializing`.
pub fn await_lease_ready(
    host: &dyn HostApi,
    lease: &ManagedObjectRef,
    policy: &LeasePolicy,
    cancel: Option<&CancelFlag>,
) -> Result<LeaseSnapshot> {
    let started = Instant::now();
    let mut polls: u32 = 0;

    loop {
        if let Some(flag) = cancel {
            flag.check()?;
        }

        let snapshot = host.lease_snapshot(lease)?;
        polls += 1;
        debug!(lease = %lease, state = %snapshot.state, polls, "lease polled");

        match &snapshot.state {
            LeaseState::Ready => {
                info!(lease = %lease, devices = snapshot.device_urls.len(), "lease ready");
                return Ok(snapshot);
            }
            LeaseState::Error => {
                return Err(Error::lease(snapshot.state.as_str(), snapshot.error.clone()));
            }
            LeaseState::Initializing => {}
            other => {
                warn!(lease = %lease, state = %other, "unexpected lease state, still waiting");
            }
        }

        let elapsed = started.elapsed();
        let out_of_polls = policy.max_polls.is_some_and(|max| polls >= max);
        let out_of_time = policy
            .timeout
            .is_some_and(|timeout| elapsed + policy.poll_interval > timeout);
        if out_of_polls || out_of_time {
            return Err(Error::LeaseTimeout { polls, elapsed });
        }

        thread::sleep(policy.poll_interval);

        if let Some(flag) = cancel {
            flag.check()?;
        }
    }
}
