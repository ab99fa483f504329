//! Session guard: admits one high-level operation at a time.

use crate::repl::error::{ReplError, ReplResult};
use crate::repl::types::BusyPolicy;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Held for the duration of one operation; dropping it frees the session.
pub struct GuardPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct SessionGuard {
    gate: Mutex<Arc<Semaphore>>,
    policy: BusyPolicy,
}

impl SessionGuard {
    pub fn new(policy: BusyPolicy) -> Self {
        Self {
            gate: Mutex::new(Arc::new(Semaphore::new(1))),
            policy,
        }
    }

    fn current(&self) -> Arc<Semaphore> {
        self.gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Admit the caller according to the busy policy.
    ///
    /// `Ok(None)` means the `ignore` policy dropped the call.
    pub async fn admit(&self) -> ReplResult<Option<GuardPermit>> {
        let gate = self.current();
        match gate.clone().try_acquire_owned() {
            Ok(permit) => return Ok(Some(GuardPermit { _permit: permit })),
            Err(TryAcquireError::Closed) => return Err(ReplError::busy()),
            Err(TryAcquireError::NoPermits) => {}
        }
        match self.policy {
            BusyPolicy::Ignore => {
                log::debug!("session busy, ignoring call");
                Ok(None)
            }
            BusyPolicy::Reject => Err(ReplError::busy()),
            BusyPolicy::Queue => {
                log::debug!("session busy, queueing call");
                let permit = gate.acquire_owned().await.map_err(|_| ReplError::busy())?;
                Ok(Some(GuardPermit { _permit: permit }))
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current().available_permits() == 0
    }

    /// Forget any running operation. Calls queued on the old gate are
    /// refused; the next call starts on a fresh one.
    pub fn reset(&self) {
        let mut gate = self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gate.close();
        *gate = Arc::new(Semaphore::new(1));
    }
}
