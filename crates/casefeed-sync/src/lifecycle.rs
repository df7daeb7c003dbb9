use crate::connection::ConnectionControl;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Interest {
    count: usize,
    suspended: bool,
    shut_down: bool,
}

impl Interest {
    fn may_connect(&self) -> bool {
        self.count > 0 && !self.suspended && !self.shut_down
    }
}

struct Shared {
    control: Arc<dyn ConnectionControl>,
    interest: Mutex<Interest>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Interest> {
        self.interest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_one(&self) {
        let mut interest = self.lock();
        assert!(
            interest.count > 0,
            "timeline interest released more times than acquired"
        );
        interest.count -= 1;
        debug!(event = "interest_release", count = interest.count);
        if interest.count == 0 {
            info!(event = "last_interest_released");
            self.control.stop();
        }
    }
}

#[derive(Clone)]
pub struct LifecycleCoordinator {
    shared: Arc<Shared>,
}

impl LifecycleCoordinator {
    pub fn new(control: Arc<dyn ConnectionControl>) -> Self {
        Self {
            shared: Arc::new(Shared {
                control,
                interest: Mutex::new(Interest::default()),
            }),
        }
    }

    pub fn acquire(&self) -> InterestHandle {
        let mut interest = self.shared.lock();
        interest.count += 1;
        debug!(event = "interest_acquire", count = interest.count);
        if interest.count == 1 && interest.may_connect() {
            info!(event = "first_interest_acquired");
            self.shared.control.start();
        }
        InterestHandle {
            owner: Some(self.shared.clone()),
        }
    }

    /// Panics if `handle` came from a different coordinator.
    pub fn release(&self, mut handle: InterestHandle) {
        let Some(owner) = handle.owner.take() else {
            return;
        };
        assert!(
            Arc::ptr_eq(&owner, &self.shared),
            "interest handle released to a coordinator that did not issue it"
        );
        owner.release_one();
    }

    pub fn interest_count(&self) -> usize {
        self.shared.lock().count
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.lock().suspended
    }

    pub fn network_regained(&self) {
        self.nudge_if_wanted("network_regained");
    }

    pub fn visibility_regained(&self) {
        self.nudge_if_wanted("visibility_regained");
    }

    // keeps interest; the connection stays down until resume
    pub fn suspend(&self) {
        let mut interest = self.shared.lock();
        if interest.suspended {
            return;
        }
        interest.suspended = true;
        info!(event = "timeline_suspended", count = interest.count);
        self.shared.control.stop();
    }

    pub fn resume(&self) {
        let mut interest = self.shared.lock();
        if !interest.suspended || interest.shut_down {
            return;
        }
        interest.suspended = false;
        info!(event = "timeline_resumed", count = interest.count);
        if interest.may_connect() {
            self.shared.control.start();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }

    // final: nothing starts or nudges the connection afterwards
    pub(crate) fn shut_down(&self) {
        let mut interest = self.shared.lock();
        interest.shut_down = true;
        info!(event = "timeline_shut_down", count = interest.count);
        self.shared.control.stop();
    }

    fn nudge_if_wanted(&self, signal: &'static str) {
        let interest = self.shared.lock();
        if interest.may_connect() {
            debug!(event = "reconnect_signal", signal);
            self.shared.control.nudge();
        }
    }
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interest = self.shared.lock();
        f.debug_struct("LifecycleCoordinator")
            .field("interest", &interest.count)
            .field("suspended", &interest.suspended)
            .field("shut_down", &interest.shut_down)
            .finish()
    }
}

#[must_use = "dropping the handle releases the interest immediately"]
pub struct InterestHandle {
    owner: Option<Arc<Shared>>,
}

impl fmt::Debug for InterestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterestHandle")
            .field("held", &self.owner.is_some())
            .finish()
    }
}

impl Drop for InterestHandle {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release_one();
        }
    }
}
