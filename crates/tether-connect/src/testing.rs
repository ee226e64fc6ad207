//! In-memory transport for exercising the connection layer without a network
//!
//! [`MockTransport`] hands out [`MockHandle`]s whose connectivity follows a
//! scripted [`DialBehavior`]. Tests can force a handle into any state with
//! [`MockHandle::set_state`] and inspect dial and close counts afterwards.

use crate::error::ConnectError;
use crate::transport::{ConnectivityState, Transport, TransportHandle};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_core_resilience::CallContext;
use tokio::sync::watch;

/// How a dialed handle behaves once `connect` is called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialBehavior {
    /// Ready immediately
    Ready,
    /// Connecting, then Ready after the delay
    ReadyAfter(Duration),
    /// Connecting, then TransientFailure after the delay
    FailAfter(Duration),
    /// Connecting forever
    Hang,
    /// `dial` itself fails
    Reject,
}

#[derive(Debug, Default)]
struct Dials {
    script: VecDeque<DialBehavior>,
    handles: Vec<MockHandle>,
}

/// Scriptable in-memory [`Transport`]
#[derive(Debug)]
pub struct MockTransport {
    default: Mutex<DialBehavior>,
    dials: Mutex<Dials>,
    dial_count: AtomicUsize,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// Every dial connects immediately
    pub fn new() -> Self {
        Self::with_behavior(DialBehavior::Ready)
    }

    pub fn with_behavior(behavior: DialBehavior) -> Self {
        Self {
            default: Mutex::new(behavior),
            dials: Mutex::new(Dials::default()),
            dial_count: AtomicUsize::new(0),
        }
    }

    /// Behavior for dials with nothing scripted
    pub fn set_default(&self, behavior: DialBehavior) {
        *lock(&self.default) = behavior;
    }

    /// Script the behavior of the next unscripted dial
    pub fn push_behavior(&self, behavior: DialBehavior) {
        lock(&self.dials).script.push_back(behavior);
    }

    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }

    /// Every handle dialed so far, oldest first
    pub fn handles(&self) -> Vec<MockHandle> {
        lock(&self.dials).handles.clone()
    }

    /// Handles that have not been closed
    pub fn open_handles(&self) -> usize {
        lock(&self.dials)
            .handles
            .iter()
            .filter(|handle| !handle.is_closed())
            .count()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn dial(&self, target: &str) -> Result<MockHandle, ConnectError> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);

        let mut dials = lock(&self.dials);
        let behavior = match dials.script.pop_front() {
            Some(behavior) => behavior,
            None => *lock(&self.default),
        };

        if behavior == DialBehavior::Reject {
            return Err(ConnectError::Dial {
                target: target.to_string(),
                reason: "dial rejected".to_string(),
            });
        }

        let handle = MockHandle::new(target, behavior);
        dials.handles.push(handle.clone());
        Ok(handle)
    }
}

#[derive(Debug)]
struct HandleShared {
    target: String,
    behavior: DialBehavior,
    state: watch::Sender<ConnectivityState>,
    close_calls: AtomicUsize,
}

/// Handle produced by [`MockTransport`]; clones observe the same connection
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<HandleShared>,
}

impl MockHandle {
    fn new(target: &str, behavior: DialBehavior) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        Self {
            shared: Arc::new(HandleShared {
                target: target.to_string(),
                behavior,
                state,
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Force a state transition
    pub fn set_state(&self, state: ConnectivityState) {
        self.shared.state.send_replace(state);
    }

    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    fn transition_after(&self, delay: Duration, next: ConnectivityState) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.state.send_if_modified(|state| {
                if *state == ConnectivityState::Connecting {
                    *state = next;
                    true
                } else {
                    false
                }
            });
        });
    }
}

#[async_trait::async_trait]
impl TransportHandle for MockHandle {
    fn target(&self) -> &str {
        &self.shared.target
    }

    fn connect(&self) {
        if self.state() != ConnectivityState::Idle {
            return;
        }

        match self.shared.behavior {
            DialBehavior::Ready => self.set_state(ConnectivityState::Ready),
            DialBehavior::ReadyAfter(delay) => {
                self.set_state(ConnectivityState::Connecting);
                self.transition_after(delay, ConnectivityState::Ready);
            }
            DialBehavior::FailAfter(delay) => {
                self.set_state(ConnectivityState::Connecting);
                self.transition_after(delay, ConnectivityState::TransientFailure);
            }
            DialBehavior::Hang => self.set_state(ConnectivityState::Connecting),
            DialBehavior::Reject => {}
        }
    }

    fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    async fn wait_for_state_change(&self, ctx: &CallContext, last: ConnectivityState) -> bool {
        let mut rx = self.shared.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != last {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = ctx.done() => return false,
            }
        }
    }

    async fn close(&self) -> Result<(), ConnectError> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectivityState::Shutdown);
        Ok(())
    }
}
