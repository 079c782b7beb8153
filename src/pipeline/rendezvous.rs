//! Rendezvous for asynchronous component acknowledgements
//!
//! A caller registers the event it expects *before* issuing the command that
//! triggers it, then blocks on the returned [`Waiter`]. The callback path
//! calls [`EventRendezvous::signal`] which releases the first matching
//! registration in arrival order. Zero ids in a registration are wildcards.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::component::{Command, ComponentEvent, EventKind};
use crate::error::{AdapterError, Result};

/// What a registration waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKey {
    pub kind: EventKind,
    pub primary: u32,
    pub secondary: u32,
}

impl EventKey {
    pub fn new(kind: EventKind, primary: u32, secondary: u32) -> Self {
        Self {
            kind,
            primary,
            secondary,
        }
    }

    /// Completion of `command`
    pub fn completion(command: Command) -> Self {
        let ev = ComponentEvent::cmd_complete(command);
        Self::new(ev.kind, ev.data1, ev.data2)
    }

    pub fn of(event: &ComponentEvent) -> Self {
        Self::new(event.kind, event.data1, event.data2)
    }

    pub fn matches(&self, event: &ComponentEvent) -> bool {
        self.kind == event.kind
            && (self.primary == 0 || self.primary == event.data1)
            && (self.secondary == 0 || self.secondary == event.data2)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#x}, {:#x})", self.kind, self.primary, self.secondary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Signalled,
    Aborted,
}

/// Result of delivering an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A waiter was released
    Matched,
    /// Nobody waited, but the event goes to a dedicated handler
    Redirected,
    Dropped,
}

struct Pending {
    id: u64,
    key: EventKey,
    tx: flume::Sender<Wake>,
}

pub struct EventRendezvous {
    pending: Mutex<VecDeque<Pending>>,
    next_id: AtomicU64,
    redirects: Vec<EventKey>,
    aborted: AtomicBool,
}

impl EventRendezvous {
    /// `redirects` lists events forwarded to a handler when unmatched
    pub fn new(redirects: Vec<EventKey>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            redirects,
            aborted: AtomicBool::new(false),
        }
    }

    pub fn register(self: &Arc<Self>, key: EventKey) -> Waiter {
        let (tx, rx) = flume::bounded(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if self.aborted.load(Ordering::Acquire) {
                let _ = tx.send(Wake::Aborted);
            } else {
                pending.push_back(Pending { id, key, tx });
            }
        }
        trace!(%key, id, "registered");
        Waiter {
            id,
            key,
            rx,
            owner: Arc::clone(self),
        }
    }

    pub fn signal(&self, event: &ComponentEvent) -> SignalOutcome {
        let matched = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|p| p.key.matches(event))
                .and_then(|i| pending.remove(i))
        };
        if let Some(p) = matched {
            debug!(key = %p.key, id = p.id, "signalled");
            let _ = p.tx.send(Wake::Signalled);
            return SignalOutcome::Matched;
        }
        if self.redirects.iter().any(|k| k.matches(event)) {
            SignalOutcome::Redirected
        } else {
            trace!(key = %EventKey::of(event), "no waiter, dropped");
            SignalOutcome::Dropped
        }
    }

    /// Remove the oldest registration for exactly `key` without signalling
    pub fn cancel(&self, key: EventKey) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|p| p.key == key) {
            Some(i) => {
                pending.remove(i);
                true
            }
            None => false,
        }
    }

    fn cancel_id(&self, id: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|p| p.id == id) {
            Some(i) => {
                pending.remove(i);
                true
            }
            None => false,
        }
    }

    /// Release every waiter with an abort; later registrations abort at once
    pub fn abort_all(&self) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock();
            self.aborted.store(true, Ordering::Release);
            pending.drain(..).collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "aborting pending waiters");
        }
        for p in drained {
            let _ = p.tx.send(Wake::Aborted);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Handle for one registration; dropping it without waiting cancels it
pub struct Waiter {
    id: u64,
    key: EventKey,
    rx: flume::Receiver<Wake>,
    owner: Arc<EventRendezvous>,
}

impl Waiter {
    pub fn key(&self) -> EventKey {
        self.key
    }

    pub fn wait(self, timeout: Duration) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(wake) => self.resolve(wake),
            Err(flume::RecvTimeoutError::Timeout) => {
                if self.owner.cancel_id(self.id) {
                    warn!(key = %self.key, ?timeout, "acknowledgement timed out");
                    return Err(AdapterError::timeout(self.key.to_string()));
                }
                // signal raced the timeout and already removed the record
                match self.rx.try_recv() {
                    Ok(wake) => self.resolve(wake),
                    Err(_) => Err(AdapterError::timeout(self.key.to_string())),
                }
            }
            // record cancelled; aborts always arrive as an explicit wake
            Err(flume::RecvTimeoutError::Disconnected) => {
                debug!(key = %self.key, "registration cancelled");
                Err(AdapterError::timeout(self.key.to_string()))
            }
        }
    }

    fn resolve(&self, wake: Wake) -> Result<()> {
        match wake {
            Wake::Signalled => Ok(()),
            Wake::Aborted => Err(AdapterError::HardwareInvalid(format!(
                "aborted while waiting for {}",
                self.key
            ))),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.owner.cancel_id(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentState, ALL_PORTS, INDEX_FOCUS_STATUS};
    use std::thread;

    const SHORT: Duration = Duration::from_millis(30);

    fn idle_ack() -> ComponentEvent {
        ComponentEvent::cmd_complete(Command::StateSet(ComponentState::Idle))
    }

    #[test]
    fn one_signal_releases_exactly_the_first_of_identical_waiters() {
        let rv = Arc::new(EventRendezvous::new(Vec::new()));
        let key = EventKey::completion(Command::StateSet(ComponentState::Idle));
        let first = rv.register(key);
        let second = rv.register(key);
        let third = rv.register(key);
        assert_eq!(rv.pending_len(), 3);

        assert_eq!(rv.signal(&idle_ack()), SignalOutcome::Matched);
        assert_eq!(rv.pending_len(), 2);

        assert!(first.wait(SHORT).is_ok());
        assert!(matches!(second.wait(SHORT), Err(AdapterError::Timeout(_))));
        assert_eq!(rv.pending_len(), 1);
        drop(third);
        assert_eq!(rv.pending_len(), 0);
    }

    #[test]
    fn zero_ids_are_wildcards() {
        let rv = Arc::new(EventRendezvous::new(Vec::new()));
        let any_cmd = rv.register(EventKey::new(EventKind::CmdComplete, 0, 0));
        let exact = rv.register(EventKey::new(EventKind::CmdComplete, 1, 3));

        let executing = ComponentEvent::cmd_complete(Command::StateSet(ComponentState::Executing));
        assert_eq!(rv.signal(&executing), SignalOutcome::Matched);
        assert!(any_cmd.wait(SHORT).is_ok());
        assert_eq!(rv.signal(&idle_ack()), SignalOutcome::Dropped);
        assert_eq!(rv.signal(&executing), SignalOutcome::Matched);
        assert!(exact.wait(SHORT).is_ok());
    }

    #[test]
    fn unmatched_well_known_event_is_redirected() {
        let focus = EventKey::new(EventKind::SettingChanged, ALL_PORTS, INDEX_FOCUS_STATUS);
        let rv = Arc::new(EventRendezvous::new(vec![focus]));
        assert_eq!(
            rv.signal(&ComponentEvent::focus_status()),
            SignalOutcome::Redirected
        );
        let w = rv.register(focus);
        assert_eq!(rv.signal(&ComponentEvent::focus_status()), SignalOutcome::Matched);
        assert!(w.wait(SHORT).is_ok());
        assert_eq!(rv.signal(&ComponentEvent::shutter()), SignalOutcome::Dropped);
    }

    #[test]
    fn cancel_removes_without_signalling() {
        let rv = Arc::new(EventRendezvous::new(Vec::new()));
        let key = EventKey::completion(Command::StateSet(ComponentState::Idle));
        let w = rv.register(key);
        assert!(rv.cancel(key));
        assert!(!rv.cancel(key));
        assert_eq!(rv.signal(&idle_ack()), SignalOutcome::Dropped);
        assert!(matches!(w.wait(SHORT), Err(AdapterError::Timeout(_))));
    }

    #[test]
    fn cancel_while_blocked_is_not_fatal() {
        let rv = Arc::new(EventRendezvous::new(Vec::new()));
        let key = EventKey::completion(Command::StateSet(ComponentState::Idle));
        let w = rv.register(key);
        let rv2 = Arc::clone(&rv);
        let t = thread::spawn(move || w.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        assert!(rv2.cancel(key));
        let res = t.join().unwrap();
        assert!(matches!(res, Err(AdapterError::Timeout(_))), "{res:?}");
    }

    #[test]
    fn abort_unblocks_waiters_and_future_registrations() {
        let rv = Arc::new(EventRendezvous::new(Vec::new()));
        let key = EventKey::completion(Command::StateSet(ComponentState::Idle));
        let w = rv.register(key);
        let rv2 = Arc::clone(&rv);
        let t = thread::spawn(move || w.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        rv2.abort_all();
        assert!(matches!(t.join().unwrap(), Err(AdapterError::HardwareInvalid(_))));

        let late = rv.register(key);
        assert_eq!(rv.pending_len(), 0);
        assert!(matches!(late.wait(SHORT), Err(AdapterError::HardwareInvalid(_))));
    }

    #[test]
    fn signal_from_another_thread_wakes_waiter() {
        let rv = Arc::new(EventRendezvous::new(Vec::new()));
        let w = rv.register(EventKey::completion(Command::StateSet(ComponentState::Idle)));
        let rv2 = Arc::clone(&rv);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            rv2.signal(&idle_ack())
        });
        assert!(w.wait(Duration::from_secs(2)).is_ok());
        assert_eq!(t.join().unwrap(), SignalOutcome::Matched);
        assert_eq!(rv.pending_len(), 0);
    }
}
