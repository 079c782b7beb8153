//! Component lifecycle: Loaded -> Idle -> Executing and back, plus the
//! absorbing Invalid state
//!
//! Every edge follows the same protocol: register the expected
//! acknowledgement, send the command, (de)allocate port buffers, then wait
//! with a bounded timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::component::{Command, Component, ComponentState, PortId};
use crate::error::{AdapterError, Result, Severity};
use crate::pipeline::dispatch::{Notification, Notifier};
use crate::pipeline::ports::PortRegistry;
use crate::pipeline::rendezvous::{EventKey, EventRendezvous};
use crate::Counters;

/// Current component state, shared with the callback bridge
pub struct ComponentStatus {
    state: Mutex<ComponentState>,
    invalid: AtomicBool,
    rendezvous: Arc<EventRendezvous>,
    notifier: Notifier,
}

impl ComponentStatus {
    pub fn new(rendezvous: Arc<EventRendezvous>, notifier: Notifier) -> Self {
        Self {
            state: Mutex::new(ComponentState::Loaded),
            invalid: AtomicBool::new(false),
            rendezvous,
            notifier,
        }
    }

    pub fn get(&self) -> ComponentState {
        *self.state.lock()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    fn commit(&self, next: ComponentState) {
        let mut state = self.state.lock();
        if *state != ComponentState::Invalid {
            debug!(from = ?*state, to = ?next, "state committed");
            *state = next;
        }
    }

    /// Enter Invalid, abort every waiter and report a fatal error.
    /// Returns false if the component was already invalid.
    pub fn invalidate(&self, cause: AdapterError) -> bool {
        if self.invalid.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.lock() = ComponentState::Invalid;
        error!(%cause, "component invalid");
        metrics::counter!("camera_adapter_invalidations_total").increment(1);
        self.rendezvous.abort_all();
        self.notifier.notify(Notification::Error {
            severity: Severity::Fatal,
            error: AdapterError::HardwareInvalid(cause.to_string()),
        });
        true
    }
}

pub struct StateMachine {
    component: Arc<dyn Component>,
    status: Arc<ComponentStatus>,
    rendezvous: Arc<EventRendezvous>,
    ports: Arc<PortRegistry>,
    counters: Arc<Counters>,
    switch_lock: Mutex<()>,
    released: AtomicBool,
    timeout: Duration,
    retries: u32,
}

impl StateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        component: Arc<dyn Component>,
        status: Arc<ComponentStatus>,
        rendezvous: Arc<EventRendezvous>,
        ports: Arc<PortRegistry>,
        counters: Arc<Counters>,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            component,
            status,
            rendezvous,
            ports,
            counters,
            switch_lock: Mutex::new(()),
            released: AtomicBool::new(false),
            timeout,
            retries,
        }
    }

    pub fn state(&self) -> ComponentState {
        self.status.get()
    }

    /// Reject everything once the component is invalid
    pub fn ensure_usable(&self) -> Result<()> {
        if self.status.is_invalid() {
            return Err(AdapterError::invalid_state("component is invalid"));
        }
        Ok(())
    }

    fn ensure_in(&self, expected: &[ComponentState], op: &str) -> Result<ComponentState> {
        self.ensure_usable()?;
        let state = self.state();
        if expected.contains(&state) {
            Ok(state)
        } else {
            Err(AdapterError::invalid_state(format!("{op} while {state:?}")))
        }
    }

    /// register -> send -> side effect -> wait, retrying plain timeouts
    fn run_command(&self, command: Command, side: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut side = Some(side);
        let mut attempt = 0;
        loop {
            let waiter = self.rendezvous.register(EventKey::completion(command));
            if let Err(e) = self.component.send_command(command) {
                drop(waiter);
                return Err(self.fail(command, e.into()));
            }
            if let Some(side) = side.take() {
                if let Err(e) = side() {
                    drop(waiter);
                    return Err(self.fail(command, e));
                }
            }
            match waiter.wait(self.timeout) {
                Ok(()) => return Ok(()),
                Err(AdapterError::Timeout(what)) if attempt < self.retries => {
                    attempt += 1;
                    self.counters.timeout();
                    warn!(?command, attempt, %what, "no acknowledgement, resending");
                }
                Err(e) => {
                    if matches!(e, AdapterError::Timeout(_)) {
                        self.counters.timeout();
                    }
                    return Err(self.fail(command, e));
                }
            }
        }
    }

    fn fail(&self, command: Command, cause: AdapterError) -> AdapterError {
        error!(?command, %cause, "state protocol failed");
        self.cleanup_after_error(cause.clone());
        cause
    }

    /// Release the component and go Invalid
    pub fn cleanup_after_error(&self, cause: AdapterError) {
        self.status.invalidate(cause);
        self.release_handle();
    }

    pub fn release_handle(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.component.release_handle() {
            warn!(error = %e, "releasing component handle failed");
        }
    }

    fn allocate(&self, ports: &[PortId]) -> Result<()> {
        for &port in ports {
            for (slot, buffer) in self.ports.buffers(port).iter().enumerate() {
                let header = self.component.use_buffer(port, buffer)?;
                self.ports.attach_header(port, slot, header)?;
            }
            debug!(?port, "buffers registered with component");
        }
        Ok(())
    }

    /// Free every registered header of `port`; headers are detached first so
    /// a repeated call frees nothing
    fn free(&self, port: PortId) -> Result<()> {
        let mut first_err = None;
        for header in self.ports.take_headers(port) {
            if let Err(e) = self.component.free_buffer(header) {
                warn!(?port, id = header.id, error = %e, "free_buffer failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Loaded -> Idle; every port in `ports` must be configured and bound
    #[instrument(skip(self))]
    pub fn load_to_idle(&self, ports: &[PortId]) -> Result<()> {
        let _guard = self.switch_lock.lock();
        self.ensure_in(&[ComponentState::Loaded], "load_to_idle")?;
        for &port in ports {
            if self.ports.geometry(port).is_none() || !self.ports.has_buffers(port) {
                return Err(AdapterError::invalid_state(format!(
                    "{port:?} must be configured and bound before leaving Loaded"
                )));
            }
        }

        self.run_command(Command::StateSet(ComponentState::Idle), || {
            self.allocate(ports)
        })?;
        for &port in ports {
            self.ports.set_enabled(port, true);
        }
        self.status.commit(ComponentState::Idle);
        self.counters.transition();
        info!(?ports, "component idle");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn idle_to_executing(&self) -> Result<()> {
        let _guard = self.switch_lock.lock();
        self.ensure_in(&[ComponentState::Idle], "idle_to_executing")?;
        self.to_executing()
    }

    fn to_executing(&self) -> Result<()> {
        self.run_command(Command::StateSet(ComponentState::Executing), || Ok(()))?;
        self.status.commit(ComponentState::Executing);
        self.counters.transition();
        info!("component executing");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn executing_to_idle(&self) -> Result<()> {
        let _guard = self.switch_lock.lock();
        self.ensure_in(&[ComponentState::Executing], "executing_to_idle")?;
        self.to_idle()
    }

    fn to_idle(&self) -> Result<()> {
        self.run_command(Command::StateSet(ComponentState::Idle), || Ok(()))?;
        for port in PortId::ALL {
            let reclaimed = self.ports.reclaim_in_flight(port);
            if reclaimed > 0 {
                debug!(?port, reclaimed, "buffers returned by hardware");
            }
        }
        self.status.commit(ComponentState::Idle);
        self.counters.transition();
        info!("component idle");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn idle_to_loaded(&self) -> Result<()> {
        let _guard = self.switch_lock.lock();
        self.ensure_in(&[ComponentState::Idle], "idle_to_loaded")?;
        self.to_loaded()
    }

    fn to_loaded(&self) -> Result<()> {
        let bound: Vec<PortId> = PortId::ALL
            .into_iter()
            .filter(|&p| self.ports.is_bound(p))
            .collect();
        self.run_command(Command::StateSet(ComponentState::Loaded), || {
            let mut result = Ok(());
            for &port in &bound {
                if let Err(e) = self.free(port) {
                    result = result.and(Err(e));
                }
            }
            result
        })?;
        for port in PortId::ALL {
            self.ports.set_enabled(port, false);
            self.ports.unbind(port);
        }
        self.status.commit(ComponentState::Loaded);
        self.counters.transition();
        info!(?bound, "component loaded");
        Ok(())
    }

    /// Bring the component down to Loaded from wherever it is
    #[instrument(skip(self))]
    pub fn switch_to_loaded(&self) -> Result<()> {
        let _guard = self.switch_lock.lock();
        self.ensure_usable()?;
        match self.state() {
            ComponentState::Executing => {
                self.to_idle()?;
                self.to_loaded()
            }
            ComponentState::Idle => self.to_loaded(),
            ComponentState::Loaded => Ok(()),
            ComponentState::Invalid => Err(AdapterError::invalid_state("component is invalid")),
        }
    }

    /// Idle -> Executing; no-op when already executing
    pub fn switch_to_executing(&self) -> Result<()> {
        let _guard = self.switch_lock.lock();
        match self.ensure_in(
            &[ComponentState::Idle, ComponentState::Executing],
            "switch_to_executing",
        )? {
            ComponentState::Executing => Ok(()),
            _ => self.to_executing(),
        }
    }

    /// Port enable sub-protocol; the port must be bound and not registered
    #[instrument(skip(self))]
    pub fn enable_port(&self, port: PortId) -> Result<()> {
        let _guard = self.switch_lock.lock();
        self.ensure_in(
            &[ComponentState::Idle, ComponentState::Executing],
            "enable_port",
        )?;
        if self.ports.is_enabled(port) {
            return Err(AdapterError::invalid_state(format!("{port:?} already enabled")));
        }
        if !self.ports.has_buffers(port) {
            return Err(AdapterError::invalid_state(format!("{port:?} has no buffers bound")));
        }
        self.run_command(Command::PortEnable(port), || self.allocate(&[port]))?;
        self.ports.set_enabled(port, true);
        info!(?port, "port enabled");
        Ok(())
    }

    /// Port disable sub-protocol; a disabled port loses its settings
    #[instrument(skip(self))]
    pub fn disable_port(&self, port: PortId) -> Result<()> {
        let _guard = self.switch_lock.lock();
        self.ensure_usable()?;
        if !self.ports.is_enabled(port) {
            return Ok(());
        }
        if self.state() == ComponentState::Loaded {
            self.ports.set_enabled(port, false);
            return Ok(());
        }
        self.run_command(Command::PortDisable(port), || self.free(port))?;
        self.ports.set_enabled(port, false);
        self.ports.unbind(port);
        info!(?port, "port disabled");
        Ok(())
    }

    /// Return every buffer the hardware holds on `port`
    #[instrument(skip(self))]
    pub fn flush_port(&self, port: PortId) -> Result<usize> {
        let _guard = self.switch_lock.lock();
        self.ensure_in(
            &[ComponentState::Idle, ComponentState::Executing],
            "flush_port",
        )?;
        self.run_command(Command::Flush(port), || Ok(()))?;
        Ok(self.ports.reclaim_in_flight(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentCallbacks, ComponentEvent, SimComponent};
    use crate::SimConfig;

    struct Forward(Arc<EventRendezvous>);

    impl ComponentCallbacks for Forward {
        fn on_event(&self, event: ComponentEvent) {
            self.0.signal(&event);
        }

        fn on_buffer_done(&self, _done: crate::component::BufferDone) {}
    }

    fn machine(sim: &Arc<SimComponent>) -> (StateMachine, flume::Receiver<Notification>) {
        let (frames, _) = flume::bounded(1);
        let (events_tx, events) = flume::bounded(8);
        let rendezvous = Arc::new(EventRendezvous::new(Vec::new()));
        let status = Arc::new(ComponentStatus::new(
            Arc::clone(&rendezvous),
            Notifier::new(frames, events_tx),
        ));
        sim.register_callbacks(Arc::new(Forward(Arc::clone(&rendezvous))));
        let component: Arc<dyn Component> = sim.clone();
        let machine = StateMachine::new(
            component,
            status,
            rendezvous,
            Arc::new(PortRegistry::new()),
            Arc::new(Counters::default()),
            Duration::from_millis(100),
            0,
        );
        (machine, events)
    }

    #[test]
    fn unconfigured_port_never_reaches_hardware() {
        let sim = SimComponent::new(SimConfig::default());
        let (machine, _events) = machine(&sim);
        assert!(matches!(
            machine.load_to_idle(&[PortId::Preview]),
            Err(AdapterError::InvalidState(_))
        ));
        assert_eq!(sim.call_count(), 0);
        assert_eq!(machine.state(), ComponentState::Loaded);
    }

    #[test]
    fn lost_ack_goes_invalid_once() {
        let sim = SimComponent::new(SimConfig::default());
        sim.drop_acks_for(Command::StateSet(ComponentState::Executing));
        let (machine, events) = machine(&sim);
        machine.status.commit(ComponentState::Idle);

        assert!(matches!(
            machine.idle_to_executing(),
            Err(AdapterError::Timeout(_))
        ));
        assert_eq!(machine.state(), ComponentState::Invalid);
        assert!(sim.is_released());

        machine.cleanup_after_error(AdapterError::timeout("again"));
        let fatal = events
            .try_iter()
            .filter(|n| matches!(n, Notification::Error { severity: Severity::Fatal, .. }))
            .count();
        assert_eq!(fatal, 1);
        assert_eq!(
            sim.count_calls(|c| *c == crate::component::sim::Call::Release),
            1
        );
        assert!(matches!(
            machine.switch_to_loaded(),
            Err(AdapterError::InvalidState(_))
        ));
    }

    #[test]
    fn disabling_a_disabled_port_is_a_no_op() {
        let sim = SimComponent::new(SimConfig::default());
        let (machine, _events) = machine(&sim);
        machine.disable_port(PortId::Image).unwrap();
        assert_eq!(sim.call_count(), 0);
    }
}
