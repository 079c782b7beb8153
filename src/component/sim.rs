//! In-process simulated component
//!
//! Acknowledges commands and completes buffers from its own worker thread,
//! the way real firmware calls back from its own context. Faults can be
//! injected and every call is logged for inspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    BufferDone, BufferHeader, Command, Component, ComponentCallbacks, ComponentEvent,
    ComponentState, FocusStatus, HwResult, Parameter, PortGeometry, PortId, Setting,
};
use crate::capture::bracketing::ShotRecord;
use crate::capture::frame::CameraBuffer;
use crate::error::HwError;
use crate::SimConfig;

/// One logged call into the component
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Command(Command),
    Parameter(Parameter),
    Config(Setting),
    UseBuffer(PortId, u64),
    FreeBuffer(BufferHeader),
    Fill(BufferHeader),
    Empty(BufferHeader),
    Release,
}

enum Action {
    Event(ComponentEvent),
    Done(BufferDone),
    Exit,
}

struct Shared {
    config: SimConfig,
    epoch: Instant,
    callbacks: Mutex<Option<Arc<dyn ComponentCallbacks>>>,
    calls: Mutex<Vec<Call>>,
    state: Mutex<ComponentState>,
    enabled: Mutex<HashSet<PortId>>,
    geometry: Mutex<HashMap<PortId, PortGeometry>>,
    headers: Mutex<HashMap<u64, PortId>>,
    held: Mutex<HashMap<PortId, VecDeque<BufferHeader>>>,
    shots: Mutex<Vec<ShotRecord>>,
    dropped_acks: Mutex<Vec<Command>>,
    focus_result: Mutex<FocusStatus>,
    focus: Mutex<FocusStatus>,
    next_id: AtomicU64,
    auto_complete: AtomicBool,
    shutter_callback: AtomicBool,
    suppress_shutter: AtomicBool,
    capturing: AtomicBool,
    bracketing: AtomicBool,
    snapshot_pending: AtomicBool,
    released: AtomicBool,
    double_frees: AtomicUsize,
}

impl Shared {
    fn log(&self, call: Call) {
        trace!(?call, "sim call");
        self.calls.lock().push(call);
    }

    fn check_released(&self) -> HwResult<()> {
        if self.released.load(Ordering::Acquire) {
            Err(HwError::Released)
        } else {
            Ok(())
        }
    }

    fn is_executing(&self) -> bool {
        *self.state.lock() == ComponentState::Executing
    }

    /// Image port produces only while a capture or bracketing runs
    fn port_producing(&self, port: PortId) -> bool {
        match port {
            PortId::Image => {
                self.capturing.load(Ordering::Acquire) || self.bracketing.load(Ordering::Acquire)
            }
            _ => true,
        }
    }

    fn completion(&self, header: BufferHeader) -> BufferDone {
        let filled_len = self
            .geometry
            .lock()
            .get(&header.port)
            .map(|g| g.buffer_size as u32)
            .unwrap_or(0);
        BufferDone {
            header,
            filled_len,
            offset: 0,
            timestamp: Some(self.epoch.elapsed()),
            snapshot: false,
        }
    }
}

pub struct SimComponent {
    shared: Arc<Shared>,
    tx: flume::Sender<Action>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimComponent {
    pub fn new(config: SimConfig) -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            auto_complete: AtomicBool::new(config.auto_complete),
            config,
            epoch: Instant::now(),
            callbacks: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(ComponentState::Loaded),
            enabled: Mutex::new([PortId::Preview, PortId::Measurement].into_iter().collect()),
            geometry: Mutex::new(HashMap::new()),
            headers: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            shots: Mutex::new(Vec::new()),
            dropped_acks: Mutex::new(Vec::new()),
            focus_result: Mutex::new(FocusStatus::Locked),
            focus: Mutex::new(FocusStatus::Idle),
            next_id: AtomicU64::new(1),
            shutter_callback: AtomicBool::new(false),
            suppress_shutter: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            bracketing: AtomicBool::new(false),
            snapshot_pending: AtomicBool::new(false),
            released: AtomicBool::new(false),
            double_frees: AtomicUsize::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("sim-component".into())
            .spawn(move || run_worker(worker_shared, rx))
            .ok();

        Arc::new(Self {
            shared,
            tx,
            worker: Mutex::new(worker),
        })
    }

    fn post(&self, action: Action) {
        let _ = self.tx.send(action);
    }

    /// Swallow the acknowledgement of every future `command`
    pub fn drop_acks_for(&self, command: Command) {
        self.shared.dropped_acks.lock().push(command);
    }

    pub fn clear_faults(&self) {
        self.shared.dropped_acks.lock().clear();
        self.shared.suppress_shutter.store(false, Ordering::Release);
    }

    /// Report an unrecoverable hardware fault
    pub fn inject_hardware_fault(&self) {
        self.post(Action::Event(ComponentEvent::hardware_fault()));
    }

    pub fn suppress_shutter(&self, suppress: bool) {
        self.shared.suppress_shutter.store(suppress, Ordering::Release);
    }

    pub fn set_auto_complete(&self, auto: bool) {
        self.shared.auto_complete.store(auto, Ordering::Release);
    }

    pub fn set_focus_result(&self, status: FocusStatus) {
        *self.shared.focus_result.lock() = status;
    }

    /// Complete the oldest buffer the hardware holds on `port`
    pub fn complete_next(&self, port: PortId) -> bool {
        let header = self
            .shared
            .held
            .lock()
            .get_mut(&port)
            .and_then(|q| q.pop_front());
        match header {
            Some(header) => {
                self.post(Action::Done(self.shared.completion(header)));
                true
            }
            None => false,
        }
    }

    pub fn held_count(&self, port: PortId) -> usize {
        self.shared.held.lock().get(&port).map_or(0, |q| q.len())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.shared.calls.lock().len()
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.shared.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn shot_queue(&self) -> Vec<ShotRecord> {
        self.shared.shots.lock().clone()
    }

    pub fn live_headers(&self, port: PortId) -> usize {
        self.shared
            .headers
            .lock()
            .values()
            .filter(|&&p| p == port)
            .count()
    }

    pub fn double_frees(&self) -> usize {
        self.shared.double_frees.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ComponentState {
        *self.shared.state.lock()
    }

    fn acknowledge(&self, command: Command) {
        let dropped = self.shared.dropped_acks.lock().contains(&command);
        if dropped {
            debug!(?command, "acknowledgement dropped");
            return;
        }
        self.post(Action::Event(ComponentEvent::cmd_complete(command)));
    }

    /// Hand held buffers of producing ports to the worker
    fn release_held(&self) {
        if !self.shared.auto_complete.load(Ordering::Acquire) || !self.shared.is_executing() {
            return;
        }
        let ready: Vec<BufferHeader> = {
            let mut held = self.shared.held.lock();
            held.iter_mut()
                .filter(|(port, _)| self.shared.port_producing(**port))
                .flat_map(|(_, q)| q.drain(..))
                .collect()
        };
        for header in ready {
            self.post(Action::Done(self.shared.completion(header)));
        }
    }
}

impl Drop for SimComponent {
    fn drop(&mut self) {
        let _ = self.tx.send(Action::Exit);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: Arc<Shared>, rx: flume::Receiver<Action>) {
    let ack_delay = Duration::from_millis(shared.config.ack_delay_ms);
    let frame_interval = Duration::from_millis(shared.config.frame_interval_ms);

    while let Ok(action) = rx.recv() {
        let callbacks = shared.callbacks.lock().clone();
        match action {
            Action::Exit => break,
            Action::Event(event) => {
                thread::sleep(ack_delay);
                if let Some(cb) = callbacks {
                    cb.on_event(event);
                }
            }
            Action::Done(mut done) => {
                thread::sleep(frame_interval);
                let live = shared.headers.lock().contains_key(&done.header.id);
                if !live || !shared.is_executing() {
                    trace!(id = done.header.id, "stale completion dropped");
                    continue;
                }
                // first preview frame out after the capture trigger
                if done.header.port == PortId::Preview {
                    done.snapshot = shared.snapshot_pending.swap(false, Ordering::AcqRel);
                }
                if let Some(cb) = callbacks {
                    cb.on_buffer_done(done);
                }
            }
        }
    }
    debug!("sim worker exiting");
}

impl Component for SimComponent {
    fn register_callbacks(&self, callbacks: Arc<dyn ComponentCallbacks>) {
        *self.shared.callbacks.lock() = Some(callbacks);
    }

    fn send_command(&self, command: Command) -> HwResult<()> {
        self.shared.log(Call::Command(command));
        self.shared.check_released()?;
        match command {
            Command::StateSet(next) => {
                let prev = std::mem::replace(&mut *self.shared.state.lock(), next);
                if prev == ComponentState::Executing && next != ComponentState::Executing {
                    // hardware hands everything back on the way down
                    self.shared.held.lock().clear();
                    self.shared.capturing.store(false, Ordering::Release);
                    self.shared.bracketing.store(false, Ordering::Release);
                    self.shared.snapshot_pending.store(false, Ordering::Release);
                }
                if next == ComponentState::Loaded {
                    *self.shared.enabled.lock() =
                        [PortId::Preview, PortId::Measurement].into_iter().collect();
                }
                self.acknowledge(command);
                if next == ComponentState::Executing {
                    self.release_held();
                }
            }
            Command::PortEnable(port) => {
                self.shared.enabled.lock().insert(port);
                self.acknowledge(command);
            }
            Command::PortDisable(port) | Command::Flush(port) => {
                if matches!(command, Command::PortDisable(_)) {
                    self.shared.enabled.lock().remove(&port);
                }
                self.shared.held.lock().remove(&port);
                self.acknowledge(command);
            }
        }
        Ok(())
    }

    fn set_parameter(&self, param: Parameter) -> HwResult<()> {
        self.shared.log(Call::Parameter(param.clone()));
        self.shared.check_released()?;
        if let Parameter::PortFormat { port, mut geometry } = param {
            let loaded = *self.shared.state.lock() == ComponentState::Loaded;
            if !loaded && self.shared.enabled.lock().contains(&port) {
                return Err(HwError::IncorrectState);
            }
            if geometry.width == 0 || geometry.height == 0 {
                return Err(HwError::BadParameter);
            }
            let align = self.shared.config.stride_align.max(1);
            let line = geometry.format.line_bytes(geometry.width);
            geometry.stride = line.div_ceil(align) * align;
            geometry.buffer_size = geometry.format.buffer_size(geometry.stride, geometry.height);
            self.shared.geometry.lock().insert(port, geometry);
        }
        Ok(())
    }

    fn set_config(&self, setting: Setting) -> HwResult<()> {
        self.shared.log(Call::Config(setting.clone()));
        self.shared.check_released()?;
        match setting {
            Setting::Capturing(on) => {
                self.shared.capturing.store(on, Ordering::Release);
                if on {
                    self.shared.snapshot_pending.store(true, Ordering::Release);
                    if self.shared.shutter_callback.load(Ordering::Acquire)
                        && !self.shared.suppress_shutter.load(Ordering::Acquire)
                    {
                        self.post(Action::Event(ComponentEvent::shutter()));
                    }
                    self.release_held();
                }
            }
            Setting::ShutterCallback(on) => self.shared.shutter_callback.store(on, Ordering::Release),
            Setting::TemporalBracketing { enable, .. } => {
                self.shared.bracketing.store(enable, Ordering::Release);
                if enable {
                    self.release_held();
                }
            }
            Setting::EnqueueShots { records, flush } => {
                let mut shots = self.shared.shots.lock();
                if flush {
                    shots.clear();
                }
                if shots.len() + records.len() > self.shared.config.shot_capacity {
                    return Err(HwError::InsufficientResources);
                }
                shots.extend(records);
            }
            Setting::ResetShotQueue => self.shared.shots.lock().clear(),
            Setting::FocusTrigger(on) => {
                if on {
                    *self.shared.focus.lock() = *self.shared.focus_result.lock();
                    self.post(Action::Event(ComponentEvent::focus_status()));
                } else {
                    *self.shared.focus.lock() = FocusStatus::Idle;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn port_definition(&self, port: PortId) -> HwResult<PortGeometry> {
        self.shared.check_released()?;
        self.shared
            .geometry
            .lock()
            .get(&port)
            .copied()
            .ok_or(HwError::BadParameter)
    }

    fn available_shots(&self) -> HwResult<usize> {
        self.shared.check_released()?;
        let used = self.shared.shots.lock().len();
        Ok(self.shared.config.shot_capacity.saturating_sub(used))
    }

    fn focus_status(&self) -> HwResult<FocusStatus> {
        self.shared.check_released()?;
        Ok(*self.shared.focus.lock())
    }

    fn use_buffer(&self, port: PortId, buffer: &CameraBuffer) -> HwResult<BufferHeader> {
        self.shared.log(Call::UseBuffer(port, buffer.handle()));
        self.shared.check_released()?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.headers.lock().insert(id, port);
        Ok(BufferHeader { id, port })
    }

    fn free_buffer(&self, header: BufferHeader) -> HwResult<()> {
        self.shared.log(Call::FreeBuffer(header));
        self.shared.check_released()?;
        if self.shared.headers.lock().remove(&header.id).is_none() {
            self.shared.double_frees.fetch_add(1, Ordering::AcqRel);
            return Err(HwError::BadParameter);
        }
        if let Some(q) = self.shared.held.lock().get_mut(&header.port) {
            q.retain(|h| *h != header);
        }
        Ok(())
    }

    fn fill_this_buffer(&self, header: BufferHeader) -> HwResult<()> {
        self.shared.log(Call::Fill(header));
        self.shared.check_released()?;
        if !self.shared.headers.lock().contains_key(&header.id) {
            return Err(HwError::BadParameter);
        }
        let auto = self.shared.auto_complete.load(Ordering::Acquire);
        if auto && self.shared.is_executing() && self.shared.port_producing(header.port) {
            self.post(Action::Done(self.shared.completion(header)));
        } else {
            self.shared
                .held
                .lock()
                .entry(header.port)
                .or_default()
                .push_back(header);
        }
        Ok(())
    }

    fn empty_this_buffer(&self, header: BufferHeader) -> HwResult<()> {
        self.shared.log(Call::Empty(header));
        self.shared.check_released()?;
        if !self.shared.headers.lock().contains_key(&header.id) {
            return Err(HwError::BadParameter);
        }
        // input buffers are consumed at once
        self.post(Action::Done(BufferDone {
            header,
            filled_len: 0,
            offset: 0,
            timestamp: Some(self.shared.epoch.elapsed()),
            snapshot: false,
        }));
        Ok(())
    }

    fn release_handle(&self) -> HwResult<()> {
        self.shared.log(Call::Release);
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return Err(HwError::Released);
        }
        self.shared.held.lock().clear();
        Ok(())
    }
}
