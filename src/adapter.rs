//! Public camera adapter
//!
//! `CameraAdapter` is the caller-facing surface. All mutable state lives in
//! `Core`, shared by reference with the command and callback threads; each
//! subsystem keeps its own lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::bracketing::shot_count;
use crate::capture::frame::{CameraBuffer, Frame, FrameMetadata, FrameType, PixelFormat};
use crate::capture::sequencer::{CaptureParams, CapturePhase, CaptureSequencer};
use crate::component::{
    BufferDone, Component, ComponentEvent, ComponentState, FocusStatus, Parameter, PortGeometry,
    PortId, Setting,
};
use crate::error::{AdapterError, HwError, Result};
use crate::params::{diff, Parameters};
use crate::pipeline::dispatch::{
    spawn_callback_thread, spawn_command_thread, CallbackBridge, CallbackMsg, CommandMsg,
    Notification, Notifier,
};
use crate::pipeline::ports::{PortCounts, PortRegistry};
use crate::pipeline::rendezvous::{EventKey, EventRendezvous};
use crate::pipeline::settings::{CaptureSettings, PreviewSettings, Settings3A, SettingsApplier};
use crate::pipeline::state::{ComponentStatus, StateMachine};
use crate::{AdapterConfig, Counters, Metrics};

struct GateState {
    count: i64,
    open: bool,
}

/// First-frame gate: capture and autofocus wait until preview is warm
pub(crate) struct FrameGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl FrameGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                count: 0,
                open: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// The first frame after a start is discarded from the count
    fn arm(&self) {
        let mut s = self.state.lock();
        s.count = -1;
        s.open = true;
    }

    fn frame_arrived(&self) {
        let mut s = self.state.lock();
        s.count += 1;
        if s.count == 1 {
            self.cond.notify_all();
        }
    }

    fn close(&self) {
        let mut s = self.state.lock();
        s.count = 0;
        s.open = false;
        self.cond.notify_all();
    }

    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock();
        loop {
            if !s.open {
                return Err(AdapterError::invalid_state("preview stopped"));
            }
            if s.count >= 1 {
                return Ok(());
            }
            if self.cond.wait_until(&mut s, deadline).timed_out() {
                return if s.open && s.count >= 1 {
                    Ok(())
                } else {
                    Err(AdapterError::timeout("first preview frame"))
                };
            }
        }
    }
}

/// Adapter-wide context shared with the worker threads
pub(crate) struct Core {
    pub(crate) config: AdapterConfig,
    pub(crate) component: Arc<dyn Component>,
    pub(crate) status: Arc<ComponentStatus>,
    pub(crate) rendezvous: Arc<EventRendezvous>,
    pub(crate) machine: StateMachine,
    pub(crate) ports: Arc<PortRegistry>,
    pub(crate) settings: SettingsApplier,
    pub(crate) sequencer: CaptureSequencer,
    pub(crate) notifier: Notifier,
    pub(crate) counters: Arc<Counters>,
    params: ArcSwap<Parameters>,
    params_lock: Mutex<()>,
    frame_gate: FrameGate,
    preview_active: AtomicBool,
    capture_requested: AtomicBool,
    sequence: AtomicU64,
    commands: flume::Sender<CommandMsg>,
    callbacks: flume::Sender<CallbackMsg>,
}

impl Core {
    pub(crate) fn capture_requested(&self) -> bool {
        self.capture_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_capture_requested(&self) {
        self.capture_requested.store(false, Ordering::Release);
    }

    fn preview_active(&self) -> bool {
        self.preview_active.load(Ordering::Acquire)
    }

    /// Queue from a non-caller thread; a full queue loses the command
    pub(crate) fn post(&self, msg: CommandMsg) {
        if let Err(e) = self.commands.try_send(msg) {
            match e {
                flume::TrySendError::Full(_) => error!("command queue full"),
                flume::TrySendError::Disconnected(_) => debug!("command thread gone"),
            }
        }
    }

    /// Queue from a caller thread
    fn submit(&self, msg: CommandMsg) -> Result<()> {
        self.commands
            .send(msg)
            .map_err(|_| AdapterError::invalid_state("command thread stopped"))
    }

    /// Wait until every callback queued so far has been handled
    fn flush_callbacks(&self) {
        let (tx, rx) = flume::bounded(1);
        if self.callbacks.send(CallbackMsg::Flush(tx)).is_ok()
            && rx.recv_timeout(self.config.command_timeout()).is_err()
        {
            warn!("callback queue flush timed out");
        }
    }

    fn apply_3a(&self) {
        let params = self.params.load();
        let report = self
            .settings
            .apply_3a(&params.three_a, self.component.as_ref());
        if !report.is_clean() {
            warn!(failures = report.failures.len(), "some 3A settings failed");
        }
    }

    /// IDLE -> FILL and hand the buffer to the hardware
    pub(crate) fn queue_buffer(&self, port: PortId, slot: usize) -> Result<()> {
        let header = self.ports.queue(port, slot)?;
        let result = if port.is_output() {
            self.component.fill_this_buffer(header)
        } else {
            self.component.empty_this_buffer(header)
        };
        if let Err(e) = result {
            self.ports.unqueue(port, slot);
            if e == HwError::Hardware {
                self.machine.cleanup_after_error(e.into());
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Port formats are legal in Loaded or on a disabled port
    fn ensure_configurable(&self, port: PortId) -> Result<()> {
        self.machine.ensure_usable()?;
        let state = self.machine.state();
        if state != ComponentState::Loaded && self.ports.is_enabled(port) {
            return Err(AdapterError::invalid_state(format!(
                "configure {port:?} while {state:?} with the port enabled"
            )));
        }
        Ok(())
    }

    /// Negotiate a port format and record what the hardware picked
    fn configure_port(&self, port: PortId, requested: PortGeometry) -> Result<PortGeometry> {
        self.ensure_configurable(port)?;
        self.issue_port_format(port, requested)
    }

    fn issue_port_format(&self, port: PortId, requested: PortGeometry) -> Result<PortGeometry> {
        self.component.set_parameter(Parameter::PortFormat {
            port,
            geometry: requested,
        })?;
        let negotiated = self.component.port_definition(port)?;
        self.ports.set_geometry(port, negotiated)?;
        debug!(?port, ?negotiated, "port configured");
        Ok(negotiated)
    }

    fn image_geometry(params: &Parameters, count: usize) -> PortGeometry {
        let p = &params.picture;
        PortGeometry::new(p.width, p.height, p.format, count)
    }

    /// Configure the image port with load-time capture settings; disables
    /// it first when it is enabled
    fn configure_image_port(&self, params: &Parameters, count: usize) -> Result<PortGeometry> {
        if self.ports.is_enabled(PortId::Image) {
            self.machine.disable_port(PortId::Image)?;
        }
        self.ensure_configurable(PortId::Image)?;
        self.settings.take_capture(CaptureSettings::FORMAT);
        let geometry = self.issue_port_format(PortId::Image, Self::image_geometry(params, count))?;
        self.settings
            .apply_capture(CaptureSettings::LOAD_TIME, params, self.component.as_ref())
            .into_result()?;
        Ok(geometry)
    }

    fn prepare_image_port(
        &self,
        params: &Parameters,
        buffers: &[CameraBuffer],
        max_queueable: usize,
    ) -> Result<()> {
        self.configure_image_port(params, buffers.len())?;
        self.ports.bind(PortId::Image, buffers, max_queueable)?;
        self.machine.enable_port(PortId::Image)
    }

    /// Re-run image port setup over the current pool after a load-time
    /// capture setting changed
    pub(crate) fn reconfigure_image_port(&self, params: &Parameters) -> Result<()> {
        let buffers = self.ports.buffers(PortId::Image);
        if buffers.is_empty() {
            return Err(AdapterError::invalid_state("no image buffers"));
        }
        let max = self.ports.max_queueable(PortId::Image);
        info!("reconfiguring image port");
        self.prepare_image_port(params, &buffers, max)
    }

    /// Hand a completed buffer upstream. Streaming frames are recycled at
    /// once when the consumer is behind; still images and reprocess output
    /// wait up to the capture timeout. Returns whether the consumer got it.
    pub(crate) fn deliver(
        &self,
        port: PortId,
        slot: usize,
        buffer: CameraBuffer,
        frame_type: FrameType,
        done: Option<&BufferDone>,
    ) -> bool {
        let geometry = self.ports.geometry(port).unwrap_or_default();
        if buffer.ref_count() == 0 {
            buffer.set_refs(1);
        }
        let meta = FrameMetadata {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            port,
            slot,
            width: geometry.width,
            height: geometry.height,
            stride: geometry.stride,
            format: geometry.format,
            offset: done.map_or(0, |d| d.offset),
            filled_len: done.map_or(geometry.buffer_size as u32, |d| d.filled_len),
            device_timestamp: done.and_then(|d| d.timestamp),
        };
        let frame = Frame {
            buffer,
            frame_type,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        };
        let sent = match frame_type {
            FrameType::Image | FrameType::ReprocessInput => self
                .notifier
                .frame_within(frame, self.config.capture_timeout()),
            _ => self.notifier.frame(frame),
        };
        match sent {
            Ok(()) => {
                self.counters.frame_delivered();
                true
            }
            Err(frame) => {
                self.counters.frame_dropped();
                if frame_type == FrameType::Image {
                    warn!(?port, slot, "consumer stalled, still image dropped");
                } else {
                    debug!(?port, slot, "consumer busy, frame recycled");
                }
                drop(frame);
                if let Err(e) = self.return_buffer(port, slot) {
                    debug!(?port, slot, error = %e, "recycle failed");
                }
                false
            }
        }
    }

    /// DONE -> IDLE and requeue when the port still streams
    fn return_buffer(&self, port: PortId, slot: usize) -> Result<()> {
        if !self.ports.release(port, slot)? {
            return Ok(());
        }
        match port {
            PortId::Image => self.sequencer.on_image_returned(self, slot),
            PortId::ReprocessInput => Ok(()),
            _ => {
                if !self.preview_active() || !self.ports.is_enabled(port) {
                    return Ok(());
                }
                match self.queue_buffer(port, slot) {
                    Err(AdapterError::ResourceExhausted(_)) => Ok(()),
                    other => other,
                }
            }
        }
    }

    pub(crate) fn on_buffer_done(&self, done: BufferDone) {
        let port = done.header.port;
        let (slot, buffer) = match self.ports.complete(done.header) {
            Ok(found) => found,
            Err(e) => {
                debug!(?port, error = %e, "stale completion ignored");
                return;
            }
        };
        self.counters.frame_received();

        match port {
            PortId::Preview => self.on_preview_frame(slot, buffer, &done),
            PortId::Image => self.sequencer.on_image_buffer(self, slot, buffer, &done),
            PortId::Measurement | PortId::Video => {
                if !self.preview_active() {
                    let _ = self.ports.release(port, slot);
                    return;
                }
                let frame_type = if port == PortId::Video {
                    FrameType::Raw
                } else {
                    FrameType::FrameData
                };
                self.deliver(port, slot, buffer, frame_type, Some(&done));
            }
            PortId::ReprocessInput => {
                self.deliver(port, slot, buffer, FrameType::ReprocessInput, Some(&done));
            }
        }
    }

    fn on_preview_frame(&self, slot: usize, buffer: CameraBuffer, done: &BufferDone) {
        if !self.preview_active() {
            let _ = self.ports.release(PortId::Preview, slot);
            return;
        }
        self.frame_gate.frame_arrived();

        let frame_type = if done.snapshot && self.sequencer.waiting_for_snapshot() {
            self.sequencer.on_snapshot(self)
        } else {
            FrameType::Preview
        };
        if !self.sequencer.in_flight() && !self.settings.pending_3a().is_empty() {
            self.apply_3a();
        }
        self.deliver(PortId::Preview, slot, buffer, frame_type, Some(done));
    }

    pub(crate) fn on_focus_status(&self) {
        match self.component.focus_status() {
            Ok(FocusStatus::Locked) => self.notifier.notify(Notification::Focus { locked: true }),
            Ok(FocusStatus::Failed) => self.notifier.notify(Notification::Focus { locked: false }),
            Ok(status) => debug!(?status, "focus still settling"),
            Err(e) => warn!(error = %e, "focus status unavailable"),
        }
    }

    pub(crate) fn on_fault(&self) {
        error!("hardware fault, releasing component");
        self.preview_active.store(false, Ordering::Release);
        self.clear_capture_requested();
        self.frame_gate.close();
        self.machine.release_handle();
    }

    pub(crate) fn run_capture(&self, params: CaptureParams) {
        if let Err(e) = self.sequencer.start_image_capture(self, params) {
            error!(error = %e, "capture failed");
            self.clear_capture_requested();
            self.notifier
                .notify(Notification::CaptureFailed { error: e });
        }
    }

    pub(crate) fn finish_capture(&self) {
        self.sequencer.stop_image_capture(self);
    }

    pub(crate) fn run_auto_focus(&self) {
        if let Err(e) = self.start_auto_focus() {
            warn!(error = %e, "autofocus failed");
            self.notifier.notify(Notification::Focus { locked: false });
        }
    }

    fn start_auto_focus(&self) -> Result<()> {
        self.machine.ensure_usable()?;
        if !self.preview_active() {
            return Err(AdapterError::invalid_state("autofocus without preview"));
        }
        if !self.sequencer.in_flight() {
            self.apply_3a();
        }
        self.component.set_config(Setting::FocusCallback(true))?;
        self.component.set_config(Setting::FocusTrigger(true))?;
        debug!("autofocus triggered");
        Ok(())
    }
}

/// Camera adapter driving one hardware component
pub struct CameraAdapter {
    core: Arc<Core>,
    frames: flume::Receiver<Frame>,
    events: flume::Receiver<Notification>,
    command_thread: Option<JoinHandle<()>>,
    callback_thread: Option<JoinHandle<()>>,
}

impl CameraAdapter {
    pub fn new(component: Arc<dyn Component>, config: AdapterConfig) -> Result<Self> {
        let (frame_tx, frames) = flume::bounded(config.frame_queue.max(1));
        let (event_tx, events) = flume::bounded(config.notification_queue.max(1));
        let (cmd_tx, cmd_rx) = flume::bounded(config.command_queue.max(1));
        let (cb_tx, cb_rx) = flume::bounded(config.callback_queue.max(1));

        let notifier = Notifier::new(frame_tx, event_tx);
        let rendezvous = Arc::new(EventRendezvous::new(vec![EventKey::of(
            &ComponentEvent::focus_status(),
        )]));
        let status = Arc::new(ComponentStatus::new(
            Arc::clone(&rendezvous),
            notifier.clone(),
        ));
        let ports = Arc::new(PortRegistry::new());
        let counters = Arc::new(Counters::default());
        let machine = StateMachine::new(
            Arc::clone(&component),
            Arc::clone(&status),
            Arc::clone(&rendezvous),
            Arc::clone(&ports),
            Arc::clone(&counters),
            config.command_timeout(),
            config.transition_retries,
        );
        let settings = SettingsApplier::default();
        settings.mark_all();

        let core = Arc::new(Core {
            config,
            component: Arc::clone(&component),
            status: Arc::clone(&status),
            rendezvous: Arc::clone(&rendezvous),
            machine,
            ports,
            settings,
            sequencer: CaptureSequencer::default(),
            notifier,
            counters,
            params: ArcSwap::from_pointee(Parameters::default()),
            params_lock: Mutex::new(()),
            frame_gate: FrameGate::new(),
            preview_active: AtomicBool::new(false),
            capture_requested: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            commands: cmd_tx,
            callbacks: cb_tx.clone(),
        });

        component.register_callbacks(Arc::new(CallbackBridge::new(status, rendezvous, cb_tx)));

        let spawn_err =
            |e: std::io::Error| AdapterError::ResourceExhausted(format!("worker thread: {e}"));
        let command_thread = spawn_command_thread(Arc::clone(&core), cmd_rx).map_err(spawn_err)?;
        let callback_thread = spawn_callback_thread(Arc::clone(&core), cb_rx).map_err(spawn_err)?;

        info!("camera adapter ready");
        Ok(Self {
            core,
            frames,
            events,
            command_thread: Some(command_thread),
            callback_thread: Some(callback_thread),
        })
    }

    /// Frames delivered by the adapter
    pub fn frames(&self) -> flume::Receiver<Frame> {
        self.frames.clone()
    }

    /// Shutter, focus, capture and error notifications
    pub fn events(&self) -> flume::Receiver<Notification> {
        self.events.clone()
    }

    pub fn component_state(&self) -> ComponentState {
        self.core.machine.state()
    }

    pub fn is_preview_active(&self) -> bool {
        self.core.preview_active()
    }

    pub fn capture_phase(&self) -> CapturePhase {
        self.core.sequencer.phase()
    }

    pub fn port_counts(&self, port: PortId) -> PortCounts {
        self.core.ports.counts(port)
    }

    pub fn metrics(&self) -> Metrics {
        self.core.counters.snapshot()
    }

    pub fn parameters(&self) -> Parameters {
        Parameters::clone(&self.core.params.load())
    }

    /// Validate and adopt a parameter set; changed axes become pending
    #[instrument(skip_all)]
    pub fn set_parameters(&self, params: Parameters) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        let params = params.normalized();
        params.validate(core.config.max_bracket_entries)?;

        let _guard = core.params_lock.lock();
        let old = core.params.load_full();
        let d = diff(&old, &params);
        core.settings.mark_capture(d.capture);
        core.settings.mark_preview(d.preview);
        core.settings.mark_3a(d.three_a);
        core.params.store(Arc::new(params));
        if d.preview_geometry && core.preview_active() {
            info!("preview geometry takes effect on the next preview buffer setup");
        }
        debug!(capture = ?d.capture, preview = ?d.preview, three_a = ?d.three_a, "parameters updated");
        Ok(())
    }

    /// Hand a buffer pool to one port
    #[instrument(skip(self, buffers), fields(count = buffers.len()))]
    pub fn use_buffers(&self, port: PortId, buffers: &[CameraBuffer], max_queueable: usize) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        if buffers.is_empty() {
            return Err(AdapterError::BadValue(format!("no buffers for {port:?}")));
        }
        let params = core.params.load_full();
        match port {
            PortId::Preview => self.use_preview_buffers(&params, buffers, max_queueable),
            PortId::Measurement => {
                self.require_state(&[ComponentState::Loaded], "measurement buffers")?;
                let p = &params.preview;
                let geometry = PortGeometry::new(
                    (p.width / 4).max(1),
                    (p.height / 4).max(1),
                    PixelFormat::Yuyv,
                    buffers.len(),
                );
                core.configure_port(PortId::Measurement, geometry)?;
                core.ports.bind(PortId::Measurement, buffers, max_queueable)
            }
            PortId::Image => {
                self.require_state(
                    &[ComponentState::Idle, ComponentState::Executing],
                    "image buffers",
                )?;
                if core.sequencer.phase() != CapturePhase::Idle || core.sequencer.is_bracketing() {
                    return Err(AdapterError::invalid_state("capture in progress"));
                }
                core.prepare_image_port(&params, buffers, max_queueable)
            }
            PortId::Video | PortId::ReprocessInput => {
                self.require_state(
                    &[ComponentState::Idle, ComponentState::Executing],
                    "raw/reprocess buffers",
                )?;
                if core.ports.is_enabled(port) {
                    core.machine.disable_port(port)?;
                }
                let p = &params.picture;
                let format = if port == PortId::Video {
                    PixelFormat::Raw10
                } else {
                    PixelFormat::Nv12
                };
                core.configure_port(port, PortGeometry::new(p.width, p.height, format, buffers.len()))?;
                core.ports.bind(port, buffers, max_queueable)?;
                core.machine.enable_port(port)?;
                if port == PortId::Video && core.preview_active() {
                    self.queue_all(port);
                }
                Ok(())
            }
        }
    }

    fn require_state(&self, allowed: &[ComponentState], what: &str) -> Result<()> {
        let state = self.core.machine.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(AdapterError::invalid_state(format!("{what} while {state:?}")))
        }
    }

    fn use_preview_buffers(
        &self,
        params: &Parameters,
        buffers: &[CameraBuffer],
        max_queueable: usize,
    ) -> Result<()> {
        let core = &self.core;
        self.require_state(&[ComponentState::Loaded], "preview buffers")?;
        let p = &params.preview;

        let report = core
            .settings
            .apply_preview(PreviewSettings::LOAD_TIME, params, core.component.as_ref());
        if !report.is_clean() {
            warn!(failures = report.failures.len(), "load-time preview settings failed");
        }

        let mut requested = PortGeometry::new(p.width, p.height, p.format, buffers.len());
        requested.min_fps = p.min_fps;
        requested.max_fps = p.max_fps;
        core.configure_port(PortId::Preview, requested)?;
        core.ports.bind(PortId::Preview, buffers, max_queueable)?;

        let mut ports = vec![PortId::Preview];
        if p.measurement {
            if !core.ports.has_buffers(PortId::Measurement) {
                return Err(AdapterError::invalid_state(
                    "measurement enabled without measurement buffers",
                ));
            }
            ports.push(PortId::Measurement);
        }
        core.machine.load_to_idle(&ports)
    }

    /// Queue every idle slot of `port` up to its queue bound
    fn queue_all(&self, port: PortId) -> usize {
        let max = self.core.ports.max_queueable(port);
        let mut queued = 0;
        for slot in self.core.ports.idle_slots(port).into_iter().take(max) {
            match self.core.queue_buffer(port, slot) {
                Ok(()) => queued += 1,
                Err(e) => {
                    warn!(?port, slot, error = %e, "initial queue failed");
                    break;
                }
            }
        }
        queued
    }

    #[instrument(skip(self))]
    pub fn start_preview(&self) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        if core.preview_active() {
            return Ok(());
        }
        let state = core.machine.state();
        if state == ComponentState::Loaded {
            return Err(AdapterError::invalid_state(
                "preview buffers must be set up before starting preview",
            ));
        }

        let params = core.params.load_full();
        let report = core
            .settings
            .apply_preview(PreviewSettings::RUNTIME, &params, core.component.as_ref());
        if !report.is_clean() {
            warn!(failures = report.failures.len(), "runtime preview settings failed");
        }
        core.apply_3a();

        core.machine.switch_to_executing()?;
        core.frame_gate.arm();
        core.preview_active.store(true, Ordering::Release);

        let queued = self.queue_all(PortId::Preview);
        let measurement = if core.ports.is_enabled(PortId::Measurement) {
            self.queue_all(PortId::Measurement)
        } else {
            0
        };
        if core.ports.is_enabled(PortId::Video) {
            self.queue_all(PortId::Video);
        }
        info!(queued, measurement, "preview started");
        Ok(())
    }

    /// Stop preview and bring the component back to Loaded; idempotent
    #[instrument(skip(self))]
    pub fn stop_preview(&self) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        let was_active = core.preview_active.swap(false, Ordering::AcqRel);
        if !was_active && core.machine.state() == ComponentState::Loaded {
            debug!("preview already stopped");
            return Ok(());
        }

        if core.capture_requested() || core.sequencer.phase() != CapturePhase::Idle {
            core.clear_capture_requested();
            core.sequencer.interrupt(core);
            core.sequencer.stop_image_capture(core);
        }
        if core.sequencer.is_bracketing() {
            if let Err(e) = core.sequencer.stop_bracketing(core) {
                warn!(error = %e, "bracketing stop failed");
            }
        }
        core.frame_gate.close();

        let result = core.machine.switch_to_loaded();
        core.flush_callbacks();
        core.sequence.store(0, Ordering::Relaxed);
        match &result {
            Ok(()) => info!("preview stopped"),
            Err(e) => error!(error = %e, "preview stop failed"),
        }
        result
    }

    /// Negotiated preview geometry
    pub fn get_frame_size(&self) -> Result<PortGeometry> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        if let Some(geometry) = core.ports.geometry(PortId::Preview) {
            return Ok(geometry);
        }
        let params = core.params.load_full();
        let p = &params.preview;
        let requested = PortGeometry::new(p.width, p.height, p.format, 1);
        core.configure_port(PortId::Preview, requested)
    }

    /// Image buffer size for `count` buffers, applying pending load-time
    /// capture settings first
    #[instrument(skip(self))]
    pub fn get_picture_buffer_size(&self, count: usize) -> Result<PortGeometry> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        if core.sequencer.phase() != CapturePhase::Idle || core.sequencer.is_bracketing() {
            return Err(AdapterError::invalid_state("capture in progress"));
        }
        let params = core.params.load_full();
        let pending = core.settings.pending_capture() & CaptureSettings::LOAD_TIME;
        match core.ports.geometry(PortId::Image) {
            Some(geometry) if pending.is_empty() && geometry.buffer_count == count => Ok(geometry),
            _ => core.configure_image_port(&params, count),
        }
    }

    #[instrument(skip(self))]
    pub fn take_picture(&self) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        if !core.preview_active() {
            return Err(AdapterError::invalid_state("take_picture without preview"));
        }
        if !core.ports.is_enabled(PortId::Image) {
            return Err(AdapterError::invalid_state("image buffers not set up"));
        }
        if core.capture_requested() {
            return Err(AdapterError::invalid_state("capture already in progress"));
        }
        core.frame_gate
            .wait_ready(core.config.capture_timeout() * 2)?;

        let params = core.params.load_full();
        let entries = params.bracket_entries()?;
        if entries.len() > core.config.max_bracket_entries {
            return Err(AdapterError::ResourceExhausted(format!(
                "{} bracketing entries",
                entries.len()
            )));
        }
        let cached = CaptureParams {
            mode: params.preview.capture_mode,
            frames: shot_count(&entries, params.picture.burst),
            rotation: params.picture.rotation,
            entries,
            pending: core.settings.pending_capture(),
            params,
        };
        if core.capture_requested.swap(true, Ordering::AcqRel) {
            return Err(AdapterError::invalid_state("capture already in progress"));
        }
        info!(frames = cached.frames, "capture requested");
        let submitted = core.submit(CommandMsg::StartCapture(Box::new(cached)));
        if submitted.is_err() {
            core.clear_capture_requested();
        }
        submitted
    }

    #[instrument(skip(self))]
    pub fn cancel_picture(&self) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        core.clear_capture_requested();
        core.sequencer.interrupt(core);
        core.sequencer.stop_image_capture(core);
        Ok(())
    }

    /// Start temporal bracketing over `range` image buffers
    pub fn start_bracketing(&self, range: usize) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        if !core.preview_active() {
            return Err(AdapterError::invalid_state("bracketing without preview"));
        }
        core.sequencer.start_bracketing(core, range)
    }

    pub fn stop_bracketing(&self) -> Result<()> {
        self.core.machine.ensure_usable()?;
        self.core.sequencer.stop_bracketing(&self.core)
    }

    #[instrument(skip(self))]
    pub fn auto_focus(&self) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        if !core.preview_active() {
            return Err(AdapterError::invalid_state("autofocus without preview"));
        }
        core.frame_gate
            .wait_ready(core.config.capture_timeout() * 2)?;
        core.submit(CommandMsg::AutoFocus)
    }

    #[instrument(skip(self))]
    pub fn cancel_auto_focus(&self) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        core.component.set_config(Setting::FocusTrigger(false))?;
        core.settings.mark_3a(Settings3A::FOCUS);
        if core.preview_active() && !core.sequencer.in_flight() {
            core.apply_3a();
        }
        Ok(())
    }

    /// Return a delivered frame's buffer to the adapter
    pub fn fill_this_buffer(&self, buffer: &CameraBuffer, frame_type: FrameType) -> Result<()> {
        let core = &self.core;
        core.machine.ensure_usable()?;
        let port = frame_type.port();
        let slot = core.ports.find(port, buffer).ok_or_else(|| {
            AdapterError::BadValue(format!("buffer {} not bound to {port:?}", buffer.handle()))
        })?;

        if port == PortId::ReprocessInput {
            core.ports.release(port, slot)?;
            return core.queue_buffer(port, slot);
        }
        if buffer.release_ref() > 0 {
            return Ok(());
        }
        core.return_buffer(port, slot)
    }
}

impl Drop for CameraAdapter {
    fn drop(&mut self) {
        if !self.core.status.is_invalid() {
            if let Err(e) = self.stop_preview() {
                warn!(error = %e, "stop on drop failed");
            }
        }
        let _ = self.core.commands.send(CommandMsg::Exit);
        let _ = self.core.callbacks.send(CallbackMsg::Exit);
        for handle in [self.command_thread.take(), self.callback_thread.take()]
            .into_iter()
            .flatten()
        {
            let _ = handle.join();
        }
        self.core.machine.release_handle();
        debug!("camera adapter dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::SimComponent;
    use crate::SimConfig;
    use std::thread;

    fn sim_adapter(shot_capacity: usize) -> CameraAdapter {
        let sim = SimComponent::new(SimConfig {
            frame_interval_ms: 2,
            shot_capacity,
            ..SimConfig::default()
        });
        let config = AdapterConfig {
            command_timeout_ms: 200,
            capture_timeout_ms: 500,
            ..AdapterConfig::default()
        };
        CameraAdapter::new(sim, config).unwrap()
    }

    #[test]
    fn gate_skips_first_frame() {
        let gate = FrameGate::new();
        gate.arm();
        gate.frame_arrived();
        assert!(matches!(
            gate.wait_ready(Duration::from_millis(20)),
            Err(AdapterError::Timeout(_))
        ));
        gate.frame_arrived();
        assert!(gate.wait_ready(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn closed_gate_refuses_waiters() {
        let gate = Arc::new(FrameGate::new());
        gate.arm();
        let g = Arc::clone(&gate);
        let t = thread::spawn(move || g.wait_ready(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(20));
        gate.close();
        assert!(matches!(t.join().unwrap(), Err(AdapterError::InvalidState(_))));
    }

    #[test]
    fn format_bit_survives_rejected_port_configure() {
        let adapter = sim_adapter(32);
        let core = &adapter.core;
        assert!(core.settings.pending_capture().contains(CaptureSettings::FORMAT));

        core.status
            .invalidate(AdapterError::HardwareInvalid("test fault".into()));
        assert!(core
            .configure_image_port(&Parameters::default(), 2)
            .is_err());
        assert!(core.settings.pending_capture().contains(CaptureSettings::FORMAT));
    }

    #[test]
    fn shot_queue_bit_survives_rejected_capture() {
        let adapter = sim_adapter(2);
        let events = adapter.events();

        let preview = adapter.get_frame_size().unwrap();
        let pool = CameraBuffer::pool(1, 4, preview.buffer_size);
        adapter.use_buffers(PortId::Preview, &pool, 0).unwrap();
        adapter.start_preview().unwrap();
        let picture = adapter.get_picture_buffer_size(2).unwrap();
        let images = CameraBuffer::pool(100, 2, picture.buffer_size);
        adapter.use_buffers(PortId::Image, &images, 0).unwrap();

        let mut params = adapter.parameters();
        params.picture.bracketing = "-1,0,1".into();
        adapter.set_parameters(params).unwrap();
        adapter.take_picture().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match events.recv_deadline(deadline) {
                Ok(Notification::CaptureFailed { error }) => {
                    assert!(matches!(error, AdapterError::ResourceExhausted(_)), "{error:?}");
                    break;
                }
                Ok(Notification::CaptureComplete { .. }) => panic!("capture should fail"),
                Ok(_) => continue,
                Err(e) => panic!("no capture outcome: {e}"),
            }
        }
        let pending = adapter.core.settings.pending_capture();
        assert!(pending.contains(CaptureSettings::BURST_EXP_BRACKET), "{pending:?}");
        assert!(!adapter.core.settings.is_frozen());
    }
}
