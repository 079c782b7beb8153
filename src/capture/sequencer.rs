//! Multi-shot capture sequencing
//!
//! Per capture: Idle -> Configuring -> Queued -> Capturing -> Draining -> Idle.
//! Start and stop run under the capture lock. The burst counters and the
//! bracketing state each have their own lock so image completions on the
//! callback thread never wait on a capture in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::Core;
use crate::capture::bracketing::{
    build_shot_queue, remaining_after_interrupt, BracketEntry, BracketingState, ShotRecord,
};
use crate::capture::frame::{CameraBuffer, FrameType};
use crate::component::{BufferDone, ComponentEvent, PortId, Setting};
use crate::error::{AdapterError, Result};
use crate::params::{CaptureMode, Parameters};
use crate::pipeline::dispatch::{CommandMsg, Notification};
use crate::pipeline::rendezvous::EventKey;
use crate::pipeline::settings::CaptureSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapturePhase {
    Idle,
    Configuring,
    Queued,
    Capturing,
    Draining,
}

/// How a capture ended, decides what gets reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopOutcome {
    /// Frames drained or the caller cancelled
    Completed,
    /// The caller gets `CaptureFailed` instead
    Failed,
}

/// Capture-affecting state frozen when a capture request is accepted
#[derive(Debug, Clone)]
pub struct CaptureParams {
    pub mode: CaptureMode,
    pub frames: u32,
    pub rotation: u32,
    pub entries: Vec<BracketEntry>,
    /// Pending capture bits at acceptance
    pub pending: CaptureSettings,
    pub params: Arc<Parameters>,
}

#[derive(Debug, Default)]
struct BurstCounters {
    /// Frames still expected
    captured: u32,
    /// Frames handed to the hardware
    accum: u32,
    /// Frames delivered
    queued: u32,
    /// Requeue limit for `accum`
    limit: u32,
}

pub struct CaptureSequencer {
    phase: Mutex<CapturePhase>,
    capture_lock: Mutex<()>,
    burst: Mutex<BurstCounters>,
    bracketing: Mutex<BracketingState>,
    mode: Mutex<CaptureMode>,
    waiting_for_snapshot: AtomicBool,
    /// Passive-shutter capture that has not announced its shutter yet
    shutter_pending: AtomicBool,
    cancelled: AtomicBool,
    capture_signalled: AtomicBool,
    done_tx: flume::Sender<()>,
    done_rx: flume::Receiver<()>,
}

impl Default for CaptureSequencer {
    fn default() -> Self {
        let (done_tx, done_rx) = flume::bounded(1);
        Self {
            phase: Mutex::new(CapturePhase::Idle),
            capture_lock: Mutex::new(()),
            burst: Mutex::new(BurstCounters::default()),
            bracketing: Mutex::new(BracketingState::default()),
            mode: Mutex::new(CaptureMode::default()),
            waiting_for_snapshot: AtomicBool::new(false),
            shutter_pending: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            capture_signalled: AtomicBool::new(false),
            done_tx,
            done_rx,
        }
    }
}

impl CaptureSequencer {
    pub fn phase(&self) -> CapturePhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: CapturePhase) {
        let mut p = self.phase.lock();
        debug!(from = ?*p, to = ?phase, "capture phase");
        *p = phase;
    }

    /// A capture owns the component; 3A must not be touched
    pub fn in_flight(&self) -> bool {
        self.phase() >= CapturePhase::Configuring
    }

    pub fn is_bracketing(&self) -> bool {
        self.bracketing.lock().is_enabled()
    }

    pub fn waiting_for_snapshot(&self) -> bool {
        self.waiting_for_snapshot.load(Ordering::Acquire)
    }

    /// Run one capture up to the point where frames drain on their own
    #[instrument(skip_all, fields(frames = params.frames, mode = ?params.mode))]
    pub(crate) fn start_image_capture(&self, core: &Core, params: CaptureParams) -> Result<()> {
        let _guard = self.capture_lock.lock();
        // a cancel clears the request before raising the flag
        self.cancelled.store(false, Ordering::Release);
        if !core.capture_requested() {
            debug!("capture cancelled before start");
            return Ok(());
        }
        core.machine.ensure_usable()?;
        if !core.ports.is_enabled(PortId::Image) {
            return Err(AdapterError::invalid_state("image port not prepared"));
        }
        *self.mode.lock() = params.mode;

        if self.is_bracketing() {
            return self.interrupt_bracketing(core);
        }

        core.settings.freeze();
        self.set_phase(CapturePhase::Configuring);
        if let Err(e) = self.configure(core, &params) {
            self.settle(core);
            return Err(e);
        }

        let records = build_shot_queue(&params.entries, params.frames);
        if let Err(e) = self.enqueue_shots(core, &records) {
            self.settle(core);
            return Err(e);
        }
        self.set_phase(CapturePhase::Queued);

        {
            let mut b = self.burst.lock();
            *b = BurstCounters {
                captured: params.frames,
                accum: 0,
                queued: 0,
                limit: params.frames,
            };
        }
        while self.done_rx.try_recv().is_ok() {}

        let max = core.ports.max_queueable(PortId::Image);
        for slot in core
            .ports
            .idle_slots(PortId::Image)
            .into_iter()
            .take((params.frames as usize).min(max))
        {
            if let Err(e) = core.queue_buffer(PortId::Image, slot) {
                warn!(slot, error = %e, "could not queue image buffer");
                break;
            }
            self.burst.lock().accum += 1;
        }

        let passive = params.mode.passive_shutter();
        self.waiting_for_snapshot.store(true, Ordering::Release);
        self.shutter_pending.store(passive, Ordering::Release);
        let shutter = if passive {
            None
        } else {
            if let Err(e) = core.component.set_config(Setting::ShutterCallback(true)) {
                self.stop_locked(core, StopOutcome::Failed);
                return Err(e.into());
            }
            Some(core.rendezvous.register(EventKey::of(&ComponentEvent::shutter())))
        };

        // an interrupt before the waiter existed was not seen by it
        if self.cancelled.load(Ordering::Acquire) {
            debug!("capture cancelled before trigger");
            drop(shutter);
            self.stop_locked(core, StopOutcome::Completed);
            return Ok(());
        }

        if let Err(e) = core.component.set_config(Setting::Capturing(true)) {
            drop(shutter);
            let err = AdapterError::from(e);
            self.stop_locked(core, StopOutcome::Failed);
            return Err(err);
        }
        self.capture_signalled.store(true, Ordering::Release);
        self.set_phase(CapturePhase::Capturing);
        info!(frames = params.frames, records = records.len(), "capture started");

        if let Some(waiter) = shutter {
            match waiter.wait(core.config.capture_timeout()) {
                Ok(()) if self.cancelled.load(Ordering::Acquire) => {
                    debug!("shutter wait released by cancel");
                    return Ok(());
                }
                Ok(()) => core.notifier.notify(Notification::Shutter),
                Err(AdapterError::Timeout(what)) => {
                    error!(%what, "no shutter, draining capture");
                    let err = AdapterError::Timeout(what);
                    core.notifier.notify(Notification::Error {
                        severity: err.severity(),
                        error: err.clone(),
                    });
                    self.stop_locked(core, StopOutcome::Failed);
                    return Err(err);
                }
                Err(e) => return Err(e),
            }
        }

        if self.phase() == CapturePhase::Capturing {
            self.set_phase(CapturePhase::Draining);
        }
        Ok(())
    }

    fn settle(&self, core: &Core) {
        self.set_phase(CapturePhase::Idle);
        core.settings.thaw();
    }

    /// Rotation plus any load-time capture setting still pending
    fn configure(&self, core: &Core, params: &CaptureParams) -> Result<()> {
        if !core
            .settings
            .pending_capture()
            .intersection(CaptureSettings::LOAD_TIME)
            .is_empty()
        {
            core.reconfigure_image_port(&params.params)?;
        }
        if params.pending.contains(CaptureSettings::ROTATION)
            && !core.settings.take_capture(CaptureSettings::ROTATION).is_empty()
        {
            if let Err(e) = core.component.set_config(Setting::Rotation(params.rotation)) {
                warn!(error = %e, "rotation not applied");
            }
        }
        Ok(())
    }

    /// Load the hardware shot queue in batches; only the first batch flushes
    fn enqueue_shots(&self, core: &Core, records: &[ShotRecord]) -> Result<()> {
        let available = core.component.available_shots()?;
        if available < records.len() {
            return Err(AdapterError::ResourceExhausted(format!(
                "{} shot records, {available} free in hardware queue",
                records.len()
            )));
        }
        let batch = core.config.shot_batch_size.max(1);
        core.settings.take_capture(CaptureSettings::BURST_EXP_BRACKET);
        for (i, chunk) in records.chunks(batch).enumerate() {
            core.component.set_config(Setting::EnqueueShots {
                records: chunk.to_vec(),
                flush: i == 0,
            })?;
        }
        debug!(records = records.len(), "shot queue loaded");
        Ok(())
    }

    /// A plain capture arrived while bracketing lookahead was running:
    /// forward the retained frames and keep draining the rest as burst
    fn interrupt_bracketing(&self, core: &Core) -> Result<()> {
        let sent = self.send_bracket_frames(core);
        let (range, in_flight, late) = {
            let mut st = self.bracketing.lock();
            let range = st.range();
            let in_flight = st.in_flight();
            (range, in_flight, st.stop())
        };
        // retained after the forward above; nobody will ask for these
        for slot in late {
            let _ = core.ports.release(PortId::Image, slot);
        }
        let remaining = remaining_after_interrupt(range, sent) as u32;
        {
            let mut b = self.burst.lock();
            *b = BurstCounters {
                captured: remaining,
                accum: in_flight as u32,
                queued: sent as u32,
                limit: remaining,
            };
        }
        info!(range, sent, remaining, "bracketing interrupted by capture");

        if let Err(e) = core
            .component
            .set_config(Setting::TemporalBracketing { enable: false, range })
        {
            warn!(error = %e, "temporal bracketing not disabled");
        }
        core.component.set_config(Setting::Capturing(true))?;
        self.capture_signalled.store(true, Ordering::Release);
        core.notifier.notify(Notification::Shutter);

        // requeue idle image buffers toward the recomputed count
        for slot in core.ports.idle_slots(PortId::Image) {
            if !self.claim_requeue() {
                break;
            }
            if core.queue_buffer(PortId::Image, slot).is_err() {
                self.burst.lock().accum -= 1;
                break;
            }
        }

        if remaining == 0 {
            self.settle(core);
            core.post(CommandMsg::FinishCapture);
        } else {
            self.set_phase(CapturePhase::Draining);
        }
        Ok(())
    }

    /// Deliver retained lookahead frames, oldest first
    pub(crate) fn send_bracket_frames(&self, core: &Core) -> usize {
        let slots = self.bracketing.lock().take_retained();
        let mut sent = 0;
        for slot in slots {
            if let Some(buffer) = core.ports.buffer(PortId::Image, slot) {
                if core.deliver(PortId::Image, slot, buffer, FrameType::Image, None) {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Image port completion from the callback thread
    pub(crate) fn on_image_buffer(&self, core: &Core, slot: usize, buffer: CameraBuffer, done: &BufferDone) {
        {
            let mut st = self.bracketing.lock();
            if st.is_enabled() {
                let recycle = st.on_complete(slot);
                if let Some(old) = recycle {
                    let _ = core.ports.release(PortId::Image, old);
                    match core.queue_buffer(PortId::Image, old) {
                        Ok(()) => st.mark_queued(old),
                        Err(e) => warn!(slot = old, error = %e, "lookahead requeue failed"),
                    }
                }
                debug!(slot, "bracketing frame retained");
                return;
            }
        }

        let finished = {
            let mut b = self.burst.lock();
            if b.captured == 0 {
                None
            } else {
                b.captured -= 1;
                Some(b.captured == 0)
            }
        };
        let Some(finished) = finished else {
            debug!(slot, "image buffer outside a capture, recycled");
            let _ = core.ports.release(PortId::Image, slot);
            return;
        };

        let _ = self.done_tx.try_send(());
        if self.shutter_pending.swap(false, Ordering::AcqRel) {
            debug!("image ahead of tagged preview, shutter from image");
            core.notifier.notify(Notification::Shutter);
        }
        if core.deliver(PortId::Image, slot, buffer, FrameType::Image, Some(done)) {
            self.burst.lock().queued += 1;
        }
        if finished {
            debug!("last capture frame delivered");
            core.post(CommandMsg::FinishCapture);
        }
    }

    /// Reserve one more hardware fill for the current burst
    fn claim_requeue(&self) -> bool {
        let mut b = self.burst.lock();
        if b.captured > 0 && b.accum < b.limit {
            b.accum += 1;
            true
        } else {
            false
        }
    }

    /// Returned image buffer: requeue while the burst still needs frames
    pub(crate) fn on_image_returned(&self, core: &Core, slot: usize) -> Result<()> {
        if self.is_bracketing() {
            let queued = core.queue_buffer(PortId::Image, slot);
            if queued.is_ok() {
                self.bracketing.lock().mark_queued(slot);
            }
            return queued;
        }
        if !self.claim_requeue() {
            return Ok(());
        }
        let queued = core.queue_buffer(PortId::Image, slot);
        if queued.is_err() {
            self.burst.lock().accum -= 1;
        }
        queued
    }

    /// First preview frame tagged by the hardware while a capture waits
    /// for its snapshot. Returns the frame type to deliver it as.
    pub(crate) fn on_snapshot(&self, core: &Core) -> FrameType {
        if !self.waiting_for_snapshot.swap(false, Ordering::AcqRel) {
            return FrameType::Preview;
        }
        if self.shutter_pending.swap(false, Ordering::AcqRel) {
            core.notifier.notify(Notification::Shutter);
        }
        FrameType::Snapshot
    }

    /// Unblock a start waiting for its shutter so cancel can take the lock
    pub(crate) fn interrupt(&self, core: &Core) {
        self.cancelled.store(true, Ordering::Release);
        self.waiting_for_snapshot.store(false, Ordering::Release);
        core.rendezvous.signal(&ComponentEvent::shutter());
    }

    #[instrument(skip_all)]
    pub(crate) fn stop_image_capture(&self, core: &Core) {
        let _guard = self.capture_lock.lock();
        self.stop_locked(core, StopOutcome::Completed);
    }

    fn stop_locked(&self, core: &Core, outcome: StopOutcome) {
        if self.phase() == CapturePhase::Idle && !self.capture_signalled.load(Ordering::Acquire) {
            core.clear_capture_requested();
            core.settings.thaw();
            return;
        }

        let delivered = self.burst.lock().queued;
        if self.capture_signalled.load(Ordering::Acquire) && delivered == 0 {
            if self
                .done_rx
                .recv_timeout(core.config.capture_timeout())
                .is_err()
            {
                warn!("no capture frame before stop");
            }
        }
        self.shutter_pending.store(false, Ordering::Release);
        if outcome == StopOutcome::Failed {
            self.waiting_for_snapshot.store(false, Ordering::Release);
        }

        if core.machine.ensure_usable().is_ok() {
            let passive = self.mode.lock().passive_shutter();
            let mut calls = vec![Setting::Capturing(false), Setting::ResetShotQueue];
            if !passive {
                calls.insert(1, Setting::ShutterCallback(false));
            }
            for setting in calls {
                if let Err(e) = core.component.set_config(setting.clone()) {
                    warn!(?setting, error = %e, "capture teardown call failed");
                }
            }
            if core.ports.counts(PortId::Image).fill > 0 {
                match core.machine.flush_port(PortId::Image) {
                    Ok(n) => debug!(reclaimed = n, "image buffers reclaimed"),
                    Err(e) => warn!(error = %e, "image port flush failed"),
                }
            }
        }

        let frames = {
            let mut b = self.burst.lock();
            let frames = b.queued;
            *b = BurstCounters::default();
            frames
        };
        self.capture_signalled.store(false, Ordering::Release);
        self.settle(core);
        core.clear_capture_requested();
        match outcome {
            StopOutcome::Completed => {
                core.counters.capture_completed();
                info!(frames, "capture stopped");
                core.notifier.notify(Notification::CaptureComplete { frames });
            }
            StopOutcome::Failed => warn!(frames, "capture torn down after failure"),
        }
    }

    /// Start temporal bracketing lookahead over the image pool
    #[instrument(skip(self, core))]
    pub(crate) fn start_bracketing(&self, core: &Core, range: usize) -> Result<()> {
        let _guard = self.capture_lock.lock();
        if self.phase() != CapturePhase::Idle {
            return Err(AdapterError::invalid_state("capture in progress"));
        }
        if !core.ports.is_enabled(PortId::Image) {
            return Err(AdapterError::invalid_state("image port not prepared"));
        }
        let slots = core.ports.slot_count(PortId::Image);
        if range == 0 || range > slots || range > core.config.max_bracket_entries {
            return Err(AdapterError::ResourceExhausted(format!(
                "bracketing range {range} with {slots} image buffers"
            )));
        }
        {
            let mut st = self.bracketing.lock();
            if st.is_enabled() {
                return Err(AdapterError::invalid_state("bracketing already running"));
            }
            st.start(range, slots);
        }

        core.component
            .set_config(Setting::TemporalBracketing { enable: true, range })?;
        let max = core.ports.max_queueable(PortId::Image);
        for slot in core.ports.idle_slots(PortId::Image).into_iter().take(max) {
            core.queue_buffer(PortId::Image, slot)?;
            self.bracketing.lock().mark_queued(slot);
        }
        info!(range, "bracketing started");
        Ok(())
    }

    #[instrument(skip_all)]
    pub(crate) fn stop_bracketing(&self, core: &Core) -> Result<()> {
        let _guard = self.capture_lock.lock();
        let (retained, range) = {
            let mut st = self.bracketing.lock();
            if !st.is_enabled() {
                return Ok(());
            }
            let range = st.range();
            (st.stop(), range)
        };
        for slot in retained {
            let _ = core.ports.release(PortId::Image, slot);
        }
        core.machine.ensure_usable()?;
        core.component
            .set_config(Setting::TemporalBracketing { enable: false, range })?;
        if core.ports.counts(PortId::Image).fill > 0 {
            core.machine.flush_port(PortId::Image)?;
        }
        info!("bracketing stopped");
        Ok(())
    }
}
