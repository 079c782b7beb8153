//! Thread plumbing between callers, the hardware and the adapter
//!
//! - the command thread runs long state-changing operations one at a time
//! - the callback thread drains hardware notifications so the hardware
//!   callback itself only enqueues and returns
//! - the notifier carries frames and events to the upstream consumer

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::adapter::Core;
use crate::capture::frame::Frame;
use crate::capture::sequencer::CaptureParams;
use crate::component::{BufferDone, ComponentCallbacks, ComponentEvent};
use crate::error::{AdapterError, Severity};
use crate::pipeline::rendezvous::{EventRendezvous, SignalOutcome};
use crate::pipeline::state::ComponentStatus;

/// Asynchronous notifications for the upstream consumer
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Shutter,
    Focus { locked: bool },
    CaptureComplete { frames: u32 },
    CaptureFailed { error: AdapterError },
    Error { severity: Severity, error: AdapterError },
}

/// Sending side of the frame and notification channels
#[derive(Clone)]
pub struct Notifier {
    frames: flume::Sender<Frame>,
    events: flume::Sender<Notification>,
}

impl Notifier {
    pub fn new(frames: flume::Sender<Frame>, events: flume::Sender<Notification>) -> Self {
        Self { frames, events }
    }

    /// Hand a frame upstream; gives it back if the consumer can't take it
    pub fn frame(&self, frame: Frame) -> Result<(), Frame> {
        self.frames.try_send(frame).map_err(|e| e.into_inner())
    }

    /// Like [`frame`](Self::frame) but waits up to `timeout` for room
    pub fn frame_within(&self, frame: Frame, timeout: Duration) -> Result<(), Frame> {
        self.frames
            .send_timeout(frame, timeout)
            .map_err(|e| e.into_inner())
    }

    pub fn notify(&self, notification: Notification) {
        if let Err(e) = self.events.try_send(notification) {
            warn!(notification = ?e.into_inner(), "notification dropped");
        }
    }
}

pub(crate) enum CommandMsg {
    StartCapture(Box<CaptureParams>),
    FinishCapture,
    AutoFocus,
    Exit,
}

pub(crate) enum CallbackMsg {
    BufferDone(BufferDone),
    FocusStatus,
    Fault,
    Flush(flume::Sender<()>),
    Exit,
}

pub(crate) fn spawn_command_thread(
    core: Arc<Core>,
    rx: flume::Receiver<CommandMsg>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("camera-command".into())
        .spawn(move || {
            info!("command thread started");
            while let Ok(msg) = rx.recv() {
                match msg {
                    CommandMsg::Exit => break,
                    CommandMsg::StartCapture(params) => core.run_capture(*params),
                    CommandMsg::FinishCapture => core.finish_capture(),
                    CommandMsg::AutoFocus => core.run_auto_focus(),
                }
            }
            info!("command thread exiting");
        })
}

pub(crate) fn spawn_callback_thread(
    core: Arc<Core>,
    rx: flume::Receiver<CallbackMsg>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("camera-callback".into())
        .spawn(move || {
            info!("callback thread started");
            while let Ok(msg) = rx.recv() {
                match msg {
                    CallbackMsg::Exit => break,
                    CallbackMsg::BufferDone(done) => core.on_buffer_done(done),
                    CallbackMsg::FocusStatus => core.on_focus_status(),
                    CallbackMsg::Fault => core.on_fault(),
                    CallbackMsg::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            info!("callback thread exiting");
        })
}

/// Sink registered with the component; never blocks
pub(crate) struct CallbackBridge {
    status: Arc<ComponentStatus>,
    rendezvous: Arc<EventRendezvous>,
    tx: flume::Sender<CallbackMsg>,
}

impl CallbackBridge {
    pub(crate) fn new(
        status: Arc<ComponentStatus>,
        rendezvous: Arc<EventRendezvous>,
        tx: flume::Sender<CallbackMsg>,
    ) -> Self {
        Self {
            status,
            rendezvous,
            tx,
        }
    }

    fn forward(&self, msg: CallbackMsg) {
        if let Err(e) = self.tx.try_send(msg) {
            match e {
                flume::TrySendError::Full(_) => error!("callback queue full, notification lost"),
                flume::TrySendError::Disconnected(_) => debug!("callback thread gone"),
            }
        }
    }
}

impl ComponentCallbacks for CallbackBridge {
    fn on_event(&self, event: ComponentEvent) {
        if event.is_hardware_fault() {
            self.status
                .invalidate(AdapterError::HardwareInvalid("hardware fault reported".into()));
            self.forward(CallbackMsg::Fault);
            return;
        }
        match self.rendezvous.signal(&event) {
            SignalOutcome::Redirected => self.forward(CallbackMsg::FocusStatus),
            SignalOutcome::Matched | SignalOutcome::Dropped => {}
        }
    }

    fn on_buffer_done(&self, done: BufferDone) {
        self.forward(CallbackMsg::BufferDone(done));
    }
}
