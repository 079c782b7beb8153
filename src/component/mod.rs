//! Boundary to the hardware image-processing component
//!
//! The component is opaque: commands and settings go in through
//! [`Component`], acknowledgements and filled buffers come back
//! asynchronously through [`ComponentCallbacks`], possibly from a
//! hardware context that must not block.

pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use crate::capture::bracketing::ShotRecord;
use crate::capture::frame::{CameraBuffer, PixelFormat};
use crate::error::HwError;
use crate::params::{
    CaptureMode, Effect, ExposureMode, FlashMode, Flicker, FocusMode, MeteringArea, NoiseFilter,
    SceneMode, WhiteBalance,
};

pub use sim::SimComponent;

pub type HwResult<T> = std::result::Result<T, HwError>;

/// Wildcard port number used in events that concern every port
pub const ALL_PORTS: u32 = u32::MAX;
/// Setting index carried by shutter events
pub const INDEX_SHUTTER: u32 = 0x7F00_0011;
/// Setting index carried by focus status events
pub const INDEX_FOCUS_STATUS: u32 = 0x7F00_0012;
/// Error code carried by fatal hardware fault events
pub const HARDWARE_FAULT: u32 = 0x8000_1005;

/// Logical data ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortId {
    Preview,
    Video,
    Image,
    Measurement,
    ReprocessInput,
}

impl PortId {
    pub const ALL: [PortId; 5] = [
        PortId::Preview,
        PortId::Video,
        PortId::Image,
        PortId::Measurement,
        PortId::ReprocessInput,
    ];

    /// Arena index
    pub fn index(self) -> usize {
        self as usize
    }

    /// Port number on the wire; never zero so it can't collide with a wildcard
    pub fn number(self) -> u32 {
        self as u32 + 1
    }

    pub fn from_number(n: u32) -> Option<PortId> {
        PortId::ALL.get(n.checked_sub(1)? as usize).copied()
    }

    /// Ports the adapter fills from the hardware side
    pub fn is_output(self) -> bool {
        self != PortId::ReprocessInput
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
    Loaded,
    Idle,
    Executing,
    Invalid,
}

impl ComponentState {
    pub fn code(self) -> u32 {
        match self {
            ComponentState::Loaded => 1,
            ComponentState::Idle => 2,
            ComponentState::Executing => 3,
            ComponentState::Invalid => 4,
        }
    }
}

/// Commands sent with `send_command`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StateSet(ComponentState),
    PortEnable(PortId),
    PortDisable(PortId),
    Flush(PortId),
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::StateSet(_) => 1,
            Command::PortEnable(_) => 2,
            Command::PortDisable(_) => 3,
            Command::Flush(_) => 4,
        }
    }

    /// Second field of the completion event
    pub fn arg(self) -> u32 {
        match self {
            Command::StateSet(s) => s.code(),
            Command::PortEnable(p) | Command::PortDisable(p) | Command::Flush(p) => p.number(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CmdComplete,
    Error,
    SettingChanged,
}

/// Asynchronous event notification from the component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentEvent {
    pub kind: EventKind,
    pub data1: u32,
    pub data2: u32,
}

impl ComponentEvent {
    pub fn cmd_complete(command: Command) -> Self {
        Self {
            kind: EventKind::CmdComplete,
            data1: command.code(),
            data2: command.arg(),
        }
    }

    pub fn shutter() -> Self {
        Self {
            kind: EventKind::SettingChanged,
            data1: ALL_PORTS,
            data2: INDEX_SHUTTER,
        }
    }

    pub fn focus_status() -> Self {
        Self {
            kind: EventKind::SettingChanged,
            data1: ALL_PORTS,
            data2: INDEX_FOCUS_STATUS,
        }
    }

    pub fn hardware_fault() -> Self {
        Self {
            kind: EventKind::Error,
            data1: HARDWARE_FAULT,
            data2: 0,
        }
    }

    pub fn is_hardware_fault(&self) -> bool {
        self.kind == EventKind::Error && self.data1 == HARDWARE_FAULT
    }
}

/// Negotiated port format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub min_fps: u32,
    pub max_fps: u32,
}

impl PortGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat, buffer_count: usize) -> Self {
        Self {
            width,
            height,
            format,
            buffer_count,
            ..Default::default()
        }
    }
}

/// Descriptor the component hands back from `use_buffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHeader {
    pub id: u64,
    pub port: PortId,
}

/// Buffer completion reported by the component
#[derive(Debug, Clone, Copy)]
pub struct BufferDone {
    pub header: BufferHeader,
    pub filled_len: u32,
    pub offset: u32,
    pub timestamp: Option<Duration>,
    /// Preview frame the hardware tagged as the capture snapshot
    pub snapshot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusStatus {
    Idle,
    Running,
    Locked,
    Failed,
}

/// Load-time parameters, only legal in `Loaded` or on a disabled port
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    PortFormat { port: PortId, geometry: PortGeometry },
    Thumbnail { width: u32, height: u32 },
    Quality(u8),
    Ldc(bool),
    NoiseFilter(NoiseFilter),
    CaptureMode(CaptureMode),
}

/// Runtime settings, legal in any non-invalid state
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    Capturing(bool),
    ShutterCallback(bool),
    FocusCallback(bool),
    EnqueueShots { records: Vec<ShotRecord>, flush: bool },
    ResetShotQueue,
    TemporalBracketing { enable: bool, range: usize },
    Rotation(u32),
    Vnf(bool),
    Vstab(bool),
    Scene(SceneMode),
    EvCompensation(i32),
    WhiteBalance(WhiteBalance),
    Flicker(Flicker),
    ExposureMode(ExposureMode),
    Sharpness(i32),
    Brightness(i32),
    Contrast(i32),
    Iso(u32),
    Saturation(i32),
    Effect(Effect),
    FocusMode(FocusMode),
    FocusTrigger(bool),
    Flash(FlashMode),
    ExposureLock(bool),
    WhiteBalanceLock(bool),
    MeteringAreas(Vec<MeteringArea>),
    ManualExposure { exposure_us: u32, gain: u32 },
}

/// Hardware component interface
pub trait Component: Send + Sync {
    /// Install the callback sink; called once before any command
    fn register_callbacks(&self, callbacks: Arc<dyn ComponentCallbacks>);

    fn send_command(&self, command: Command) -> HwResult<()>;

    fn set_parameter(&self, param: Parameter) -> HwResult<()>;

    fn set_config(&self, setting: Setting) -> HwResult<()>;

    fn port_definition(&self, port: PortId) -> HwResult<PortGeometry>;

    /// Free slots in the hardware shot queue
    fn available_shots(&self) -> HwResult<usize>;

    fn focus_status(&self) -> HwResult<FocusStatus>;

    fn use_buffer(&self, port: PortId, buffer: &CameraBuffer) -> HwResult<BufferHeader>;

    fn free_buffer(&self, header: BufferHeader) -> HwResult<()>;

    /// Hand an output buffer to the hardware for filling
    fn fill_this_buffer(&self, header: BufferHeader) -> HwResult<()>;

    /// Hand an input buffer to the hardware for draining
    fn empty_this_buffer(&self, header: BufferHeader) -> HwResult<()>;

    fn release_handle(&self) -> HwResult<()>;
}

/// Single entry point for everything the component reports
pub trait ComponentCallbacks: Send + Sync {
    fn on_event(&self, event: ComponentEvent);

    fn on_buffer_done(&self, done: BufferDone);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_numbers_are_nonzero_and_roundtrip() {
        for port in PortId::ALL {
            assert_ne!(port.number(), 0);
            assert_eq!(PortId::from_number(port.number()), Some(port));
        }
        assert_eq!(PortId::from_number(0), None);
        assert_eq!(PortId::from_number(99), None);
    }

    #[test]
    fn command_completion_event_carries_target() {
        let ev = ComponentEvent::cmd_complete(Command::StateSet(ComponentState::Idle));
        assert_eq!(ev.kind, EventKind::CmdComplete);
        assert_eq!(ev.data1, 1);
        assert_eq!(ev.data2, ComponentState::Idle.code());

        let ev = ComponentEvent::cmd_complete(Command::PortEnable(PortId::Image));
        assert_eq!(ev.data2, PortId::Image.number());
        assert!(ComponentEvent::hardware_fault().is_hardware_fault());
        assert!(!ComponentEvent::shutter().is_hardware_fault());
    }
}
