pub mod bracketing;
pub mod frame;
pub mod sequencer;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use sequencer::{CaptureParams, CapturePhase, CaptureSequencer};
