pub mod adapter;
pub mod capture;
pub mod component;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod utils;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

pub use adapter::CameraAdapter;
pub use capture::frame::{CameraBuffer, Frame, FrameType, PixelFormat};
pub use component::{ComponentState, PortId};
pub use error::{AdapterError, Result, Severity};
pub use params::Parameters;
pub use pipeline::dispatch::Notification;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub adapter: AdapterConfig,
    pub simulator: SimConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Bound on every state transition acknowledgement
    pub command_timeout_ms: u64,
    /// Bound on shutter and capture-done waits
    pub capture_timeout_ms: u64,
    /// Resends of a state command after a plain timeout
    pub transition_retries: u32,
    pub max_bracket_entries: usize,
    /// Shot records per enqueue call
    pub shot_batch_size: usize,
    pub frame_queue: usize,
    pub notification_queue: usize,
    pub command_queue: usize,
    pub callback_queue: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3_000,
            capture_timeout_ms: 5_000,
            transition_retries: 0,
            max_bracket_entries: 10,
            shot_batch_size: 5,
            frame_queue: 16,
            notification_queue: 64,
            command_queue: 16,
            callback_queue: 256,
        }
    }
}

impl AdapterConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

/// Behaviour of the simulated component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub ack_delay_ms: u64,
    pub frame_interval_ms: u64,
    pub shot_capacity: usize,
    /// Complete queued buffers without being told to
    pub auto_complete: bool,
    pub stride_align: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ack_delay_ms: 1,
            frame_interval_ms: 5,
            shot_capacity: 32,
            auto_complete: true,
            stride_align: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "camera_adapter=debug".into(),
        }
    }
}

/// Adapter counters at a point in time
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metrics {
    pub frames_received: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub captures_completed: u64,
    pub transitions: u64,
    pub timeouts: u64,
}

/// Live counters, mirrored to the `metrics` facade
#[derive(Default)]
pub struct Counters {
    frames_received: CachePadded<AtomicU64>,
    frames_delivered: CachePadded<AtomicU64>,
    frames_dropped: CachePadded<AtomicU64>,
    captures_completed: CachePadded<AtomicU64>,
    transitions: CachePadded<AtomicU64>,
    timeouts: CachePadded<AtomicU64>,
}

impl Counters {
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera_adapter_frames_received_total").increment(1);
    }

    pub fn frame_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera_adapter_frames_delivered_total").increment(1);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera_adapter_frames_dropped_total").increment(1);
    }

    pub fn capture_completed(&self) {
        self.captures_completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera_adapter_captures_total").increment(1);
    }

    pub fn transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera_adapter_transitions_total").increment(1);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camera_adapter_timeouts_total").increment(1);
    }

    pub fn snapshot(&self) -> Metrics {
        Metrics {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            captures_completed: self.captures_completed.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
