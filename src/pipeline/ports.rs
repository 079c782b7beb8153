//! Per-port buffer pool bookkeeping
//!
//! One `PortParams` per logical port, held in a fixed arena indexed by
//! [`PortId`]. Buffers are addressed as (port, slot) pairs. Each port has its
//! own lock, taken briefly by caller threads (queueing) and the callback
//! thread (completion).

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::capture::frame::CameraBuffer;
use crate::component::{BufferHeader, PortGeometry, PortId};
use crate::error::{AdapterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Owned by the adapter, free to queue
    Idle,
    /// Owned by the hardware
    Fill,
    /// Filled, owned by the upstream consumer
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounts {
    pub idle: usize,
    pub fill: usize,
    pub done: usize,
}

#[derive(Debug)]
struct Slot {
    buffer: CameraBuffer,
    header: Option<BufferHeader>,
    status: BufferStatus,
}

#[derive(Debug, Default)]
struct PortParams {
    geometry: Option<PortGeometry>,
    /// Set by a configure, consumed by the bind that must follow it
    fresh: bool,
    slots: Vec<Slot>,
    max_queueable: usize,
    enabled: bool,
}

impl PortParams {
    fn fill_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == BufferStatus::Fill)
            .count()
    }

    fn slot_mut(&mut self, port: PortId, slot: usize) -> Result<&mut Slot> {
        self.slots
            .get_mut(slot)
            .ok_or_else(|| AdapterError::BadValue(format!("{port:?} has no slot {slot}")))
    }
}

pub struct PortRegistry {
    ports: [Mutex<PortParams>; 5],
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            ports: std::array::from_fn(|_| Mutex::new(PortParams::default())),
        }
    }

    fn port(&self, port: PortId) -> MutexGuard<'_, PortParams> {
        self.ports[port.index()].lock()
    }

    /// Commit negotiated geometry; the next step must be `bind`
    pub fn set_geometry(&self, port: PortId, geometry: PortGeometry) -> Result<()> {
        let mut p = self.port(port);
        if p.slots.iter().any(|s| s.header.is_some()) {
            return Err(AdapterError::invalid_state(format!(
                "{port:?} still has buffers registered with the component"
            )));
        }
        p.slots.clear();
        p.geometry = Some(geometry);
        p.fresh = true;
        Ok(())
    }

    pub fn geometry(&self, port: PortId) -> Option<PortGeometry> {
        self.port(port).geometry
    }

    /// Associate caller buffers with the port's slots, in order
    pub fn bind(&self, port: PortId, buffers: &[CameraBuffer], max_queueable: usize) -> Result<()> {
        let mut p = self.port(port);
        let geometry = p
            .geometry
            .ok_or_else(|| AdapterError::invalid_state(format!("{port:?} not configured")))?;
        if !p.fresh {
            return Err(AdapterError::invalid_state(format!(
                "{port:?} must be configured before binding"
            )));
        }
        if buffers.is_empty() {
            return Err(AdapterError::BadValue(format!("no buffers for {port:?}")));
        }
        if let Some(small) = buffers.iter().find(|b| b.len() < geometry.buffer_size) {
            return Err(AdapterError::BadValue(format!(
                "buffer {} holds {} bytes, {port:?} needs {}",
                small.handle(),
                small.len(),
                geometry.buffer_size
            )));
        }

        p.slots = buffers
            .iter()
            .map(|b| Slot {
                buffer: b.clone(),
                header: None,
                status: BufferStatus::Idle,
            })
            .collect();
        p.max_queueable = match max_queueable {
            0 => buffers.len(),
            n => n.min(buffers.len()),
        };
        p.fresh = false;
        debug!(?port, count = buffers.len(), max_queueable = p.max_queueable, "buffers bound");
        Ok(())
    }

    pub fn attach_header(&self, port: PortId, slot: usize, header: BufferHeader) -> Result<()> {
        let mut p = self.port(port);
        p.slot_mut(port, slot)?.header = Some(header);
        Ok(())
    }

    /// Detach every header for freeing; a second call yields nothing
    pub fn take_headers(&self, port: PortId) -> Vec<BufferHeader> {
        let mut p = self.port(port);
        p.slots
            .iter_mut()
            .filter_map(|s| {
                s.status = BufferStatus::Idle;
                s.header.take()
            })
            .collect()
    }

    /// Forget the bound buffers and geometry
    pub fn unbind(&self, port: PortId) {
        let mut p = self.port(port);
        p.slots.clear();
        p.geometry = None;
        p.fresh = false;
        p.max_queueable = 0;
    }

    /// IDLE -> FILL, bounded by `max_queueable`
    pub fn queue(&self, port: PortId, slot: usize) -> Result<BufferHeader> {
        let mut p = self.port(port);
        let in_flight = p.fill_count();
        let max = p.max_queueable;
        let s = p.slot_mut(port, slot)?;
        if s.status != BufferStatus::Idle {
            return Err(AdapterError::invalid_state(format!(
                "{port:?} slot {slot} is {:?}",
                s.status
            )));
        }
        let header = s.header.ok_or_else(|| {
            AdapterError::invalid_state(format!("{port:?} slot {slot} not registered"))
        })?;
        if in_flight >= max {
            return Err(AdapterError::ResourceExhausted(format!(
                "{port:?} already has {in_flight} of {max} buffers queued"
            )));
        }
        s.status = BufferStatus::Fill;
        Ok(header)
    }

    /// Undo a `queue` whose hardware call failed
    pub fn unqueue(&self, port: PortId, slot: usize) {
        let mut p = self.port(port);
        if let Ok(s) = p.slot_mut(port, slot) {
            if s.status == BufferStatus::Fill {
                s.status = BufferStatus::Idle;
            }
        }
    }

    /// FILL -> DONE for the slot owning `header`
    pub fn complete(&self, header: BufferHeader) -> Result<(usize, CameraBuffer)> {
        let port = header.port;
        let mut p = self.port(port);
        let (slot, s) = p
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.header == Some(header))
            .ok_or_else(|| {
                AdapterError::BadValue(format!("{port:?} has no buffer header {}", header.id))
            })?;
        if s.status != BufferStatus::Fill {
            return Err(AdapterError::invalid_state(format!(
                "{port:?} slot {slot} completed while {:?}",
                s.status
            )));
        }
        s.status = BufferStatus::Done;
        if s.buffer.ref_count() == 0 {
            s.buffer.set_refs(1);
        }
        Ok((slot, s.buffer.clone()))
    }

    /// DONE -> IDLE; returns false when the slot was already idle
    pub fn release(&self, port: PortId, slot: usize) -> Result<bool> {
        let mut p = self.port(port);
        let s = p.slot_mut(port, slot)?;
        match s.status {
            BufferStatus::Done => {
                s.status = BufferStatus::Idle;
                s.buffer.set_refs(0);
                Ok(true)
            }
            BufferStatus::Idle => Ok(false),
            BufferStatus::Fill => Err(AdapterError::invalid_state(format!(
                "{port:?} slot {slot} is still owned by the hardware"
            ))),
        }
    }

    /// FILL -> IDLE for everything the hardware handed back on a flush or
    /// state change; DONE slots stay with their consumer
    pub fn reclaim_in_flight(&self, port: PortId) -> usize {
        let mut p = self.port(port);
        let mut reclaimed = 0;
        for s in p.slots.iter_mut().filter(|s| s.status == BufferStatus::Fill) {
            s.status = BufferStatus::Idle;
            reclaimed += 1;
        }
        reclaimed
    }

    pub fn find(&self, port: PortId, buffer: &CameraBuffer) -> Option<usize> {
        self.port(port)
            .slots
            .iter()
            .position(|s| s.buffer.same_as(buffer))
    }

    pub fn buffer(&self, port: PortId, slot: usize) -> Option<CameraBuffer> {
        self.port(port).slots.get(slot).map(|s| s.buffer.clone())
    }

    pub fn buffers(&self, port: PortId) -> Vec<CameraBuffer> {
        self.port(port).slots.iter().map(|s| s.buffer.clone()).collect()
    }

    pub fn status(&self, port: PortId, slot: usize) -> Option<BufferStatus> {
        self.port(port).slots.get(slot).map(|s| s.status)
    }

    pub fn counts(&self, port: PortId) -> PortCounts {
        let p = self.port(port);
        p.slots.iter().fold(PortCounts::default(), |mut c, s| {
            match s.status {
                BufferStatus::Idle => c.idle += 1,
                BufferStatus::Fill => c.fill += 1,
                BufferStatus::Done => c.done += 1,
            }
            c
        })
    }

    pub fn idle_slots(&self, port: PortId) -> Vec<usize> {
        self.port(port)
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == BufferStatus::Idle)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn slot_count(&self, port: PortId) -> usize {
        self.port(port).slots.len()
    }

    pub fn max_queueable(&self, port: PortId) -> usize {
        self.port(port).max_queueable
    }

    /// Slots exist and every one has a hardware descriptor
    pub fn is_bound(&self, port: PortId) -> bool {
        let p = self.port(port);
        !p.slots.is_empty() && p.slots.iter().all(|s| s.header.is_some())
    }

    pub fn has_buffers(&self, port: PortId) -> bool {
        !self.port(port).slots.is_empty()
    }

    pub fn set_enabled(&self, port: PortId, enabled: bool) {
        self.port(port).enabled = enabled;
    }

    pub fn is_enabled(&self, port: PortId) -> bool {
        self.port(port).enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn registry_with(port: PortId, count: usize, max_queueable: usize) -> (PortRegistry, Vec<BufferHeader>) {
        let reg = PortRegistry::new();
        let mut geometry = PortGeometry::new(64, 48, PixelFormat::Nv12, count);
        geometry.stride = 64;
        geometry.buffer_size = 64 * 48 * 3 / 2;
        reg.set_geometry(port, geometry).unwrap();
        let buffers = CameraBuffer::pool(100, count, geometry.buffer_size);
        reg.bind(port, &buffers, max_queueable).unwrap();
        let headers: Vec<_> = (0..count)
            .map(|i| BufferHeader {
                id: 1000 + i as u64,
                port,
            })
            .collect();
        for (i, h) in headers.iter().enumerate() {
            reg.attach_header(port, i, *h).unwrap();
        }
        (reg, headers)
    }

    #[test]
    fn partial_completion_leaves_expected_split() {
        let (reg, headers) = registry_with(PortId::Preview, 6, 6);
        for slot in 0..6 {
            reg.queue(PortId::Preview, slot).unwrap();
        }
        for header in &headers[..3] {
            reg.complete(*header).unwrap();
        }
        assert_eq!(
            reg.counts(PortId::Preview),
            PortCounts {
                idle: 0,
                fill: 3,
                done: 3
            }
        );
        assert!(matches!(
            reg.queue(PortId::Preview, 0),
            Err(AdapterError::InvalidState(_))
        ));

        assert_eq!(reg.release(PortId::Preview, 0), Ok(true));
        assert!(reg.queue(PortId::Preview, 0).is_ok());
    }

    #[test]
    fn completion_hands_out_a_reference() {
        let (reg, headers) = registry_with(PortId::Image, 2, 2);
        reg.queue(PortId::Image, 1).unwrap();
        let (slot, buffer) = reg.complete(headers[1]).unwrap();
        assert_eq!(slot, 1);
        assert!(buffer.ref_count() >= 1);
        // a second completion for the same header is a protocol error
        assert!(reg.complete(headers[1]).is_err());
    }

    #[test]
    fn queue_respects_max_queueable() {
        let (reg, _) = registry_with(PortId::Preview, 4, 2);
        reg.queue(PortId::Preview, 0).unwrap();
        reg.queue(PortId::Preview, 1).unwrap();
        assert!(matches!(
            reg.queue(PortId::Preview, 2),
            Err(AdapterError::ResourceExhausted(_))
        ));
        reg.unqueue(PortId::Preview, 1);
        assert!(reg.queue(PortId::Preview, 2).is_ok());
    }

    #[test]
    fn reclaim_only_touches_hardware_owned_slots() {
        let (reg, headers) = registry_with(PortId::Preview, 3, 3);
        for slot in 0..3 {
            reg.queue(PortId::Preview, slot).unwrap();
        }
        reg.complete(headers[0]).unwrap();
        assert_eq!(reg.reclaim_in_flight(PortId::Preview), 2);
        assert_eq!(reg.status(PortId::Preview, 0), Some(BufferStatus::Done));
        assert_eq!(reg.idle_slots(PortId::Preview), vec![1, 2]);
    }

    #[test]
    fn release_of_hardware_owned_slot_fails() {
        let (reg, _) = registry_with(PortId::Preview, 2, 2);
        reg.queue(PortId::Preview, 0).unwrap();
        assert!(reg.release(PortId::Preview, 0).is_err());
        assert_eq!(reg.release(PortId::Preview, 1), Ok(false));
    }

    #[test]
    fn bind_requires_fresh_configure() {
        let reg = PortRegistry::new();
        let buffers = CameraBuffer::pool(0, 2, 4096);
        assert!(reg.bind(PortId::Video, &buffers, 2).is_err());

        reg.set_geometry(PortId::Video, PortGeometry::new(32, 32, PixelFormat::Yuyv, 2))
            .unwrap();
        reg.bind(PortId::Video, &buffers, 2).unwrap();
        assert!(reg.bind(PortId::Video, &buffers, 2).is_err());
    }

    #[test]
    fn headers_are_taken_once() {
        let (reg, _) = registry_with(PortId::Measurement, 3, 3);
        assert_eq!(reg.take_headers(PortId::Measurement).len(), 3);
        assert!(reg.take_headers(PortId::Measurement).is_empty());
        assert!(!reg.is_bound(PortId::Measurement));
    }

    #[test]
    fn configure_refused_while_headers_registered() {
        let (reg, _) = registry_with(PortId::Image, 2, 2);
        let geometry = reg.geometry(PortId::Image).unwrap();
        assert!(reg.set_geometry(PortId::Image, geometry).is_err());
        reg.take_headers(PortId::Image);
        assert!(reg.set_geometry(PortId::Image, geometry).is_ok());
    }

    #[test]
    fn fill_never_exceeds_max_queueable_under_random_traffic() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for round in 0..20 {
            let count = rng.gen_range(1..=8);
            let max = rng.gen_range(1..=count);
            let (reg, headers) = registry_with(PortId::Preview, count, max);
            for _ in 0..500 {
                let slot = rng.gen_range(0..count);
                match rng.gen_range(0..3) {
                    0 => {
                        let _ = reg.queue(PortId::Preview, slot);
                    }
                    1 => {
                        let _ = reg.complete(headers[slot]);
                    }
                    _ => {
                        let _ = reg.release(PortId::Preview, slot);
                    }
                }
                let counts = reg.counts(PortId::Preview);
                assert!(
                    counts.fill <= max,
                    "round {round}: {} buffers in FILL with max_queueable {max}",
                    counts.fill
                );
                assert_eq!(counts.idle + counts.fill + counts.done, count);
            }
        }
    }
}
