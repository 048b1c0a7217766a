//! Device backend seam.
//!
//! The offload engine talks to accelerator hardware exclusively through
//! [`DeviceBackend`]: arena reservation, async copies on a stream, event
//! record/query. [`SimBackend`] is a host-memory implementation used for
//! tests and for machines without accelerators; a real driver binding
//! implements the same trait.

use crate::device::memory::DevPtr;
use crate::error::DeviceError;

/// Ordered channel of asynchronous device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(pub usize);

/// Completion event recorded on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(pub u64);

/// Static properties of a device, queried at registration.
#[derive(Debug, Clone)]
pub struct DeviceProps {
    pub name: String,
    pub multiprocessors: u32,
    pub clock_khz: u32,
    /// Compute capability (major, minor).
    pub capability: (u8, u8),
    pub concurrent_kernels: bool,
}

pub trait DeviceBackend: Send {
    fn props(&self) -> DeviceProps;

    /// (free, total) device memory in bytes.
    fn mem_info(&self) -> (usize, usize);

    /// Reserves the managed arena. Called once at registration.
    fn reserve_arena(&mut self, bytes: usize) -> Result<(), DeviceError>;

    /// Releases the managed arena. Called at device fini.
    fn release_arena(&mut self) -> Result<(), DeviceError>;

    /// Enqueues an async host-to-device copy on `stream`.
    fn memcpy_h2d(&mut self, stream: StreamId, dst: DevPtr, src: &[u8])
        -> Result<(), DeviceError>;

    /// Enqueues an async device-to-host copy on `stream`.
    fn memcpy_d2h(
        &mut self,
        stream: StreamId,
        dst: &mut [u8],
        src: DevPtr,
    ) -> Result<(), DeviceError>;

    /// Records a completion event after the work queued so far on
    /// `stream`.
    fn event_record(&mut self, stream: StreamId) -> Result<EventId, DeviceError>;

    /// Polls an event; `Ok(true)` means every operation before the event
    /// has completed. Never blocks.
    fn event_query(&mut self, event: EventId) -> Result<bool, DeviceError>;

    /// Whether this device can read `other`'s memory directly.
    fn can_access_peer(&self, other: &DeviceProps) -> bool {
        let _ = other;
        false
    }

    /// Mutable view of an arena range, for kernels executed on the host
    /// side of the seam. Real driver backends may not support this and
    /// return an API error; kernels there use raw device pointers.
    fn arena_slice(&mut self, ptr: DevPtr, len: usize) -> Result<&mut [u8], DeviceError>;
}

/// Host-memory device simulator.
///
/// Copies and kernels execute immediately at enqueue time; events are
/// complete as soon as they are recorded. An API failure can be injected
/// to exercise the device-poisoning path.
pub struct SimBackend {
    name: String,
    arena: Vec<u8>,
    free_mem: usize,
    total_mem: usize,
    capability: (u8, u8),
    multiprocessors: u32,
    clock_khz: u32,
    next_event: u64,
    fail_next_api_call: bool,
}

impl SimBackend {
    /// A simulated device with `mem` bytes of free memory.
    pub fn new(name: impl Into<String>, mem: usize) -> Self {
        SimBackend {
            name: name.into(),
            arena: Vec::new(),
            free_mem: mem,
            total_mem: mem,
            capability: (3, 0),
            multiprocessors: 8,
            clock_khz: 1_000_000,
            next_event: 0,
            fail_next_api_call: false,
        }
    }

    pub fn with_capability(mut self, major: u8, minor: u8) -> Self {
        self.capability = (major, minor);
        self
    }

    pub fn with_multiprocessors(mut self, count: u32) -> Self {
        self.multiprocessors = count;
        self
    }

    /// Makes the next backend API call fail, poisoning the device.
    pub fn inject_api_failure(&mut self) {
        self.fail_next_api_call = true;
    }

    fn check_injected(&mut self, what: &str) -> Result<(), DeviceError> {
        if self.fail_next_api_call {
            self.fail_next_api_call = false;
            return Err(DeviceError::Api(format!("injected failure in {what}")));
        }
        Ok(())
    }

    fn range(&self, ptr: DevPtr, len: usize) -> Result<std::ops::Range<usize>, DeviceError> {
        let end = ptr.0 + len;
        if end > self.arena.len() {
            return Err(DeviceError::Api(format!(
                "device access out of arena: {}..{end} of {}",
                ptr.0,
                self.arena.len()
            )));
        }
        Ok(ptr.0..end)
    }
}

impl DeviceBackend for SimBackend {
    fn props(&self) -> DeviceProps {
        DeviceProps {
            name: self.name.clone(),
            multiprocessors: self.multiprocessors,
            clock_khz: self.clock_khz,
            capability: self.capability,
            concurrent_kernels: true,
        }
    }

    fn mem_info(&self) -> (usize, usize) {
        (self.free_mem, self.total_mem)
    }

    fn reserve_arena(&mut self, bytes: usize) -> Result<(), DeviceError> {
        self.check_injected("reserve_arena")?;
        if bytes > self.free_mem {
            return Err(DeviceError::Api("arena larger than device memory".into()));
        }
        self.arena = vec![0u8; bytes];
        self.free_mem -= bytes;
        Ok(())
    }

    fn release_arena(&mut self) -> Result<(), DeviceError> {
        self.free_mem += self.arena.len();
        self.arena = Vec::new();
        Ok(())
    }

    fn memcpy_h2d(
        &mut self,
        _stream: StreamId,
        dst: DevPtr,
        src: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_injected("memcpy_h2d")?;
        let range = self.range(dst, src.len())?;
        self.arena[range].copy_from_slice(src);
        Ok(())
    }

    fn memcpy_d2h(
        &mut self,
        _stream: StreamId,
        dst: &mut [u8],
        src: DevPtr,
    ) -> Result<(), DeviceError> {
        self.check_injected("memcpy_d2h")?;
        let range = self.range(src, dst.len())?;
        dst.copy_from_slice(&self.arena[range]);
        Ok(())
    }

    fn event_record(&mut self, _stream: StreamId) -> Result<EventId, DeviceError> {
        self.check_injected("event_record")?;
        self.next_event += 1;
        Ok(EventId(self.next_event))
    }

    fn event_query(&mut self, _event: EventId) -> Result<bool, DeviceError> {
        self.check_injected("event_query")?;
        Ok(true)
    }

    fn can_access_peer(&self, _other: &DeviceProps) -> bool {
        true
    }

    fn arena_slice(&mut self, ptr: DevPtr, len: usize) -> Result<&mut [u8], DeviceError> {
        let range = self.range(ptr, len)?;
        Ok(&mut self.arena[range])
    }
}
