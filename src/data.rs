//! Logical data and per-device copy tracking.
//!
//! A [`Datum`] is a logical piece of application data identified by a
//! stable 64-bit key. It owns the host byte buffer and a table of
//! per-device [`DataCopy`] entries (index 0 is the host). Copy coherence
//! follows an invalid/shared/owned protocol: the owner's copy is
//! authoritative, shared copies mirror the owner's version, everything
//! else is invalid.
//!
//! The registry is serialized by the engine's data mutex; copy state for a
//! given device is only mutated by the worker holding that device's driver
//! role.

use crate::device::memory::DevPtr;
use crate::task::{FlowFlags, TaskId};
use std::collections::HashMap;

/// Stable identity of a datum.
pub type DataKey = u64;

/// Device index of the host.
pub const HOST_DEVICE: usize = 0;

/// Reference to one concrete copy of a datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRef {
    pub key: DataKey,
    pub device: usize,
}

impl CopyRef {
    pub fn new(key: DataKey, device: usize) -> Self {
        CopyRef { key, device }
    }
}

/// Coherency state of one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coherency {
    Invalid,
    Shared,
    Owned,
}

/// Transfer state of one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotTransferred,
    UnderTransfer,
    Complete,
}

/// A concrete materialization of a datum on one device.
#[derive(Debug)]
pub struct DataCopy {
    pub device_index: usize,
    /// Arena offset on the owning device; `None` for the host copy.
    pub device_ptr: Option<DevPtr>,
    pub version: u64,
    pub coherency: Coherency,
    pub readers: i32,
    pub transfer: TransferStatus,
    /// The task that scheduled the in-flight transfer; only this task may
    /// publish `TransferStatus::Complete`.
    pub push_task: Option<TaskId>,
}

impl DataCopy {
    fn host() -> Self {
        DataCopy {
            device_index: HOST_DEVICE,
            device_ptr: None,
            version: 0,
            coherency: Coherency::Shared,
            readers: 0,
            transfer: TransferStatus::Complete,
            push_task: None,
        }
    }

    /// A freshly reserved device copy: invalid until staged in.
    pub fn device(device_index: usize, ptr: DevPtr) -> Self {
        DataCopy {
            device_index,
            device_ptr: Some(ptr),
            version: 0,
            coherency: Coherency::Invalid,
            readers: 0,
            transfer: TransferStatus::NotTransferred,
            push_task: None,
        }
    }
}

/// A logical piece of data and its copies across devices.
#[derive(Debug)]
pub struct Datum {
    pub key: DataKey,
    pub nb_bytes: usize,
    /// Device whose copy is authoritative while it is `Owned`.
    pub owner_device: usize,
    copies: Vec<Option<DataCopy>>,
    host_buffer: Vec<u8>,
}

impl Datum {
    pub fn copy(&self, device: usize) -> Option<&DataCopy> {
        self.copies.get(device).and_then(|c| c.as_ref())
    }

    pub fn copy_mut(&mut self, device: usize) -> Option<&mut DataCopy> {
        self.copies.get_mut(device).and_then(|c| c.as_mut())
    }

    pub fn host_bytes(&self) -> &[u8] {
        &self.host_buffer
    }

    pub fn host_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.host_buffer
    }

    /// Number of non-host devices holding a copy.
    pub fn nb_device_copies(&self) -> usize {
        self.copies
            .iter()
            .skip(1)
            .filter(|c| c.is_some())
            .count()
    }
}

/// Per-engine registry of all datums.
#[derive(Debug)]
pub struct DataTable {
    entries: HashMap<DataKey, Datum>,
    nb_devices: usize,
}

impl DataTable {
    /// Creates a registry sized for `nb_devices` device slots (host
    /// included).
    pub fn new(nb_devices: usize) -> Self {
        DataTable {
            entries: HashMap::new(),
            nb_devices: nb_devices.max(1),
        }
    }

    /// Registers a datum with its initial host contents. Re-registering an
    /// existing key replaces the host bytes and resets the copy table.
    pub fn register(&mut self, key: DataKey, bytes: Vec<u8>) {
        let mut copies: Vec<Option<DataCopy>> = (0..self.nb_devices).map(|_| None).collect();
        copies[HOST_DEVICE] = Some(DataCopy::host());
        self.entries.insert(
            key,
            Datum {
                key,
                nb_bytes: bytes.len(),
                owner_device: HOST_DEVICE,
                copies,
                host_buffer: bytes,
            },
        );
    }

    pub fn get(&self, key: DataKey) -> Option<&Datum> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: DataKey) -> Option<&mut Datum> {
        self.entries.get_mut(&key)
    }

    /// Returns the copy of `key` on `device`, if any.
    pub fn get_copy(&self, key: DataKey, device: usize) -> Option<&DataCopy> {
        self.entries.get(&key).and_then(|d| d.copy(device))
    }

    pub fn get_copy_mut(&mut self, key: DataKey, device: usize) -> Option<&mut DataCopy> {
        self.entries.get_mut(&key).and_then(|d| d.copy_mut(device))
    }

    /// Installs `copy` as the copy of `key` on `device`.
    ///
    /// At most one copy per (datum, device) may exist; attaching over an
    /// existing copy is a logic error.
    pub fn attach(&mut self, key: DataKey, copy: DataCopy, device: usize) {
        let datum = self
            .entries
            .get_mut(&key)
            .unwrap_or_else(|| panic!("attach to unregistered datum {key:#x}"));
        debug_assert!(datum.copies[device].is_none(), "duplicate copy on device");
        datum.copies[device] = Some(copy);
    }

    /// Clears the copy of `key` on `device`, returning it.
    pub fn detach(&mut self, key: DataKey, device: usize) -> Option<DataCopy> {
        let datum = self.entries.get_mut(&key)?;
        if datum.owner_device == device {
            datum.owner_device = HOST_DEVICE;
        }
        datum.copies[device].take()
    }

    /// Decides whether moving the copy of `key` on `dst` up to date
    /// requires a transfer, and updates the coherency state for the given
    /// access mode.
    ///
    /// Returns the source device index the data must come from, or -1 when
    /// the destination already holds (or is already receiving) the
    /// required version.
    pub fn transfer_ownership_to(&mut self, key: DataKey, dst: usize, access: FlowFlags) -> i32 {
        let datum = self
            .entries
            .get_mut(&key)
            .unwrap_or_else(|| panic!("ownership transfer on unregistered datum {key:#x}"));

        let owner = datum.owner_device;
        let auth_dev = if owner != dst
            && datum
                .copy(owner)
                .map_or(false, |c| c.coherency == Coherency::Owned)
        {
            owner
        } else {
            HOST_DEVICE
        };
        let auth_version = datum.copy(auth_dev).map_or(0, |c| c.version);

        let dst_copy = datum
            .copy_mut(dst)
            .expect("ownership transfer to a device without a copy");

        let valid = dst_copy.coherency != Coherency::Invalid && dst_copy.version >= auth_version;
        let in_flight =
            dst_copy.transfer == TransferStatus::UnderTransfer && dst_copy.version >= auth_version;

        if access.is_read() {
            dst_copy.readers += 1;
        }

        if access.is_write() {
            dst_copy.coherency = Coherency::Owned;
            datum.owner_device = dst;
            for (d, slot) in datum.copies.iter_mut().enumerate() {
                if d == dst {
                    continue;
                }
                if let Some(c) = slot {
                    c.coherency = Coherency::Invalid;
                }
            }
        } else if datum.copy(dst).map(|c| c.coherency) == Some(Coherency::Invalid) {
            datum.copy_mut(dst).unwrap().coherency = Coherency::Shared;
        }

        if valid || in_flight {
            -1
        } else {
            auth_dev as i32
        }
    }

    /// All registered keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = DataKey> + '_ {
        self.entries.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(key: DataKey, len: usize) -> DataTable {
        let mut t = DataTable::new(3);
        t.register(key, vec![0u8; len]);
        t
    }

    #[test]
    fn test_register_creates_host_copy() {
        let t = table_with(7, 16);
        let host = t.get_copy(7, HOST_DEVICE).unwrap();
        assert_eq!(host.coherency, Coherency::Shared);
        assert_eq!(host.version, 0);
        assert_eq!(t.get(7).unwrap().nb_bytes, 16);
    }

    #[test]
    fn test_attach_detach_roundtrip() {
        let mut t = table_with(7, 16);
        t.attach(7, DataCopy::device(2, DevPtr(0)), 2);
        assert!(t.get_copy(7, 2).is_some());
        let copy = t.detach(7, 2).unwrap();
        assert_eq!(copy.device_index, 2);
        assert!(t.get_copy(7, 2).is_none());
    }

    #[test]
    fn test_fresh_copy_requires_transfer() {
        let mut t = table_with(7, 16);
        t.attach(7, DataCopy::device(2, DevPtr(0)), 2);
        let src = t.transfer_ownership_to(7, 2, FlowFlags::READ);
        assert_eq!(src, HOST_DEVICE as i32);
        assert_eq!(t.get_copy(7, 2).unwrap().readers, 1);
        assert_eq!(t.get_copy(7, 2).unwrap().coherency, Coherency::Shared);
    }

    #[test]
    fn test_valid_copy_needs_no_transfer() {
        let mut t = table_with(7, 16);
        t.attach(7, DataCopy::device(2, DevPtr(0)), 2);
        assert_eq!(t.transfer_ownership_to(7, 2, FlowFlags::READ), 0);
        // second read of the now-shared copy: no transfer
        let copy = t.get_copy_mut(7, 2).unwrap();
        copy.transfer = TransferStatus::Complete;
        assert_eq!(t.transfer_ownership_to(7, 2, FlowFlags::READ), -1);
        assert_eq!(t.get_copy(7, 2).unwrap().readers, 2);
    }

    #[test]
    fn test_write_takes_ownership_and_invalidates() {
        let mut t = table_with(7, 16);
        t.attach(7, DataCopy::device(2, DevPtr(0)), 2);
        t.transfer_ownership_to(7, 2, FlowFlags::READ_WRITE);
        let datum = t.get(7).unwrap();
        assert_eq!(datum.owner_device, 2);
        assert_eq!(datum.copy(2).unwrap().coherency, Coherency::Owned);
        assert_eq!(
            datum.copy(HOST_DEVICE).unwrap().coherency,
            Coherency::Invalid
        );
    }

    #[test]
    fn test_single_owner_invariant() {
        let mut t = DataTable::new(4);
        t.register(9, vec![0u8; 8]);
        t.attach(9, DataCopy::device(2, DevPtr(0)), 2);
        t.attach(9, DataCopy::device(3, DevPtr(0)), 3);
        t.transfer_ownership_to(9, 2, FlowFlags::WRITE);
        t.transfer_ownership_to(9, 3, FlowFlags::WRITE);
        let datum = t.get(9).unwrap();
        let owned = (0..4)
            .filter_map(|d| datum.copy(d))
            .filter(|c| c.coherency == Coherency::Owned)
            .count();
        assert_eq!(owned, 1);
        assert_eq!(datum.owner_device, 3);
    }
}
