//! # ninebox-virtio
//!
//! VirtIO transport for ninebox.
//!
//! This crate provides the device-side plumbing that carries 9P frames
//! between a guest driver and the protocol dispatcher:
//!
//! - [`queue`]: virtqueue structures and descriptor-chain walking
//! - [`p9`]: the 9P transport device (device id 9, mount-tag config space)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ninebox-virtio                │
//! │                                              │
//! │  guest RAM ──► VirtQueue ──► Virtio9p        │
//! │                   ▲              │ spawn     │
//! │                   │              ▼           │
//! │               used ring ◄── Dispatcher       │
//! │                               (ninebox-9p)   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Each popped chain becomes one dispatcher task, so slow backend I/O on
//! one request never stalls the queue, and a `Tflush` can overtake the
//! request it cancels.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod p9;
pub mod queue;

pub use error::{Result, VirtioError};
pub use p9::{DeviceState, P9Config, Virtio9p, DEFAULT_MOUNT_TAG, FEATURE_MOUNT_TAG};
pub use queue::{Descriptor, VirtQueue};

/// VirtIO device type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VirtioDeviceId {
    /// Network device.
    Net = 1,
    /// Block device.
    Block = 2,
    /// Console device.
    Console = 3,
    /// Entropy source.
    Rng = 4,
    /// 9P transport.
    NineP = 9,
    /// Socket device.
    Vsock = 19,
    /// Shared filesystem (virtiofs).
    Fs = 26,
}

/// VirtIO device status flags.
#[derive(Debug, Clone, Copy)]
pub struct DeviceStatus(u8);

impl DeviceStatus {
    /// Guest acknowledged the device.
    pub const ACKNOWLEDGE: u8 = 1;
    /// Driver loaded.
    pub const DRIVER: u8 = 2;
    /// Driver is ready.
    pub const DRIVER_OK: u8 = 4;
    /// Feature negotiation complete.
    pub const FEATURES_OK: u8 = 8;
    /// Device hit an unrecoverable error.
    pub const DEVICE_NEEDS_RESET: u8 = 64;
    /// Driver gave up.
    pub const FAILED: u8 = 128;

    /// Creates a status word.
    #[must_use]
    pub const fn new(status: u8) -> Self {
        Self(status)
    }

    /// The raw status value.
    #[must_use]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// Checks a flag.
    #[must_use]
    pub const fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Sets a flag.
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Clears a flag.
    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }
}

/// Trait implemented by VirtIO devices.
pub trait VirtioDevice: Send + Sync {
    /// The device type id.
    fn device_id(&self) -> VirtioDeviceId;

    /// Host feature bits.
    fn features(&self) -> u64;

    /// Accepts the driver's feature selection.
    fn ack_features(&mut self, features: u64);

    /// Reads from the device config space.
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Writes to the device config space.
    fn write_config(&mut self, offset: u64, data: &[u8]);

    /// Activates the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot start serving.
    fn activate(&mut self) -> Result<()>;

    /// Resets the device to its pre-negotiation state.
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flags_set_and_clear() {
        let mut status = DeviceStatus::new(0);
        status.set(DeviceStatus::ACKNOWLEDGE);
        status.set(DeviceStatus::DRIVER);
        assert!(status.has(DeviceStatus::ACKNOWLEDGE));
        assert_eq!(status.raw(), 3);

        status.clear(DeviceStatus::ACKNOWLEDGE);
        assert!(!status.has(DeviceStatus::ACKNOWLEDGE));
        assert!(status.has(DeviceStatus::DRIVER));
    }

    #[test]
    fn nine_p_transport_id_is_nine() {
        assert_eq!(VirtioDeviceId::NineP as u32, 9);
    }
}
