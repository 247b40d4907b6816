//! The bootloader capability consumed by the install orchestrator.
//!
//! Only base slots are handed to the bootloader. Platform backends (grub,
//! u-boot, barebox, efi) are provided by the embedding system; the engine
//! ships the `noop` backend for setups where the bootloader needs no help.

use rauc_engine_core::slot::Slot;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
#[error("bootloader operation `{operation}` failed for slot `{slot}`: {message}")]
pub struct Error {
    pub operation: &'static str,
    pub slot: String,
    pub message: String,
}

pub trait BootChooser: Send + Sync {
    /// Marks a base slot good (`true`) or bad/non-bootable (`false`).
    fn set_state(&self, slot: &Slot, good: bool) -> Result<(), Error>;

    /// Makes a base slot the next-boot default.
    fn set_primary(&self, slot: &Slot) -> Result<(), Error>;
}

/// Backend for `bootloader = "noop"`: acknowledges every request.
pub struct NoopBootChooser;

impl BootChooser for NoopBootChooser {
    fn set_state(&self, slot: &Slot, good: bool) -> Result<(), Error> {
        debug!(
            "noop bootloader: set_state {} -> {}",
            slot.name,
            if good { "good" } else { "bad" }
        );
        Ok(())
    }

    fn set_primary(&self, slot: &Slot) -> Result<(), Error> {
        debug!("noop bootloader: set_primary {}", slot.name);
        Ok(())
    }
}
