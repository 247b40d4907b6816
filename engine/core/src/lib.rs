#![forbid(unsafe_code)]
#![warn(unreachable_pub)]

pub mod checksum;
pub mod config;
pub mod manifest;
pub mod slot;
pub mod status;

pub use checksum::{Checksum, ChecksumKind};
pub use config::{BootloaderKind, SystemConfig};
pub use manifest::{FileEntry, Image, Manifest};
pub use slot::{Slot, SlotId, SlotRegistry, SlotState, SlotType};
pub use status::SlotStatus;
