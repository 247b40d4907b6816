//! Discovery of the slot the system booted from.
//!
//! The kernel command line is read once and cached for the lifetime of the
//! process. The provider indirection exists so that topology discovery and
//! the handler environment can be driven by a test-controlled identifier
//! instead of `/proc/cmdline`.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use rauc_engine_core::config::BootloaderKind;

const CMDLINE_PATH: &str = "/proc/cmdline";

/// Yields the booted-slot identifier, or `None` when it cannot be
/// determined.
pub type BootnameProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

static CMDLINE_BOOTNAME: OnceCell<Option<String>> = OnceCell::new();

/// The production provider: parses `/proc/cmdline` once and caches the
/// result.
pub fn cmdline_provider(bootloader: BootloaderKind) -> BootnameProvider {
    Arc::new(move || {
        CMDLINE_BOOTNAME
            .get_or_init(|| {
                let cmdline = std::fs::read_to_string(CMDLINE_PATH).ok()?;
                extract_bootname(bootloader, &cmdline)
            })
            .clone()
    })
}

/// A fixed identifier, mainly for tests and tooling.
pub fn fixed_provider<T: Into<String>>(bootname: T) -> BootnameProvider {
    let bootname = bootname.into();
    Arc::new(move || Some(bootname.clone()))
}

/// Extracts the booted-slot identifier from a kernel command line.
///
/// Rules are ordered, first match wins: an explicit `rauc.slot=` override,
/// then barebox's `bootstate.active=` (only when barebox is the configured
/// bootloader), then the `root=` device.
pub fn extract_bootname(
    bootloader: BootloaderKind,
    cmdline: &str,
) -> Option<String> {
    let value_of = |key: &str| {
        cmdline
            .split_ascii_whitespace()
            .find_map(|token| token.strip_prefix(key))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    if let Some(explicit) = value_of("rauc.slot=") {
        return Some(explicit);
    }
    if bootloader == BootloaderKind::Barebox {
        if let Some(active) = value_of("bootstate.active=") {
            return Some(active);
        }
    }
    value_of("root=")
}

#[cfg(test)]
mod tests {
    use rauc_engine_core::config::BootloaderKind;

    use super::extract_bootname;

    #[test]
    fn explicit_slot_override_wins() {
        let cmdline = "console=ttyS0 rauc.slot=B root=/dev/sda2 ro";
        assert_eq!(
            Some("B".to_string()),
            extract_bootname(BootloaderKind::Uboot, cmdline)
        );
    }

    #[test]
    fn bootstate_is_only_honored_for_barebox() {
        let cmdline = "bootstate.active=system0 root=/dev/sda2";
        assert_eq!(
            Some("system0".to_string()),
            extract_bootname(BootloaderKind::Barebox, cmdline)
        );
        assert_eq!(
            Some("/dev/sda2".to_string()),
            extract_bootname(BootloaderKind::Grub, cmdline)
        );
    }

    #[test]
    fn root_device_is_the_fallback() {
        let cmdline = "console=ttyS0 root=PARTUUID=0123-4567 quiet";
        assert_eq!(
            Some("PARTUUID=0123-4567".to_string()),
            extract_bootname(BootloaderKind::Noop, cmdline)
        );
    }

    #[test]
    fn no_matching_token_yields_none() {
        assert_eq!(
            None,
            extract_bootname(BootloaderKind::Noop, "console=ttyS0 quiet")
        );
    }
}
