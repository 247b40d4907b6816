//! Slot state discovery: which slots are mounted, which one we booted from,
//! and which are active or free to be updated.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use rauc_engine_core::{
    config::SystemConfig,
    slot::{SlotId, SlotState},
};
use tracing::{debug, warn};

use crate::{boot_id::BootnameProvider, progress::Progress};

const MOUNT_TABLE_PATH: &str = "/proc/self/mounts";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no slot configuration found")]
    NoSlotsConfigured,
    #[error("boot identifier could not be determined from the kernel command line")]
    BootIdentifierUnavailable,
    #[error("did not find booted slot")]
    BootedSlotNotFound,
    #[error("failed enumerating mounted filesystems")]
    Mounts(#[source] io::Error),
}

/// One line of the kernel mount table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

/// Per-install view of the slot graph: states and discovered mount points,
/// owned by the install worker for the duration of one install.
#[derive(Debug)]
pub struct Topology {
    states: Vec<SlotState>,
    mountpoints: Vec<Option<PathBuf>>,
    booted: SlotId,
}

impl Topology {
    pub fn state(&self, id: SlotId) -> SlotState {
        self.states[id.index()]
    }

    /// The mount point recorded for `id` during discovery, if the slot was
    /// already mounted when the install started.
    pub fn mountpoint(&self, id: SlotId) -> Option<&Path> {
        self.mountpoints[id.index()].as_deref()
    }

    pub fn booted(&self) -> SlotId {
        self.booted
    }
}

/// Enumerates currently mounted filesystems from the kernel mount table.
pub fn system_mounts() -> io::Result<Vec<MountEntry>> {
    let contents = fs::read_to_string(MOUNT_TABLE_PATH)?;
    Ok(parse_mount_table(&contents))
}

fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device).into(),
                mount_point: unescape_mount_field(mount_point).into(),
            })
        })
        .collect()
}

/// The kernel escapes whitespace and backslashes in mount table fields as
/// octal sequences (`\040` for space and so on).
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) if digits.len() == 3 => {
                out.push(byte as char);
                chars.nth(2);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Resolves `/dev/loopN` to its backing file; other devices pass through.
fn resolve_loop_device(device: &Path) -> PathBuf {
    let Some(name) = device
        .to_str()
        .and_then(|s| s.strip_prefix("/dev/"))
        .filter(|name| name.starts_with("loop"))
    else {
        return device.to_path_buf();
    };
    let syspath = format!("/sys/block/{name}/loop/backing_file");
    match fs::read_to_string(&syspath) {
        Ok(backing) => PathBuf::from(backing.trim_end()),
        Err(_) => device.to_path_buf(),
    }
}

/// Computes the per-install [`Topology`] from the configured slots, the
/// booted-slot identifier, and the current mount table.
///
/// Exactly one slot ends up `booted`; a slot is active iff itself or an
/// ancestor is booted, everything else is inactive.
pub fn determine_states(
    config: &SystemConfig,
    provider: &BootnameProvider,
    mounts: &[MountEntry],
    progress: &Progress,
) -> Result<Topology, Error> {
    let step =
        progress.begin_step("determine_slot_states", "Determining slot states", 0);

    if config.slots.is_empty() {
        return Err(Error::NoSlotsConfigured);
    }

    let mut mountpoints = vec![None; config.slots.len()];
    for entry in mounts {
        let device = resolve_loop_device(&entry.device);
        if let Some(id) = config.slots.find_by_device(&device) {
            debug!(
                "found mountpoint for slot {} at {}",
                config.slots.get(id).name,
                entry.mount_point.display()
            );
            mountpoints[id.index()] = Some(entry.mount_point.clone());
        }
    }

    for (_, slot) in config.slots.iter() {
        if slot.bootname.is_none() && slot.parent.is_some() {
            warn!("no bootname configured for {}", slot.name);
        }
    }

    let bootname = provider().ok_or(Error::BootIdentifierUnavailable)?;
    let booted = config
        .slots
        .find_by_bootname(&bootname)
        .or_else(|| config.slots.find_by_device(Path::new(&bootname)))
        .ok_or(Error::BootedSlotNotFound)?;
    debug!(
        "found booted slot: {} on {}",
        config.slots.get(booted).name,
        config.slots.get(booted).device.display()
    );

    let states = config
        .slots
        .iter()
        .map(|(id, _)| {
            if id == booted {
                SlotState::Booted
            } else if ancestors(config, id).any(|ancestor| ancestor == booted) {
                SlotState::Active
            } else {
                SlotState::Inactive
            }
        })
        .collect();

    step.succeed();
    Ok(Topology {
        states,
        mountpoints,
        booted,
    })
}

fn ancestors<'a>(
    config: &'a SystemConfig,
    id: SlotId,
) -> impl Iterator<Item = SlotId> + 'a {
    std::iter::successors(config.slots.get(id).parent, |&parent| {
        config.slots.get(parent).parent
    })
}

#[cfg(test)]
mod tests {
    use rauc_engine_core::{
        config::{SystemConfig, SystemConfigFile},
        slot::SlotState,
    };

    use super::{
        determine_states, parse_mount_table, unescape_mount_field, Error,
        MountEntry,
    };
    use crate::{boot_id::fixed_provider, progress::Progress};

    fn config() -> SystemConfig {
        let file: SystemConfigFile = toml::from_str(
            r#"
            [system]
            compatible = "device-x"

            [[slot]]
            name = "rootfs.0"
            device = "/dev/sda2"
            bootname = "A"

            [[slot]]
            name = "rootfs.1"
            device = "/dev/sda3"
            bootname = "B"

            [[slot]]
            name = "appfs.0"
            device = "/dev/sda5"
            parent = "rootfs.0"

            [[slot]]
            name = "appfs.1"
            device = "/dev/sda6"
            parent = "rootfs.1"
        "#,
        )
        .unwrap();
        SystemConfig::from_parts("system.toml", file).unwrap()
    }

    fn states(
        config: &SystemConfig,
        bootname: &str,
        mounts: &[MountEntry],
    ) -> Result<super::Topology, Error> {
        determine_states(
            config,
            &fixed_provider(bootname),
            mounts,
            &Progress::disabled(),
        )
    }

    #[test]
    fn booted_slot_is_found_by_bootname() {
        let config = config();
        let topology = states(&config, "A", &[]).unwrap();
        let rootfs_0 = config.slots.find_by_name("rootfs.0").unwrap();
        assert_eq!(rootfs_0, topology.booted());
        assert_eq!(SlotState::Booted, topology.state(rootfs_0));
    }

    #[test]
    fn booted_slot_falls_back_to_device_match() {
        let config = config();
        let topology = states(&config, "/dev/sda3", &[]).unwrap();
        let rootfs_1 = config.slots.find_by_name("rootfs.1").unwrap();
        assert_eq!(rootfs_1, topology.booted());
    }

    #[test]
    fn exactly_one_slot_is_booted_and_children_inherit_activity() {
        let config = config();
        let topology = states(&config, "A", &[]).unwrap();
        let mut booted = 0;
        for (id, slot) in config.slots.iter() {
            if topology.state(id) == SlotState::Booted {
                booted += 1;
            }
            let expected_active =
                slot.name == "rootfs.0" || slot.name == "appfs.0";
            assert_eq!(
                expected_active,
                topology.state(id).is_active(),
                "unexpected activity for {}",
                slot.name
            );
        }
        assert_eq!(1, booted);
    }

    #[test]
    fn mounted_slot_devices_are_recorded() {
        let config = config();
        let mounts = vec![
            MountEntry {
                device: "/dev/sda2".into(),
                mount_point: "/".into(),
            },
            MountEntry {
                device: "/dev/sda5".into(),
                mount_point: "/apps".into(),
            },
        ];
        let topology = states(&config, "A", &mounts).unwrap();
        let appfs_0 = config.slots.find_by_name("appfs.0").unwrap();
        let rootfs_1 = config.slots.find_by_name("rootfs.1").unwrap();
        assert_eq!(
            Some("/apps".as_ref()),
            topology.mountpoint(appfs_0).map(|p| p.as_os_str())
        );
        assert_eq!(None, topology.mountpoint(rootfs_1));
    }

    #[test]
    fn unknown_bootname_fails() {
        let config = config();
        let err = states(&config, "Z", &[]).unwrap_err();
        assert!(matches!(err, Error::BootedSlotNotFound));
    }

    #[test]
    fn missing_boot_identifier_fails() {
        let config = config();
        let provider: crate::boot_id::BootnameProvider =
            std::sync::Arc::new(|| None);
        let err =
            determine_states(&config, &provider, &[], &Progress::disabled())
                .unwrap_err();
        assert!(matches!(err, Error::BootIdentifierUnavailable));
    }

    #[test]
    fn empty_slot_table_fails() {
        let file: SystemConfigFile = toml::from_str(
            "[system]\ncompatible = \"device-x\"\n",
        )
        .unwrap();
        let config = SystemConfig::from_parts("system.toml", file).unwrap();
        let err = states(&config, "A", &[]).unwrap_err();
        assert!(matches!(err, Error::NoSlotsConfigured));
    }

    #[test]
    fn mount_table_fields_are_unescaped() {
        assert_eq!("/mnt/with space", unescape_mount_field("/mnt/with\\040space"));
        assert_eq!("/plain", unescape_mount_field("/plain"));

        let entries = parse_mount_table(
            "/dev/sda2 / ext4 rw 0 0\ntmpfs /tmp tmpfs rw 0 0\n",
        );
        assert_eq!(2, entries.len());
        assert_eq!("/dev/sda2", entries[0].device.to_str().unwrap());
        assert_eq!("/", entries[0].mount_point.to_str().unwrap());
    }
}
