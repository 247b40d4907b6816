//! The system configuration: compatibility token, bootloader flavor, mount
//! prefix, optional install hooks, and the slot table.
//!
//! The configuration is loaded once at startup and is read-only for the
//! lifetime of an install.

use std::{
    fmt::{self, Display},
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::slot::{self, SlotDecl, SlotRegistry, SlotType};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed reading system config at `{}`", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed parsing system config at `{}`", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid slot configuration")]
    Slots(#[from] slot::Error),
}

/// The platform bootloader the engine hands bootability control to.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum BootloaderKind {
    Grub,
    Uboot,
    Barebox,
    Efi,
    #[default]
    Noop,
}

impl Display for BootloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootloaderKind::Grub => "grub",
            BootloaderKind::Uboot => "uboot",
            BootloaderKind::Barebox => "barebox",
            BootloaderKind::Efi => "efi",
            BootloaderKind::Noop => "noop",
        };
        f.write_str(s)
    }
}

fn default_mount_prefix() -> PathBuf {
    PathBuf::from("/mnt/rauc")
}

/// Raw serde model of the config file; see [`SystemConfig`] for the
/// validated form used by the engine.
#[derive(Debug, Deserialize)]
pub struct SystemConfigFile {
    pub system: SystemSection,
    #[serde(default)]
    pub handlers: HandlersSection,
    #[serde(default, rename = "slot")]
    pub slots: Vec<SlotEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SystemSection {
    pub compatible: String,
    #[serde(default)]
    pub bootloader: BootloaderKind,
    #[serde(default = "default_mount_prefix")]
    pub mount_prefix: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct HandlersSection {
    #[serde(default)]
    pub pre_install: Option<PathBuf>,
    #[serde(default)]
    pub post_install: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct SlotEntry {
    pub name: String,
    pub device: PathBuf,
    #[serde(default, rename = "type")]
    pub kind: SlotType,
    /// Defaults to the slot name up to the last `.`, so `rootfs.1` belongs
    /// to class `rootfs`.
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub bootname: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

impl SlotEntry {
    fn class(&self) -> String {
        match &self.class {
            Some(class) => class.clone(),
            None => self
                .name
                .rsplit_once('.')
                .map(|(prefix, _)| prefix.to_string())
                .unwrap_or_else(|| self.name.clone()),
        }
    }
}

#[derive(Debug)]
pub struct SystemConfig {
    pub compatible: String,
    pub bootloader: BootloaderKind,
    pub mount_prefix: PathBuf,
    pub preinstall_handler: Option<PathBuf>,
    pub postinstall_handler: Option<PathBuf>,
    /// Where the config was loaded from; exported to handlers.
    pub config_path: PathBuf,
    pub slots: SlotRegistry,
}

impl SystemConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SystemConfigFile =
            toml::from_str(&contents).map_err(|source| Error::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_parts(path, file)
    }

    /// Builds the validated config from an already-deserialized file model;
    /// the frontend uses this after layering config sources.
    pub fn from_parts<P: AsRef<Path>>(
        path: P,
        file: SystemConfigFile,
    ) -> Result<Self, Error> {
        let decls = file
            .slots
            .iter()
            .map(|entry| SlotDecl {
                name: entry.name.clone(),
                class: entry.class(),
                device: entry.device.clone(),
                kind: entry.kind,
                bootname: entry.bootname.clone(),
                parent: entry.parent.clone(),
            })
            .collect();
        Ok(Self {
            compatible: file.system.compatible,
            bootloader: file.system.bootloader,
            mount_prefix: file.system.mount_prefix,
            preinstall_handler: file.handlers.pre_install,
            postinstall_handler: file.handlers.post_install,
            config_path: path.as_ref().to_path_buf(),
            slots: SlotRegistry::build(decls)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BootloaderKind, SystemConfig, SystemConfigFile};
    use crate::slot::SlotType;

    const CONFIG: &str = r#"
        [system]
        compatible = "device-x"
        bootloader = "barebox"
        mount_prefix = "/mnt/engine"

        [handlers]
        pre_install = "/usr/lib/engine/pre-install"

        [[slot]]
        name = "rootfs.0"
        device = "/dev/sda2"
        type = "ext4"
        bootname = "A"

        [[slot]]
        name = "rootfs.1"
        device = "/dev/sda3"
        type = "ext4"
        bootname = "B"

        [[slot]]
        name = "appfs.0"
        device = "/dev/sda5"
        type = "ext4"
        parent = "rootfs.0"
    "#;

    fn parse(contents: &str) -> SystemConfig {
        let file: SystemConfigFile = toml::from_str(contents).unwrap();
        SystemConfig::from_parts("/etc/rauc/system.toml", file).unwrap()
    }

    #[test]
    fn config_parses_and_derives_classes() {
        let config = parse(CONFIG);
        assert_eq!("device-x", config.compatible);
        assert_eq!(BootloaderKind::Barebox, config.bootloader);
        assert_eq!("/mnt/engine", config.mount_prefix.to_str().unwrap());
        assert!(config.preinstall_handler.is_some());
        assert!(config.postinstall_handler.is_none());

        let appfs = config.slots.find_by_name("appfs.0").unwrap();
        assert_eq!("appfs", config.slots.get(appfs).class);
        assert_eq!(SlotType::Ext4, config.slots.get(appfs).kind);
        assert!(config.slots.get(appfs).parent.is_some());
    }

    #[test]
    fn defaults_apply_when_sections_are_omitted() {
        let config = parse(
            r#"
            [system]
            compatible = "device-x"

            [[slot]]
            name = "rootfs.0"
            device = "/dev/sda2"
        "#,
        );
        assert_eq!(BootloaderKind::Noop, config.bootloader);
        assert_eq!("/mnt/rauc", config.mount_prefix.to_str().unwrap());
        let rootfs = config.slots.find_by_name("rootfs.0").unwrap();
        assert_eq!(SlotType::Raw, config.slots.get(rootfs).kind);
    }

    #[test]
    fn slot_cycle_in_config_is_rejected() {
        let file: SystemConfigFile = toml::from_str(
            r#"
            [system]
            compatible = "device-x"

            [[slot]]
            name = "a.0"
            device = "/dev/sda1"
            parent = "b.0"

            [[slot]]
            name = "b.0"
            device = "/dev/sda2"
            parent = "a.0"
        "#,
        )
        .unwrap();
        let err = SystemConfig::from_parts("system.toml", file).unwrap_err();
        assert!(matches!(err, super::Error::Slots(_)));
    }
}
