//! The per-slot status record persisted as `slot.raucs` in a slot's root.
//!
//! The record decides whether an image write can be skipped on reinstall.
//! An absent or unreadable file simply means the slot needs an update, so
//! loading is deliberately forgiving; only saving must not fail silently.
//! Unknown keys written by other tools are carried over on rewrite.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use toml::{Table, Value};
use tracing::warn;

use crate::checksum::Checksum;

pub const SLOT_STATUS_NAME: &str = "slot.raucs";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed reading slot status at `{}`", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed parsing slot status at `{}`", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed encoding slot status for `{}`", path.display())]
    Encode {
        path: PathBuf,
        source: toml::ser::Error,
    },
    #[error("failed writing slot status at `{}`", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    /// The slot content is known good and matches `checksum`.
    Ok,
    /// The slot needs (or is undergoing) an update.
    #[default]
    Update,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Update => "update",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SlotStatus {
    pub status: Status,
    pub checksum: Option<Checksum>,
    /// Keys we do not interpret but must preserve on rewrite.
    extra: Table,
}

impl SlotStatus {
    pub fn needs_update() -> Self {
        Self::default()
    }

    pub fn ok_with(checksum: Checksum) -> Self {
        Self {
            status: Status::Ok,
            checksum: Some(checksum),
            extra: Table::new(),
        }
    }

    /// True when the recorded checksum matches `checksum`'s digest.
    pub fn matches(&self, checksum: &Checksum) -> bool {
        self.checksum.as_ref().is_some_and(|c| c.matches(checksum))
    }

    /// Loads the record at `path`.
    ///
    /// A missing `status` key (including the zero-length file case) yields
    /// [`Status::Update`]; callers treat any load *error* the same way.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut table: Table =
            contents.parse().map_err(|source| Error::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let status = match table.remove("status") {
            Some(Value::String(s)) if s == "ok" => Status::Ok,
            _ => Status::Update,
        };
        let checksum = table
            .remove("checksum")
            .and_then(|value| value.try_into::<Checksum>().ok());

        Ok(Self {
            status,
            checksum,
            extra: table,
        })
    }

    /// Writes the record to `path`, merging over any record already present
    /// so that keys this version does not know about survive.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let mut table = match fs::read_to_string(path) {
            Ok(contents) => contents.parse::<Table>().unwrap_or_else(|err| {
                warn!(
                    "discarding unparseable slot status at `{}`: {err}",
                    path.display()
                );
                Table::new()
            }),
            Err(_) => Table::new(),
        };
        for (key, value) in &self.extra {
            table.insert(key.clone(), value.clone());
        }

        table.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        match &self.checksum {
            Some(checksum) => {
                let value = Value::try_from(checksum).map_err(|source| {
                    Error::Encode {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                table.insert("checksum".to_string(), value);
            }
            None => {
                table.remove("checksum");
            }
        }

        let contents =
            toml::to_string(&table).map_err(|source| Error::Encode {
                path: path.to_path_buf(),
                source,
            })?;
        fs::write(path, contents).map_err(|source| Error::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SlotStatus, Status};
    use crate::checksum::Checksum;

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SlotStatus::load(dir.path().join("slot.raucs")).unwrap_err();
        assert!(matches!(err, super::Error::Read { .. }));
    }

    #[test]
    fn zero_length_file_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.raucs");
        std::fs::write(&path, "").unwrap();
        let status = SlotStatus::load(&path).unwrap();
        assert_eq!(Status::Update, status.status);
        assert!(status.checksum.is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.raucs");
        SlotStatus::ok_with(Checksum::sha256("aa11")).save(&path).unwrap();

        let status = SlotStatus::load(&path).unwrap();
        assert_eq!(Status::Ok, status.status);
        assert!(status.matches(&Checksum::sha256("AA11")));
    }

    #[test]
    fn unknown_keys_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.raucs");
        std::fs::write(
            &path,
            "status = \"update\"\ninstalled-by = \"factory\"\n",
        )
        .unwrap();

        SlotStatus::ok_with(Checksum::sha256("aa11")).save(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("installed-by"));
        let status = SlotStatus::load(&path).unwrap();
        assert_eq!(Status::Ok, status.status);
    }

    #[test]
    fn unknown_status_value_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.raucs");
        std::fs::write(&path, "status = \"sideways\"\n").unwrap();
        let status = SlotStatus::load(&path).unwrap();
        assert_eq!(Status::Update, status.status);
    }
}
