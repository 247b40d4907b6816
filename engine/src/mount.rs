//! Mount lifecycle for slots and update bundles.
//!
//! Slot devices are mounted read-write through mount(2) directly; bundles
//! are squashfs images that need loop setup, which is left to the mount(8)
//! helper. The [`Mounter`] trait exists so the orchestrator can be driven
//! against scratch directories in tests.

use std::{
    ffi::CString,
    fs, io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::Command,
};

use rauc_engine_core::slot::SlotType;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mount prefix path `{}` does not exist", .0.display())]
    MissingPrefix(PathBuf),
    #[error("failed creating mount path `{}`", path.display())]
    CreateMountPoint { path: PathBuf, source: io::Error },
    #[error("slot type `{0}` cannot be mounted")]
    Unmountable(SlotType),
    #[error("failed mounting `{}` on `{}`", device.display(), mount_point.display())]
    Mount {
        device: PathBuf,
        mount_point: PathBuf,
        source: io::Error,
    },
    #[error("failed spawning mount helper for `{}`", bundle.display())]
    SpawnMountHelper { bundle: PathBuf, source: io::Error },
    #[error("failed mounting bundle `{}` on `{}`: {message}", bundle.display(), mount_point.display())]
    MountBundle {
        bundle: PathBuf,
        mount_point: PathBuf,
        message: String,
    },
    #[error("failed unmounting `{}`", .0.display())]
    Unmount(PathBuf, #[source] io::Error),
}

pub trait Mounter: Send + Sync {
    fn mount_slot(
        &self,
        device: &Path,
        kind: SlotType,
        mount_point: &Path,
    ) -> Result<(), Error>;

    fn mount_bundle(&self, bundle: &Path, mount_point: &Path)
        -> Result<(), Error>;

    fn unmount(&self, mount_point: &Path) -> Result<(), Error>;
}

/// The production mounter, talking to the kernel.
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount_slot(
        &self,
        device: &Path,
        kind: SlotType,
        mount_point: &Path,
    ) -> Result<(), Error> {
        let fs_name = kind.fs_name().ok_or(Error::Unmountable(kind))?;
        debug!(
            "mounting {} ({fs_name}) on {}",
            device.display(),
            mount_point.display()
        );
        sys_mount(device, mount_point, fs_name).map_err(|source| Error::Mount {
            device: device.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            source,
        })
    }

    fn mount_bundle(
        &self,
        bundle: &Path,
        mount_point: &Path,
    ) -> Result<(), Error> {
        debug!(
            "loop-mounting bundle {} on {}",
            bundle.display(),
            mount_point.display()
        );
        let output = Command::new("mount")
            .args(["-t", "squashfs", "-o", "loop,ro"])
            .arg(bundle)
            .arg(mount_point)
            .output()
            .map_err(|source| Error::SpawnMountHelper {
                bundle: bundle.to_path_buf(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::MountBundle {
                bundle: bundle.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_string(),
            })
        }
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), Error> {
        debug!("unmounting {}", mount_point.display());
        sys_umount(mount_point)
            .map_err(|source| Error::Unmount(mount_point.to_path_buf(), source))
    }
}

// Opinionated Rust wrapper over mount(2)
fn sys_mount(src: &Path, dst: &Path, fstype: &str) -> io::Result<()> {
    let src = CString::new(src.as_os_str().as_bytes())?;
    let dst = CString::new(dst.as_os_str().as_bytes())?;
    let fstype = CString::new(fstype)?;
    let err = unsafe {
        libc::mount(
            src.as_ptr(),
            dst.as_ptr(),
            fstype.as_ptr(),
            0,
            std::ptr::null(),
        )
    };

    match err {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

fn sys_umount(path: &Path) -> io::Result<()> {
    let path = CString::new(path.as_os_str().as_bytes())?;
    let err = unsafe { libc::umount2(path.as_ptr(), libc::UMOUNT_NOFOLLOW) };

    match err {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Materializes the mount point `<prefix>/<name>`, creating the subdir if
/// needed. The prefix itself must already exist.
pub fn create_mount_point(prefix: &Path, name: &str) -> Result<PathBuf, Error> {
    if !prefix.is_dir() {
        return Err(Error::MissingPrefix(prefix.to_path_buf()));
    }
    let mount_point = prefix.join(name);
    if !mount_point.is_dir() {
        fs::create_dir(&mount_point).map_err(|source| Error::CreateMountPoint {
            path: mount_point.clone(),
            source,
        })?;
    }
    Ok(mount_point)
}

#[cfg(test)]
mod tests {
    use super::{create_mount_point, Error};

    #[test]
    fn create_mount_point_requires_the_prefix() {
        let err =
            create_mount_point("/nonexistent/prefix".as_ref(), "bundle")
                .unwrap_err();
        assert!(matches!(err, Error::MissingPrefix(_)));
    }

    #[test]
    fn create_mount_point_is_idempotent() {
        let prefix = tempfile::tempdir().unwrap();
        let first = create_mount_point(prefix.path(), "image").unwrap();
        let second = create_mount_point(prefix.path(), "image").unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }
}
