//! The image copy path: streaming a filesystem image onto a block or UBI
//! volume device.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    mem,
    os::unix::io::AsRawFd as _,
    path::{Path, PathBuf},
};

use rauc_engine_core::slot::SlotType;
use tracing::debug;

use crate::progress::Progress;

const COPY_CHUNK_SIZE: usize = 8 * 1024;

const WRITE: u8 = 1;
const NRBITS: u32 = 8;
const TYPEBITS: u32 = 8;
const SIZEBITS: u32 = 14;

const NRSHIFT: u32 = 0;
const TYPESHIFT: u32 = NRSHIFT + NRBITS;
const SIZESHIFT: u32 = TYPESHIFT + TYPEBITS;
const DIRSHIFT: u32 = SIZESHIFT + SIZEBITS;

/// Lifted from nix and /usr/include/asm-generic/ioctl.h
macro_rules! iow {
    ($ty:expr, $nr:expr, $sz:expr) => {
        ((WRITE as libc::c_ulong) << DIRSHIFT)
            | (($ty as libc::c_ulong) << TYPESHIFT)
            | (($nr as libc::c_ulong) << NRSHIFT)
            | (($sz as libc::c_ulong) << SIZESHIFT)
    };
}

/// `UBI_IOCVOLUP` from `<mtd/ubi-user.h>`: starts a volume update expecting
/// exactly the passed number of bytes.
pub(crate) const UBI_IOCVOLUP: libc::c_ulong =
    iow!(b'O', 0, mem::size_of::<i64>());

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open image `{}` for reading", .0.display())]
    OpenImage(PathBuf, #[source] io::Error),
    #[error("image `{}` seek failed", .0.display())]
    Seek(PathBuf, #[source] io::Error),
    #[error("input image `{}` is empty", .0.display())]
    EmptyImage(PathBuf),
    #[error("opening output device `{}` failed", .0.display())]
    OpenDevice(PathBuf, #[source] io::Error),
    #[error("ubi volume update failed on `{}`", .0.display())]
    UbiVolumeUpdate(PathBuf, #[source] io::Error),
    #[error("failed reading from image `{}`", .0.display())]
    ReadImage(PathBuf, #[source] io::Error),
    #[error("failed writing to device `{}`", .0.display())]
    WriteDevice(PathBuf, #[source] io::Error),
    #[error(
        "image size and written size differ; wrote {written} of {expected} bytes to `{}`",
        device.display()
    )]
    ShortWrite {
        device: PathBuf,
        written: u64,
        expected: u64,
    },
    #[error("failed flushing device `{}`", .0.display())]
    Flush(PathBuf, #[source] io::Error),
}

/// Streams the image at `src` onto the device at `dest`.
///
/// Either exactly the image size is written and the call succeeds, or an
/// error is returned; a partial write is never reported as success. For
/// `ubifs` destinations the UBI volume update ioctl is issued with the image
/// size before any byte is streamed.
pub fn copy_image(
    src: &Path,
    dest: &Path,
    fs_type: SlotType,
    progress: &Progress,
) -> Result<(), Error> {
    let step = progress.begin_step("copy_image", "Copying image", 0);

    let mut image = File::open(src)
        .map_err(|e| Error::OpenImage(src.to_path_buf(), e))?;
    let image_size = image
        .seek(SeekFrom::End(0))
        .and_then(|size| image.seek(SeekFrom::Start(0)).map(|_| size))
        .map_err(|e| Error::Seek(src.to_path_buf(), e))?;
    debug!("input image size is {image_size} bytes");
    if image_size == 0 {
        return Err(Error::EmptyImage(src.to_path_buf()));
    }

    let mut device = OpenOptions::new()
        .write(true)
        .open(dest)
        .map_err(|e| Error::OpenDevice(dest.to_path_buf(), e))?;

    if fs_type == SlotType::Ubifs {
        ubi_volume_update(&device, image_size as i64)
            .map_err(|e| Error::UbiVolumeUpdate(dest.to_path_buf(), e))?;
    }

    let mut buffer = [0u8; COPY_CHUNK_SIZE];
    let mut written: u64 = 0;
    let mut last_percent = u8::MAX;
    loop {
        let n = image
            .read(&mut buffer)
            .map_err(|e| Error::ReadImage(src.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        device
            .write_all(&buffer[..n])
            .map_err(|e| Error::WriteDevice(dest.to_path_buf(), e))?;
        written += n as u64;

        let percent = (written * 100 / image_size) as u8;
        if progress.enabled() && percent != last_percent {
            last_percent = percent;
            progress.step_percentage("copy_image", percent);
        }
    }

    if written != image_size {
        return Err(Error::ShortWrite {
            device: dest.to_path_buf(),
            written,
            expected: image_size,
        });
    }

    device
        .sync_all()
        .map_err(|e| Error::Flush(dest.to_path_buf(), e))?;

    step.succeed();
    Ok(())
}

/// Puts the UBI volume behind `device` into update mode, expecting exactly
/// `size` bytes to follow.
fn ubi_volume_update(device: &File, size: i64) -> io::Result<()> {
    let ret = unsafe {
        libc::ioctl(device.as_raw_fd(), UBI_IOCVOLUP, &size as *const i64)
    };
    match ret {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write as _,
        sync::{Arc, Mutex},
    };

    use rauc_engine_core::slot::SlotType;

    use super::{copy_image, Error, UBI_IOCVOLUP};
    use crate::progress::{Progress, ProgressEvent};

    #[test]
    fn ubi_volume_update_request_matches_the_kernel_header() {
        // _IOW('O', 0, __s64)
        assert_eq!(0x4008_4F00, UBI_IOCVOLUP);
    }

    #[test]
    fn copies_the_image_bit_for_bit() {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(&[0xa5u8; 20_000]).unwrap();
        let dest = tempfile::NamedTempFile::new().unwrap();

        copy_image(
            src.path(),
            dest.path(),
            SlotType::Ext4,
            &Progress::disabled(),
        )
        .unwrap();

        let copied = std::fs::read(dest.path()).unwrap();
        assert_eq!(20_000, copied.len());
        assert!(copied.iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn empty_image_is_rejected() {
        let src = tempfile::NamedTempFile::new().unwrap();
        let dest = tempfile::NamedTempFile::new().unwrap();
        let err = copy_image(
            src.path(),
            dest.path(),
            SlotType::Ext4,
            &Progress::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::EmptyImage(_)));
    }

    #[test]
    fn missing_source_fails_to_open() {
        let dest = tempfile::NamedTempFile::new().unwrap();
        let err = copy_image(
            "/nonexistent/image".as_ref(),
            dest.path(),
            SlotType::Ext4,
            &Progress::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::OpenImage(..)));
    }

    #[test]
    fn percentage_is_published_monotonically_up_to_100() {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(&[0u8; 64 * 1024]).unwrap();
        let dest = tempfile::NamedTempFile::new().unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let progress = Progress::new(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        }));

        copy_image(src.path(), dest.path(), SlotType::Ext4, &progress).unwrap();

        let percents: Vec<u8> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::StepPercentage {
                    name: "copy_image",
                    percent,
                } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(!percents.is_empty());
        assert_eq!(Some(&100), percents.last());
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }
}
