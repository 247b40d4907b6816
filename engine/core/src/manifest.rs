//! The validated update manifest handed to the install engine.
//!
//! Parsing the bundle container and checking the CMS signature happen in the
//! layer above; what arrives here is the manifest payload itself. The TOML
//! shape is deserialized through an unchecked shadow struct so that a
//! `Manifest` value always upholds its invariants.

use serde::{de, Deserialize};

use crate::checksum::Checksum;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed parsing manifest")]
    Parse(#[from] toml::de::Error),
    #[error("manifest is missing the `update.compatible` token")]
    MissingCompatible,
    #[error("manifest references no images or files")]
    Empty,
}

/// A filesystem image targeting one slot class.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub slotclass: String,
    pub filename: String,
    pub checksum: Checksum,
}

/// A single file payload, installed into a mounted slot at `destname`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub slotclass: String,
    pub filename: String,
    pub destname: String,
    pub checksum: Checksum,
}

/// A custom install handler shipped inside the bundle.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Handler {
    pub filename: String,
    /// Passed to the handler as one extra argument, verbatim.
    #[serde(default)]
    pub args: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Manifest {
    update_compatible: String,
    handler: Option<Handler>,
    images: Vec<Image>,
    files: Vec<FileEntry>,
}

impl Manifest {
    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let unchecked: UncheckedManifest = toml::from_str(contents)?;
        unchecked.try_into()
    }

    /// The compatibility token matched against the system configuration.
    pub fn update_compatible(&self) -> &str {
        &self.update_compatible
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// The slot classes referenced by this manifest, images first, then
    /// files, de-duplicated so that the *last* occurrence of a class decides
    /// its position.
    pub fn referenced_classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = Vec::new();
        let referenced = self
            .images
            .iter()
            .map(|image| image.slotclass.as_str())
            .chain(self.files.iter().map(|file| file.slotclass.as_str()));
        for class in referenced {
            if let Some(pos) = classes.iter().position(|c| *c == class) {
                classes.remove(pos);
            }
            classes.push(class);
        }
        classes
    }

    /// The first image targeting `class`, if any.
    pub fn image_for_class(&self, class: &str) -> Option<&Image> {
        self.images.iter().find(|image| image.slotclass == class)
    }

    /// All file payloads targeting `class`, in manifest order.
    pub fn files_for_class<'a>(
        &'a self,
        class: &'a str,
    ) -> impl Iterator<Item = &'a FileEntry> + 'a {
        self.files.iter().filter(move |file| file.slotclass == class)
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let unchecked = UncheckedManifest::deserialize(deserializer)?;
        unchecked.try_into().map_err(de::Error::custom)
    }
}

/// Shadow of [`Manifest`] used as the raw deserialization target; the
/// conversion below enforces the manifest invariants.
#[derive(Debug, Deserialize)]
struct UncheckedManifest {
    update: UpdateSection,
    #[serde(default)]
    handler: Option<Handler>,
    #[serde(default, rename = "image")]
    images: Vec<Image>,
    #[serde(default, rename = "file")]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct UpdateSection {
    compatible: String,
}

impl TryFrom<UncheckedManifest> for Manifest {
    type Error = Error;

    fn try_from(unchecked: UncheckedManifest) -> Result<Self, Self::Error> {
        let UncheckedManifest {
            update,
            handler,
            images,
            files,
        } = unchecked;
        if update.compatible.is_empty() {
            return Err(Error::MissingCompatible);
        }
        if images.is_empty() && files.is_empty() {
            return Err(Error::Empty);
        }
        Ok(Manifest {
            update_compatible: update.compatible,
            handler,
            images,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Manifest};

    const FULL_MANIFEST: &str = r#"
        [update]
        compatible = "device-x"

        [handler]
        filename = "hooks/install.sh"
        args = "--flavor full"

        [[image]]
        slotclass = "rootfs"
        filename = "rootfs.img"
        checksum = { type = "sha256", digest = "aa11" }

        [[image]]
        slotclass = "appfs"
        filename = "appfs.img"
        checksum = { type = "sha256", digest = "bb22" }

        [[file]]
        slotclass = "appfs"
        filename = "app.bin"
        destname = "opt/app.bin"
        checksum = { type = "sha256", digest = "cc33" }
    "#;

    #[test]
    fn full_manifest_parses() {
        let manifest = Manifest::from_toml_str(FULL_MANIFEST).unwrap();
        assert_eq!("device-x", manifest.update_compatible());
        assert_eq!("hooks/install.sh", manifest.handler().unwrap().filename);
        assert_eq!(
            Some("--flavor full"),
            manifest.handler().unwrap().args.as_deref()
        );
        assert_eq!(2, manifest.images().len());
        assert_eq!(1, manifest.files().len());
    }

    #[test]
    fn classes_are_deduplicated_preserving_last_occurrence() {
        let manifest = Manifest::from_toml_str(FULL_MANIFEST).unwrap();
        // appfs is referenced by an image and then again by a file; the file
        // reference wins, moving appfs behind rootfs.
        assert_eq!(vec!["rootfs", "appfs"], manifest.referenced_classes());
    }

    #[test]
    fn file_reference_reorders_class_to_the_back() {
        let manifest = Manifest::from_toml_str(
            r#"
            [update]
            compatible = "device-x"

            [[image]]
            slotclass = "rootfs"
            filename = "rootfs.img"
            checksum = { digest = "aa11" }

            [[image]]
            slotclass = "appfs"
            filename = "appfs.img"
            checksum = { digest = "bb22" }

            [[file]]
            slotclass = "rootfs"
            filename = "extra.bin"
            destname = "extra.bin"
            checksum = { digest = "cc33" }
        "#,
        )
        .unwrap();
        assert_eq!(vec!["appfs", "rootfs"], manifest.referenced_classes());
    }

    #[test]
    fn missing_compatible_is_rejected() {
        let err = Manifest::from_toml_str(
            r#"
            [update]
            compatible = ""

            [[image]]
            slotclass = "rootfs"
            filename = "rootfs.img"
            checksum = { digest = "aa11" }
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingCompatible));
    }

    #[test]
    fn manifest_without_payload_is_rejected() {
        let err = Manifest::from_toml_str(
            r#"
            [update]
            compatible = "device-x"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Empty));
    }

    #[test]
    fn image_lookup_returns_first_match_per_class() {
        let manifest = Manifest::from_toml_str(FULL_MANIFEST).unwrap();
        assert_eq!(
            "rootfs.img",
            manifest.image_for_class("rootfs").unwrap().filename
        );
        assert!(manifest.image_for_class("bootfs").is_none());
    }
}
