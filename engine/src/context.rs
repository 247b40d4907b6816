//! The process-wide engine context.
//!
//! All mutable engine state (the single-install guard and the last install
//! error) and every pluggable collaborator live behind this one value, so a
//! test can assemble an isolated context per run instead of poking at
//! globals.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use rauc_engine_core::config::SystemConfig;

use crate::{
    boot_id::{self, BootnameProvider},
    bootchooser::{BootChooser, NoopBootChooser},
    bundle::{ManifestVerifier, UnverifiedManifestLoader},
    download::{self, Downloader, HttpDownloader},
    mount::{Mounter, SysMounter},
    progress::Progress,
    topology::{self, MountEntry},
};

pub type MountTableProvider =
    Arc<dyn Fn() -> io::Result<Vec<MountEntry>> + Send + Sync>;

pub struct Context {
    pub config: SystemConfig,
    pub bootname_provider: BootnameProvider,
    pub mount_table: MountTableProvider,
    pub mounter: Arc<dyn Mounter>,
    pub bootchooser: Arc<dyn BootChooser>,
    pub verifier: Arc<dyn ManifestVerifier>,
    pub downloader: Arc<dyn Downloader>,
    pub progress: Progress,
    busy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Context {
    pub fn builder(config: SystemConfig) -> ContextBuilder {
        ContextBuilder {
            bootname_provider: boot_id::cmdline_provider(config.bootloader),
            config,
            mount_table: Arc::new(topology::system_mounts),
            mounter: Arc::new(SysMounter),
            bootchooser: Arc::new(NoopBootChooser),
            verifier: Arc::new(UnverifiedManifestLoader),
            downloader: None,
            progress: Progress::disabled(),
        }
    }

    /// Claims the single-install guard; `false` when an install is already
    /// running.
    pub(crate) fn try_set_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_busy(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// The terminal error of the most recent install, if it failed.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        *lock(&self.last_error) = error;
    }
}

pub struct ContextBuilder {
    config: SystemConfig,
    bootname_provider: BootnameProvider,
    mount_table: MountTableProvider,
    mounter: Arc<dyn Mounter>,
    bootchooser: Arc<dyn BootChooser>,
    verifier: Arc<dyn ManifestVerifier>,
    downloader: Option<Arc<dyn Downloader>>,
    progress: Progress,
}

impl ContextBuilder {
    pub fn bootname_provider(mut self, provider: BootnameProvider) -> Self {
        self.bootname_provider = provider;
        self
    }

    pub fn mount_table(mut self, mount_table: MountTableProvider) -> Self {
        self.mount_table = mount_table;
        self
    }

    pub fn mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn bootchooser(mut self, bootchooser: Arc<dyn BootChooser>) -> Self {
        self.bootchooser = bootchooser;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn ManifestVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Builds the context; constructing the default HTTP downloader is the
    /// only fallible part.
    pub fn build(self) -> Result<Context, download::Error> {
        let downloader = match self.downloader {
            Some(downloader) => downloader,
            None => Arc::new(HttpDownloader::new()?),
        };
        Ok(Context {
            config: self.config,
            bootname_provider: self.bootname_provider,
            mount_table: self.mount_table,
            mounter: self.mounter,
            bootchooser: self.bootchooser,
            verifier: self.verifier,
            downloader,
            progress: self.progress,
            busy: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
