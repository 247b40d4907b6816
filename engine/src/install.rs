//! The install orchestrator: one state machine per install request, run to
//! a terminal state on a dedicated worker thread.
//!
//! Exactly one install runs at a time. Status messages flow to observers
//! through the request's bounded FIFO in push order; the bootability
//! sequence (non-bootable, write, primary) is strictly ordered across all
//! base slots of a target group.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use rauc_engine_core::{
    checksum::Checksum,
    manifest::{Image, Manifest},
    slot::{Slot, SlotId},
    status::{self, SlotStatus, SLOT_STATUS_NAME},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    bootchooser, bundle,
    bundle::UpdateSource,
    context::{lock, Context},
    copy, download, handler,
    handler::launch_and_wait_handler,
    mount::{self, create_mount_point},
    select::{self, TargetGroup},
    topology::{self, Topology},
};

/// `status_result` value while an install has not reached a terminal state.
pub const STATUS_PENDING: i32 = -2;

const DEFAULT_STATUS_CAPACITY: usize = 64;

/// Cap for downloaded manifests and signatures.
const DOWNLOAD_MEM_LIMIT: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("another install is already running")]
    Busy,
    #[error("failed spawning install worker")]
    SpawnWorker(#[source] io::Error),
    #[error(transparent)]
    Topology(#[from] topology::Error),
    #[error("Failed creating mount point: {0}")]
    CreateMountPoint(#[source] mount::Error),
    #[error("Failed mounting bundle: {0}")]
    MountBundle(#[source] mount::Error),
    #[error("Failed verifying manifest: {0}")]
    VerifyManifest(#[from] bundle::Error),
    #[error("incompatible manifest for this system ({system}): {update}")]
    CompatibilityMismatch { system: String, update: String },
    #[error(transparent)]
    TargetGroup(#[from] select::Error),
    #[error("Handler error: {0}")]
    Handler(#[source] handler::Error),
    #[error("Source image `{}` not found", .0.display())]
    MissingImage(PathBuf),
    #[error("Destination device `{}` not found", .0.display())]
    MissingDevice(PathBuf),
    #[error("Mounting failed: {0}")]
    Mount(#[source] mount::Error),
    #[error("Unmounting failed: {0}")]
    Unmount(#[source] mount::Error),
    #[error("Failed updating slot `{slot}`: {source}")]
    UpdateSlot {
        slot: String,
        #[source]
        source: copy::Error,
    },
    #[error("Failed writing status file: {0}")]
    SaveStatus(#[source] status::Error),
    #[error("Failed marking slot `{slot}` non-bootable: {source}")]
    MarkNonBootable {
        slot: String,
        #[source]
        source: bootchooser::Error,
    },
    #[error("Failed marking slot `{slot}` bootable: {source}")]
    MarkPrimary {
        slot: String,
        #[source]
        source: bootchooser::Error,
    },
    #[error("Failed downloading manifest: {0}")]
    DownloadManifest(#[source] download::Error),
    #[error("Failed downloading manifest signature: {0}")]
    DownloadSignature(#[source] download::Error),
    #[error("Failed downloading file `{url}`: {source}")]
    DownloadFile {
        url: Url,
        #[source]
        source: download::Error,
    },
    #[error("failed deriving URL for `{name}` from `{base}`")]
    ResolveUrl {
        base: Url,
        name: String,
        source: url::ParseError,
    },
}

/// One submitted install. The caller keeps its `Arc` to observe status
/// messages and the terminal result while the worker drives the install.
pub struct InstallRequest {
    source: UpdateSource,
    status_tx: flume::Sender<String>,
    status_rx: flume::Receiver<String>,
    result: Mutex<i32>,
    notify: Option<Box<dyn Fn(&str) + Send + Sync>>,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl InstallRequest {
    pub fn new(source: UpdateSource) -> Self {
        Self::with_capacity(source, DEFAULT_STATUS_CAPACITY)
    }

    pub fn with_capacity(source: UpdateSource, capacity: usize) -> Self {
        let (status_tx, status_rx) = flume::bounded(capacity);
        Self {
            source,
            status_tx,
            status_rx,
            result: Mutex::new(STATUS_PENDING),
            notify: None,
            cleanup: Mutex::new(None),
        }
    }

    /// Invoked after every status push, from the worker.
    pub fn on_notify<F>(mut self, notify: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.notify = Some(Box::new(notify));
        self
    }

    /// Invoked once when the install reaches its terminal state.
    pub fn on_cleanup<F>(self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.cleanup) = Some(Box::new(cleanup));
        self
    }

    pub fn source(&self) -> &UpdateSource {
        &self.source
    }

    /// The receiving end of the status FIFO. The final message of every
    /// install is `"finished"`.
    pub fn status_messages(&self) -> &flume::Receiver<String> {
        &self.status_rx
    }

    /// [`STATUS_PENDING`] until terminal, then `0` on success and non-zero
    /// on failure.
    pub fn result(&self) -> i32 {
        *lock(&self.result)
    }

    fn push_status(&self, message: &str) {
        // Blocking send: a full queue slows the worker down rather than
        // dropping or reordering messages.
        let _ = self.status_tx.send(message.to_string());
        if let Some(notify) = &self.notify {
            notify(message);
        }
    }

    fn set_result(&self, result: i32) {
        *lock(&self.result) = result;
    }

    fn take_cleanup(&self) -> Option<Box<dyn FnOnce() + Send>> {
        lock(&self.cleanup).take()
    }
}

/// Handle of the install worker; joins on drop.
pub struct InstallHandle {
    thread: jod_thread::JoinHandle<()>,
}

impl InstallHandle {
    /// Blocks until the install reached its terminal state.
    pub fn join(self) {
        self.thread.join()
    }

    /// Lets the worker run unsupervised.
    pub fn detach(self) {
        self.thread.detach();
    }
}

/// Starts the install worker for `request`.
///
/// Rejects synchronously with [`Error::Busy`], without mutating any state,
/// while another install is running.
pub fn install_run(
    ctx: Arc<Context>,
    request: Arc<InstallRequest>,
) -> Result<InstallHandle, Error> {
    if !ctx.try_set_busy() {
        return Err(Error::Busy);
    }

    let worker_ctx = Arc::clone(&ctx);
    let thread = jod_thread::Builder::new()
        .name("installer".to_string())
        .spawn(move || install_thread(worker_ctx, request));
    match thread {
        Ok(thread) => Ok(InstallHandle { thread }),
        Err(source) => {
            ctx.clear_busy();
            Err(Error::SpawnWorker(source))
        }
    }
}

fn install_thread(ctx: Arc<Context>, request: Arc<InstallRequest>) {
    ctx.set_last_error(None);
    debug!("install worker started for {}", request.source);
    request.push_status("started");

    let res = match &request.source {
        UpdateSource::Bundle(path) => install_bundle(&ctx, &request, path),
        UpdateSource::Remote(url) => install_network(&ctx, &request, url),
    };
    let result = match res {
        Ok(()) => 0,
        Err(err) => {
            let message = err.to_string();
            warn!("{message}");
            request.push_status(&message);
            ctx.set_last_error(Some(message));
            1
        }
    };

    request.set_result(result);
    request.push_status("finished");
    debug!("install worker finished for {}", request.source);

    if let Some(cleanup) = request.take_cleanup() {
        cleanup();
    }
    ctx.clear_busy();
}

fn verify_compatible(ctx: &Context, manifest: &Manifest) -> Result<(), Error> {
    if ctx.config.compatible == manifest.update_compatible() {
        Ok(())
    } else {
        Err(Error::CompatibilityMismatch {
            system: ctx.config.compatible.clone(),
            update: manifest.update_compatible().to_string(),
        })
    }
}

fn current_bootname(ctx: &Context) -> String {
    (ctx.bootname_provider)().unwrap_or_default()
}

/// Base slots of the target group that carry a bootloader identity, in
/// group order. Only these are handed to the bootloader.
fn bootable_base_targets<'a>(
    ctx: &'a Context,
    target_group: &'a TargetGroup,
) -> impl Iterator<Item = &'a Slot> + 'a {
    target_group
        .iter()
        .map(|(_, id)| ctx.config.slots.get(id))
        .filter(|slot| slot.is_base() && slot.bootname.is_some())
}

fn mark_targets_non_bootable(
    ctx: &Context,
    target_group: &TargetGroup,
) -> Result<(), Error> {
    info!("marking target slots as non-bootable...");
    for slot in bootable_base_targets(ctx, target_group) {
        ctx.bootchooser.set_state(slot, false).map_err(|source| {
            Error::MarkNonBootable {
                slot: slot.name.clone(),
                source,
            }
        })?;
    }
    Ok(())
}

fn mark_targets_primary(
    ctx: &Context,
    target_group: &TargetGroup,
) -> Result<(), Error> {
    info!("marking slots as bootable...");
    for slot in bootable_base_targets(ctx, target_group) {
        ctx.bootchooser.set_primary(slot).map_err(|source| {
            Error::MarkPrimary {
                slot: slot.name.clone(),
                source,
            }
        })?;
    }
    Ok(())
}

fn discover_topology(ctx: &Context) -> Result<Topology, Error> {
    let mounts = (ctx.mount_table)().map_err(topology::Error::Mounts)?;
    Ok(topology::determine_states(
        &ctx.config,
        &ctx.bootname_provider,
        &mounts,
        &ctx.progress,
    )?)
}

fn run_handler_step(
    ctx: &Context,
    manifest: &Manifest,
    target_group: &TargetGroup,
    update_source: &str,
    handler_path: &Path,
    extra_arg: Option<&str>,
) -> Result<(), Error> {
    let env = handler::handler_env(
        &ctx.config,
        &current_bootname(ctx),
        update_source,
        manifest,
        target_group,
    );
    launch_and_wait_handler(handler_path, env, extra_arg)
        .map(drop)
        .map_err(Error::Handler)
}

// --- local bundle install --------------------------------------------------

fn install_bundle(
    ctx: &Context,
    request: &InstallRequest,
    bundle_path: &Path,
) -> Result<(), Error> {
    let step = ctx.progress.begin_step("do_install_bundle", "Installing", 5);

    let topology = discover_topology(ctx)?;

    let mount_point = create_mount_point(&ctx.config.mount_prefix, "bundle")
        .map_err(Error::CreateMountPoint)?;
    info!(
        "mounting bundle '{}' to '{}'",
        bundle_path.display(),
        mount_point.display()
    );
    request.push_status("Checking and mounting bundle...");
    if let Err(err) = ctx.mounter.mount_bundle(bundle_path, &mount_point) {
        remove_mount_point(&mount_point);
        return Err(Error::MountBundle(err));
    }

    let res = install_mounted_bundle(ctx, request, &topology, &mount_point);

    if let Err(err) = ctx.mounter.unmount(&mount_point) {
        warn!("failed unmounting bundle: {err}");
    }
    remove_mount_point(&mount_point);

    if res.is_ok() {
        step.succeed();
    }
    res
}

fn install_mounted_bundle(
    ctx: &Context,
    request: &InstallRequest,
    topology: &Topology,
    bundle_mount: &Path,
) -> Result<(), Error> {
    let manifest = ctx.verifier.verify_bundle(bundle_mount)?;
    verify_compatible(ctx, &manifest)?;

    let target_group = select::determine_target_group(
        &ctx.config,
        topology,
        &manifest,
        &ctx.progress,
    )?;
    log_target_group(ctx, &target_group);

    let update_source = bundle_mount.display().to_string();
    if let Some(pre) = &ctx.config.preinstall_handler {
        info!("starting pre install handler: {}", pre.display());
        run_handler_step(ctx, &manifest, &target_group, &update_source, pre, None)?;
    }

    if let Some(custom) = manifest.handler() {
        info!("using custom handler: {}", custom.filename);
        let step = ctx.progress.begin_step(
            "launch_and_wait_custom_handler",
            "Launching update handler",
            0,
        );
        run_handler_step(
            ctx,
            &manifest,
            &target_group,
            &update_source,
            &bundle_mount.join(&custom.filename),
            custom.args.as_deref(),
        )?;
        step.succeed();
    } else {
        info!("using default handler");
        default_install(ctx, request, &manifest, &target_group, bundle_mount)?;
    }

    if let Some(post) = &ctx.config.postinstall_handler {
        info!("starting post install handler: {}", post.display());
        run_handler_step(ctx, &manifest, &target_group, &update_source, post, None)?;
    }

    Ok(())
}

/// The engine-driven install loop. The order is load-bearing: all base
/// targets become non-bootable before the first write, and primary marking
/// happens only after every image landed.
fn default_install(
    ctx: &Context,
    request: &InstallRequest,
    manifest: &Manifest,
    target_group: &TargetGroup,
    bundle_mount: &Path,
) -> Result<(), Error> {
    let mount_point = create_mount_point(&ctx.config.mount_prefix, "image")
        .map_err(Error::CreateMountPoint)?;

    mark_targets_non_bootable(ctx, target_group)?;

    let step = ctx.progress.begin_step(
        "update_slots",
        "Updating slots",
        manifest.images().len() * 2,
    );
    request.push_status("Updating slots...");

    for image in manifest.images() {
        let slot_id = target_group
            .get(&image.slotclass)
            .expect("target group covers every manifest-referenced class");
        install_image(ctx, request, image, slot_id, &mount_point, bundle_mount)?;
    }

    mark_targets_primary(ctx, target_group)?;
    request.push_status("All slots updated");
    step.succeed();
    Ok(())
}

fn install_image(
    ctx: &Context,
    request: &InstallRequest,
    image: &Image,
    slot_id: SlotId,
    mount_point: &Path,
    bundle_mount: &Path,
) -> Result<(), Error> {
    let slot = ctx.config.slots.get(slot_id);

    let src = if Path::new(&image.filename).is_absolute() {
        PathBuf::from(&image.filename)
    } else {
        bundle_mount.join(&image.filename)
    };
    if !src.exists() {
        return Err(Error::MissingImage(src));
    }
    if !slot.device.exists() {
        return Err(Error::MissingDevice(slot.device.clone()));
    }

    request.push_status(&format!("Checking slot {}", slot.name));
    let check_step =
        ctx.progress
            .begin_step("check_slot", &format!("Checking slot {}", slot.name), 0);
    let status_path = mount_point.join(SLOT_STATUS_NAME);

    info!("mounting {} to {}", slot.device.display(), mount_point.display());
    // A slot that cannot be mounted for the check simply needs the update;
    // only the re-mount after the write is fatal.
    let mounted = match ctx
        .mounter
        .mount_slot(&slot.device, slot.kind, mount_point)
    {
        Ok(()) => true,
        Err(err) => {
            info!("mounting failed: {err}");
            false
        }
    };

    let mut skip = false;
    if mounted {
        match SlotStatus::load(&status_path) {
            Ok(state) if state.matches(&image.checksum) => {
                let message =
                    format!("Skipping update for correct image {}", image.filename);
                info!("{message}");
                request.push_status(&message);
                skip = true;
            }
            Ok(_) => info!("slot needs to be updated with {}", image.filename),
            Err(err) => info!("failed to load slot status file: {err}"),
        }
        ctx.mounter.unmount(mount_point).map_err(Error::Unmount)?;
        check_step.succeed();
    } else {
        drop(check_step);
    }

    if skip {
        request.push_status(&format!("Updating slot {} done", slot.name));
        return Ok(());
    }

    request.push_status(&format!("Updating slot {}", slot.name));
    info!("copying {} to {}", src.display(), slot.device.display());
    copy::copy_image(&src, &slot.device, slot.kind, &ctx.progress).map_err(
        |source| Error::UpdateSlot {
            slot: slot.name.clone(),
            source,
        },
    )?;

    debug!("mounting {} to {}", slot.device.display(), mount_point.display());
    ctx.mounter
        .mount_slot(&slot.device, slot.kind, mount_point)
        .map_err(Error::Mount)?;

    info!("updating slot status file {}", status_path.display());
    request.push_status(&format!("Updating slot {} status", slot.name));
    let state = SlotStatus::ok_with(image.checksum.clone());
    if let Err(err) = state.save(&status_path) {
        if let Err(umount_err) = ctx.mounter.unmount(mount_point) {
            warn!("failed unmounting after status write failure: {umount_err}");
        }
        return Err(Error::SaveStatus(err));
    }

    ctx.mounter.unmount(mount_point).map_err(Error::Unmount)?;
    request.push_status(&format!("Updating slot {} done", slot.name));
    Ok(())
}

// --- network install -------------------------------------------------------

fn install_network(
    ctx: &Context,
    request: &InstallRequest,
    url: &Url,
) -> Result<(), Error> {
    let topology = discover_topology(ctx)?;

    let manifest_data = ctx
        .downloader
        .fetch_mem(url, DOWNLOAD_MEM_LIMIT)
        .map_err(Error::DownloadManifest)?;
    let signature_url = signature_url(url)?;
    let signature = ctx
        .downloader
        .fetch_mem(&signature_url, DOWNLOAD_MEM_LIMIT)
        .map_err(Error::DownloadSignature)?;
    let manifest = ctx.verifier.verify_detached(&manifest_data, &signature)?;
    verify_compatible(ctx, &manifest)?;

    let target_group = select::determine_target_group(
        &ctx.config,
        &topology,
        &manifest,
        &ctx.progress,
    )?;
    log_target_group(ctx, &target_group);

    let update_source = url.to_string();
    if let Some(pre) = &ctx.config.preinstall_handler {
        info!("starting pre install handler: {}", pre.display());
        run_handler_step(ctx, &manifest, &target_group, &update_source, pre, None)?;
    }

    network_update(ctx, request, &topology, &manifest, &target_group, url)?;

    if let Some(post) = &ctx.config.postinstall_handler {
        info!("starting post install handler: {}", post.display());
        run_handler_step(ctx, &manifest, &target_group, &update_source, post, None)?;
    }

    Ok(())
}

fn network_update(
    ctx: &Context,
    request: &InstallRequest,
    topology: &Topology,
    manifest: &Manifest,
    target_group: &TargetGroup,
    url: &Url,
) -> Result<(), Error> {
    mark_targets_non_bootable(ctx, target_group)?;

    request.push_status("Updating slots...");
    for (class, slot_id) in target_group.iter() {
        let slot = ctx.config.slots.get(slot_id);
        let mount_point = create_mount_point(&ctx.config.mount_prefix, &slot.name)
            .map_err(Error::CreateMountPoint)?;
        info!("mounting {} to {}", slot.device.display(), mount_point.display());
        ctx.mounter
            .mount_slot(&slot.device, slot.kind, mount_point.as_path())
            .map_err(Error::Mount)?;

        let res =
            update_slot_files(ctx, topology, manifest, class, &mount_point, url);

        let unmount_res =
            ctx.mounter.unmount(&mount_point).map_err(Error::Unmount);
        res?;
        unmount_res?;
        request.push_status(&format!("Updating slot {} done", slot.name));
    }

    mark_targets_primary(ctx, target_group)?;
    request.push_status("All slots updated");
    Ok(())
}

fn update_slot_files(
    ctx: &Context,
    topology: &Topology,
    manifest: &Manifest,
    class: &str,
    mount_point: &Path,
    url: &Url,
) -> Result<(), Error> {
    let status_path = mount_point.join(SLOT_STATUS_NAME);
    let mut state = SlotStatus::load(&status_path).unwrap_or_else(|err| {
        info!("failed to load slot status file: {err}");
        SlotStatus::needs_update()
    });

    for file in manifest.files_for_class(class) {
        let dest = mount_point.join(&file.destname);
        // Resolves next to the manifest, i.e. `<dirname(url)>/<filename>`.
        let file_url = sibling_url(url, &file.filename)?;

        if file.checksum.verify(&dest).is_ok() {
            info!("skipping download for correct file from {file_url}");
            continue;
        }
        if reuse_existing_file(ctx, topology, &file.checksum, &dest) {
            info!("skipping download for reused file from {file_url}");
            continue;
        }
        ctx.downloader
            .fetch_file(&file_url, &dest, &file.checksum)
            .map_err(|source| Error::DownloadFile {
                url: file_url.clone(),
                source,
            })?;
    }

    state.status = status::Status::Ok;
    state.save(&status_path).map_err(Error::SaveStatus)
}

/// Tries to satisfy a file payload from any currently mounted slot instead
/// of downloading it: a basename match anywhere that verifies against the
/// target checksum is copied over the destination.
fn reuse_existing_file(
    ctx: &Context,
    topology: &Topology,
    checksum: &Checksum,
    dest: &Path,
) -> bool {
    let Some(basename) = dest.file_name() else {
        return false;
    };
    for (id, _) in ctx.config.slots.iter() {
        let Some(mountpoint) = topology.mountpoint(id) else {
            continue;
        };
        let candidate = mountpoint.join(basename);
        if checksum.verify(&candidate).is_err() {
            continue;
        }
        if let Err(err) = fs::remove_file(dest) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed removing stale `{}`: {err}", dest.display());
            }
        }
        match fs::copy(&candidate, dest) {
            Ok(_) => return true,
            Err(err) => warn!(
                "failed to copy file from {} to {}: {err}",
                candidate.display(),
                dest.display()
            ),
        }
    }
    false
}

// --- shared helpers --------------------------------------------------------

fn log_target_group(ctx: &Context, target_group: &TargetGroup) {
    info!("target group:");
    for (class, id) in target_group.iter() {
        info!("  {class} -> {}", ctx.config.slots.get(id).name);
    }
}

fn remove_mount_point(mount_point: &Path) {
    if let Err(err) = fs::remove_dir(mount_point) {
        warn!(
            "failed removing mount point `{}`: {err}",
            mount_point.display()
        );
    }
}

fn signature_url(base: &Url) -> Result<Url, Error> {
    Url::parse(&format!("{base}.sig")).map_err(|source| Error::ResolveUrl {
        base: base.clone(),
        name: ".sig".to_string(),
        source,
    })
}

fn sibling_url(base: &Url, name: &str) -> Result<Url, Error> {
    base.join(name).map_err(|source| Error::ResolveUrl {
        base: base.clone(),
        name: name.to_string(),
        source,
    })
}
