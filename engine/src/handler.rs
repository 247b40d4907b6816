//! Spawning install handlers and parsing their structured output.
//!
//! Handlers are external executables (pre/post hooks or a bundle-supplied
//! custom installer). They receive the full slot layout through `RAUC_*`
//! environment variables and may talk back over stdout: lines starting with
//! `<< ` carry status records, everything else is passed through as log.

use std::{
    io::{self, BufRead as _, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
};

use rauc_engine_core::{config::SystemConfig, manifest::Manifest};
use tracing::{info, warn};

use crate::select::TargetGroup;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed spawning handler `{}`", path.display())]
    Spawn { path: PathBuf, source: io::Error },
    #[error("failed waiting for handler `{}`", path.display())]
    Wait { path: PathBuf, source: io::Error },
    #[error("{message}")]
    Failed { status: ExitStatus, message: String },
}

/// What a handler reported back over its stdout protocol.
#[derive(Debug, Default)]
pub struct HandlerStatus {
    pub overall: Option<String>,
    pub images: Vec<(String, String)>,
    pub error: Option<String>,
    pub bootloader_error: Option<String>,
}

/// Builds the `RAUC_*` environment exported to every handler.
///
/// Slots are numbered 1-based in configuration order; `RAUC_TARGET_SLOTS`
/// holds the subset selected for this install, and target slots with a
/// matching manifest image additionally get `RAUC_IMAGE_*` variables.
pub fn handler_env(
    config: &SystemConfig,
    bootname: &str,
    update_source: &str,
    manifest: &Manifest,
    target_group: &TargetGroup,
) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "RAUC_SYSTEM_CONFIG".to_string(),
            config.config_path.display().to_string(),
        ),
        ("RAUC_CURRENT_BOOTNAME".to_string(), bootname.to_string()),
        ("RAUC_UPDATE_SOURCE".to_string(), update_source.to_string()),
        (
            "RAUC_MOUNT_PREFIX".to_string(),
            config.mount_prefix.display().to_string(),
        ),
    ];

    let mut slot_list = Vec::new();
    let mut target_list = Vec::new();
    for (index, (id, slot)) in config.slots.iter().enumerate() {
        let n = index + 1;
        slot_list.push(n.to_string());

        if target_group.contains(id) {
            target_list.push(n.to_string());
            if let Some(image) = manifest.image_for_class(&slot.class) {
                env.push((format!("RAUC_IMAGE_NAME_{n}"), image.filename.clone()));
                env.push((
                    format!("RAUC_IMAGE_DIGEST_{n}"),
                    image.checksum.digest.clone(),
                ));
                env.push((
                    format!("RAUC_IMAGE_CLASS_{n}"),
                    image.slotclass.clone(),
                ));
            }
        }

        env.push((format!("RAUC_SLOT_NAME_{n}"), slot.name.clone()));
        env.push((format!("RAUC_SLOT_CLASS_{n}"), slot.class.clone()));
        env.push((
            format!("RAUC_SLOT_DEVICE_{n}"),
            slot.device.display().to_string(),
        ));
        env.push((
            format!("RAUC_SLOT_BOOTNAME_{n}"),
            slot.bootname.clone().unwrap_or_default(),
        ));
        env.push((
            format!("RAUC_SLOT_PARENT_{n}"),
            slot.parent
                .map(|parent| config.slots.get(parent).name.clone())
                .unwrap_or_default(),
        ));
    }
    env.push(("RAUC_SLOTS".to_string(), slot_list.join(" ")));
    env.push(("RAUC_TARGET_SLOTS".to_string(), target_list.join(" ")));

    env
}

/// Runs a handler to completion, streaming its merged stdout/stderr through
/// the output protocol. A non-zero exit is an error carrying the handler's
/// `<< error` message when one was reported.
pub fn launch_and_wait_handler(
    handler: &Path,
    env: Vec<(String, String)>,
    extra_arg: Option<&str>,
) -> Result<HandlerStatus, Error> {
    let mut command = Command::new(handler);
    command.envs(env).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(arg) = extra_arg {
        command.arg(arg);
    }

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        path: handler.to_path_buf(),
        source,
    })?;

    // Merge both pipes into one ordered line stream; the readers drop their
    // senders at EOF which ends the receive loop below.
    let (line_tx, line_rx) = flume::unbounded::<String>();
    let readers: Vec<_> = [
        child.stdout.take().map(|out| Box::new(out) as Box<dyn Read + Send>),
        child.stderr.take().map(|err| Box::new(err) as Box<dyn Read + Send>),
    ]
    .into_iter()
    .flatten()
    .map(|stream| {
        let tx = line_tx.clone();
        thread::spawn(move || {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
    })
    .collect();
    drop(line_tx);

    let mut status = HandlerStatus::default();
    for line in line_rx.iter() {
        parse_handler_output(&mut status, &line);
    }
    for reader in readers {
        let _ = reader.join();
    }

    let exit = child.wait().map_err(|source| Error::Wait {
        path: handler.to_path_buf(),
        source,
    })?;
    if !exit.success() {
        let message = status
            .error
            .clone()
            .or_else(|| status.bootloader_error.clone())
            .unwrap_or_else(|| format!("handler exited with {exit}"));
        return Err(Error::Failed {
            status: exit,
            message,
        });
    }
    Ok(status)
}

fn parse_handler_output(status: &mut HandlerStatus, line: &str) {
    let Some(record) = line.strip_prefix("<< ") else {
        info!("# {line}");
        return;
    };

    let mut fields = record.split_ascii_whitespace();
    match fields.next() {
        Some("handler") => {
            if let Some(state) = fields.next() {
                info!("handler status: {state}");
                status.overall = Some(state.to_string());
            }
        }
        Some("image") => {
            if let (Some(name), Some(state)) = (fields.next(), fields.next()) {
                info!("image '{name}' status: {state}");
                status.images.push((name.to_string(), state.to_string()));
            }
        }
        Some("error") => {
            let message = fields.collect::<Vec<_>>().join(" ");
            warn!("handler error: '{message}'");
            status.error = Some(message);
        }
        Some("bootloader") => {
            let message = fields.collect::<Vec<_>>().join(" ");
            warn!("handler bootloader error: '{message}'");
            status.bootloader_error = Some(message);
        }
        Some(command) => warn!("unknown handler command: {command}"),
        None => {}
    }
}
