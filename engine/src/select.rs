//! Target selection: one inactive slot per manifest-referenced class.

use std::collections::HashMap;

use rauc_engine_core::{config::SystemConfig, manifest::Manifest, slot::SlotId};
use tracing::debug;

use crate::{progress::Progress, topology::Topology};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no target slot found for class `{0}`")]
    NoTargetForClass(String),
}

/// The selected install targets, one per referenced slot class, in
/// referenced-class order.
#[derive(Debug, Default)]
pub struct TargetGroup {
    entries: Vec<(String, SlotId)>,
}

impl TargetGroup {
    pub fn get(&self, class: &str) -> Option<SlotId> {
        self.entries
            .iter()
            .find(|(c, _)| c == class)
            .map(|(_, id)| *id)
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.entries.iter().any(|(_, entry)| *entry == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SlotId)> {
        self.entries.iter().map(|(class, id)| (class.as_str(), *id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Picks the target slot for every class the manifest references.
///
/// Candidates are scanned in configuration order; a candidate is only
/// eligible if its whole parent chain is inactive, and selections that would
/// place two classes on conflicting base slots are skipped. The returned
/// group therefore never mixes base slots within one base class.
pub fn determine_target_group(
    config: &SystemConfig,
    topology: &Topology,
    manifest: &Manifest,
    progress: &Progress,
) -> Result<TargetGroup, Error> {
    let step = progress.begin_step(
        "determine_target_install_group",
        "Determining target install group",
        0,
    );

    // base-slot reservations, keyed by base slot class
    let mut bases: HashMap<String, SlotId> = HashMap::new();
    let mut entries = Vec::new();

    for class in manifest.referenced_classes() {
        let mut target = None;
        for candidate in config
            .slots
            .class_members(class)
            .filter(|&id| topology.state(id).is_inactive())
        {
            let Some(base) = inactive_base(config, topology, candidate) else {
                continue;
            };
            let base_class = config.slots.get(base).class.clone();
            match bases.get(&base_class) {
                Some(&known) if known != base => continue,
                Some(_) => {}
                None => {
                    bases.insert(base_class, base);
                }
            }
            target = Some(candidate);
            break;
        }

        let Some(target) = target else {
            return Err(Error::NoTargetForClass(class.to_string()));
        };
        debug!(
            "adding to target group: {class} -> {}",
            config.slots.get(target).name
        );
        entries.push((class.to_string(), target));
    }

    step.succeed();
    Ok(TargetGroup { entries })
}

/// The topmost ancestor of `slot`, provided the whole chain is inactive.
fn inactive_base(
    config: &SystemConfig,
    topology: &Topology,
    slot: SlotId,
) -> Option<SlotId> {
    let mut base = slot;
    loop {
        if !topology.state(base).is_inactive() {
            return None;
        }
        match config.slots.get(base).parent {
            Some(parent) => base = parent,
            None => return Some(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use rauc_engine_core::{
        config::{SystemConfig, SystemConfigFile},
        manifest::Manifest,
    };

    use super::{determine_target_group, Error};
    use crate::{boot_id::fixed_provider, progress::Progress, topology};

    fn config(contents: &str) -> SystemConfig {
        let file: SystemConfigFile = toml::from_str(contents).unwrap();
        SystemConfig::from_parts("system.toml", file).unwrap()
    }

    fn manifest(classes: &[&str]) -> Manifest {
        let mut contents = String::from("[update]\ncompatible = \"device-x\"\n");
        for class in classes {
            contents.push_str(&format!(
                "[[image]]\nslotclass = \"{class}\"\nfilename = \"{class}.img\"\n\
                 checksum = {{ digest = \"aa11\" }}\n",
            ));
        }
        Manifest::from_toml_str(&contents).unwrap()
    }

    const AB_WITH_CHILDREN: &str = r#"
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
    "#;

    #[test]
    fn selects_the_inactive_member_of_each_class() {
        let config = config(AB_WITH_CHILDREN);
        let topology = topology::determine_states(
            &config,
            &fixed_provider("A"),
            &[],
            &Progress::disabled(),
        )
        .unwrap();
        let group = determine_target_group(
            &config,
            &topology,
            &manifest(&["rootfs", "appfs"]),
            &Progress::disabled(),
        )
        .unwrap();

        assert_eq!(2, group.len());
        assert_eq!(
            "rootfs.1",
            config.slots.get(group.get("rootfs").unwrap()).name
        );
        assert_eq!(
            "appfs.1",
            config.slots.get(group.get("appfs").unwrap()).name
        );
    }

    #[test]
    fn selected_slots_share_a_single_base() {
        let config = config(AB_WITH_CHILDREN);
        let topology = topology::determine_states(
            &config,
            &fixed_provider("B"),
            &[],
            &Progress::disabled(),
        )
        .unwrap();
        let group = determine_target_group(
            &config,
            &topology,
            &manifest(&["appfs", "rootfs"]),
            &Progress::disabled(),
        )
        .unwrap();

        let bases: Vec<_> = group
            .iter()
            .map(|(_, id)| config.slots.base_of(id))
            .collect();
        assert!(bases.iter().all(|&base| base == bases[0]));
        assert_eq!(
            "rootfs.0",
            config.slots.get(group.get("rootfs").unwrap()).name
        );
    }

    #[test]
    fn class_without_inactive_member_fails() {
        let config = config(
            r#"
            [system]
            compatible = "device-x"

            [[slot]]
            name = "rootfs.0"
            device = "/dev/sda2"
            bootname = "A"
        "#,
        );
        let topology = topology::determine_states(
            &config,
            &fixed_provider("A"),
            &[],
            &Progress::disabled(),
        )
        .unwrap();
        let err = determine_target_group(
            &config,
            &topology,
            &manifest(&["rootfs"]),
            &Progress::disabled(),
        )
        .unwrap_err();
        assert!(
            matches!(err, Error::NoTargetForClass(class) if class == "rootfs")
        );
    }
}
