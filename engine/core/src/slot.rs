//! The slot graph: named storage units grouped into redundant classes.
//!
//! Slots are arena-allocated inside a [`SlotRegistry`] and addressed by
//! stable [`SlotId`] indices, so parent links never create self-referential
//! ownership. The registry preserves configuration order, which target
//! selection and the handler environment both rely on.

use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate slot name `{0}`")]
    DuplicateName(String),
    #[error("slot `{slot}` references unknown parent `{parent}`")]
    UnknownParent { slot: String, parent: String },
    #[error("slot `{0}` is part of a parent cycle")]
    ParentCycle(String),
}

/// Filesystem type of a slot, deciding how it is mounted and written.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    #[default]
    Raw,
    Ext4,
    Ubifs,
    Vfat,
}

impl SlotType {
    /// The name passed to mount(2), or `None` for unmountable raw slots.
    pub fn fs_name(self) -> Option<&'static str> {
        match self {
            SlotType::Raw => None,
            SlotType::Ext4 => Some("ext4"),
            SlotType::Ubifs => Some("ubifs"),
            SlotType::Vfat => Some("vfat"),
        }
    }
}

impl Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotType::Raw => "raw",
            SlotType::Ext4 => "ext4",
            SlotType::Ubifs => "ubifs",
            SlotType::Vfat => "vfat",
        };
        f.write_str(s)
    }
}

/// Runtime state of a slot, computed once per install from boot information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Unknown,
    Inactive,
    Active,
    Booted,
}

impl SlotState {
    /// `booted` implies `active`.
    pub fn is_active(self) -> bool {
        matches!(self, SlotState::Active | SlotState::Booted)
    }

    pub fn is_inactive(self) -> bool {
        matches!(self, SlotState::Inactive)
    }
}

/// Stable index of a slot within its [`SlotRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Static description of one slot. Transient per-install state (mount point,
/// activity) is tracked by the engine, not here.
#[derive(Clone, Debug)]
pub struct Slot {
    pub name: String,
    pub class: String,
    pub device: PathBuf,
    pub kind: SlotType,
    pub bootname: Option<String>,
    pub parent: Option<SlotId>,
}

impl Slot {
    /// Base slots carry the bootloader identity for their subtree.
    pub fn is_base(&self) -> bool {
        self.parent.is_none()
    }
}

/// Input to [`SlotRegistry::build`]; the parent is still a name here.
#[derive(Clone, Debug)]
pub struct SlotDecl {
    pub name: String,
    pub class: String,
    pub device: PathBuf,
    pub kind: SlotType,
    pub bootname: Option<String>,
    pub parent: Option<String>,
}

/// All configured slots, in configuration order.
#[derive(Clone, Debug, Default)]
pub struct SlotRegistry {
    slots: Vec<Slot>,
}

impl SlotRegistry {
    /// Resolves parent names and validates the graph: names must be unique,
    /// parents must exist, and the parent relation must be acyclic.
    pub fn build(decls: Vec<SlotDecl>) -> Result<Self, Error> {
        let mut slots = Vec::with_capacity(decls.len());
        for decl in &decls {
            if decls.iter().filter(|d| d.name == decl.name).count() > 1 {
                return Err(Error::DuplicateName(decl.name.clone()));
            }
            let parent = match &decl.parent {
                None => None,
                Some(parent) => Some(
                    decls
                        .iter()
                        .position(|d| &d.name == parent)
                        .map(SlotId)
                        .ok_or_else(|| Error::UnknownParent {
                            slot: decl.name.clone(),
                            parent: parent.clone(),
                        })?,
                ),
            };
            slots.push(Slot {
                name: decl.name.clone(),
                class: decl.class.clone(),
                device: decl.device.clone(),
                kind: decl.kind,
                bootname: decl.bootname.clone(),
                parent,
            });
        }

        let registry = Self { slots };
        for (id, slot) in registry.iter() {
            // A chain longer than the slot count can only mean a cycle.
            let mut cursor = id;
            for _ in 0..registry.len() {
                match registry.get(cursor).parent {
                    Some(parent) => cursor = parent,
                    None => break,
                }
            }
            if registry.get(cursor).parent.is_some() {
                return Err(Error::ParentCycle(slot.name.clone()));
            }
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> &Slot {
        &self.slots[id.0]
    }

    /// Iterates slots in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &Slot)> {
        self.slots.iter().enumerate().map(|(i, s)| (SlotId(i), s))
    }

    pub fn find_by_name(&self, name: &str) -> Option<SlotId> {
        self.iter().find(|(_, s)| s.name == name).map(|(id, _)| id)
    }

    pub fn find_by_device(&self, device: &Path) -> Option<SlotId> {
        self.iter()
            .find(|(_, s)| s.device == device)
            .map(|(id, _)| id)
    }

    pub fn find_by_bootname(&self, bootname: &str) -> Option<SlotId> {
        self.iter()
            .find(|(_, s)| s.bootname.as_deref() == Some(bootname))
            .map(|(id, _)| id)
    }

    /// Members of `class`, in configuration order.
    pub fn class_members<'a>(
        &'a self,
        class: &'a str,
    ) -> impl Iterator<Item = SlotId> + 'a {
        self.iter()
            .filter(move |(_, s)| s.class == class)
            .map(|(id, _)| id)
    }

    /// The topmost ancestor of `id` (the slot itself if it has no parent).
    pub fn base_of(&self, id: SlotId) -> SlotId {
        let mut cursor = id;
        while let Some(parent) = self.get(cursor).parent {
            cursor = parent;
        }
        cursor
    }
}
