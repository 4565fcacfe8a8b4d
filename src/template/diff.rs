//! Structural diff between two renders of the same site.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tracing::debug;

use super::{Dynamic, Rendered, TemplateError};

/// Changed dynamics between two renders. An empty `Slots` map means "unchanged".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Shapes differ: the whole next tree replaces this subtree.
    Replace(Rendered),
    Slots(BTreeMap<usize, SlotPatch>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPatch {
    Text(String),
    Tree(Patch),
    /// Slot changed kind (text / tree / list); send the new value whole.
    Replace(Dynamic),
    List(ListPatch),
}

/// Element-wise list changes. `len` is set only when the length changed;
/// items at or past the old length are `Patch::Replace` of the new item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPatch {
    pub len: Option<usize>,
    pub items: BTreeMap<usize, Patch>,
}

impl Patch {
    pub fn empty() -> Self {
        Patch::Slots(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Patch::Slots(slots) if slots.is_empty())
    }
}

impl ListPatch {
    pub fn is_empty(&self) -> bool {
        self.len.is_none() && self.items.is_empty()
    }

    pub(crate) fn apply_to(&self, items: &mut Vec<Rendered>) -> Result<(), TemplateError> {
        if let Some(len) = self.len {
            items.truncate(len);
        }
        for (&index, patch) in &self.items {
            if let Some(item) = items.get_mut(index) {
                item.apply(patch)?;
                continue;
            }
            match patch {
                Patch::Replace(tree) if index == items.len() => items.push(tree.clone()),
                _ => return Err(TemplateError::SlotOutOfRange(index)),
            }
        }
        Ok(())
    }
}

/// Diff `next` against `previous`. Falls back to a full replace when the two
/// trees were not produced by the same render site.
pub fn diff(previous: &Rendered, next: &Rendered) -> Patch {
    if !previous.same_shape(next) {
        debug!(
            previous_statics = previous.statics().len(),
            next_statics = next.statics().len(),
            "template shape changed, sending full subtree"
        );
        return Patch::Replace(next.clone());
    }

    let slots = previous
        .dynamics()
        .iter()
        .zip(next.dynamics())
        .enumerate()
        .filter_map(|(index, (old, new))| diff_slot(old, new).map(|slot| (index, slot)))
        .collect();
    Patch::Slots(slots)
}

fn diff_slot(old: &Dynamic, new: &Dynamic) -> Option<SlotPatch> {
    match (old, new) {
        (Dynamic::Text(a), Dynamic::Text(b)) => (a != b).then(|| SlotPatch::Text(b.clone())),
        (Dynamic::Tree(a), Dynamic::Tree(b)) => {
            let patch = diff(a, b);
            (!patch.is_empty()).then_some(SlotPatch::Tree(patch))
        }
        (Dynamic::List(a), Dynamic::List(b)) => {
            let patch = diff_list(a, b);
            (!patch.is_empty()).then_some(SlotPatch::List(patch))
        }
        _ => Some(SlotPatch::Replace(new.clone())),
    }
}

fn diff_list(old: &[Rendered], new: &[Rendered]) -> ListPatch {
    let mut items = BTreeMap::new();
    for (index, (a, b)) in old.iter().zip(new).enumerate() {
        let patch = diff(a, b);
        if !patch.is_empty() {
            items.insert(index, patch);
        }
    }
    for (index, item) in new.iter().enumerate().skip(old.len()) {
        items.insert(index, Patch::Replace(item.clone()));
    }
    ListPatch {
        len: (old.len() != new.len()).then_some(new.len()),
        items,
    }
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Patch::Replace(tree) => tree.serialize(serializer),
            Patch::Slots(slots) => {
                let mut map = serializer.serialize_map(Some(slots.len()))?;
                for (index, slot) in slots {
                    map.serialize_entry(&index.to_string(), slot)?;
                }
                map.end()
            }
        }
    }
}

impl Serialize for SlotPatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SlotPatch::Text(text) => serializer.serialize_str(text),
            SlotPatch::Tree(patch) => patch.serialize(serializer),
            SlotPatch::Replace(value) => value.serialize(serializer),
            SlotPatch::List(list) => list.serialize(serializer),
        }
    }
}

/// `{"d": {"i": patch, ...}, "len": n}`; `len` only when the length changed.
impl Serialize for ListPatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        let items: BTreeMap<String, &Patch> = self
            .items
            .iter()
            .map(|(index, patch)| (index.to_string(), patch))
            .collect();
        map.serialize_entry("d", &items)?;
        if let Some(len) = self.len {
            map.serialize_entry("len", &len)?;
        }
        map.end()
    }
}
