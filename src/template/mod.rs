//! Render output as static segments interleaved with dynamic slots.
//!
//! A [`Rendered`] tree is what a view's `render` returns. The statics of a
//! given render site never change between renders, so after the first full
//! send only changed dynamics travel over the wire (see [`diff`]).

pub mod diff;

pub use diff::{diff, ListPatch, Patch, SlotPatch};

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use thiserror::Error;

/// One render result: `statics.len() == dynamics.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    statics: Vec<String>,
    dynamics: Vec<Dynamic>,
}

/// Value held by a dynamic slot. Text is already HTML-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dynamic {
    Text(String),
    Tree(Rendered),
    List(Vec<Rendered>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("{statics} statics cannot surround {dynamics} dynamics")]
    Arity { statics: usize, dynamics: usize },

    #[error("patch slot {0} is out of range")]
    SlotOutOfRange(usize),

    #[error("patch for slot {0} does not match the slot's kind")]
    KindMismatch(usize),
}

impl Rendered {
    pub fn new(statics: Vec<String>, dynamics: Vec<Dynamic>) -> Result<Self, TemplateError> {
        if statics.len() != dynamics.len() + 1 {
            return Err(TemplateError::Arity {
                statics: statics.len(),
                dynamics: dynamics.len(),
            });
        }
        Ok(Self { statics, dynamics })
    }

    pub fn builder() -> TemplateBuilder {
        TemplateBuilder::default()
    }

    pub fn statics(&self) -> &[String] {
        &self.statics
    }

    pub fn dynamics(&self) -> &[Dynamic] {
        &self.dynamics
    }

    /// Two trees are diffable only when produced by the same render site.
    pub fn same_shape(&self, other: &Rendered) -> bool {
        self.statics == other.statics && self.dynamics.len() == other.dynamics.len()
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_html(&mut out);
        out
    }

    fn write_html(&self, out: &mut String) {
        for (i, segment) in self.statics.iter().enumerate() {
            out.push_str(segment);
            if let Some(dynamic) = self.dynamics.get(i) {
                dynamic.write_html(out);
            }
        }
    }

    /// Apply a patch produced by [`diff`] against this tree, yielding the next tree.
    pub fn apply(&mut self, patch: &Patch) -> Result<(), TemplateError> {
        match patch {
            Patch::Replace(tree) => {
                *self = tree.clone();
                Ok(())
            }
            Patch::Slots(slots) => {
                for (&index, slot) in slots {
                    let current = self
                        .dynamics
                        .get_mut(index)
                        .ok_or(TemplateError::SlotOutOfRange(index))?;
                    current.apply(index, slot)?;
                }
                Ok(())
            }
        }
    }
}

impl Dynamic {
    /// Text slot, HTML-escaped.
    pub fn text(value: impl AsRef<str>) -> Self {
        Dynamic::Text(escape_html(value.as_ref()))
    }

    /// Text slot inserted verbatim.
    pub fn safe(value: impl Into<String>) -> Self {
        Dynamic::Text(value.into())
    }

    fn write_html(&self, out: &mut String) {
        match self {
            Dynamic::Text(text) => out.push_str(text),
            Dynamic::Tree(tree) => tree.write_html(out),
            Dynamic::List(items) => items.iter().for_each(|item| item.write_html(out)),
        }
    }

    fn apply(&mut self, index: usize, slot: &SlotPatch) -> Result<(), TemplateError> {
        if let SlotPatch::Replace(value) = slot {
            *self = value.clone();
            return Ok(());
        }
        match (self, slot) {
            (Dynamic::Text(text), SlotPatch::Text(next)) => *text = next.clone(),
            (Dynamic::Tree(tree), SlotPatch::Tree(patch)) => tree.apply(patch)?,
            (Dynamic::List(items), SlotPatch::List(patch)) => patch.apply_to(items)?,
            _ => return Err(TemplateError::KindMismatch(index)),
        }
        Ok(())
    }
}

impl From<&str> for Dynamic {
    fn from(value: &str) -> Self {
        Dynamic::text(value)
    }
}

impl From<String> for Dynamic {
    fn from(value: String) -> Self {
        Dynamic::text(value)
    }
}

impl From<Rendered> for Dynamic {
    fn from(value: Rendered) -> Self {
        Dynamic::Tree(value)
    }
}

impl From<Vec<Rendered>> for Dynamic {
    fn from(value: Vec<Rendered>) -> Self {
        Dynamic::List(value)
    }
}

/// A false conditional renders as an empty text slot.
impl From<Option<Rendered>> for Dynamic {
    fn from(value: Option<Rendered>) -> Self {
        match value {
            Some(tree) => Dynamic::Tree(tree),
            None => Dynamic::Text(String::new()),
        }
    }
}

macro_rules! dynamic_from_display {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Dynamic {
                fn from(value: $ty) -> Self {
                    Dynamic::Text(value.to_string())
                }
            }
        )*
    };
}

dynamic_from_display!(i32, i64, u32, u64, usize, f64, bool);

/// Accumulates statics and dynamics in document order.
#[derive(Debug, Default)]
pub struct TemplateBuilder {
    statics: Vec<String>,
    dynamics: Vec<Dynamic>,
    current: String,
}

impl TemplateBuilder {
    pub fn text(mut self, segment: &str) -> Self {
        self.current.push_str(segment);
        self
    }

    pub fn dynamic(mut self, value: impl Into<Dynamic>) -> Self {
        self.statics.push(std::mem::take(&mut self.current));
        self.dynamics.push(value.into());
        self
    }

    pub fn safe(self, value: impl Into<String>) -> Self {
        self.dynamic(Dynamic::safe(value))
    }

    pub fn tree(self, nested: Rendered) -> Self {
        self.dynamic(Dynamic::Tree(nested))
    }

    /// A comprehension: every item must share one shape for diffs to stay small.
    pub fn list<T>(self, items: impl IntoIterator<Item = T>, render: impl Fn(T) -> Rendered) -> Self {
        self.dynamic(Dynamic::List(items.into_iter().map(render).collect()))
    }

    pub fn build(mut self) -> Rendered {
        self.statics.push(self.current);
        Rendered {
            statics: self.statics,
            dynamics: self.dynamics,
        }
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Wire form: `{"s": [statics], "0": d0, "1": d1, ...}`.
impl Serialize for Rendered {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.dynamics.len() + 1))?;
        map.serialize_entry("s", &self.statics)?;
        for (index, dynamic) in self.dynamics.iter().enumerate() {
            map.serialize_entry(&index.to_string(), dynamic)?;
        }
        map.end()
    }
}

/// Text is a bare string, a tree carries `"s"`, a list is `{"d": [tree, ...]}`.
impl Serialize for Dynamic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Dynamic::Text(text) => serializer.serialize_str(text),
            Dynamic::Tree(tree) => tree.serialize(serializer),
            Dynamic::List(items) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("d", items)?;
                map.end()
            }
        }
    }
}
