use serde::{Deserialize, Serialize};
use std::fmt;

const ARITY_BITS: u32 = 8;
const KIND_BITS: u32 = 2;
const ID_SHIFT: u32 = ARITY_BITS + KIND_BITS;
const ARITY_MASK: u32 = (1 << ARITY_BITS) - 1;
const KIND_MASK: u32 = (1 << KIND_BITS) - 1;

/// Largest selector id that still fits the encoding.
pub const MAX_SELECTOR_ID: u32 = u32::MAX >> ID_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorKind {
    Method,
    Getter,
    Setter,
}

/// Packed `(id, kind, arity)` triple as it appears in bytecode operands.
///
/// The id doubles as the row displacement of the selector inside the
/// dispatch table, so `id + class_id` names the entry for a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(u32);

impl Selector {
    pub fn new(id: u32, kind: SelectorKind, arity: u32) -> Option<Self> {
        if id > MAX_SELECTOR_ID || arity > ARITY_MASK {
            return None;
        }
        let kind = match kind {
            SelectorKind::Method => 0,
            SelectorKind::Getter => 1,
            SelectorKind::Setter => 2,
        };
        Some(Self((id << ID_SHIFT) | (kind << ARITY_BITS) | arity))
    }

    pub fn method(id: u32, arity: u32) -> Option<Self> {
        Self::new(id, SelectorKind::Method, arity)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn id(self) -> u32 {
        self.0 >> ID_SHIFT
    }

    pub fn arity(self) -> u32 {
        self.0 & ARITY_MASK
    }

    pub fn kind(self) -> SelectorKind {
        match (self.0 >> ARITY_BITS) & KIND_MASK {
            1 => SelectorKind::Getter,
            2 => SelectorKind::Setter,
            _ => SelectorKind::Method,
        }
    }

    /// Shift that extracts the id from a raw selector word.
    pub const fn id_shift() -> u32 {
        ID_SHIFT
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({}/{:?}/{})", self.id(), self.kind(), self.arity())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind() {
            SelectorKind::Method => "m",
            SelectorKind::Getter => "g",
            SelectorKind::Setter => "s",
        };
        write!(f, "{}{}_{}", kind, self.id(), self.arity())
    }
}

#[cfg(test)]
mod tests {
    use super::{Selector, SelectorKind, MAX_SELECTOR_ID};

    #[test]
    fn selector_fields_survive_packing() {
        let selector = Selector::new(513, SelectorKind::Setter, 1).unwrap();
        assert_eq!(selector.id(), 513);
        assert_eq!(selector.kind(), SelectorKind::Setter);
        assert_eq!(selector.arity(), 1);
        assert_eq!(Selector::from_raw(selector.raw()), selector);
        assert_eq!(selector.to_string(), "s513_1");
    }

    #[test]
    fn selector_rejects_out_of_range_parts() {
        assert!(Selector::method(MAX_SELECTOR_ID + 1, 0).is_none());
        assert!(Selector::method(1, 256).is_none());
        assert!(Selector::method(MAX_SELECTOR_ID, 255).is_some());
    }
}
