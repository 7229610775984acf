//! Reference-identity jump targets.
//!
//! A [`Label`] names a position in an instruction list without knowing its byte offset.
//! Two labels are equal only if they are clones of the same label. The encoder realises
//! labels to offsets per emission, so one list can be encoded into differently laid out
//! bodies (the original and the patched one) without touching its branches.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_LABEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct LabelInner {
    id: u64,
    name: Option<String>,
}

/// An abstract jump target, compared by identity.
#[derive(Clone)]
pub struct Label(Arc<LabelInner>);

impl Label {
    /// Creates a fresh label, distinct from every other label.
    #[must_use]
    pub fn new() -> Self {
        Label(Arc::new(LabelInner {
            id: NEXT_LABEL_ID.fetch_add(1, Ordering::Relaxed),
            name: None,
        }))
    }

    /// Creates a fresh label that carries a name for dumps and error messages.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Label(Arc::new(LabelInner {
            id: NEXT_LABEL_ID.fetch_add(1, Ordering::Relaxed),
            name: Some(name.into()),
        }))
    }

    /// Process-unique id of this label.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// The optional name given at creation.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }
}

impl Default for Label {
    fn default() -> Self {
        Label::new()
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Label {}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.name {
            Some(name) => write!(f, "{name}#{}", self.0.id),
            None => write!(f, "L_{}", self.0.id),
        }
    }
}
