// Remote handle table
//
// Small integer references handed to the front end for frames, scopes and
// expandable values. Every id refers to state of the current stop only, so
// the whole table is dropped on each resume.

use crate::types::{RemoteValue, ThreadId, TypeRef};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Locals region of a frame.
    Scope,
    /// An expandable value (object or array).
    StackVariable,
    /// Synthetic "Static members" node of a type.
    StaticClassPseudoScope,
}

#[derive(Debug, Clone)]
pub struct VariablesReference {
    pub kind: ReferenceKind,
    pub value: Option<RemoteValue>,
    /// Type whose members are listed; for pseudo-scopes this is the only owner.
    pub ty: Option<TypeRef>,
    pub thread: ThreadId,
    pub depth: u32,
    /// Expression that re-evaluates to the owning value.
    pub evaluate_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    pub thread: ThreadId,
    pub depth: u32,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    next: i64,
    references: HashMap<i64, VariablesReference>,
    frames: HashMap<i64, FrameHandle>,
    frame_ids: HashMap<(ThreadId, u32), i64>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> i64 {
        self.next += 1;
        self.next
    }

    pub fn alloc_reference(&mut self, reference: VariablesReference) -> i64 {
        let id = self.next_id();
        self.references.insert(id, reference);
        id
    }

    pub fn reference(&self, id: i64) -> Option<&VariablesReference> {
        self.references.get(&id)
    }

    /// Frame ids are stable for a given thread and depth within one stop.
    pub fn alloc_frame(&mut self, thread: ThreadId, depth: u32) -> i64 {
        if let Some(id) = self.frame_ids.get(&(thread, depth)) {
            return *id;
        }
        let id = self.next_id();
        self.frames.insert(id, FrameHandle { thread, depth });
        self.frame_ids.insert((thread, depth), id);
        id
    }

    pub fn frame(&self, id: i64) -> Option<FrameHandle> {
        self.frames.get(&id).copied()
    }

    /// Invalidate every handle. Ids keep increasing so stale ones never alias.
    pub fn clear(&mut self) {
        debug!(
            "Clearing handle table ({} references, {} frames)",
            self.references.len(),
            self.frames.len()
        );
        self.references.clear();
        self.frames.clear();
        self.frame_ids.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(thread: ThreadId) -> VariablesReference {
        VariablesReference {
            kind: ReferenceKind::Scope,
            value: None,
            ty: None,
            thread,
            depth: 0,
            evaluate_name: String::new(),
        }
    }

    #[test]
    fn test_frame_ids_are_stable_within_a_stop() {
        let mut table = HandleTable::new();
        let a = table.alloc_frame(7, 0);
        let b = table.alloc_frame(7, 1);
        assert_ne!(a, b);
        assert_eq!(table.alloc_frame(7, 0), a);
        assert_eq!(table.frame(b), Some(FrameHandle { thread: 7, depth: 1 }));
    }

    #[test]
    fn test_clear_invalidates_and_never_reuses_ids() {
        let mut table = HandleTable::new();
        let old = table.alloc_reference(scope(1));
        table.clear();
        assert!(table.reference(old).is_none());
        assert!(table.is_empty());
        let new = table.alloc_reference(scope(1));
        assert!(new > old);
    }
}
