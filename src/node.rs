//! Reactive nodes and the dependency edge list.

use std::any::Any;

use indexmap::IndexMap;
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::Root;

new_key_type! {
    pub struct NodeId;
}

/// What kind of reactive node this is. A nominal tag instead of trait-object duck typing, so the
/// propagation engine can decide how to treat a node without downcasting its payload.
pub(crate) enum NodeKind {
    /// A leaf, writable cell.
    Signal,
    /// A derived value with a recompute closure. `dirty` tracks whether the cached `value` is
    /// stale; `calc` returns the replaced-out previous value if recomputing produced a value that
    /// differs from it (i.e. whether dependents should also be marked dirty), or `None` if the
    /// new value was equal and the cached one was left in place.
    Computed {
        calc: Box<dyn FnMut(&mut Box<dyn Any>) -> Option<Box<dyn Any>>>,
        dirty: bool,
        /// Cached version numbers of `sources` as of the last recompute. If every source's
        /// current version still matches, the computed can be declared clean without calling
        /// `calc` again.
        source_versions: SmallVec<[u64; 4]>,
    },
    /// A side-effecting observer. Cleanup is handled the same way as for a scope: callbacks
    /// registered with `on_cleanup` during a run, plus any cleanup closure the run itself
    /// returned, are drained (via `dispose_children`, which an effect node also uses for anything
    /// it creates) before the next run and on disposal.
    Effect {
        run: Box<dyn FnMut() -> Option<Box<dyn FnOnce()>>>,
        /// Cached version numbers of `sources` as of the last run, mirroring
        /// [`NodeKind::Computed::source_versions`]. A queued effect is re-verified against these
        /// before it actually reruns: a source dirtied by `mark_dependents_dirty` but whose
        /// computed recompute turned out equal to its old value never bumped its version, so the
        /// effect can be skipped instead of rerunning on a false alarm.
        source_versions: SmallVec<[u64; 4]>,
    },
}

/// A registered listener on a node, invoked with `(new, old)` on change. `old` is `None` only for
/// the synchronous initial call made at subscribe time; every change notification after that
/// always carries the previous value. Stored type-erased; callers downcast through the typed
/// wrapper that knows the node's `T`.
pub(crate) struct Listener {
    pub f: Box<dyn FnMut(&dyn Any, Option<&dyn Any>)>,
}

pub(crate) struct ReactiveNode {
    /// Current value, boxed. Signals and computeds always have one; effects never do.
    pub value: Option<Box<dyn Any>>,
    /// Monotonic version counter, bumped on every value change that is not equality-rejected.
    pub version: u64,
    pub kind: NodeKind,

    /// Owning scope (the node that will dispose this one). The null key means "no owner" (a
    /// root-level node).
    pub parent: NodeId,
    /// Nodes owned by this node, disposed in reverse creation order when this node is disposed.
    pub children: Vec<NodeId>,
    /// `on_cleanup` callbacks registered in this node's scope.
    pub cleanups: Vec<Box<dyn FnOnce()>>,

    /// Nodes this node reads from, as of the last (re)computation.
    pub sources: SmallVec<[NodeId; 4]>,
    /// For `sources[i]`, the index of this node within `sources[i]`'s `dependents` list.
    pub dependent_slot: SmallVec<[u32; 4]>,
    /// Nodes that read from this node.
    pub dependents: SmallVec<[NodeId; 4]>,
    /// For `dependents[j]`, the index of this node within `dependents[j]`'s `sources` list.
    pub source_slot: SmallVec<[u32; 4]>,

    /// Whether this node is already sitting in the scheduler's dirty-computed or effect queue, to
    /// avoid double-scheduling.
    pub queued: bool,

    /// Explicit `subscribe` listeners, keyed by listener id, distinct from the auto-tracked
    /// `dependents` edges. An `IndexMap` gives O(1) swap-and-pop removal by id while still
    /// iterating in registration order between mutations.
    pub listeners: IndexMap<u64, Listener>,
    next_listener_id: u64,
    /// Value captured before the first write in the current batch, used to notify listeners with
    /// the value as of batch-start rather than on every intermediate write.
    pub pending_old_value: Option<Box<dyn Any>>,

    #[cfg(debug_assertions)]
    pub created_at: &'static std::panic::Location<'static>,
}

impl ReactiveNode {
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn new(parent: NodeId, kind: NodeKind, value: Option<Box<dyn Any>>) -> Self {
        Self {
            value,
            version: 0,
            kind,
            parent,
            children: Vec::new(),
            cleanups: Vec::new(),
            sources: SmallVec::new(),
            dependent_slot: SmallVec::new(),
            dependents: SmallVec::new(),
            source_slot: SmallVec::new(),
            queued: false,
            listeners: IndexMap::new(),
            next_listener_id: 0,
            pending_old_value: None,
            #[cfg(debug_assertions)]
            created_at: std::panic::Location::caller(),
        }
    }

    pub fn alloc_listener_id(&mut self) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        id
    }
}

/// A handle to a node, allowing disposal from outside its typed wrapper (`ReadSignal`, `Effect`,
/// ...).
#[derive(Clone, Copy)]
pub struct NodeHandle(pub(crate) NodeId, pub(crate) &'static Root);

impl NodeHandle {
    /// Disposes this node and everything owned by it, running cleanups in reverse creation order.
    pub fn dispose(self) {
        self.0.dispose(self.1);
    }

    pub fn is_alive(self) -> bool {
        self.1.nodes.borrow().get(self.0).is_some()
    }
}

impl NodeId {
    /// Detaches every edge this node has, in both directions, via the O(1) slot-swap removal
    /// described by the parallel `sources`/`dependent_slot`/`dependents`/`source_slot` arrays.
    pub(crate) fn detach_all_edges(self, root: &Root) {
        let sources = std::mem::take(&mut root.nodes.borrow_mut()[self].sources);
        let dependent_slots = std::mem::take(&mut root.nodes.borrow_mut()[self].dependent_slot);
        for (source, slot) in sources.into_iter().zip(dependent_slots) {
            remove_dependent_at(root, source, slot as usize);
        }

        let dependents = std::mem::take(&mut root.nodes.borrow_mut()[self].dependents);
        let source_slots = std::mem::take(&mut root.nodes.borrow_mut()[self].source_slot);
        for (dependent, slot) in dependents.into_iter().zip(source_slots) {
            remove_source_at(root, dependent, slot as usize);
        }
    }

    pub fn dispose(self, root: &'static Root) {
        self.dispose_children(root);
        self.detach_all_edges(root);
        root.nodes.borrow_mut().remove(self);
    }

    /// Runs this node's cleanups (most-recently-registered first) and disposes its children. A
    /// cleanup that panics is swallowed so the rest still run: cleanup errors never corrupt the
    /// disposal tree.
    pub fn dispose_children(self, root: &'static Root) {
        let cleanups = std::mem::take(&mut root.nodes.borrow_mut()[self].cleanups);
        let children = std::mem::take(&mut root.nodes.borrow_mut()[self].children);
        for cb in cleanups.into_iter().rev() {
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb)) {
                #[cfg(feature = "trace")]
                tracing::warn!(
                    "cleanup callback panicked and was swallowed: {}",
                    crate::error::panic_message(payload.as_ref())
                );
                #[cfg(not(feature = "trace"))]
                let _ = payload;
            }
        }
        for child in children.into_iter().rev() {
            child.dispose(root);
        }
    }
}

/// Removes `owner.dependents[slot]`, fixing up the back-pointer of whichever entry the swap-remove
/// moved into `slot`.
pub(crate) fn remove_dependent_at(root: &Root, owner: NodeId, slot: usize) {
    let moved_back_slot;
    let moved;
    {
        let mut nodes = root.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(owner) else {
            return;
        };
        node.dependents.swap_remove(slot);
        moved_back_slot = node.source_slot.swap_remove(slot);
        moved = (slot < node.dependents.len()).then(|| node.dependents[slot]);
    }
    if let Some(moved) = moved {
        if let Some(moved_node) = root.nodes.borrow_mut().get_mut(moved) {
            moved_node.dependent_slot[moved_back_slot as usize] = slot as u32;
        }
    }
}

/// Removes `owner.sources[slot]`, fixing up the back-pointer of whichever entry the swap-remove
/// moved into `slot`.
pub(crate) fn remove_source_at(root: &Root, owner: NodeId, slot: usize) {
    let moved_back_slot;
    let moved;
    {
        let mut nodes = root.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(owner) else {
            return;
        };
        node.sources.swap_remove(slot);
        moved_back_slot = node.dependent_slot.swap_remove(slot);
        moved = (slot < node.sources.len()).then(|| node.sources[slot]);
    }
    if let Some(moved) = moved {
        if let Some(moved_node) = root.nodes.borrow_mut().get_mut(moved) {
            moved_node.source_slot[moved_back_slot as usize] = slot as u32;
        }
    }
}

/// Links `dependent` as reading from `source`, appending the mutual back-pointers.
pub(crate) fn link(root: &Root, source: NodeId, dependent: NodeId) {
    let mut nodes = root.nodes.borrow_mut();
    let dependent_slot = nodes[source].dependents.len() as u32;
    let source_slot = nodes[dependent].sources.len() as u32;
    nodes[source].dependents.push(dependent);
    nodes[source].source_slot.push(source_slot);
    nodes[dependent].sources.push(source);
    nodes[dependent].dependent_slot.push(dependent_slot);
}
