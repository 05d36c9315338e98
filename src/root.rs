//! [`Root`]: the per-app reactive graph, tracking context, and micro-batch scheduler.

use std::any::Any;
use std::cell::{Cell, RefCell};

use slotmap::{Key, SlotMap};
use smallvec::SmallVec;

use crate::node::{link, Listener, NodeKind};
use crate::*;

/// The struct managing the state of the reactive system. Only one should be created per thread.
///
/// This is leaked to obtain a `&'static Root` so that handles (`ReadSignal`, `NodeHandle`, ...)
/// can be freely copied around without a lifetime. [`RootHandle::dispose`] frees everything it
/// owns; the `Root` allocation itself lives for the remainder of the program.
pub(crate) struct Root {
    /// All nodes ever created in this root.
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    /// The scope that owns whatever is created right now (for disposal, not for tracking).
    pub current_owner: Cell<NodeId>,
    /// The computed/effect currently being evaluated, if any (for dependency tracking).
    pub current_observer: Cell<Option<NodeId>>,
    /// Sources read during the current [`Root::tracked_scope`] call, deduplicated.
    pub tracker: RefCell<Option<SmallVec<[NodeId; 4]>>>,
    /// The top-level scope created by [`create_root`].
    pub root_node: Cell<NodeId>,

    /// Nesting depth of [`batch`]. A write outside of any `batch` call still goes through a
    /// depth-1 "virtual batch" so that the three scheduler phases always run as a unit.
    pub batch_depth: Cell<u32>,
    /// Signals that changed during the batch currently being drained, awaiting their listener
    /// notification pass. Preserves registration-independent insertion order; deduplicated via
    /// each node's own `queued`-style bookkeeping is unnecessary here since signals are only
    /// pushed once (`in_changed_set` guards that below).
    changed_signals: RefCell<Vec<NodeId>>,
    /// Effects queued to run in the current/forthcoming flush, deduplicated via each node's
    /// `queued` flag.
    pending_effects: RefCell<Vec<NodeId>>,
    /// Dirty computeds with their own `subscribe` listeners, queued to be pulled up to date (and
    /// have those listeners notified) even though nothing reads them. Deduplicated via each node's
    /// `queued` flag, the same as `pending_effects`.
    pending_computeds: RefCell<Vec<NodeId>>,
}

thread_local! {
    /// The current reactive root.
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// Gets the current reactive root. Panics if none was set up with [`create_root`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn global() -> &'static Root {
        GLOBAL_ROOT.with(|root| root.get()).expect("no root found: call create_root first")
    }

    /// Sets the current reactive root, returning the previous one.
    pub fn set_global(root: Option<&'static Root>) -> Option<&'static Root> {
        GLOBAL_ROOT.with(|r| r.replace(root))
    }

    /// Creates a new, leaked reactive root.
    pub fn new_static() -> &'static Self {
        let this = Self {
            nodes: RefCell::new(SlotMap::default()),
            current_owner: Cell::new(NodeId::null()),
            current_observer: Cell::new(None),
            tracker: RefCell::new(None),
            root_node: Cell::new(NodeId::null()),
            batch_depth: Cell::new(0),
            changed_signals: RefCell::new(Vec::new()),
            pending_effects: RefCell::new(Vec::new()),
            pending_computeds: RefCell::new(Vec::new()),
        };
        let this = Box::leak(Box::new(this));
        Root::set_global(Some(this));
        let root_node = create_child_scope(|| {});
        Root::set_global(None);
        this.root_node.set(root_node.0);
        this
    }

    /// Disposes everything and resets state, ready to be reused as a fresh root.
    pub fn reinit(&'static self) {
        self.root_node.get().dispose(self);
        self.nodes.borrow_mut().clear();
        self.current_owner.set(NodeId::null());
        self.current_observer.set(None);
        self.tracker.replace(None);
        self.batch_depth.set(0);
        self.changed_signals.borrow_mut().clear();
        self.pending_effects.borrow_mut().clear();
        self.pending_computeds.borrow_mut().clear();

        Root::set_global(Some(self));
        let root_node = create_child_scope(|| {});
        Root::set_global(None);
        self.root_node.set(root_node.0);
    }

    pub fn create_child_scope(&'static self, f: impl FnOnce()) -> NodeHandle {
        let node = self
            .nodes
            .borrow_mut()
            .insert(ReactiveNode::new(self.current_owner.get(), NodeKind::Signal, None));
        if !self.current_owner.get().is_null() {
            self.nodes.borrow_mut()[self.current_owner.get()].children.push(node);
        }
        let prev = self.current_owner.replace(node);
        f();
        self.current_owner.set(prev);
        NodeHandle(node, self)
    }

    /// Runs `f` while recording every node read through [`crate::tracking::track`], returning
    /// `f`'s result and the deduplicated list of sources it read.
    pub(crate) fn tracked_scope<T>(&self, f: impl FnOnce() -> T) -> (T, SmallVec<[NodeId; 4]>) {
        let prev = self.tracker.replace(Some(SmallVec::new()));
        let ret = f();
        let sources = self.tracker.replace(prev).unwrap();
        (ret, sources)
    }

    /// Records `source` as a dependency of the node currently being tracked, if any.
    pub(crate) fn track(&self, source: NodeId) {
        if let Some(tracker) = self.tracker.borrow_mut().as_mut() {
            if !tracker.contains(&source) {
                tracker.push(source);
            }
        }
    }

    /// Replaces `node`'s source edges with `new_sources`, relinking the parallel edge arrays.
    fn relink_sources(&self, node: NodeId, new_sources: SmallVec<[NodeId; 4]>) {
        node.detach_all_edges(self);
        for source in new_sources {
            link(self, source, node);
        }
    }

    /// Pulls `id` up to date if it is a dirty [`NodeKind::Computed`], recomputing it (and
    /// recursively pulling its own sources up to date first via ordinary reads inside the tracked
    /// closure). Returns `true` if the value changed as a result.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    pub(crate) fn update_if_necessary(&'static self, id: NodeId) -> bool {
        let is_dirty = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(id) else { return false };
            match &node.kind {
                NodeKind::Computed { dirty, source_versions, .. } => {
                    *dirty || !self.sources_still_fresh(&node.sources, source_versions)
                }
                _ => false,
            }
        };
        if !is_dirty {
            return false;
        }
        self.recompute(id)
    }

    fn sources_still_fresh(&self, sources: &[NodeId], cached_versions: &[u64]) -> bool {
        if sources.len() != cached_versions.len() {
            return false;
        }
        let nodes = self.nodes.borrow();
        sources
            .iter()
            .zip(cached_versions)
            .all(|(id, v)| nodes.get(*id).map(|n| n.version == *v).unwrap_or(false))
    }

    fn recompute(&'static self, id: NodeId) -> bool {
        let mut calc = {
            let mut nodes = self.nodes.borrow_mut();
            match &mut nodes[id].kind {
                NodeKind::Computed { calc, .. } => std::mem::replace(calc, Box::new(|_| None)),
                _ => unreachable!("recompute called on a non-computed node"),
            }
        };
        id.dispose_children(self);

        let prev_observer = self.current_observer.replace(Some(id));
        let prev_owner = self.current_owner.replace(id);
        let mut value = self.nodes.borrow_mut()[id].value.take().unwrap();
        let prev_tracker = self.tracker.replace(Some(SmallVec::new()));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| calc(&mut value)));
        let sources = self.tracker.replace(prev_tracker).unwrap_or_default();
        self.current_owner.set(prev_owner);
        self.current_observer.set(prev_observer);

        self.relink_sources(id, sources.clone());

        // Restore the calc closure and the value unconditionally, even on panic: per the crate's
        // error-handling policy a thrown calc still propagates to the caller, but the node must
        // stay readable at its last-good value and retryable on the next read rather than left
        // permanently empty.
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            node.value = Some(value);
            if let NodeKind::Computed { calc: slot, .. } = &mut node.kind {
                *slot = calc;
            }
        }

        let old_value = match result {
            Ok(old_value) => old_value,
            // `dirty` is left set, so the next read retries the calc from scratch.
            Err(payload) => std::panic::resume_unwind(payload),
        };
        let changed = old_value.is_some();

        let new_source_versions = sources
            .iter()
            .map(|s| self.nodes.borrow().get(*s).map(|n| n.version).unwrap_or(0))
            .collect();

        {
            let mut nodes = self.nodes.borrow_mut();
            let node = &mut nodes[id];
            node.queued = false;
            match &mut node.kind {
                NodeKind::Computed { dirty, source_versions, .. } => {
                    *dirty = false;
                    *source_versions = new_source_versions;
                }
                _ => unreachable!(),
            }
            if changed {
                node.version += 1;
            }
        }

        if changed {
            self.notify_listeners(id, old_value);
            self.mark_dependents_dirty(id);
        }
        changed
    }

    fn notify_listeners(&self, id: NodeId, old_value: Option<Box<dyn Any>>) {
        let Some(old_value) = old_value else { return };
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(id) else { return };
        let mut listeners = std::mem::take(&mut node.listeners);
        let new_value_ptr: *const dyn Any = node.value.as_deref().unwrap();
        drop(nodes);
        // SAFETY: `new_value_ptr` stays valid because listeners only read nodes by id and never
        // remove `id` itself during this call; the node store is not reallocated by insertion.
        let new_value: &dyn Any = unsafe { &*new_value_ptr };
        for listener in listeners.values_mut() {
            (listener.f)(new_value, Some(old_value.as_ref()));
        }
        self.nodes.borrow_mut()[id].listeners = listeners;
    }

    /// Marks every transitive dependent of `id` as needing recomputation: computeds are flagged
    /// `dirty` (and recursed into only if newly dirty, which is what makes unobserved branches of
    /// the graph stay untouched), effects are pushed onto the pending queue at most once. A
    /// newly-dirtied computed that has its own `subscribe` listeners is additionally queued onto
    /// `pending_computeds`, so it still gets pulled up to date and fires its listeners even with no
    /// downstream effect or reader (the only other paths that call `update_if_necessary`).
    fn mark_dependents_dirty(&self, id: NodeId) {
        let dependents = self.nodes.borrow().get(id).map(|n| n.dependents.clone()).unwrap_or_default();
        for dependent in dependents {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(dependent) else { continue };
            match &mut node.kind {
                NodeKind::Computed { dirty, .. } => {
                    if !*dirty {
                        *dirty = true;
                        let has_listeners = !node.listeners.is_empty();
                        let already_queued = node.queued;
                        if has_listeners && !already_queued {
                            node.queued = true;
                        }
                        drop(nodes);
                        if has_listeners && !already_queued {
                            self.pending_computeds.borrow_mut().push(dependent);
                        }
                        self.mark_dependents_dirty(dependent);
                    }
                }
                NodeKind::Effect { .. } => {
                    if !node.queued {
                        node.queued = true;
                        drop(nodes);
                        self.pending_effects.borrow_mut().push(dependent);
                    }
                }
                NodeKind::Signal => unreachable!("a signal cannot be a dependent"),
            }
        }
    }

    /// Entry point for a signal write: records it as changed and marks its dependents dirty, then
    /// flushes immediately unless a [`batch`] is in progress.
    pub(crate) fn propagate_write(&'static self, id: NodeId) {
        self.changed_signals.borrow_mut().push(id);
        self.mark_dependents_dirty(id);
        if self.batch_depth.get() == 0 {
            self.flush();
        }
    }

    /// Drains a batch in three phases, repeating to a fixed point: observed computeds (those with
    /// their own listeners but no reader) are pulled up to date first, then changed signals notify
    /// their listeners, then queued effects run. Treated as a single virtual batch so that writes
    /// performed by effects feed back into the same drain instead of recursively re-entering
    /// `flush`.
    fn flush(&'static self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
        loop {
            let computeds = std::mem::take(&mut *self.pending_computeds.borrow_mut());
            if !computeds.is_empty() {
                for id in computeds {
                    self.update_if_necessary(id);
                }
                continue;
            }
            let signals = std::mem::take(&mut *self.changed_signals.borrow_mut());
            if !signals.is_empty() {
                for id in signals {
                    let old_value = self.nodes.borrow_mut().get_mut(id).and_then(|n| n.pending_old_value.take());
                    self.notify_listeners(id, old_value);
                }
                continue;
            }
            let effects = std::mem::take(&mut *self.pending_effects.borrow_mut());
            if effects.is_empty() {
                break;
            }
            for id in effects {
                self.run_effect(id);
            }
        }
        self.batch_depth.set(self.batch_depth.get() - 1);
    }

    /// Runs (or reruns) a queued effect, first verifying it is actually stale.
    ///
    /// `mark_dependents_dirty` queues an effect as soon as *any* upstream computed is flagged
    /// dirty, before that computed has actually recomputed and possibly found its output
    /// unchanged (equality-rejected). So before rerunning, every source is pulled up to date via
    /// [`Root::update_if_necessary`] (a no-op for plain signals) and the effect's own cached
    /// source versions are compared against the result; if nothing actually changed, the queue
    /// entry was a false alarm and is dropped without running `f`.
    pub(crate) fn run_effect(&'static self, id: NodeId) {
        let sources = match self.nodes.borrow().get(id) {
            Some(node) => node.sources.clone(),
            None => return,
        };
        for source in &sources {
            self.update_if_necessary(*source);
        }
        let is_fresh = match self.nodes.borrow().get(id) {
            Some(node) => match &node.kind {
                NodeKind::Effect { source_versions, .. } => {
                    self.sources_still_fresh(&node.sources, source_versions)
                }
                _ => return,
            },
            None => return,
        };
        if is_fresh {
            if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
                node.queued = false;
            }
            return;
        }

        let Some(mut run) = (match self.nodes.borrow_mut().get_mut(id) {
            Some(node) => {
                node.queued = false;
                match &mut node.kind {
                    NodeKind::Effect { run, .. } => Some(std::mem::replace(run, Box::new(|| None))),
                    _ => None,
                }
            }
            None => None,
        }) else {
            return;
        };

        id.dispose_children(self);

        // A panicking effect body is swallowed (logged at most): the effect stays registered and
        // reruns on the next dependency change, per the crate's error-handling policy. Unlike a
        // `calc` panic (which propagates to the reader that triggered it), an effect's failure
        // must not abort the rest of the flush.
        let prev_observer = self.current_observer.replace(Some(id));
        let prev_owner = self.current_owner.replace(id);
        let prev_tracker = self.tracker.replace(Some(SmallVec::new()));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run()));
        let sources = self.tracker.replace(prev_tracker).unwrap_or_default();
        self.current_owner.set(prev_owner);
        self.current_observer.set(prev_observer);

        self.relink_sources(id, sources.clone());

        let new_source_versions = sources
            .iter()
            .map(|s| self.nodes.borrow().get(*s).map(|n| n.version).unwrap_or(0))
            .collect();

        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            if let NodeKind::Effect { run: slot, source_versions: sv } = &mut node.kind {
                *slot = run;
                *sv = new_source_versions;
            }
        }

        match result {
            Ok(cleanup) => {
                if let Some(cleanup) = cleanup {
                    if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
                        node.cleanups.push(cleanup);
                    }
                }
            }
            Err(payload) => {
                #[cfg(feature = "trace")]
                tracing::warn!(
                    "effect callback panicked and was swallowed: {}",
                    crate::error::panic_message(payload.as_ref())
                );
                #[cfg(not(feature = "trace"))]
                let _ = payload;
            }
        }
    }
}

/// A handle to a root. This lets you dispose the root's resources, or re-enter its scope.
///
/// Obtained from [`create_root`].
#[derive(Clone, Copy)]
pub struct RootHandle {
    root: &'static Root,
}

impl RootHandle {
    /// Destroys everything created in this root.
    pub fn dispose(&self) {
        self.root.reinit();
    }

    /// Runs `f` with this root set as the current global root.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = Root::set_global(Some(self.root));
        let ret = f();
        Root::set_global(prev);
        ret
    }
}

/// Creates a new reactive root with a top-level scope. Nothing created outside of `f` (or a
/// later [`RootHandle::run_in`] call) is tracked by this root.
///
/// # Example
/// ```
/// # use zen_reactive::*;
/// let root = create_root(|| {
///     let count = create_signal(0);
///     count.set(1);
/// });
/// root.dispose();
/// ```
#[must_use = "root should be disposed"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let root = Root::new_static();
    Root::set_global(Some(root));
    f();
    Root::set_global(None);
    RootHandle { root }
}

/// Creates a child scope nested under the current owner. Everything created inside `f` is
/// disposed together when the returned handle is disposed, or when an ancestor scope is.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_child_scope(f: impl FnOnce()) -> NodeHandle {
    Root::global().create_child_scope(f)
}

/// Registers `f` to run when the current scope is disposed.
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    let root = Root::global();
    if !root.current_owner.get().is_null() {
        root.nodes.borrow_mut()[root.current_owner.get()].cleanups.push(Box::new(f));
    }
}

/// Runs `f` once, untracked, outside of any pending computation. In a core-only runtime without a
/// render phase, "mount" simply means "run now, ignoring the current observer."
pub fn on_mount(f: impl FnOnce() + 'static) {
    untrack(f);
}

/// Returns a handle to the scope that owns whatever is currently being created.
pub fn get_owner() -> NodeHandle {
    let root = Root::global();
    NodeHandle(root.current_owner.get(), root)
}

/// Batches every write performed inside `f` together: dependents are marked dirty as usual, but
/// listener notifications and effect runs are deferred until `f` returns.
///
/// # Example
/// ```
/// # use zen_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let double = create_computed(move || state.get() * 2);
/// batch(move || {
///     state.set(2);
///     assert_eq!(double.get_untracked(), 1); // not recomputed until the batch ends
/// });
/// assert_eq!(double.get_untracked(), 4);
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.batch_depth.set(root.batch_depth.get() + 1);
    let ret = f();
    root.batch_depth.set(root.batch_depth.get() - 1);
    if root.batch_depth.get() == 0 {
        root.flush();
    }
    ret
}

/// Runs `f` without recording any dependencies, even if called from inside a computed or effect.
///
/// See also [`ReadSignal::get_untracked`].
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    let prev = root.tracker.replace(None);
    let ret = f();
    root.tracker.replace(prev);
    ret
}

/// Alias for [`untrack`], matching the common "peek at a signal without subscribing" naming.
pub fn peek<T>(f: impl FnOnce() -> T) -> T {
    untrack(f)
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn cleanup_runs_on_dispose() {
        let _ = create_root(|| {
            let cleanup_called = create_signal(false);
            let scope = create_child_scope(|| {
                on_cleanup(move || cleanup_called.set(true));
            });
            assert!(!cleanup_called.get());
            scope.dispose();
            assert!(cleanup_called.get());
        });
    }

    #[test]
    fn cleanup_in_effect_runs_before_rerun() {
        let _ = create_root(|| {
            let trigger = create_signal(0);
            let counter = create_signal(0);
            create_effect(move || {
                trigger.track();
                on_cleanup(move || counter.set(counter.get_untracked() + 1));
            });
            assert_eq!(counter.get(), 0);
            trigger.set(1);
            assert_eq!(counter.get(), 1);
            trigger.set(2);
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn batch_defers_computed_recompute() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);
            batch(move || {
                state.set(2);
                assert_eq!(double.get_untracked(), 1);
            });
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn batch_runs_effects_once_at_end() {
        let _ = create_root(|| {
            let state1 = create_signal(1);
            let state2 = create_signal(2);
            let counter = create_signal(0);
            create_effect(move || {
                counter.set(counter.get_untracked() + 1);
                let _ = state1.get() + state2.get();
            });
            assert_eq!(counter.get(), 1);
            batch(move || {
                state1.set(3);
                assert_eq!(counter.get(), 1);
                state2.set(4);
                assert_eq!(counter.get(), 1);
            });
            assert_eq!(counter.get(), 2);
        });
    }
}
