//! Signals: the mutable leaves of the reactive graph.

use std::any::Any;
use std::cell::{Ref, RefMut};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{AddAssign, Deref, DivAssign, MulAssign, RemAssign, SubAssign};

use slotmap::Key;

use crate::node::{Listener, NodeKind, ReactiveNode};
use crate::{create_computed, Computed, NodeHandle, NodeId, Root};

/// A read-only view of a signal.
///
/// The underlying value is not immutable: it can change through the corresponding [`Signal`],
/// and every `ReadSignal` derived from it will observe the new value. A `ReadSignal` is obtained
/// by dereferencing a [`Signal`] (every `Signal` *is* a `ReadSignal` with extra write methods).
pub struct ReadSignal<T: 'static> {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// A signal that can be both read and written to.
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// A token returned by [`ReadSignal::subscribe`]. Dropping it does *not* unsubscribe; call
/// [`Unsubscribe::unsubscribe`] explicitly.
pub struct Unsubscribe {
    id: NodeId,
    root: &'static Root,
    listener_id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(node) = self.root.nodes.borrow_mut().get_mut(self.id) {
            node.listeners.swap_remove(&self.listener_id);
        }
    }
}

/// Creates a new signal holding `value`.
///
/// # Example
/// ```
/// # use zen_reactive::*;
/// # create_root(|| {
/// let count = create_signal(0);
/// assert_eq!(count.get(), 0);
/// count.set(1);
/// assert_eq!(count.get(), 1);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal<T>(value: T) -> Signal<T> {
    let root = Root::global();
    let id = root.nodes.borrow_mut().insert(ReactiveNode::new(
        root.current_owner.get(),
        NodeKind::Signal,
        Some(Box::new(value)),
    ));
    if !root.current_owner.get().is_null() {
        root.nodes.borrow_mut()[root.current_owner.get()].children.push(id);
    }
    Signal(ReadSignal {
        id,
        root,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    })
}

impl<T> ReadSignal<T> {
    /// Wraps an already-inserted node as a typed handle. Used by [`crate::create_computed`] to
    /// hand back a handle once the node has been fully initialized.
    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn from_node(id: NodeId, root: &'static Root) -> Self {
        ReadSignal {
            id,
            root,
            #[cfg(debug_assertions)]
            created_at: std::panic::Location::caller(),
            _phantom: PhantomData,
        }
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn get_ref(self) -> Ref<'static, ReactiveNode> {
        Ref::map(self.root.nodes.borrow(), |nodes| match nodes.get(self.id) {
            Some(node) => node,
            None => panic!("{}", self.disposed_message()),
        })
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn get_mut(self) -> RefMut<'static, ReactiveNode> {
        RefMut::map(self.root.nodes.borrow_mut(), |nodes| match nodes.get_mut(self.id) {
            Some(node) => node,
            None => panic!("{}", self.disposed_message()),
        })
    }

    fn disposed_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "signal was disposed".to_string();
        #[cfg(debug_assertions)]
        return format!("signal was disposed. Created at {}", self.created_at);
    }

    /// Returns `true` if the signal has not yet been disposed.
    pub fn is_alive(self) -> bool {
        self.root.nodes.borrow().get(self.id).is_some()
    }

    /// Disposes the signal. Accessing it afterwards panics.
    pub fn dispose(self) {
        NodeHandle(self.id, self.root).dispose();
    }

    /// Gets the value without tracking it in the current scope. Requires [`Copy`]; use
    /// [`ReadSignal::get_clone_untracked`] or [`ReadSignal::with_untracked`] otherwise.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Gets the value without tracking it, cloning it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Gets the value, tracking it in the current reactive scope if any.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Gets the value, cloning it, tracking it in the current reactive scope if any.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Reads the value through `f` without tracking.
    ///
    /// If this is a [`Computed`](crate::Computed), this first pulls it up to date (recomputing it
    /// if it is dirty and its cached sources have actually changed), lazily: a computed with no
    /// observer never reaches this path and so is never recomputed at all.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.root.update_if_necessary(self.id);
        let node = self.get_ref();
        let value = node.value.as_ref().expect("signal value missing");
        f(value.downcast_ref().expect("wrong signal type"))
    }

    /// Reads the value through `f`, tracking it in the current reactive scope if any.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Records this signal as a dependency of the node currently being tracked, if any. Called
    /// automatically by [`ReadSignal::get`] and friends.
    pub fn track(self) {
        self.root.track(self.id);
    }

    /// Derives a [`Computed`] from this signal via `f`.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn map<U: PartialEq + 'static>(self, mut f: impl FnMut(&T) -> U + 'static) -> Computed<U> {
        create_computed(move || self.with(&mut f))
    }

    /// Registers `f` to be called with `(new, old)` whenever the value changes (i.e. whenever a
    /// write is not equality-rejected). `f` is also invoked once, synchronously, right away with
    /// `(current, None)` so a subscriber always has the value the moment it subscribes. After
    /// that, listeners fire in registration order, after the write that triggered them has fully
    /// applied, and are distinct from the implicit dependency-tracking edges created by
    /// [`ReadSignal::get`].
    pub fn subscribe(self, mut f: impl FnMut(&T, Option<&T>) + 'static) -> Unsubscribe {
        self.with_untracked(|value| f(value, None));
        let mut node = self.get_mut();
        let listener_id = node.alloc_listener_id();
        node.listeners.insert(
            listener_id,
            Listener {
                f: Box::new(move |new, old| {
                    f(
                        new.downcast_ref().expect("wrong signal type"),
                        old.map(|old| old.downcast_ref().expect("wrong signal type")),
                    )
                }),
            },
        );
        Unsubscribe { id: self.id, root: self.root, listener_id }
    }
}

/// Stashes `old` as the node's pending-old-value for the listener pass, unless one is already
/// pending (meaning an earlier write this batch already captured the true batch-start value).
fn stash_pending_old(node: &mut ReactiveNode, old: Box<dyn Any>) {
    if node.pending_old_value.is_none() {
        node.pending_old_value = Some(old);
    }
}

impl<T> Signal<T> {
    /// Sets a new value without notifying dependents or listeners. Generally discouraged: it can
    /// easily leave dependents observing a stale value.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_silent(self, new: T) {
        let mut node = self.0.get_mut();
        node.value = Some(Box::new(new));
    }

    /// Sets a new value, rejecting the write (no propagation, no version bump) if `new` equals
    /// the current value per [`PartialEq`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T)
    where
        T: PartialEq,
    {
        let mut old_box = self.0.get_mut().value.take().expect("signal value missing");
        let unchanged = old_box.downcast_ref::<T>().expect("wrong signal type") == &new;
        if unchanged {
            self.0.get_mut().value = Some(old_box);
            return;
        }
        let mut node = self.0.get_mut();
        stash_pending_old(&mut node, old_box);
        node.value = Some(Box::new(new));
        node.version += 1;
        drop(node);
        self.0.root.propagate_write(self.0.id);
    }

    /// Sets a new value and returns the previous one, rejecting no-op writes. Requires [`Clone`]
    /// because the previous value is both returned to the caller and (on the first write of a
    /// batch) retained for the listener pass.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace(self, new: T) -> T
    where
        T: PartialEq + Clone,
    {
        let mut old_box = self.0.get_mut().value.take().expect("signal value missing");
        let old_ref: &T = old_box.downcast_ref().expect("wrong signal type");
        if *old_ref == new {
            self.0.get_mut().value = Some(old_box);
            return new;
        }
        let old_t = old_ref.clone();
        let mut node = self.0.get_mut();
        stash_pending_old(&mut node, old_box);
        node.value = Some(Box::new(new));
        node.version += 1;
        drop(node);
        self.0.root.propagate_write(self.0.id);
        old_t
    }

    /// Silently replaces the value, returning the previous one, without notifying anyone.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace_silent(self, new: T) -> T {
        let mut node = self.0.get_mut();
        let old_box = node.value.replace(Box::new(new)).expect("signal value missing");
        *old_box.downcast::<T>().expect("wrong signal type")
    }

    /// Updates the value in place via `f` and notifies dependents if it changed. Requires
    /// [`Clone`] to snapshot the pre-mutation value for comparison.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update<U>(self, f: impl FnOnce(&mut T) -> U) -> U
    where
        T: PartialEq + Clone,
    {
        let mut value = self.0.get_mut().value.take().expect("signal value missing");
        let before: T = value.downcast_ref::<T>().expect("wrong signal type").clone();
        let ret = f(value.downcast_mut().expect("wrong signal type"));
        let changed = value.downcast_ref::<T>().expect("wrong signal type") != &before;
        let mut node = self.0.get_mut();
        if changed {
            stash_pending_old(&mut node, Box::new(before));
            node.version += 1;
        }
        node.value = Some(value);
        drop(node);
        if changed {
            self.0.root.propagate_write(self.0.id);
        }
        ret
    }

    /// Updates the value in place via `f`, without notifying anyone.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update_silent<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut value = self.0.get_mut().value.take().expect("signal value missing");
        let ret = f(value.downcast_mut().expect("wrong signal type"));
        self.0.get_mut().value = Some(value);
        ret
    }

    /// Calls `f` with the previous value and assigns its return value, notifying dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn(self, f: impl FnOnce(&T) -> T)
    where
        T: PartialEq,
    {
        let new = self.with_untracked(f);
        self.set(new);
    }

    /// Calls `f` with the previous value and assigns its return value, without notifying anyone.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn_silent(self, f: impl FnOnce(&T) -> T) {
        self.update_silent(move |val| *val = f(val));
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take(self) -> T
    where
        T: Default + PartialEq + Clone,
    {
        self.replace(T::default())
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take_silent(self) -> T
    where
        T: Default,
    {
        self.replace_silent(T::default())
    }

    /// Splits into a read-only view and a plain setter closure.
    pub fn split(self) -> (ReadSignal<T>, impl Fn(T))
    where
        T: PartialEq,
    {
        (*self, move |value| self.set(value))
    }
}

/// We manually implement `Clone`/`Copy` so handles don't pick up a spurious `T: Clone` bound.
impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

impl<T: Default + PartialEq> Default for ReadSignal<T> {
    fn default() -> Self {
        *create_signal(Default::default())
    }
}
impl<T: Default + PartialEq> Default for Signal<T> {
    fn default() -> Self {
        create_signal(Default::default())
    }
}

impl<T: PartialEq> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for ReadSignal<T> {}
impl<T: PartialOrd> PartialOrd for ReadSignal<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.with(|value| other.with(|other| value.partial_cmp(other)))
    }
}
impl<T: Ord> Ord for ReadSignal<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.with(|value| other.with(|other| value.cmp(other)))
    }
}
impl<T: Hash> Hash for ReadSignal<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}
impl<T: Eq> Eq for Signal<T> {}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for ReadSignal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + PartialEq> serde::Deserialize<'de> for Signal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(create_signal(T::deserialize(deserializer)?))
    }
}

impl<T: AddAssign<Rhs> + PartialEq + Clone, Rhs> AddAssign<Rhs> for Signal<T> {
    fn add_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this += rhs);
    }
}
impl<T: SubAssign<Rhs> + PartialEq + Clone, Rhs> SubAssign<Rhs> for Signal<T> {
    fn sub_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this -= rhs);
    }
}
impl<T: MulAssign<Rhs> + PartialEq + Clone, Rhs> MulAssign<Rhs> for Signal<T> {
    fn mul_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this *= rhs);
    }
}
impl<T: DivAssign<Rhs> + PartialEq + Clone, Rhs> DivAssign<Rhs> for Signal<T> {
    fn div_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this /= rhs);
    }
}
impl<T: RemAssign<Rhs> + PartialEq + Clone, Rhs> RemAssign<Rhs> for Signal<T> {
    fn rem_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this %= rhs);
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn signal_get_set() {
        let _ = create_root(|| {
            let state = create_signal(0);
            assert_eq!(state.get(), 0);
            state.set(1);
            assert_eq!(state.get(), 1);
            state.set_fn(|n| *n + 1);
            assert_eq!(state.get(), 2);
        });
    }

    #[test]
    fn equal_write_is_rejected() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let notified = create_signal(0);
            state.subscribe(move |_, _| {
                notified.set(notified.get_untracked() + 1);
            });
            assert_eq!(notified.get_untracked(), 1); // the synchronous initial call
            state.set(0); // same value: must not notify
            assert_eq!(notified.get_untracked(), 1);
            state.set(1);
            assert_eq!(notified.get_untracked(), 2);
        });
    }

    #[test]
    fn silent_write_does_not_propagate() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = state.map(|&x| x * 2);
            assert_eq!(double.get(), 0);
            state.set_silent(1);
            assert_eq!(double.get(), 0);
        });
    }

    #[test]
    fn subscribe_receives_new_and_old() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let seen = create_signal((0, -1));
            state.subscribe(move |new, old| seen.set((*new, old.copied().unwrap_or(-1))));
            assert_eq!(seen.get(), (1, -1)); // the synchronous initial call has no old value
            state.set(2);
            assert_eq!(seen.get(), (2, 1));
        });
    }

    #[test]
    fn signal_split() {
        let _ = create_root(|| {
            let (state, set_state) = create_signal(0).split();
            assert_eq!(state.get(), 0);
            set_state(1);
            assert_eq!(state.get(), 1);
        });
    }
}
