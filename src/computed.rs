//! Computeds: lazily, equality-checked derived values.

use crate::node::{NodeKind, ReactiveNode};
use crate::{ReadSignal, Root};
use slotmap::Key;

/// A read-only derived value. Structurally just a [`ReadSignal`] whose node is a
/// [`NodeKind::Computed`]: the same `get`/`with`/`track` accessors apply, pulling the value up to
/// date on demand instead of always holding a current one.
pub type Computed<T> = ReadSignal<T>;

/// Creates a computed value from `f`.
///
/// `f` is run once eagerly to produce the initial value, and its dependencies are auto-tracked:
/// whatever signals or computeds `f` reads while running become this computed's sources, and are
/// re-collected from scratch on every recompute (conditional dependencies are supported: branches
/// not taken this time are not tracked this time).
///
/// A computed is only recomputed when both (a) a source has actually changed, and (b) something
/// reads it — an unobserved computed is marked dirty but left unevaluated indefinitely. Recompute
/// is also skipped if every source's current value still equals its value as of the last
/// recompute (the "equality rejection" invariant, checked by each source's own [`PartialEq`]), so
/// a computed only notifies its own dependents when its *output* actually changes.
///
/// # Example
/// ```
/// # use zen_reactive::*;
/// # create_root(|| {
/// let state = create_signal(1);
/// let doubled = create_computed(move || state.get() * 2);
/// assert_eq!(doubled.get(), 2);
/// state.set(2);
/// assert_eq!(doubled.get(), 4);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_computed<T: PartialEq + 'static>(mut f: impl FnMut() -> T + 'static) -> Computed<T> {
    let root = Root::global();
    let owner = root.current_owner.get();

    let placeholder_calc: Box<dyn FnMut(&mut Box<dyn std::any::Any>) -> Option<Box<dyn std::any::Any>>> =
        Box::new(|_| None);
    let id = root.nodes.borrow_mut().insert(ReactiveNode::new(
        owner,
        NodeKind::Computed { calc: placeholder_calc, dirty: true, source_versions: Default::default() },
        None,
    ));
    if !owner.is_null() {
        root.nodes.borrow_mut()[owner].children.push(id);
    }

    let prev_observer = root.current_observer.replace(Some(id));
    let prev_owner = root.current_owner.replace(id);
    let (initial, sources) = root.tracked_scope(&mut f);
    root.current_owner.set(prev_owner);
    root.current_observer.set(prev_observer);

    for source in &sources {
        crate::node::link(root, *source, id);
    }
    let source_versions = sources
        .iter()
        .map(|s| root.nodes.borrow().get(*s).map(|n| n.version).unwrap_or(0))
        .collect();

    let calc: Box<dyn FnMut(&mut Box<dyn std::any::Any>) -> Option<Box<dyn std::any::Any>>> =
        Box::new(move |slot| {
            let new = f();
            let changed = slot.downcast_ref::<T>().map(|old| *old != new).unwrap_or(true);
            if changed {
                Some(std::mem::replace(slot, Box::new(new)))
            } else {
                None
            }
        });

    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.value = Some(Box::new(initial));
        match &mut node.kind {
            NodeKind::Computed { calc: slot, dirty, source_versions: sv } => {
                *slot = calc;
                *dirty = false;
                *sv = source_versions;
            }
            _ => unreachable!(),
        }
    }

    ReadSignal::from_node(id, root)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn computed_recomputes_on_source_change() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_computed(move || state.get() * 2);
            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn unobserved_computed_is_not_eagerly_recomputed() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            let double = create_computed(move || {
                runs.set(runs.get_untracked() + 1);
                state.get() * 2
            });
            assert_eq!(runs.get_untracked(), 1); // once for the initial value
            state.set(1);
            state.set(2);
            state.set(3);
            // Nobody has called `double.get()` yet: it must not have recomputed.
            assert_eq!(runs.get_untracked(), 1);
            assert_eq!(double.get(), 6);
            assert_eq!(runs.get_untracked(), 2);
        });
    }

    #[test]
    fn diamond_dependency_runs_consumer_once() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let left = create_computed(move || state.get() * 2);
            let right = create_computed(move || state.get() + 10);
            let runs = create_signal(0);
            let sum = create_computed(move || {
                runs.set(runs.get_untracked() + 1);
                left.get() + right.get()
            });
            assert_eq!(sum.get(), 13);
            assert_eq!(runs.get_untracked(), 1);
            state.set(2);
            assert_eq!(sum.get(), 16);
            assert_eq!(runs.get_untracked(), 2);
        });
    }

    #[test]
    fn conditional_dependency_is_retracked_each_time() {
        let _ = create_root(|| {
            let condition = create_signal(true);
            let a = create_signal(1);
            let b = create_signal(2);
            let result = create_computed(move || if condition.get() { a.get() } else { b.get() });

            assert_eq!(result.get(), 1);
            b.set(20);
            assert_eq!(result.get(), 1); // b not tracked while condition was true

            condition.set(false);
            assert_eq!(result.get(), 20);
            a.set(100);
            assert_eq!(result.get(), 20); // a no longer tracked
        });
    }

    #[test]
    fn equal_output_does_not_notify_dependents() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let squared = create_computed(move || state.get() * state.get());
            let runs = create_signal(0);
            create_effect(move || {
                runs.set(runs.get_untracked() + 1);
                squared.track();
            });
            assert_eq!(runs.get_untracked(), 1);

            state.set(-1); // squared stays 1: the effect should not rerun
            assert_eq!(squared.get(), 1);
            assert_eq!(runs.get_untracked(), 1);

            state.set(2);
            assert_eq!(squared.get(), 4);
            assert_eq!(runs.get_untracked(), 2);
        });
    }

    #[test]
    fn destroyed_with_owning_scope() {
        let _ = create_root(|| {
            let trigger = create_signal(0);
            let runs = create_signal(0);
            let scope = create_child_scope(move || {
                let _ = create_computed(move || {
                    trigger.track();
                    runs.set(runs.get_untracked() + 1);
                });
            });
            scope.dispose();
            trigger.set(1);
            // The computed was disposed along with its scope, so nothing observed the write.
            assert_eq!(runs.get_untracked(), 1);
        });
    }

    #[test]
    fn subscribed_computed_recomputes_with_no_reader() {
        let _ = create_root(|| {
            let c = create_signal(0);
            let d = create_computed(move || c.get() * 2);
            let seen = Rc::new(RefCell::new(Vec::new()));
            let seen2 = seen.clone();
            d.subscribe(move |new, old| seen2.borrow_mut().push((*new, old.copied())));
            assert_eq!(seen.borrow().as_slice(), [(0, None)]);

            c.set(1);
            assert_eq!(seen.borrow().as_slice(), [(0, None), (2, Some(0))]);

            c.set(1); // same value: the signal write itself is rejected
            assert_eq!(seen.borrow().len(), 2);
        });
    }

    #[test]
    fn diamond_listener_fires_once_per_batch() {
        let _ = create_root(|| {
            let a = create_signal(1);
            let b_runs = create_signal(0);
            let c_runs = create_signal(0);
            let b = create_computed(move || {
                b_runs.set(b_runs.get_untracked() + 1);
                a.get() * 2
            });
            let c = create_computed(move || {
                c_runs.set(c_runs.get_untracked() + 1);
                a.get() * 3
            });
            let t = create_computed(move || b.get() + c.get());
            let seen = Rc::new(RefCell::new(Vec::new()));
            let seen2 = seen.clone();
            t.subscribe(move |new, old| seen2.borrow_mut().push((*new, old.copied())));
            assert_eq!(seen.borrow().as_slice(), [(5, None)]);

            batch(|| {
                a.set(2);
                a.set(3);
            });
            assert_eq!(b_runs.get_untracked(), 2);
            assert_eq!(c_runs.get_untracked(), 2);
            assert_eq!(seen.borrow().as_slice(), [(5, None), (15, Some(5))]);
        });
    }

    #[test]
    fn conditional_dependency_listener_only_fires_on_tracked_changes() {
        let _ = create_root(|| {
            let flag = create_signal(true);
            let x = create_signal(10);
            let y = create_signal(20);
            let z = create_computed(move || if flag.get() { x.get() } else { y.get() });
            let seen = Rc::new(RefCell::new(Vec::new()));
            let seen2 = seen.clone();
            z.subscribe(move |new, old| seen2.borrow_mut().push((*new, old.copied())));
            assert_eq!(seen.borrow().as_slice(), [(10, None)]);

            y.set(999); // not tracked while flag is true
            assert_eq!(seen.borrow().len(), 1);

            flag.set(false);
            assert_eq!(seen.borrow().as_slice(), [(10, None), (999, Some(10))]);

            x.set(11); // no longer tracked
            assert_eq!(seen.borrow().len(), 2);

            y.set(1000);
            assert_eq!(
                seen.borrow().as_slice(),
                [(10, None), (999, Some(10)), (1000, Some(999))]
            );
        });
    }
}
