//! Effects: queued side-effecting observers.

use crate::node::{NodeKind, ReactiveNode};
use crate::Root;
use slotmap::Key;

/// What an effect callback may return: nothing, or a cleanup closure to run before the effect's
/// next run and on its disposal.
///
/// Implemented for `()` (no cleanup) and for any `FnOnce()` closure (including a boxed one), so an
/// effect can either fall off the end of its body or `return` a cleanup, without the caller having
/// to wrap it explicitly.
pub trait Cleanup {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>>;
}

impl Cleanup for () {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        None
    }
}

impl<F: FnOnce() + 'static> Cleanup for F {
    fn into_cleanup(self) -> Option<Box<dyn FnOnce()>> {
        Some(Box::new(self))
    }
}

/// Creates an effect that runs `f` once immediately, and again every time one of the signals or
/// computeds it reads changes.
///
/// Unlike a [`Computed`](crate::Computed), an effect is not lazy: it is queued to rerun as soon as
/// a source changes (deferred to the end of the current [`batch`](crate::batch) if one is active),
/// whether or not anything reads it. Dependencies are re-collected from scratch on every run, so
/// conditionally-read signals are only tracked while the branch that reads them is taken.
///
/// If `f` returns a closure, it is kept as this effect's cleanup and run right before the next
/// rerun and on disposal, alongside anything registered via [`crate::on_cleanup`].
///
/// # Example
/// ```
/// # use zen_reactive::*;
/// # create_root(|| {
/// let count = create_signal(0);
/// let seen = create_signal(0);
/// create_effect(move || seen.set(count.get()));
/// assert_eq!(seen.get(), 0);
/// count.set(5);
/// assert_eq!(seen.get(), 5);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect<C: Cleanup + 'static>(mut f: impl FnMut() -> C + 'static) {
    let root = Root::global();
    let owner = root.current_owner.get();

    let placeholder: Box<dyn FnMut() -> Option<Box<dyn FnOnce()>>> = Box::new(|| None);
    let id = root.nodes.borrow_mut().insert(ReactiveNode::new(
        owner,
        NodeKind::Effect { run: placeholder, source_versions: Default::default() },
        None,
    ));
    if !owner.is_null() {
        root.nodes.borrow_mut()[owner].children.push(id);
    }

    // The effect's first run is swallowed the same way a requeued rerun is (see `Root::run_effect`):
    // a panic here must not stop the caller's surrounding scope from finishing construction.
    let prev_observer = root.current_observer.replace(Some(id));
    let prev_owner = root.current_owner.replace(id);
    let prev_tracker = root.tracker.replace(Some(Default::default()));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f()));
    let sources = root.tracker.replace(prev_tracker).unwrap_or_default();
    root.current_owner.set(prev_owner);
    root.current_observer.set(prev_observer);

    for source in &sources {
        crate::node::link(root, *source, id);
    }
    let source_versions = sources
        .iter()
        .map(|s| root.nodes.borrow().get(*s).map(|n| n.version).unwrap_or(0))
        .collect();

    if let Some(node) = root.nodes.borrow_mut().get_mut(id) {
        if let NodeKind::Effect { run, source_versions: sv } = &mut node.kind {
            *run = Box::new(move || f().into_cleanup());
            *sv = source_versions;
        }
    }

    match result {
        Ok(cleanup) => {
            if let Some(cleanup) = cleanup.into_cleanup() {
                if let Some(node) = root.nodes.borrow_mut().get_mut(id) {
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

/// Wraps `f` so that `track_deps` runs first to establish the effect's dependencies explicitly,
/// and `f` itself runs untracked. Useful for pinning an effect's dependency list instead of
/// relying on auto-tracking picking up everything `f` happens to read.
///
/// # Example
/// ```
/// # use zen_reactive::*;
/// # create_root(|| {
/// let a = create_signal(1);
/// let calls = create_signal(0);
/// create_effect(on(move || a.track(), move || {
///     calls.set(calls.get_untracked() + 1);
/// }));
/// assert_eq!(calls.get(), 1);
/// a.set(2);
/// assert_eq!(calls.get(), 2);
/// # });
/// ```
pub fn on<U>(
    track_deps: impl Fn() + 'static,
    mut f: impl FnMut() -> U + 'static,
) -> impl FnMut() -> U + 'static {
    move || {
        track_deps();
        crate::untrack(&mut f)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn effect_runs_at_least_once() {
        let _ = create_root(|| {
            let runs = create_signal(0);
            create_effect(move || {
                runs.set(runs.get_untracked() + 1);
            });
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn effect_reruns_on_dependency_change() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let seen = create_signal(0);
            create_effect(move || seen.set(state.get()));
            assert_eq!(seen.get(), 0);
            state.set(1);
            assert_eq!(seen.get(), 1);
            state.set(2);
            assert_eq!(seen.get(), 2);
        });
    }

    #[test]
    fn effect_with_explicit_dependencies() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(on(move || state.track(), move || {
                runs.set(runs.get_untracked() + 1);
            }));
            assert_eq!(runs.get(), 1);
            state.set(1);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn effect_cannot_create_infinite_loop() {
        let _ = create_root(|| {
            let state = create_signal(0);
            create_effect(move || {
                // Reading and writing the same signal: since `set` rejects the write once the
                // value stabilizes, this does not loop forever.
                let v = state.get_untracked();
                if v < 1 {
                    state.set(v + 1);
                }
                state.track();
            });
            assert_eq!(state.get(), 1);
        });
    }

    #[test]
    fn effect_should_only_subscribe_once_to_same_signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set(runs.get_untracked() + 1);
                let _ = state.get() + state.get() + state.get();
            });
            assert_eq!(runs.get(), 1);
            state.set(1);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn effect_should_recreate_dependencies_each_time() {
        let _ = create_root(|| {
            let condition = create_signal(true);
            let a = create_signal(1);
            let b = create_signal(2);
            let runs = create_signal(0);
            create_effect(move || {
                runs.set(runs.get_untracked() + 1);
                if condition.get() {
                    a.track();
                } else {
                    b.track();
                }
            });
            assert_eq!(runs.get(), 1);

            condition.set(false);
            assert_eq!(runs.get(), 2);

            a.set(100); // no longer tracked
            assert_eq!(runs.get(), 2);

            b.set(200); // now tracked
            assert_eq!(runs.get(), 3);
        });
    }

    #[test]
    fn outer_effects_run_first() {
        let _ = create_root(|| {
            let trigger = create_signal(0);
            let order = create_signal(Vec::<&'static str>::new());
            create_effect(move || {
                trigger.track();
                order.update(|v| v.push("outer"));
                create_effect(move || {
                    trigger.track();
                    order.update(|v| v.push("inner"));
                });
            });
            assert_eq!(order.get_clone(), vec!["outer", "inner"]);
        });
    }

    #[test]
    fn destroy_effects_on_scope_dispose() {
        let _ = create_root(|| {
            let trigger = create_signal(0);
            let runs = create_signal(0);
            let scope = create_child_scope(move || {
                create_effect(move || {
                    trigger.track();
                    runs.set(runs.get_untracked() + 1);
                });
            });
            assert_eq!(runs.get(), 1);
            scope.dispose();
            trigger.set(1);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn effect_reacting_to_its_own_signal_converges() {
        // An effect that both reads and writes `state` doesn't cascade within a single run
        // (edges link only once the run completes), and the self-write it performs is already
        // reflected in the cached source version by the time the run finishes, so the spurious
        // requeue that write caused settles without an extra rerun. Each external `trigger` write
        // advances `state` by exactly one step.
        let _ = create_root(|| {
            let trigger = create_signal(0);
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(move || {
                trigger.track();
                runs.set(runs.get_untracked() + 1);
                let v = state.get_untracked();
                if v < 3 {
                    state.set(v + 1);
                }
                state.track();
            });
            assert_eq!(runs.get(), 1);
            assert_eq!(state.get(), 1);

            trigger.set(1);
            assert_eq!(state.get(), 2);
            assert_eq!(runs.get(), 2);

            trigger.set(2);
            assert_eq!(state.get(), 3);
            assert_eq!(runs.get(), 3);

            trigger.set(3);
            // v == 3 now, so the effect stops writing to state, but it still reruns because
            // `trigger` itself changed.
            assert_eq!(state.get(), 3);
            assert_eq!(runs.get(), 4);
        });
    }

    #[test]
    fn returned_cleanup_runs_before_rerun_and_on_dispose() {
        let _ = create_root(|| {
            let s = create_signal(0);
            let log = Rc::new(RefCell::new(Vec::new()));
            let log2 = log.clone();
            let scope = create_child_scope(move || {
                create_effect(move || {
                    let v = s.get();
                    log2.borrow_mut().push(format!("run{v}"));
                    let log3 = log2.clone();
                    move || log3.borrow_mut().push(format!("clean{v}"))
                });
            });
            assert_eq!(log.borrow().as_slice(), ["run0"]);

            s.set(1);
            assert_eq!(log.borrow().as_slice(), ["run0", "clean0", "run1"]);

            scope.dispose();
            assert_eq!(log.borrow().as_slice(), ["run0", "clean0", "run1", "clean1"]);
        });
    }
}
