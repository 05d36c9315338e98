//! `zenAsync`: a keyed async-result cache layered on top of the core graph.
//!
//! This is deliberately *not* a reactive node itself; it fans state changes out to plain
//! listeners. A caller that wants a signal can wrap the handle in one (`create_signal` +
//! `subscribe`).
//!
//! The core has no internal executor (single-threaded cooperative, no internal suspension
//! points), so background refreshes (triggered by `stale_time`) are not spawned onto anything:
//! the refresh future is stored as the entry's inflight future and only makes progress when
//! something actually polls it — typically the next `run` call for the same key. A host that
//! wants stale-while-revalidate refreshes to complete even with no further `run` calls needs to
//! drive that future forward itself (e.g. by polling `ZenAsync::run` again, or spawning it on its
//! own executor).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::future::{FutureExt, Shared};
use indexmap::IndexMap;

use crate::error::ZenAsyncError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;
type SharedResult<T> = Shared<BoxFuture<Result<T, ZenAsyncError>>>;

/// A snapshot of one cache entry's state, as seen by [`ZenAsync::state`] or a subscriber.
#[derive(Debug, Clone)]
pub struct AsyncState<T> {
    pub loading: bool,
    pub data: Option<T>,
    pub error: Option<ZenAsyncError>,
}

impl<T> AsyncState<T> {
    fn idle() -> Self {
        Self { loading: false, data: None, error: None }
    }
}

/// Configuration for [`zen_async`].
pub struct ZenAsyncOptions {
    /// Disables the cache-disposal timer entirely: an entry with no listeners is kept forever.
    pub keep_alive: bool,
    /// How long an entry with zero listeners survives before [`ZenAsync::run`]/[`ZenAsync::state`]
    /// sweep it away. Default 30s.
    pub cache_time: Duration,
    /// If set, a `run` against an entry older than this returns the cached value immediately and
    /// starts a background refresh (see module docs for how that refresh actually progresses).
    pub stale_time: Option<Duration>,
}

impl Default for ZenAsyncOptions {
    fn default() -> Self {
        Self { keep_alive: false, cache_time: Duration::from_millis(30_000), stale_time: None }
    }
}

struct CacheEntry<Args, T> {
    loading: bool,
    data: Option<T>,
    error: Option<ZenAsyncError>,
    timestamp: Option<Instant>,
    inflight: Option<SharedResult<T>>,
    listeners: IndexMap<u64, Box<dyn FnMut(&AsyncState<T>)>>,
    next_listener_id: u64,
    dispose_at: Option<Instant>,
    stored_args: Option<Args>,
}

impl<Args, T> Default for CacheEntry<Args, T> {
    fn default() -> Self {
        Self {
            loading: false,
            data: None,
            error: None,
            timestamp: None,
            inflight: None,
            listeners: IndexMap::new(),
            next_listener_id: 0,
            dispose_at: None,
            stored_args: None,
        }
    }
}

impl<Args, T: Clone> CacheEntry<Args, T> {
    fn state(&self) -> AsyncState<T> {
        AsyncState { loading: self.loading, data: self.data.clone(), error: self.error.clone() }
    }

    fn notify(&mut self) {
        let state = self.state();
        for listener in self.listeners.values_mut() {
            listener(&state);
        }
    }

    fn maybe_schedule_dispose(&mut self, keep_alive: bool, cache_time: Duration) {
        if !keep_alive && self.listeners.is_empty() {
            self.dispose_at = Some(Instant::now() + cache_time);
        }
    }
}

struct Inner<Args, T> {
    f: Rc<dyn Fn(Args) -> BoxFuture<Result<T, ZenAsyncError>>>,
    cache_key: Rc<dyn Fn(&Args) -> String>,
    options: ZenAsyncOptions,
    entries: HashMap<String, CacheEntry<Args, T>>,
}

/// A keyed async-result cache built from an async function. See the module docs for the
/// background-refresh caveat and [`zen_async`] for construction.
pub struct ZenAsync<Args, T> {
    inner: Rc<RefCell<Inner<Args, T>>>,
}

impl<Args, T> Clone for ZenAsync<Args, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

/// Creates a new async cache wrapping `f`. The default cache key is `args`'s [`fmt::Debug`]
/// representation; override it with [`ZenAsync::with_cache_key`] when `Args` doesn't canonicalize
/// well that way (e.g. it contains floats or unordered collections).
pub fn zen_async<Args, T, E, F, Fut>(f: F, options: ZenAsyncOptions) -> ZenAsync<Args, T>
where
    Args: fmt::Debug + Clone + 'static,
    T: Clone + 'static,
    E: fmt::Display + 'static,
    F: Fn(Args) -> Fut + 'static,
    Fut: Future<Output = Result<T, E>> + 'static,
{
    let f = Rc::new(f);
    ZenAsync {
        inner: Rc::new(RefCell::new(Inner {
            f: Rc::new(move |args| {
                let f = f.clone();
                let fut: BoxFuture<Result<T, ZenAsyncError>> =
                    Box::pin(async move { f(args).await.map_err(ZenAsyncError::from_display) });
                fut
            }),
            cache_key: Rc::new(|args: &Args| format!("{args:?}")),
            options,
            entries: HashMap::new(),
        })),
    }
}

/// A token from [`ZenAsync::subscribe`]. Dropping it does not unsubscribe.
pub struct ZenAsyncUnsubscribe(Box<dyn FnOnce()>);

impl ZenAsyncUnsubscribe {
    pub fn unsubscribe(self) {
        (self.0)();
    }
}

/// Point-in-time counters, returned by [`ZenAsync::stats`].
#[derive(Debug, Clone, Copy)]
pub struct ZenAsyncStats {
    pub entry_count: usize,
    pub inflight_count: usize,
}

impl<Args, T> ZenAsync<Args, T>
where
    Args: fmt::Debug + Clone + 'static,
    T: Clone + 'static,
{
    /// Replaces the default `{:?}`-based cache key function with a custom one.
    pub fn with_cache_key(self, cache_key: impl Fn(&Args) -> String + 'static) -> Self {
        self.inner.borrow_mut().cache_key = Rc::new(cache_key);
        self
    }

    fn key_of(&self, args: &Args) -> String {
        (self.inner.borrow().cache_key)(args)
    }

    /// Disposes any entry whose listener count is zero and whose `cache_time` has elapsed.
    fn gc(&self) {
        let now = Instant::now();
        self.inner
            .borrow_mut()
            .entries
            .retain(|_, entry| match entry.dispose_at {
                Some(at) if entry.listeners.is_empty() => now < at,
                _ => true,
            });
    }

    /// Starts (or joins) the fetch for `key`/`args`, storing the resulting shared future as the
    /// entry's inflight slot and publishing the loading state. Does not await it.
    fn start_fetch(&self, key: &str, args: Args) -> SharedResult<T> {
        let raw_fut = {
            let inner = self.inner.borrow();
            (inner.f)(args)
        };
        let inner_rc = self.inner.clone();
        let key_owned = key.to_string();
        let wrapped: BoxFuture<Result<T, ZenAsyncError>> = Box::pin(async move {
            let result = raw_fut.await;
            let (keep_alive, cache_time) = {
                let inner = inner_rc.borrow();
                (inner.options.keep_alive, inner.options.cache_time)
            };
            let mut inner = inner_rc.borrow_mut();
            if let Some(entry) = inner.entries.get_mut(&key_owned) {
                entry.loading = false;
                entry.inflight = None;
                match &result {
                    Ok(data) => {
                        entry.data = Some(data.clone());
                        entry.error = None;
                        entry.timestamp = Some(Instant::now());
                    }
                    Err(err) => entry.error = Some(err.clone()),
                }
                entry.notify();
                entry.maybe_schedule_dispose(keep_alive, cache_time);
            }
            result
        });
        let shared = wrapped.shared();

        let mut inner = self.inner.borrow_mut();
        let entry = inner.entries.get_mut(key).unwrap();
        entry.loading = true;
        entry.inflight = Some(shared.clone());
        entry.notify();
        shared
    }

    /// Runs (or joins) the async computation for `args`.
    ///
    /// - No cached entry: starts the future, publishes loading, then the terminal state.
    /// - A fresh cached entry: returns the cached data without re-running.
    /// - A stale cached entry (per `stale_time`): returns the cached data immediately and starts
    ///   the background refresh described in the module docs.
    /// - A concurrent call with the same key while one is already inflight: joins the same
    ///   future, so the underlying async function runs exactly once.
    pub async fn run(&self, args: Args) -> Result<T, ZenAsyncError> {
        self.gc();
        let key = self.key_of(&args);
        {
            let mut inner = self.inner.borrow_mut();
            let entry = inner.entries.entry(key.clone()).or_default();
            entry.dispose_at = None;
            entry.stored_args = Some(args.clone());
        }

        let inflight = self.inner.borrow().entries[&key].inflight.clone();
        if let Some(inflight) = inflight {
            return inflight.await;
        }

        let fresh_enough = {
            let inner = self.inner.borrow();
            let entry = &inner.entries[&key];
            match (&entry.data, entry.timestamp) {
                (Some(_), Some(ts)) => match inner.options.stale_time {
                    Some(stale) => ts.elapsed() < stale,
                    None => true,
                },
                _ => false,
            }
        };
        if fresh_enough {
            return Ok(self.inner.borrow().entries[&key].data.clone().unwrap());
        }

        let had_stale_data = self.inner.borrow().entries[&key].data.clone();
        let shared = self.start_fetch(&key, args);

        if let Some(stale) = had_stale_data {
            return Ok(stale);
        }
        shared.await
    }

    /// Subscribes to state changes for `args`, calling `listener` once synchronously with the
    /// current state and again on every subsequent change. Starts a fetch if nothing has been
    /// cached or requested for this key yet.
    pub fn subscribe(
        &self,
        args: Args,
        mut listener: impl FnMut(&AsyncState<T>) + 'static,
    ) -> ZenAsyncUnsubscribe {
        self.gc();
        let key = self.key_of(&args);

        let (id, initial, needs_fetch) = {
            let mut inner = self.inner.borrow_mut();
            let entry = inner.entries.entry(key.clone()).or_default();
            entry.dispose_at = None;
            entry.stored_args = Some(args.clone());
            let id = entry.next_listener_id;
            entry.next_listener_id += 1;
            let needs_fetch = entry.inflight.is_none() && entry.data.is_none() && entry.error.is_none();
            (id, entry.state(), needs_fetch)
        };
        listener(&initial);
        self.inner.borrow_mut().entries.get_mut(&key).unwrap().listeners.insert(id, Box::new(listener));

        if needs_fetch {
            self.start_fetch(&key, args);
        }

        let (keep_alive, cache_time) = {
            let inner = self.inner.borrow();
            (inner.options.keep_alive, inner.options.cache_time)
        };
        let inner_rc = self.inner.clone();
        ZenAsyncUnsubscribe(Box::new(move || {
            let mut inner = inner_rc.borrow_mut();
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.listeners.swap_remove(&id);
                entry.maybe_schedule_dispose(keep_alive, cache_time);
            }
        }))
    }

    /// Returns the current state for `args` without starting a fetch.
    pub fn state(&self, args: &Args) -> AsyncState<T> {
        self.gc();
        let key = self.key_of(args);
        self.inner.borrow().entries.get(&key).map(CacheEntry::state).unwrap_or_else(AsyncState::idle)
    }

    /// Returns the cached data for `args`, if any, without starting a fetch.
    pub fn get(&self, args: &Args) -> Option<T> {
        self.state(args).data
    }

    /// Optimistically writes `data` for `args`, notifying listeners immediately.
    pub fn set(&self, args: Args, data: T) {
        self.gc();
        let key = self.key_of(&args);
        let mut inner = self.inner.borrow_mut();
        let entry = inner.entries.entry(key).or_default();
        entry.stored_args = Some(args);
        entry.data = Some(data);
        entry.error = None;
        entry.loading = false;
        entry.timestamp = Some(Instant::now());
        entry.notify();
    }

    /// Clears the cached entry for `args`. If it currently has listeners, immediately starts a
    /// refetch; otherwise just clears.
    pub fn invalidate(&self, args: Args) {
        self.gc();
        let key = self.key_of(&args);
        let had_listeners = {
            let mut inner = self.inner.borrow_mut();
            let entry = inner.entries.entry(key.clone()).or_default();
            entry.data = None;
            entry.error = None;
            entry.timestamp = None;
            entry.inflight = None;
            entry.notify();
            !entry.listeners.is_empty()
        };
        if had_listeners {
            self.start_fetch(&key, args);
        }
    }

    /// Clears every cached entry, refetching any that currently have listeners.
    pub fn invalidate_all(&self) {
        let to_refetch: Vec<(String, Args)> = {
            let mut inner = self.inner.borrow_mut();
            let mut refetch = Vec::new();
            for (key, entry) in inner.entries.iter_mut() {
                entry.data = None;
                entry.error = None;
                entry.timestamp = None;
                entry.inflight = None;
                entry.notify();
                if !entry.listeners.is_empty() {
                    if let Some(args) = &entry.stored_args {
                        refetch.push((key.clone(), args.clone()));
                    }
                }
            }
            refetch
        };
        for (key, args) in to_refetch {
            self.start_fetch(&key, args);
        }
    }

    /// Immediately removes the entry for `args`, ignoring `cache_time`/`keep_alive`.
    pub fn dispose(&self, args: &Args) {
        let key = self.key_of(args);
        self.inner.borrow_mut().entries.remove(&key);
    }

    /// Point-in-time counters over the whole cache.
    pub fn stats(&self) -> ZenAsyncStats {
        let inner = self.inner.borrow();
        ZenAsyncStats {
            entry_count: inner.entries.len(),
            inflight_count: inner.entries.values().filter(|e| e.inflight.is_some()).count(),
        }
    }
}

/// Free-function form of [`ZenAsync::run`].
pub async fn run_zen_async<Args, T>(cache: &ZenAsync<Args, T>, args: Args) -> Result<T, ZenAsyncError>
where
    Args: fmt::Debug + Clone + 'static,
    T: Clone + 'static,
{
    cache.run(args).await
}

/// Free-function form of [`ZenAsync::subscribe`].
pub fn subscribe_to_zen_async<Args, T>(
    cache: &ZenAsync<Args, T>,
    args: Args,
    listener: impl FnMut(&AsyncState<T>) + 'static,
) -> ZenAsyncUnsubscribe
where
    Args: fmt::Debug + Clone + 'static,
    T: Clone + 'static,
{
    cache.subscribe(args, listener)
}

/// Free-function form of [`ZenAsync::state`].
pub fn get_zen_async_state<Args, T>(cache: &ZenAsync<Args, T>, args: &Args) -> AsyncState<T>
where
    Args: fmt::Debug + Clone + 'static,
    T: Clone + 'static,
{
    cache.state(args)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn async_cache_dedup() {
        let call_count = Rc::new(Cell::new(0));
        let counted = call_count.clone();
        let cache = zen_async(
            move |id: i32| {
                let counted = counted.clone();
                async move {
                    counted.set(counted.get() + 1);
                    Ok::<i32, String>(id)
                }
            },
            ZenAsyncOptions::default(),
        );

        let (a, b, c) =
            futures::executor::block_on(futures::future::join3(cache.run(7), cache.run(7), cache.run(7)));
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(c.unwrap(), 7);
        assert_eq!(call_count.get(), 1);
    }

    #[test]
    fn fresh_cache_skips_rerun() {
        let call_count = Rc::new(Cell::new(0));
        let counted = call_count.clone();
        let cache = zen_async(
            move |id: i32| {
                let counted = counted.clone();
                async move {
                    counted.set(counted.get() + 1);
                    Ok::<i32, String>(id * 2)
                }
            },
            ZenAsyncOptions::default(),
        );
        futures::executor::block_on(async {
            assert_eq!(cache.run(3).await.unwrap(), 6);
            assert_eq!(cache.run(3).await.unwrap(), 6);
        });
        assert_eq!(call_count.get(), 1);
    }

    #[test]
    fn optimistic_set_is_visible_immediately() {
        let cache: ZenAsync<i32, i32> =
            zen_async(|id: i32| async move { Ok::<i32, String>(id) }, ZenAsyncOptions::default());
        cache.set(1, 100);
        assert_eq!(cache.get(&1), Some(100));
    }

    #[test]
    fn rejection_is_stored_as_error_and_retry_recovers() {
        let should_fail = Rc::new(Cell::new(true));
        let flag = should_fail.clone();
        let cache = zen_async(
            move |()| {
                let flag = flag.clone();
                async move {
                    if flag.get() {
                        Err("boom".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            ZenAsyncOptions::default(),
        );

        futures::executor::block_on(async {
            let err = cache.run(()).await.unwrap_err();
            assert_eq!(err.message, "boom");
            assert!(cache.state(&()).error.is_some());

            should_fail.set(false);
            let ok = cache.run(()).await.unwrap();
            assert_eq!(ok, 42);
            assert!(cache.state(&()).error.is_none());
        });
    }

    #[test]
    fn invalidate_without_listeners_just_clears() {
        let cache: ZenAsync<i32, i32> =
            zen_async(|id: i32| async move { Ok::<i32, String>(id) }, ZenAsyncOptions::default());
        cache.set(5, 50);
        assert_eq!(cache.get(&5), Some(50));
        cache.invalidate(5);
        assert_eq!(cache.get(&5), None);
    }

    #[test]
    fn subscribe_delivers_initial_state_synchronously() {
        let cache: ZenAsync<i32, i32> =
            zen_async(|id: i32| async move { Ok::<i32, String>(id) }, ZenAsyncOptions::default());
        cache.set(9, 90);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let unsub = cache.subscribe(9, move |state| {
            seen2.borrow_mut().push(state.data);
        });
        assert_eq!(seen.borrow().as_slice(), [Some(90)]);
        unsub.unsubscribe();
    }
}
