use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    data::{KeySet, Token as KeyToken, ValueSet},
    wakerset::{Token as WakerToken, WakerSet},
    window::{Window, WindowFuture},
};

struct AccumulatingState<Key: Eq + Hash> {
    keys: KeySet<Key>,
    // None once the batch is ready to dispatch without waiting (the key
    // limit was reached).
    delay: Option<WindowFuture>,
    wakers: WakerSet,
}

impl<Key> Debug for AccumulatingState<Key>
where
    Key: Debug + Hash + Eq,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("delay", &self.delay)
            .field("wakers", &self.wakers)
            .finish()
    }
}

struct RunningState<Fut> {
    fut: Pin<Box<Fut>>,
    wakers: WakerSet,
}

enum State<Key: Eq + Hash, Value, Error, Fut> {
    Accum(AccumulatingState<Key>),
    Running(RunningState<Fut>),
    Done(Result<ValueSet<Value>, Error>),
}

type SharedState<Key, Value, Error, Fut> = Arc<Mutex<State<Key, Value, Error, Fut>>>;

/// Configuration for a [`BatchController`].
#[derive(Debug, Clone)]
pub struct BatchRules<Batcher> {
    /// The batch function. It is called once per batch with the distinct
    /// keys of that batch, in first-request order.
    pub batcher: Batcher,

    /// How long a batch accepts new keys.
    pub window: Window,

    /// If set, a batch is dispatched as soon as it holds this many distinct
    /// keys, regardless of the window.
    pub max_keys: Option<NonZeroUsize>,

    /// Remember the result of every key for the lifetime of the controller.
    /// Without the cache, keys are still deduplicated within a batch.
    pub cache: bool,

    /// Drop cached failures when the same key is loaded again, so that the
    /// next load starts a fresh fetch instead of replaying the error.
    pub evict_failures: bool,
}

impl<Batcher> BatchRules<Batcher> {
    /// Rules with a one-tick window, no key limit, and a cache that evicts
    /// failures.
    pub fn new(batcher: Batcher) -> Self {
        Self {
            batcher,
            window: Window::Tick,
            max_keys: None,
            cache: true,
            evict_failures: true,
        }
    }
}

struct Slot<Key: Eq + Hash, Value, Error, Fut> {
    state: SharedState<Key, Value, Error, Fut>,
    token: KeyToken,
}

impl<Key: Eq + Hash, Value, Error, Fut> Slot<Key, Value, Error, Fut> {
    fn has_failed(&self) -> bool {
        matches!(*self.state.lock(), State::Done(Err(..)))
    }
}

/// The keyed batch loader. Every call to [`load`][BatchController::load]
/// adds a key to the currently open batch and returns a [`BatchFuture`] for
/// that key's value. All the keys collected during one window are passed to
/// the batch function together.
///
/// With caching enabled, loading a key that was loaded before returns a
/// future bound to the same result as the earlier call, whether that result
/// is still pending or already resolved.
pub struct BatchController<Key: Eq + Hash, Value, Error, Fut, Batcher> {
    rules: Arc<BatchRules<Batcher>>,

    // The batch currently accepting keys. It may have already moved on to
    // Running or Done; `enqueue` checks the state before adding to it.
    current: ArcSwapOption<Mutex<State<Key, Value, Error, Fut>>>,

    cache: Mutex<HashMap<Key, Slot<Key, Value, Error, Fut>>>,
}

impl<Key, Value, Error, Fut, Batcher> BatchController<Key, Value, Error, Fut, Batcher>
where
    Key: Eq + Hash + Clone,
    Value: Clone,
    Error: Clone,
    Batcher: Fn(KeySet<Key>) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value>, Error>>,
{
    pub fn new(rules: BatchRules<Batcher>) -> Self {
        Self {
            rules: Arc::new(rules),
            current: ArcSwapOption::empty(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn rules(&self) -> &BatchRules<Batcher> {
        &self.rules
    }

    pub fn load(&self, key: Key) -> BatchFuture<Key, Value, Error, Fut, Batcher> {
        if !self.rules.cache {
            return self.enqueue(key);
        }

        // The cache lock is held across the enqueue, so two loads of the
        // same key can never both miss.
        let mut cache = self.cache.lock();

        if let Some(slot) = cache.get(&key) {
            if !(self.rules.evict_failures && slot.has_failed()) {
                return BatchFuture::new(
                    Arc::clone(&slot.state),
                    slot.token.duplicate(),
                    Arc::clone(&self.rules),
                );
            }

            debug!("evicting failed cache entry");
        }

        let future = self.enqueue(key.clone());
        if let Some(state) = future.state.as_ref() {
            cache.insert(
                key,
                Slot {
                    state: Arc::clone(state),
                    token: future.key_token.duplicate(),
                },
            );
        }

        future
    }

    /// Load several keys at once. The returned futures are in the same order
    /// as the keys.
    pub fn load_many(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> Vec<BatchFuture<Key, Value, Error, Fut, Batcher>> {
        keys.into_iter().map(|key| self.load(key)).collect()
    }

    fn enqueue(&self, key: Key) -> BatchFuture<Key, Value, Error, Fut, Batcher> {
        let current = self.current.load_full();

        // If there is an existing state, and it's still accumulating, add
        // the key to it. Note that at no point do we check the timing; we
        // assume that if the window has closed, a future poll will advance
        // the state to Running.
        if let Some(state) = current.as_ref() {
            let mut guard = state.lock();
            if let State::Accum(ref mut accum) = *guard {
                let key_token = accum.keys.add_key(key);

                // If we've hit the key limit:
                // - Clear the window
                // - Wake the driver so it dispatches
                // - Detach the shared state from the controller
                match self.rules.max_keys {
                    Some(max_keys) if accum.keys.len() >= max_keys.get() => {
                        accum.delay = None;
                        accum.wakers.wake_driver();
                        drop(guard);
                        let _ = self
                            .current
                            .compare_and_swap(&current, None::<SharedState<Key, Value, Error, Fut>>);
                    }
                    _ => drop(guard),
                }

                return BatchFuture::new(Arc::clone(state), key_token, Arc::clone(&self.rules));
            }
        }

        let mut keys = KeySet::new();
        let key_token = keys.add_key(key);

        let dispatch_now = matches!(self.rules.max_keys, Some(max_keys) if max_keys.get() <= 1);

        let state = Arc::new(Mutex::new(State::Accum(AccumulatingState {
            keys,
            delay: if dispatch_now {
                None
            } else {
                Some(self.rules.window.start())
            },
            wakers: WakerSet::default(),
        })));

        // If another thread opened a batch in the meantime, the swap fails
        // and this batch simply runs on its own.
        if !dispatch_now {
            let _ = self
                .current
                .compare_and_swap(&current, Some(Arc::clone(&state)));
        }

        trace!("opened new batch");

        BatchFuture::new(state, key_token, Arc::clone(&self.rules))
    }
}

impl<Key, Value, Error, Fut, Batcher> BatchController<Key, Value, Error, Fut, Batcher>
where
    Key: Eq + Hash,
{
    /// Number of distinct keys in the batch that is currently accepting keys.
    pub fn pending_keys(&self) -> usize {
        match self.current.load().as_ref() {
            None => 0,
            Some(state) => match *state.lock() {
                State::Accum(ref accum) => accum.keys.len(),
                _ => 0,
            },
        }
    }

    /// Number of keys with a cached (pending or resolved) result.
    pub fn cached_keys(&self) -> usize {
        self.cache.lock().len()
    }

    /// Forget the cached result for one key. Futures already handed out for
    /// that key are unaffected. Returns true if the key was cached.
    pub fn clear<Q>(&self, key: &Q) -> bool
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.lock().remove(key).is_some()
    }

    /// Forget every cached result.
    pub fn clear_all(&self) {
        self.cache.lock().clear();
    }
}

impl<Key, Value, Error, Fut, Batcher> Debug for BatchController<Key, Value, Error, Fut, Batcher>
where
    Key: Eq + Hash,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchController")
            .field("window", &self.rules.window)
            .field("max_keys", &self.rules.max_keys)
            .field("pending_keys", &self.pending_keys())
            .field("cached_keys", &self.cached_keys())
            .finish()
    }
}

/// The eventual result of a single [`BatchController::load`] call. The batch
/// is driven entirely by polling these futures: the first future to poll a
/// batch drives its window and its batch function, and the rest wait to be
/// woken when the results are in. A waiting future that is polled again
/// advances the batch itself, so a driver that is held but never polled
/// can't stall the others.
pub struct BatchFuture<Key: Eq + Hash, Value, Error, Fut, Batcher> {
    key_token: KeyToken,
    waker_token: Option<WakerToken>,
    state: Option<SharedState<Key, Value, Error, Fut>>,
    rules: Arc<BatchRules<Batcher>>,

    // Set once this future has polled the window or the batch function
    // without being the driver. Its waker may be the one they will wake.
    advanced: bool,
}

impl<Key: Eq + Hash, Value, Error, Fut, Batcher> BatchFuture<Key, Value, Error, Fut, Batcher> {
    fn new(
        state: SharedState<Key, Value, Error, Fut>,
        key_token: KeyToken,
        rules: Arc<BatchRules<Batcher>>,
    ) -> Self {
        Self {
            key_token,
            waker_token: None,
            state: Some(state),
            rules,
            advanced: false,
        }
    }

    /// True if both futures resolve to the very same result: the same key
    /// of the same batch.
    pub fn shares_result_with(&self, other: &Self) -> bool {
        match (&self.state, &other.state) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) && self.key_token == other.key_token,
            _ => false,
        }
    }
}

/// Record the polling task's waker in the batch's waker set, and report
/// whether this future may advance the batch. The driver always may. Any
/// other future may from its second poll on: by then every sibling polled in
/// the same scheduler round has added its key.
fn register(slot: &mut Option<WakerToken>, wakers: &mut WakerSet, ctx: &Context<'_>) -> bool {
    match slot {
        Some(token) => {
            wakers.replace_waker(token, ctx.waker());
            true
        }
        None => {
            let token = wakers.add_waker(ctx.waker().clone());
            let driver = wakers.is_driver(&token);
            *slot = Some(token);
            driver
        }
    }
}

fn is_driver(slot: &Option<WakerToken>, wakers: &WakerSet) -> bool {
    slot.as_ref().map_or(false, |token| wakers.is_driver(token))
}

impl<Key, Value, Error, Fut, Batcher> Future for BatchFuture<Key, Value, Error, Fut, Batcher>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Batcher: Fn(KeySet<Key>) -> Fut,
    Fut: Future<Output = Result<ValueSet<Value>, Error>>,
{
    type Output = Result<Value, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        // The lock is only held for the duration of this poll, never across
        // an await.
        let state = this
            .state
            .as_ref()
            .expect("Can't re-poll a completed BatchFuture");
        let mut guard = state.lock();

        if let State::Accum(ref mut accum) = *guard {
            // On their first poll, passengers just wait to be woken.
            if !register(&mut this.waker_token, &mut accum.wakers, ctx) {
                return Poll::Pending;
            }
            if !is_driver(&this.waker_token, &accum.wakers) {
                this.advanced = true;
            }

            if let Some(ref mut delay) = accum.delay {
                if Pin::new(delay).poll(ctx).is_pending() {
                    return Poll::Pending;
                }
            }

            // Window is closed. Transition to the Running state.
            let keys = accum.keys.take();
            let wakers = mem::take(&mut accum.wakers);

            debug!(keys = keys.len(), "dispatching batch");
            let fut = (this.rules.batcher)(keys);

            *guard = State::Running(RunningState {
                fut: Box::pin(fut),
                wakers,
            });
        }

        if let State::Running(ref mut running) = *guard {
            if !register(&mut this.waker_token, &mut running.wakers, ctx) {
                return Poll::Pending;
            }
            if !is_driver(&this.waker_token, &running.wakers) {
                this.advanced = true;
            }

            let result = match running.fut.as_mut().poll(ctx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };

            trace!(ok = result.is_ok(), "batch completed");

            // Now that we have a result, signal all the waiting futures to
            // wake up so they can get their results.
            let wakers = mem::take(&mut running.wakers);
            match this.waker_token.take() {
                Some(token) => wakers.discard_wake_all(token),
                None => wakers.wake_all(),
            }

            *guard = State::Done(result);
        }

        let output = match *guard {
            State::Done(Ok(ref values)) => match values.get(&this.key_token) {
                Some(value) => Ok(value.clone()),
                None => panic!("Unknown logic error: no value in ValueSet associated with Token"),
            },
            State::Done(Err(ref err)) => Err(err.clone()),
            _ => unreachable!("BatchFuture contained invalid state"),
        };

        drop(guard);
        this.state = None;
        Poll::Ready(output)
    }
}

impl<Key: Eq + Hash, Value, Error, Fut, Batcher> Drop for BatchFuture<Key, Value, Error, Fut, Batcher> {
    fn drop(&mut self) {
        // If this future was the driver another one has to be woken to take
        // over. If it advanced the batch as a passenger, the window or the
        // batch function may hold its waker, so the driver is woken to poll
        // them again. The key itself stays in the batch: other futures (or
        // the cache) may still want its value.
        if let (Some(state), Some(waker_token)) = (self.state.as_ref(), self.waker_token.take()) {
            let mut guard = state.lock();
            let wakers = match *guard {
                State::Accum(ref mut accum) => &mut accum.wakers,
                State::Running(ref mut running) => &mut running.wakers,
                State::Done(..) => return,
            };

            let was_driver = wakers.is_driver(&waker_token);
            wakers.discard_and_wake(waker_token);
            if self.advanced && !was_driver {
                wakers.wake_driver();
            }
        }
    }
}
