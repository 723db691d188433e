use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures_timer::Delay;
use tracing::{debug, trace, warn};

use crate::{
    config::LoaderConfig,
    data::{KeyBatch, KeyIndex, KeySet, KeyedEntry, OnDuplicate, Token as KeyToken, ValueSet},
    error::{LoadError, MalformedKey},
    fields::FieldSet,
    wakerset::{Token as WakerToken, WakerSet},
};

/// The outcome of a single load: `Ok(Some(value))` if the backend had a
/// record for the key, `Ok(None)` if it didn't.
pub type LoadResult<Value, Error> = Result<Option<Value>, LoadError<Error>>;

// Every lock in this module is held only for the duration of a synchronous
// step, never across a poll boundary. The crate is built with panic=abort, so
// a poisoned mutex can't be observed; recover the guard rather than
// propagating.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// `None` if the lock is held elsewhere, including further up this thread's
// own stack.
fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(err)) => Some(err.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// A set of configuration rules for a loader: the fetch function, plus the
/// limits on how batches are formed. Rules are built once, when the process
/// starts, and borrowed by every request-scoped [`Loader`].
///
/// The fetch function receives a [`KeyBatch`] and returns the records it
/// found. Any backend handle it needs should be captured by the closure.
///
/// The fetch function is called, and its future polled, while its batch is
/// locked. It may load through the same [`Loader`]; those keys go into a new
/// batch. It must not load a key that belongs to its own batch, since that
/// key's outcome is the one being fetched.
#[derive(Debug, Clone, Default)]
pub struct LoaderRules<Fetch> {
    pub fetch: Fetch,

    /// Close a batch as soon as it holds this many distinct keys.
    pub max_batch_size: Option<NonZeroUsize>,

    /// Extra time to keep a batch open, on top of the scheduling turn it
    /// always waits for.
    pub delay: Option<Duration>,

    pub on_duplicate: OnDuplicate,
}

impl<Fetch> LoaderRules<Fetch> {
    pub fn new(fetch: Fetch) -> Self {
        Self {
            fetch,
            max_batch_size: None,
            delay: None,
            on_duplicate: OnDuplicate::default(),
        }
    }

    pub fn with_config(self, config: &LoaderConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            delay: config.delay(),
            on_duplicate: config.on_duplicate,
            ..self
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = NonZeroUsize::new(max_batch_size);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_on_duplicate(mut self, on_duplicate: OnDuplicate) -> Self {
        self.on_duplicate = on_duplicate;
        self
    }

    fn is_full(&self, len: usize) -> bool {
        self.max_batch_size.map_or(false, |max| len >= max.get())
    }
}

struct AccumulatingState<'a, Key: Eq + Hash, Fetch> {
    keys: KeySet<Key>,
    rules: &'a LoaderRules<Fetch>,
    delay: Option<Delay>,

    // The number of keys the batch held at the last poll. The window closes
    // at the first poll that finds nothing was added since the previous one,
    // which is to say after every task has had a turn.
    observed: Option<usize>,

    // Set when the batch hits max_batch_size; skips the window entirely.
    full: bool,
    wakers: WakerSet,
}

impl<'a, Key, Fetch> Debug for AccumulatingState<'a, Key, Fetch>
where
    Key: Debug + Hash + Eq,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("rules", &"<rules>")
            .field("delay", &self.delay)
            .field("observed", &self.observed)
            .field("full", &self.full)
            .field("wakers", &self.wakers)
            .finish()
    }
}

struct RunningState<Key, Fut> {
    fut: Pin<Box<Fut>>,
    index: KeyIndex<Key>,
    fields: FieldSet,
    on_duplicate: OnDuplicate,
    wakers: WakerSet,
}

struct DoneState<Value, Error> {
    fields: FieldSet,
    result: Result<ValueSet<Value>, LoadError<Error>>,
}

enum State<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> {
    Accum(AccumulatingState<'a, Key, Fetch>),
    Running(RunningState<Key, Fut>),
    Done(DoneState<Value, Error>),
}

type SharedState<'a, Key, Value, Error, Fut, Fetch> =
    Arc<Mutex<State<'a, Key, Value, Error, Fut, Fetch>>>;

struct CacheEntry<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> {
    state: SharedState<'a, Key, Value, Error, Fut, Fetch>,
    token: KeyToken,
}

struct LoaderState<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> {
    // Every key requested through this loader, pointing at the batch that
    // holds (or will hold) its outcome. Entries keep their batch alive, which
    // is what makes settled outcomes reusable for the rest of the request.
    cache: HashMap<Key, CacheEntry<'a, Key, Value, Error, Fut, Fetch>>,

    // The batch currently accepting keys, if any.
    open: Weak<Mutex<State<'a, Key, Value, Error, Fut, Fetch>>>,
}

/// A request-scoped batch loader.
///
/// Create one per logical request (and per entity type) with
/// [`Loader::new`], and drop it when the request is done. Every
/// [`load`](Loader::load) made through it is deduplicated against everything
/// it has already loaded, and loads made during the same scheduling turn are
/// coalesced into a single call to the fetch function.
pub struct Loader<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> {
    rules: &'a LoaderRules<Fetch>,
    state: Mutex<LoaderState<'a, Key, Value, Error, Fut, Fetch>>,
}

impl<'a, Key, Value, Error, Fut, Fetch> Loader<'a, Key, Value, Error, Fut, Fetch>
where
    Key: Eq + Hash + Clone + Debug,
    Value: Clone + KeyedEntry<Key>,
    Error: Clone + Debug,
    Fetch: Fn(KeyBatch<Key>) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, Error>>,
{
    pub fn new(rules: &'a LoaderRules<Fetch>) -> Self {
        Self {
            rules,
            state: Mutex::new(LoaderState {
                cache: HashMap::new(),
                open: Weak::new(),
            }),
        }
    }

    pub fn rules(&self) -> &'a LoaderRules<Fetch> {
        self.rules
    }

    /// Request the record for `key`, with at least `fields` populated.
    ///
    /// Enqueueing is synchronous: by the time this returns, the key is part of
    /// a batch (or was answered from this loader's cache). The returned
    /// future resolves once that batch has been fetched; awaiting it is what
    /// drives the batch forward.
    pub fn load(&self, key: Key, fields: FieldSet) -> BatchFuture<'a, Key, Value, Error, Fut, Fetch> {
        // The cache lock is released before the batch is locked; a fetch
        // function that loads through this loader runs with its batch locked
        // and then takes the cache lock.
        let hit = lock(&self.state)
            .cache
            .get(&key)
            .map(|entry| (Arc::clone(&entry.state), entry.token.duplicate()));

        let fields = match hit {
            None => fields,
            Some((batch, token)) => {
                let mut guard = lock(&batch);

                // Fields already promised by the batch this key lives in.
                // An open batch can always be widened in place.
                let covered = match *guard {
                    State::Accum(ref mut accum) => {
                        accum.keys.merge_fields(&fields);
                        None
                    }
                    State::Running(ref running) => Some(&running.fields),
                    State::Done(ref done) => Some(&done.fields),
                };

                match covered {
                    Some(covered) if !fields.is_subset(covered) => {
                        let widened = covered.union(&fields);
                        debug!(?key, fields = %widened, "reloading key with wider projection");
                        widened
                    }
                    _ => {
                        trace!(?key, "load answered from request cache");
                        drop(guard);
                        return BatchFuture::queued(token, batch);
                    }
                }
            }
        };

        let mut state = lock(&self.state);
        let (batch, token) = self.enqueue(&mut state, key.clone(), &fields);
        state.cache.insert(
            key,
            CacheEntry {
                state: Arc::clone(&batch),
                token: token.duplicate(),
            },
        );

        BatchFuture::queued(token, batch)
    }

    /// Like [`load`](Loader::load), but first converts a raw key into the
    /// loader's key type. If the conversion fails, the returned future
    /// resolves immediately with [`LoadError::MalformedKey`]; nothing is
    /// added to the batch.
    pub fn try_load<Raw>(&self, raw: Raw, fields: FieldSet) -> BatchFuture<'a, Key, Value, Error, Fut, Fetch>
    where
        Raw: TryInto<Key>,
        Raw::Error: Into<MalformedKey>,
    {
        match raw.try_into() {
            Ok(key) => self.load(key, fields),
            Err(err) => {
                let err = err.into();
                debug!(error = %err, "rejecting malformed key");
                BatchFuture::rejected(err)
            }
        }
    }

    /// Load several keys with the same fields. All of them land in the same
    /// batch (subject to `max_batch_size`).
    pub fn load_many(
        &self,
        keys: impl IntoIterator<Item = Key>,
        fields: &FieldSet,
    ) -> Vec<BatchFuture<'a, Key, Value, Error, Fut, Fetch>> {
        keys.into_iter()
            .map(|key| self.load(key, fields.clone()))
            .collect()
    }

    /// The number of distinct keys this loader has seen.
    pub fn cached_keys(&self) -> usize {
        lock(&self.state).cache.len()
    }

    fn enqueue(
        &self,
        state: &mut LoaderState<'a, Key, Value, Error, Fut, Fetch>,
        key: Key,
        fields: &FieldSet,
    ) -> (SharedState<'a, Key, Value, Error, Fut, Fetch>, KeyToken) {
        // If there is an open batch, and it's still accumulating, add the key
        // to it. Note that at no point do we check the window here; if it has
        // closed, the next poll will advance the batch to Running, and in the
        // meantime it's fine for it to grow.
        //
        // The open batch is never waited on while the cache is locked. If
        // it's busy (being dispatched, possibly by a fetch function calling
        // back into this loader), the key starts a new batch instead.
        if let Some(batch) = state.open.upgrade() {
            let mut guard = match try_lock(&batch) {
                Some(guard) => guard,
                None => {
                    trace!("open batch is busy");
                    return self.open_batch(state, key, fields);
                }
            };
            if let State::Accum(ref mut accum) = *guard {
                let token = accum.keys.add_key(key, fields);

                // If we've hit the key limit:
                // - Clear the timer
                // - Wake the driver so it dispatches right away
                // - Detach the batch from the loader
                if self.rules.is_full(accum.keys.len()) {
                    trace!(keys = accum.keys.len(), "batch is full");
                    accum.full = true;
                    accum.delay = None;
                    accum.wakers.wake_driver();
                    state.open = Weak::new();
                }

                drop(guard);
                return (batch, token);
            }
        }

        self.open_batch(state, key, fields)
    }

    fn open_batch(
        &self,
        state: &mut LoaderState<'a, Key, Value, Error, Fut, Fetch>,
        key: Key,
        fields: &FieldSet,
    ) -> (SharedState<'a, Key, Value, Error, Fut, Fetch>, KeyToken) {
        let mut keys = KeySet::new();
        let token = keys.add_key(key, fields);
        let full = self.rules.is_full(keys.len());

        let batch = Arc::new(Mutex::new(State::Accum(AccumulatingState {
            keys,
            rules: self.rules,
            delay: match full {
                true => None,
                false => self.rules.delay.map(Delay::new),
            },
            observed: None,
            full,
            wakers: WakerSet::default(),
        })));

        state.open = match full {
            true => Weak::new(),
            false => Arc::downgrade(&batch),
        };

        trace!("opened new batch");
        (batch, token)
    }
}

enum Slot<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> {
    Queued {
        key_token: KeyToken,
        waker_token: Option<WakerToken>,
        state: SharedState<'a, Key, Value, Error, Fut, Fetch>,
    },
    Rejected(MalformedKey),
    Complete,
}

/// A request for a single key's record, which shares its fetch with every
/// other key in the same batch. It is created by [`Loader::load`], and when
/// awaited it waits along with the rest of its batch for the window to
/// close, drives the fetch, and returns the outcome for its specific key.
pub struct BatchFuture<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> {
    slot: Slot<'a, Key, Value, Error, Fut, Fetch>,
}

impl<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> BatchFuture<'a, Key, Value, Error, Fut, Fetch> {
    fn queued(key_token: KeyToken, state: SharedState<'a, Key, Value, Error, Fut, Fetch>) -> Self {
        Self {
            slot: Slot::Queued {
                key_token,
                waker_token: None,
                state,
            },
        }
    }

    fn rejected(err: MalformedKey) -> Self {
        Self {
            slot: Slot::Rejected(err),
        }
    }
}

impl<'a, Key, Value, Error, Fut, Fetch> Future for BatchFuture<'a, Key, Value, Error, Fut, Fetch>
where
    Key: Eq + Hash + Clone + Debug,
    Value: Clone + KeyedEntry<Key>,
    Error: Clone + Debug,
    Fetch: Fn(KeyBatch<Key>) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, Error>>,
{
    type Output = LoadResult<Value, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        let outcome = match unpinned.slot {
            Slot::Queued {
                ref key_token,
                ref mut waker_token,
                ref state,
            } => match poll_batch(state, key_token, waker_token, ctx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(outcome) => outcome,
            },
            Slot::Rejected(..) => match mem::replace(&mut unpinned.slot, Slot::Complete) {
                Slot::Rejected(err) => Err(LoadError::MalformedKey(err)),
                _ => unreachable!(),
            },
            Slot::Complete => panic!("Can't re-poll a completed BatchFuture"),
        };

        unpinned.slot = Slot::Complete;
        Poll::Ready(outcome)
    }
}

/// Drive a shared batch as far as it will go, on behalf of the future holding
/// `key_token`.
fn poll_batch<'a, Key, Value, Error, Fut, Fetch>(
    state: &SharedState<'a, Key, Value, Error, Fut, Fetch>,
    key_token: &KeyToken,
    waker_token: &mut Option<WakerToken>,
    ctx: &mut Context<'_>,
) -> Poll<LoadResult<Value, Error>>
where
    Key: Eq + Hash + Clone + Debug,
    Value: Clone + KeyedEntry<Key>,
    Error: Clone + Debug,
    Fetch: Fn(KeyBatch<Key>) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, Error>>,
{
    let mut guard = lock(state);

    if let State::Accum(ref mut accum) = *guard {
        if !accum.full {
            let delayed = match accum.delay {
                Some(ref mut delay) => Pin::new(delay).poll(ctx).is_pending(),
                None => false,
            };

            if delayed {
                // This waker is now the one the Delay will wake, which makes
                // it the driving waker.
                *waker_token = Some(accum.wakers.upsert_waker(waker_token.take(), ctx.waker()));
                return Poll::Pending;
            }
            accum.delay = None;

            let len = accum.keys.len();
            if accum.observed != Some(len) {
                // Keys were added since the last look. Yield once, so that
                // every other task on this scheduler gets its turn to add
                // keys before the batch closes.
                accum.observed = Some(len);
                *waker_token = Some(accum.wakers.upsert_waker(waker_token.take(), ctx.waker()));
                ctx.waker().wake_by_ref();
                return Poll::Pending;
            }
        }

        // Window is closed. Transition to the Running state.
        let wakers = mem::take(&mut accum.wakers);
        let (index, batch) = accum.keys.take();
        let fields = batch.fields().clone();
        let on_duplicate = accum.rules.on_duplicate;

        debug!(keys = batch.len(), fields = %fields, "dispatching batch");
        let fut = Box::pin((accum.rules.fetch)(batch));

        *guard = State::Running(RunningState {
            fut,
            index,
            fields,
            on_duplicate,
            wakers,
        });
    }

    if let State::Running(ref mut running) = *guard {
        let fetched = match running.fut.as_mut().poll(ctx) {
            Poll::Pending => {
                // This is now the driving waker for the fetch.
                *waker_token = Some(running.wakers.upsert_waker(waker_token.take(), ctx.waker()));
                return Poll::Pending;
            }
            Poll::Ready(fetched) => fetched,
        };

        let result = match fetched {
            Ok(records) => mem::take(&mut running.index)
                .into_values(records, running.on_duplicate)
                .map_err(|violation| {
                    warn!(%violation, "fetch function broke the batch contract");
                    LoadError::AdapterContractViolation(violation)
                }),
            Err(err) => {
                warn!(error = ?err, "batch fetch failed");
                Err(LoadError::FetchFailed(err))
            }
        };

        if let Ok(ref values) = result {
            debug!(
                found = values.found(),
                not_found = values.not_found(),
                "batch settled"
            );
        }

        // Now that we have a result, signal all the waiting futures to wake
        // up so they can get their results. We're about to grab our own
        // result, so we don't need to wake ourself.
        let wakers = mem::take(&mut running.wakers);
        match waker_token.take() {
            Some(token) => wakers.discard_wake_all(token),
            None => wakers.wake_all(),
        }

        let fields = mem::take(&mut running.fields);
        *guard = State::Done(DoneState { fields, result });
    }

    match *guard {
        State::Done(ref done) => {
            // Our waker, if any, belonged to a WakerSet that has been consumed.
            *waker_token = None;

            Poll::Ready(match done.result {
                Ok(ref values) => Ok(values.get(key_token)),
                Err(ref err) => Err(err.clone()),
            })
        }
        _ => unreachable!("BatchFuture contained invalid state"),
    }
}

impl<'a, Key: Eq + Hash, Value, Error, Fut, Fetch> Drop for BatchFuture<'a, Key, Value, Error, Fut, Fetch> {
    fn drop(&mut self) {
        // The shared batch is only ever driven by a single task. If we were
        // that task, another one has to be woken to take over; the WakerSet
        // takes care of picking it. Dropping a future doesn't withdraw its
        // key: the key stays in the batch and in the loader's cache.
        if let Slot::Queued {
            ref mut waker_token,
            ref state,
            ..
        } = self.slot
        {
            if let Some(token) = waker_token.take() {
                let mut guard = lock(state);
                match *guard {
                    State::Accum(ref mut accum) => accum.wakers.discard_and_wake(token),
                    State::Running(ref mut running) => running.wakers.discard_and_wake(token),
                    State::Done(..) => {}
                }
            }
        }
    }
}
