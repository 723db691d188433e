//! These tests ensure that dropped futures correctly update the shared state
use cooked_waker::{IntoWaker, ViaRawPointer, Wake, WakeRef};
use futures::{executor, FutureExt};
use futures_timer::Delay;
use projection_loader::{FieldSet, KeyBatch, Loader, LoaderRules};
use std::{
    future::Future,
    hash::Hash,
    pin::Pin,
    rc::Rc,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone)]
struct NoOpWaker;

// SAFETY: `NoOpWaker` is a zero-sized type, so it round-trips through a
// constant dangling pointer that is never dereferenced.
unsafe impl ViaRawPointer for NoOpWaker {
    type Target = ();

    fn into_raw(self) -> *mut () {
        std::ptr::NonNull::dangling().as_ptr()
    }

    unsafe fn from_raw(_ptr: *mut ()) -> Self {
        NoOpWaker
    }
}

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// Testing async function: put a copy of each key in an Rc in the result.
/// This lets us track how many copies of each value are alive.
async fn put_keys_in_rc<T: Copy + Eq + Hash>(batch: KeyBatch<T>) -> Result<Vec<(T, Rc<T>)>, ()> {
    Ok(batch
        .keys()
        .iter()
        .map(|key| (*key, Rc::new(*key)))
        .collect())
}

/// This test establishes a baseline behavior for our clone counters
#[test]
fn test_simple_drop_after_resolution() {
    let rules = LoaderRules::new(put_keys_in_rc);
    let loader = Loader::new(&rules);

    let fut1 = loader.load(1, FieldSet::new());
    let fut2 = loader.load(1, FieldSet::new());
    let fut3 = loader.load(1, FieldSet::new());
    let fut4 = loader.load(1, FieldSet::new());

    let (_, res1) = executor::block_on(fut1).unwrap().unwrap();

    // At this point, the shared result and our local fut1 result should both
    // have an Rc
    assert_eq!(Rc::strong_count(&res1), 2);

    // Resolving fut2 simply clones the underlying Rc
    let (_, res2) = executor::block_on(fut2).unwrap().unwrap();
    assert_eq!(Rc::strong_count(&res2), 3);

    // Dropping the remaining futures doesn't change anything, because the
    // loader's cache still holds the settled batch
    drop(fut3);
    drop(fut4);
    assert_eq!(Rc::strong_count(&res1), 3);

    // Dropping the loader is what releases the shared state
    drop(loader);
    assert_eq!(Rc::strong_count(&res1), 2);
}

#[test]
fn test_drop_during_delay() {
    let batches = Mutex::new(Vec::new());
    let rules = LoaderRules::new(|batch: KeyBatch<i32>| {
        batches.lock().unwrap().push(batch.keys().to_vec());
        async move { Ok::<_, ()>(batch.keys().iter().map(|key| (*key, *key)).collect::<Vec<_>>()) }
    })
    .with_delay(Duration::from_millis(10));
    let loader = Loader::new(&rules);

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1, FieldSet::new());
    let fut11 = loader.load(1, FieldSet::new());
    let fut2 = loader.load(2, FieldSet::new());
    let fut3 = loader.load(3, FieldSet::new());

    // This poll initiates the delay. We'll drop futures in this phase; their
    // keys stay in the batch.
    let poll = Pin::new(&mut fut1).poll(&mut ctx);
    assert_eq!(poll, Poll::Pending);

    drop(fut11);
    drop(fut3);

    let result = executor::block_on(fut1).unwrap();
    assert_eq!(result, Some((1, 1)));

    let result = executor::block_on(fut2).unwrap();
    assert_eq!(result, Some((2, 2)));

    // Key 3 was fetched even though nobody was waiting for it, so loading it
    // again doesn't need another fetch
    let result = executor::block_on(loader.load(3, FieldSet::new())).unwrap();
    assert_eq!(result, Some((3, 3)));

    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
}

#[test]
fn test_drop_while_fetch_running() {
    let batches = Mutex::new(Vec::new());
    let rules = LoaderRules::new(|batch: KeyBatch<i32>| {
        batches.lock().unwrap().push(batch.keys().to_vec());
        async move {
            Delay::new(Duration::from_millis(5)).await;
            Ok::<_, ()>(batch.keys().iter().map(|key| (*key, *key)).collect::<Vec<_>>())
        }
    });
    let loader = Loader::new(&rules);

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    // The first poll closes the window; the second dispatches the fetch,
    // which is now waiting on its timer.
    let mut fut1 = loader.load(1, FieldSet::new());
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Pending);
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Pending);
    assert_eq!(batches.lock().unwrap().len(), 1);

    // Nobody is driving the fetch any more, but it isn't abandoned: a new
    // load of the same key picks it up where it left off.
    drop(fut1);

    let result = executor::block_on(loader.load(1, FieldSet::new())).unwrap();
    assert_eq!(result, Some((1, 1)));
    assert_eq!(batches.lock().unwrap().len(), 1);
}
