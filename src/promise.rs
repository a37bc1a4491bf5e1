//! The promise cell: a write-once outcome plus two callback registries.
//!
//! A [`Promise`] is settled exactly once, by whichever of its [`Resolve`] or
//! [`Reject`] capabilities gets there first. Callbacks subscribed before that
//! moment are queued in a lock-free [`Registry`] and drained by the settling
//! thread; callbacks subscribed afterwards run immediately on the caller's
//! thread.
use crate::{registry::Registry, CallbackPanics, Error, Options};
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{fence, Ordering},
        Arc, OnceLock,
    },
};

type Callback<A> = Box<dyn FnOnce(&A) + Send>;

/// Lifecycle of a promise. `Fulfilled` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "pending",
            State::Fulfilled => "fulfilled",
            State::Rejected => "rejected",
        })
    }
}

/// A producer panicked before settling its promise.
///
/// Promises built with [`Promise::of`] turn such a panic into a rejection,
/// which is why their error type must implement `From<Panicked>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("producer panicked: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        Self {
            message: panic_message(&*payload),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Panicked> for String {
    fn from(panicked: Panicked) -> Self {
        panicked.to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

enum Outcome<T, E> {
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    outcome: OnceLock<Outcome<T, E>>,
    on_success: Registry<Callback<T>>,
    on_failure: Registry<Callback<E>>,
    options: Options,
}

impl<T, E> Inner<T, E> {
    fn new(options: Options) -> Self {
        Self {
            outcome: OnceLock::new(),
            on_success: Registry::new(),
            on_failure: Registry::new(),
            options,
        }
    }

    fn state(&self) -> State {
        match self.outcome.get() {
            None => State::Pending,
            Some(Outcome::Fulfilled(_)) => State::Fulfilled,
            Some(Outcome::Rejected(_)) => State::Rejected,
        }
    }

    /// Claims the single transition out of `Pending`, then drains.
    fn complete(&self, outcome: Outcome<T, E>) -> Result<(), Error> {
        if self.outcome.set(outcome).is_err() {
            return Err(Error::AlreadyCompleted {
                state: self.state(),
            });
        }
        // Pairs with the fence in `settle_late`: either the drain below sees a
        // concurrent push, or that subscriber sees the outcome.
        fence(Ordering::SeqCst);
        self.flush();
        Ok(())
    }

    /// Called by a subscriber right after it pushed onto a registry.
    fn settle_late(&self) {
        fence(Ordering::SeqCst);
        if self.outcome.get().is_some() {
            self.flush();
        }
    }

    fn flush(&self) {
        match self.outcome.get() {
            Some(Outcome::Fulfilled(value)) => {
                let delivered = self.deliver(&self.on_success, value);
                let discarded = self.on_failure.drain().count();
                tracing::trace!(delivered, discarded, "drained success callbacks");
            }
            Some(Outcome::Rejected(error)) => {
                let delivered = self.deliver(&self.on_failure, error);
                let discarded = self.on_success.drain().count();
                tracing::trace!(delivered, discarded, "drained failure callbacks");
            }
            None => {}
        }
    }

    fn deliver<A>(&self, registry: &Registry<Callback<A>>, arg: &A) -> usize {
        let mut delivered = 0;
        while let Some(callback) = registry.pop() {
            self.invoke(callback, arg);
            delivered += 1;
        }
        delivered
    }

    fn invoke<A>(&self, callback: Callback<A>, arg: &A) {
        match self.options.callback_panics {
            CallbackPanics::Propagate => callback(arg),
            CallbackPanics::Isolate => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(arg))) {
                    tracing::error!(
                        panic = %panic_message(&*payload),
                        "promise callback panicked; continuing delivery"
                    );
                }
            }
        }
    }
}

/// Shared handle to a single-shot promise.
///
/// Clones refer to the same cell. Subscriptions may be made from any thread,
/// before or after the promise settles; each callback runs exactly once.
///
/// # Examples
///
/// ```
/// use promise_cell::Promise;
/// use std::{sync::mpsc::channel, thread, time::Duration};
///
/// let promise = Promise::<i32, String>::of(|resolve, _reject| {
///     thread::spawn(move || {
///         thread::sleep(Duration::from_millis(10));
///         resolve.resolve(10).expect("promise settled twice");
///     });
///     Ok(())
/// });
///
/// let (tx, rx) = channel();
/// promise
///     .subscribe_success(move |value| tx.send(*value).unwrap())
///     .subscribe_failure(|err| panic!("unexpected rejection: {err}"));
/// assert_eq!(rx.recv().unwrap(), 10);
/// ```
pub struct Promise<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Promise<T, E> {
    /// Builds a pending promise and runs `producer` once, synchronously.
    ///
    /// The producer receives the two capabilities bound to this promise and
    /// may pass them to other threads. Returning `Err` or panicking before
    /// either capability is used rejects the promise. Construction never
    /// waits for the promise to settle.
    pub fn of<P>(producer: P) -> Self
    where
        P: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
        E: From<Panicked>,
    {
        Self::with_options(Options::default(), producer)
    }

    /// Same as [`Promise::of`] with explicit [`Options`].
    pub fn with_options<P>(options: Options, producer: P) -> Self
    where
        P: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
        E: From<Panicked>,
    {
        let promise = Promise {
            inner: Arc::new(Inner::new(options)),
        };
        let resolve = Resolve {
            inner: promise.inner.clone(),
        };
        let reject = Reject {
            inner: promise.inner.clone(),
        };

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| producer(resolve, reject))) {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(payload) => Some(E::from(Panicked::from_payload(payload))),
        };
        if let Some(error) = failure {
            match promise.inner.complete(Outcome::Rejected(error)) {
                Ok(()) => tracing::debug!("producer failed; promise rejected"),
                Err(err) => tracing::warn!(%err, "producer failed after settling; failure dropped"),
            }
        }
        promise
    }

    /// Whether the promise has left `Pending`. A snapshot only.
    pub fn is_completed(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Runs `callback` with the value once the promise is fulfilled.
    ///
    /// On an already fulfilled promise the callback runs right away on the
    /// calling thread. Otherwise it is queued and runs on the thread that
    /// resolves the promise. It never runs if the promise is rejected.
    ///
    /// A subscriber that races the resolver and finds the promise settled
    /// right after queueing drains the registry itself, so queued callbacks
    /// may then run on that thread too, alongside the resolver's drain, and
    /// LIFO order holds only per draining thread.
    pub fn subscribe_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        match self.inner.outcome.get() {
            Some(Outcome::Fulfilled(value)) => self.inner.invoke::<T>(Box::new(callback), value),
            Some(Outcome::Rejected(_)) => {
                tracing::trace!("promise rejected; success callback dropped");
            }
            None => {
                self.inner.on_success.push(Box::new(callback));
                self.inner.settle_late();
            }
        }
        self
    }

    /// Runs `callback` with the error once the promise is rejected.
    ///
    /// Symmetric to [`Promise::subscribe_success`].
    pub fn subscribe_failure<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&E) + Send + 'static,
    {
        match self.inner.outcome.get() {
            Some(Outcome::Rejected(error)) => self.inner.invoke::<E>(Box::new(callback), error),
            Some(Outcome::Fulfilled(_)) => {
                tracing::trace!("promise fulfilled; failure callback dropped");
            }
            None => {
                self.inner.on_failure.push(Box::new(callback));
                self.inner.settle_late();
            }
        }
        self
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish()
    }
}

/// Capability that fulfills one promise. Handed to the producer.
pub struct Resolve<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Resolve<T, E> {
    /// Fulfills the promise and delivers `value` to every queued success
    /// callback, most recently subscribed first.
    ///
    /// Fails with [`Error::AlreadyCompleted`] if the promise already settled;
    /// the stored outcome is left untouched.
    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.inner
            .complete(Outcome::Fulfilled(value))
            .map_err(|err| {
                tracing::warn!(%err, "resolve called on a settled promise");
                err
            })
    }
}

impl<T, E> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolve<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolve")
            .field("state", &self.inner.state())
            .finish()
    }
}

/// Capability that rejects one promise. Handed to the producer.
pub struct Reject<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Reject<T, E> {
    /// Rejects the promise and delivers `error` to every queued failure
    /// callback, most recently subscribed first.
    pub fn reject(&self, error: E) -> Result<(), Error> {
        self.inner
            .complete(Outcome::Rejected(error))
            .map_err(|err| {
                tracing::warn!(%err, "reject called on a settled promise");
                err
            })
    }
}

impl<T, E> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Reject<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reject")
            .field("state", &self.inner.state())
            .finish()
    }
}
