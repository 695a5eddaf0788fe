//! Multi-observer event dispatch
//!
//! [`EventBus`] keeps weak registrations: an observer that is dropped without
//! unregistering simply stops receiving events and is pruned on the next
//! dispatch. Delivery walks a snapshot of the registrations in reverse order,
//! so observers may register or unregister (themselves or others) from inside
//! their own callback.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Receives events of type `E`.
pub trait Observer<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, F> Observer<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A single task on which observers run when dispatch is not inline.
///
/// Jobs run in the order they were posted.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    pub fn spawn(runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                job();
            }
            debug!("Dispatcher stopped");
        });
        Self { sender }
    }

    /// Queue `job`. Returns false once the dispatcher task is gone.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(Box::new(job)).is_ok()
    }
}

struct Registration<E> {
    observer: Weak<dyn Observer<E>>,
    live: Arc<AtomicBool>,
}

impl<E> Clone for Registration<E> {
    fn clone(&self) -> Self {
        Self {
            observer: self.observer.clone(),
            live: self.live.clone(),
        }
    }
}

pub struct EventBus<E> {
    registrations: Mutex<Vec<Registration<E>>>,
    dispatcher: Option<Dispatcher>,
}

impl<E: Send + Sync + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync + 'static> EventBus<E> {
    /// A bus that delivers on the publishing thread.
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            dispatcher: None,
        }
    }

    /// A bus that delivers on `dispatcher`.
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            dispatcher: Some(dispatcher),
        }
    }

    /// Returns false if `observer` is already registered.
    pub fn register<O>(&self, observer: &Arc<O>) -> bool
    where
        O: Observer<E> + 'static,
    {
        let mut registrations = self.registrations.lock();
        registrations.retain(|r| r.observer.strong_count() > 0);
        let target = Arc::as_ptr(observer);
        if registrations
            .iter()
            .any(|r| std::ptr::addr_eq(r.observer.as_ptr(), target))
        {
            return false;
        }
        let weak: Weak<dyn Observer<E>> = Arc::downgrade(observer) as Weak<dyn Observer<E>>;
        registrations.push(Registration {
            observer: weak,
            live: Arc::new(AtomicBool::new(true)),
        });
        true
    }

    /// Returns false if `observer` was not registered.
    pub fn unregister<O>(&self, observer: &Arc<O>) -> bool
    where
        O: Observer<E> + 'static,
    {
        let mut registrations = self.registrations.lock();
        registrations.retain(|r| r.observer.strong_count() > 0);
        let target = Arc::as_ptr(observer);
        match registrations
            .iter()
            .position(|r| std::ptr::addr_eq(r.observer.as_ptr(), target))
        {
            Some(i) => {
                let removed = registrations.remove(i);
                removed.live.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Drop every registration. In-progress dispatches stop delivering.
    pub fn clear(&self) {
        let mut registrations = self.registrations.lock();
        for r in registrations.drain(..) {
            r.live.store(false, Ordering::Release);
        }
    }

    /// Number of observers still alive.
    pub fn len(&self) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.observer.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer registered at this moment.
    pub fn notify(&self, event: E) {
        let snapshot: Vec<Registration<E>> = {
            let mut registrations = self.registrations.lock();
            registrations.retain(|r| r.observer.strong_count() > 0);
            registrations.clone()
        };
        if snapshot.is_empty() {
            return;
        }

        match &self.dispatcher {
            Some(dispatcher) => {
                let posted = dispatcher.post(move || deliver(&snapshot, &event));
                if !posted {
                    error!("Event dropped: dispatcher is not running");
                }
            }
            None => deliver(&snapshot, &event),
        }
    }
}

fn deliver<E>(snapshot: &[Registration<E>], event: &E) {
    for registration in snapshot.iter().rev() {
        if !registration.live.load(Ordering::Acquire) {
            continue;
        }
        let Some(observer) = registration.observer.upgrade() else {
            continue;
        };
        if catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
            error!("Observer panicked during dispatch; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;

    struct Counter {
        hits: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl Observer<u32> for Counter {
        fn on_event(&self, _event: &u32) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivers_once_per_observer() {
        let bus = EventBus::new();
        let a = Counter::new();
        let b = Counter::new();
        assert!(bus.register(&a));
        assert!(bus.register(&b));
        assert!(!bus.register(&a));

        bus.notify(1);
        assert_eq!(a.hits(), 1);
        assert_eq!(b.hits(), 1);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn reverse_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let order = order.clone();
            Arc::new(move |_: &u32| order.lock().push("first"))
        };
        let second = {
            let order = order.clone();
            Arc::new(move |_: &u32| order.lock().push("second"))
        };
        bus.register(&first);
        bus.register(&second);

        bus.notify(0);
        assert_eq!(*order.lock(), vec!["second", "first"]);
    }

    #[test]
    fn unregistered_observer_receives_nothing() {
        let bus = EventBus::new();
        let a = Counter::new();
        bus.register(&a);
        assert!(bus.unregister(&a));
        assert!(!bus.unregister(&a));
        bus.notify(1);
        assert_eq!(a.hits(), 0);
    }

    #[test]
    fn dropped_observer_is_pruned() {
        let bus = EventBus::new();
        let a = Counter::new();
        bus.register(&a);
        drop(a);
        bus.notify(1);
        assert!(bus.is_empty());
    }

    struct SelfRemoving {
        bus: Arc<EventBus<u32>>,
        me: OnceLock<Weak<SelfRemoving>>,
        hits: AtomicUsize,
    }

    impl Observer<u32> for SelfRemoving {
        fn on_event(&self, _event: &u32) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = self.me.get().and_then(Weak::upgrade) {
                self.bus.unregister(&me);
            }
        }
    }

    #[test]
    fn self_unregister_during_dispatch_gets_final_event_only() {
        let bus = Arc::new(EventBus::new());
        let other = Counter::new();
        bus.register(&other);

        let observer = Arc::new(SelfRemoving {
            bus: bus.clone(),
            me: OnceLock::new(),
            hits: AtomicUsize::new(0),
        });
        let _ = observer.me.set(Arc::downgrade(&observer));
        bus.register(&observer);

        bus.notify(1);
        bus.notify(2);

        assert_eq!(observer.hits.load(Ordering::SeqCst), 1);
        assert_eq!(other.hits(), 2);
    }

    #[test]
    fn panicking_observer_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let a = Counter::new();
        let bad = Arc::new(|_: &u32| panic!("observer failure"));
        bus.register(&a);
        bus.register(&bad);

        bus.notify(1);
        assert_eq!(a.hits(), 1);
    }

    #[tokio::test]
    async fn dedicated_dispatcher_delivers_in_order() {
        let dispatcher = Dispatcher::spawn(&Handle::current());
        let bus = EventBus::with_dispatcher(dispatcher.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = Arc::new(move |e: &u32| {
            let _ = tx.send(*e);
        });
        bus.register(&observer);

        bus.notify(1);
        bus.notify(2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }
}
