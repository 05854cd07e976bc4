use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

/// An event delivered through an [`Emitter`]. Listeners subscribe to a kind,
/// and receive every event whose `kind()` matches.
pub trait Event {
    type Kind: Copy + Eq + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

type Callback<E> = Rc<RefCell<dyn FnMut(&E)>>;

struct Entry<E: Event> {
    id: u64,
    kind: E::Kind,
    once: bool,
    attached: Rc<Cell<bool>>,
    callback: Callback<E>,
}

struct Registry<E: Event> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<Entry<E>>>,
}

/// Removal half of a registry, type-erased so a token does not carry the
/// event type of the emitter it came from.
trait Detach {
    fn remove(&self, id: u64);
}

impl<E: Event> Detach for Registry<E> {
    fn remove(&self, id: u64) {
        self.listeners.borrow_mut().retain(|entry| entry.id != id);
    }
}

/// Handle to one registered listener. Its only capability is detaching the
/// listener; dropping the token leaves the listener attached.
#[must_use = "dropping a token leaves the listener attached forever"]
pub struct ListenerToken {
    id: u64,
    attached: Rc<Cell<bool>>,
    registry: Weak<dyn Detach>,
}

impl ListenerToken {
    /// Detaches the listener. Returns `false` if it was already detached or,
    /// for a one-shot listener, already fired.
    pub fn detach(self) -> bool {
        if !self.attached.replace(false) {
            return false;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        true
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }
}

impl fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerToken")
            .field("id", &self.id)
            .field("attached", &self.attached.get())
            .finish()
    }
}

/// Single-threaded event emitter.
///
/// Listeners may attach, detach or emit from inside a callback: dispatch works
/// on a snapshot taken before any callback runs and holds no borrow while
/// calling out. A listener detached by an earlier listener of the same
/// dispatch is skipped.
pub struct Emitter<E: Event> {
    registry: Rc<Registry<E>>,
}

impl<E: Event + 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(Registry {
                next_id: Cell::new(0),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Attaches a listener called for every event of `kind`.
    pub fn on<F>(&self, kind: E::Kind, f: F) -> ListenerToken
    where
        F: FnMut(&E) + 'static,
    {
        self.attach(kind, false, Rc::new(RefCell::new(f)))
    }

    /// Attaches a listener called for the next event of `kind` only. It is
    /// detached before it runs.
    pub fn once<F>(&self, kind: E::Kind, f: F) -> ListenerToken
    where
        F: FnOnce(&E) + 'static,
    {
        let mut f = Some(f);
        let callback = move |event: &E| {
            if let Some(f) = f.take() {
                f(event);
            }
        };
        self.attach(kind, true, Rc::new(RefCell::new(callback)))
    }

    fn attach(&self, kind: E::Kind, once: bool, callback: Callback<E>) -> ListenerToken {
        let id = self.registry.next_id.get();
        self.registry.next_id.set(id + 1);
        let attached = Rc::new(Cell::new(true));
        self.registry.listeners.borrow_mut().push(Entry {
            id,
            kind,
            once,
            attached: attached.clone(),
            callback,
        });
        let registry: Rc<dyn Detach> = self.registry.clone();
        ListenerToken {
            id,
            attached,
            registry: Rc::downgrade(&registry),
        }
    }

    /// Delivers `event` to the listeners of its kind and returns how many ran.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(Rc<Cell<bool>>, bool, Callback<E>)> = {
            let mut listeners = self.registry.listeners.borrow_mut();
            let snapshot = listeners
                .iter()
                .filter(|entry| entry.kind == kind)
                .map(|entry| (entry.attached.clone(), entry.once, entry.callback.clone()))
                .collect();
            listeners.retain(|entry| !(entry.once && entry.kind == kind));
            snapshot
        };

        let mut delivered = 0;
        for (attached, once, callback) in snapshot {
            if !attached.get() {
                continue;
            }
            if once {
                attached.set(false);
            }
            match callback.try_borrow_mut() {
                Ok(mut callback) => {
                    (*callback)(event);
                    delivered += 1;
                }
                Err(_) => {
                    // The listener is emitting into itself.
                    #[cfg(feature = "logging")]
                    tracing::warn!("skip re-entrant listener for {:?}", kind);
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.registry
            .listeners
            .borrow()
            .iter()
            .filter(|entry| entry.kind == kind && entry.attached.get())
            .count()
    }

    /// Detaches every listener.
    pub fn clear(&self) {
        let listeners = std::mem::take(&mut *self.registry.listeners.borrow_mut());
        for entry in listeners {
            entry.attached.set(false);
        }
    }
}

impl<E: Event + 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Emitter")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Ping {
        A(u32),
        B,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum PingKind {
        A,
        B,
    }

    impl Event for Ping {
        type Kind = PingKind;

        fn kind(&self) -> PingKind {
            match self {
                Ping::A(_) => PingKind::A,
                Ping::B => PingKind::B,
            }
        }
    }

    #[test]
    fn on_fires_every_time() {
        let emitter = Emitter::<Ping>::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let token = emitter.on(PingKind::A, move |e| {
            if let Ping::A(n) = e {
                s.borrow_mut().push(*n)
            }
        });
        assert_eq!(emitter.emit(&Ping::A(1)), 1);
        assert_eq!(emitter.emit(&Ping::B), 0);
        assert_eq!(emitter.emit(&Ping::A(2)), 1);
        assert_eq!(*seen.borrow(), vec![1, 2]);

        assert!(token.detach());
        assert_eq!(emitter.emit(&Ping::A(3)), 0);
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn once_fires_once() {
        let emitter = Emitter::<Ping>::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let token = emitter.once(PingKind::B, move |_| c.set(c.get() + 1));
        assert_eq!(emitter.listener_count(PingKind::B), 1);
        emitter.emit(&Ping::B);
        emitter.emit(&Ping::B);
        assert_eq!(count.get(), 1);
        assert_eq!(emitter.listener_count(PingKind::B), 0);
        // Already fired.
        assert!(!token.detach());
    }

    #[test]
    fn listener_detached_mid_dispatch_is_skipped() {
        let emitter = Emitter::<Ping>::new();
        let fired = Rc::new(Cell::new(false));
        let victim_slot: Rc<RefCell<Option<ListenerToken>>> = Rc::new(RefCell::new(None));

        let slot = victim_slot.clone();
        let _first = emitter.on(PingKind::B, move |_| {
            if let Some(token) = slot.borrow_mut().take() {
                token.detach();
            }
        });
        let f = fired.clone();
        let victim = emitter.on(PingKind::B, move |_| f.set(true));
        *victim_slot.borrow_mut() = Some(victim);

        assert_eq!(emitter.emit(&Ping::B), 1);
        assert!(!fired.get());
    }

    #[test]
    fn listener_may_attach_during_dispatch() {
        let emitter = Rc::new(Emitter::<Ping>::new());
        let count = Rc::new(Cell::new(0));
        let e = emitter.clone();
        let c = count.clone();
        let _token = emitter.once(PingKind::B, move |_| {
            let c = c.clone();
            let _inner = e.on(PingKind::B, move |_| c.set(c.get() + 1));
        });
        // The listener added during dispatch only sees later events.
        emitter.emit(&Ping::B);
        assert_eq!(count.get(), 0);
        emitter.emit(&Ping::B);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn reentrant_emit_is_skipped_for_running_listener() {
        let emitter = Rc::new(Emitter::<Ping>::new());
        let depth = Rc::new(Cell::new(0));
        let e = emitter.clone();
        let d = depth.clone();
        let _token = emitter.on(PingKind::A, move |_| {
            d.set(d.get() + 1);
            e.emit(&Ping::A(0));
        });
        emitter.emit(&Ping::A(0));
        assert_eq!(depth.get(), 1);
    }

    #[test]
    fn detach_after_emitter_dropped() {
        let emitter = Emitter::<Ping>::new();
        let token = emitter.on(PingKind::A, |_| {});
        drop(emitter);
        assert!(token.detach());
    }

    #[test]
    fn clear_detaches_everything() {
        let emitter = Emitter::<Ping>::new();
        let token = emitter.on(PingKind::A, |_| {});
        emitter.clear();
        assert!(!token.is_attached());
        assert_eq!(emitter.emit(&Ping::A(1)), 0);
    }
}
