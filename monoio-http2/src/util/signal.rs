use std::{
    cell::{Cell, UnsafeCell},
    fmt,
    task::{Context, Poll, Waker},
};

/// LocalWaker is a thread-local waker slot holding several wakers, so more
/// than one task can wait on the same signal.
pub(crate) struct LocalWaker {
    wakers: UnsafeCell<Vec<Waker>>,
}

impl LocalWaker {
    pub(crate) const fn new() -> Self {
        Self {
            wakers: UnsafeCell::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, waker: &Waker) {
        // Safety: single-threaded and never re-entered while borrowed.
        let wakers = unsafe { &mut *self.wakers.get() };
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake(&self) {
        let wakers = unsafe { std::mem::take(&mut *self.wakers.get()) };
        for waker in wakers {
            waker.wake();
        }
    }
}

/// One-shot flag that tasks can await. Used to ask drivers and pumps to stop.
pub(crate) struct Signal {
    raised: Cell<bool>,
    waker: LocalWaker,
}

impl Signal {
    pub(crate) const fn new() -> Self {
        Self {
            raised: Cell::new(false),
            waker: LocalWaker::new(),
        }
    }

    /// Returns `false` if it was raised before.
    pub(crate) fn raise(&self) -> bool {
        if self.raised.replace(true) {
            return false;
        }
        self.waker.wake();
        true
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.raised.get()
    }

    pub(crate) fn poll_raised(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.raised.get() {
            return Poll::Ready(());
        }
        self.waker.register(cx.waker());
        Poll::Pending
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.raised.get())
    }
}

#[cfg(test)]
mod tests {
    use std::{future::poll_fn, rc::Rc, time::Duration};

    use super::*;

    #[monoio::test(enable_timer = true)]
    async fn raise_wakes_all_waiters() {
        let signal = Rc::new(Signal::new());
        let a = {
            let s = signal.clone();
            monoio::spawn(async move { poll_fn(|cx| s.poll_raised(cx)).await })
        };
        let b = {
            let s = signal.clone();
            monoio::spawn(async move { poll_fn(|cx| s.poll_raised(cx)).await })
        };
        monoio::time::sleep(Duration::from_millis(1)).await;
        assert!(signal.raise());
        assert!(!signal.raise());
        a.await;
        b.await;
        assert!(signal.is_raised());
    }

    #[monoio::test]
    async fn raised_before_wait() {
        let signal = Signal::new();
        signal.raise();
        poll_fn(|cx| signal.poll_raised(cx)).await;
    }
}
