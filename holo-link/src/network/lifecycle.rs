//! Channel lifecycle state machine

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;

use crate::error::LinkError;
use crate::network::observer::{ChannelId, SharedObserver};

/// Lifecycle state of a transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Idle = 0,
    Opening = 1,
    Opened = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Idle,
            1 => ChannelState::Opening,
            2 => ChannelState::Opened,
            _ => ChannelState::Closed,
        }
    }
}

/// Atomic `Idle -> Opening -> Opened -> Closed` tracker
///
/// Every transition is a compare-and-swap, so concurrent callers (a reader
/// task hitting EOF while the node closes the channel) agree on a single
/// winner. `Closed` is terminal.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Idle as u8),
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Opened
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Idle -> Opening`
    pub fn begin_open(&self) -> bool {
        self.transition(ChannelState::Idle, ChannelState::Opening)
    }

    /// `Opening -> Opened`
    pub fn mark_opened(&self) -> bool {
        self.transition(ChannelState::Opening, ChannelState::Opened)
    }

    /// `Opening -> Closed`, after a failed open
    pub fn fail_open(&self) -> bool {
        self.transition(ChannelState::Opening, ChannelState::Closed)
    }

    /// Move to `Closed` from any state
    ///
    /// Returns true only for the caller that took the channel out of
    /// `Opened`; that caller owns the close notification.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(ChannelState::Closed as u8, Ordering::AcqRel);
        ChannelState::from_u8(previous) == ChannelState::Opened
    }
}

/// Lifecycle, observer and background tasks of one channel
///
/// Every transport handle wraps one of these. Observer notifications go
/// through the lifecycle so that `on_open` and `on_close` fire at most once.
pub(crate) struct ChannelCore {
    pub(crate) id: ChannelId,
    pub(crate) lifecycle: Lifecycle,
    observer: SharedObserver,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("id", &self.id)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl ChannelCore {
    /// Create a core already in `Opening`
    pub(crate) fn opening(id: ChannelId, observer: SharedObserver) -> Self {
        let core = Self {
            id,
            lifecycle: Lifecycle::new(),
            observer,
            tasks: Mutex::new(Vec::new()),
        };
        core.lifecycle.begin_open();
        core
    }

    pub(crate) fn observer(&self) -> &SharedObserver {
        &self.observer
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a task owned by this channel
    ///
    /// The task is aborted when the channel closes, including when the close
    /// raced with the spawn.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task).abort_handle();
        let mut tasks = self.lock_tasks();
        tasks.push(handle);
        if self.lifecycle.state() == ChannelState::Closed {
            tasks.drain(..).for_each(|h| h.abort());
        }
    }

    /// `Opening -> Opened`, then notify
    pub(crate) fn opened(&self, local_addr: Option<SocketAddr>) -> bool {
        if !self.lifecycle.mark_opened() {
            return false;
        }
        self.observer.on_open(self.id, local_addr);
        true
    }

    /// `Opening -> Closed`, reporting only the error
    pub(crate) fn fail_open(&self, error: LinkError) {
        if self.lifecycle.fail_open() {
            tracing::warn!("Channel '{}' failed to open: {}", self.id, error);
            self.observer.on_error(self.id, &error);
        }
    }

    /// Close the channel, optionally because of `error`
    ///
    /// Only the caller that leaves `Opened` notifies the observer.
    pub(crate) fn shutdown(&self, error: Option<LinkError>) {
        let was_open = self.lifecycle.close();
        self.lock_tasks().drain(..).for_each(|h| h.abort());
        if was_open {
            if let Some(error) = error {
                tracing::warn!("Channel '{}' failed: {}", self.id, error);
                self.observer.on_error(self.id, &error);
            }
            tracing::debug!("Channel '{}' closed", self.id);
            self.observer.on_close(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use crate::envelope::Envelope;
    use crate::network::observer::ConnectionObserver;

    #[derive(Default)]
    struct Counting {
        opens: AtomicUsize,
        errors: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ConnectionObserver for Counting {
        fn on_open(&self, _: ChannelId, _: Option<SocketAddr>) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _: ChannelId, _: &LinkError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self, _: ChannelId) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_event(&self, _: ChannelId, _: Envelope, _: Option<SocketAddr>) {}
    }

    #[test]
    fn test_normal_progression() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ChannelState::Idle);
        assert!(lifecycle.begin_open());
        assert!(!lifecycle.begin_open());
        assert!(lifecycle.mark_opened());
        assert!(lifecycle.is_open());
        assert!(lifecycle.close());
        assert_eq!(lifecycle.state(), ChannelState::Closed);
        assert!(!lifecycle.close());
    }

    #[test]
    fn test_failed_open_never_reports_close() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_open());
        assert!(lifecycle.fail_open());
        assert!(!lifecycle.mark_opened());
        assert!(!lifecycle.close());
    }

    #[test]
    fn test_close_before_open_completes() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_open();
        assert!(!lifecycle.close());
        // the connect task finishing late cannot reopen
        assert!(!lifecycle.mark_opened());
    }

    #[test]
    fn test_concurrent_close_has_one_winner() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.begin_open();
        lifecycle.mark_opened();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                std::thread::spawn(move || lifecycle.close())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_core_fires_close_once() {
        let counting = Arc::new(Counting::default());
        let core = ChannelCore::opening(ChannelId::StreamClient, counting.clone());
        assert!(core.opened(None));
        core.shutdown(Some(LinkError::Internal("reset".into())));
        core.shutdown(None);
        core.shutdown(Some(LinkError::Internal("again".into())));
        assert_eq!(counting.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
        assert_eq!(counting.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_core_open_failure_reports_error_only() {
        let counting = Arc::new(Counting::default());
        let core = ChannelCore::opening(ChannelId::DatagramListener, counting.clone());
        core.fail_open(LinkError::InvalidAddress("nowhere".into()));
        core.shutdown(None);
        assert!(!core.opened(None));
        assert_eq!(counting.opens.load(Ordering::SeqCst), 0);
        assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
        assert_eq!(counting.closes.load(Ordering::SeqCst), 0);
    }
}
