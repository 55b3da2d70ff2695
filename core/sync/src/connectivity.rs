//! Connectivity monitoring with debounced change notifications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Network reachability as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Last raw signal reported by the platform.
struct RawSignal {
    state: ConnectivityState,
    /// Bumped on every raw change; a pending publish only lands if the
    /// generation it captured is still current.
    generation: u64,
}

struct MonitorInner {
    published: watch::Sender<ConnectivityState>,
    /// One queue per `on_change` handler, fed every published transition.
    listeners: Mutex<Vec<mpsc::UnboundedSender<ConnectivityState>>>,
    raw: Mutex<RawSignal>,
    guard: Duration,
}

/// Observes reachability and publishes debounced online/offline transitions.
///
/// The platform feeds raw signals through [`report`](Self::report). A change
/// is published only once it has held for the guard interval, so a signal
/// that flaps faster than that never reaches subscribers. Clones share state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    /// Create a monitor starting in `initial` with the given debounce guard.
    pub fn new(initial: ConnectivityState, guard: Duration) -> Self {
        let (published, _) = watch::channel(initial);
        Self {
            inner: Arc::new(MonitorInner {
                published,
                listeners: Mutex::new(Vec::new()),
                raw: Mutex::new(RawSignal {
                    state: initial,
                    generation: 0,
                }),
                guard,
            }),
        }
    }

    /// Current published state.
    pub fn state(&self) -> ConnectivityState {
        *self.inner.published.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Receiver notified on every published transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.published.subscribe()
    }

    /// Feed a raw reachability signal from the platform.
    ///
    /// Never blocks: with a non-zero guard the publish happens on a spawned
    /// timer task.
    pub fn report(&self, online: bool) {
        let state = ConnectivityState::from_online(online);
        let generation = {
            let mut raw = self.inner.raw.lock().unwrap_or_else(PoisonError::into_inner);
            if raw.state == state {
                return;
            }
            raw.state = state;
            raw.generation += 1;
            raw.generation
        };
        debug!("Raw connectivity signal: {}", state);

        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(handle) if !self.inner.guard.is_zero() => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    tokio::time::sleep(inner.guard).await;
                    let raw = inner.raw.lock().unwrap_or_else(PoisonError::into_inner);
                    if raw.generation == generation {
                        publish(&inner, raw.state);
                    }
                });
            }
            _ => publish(&self.inner, state),
        }
    }

    /// Register a handler called once per published transition, in order.
    ///
    /// The handler runs on its own task, never on the reporter's stack, and
    /// sees every transition even when several are published back to back.
    /// It stays registered until the returned handle is aborted or every
    /// clone of the monitor is dropped.
    pub fn on_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                handler(state);
            }
        })
    }
}

fn publish(inner: &MonitorInner, state: ConnectivityState) {
    // Held across the watch update so listeners see transitions in publish order.
    let mut listeners = inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
    let changed = inner.published.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
    if changed {
        info!("Connectivity changed: {}", state);
        listeners.retain(|listener| listener.send(state).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recorder(
        monitor: &ConnectivityMonitor,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<ConnectivityState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = monitor.on_change(move |state| {
            let _ = tx.send(state);
        });
        (handle, rx)
    }

    #[tokio::test]
    async fn test_zero_guard_publishes_immediately() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online, Duration::ZERO);
        let (_handle, mut rx) = recorder(&monitor);

        monitor.report(false);
        assert!(!monitor.is_online());
        assert_eq!(rx.recv().await, Some(ConnectivityState::Offline));

        monitor.report(true);
        assert!(monitor.is_online());
        assert_eq!(rx.recv().await, Some(ConnectivityState::Online));
    }

    #[tokio::test]
    async fn test_repeated_reports_notify_once() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online, Duration::ZERO);
        let (_handle, mut rx) = recorder(&monitor);

        monitor.report(false);
        monitor.report(false);
        monitor.report(false);

        assert_eq!(rx.recv().await, Some(ConnectivityState::Offline));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_back_to_back_transitions_each_notify() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online, Duration::ZERO);
        let (_handle, mut rx) = recorder(&monitor);

        monitor.report(false);
        monitor.report(true);

        assert_eq!(rx.recv().await, Some(ConnectivityState::Offline));
        assert_eq!(rx.recv().await, Some(ConnectivityState::Online));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_aborted_handler_is_unregistered() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online, Duration::ZERO);
        let (handle, _rx) = recorder(&monitor);
        handle.abort();
        let _ = handle.await;

        monitor.report(false);
        assert!(monitor.inner.listeners.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guard_delays_publish() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Offline, Duration::from_millis(40));

        monitor.report(true);
        assert!(!monitor.is_online());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_flap_shorter_than_guard_is_swallowed() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online, Duration::from_millis(50));
        let (_handle, mut rx) = recorder(&monitor);

        monitor.report(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.report(true);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(monitor.is_online());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online, Duration::ZERO);
        let platform_side = monitor.clone();

        platform_side.report(false);
        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }

    #[test]
    fn test_report_without_runtime_publishes_directly() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online, Duration::from_secs(5));
        monitor.report(false);
        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }
}
