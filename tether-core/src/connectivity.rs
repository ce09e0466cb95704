//! Online/offline tracking.
//!
//! A [`ConnectivityMonitor`] holds a single [`ConnectivitySnapshot`] that is
//! updated from passive signals (an OS network event, a failed request) and
//! from active checks through a [`ConnectivityProbe`]. Listeners are notified
//! once per transition, never for repeated identical signals.

use crate::clock::SharedClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Active reachability check.
///
/// Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Return `true` if the remote service is reachable.
    async fn probe(&self, cancel: CancellationToken) -> bool;
}

/// Connectivity monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Status assumed before any signal arrives.
    pub initial_online: bool,
    /// Interval between periodic probes. Zero disables periodic probing.
    #[serde(rename = "check_interval_ms", with = "crate::config::duration_ms")]
    pub check_interval: Duration,
    /// Path or URL the HTTP probe checks.
    pub ping_url: String,
    /// Deadline for a single probe.
    #[serde(rename = "probe_timeout_ms", with = "crate::config::duration_ms")]
    pub probe_timeout: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            initial_online: true,
            check_interval: Duration::from_secs(30),
            ping_url: "/health".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time connectivity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivitySnapshot {
    /// Whether the remote service is currently believed reachable.
    pub is_online: bool,
    /// Sticky flag: set on any offline transition, cleared explicitly.
    pub was_offline: bool,
    /// When status was last checked or signalled.
    pub last_check_time: Option<DateTime<Utc>>,
}

type Listener = Arc<dyn Fn(&ConnectivitySnapshot) + Send + Sync>;

/// Tracks whether the remote service is reachable.
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    clock: SharedClock,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    state: watch::Sender<ConnectivitySnapshot>,
    on_online: RwLock<Vec<Listener>>,
    on_offline: RwLock<Vec<Listener>>,
    periodic: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("config", &self.config)
            .field("snapshot", &*self.state.borrow())
            .field("has_probe", &self.probe.is_some())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Create a monitor without an active probe.
    pub fn new(config: ConnectivityConfig, clock: SharedClock) -> Self {
        let (state, _) = watch::channel(ConnectivitySnapshot {
            is_online: config.initial_online,
            was_offline: !config.initial_online,
            last_check_time: None,
        });

        Self {
            config,
            clock,
            probe: None,
            state,
            on_online: RwLock::new(Vec::new()),
            on_offline: RwLock::new(Vec::new()),
            periodic: Mutex::new(None),
        }
    }

    /// Attach an active probe.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    /// Current status.
    pub fn snapshot(&self) -> ConnectivitySnapshot {
        *self.state.borrow()
    }

    /// Whether the remote service is believed reachable.
    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    /// Whether the remote service is believed unreachable.
    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }

    /// Whether an offline period has occurred since the flag was last cleared.
    pub fn was_offline(&self) -> bool {
        self.state.borrow().was_offline
    }

    /// Clear the sticky offline flag.
    pub fn clear_was_offline(&self) {
        self.state.send_if_modified(|snapshot| {
            let changed = snapshot.was_offline;
            snapshot.was_offline = false;
            changed
        });
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.state.subscribe()
    }

    /// Register a callback fired on each offline to online transition.
    pub fn on_online<F>(&self, listener: F)
    where
        F: Fn(&ConnectivitySnapshot) + Send + Sync + 'static,
    {
        self.on_online.write().push(Arc::new(listener));
    }

    /// Register a callback fired on each online to offline transition.
    pub fn on_offline<F>(&self, listener: F)
    where
        F: Fn(&ConnectivitySnapshot) + Send + Sync + 'static,
    {
        self.on_offline.write().push(Arc::new(listener));
    }

    /// Record a passive connectivity signal.
    ///
    /// Returns `true` if the status changed.
    pub fn set_online(&self, online: bool) -> bool {
        let now = self.clock.now();
        let mut transitioned = false;

        self.state.send_if_modified(|snapshot| {
            snapshot.last_check_time = Some(now);
            if snapshot.is_online == online {
                return false;
            }
            snapshot.is_online = online;
            if !online {
                snapshot.was_offline = true;
            }
            transitioned = true;
            true
        });

        if transitioned {
            let snapshot = self.snapshot();
            if online {
                info!("Connectivity restored");
                self.fire(&self.on_online, &snapshot);
            } else {
                warn!("Connectivity lost");
                self.fire(&self.on_offline, &snapshot);
            }
        }

        transitioned
    }

    /// Record an OS-level or request-level connectivity signal.
    pub fn handle_signal(&self, online: bool) {
        debug!(online, "Connectivity signal");
        self.set_online(online);
    }

    fn fire(&self, listeners: &RwLock<Vec<Listener>>, snapshot: &ConnectivitySnapshot) {
        // Clone out so callbacks run without the lock held.
        let listeners: Vec<Listener> = listeners.read().clone();
        for listener in listeners {
            listener(snapshot);
        }
    }

    /// Actively check reachability and update the status.
    ///
    /// Without a probe the current status is returned unchanged. A probe that
    /// exceeds the configured timeout is cancelled and counts as offline.
    pub async fn recheck_connectivity(&self) -> bool {
        let Some(probe) = self.probe.clone() else {
            return self.is_online();
        };

        let token = CancellationToken::new();
        let timeout = self.config.probe_timeout;

        let online = tokio::select! {
            online = probe.probe(token.child_token()) => online,
            _ = tokio::time::sleep(timeout) => {
                debug!(?timeout, "Connectivity probe timed out");
                token.cancel();
                false
            }
        };

        self.set_online(online);
        online
    }

    /// Start periodic probing, if configured.
    ///
    /// Does nothing when there is no probe, the interval is zero, or probing
    /// is already running. Requires a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if self.probe.is_none() || self.config.check_interval.is_zero() {
            return;
        }

        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *periodic = Some(token.clone());
        drop(periodic);

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.check_interval;
        info!(?interval, "Starting periodic connectivity checks");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = monitor.recheck_connectivity() => {}
                }
            }
            debug!("Periodic connectivity checks stopped");
        });
    }

    /// Stop periodic probing.
    pub fn stop(&self) {
        if let Some(token) = self.periodic.lock().take() {
            token.cancel();
        }
    }

    /// Whether periodic probing is running.
    pub fn is_running(&self) -> bool {
        self.periodic.lock().is_some()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
