//! Connection liveness
//!
//! The client stamps one heartbeat per interval with the current millisecond
//! clock; the server echoes the stamp back, and the difference on arrival is
//! the round trip. A peer that stays silent past the dead threshold is torn
//! down directly; death is not an event the state machine negotiates over.

use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::ClientConn;

/// Milliseconds since the Unix epoch, the clock heartbeats are stamped with.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct KeeperInner {
    running: bool,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

/// Heartbeat emitter and dead-peer detector for a client connection.
pub struct Keeper {
    interval: Duration,
    threshold: Duration,
    inner: Mutex<KeeperInner>,
    last_heard: Mutex<Instant>,
    /// Smoothed round-trip estimate (EWMA, gain 1/8)
    rtt: Mutex<Option<Duration>>,
}

impl Keeper {
    /// Create a stopped keeper.
    pub fn new(interval: Duration, threshold: Duration) -> Self {
        Self {
            interval,
            threshold,
            inner: Mutex::new(KeeperInner {
                running: false,
                stop_tx: None,
                handle: None,
            }),
            last_heard: Mutex::new(Instant::now()),
            rtt: Mutex::new(None),
        }
    }

    /// Start the heartbeat ticker. No-op while already running.
    pub fn start(&self, conn: Weak<ClientConn>) {
        let mut inner = self.inner.lock().expect("keeper lock poisoned");
        if inner.running {
            return;
        }

        *self.last_heard.lock().expect("keeper lock poisoned") = Instant::now();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.interval;
        let threshold = self.threshold;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cc) = conn.upgrade() else { break };
                        cc.write(&now_millis().to_be_bytes(), true).await;

                        let silent = cc.keeper().silence();
                        if silent > threshold {
                            warn!("peer silent for {:?}, declaring dead", silent);
                            cc.teardown();
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        debug!("keeper stopped");
                        break;
                    }
                }
            }
        });

        inner.running = true;
        inner.stop_tx = Some(stop_tx);
        inner.handle = Some(handle);
    }

    /// A heartbeat echo arrived; `content` is the stamp we sent.
    pub fn rcv(&self, content: u64) {
        let rtt = Duration::from_millis(now_millis().saturating_sub(content));
        let mut smoothed = self.rtt.lock().expect("keeper lock poisoned");
        *smoothed = Some(match *smoothed {
            None => rtt,
            Some(prev) => (prev * 7 + rtt) / 8,
        });
        *self.last_heard.lock().expect("keeper lock poisoned") = Instant::now();
        trace!("heartbeat echo, rtt {:?}", rtt);
    }

    /// Smoothed round-trip estimate, if any echo has arrived.
    pub fn latency(&self) -> Option<Duration> {
        *self.rtt.lock().expect("keeper lock poisoned")
    }

    /// Time since the peer was last heard from.
    pub fn silence(&self) -> Duration {
        self.last_heard
            .lock()
            .expect("keeper lock poisoned")
            .elapsed()
    }

    /// Whether the ticker is running.
    pub fn is_running(&self) -> bool {
        self.inner.lock().expect("keeper lock poisoned").running
    }

    /// Signal the ticker to exit. Idempotent; no-op while stopped.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("keeper lock poisoned");
        if !inner.running {
            return;
        }
        inner.running = false;
        if let Some(tx) = inner.stop_tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Wait until the ticker task has exited. Returns immediately if the
    /// keeper never ran.
    pub async fn wait_stop(&self) {
        let handle = self
            .inner
            .lock()
            .expect("keeper lock poisoned")
            .handle
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rcv_updates_latency() {
        let keeper = Keeper::new(Duration::from_secs(1), Duration::from_secs(15));
        assert!(keeper.latency().is_none());

        keeper.rcv(now_millis().saturating_sub(40));
        let first = keeper.latency().unwrap();
        assert!(first >= Duration::from_millis(40));
        assert!(first < Duration::from_millis(200));

        // A fast echo pulls the smoothed estimate down by roughly 1/8.
        keeper.rcv(now_millis());
        let second = keeper.latency().unwrap();
        assert!(second < first);
    }

    #[test]
    fn test_rcv_resets_silence() {
        let keeper = Keeper::new(Duration::from_secs(1), Duration::from_secs(15));
        keeper.rcv(now_millis());
        assert!(keeper.silence() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let keeper = Keeper::new(Duration::from_secs(1), Duration::from_secs(15));
        assert!(!keeper.is_running());
        keeper.stop();
        // Never started: nothing to join.
        keeper.wait_stop().await;
    }
}
