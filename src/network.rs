use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub online: bool,
    pub network_type: NetworkType,
    pub speed_mbps: f64,
    pub rtt_ms: u32,
}

/// Reports connectivity + link quality and publishes change notifications.
///
/// No RTT/quality probe runs inside this crate; callers drive state with
/// `set_network`, which is what a host-side probe loop would call after
/// sampling.
pub struct NetworkMonitor {
    current: StdMutex<NetworkInfo>,
    tx: watch::Sender<NetworkInfo>,
    online_flag: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkInfo) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            online_flag: AtomicBool::new(initial.online),
            current: StdMutex::new(initial),
            tx,
        }
    }

    pub fn current(&self) -> NetworkInfo {
        *self.current.lock().unwrap()
    }

    pub fn is_online(&self) -> bool {
        self.online_flag.load(Ordering::SeqCst)
    }

    /// Updates the observed network state and notifies subscribers. Idempotent
    /// no-op if unchanged.
    pub fn set_network(&self, info: NetworkInfo) {
        let changed = {
            let mut current = self.current.lock().unwrap();
            if *current == info {
                false
            } else {
                *current = info;
                true
            }
        };
        if changed {
            self.online_flag.store(info.online, Ordering::SeqCst);
            let _ = self.tx.send(info);
        }
    }

    /// Subscribes to change notifications.
    pub fn on_change(&self) -> watch::Receiver<NetworkInfo> {
        self.tx.subscribe()
    }

    /// Resolves once `online` transitions to (or already is) `true`.
    pub async fn wait_until_online(&self) {
        if self.is_online() {
            return;
        }
        let mut rx = self.on_change();
        loop {
            if rx.borrow().online {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_until_online_resolves_on_transition() {
        let monitor = std::sync::Arc::new(NetworkMonitor::new(NetworkInfo {
            online: false,
            ..Default::default()
        }));

        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor.wait_until_online().await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        monitor.set_network(NetworkInfo {
            online: true,
            ..Default::default()
        });

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_until_online should resolve")
            .unwrap();
    }

    #[test]
    fn set_network_is_a_noop_when_unchanged() {
        let monitor = NetworkMonitor::new(NetworkInfo::default());
        let mut rx = monitor.on_change();
        monitor.set_network(NetworkInfo::default());
        assert!(rx.has_changed().is_err() || !rx.has_changed().unwrap());
    }
}
