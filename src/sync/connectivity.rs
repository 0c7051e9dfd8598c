//! Network reachability tracking.
//!
//! [`ConnectivityMonitor`] holds the current [`NetworkState`] and reports
//! transitions. [`NetworkEvents`] produces states by probing the backend on
//! a timer. The monitor also owns the guard that keeps replay passes from
//! overlapping when reconnect events arrive in quick succession.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use url::Url;

/// Reachability as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
  pub is_connected: bool,
  pub is_internet_reachable: bool,
  pub connection_type: String,
}

impl NetworkState {
  #[cfg(test)]
  pub fn online() -> Self {
    Self {
      is_connected: true,
      is_internet_reachable: true,
      connection_type: "unknown".to_string(),
    }
  }

  pub fn offline() -> Self {
    Self {
      is_connected: false,
      is_internet_reachable: false,
      connection_type: "none".to_string(),
    }
  }

  /// Online only when connected and the internet is reachable.
  pub fn is_online(&self) -> bool {
    self.is_connected && self.is_internet_reachable
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  CameOnline,
  WentOffline,
  Unchanged,
}

/// Current reachability plus change notifications.
pub struct ConnectivityMonitor {
  tx: watch::Sender<NetworkState>,
  replay_in_flight: Arc<AtomicBool>,
}

impl ConnectivityMonitor {
  pub fn new(initial: NetworkState) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self {
      tx,
      replay_in_flight: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn is_online(&self) -> bool {
    self.tx.borrow().is_online()
  }

  /// Record a new state and report whether online-ness changed.
  pub fn update(&self, state: NetworkState) -> Transition {
    let was_online = self.is_online();
    let now_online = state.is_online();
    let connection = state.connection_type.clone();
    self.tx.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });

    match (was_online, now_online) {
      (false, true) => {
        info!(%connection, "network is back online");
        Transition::CameOnline
      }
      (true, false) => {
        info!("network went offline");
        Transition::WentOffline
      }
      _ => Transition::Unchanged,
    }
  }

  /// Claim the replay slot. `None` while another pass holds it.
  pub fn try_begin_replay(&self) -> Option<ReplayGuard> {
    self
      .replay_in_flight
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| ReplayGuard {
        flag: Arc::clone(&self.replay_in_flight),
      })
  }
}

/// Releases the replay slot when dropped.
pub struct ReplayGuard {
  flag: Arc<AtomicBool>,
}

impl Drop for ReplayGuard {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}

/// Probe the backend: a TCP connect decides `is_connected`, any HTTP answer
/// to a HEAD request decides `is_internet_reachable`.
pub async fn probe(client: &reqwest::Client, url: &Url, timeout: Duration) -> NetworkState {
  let Some(host) = url.host_str() else {
    return NetworkState::offline();
  };
  let port = url.port_or_known_default().unwrap_or(443);

  let connected = matches!(
    tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
    Ok(Ok(_))
  );
  if !connected {
    return NetworkState::offline();
  }

  let reachable = client
    .head(url.clone())
    .timeout(timeout)
    .send()
    .await
    .is_ok();

  NetworkState {
    is_connected: true,
    is_internet_reachable: reachable,
    connection_type: "unknown".to_string(),
  }
}

/// Periodic reachability probe producing [`NetworkState`] events.
pub struct NetworkEvents {
  rx: mpsc::UnboundedReceiver<NetworkState>,
}

impl NetworkEvents {
  /// Spawn a probe of `url` every `interval`.
  pub fn new(url: Url, interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = reqwest::Client::new();
    let timeout = interval.min(Duration::from_secs(5));

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let state = probe(&client, &url, timeout).await;
        debug!(?state, "network probe");
        if tx.send(state).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next probed state
  pub async fn next(&mut self) -> Option<NetworkState> {
    self.rx.recv().await
  }
}
