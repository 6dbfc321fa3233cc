//! Punch session
//!
//! A `PunchSession` owns everything one punching attempt needs: the
//! cancellation flag, the listener and puncher tasks, and the established
//! link. It is built per attempt and torn down with `close()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use super::error::NetworkError;
use super::state::{
    sleep_unless_cancelled, CancelFlag, PunchMode, PunchState, SessionEvent, SessionShared,
    EVENT_CHANNEL_CAPACITY,
};
use super::tcp_punch::{self, WriterSlot};
use super::transport::{any_addr, bind_tcp_listener, bind_udp};
use super::udp_punch;

/// Punch timing configuration
///
/// The port spread and the aggressive interval are heuristics, not protocol
/// constants; tune them per network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PunchConfig {
    /// Spray the ports around the peer's declared port
    pub aggressive: bool,
    /// UDP discovery window in the simple variant
    pub discovery_window_ms: u64,
    /// UDP discovery window in the aggressive variant
    pub aggressive_window_ms: u64,
    /// Time between punch rounds in the simple variant
    pub punch_interval_ms: u64,
    /// Time between punch rounds in the aggressive variant
    pub aggressive_interval_ms: u64,
    /// Ports on each side of the peer port sprayed when aggressive
    pub port_spread: u16,
    /// Upper bound on any blocking wait; tasks notice cancellation this fast
    pub poll_interval_ms: u64,
    /// Timeout of one TCP connect attempt
    pub connect_timeout_ms: u64,
    /// Pause between failed TCP connect attempts
    pub retry_delay_ms: u64,
    /// How long the controller waits for the TCP race
    pub race_timeout_ms: u64,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            aggressive: false,
            discovery_window_ms: 10_000,
            aggressive_window_ms: 20_000,
            punch_interval_ms: 1_000,
            aggressive_interval_ms: 500,
            port_spread: 10,
            poll_interval_ms: 1_000,
            connect_timeout_ms: 1_000,
            retry_delay_ms: 100,
            race_timeout_ms: 60_000,
        }
    }
}

impl PunchConfig {
    pub fn discovery_window(&self) -> Duration {
        if self.aggressive {
            Duration::from_millis(self.aggressive_window_ms)
        } else {
            Duration::from_millis(self.discovery_window_ms)
        }
    }

    pub fn punch_interval(&self) -> Duration {
        if self.aggressive {
            Duration::from_millis(self.aggressive_interval_ms)
        } else {
            Duration::from_millis(self.punch_interval_ms)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }
}

enum Link {
    Udp {
        socket: Arc<UdpSocket>,
        /// Stops the puncher at the end of the discovery window
        punch_stop: CancelFlag,
    },
    Tcp {
        writer: WriterSlot,
        /// Listener bound up front when the port was picked by the OS
        listener: Option<TcpListener>,
    },
    Released,
}

/// One hole punching attempt towards a peer
pub struct PunchSession {
    local_port: u16,
    peer_addr: SocketAddr,
    mode: PunchMode,
    config: PunchConfig,
    shared: Arc<SessionShared>,
    link: Link,
    listener: Option<JoinHandle<()>>,
    puncher: Option<JoinHandle<()>>,
}

impl PunchSession {
    /// Create a session and the receiver for its events
    ///
    /// UDP binds its socket here, so a busy port fails the whole session.
    /// TCP binds inside its tasks, where a failure only degrades the race.
    /// A TCP session on port 0 binds its listener here instead, so the
    /// connector can reuse the port the OS picked.
    pub fn new(
        mode: PunchMode,
        local_port: u16,
        peer_addr: SocketAddr,
        config: PunchConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), NetworkError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(SessionShared::new(tx));

        let (local_port, link) = match mode {
            PunchMode::Udp => {
                let socket = bind_udp(any_addr(local_port))?;
                let port = socket.local_addr()?.port();
                info!("UDP socket bound to 0.0.0.0:{}", port);
                (
                    port,
                    Link::Udp {
                        socket: Arc::new(socket),
                        punch_stop: CancelFlag::new(),
                    },
                )
            }
            PunchMode::Tcp => {
                let (port, listener) = if local_port == 0 {
                    let listener = bind_tcp_listener(any_addr(0))?;
                    (listener.local_addr()?.port(), Some(listener))
                } else {
                    (local_port, None)
                };
                (
                    port,
                    Link::Tcp {
                        writer: Arc::new(Mutex::new(None)),
                        listener,
                    },
                )
            }
        };

        let session = Self {
            local_port,
            peer_addr,
            mode,
            config,
            shared,
            link,
            listener: None,
            puncher: None,
        };
        Ok((session, rx))
    }

    pub fn udp(
        local_port: u16,
        peer_addr: SocketAddr,
        config: PunchConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), NetworkError> {
        Self::new(PunchMode::Udp, local_port, peer_addr, config)
    }

    pub fn tcp(
        local_port: u16,
        peer_addr: SocketAddr,
        config: PunchConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), NetworkError> {
        Self::new(PunchMode::Tcp, local_port, peer_addr, config)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn mode(&self) -> PunchMode {
        self.mode
    }

    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    pub fn state(&self) -> PunchState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Handle to the session's cancellation flag
    pub fn cancel_flag(&self) -> CancelFlag {
        self.shared.cancel.clone()
    }

    /// Register a callback for state transitions
    pub fn set_state_callback<F>(&self, callback: F)
    where
        F: Fn(PunchState) + Send + Sync + 'static,
    {
        self.shared.set_state_callback(Box::new(callback));
    }

    /// Spawn the listener and puncher; no-op unless the session is idle
    pub fn start(&mut self) {
        if self.state() != PunchState::Idle {
            return;
        }

        match &mut self.link {
            Link::Udp { socket, punch_stop } => {
                self.shared.set_state(PunchState::Punching);
                self.listener = Some(udp_punch::spawn_listener(
                    socket.clone(),
                    self.shared.clone(),
                    self.config.clone(),
                ));
                self.puncher = Some(udp_punch::spawn_puncher(
                    socket.clone(),
                    self.peer_addr,
                    self.shared.clone(),
                    self.config.clone(),
                    punch_stop.clone(),
                ));
            }
            Link::Tcp { writer, listener } => {
                self.shared.set_state(PunchState::Racing);
                self.listener = Some(tcp_punch::spawn_listener(
                    self.local_port,
                    listener.take(),
                    self.shared.clone(),
                    writer.clone(),
                    self.config.clone(),
                ));
                self.puncher = Some(tcp_punch::spawn_connector(
                    self.local_port,
                    self.peer_addr,
                    self.shared.clone(),
                    writer.clone(),
                    self.config.clone(),
                ));
            }
            Link::Released => {}
        }
    }

    /// Punch for the whole discovery window, then move to relaying
    ///
    /// Returns whether any application message arrived meanwhile.
    pub async fn run_discovery_window(&mut self) -> bool {
        sleep_unless_cancelled(
            &[&self.shared.cancel],
            self.config.discovery_window(),
            self.config.poll_interval(),
        )
        .await;
        self.finish_punching().await;
        self.is_connected()
    }

    /// Stop UDP punch traffic and start relaying; the listener keeps running
    pub async fn finish_punching(&mut self) {
        let Link::Udp { punch_stop, .. } = &self.link else {
            return;
        };
        punch_stop.cancel();

        if let Some(handle) = self.puncher.take() {
            if let Err(e) = handle.await {
                warn!("Puncher task ended abnormally: {}", e);
            }
        }

        if !self.shared.cancel.is_cancelled() && self.state() == PunchState::Punching {
            self.shared.set_state(PunchState::Relaying);
        }
    }

    /// Wait for the TCP race to produce a stream
    pub async fn wait_connected(&self, race_timeout: Duration) -> Result<(), NetworkError> {
        let mut state = self.shared.subscribe();
        let deadline = tokio::time::Instant::now() + race_timeout;

        loop {
            match *state.borrow_and_update() {
                PunchState::Connected => return Ok(()),
                PunchState::Closed => return Err(NetworkError::NotConnected),
                _ => {}
            }
            if self.shared.cancel.is_cancelled() {
                return Err(NetworkError::Cancelled);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(NetworkError::Timeout);
            }
            let wait = (deadline - now).min(self.config.poll_interval());
            let _ = timeout(wait, state.changed()).await;
        }
    }

    /// Send an application message over the established transport
    ///
    /// Logs and returns `NotConnected` while the path is not established.
    pub async fn send_application_message(&self, payload: &[u8]) -> Result<(), NetworkError> {
        if !self.state().can_transmit() {
            warn!("Cannot send message: not connected");
            return Err(NetworkError::NotConnected);
        }

        match &self.link {
            Link::Udp { socket, .. } => {
                socket.send_to(payload, self.peer_addr).await?;
            }
            Link::Tcp { writer, .. } => {
                let mut guard = writer.lock().await;
                let Some(write_half) = guard.as_mut() else {
                    warn!("Cannot send message: not connected");
                    return Err(NetworkError::NotConnected);
                };
                write_half.write_all(payload).await?;
            }
            Link::Released => {
                warn!("Cannot send message: not connected");
                return Err(NetworkError::NotConnected);
            }
        }

        Ok(())
    }

    /// Cancel every task, wait for them to drain and release the sockets
    ///
    /// Takes at most one poll interval once in-flight calls return.
    pub async fn close(&mut self) {
        self.shared.cancel.cancel();

        match &self.link {
            Link::Udp { punch_stop, .. } => punch_stop.cancel(),
            Link::Tcp { writer, .. } => {
                if let Some(mut write_half) = writer.lock().await.take() {
                    let _ = write_half.shutdown().await;
                }
            }
            Link::Released => {}
        }

        for handle in [self.listener.take(), self.puncher.take()].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!("Punch task ended abnormally: {}", e);
            }
        }

        self.link = Link::Released;
        self.shared.mark_disconnected();
        self.shared.set_state(PunchState::Closed);
    }

    /// Whether both tasks have exited
    pub fn tasks_finished(&self) -> bool {
        [&self.listener, &self.puncher]
            .iter()
            .all(|h| h.as_ref().map_or(true, |h| h.is_finished()))
    }
}

impl Drop for PunchSession {
    fn drop(&mut self) {
        // Tasks drain on their own within one poll interval
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> PunchConfig {
        PunchConfig {
            discovery_window_ms: 300,
            punch_interval_ms: 50,
            poll_interval_ms: 50,
            ..PunchConfig::default()
        }
    }

    #[test]
    fn test_config_windows() {
        let mut config = PunchConfig::default();
        assert_eq!(config.discovery_window(), Duration::from_secs(10));
        assert_eq!(config.punch_interval(), Duration::from_secs(1));

        config.aggressive = true;
        assert_eq!(config.discovery_window(), Duration::from_secs(20));
        assert_eq!(config.punch_interval(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_udp_session_binds_ephemeral_port() {
        let (session, _events) =
            PunchSession::udp(0, "127.0.0.1:9".parse().unwrap(), fast_config()).unwrap();
        assert!(session.local_port() > 0);
        assert_eq!(session.state(), PunchState::Idle);
        assert_eq!(session.mode(), PunchMode::Udp);
    }

    #[tokio::test]
    async fn test_send_before_relaying_fails() {
        let (mut session, _events) =
            PunchSession::udp(0, "127.0.0.1:9".parse().unwrap(), fast_config()).unwrap();
        session.start();
        assert!(matches!(
            session.send_application_message(b"hi").await,
            Err(NetworkError::NotConnected)
        ));
        session.close().await;
        assert_eq!(session.state(), PunchState::Closed);
    }

    #[tokio::test]
    async fn test_tcp_session_on_port_zero_gets_real_port() {
        let (mut session, _events) =
            PunchSession::tcp(0, "127.0.0.1:9".parse().unwrap(), fast_config()).unwrap();
        let port = session.local_port();
        assert_ne!(port, 0);

        // The listener already holds the port
        assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_err());

        session.start();
        assert_eq!(session.state(), PunchState::Racing);
        session.close().await;
        assert!(session.tasks_finished());
    }

    #[tokio::test]
    async fn test_tcp_race_times_out_without_peer() {
        let config = PunchConfig {
            poll_interval_ms: 50,
            connect_timeout_ms: 100,
            ..PunchConfig::default()
        };
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        // Nobody listens on the discard port
        let (mut session, _events) =
            PunchSession::tcp(port, "127.0.0.1:9".parse().unwrap(), config).unwrap();
        session.start();
        assert_eq!(session.state(), PunchState::Racing);

        let result = session.wait_connected(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(NetworkError::Timeout)));
        session.close().await;
        assert!(session.tasks_finished());
    }
}
