//! Shared session state
//!
//! Everything the listener and puncher tasks need to agree on: the
//! cancellation flag, the `connected` bit, the state machine and the event
//! stream consumed by the controller.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Capacity of the session event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cooperative cancellation flag shared by every task of a session
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep for `duration`, waking every `poll` to check the flags
///
/// Returns `true` if any flag was raised before the time elapsed.
pub async fn sleep_unless_cancelled(flags: &[&CancelFlag], duration: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    let poll = poll.max(Duration::from_millis(1));

    loop {
        if flags.iter().any(|f| f.is_cancelled()) {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep((deadline - now).min(poll)).await;
    }
}

/// Transport used by a punch session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchMode {
    Udp,
    Tcp,
}

impl fmt::Display for PunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

/// Punch session state
///
/// ```text
/// UDP: Idle --> Punching --> Relaying --> Closed
/// TCP: Idle --> Racing   --> Connected --> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PunchState {
    #[default]
    Idle,
    /// UDP punch traffic is being sent
    Punching,
    /// UDP discovery window is over, application traffic flows
    Relaying,
    /// TCP listener and connector are racing
    Racing,
    /// TCP stream established
    Connected,
    Closed,
}

impl PunchState {
    /// Application messages can be sent in this state
    pub fn can_transmit(&self) -> bool {
        matches!(self, Self::Relaying | Self::Connected)
    }

    /// The session has stopped punching, one way or another
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Relaying | Self::Connected | Self::Closed)
    }
}

impl fmt::Display for PunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Punching => "punching",
            Self::Relaying => "relaying",
            Self::Racing => "racing",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events surfaced to whoever drives the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Application payload from the peer (control markers never show up here)
    Message { from: SocketAddr, payload: Vec<u8> },
    StateChanged(PunchState),
    /// A listener or puncher task stopped on a non-transient error
    TaskFailed { task: &'static str, reason: String },
}

/// Callback invoked on every state transition
pub type StateCallback = Box<dyn Fn(PunchState) + Send + Sync + 'static>;

/// State shared between the session and its tasks
pub(crate) struct SessionShared {
    pub(crate) cancel: CancelFlag,
    connected: AtomicBool,
    state: watch::Sender<PunchState>,
    events: mpsc::Sender<SessionEvent>,
    state_callback: RwLock<Option<Arc<StateCallback>>>,
}

impl SessionShared {
    pub(crate) fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        let (state, _) = watch::channel(PunchState::Idle);
        Self {
            cancel: CancelFlag::new(),
            connected: AtomicBool::new(false),
            state,
            events,
            state_callback: RwLock::new(None),
        }
    }

    pub(crate) fn state(&self) -> PunchState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PunchState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state_callback(&self, callback: StateCallback) {
        *self.state_callback.write() = Some(Arc::new(callback));
    }

    /// Move to `state`, notifying the callback and the event stream
    pub(crate) fn set_state(&self, state: PunchState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }

        info!("Punch state: {} -> {}", previous, state);
        let callback = self.state_callback.read().clone();
        if let Some(callback) = callback {
            callback(state);
        }
        self.emit(SessionEvent::StateChanged(state));
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flip `connected` to true; only the first caller gets `true`
    pub(crate) fn mark_connected(&self) -> bool {
        self.connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Queue an event without blocking; a full or closed channel drops it
    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Dropping session event: {}", e);
        }
    }

    /// Queue an event, waiting for room in the channel
    ///
    /// Waits at most `poll` at a time and gives up once the session is
    /// cancelled, so a reader that stopped draining cannot block shutdown.
    pub(crate) async fn deliver(&self, event: SessionEvent, poll: Duration) {
        let mut event = event;
        loop {
            if self.cancel.is_cancelled() {
                debug!("Dropping session event, session cancelled");
                return;
            }
            match self.events.send_timeout(event, poll).await {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(pending)) => event = pending,
                Err(SendTimeoutError::Closed(_)) => {
                    debug!("Session event receiver gone");
                    return;
                }
            }
        }
    }
}
