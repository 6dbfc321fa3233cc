//! Session controller
//!
//! Drives one attempt end to end: discover our public address, optionally
//! classify the NAT, punch, then relay user input to the peer until the
//! user quits. User input arrives as lines from any async reader, so the
//! same code serves stdin and tests.

use std::io::Write;
use std::net::SocketAddr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::network::{
    discover_public_address, NatClassifier, NetworkError, PunchMode, PunchSession, PunchState,
    SessionEvent,
};

/// What to punch and how
#[derive(Debug, Clone)]
pub struct PunchRequest {
    pub local_port: u16,
    pub peer_addr: SocketAddr,
    pub mode: PunchMode,
    /// Run the NAT classifier before punching
    pub classify: bool,
    /// Wait for Enter before punching, once addresses were exchanged
    pub wait_for_peer: bool,
    /// Skip the STUN discovery step
    pub skip_discovery: bool,
}

impl PunchRequest {
    pub fn new(mode: PunchMode, local_port: u16, peer_addr: SocketAddr) -> Self {
        Self {
            local_port,
            peer_addr,
            mode,
            classify: false,
            wait_for_peer: false,
            skip_discovery: false,
        }
    }
}

/// Terminal status of a controller run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The user ended the relay loop
    Completed,
    /// The user declined to punch through a symmetric NAT
    Declined,
    /// No path could be established
    Failed(String),
}

/// Input lines that end the session
fn is_quit(line: &str) -> bool {
    matches!(line.trim().to_lowercase().as_str(), "quit" | "exit")
}

fn is_yes(line: &str) -> bool {
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

fn prompt(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Print an event for the user
fn display_event(event: &SessionEvent) {
    match event {
        SessionEvent::Message { from, payload } => {
            let text = String::from_utf8_lossy(payload);
            println!("\n[RECV from {}] {}", from, text.trim_end());
        }
        SessionEvent::StateChanged(PunchState::Connected) => {
            println!("\nConnected! You can now send messages.");
        }
        SessionEvent::StateChanged(PunchState::Closed) => {
            println!("\nConnection closed.");
        }
        SessionEvent::StateChanged(_) => {}
        SessionEvent::TaskFailed { task, reason } => {
            println!("\nWarning: {} stopped: {}", task, reason);
        }
    }
}

/// Orchestrates discover -> classify -> punch -> relay
pub struct SessionController {
    config: Config,
}

impl SessionController {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one session, reading user input from `input`
    pub async fn run<R>(&self, request: &PunchRequest, input: R) -> Result<SessionOutcome, NetworkError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();

        if !request.skip_discovery {
            self.discover(request.local_port).await;
        }

        if request.classify && !self.classify_and_confirm(&mut lines).await {
            println!("Aborted: symmetric NAT not confirmed.");
            return Ok(SessionOutcome::Declined);
        }

        if request.wait_for_peer {
            prompt("Press Enter when peer is ready and you've exchanged external addresses...");
            match lines.next_line().await {
                Ok(Some(line)) if !is_quit(&line) => {}
                _ => return Ok(SessionOutcome::Completed),
            }
        }

        let (mut session, mut events) = PunchSession::new(
            request.mode,
            request.local_port,
            request.peer_addr,
            self.config.punch.clone(),
        )?;
        session.start();
        println!("Local socket: 0.0.0.0:{} ({})", session.local_port(), request.mode);
        println!("Target peer: {}", request.peer_addr);

        let established = match request.mode {
            PunchMode::Udp => {
                self.punch_udp(&mut session, &mut events).await;
                Ok(())
            }
            PunchMode::Tcp => self.race_tcp(&session, &mut events, &mut lines).await,
        };

        let outcome = match established {
            Ok(()) => {
                self.relay(&session, &mut events, &mut lines).await;
                SessionOutcome::Completed
            }
            Err(NetworkError::Cancelled) => SessionOutcome::Completed,
            Err(e) => {
                println!("Failed to establish a connection: {}", e);
                SessionOutcome::Failed(e.to_string())
            }
        };

        session.close().await;
        println!("Session closed.");
        info!("Session finished: {:?}", outcome);
        Ok(outcome)
    }

    /// Print our public address; failure is advisory only
    async fn discover(&self, local_port: u16) {
        println!("Getting external address via STUN...");
        match discover_public_address(local_port, &self.config.stun_servers, self.config.probe_timeout())
            .await
        {
            Ok((mapped, _)) => {
                println!("My external address: {}", mapped);
                println!("Share this with your peer: {} {}", mapped.ip, mapped.port);
            }
            Err(e) => {
                warn!("Public address discovery failed: {}", e);
                println!("Failed to get external address via STUN");
            }
        }
    }

    /// Classify the NAT; a symmetric result needs an explicit yes
    async fn classify_and_confirm<R>(&self, lines: &mut Lines<R>) -> bool
    where
        R: AsyncBufRead + Unpin,
    {
        println!("Detecting NAT type...");
        let classifier =
            NatClassifier::with_timeout(self.config.stun_servers.clone(), self.config.probe_timeout());
        let classification = classifier.classify().await;
        println!("NAT type: {}", classification);

        if !classification.is_symmetric() {
            return true;
        }

        println!("Warning: symmetric NAT detected, hole punching is expected to fail.");
        prompt("Continue anyway? [y/N]: ");
        matches!(lines.next_line().await, Ok(Some(line)) if is_yes(&line))
    }

    /// Punch for the discovery window while showing what arrives
    async fn punch_udp(&self, session: &mut PunchSession, events: &mut mpsc::Receiver<SessionEvent>) {
        let window = session.config().discovery_window();
        println!("Hole punching for {} seconds...", window.as_secs_f32());

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Some(event) = events.recv() => display_event(&event),
            }
        }

        session.finish_punching().await;
        if !session.is_connected() {
            info!("No message from peer during discovery window, relaying anyway");
        }
    }

    /// Wait for the TCP race; `quit` on input gives up early
    async fn race_tcp<R>(
        &self,
        session: &PunchSession,
        events: &mut mpsc::Receiver<SessionEvent>,
        lines: &mut Lines<R>,
    ) -> Result<(), NetworkError>
    where
        R: AsyncBufRead + Unpin,
    {
        let race_timeout = session.config().race_timeout();
        println!(
            "Racing TCP simultaneous open for up to {} seconds...",
            race_timeout.as_secs_f32()
        );

        let connected = session.wait_connected(race_timeout);
        tokio::pin!(connected);
        let mut input_open = true;

        loop {
            tokio::select! {
                result = &mut connected => return result,
                Some(event) = events.recv() => display_event(&event),
                line = lines.next_line(), if input_open => match line {
                    Ok(Some(line)) if is_quit(&line) => return Err(NetworkError::Cancelled),
                    Ok(Some(_)) => println!("Not connected yet."),
                    _ => input_open = false,
                },
            }
        }
    }

    /// Send input lines to the peer until quit or end of input
    async fn relay<R>(
        &self,
        session: &PunchSession,
        events: &mut mpsc::Receiver<SessionEvent>,
        lines: &mut Lines<R>,
    ) where
        R: AsyncBufRead + Unpin,
    {
        println!("Starting message exchange. Type 'quit' to exit.");
        prompt("You: ");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Failed to read input: {}", e);
                            break;
                        }
                    };
                    if is_quit(&line) {
                        break;
                    }
                    if !line.trim().is_empty() {
                        let payload = match session.mode() {
                            PunchMode::Udp => line.into_bytes(),
                            PunchMode::Tcp => format!("{}\n", line).into_bytes(),
                        };
                        // Failures are logged by the session
                        let _ = session.send_application_message(&payload).await;
                    }
                    prompt("You: ");
                }
                Some(event) = events.recv() => {
                    display_event(&event);
                    if event == SessionEvent::StateChanged(PunchState::Closed) {
                        break;
                    }
                    prompt("You: ");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_words() {
        assert!(is_quit("quit"));
        assert!(is_quit("  EXIT "));
        assert!(!is_quit("quitting"));
    }

    #[test]
    fn test_yes_words() {
        assert!(is_yes("y"));
        assert!(is_yes("Yes"));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
    }
}
