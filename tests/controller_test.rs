//! Session controller tests
//!
//! User input is fed from in-memory readers; STUN servers are local
//! responders so nothing leaves the machine.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use holepunch::network::{CancelFlag, PunchConfig, PunchMode, StunResponder, StunServer};
use holepunch::{Config, MappedAddress, PunchRequest, SessionController, SessionOutcome};
use tokio_test::assert_ok;

fn spawn_responder(mapping: Option<MappedAddress>, cancel: &CancelFlag) -> StunServer {
    let mut responder = StunResponder::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    if let Some(mapping) = mapping {
        responder = responder.with_fixed_mapping(mapping);
    }
    let server = StunServer::new("127.0.0.1", responder.local_addr().port());
    responder.spawn(cancel.clone());
    server
}

fn test_config(stun_servers: Vec<StunServer>) -> Config {
    Config {
        stun_servers,
        probe_timeout_ms: 500,
        punch: PunchConfig {
            discovery_window_ms: 300,
            punch_interval_ms: 100,
            poll_interval_ms: 100,
            connect_timeout_ms: 200,
            retry_delay_ms: 50,
            race_timeout_ms: 300,
            ..PunchConfig::default()
        },
    }
}

fn discard_peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9))
}

/// Test: discovery, punching and a quit during relay completes the session
#[tokio::test]
async fn test_udp_session_completes_on_quit() {
    let cancel = CancelFlag::new();
    let server = spawn_responder(None, &cancel);
    let controller = SessionController::new(test_config(vec![server]));

    let request = PunchRequest::new(PunchMode::Udp, 0, discard_peer());
    let input: &[u8] = b"hello\nquit\n";
    let outcome = tokio::time::timeout(Duration::from_secs(5), controller.run(&request, input)).await;

    let outcome = assert_ok!(assert_ok!(outcome));
    assert_eq!(outcome, SessionOutcome::Completed);
    cancel.cancel();
}

/// Test: end of input during relay also completes the session
#[tokio::test]
async fn test_udp_session_completes_on_eof() {
    let controller = SessionController::new(test_config(StunServer::defaults()));
    let mut request = PunchRequest::new(PunchMode::Udp, 0, discard_peer());
    request.skip_discovery = true;

    let input: &[u8] = b"";
    let outcome = assert_ok!(controller.run(&request, input).await);
    assert_eq!(outcome, SessionOutcome::Completed);
}

/// Test: declining at the symmetric NAT prompt aborts before punching
#[tokio::test]
async fn test_symmetric_nat_declined() {
    let cancel = CancelFlag::new();
    let servers = vec![
        spawn_responder(Some(MappedAddress::new(Ipv4Addr::new(203, 0, 113, 5), 40000)), &cancel),
        spawn_responder(Some(MappedAddress::new(Ipv4Addr::new(203, 0, 113, 99), 40000)), &cancel),
    ];
    let controller = SessionController::new(test_config(servers));

    let mut request = PunchRequest::new(PunchMode::Udp, 0, discard_peer());
    request.skip_discovery = true;
    request.classify = true;

    let input: &[u8] = b"n\n";
    let outcome = assert_ok!(controller.run(&request, input).await);
    assert_eq!(outcome, SessionOutcome::Declined);
    cancel.cancel();
}

/// Test: confirming at the symmetric NAT prompt goes on to punch
#[tokio::test]
async fn test_symmetric_nat_confirmed() {
    let cancel = CancelFlag::new();
    let servers = vec![
        spawn_responder(Some(MappedAddress::new(Ipv4Addr::new(203, 0, 113, 5), 40000)), &cancel),
        spawn_responder(Some(MappedAddress::new(Ipv4Addr::new(203, 0, 113, 99), 40000)), &cancel),
    ];
    let controller = SessionController::new(test_config(servers));

    let mut request = PunchRequest::new(PunchMode::Udp, 0, discard_peer());
    request.skip_discovery = true;
    request.classify = true;

    let input: &[u8] = b"y\nquit\n";
    let outcome = assert_ok!(controller.run(&request, input).await);
    assert_eq!(outcome, SessionOutcome::Completed);
    cancel.cancel();
}

/// Test: quitting at the wait-for-peer prompt never opens a session
#[tokio::test]
async fn test_wait_for_peer_quit() {
    let controller = SessionController::new(test_config(StunServer::defaults()));
    let mut request = PunchRequest::new(PunchMode::Udp, 0, discard_peer());
    request.skip_discovery = true;
    request.wait_for_peer = true;

    let input: &[u8] = b"quit\n";
    let outcome = assert_ok!(controller.run(&request, input).await);
    assert_eq!(outcome, SessionOutcome::Completed);
}

/// Test: a TCP race with no peer fails once the race timeout passes
#[tokio::test]
async fn test_tcp_without_peer_fails() {
    let controller = SessionController::new(test_config(StunServer::defaults()));
    let mut request = PunchRequest::new(PunchMode::Tcp, 0, discard_peer());
    request.skip_discovery = true;

    let input: &[u8] = b"";
    let outcome = tokio::time::timeout(Duration::from_secs(5), controller.run(&request, input)).await;
    let outcome = assert_ok!(assert_ok!(outcome));
    assert!(matches!(outcome, SessionOutcome::Failed(_)));
}

/// Test: typing quit while the TCP race runs gives up cleanly
#[tokio::test]
async fn test_tcp_quit_during_race() {
    let mut config = test_config(StunServer::defaults());
    config.punch.race_timeout_ms = 30_000;
    let controller = SessionController::new(config);

    let mut request = PunchRequest::new(PunchMode::Tcp, 0, discard_peer());
    request.skip_discovery = true;

    let input: &[u8] = b"quit\n";
    let outcome = tokio::time::timeout(Duration::from_secs(5), controller.run(&request, input)).await;
    let outcome = assert_ok!(assert_ok!(outcome));
    assert_eq!(outcome, SessionOutcome::Completed);
}
