// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{o, Drain, Logger};

use carom::cluster::Cluster;
use carom::endpoint::Endpoint;
use carom::server_manager::{
    RoundRobinServerManager, ServerManager, SingleServerManager,
};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

// Poll `check` until it returns true or the deadline passes.
fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn manager_variant_is_selected_by_endpoint_count() {
    let single = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    let manager =
        ServerManager::new(&single, Arc::new(|_: &Endpoint| false), test_log());
    assert!(matches!(manager, ServerManager::Single(_)));

    let multi = Cluster::new(vec![
        Endpoint::new("db1", 9160),
        Endpoint::new("db2", 9160),
    ]);
    let manager =
        ServerManager::new(&multi, Arc::new(|_: &Endpoint| false), test_log());
    assert!(matches!(manager, ServerManager::RoundRobin(_)));
}

#[test]
fn single_manager_returns_none_after_failure_until_probe_succeeds() {
    let endpoint = Endpoint::new("db1", 9160);
    let probe_attempts = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&probe_attempts);
    let manager = SingleServerManager::new(
        endpoint.clone(),
        Duration::from_millis(50),
        Arc::new(move |_: &Endpoint| {
            attempts.fetch_add(1, Ordering::SeqCst);
            true
        }),
        test_log(),
    );

    assert_eq!(manager.get_server(), Some(endpoint.clone()));

    manager.error_occurred(&endpoint);
    assert_eq!(manager.get_server(), None);

    let recovered = wait_until(Duration::from_secs(5), || {
        manager.get_server().is_some()
    });
    assert!(recovered, "endpoint did not recover after successful probe");
    assert_eq!(manager.get_server(), Some(endpoint));
    assert_eq!(probe_attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn single_manager_probe_is_one_shot() {
    let endpoint = Endpoint::new("db1", 9160);
    let probe_attempts = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&probe_attempts);
    let manager = SingleServerManager::new(
        endpoint.clone(),
        Duration::from_millis(50),
        Arc::new(move |_: &Endpoint| {
            attempts.fetch_add(1, Ordering::SeqCst);
            false
        }),
        test_log(),
    );

    manager.error_occurred(&endpoint);
    // A second report while failed is idempotent and must not arm another
    // probe.
    manager.error_occurred(&endpoint);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(manager.get_server(), None);
    assert_eq!(probe_attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn round_robin_cycles_through_live_endpoints() {
    let endpoints = vec![
        Endpoint::new("a", 9160),
        Endpoint::new("b", 9160),
        Endpoint::new("c", 9160),
        Endpoint::new("d", 9160),
    ];
    let manager = RoundRobinServerManager::new(
        endpoints.clone(),
        Duration::from_secs(30),
        Arc::new(|_: &Endpoint| false),
        test_log(),
    );

    let mut selections = Vec::new();
    for _ in 0..8 {
        selections.push(manager.get_server().unwrap());
    }

    let mut expected = endpoints.clone();
    expected.extend(endpoints);
    assert_eq!(selections, expected);
}

#[test]
fn round_robin_serves_the_last_live_endpoint_then_none() {
    let a = Endpoint::new("a", 9160);
    let b = Endpoint::new("b", 9160);
    let c = Endpoint::new("c", 9160);
    let manager = RoundRobinServerManager::new(
        vec![a.clone(), b.clone(), c.clone()],
        Duration::from_secs(30),
        Arc::new(|_: &Endpoint| false),
        test_log(),
    );

    manager.error_occurred(&a);
    manager.error_occurred(&b);
    // Blacklisting is idempotent.
    manager.error_occurred(&b);

    for _ in 0..6 {
        assert_eq!(manager.get_server(), Some(c.clone()));
    }

    manager.error_occurred(&c);
    assert_eq!(manager.get_server(), None);
}

#[test]
fn round_robin_recovers_blacklisted_endpoints() {
    let a = Endpoint::new("a", 9160);
    let b = Endpoint::new("b", 9160);
    let reachable = Arc::new(AtomicBool::new(false));
    let probe_reachable = Arc::clone(&reachable);
    let manager = RoundRobinServerManager::new(
        vec![a.clone(), b.clone()],
        Duration::from_millis(50),
        Arc::new(move |_: &Endpoint| probe_reachable.load(Ordering::SeqCst)),
        test_log(),
    );

    manager.error_occurred(&a);
    for _ in 0..4 {
        assert_eq!(manager.get_server(), Some(b.clone()));
    }

    reachable.store(true, Ordering::SeqCst);

    let recovered = wait_until(Duration::from_secs(5), || {
        (0..4).any(|_| manager.get_server() == Some(a.clone()))
    });
    assert!(recovered, "blacklisted endpoint was not restored");
}

#[test]
fn disposed_round_robin_manager_stops_probing() {
    let a = Endpoint::new("a", 9160);
    let b = Endpoint::new("b", 9160);
    let probe_attempts = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::clone(&probe_attempts);
    let manager = RoundRobinServerManager::new(
        vec![a.clone(), b],
        Duration::from_millis(50),
        Arc::new(move |_: &Endpoint| {
            attempts.fetch_add(1, Ordering::SeqCst);
            false
        }),
        test_log(),
    );

    manager.error_occurred(&a);
    manager.dispose();

    // Allow any in-flight tick to drain before taking the baseline.
    thread::sleep(Duration::from_millis(100));
    let settled = probe_attempts.load(Ordering::SeqCst);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(probe_attempts.load(Ordering::SeqCst), settled);
}
