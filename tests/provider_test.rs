// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use slog::{o, Drain, Logger};

use carom::cluster::Cluster;
use carom::connection::{Connection, ConnectionFactory};
use carom::connection_provider::ConnectionProvider;
use carom::endpoint::Endpoint;
use carom::error::Error;
use carom::server_manager::ServerManager;

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

#[derive(Debug)]
pub struct FakeConnection {
    id: usize,
    open: bool,
    fail_open: bool,
    closes: Arc<AtomicUsize>,
}

impl Connection for FakeConnection {
    type Error = IoError;

    fn open(&mut self) -> Result<(), IoError> {
        if self.fail_open {
            return Err(IoError::new(
                ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), IoError> {
        if self.open {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// A connection factory that records every creation attempt and can be told
// to fail opens against particular hosts.
struct FakeFactory {
    next_id: Arc<AtomicUsize>,
    attempts: Arc<Mutex<Vec<String>>>,
    failing_hosts: Arc<Mutex<HashSet<String>>>,
    closes: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn new() -> Self {
        FakeFactory {
            next_id: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
            failing_hosts: Arc::new(Mutex::new(HashSet::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn fail_host(&self, host: &str) {
        self.failing_hosts
            .lock()
            .unwrap()
            .insert(host.to_string());
    }

    fn factory(&self) -> ConnectionFactory<FakeConnection> {
        let next_id = Arc::clone(&self.next_id);
        let attempts = Arc::clone(&self.attempts);
        let failing_hosts = Arc::clone(&self.failing_hosts);
        let closes = Arc::clone(&self.closes);
        Arc::new(move |endpoint: &Endpoint, _kind, _buffer_size| {
            attempts.lock().unwrap().push(endpoint.host.clone());
            FakeConnection {
                id: next_id.fetch_add(1, Ordering::SeqCst),
                open: false,
                fail_open: failing_hosts
                    .lock()
                    .unwrap()
                    .contains(&endpoint.host),
                closes: Arc::clone(&closes),
            }
        })
    }

    fn created(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn attempts_for(&self, host: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.as_str() == host)
            .count()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

fn manager_for(cluster: &Cluster) -> Arc<ServerManager> {
    // Probes always fail: nothing recovers underneath the tests.
    Arc::new(ServerManager::new(
        cluster,
        Arc::new(|_: &Endpoint| false),
        test_log(),
    ))
}

fn provider_for(
    cluster: &Cluster,
    factory: &FakeFactory,
) -> ConnectionProvider<FakeConnection> {
    ConnectionProvider::new(
        cluster,
        manager_for(cluster),
        factory.factory(),
        None,
    )
    .unwrap()
}

#[test]
fn pooled_free_connections_are_reused_before_new_ones_are_made() {
    let mut cluster = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    cluster.pooling = true;
    let factory = FakeFactory::new();
    let provider = provider_for(&cluster, &factory);

    let conn1 = provider.open().unwrap();
    let id1 = conn1.id;
    drop(conn1);

    let conn2 = provider.open().unwrap();
    assert_eq!(conn2.id, id1);
    assert_eq!(factory.created(), 1);
}

#[test]
fn pool_opens_new_connections_until_min_pool_size_is_reached() {
    let mut cluster = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    cluster.pooling = true;
    cluster.min_pool_size = 2;
    let factory = FakeFactory::new();
    let provider = provider_for(&cluster, &factory);

    let conn1 = provider.open().unwrap();
    let id1 = conn1.id;
    drop(conn1);

    // Below the pool floor an idle connection is not reused; a second one
    // is opened instead.
    let conn2 = provider.open().unwrap();
    let id2 = conn2.id;
    assert_ne!(id2, id1);
    drop(conn2);

    // At the floor, reuse is FIFO: the oldest idle connection comes back.
    let conn3 = provider.open().unwrap();
    assert_eq!(conn3.id, id1);
    assert_eq!(factory.created(), 2);
}

#[test]
fn failed_open_quarantines_the_endpoint_and_fails_over() {
    let timeout = Duration::from_secs(1);
    let mut cluster = Cluster::new(vec![
        Endpoint::with_timeout("a", 9160, timeout),
        Endpoint::with_timeout("b", 9160, timeout),
    ]);
    cluster.pooling = true;
    let factory = FakeFactory::new();
    factory.fail_host("a");
    let manager = manager_for(&cluster);
    let provider = ConnectionProvider::new(
        &cluster,
        Arc::clone(&manager),
        factory.factory(),
        None,
    )
    .unwrap();

    let conn = provider.open().unwrap();
    assert!(conn.is_open());

    // Exactly one attempt against the failed endpoint, and it is excluded
    // from every selection that follows.
    assert_eq!(factory.attempts_for("a"), 1);
    assert_eq!(factory.attempts_for("b"), 1);
    for _ in 0..4 {
        assert_eq!(manager.get_server().map(|e| e.host), Some("b".to_string()));
    }
}

#[test]
fn open_fails_once_every_endpoint_is_quarantined() {
    let timeout = Duration::from_secs(1);
    let mut cluster = Cluster::new(vec![
        Endpoint::with_timeout("a", 9160, timeout),
        Endpoint::with_timeout("b", 9160, timeout),
    ]);
    cluster.pooling = true;
    let factory = FakeFactory::new();
    factory.fail_host("a");
    factory.fail_host("b");
    let provider = provider_for(&cluster, &factory);

    let result = provider.open();
    assert!(matches!(result, Err(Error::AllServersFailed)));
    assert_eq!(factory.attempts_for("a"), 1);
    assert_eq!(factory.attempts_for("b"), 1);
}

#[test]
fn saturated_pool_blocks_until_a_connection_is_released() {
    let mut cluster = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    cluster.pooling = true;
    cluster.max_pool_size = 1;
    let factory = FakeFactory::new();
    let provider = Arc::new(provider_for(&cluster, &factory));

    let conn1 = provider.open().unwrap();
    let id1 = conn1.id;

    let (tx, rx) = channel();
    let provider_clone = Arc::clone(&provider);
    let waiter = thread::spawn(move || {
        let conn2 = provider_clone.open().unwrap();
        tx.send(conn2.id).unwrap();
    });

    // The second open must stay blocked while the only connection is
    // checked out; a second concurrently-live connection is never created.
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
    assert_eq!(factory.created(), 1);

    drop(conn1);

    let id2 = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(id2, id1);
    assert_eq!(factory.created(), 1);
    waiter.join().unwrap();
}

#[test]
fn expired_idle_connections_are_swept() {
    let mut cluster = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    cluster.pooling = true;
    cluster.polling_interval = Duration::from_millis(100);
    cluster.connection_lifetime = Duration::from_millis(200);
    let factory = FakeFactory::new();
    let provider = provider_for(&cluster, &factory);

    let conn1 = provider.open().unwrap();
    drop(conn1);

    let stats = provider.stats().unwrap();
    assert_eq!(stats.idle_connections, 1.into());

    thread::sleep(Duration::from_secs(1));

    let stats = provider.stats().unwrap();
    assert_eq!(stats.idle_connections, 0.into());
    assert_eq!(stats.total_connections, 0.into());
    assert_eq!(factory.closes(), 1);
}

#[test]
fn error_occurred_discards_idle_connections_to_the_failed_endpoint() {
    let mut cluster = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    cluster.pooling = true;
    let factory = FakeFactory::new();
    let manager = manager_for(&cluster);
    let provider = ConnectionProvider::new(
        &cluster,
        Arc::clone(&manager),
        factory.factory(),
        None,
    )
    .unwrap();

    let conn1 = provider.open().unwrap();
    let conn2 = provider.open().unwrap();
    drop(conn2);

    let stats = provider.stats().unwrap();
    assert_eq!(stats.total_connections, 2.into());
    assert_eq!(stats.idle_connections, 1.into());

    provider.error_occurred(
        conn1,
        Some(&IoError::new(ErrorKind::BrokenPipe, "broken pipe")),
    );

    // Both the failed connection and the cached idle one are gone, and the
    // endpoint is quarantined.
    let stats = provider.stats().unwrap();
    assert_eq!(stats.total_connections, 0.into());
    assert_eq!(stats.idle_connections, 0.into());
    assert_eq!(factory.closes(), 2);
    assert_eq!(manager.get_server(), None);
    assert!(matches!(provider.open(), Err(Error::AllServersFailed)));
}

#[test]
fn normal_provider_opens_fresh_connections_and_closes_on_release() {
    let cluster = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    let factory = FakeFactory::new();
    let provider = provider_for(&cluster, &factory);

    let conn1 = provider.open().unwrap();
    let id1 = conn1.id;
    assert!(conn1.is_open());
    drop(conn1);
    assert_eq!(factory.closes(), 1);

    let conn2 = provider.open().unwrap();
    assert_ne!(conn2.id, id1);
    assert_eq!(factory.created(), 2);
}

#[test]
fn normal_provider_fails_over_across_endpoints() {
    let timeout = Duration::from_secs(1);
    let cluster = Cluster::new(vec![
        Endpoint::with_timeout("a", 9160, timeout),
        Endpoint::with_timeout("b", 9160, timeout),
    ]);
    let factory = FakeFactory::new();
    factory.fail_host("a");
    let provider = provider_for(&cluster, &factory);

    let conn = provider.open().unwrap();
    assert!(conn.is_open());
    assert_eq!(conn.endpoint().host, "b");
    assert_eq!(factory.attempts_for("a"), 1);
}

#[test]
fn normal_provider_requires_a_timeout_with_multiple_endpoints() {
    let cluster = Cluster::new(vec![
        Endpoint::new("a", 9160),
        Endpoint::new("b", 9160),
    ]);
    let factory = FakeFactory::new();
    let result = ConnectionProvider::new(
        &cluster,
        manager_for(&cluster),
        factory.factory(),
        None,
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn disposed_pool_rejects_open() {
    let mut cluster = Cluster::new(vec![Endpoint::new("db1", 9160)]);
    cluster.pooling = true;
    let factory = FakeFactory::new();
    let provider = provider_for(&cluster, &factory);

    let conn1 = provider.open().unwrap();
    drop(conn1);

    provider.dispose();
    assert!(matches!(provider.open(), Err(Error::ProviderDisposed)));
    assert_eq!(factory.closes(), 1);
    assert!(provider.stats().is_none());
}
