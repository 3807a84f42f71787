//! End-to-end runs of the server over loopback sockets.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout, timeout_at};

use seastar::server::{Registry, RegistrySettings, Server, ServerError, ShutdownFlag};

struct TestServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: ShutdownFlag,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    fn start(settings: RegistrySettings) -> Self {
        let shutdown = ShutdownFlag::new();
        let server = Server::bind_addr(
            "127.0.0.1:0".parse().unwrap(),
            settings,
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .unwrap();
        let addr = server.local_addr();
        let registry = server.registry();
        let handle = tokio::spawn(server.serve());

        Self {
            addr,
            registry,
            shutdown,
            handle,
        }
    }

    async fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Client {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn wait_for_count(&self, expected: usize, within: Duration) {
        let result = timeout(within, async {
            while self.registry.count() != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "expected {expected} connections, registry holds {}",
            self.registry.count()
        );
    }

    async fn stop(self) {
        self.shutdown.set();
        timeout(Duration::from_secs(3), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn next_line(&mut self, within: Duration) -> Option<String> {
        timeout(within, self.lines.next_line())
            .await
            .ok()
            .and_then(Result::ok)
            .flatten()
    }

    async fn next_matching(&mut self, prefix: &str, within: Duration) -> Option<String> {
        let deadline = Instant::now() + within;
        while let Ok(Ok(Some(line))) = timeout_at(deadline, self.lines.next_line()).await {
            if line.starts_with(prefix) {
                return Some(line);
            }
        }
        None
    }

    async fn drain_to_end(&mut self, within: Duration) -> Vec<String> {
        let deadline = Instant::now() + within;
        let mut seen = Vec::new();
        while let Ok(Ok(Some(line))) = timeout_at(deadline, self.lines.next_line()).await {
            seen.push(line);
        }
        seen
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_client_scenario() {
    let server = TestServer::start(RegistrySettings::default());

    let mut a = server.connect().await;
    let announce = a.next_line(Duration::from_millis(1100)).await.unwrap();
    let a_id: u64 = announce.strip_prefix("ID=").unwrap().parse().unwrap();

    let b = server.connect().await;
    server.wait_for_count(2, Duration::from_secs(1)).await;

    a.writer.write_all(b"ping\n").await.unwrap();
    let reply = a.next_matching("COUNT=", Duration::from_millis(1100)).await;
    assert_eq!(reply.as_deref(), Some("COUNT=2"));

    drop(b);
    server.wait_for_count(1, Duration::from_secs(1)).await;

    // The identifier stays stable across cycles.
    let again = a.next_matching("ID=", Duration::from_millis(1100)).await;
    assert_eq!(again, Some(format!("ID={a_id}")));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn simultaneous_clients_get_distinct_ids() {
    let server = TestServer::start(RegistrySettings::default());

    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(server.connect().await);
    }
    server.wait_for_count(8, Duration::from_secs(1)).await;

    let mut ids = HashSet::new();
    for client in &mut clients {
        let line = client.next_line(Duration::from_millis(1100)).await.unwrap();
        assert!(ids.insert(line.clone()), "duplicate announcement {line}");
    }
    assert_eq!(ids.len(), 8);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_says_bye_and_refuses_new_clients() {
    let server = TestServer::start(RegistrySettings::default());
    let addr = server.addr;
    let registry = server.registry.clone();

    let mut a = server.connect().await;
    let mut b = server.connect().await;
    assert!(a.next_line(Duration::from_millis(1100)).await.is_some());
    assert!(b.next_line(Duration::from_millis(1100)).await.is_some());

    server.stop().await;
    assert_eq!(registry.count(), 0);

    for client in [&mut a, &mut b] {
        let tail = client.drain_to_end(Duration::from_secs(1)).await;
        assert_eq!(tail.last().map(String::as_str), Some("BYE"));
    }

    assert!(TcpStream::connect(addr).await.is_err());
}
