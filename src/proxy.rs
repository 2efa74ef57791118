//! Byte-transparent TCP proxy.
//!
//! Every accepted connection gets a fresh uid, is announced through
//! [`SessionHooks::on_connect`], dialed through to the current target and
//! relayed in both directions. When either direction finishes the session is
//! over, and [`SessionHooks::on_disconnect`] fires exactly once.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Buffer size per relay direction
const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Pause between dial attempts while a connect timeout is configured
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Supplies the address to dial for each new session
pub trait TargetProvider: Send + Sync {
    fn server_address(&self) -> String;
}

impl TargetProvider for String {
    fn server_address(&self) -> String {
        self.clone()
    }
}

/// Identity of one proxied connection
#[derive(Debug, Clone)]
pub struct ConnInfo {
    uid: String,
    peer_addr: SocketAddr,
}

impl ConnInfo {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Session lifecycle notifications
pub trait SessionHooks: Send + Sync + 'static {
    /// Called after accept, before the target is dialed
    fn on_connect(&self, info: &ConnInfo) -> impl Future<Output = ()> + Send;

    /// Called once when the session ends, whatever the outcome
    fn on_disconnect(&self, info: &ConnInfo) -> impl Future<Output = ()> + Send;
}

/// Which side finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClosedBy {
    Client,
    Backend,
}

impl ClosedBy {
    fn as_str(&self) -> &'static str {
        match self {
            ClosedBy::Client => "client",
            ClosedBy::Backend => "backend",
        }
    }
}

pub struct ProxyServer<H> {
    bind_address: String,
    hooks: Arc<H>,
    target: Arc<dyn TargetProvider>,
    shutdown_rx: watch::Receiver<bool>,
    connect_timeout: Duration,
}

impl<H: SessionHooks> ProxyServer<H> {
    /// `bind_address` is any `host:port` the resolver understands
    pub fn new(
        bind_address: impl Into<String>,
        hooks: H,
        target: Arc<dyn TargetProvider>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            hooks: Arc::new(hooks),
            target,
            shutdown_rx,
            connect_timeout: Duration::ZERO,
        }
    }

    /// Keep retrying the target dial for up to `timeout` (zero: one attempt)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_address.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("unable to listen on {}: {}", self.bind_address, e))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    /// Accept errors are fatal and returned.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result
                        .map_err(|e| anyhow::anyhow!("error accepting connections: {}", e))?;

                    let info = ConnInfo {
                        uid: Uuid::new_v4().simple().to_string(),
                        peer_addr,
                    };
                    let hooks = Arc::clone(&self.hooks);
                    let target = Arc::clone(&self.target);
                    let connect_timeout = self.connect_timeout;

                    tokio::spawn(async move {
                        handle_connection(stream, info, hooks, target, connect_timeout).await;
                    });
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<H: SessionHooks>(
    client: TcpStream,
    info: ConnInfo,
    hooks: Arc<H>,
    target: Arc<dyn TargetProvider>,
    connect_timeout: Duration,
) {
    let uid = info.uid();
    let raddr = info.peer_addr();
    info!(uid, %raddr, "Connection established");

    hooks.on_connect(&info).await;

    // Sampled after the connect hook so a launch triggered by it is visible
    let target_addr = target.server_address();
    let started = Instant::now();

    match proxy_session(client, &target_addr, connect_timeout).await {
        Ok((closed_by, bytes)) => {
            info!(
                uid,
                %raddr,
                closed_by = closed_by.as_str(),
                bytes,
                duration_ms = started.elapsed().as_millis() as u64,
                "Connection closed"
            );
        }
        Err(e) => {
            error!(uid, %raddr, target_addr = %target_addr, error = %e, "Error during proxied connection");
        }
    }

    hooks.on_disconnect(&info).await;
}

async fn proxy_session(
    client: TcpStream,
    target_addr: &str,
    connect_timeout: Duration,
) -> anyhow::Result<(ClosedBy, u64)> {
    let backend = dial(target_addr, connect_timeout)
        .await
        .map_err(|e| anyhow::anyhow!("error dialing proxy target {}: {}", target_addr, e))?;
    relay(client, backend).await
}

async fn dial(target_addr: &str, connect_timeout: Duration) -> std::io::Result<TcpStream> {
    let deadline = Instant::now() + connect_timeout;
    loop {
        match TcpStream::connect(target_addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() + DIAL_RETRY_INTERVAL < deadline => {
                debug!(target_addr, error = %e, "Target not reachable yet, retrying");
                tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Copy both directions until either one ends. The unfinished direction is
/// dropped together with both sockets.
async fn relay(mut client: TcpStream, mut backend: TcpStream) -> anyhow::Result<(ClosedBy, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    tokio::select! {
        result = pipe(&mut client_read, &mut backend_write) => {
            let bytes = result.map_err(|e| anyhow::anyhow!("client to backend: {}", e))?;
            Ok((ClosedBy::Client, bytes))
        }
        result = pipe(&mut backend_read, &mut client_write) => {
            let bytes = result.map_err(|e| anyhow::anyhow!("backend to client: {}", e))?;
            Ok((ClosedBy::Backend, bytes))
        }
    }
}

/// Copy `reader` into `writer` until EOF, then pass the EOF on
async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut reader = BufReader::with_capacity(RELAY_BUFFER_SIZE, reader);
    let copied = tokio::io::copy_buf(&mut reader, writer).await?;
    // The peer may already be gone; the session is over either way
    let _ = writer.shutdown().await;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected(String),
        Disconnected(String),
    }

    struct RecordingHooks {
        events: mpsc::UnboundedSender<Event>,
    }

    impl SessionHooks for RecordingHooks {
        async fn on_connect(&self, info: &ConnInfo) {
            let _ = self.events.send(Event::Connected(info.uid().to_string()));
        }

        async fn on_disconnect(&self, info: &ConnInfo) {
            let _ = self.events.send(Event::Disconnected(info.uid().to_string()));
        }
    }

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_proxy<H: SessionHooks>(
        hooks: H,
        target: Arc<dyn TargetProvider>,
    ) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = ProxyServer::new(addr.to_string(), hooks, target, rx);
        let handle = tokio::spawn(server.serve(listener));
        (addr, tx, handle)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let target = echo_target().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (proxy_addr, _tx, _handle) = start_proxy(
            RecordingHooks { events: events_tx },
            Arc::new(target.to_string()),
        )
        .await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"hello through the proxy").await.unwrap();
        let mut buf = vec![0u8; 23];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello through the proxy");
        drop(client);

        let Event::Connected(uid) = next_event(&mut events_rx).await else {
            panic!("expected connect first");
        };
        assert_eq!(next_event(&mut events_rx).await, Event::Disconnected(uid));
    }

    #[tokio::test]
    async fn test_large_stream_is_relayed_unaltered() {
        let target = echo_target().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (proxy_addr, _tx, _handle) = start_proxy(
            RecordingHooks { events: events_tx },
            Arc::new(target.to_string()),
        )
        .await;

        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let client = TcpStream::connect(proxy_addr).await.unwrap();
        let (mut reader, mut writer) = client.into_split();
        let writer_task = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer
        });

        let mut received = vec![0u8; expected.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert!(received == expected, "relayed bytes differ");
        let _writer = writer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_fires_on_dial_failure() {
        // Reserve a port, then free it so nothing is listening there
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = closed.local_addr().unwrap();
        drop(closed);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (proxy_addr, _tx, _handle) = start_proxy(
            RecordingHooks { events: events_tx },
            Arc::new(dead_addr.to_string()),
        )
        .await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = [0u8; 1];
        // The proxy closes the client once the dial fails
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let Event::Connected(uid) = next_event(&mut events_rx).await else {
            panic!("expected connect first");
        };
        assert_eq!(next_event(&mut events_rx).await, Event::Disconnected(uid));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events_rx.try_recv().is_err(), "disconnect fired more than once");
    }

    #[tokio::test]
    async fn test_disconnect_fires_when_backend_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (proxy_addr, _tx, _handle) = start_proxy(
            RecordingHooks { events: events_tx },
            Arc::new(target.to_string()),
        )
        .await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf).await;
        assert!(buf.is_empty());

        let Event::Connected(uid) = next_event(&mut events_rx).await else {
            panic!("expected connect first");
        };
        assert_eq!(next_event(&mut events_rx).await, Event::Disconnected(uid));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_each_connection_gets_unique_uid() {
        let target = echo_target().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (proxy_addr, _tx, _handle) = start_proxy(
            RecordingHooks { events: events_tx },
            Arc::new(target.to_string()),
        )
        .await;

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TcpStream::connect(proxy_addr).await.unwrap());
        }

        let mut uids = std::collections::HashSet::new();
        for _ in 0..5 {
            match next_event(&mut events_rx).await {
                Event::Connected(uid) => assert!(uids.insert(uid)),
                other => panic!("unexpected event {:?}", other),
            }
        }

        drop(clients);
        for _ in 0..5 {
            match next_event(&mut events_rx).await {
                Event::Disconnected(uid) => assert!(uids.remove(&uid)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(uids.is_empty());
    }

    /// Counts connects and checks the target is only sampled afterwards
    struct OrderingProbe {
        connects: AtomicUsize,
        target: String,
        sampled_early: AtomicUsize,
    }

    impl TargetProvider for OrderingProbe {
        fn server_address(&self) -> String {
            if self.connects.load(Ordering::SeqCst) == 0 {
                self.sampled_early.fetch_add(1, Ordering::SeqCst);
            }
            self.target.clone()
        }
    }

    struct ProbeHooks(Arc<OrderingProbe>);

    impl SessionHooks for ProbeHooks {
        async fn on_connect(&self, _info: &ConnInfo) {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_disconnect(&self, _info: &ConnInfo) {}
    }

    #[tokio::test]
    async fn test_connect_hook_runs_before_target_is_sampled() {
        let target = echo_target().await;
        let probe = Arc::new(OrderingProbe {
            connects: AtomicUsize::new(0),
            target: target.to_string(),
            sampled_early: AtomicUsize::new(0),
        });
        let (proxy_addr, _tx, _handle) =
            start_proxy(ProbeHooks(Arc::clone(&probe)), probe.clone()).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);
        assert_eq!(probe.sampled_early.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout_waits_for_late_backend() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = reserved.local_addr().unwrap();
        drop(reserved);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_tx, rx) = watch::channel(false);
        let server = ProxyServer::new(
            proxy_addr.to_string(),
            RecordingHooks { events: events_tx },
            Arc::new(target.to_string()),
            rx,
        )
        .with_connect_timeout(Duration::from_secs(5));
        tokio::spawn(server.serve(listener));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();

        // Backend comes up after the client is already waiting
        tokio::time::sleep(Duration::from_millis(300)).await;
        let backend = TcpListener::bind(target).await.unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = backend.accept().await {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            }
        });

        client.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_addr, tx, handle) = start_proxy(
            RecordingHooks { events: events_tx },
            Arc::new("127.0.0.1:1".to_string()),
        )
        .await;

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("proxy did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_reports_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_tx, rx) = watch::channel(false);

        let server = ProxyServer::new(
            addr.to_string(),
            RecordingHooks { events: events_tx },
            Arc::new("127.0.0.1:1".to_string()),
            rx,
        );
        let err = server.run().await.unwrap_err();
        assert!(err.to_string().contains("unable to listen"));
    }

    #[tokio::test]
    async fn test_run_binds_hostname_address() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (tx, rx) = watch::channel(false);

        let server = ProxyServer::new(
            "localhost:0",
            RecordingHooks { events: events_tx },
            Arc::new("127.0.0.1:1".to_string()),
            rx,
        );
        let handle = tokio::spawn(server.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished(), "hostname bind was rejected");

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("proxy did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
