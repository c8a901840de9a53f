//! Plaintext and TLS accept loops driving an axum router over a
//! [`RawListener`].
//!
//! Every accepted connection runs in a task owned by the loop's `JoinSet`,
//! so aborting the loop task drops the listener and aborts every
//! in-flight connection with it. Upgraded (websocket) connections are
//! handed off by axum to their own tasks and are not tracked.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tower::Service;
use tracing::{debug, warn};

use crate::error::ResponderError;
use crate::listener::RawListener;
use crate::tls;

/// First pause after the process runs out of descriptors or buffers.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
/// Ceiling for the doubling accept backoff.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Source of inbound TCP connections for an accept loop.
pub(crate) trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for RawListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        RawListener::accept(self)
    }
}

/// Serve `router` in plaintext until the task is aborted or accepting fails.
pub(crate) async fn serve(
    listener: RawListener,
    router: Router,
    label: Arc<str>,
) -> Result<(), ResponderError> {
    accept_loop(listener, &label, move |stream, peer| {
        serve_connection(stream, router.clone(), peer)
    })
    .await
}

/// Serve `router` over TLS using the key pair at `cert_file`/`key_file`.
///
/// The key pair is loaded here, on the serving task, so a bad certificate
/// surfaces as a serve failure rather than a start failure.
pub(crate) async fn serve_tls(
    listener: RawListener,
    router: Router,
    cert_file: &Path,
    key_file: &Path,
    label: Arc<str>,
) -> Result<(), ResponderError> {
    let acceptor = tls::build_acceptor(cert_file, key_file)?;

    accept_loop(listener, &label, {
        let label = Arc::clone(&label);
        move |stream, peer| {
            let acceptor = acceptor.clone();
            let router = router.clone();
            let label = Arc::clone(&label);
            async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(tls_stream, router, peer).await,
                    Err(e) => {
                        warn!(label = %label, peer = %peer, error = %e, "TLS handshake failed");
                    }
                }
            }
        }
    })
    .await
}

async fn accept_loop<A, F, Fut>(
    listener: A,
    label: &str,
    mut on_connection: F,
) -> Result<(), ResponderError>
where
    A: Accept,
    F: FnMut(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();
    let mut backoff: Option<Duration> = None;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    backoff = None;
                    debug!(label, peer = %peer, "accepted connection");
                    connections.spawn(on_connection(stream, peer));
                }
                Err(e) => match classify_accept_error(&e) {
                    AcceptFailure::Connection => {
                        debug!(label, error = %e, "connection failed before accept completed");
                    }
                    AcceptFailure::Exhausted => {
                        let delay = next_backoff(backoff);
                        backoff = Some(delay);
                        warn!(
                            label,
                            error = %e,
                            backoff_ms = delay.as_millis() as u64,
                            "accept failed, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    AcceptFailure::Fatal => return Err(ResponderError::Accept(e)),
                },
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(label, error = %e, "connection task panicked");
                    }
                }
            }
        }
    }
}

async fn serve_connection<I>(io: I, router: Router, peer: SocketAddr)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
        router.clone().call(request)
    });

    if let Err(e) = Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
    {
        debug!(peer = %peer, error = %e, "connection closed with error");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// A single pending connection failed; the listener is fine.
    Connection,
    /// The process is out of descriptors or buffers; retry after a pause.
    Exhausted,
    /// The listener itself is unusable.
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return AcceptFailure::Connection;
    }

    if is_resource_exhaustion(e) || e.kind() == io::ErrorKind::OutOfMemory {
        return AcceptFailure::Exhausted;
    }

    AcceptFailure::Fatal
}

#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}

/// Double the previous delay, starting at [`ACCEPT_BACKOFF_MIN`] and capped
/// at [`ACCEPT_BACKOFF_MAX`].
fn next_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        None => ACCEPT_BACKOFF_MIN,
        Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::bind_random;
    use axum::routing::get;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn raw_get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write request");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read response");
        response
    }

    #[tokio::test]
    async fn test_plaintext_serve_routes_requests() {
        let (listener, port) = bind_random(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.expect("bind");
        let router = Router::new().route("/hello", get(|| async { "hello, responder" }));
        let task = tokio::spawn(serve(listener, router, Arc::from("unit")));

        let response = raw_get(port, "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        assert!(response.ends_with("hello, responder"));

        let response = raw_get(port, "/missing").await;
        assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");

        task.abort();
        assert!(task.await.expect_err("aborted").is_cancelled());
    }

    #[tokio::test]
    async fn test_serve_tls_with_missing_files_fails() {
        let (listener, _port) = bind_random(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.expect("bind");
        let result = serve_tls(
            listener,
            Router::new(),
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            Arc::from("unit"),
        )
        .await;
        assert!(matches!(result, Err(ResponderError::Pem { .. })));
    }

    /// Fails the first `failures` accepts with `error`, then delegates.
    struct FailingListener {
        inner: RawListener,
        failures: AtomicUsize,
        error: fn() -> io::Error,
    }

    impl Accept for FailingListener {
        fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            async move {
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err((self.error)());
                }
                self.inner.accept().await
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fd_exhaustion_backs_off_and_keeps_serving() {
        let (inner, port) = bind_random(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.expect("bind");
        let listener = FailingListener {
            inner,
            failures: AtomicUsize::new(3),
            error: || io::Error::from_raw_os_error(libc::EMFILE),
        };
        let router = Router::new().route("/hello", get(|| async { "still here" }));
        let task = tokio::spawn(accept_loop(listener, "emfile", move |stream, peer| {
            serve_connection(stream, router.clone(), peer)
        }));

        let response = tokio::time::timeout(Duration::from_secs(5), raw_get(port, "/hello"))
            .await
            .expect("request should be served after the backoff");
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        assert!(response.ends_with("still here"));
        assert!(!task.is_finished(), "accept loop should survive EMFILE");

        task.abort();
        assert!(task.await.expect_err("aborted").is_cancelled());
    }

    #[tokio::test]
    async fn test_unrecoverable_accept_error_ends_loop() {
        let (inner, _port) = bind_random(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.expect("bind");
        let listener = FailingListener {
            inner,
            failures: AtomicUsize::new(usize::MAX),
            error: || io::Error::from(io::ErrorKind::InvalidInput),
        };

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            accept_loop(listener, "fatal", |_stream, _peer| async {}),
        )
        .await
        .expect("loop should return");
        assert!(matches!(result, Err(ResponderError::Accept(_))));
    }

    #[test]
    fn test_accept_error_classification() {
        let kind = |k: io::ErrorKind| classify_accept_error(&io::Error::from(k));
        assert_eq!(kind(io::ErrorKind::ConnectionAborted), AcceptFailure::Connection);
        assert_eq!(kind(io::ErrorKind::ConnectionReset), AcceptFailure::Connection);
        assert_eq!(kind(io::ErrorKind::PermissionDenied), AcceptFailure::Fatal);
    }

    #[cfg(unix)]
    #[test]
    fn test_exhaustion_errnos_are_retried() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert_eq!(
                classify_accept_error(&io::Error::from_raw_os_error(code)),
                AcceptFailure::Exhausted,
                "errno {code}"
            );
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut delay = next_backoff(None);
        assert_eq!(delay, Duration::from_millis(5));
        delay = next_backoff(Some(delay));
        assert_eq!(delay, Duration::from_millis(10));
        for _ in 0..20 {
            delay = next_backoff(Some(delay));
        }
        assert_eq!(delay, Duration::from_secs(1));
    }
}
