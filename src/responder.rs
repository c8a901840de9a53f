//! Per-test responder lifecycle.
//!
//! A [`TestResponder`] owns exactly one ephemeral listener and the server
//! task serving it, an advisory deadline, and the receiving end of the
//! signaling channel. It moves through `Unstarted -> Active -> Closed`
//! once:
//!
//! - [`TestResponder::start`] binds a random port, spawns the serve task
//!   and returns without waiting for it.
//! - [`TestResponder::close`] tears everything down in a fixed order:
//!   server, listener, deadline, channel.
//!
//! The deadline only cancels the token returned by
//! [`TestResponder::deadline`]; the control loop decides what to do when
//! it fires and calls `close` itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ResponderConfig;
use crate::error::ResponderError;
use crate::listener::{bind_random, RawListener};
use crate::serve;
use crate::signal::{self, Signal, SignalReceiver};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum State {
    Unstarted,
    Active(Active),
    Closed,
}

/// Resources held between a successful start and close.
#[derive(Debug)]
struct Active {
    label: Arc<str>,
    port: u16,
    local_addr: SocketAddr,
    server: JoinHandle<()>,
    deadline: CancellationToken,
    deadline_timer: JoinHandle<()>,
    signals: SignalReceiver,
}

// ---------------------------------------------------------------------------
// TestResponder
// ---------------------------------------------------------------------------

/// Coordinates one ephemeral server for the duration of a single test.
#[derive(Debug)]
pub struct TestResponder {
    config: Arc<ResponderConfig>,
    state: State,
}

impl TestResponder {
    pub fn new(config: Arc<ResponderConfig>) -> Self {
        Self {
            config,
            state: State::Unstarted,
        }
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    /// Start serving `router` on a random port.
    ///
    /// Returns once the listener is bound and the serve task has been
    /// spawned; the port is connectable immediately. Only a bind failure
    /// is reported here, and it leaves the responder closed. Later serve
    /// failures are logged with `label`.
    ///
    /// Handlers reach the signaling channel through
    /// `Extension<SignalSender>`.
    pub async fn start(&mut self, router: Router, label: &str) -> Result<(), ResponderError> {
        if !matches!(self.state, State::Unstarted) {
            warn!(label, "start called on a responder that was already started");
            return Err(ResponderError::AlreadyStarted);
        }

        // 1. Deadline.
        let deadline = CancellationToken::new();
        let deadline_timer = spawn_deadline(deadline.clone(), self.config.deadline());

        // 2. Signaling channel.
        let (sender, signals) = signal::channel(self.config.signal_capacity);

        // 3. Listener.
        let (listener, port) = match bind_random(self.config.bind_address).await {
            Ok(bound) => bound,
            Err(e) => {
                error!(label, error = %e, "failed to listen on any port");
                deadline_timer.abort();
                deadline.cancel();
                self.state = State::Closed;
                return Err(e);
            }
        };
        let local_addr = listener.local_addr();

        // 4. Server.
        let router = router.layer(Extension(sender));
        let label: Arc<str> = Arc::from(label);
        info!(label = %label, addr = %local_addr, tls = self.config.tls, "serving for test");
        let server = tokio::spawn(run_server(
            listener,
            router,
            Arc::clone(&self.config),
            Arc::clone(&label),
        ));

        self.state = State::Active(Active {
            label,
            port,
            local_addr,
            server,
            deadline,
            deadline_timer,
            signals,
        });
        Ok(())
    }

    /// Port bound by a successful start, until close.
    pub fn port(&self) -> Option<u16> {
        match &self.state {
            State::Active(active) => Some(active.port),
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Active(active) => Some(active.local_addr),
            _ => None,
        }
    }

    /// Token cancelled when the deadline elapses or the responder closes.
    pub fn deadline(&self) -> Option<CancellationToken> {
        match &self.state {
            State::Active(active) => Some(active.deadline.clone()),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Whether the serve task is still running.
    pub fn is_serving(&self) -> bool {
        match &self.state {
            State::Active(active) => !active.server.is_finished(),
            _ => false,
        }
    }

    /// Receive the next signal from the handler.
    ///
    /// Returns `None` once the responder is closed (or was never started),
    /// and also when the serve task has stopped and no handler still holds
    /// a sender.
    pub async fn recv(&mut self) -> Option<Signal> {
        match &mut self.state {
            State::Active(active) => active.signals.recv().await,
            _ => None,
        }
    }

    /// Release every resource. Safe to call in any state; only the first
    /// call on an active responder does anything.
    pub async fn close(&mut self) {
        let active = match std::mem::replace(&mut self.state, State::Closed) {
            State::Active(active) => active,
            State::Unstarted => {
                debug!("closing test responder that was never started");
                return;
            }
            State::Closed => {
                debug!("test responder already closed");
                return;
            }
        };

        let Active {
            label,
            local_addr,
            server,
            deadline,
            deadline_timer,
            mut signals,
            ..
        } = active;

        info!(label = %label, addr = %local_addr, "closing test responder");

        // Server: abort in-flight connections without draining them.
        server.abort();

        // Listener: the serve task owns the socket; wait until it is dropped.
        match server.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!(label = %label, error = %e, "serve task panicked"),
        }

        // Deadline.
        deadline.cancel();
        deadline_timer.abort();

        // Signaling channel.
        let discarded = signals.close();
        if discarded > 0 {
            debug!(label = %label, discarded, "discarded undelivered signals");
        }
    }
}

impl Drop for TestResponder {
    fn drop(&mut self) {
        if let State::Active(active) = &mut self.state {
            warn!(label = %active.label, "test responder dropped without close");
            active.server.abort();
            active.deadline.cancel();
            active.deadline_timer.abort();
            active.signals.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn run_server(
    listener: RawListener,
    router: Router,
    config: Arc<ResponderConfig>,
    label: Arc<str>,
) {
    let result = if config.tls {
        serve::serve_tls(listener, router, &config.cert_file, &config.key_file, Arc::clone(&label)).await
    } else {
        serve::serve(listener, router, Arc::clone(&label)).await
    };

    if let Err(e) = result {
        error!(label = %label, error = %e, "test responder server failed");
    }
}

fn spawn_deadline(token: CancellationToken, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                debug!(deadline_ms = after.as_millis() as u64, "test responder deadline elapsed");
                token.cancel();
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
