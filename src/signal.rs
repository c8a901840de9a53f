//! Typed signaling channel between a running protocol handler and the
//! control loop that owns the responder.
//!
//! The handler side gets a cloneable [`SignalSender`] (attached to every
//! request as an axum `Extension`). The receiving side stays inside the
//! [`TestResponder`](crate::responder::TestResponder), which closes it
//! during teardown. Sends after that point fail with
//! [`ResponderError::SignalClosed`] rather than faulting.
//!
//! With a capacity of zero the channel is a rendezvous: each send carries
//! an acknowledgement that the control loop fires when it takes the value,
//! so `send` returns only after the value has been received.

use tokio::sync::{mpsc, oneshot};

use crate::error::ResponderError;

/// Numeric encoding of [`Signal::Ready`] used by legacy NDT control loops.
pub const READY_VALUE: f64 = -1.0;

/// A status value reported by a protocol handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    /// The handler has started accepting protocol work.
    Ready,
    /// A measurement or progress value.
    Progress(f64),
}

impl Signal {
    /// Numeric form of the signal, with `Ready` mapped to [`READY_VALUE`].
    pub fn as_f64(self) -> f64 {
        match self {
            Signal::Ready => READY_VALUE,
            Signal::Progress(value) => value,
        }
    }

    /// Decode a numeric value, treating [`READY_VALUE`] as `Ready`.
    pub fn from_f64(value: f64) -> Self {
        if value == READY_VALUE {
            Signal::Ready
        } else {
            Signal::Progress(value)
        }
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// A signal in flight, with the handoff acknowledgement when unbuffered.
#[derive(Debug)]
struct Envelope {
    signal: Signal,
    ack: Option<oneshot::Sender<()>>,
}

/// Producer handle given to protocol handlers.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Envelope>,
    handoff: bool,
}

impl SignalSender {
    /// Send a signal.
    ///
    /// On an unbuffered channel this waits until the control loop has
    /// received the value; otherwise it waits only for buffer space.
    /// Returns [`ResponderError::SignalClosed`] once the responder has been
    /// closed, including when the send was already waiting at that moment.
    pub async fn send(&self, signal: Signal) -> Result<(), ResponderError> {
        if !self.handoff {
            return self
                .tx
                .send(Envelope { signal, ack: None })
                .await
                .map_err(|_| ResponderError::SignalClosed);
        }

        let (ack, received) = oneshot::channel();
        self.tx
            .send(Envelope {
                signal,
                ack: Some(ack),
            })
            .await
            .map_err(|_| ResponderError::SignalClosed)?;
        // A close that discards the envelope drops the ack sender.
        received.await.map_err(|_| ResponderError::SignalClosed)
    }

    pub async fn ready(&self) -> Result<(), ResponderError> {
        self.send(Signal::Ready).await
    }

    pub async fn progress(&self, value: f64) -> Result<(), ResponderError> {
        self.send(Signal::Progress(value)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the responder closes the channel.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct SignalReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl SignalReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Signal> {
        let envelope = self.rx.recv().await?;
        if let Some(ack) = envelope.ack {
            // The sender may have given up waiting; the value still counts.
            let _ = ack.send(());
        }
        Some(envelope.signal)
    }

    /// Close the channel and drop anything still buffered.
    ///
    /// Returns the number of signals that were never delivered. Senders
    /// waiting on a handoff for a discarded signal get `SignalClosed`.
    pub(crate) fn close(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Create a signal channel holding up to `capacity` unread signals.
///
/// A capacity of zero gives a synchronous handoff: one envelope slot, with
/// each send completing only when the receiver acknowledges it.
pub(crate) fn channel(capacity: usize) -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        SignalSender {
            tx,
            handoff: capacity == 0,
        },
        SignalReceiver { rx },
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
