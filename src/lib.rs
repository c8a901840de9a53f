//! ndt-responder -- per-test ephemeral server lifecycle coordination.
//!
//! A [`TestResponder`] starts a short-lived HTTP(S) server on an
//! OS-assigned port, hands the protocol handler a [`SignalSender`] for
//! readiness and progress values, and tears every resource down again on
//! [`TestResponder::close`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum::{routing::get, Extension, Router};
//! use ndt_responder::{ResponderConfig, Signal, SignalSender, TestResponder};
//!
//! # async fn run() -> Result<(), ndt_responder::ResponderError> {
//! let router = Router::new().route(
//!     "/ndt_protocol",
//!     get(|Extension(signals): Extension<SignalSender>| async move {
//!         let _ = signals.ready().await;
//!         "ok"
//!     }),
//! );
//!
//! let mut responder = TestResponder::new(Arc::new(ResponderConfig::plain()));
//! responder.start(router, "s2c").await?;
//! println!("listening on port {:?}", responder.port());
//!
//! if responder.recv().await == Some(Signal::Ready) {
//!     // drive the test...
//! }
//! responder.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod responder;
mod serve;
pub mod signal;
pub mod tls;
pub mod upgrader;

pub use config::ResponderConfig;
pub use error::ResponderError;
pub use listener::{bind_random, RawListener};
pub use responder::TestResponder;
pub use signal::{Signal, SignalSender, READY_VALUE};
pub use upgrader::{make_ndt_upgrader, OriginPolicy, UpgraderConfig};
