//! Websocket upgrade settings for NDT protocol handlers.

use axum::extract::ws::WebSocketUpgrade;
use axum::http::header::{HOST, ORIGIN};
use axum::http::{HeaderMap, StatusCode};

/// Read and write buffer size used by NDT websocket connections.
pub const NDT_BUFFER_SIZE: usize = 81920;

/// Which `Origin` headers an upgrade accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OriginPolicy {
    /// Accept any origin. Needed by the browser widget served from
    /// elsewhere; revisit before exposing a responder publicly.
    #[default]
    AcceptAll,
    /// Accept requests without an `Origin` header, or whose origin host
    /// matches the `Host` header.
    SameHost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgraderConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub subprotocols: Vec<String>,
    /// Always false; axum's websocket has no permessage-deflate support.
    pub enable_compression: bool,
    pub origin_policy: OriginPolicy,
}

/// Upgrade settings for the NDT legacy protocol: fixed 81920-byte buffers,
/// no compression, every origin accepted.
pub fn make_ndt_upgrader<I, S>(subprotocols: I) -> UpgraderConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    UpgraderConfig {
        read_buffer_size: NDT_BUFFER_SIZE,
        write_buffer_size: NDT_BUFFER_SIZE,
        subprotocols: subprotocols.into_iter().map(Into::into).collect(),
        enable_compression: false,
        origin_policy: OriginPolicy::AcceptAll,
    }
}

impl UpgraderConfig {
    pub fn with_origin_policy(mut self, policy: OriginPolicy) -> Self {
        self.origin_policy = policy;
        self
    }

    pub fn check_origin(&self, headers: &HeaderMap) -> bool {
        match self.origin_policy {
            OriginPolicy::AcceptAll => true,
            OriginPolicy::SameHost => {
                let Some(origin) = headers.get(ORIGIN) else {
                    return true;
                };
                let (Ok(origin), Some(Ok(host))) =
                    (origin.to_str(), headers.get(HOST).map(|h| h.to_str()))
                else {
                    return false;
                };
                let origin_host = origin.split_once("://").map_or(origin, |(_, rest)| rest);
                origin_host.eq_ignore_ascii_case(host)
            }
        }
    }

    /// Apply buffer sizes and subprotocols to a pending upgrade.
    pub fn apply(&self, ws: WebSocketUpgrade) -> WebSocketUpgrade {
        ws.read_buffer_size(self.read_buffer_size)
            .write_buffer_size(self.write_buffer_size)
            .protocols(self.subprotocols.clone())
    }

    /// Check the origin and configure the upgrade, or reject with 403.
    pub fn negotiate(
        &self,
        ws: WebSocketUpgrade,
        headers: &HeaderMap,
    ) -> Result<WebSocketUpgrade, StatusCode> {
        if !self.check_origin(headers) {
            tracing::debug!(origin = ?headers.get(ORIGIN), "rejecting websocket origin");
            return Err(StatusCode::FORBIDDEN);
        }
        Ok(self.apply(ws))
    }
}
