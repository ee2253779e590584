//! Signaling transport for the negotiation engine.
//!
//! Two wire shapes against the same endpoint URL:
//! - server-offer custom signaling: JSON request/offer/answer messages
//! - client-offer (WHEP-style) signaling: raw SDP bodies with
//!   `application/sdp` content type
//!
//! `SignalingClient` is the seam between the state machine and the
//! network; tests substitute it wholesale, so negotiation logic is
//! exercised without sockets.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Status and body of one signaling exchange. Non-success statuses are
/// returned here (not as errors) so branch logic can inspect them.
#[derive(Clone, Debug)]
pub struct SignalingReply {
    pub status: u16,
    pub body: String,
}

/// Blocking signaling transport. Invoked off the async worker via
/// `spawn_blocking`.
pub trait SignalingClient: Send + Sync {
    /// POST a JSON message, returning the response status and body.
    fn post_json(&self, payload: &serde_json::Value) -> Result<SignalingReply>;

    /// POST a raw session description (`application/sdp`).
    fn post_sdp(&self, sdp: &str) -> Result<SignalingReply>;
}

/// `ureq`-backed signaling client.
pub struct HttpSignaling {
    url: String,
    agent: ureq::Agent,
}

impl HttpSignaling {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout_read(timeout)
                .build(),
        }
    }

    fn reply_from(result: std::result::Result<ureq::Response, ureq::Error>) -> Result<SignalingReply> {
        let response = match result {
            Ok(response) => response,
            // HTTP-level non-success is a reply for the state machine to
            // judge, not a transport error.
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => return Err(anyhow!("signaling transport error: {}", err)),
        };
        let status = response.status();
        let body = response
            .into_string()
            .context("read signaling response body")?;
        Ok(SignalingReply { status, body })
    }
}

impl SignalingClient for HttpSignaling {
    fn post_json(&self, payload: &serde_json::Value) -> Result<SignalingReply> {
        Self::reply_from(self.agent.post(&self.url).send_json(payload.clone()))
    }

    fn post_sdp(&self, sdp: &str) -> Result<SignalingReply> {
        Self::reply_from(
            self.agent
                .post(&self.url)
                .set("Content-Type", "application/sdp")
                .send_string(sdp),
        )
    }
}

/// Opening message of the server-offer protocol.
#[derive(Debug, Serialize)]
pub(crate) struct SessionRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    res: Option<String>,
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServerEntry>,
    #[serde(rename = "keepAlive")]
    keep_alive: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct IceServerEntry {
    urls: Vec<String>,
}

impl SessionRequest {
    pub(crate) fn new(ice_servers: &[String]) -> Self {
        Self {
            kind: "request",
            res: None,
            ice_servers: vec![IceServerEntry {
                urls: ice_servers.to_vec(),
            }],
            keep_alive: true,
        }
    }
}

/// Expected response to a `SessionRequest`: a remote offer keyed by a
/// server-issued session identifier.
#[derive(Debug, Deserialize)]
pub(crate) struct OfferMessage {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) id: Option<String>,
    pub(crate) sdp: Option<String>,
}

/// Local answer posted back, keyed by the server's session identifier.
#[derive(Debug, Serialize)]
pub(crate) struct AnswerMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    sdp: &'a str,
}

impl<'a> AnswerMessage<'a> {
    pub(crate) fn new(id: &'a str, sdp: &'a str) -> Self {
        Self {
            kind: "answer",
            id,
            sdp,
        }
    }
}
