//! Negotiation state machine.
//!
//! `idle -> custom-attempt -> whep-attempt -> connected -> terminal`
//!
//! The server-offer (custom JSON) protocol is attempted first; any
//! deviation (wrong status, wrong message type, malformed body, endpoint
//! error) soft-fails that branch only. The fallback discards the session
//! state entirely and retries with a fresh session using the client-offer
//! (WHEP-style) protocol. Both branches failing is terminal for the
//! connection attempt, never a crash.
//!
//! The machine is generic over `PeerEndpoint` (session operations) and
//! talks to the wire through `SignalingClient`, so every transition is
//! testable without a network.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::future::Future;
use std::sync::Arc;

use super::signaling::{AnswerMessage, OfferMessage, SessionRequest, SignalingClient, SignalingReply};
use super::verify::parse_sdp_fingerprints;

/// Session-description operations on one connection attempt. A failed
/// attempt discards the endpoint; fallback always starts from a fresh one.
pub(crate) trait PeerEndpoint {
    /// Apply the remote side's offer as the remote description.
    fn apply_remote_offer(&self, sdp: &str) -> impl Future<Output = Result<()>> + Send;

    /// Synthesize the local answer, waiting (bounded) for candidate
    /// gathering, and return its SDP.
    fn create_local_answer(&self) -> impl Future<Output = Result<String>> + Send;

    /// Attach a receive-only video transceiver (client-offer branch).
    fn prepare_receive_only(&self) -> impl Future<Output = Result<()>> + Send;

    /// Synthesize the local offer, waiting (bounded) for candidate
    /// gathering, and return its SDP.
    fn create_local_offer(&self) -> impl Future<Output = Result<String>> + Send;

    /// Apply the remote side's answer as the remote description.
    fn apply_remote_answer(&self, sdp: &str) -> impl Future<Output = Result<()>> + Send;

    /// Close the underlying session.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NegotiationPhase {
    Idle,
    CustomAttempt,
    WhepAttempt,
    Connected,
    Terminal,
}

pub(crate) struct Negotiator {
    signaling: Arc<dyn SignalingClient>,
    ice_servers: Vec<String>,
    phase: NegotiationPhase,
    session_id: Option<String>,
}

impl Negotiator {
    pub(crate) fn new(signaling: Arc<dyn SignalingClient>, ice_servers: Vec<String>) -> Self {
        Self {
            signaling,
            ice_servers,
            phase: NegotiationPhase::Idle,
            session_id: None,
        }
    }

    pub(crate) fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Session id assigned by the server-offer protocol; `None` when the
    /// session was established through the client-offer fallback.
    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Drive the state machine to `connected` or `terminal`, creating a
    /// fresh endpoint per attempt via `fresh_endpoint`.
    pub(crate) async fn establish<E, F, Fut>(&mut self, mut fresh_endpoint: F) -> Result<E>
    where
        E: PeerEndpoint,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<E>>,
    {
        self.phase = NegotiationPhase::CustomAttempt;
        let endpoint = match fresh_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.phase = NegotiationPhase::Terminal;
                return Err(err.context("create session for server-offer attempt"));
            }
        };
        match self.custom_branch(&endpoint).await {
            Ok(()) => {
                self.phase = NegotiationPhase::Connected;
                return Ok(endpoint);
            }
            Err(err) => {
                info!(
                    "server-offer signaling failed ({:#}); falling back to client-offer",
                    err
                );
                endpoint.close().await;
                self.session_id = None;
            }
        }

        self.phase = NegotiationPhase::WhepAttempt;
        let endpoint = match fresh_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.phase = NegotiationPhase::Terminal;
                return Err(err.context("create session for client-offer attempt"));
            }
        };
        match self.whep_branch(&endpoint).await {
            Ok(()) => {
                self.phase = NegotiationPhase::Connected;
                Ok(endpoint)
            }
            Err(err) => {
                endpoint.close().await;
                self.phase = NegotiationPhase::Terminal;
                Err(err.context("both negotiation protocols failed"))
            }
        }
    }

    /// Server-offer protocol: request, receive offer + session id, post
    /// the local answer back keyed by that id.
    async fn custom_branch<E: PeerEndpoint>(&mut self, endpoint: &E) -> Result<()> {
        let request = serde_json::to_value(SessionRequest::new(&self.ice_servers))
            .context("encode session request")?;
        let reply = self.post_json(request).await?;
        if reply.status != 200 {
            return Err(anyhow!("session request returned status {}", reply.status));
        }

        let offer: OfferMessage =
            serde_json::from_str(&reply.body).context("parse session response")?;
        if offer.kind != "offer" {
            return Err(anyhow!("expected offer, got message type '{}'", offer.kind));
        }
        let session_id = offer.id.ok_or_else(|| anyhow!("offer missing session id"))?;
        let sdp = offer.sdp.ok_or_else(|| anyhow!("offer missing sdp"))?;
        if parse_sdp_fingerprints(&sdp).is_empty() {
            return Err(anyhow!("remote offer advertises no transport fingerprint"));
        }
        debug!("server offer received for session {}", session_id);

        endpoint.apply_remote_offer(&sdp).await?;
        let answer = endpoint.create_local_answer().await?;

        let payload = serde_json::to_value(AnswerMessage::new(&session_id, &answer))
            .context("encode answer message")?;
        let reply = self.post_json(payload).await?;
        if reply.status != 200 {
            return Err(anyhow!("answer post returned status {}", reply.status));
        }
        self.session_id = Some(session_id);
        Ok(())
    }

    /// Client-offer protocol: receive-only transceiver, post the raw
    /// offer SDP, apply the returned answer.
    async fn whep_branch<E: PeerEndpoint>(&mut self, endpoint: &E) -> Result<()> {
        endpoint.prepare_receive_only().await?;
        let offer = endpoint.create_local_offer().await?;

        let reply = self.post_sdp(offer).await?;
        if reply.status != 200 && reply.status != 201 {
            return Err(anyhow!("offer post returned status {}", reply.status));
        }
        if reply.body.trim().is_empty() {
            return Err(anyhow!("empty answer description"));
        }
        endpoint.apply_remote_answer(&reply.body).await
    }

    async fn post_json(&self, payload: serde_json::Value) -> Result<SignalingReply> {
        let signaling = self.signaling.clone();
        tokio::task::spawn_blocking(move || signaling.post_json(&payload))
            .await
            .context("signaling task aborted")?
    }

    async fn post_sdp(&self, sdp: String) -> Result<SignalingReply> {
        let signaling = self.signaling.clone();
        tokio::task::spawn_blocking(move || signaling.post_sdp(&sdp))
            .await
            .context("signaling task aborted")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const OFFER_SDP: &str = "v=0\r\na=fingerprint:sha-256 AA:BB:CC\r\nm=video 9\r\n";

    #[derive(Default)]
    struct ScriptedSignaling {
        json_replies: Mutex<VecDeque<SignalingReply>>,
        sdp_reply: Option<SignalingReply>,
        json_calls: Mutex<Vec<serde_json::Value>>,
        sdp_calls: Mutex<Vec<String>>,
    }

    impl ScriptedSignaling {
        fn push_json(&self, status: u16, body: &str) {
            self.json_replies.lock().unwrap().push_back(SignalingReply {
                status,
                body: body.to_string(),
            });
        }
    }

    impl SignalingClient for ScriptedSignaling {
        fn post_json(&self, payload: &serde_json::Value) -> Result<SignalingReply> {
            self.json_calls.lock().unwrap().push(payload.clone());
            self.json_replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("unexpected json post"))
        }

        fn post_sdp(&self, sdp: &str) -> Result<SignalingReply> {
            self.sdp_calls.lock().unwrap().push(sdp.to_string());
            self.sdp_reply
                .clone()
                .ok_or_else(|| anyhow!("unexpected sdp post"))
        }
    }

    #[derive(Default)]
    struct EndpointLog {
        created: usize,
        closed: usize,
        remote_offers: Vec<String>,
        remote_answers: Vec<String>,
        recv_only: usize,
    }

    struct MockEndpoint {
        log: Arc<Mutex<EndpointLog>>,
    }

    impl MockEndpoint {
        fn fresh(log: &Arc<Mutex<EndpointLog>>) -> Self {
            log.lock().unwrap().created += 1;
            Self { log: log.clone() }
        }
    }

    impl PeerEndpoint for MockEndpoint {
        async fn apply_remote_offer(&self, sdp: &str) -> Result<()> {
            self.log.lock().unwrap().remote_offers.push(sdp.to_string());
            Ok(())
        }

        async fn create_local_answer(&self) -> Result<String> {
            Ok("v=0\r\nlocal-answer\r\n".to_string())
        }

        async fn prepare_receive_only(&self) -> Result<()> {
            self.log.lock().unwrap().recv_only += 1;
            Ok(())
        }

        async fn create_local_offer(&self) -> Result<String> {
            Ok("v=0\r\nlocal-offer\r\n".to_string())
        }

        async fn apply_remote_answer(&self, sdp: &str) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .remote_answers
                .push(sdp.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.log.lock().unwrap().closed += 1;
        }
    }

    fn offer_body() -> String {
        serde_json::json!({ "type": "offer", "id": "srv-1", "sdp": OFFER_SDP }).to_string()
    }

    #[tokio::test]
    async fn server_offer_success_never_attempts_fallback() {
        let signaling = Arc::new(ScriptedSignaling::default());
        signaling.push_json(200, &offer_body());
        signaling.push_json(200, "{}");

        let log = Arc::new(Mutex::new(EndpointLog::default()));
        let mut negotiator = Negotiator::new(signaling.clone(), vec![]);
        negotiator
            .establish(|| {
                let log = log.clone();
                async move { Ok(MockEndpoint::fresh(&log)) }
            })
            .await
            .expect("custom branch succeeds");

        assert_eq!(negotiator.phase(), NegotiationPhase::Connected);
        let log = log.lock().unwrap();
        assert_eq!(log.created, 1);
        assert_eq!(log.remote_offers, vec![OFFER_SDP.to_string()]);
        // The client-offer protocol was never touched.
        assert!(signaling.sdp_calls.lock().unwrap().is_empty());
        assert_eq!(log.recv_only, 0);

        // Answer went back keyed by the server-issued session id.
        let calls = signaling.json_calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1]["type"], "answer");
        assert_eq!(calls[1]["id"], "srv-1");
    }

    #[tokio::test]
    async fn non_offer_response_falls_back_to_whep_with_fresh_session() {
        let mut signaling = ScriptedSignaling::default();
        signaling.sdp_reply = Some(SignalingReply {
            status: 201,
            body: "v=0\r\nremote-answer\r\n".to_string(),
        });
        let signaling = Arc::new(signaling);
        signaling.push_json(200, &serde_json::json!({ "type": "busy" }).to_string());

        let log = Arc::new(Mutex::new(EndpointLog::default()));
        let mut negotiator = Negotiator::new(signaling.clone(), vec![]);
        negotiator
            .establish(|| {
                let log = log.clone();
                async move { Ok(MockEndpoint::fresh(&log)) }
            })
            .await
            .expect("fallback succeeds");

        assert_eq!(negotiator.phase(), NegotiationPhase::Connected);
        let log = log.lock().unwrap();
        // Failed attempt discarded; fallback used a fresh session.
        assert_eq!(log.created, 2);
        assert_eq!(log.closed, 1);
        assert_eq!(log.recv_only, 1);
        assert_eq!(log.remote_answers, vec!["v=0\r\nremote-answer\r\n".to_string()]);
    }

    #[tokio::test]
    async fn non_success_status_also_falls_back() {
        let mut signaling = ScriptedSignaling::default();
        signaling.sdp_reply = Some(SignalingReply {
            status: 200,
            body: "v=0\r\nremote-answer\r\n".to_string(),
        });
        let signaling = Arc::new(signaling);
        signaling.push_json(503, "service unavailable");

        let log = Arc::new(Mutex::new(EndpointLog::default()));
        let mut negotiator = Negotiator::new(signaling, vec![]);
        negotiator
            .establish(|| {
                let log = log.clone();
                async move { Ok(MockEndpoint::fresh(&log)) }
            })
            .await
            .expect("fallback succeeds");
        assert_eq!(log.lock().unwrap().created, 2);
    }

    #[tokio::test]
    async fn offer_without_fingerprint_soft_fails_custom_branch() {
        let mut signaling = ScriptedSignaling::default();
        signaling.sdp_reply = Some(SignalingReply {
            status: 200,
            body: "v=0\r\nremote-answer\r\n".to_string(),
        });
        let signaling = Arc::new(signaling);
        let bare = serde_json::json!({ "type": "offer", "id": "srv-2", "sdp": "v=0\r\n" });
        signaling.push_json(200, &bare.to_string());

        let log = Arc::new(Mutex::new(EndpointLog::default()));
        let mut negotiator = Negotiator::new(signaling, vec![]);
        negotiator
            .establish(|| {
                let log = log.clone();
                async move { Ok(MockEndpoint::fresh(&log)) }
            })
            .await
            .expect("fallback succeeds");

        // The unverifiable offer was never applied to a session.
        assert!(log.lock().unwrap().remote_offers.is_empty());
    }

    #[tokio::test]
    async fn both_branches_failing_is_terminal() {
        let signaling = Arc::new(ScriptedSignaling::default());
        signaling.push_json(404, "not found");
        // sdp_reply stays None: WHEP post errors too.

        let log = Arc::new(Mutex::new(EndpointLog::default()));
        let mut negotiator = Negotiator::new(signaling, vec![]);
        let result = negotiator
            .establish(|| {
                let log = log.clone();
                async move { Ok(MockEndpoint::fresh(&log)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(negotiator.phase(), NegotiationPhase::Terminal);
        let log = log.lock().unwrap();
        assert_eq!(log.created, 2);
        assert_eq!(log.closed, 2);
    }
}
