//! webrtc-rs backed peer session.
//!
//! One `WebRtcEndpoint` wraps one `RTCPeerConnection` for one connection
//! attempt. Besides the session-description operations used by the
//! negotiation state machine it wires up:
//! - the inbound video track -> sample reassembly -> frame queue
//! - the `keepalive` data channel, echoing a fixed reply to every message
//! - connection-state monitoring that marks the session failed

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::consume::SampleAssembler;
use super::negotiate::PeerEndpoint;
use super::verify::{parse_sdp_fingerprints, select_verifier, PeerParameters};
use super::{RtcConfig, RtcShared};
use crate::frame::decode_frame;

const KEEPALIVE_CHANNEL: &str = "keepalive";
const KEEPALIVE_REPLY: &str = "pong";

pub(crate) struct WebRtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    gather_bound: std::time::Duration,
    gather_poll: std::time::Duration,
}

impl WebRtcEndpoint {
    /// Build a fresh peer session with track, data-channel, and state
    /// handlers attached. Negotiation state never survives an attempt;
    /// the fallback branch constructs a new endpoint.
    pub(crate) async fn connect(config: &RtcConfig, shared: Arc<RtcShared>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: if config.ice_servers.is_empty() {
                vec![]
            } else {
                vec![RTCIceServer {
                    urls: config.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let track_shared = shared.clone();
        let max_sample_bytes = config.max_sample_bytes;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let shared = track_shared.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Video {
                        return;
                    }
                    info!("inbound video track established");
                    tokio::spawn(consume_track(track, shared, max_sample_bytes));
                })
            },
        ));

        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            Box::pin(async move {
                if channel.label() != KEEPALIVE_CHANNEL {
                    return;
                }
                debug!("keepalive channel opened");
                let echo = channel.clone();
                channel.on_message(Box::new(move |_message: DataChannelMessage| {
                    let echo = echo.clone();
                    Box::pin(async move {
                        if let Err(err) = echo.send_text(KEEPALIVE_REPLY).await {
                            debug!("keepalive reply failed: {}", err);
                        }
                    })
                }));
            })
        }));

        let state_shared = shared.clone();
        let state_pc = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let shared = state_shared.clone();
            let weak_pc = state_pc.clone();
            Box::pin(async move {
                debug!("peer connection state: {}", state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        let Some(pc) = weak_pc.upgrade() else {
                            return;
                        };
                        if let Err(err) = verify_peer_identity(&pc).await {
                            warn!("peer identity validation failed: {:#}", err);
                            shared.mark_session_failed();
                        }
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected => {
                        shared.mark_session_failed();
                    }
                    _ => {}
                }
            })
        }));

        Ok(Self {
            pc,
            gather_bound: config.gather_bound,
            gather_poll: config.gather_poll,
        })
    }

    /// Bounded wait for local candidate gathering; trickle is not used by
    /// either signaling protocol, so the SDP must carry the candidates.
    async fn wait_for_gathering(&self) {
        let deadline = Instant::now() + self.gather_bound;
        while self.pc.ice_gathering_state() != RTCIceGatheringState::Complete
            && Instant::now() < deadline
        {
            tokio::time::sleep(self.gather_poll).await;
        }
    }

    async fn local_sdp(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| anyhow!("local description unavailable"))
    }
}

impl PeerEndpoint for WebRtcEndpoint {
    async fn apply_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())?;
        self.pc.set_remote_description(offer).await?;
        Ok(())
    }

    async fn create_local_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.wait_for_gathering().await;
        self.local_sdp().await
    }

    async fn prepare_receive_only(&self) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_local_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.wait_for_gathering().await;
        self.local_sdp().await
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!("session close error: {}", err);
        }
    }
}

/// Validate the connected peer against the fingerprints it advertised.
///
/// The verification strategy is picked per certificate encoding; a miss
/// fails the session, not the engine. Sessions where the certificate or
/// the fingerprints are not observable are left alone.
async fn verify_peer_identity(pc: &RTCPeerConnection) -> Result<()> {
    let Some(description) = pc.remote_description().await else {
        return Ok(());
    };
    let fingerprints = parse_sdp_fingerprints(&description.sdp);
    if fingerprints.is_empty() {
        return Ok(());
    }
    let certificate = pc.sctp().transport().get_remote_certificate().await;
    if certificate.is_empty() {
        return Ok(());
    }
    let verifier = select_verifier(&certificate);
    verifier.validate(&PeerParameters {
        certificate_der: certificate.to_vec(),
        fingerprints,
    })
}

/// Pull RTP until the track ends or stop is requested, reassembling
/// samples on the marker bit. Undecodable samples are logged and skipped;
/// they never stop the loop.
async fn consume_track(track: Arc<TrackRemote>, shared: Arc<RtcShared>, max_sample_bytes: usize) {
    let mut assembler = SampleAssembler::new(max_sample_bytes);
    loop {
        if shared.stop_requested() {
            break;
        }
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                let Some((sample, pts)) = assembler.push(
                    &packet.payload,
                    packet.header.timestamp,
                    packet.header.marker,
                ) else {
                    continue;
                };
                shared.observe_pts(pts);
                match decode_frame(&sample, Some(pts)) {
                    Ok(frame) => shared.queue.push_latest(frame),
                    Err(err) => debug!("media sample decode failed: {:#}", err),
                }
            }
            Err(err) => {
                debug!("video track ended: {}", err);
                break;
            }
        }
    }
}
