use anyhow::{Context, Result};
use core_types::{ClientConfig, ConnectionState, IceCandidate, SignalingResponse, SignalingSender};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc_rs::api::interceptor_registry::register_default_interceptors;
use webrtc_rs::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc_rs::api::setting_engine::SettingEngine;
use webrtc_rs::api::APIBuilder;
use webrtc_rs::data_channel::data_channel_message::DataChannelMessage as RTCDataChannelMessage;
use webrtc_rs::data_channel::RTCDataChannel;
use webrtc_rs::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc_rs::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc_rs::ice_transport::ice_server::RTCIceServer;
use webrtc_rs::interceptor::registry::Registry;
use webrtc_rs::peer_connection::configuration::RTCConfiguration;
use webrtc_rs::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc_rs::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc_rs::peer_connection::RTCPeerConnection;
use webrtc_rs::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc_rs::rtp_transceiver::RTCPFeedback;
use webrtc_rs::stats::StatsReportType;
use webrtc_rs::track::track_remote::TrackRemote;

use crate::ice_queue::IceCandidateQueue;
use crate::media_sink::RemoteStream;
use crate::PeerEvent;

/// ICE接続後、受信統計をログに出すまでの待ち時間
const STATS_LOG_DELAY: Duration = Duration::from_secs(2);

/// 受信専用として扱うべきなのに inactive になった方向属性
const INACTIVE_DIRECTION: &str = "a=inactive";
const RECVONLY_DIRECTION: &str = "a=recvonly";

/// Answer SDP の `a=inactive` を全て `a=recvonly` に置き換える
///
/// 送信側がトラックを持たないと answer が inactive になり、映像が届かなくなる。
pub fn repair_answer_sdp(sdp: &str) -> String {
    let count = sdp.matches(INACTIVE_DIRECTION).count();
    if count == 0 {
        return sdp.to_string();
    }
    warn!("Answer SDP has {} inactive media section(s), rewriting to recvonly", count);
    sdp.replace(INACTIVE_DIRECTION, RECVONLY_DIRECTION)
}

/// 設定からICEサーバー一覧を作る
///
/// STUNが空ならホスト候補のみで接続する（TURNも使わない）。
pub fn ice_servers(config: &ClientConfig) -> Vec<RTCIceServer> {
    if config.stun_servers.is_empty() {
        if !config.turn_servers.is_empty() {
            debug!("No STUN servers configured, ignoring TURN servers");
        }
        return Vec::new();
    }

    let mut servers: Vec<RTCIceServer> = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    servers.extend(config.turn_servers.iter().map(|turn| RTCIceServer {
        urls: turn.urls.clone(),
        username: turn.username.clone().unwrap_or_default(),
        credential: turn.credential.clone().unwrap_or_default(),
        ..Default::default()
    }));

    servers
}

/// 受信する映像コーデックだけを登録したMediaEngine
fn video_media_engine() -> Result<MediaEngine> {
    let mut m = MediaEngine::default();

    let feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];

    let codecs = [
        (MIME_TYPE_H264, 102, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"),
        (MIME_TYPE_H264, 125, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
        (MIME_TYPE_H264, 123, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032"),
        (MIME_TYPE_VP8, 96, ""),
        (MIME_TYPE_VP9, 98, "profile-id=0"),
    ];

    for (mime_type, payload_type, fmtp) in codecs {
        m.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_owned(),
                    rtcp_feedback: feedback.clone(),
                },
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .with_context(|| format!("Failed to register codec {}", mime_type))?;
    }

    Ok(m)
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// 受信映像の統計を1回だけログに出す
async fn log_inbound_video_stats(pc: Weak<RTCPeerConnection>) {
    tokio::time::sleep(STATS_LOG_DELAY).await;
    let Some(pc) = pc.upgrade() else {
        return;
    };

    let stats = pc.get_stats().await;
    let mut inbound_logged = false;
    for report in stats.reports.values() {
        if let StatsReportType::InboundRTP(inbound) = report {
            if inbound.kind == "video" {
                info!(
                    "receiver stats: ssrc={} packets_received={} bytes_received={} nack={}",
                    inbound.ssrc, inbound.packets_received, inbound.bytes_received, inbound.nack_count,
                );
                inbound_logged = true;
            }
        }
    }
    if !inbound_logged {
        info!("receiver stats: inbound video RTP not found in get_stats");
    }
}

/// PeerConnectionの生成・SDP交渉・ICE候補の管理
pub struct PeerConnectionManager {
    peer_connection: Arc<RTCPeerConnection>,
    signaling: SignalingSender,
    ice_queue: IceCandidateQueue,
}

impl PeerConnectionManager {
    /// PeerConnectionを生成してイベントハンドラを登録する
    pub async fn new(
        config: &ClientConfig,
        signaling: SignalingSender,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut m = video_media_engine()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        // ループバック候補を含める（同一ホスト内接続を確実にするため）
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_include_loopback_candidate(true);

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .context("Failed to create peer connection")?,
        );
        info!("PeerConnection created");

        register_handlers(&pc, &signaling, &events);

        Ok(Self {
            peer_connection: pc,
            signaling,
            ice_queue: IceCandidateQueue::new(),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// 受信したofferに対してanswerを作り、シグナリングに送る
    pub async fn handle_offer(&mut self, sdp: String) -> Result<()> {
        info!("Offer received, generating answer");
        debug!("Offer SDP:\n{}", sdp);

        self.apply_remote_offer(sdp).await?;
        self.send_answer().await
    }

    /// リモート記述を設定し、溜めていたICE候補を受信順に適用する
    ///
    /// 以降の answer 生成が失敗しても候補は溜め続けない。
    async fn apply_remote_offer(&mut self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp).context("Failed to parse offer SDP")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let pending = self.ice_queue.drain();
        if !pending.is_empty() {
            info!("Applying {} queued ICE candidate(s)", pending.len());
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    /// answer を生成してローカルに設定し、補正したSDPを送る
    ///
    /// webrtc-rs は生成時と異なるSDPをローカル記述として受け付けないので、
    /// ローカルには生成したままの answer を設定し、送信するSDPだけを書き換える。
    async fn send_answer(&self) -> Result<()> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;

        let sdp = repair_answer_sdp(&answer.sdp);
        debug!("Answer SDP:\n{}", sdp);

        if self.signaling.send(SignalingResponse::Answer { sdp }) {
            info!("Answer sent to signaling server");
        }
        Ok(())
    }

    /// リモートICE候補を受け取る（リモート記述が未設定なら溜める）
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if candidate.is_end_of_candidates() {
            debug!("End-of-candidates marker received");
            return;
        }

        match self.ice_queue.defer(candidate) {
            Some(candidate) => self.apply_candidate(candidate).await,
            None => debug!(
                "Remote description not set, queued ICE candidate ({} pending)",
                self.ice_queue.len()
            ),
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        debug!("Adding ICE candidate: {}", candidate.candidate);
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
            warn!("Failed to add ICE candidate: {}", e);
        }
    }

    pub fn queued_candidates(&self) -> usize {
        self.ice_queue.len()
    }

    pub async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close PeerConnection: {}", e);
        } else {
            info!("PeerConnection closed");
        }
    }
}

fn register_handlers(
    pc: &Arc<RTCPeerConnection>,
    signaling: &SignalingSender,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    // ローカル候補は生成され次第そのまま送る
    let signaling_ice = signaling.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let signaling = signaling_ice.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!("ICE gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    debug!("Local ICE candidate: {}", init.candidate);
                    signaling.send(SignalingResponse::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
            }
        })
    }));

    let events_track = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let events = events_track.clone();
        Box::pin(async move {
            info!(
                "Track received: kind={} id={} stream={} codec={}",
                track.kind(),
                track.id(),
                track.stream_id(),
                track.codec().capability.mime_type
            );
            if track.kind() != RTPCodecType::Video {
                debug!("Ignoring non-video track");
                return;
            }
            let _ = events.send(PeerEvent::Track(RemoteStream::from_track(track)));
        })
    }));

    let events_dc = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let events = events_dc.clone();
        Box::pin(async move {
            let label = dc.label().to_string();
            info!("DataChannel opened: {}", label);
            let _ = events.send(PeerEvent::DataChannelOpened {
                label: label.clone(),
            });

            let events_msg = events.clone();
            dc.on_message(Box::new(move |msg: RTCDataChannelMessage| {
                let events = events_msg.clone();
                Box::pin(async move {
                    if msg.is_string {
                        debug!("Ignoring text data channel message ({} bytes)", msg.data.len());
                        return;
                    }
                    let _ = events.send(PeerEvent::DataChannelMessage(msg.data));
                })
            }));

            let label_err = label.clone();
            dc.on_error(Box::new(move |err| {
                let label = label_err.clone();
                Box::pin(async move {
                    error!("DataChannel {} error: {}", label, err);
                })
            }));

            dc.on_close(Box::new(move || {
                let label = label.clone();
                Box::pin(async move {
                    info!("DataChannel closed: {}", label);
                })
            }));
        })
    }));

    let events_state = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events_state.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Connected => info!("PeerConnection state: Connected"),
                RTCPeerConnectionState::Disconnected => {
                    warn!("PeerConnection state: Disconnected - Connection lost")
                }
                RTCPeerConnectionState::Failed => {
                    error!("PeerConnection state: Failed - Connection failed")
                }
                other => info!("PeerConnection state: {}", other),
            }
            if let Some(state) = map_peer_state(state) {
                let _ = events.send(PeerEvent::ConnectionState(state));
            }
        })
    }));

    let events_ice = events.clone();
    let pc_weak = Arc::downgrade(pc);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let events = events_ice.clone();
        let pc_weak = pc_weak.clone();
        Box::pin(async move {
            match state {
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    info!("ICE connection state: {}", state);
                    tokio::spawn(log_inbound_video_stats(pc_weak));
                }
                RTCIceConnectionState::Failed => {
                    error!("ICE connection state: Failed - ICE connection failed");
                    let _ = events.send(PeerEvent::IceFailed);
                }
                RTCIceConnectionState::Disconnected => {
                    warn!("ICE connection state: Disconnected - ICE connection lost")
                }
                other => info!("ICE connection state: {}", other),
            }
        })
    }));
}
