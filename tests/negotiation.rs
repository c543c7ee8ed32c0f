
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use client::{
    ClientConfig, ClientError, ClientEvent, EventHandlers, PlaybackOptions, RemoteStream,
    VideoSink, WebRtcClient,
};
use mock_server::{init_tracing, MockPeer, MockServer, STEP_TIMEOUT};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use webrtc::webrtc_rs::api::interceptor_registry::register_default_interceptors;
use webrtc::webrtc_rs::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::webrtc_rs::api::setting_engine::SettingEngine;
use webrtc::webrtc_rs::api::APIBuilder;
use webrtc::webrtc_rs::data_channel::RTCDataChannel;
use webrtc::webrtc_rs::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::webrtc_rs::interceptor::registry::Registry;
use webrtc::webrtc_rs::media::Sample;
use webrtc::webrtc_rs::peer_connection::configuration::RTCConfiguration;
use webrtc::webrtc_rs::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::webrtc_rs::peer_connection::RTCPeerConnection;
use webrtc::webrtc_rs::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::webrtc_rs::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::webrtc_rs::track::track_local::TrackLocal;

/// SPS・PPS・IDR スライスを並べた最小のアクセスユニット
const H264_ACCESS_UNIT: &[u8] = &[
    0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f, 0xe9, 0x02, 0xc1, 0x2c, 0x80, //
    0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x06, 0xe2, //
    0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, 0x33, 0xff, 0xfe, 0xf6, 0xf0,
];

/// 映像トラックとDataChannelを送る側（メディアサーバー役）
struct MediaServer {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    channel: Arc<RTCDataChannel>,
    channel_open: UnboundedReceiver<()>,
}

async fn media_server_peer() -> Result<MediaServer> {
    let mut m = MediaEngine::default();
    m.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut m)?;

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_include_loopback_candidate(true);

    let api = APIBuilder::new()
        .with_media_engine(m)
        .with_setting_engine(setting_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_string(),
        "analyzer".to_string(),
    ));
    pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    let channel = pc.create_data_channel("jpeg_frames", None).await?;
    let (open_tx, channel_open) = mpsc::unbounded_channel();
    channel.on_open(Box::new(move || {
        let _ = open_tx.send(());
        Box::pin(async {})
    }));

    Ok(MediaServer {
        pc,
        track,
        channel,
        channel_open,
    })
}

/// ICE収集を待ってから offer SDP を返す
async fn create_offer(pc: &RTCPeerConnection) -> Result<String> {
    let offer = pc.create_offer(None).await?;
    let mut gathering = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await?;
    let _ = timeout(STEP_TIMEOUT, gathering.recv()).await;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("offerer has no local description"))?;
    Ok(local.sdp)
}

/// 映像セクションの方向だけを inactive にする
fn inactivate_video(sdp: &str) -> String {
    sdp.split_inclusive("m=")
        .map(|section| {
            if section.starts_with("video ") {
                section.replace("a=sendrecv", "a=inactive")
            } else {
                section.to_string()
            }
        })
        .collect()
}

/// answer を受け取るまで読み進める（途中のローカル候補も返す）
async fn receive_answer(peer: &mut MockPeer) -> Result<(String, Vec<Value>)> {
    let mut candidates = Vec::new();
    loop {
        let message = peer.next_json().await?;
        match message["type"].as_str() {
            Some("answer") => {
                assert_eq!(message["data"]["type"], "answer");
                let sdp = message["data"]["sdp"].as_str().unwrap_or_default().to_string();
                return Ok((sdp, candidates));
            }
            Some("ice_candidate") => candidates.push(message),
            _ => {}
        }
    }
}

async fn add_candidate(pc: &RTCPeerConnection, message: &Value) -> Result<()> {
    let data = &message["data"];
    let candidate = data["candidate"].as_str().unwrap_or_default();
    if candidate.is_empty() {
        return Ok(());
    }
    pc.add_ice_candidate(RTCIceCandidateInit {
        candidate: candidate.to_string(),
        sdp_mid: data["sdpMid"].as_str().map(str::to_string),
        sdp_mline_index: data["sdpMLineIndex"].as_u64().map(|i| i as u16),
        username_fragment: None,
    })
    .await?;
    Ok(())
}

/// offer を送り、answer とクライアントの候補を送信側に渡す
async fn negotiate(peer: &mut MockPeer, server: &MediaServer) -> Result<String> {
    let offer_sdp = create_offer(&server.pc).await?;
    peer.send_json(json!({
        "type": "offer",
        "data": {"type": "offer", "sdp": offer_sdp}
    }))
    .await?;

    let (answer_sdp, candidates) = receive_answer(peer).await?;
    server
        .pc
        .set_remote_description(RTCSessionDescription::answer(answer_sdp.clone())?)
        .await?;
    for candidate in &candidates {
        add_candidate(&server.pc, candidate).await?;
    }
    // 収集の遅い候補も拾う
    while let Ok(Some(message)) = peer.next_json_within(Duration::from_millis(500)).await {
        if message["type"] == "ice_candidate" {
            add_candidate(&server.pc, &message).await?;
        }
    }
    Ok(answer_sdp)
}

/// RTPが流れるまで映像サンプルを送り続ける
fn spawn_video_feed(track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(33));
        loop {
            tick.tick().await;
            let sample = Sample {
                data: Bytes::from_static(H264_ACCESS_UNIT),
                duration: Duration::from_millis(33),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("video feed write failed: {}", e);
            }
        }
    })
}

/// 長さヘッダ付きで1メッセージに収めたフレーム
fn framed(payload: &[u8]) -> Bytes {
    let mut data = (payload.len() as u32).to_be_bytes().to_vec();
    data.extend_from_slice(payload);
    Bytes::from(data)
}

fn jpeg_payload(len: usize, fill: u8) -> Vec<u8> {
    let mut payload = vec![fill; len];
    payload[..2].copy_from_slice(&[0xFF, 0xD8]);
    payload[len - 2..].copy_from_slice(&[0xFF, 0xD9]);
    payload
}

/// 割り当てられたストリームをチャネルに流すシンク
struct ChannelSink {
    attached: UnboundedSender<RemoteStream>,
}

#[async_trait]
impl VideoSink for ChannelSink {
    fn attach(&self, stream: RemoteStream) {
        let _ = self.attached.send(stream);
    }

    async fn play(&self, _options: PlaybackOptions) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn next_event(events: &mut UnboundedReceiver<ClientEvent>) -> Result<ClientEvent> {
    timeout(STEP_TIMEOUT, events.recv())
        .await
        .map_err(|_| anyhow!("timed out waiting for client event"))?
        .ok_or_else(|| anyhow!("event channel closed"))
}

/// 接続して auth_success まで進めたクライアント
async fn authenticated_client(
    server: &mut MockServer,
    client_id: &str,
) -> Result<(WebRtcClient, UnboundedReceiver<ClientEvent>, MockPeer)> {
    let client = WebRtcClient::new(ClientConfig::new(server.url.clone()));
    let (handlers, mut events) = EventHandlers::channel();
    client.set_event_handlers(handlers);
    client.connect().await?;

    let mut peer = server.accept().await?;
    peer.authenticate(client_id).await?;
    assert!(matches!(next_event(&mut events).await?, ClientEvent::Connected));
    Ok((client, events, peer))
}

fn assert_no_negotiation_error(events: &mut UnboundedReceiver<ClientEvent>) {
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::Error(ClientError::Negotiation(_))),
            "unexpected negotiation error"
        );
    }
}

#[tokio::test]
async fn test_offer_answer_roundtrip_with_queued_candidates() -> Result<()> {
    init_tracing();
    let mut server = MockServer::start().await?;
    let (client, mut events, mut peer) = authenticated_client(&mut server, "c1").await?;

    assert!(client.request_video_stream(Some("camera_01".to_string())));
    let request = peer.expect_type("request_offer").await?;
    assert_eq!(request["data"]["source_id"], "camera_01");

    // offer より先に届く候補は溜められ、answer 後に適用される
    peer.send_json(json!({
        "type": "ice_candidate",
        "client_id": "c1",
        "data": {
            "candidate": "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }
    }))
    .await?;
    peer.send_json(json!({
        "type": "ice_candidate",
        "data": {"candidate": "", "sdpMid": null, "sdpMLineIndex": null}
    }))
    .await?;

    let offerer = media_server_peer().await?;
    let offer_sdp = create_offer(&offerer.pc).await?;
    peer.send_json(json!({
        "type": "offer",
        "client_id": "c1",
        "data": {"type": "offer", "sdp": offer_sdp}
    }))
    .await?;

    // ローカル候補は answer の前後どちらにも届きうる
    let (answer_sdp, mut local_candidates) = receive_answer(&mut peer).await?;
    assert!(answer_sdp.starts_with("v=0"));
    assert!(!answer_sdp.contains("a=inactive"));
    assert!(answer_sdp.contains("m=video"));
    assert!(!answer_sdp.contains("m=audio"));

    // 送信側が answer を受け入れられること
    offerer
        .pc
        .set_remote_description(RTCSessionDescription::answer(answer_sdp)?)
        .await?;

    let candidate = match local_candidates.pop() {
        Some(candidate) => candidate,
        None => peer.expect_type("ice_candidate").await?,
    };
    assert!(candidate["data"]["candidate"]
        .as_str()
        .unwrap_or_default()
        .starts_with("candidate:"));
    assert!(candidate["data"].get("sdpMid").is_some());
    assert!(candidate["data"].get("sdpMLineIndex").is_some());
    assert!(candidate["timestamp"].as_u64().is_some());

    // 交渉エラーは出ていない
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_no_negotiation_error(&mut events);

    client.disconnect().await;
    offerer.pc.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_inactive_video_offer_is_answered_recvonly() -> Result<()> {
    init_tracing();
    let mut server = MockServer::start().await?;
    let (client, mut events, mut peer) = authenticated_client(&mut server, "c3").await?;

    let offerer = media_server_peer().await?;
    let offer_sdp = inactivate_video(&create_offer(&offerer.pc).await?);
    assert_eq!(offer_sdp.matches("a=inactive").count(), 1);
    peer.send_json(json!({
        "type": "offer",
        "data": {"type": "offer", "sdp": offer_sdp}
    }))
    .await?;

    let (answer_sdp, _) = receive_answer(&mut peer).await?;
    assert!(!answer_sdp.contains("a=inactive"));
    assert!(answer_sdp.contains("a=recvonly"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_no_negotiation_error(&mut events);
    assert!(client.is_connected());

    client.disconnect().await;
    offerer.pc.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_media_reaches_sink_and_frame_callbacks() -> Result<()> {
    init_tracing();
    let mut server = MockServer::start().await?;

    let client = WebRtcClient::new(ClientConfig::new(server.url.clone()));
    let (handlers, mut events) = EventHandlers::channel();
    client.set_event_handlers(handlers);
    // シンクを先に登録しておく
    let (attached_tx, mut attached) = mpsc::unbounded_channel();
    client.set_sink(Arc::new(ChannelSink {
        attached: attached_tx,
    }));
    client.connect().await?;

    let mut peer = server.accept().await?;
    peer.authenticate("c4").await?;
    assert!(matches!(next_event(&mut events).await?, ClientEvent::Connected));

    let mut media = media_server_peer().await?;
    negotiate(&mut peer, &media).await?;
    let feed = spawn_video_feed(media.track.clone());

    timeout(STEP_TIMEOUT, media.channel_open.recv())
        .await
        .map_err(|_| anyhow!("data channel did not open"))?;
    // 受信側のメッセージハンドラ登録を待つ
    tokio::time::sleep(Duration::from_millis(200)).await;

    let small = jpeg_payload(100, 0xAB);
    media.channel.send(&framed(&small)).await?;

    // ヘッダのみ → ペイロードを2回に分けて送る
    let large = jpeg_payload(20_000, 0xCD);
    media
        .channel
        .send(&Bytes::copy_from_slice(&(large.len() as u32).to_be_bytes()))
        .await?;
    media
        .channel
        .send(&Bytes::copy_from_slice(&large[..12_000]))
        .await?;
    media
        .channel
        .send(&Bytes::copy_from_slice(&large[12_000..]))
        .await?;

    let mut frames = Vec::new();
    let mut stream = None;
    while frames.len() < 2 || stream.is_none() {
        match next_event(&mut events).await? {
            ClientEvent::JpegFrame(frame) => frames.push(frame),
            ClientEvent::VideoStream(s) => stream = Some(s),
            ClientEvent::Error(e) => bail!("unexpected client error: {}", e),
            _ => {}
        }
    }
    assert_eq!(&frames[0][..], &small[..]);
    assert_eq!(&frames[1][..], &large[..]);

    let stream = stream.ok_or_else(|| anyhow!("no video stream"))?;
    assert!(stream.track().is_some());
    let sunk = timeout(STEP_TIMEOUT, attached.recv())
        .await
        .map_err(|_| anyhow!("sink was not attached"))?
        .ok_or_else(|| anyhow!("sink channel closed"))?;
    assert_eq!(sunk, stream);
    assert!(attached.try_recv().is_err());

    feed.abort();
    client.disconnect().await;
    media.pc.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_sink_registered_after_track_still_attaches() -> Result<()> {
    init_tracing();
    let mut server = MockServer::start().await?;
    let (client, mut events, mut peer) = authenticated_client(&mut server, "c5").await?;

    let media = media_server_peer().await?;
    negotiate(&mut peer, &media).await?;
    let feed = spawn_video_feed(media.track.clone());

    let stream = loop {
        match next_event(&mut events).await? {
            ClientEvent::VideoStream(s) => break s,
            ClientEvent::Error(e) => bail!("unexpected client error: {}", e),
            _ => {}
        }
    };

    let (attached_tx, mut attached) = mpsc::unbounded_channel();
    client.set_sink(Arc::new(ChannelSink {
        attached: attached_tx,
    }));
    let sunk = timeout(STEP_TIMEOUT, attached.recv())
        .await
        .map_err(|_| anyhow!("sink was not attached"))?
        .ok_or_else(|| anyhow!("sink channel closed"))?;
    assert_eq!(sunk, stream);

    feed.abort();
    client.disconnect().await;
    media.pc.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_garbage_offer_reports_negotiation_error() -> Result<()> {
    init_tracing();
    let mut server = MockServer::start().await?;
    let (client, mut events, mut peer) = authenticated_client(&mut server, "c2").await?;

    peer.send_json(json!({"type": "offer", "data": {"type": "offer", "sdp": "not an sdp"}}))
        .await?;
    assert!(matches!(
        next_event(&mut events).await?,
        ClientEvent::Error(ClientError::Negotiation(_))
    ));

    // 接続は維持される
    assert!(client.is_connected());
    assert!(client.request_video_stream(None));
    peer.expect_type("request_offer").await?;

    client.disconnect().await;
    Ok(())
}
