use core_types::{ClientConfig, ConnectionState, SignalingEvent, SignalingSender};
use parking_lot::RwLock;
use signaling::{SignalingConnection, SignalingTasks};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use webrtc::{FrameAssembler, MediaRouter, PeerConnectionManager, PeerEvent, VideoSink};

use crate::dispatcher::EventDispatcher;
use crate::error::ClientError;

/// フレーム統計ログの確認間隔
const STATS_TICK: Duration = Duration::from_secs(1);

/// 公開APIからセッションタスクへのコマンド
pub(crate) enum SessionCommand {
    SetSink(Arc<dyn VideoSink>),
    /// disconnected を発火してから閉じる
    Shutdown(oneshot::Sender<()>),
}

/// 1接続分の状態を所有するセッション
///
/// シグナリング・PeerConnection・DataChannelのイベントは全てこのタスクで処理する。
pub(crate) struct ClientSession {
    config: ClientConfig,
    signaling: SignalingSender,
    signaling_events: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    signaling_tasks: Option<SignalingTasks>,
    peer: Option<PeerConnectionManager>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    router: MediaRouter,
    assembler: FrameAssembler,
    dispatcher: Arc<EventDispatcher>,
    state_tx: watch::Sender<ConnectionState>,
    client_id: Arc<RwLock<String>>,
    initial_sink: Option<Arc<dyn VideoSink>>,
}

impl ClientSession {
    pub(crate) fn new(
        config: ClientConfig,
        connection: SignalingConnection,
        dispatcher: Arc<EventDispatcher>,
        state_tx: watch::Sender<ConnectionState>,
        client_id: Arc<RwLock<String>>,
        sink: Option<Arc<dyn VideoSink>>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            config,
            signaling: connection.sender,
            signaling_events: Some(connection.events),
            signaling_tasks: Some(connection.tasks),
            peer: None,
            peer_tx,
            peer_rx,
            router: MediaRouter::new(),
            assembler: FrameAssembler::new(),
            dispatcher,
            state_tx,
            client_id,
            initial_sink: sink,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("ClientSession started");

        if let Some(sink) = self.initial_sink.take() {
            self.router.set_sink(sink).await;
        }

        let mut stats_tick = tokio::time::interval(STATS_TICK);

        let ack = loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(SessionCommand::SetSink(sink)) => {
                            self.router.set_sink(sink).await;
                        }
                        Some(SessionCommand::Shutdown(ack)) => {
                            info!("Disconnect requested");
                            self.dispatcher.disconnected();
                            break Some(ack);
                        }
                        None => {
                            debug!("Client handle dropped");
                            break None;
                        }
                    }
                }
                event = recv_signaling(&mut self.signaling_events) => {
                    match event {
                        Some(event) => self.handle_signaling_event(event).await,
                        None => self.on_signaling_closed(),
                    }
                }
                Some(event) = self.peer_rx.recv() => {
                    self.handle_peer_event(event).await;
                }
                _ = stats_tick.tick() => {
                    self.assembler.log_performance_stats();
                }
            }
        };

        self.teardown().await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        info!("ClientSession stopped");
    }

    fn on_signaling_closed(&mut self) {
        info!("Signaling connection closed");
        self.signaling_events = None;
        self.dispatcher.disconnected();
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Authenticated { client_id } => {
                if let Some(id) = client_id {
                    *self.client_id.write() = id;
                }
                self.dispatcher.connected();
                // 生成に失敗した場合は PeerConnection エラーとして通知される
                self.ensure_peer().await;
            }
            SignalingEvent::AuthRejected { message } => {
                self.dispatcher.error(&ClientError::Auth(message));
            }
            SignalingEvent::Offer { sdp } => {
                let Some(peer) = self.ensure_peer().await else {
                    return;
                };
                let result = peer.handle_offer(sdp).await;
                if let Err(e) = result {
                    error!("Failed to handle offer: {:#}", e);
                    self.dispatcher
                        .error(&ClientError::Negotiation(ClientError::describe(&e)));
                }
            }
            SignalingEvent::OfferRejected { message } => {
                self.dispatcher.error(&ClientError::Negotiation(message));
            }
            SignalingEvent::RemoteCandidate(candidate) => {
                if let Some(peer) = self.ensure_peer().await {
                    peer.add_remote_candidate(candidate).await;
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Track(stream) => {
                self.dispatcher.video_stream(&stream);
                self.router.on_stream(stream).await;
            }
            PeerEvent::DataChannelOpened { label } => {
                debug!("Resetting frame assembler for data channel {}", label);
                self.assembler.reset();
            }
            PeerEvent::DataChannelMessage(data) => {
                let rejected = self.assembler.stats().frames_rejected;
                for frame in self.assembler.push(data) {
                    self.dispatcher.jpeg_frame(frame);
                }
                let newly_rejected = self.assembler.stats().frames_rejected - rejected;
                if newly_rejected > 0 {
                    self.dispatcher.error(&ClientError::FrameValidation(format!(
                        "{} frame(s) without JPEG SOI discarded",
                        newly_rejected
                    )));
                }
            }
            PeerEvent::ConnectionState(state) => {
                self.state_tx.send_replace(state);
                if state.is_lost() {
                    warn!("Peer connection lost ({})", state);
                    self.dispatcher.peer_lost();
                } else if state == ConnectionState::Connected {
                    self.dispatcher.peer_recovered();
                }
            }
            PeerEvent::IceFailed => {
                self.dispatcher.error(&ClientError::IceFailed);
            }
        }
    }

    /// PeerConnectionが無ければ生成する
    async fn ensure_peer(&mut self) -> Option<&mut PeerConnectionManager> {
        if self.peer.is_none() {
            match PeerConnectionManager::new(
                &self.config,
                self.signaling.clone(),
                self.peer_tx.clone(),
            )
            .await
            {
                Ok(peer) => {
                    self.peer = Some(peer);
                    self.state_tx.send_replace(ConnectionState::New);
                }
                Err(e) => {
                    error!("Failed to create peer connection: {:#}", e);
                    self.dispatcher
                        .error(&ClientError::PeerConnection(ClientError::describe(&e)));
                    return None;
                }
            }
        }
        self.peer.as_mut()
    }

    async fn teardown(&mut self) {
        // 以降に届くイベントは全て無視する
        self.dispatcher.close();

        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(tasks) = self.signaling_tasks.take() {
            tasks.shutdown().await;
        }
        self.assembler.reset();
        self.state_tx.send_replace(ConnectionState::Closed);
    }
}

async fn recv_signaling(
    events: &mut Option<mpsc::UnboundedReceiver<SignalingEvent>>,
) -> Option<SignalingEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
