// WebRtcClient: シグナリング接続とPeerConnectionをまとめた受信クライアント
mod dispatcher;
mod error;
mod session;

pub use dispatcher::{ClientEvent, EventDispatcher, EventHandlers};
pub use error::{ClientError, Result};

pub use core_types::{ClientConfig, ConnectionState, TurnServer};
pub use webrtc::{PlaybackOptions, RemoteStream, TrackRecorder, VideoSink};

use core_types::{SignalingResponse, SignalingSender};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use signaling::{SignalingClient, SignalingConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dispatcher::SharedHandlers;
use session::{ClientSession, SessionCommand};

/// セッション停止を待つ最大時間
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// 起動中セッションへのハンドル
struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    signaling: SignalingSender,
    state: watch::Receiver<ConnectionState>,
    client_id: Arc<RwLock<String>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Shutdown(ack_tx)).is_err() {
            debug!("Session already stopped");
            return;
        }
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, ack_rx).await.is_err() {
            warn!("Session did not stop in time, aborting");
            task.abort();
            return;
        }
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await;
    }
}

enum SessionSlot {
    Idle,
    /// connect() がソケットを開いている途中
    Connecting {
        attempt: u64,
        cancel: oneshot::Sender<()>,
    },
    Active(SessionHandle),
}

/// 映像受信クライアント
///
/// `connect()` でシグナリングサーバーに接続し、サーバーからの offer に応答して
/// 映像トラックとDataChannel上のJPEGフレームを受信する。
/// 全てのメソッドは `&self` で呼べるので `Arc` で共有してよい。
pub struct WebRtcClient {
    config: ClientConfig,
    handlers: SharedHandlers,
    sink: Mutex<Option<Arc<dyn VideoSink>>>,
    slot: Mutex<SessionSlot>,
    attempts: Mutex<u64>,
}

impl WebRtcClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(RwLock::new(Arc::new(EventHandlers::new()))),
            sink: Mutex::new(None),
            slot: Mutex::new(SessionSlot::Idle),
            attempts: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// コールバックを登録する（以前の登録は置き換える）
    pub fn set_event_handlers(&self, handlers: EventHandlers) {
        *self.handlers.write() = Arc::new(handlers);
    }

    /// シグナリングサーバーに接続する
    ///
    /// ソケットが開いた時点で完了する。認証と交渉はバックグラウンドで進み、
    /// 結果はコールバックで通知される。
    pub async fn connect(&self) -> Result<()> {
        // ソケットが閉じた後のセッションは片付けてから張り直す
        let stale = {
            let mut slot = self.slot.lock();
            if let SessionSlot::Active(handle) = &*slot {
                if handle.signaling.is_open() {
                    warn!("Already connected, ignoring connect()");
                    return Ok(());
                }
            }
            match std::mem::replace(&mut *slot, SessionSlot::Idle) {
                SessionSlot::Active(handle) => Some(handle),
                _ => None,
            }
        };
        if let Some(handle) = stale {
            handle.shutdown().await;
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let attempt = {
            let mut slot = self.slot.lock();
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            let attempt = *attempts;
            // 進行中の connect() があれば、その送信側が破棄されてそちらは中止扱いになる
            *slot = SessionSlot::Connecting {
                attempt,
                cancel: cancel_tx,
            };
            attempt
        };

        let client = SignalingClient::new(&self.config);
        let client_id = client.client_id().to_string();
        info!("Connecting as {}", client_id);

        let result = tokio::select! {
            res = client.connect() => Some(res),
            _ = &mut cancel_rx => None,
        };

        let connection = match result {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                self.clear_attempt(attempt);
                let err = ClientError::Connection(ClientError::describe(&e));
                error!("{}", err);
                EventDispatcher::new(self.handlers.clone()).error(&err);
                return Err(err);
            }
            None => {
                info!("connect() cancelled");
                return Err(ClientError::Cancelled);
            }
        };

        let rejected = {
            let mut slot = self.slot.lock();
            let still_ours =
                matches!(&*slot, SessionSlot::Connecting { attempt: a, .. } if *a == attempt);
            if still_ours {
                *slot = SessionSlot::Active(self.start_session(connection, client_id));
                None
            } else {
                Some(connection)
            }
        };

        if let Some(connection) = rejected {
            info!("connect() cancelled after socket opened, closing it");
            connection.tasks.shutdown().await;
            return Err(ClientError::Cancelled);
        }
        Ok(())
    }

    fn start_session(&self, connection: SignalingConnection, client_id: String) -> SessionHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let client_id = Arc::new(RwLock::new(client_id));
        let dispatcher = Arc::new(EventDispatcher::new(self.handlers.clone()));
        let signaling = connection.sender.clone();
        let sink = self.sink.lock().clone();

        let session = ClientSession::new(
            self.config.clone(),
            connection,
            dispatcher,
            state_tx,
            client_id.clone(),
            sink,
        );
        let task = tokio::spawn(session.run(command_rx));

        SessionHandle {
            commands: command_tx,
            signaling,
            state: state_rx,
            client_id,
            task,
        }
    }

    fn clear_attempt(&self, attempt: u64) {
        let mut slot = self.slot.lock();
        if matches!(&*slot, SessionSlot::Connecting { attempt: a, .. } if *a == attempt) {
            *slot = SessionSlot::Idle;
        }
    }

    /// 接続を閉じる（何度呼んでもよい）
    ///
    /// セッションがあれば disconnected を1回だけ発火し、以降のコールバックは止まる。
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), SessionSlot::Idle);
        match previous {
            SessionSlot::Idle => debug!("disconnect() without an active session"),
            SessionSlot::Connecting { cancel, .. } => {
                info!("Cancelling in-flight connect()");
                let _ = cancel.send(());
            }
            SessionSlot::Active(handle) => {
                info!("Disconnecting");
                handle.shutdown().await;
            }
        }
    }

    /// 映像の表示先を登録する（受信済みのストリームがあれば即座に割り当てる）
    pub fn set_sink(&self, sink: Arc<dyn VideoSink>) {
        *self.sink.lock() = Some(sink.clone());
        if let SessionSlot::Active(handle) = &*self.slot.lock() {
            if handle.commands.send(SessionCommand::SetSink(sink)).is_err() {
                warn!("Session stopped, sink will be used on next connect");
            }
        }
    }

    /// サーバーに offer を要求する
    pub fn request_video_stream(&self, source_id: Option<String>) -> bool {
        info!("Requesting video stream (source: {:?})", source_id);
        self.send(SignalingResponse::RequestOffer { source_id })
    }

    /// 任意の制御メッセージ（JSONオブジェクト）を送る
    pub fn send_control_message(&self, message: Value) -> bool {
        if !message.is_object() {
            warn!("Control message must be a JSON object, dropping");
            return false;
        }
        self.send(SignalingResponse::Control(message))
    }

    fn send(&self, response: SignalingResponse) -> bool {
        match &*self.slot.lock() {
            SessionSlot::Active(handle) => handle.signaling.send(response),
            _ => {
                warn!("Signaling socket is not open, message dropped");
                false
            }
        }
    }

    /// PeerConnectionの状態（セッションが無ければ Disconnected）
    pub fn connection_state(&self) -> ConnectionState {
        match &*self.slot.lock() {
            SessionSlot::Active(handle) => *handle.state.borrow(),
            _ => ConnectionState::Disconnected,
        }
    }

    /// サーバーが割り当てたID（無ければ送ったID）
    pub fn client_id(&self) -> Option<String> {
        match &*self.slot.lock() {
            SessionSlot::Active(handle) => Some(handle.client_id.read().clone()),
            _ => self.config.client_id.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.slot.lock(), SessionSlot::Active(handle) if handle.signaling.is_open())
    }
}
