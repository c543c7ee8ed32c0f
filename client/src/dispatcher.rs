use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::RemoteStream;

use crate::error::ClientError;

type Callback = Box<dyn Fn() + Send + Sync>;
type StreamCallback = Box<dyn Fn(&RemoteStream) + Send + Sync>;
type FrameCallback = Box<dyn Fn(Bytes) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&ClientError) + Send + Sync>;

/// コールバックの組（未設定のものは何もしない）
#[derive(Default)]
pub struct EventHandlers {
    on_connected: Option<Callback>,
    on_disconnected: Option<Callback>,
    on_video_stream: Option<StreamCallback>,
    on_jpeg_frame: Option<FrameCallback>,
    on_error: Option<ErrorCallback>,
}

/// コールバックをイベントとして受け取る場合の形
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    VideoStream(RemoteStream),
    JpegFrame(Bytes),
    Error(ClientError),
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Box::new(f));
        self
    }

    pub fn on_video_stream(mut self, f: impl Fn(&RemoteStream) + Send + Sync + 'static) -> Self {
        self.on_video_stream = Some(Box::new(f));
        self
    }

    pub fn on_jpeg_frame(mut self, f: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        self.on_jpeg_frame = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// 全てのコールバックを ClientEvent としてチャネルに流すハンドラ
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = tx.clone();
        let disconnected = tx.clone();
        let stream = tx.clone();
        let frame = tx.clone();
        let handlers = Self::new()
            .on_connected(move || {
                let _ = connected.send(ClientEvent::Connected);
            })
            .on_disconnected(move || {
                let _ = disconnected.send(ClientEvent::Disconnected);
            })
            .on_video_stream(move |s| {
                let _ = stream.send(ClientEvent::VideoStream(s.clone()));
            })
            .on_jpeg_frame(move |data| {
                let _ = frame.send(ClientEvent::JpegFrame(data));
            })
            .on_error(move |e| {
                let _ = tx.send(ClientEvent::Error(e.clone()));
            });
        (handlers, rx)
    }
}

/// 差し替え可能なハンドラの共有スロット
pub type SharedHandlers = Arc<RwLock<Arc<EventHandlers>>>;

/// 接続ごとのコールバック呼び出し口
///
/// 切断後の呼び出しは全て無視する。ソケット切断による disconnected は接続ごとに1回、
/// PeerConnectionの喪失による disconnected は回復するまでに1回だけ発火する。
pub struct EventDispatcher {
    handlers: SharedHandlers,
    closed: AtomicBool,
    /// ソケット切断または disconnect() で発火済み
    disconnected_fired: AtomicBool,
    /// PeerConnectionの disconnected/failed で発火済み（Connected に戻ると解除）
    peer_lost_fired: AtomicBool,
}

impl EventDispatcher {
    pub fn new(handlers: SharedHandlers) -> Self {
        Self {
            handlers,
            closed: AtomicBool::new(false),
            disconnected_fired: AtomicBool::new(false),
            peer_lost_fired: AtomicBool::new(false),
        }
    }

    // 呼び出し中にハンドラが差し替えられても影響しないようスナップショットを取る
    fn snapshot(&self) -> Option<Arc<EventHandlers>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(self.handlers.read().clone())
    }

    pub fn connected(&self) {
        if let Some(h) = self.snapshot() {
            if let Some(f) = &h.on_connected {
                f();
            }
        }
    }

    /// ソケット切断の disconnected を1回だけ発火する
    pub fn disconnected(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.disconnected_fired.swap(true, Ordering::AcqRel) {
            debug!("disconnected already fired for this connection");
            return;
        }
        self.fire_disconnected();
    }

    /// PeerConnectionが disconnected/failed になった
    pub fn peer_lost(&self) {
        if self.closed.load(Ordering::Acquire) || self.disconnected_fired.load(Ordering::Acquire) {
            return;
        }
        if self.peer_lost_fired.swap(true, Ordering::AcqRel) {
            debug!("disconnected already fired for this peer loss");
            return;
        }
        self.fire_disconnected();
    }

    /// PeerConnectionが Connected に戻った（次の喪失で再び発火する）
    pub fn peer_recovered(&self) {
        if self.peer_lost_fired.swap(false, Ordering::AcqRel) {
            debug!("Peer connection recovered");
        }
    }

    fn fire_disconnected(&self) {
        if let Some(h) = self.snapshot() {
            if let Some(f) = &h.on_disconnected {
                f();
            }
        }
    }

    pub fn video_stream(&self, stream: &RemoteStream) {
        if let Some(h) = self.snapshot() {
            if let Some(f) = &h.on_video_stream {
                f(stream);
            }
        }
    }

    pub fn jpeg_frame(&self, frame: Bytes) {
        if let Some(h) = self.snapshot() {
            if let Some(f) = &h.on_jpeg_frame {
                f(frame);
            }
        }
    }

    pub fn error(&self, err: &ClientError) {
        if err.is_log_only() {
            warn!("{}", err);
            return;
        }
        match self.snapshot() {
            Some(h) => match &h.on_error {
                Some(f) => f(err),
                None => warn!("Unhandled client error: {}", err),
            },
            None => debug!("Error after disconnect ignored: {}", err),
        }
    }

    /// 以降のコールバックを全て止める
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
