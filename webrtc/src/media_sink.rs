use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use webrtc_rs::track::track_remote::TrackRemote;

/// 受信したリモートメディアストリーム
#[derive(Clone)]
pub struct RemoteStream {
    stream_id: String,
    track_id: String,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteStream {
    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        Self {
            stream_id: track.stream_id().to_string(),
            track_id: track.id().to_string(),
            track: Some(track),
        }
    }

    /// RTPトラックを持たないストリーム
    pub fn detached(stream_id: impl Into<String>, track_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            track_id: track_id.into(),
            track: None,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("has_track", &self.track.is_some())
            .finish()
    }
}

impl PartialEq for RemoteStream {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id && self.track_id == other.track_id
    }
}

/// 再生開始時のオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackOptions {
    pub muted: bool,
    pub autoplay: bool,
    pub plays_inline: bool,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            muted: true,
            autoplay: true,
            plays_inline: true,
        }
    }
}

/// リモートストリームの表示先
#[async_trait]
pub trait VideoSink: Send + Sync {
    fn attach(&self, stream: RemoteStream);

    async fn play(&self, options: PlaybackOptions) -> Result<()>;
}

/// ストリームをシンクに割り当てて再生を開始する
///
/// 再生に失敗した場合はミュートを強制して一度だけ再試行する。
pub async fn attach_and_play(sink: &dyn VideoSink, stream: RemoteStream) {
    info!(
        "Attaching stream {} (track {}) to video sink",
        stream.stream_id(),
        stream.track_id()
    );
    sink.attach(stream);

    let options = PlaybackOptions::default();
    match sink.play(options).await {
        Ok(()) => info!("Video playback started"),
        Err(e) => {
            warn!("Video playback failed: {}, retrying muted", e);
            let muted = PlaybackOptions {
                muted: true,
                ..options
            };
            match sink.play(muted).await {
                Ok(()) => info!("Video playback started after retry"),
                Err(e) => error!("Video playback retry failed: {}", e),
            }
        }
    }
}

/// ストリームとシンクのどちらが先に来ても再生できるよう仲介する
#[derive(Default)]
pub struct MediaRouter {
    pending: Option<RemoteStream>,
    sink: Option<Arc<dyn VideoSink>>,
}

impl MediaRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しいストリームを記録し、シンクがあれば割り当てる
    pub async fn on_stream(&mut self, stream: RemoteStream) {
        self.pending = Some(stream.clone());
        match &self.sink {
            Some(sink) => attach_and_play(sink.as_ref(), stream).await,
            None => warn!(
                "Video sink not registered yet, holding stream {}",
                stream.stream_id()
            ),
        }
    }

    /// シンクを登録し、記録済みのストリームがあれば割り当てる
    ///
    /// 記録済みストリームは消さない。後から別のシンクを登録しても同じストリームを再生する。
    pub async fn set_sink(&mut self, sink: Arc<dyn VideoSink>) {
        self.sink = Some(sink.clone());
        if let Some(stream) = self.pending.clone() {
            info!("Applying pending stream {} to new video sink", stream.stream_id());
            attach_and_play(sink.as_ref(), stream).await;
        }
    }

    pub fn pending_stream(&self) -> Option<&RemoteStream> {
        self.pending.as_ref()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use parking_lot::Mutex;

    /// 呼び出しを記録するシンク
    #[derive(Default)]
    struct RecordingSink {
        attached: Mutex<Vec<RemoteStream>>,
        plays: Mutex<Vec<PlaybackOptions>>,
        failures_left: Mutex<u32>,
    }

    impl RecordingSink {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: Mutex::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl VideoSink for RecordingSink {
        fn attach(&self, stream: RemoteStream) {
            self.attached.lock().push(stream);
        }

        async fn play(&self, options: PlaybackOptions) -> Result<()> {
            self.plays.lock().push(options);
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                bail!("autoplay blocked");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_registered_before_stream() {
        let sink = Arc::new(RecordingSink::default());
        let mut router = MediaRouter::new();
        router.set_sink(sink.clone()).await;
        assert!(sink.attached.lock().is_empty());

        router.on_stream(RemoteStream::detached("stream", "video")).await;
        assert_eq!(*sink.attached.lock(), vec![RemoteStream::detached("stream", "video")]);
        assert_eq!(sink.plays.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_arrives_before_sink() {
        let mut router = MediaRouter::new();
        router.on_stream(RemoteStream::detached("stream", "video")).await;
        assert!(router.pending_stream().is_some());

        let sink = Arc::new(RecordingSink::default());
        router.set_sink(sink.clone()).await;
        assert_eq!(sink.attached.lock().len(), 1);
        assert_eq!(
            *sink.plays.lock(),
            vec![PlaybackOptions {
                muted: true,
                autoplay: true,
                plays_inline: true
            }]
        );
    }

    #[tokio::test]
    async fn test_pending_stream_reapplied_to_replacement_sink() {
        let mut router = MediaRouter::new();
        router.on_stream(RemoteStream::detached("stream", "video")).await;

        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        router.set_sink(first.clone()).await;
        router.set_sink(second.clone()).await;

        assert_eq!(first.attached.lock().len(), 1);
        assert_eq!(second.attached.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_playback_failure_retries_once() {
        let sink = Arc::new(RecordingSink::failing(5));
        let mut router = MediaRouter::new();
        router.set_sink(sink.clone()).await;
        router.on_stream(RemoteStream::detached("stream", "video")).await;

        let plays = sink.plays.lock();
        assert_eq!(plays.len(), 2);
        assert!(plays[1].muted);
    }

    #[tokio::test]
    async fn test_newer_stream_replaces_pending() {
        let mut router = MediaRouter::new();
        router.on_stream(RemoteStream::detached("old", "video")).await;
        router.on_stream(RemoteStream::detached("new", "video")).await;
        assert_eq!(router.pending_stream().map(|s| s.stream_id()), Some("new"));
    }
}
