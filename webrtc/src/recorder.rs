use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc_rs::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc_rs::media::io::h264_writer::H264Writer;
use webrtc_rs::media::io::ivf_reader::IVFFileHeader;
use webrtc_rs::media::io::ivf_writer::IVFWriter;
use webrtc_rs::media::io::Writer;
use webrtc_rs::track::track_remote::TrackRemote;

use crate::media_sink::{PlaybackOptions, RemoteStream, VideoSink};

type BoxedWriter = Box<dyn Writer + Send>;

#[derive(Default)]
struct RecorderState {
    stream: Option<RemoteStream>,
    task: Option<JoinHandle<()>>,
}

/// 受信RTPをファイルに書き出すシンク（H.264 は Annex-B、VP8/VP9 は IVF）
pub struct TrackRecorder {
    path: PathBuf,
    state: Mutex<RecorderState>,
}

impl TrackRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(RecorderState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_recording(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TrackRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl VideoSink for TrackRecorder {
    fn attach(&self, stream: RemoteStream) {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            debug!("Stopping previous recording");
            task.abort();
        }
        state.stream = Some(stream);
    }

    async fn play(&self, _options: PlaybackOptions) -> Result<()> {
        let mut state = self.state.lock();
        if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Recording already running");
            return Ok(());
        }

        let stream = state.stream.clone().context("No stream attached")?;
        let track = stream.track().cloned().context("Stream has no RTP track")?;
        let mime_type = track.codec().capability.mime_type;
        let writer = open_writer(&self.path, &mime_type)?;

        info!("Recording {} to {}", mime_type, self.path.display());
        state.task = Some(tokio::spawn(record_track(track, writer)));
        Ok(())
    }
}

fn open_writer(path: &Path, mime_type: &str) -> Result<BoxedWriter> {
    let ivf_fourcc = if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        return Ok(Box::new(H264Writer::new(file)));
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
        *b"VP80"
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
        *b"VP90"
    } else {
        bail!("Unsupported codec for recording: {}", mime_type);
    };

    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let header = IVFFileHeader {
        signature: *b"DKIF",
        version: 0,
        header_size: 32,
        four_cc: ivf_fourcc,
        width: 640,
        height: 480,
        timebase_denominator: 30,
        timebase_numerator: 1,
        num_frames: 900,
        unused: 0,
    };
    let writer = IVFWriter::new(file, &header).context("Failed to write IVF header")?;
    Ok(Box::new(writer))
}

async fn record_track(track: Arc<TrackRemote>, mut writer: BoxedWriter) {
    let mut packets: u64 = 0;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if let Err(e) = writer.write_rtp(&packet) {
                    warn!("Failed to write RTP packet: {}", e);
                }
                packets += 1;
                if packets % 1000 == 0 {
                    debug!("Recorded {} RTP packets", packets);
                }
            }
            Err(e) => {
                info!("Track read finished after {} packets: {}", packets, e);
                break;
            }
        }
    }
    if let Err(e) = writer.close() {
        warn!("Failed to close recording: {}", e);
    }
}
