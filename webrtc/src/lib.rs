mod connection;
mod frame_assembler;
mod ice_queue;
mod media_sink;
mod recorder;

use bytes::Bytes;
use core_types::ConnectionState;

pub use connection::{ice_servers, repair_answer_sdp, PeerConnectionManager};
pub use frame_assembler::{FrameAssembler, FrameStats, FRAME_HEADER_LEN, JPEG_SOI};
pub use ice_queue::IceCandidateQueue;
pub use media_sink::{attach_and_play, MediaRouter, PlaybackOptions, RemoteStream, VideoSink};
pub use recorder::TrackRecorder;

// 下位のWebRTC実装（テストでofferer側を組み立てる用途など）
pub use webrtc_rs;

/// PeerConnectionのコールバックからセッションへ送るイベント
#[derive(Debug)]
pub enum PeerEvent {
    /// 映像トラックを受信した
    Track(RemoteStream),
    DataChannelOpened { label: String },
    /// DataChannelのバイナリメッセージ
    DataChannelMessage(Bytes),
    ConnectionState(ConnectionState),
    IceFailed,
}
