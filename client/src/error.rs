//! クライアントAPIのエラー型

pub type Result<T> = std::result::Result<T, ClientError>;

/// 呼び出し側とエラーコールバックに渡るエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// WebSocketを開けなかった（タイムアウト含む）
    #[error("Signaling connection failed: {0}")]
    Connection(String),

    /// サーバーが認証を拒否した
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// 受信JSONを解釈できなかった（ログのみ）
    #[error("Malformed signaling message: {0}")]
    Parse(String),

    /// SDP交渉に失敗した（offer_error を含む）
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// 候補1件の適用失敗（ログのみ）
    #[error("Failed to apply ICE candidate: {0}")]
    IceApply(String),

    /// SOI検証に失敗したフレーム（ログのみ）
    #[error("Invalid JPEG frame: {0}")]
    FrameValidation(String),

    /// 再試行後も再生できなかった（ログのみ）
    #[error("Video playback failed: {0}")]
    Playback(String),

    #[error("ICE connection failed")]
    IceFailed,

    /// PeerConnectionを生成できなかった
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// connect() の途中で disconnect() された
    #[error("Connection attempt cancelled")]
    Cancelled,
}

impl ClientError {
    /// 接続を継続できる軽微なエラーで、on_error には渡さずログにだけ出す
    pub fn is_log_only(&self) -> bool {
        matches!(
            self,
            ClientError::Parse(_)
                | ClientError::IceApply(_)
                | ClientError::FrameValidation(_)
                | ClientError::Playback(_)
        )
    }

    /// anyhow のエラーチェーンを1行にまとめる
    pub(crate) fn describe(err: &anyhow::Error) -> String {
        format!("{:#}", err)
    }
}
