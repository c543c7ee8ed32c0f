use anyhow::{bail, Context, Result};
use core_types::{IceCandidate, SignalingEvent, SignalingResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

/// 認証メッセージに載せるクライアント種別
pub const CLIENT_TYPE: &str = "web_client";

/// サーバーから届くシグナリングメッセージ
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        #[serde(default)]
        message: Option<String>,
    },
    AuthSuccess {
        #[serde(default)]
        client_id: Option<String>,
    },
    AuthError {
        #[serde(default)]
        message: String,
    },
    Offer {
        data: OfferData,
    },
    OfferError {
        #[serde(default)]
        message: String,
    },
    IceCandidate {
        data: IceCandidate,
    },
    AnalysisResult {
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OfferData {
    pub sdp: String,
}

/// クライアントから送るシグナリングメッセージ
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        data: AuthData,
    },
    RequestOffer {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<RequestOfferData>,
    },
    Answer {
        data: AnswerData,
    },
    IceCandidate {
        data: IceCandidate,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthData {
    pub client_type: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOfferData {
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerData {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl ClientMessage {
    pub fn auth(client_id: impl Into<String>) -> Self {
        ClientMessage::Auth {
            data: AuthData {
                client_type: CLIENT_TYPE.to_string(),
                client_id: client_id.into(),
            },
        }
    }

    pub fn answer(sdp: String) -> Self {
        ClientMessage::Answer {
            data: AnswerData {
                sdp_type: "answer".to_string(),
                sdp,
            },
        }
    }
}

/// 送信要求をJSONに変換する（Close は None）
pub fn response_to_value(response: SignalingResponse) -> Option<Value> {
    let message = match response {
        SignalingResponse::Answer { sdp } => ClientMessage::answer(sdp),
        SignalingResponse::IceCandidate(candidate) => ClientMessage::IceCandidate { data: candidate },
        SignalingResponse::RequestOffer { source_id } => ClientMessage::RequestOffer {
            data: source_id.map(|source_id| RequestOfferData { source_id }),
        },
        SignalingResponse::Control(value) => return Some(value),
        SignalingResponse::Close => return None,
    };
    serde_json::to_value(message).ok()
}

/// エポックミリ秒
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// 送信直前に timestamp を付与してJSON文字列にする
pub fn encode_with_timestamp(value: Value) -> Result<String> {
    let Value::Object(mut map) = value else {
        bail!("Signaling message must be a JSON object");
    };
    map.insert("timestamp".to_string(), Value::from(now_millis()));
    serde_json::to_string(&map).context("Failed to serialize signaling message")
}

pub fn encode_message(message: &ClientMessage) -> Result<String> {
    let value = serde_json::to_value(message).context("Failed to serialize signaling message")?;
    encode_with_timestamp(value)
}

#[derive(Deserialize)]
struct MessageKind {
    #[serde(rename = "type", default)]
    kind: String,
}

/// 受信テキストを解釈し、セッションに渡すべきイベントを返す
///
/// 解析できないメッセージはログに残して捨てる。接続は維持する。
pub fn dispatch_text(text: &str) -> Option<SignalingEvent> {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            error!("Failed to parse signaling message: {} (raw: {})", e, text);
            return None;
        }
    };

    match message {
        ServerMessage::Welcome { message } => {
            info!("Welcome from signaling server: {}", message.unwrap_or_default());
            None
        }
        ServerMessage::AuthSuccess { client_id } => {
            info!("Authenticated, client_id: {:?}", client_id);
            Some(SignalingEvent::Authenticated { client_id })
        }
        ServerMessage::AuthError { message } => {
            error!("Authentication rejected: {}", message);
            Some(SignalingEvent::AuthRejected { message })
        }
        ServerMessage::Offer { data } => {
            info!("Offer received ({} bytes of SDP)", data.sdp.len());
            debug!("Offer SDP:\n{}", data.sdp);
            Some(SignalingEvent::Offer { sdp: data.sdp })
        }
        ServerMessage::OfferError { message } => {
            error!("Server failed to create offer: {}", message);
            Some(SignalingEvent::OfferRejected { message })
        }
        ServerMessage::IceCandidate { data } => {
            debug!("Remote ICE candidate received: {}", data.candidate);
            Some(SignalingEvent::RemoteCandidate(data))
        }
        ServerMessage::AnalysisResult { .. } => {
            trace!("analysis_result ignored");
            None
        }
        ServerMessage::Unknown => {
            let kind = serde_json::from_str::<MessageKind>(text)
                .map(|k| k.kind)
                .unwrap_or_default();
            warn!("Unhandled signaling message type: {}", kind);
            None
        }
    }
}
