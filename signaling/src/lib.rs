// SignalingClient: WebSocketクライアントとしてシグナリングサーバーに接続
pub mod client;
pub mod protocol;

pub use client::{generate_client_id, SignalingClient, SignalingConnection, SignalingTasks};
pub use protocol::{dispatch_text, ClientMessage, ServerMessage, CLIENT_TYPE};
