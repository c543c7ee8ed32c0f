use bytes::{Bytes, BytesMut};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// フレーム長ヘッダ（ビッグエンディアン u32）
pub const FRAME_HEADER_LEN: usize = 4;
/// JPEG Start-Of-Image マーカー
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// 受信中フレームの状態
#[derive(Debug, Default)]
enum FrameBuffer {
    #[default]
    Idle,
    Receiving {
        expected: usize,
        chunks: Vec<Bytes>,
        received: usize,
    },
}

/// フレーム組み立ての統計情報
#[derive(Debug)]
pub struct FrameStats {
    pub frames_emitted: u64,
    pub frames_rejected: u64,
    pub invalid_chunks: u64,
    pub bytes_received: u64,
    pub last_perf_log: Instant,
}

impl FrameStats {
    pub fn new() -> Self {
        Self {
            frames_emitted: 0,
            frames_rejected: 0,
            invalid_chunks: 0,
            bytes_received: 0,
            last_perf_log: Instant::now(),
        }
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

/// DataChannelのバイナリチャンクからJPEGフレームを復元する
///
/// 先頭チャンクの4バイトがフレーム長、以降は宣言長に達するまでペイロードのみ。
/// 宣言長を超えた余剰バイトは次フレームの先頭として同じ処理に戻す。
/// 未完了フレームのタイムアウトは無く、宣言長に届くまで受信状態のまま。
#[derive(Debug, Default)]
pub struct FrameAssembler {
    state: FrameBuffer,
    stats: FrameStats,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// チャンクを1つ取り込み、完成して検証を通ったフレームを返す
    pub fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        self.stats.bytes_received += chunk.len() as u64;
        let mut frames = Vec::new();
        let mut next = Some(chunk);

        while let Some(data) = next.take() {
            if let FrameBuffer::Idle = self.state {
                if data.len() < FRAME_HEADER_LEN {
                    warn!("Chunk too small to hold a frame header: {} bytes", data.len());
                    self.stats.invalid_chunks += 1;
                    continue;
                }
                let expected =
                    u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                debug!("New JPEG frame, expected size: {} bytes", expected);
                self.state = FrameBuffer::Receiving {
                    expected,
                    chunks: Vec::new(),
                    received: 0,
                };

                let payload = data.slice(FRAME_HEADER_LEN..);
                if payload.is_empty() {
                    // ヘッダのみのチャンク。ペイロードは後続で届く
                    continue;
                }
                next = self.append(payload, &mut frames);
            } else {
                next = self.append(data, &mut frames);
            }
        }

        frames
    }

    /// 受信中のフレームにペイロードを追加し、余剰バイトがあれば返す
    fn append(&mut self, payload: Bytes, frames: &mut Vec<Bytes>) -> Option<Bytes> {
        let FrameBuffer::Receiving {
            expected,
            chunks,
            received,
        } = &mut self.state
        else {
            return Some(payload);
        };

        *received += payload.len();
        chunks.push(payload);
        debug!("Frame progress: {}/{} bytes", received, expected);

        if *received < *expected {
            return None;
        }

        let expected = *expected;
        let overflow = *received - expected;
        let chunks = std::mem::take(chunks);
        self.state = FrameBuffer::Idle;

        // 宣言長より前のチャンクは全て宣言長未満なので、余剰は最後のチャンクにのみ存在する
        let leftover = match chunks.last() {
            Some(last) if overflow > 0 => Some(last.slice(last.len() - overflow..)),
            _ => None,
        };

        let mut frame = BytesMut::with_capacity(expected);
        for chunk in &chunks {
            let remaining = expected - frame.len();
            if remaining == 0 {
                break;
            }
            let take = remaining.min(chunk.len());
            frame.extend_from_slice(&chunk[..take]);
        }
        let frame = frame.freeze();

        if frame.starts_with(&JPEG_SOI) {
            debug!("JPEG frame complete: {} bytes", frame.len());
            self.stats.frames_emitted += 1;
            frames.push(frame);
        } else {
            let head: Vec<String> = frame.iter().take(8).map(|b| format!("0x{:02x}", b)).collect();
            error!(
                "JPEG header validation failed, discarding {} bytes: {}",
                frame.len(),
                head.join(" ")
            );
            self.stats.frames_rejected += 1;
        }

        if let Some(rest) = &leftover {
            debug!("Carrying {} bytes into the next frame", rest.len());
        }
        leftover
    }

    /// 受信途中のフレームを破棄する
    pub fn reset(&mut self) {
        if let FrameBuffer::Receiving {
            expected, received, ..
        } = &self.state
        {
            warn!(
                "Dropping incomplete frame ({}/{} bytes)",
                received, expected
            );
        }
        self.state = FrameBuffer::Idle;
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, FrameBuffer::Receiving { .. })
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// 統計を5秒ごとにログ出力
    pub fn log_performance_stats(&mut self) {
        let stats = &mut self.stats;
        if stats.last_perf_log.elapsed().as_secs_f32() >= 5.0 {
            let elapsed_sec = stats.last_perf_log.elapsed().as_secs_f32();
            info!(
                "JPEG assembly stats (last {:.0}s): emitted={} ({:.1} fps), rejected={}, invalid_chunks={}, bytes={}",
                elapsed_sec,
                stats.frames_emitted,
                stats.frames_emitted as f32 / elapsed_sec,
                stats.frames_rejected,
                stats.invalid_chunks,
                stats.bytes_received
            );
            stats.frames_emitted = 0;
            stats.frames_rejected = 0;
            stats.invalid_chunks = 0;
            stats.bytes_received = 0;
            stats.last_perf_log = Instant::now();
        }
    }
}
