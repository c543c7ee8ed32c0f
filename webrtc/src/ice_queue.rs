use core_types::IceCandidate;

/// リモート記述が設定されるまでICE candidateを溜めておくキュー
///
/// 一度 drain すると以降は溜めない。
#[derive(Debug)]
pub enum IceCandidateQueue {
    Buffering(Vec<IceCandidate>),
    Drained,
}

impl Default for IceCandidateQueue {
    fn default() -> Self {
        IceCandidateQueue::Buffering(Vec::new())
    }
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 溜められるなら溜めて None、drain 済みなら呼び出し側で適用するため返す
    pub fn defer(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self {
            IceCandidateQueue::Buffering(pending) => {
                pending.push(candidate);
                None
            }
            IceCandidateQueue::Drained => Some(candidate),
        }
    }

    /// 受信順に取り出して drain 済みにする
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        match std::mem::replace(self, IceCandidateQueue::Drained) {
            IceCandidateQueue::Buffering(pending) => pending,
            IceCandidateQueue::Drained => Vec::new(),
        }
    }

    pub fn is_drained(&self) -> bool {
        matches!(self, IceCandidateQueue::Drained)
    }

    pub fn len(&self) -> usize {
        match self {
            IceCandidateQueue::Buffering(pending) => pending.len(),
            IceCandidateQueue::Drained => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
