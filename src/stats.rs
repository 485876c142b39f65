//! 전송 통계

use std::time::{Duration, Instant};

/// 세션 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 시작된 원본 전송 패스 수
    pub passes_started: u64,

    /// 끝까지 완료된 패스 수 (원본 + 재전송)
    pub passes_completed: u64,

    /// 중단된 패스 수
    pub passes_aborted: u64,

    /// 송신 청크 수 (재전송 포함)
    pub chunks_sent: u64,

    /// 재전송 청크 수
    pub retransmitted_chunks: u64,

    /// 송신 워드 수 (헤더, sentinel 포함)
    pub words_sent: u64,

    /// sentinel 송신 수
    pub end_flags_sent: u64,

    /// 송신 큐 full 재시도 수
    pub send_retries: u64,

    /// 스토리지 busy 재시도 수
    pub transfer_retries: u64,

    /// 무시된 이전 세대 완료 통지 수
    pub stale_completions: u64,

    /// 완료된 누락 목록 라운드 수
    pub missing_rounds: u64,

    /// 수신된 누락 시퀀스 번호 수
    pub missing_entries: u64,

    /// 무시된 컨트롤 메시지 수
    pub malformed_commands: u64,

    /// tick 수
    pub ticks: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            passes_started: 0,
            passes_completed: 0,
            passes_aborted: 0,
            chunks_sent: 0,
            retransmitted_chunks: 0,
            words_sent: 0,
            end_flags_sent: 0,
            send_retries: 0,
            transfer_retries: 0,
            stale_completions: 0,
            missing_rounds: 0,
            missing_entries: 0,
            malformed_commands: 0,
            ticks: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 송신 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        (self.words_sent * crate::WORD_SIZE as u64) as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.chunks_sent == 0 {
            return 0.0;
        }
        self.retransmitted_chunks as f64 / self.chunks_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Passes: {}/{} | Chunks: {} (retx {:.1}%) | Words: {} | Throughput: {:.2} MB/s | Retries: {}/{} | Stale: {} | Rounds: {}",
            self.elapsed().as_secs_f64(),
            self.passes_completed,
            self.passes_started + self.missing_rounds,
            self.chunks_sent,
            self.retransmit_ratio() * 100.0,
            self.words_sent,
            self.throughput() / 1_000_000.0,
            self.send_retries,
            self.transfer_retries,
            self.stale_completions,
            self.missing_rounds,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_ratio() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);

        stats.chunks_sent = 8;
        stats.retransmitted_chunks = 2;
        assert!((stats.retransmit_ratio() - 0.25).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Chunks: 8"));
    }
}
