//! 패킷 송신기
//!
//! 버퍼 하나 분량의 워드를 데이터 채널로 내보냄.
//! 첫 워드만 `first_key`, 나머지는 세션 base key.
//! 송신 큐 full 은 일시적 상태로 보고 재시도 정책에 따라 반복.

use tracing::trace;

use crate::chunk::RoutingKeys;
use crate::config::RetryPolicy;
use crate::host::DataTransport;
use crate::{Error, Result, END_FLAG};

/// 송신 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub words: usize,
    pub retries: u64,
}

impl SendReport {
    fn merge(&mut self, other: SendReport) {
        self.words += other.words;
        self.retries += other.retries;
    }
}

/// 데이터 채널 송신기
#[derive(Debug, Clone, Copy)]
pub struct Transmitter {
    keys: RoutingKeys,
    policy: RetryPolicy,
}

impl Transmitter {
    pub fn new(keys: RoutingKeys, policy: RetryPolicy) -> Self {
        Self { keys, policy }
    }

    pub fn keys(&self) -> RoutingKeys {
        self.keys
    }

    /// 워드 하나 송신 (재시도 포함)
    fn send_word<T: DataTransport>(&self, transport: &mut T, key: u32, payload: u32) -> Result<u64> {
        self.policy
            .run(|| transport.try_send(key, payload))
            .map_err(|attempts| Error::TransportWedged { key, attempts })
    }

    /// 청크 송신: 첫 워드는 `first_key`, 이후는 base key
    ///
    /// 버퍼 내용은 변경하지 않음
    pub fn send_chunk<T: DataTransport>(
        &self,
        transport: &mut T,
        words: &[u32],
        first_key: u32,
    ) -> Result<SendReport> {
        let mut report = SendReport::default();
        let mut key = first_key;

        for &word in words {
            report.merge(SendReport {
                words: 1,
                retries: self.send_word(transport, key, word)?,
            });
            key = self.keys.base();
        }

        trace!(
            "청크 송신: {} words, first_key={:08X}, retries={}",
            report.words,
            first_key,
            report.retries
        );
        Ok(report)
    }

    /// 패스 종료 sentinel 송신
    pub fn send_end_flag<T: DataTransport>(&self, transport: &mut T) -> Result<SendReport> {
        let retries = self.send_word(transport, self.keys.base(), END_FLAG)?;
        Ok(SendReport { words: 1, retries })
    }
}
