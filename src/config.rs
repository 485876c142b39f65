//! 프로토콜 설정
//!
//! - `Config`: 세션 동작 파라미터
//! - `Descriptor`: 프로세스 기동 시 한 번 읽는 설정 blob (이름 있는 영역들)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, ITEMS_PER_DATA_PACKET};

/// 기본 최대 블록 길이 (256 MiB)
pub const DEFAULT_MAX_BLOCK_BYTES: u32 = 256 * 1024 * 1024;

/// 전송/스토리지 재시도 정책
///
/// 전송 큐 full, DMA 슬롯 busy 는 일시적 상태로 간주
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// 성공할 때까지 무한 busy retry (기본)
    Spin,

    /// 시도 사이마다 스레드를 양보하며 무한 재시도
    Yield,

    /// 최대 시도 횟수 초과 시 세션 중단
    Bounded { max_attempts: u64 },
}

impl RetryPolicy {
    /// `attempt` 가 true 를 돌려줄 때까지 반복
    ///
    /// 성공 시 재시도 횟수(첫 시도 제외), 실패 시 총 시도 횟수 반환
    pub fn run<F>(&self, mut attempt: F) -> std::result::Result<u64, u64>
    where
        F: FnMut() -> bool,
    {
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            if attempt() {
                return Ok(attempts - 1);
            }

            if let RetryPolicy::Bounded { max_attempts } = *self {
                if attempts >= max_attempts {
                    return Err(attempts);
                }
            }

            match self {
                RetryPolicy::Yield => std::thread::yield_now(),
                _ => std::hint::spin_loop(),
            }
        }
    }
}

/// MCS 세션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 세션 라우팅 키 (base key)
    /// key+1: 재전송 청크 시작, key+2: 원본 전송 시작
    pub routing_key: u32,

    /// 전송 버퍼당 워드 수 (헤더 슬롯 1개 포함)
    pub items_per_packet: usize,

    /// 컨트롤 메시지 최대 워드 수 (커맨드 코드 포함)
    pub control_message_words: usize,

    /// 전송 큐 / 스토리지 재시도 정책
    pub retry_policy: RetryPolicy,

    /// 통계 로그 주기 (tick 수, 0이면 비활성)
    pub stats_log_interval_ticks: u64,

    /// 런타임 tick 간격 (밀리초)
    pub tick_interval_ms: u64,

    /// 런타임 스토리지 읽기 지연 (마이크로초)
    /// 0이면 지연 없이 완료
    pub storage_latency_us: u64,

    /// 수신측이 받아들이는 최대 블록 길이 (바이트)
    pub max_block_bytes: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing_key: 0x0001_0000,
            items_per_packet: ITEMS_PER_DATA_PACKET,
            control_message_words: ITEMS_PER_DATA_PACKET,
            retry_policy: RetryPolicy::Spin,
            stats_log_interval_ticks: 1000, // 1ms tick 기준 1초
            tick_interval_ms: 1,
            storage_latency_us: 0,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 라우팅 키 지정
    pub fn with_routing_key(mut self, routing_key: u32) -> Self {
        self.routing_key = routing_key;
        self
    }

    /// 청크당 데이터 워드 수 (헤더 슬롯 제외)
    pub fn data_words_per_chunk(&self) -> usize {
        self.items_per_packet - 1
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.items_per_packet < 3 {
            return Err(Error::InvalidConfig(format!(
                "items_per_packet 는 3 이상이어야 함: {}",
                self.items_per_packet
            )));
        }
        if self.control_message_words < 3 {
            return Err(Error::InvalidConfig(format!(
                "control_message_words 는 3 이상이어야 함: {}",
                self.control_message_words
            )));
        }
        if self.routing_key > u32::MAX - 2 {
            return Err(Error::InvalidConfig(format!(
                "routing_key {:08X} 는 key+2 공간과 겹침",
                self.routing_key
            )));
        }
        if let RetryPolicy::Bounded { max_attempts: 0 } = self.retry_policy {
            return Err(Error::InvalidConfig("max_attempts 는 1 이상이어야 함".into()));
        }
        Ok(())
    }

    /// 저지연 설정 (짧은 tick, 재시도 상한)
    pub fn low_latency() -> Self {
        Self {
            retry_policy: RetryPolicy::Bounded {
                max_attempts: 1_000_000,
            },
            stats_log_interval_ticks: 5000,
            tick_interval_ms: 1,
            storage_latency_us: 0,
            ..Self::default()
        }
    }

    /// 제한된 환경용 설정 (작은 버퍼, 느린 스토리지)
    pub fn constrained() -> Self {
        Self {
            items_per_packet: 16,
            control_message_words: 16,
            stats_log_interval_ticks: 100,
            tick_interval_ms: 10,
            storage_latency_us: 50,
            ..Self::default()
        }
    }
}

/// 시스템 영역 ID
pub const SYSTEM_REGION: u32 = 0;

/// 설정 영역 ID
pub const CONFIG_REGION: u32 = 1;

/// 설정 영역 내 워드 위치
const MY_KEY: usize = 0;
const BYTES_TO_WRITE: usize = 1;

/// Descriptor blob 버전
pub const DESCRIPTOR_VERSION: u8 = 1;

/// Descriptor 의 이름 있는 영역
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRegion {
    pub id: u32,
    pub label: String,
    pub words: Vec<u32>,
}

/// 기동 시 읽는 설정 blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub version: u8,
    pub regions: Vec<DescriptorRegion>,
}

/// Descriptor 에서 읽은 세션 파라미터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub routing_key: u32,
    pub bytes_to_write: u32,
}

impl Descriptor {
    /// 세션 파라미터로 descriptor 생성
    pub fn new(routing_key: u32, bytes_to_write: u32) -> Self {
        let mut config_words = vec![0u32; 2];
        config_words[MY_KEY] = routing_key;
        config_words[BYTES_TO_WRITE] = bytes_to_write;

        Self {
            version: DESCRIPTOR_VERSION,
            regions: vec![
                DescriptorRegion {
                    id: SYSTEM_REGION,
                    label: "systemInfo".into(),
                    words: Vec::new(),
                },
                DescriptorRegion {
                    id: CONFIG_REGION,
                    label: "config".into(),
                    words: config_words,
                },
            ],
        }
    }

    /// 영역 조회
    pub fn region(&self, id: u32) -> Option<&DescriptorRegion> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// CONFIG 영역에서 세션 파라미터 추출
    pub fn session_params(&self) -> Result<SessionParams> {
        if self.version != DESCRIPTOR_VERSION {
            return Err(Error::InvalidConfig(format!(
                "descriptor version 불일치: expected {}, got {}",
                DESCRIPTOR_VERSION, self.version
            )));
        }

        let region = self
            .region(CONFIG_REGION)
            .ok_or_else(|| Error::InvalidConfig("CONFIG 영역 없음".into()))?;

        if region.words.len() <= BYTES_TO_WRITE {
            return Err(Error::InvalidConfig(format!(
                "CONFIG 영역이 너무 짧음: {} words",
                region.words.len()
            )));
        }

        Ok(SessionParams {
            routing_key: region.words[MY_KEY],
            bytes_to_write: region.words[BYTES_TO_WRITE],
        })
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// 파일에서 로드
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// 파일로 저장
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_retry_gives_up() {
        let policy = RetryPolicy::Bounded { max_attempts: 3 };
        let mut calls = 0;
        let result = policy.run(|| {
            calls += 1;
            false
        });

        assert_eq!(result, Err(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_spin_retry_counts_failures() {
        let mut failures_left = 5;
        let result = RetryPolicy::Spin.run(|| {
            if failures_left == 0 {
                true
            } else {
                failures_left -= 1;
                false
            }
        });

        assert_eq!(result, Ok(5));
    }

    #[test]
    fn test_yield_retry_is_unbounded() {
        let mut calls = 0;
        let result = RetryPolicy::Yield.run(|| {
            calls += 1;
            calls > 1000
        });

        assert_eq!(result, Ok(1000));
    }

    #[test]
    fn test_validate_rejects_key_overflow() {
        let config = Config::default().with_routing_key(u32::MAX - 1);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        assert!(Config::default().validate().is_ok());
        assert!(Config::constrained().validate().is_ok());
    }

    #[test]
    fn test_descriptor_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.desc");

        Descriptor::new(0x1234, 1000).save(&path).unwrap();
        let params = Descriptor::load(&path).unwrap().session_params().unwrap();

        assert_eq!(
            params,
            SessionParams {
                routing_key: 0x1234,
                bytes_to_write: 1000
            }
        );
    }

    #[test]
    fn test_descriptor_without_config_region() {
        let mut descriptor = Descriptor::new(1, 2);
        descriptor.regions.retain(|r| r.id != CONFIG_REGION);
        assert!(descriptor.session_params().is_err());
    }
}
