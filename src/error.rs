//! 에러 타입 정의

use thiserror::Error;

use crate::host::RegionId;

/// MCS 프로토콜 에러 타입
///
/// 잘못된 컨트롤 메시지는 에러가 아님 (로그 후 무시)
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("누락 목록 메모리 할당 실패: {bytes} bytes")]
    AllocationFailed { bytes: usize },

    #[error("누락 목록 오버플로우: capacity={capacity} words, requested={requested} words")]
    MissingListOverflow { capacity: usize, requested: usize },

    #[error("알 수 없는 메모리 영역: {0:?}")]
    UnknownRegion(RegionId),

    #[error("전송 큐가 응답하지 않음: key={key:08X}, {attempts}회 시도")]
    TransportWedged { key: u32, attempts: u64 },

    #[error("스토리지 전송 슬롯 busy: {attempts}회 시도")]
    StorageBusy { attempts: u64 },

    #[error("버퍼 슬롯 {slot} 가 아직 전송되지 않음")]
    BufferInUse { slot: usize },

    #[error("전송 미완료: {missing} chunks 누락")]
    TransferIncomplete { missing: usize },

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
