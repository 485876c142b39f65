//! # MCS (Multicast Chunk Stream)
//!
//! 손실 있는 멀티캐스트 위의 대용량 블록 전송 프로토콜
//!
//! ## 핵심 특징
//! - **이중 버퍼**: 한 버퍼를 송신하는 동안 다음 청크를 스토리지에서 비동기 읽기
//! - **NACK 기반**: 수신측은 누락 시퀀스 번호만 컨트롤 채널로 요청
//! - **라우팅 키 마커**: 패스 시작 K+2, 재전송 청크 K+1, 나머지 K
//! - **END_FLAG sentinel**: 모든 패스는 sentinel 로 끝남
//! - **세대 태그**: 재시작 시 이전 패스의 완료 통지 무시
//!
//! 세션 코어(`Session`)는 단일 스레드 이벤트 핸들러 집합이고,
//! 스토리지와 데이터 채널은 `host` 의 trait 으로 주입됨.

pub mod chunk;
pub mod config;
pub mod error;
pub mod host;
pub mod message;
mod original;
pub mod reader;
pub mod receiver;
mod retransmit;
pub mod runtime;
pub mod sender;
pub mod stats;
pub mod tracker;
pub mod transmitter;

pub use chunk::{ChunkGrid, Packet, PacketKind, RoutingKeys, SequenceNumber};
pub use config::{Config, Descriptor, RetryPolicy};
pub use error::{Error, Result};
pub use host::{DataTransport, Storage};
pub use message::{ControlMessage, MissingListRequest};
pub use receiver::{PassDecoder, Reassembler};
pub use runtime::{ReceiverClient, SenderHost};
pub use sender::{Session, SessionState};
pub use stats::TransferStats;

/// 전송 버퍼 하나의 워드 수 (헤더 슬롯 포함)
pub const ITEMS_PER_DATA_PACKET: usize = 68;

/// 회전 버퍼 수
pub const N_DMA_BUFFERS: usize = 2;

/// 패스 종료 sentinel / 누락 목록 종료 표시
pub const END_FLAG: u32 = 0xFFFF_FFFF;

/// 워드 크기 (바이트)
pub const WORD_SIZE: usize = 4;
