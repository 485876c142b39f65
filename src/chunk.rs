//! 시퀀스 코덱
//!
//! - Chunk: 전송 버퍼 하나 분량의 워드 묶음, 시퀀스 번호로 식별
//! - Packet: 데이터 채널의 전송 단위 (라우팅 키 + 페이로드 워드 1개)
//!
//! 청크 0 의 헤더 슬롯에는 블록 길이, 재전송 청크의 헤더 슬롯에는
//! 시퀀스 번호가 들어감. 데이터 워드 수는 모든 청크가 동일 (마지막 제외).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{END_FLAG, WORD_SIZE};

/// 시퀀스 번호 (원본 전송 시작부터의 청크 인덱스)
pub type SequenceNumber = u32;

/// 데이터그램 하나의 크기 (key + payload)
pub const PACKET_SIZE: usize = 8;

/// 데이터 채널 패킷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub key: u32,
    pub payload: u32,
}

impl Packet {
    pub fn new(key: u32, payload: u32) -> Self {
        Self { key, payload }
    }

    /// 데이터그램으로 직렬화 (LE)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_SIZE);
        buf.put_u32_le(self.key);
        buf.put_u32_le(self.payload);
        buf.freeze()
    }

    /// 데이터그램에서 역직렬화
    pub fn from_bytes(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PACKET_SIZE {
            return None;
        }
        let key = bytes.get_u32_le();
        let payload = bytes.get_u32_le();
        Some(Self { key, payload })
    }
}

/// 수신측에서 본 패킷 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// 원본 전송 청크 0 의 첫 워드 (블록 길이)
    PassStart,

    /// 재전송 청크의 첫 워드 (시퀀스 번호)
    RetransmitStart,

    /// 현재 청크의 이어지는 데이터 워드
    Continuation,

    /// 패스 종료 sentinel
    EndOfPass,
}

/// 세션 라우팅 키 집합
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingKeys {
    base: u32,
}

impl RoutingKeys {
    pub fn new(base: u32) -> Self {
        Self { base }
    }

    /// 이어지는 워드와 sentinel 에 쓰는 키
    pub fn base(&self) -> u32 {
        self.base
    }

    /// 재전송 청크 첫 워드 키
    pub fn retransmit_start(&self) -> u32 {
        self.base.wrapping_add(1)
    }

    /// 원본 전송 첫 청크의 첫 워드 키
    pub fn pass_start(&self) -> u32 {
        self.base.wrapping_add(2)
    }

    /// 패킷 분류, 이 세션의 키가 아니면 None
    pub fn classify(&self, packet: Packet) -> Option<PacketKind> {
        if packet.key == self.base {
            if packet.payload == END_FLAG {
                Some(PacketKind::EndOfPass)
            } else {
                Some(PacketKind::Continuation)
            }
        } else if packet.key == self.retransmit_start() {
            Some(PacketKind::RetransmitStart)
        } else if packet.key == self.pass_start() {
            Some(PacketKind::PassStart)
        } else {
            None
        }
    }
}

/// 시퀀스 번호 하나가 덮는 소스 블록 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub seq: SequenceNumber,
    pub byte_offset: usize,
    pub byte_len: usize,
}

impl ChunkSpan {
    /// 이 범위를 담는 워드 수 (마지막 부분 워드 포함)
    pub fn words(&self) -> usize {
        words_for_bytes(self.byte_len)
    }
}

/// 소스 블록을 청크로 나누는 격자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrid {
    total_bytes: u32,
    data_words: usize,
}

impl ChunkGrid {
    /// `items_per_packet` 는 헤더 슬롯을 포함한 버퍼 워드 수
    pub fn new(total_bytes: u32, items_per_packet: usize) -> Self {
        Self {
            total_bytes,
            data_words: items_per_packet.saturating_sub(1).max(1),
        }
    }

    pub fn total_bytes(&self) -> u32 {
        self.total_bytes
    }

    /// 청크당 데이터 워드 수
    pub fn data_words_per_chunk(&self) -> usize {
        self.data_words
    }

    /// 청크당 데이터 바이트 수
    pub fn chunk_capacity_bytes(&self) -> usize {
        self.data_words * WORD_SIZE
    }

    /// 블록 전체 워드 수 (올림)
    pub fn total_words(&self) -> usize {
        words_for_bytes(self.total_bytes as usize)
    }

    /// 청크 수
    pub fn chunk_count(&self) -> u32 {
        let words = self.total_words();
        ((words + self.data_words - 1) / self.data_words) as u32
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        seq < self.chunk_count()
    }

    /// 시퀀스 번호의 바이트 오프셋
    pub fn byte_offset(&self, seq: SequenceNumber) -> usize {
        seq as usize * self.chunk_capacity_bytes()
    }

    /// 시퀀스 번호가 덮는 범위, 블록 밖이면 None
    ///
    /// 마지막 청크는 남은 바이트만큼만 읽음
    pub fn span(&self, seq: SequenceNumber) -> Option<ChunkSpan> {
        if !self.contains(seq) {
            return None;
        }
        let byte_offset = self.byte_offset(seq);
        let remaining = self.total_bytes as usize - byte_offset;

        Some(ChunkSpan {
            seq,
            byte_offset,
            byte_len: remaining.min(self.chunk_capacity_bytes()),
        })
    }

    /// 바이트 오프셋에서 시작하는 다음 읽기 크기
    pub fn next_read_len(&self, byte_offset: usize) -> usize {
        (self.total_bytes as usize)
            .saturating_sub(byte_offset)
            .min(self.chunk_capacity_bytes())
    }
}

/// 바이트 수를 워드 수로 (올림)
pub fn words_for_bytes(bytes: usize) -> usize {
    (bytes + WORD_SIZE - 1) / WORD_SIZE
}

/// LE 바이트를 워드로 변환, 마지막 부분 워드는 0으로 채움
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(WORD_SIZE)
        .map(|chunk| {
            let mut word = [0u8; WORD_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}

/// 워드를 LE 바이트로 변환
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(words.len() * WORD_SIZE);
    for word in words {
        buf.put_u32_le(*word);
    }
    buf
}
