//! 호스트 협력자 인터페이스
//!
//! 세션 코어는 이벤트 런타임을 블랙박스로 가정하고 아래 primitive 만 사용:
//! - 비동기 스토리지 전송 (`Storage::try_transfer`, 완료는 태그로 통지)
//! - 논블로킹 패킷 송신 (`DataTransport::try_send`)
//! - 페이지 단위 메모리 할당/해제 (누락 목록 저장용)
//!
//! 동기 테스트 하네스용 구현 (`MemoryStorage`, `PacketLog`) 포함

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::warn;

use crate::chunk::Packet;
use crate::{Error, Result, WORD_SIZE};

/// 할당 단위 (바이트)
pub const PAGE_SIZE: usize = 4096;

/// 동적 할당 영역 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u32);

/// 스토리지 영역
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// 전송할 소스 블록 (읽기 전용)
    Source,

    /// 동적 할당 영역 (누락 목록)
    Allocated(RegionId),
}

/// 전송 태그 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    /// 원본 전송용 소스 블록 읽기
    OriginalRead,

    /// 누락 목록 페이지 읽기
    MissingPageRead,

    /// 재전송할 청크 읽기
    RetransmitRead,
}

/// 스토리지 전송 태그 (종류 + 패스 세대)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferTag {
    pub class: TagClass,
    pub generation: u32,
}

impl TransferTag {
    pub fn new(class: TagClass, generation: u32) -> Self {
        Self { class, generation }
    }
}

/// 읽은 데이터가 들어갈 버퍼 뱅크
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBank {
    /// 전송 버퍼
    Data,

    /// 누락 목록 페이지 버퍼
    MissingPage,
}

/// 읽기 목적지 (뱅크, 슬롯, 슬롯 내 워드 오프셋)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub bank: BufferBank,
    pub slot: usize,
    pub word_offset: usize,
}

/// 비동기 스토리지 전송 요청
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub tag: TransferTag,
    pub region: Region,
    pub byte_offset: usize,
    pub len: usize,
    pub destination: Destination,
}

/// 전송 완료 통지
#[derive(Debug, Clone)]
pub struct Completion {
    pub tag: TransferTag,
    pub data: Bytes,
}

/// 비동기 스토리지 primitive
pub trait Storage {
    /// 비동기 읽기 시작, 슬롯 busy 면 Ok(false) (호출측 재시도)
    ///
    /// 완료는 나중에 `Session::on_transfer_complete` 로 통지됨
    fn try_transfer(&mut self, request: &TransferRequest) -> Result<bool>;

    /// 페이지 단위 할당, 실패 시 None
    fn allocate(&mut self, bytes: usize) -> Option<RegionId>;

    /// 할당 해제
    fn free(&mut self, region: RegionId);

    /// 할당 영역에 워드 기록 (동기)
    fn write_words(&mut self, region: RegionId, word_offset: usize, words: &[u32]) -> Result<()>;
}

/// 논블로킹 데이터 채널 송신 primitive
pub trait DataTransport {
    /// 송신 큐가 가득 차면 false
    fn try_send(&mut self, key: u32, payload: u32) -> bool;
}

/// 영역 테이블
#[derive(Debug)]
struct RegionTable {
    source: Bytes,
    allocated: HashMap<RegionId, Vec<u8>>,
    next_id: u32,
    allocated_bytes: usize,
    allocation_limit: Option<usize>,
}

/// 소스 블록 + 할당 영역 (스레드 간 공유 가능)
#[derive(Debug, Clone)]
pub struct StorageRegions {
    inner: Arc<RwLock<RegionTable>>,
}

impl StorageRegions {
    pub fn new(source: Bytes) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegionTable {
                source,
                allocated: HashMap::new(),
                next_id: 1,
                allocated_bytes: 0,
                allocation_limit: None,
            })),
        }
    }

    /// 총 할당 가능 바이트 제한 (페이지 단위로 계산)
    pub fn with_allocation_limit(self, bytes: usize) -> Self {
        self.inner.write().allocation_limit = Some(bytes);
        self
    }

    /// 소스 블록 길이
    pub fn source_len(&self) -> usize {
        self.inner.read().source.len()
    }

    /// 영역 읽기, 범위는 영역 끝에서 잘림
    pub fn read(&self, region: Region, byte_offset: usize, len: usize) -> Result<Bytes> {
        let table = self.inner.read();
        match region {
            Region::Source => {
                let start = byte_offset.min(table.source.len());
                let end = (byte_offset + len).min(table.source.len());
                Ok(table.source.slice(start..end))
            }
            Region::Allocated(id) => {
                let data = table.allocated.get(&id).ok_or(Error::UnknownRegion(id))?;
                let start = byte_offset.min(data.len());
                let end = (byte_offset + len).min(data.len());
                Ok(Bytes::copy_from_slice(&data[start..end]))
            }
        }
    }

    /// 페이지 단위 할당
    ///
    /// 메모리를 확보하지 못하면 None (프로세스를 중단하지 않음)
    pub fn allocate(&self, bytes: usize) -> Option<RegionId> {
        let size = bytes.max(1).checked_next_multiple_of(PAGE_SIZE)?;

        let mut table = self.inner.write();
        if let Some(limit) = table.allocation_limit {
            if table.allocated_bytes.saturating_add(size) > limit {
                return None;
            }
        }

        let mut data = Vec::new();
        if let Err(e) = data.try_reserve_exact(size) {
            warn!("영역 할당 실패: {} bytes ({})", size, e);
            return None;
        }
        data.resize(size, 0);

        let id = RegionId(table.next_id);
        table.next_id += 1;
        table.allocated_bytes += size;
        table.allocated.insert(id, data);
        Some(id)
    }

    pub fn free(&self, region: RegionId) {
        let mut table = self.inner.write();
        if let Some(data) = table.allocated.remove(&region) {
            table.allocated_bytes -= data.len();
        }
    }

    /// 할당 영역에 LE 워드 기록
    pub fn write_words(&self, region: RegionId, word_offset: usize, words: &[u32]) -> Result<()> {
        let mut table = self.inner.write();
        let data = table
            .allocated
            .get_mut(&region)
            .ok_or(Error::UnknownRegion(region))?;

        let start = word_offset * WORD_SIZE;
        let end = start + words.len() * WORD_SIZE;
        if end > data.len() {
            return Err(Error::MissingListOverflow {
                capacity: data.len() / WORD_SIZE,
                requested: end / WORD_SIZE,
            });
        }

        for (i, word) in words.iter().enumerate() {
            let at = start + i * WORD_SIZE;
            data[at..at + WORD_SIZE].copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// 현재 할당된 영역 수
    pub fn allocated_regions(&self) -> usize {
        self.inner.read().allocated.len()
    }
}

/// 동기 하네스용 스토리지
///
/// 요청 시점에 데이터를 읽어 큐에 넣고, 하네스가 `next_completion` 으로 꺼내 통지
#[derive(Debug)]
pub struct MemoryStorage {
    regions: StorageRegions,
    pending: VecDeque<Completion>,
    busy_failures: u64,
    transfers_issued: u64,
}

impl MemoryStorage {
    pub fn new(source: Bytes) -> Self {
        Self::with_regions(StorageRegions::new(source))
    }

    pub fn with_regions(regions: StorageRegions) -> Self {
        Self {
            regions,
            pending: VecDeque::new(),
            busy_failures: 0,
            transfers_issued: 0,
        }
    }

    pub fn regions(&self) -> &StorageRegions {
        &self.regions
    }

    /// 다음 n번의 전송 요청을 busy 로 거절
    pub fn inject_busy(&mut self, failures: u64) {
        self.busy_failures = failures;
    }

    /// 가장 오래된 완료 통지
    pub fn next_completion(&mut self) -> Option<Completion> {
        self.pending.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn transfers_issued(&self) -> u64 {
        self.transfers_issued
    }
}

impl Storage for MemoryStorage {
    fn try_transfer(&mut self, request: &TransferRequest) -> Result<bool> {
        if self.busy_failures > 0 {
            self.busy_failures -= 1;
            return Ok(false);
        }

        let data = self
            .regions
            .read(request.region, request.byte_offset, request.len)?;
        self.pending.push_back(Completion {
            tag: request.tag,
            data,
        });
        self.transfers_issued += 1;
        Ok(true)
    }

    fn allocate(&mut self, bytes: usize) -> Option<RegionId> {
        self.regions.allocate(bytes)
    }

    fn free(&mut self, region: RegionId) {
        self.regions.free(region)
    }

    fn write_words(&mut self, region: RegionId, word_offset: usize, words: &[u32]) -> Result<()> {
        self.regions.write_words(region, word_offset, words)
    }
}

/// 송신 패킷을 기록하는 전송 (실패 주입 가능)
#[derive(Debug, Default)]
pub struct PacketLog {
    packets: Vec<Packet>,
    failures_left: u64,
    attempts: u64,
}

impl PacketLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음 n번의 송신 시도를 큐 full 로 거절
    pub fn fail_next(&mut self, failures: u64) {
        self.failures_left = failures;
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// 기록된 패킷을 꺼내고 비움
    pub fn take(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    /// 실패 포함 총 송신 시도 수
    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

impl DataTransport for PacketLog {
    fn try_send(&mut self, key: u32, payload: u32) -> bool {
        self.attempts += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return false;
        }
        self.packets.push(Packet::new(key, payload));
        true
    }
}

/// 테스트 패턴 블록 생성 (word i = i, LE)
///
/// 길이가 워드 배수가 아니면 마지막 워드는 잘림
pub fn test_pattern(bytes: usize) -> Bytes {
    let words = (bytes + WORD_SIZE - 1) / WORD_SIZE;
    let mut buf = BytesMut::with_capacity(words * WORD_SIZE);
    for i in 0..words {
        buf.put_u32_le(i as u32);
    }
    buf.truncate(bytes);
    buf.freeze()
}
