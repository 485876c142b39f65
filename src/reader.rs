//! 이중 버퍼 리더
//!
//! 한 버퍼가 전송되는 동안 다른 버퍼로 다음 청크를 비동기 읽기.
//! 슬롯 하나는 읽기 1회 → 전송 1회 후에만 다시 arm 가능.

use bytes::Bytes;
use tracing::trace;

use crate::chunk::{bytes_to_words, words_for_bytes};
use crate::config::RetryPolicy;
use crate::host::{BufferBank, Destination, Region, Storage, TransferRequest, TransferTag};
use crate::{Error, Result, N_DMA_BUFFERS};

/// 슬롯 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// 비어 있음 (읽기 가능)
    Free,

    /// 읽기 진행 중
    Armed { word_offset: usize, words: usize },

    /// 읽기 완료, 전송 대기
    Filled { len: usize },
}

/// 라운드 로빈 버퍼 뱅크
#[derive(Debug)]
pub struct RotatingBuffers {
    bank: BufferBank,
    slots: [Vec<u32>; N_DMA_BUFFERS],
    states: [SlotState; N_DMA_BUFFERS],
    active: usize,
    pending: Option<usize>,
}

impl RotatingBuffers {
    pub fn new(bank: BufferBank, items: usize) -> Self {
        Self {
            bank,
            slots: std::array::from_fn(|_| vec![0u32; items]),
            states: [SlotState::Free; N_DMA_BUFFERS],
            active: 0,
            pending: None,
        }
    }

    /// 모든 슬롯 비우고 회전 위치 초기화
    pub fn reset(&mut self) {
        self.states = [SlotState::Free; N_DMA_BUFFERS];
        self.active = 0;
        self.pending = None;
    }

    /// 슬롯 용량 (워드)
    pub fn capacity(&self) -> usize {
        self.slots[0].len()
    }

    /// 읽기 진행 중인 슬롯이 있는지
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// 다음 슬롯으로 회전하고 읽기 목적지로 arm
    fn arm_next(&mut self, word_offset: usize, words: usize) -> Result<Destination> {
        let slot = (self.active + 1) % N_DMA_BUFFERS;
        if self.pending.is_some() || self.states[slot] != SlotState::Free {
            return Err(Error::BufferInUse { slot });
        }

        self.active = slot;
        self.pending = Some(slot);
        self.states[slot] = SlotState::Armed { word_offset, words };

        Ok(Destination {
            bank: self.bank,
            slot,
            word_offset,
        })
    }

    /// 실패한 arm 되돌리기
    fn disarm(&mut self) {
        if let Some(slot) = self.pending.take() {
            self.states[slot] = SlotState::Free;
            self.active = (slot + N_DMA_BUFFERS - 1) % N_DMA_BUFFERS;
        }
    }

    /// 진행 중인 읽기의 데이터를 슬롯에 기록, 채워진 슬롯 반환
    fn land(&mut self, data: &Bytes) -> Option<usize> {
        let slot = self.pending.take()?;
        let SlotState::Armed { word_offset, words } = self.states[slot] else {
            return None;
        };

        let landed = bytes_to_words(data);
        let count = landed.len().min(words);
        let buffer = &mut self.slots[slot];
        buffer[word_offset..word_offset + count].copy_from_slice(&landed[..count]);
        // 짧게 도착한 부분은 0
        buffer[word_offset + count..word_offset + words].fill(0);

        self.states[slot] = SlotState::Filled {
            len: word_offset + words,
        };
        Some(slot)
    }

    /// 채워진 슬롯의 워드들
    pub fn filled(&self, slot: usize) -> &[u32] {
        match self.states[slot] {
            SlotState::Filled { len } => &self.slots[slot][..len],
            _ => &[],
        }
    }

    /// 헤더 슬롯 기록 (채워진 슬롯만)
    pub fn set_word(&mut self, slot: usize, index: usize, value: u32) {
        if let SlotState::Filled { len } = self.states[slot] {
            if index < len {
                self.slots[slot][index] = value;
            }
        }
    }

    /// 전송 끝난 슬롯 반환
    pub fn release(&mut self, slot: usize) {
        if matches!(self.states[slot], SlotState::Filled { .. }) {
            self.states[slot] = SlotState::Free;
        }
    }
}

/// `issue_read` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIssued {
    pub slot: usize,
    pub retries: u64,
}

/// 커서 기반 이중 버퍼 리더
#[derive(Debug)]
pub struct DoubleBufferedReader {
    region: Region,
    cursor: usize,
    buffers: RotatingBuffers,
}

impl DoubleBufferedReader {
    pub fn new(region: Region, bank: BufferBank, items: usize) -> Self {
        Self {
            region,
            cursor: 0,
            buffers: RotatingBuffers::new(bank, items),
        }
    }

    /// 커서와 버퍼 회전 초기화
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.buffers.reset();
    }

    /// 읽을 영역 변경 (커서 초기화)
    pub fn set_region(&mut self, region: Region) {
        self.region = region;
        self.reset();
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// 현재 커서 (바이트)
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// 커서 이동
    pub fn seek(&mut self, byte_offset: usize) {
        self.cursor = byte_offset;
    }

    pub fn buffers(&self) -> &RotatingBuffers {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut RotatingBuffers {
        &mut self.buffers
    }

    /// 커서 위치에서 `byte_count` 바이트를 다음 슬롯의 `word_offset` 위치로 비동기 읽기
    ///
    /// 즉시 반환, 완료는 `tag` 로 통지됨. 커서는 `byte_count` 만큼 전진.
    pub fn issue_read<S: Storage>(
        &mut self,
        storage: &mut S,
        policy: RetryPolicy,
        tag: TransferTag,
        word_offset: usize,
        byte_count: usize,
    ) -> Result<ReadIssued> {
        let words = words_for_bytes(byte_count);
        if word_offset + words > self.buffers.capacity() {
            return Err(Error::InvalidConfig(format!(
                "읽기 크기 초과: offset={} words={} capacity={}",
                word_offset,
                words,
                self.buffers.capacity()
            )));
        }

        let destination = self.buffers.arm_next(word_offset, words)?;
        let request = TransferRequest {
            tag,
            region: self.region,
            byte_offset: self.cursor,
            len: byte_count,
            destination,
        };

        let mut failure = None;
        let outcome = policy.run(|| match storage.try_transfer(&request) {
            Ok(accepted) => accepted,
            Err(e) => {
                failure = Some(e);
                true
            }
        });

        if let Some(e) = failure {
            self.buffers.disarm();
            return Err(e);
        }

        let retries = match outcome {
            Ok(retries) => retries,
            Err(attempts) => {
                self.buffers.disarm();
                return Err(Error::StorageBusy { attempts });
            }
        };

        trace!(
            "읽기 시작: {:?} offset={} len={} slot={}",
            tag.class,
            self.cursor,
            byte_count,
            destination.slot
        );

        self.cursor += byte_count;
        Ok(ReadIssued {
            slot: destination.slot,
            retries,
        })
    }

    /// 완료된 읽기 데이터를 슬롯에 반영, 채워진 슬롯 반환
    ///
    /// 진행 중인 읽기가 없으면 None
    pub fn complete(&mut self, data: &Bytes) -> Option<usize> {
        self.buffers.land(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{test_pattern, MemoryStorage, TagClass};

    fn tag() -> TransferTag {
        TransferTag::new(TagClass::OriginalRead, 1)
    }

    #[test]
    fn test_reads_rotate_slots() {
        let mut storage = MemoryStorage::new(test_pattern(64));
        let mut reader = DoubleBufferedReader::new(Region::Source, BufferBank::Data, 4);

        let first = reader
            .issue_read(&mut storage, RetryPolicy::Spin, tag(), 1, 12)
            .unwrap();
        let completion = storage.next_completion().unwrap();
        assert_eq!(reader.complete(&completion.data), Some(first.slot));
        assert_eq!(reader.buffers().filled(first.slot), &[0, 0, 1, 2]);

        // 앞 슬롯이 전송 전이어도 다른 슬롯은 arm 가능
        let second = reader
            .issue_read(&mut storage, RetryPolicy::Spin, tag(), 0, 8)
            .unwrap();
        assert_ne!(first.slot, second.slot);
        assert_eq!(reader.cursor(), 20);

        let completion = storage.next_completion().unwrap();
        reader.complete(&completion.data);
        assert_eq!(reader.buffers().filled(second.slot), &[3, 4]);
    }

    #[test]
    fn test_unsent_slot_cannot_be_rearmed() {
        let mut storage = MemoryStorage::new(test_pattern(64));
        let mut reader = DoubleBufferedReader::new(Region::Source, BufferBank::Data, 4);

        for _ in 0..2 {
            reader
                .issue_read(&mut storage, RetryPolicy::Spin, tag(), 0, 4)
                .unwrap();
            let completion = storage.next_completion().unwrap();
            reader.complete(&completion.data);
        }

        let third = reader.issue_read(&mut storage, RetryPolicy::Spin, tag(), 0, 4);
        assert!(matches!(third, Err(Error::BufferInUse { .. })));

        reader.buffers_mut().release(0);
        reader.buffers_mut().release(1);
        assert!(reader
            .issue_read(&mut storage, RetryPolicy::Spin, tag(), 0, 4)
            .is_ok());
    }

    #[test]
    fn test_bounded_retry_disarms_slot() {
        let mut storage = MemoryStorage::new(test_pattern(64));
        storage.inject_busy(10);
        let mut reader = DoubleBufferedReader::new(Region::Source, BufferBank::Data, 4);

        let result = reader.issue_read(
            &mut storage,
            RetryPolicy::Bounded { max_attempts: 3 },
            tag(),
            0,
            4,
        );
        assert!(matches!(result, Err(Error::StorageBusy { attempts: 3 })));
        assert!(!reader.buffers().has_pending());
        assert_eq!(reader.cursor(), 0);
    }

    #[test]
    fn test_short_tail_read_is_zero_padded() {
        let mut storage = MemoryStorage::new(test_pattern(6));
        let mut reader = DoubleBufferedReader::new(Region::Source, BufferBank::Data, 4);

        let issued = reader
            .issue_read(&mut storage, RetryPolicy::Spin, tag(), 0, 6)
            .unwrap();
        let completion = storage.next_completion().unwrap();
        assert_eq!(completion.data.len(), 6);
        reader.complete(&completion.data);
        assert_eq!(reader.buffers().filled(issued.slot), &[0, 1]);
    }
}
