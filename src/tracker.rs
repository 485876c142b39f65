//! 누락 시퀀스 추적기
//!
//! 컨트롤 채널로 들어오는 누락 시퀀스 번호를 외부 메모리 영역에 누적.
//! 선언된 메시지 수를 모두 받으면 END_FLAG 를 붙이고 완료 보고.

use tracing::debug;

use crate::chunk::SequenceNumber;
use crate::host::{RegionId, Storage};
use crate::{Error, Result, END_FLAG, WORD_SIZE};

/// append 이후 추적기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerProgress {
    /// 아직 후속 메시지 대기 중
    Collecting { messages_remaining: u32 },

    /// 라운드 완료, sentinel 포함 기록된 워드 수
    Complete { written_words: usize },
}

/// 누락 시퀀스 추적기
#[derive(Debug)]
pub struct MissingSequenceTracker {
    /// 컨트롤 메시지 최대 워드 수
    message_capacity: usize,

    /// 현재 라운드의 누락 목록 영역
    region: Option<RegionId>,

    /// 영역 용량 (워드, sentinel 슬롯 포함)
    capacity_words: usize,

    /// 기록된 워드 수 (라운드 내 단조 증가)
    written_words: usize,

    /// 선언된 메시지 수
    expected_messages: u32,

    /// 남은 메시지 수
    messages_remaining: u32,

    /// 라운드 진행 중 여부
    collecting: bool,
}

impl MissingSequenceTracker {
    pub fn new(message_capacity: usize) -> Self {
        Self {
            message_capacity,
            region: None,
            capacity_words: 0,
            written_words: 0,
            expected_messages: 0,
            messages_remaining: 0,
            collecting: false,
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    pub fn region(&self) -> Option<RegionId> {
        self.region
    }

    pub fn written_words(&self) -> usize {
        self.written_words
    }

    pub fn expected_messages(&self) -> u32 {
        self.expected_messages
    }

    /// 새 라운드 시작
    ///
    /// 이전 영역 해제 후 최악의 경우 크기로 재할당
    pub fn start_round<S: Storage>(
        &mut self,
        storage: &mut S,
        expected_messages: u32,
        seqs: &[SequenceNumber],
    ) -> Result<TrackerProgress> {
        self.release(storage);

        let capacity_words = (expected_messages as usize)
            .checked_mul(self.message_capacity)
            .and_then(|words| words.checked_add(1))
            .ok_or(Error::AllocationFailed { bytes: usize::MAX })?;
        let bytes = capacity_words
            .checked_mul(WORD_SIZE)
            .ok_or(Error::AllocationFailed { bytes: usize::MAX })?;
        let region = storage
            .allocate(bytes)
            .ok_or(Error::AllocationFailed { bytes })?;

        debug!(
            "누락 목록 라운드 시작: {} messages, {} bytes 할당",
            expected_messages, bytes
        );

        self.region = Some(region);
        self.capacity_words = capacity_words;
        self.expected_messages = expected_messages;
        self.messages_remaining = expected_messages;
        self.collecting = true;

        self.append(storage, seqs)
    }

    /// 후속 메시지 반영, 열린 라운드가 없으면 None
    pub fn continue_round<S: Storage>(
        &mut self,
        storage: &mut S,
        seqs: &[SequenceNumber],
    ) -> Result<Option<TrackerProgress>> {
        if !self.collecting {
            return Ok(None);
        }
        self.append(storage, seqs).map(Some)
    }

    fn append<S: Storage>(
        &mut self,
        storage: &mut S,
        seqs: &[SequenceNumber],
    ) -> Result<TrackerProgress> {
        let region = self.region.ok_or(Error::AllocationFailed { bytes: 0 })?;

        // 마지막 슬롯은 sentinel 용
        let requested = self.written_words + seqs.len();
        if requested > self.capacity_words - 1 {
            return Err(Error::MissingListOverflow {
                capacity: self.capacity_words,
                requested,
            });
        }

        storage.write_words(region, self.written_words, seqs)?;
        self.written_words = requested;
        self.messages_remaining -= 1;

        if self.messages_remaining > 0 {
            return Ok(TrackerProgress::Collecting {
                messages_remaining: self.messages_remaining,
            });
        }

        storage.write_words(region, self.written_words, &[END_FLAG])?;
        self.written_words += 1;
        self.collecting = false;

        Ok(TrackerProgress::Complete {
            written_words: self.written_words,
        })
    }

    /// 진행 중인 라운드 포기 (영역은 유지)
    pub fn abandon(&mut self) {
        self.collecting = false;
        self.messages_remaining = 0;
    }

    /// 영역 해제 및 초기화
    pub fn release<S: Storage>(&mut self, storage: &mut S) {
        if let Some(region) = self.region.take() {
            storage.free(region);
        }
        self.capacity_words = 0;
        self.written_words = 0;
        self.expected_messages = 0;
        self.messages_remaining = 0;
        self.collecting = false;
    }
}
