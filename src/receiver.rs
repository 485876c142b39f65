//! 수신측 디코더 / 조립기
//!
//! - PassDecoder: 데이터 채널 패킷 → (시퀀스 번호, 데이터 워드) 프레임
//! - Reassembler: 프레임을 청크 격자 위에 조립, 누락 시퀀스 계산
//!
//! 원본 패스는 청크 0 헤더의 블록 길이로 격자를 알아낸 뒤 위치로 분할.
//! 재전송 청크는 K+1 마커로 구분됨.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::chunk::{words_to_bytes, ChunkGrid, Packet, PacketKind, RoutingKeys, SequenceNumber};
use crate::config::DEFAULT_MAX_BLOCK_BYTES;
use crate::{Error, Result};

/// 디코딩된 청크
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: SequenceNumber,
    pub words: Vec<u32>,
    pub retransmitted: bool,
}

/// 패스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Original,
    Retransmission,

    /// 데이터 없이 sentinel 만 온 패스
    Empty,
}

/// 패스 종료 요약
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub kind: PassKind,

    /// 원본 패스의 워드 수가 격자와 맞았는지 (재전송은 항상 true)
    pub aligned: bool,

    /// 이 패스에서 내보낸 프레임 수
    pub frames: usize,
}

/// 디코더 출력
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    Frame(Frame),
    PassEnd(PassSummary),
}

/// 디코딩 상태
#[derive(Debug)]
enum Mode {
    Idle,

    /// 원본 패스: 프레임은 sentinel 까지 보류
    Original {
        grid: ChunkGrid,
        next_seq: SequenceNumber,
        current: Vec<u32>,
        frames: Vec<Frame>,
        aligned: bool,
    },

    Retransmit {
        current: Option<(SequenceNumber, Vec<u32>)>,
        frames: usize,
    },

    /// 블록 길이 제한을 넘은 원본 패스: sentinel 까지 버림
    Rejected,
}

/// 데이터 채널 디코더
#[derive(Debug)]
pub struct PassDecoder {
    keys: RoutingKeys,
    items_per_packet: usize,
    max_block_bytes: u32,
    grid: Option<ChunkGrid>,
    mode: Mode,
}

impl PassDecoder {
    pub fn new(keys: RoutingKeys, items_per_packet: usize) -> Self {
        Self {
            keys,
            items_per_packet,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            grid: None,
            mode: Mode::Idle,
        }
    }

    /// 받아들일 최대 블록 길이 지정
    pub fn with_max_block_bytes(mut self, max_block_bytes: u32) -> Self {
        self.max_block_bytes = max_block_bytes;
        self
    }

    /// 마지막 원본 패스에서 알아낸 격자
    pub fn grid(&self) -> Option<ChunkGrid> {
        self.grid
    }

    /// 패킷 하나 처리
    pub fn push(&mut self, packet: Packet) -> Vec<DecodeEvent> {
        let mut events = Vec::new();

        match self.keys.classify(packet) {
            None => {}
            Some(PacketKind::PassStart) => {
                self.close_pass(&mut events, false);
                if packet.payload > self.max_block_bytes {
                    warn!(
                        "블록 길이 제한 초과: {} bytes (최대 {}), 패스 무시",
                        packet.payload, self.max_block_bytes
                    );
                    self.mode = Mode::Rejected;
                    return events;
                }
                let grid = ChunkGrid::new(packet.payload, self.items_per_packet);
                self.grid = Some(grid);
                self.mode = Mode::Original {
                    grid,
                    next_seq: 0,
                    current: Vec::new(),
                    frames: Vec::new(),
                    aligned: true,
                };
            }
            Some(PacketKind::RetransmitStart) => {
                if let Mode::Retransmit { current, frames } = &mut self.mode {
                    if let Some(frame) = take_retransmitted(current) {
                        *frames += 1;
                        events.push(DecodeEvent::Frame(frame));
                    }
                    *current = Some((packet.payload, Vec::new()));
                } else {
                    self.close_pass(&mut events, false);
                    self.mode = Mode::Retransmit {
                        current: Some((packet.payload, Vec::new())),
                        frames: 0,
                    };
                }
            }
            Some(PacketKind::Continuation) => self.push_word(packet.payload),
            Some(PacketKind::EndOfPass) => self.close_pass(&mut events, true),
        }

        events
    }

    fn push_word(&mut self, word: u32) {
        match &mut self.mode {
            Mode::Idle => debug!("패스 밖 워드 무시"),
            Mode::Rejected => {}
            Mode::Original {
                grid,
                next_seq,
                current,
                frames,
                aligned,
            } => {
                let span = match grid.span(*next_seq) {
                    Some(span) => span,
                    None => {
                        *aligned = false;
                        return;
                    }
                };

                current.push(word);
                if current.len() == span.words() {
                    frames.push(Frame {
                        seq: *next_seq,
                        words: std::mem::take(current),
                        retransmitted: false,
                    });
                    *next_seq += 1;
                }
            }
            Mode::Retransmit { current, .. } => match current {
                Some((_, words)) => words.push(word),
                None => debug!("재전송 마커 없는 워드 무시"),
            },
        }
    }

    /// 진행 중인 패스 종료
    ///
    /// `sentinel` 이 false 면 sentinel 없이 다음 패스가 시작된 경우
    fn close_pass(&mut self, events: &mut Vec<DecodeEvent>, sentinel: bool) {
        let summary = match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Idle if sentinel => PassSummary {
                kind: PassKind::Empty,
                aligned: true,
                frames: 0,
            },
            Mode::Idle => return,
            Mode::Rejected => PassSummary {
                kind: PassKind::Original,
                aligned: false,
                frames: 0,
            },
            Mode::Original {
                grid,
                next_seq,
                current,
                frames,
                aligned,
            } => {
                let aligned =
                    sentinel && aligned && current.is_empty() && next_seq == grid.chunk_count();
                if !aligned {
                    warn!(
                        "원본 패스 정렬 불일치: {}/{} chunks 디코딩, 패스 폐기",
                        next_seq,
                        grid.chunk_count()
                    );
                    PassSummary {
                        kind: PassKind::Original,
                        aligned: false,
                        frames: 0,
                    }
                } else {
                    let count = frames.len();
                    events.extend(frames.into_iter().map(DecodeEvent::Frame));
                    PassSummary {
                        kind: PassKind::Original,
                        aligned: true,
                        frames: count,
                    }
                }
            }
            Mode::Retransmit {
                mut current,
                mut frames,
            } => {
                if let Some(frame) = take_retransmitted(&mut current) {
                    frames += 1;
                    events.push(DecodeEvent::Frame(frame));
                }
                PassSummary {
                    kind: PassKind::Retransmission,
                    aligned: true,
                    frames,
                }
            }
        };

        events.push(DecodeEvent::PassEnd(summary));
    }
}

fn take_retransmitted(current: &mut Option<(SequenceNumber, Vec<u32>)>) -> Option<Frame> {
    current.take().map(|(seq, words)| Frame {
        seq,
        words,
        retransmitted: true,
    })
}

/// 소스 블록 조립기
#[derive(Debug)]
pub struct Reassembler {
    grid: ChunkGrid,

    /// 워드 단위로 올림한 블록 데이터
    data: BytesMut,

    /// 시퀀스 번호별 수신 여부
    received: Vec<bool>,

    received_count: u32,
}

impl Reassembler {
    pub fn new(grid: ChunkGrid) -> Self {
        let mut data = BytesMut::with_capacity(grid.total_words() * crate::WORD_SIZE);
        data.resize(grid.total_words() * crate::WORD_SIZE, 0);

        Self {
            grid,
            data,
            received: vec![false; grid.chunk_count() as usize],
            received_count: 0,
        }
    }

    pub fn grid(&self) -> ChunkGrid {
        self.grid
    }

    /// 프레임 삽입, 새로 채워졌으면 true
    pub fn insert(&mut self, frame: &Frame) -> bool {
        let span = match self.grid.span(frame.seq) {
            Some(span) => span,
            None => return false,
        };

        // 이미 받은 청크면 무시
        if self.received[frame.seq as usize] {
            return false;
        }

        if frame.words.len() != span.words() {
            debug!(
                "청크 길이 불일치: seq={} words={} expected={}",
                frame.seq,
                frame.words.len(),
                span.words()
            );
            return false;
        }

        let bytes = words_to_bytes(&frame.words);
        let offset = span.byte_offset;
        self.data[offset..offset + bytes.len()].copy_from_slice(&bytes);

        self.received[frame.seq as usize] = true;
        self.received_count += 1;
        true
    }

    /// 여러 프레임 삽입, 새로 채워진 수 반환
    pub fn insert_all<'a>(&mut self, frames: impl IntoIterator<Item = &'a Frame>) -> usize {
        frames
            .into_iter()
            .filter(|frame| self.insert(frame))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count >= self.grid.chunk_count()
    }

    /// 누락된 시퀀스 번호 (오름차순)
    pub fn missing(&self) -> Vec<SequenceNumber> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, &received)| !received)
            .map(|(seq, _)| seq as SequenceNumber)
            .collect()
    }

    /// 수신률
    pub fn receive_ratio(&self) -> f64 {
        let total = self.grid.chunk_count();
        if total == 0 {
            return 1.0;
        }
        self.received_count as f64 / total as f64
    }

    /// 완성된 블록 (길이 B 로 자름)
    pub fn into_bytes(self) -> Result<Bytes> {
        if !self.is_complete() {
            return Err(Error::TransferIncomplete {
                missing: self.missing().len(),
            });
        }

        let mut data = self.data;
        data.truncate(self.grid.total_bytes() as usize);
        Ok(data.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{END_FLAG, ITEMS_PER_DATA_PACKET};

    const KEY: u32 = 500;

    fn decoder() -> PassDecoder {
        PassDecoder::new(RoutingKeys::new(KEY), ITEMS_PER_DATA_PACKET)
    }

    /// 1000 bytes 원본 패스 (word i = i)
    fn original_pass() -> Vec<Packet> {
        let mut packets = vec![Packet::new(KEY + 2, 1000)];
        packets.extend((0..250).map(|w| Packet::new(KEY, w)));
        packets.push(Packet::new(KEY, END_FLAG));
        packets
    }

    fn feed(decoder: &mut PassDecoder, packets: &[Packet]) -> Vec<DecodeEvent> {
        packets.iter().flat_map(|p| decoder.push(*p)).collect()
    }

    fn frames(events: &[DecodeEvent]) -> Vec<Frame> {
        events
            .iter()
            .filter_map(|e| match e {
                DecodeEvent::Frame(frame) => Some(frame.clone()),
                DecodeEvent::PassEnd(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_original_pass_split_on_grid() {
        let mut decoder = decoder();
        let events = feed(&mut decoder, &original_pass());

        let frames = frames(&events);
        let lengths: Vec<usize> = frames.iter().map(|f| f.words.len()).collect();
        assert_eq!(lengths, vec![67, 67, 67, 49]);
        assert_eq!(frames[1].words[0], 67);
        assert!(frames.iter().all(|f| !f.retransmitted));

        assert_eq!(
            events.last(),
            Some(&DecodeEvent::PassEnd(PassSummary {
                kind: PassKind::Original,
                aligned: true,
                frames: 4
            }))
        );
        assert_eq!(decoder.grid().map(|g| g.chunk_count()), Some(4));
    }

    #[test]
    fn test_misaligned_original_pass_is_discarded() {
        let mut packets = original_pass();
        packets.remove(100);

        let mut decoder = decoder();
        let events = feed(&mut decoder, &packets);

        assert!(frames(&events).is_empty());
        assert_eq!(
            events,
            vec![DecodeEvent::PassEnd(PassSummary {
                kind: PassKind::Original,
                aligned: false,
                frames: 0
            })]
        );
    }

    #[test]
    fn test_oversized_block_header_is_rejected() {
        let mut decoder = decoder().with_max_block_bytes(500);
        let events = feed(&mut decoder, &original_pass());

        assert_eq!(
            events,
            vec![DecodeEvent::PassEnd(PassSummary {
                kind: PassKind::Original,
                aligned: false,
                frames: 0
            })]
        );
        assert_eq!(decoder.grid(), None);

        // 제한 안의 패스는 그대로 디코딩
        let mut decoder = decoder.with_max_block_bytes(1000);
        let events = feed(&mut decoder, &original_pass());
        assert_eq!(frames(&events).len(), 4);
    }

    #[test]
    fn test_retransmitted_frames_split_on_marker() {
        let mut decoder = decoder();
        let packets = vec![
            Packet::new(KEY + 1, 3),
            Packet::new(KEY, 201),
            Packet::new(KEY, 202),
            Packet::new(KEY + 1, 0),
            Packet::new(KEY, 0),
            Packet::new(7, 99),
            Packet::new(KEY, END_FLAG),
        ];
        let events = feed(&mut decoder, &packets);

        assert_eq!(
            frames(&events),
            vec![
                Frame {
                    seq: 3,
                    words: vec![201, 202],
                    retransmitted: true
                },
                Frame {
                    seq: 0,
                    words: vec![0],
                    retransmitted: true
                },
            ]
        );
        assert!(matches!(
            events.last(),
            Some(DecodeEvent::PassEnd(PassSummary {
                kind: PassKind::Retransmission,
                frames: 2,
                ..
            }))
        ));
    }

    #[test]
    fn test_sentinel_only_pass() {
        let mut decoder = decoder();
        let events = decoder.push(Packet::new(KEY, END_FLAG));
        assert_eq!(
            events,
            vec![DecodeEvent::PassEnd(PassSummary {
                kind: PassKind::Empty,
                aligned: true,
                frames: 0
            })]
        );
    }

    #[test]
    fn test_reassembler_tracks_missing_and_truncates() {
        let grid = ChunkGrid::new(1000, ITEMS_PER_DATA_PACKET);
        let all = frames(&feed(&mut decoder(), &original_pass()));

        let mut reassembler = Reassembler::new(grid);
        assert_eq!(reassembler.insert_all(all.iter().filter(|f| f.seq != 1)), 3);
        assert_eq!(reassembler.missing(), vec![1]);
        assert!(matches!(
            Reassembler::new(grid).into_bytes(),
            Err(Error::TransferIncomplete { missing: 4 })
        ));

        assert!(reassembler.insert(&all[1]));
        assert!(!reassembler.insert(&all[1]));
        assert!(reassembler.is_complete());

        let bytes = reassembler.into_bytes().unwrap();
        assert_eq!(bytes.len(), 1000);
        assert_eq!(&bytes[268..272], &67u32.to_le_bytes());
    }

    #[test]
    fn test_reassembler_rejects_bad_frames() {
        let grid = ChunkGrid::new(1000, ITEMS_PER_DATA_PACKET);
        let mut reassembler = Reassembler::new(grid);

        let out_of_range = Frame {
            seq: 4,
            words: vec![0; 67],
            retransmitted: true,
        };
        let short = Frame {
            seq: 0,
            words: vec![0; 10],
            retransmitted: true,
        };
        assert!(!reassembler.insert(&out_of_range));
        assert!(!reassembler.insert(&short));
        assert_eq!(reassembler.receive_ratio(), 0.0);
    }

    #[test]
    fn test_empty_block_is_complete() {
        let reassembler = Reassembler::new(ChunkGrid::new(0, ITEMS_PER_DATA_PACKET));
        assert!(reassembler.is_complete());
        assert!(reassembler.into_bytes().unwrap().is_empty());
    }
}
