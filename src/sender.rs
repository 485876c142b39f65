//! 송신 세션
//!
//! - 이벤트 런타임이 호출하는 핸들러 집합 (컨트롤 메시지, 전송 완료, tick)
//! - 모든 커서/회전 인덱스/버퍼는 `SessionContext` 하나에 모음
//! - 핸들러는 런타임이 직렬로 호출한다고 가정 (락 없음)

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::chunk::{ChunkGrid, RoutingKeys};
use crate::host::{BufferBank, DataTransport, Region, Storage, TagClass, TransferTag};
use crate::message::{decode_words, ControlMessage, MalformedCommand};
use crate::original;
use crate::reader::DoubleBufferedReader;
use crate::retransmit::{self, RetransmitPass};
use crate::stats::TransferStats;
use crate::tracker::{MissingSequenceTracker, TrackerProgress};
use crate::transmitter::Transmitter;
use crate::{Config, Result};

/// 외부에서 보는 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Transmitting,
    CollectingMissing,
    Retransmitting,
}

/// 원본 전송 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OriginalPhase {
    /// 첫 청크 (길이 헤더 포함) 읽는 중
    FirstRead,

    /// 이후 청크 스트리밍
    Streaming,
}

/// 진행 중인 패스
#[derive(Debug)]
pub(crate) enum Pass {
    Idle,
    Original(OriginalPhase),
    Collecting,
    Retransmit(RetransmitPass),
}

/// 세션 상태 일체
#[derive(Debug)]
pub(crate) struct SessionContext {
    pub(crate) config: Config,
    pub(crate) grid: ChunkGrid,
    pub(crate) transmitter: Transmitter,

    /// 소스 블록 → 전송 버퍼
    pub(crate) data_reader: DoubleBufferedReader,

    /// 누락 목록 영역 → 페이지 버퍼
    pub(crate) page_reader: DoubleBufferedReader,

    pub(crate) tracker: MissingSequenceTracker,

    /// 패스 세대 (이전 패스의 완료 통지 차단용)
    pub(crate) generation: u32,

    pub(crate) pass: Pass,
    pub(crate) stats: TransferStats,
}

impl SessionContext {
    fn new(config: Config, bytes_to_write: u32) -> Self {
        let items = config.items_per_packet;
        Self {
            grid: ChunkGrid::new(bytes_to_write, items),
            transmitter: Transmitter::new(RoutingKeys::new(config.routing_key), config.retry_policy),
            data_reader: DoubleBufferedReader::new(Region::Source, BufferBank::Data, items),
            page_reader: DoubleBufferedReader::new(Region::Source, BufferBank::MissingPage, items),
            tracker: MissingSequenceTracker::new(config.control_message_words),
            generation: 0,
            pass: Pass::Idle,
            stats: TransferStats::new(),
            config,
        }
    }

    /// 새 패스 세대 시작
    pub(crate) fn begin_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub(crate) fn tag(&self, class: TagClass) -> TransferTag {
        TransferTag::new(class, self.generation)
    }

    pub(crate) fn keys(&self) -> RoutingKeys {
        self.transmitter.keys()
    }

    /// 소스 블록 읽기 시작, 채워질 슬롯 반환
    pub(crate) fn issue_data_read<S: Storage>(
        &mut self,
        storage: &mut S,
        class: TagClass,
        word_offset: usize,
        byte_count: usize,
    ) -> Result<usize> {
        let tag = self.tag(class);
        let issued = self.data_reader.issue_read(
            storage,
            self.config.retry_policy,
            tag,
            word_offset,
            byte_count,
        )?;
        self.stats.transfer_retries += issued.retries;
        Ok(issued.slot)
    }

    /// 누락 목록 페이지 읽기 시작
    pub(crate) fn issue_page_read<S: Storage>(
        &mut self,
        storage: &mut S,
        byte_count: usize,
    ) -> Result<usize> {
        let tag = self.tag(TagClass::MissingPageRead);
        let issued = self.page_reader.issue_read(
            storage,
            self.config.retry_policy,
            tag,
            0,
            byte_count,
        )?;
        self.stats.transfer_retries += issued.retries;
        Ok(issued.slot)
    }

    /// 채워진 전송 버퍼 송신 후 슬롯 반환
    pub(crate) fn send_slot<T: DataTransport>(
        &mut self,
        transport: &mut T,
        slot: usize,
        first_key: u32,
    ) -> Result<usize> {
        let transmitter = self.transmitter;
        let report = transmitter.send_chunk(
            transport,
            self.data_reader.buffers().filled(slot),
            first_key,
        )?;
        self.data_reader.buffers_mut().release(slot);

        self.stats.chunks_sent += 1;
        self.stats.words_sent += report.words as u64;
        self.stats.send_retries += report.retries;
        Ok(report.words)
    }

    /// sentinel 송신
    pub(crate) fn send_end_flag<T: DataTransport>(&mut self, transport: &mut T) -> Result<()> {
        let report = self.transmitter.send_end_flag(transport)?;
        self.stats.words_sent += report.words as u64;
        self.stats.send_retries += report.retries;
        self.stats.end_flags_sent += 1;
        Ok(())
    }

    /// 패스 정상 종료
    pub(crate) fn finish_pass(&mut self) {
        self.pass = Pass::Idle;
        self.stats.passes_completed += 1;
    }

    fn state(&self) -> SessionState {
        match self.pass {
            Pass::Idle => SessionState::Idle,
            Pass::Original(_) => SessionState::Transmitting,
            Pass::Collecting => SessionState::CollectingMissing,
            Pass::Retransmit(_) => SessionState::Retransmitting,
        }
    }
}

/// 송신 세션 (코어 + 호스트 협력자)
pub struct Session<S, T> {
    ctx: SessionContext,
    storage: S,
    transport: T,
}

impl<S: Storage, T: DataTransport> Session<S, T> {
    /// 새 세션 생성
    ///
    /// `bytes_to_write` 는 스토리지의 소스 블록 길이
    pub fn new(config: Config, bytes_to_write: u32, storage: S, transport: T) -> Result<Self> {
        config.validate()?;

        info!(
            "MCS session: key={:08X}, {} bytes, {} chunks of {} words",
            config.routing_key,
            bytes_to_write,
            ChunkGrid::new(bytes_to_write, config.items_per_packet).chunk_count(),
            config.data_words_per_chunk()
        );

        Ok(Self {
            ctx: SessionContext::new(config, bytes_to_write),
            storage,
            transport,
        })
    }

    pub fn state(&self) -> SessionState {
        self.ctx.state()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.ctx.stats
    }

    pub fn grid(&self) -> ChunkGrid {
        self.ctx.grid
    }

    pub fn keys(&self) -> RoutingKeys {
        self.ctx.keys()
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// 현재 패스 세대
    pub fn generation(&self) -> u32 {
        self.ctx.generation
    }

    /// 현재 라운드의 누락 목록 기록 워드 수
    pub fn missing_written(&self) -> usize {
        self.ctx.tracker.written_words()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_parts(self) -> (S, T) {
        (self.storage, self.transport)
    }

    /// 컨트롤 메시지 수신 (LE 바이트)
    pub fn on_control_message(&mut self, bytes: &[u8]) -> Result<()> {
        match decode_words(bytes) {
            Ok(words) => self.on_control_words(&words),
            Err(reason) => {
                self.ignore_command(reason);
                Ok(())
            }
        }
    }

    /// 컨트롤 메시지 수신 (워드)
    pub fn on_control_words(&mut self, words: &[u32]) -> Result<()> {
        let capacity = self.ctx.config.control_message_words;
        if words.len() > capacity {
            self.ignore_command(MalformedCommand::Oversized {
                words: words.len(),
                capacity,
            });
            return Ok(());
        }

        let message = match ControlMessage::parse_words(words) {
            Ok(message) => message,
            Err(reason) => {
                self.ignore_command(reason);
                return Ok(());
            }
        };

        let result = match message {
            ControlMessage::SendData => self.start_transmission(),
            ControlMessage::StartMissingList {
                expected_messages,
                seqs,
            } => self.start_missing_round(expected_messages, &seqs),
            ControlMessage::MoreMissingList { seqs } => self.continue_missing_round(&seqs),
        };
        self.abort_on_error(result)
    }

    /// 스토리지 전송 완료 통지
    pub fn on_transfer_complete(&mut self, tag: TransferTag, data: Bytes) -> Result<()> {
        if tag.generation != self.ctx.generation {
            self.ignore_stale(tag);
            return Ok(());
        }

        let ctx = &mut self.ctx;
        let result = match (ctx.state(), tag.class) {
            (SessionState::Transmitting, TagClass::OriginalRead) => {
                original::on_read_complete(ctx, &mut self.storage, &mut self.transport, &data)
            }
            (SessionState::Retransmitting, TagClass::MissingPageRead) => {
                retransmit::on_page_complete(ctx, &mut self.storage, &mut self.transport, &data)
            }
            (SessionState::Retransmitting, TagClass::RetransmitRead) => {
                retransmit::on_chunk_complete(ctx, &mut self.storage, &mut self.transport, &data)
            }
            _ => {
                self.ignore_stale(tag);
                return Ok(());
            }
        };
        self.abort_on_error(result)
    }

    /// 주기 tick
    pub fn on_tick(&mut self) {
        self.ctx.stats.ticks += 1;

        let interval = self.ctx.config.stats_log_interval_ticks;
        if interval == 0 || self.ctx.stats.ticks % interval != 0 {
            return;
        }

        match self.ctx.state() {
            SessionState::Idle => debug!("{}", self.ctx.stats.summary()),
            state => info!("{:?}: {}", state, self.ctx.stats.summary()),
        }
    }

    /// 세션을 Idle 로 되돌리고 누락 목록 영역 해제
    pub fn reset(&mut self) {
        self.ctx.begin_generation();
        self.ctx.pass = Pass::Idle;
        self.ctx.data_reader.reset();
        self.ctx.page_reader.reset();
        self.ctx.tracker.release(&mut self.storage);
    }

    fn start_transmission(&mut self) -> Result<()> {
        if self.ctx.state() != SessionState::Idle {
            info!("{:?} 중 전송 재시작 요청, 진행 중인 패스 중단", self.ctx.state());
        }
        self.ctx.tracker.abandon();
        original::start(&mut self.ctx, &mut self.storage, &mut self.transport)
    }

    fn start_missing_round(&mut self, expected_messages: u32, seqs: &[u32]) -> Result<()> {
        // 청크마다 메시지 하나씩 보내도 chunk_count + 1 개면 충분
        let limit = self.ctx.grid.chunk_count().saturating_add(1);
        if expected_messages > limit {
            self.ignore_command(MalformedCommand::ExpectedCountTooLarge {
                expected: expected_messages,
                limit,
            });
            return Ok(());
        }

        if let Pass::Original(_) | Pass::Retransmit(_) = self.ctx.pass {
            info!("{:?} 중 새 누락 목록 라운드, 진행 중인 패스 중단", self.ctx.state());
        }

        // 이전 패스의 완료 통지 차단
        self.ctx.begin_generation();
        self.ctx.pass = Pass::Collecting;

        let progress = self
            .ctx
            .tracker
            .start_round(&mut self.storage, expected_messages, seqs)?;
        self.ctx.stats.missing_entries += seqs.len() as u64;
        self.on_tracker_progress(progress)
    }

    fn continue_missing_round(&mut self, seqs: &[u32]) -> Result<()> {
        match self.ctx.tracker.continue_round(&mut self.storage, seqs)? {
            Some(progress) => {
                self.ctx.stats.missing_entries += seqs.len() as u64;
                self.on_tracker_progress(progress)
            }
            None => {
                self.ignore_command(MalformedCommand::NoOpenRound);
                Ok(())
            }
        }
    }

    fn on_tracker_progress(&mut self, progress: TrackerProgress) -> Result<()> {
        match progress {
            TrackerProgress::Collecting { messages_remaining } => {
                debug!("누락 목록 수집 중: {} messages 남음", messages_remaining);
                Ok(())
            }
            TrackerProgress::Complete { written_words } => {
                self.ctx.stats.missing_rounds += 1;
                let region = match self.ctx.tracker.region() {
                    Some(region) => region,
                    None => return Ok(()),
                };
                retransmit::start(&mut self.ctx, &mut self.storage, region, written_words)
            }
        }
    }

    fn ignore_command(&mut self, reason: MalformedCommand) {
        self.ctx.stats.malformed_commands += 1;
        warn!("컨트롤 메시지 무시: {}", reason);
    }

    fn ignore_stale(&mut self, tag: TransferTag) {
        self.ctx.stats.stale_completions += 1;
        debug!(
            "이전 패스 완료 통지 무시: {:?} gen={} (현재 gen={})",
            tag.class, tag.generation, self.ctx.generation
        );
    }

    /// 하드 에러 시 세션 중단
    fn abort_on_error(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            error!("세션 중단 ({:?}): {}", self.ctx.state(), e);
            self.ctx.stats.passes_aborted += 1;
            self.reset();
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Packet, PacketKind};
    use crate::config::RetryPolicy;
    use crate::host::{test_pattern, MemoryStorage, PacketLog, StorageRegions};
    use crate::message::{MissingListRequest, MORE_MISSING_LIST, START_MISSING_LIST};
    use crate::receiver::{DecodeEvent, Frame, PassDecoder, Reassembler};
    use crate::{Error, END_FLAG, ITEMS_PER_DATA_PACKET};

    type TestSession = Session<MemoryStorage, PacketLog>;

    const KEY: u32 = 0x100;

    fn session(bytes: usize) -> TestSession {
        session_with(bytes, Config::default().with_routing_key(KEY))
    }

    fn session_with(bytes: usize, config: Config) -> TestSession {
        let storage = MemoryStorage::new(test_pattern(bytes));
        Session::new(config, bytes as u32, storage, PacketLog::new()).unwrap()
    }

    /// 대기 중인 완료 통지를 모두 전달
    fn pump(session: &mut TestSession) {
        while let Some(completion) = session.storage_mut().next_completion() {
            let _ = session.on_transfer_complete(completion.tag, completion.data);
        }
    }

    fn run_original(session: &mut TestSession) -> Vec<Packet> {
        session.on_control_words(&[crate::message::SEND_DATA]).unwrap();
        pump(session);
        session.transport_mut().take()
    }

    fn request_missing(session: &mut TestSession, missing: &[u32]) -> Vec<Packet> {
        let capacity = session.config().control_message_words;
        for message in MissingListRequest::encode(missing, capacity) {
            session.on_control_message(&message.to_bytes()).unwrap();
        }
        pump(session);
        session.transport_mut().take()
    }

    fn decode(packets: &[Packet]) -> Vec<Frame> {
        let mut decoder = PassDecoder::new(RoutingKeys::new(KEY), ITEMS_PER_DATA_PACKET);
        let mut frames = Vec::new();
        for packet in packets {
            for event in decoder.push(*packet) {
                if let DecodeEvent::Frame(frame) = event {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    /// 청크 경계로 패킷 분할 (sentinel 제외)
    fn chunk_lengths(packets: &[Packet]) -> Vec<usize> {
        let keys = RoutingKeys::new(KEY);
        let mut lengths = Vec::new();
        for packet in packets {
            match keys.classify(*packet) {
                Some(PacketKind::PassStart) | Some(PacketKind::RetransmitStart) => lengths.push(1),
                Some(PacketKind::Continuation) => match lengths.last_mut() {
                    Some(len) => *len += 1,
                    None => lengths.push(1),
                },
                _ => {}
            }
        }
        lengths
    }

    #[test]
    fn test_thousand_byte_scenario() {
        let mut session = session(1000);
        let packets = run_original(&mut session);

        // 헤더 1 + 데이터 250 + sentinel 1
        assert_eq!(packets.len(), 252);
        assert_eq!(packets[0], Packet::new(KEY + 2, 1000));
        assert_eq!(*packets.last().unwrap(), Packet::new(KEY, END_FLAG));
        assert!(packets[1..packets.len() - 1]
            .iter()
            .all(|p| p.key == KEY && p.payload != END_FLAG));

        // 데이터 워드는 패턴 그대로 (word i = i)
        let data: Vec<u32> = packets[1..251].iter().map(|p| p.payload).collect();
        assert_eq!(data, (0..250).collect::<Vec<u32>>());

        let frames = decode(&packets);
        let lengths: Vec<usize> = frames.iter().map(|f| f.words.len()).collect();
        assert_eq!(lengths, vec![67, 67, 67, 49]);

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.stats().chunks_sent, 4);
        assert_eq!(session.stats().passes_completed, 1);
    }

    #[test]
    fn test_chunk_count_and_reconstruction_across_sizes() {
        for bytes in [1usize, 4, 7, 267, 268, 269, 536, 537, 4000, 10_001] {
            let mut session = session(bytes);
            let packets = run_original(&mut session);
            let grid = session.grid();

            assert_eq!(
                session.stats().chunks_sent,
                grid.chunk_count() as u64,
                "bytes={}",
                bytes
            );
            assert_eq!(session.stats().end_flags_sent, 1);

            let frames = decode(&packets);
            let mut reassembler = Reassembler::new(grid);
            for frame in &frames {
                assert!(reassembler.insert(frame));
            }
            assert!(reassembler.is_complete(), "bytes={}", bytes);
            assert_eq!(reassembler.into_bytes().unwrap(), test_pattern(bytes));
        }
    }

    #[test]
    fn test_empty_block_sends_only_sentinel() {
        let mut session = session(0);
        let packets = run_original(&mut session);

        assert_eq!(packets, vec![Packet::new(KEY, END_FLAG)]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_exact_multiple_never_sends_empty_chunk() {
        let mut session = session(3 * 268);
        let packets = run_original(&mut session);

        // 마지막 청크도 67 words, 빈 청크 없음
        assert_eq!(packets.len(), 68 + 67 + 67 + 1);
        let lengths: Vec<usize> = decode(&packets).iter().map(|f| f.words.len()).collect();
        assert_eq!(lengths, vec![67, 67, 67]);
        assert_eq!(session.stats().chunks_sent, 3);
    }

    #[test]
    fn test_retransmission_tags_and_contents() {
        let mut session = session(1000);
        run_original(&mut session);

        let packets = request_missing(&mut session, &[2, 0]);
        assert_eq!(packets[0], Packet::new(KEY + 1, 2));
        assert_eq!(packets[1], Packet::new(KEY, 134));
        assert_eq!(*packets.last().unwrap(), Packet::new(KEY, END_FLAG));

        assert_eq!(chunk_lengths(&packets), vec![68, 68]);

        let frames = decode(&packets);
        let seqs: Vec<u32> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![2, 0]);
        assert_eq!(frames[1].words, (0..67).collect::<Vec<u32>>());
        assert!(frames.iter().all(|f| f.retransmitted));

        assert_eq!(session.stats().retransmitted_chunks, 2);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_retransmission_is_idempotent_and_keeps_duplicates() {
        let mut session = session(1000);
        run_original(&mut session);

        let packets = request_missing(&mut session, &[3, 3]);
        let frames = decode(&packets);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
        assert_eq!(frames[0].words.len(), 49);

        let again = decode(&request_missing(&mut session, &[3]));
        assert_eq!(again[0], frames[0]);
    }

    #[test]
    fn test_lossy_round_trip_reconstructs_block() {
        let bytes = 20_000;
        let mut session = session(bytes);
        let frames = decode(&run_original(&mut session));
        let grid = session.grid();

        // 3의 배수 시퀀스와 마지막 청크 손실
        let last = grid.chunk_count() - 1;
        let mut reassembler = Reassembler::new(grid);
        for frame in frames.iter().filter(|f| f.seq % 3 != 0 && f.seq != last) {
            reassembler.insert(frame);
        }

        let missing = reassembler.missing();
        assert_eq!(missing.len(), 26);

        for frame in decode(&request_missing(&mut session, &missing)) {
            assert!(reassembler.insert(&frame));
        }

        assert!(reassembler.is_complete());
        assert_eq!(reassembler.into_bytes().unwrap(), test_pattern(bytes));
    }

    #[test]
    fn test_missing_list_spanning_many_pages() {
        // 작은 버퍼: 페이지 3 words, 메시지 3 words
        let mut config = Config::default().with_routing_key(KEY);
        config.items_per_packet = 3;
        config.control_message_words = 3;

        let bytes = 200;
        let mut session = session_with(bytes, config);
        session.on_control_words(&[crate::message::SEND_DATA]).unwrap();
        pump(&mut session);
        session.transport_mut().take();

        let grid = session.grid();
        let missing: Vec<u32> = (0..grid.chunk_count()).rev().collect();
        let packets = request_missing(&mut session, &missing);

        let mut decoder = PassDecoder::new(RoutingKeys::new(KEY), 3);
        let mut reassembler = Reassembler::new(grid);
        let mut order = Vec::new();
        for packet in packets {
            for event in decoder.push(packet) {
                if let DecodeEvent::Frame(frame) = event {
                    order.push(frame.seq);
                    reassembler.insert(&frame);
                }
            }
        }

        assert_eq!(order, missing);
        assert_eq!(reassembler.into_bytes().unwrap(), test_pattern(bytes));
    }

    #[test]
    fn test_retransmission_waits_for_all_messages() {
        let mut session = session(1000);
        run_original(&mut session);

        session
            .on_control_words(&[START_MISSING_LIST, 3, 1])
            .unwrap();
        assert_eq!(session.state(), SessionState::CollectingMissing);
        session.on_control_words(&[MORE_MISSING_LIST, 2]).unwrap();
        pump(&mut session);

        assert_eq!(session.missing_written(), 2);
        assert!(session.transport().packets().is_empty());
        assert_eq!(session.storage().transfers_issued(), 4);

        session.on_control_words(&[MORE_MISSING_LIST, 0]).unwrap();
        assert_eq!(session.state(), SessionState::Retransmitting);
        // seq 3개 + sentinel
        assert_eq!(session.missing_written(), 4);

        pump(&mut session);
        let frames = decode(&session.transport_mut().take());
        let seqs: Vec<u32> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2, 0]);
    }

    #[test]
    fn test_malformed_commands_leave_state_unchanged() {
        let mut session = session(1000);

        session.on_control_message(&[1, 2, 3]).unwrap();
        session.on_control_words(&[42]).unwrap();
        session.on_control_words(&[MORE_MISSING_LIST, 1]).unwrap();
        session.on_control_words(&[START_MISSING_LIST, 0]).unwrap();
        let oversized = vec![MORE_MISSING_LIST; ITEMS_PER_DATA_PACKET + 1];
        session.on_control_words(&oversized).unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.stats().malformed_commands, 5);
        assert!(session.transport().packets().is_empty());
    }

    #[test]
    fn test_restart_fences_stale_completions() {
        let mut session = session(1000);
        session.on_control_words(&[crate::message::SEND_DATA]).unwrap();

        // 첫 읽기 완료 전에 재시작
        let stale = session.storage_mut().next_completion().unwrap();
        session.on_control_words(&[crate::message::SEND_DATA]).unwrap();
        let stale_generation = stale.tag.generation;
        session.on_transfer_complete(stale.tag, stale.data).unwrap();

        assert_ne!(stale_generation, session.generation());
        assert_eq!(session.stats().stale_completions, 1);
        assert!(session.transport().packets().is_empty());

        pump(&mut session);
        let packets = session.transport_mut().take();
        assert_eq!(packets.len(), 252);
        assert_eq!(session.stats().passes_started, 2);
    }

    #[test]
    fn test_send_interrupts_retransmission() {
        let mut session = session(1000);
        run_original(&mut session);

        session.on_control_words(&[START_MISSING_LIST, 1, 1, 2]).unwrap();
        assert_eq!(session.state(), SessionState::Retransmitting);
        session.on_control_words(&[crate::message::SEND_DATA]).unwrap();
        assert_eq!(session.state(), SessionState::Transmitting);

        pump(&mut session);
        let packets = session.transport_mut().take();
        assert_eq!(packets[0], Packet::new(KEY + 2, 1000));
        assert_eq!(packets.len(), 252);
        assert!(session.stats().stale_completions >= 1);
    }

    #[test]
    fn test_out_of_range_sequence_is_skipped() {
        let mut session = session(1000);
        run_original(&mut session);

        let packets = request_missing(&mut session, &[99, 1]);
        let frames = decode(&packets);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 1);
    }

    #[test]
    fn test_empty_block_retransmission_sends_sentinel() {
        let mut session = session(0);
        run_original(&mut session);

        let packets = request_missing(&mut session, &[0]);
        assert_eq!(packets, vec![Packet::new(KEY, END_FLAG)]);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let mut session = session(1000);
        session.transport_mut().fail_next(7);
        session.storage_mut().inject_busy(3);

        let packets = run_original(&mut session);
        assert_eq!(packets.len(), 252);
        assert_eq!(session.stats().send_retries, 7);
        assert_eq!(session.stats().transfer_retries, 3);
    }

    #[test]
    fn test_wedged_transport_aborts_pass() {
        let mut config = Config::default().with_routing_key(KEY);
        config.retry_policy = RetryPolicy::Bounded { max_attempts: 4 };
        let mut session = session_with(1000, config);

        session.on_control_words(&[crate::message::SEND_DATA]).unwrap();
        session.transport_mut().fail_next(100);
        let completion = session.storage_mut().next_completion().unwrap();
        let result = session.on_transfer_complete(completion.tag, completion.data);

        assert!(matches!(result, Err(Error::TransportWedged { .. })));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.stats().passes_aborted, 1);

        // 다음 요청은 정상 동작
        session.transport_mut().fail_next(0);
        session.storage_mut().next_completion();
        let packets = run_original(&mut session);
        assert_eq!(packets.len(), 252);
    }

    #[test]
    fn test_allocation_failure_aborts_session() {
        let regions = StorageRegions::new(test_pattern(1000)).with_allocation_limit(0);
        let storage = MemoryStorage::with_regions(regions);
        let config = Config::default().with_routing_key(KEY);
        let mut session = Session::new(config, 1000, storage, PacketLog::new()).unwrap();

        let result = session.on_control_words(&[START_MISSING_LIST, 1, 0]);
        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_oversized_expected_count_is_ignored() {
        let mut session = session(1000);
        run_original(&mut session);

        session
            .on_control_words(&[START_MISSING_LIST, u32::MAX, 1])
            .unwrap();
        session.on_control_words(&[START_MISSING_LIST, 6, 1]).unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.stats().malformed_commands, 2);
        assert_eq!(session.stats().passes_aborted, 0);
        assert_eq!(session.storage().regions().allocated_regions(), 0);

        // 격자 기준 최대치 (4 chunks + 1) 는 허용
        session.on_control_words(&[START_MISSING_LIST, 5, 1]).unwrap();
        assert_eq!(session.state(), SessionState::CollectingMissing);
    }

    #[test]
    fn test_missing_round_fences_pending_original_read() {
        let mut session = session(1000);
        session.on_control_words(&[crate::message::SEND_DATA]).unwrap();
        let pending = session.storage_mut().next_completion().unwrap();
        assert_eq!(pending.tag.class, TagClass::OriginalRead);

        session.on_control_words(&[START_MISSING_LIST, 1, 1]).unwrap();
        assert_eq!(session.state(), SessionState::Retransmitting);

        session
            .on_transfer_complete(pending.tag, pending.data)
            .unwrap();
        assert_eq!(session.stats().stale_completions, 1);
        assert!(session.transport().packets().is_empty());

        pump(&mut session);
        let packets = session.transport_mut().take();
        assert_eq!(packets.len(), ITEMS_PER_DATA_PACKET + 1);
        assert_eq!(packets[0], Packet::new(KEY + 1, 1));
        assert_eq!(packets[1], Packet::new(KEY, 67));
        assert_eq!(packets.last(), Some(&Packet::new(KEY, END_FLAG)));
        assert!(packets.iter().all(|p| p.key != KEY + 2));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_tick_counts() {
        let mut session = session(8);
        for _ in 0..5 {
            session.on_tick();
        }
        assert_eq!(session.stats().ticks, 5);
    }
}
