//! 컨트롤 채널 메시지 정의
//!
//! 메시지는 고정 폭 워드의 나열: `[command_code, payload...]`
//! 수신측이 보내는 것은 전송 시작 요청과 누락 시퀀스 목록뿐

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::chunk::SequenceNumber;
use crate::WORD_SIZE;

/// 원본 전송 시작 커맨드
pub const SEND_DATA: u32 = 100;

/// 누락 목록 첫 메시지 (후속 메시지 수 포함)
pub const START_MISSING_LIST: u32 = 1000;

/// 누락 목록 후속 메시지
pub const MORE_MISSING_LIST: u32 = 1001;

/// START 메시지에서 시퀀스 번호가 시작하는 워드 위치
pub const START_PAYLOAD_OFFSET: usize = 2;

/// MORE 메시지에서 시퀀스 번호가 시작하는 워드 위치
pub const MORE_PAYLOAD_OFFSET: usize = 1;

/// 해석할 수 없는 컨트롤 메시지
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedCommand {
    #[error("빈 메시지")]
    Empty,

    #[error("워드 정렬되지 않은 길이: {0} bytes")]
    UnalignedLength(usize),

    #[error("알 수 없는 커맨드: {0}")]
    UnknownCommand(u32),

    #[error("START 메시지에 메시지 수 없음")]
    MissingExpectedCount,

    #[error("START 메시지의 메시지 수가 0")]
    ZeroExpectedCount,

    #[error("START 메시지의 메시지 수가 너무 큼: {expected} (최대 {limit})")]
    ExpectedCountTooLarge { expected: u32, limit: u32 },

    #[error("메시지 용량 초과: {words} words (최대 {capacity})")]
    Oversized { words: usize, capacity: usize },

    #[error("열린 누락 목록 라운드 없음")]
    NoOpenRound,
}

/// 컨트롤 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// 원본 전송 (재)시작
    SendData,

    /// 누락 목록 라운드 시작
    StartMissingList {
        /// 이 메시지를 포함한 총 메시지 수
        expected_messages: u32,
        seqs: Vec<SequenceNumber>,
    },

    /// 누락 목록 이어서
    MoreMissingList { seqs: Vec<SequenceNumber> },
}

impl ControlMessage {
    /// 커맨드 코드
    pub fn command_code(&self) -> u32 {
        match self {
            ControlMessage::SendData => SEND_DATA,
            ControlMessage::StartMissingList { .. } => START_MISSING_LIST,
            ControlMessage::MoreMissingList { .. } => MORE_MISSING_LIST,
        }
    }

    /// 워드 열에서 파싱
    pub fn parse_words(words: &[u32]) -> std::result::Result<Self, MalformedCommand> {
        let (&code, _) = words.split_first().ok_or(MalformedCommand::Empty)?;

        match code {
            SEND_DATA => Ok(ControlMessage::SendData),
            START_MISSING_LIST => {
                let expected_messages =
                    *words.get(1).ok_or(MalformedCommand::MissingExpectedCount)?;
                if expected_messages == 0 {
                    return Err(MalformedCommand::ZeroExpectedCount);
                }
                Ok(ControlMessage::StartMissingList {
                    expected_messages,
                    seqs: words[START_PAYLOAD_OFFSET..].to_vec(),
                })
            }
            MORE_MISSING_LIST => Ok(ControlMessage::MoreMissingList {
                seqs: words[MORE_PAYLOAD_OFFSET..].to_vec(),
            }),
            other => Err(MalformedCommand::UnknownCommand(other)),
        }
    }

    /// LE 바이트에서 파싱
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, MalformedCommand> {
        Self::parse_words(&decode_words(bytes)?)
    }

    /// 워드 열로 변환
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = vec![self.command_code()];
        match self {
            ControlMessage::SendData => {}
            ControlMessage::StartMissingList {
                expected_messages,
                seqs,
            } => {
                words.push(*expected_messages);
                words.extend_from_slice(seqs);
            }
            ControlMessage::MoreMissingList { seqs } => words.extend_from_slice(seqs),
        }
        words
    }

    /// LE 바이트로 직렬화
    pub fn to_bytes(&self) -> Bytes {
        let words = self.to_words();
        let mut buf = BytesMut::with_capacity(words.len() * WORD_SIZE);
        for word in words {
            buf.put_u32_le(word);
        }
        buf.freeze()
    }
}

/// LE 바이트를 워드 열로
pub fn decode_words(mut bytes: &[u8]) -> std::result::Result<Vec<u32>, MalformedCommand> {
    if bytes.is_empty() {
        return Err(MalformedCommand::Empty);
    }
    if bytes.len() % WORD_SIZE != 0 {
        return Err(MalformedCommand::UnalignedLength(bytes.len()));
    }

    let mut words = Vec::with_capacity(bytes.len() / WORD_SIZE);
    while bytes.has_remaining() {
        words.push(bytes.get_u32_le());
    }
    Ok(words)
}

/// 누락 목록 요청 (수신측 → 송신측)
///
/// 메시지 하나의 용량이 작으므로 START 1개 + MORE n개로 분할
pub struct MissingListRequest;

impl MissingListRequest {
    /// 누락 시퀀스 번호를 컨트롤 메시지들로 분할
    ///
    /// `capacity_words` 는 커맨드 코드를 포함한 메시지 최대 워드 수
    pub fn encode(missing: &[SequenceNumber], capacity_words: usize) -> Vec<ControlMessage> {
        if missing.is_empty() {
            return Vec::new();
        }

        let first_len = missing
            .len()
            .min(capacity_words.saturating_sub(START_PAYLOAD_OFFSET).max(1));
        let (first, rest) = missing.split_at(first_len);

        let more_capacity = capacity_words.saturating_sub(MORE_PAYLOAD_OFFSET).max(1);
        let more: Vec<ControlMessage> = rest
            .chunks(more_capacity)
            .map(|seqs| ControlMessage::MoreMissingList {
                seqs: seqs.to_vec(),
            })
            .collect();

        let mut messages = Vec::with_capacity(more.len() + 1);
        messages.push(ControlMessage::StartMissingList {
            expected_messages: (more.len() + 1) as u32,
            seqs: first.to_vec(),
        });
        messages.extend(more);
        messages
    }
}
