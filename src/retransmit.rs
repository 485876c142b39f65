//! 재전송 드라이버
//!
//! 누락 목록 영역을 페이지 단위로 읽으며 시퀀스 번호마다 해당 청크를 다시 읽어 송신.
//! 페이지 하나를 소비하는 동안 다음 페이지를 미리 읽어 둠.
//! END_FLAG 를 만나면 sentinel 을 보내고 종료.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::chunk::SequenceNumber;
use crate::host::{DataTransport, Region, RegionId, Storage, TagClass};
use crate::sender::{Pass, SessionContext};
use crate::{Result, END_FLAG, WORD_SIZE};

/// 소비 중인 페이지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Page {
    slot: usize,
    len: usize,
    position: usize,
}

/// 다음 페이지 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prefetch {
    Idle,
    InFlight,
    Ready { slot: usize, len: usize },
}

/// 재전송 패스 진행 상태
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetransmitPass {
    /// 누락 목록 전체 워드 수 (sentinel 포함)
    written_words: usize,

    /// 읽기를 시작한 워드 수
    issued_words: usize,

    current: Option<Page>,
    prefetch: Prefetch,

    /// 읽는 중인 청크의 시퀀스 번호
    awaiting: Option<SequenceNumber>,
}

/// 재전송 시작
pub(crate) fn start<S: Storage>(
    ctx: &mut SessionContext,
    storage: &mut S,
    region: RegionId,
    written_words: usize,
) -> Result<()> {
    let generation = ctx.begin_generation();
    ctx.data_reader.set_region(Region::Source);
    ctx.page_reader.set_region(Region::Allocated(region));

    info!(
        "재전송 시작: gen={}, {} entries",
        generation,
        written_words.saturating_sub(1)
    );

    let mut pass = RetransmitPass {
        written_words,
        issued_words: 0,
        current: None,
        prefetch: Prefetch::Idle,
        awaiting: None,
    };
    issue_page(ctx, storage, &mut pass)?;
    ctx.pass = Pass::Retransmit(pass);
    Ok(())
}

/// 누락 목록 페이지 읽기 완료
pub(crate) fn on_page_complete<S: Storage, T: DataTransport>(
    ctx: &mut SessionContext,
    storage: &mut S,
    transport: &mut T,
    data: &Bytes,
) -> Result<()> {
    let slot = match ctx.page_reader.complete(data) {
        Some(slot) => slot,
        None => return Ok(()),
    };
    let len = ctx.page_reader.buffers().filled(slot).len();

    with_pass(ctx, |ctx, pass| {
        if pass.current.is_some() {
            pass.prefetch = Prefetch::Ready { slot, len };
            return Ok(());
        }

        pass.current = Some(Page {
            slot,
            len,
            position: 0,
        });
        pass.prefetch = Prefetch::Idle;
        prefetch_next(ctx, storage, pass)?;
        advance(ctx, storage, transport, pass)
    })
}

/// 재전송 청크 읽기 완료
pub(crate) fn on_chunk_complete<S: Storage, T: DataTransport>(
    ctx: &mut SessionContext,
    storage: &mut S,
    transport: &mut T,
    data: &Bytes,
) -> Result<()> {
    let slot = match ctx.data_reader.complete(data) {
        Some(slot) => slot,
        None => return Ok(()),
    };

    with_pass(ctx, |ctx, pass| {
        let seq = match pass.awaiting.take() {
            Some(seq) => seq,
            None => {
                ctx.data_reader.buffers_mut().release(slot);
                return Ok(());
            }
        };

        // 헤더 슬롯에 시퀀스 번호
        ctx.data_reader.buffers_mut().set_word(slot, 0, seq);
        let key = ctx.keys().retransmit_start();
        ctx.send_slot(transport, slot, key)?;
        ctx.stats.retransmitted_chunks += 1;
        debug!("청크 재전송: seq={}", seq);

        if let Some(page) = pass.current.as_mut() {
            page.position += 1;
        }
        advance(ctx, storage, transport, pass)
    })
}

/// 진행 중인 재전송 패스에 대해 `f` 실행 후 상태 반영
///
/// `f` 안에서 패스가 끝나면 (Idle) 반영하지 않음
fn with_pass<F>(ctx: &mut SessionContext, f: F) -> Result<()>
where
    F: FnOnce(&mut SessionContext, &mut RetransmitPass) -> Result<()>,
{
    let mut pass = match ctx.pass {
        Pass::Retransmit(pass) => pass,
        _ => return Ok(()),
    };

    let result = f(ctx, &mut pass);
    if let Pass::Retransmit(slot) = &mut ctx.pass {
        *slot = pass;
    }
    result
}

/// 다음 페이지 읽기 시작
fn issue_page<S: Storage>(
    ctx: &mut SessionContext,
    storage: &mut S,
    pass: &mut RetransmitPass,
) -> Result<()> {
    let page_words = ctx.page_reader.buffers().capacity();
    let words = (pass.written_words - pass.issued_words).min(page_words);

    ctx.page_reader.seek(pass.issued_words * WORD_SIZE);
    ctx.issue_page_read(storage, words * WORD_SIZE)?;
    pass.issued_words += words;
    pass.prefetch = Prefetch::InFlight;
    Ok(())
}

/// 아직 읽지 않은 페이지가 남아 있으면 미리 읽기
fn prefetch_next<S: Storage>(
    ctx: &mut SessionContext,
    storage: &mut S,
    pass: &mut RetransmitPass,
) -> Result<()> {
    if pass.prefetch == Prefetch::Idle && pass.issued_words < pass.written_words {
        issue_page(ctx, storage, pass)?;
    }
    Ok(())
}

/// 다음 유효한 시퀀스 번호의 청크 읽기 시작, 목록 끝이면 종료
fn advance<S: Storage, T: DataTransport>(
    ctx: &mut SessionContext,
    storage: &mut S,
    transport: &mut T,
    pass: &mut RetransmitPass,
) -> Result<()> {
    loop {
        if pass.awaiting.is_some() {
            return Ok(());
        }

        let mut page = match pass.current {
            Some(page) => page,
            // 페이지 도착 대기
            None => return Ok(()),
        };

        if page.position >= page.len {
            ctx.page_reader.buffers_mut().release(page.slot);
            pass.current = None;

            match pass.prefetch {
                Prefetch::Ready { slot, len } => {
                    pass.current = Some(Page {
                        slot,
                        len,
                        position: 0,
                    });
                    pass.prefetch = Prefetch::Idle;
                    prefetch_next(ctx, storage, pass)?;
                    continue;
                }
                Prefetch::InFlight => return Ok(()),
                Prefetch::Idle if pass.issued_words < pass.written_words => {
                    return issue_page(ctx, storage, pass);
                }
                Prefetch::Idle => {
                    warn!("누락 목록에 END_FLAG 없음, 재전송 종료");
                    return finish(ctx, transport);
                }
            }
        }

        let seq = ctx.page_reader.buffers().filled(page.slot)[page.position];
        if seq == END_FLAG {
            ctx.page_reader.buffers_mut().release(page.slot);
            pass.current = None;
            return finish(ctx, transport);
        }

        let span = match ctx.grid.span(seq) {
            Some(span) => span,
            None => {
                warn!(
                    "범위 밖 시퀀스 번호 무시: seq={} (chunks={})",
                    seq,
                    ctx.grid.chunk_count()
                );
                page.position += 1;
                pass.current = Some(page);
                continue;
            }
        };

        ctx.data_reader.seek(span.byte_offset);
        ctx.issue_data_read(storage, TagClass::RetransmitRead, 1, span.byte_len)?;
        pass.awaiting = Some(seq);
        return Ok(());
    }
}

fn finish<T: DataTransport>(ctx: &mut SessionContext, transport: &mut T) -> Result<()> {
    ctx.send_end_flag(transport)?;
    ctx.finish_pass();
    info!(
        "재전송 완료: 누적 {} chunks 재전송",
        ctx.stats.retransmitted_chunks
    );
    Ok(())
}
