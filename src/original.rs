//! 원본 전송 드라이버
//!
//! 소스 블록 전체를 청크 격자 순서대로 송신.
//! 청크 k 를 보내기 직전에 청크 k+1 읽기를 먼저 시작해 읽기와 송신이 겹치게 함.

use bytes::Bytes;
use tracing::{debug, info};

use crate::host::{DataTransport, Region, Storage, TagClass};
use crate::sender::{OriginalPhase, Pass, SessionContext};
use crate::Result;

/// 원본 전송 시작
///
/// 진행 중인 패스가 있으면 세대를 올려 그 완료 통지를 무효화
pub(crate) fn start<S: Storage, T: DataTransport>(
    ctx: &mut SessionContext,
    storage: &mut S,
    transport: &mut T,
) -> Result<()> {
    let generation = ctx.begin_generation();
    ctx.data_reader.set_region(Region::Source);
    ctx.stats.passes_started += 1;

    info!(
        "원본 전송 시작: gen={}, {} bytes, {} chunks",
        generation,
        ctx.grid.total_bytes(),
        ctx.grid.chunk_count()
    );

    if ctx.grid.total_bytes() == 0 {
        ctx.pass = Pass::Original(OriginalPhase::Streaming);
        ctx.send_end_flag(transport)?;
        ctx.finish_pass();
        return Ok(());
    }

    ctx.pass = Pass::Original(OriginalPhase::FirstRead);
    let len = ctx.grid.next_read_len(0);
    // 워드 0 은 길이 헤더 자리
    ctx.issue_data_read(storage, TagClass::OriginalRead, 1, len)?;
    Ok(())
}

/// 청크 읽기 완료 처리
pub(crate) fn on_read_complete<S: Storage, T: DataTransport>(
    ctx: &mut SessionContext,
    storage: &mut S,
    transport: &mut T,
    data: &Bytes,
) -> Result<()> {
    let phase = match ctx.pass {
        Pass::Original(phase) => phase,
        _ => return Ok(()),
    };

    let slot = match ctx.data_reader.complete(data) {
        Some(slot) => slot,
        None => {
            debug!("대기 중인 읽기 없음, 완료 통지 무시");
            return Ok(());
        }
    };

    let keys = ctx.keys();
    let first_key = match phase {
        OriginalPhase::FirstRead => {
            let total = ctx.grid.total_bytes();
            ctx.data_reader.buffers_mut().set_word(slot, 0, total);
            ctx.pass = Pass::Original(OriginalPhase::Streaming);
            keys.pass_start()
        }
        OriginalPhase::Streaming => keys.base(),
    };

    let cursor = ctx.data_reader.cursor();
    let next_len = ctx.grid.next_read_len(cursor);

    if next_len > 0 {
        ctx.issue_data_read(storage, TagClass::OriginalRead, 0, next_len)?;
        ctx.send_slot(transport, slot, first_key)?;
        return Ok(());
    }

    ctx.send_slot(transport, slot, first_key)?;
    ctx.send_end_flag(transport)?;
    ctx.finish_pass();

    info!(
        "원본 전송 완료: {} chunks, {} words sent",
        ctx.grid.chunk_count(),
        ctx.stats.words_sent
    );
    Ok(())
}
