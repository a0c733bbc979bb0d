//! # バストランザクション・オーケストレータ
//!
//! ボード非依存のバス全体操作 - EOI付き書き込み、ENDまたは長さ到達
//! までの読み取り、コマンド列送出、シリアル/パラレルポール、
//! サービスリクエスト、インターフェースクリア、リモートイネーブル、
//! システムコントローラ権の移譲、オートポールループ。
//!
//! すべてのブロッキング待機はタイムアウトで律速され、タイムアウトは
//! 部分的な成功よりも優先して報告される。

use std::time::Duration;

use log::{debug, warn};

use crate::board::Board;
use crate::error::{GpibError, GpibResult, Transfer, TransferError, TransferResult};
use crate::registry::DeviceAddr;
use crate::status::BoardStatus;
use crate::wait::{CancelToken, WaitOutcome};

/// GPIBマルチラインコマンドバイト
pub mod cmd {
    /// Go To Local
    pub const GTL: u8 = 0x01;
    /// Selected Device Clear
    pub const SDC: u8 = 0x04;
    /// Parallel Poll Configure
    pub const PPC: u8 = 0x05;
    /// Group Execute Trigger
    pub const GET: u8 = 0x08;
    /// Take Control (パススルー)
    pub const TCT: u8 = 0x09;
    /// Local Lockout
    pub const LLO: u8 = 0x11;
    /// Device Clear (全デバイス)
    pub const DCL: u8 = 0x14;
    /// Parallel Poll Unconfigure
    pub const PPU: u8 = 0x15;
    /// Serial Poll Enable
    pub const SPE: u8 = 0x18;
    /// Serial Poll Disable
    pub const SPD: u8 = 0x19;
    /// Unlisten
    pub const UNL: u8 = 0x3f;
    /// Untalk
    pub const UNT: u8 = 0x5f;

    /// My Listen Address
    #[inline(always)]
    pub const fn mla(pad: u8) -> u8 {
        0x20 | (pad & 0x1f)
    }

    /// My Talk Address
    #[inline(always)]
    pub const fn mta(pad: u8) -> u8 {
        0x40 | (pad & 0x1f)
    }

    /// My Secondary Address
    #[inline(always)]
    pub const fn msa(sad: u8) -> u8 {
        0x60 | (sad & 0x1f)
    }
}

/// 読み取り時にエンジンへ渡す1回分の最大チャンク
const READ_CHUNK: usize = 4096;

/// シリアルポール応答のRQS（サービス要求）ビット
pub const RQS_BIT: u8 = 0x40;

/// デフォルトのIFCアサート時間（マイクロ秒）
const DEFAULT_IFC_USEC: u32 = 100;

// ============================================================================
// データ転送
// ============================================================================

/// EOI付き書き込み
///
/// ボードがバスマスターの場合は先にスタンバイへ移行してトーカー役を
/// 解放する。長さ0の転送は何もしない（エラーでもない）。
pub fn write(
    board: &Board,
    cancel: &CancelToken,
    buffer: &[u8],
    send_eoi: bool,
) -> TransferResult {
    if buffer.is_empty() {
        debug!("gpib: write called with zero length");
        return Ok(Transfer {
            bytes: 0,
            end: false,
        });
    }
    let iface = board.interface().map_err(TransferError::from)?;

    if board.is_master() {
        iface.go_to_standby().map_err(TransferError::from)?;
    }

    board.start_timer(board.usec_timeout());
    let result = iface.write(board, cancel, buffer, send_eoi);
    let result = apply_timeout_precedence(board, result);
    board.stop_timer();

    if let Err(e) = &result {
        warn!("gpib: write error {} on board {}", e, board.id().raw());
    }
    result
}

/// ENDまたは長さ到達までの読み取り
///
/// エンジンレベルの部分結果を集約しながらバッファを反復的に埋める。
/// タイムアウトはエンジンが部分的に成功していても独立した条件として
/// 伝搬する。
pub fn read(board: &Board, cancel: &CancelToken, buffer: &mut [u8]) -> TransferResult {
    let iface = board.interface().map_err(TransferError::from)?;
    let length = buffer.len();

    let mut total = 0;
    let mut end = false;
    while total < length && !end {
        let chunk_end = usize::min(total + READ_CHUNK, length);

        board.start_timer(board.usec_timeout());
        let result = iface.read(board, cancel, &mut buffer[total..chunk_end]);
        let result = apply_timeout_precedence(board, result);
        board.stop_timer();

        match result {
            Ok(transfer) => {
                total += transfer.bytes;
                end = transfer.end;
                if transfer.bytes == 0 {
                    break;
                }
            }
            Err(e) => {
                return Err(TransferError::new(e.error, total + e.bytes));
            }
        }
    }

    if end {
        board.status().set(BoardStatus::END);
    }
    Ok(Transfer { bytes: total, end })
}

/// コマンドバイト列の送出（トーカー/リスナーのアドレッシング等）
pub fn command(board: &Board, cancel: &CancelToken, buffer: &[u8]) -> TransferResult {
    if !board.is_master() {
        return Err(GpibError::PermissionDenied.into());
    }
    let iface = board.interface().map_err(TransferError::from)?;

    iface.take_control(false).map_err(TransferError::from)?;

    board.start_timer(board.usec_timeout());
    let result = iface.command(board, cancel, buffer);
    let result = apply_timeout_precedence(board, result);
    board.stop_timer();
    result
}

/// タイムアウトを部分的な成功より優先させる
fn apply_timeout_precedence(board: &Board, result: TransferResult) -> TransferResult {
    match result {
        Ok(transfer) if board.io_timed_out() => {
            Err(TransferError::new(GpibError::Timeout, transfer.bytes))
        }
        Err(e) if board.io_timed_out() => Err(TransferError::new(GpibError::Timeout, e.bytes)),
        other => other,
    }
}

// ============================================================================
// コントローラロール / バス管理
// ============================================================================

/// アクティブコントローラ状態への遷移（ATNアサート）
pub fn take_control(board: &Board, synchronous: bool) -> GpibResult<()> {
    let iface = board.interface()?;
    iface.take_control(synchronous)?;
    iface.update_status(board);
    Ok(())
}

/// スタンバイへの移行（ATN解除）
pub fn go_to_standby(board: &Board) -> GpibResult<()> {
    let iface = board.interface()?;
    iface.go_to_standby()?;
    iface.update_status(board);
    Ok(())
}

/// インターフェースクリア（IFCパルス）
///
/// システムコントローラのみ実行できる。IFC後このボードが
/// Controller-In-Chargeになる。
pub fn interface_clear(board: &Board, usec_duration: u32) -> GpibResult<()> {
    if !board.is_master() {
        return Err(GpibError::PermissionDenied);
    }
    let iface = board.interface()?;
    let usec = if usec_duration == 0 {
        DEFAULT_IFC_USEC
    } else {
        usec_duration
    };
    iface.interface_clear(true);
    std::thread::sleep(Duration::from_micros(u64::from(usec)));
    iface.interface_clear(false);
    board.status().set(BoardStatus::CIC);
    Ok(())
}

/// リモートイネーブル（RENライン）
pub fn remote_enable(board: &Board, enable: bool) -> GpibResult<()> {
    if !board.is_master() {
        return Err(GpibError::PermissionDenied);
    }
    board.interface()?.remote_enable(enable);
    Ok(())
}

/// システムコントローラ権の要求 / 解放
pub fn request_system_control(board: &Board, request: bool) -> GpibResult<()> {
    let iface = board.interface()?;
    iface.request_system_control(request);
    board.set_master(request);
    Ok(())
}

/// 自ボードのシリアルポール応答を設定（サービスリクエスト）
pub fn request_service(board: &Board, status_byte: u8) -> GpibResult<()> {
    board.interface()?.serial_poll_response(status_byte);
    Ok(())
}

/// ローカル状態への復帰
pub fn return_to_local(board: &Board) -> GpibResult<()> {
    board.interface()?.return_to_local();
    Ok(())
}

// ============================================================================
// ポーリング
// ============================================================================

/// シリアルポールのコマンド列を発行して1バイト読む
fn serial_poll_sequence(board: &Board, cancel: &CancelToken, addr: DeviceAddr) -> GpibResult<u8> {
    let iface = board.interface()?;
    let config = board.config();

    let mut sequence = vec![cmd::UNL, cmd::mla(config.pad), cmd::SPE, cmd::mta(addr.pad)];
    if let Some(sad) = addr.sad {
        sequence.push(cmd::msa(sad));
    }

    iface.take_control(false)?;
    iface
        .command(board, cancel, &sequence)
        .map_err(|e| e.error)?;
    iface.go_to_standby()?;

    let mut status = [0u8; 1];
    let transfer = iface.read(board, cancel, &mut status).map_err(|e| e.error)?;
    if transfer.bytes == 0 {
        warn!("gpib: serial poll got no status byte from pad {}", addr.pad);
        return Err(GpibError::Timeout);
    }

    iface.take_control(true)?;
    iface
        .command(board, cancel, &[cmd::SPD, cmd::UNT])
        .map_err(|e| e.error)?;

    Ok(status[0])
}

/// デバイスのシリアルポールステータスを取得する
///
/// オートポールが既に収集したバイトがあればそれを消費し、なければ
/// その場でポールシーケンスを発行する。
pub fn serial_poll(
    board: &Board,
    cancel: &CancelToken,
    addr: DeviceAddr,
    usec_timeout: u32,
) -> GpibResult<u8> {
    if let Some(byte) = board.devices().pop_status_byte(addr) {
        return Ok(byte);
    }

    board.start_timer(usec_timeout);
    let result = serial_poll_sequence(board, cancel, addr);
    let result = if board.io_timed_out() {
        Err(GpibError::Timeout)
    } else {
        result
    };
    board.stop_timer();
    result
}

/// パラレルポールの実行
pub fn parallel_poll(board: &Board, _cancel: &CancelToken) -> GpibResult<u8> {
    board.start_timer(board.usec_timeout());
    let result = board.interface()?.parallel_poll();
    board.stop_timer();
    result
}

/// 自ボードのパラレルポール応答を設定する
pub fn parallel_poll_configure(board: &Board, config: u8) -> GpibResult<()> {
    let iface = board.interface()?;
    iface.parallel_poll_configure(config);
    board.set_parallel_poll_configuration(config);
    Ok(())
}

// ============================================================================
// オートポール
// ============================================================================

/// オープン中の全デバイスをシリアルポールする
///
/// 取得したステータスバイトは各デバイスのステータスキューへ積む。
/// サービスを要求していたデバイス数（RQSビットが立っていた数）を返す。
pub fn autopoll_all_devices(board: &Board, cancel: &CancelToken) -> GpibResult<usize> {
    let mut serviced = 0;
    for addr in board.devices().open_addresses() {
        let byte = serial_poll_sequence_timed(board, cancel, addr)?;
        board.devices().push_status_byte(addr, byte);
        if byte & RQS_BIT != 0 {
            debug!("gpib: autopoll pad {} claimed srq (0x{:02x})", addr.pad, byte);
            serviced += 1;
        }
    }
    Ok(serviced)
}

fn serial_poll_sequence_timed(
    board: &Board,
    cancel: &CancelToken,
    addr: DeviceAddr,
) -> GpibResult<u8> {
    board.start_timer(board.usec_timeout());
    let result = serial_poll_sequence(board, cancel, addr);
    board.stop_timer();
    result
}

/// オートポールループ
///
/// 専用の長期実行フローから呼ばれる。ボードごとに同時1ループのみ
/// 許可され、2つ目の呼び出しは先行ループの終了までブロックする。
/// SRQ検出を待ち、オープン中の全デバイスを巡回ポールする。どの
/// デバイスもSRQを引き取らなければスタックSRQフラグを立てて
/// ビジースピンを避ける（新しいデバイスのオープンで解除される）。
/// キャンセルされるまで終了しない。
pub fn autopoll(
    board: &Board,
    owner: crate::session::SessionId,
    cancel: &CancelToken,
) -> GpibResult<()> {
    board.autopoller_arrived();
    if let Err(e) = board.autopoll_mutex().acquire(owner, cancel) {
        board.autopoller_left();
        return Err(e);
    }

    debug!("gpib: entering autopoll loop on board {}", board.id().raw());
    let result = loop {
        let outcome = board.wait_with_deadline(None, cancel, || {
            board.is_master()
                && board.is_online()
                && !board.stuck_srq()
                && board.status().test_and_clear(BoardStatus::SRQI)
        });
        if outcome == WaitOutcome::Cancelled {
            break Err(GpibError::Interrupted);
        }

        match autopoll_all_devices(board, cancel) {
            Ok(serviced) if serviced > 0 => {}
            Ok(_) | Err(_) => {
                // 誰もSRQを引き取らなかった。新デバイスのオープンまで保留。
                board.set_stuck_srq(true);
                board.status().set(BoardStatus::SRQI);
            }
        }
    };
    debug!("gpib: left autopoll loop on board {}", board.id().raw());

    board.autopoller_left();
    let _ = board.autopoll_mutex().release(owner);
    result
}

// ============================================================================
// ステータス待機 / 照会
// ============================================================================

/// ステータスビット待機（wait操作）
///
/// `wait_mask` のいずれかのビットが立つまで待ち、成立後に
/// `clear_mask` のビットを落としてステータスを返す。タイムアウト時は
/// TIMOを合成したスナップショットを返す（エラーにはしない）。
pub fn wait_for_status(
    board: &Board,
    cancel: &CancelToken,
    wait_mask: BoardStatus,
    clear_mask: BoardStatus,
    usec_timeout: u32,
) -> GpibResult<BoardStatus> {
    let deadline = if usec_timeout == 0 {
        None
    } else {
        Some(std::time::Instant::now() + Duration::from_micros(u64::from(usec_timeout)))
    };

    let outcome = board.wait_with_deadline(deadline, cancel, || {
        board.status().load().intersects(wait_mask)
    });
    match outcome {
        WaitOutcome::Cancelled => Err(GpibError::Interrupted),
        WaitOutcome::TimedOut => Ok(board.status().load() | BoardStatus::TIMO),
        WaitOutcome::Ready => {
            let status = board.status().load();
            board.status().clear(clear_mask);
            Ok(status)
        }
    }
}

/// 現在のボードステータスを取得する（可能ならチップから再サンプル）
pub fn query_status(board: &Board) -> BoardStatus {
    match board.interface() {
        Ok(iface) if board.is_online() => iface.update_status(board),
        _ => board.status().load(),
    }
}

// ============================================================================
// ライフサイクル / 設定
// ============================================================================

/// ボードをオンラインにする（アダプタ接続とチップリセット）
pub fn online(board: &Board, session: &crate::session::Session) -> GpibResult<()> {
    let iface = board.interface()?;
    if !board.is_online() {
        iface.attach(board)?;
        board.set_online(true);
    }
    session.note_online();
    Ok(())
}

/// ボードをオフラインにする（アダプタ切断と状態破棄）
pub fn offline(board: &Board, session: &crate::session::Session) -> GpibResult<()> {
    if board.is_online() {
        let iface = board.interface()?;
        iface.detach(board);
        board.set_online(false);
        board.clear_events();
    }
    session.note_offline();
    Ok(())
}

/// セッション終了時の後始末
///
/// 開いたままのデバイス参照と保持中の制御ミューテックスを戻し、
/// このセッションが残したオンライン化を巻き戻す。最後のオープンが
/// 消えた時点でアダプタを切り離す。
pub fn cleanup_session(board: &Board, session: &crate::session::Session) -> GpibResult<()> {
    let result = session.cleanup(board);
    while session.online_count() > 0 {
        session.note_offline();
        if board.close() == 0 && board.is_online() {
            if let Ok(iface) = board.interface() {
                iface.detach(board);
            }
            board.set_online(false);
            board.clear_events();
        }
    }
    result
}

/// EOS検出の設定
pub fn set_eos(board: &Board, byte: u8, flags: crate::chip::EosFlags) -> GpibResult<()> {
    use crate::chip::EosFlags;
    let iface = board.interface()?;
    if flags.contains(EosFlags::REOS) {
        iface.enable_eos(byte, flags.contains(EosFlags::BIN));
    } else {
        iface.disable_eos();
    }
    Ok(())
}
