//! # コマンドディスパッチャ
//!
//! セッションからの要求を検証してオーケストレータへ振り分ける。
//! 要求は4段階の権限はしごを通る:
//!
//! 1. 管理者専用（永続リソース設定）
//! 2. ロック不要の設定系（制御ミューテックスの取得/解放、オンライン化）
//! 3. オンライン必須の操作（データ転送、イベント取得、ステータス待機）
//! 4. 制御ミューテックス保持必須のコントロールプレーン（コマンド送出、
//!    ポール、バス管理、アドレス割り当て）
//!
//! データの読み書きは制御ミューテックスなしで実行できる。転送の
//! 直列化はチップエンジン側の短いクリティカルセクションが担う。

use std::sync::Arc;

use log::debug;

use crate::board::{Board, BoardInfo, BusResources};
use crate::bus;
use crate::chip::EosFlags;
use crate::error::{GpibError, GpibResult, TransferError};
use crate::events::BusEvent;
use crate::registry::{BoardId, BusRuntime, DeviceAddr};
use crate::session::{Descriptor, Handle, Session};
use crate::status::BoardStatus;

/// ディスパッチャへの要求
#[derive(Debug, Clone)]
pub enum Request {
    // ------------------------------------------------------------------
    // 管理者専用
    // ------------------------------------------------------------------
    /// ボードの永続リソース（ベース/IRQ/DMA）の設定。オフライン時のみ。
    SetResources(BusResources),

    // ------------------------------------------------------------------
    // ロック不要の設定系
    // ------------------------------------------------------------------
    /// 制御ミューテックスの取得（解放されるまでブロック）
    AcquireControl,
    /// 制御ミューテックスの解放
    ReleaseControl,
    /// ボードのオンライン化
    Online { exclusive: bool },
    /// ボードのオフライン化
    Offline,
    /// 現在のステータス取得
    Status,

    // ------------------------------------------------------------------
    // オンライン必須（データ転送と照会）
    // ------------------------------------------------------------------
    /// データ書き込み
    Write { data: Vec<u8>, send_eoi: bool },
    /// データ読み取り（最大length バイト）
    Read { length: usize },
    /// プロトコルイベントの取り出し
    PopEvent,
    /// デバイスの収集済みステータスバイト数
    StatusByteCount { handle: Handle },
    /// ステータスビット待機
    Wait {
        wait_mask: BoardStatus,
        clear_mask: BoardStatus,
        usec_timeout: u32,
    },
    /// バス管理ラインのサンプリング
    LineStatus,
    /// ローカル状態への復帰
    ReturnToLocal,

    // ------------------------------------------------------------------
    // コントロールプレーン（制御ミューテックス保持必須）
    // ------------------------------------------------------------------
    /// コマンドバイト列の送出
    Command { data: Vec<u8> },
    /// プライマリアドレスの設定（デバイスハンドルなら再登録）
    SetPad { handle: Handle, pad: u8 },
    /// セカンダリアドレスの設定（デバイスハンドルなら再登録）
    SetSad { handle: Handle, sad: Option<u8> },
    /// デバイスのオープン（ハンドルを返す）
    OpenDevice { addr: DeviceAddr },
    /// デバイスのクローズ
    CloseDevice { handle: Handle },
    /// シリアルポール（usec_timeout == 0 はボード設定値を使用）
    SerialPoll { handle: Handle, usec_timeout: u32 },
    /// パラレルポール
    ParallelPoll,
    /// 自ボードのパラレルポール応答設定
    ParallelPollConfigure { config: u8 },
    /// 個別ステータス (ist) ビットの設定
    SetIst { ist: bool },
    /// EOS検出の設定
    SetEos { byte: u8, flags: EosFlags },
    /// I/Oタイムアウトの設定（0は無期限）
    SetTimeout { usec: u32 },
    /// T1ディレイの設定
    SetT1Delay { nano_sec: u32 },
    /// アクティブコントローラ状態への遷移
    TakeControl { synchronous: bool },
    /// スタンバイへの移行
    GoToStandby,
    /// インターフェースクリア（0はデフォルト時間）
    InterfaceClear { usec_duration: u32 },
    /// リモートイネーブル
    RemoteEnable { enable: bool },
    /// サービスリクエスト（自ボードのシリアルポール応答）
    RequestService { status_byte: u8 },
    /// 自ボードの現在のシリアルポール応答の照会
    QueryServiceRequest,
    /// システムコントローラ権の要求 / 解放
    RequestSystemControl { request: bool },
    /// ボード情報クエリ
    BoardInfo,
    /// オートポールループへの参加（キャンセルまで戻らない）
    Autopoll,
}

/// ディスパッチャからの応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    None,
    /// 転送結果
    Transfer { bytes: usize, end: bool },
    /// 読み取ったデータ
    Data { data: Vec<u8>, end: bool },
    /// ステータスバイト
    StatusByte(u8),
    /// ボードステータス
    Status(BoardStatus),
    /// プロトコルイベント
    Event(BusEvent),
    /// 個数
    Count(usize),
    /// バス管理ラインの状態
    Lines(u16),
    /// 新しいデバイスハンドル
    Handle(Handle),
    /// ボード情報
    Info(BoardInfo),
}

/// オンライン必須の前提チェック
fn require_online(board: &Board) -> GpibResult<()> {
    if board.is_online() {
        Ok(())
    } else {
        Err(GpibError::NotConfigured)
    }
}

/// 制御ミューテックス保持の前提チェック（オンライン不問）
fn require_mutex(board: &Board, session: &Session) -> GpibResult<()> {
    if board.control_mutex().is_held_by(session.id()) {
        Ok(())
    } else {
        Err(GpibError::PermissionDenied)
    }
}

/// オンライン + 制御ミューテックス保持の前提チェック
fn require_control(board: &Board, session: &Session) -> GpibResult<()> {
    require_online(board)?;
    require_mutex(board, session)
}

/// デバイスハンドルの解決（ボードハンドルは拒否）
fn device_descriptor(session: &Session, handle: Handle) -> GpibResult<Descriptor> {
    let desc = session.descriptor(handle)?;
    if desc.is_board {
        return Err(GpibError::InvalidHandle);
    }
    Ok(desc)
}

/// ディスパッチの結果
///
/// エラーは部分転送のバイト数ごと報告される。転送以外の失敗は
/// バイト数0で包まれる。
pub type DispatchResult = Result<Reply, TransferError>;

/// 要求を1件処理する
pub fn dispatch(
    runtime: &BusRuntime,
    session: &Session,
    board_id: BoardId,
    request: Request,
) -> DispatchResult {
    let board = runtime.board(board_id)?;
    let cancel = session.cancel_token();

    match request {
        // ------------------------------------------------------------------
        // 管理者専用
        // ------------------------------------------------------------------
        Request::SetResources(resources) => {
            if !session.is_admin() {
                return Err(GpibError::PermissionDenied.into());
            }
            if board.is_online() {
                return Err(GpibError::Busy.into());
            }
            board.set_resources(resources);
            Ok(Reply::None)
        }

        // ------------------------------------------------------------------
        // ロック不要の設定系
        // ------------------------------------------------------------------
        Request::AcquireControl => {
            board.control_mutex().acquire(session.id(), cancel)?;
            Ok(Reply::None)
        }
        Request::ReleaseControl => {
            board.control_mutex().release(session.id())?;
            Ok(Reply::None)
        }
        Request::Online { exclusive } => {
            board.open(exclusive)?;
            if let Err(e) = bus::online(&board, session) {
                board.close();
                return Err(e.into());
            }
            debug!("gpib: board {} online", board_id.raw());
            Ok(Reply::None)
        }
        Request::Offline => {
            bus::offline(&board, session)?;
            board.close();
            debug!("gpib: board {} offline", board_id.raw());
            Ok(Reply::None)
        }
        Request::Status => Ok(Reply::Status(bus::query_status(&board))),
        // アドレス割り当てはオフラインでも許すが、ミューテックス保持は必須
        Request::SetPad { handle, pad } => {
            require_mutex(&board, session)?;
            set_address(session, &board, handle, Some(pad), None)?;
            Ok(Reply::None)
        }
        Request::SetSad { handle, sad } => {
            require_mutex(&board, session)?;
            set_address(session, &board, handle, None, Some(sad))?;
            Ok(Reply::None)
        }

        // ------------------------------------------------------------------
        // オンライン必須（データ転送と照会）
        // ------------------------------------------------------------------
        Request::PopEvent => {
            require_online(&board)?;
            Ok(Reply::Event(board.pop_event()?))
        }
        Request::StatusByteCount { handle } => {
            require_online(&board)?;
            let desc = device_descriptor(session, handle)?;
            Ok(Reply::Count(board.devices().num_status_bytes(desc.addr)))
        }
        Request::Wait {
            wait_mask,
            clear_mask,
            usec_timeout,
        } => {
            require_online(&board)?;
            let status = bus::wait_for_status(&board, cancel, wait_mask, clear_mask, usec_timeout)?;
            Ok(Reply::Status(status))
        }
        Request::LineStatus => {
            require_online(&board)?;
            Ok(Reply::Lines(board.interface()?.line_status()?))
        }
        Request::ReturnToLocal => {
            require_online(&board)?;
            bus::return_to_local(&board)?;
            Ok(Reply::None)
        }

        Request::Write { data, send_eoi } => {
            require_online(&board)?;
            let transfer = bus::write(&board, cancel, &data, send_eoi)?;
            Ok(Reply::Transfer {
                bytes: transfer.bytes,
                end: transfer.end,
            })
        }
        Request::Read { length } => {
            require_online(&board)?;
            let mut data = vec![0u8; length];
            let transfer = bus::read(&board, cancel, &mut data)?;
            data.truncate(transfer.bytes);
            Ok(Reply::Data {
                data,
                end: transfer.end,
            })
        }
        // ------------------------------------------------------------------
        // コントロールプレーン（制御ミューテックス保持必須）
        // ------------------------------------------------------------------
        Request::Command { data } => {
            require_control(&board, session)?;
            let transfer = bus::command(&board, cancel, &data)?;
            Ok(Reply::Transfer {
                bytes: transfer.bytes,
                end: transfer.end,
            })
        }
        Request::OpenDevice { addr } => {
            require_control(&board, session)?;
            let handle = session.insert_descriptor(Descriptor {
                addr,
                is_board: false,
            })?;
            board.devices().increment_open(addr);
            // 新デバイスがSRQの主かもしれないのでスタックSRQを解除する
            board.set_stuck_srq(false);
            debug!("gpib: opened device pad {} on board {}", addr.pad, board_id.raw());
            Ok(Reply::Handle(handle))
        }
        Request::CloseDevice { handle } => {
            require_control(&board, session)?;
            let desc = device_descriptor(session, handle)?;
            session.remove_descriptor(handle)?;
            board.devices().decrement_open(desc.addr)?;
            Ok(Reply::None)
        }
        Request::SerialPoll {
            handle,
            usec_timeout,
        } => {
            require_control(&board, session)?;
            let desc = device_descriptor(session, handle)?;
            let usec = if usec_timeout == 0 {
                board.usec_timeout()
            } else {
                usec_timeout
            };
            let byte = bus::serial_poll(&board, cancel, desc.addr, usec)?;
            Ok(Reply::StatusByte(byte))
        }
        Request::ParallelPoll => {
            require_control(&board, session)?;
            Ok(Reply::StatusByte(bus::parallel_poll(&board, cancel)?))
        }
        Request::ParallelPollConfigure { config } => {
            require_control(&board, session)?;
            bus::parallel_poll_configure(&board, config)?;
            Ok(Reply::None)
        }
        Request::SetIst { ist } => {
            require_control(&board, session)?;
            board.set_ist(ist);
            Ok(Reply::None)
        }
        Request::SetEos { byte, flags } => {
            require_control(&board, session)?;
            bus::set_eos(&board, byte, flags)?;
            Ok(Reply::None)
        }
        Request::SetTimeout { usec } => {
            require_control(&board, session)?;
            board.set_usec_timeout(usec);
            Ok(Reply::None)
        }
        Request::SetT1Delay { nano_sec } => {
            require_control(&board, session)?;
            // チップが実際に適用した段階値を記録する
            let actual = board.interface()?.t1_delay(nano_sec);
            board.set_t1_delay(actual);
            Ok(Reply::None)
        }
        Request::TakeControl { synchronous } => {
            require_control(&board, session)?;
            bus::take_control(&board, synchronous)?;
            Ok(Reply::None)
        }
        Request::GoToStandby => {
            require_control(&board, session)?;
            bus::go_to_standby(&board)?;
            Ok(Reply::None)
        }
        Request::InterfaceClear { usec_duration } => {
            require_control(&board, session)?;
            bus::interface_clear(&board, usec_duration)?;
            Ok(Reply::None)
        }
        Request::RemoteEnable { enable } => {
            require_control(&board, session)?;
            bus::remote_enable(&board, enable)?;
            Ok(Reply::None)
        }
        Request::RequestService { status_byte } => {
            require_control(&board, session)?;
            bus::request_service(&board, status_byte)?;
            Ok(Reply::None)
        }
        Request::QueryServiceRequest => {
            require_control(&board, session)?;
            Ok(Reply::StatusByte(board.interface()?.serial_poll_status()))
        }
        Request::RequestSystemControl { request } => {
            require_control(&board, session)?;
            bus::request_system_control(&board, request)?;
            Ok(Reply::None)
        }
        Request::BoardInfo => {
            require_control(&board, session)?;
            Ok(Reply::Info(board.info()))
        }
        Request::Autopoll => {
            require_online(&board)?;
            bus::autopoll(&board, session.id(), cancel)?;
            Ok(Reply::None)
        }
    }
}

/// アドレス変更の共通処理
///
/// ボードハンドルならボード設定を書き換え、デバイスハンドルなら
/// レジストリの参照カウントを旧アドレスから新アドレスへ付け替える。
fn set_address(
    session: &Session,
    board: &Arc<Board>,
    handle: Handle,
    pad: Option<u8>,
    sad: Option<Option<u8>>,
) -> GpibResult<()> {
    let desc = session.descriptor(handle)?;
    if desc.is_board {
        if let Some(pad) = pad {
            DeviceAddr::new(pad, None)?;
            board.set_pad(pad);
            if board.is_online() {
                board.interface()?.primary_address(pad);
            }
        }
        if let Some(sad) = sad {
            if let Some(value) = sad {
                DeviceAddr::new(0, Some(value))?;
            }
            board.set_sad(sad);
            if board.is_online() {
                if let Some(value) = sad {
                    board.interface()?.secondary_address(value, true);
                } else {
                    board.interface()?.secondary_address(0, false);
                }
            }
        }
        return Ok(());
    }

    let new_addr = DeviceAddr::new(
        pad.unwrap_or(desc.addr.pad),
        match sad {
            Some(sad) => sad,
            None => desc.addr.sad,
        },
    )?;
    if new_addr == desc.addr {
        return Ok(());
    }
    board.devices().increment_open(new_addr);
    board.devices().decrement_open(desc.addr)?;
    session.update_descriptor_addr(handle, new_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardInterface;
    use crate::error::{GpibResult, Transfer, TransferResult};
    use crate::session::SessionCaps;
    use crate::wait::CancelToken;

    /// 何もしないテスト用アダプタ
    struct NullAdapter;

    impl BoardInterface for NullAdapter {
        fn name(&self) -> &str {
            "null"
        }
        fn attach(&self, _board: &Board) -> GpibResult<()> {
            Ok(())
        }
        fn detach(&self, _board: &Board) {}
        fn read(
            &self,
            _board: &Board,
            _cancel: &CancelToken,
            _buffer: &mut [u8],
        ) -> TransferResult {
            Ok(Transfer { bytes: 0, end: false })
        }
        fn write(
            &self,
            _board: &Board,
            _cancel: &CancelToken,
            buffer: &[u8],
            _send_eoi: bool,
        ) -> TransferResult {
            Ok(Transfer {
                bytes: buffer.len(),
                end: false,
            })
        }
        fn command(&self, _board: &Board, _cancel: &CancelToken, buffer: &[u8]) -> TransferResult {
            Ok(Transfer {
                bytes: buffer.len(),
                end: false,
            })
        }
        fn take_control(&self, _synchronous: bool) -> GpibResult<()> {
            Ok(())
        }
        fn go_to_standby(&self) -> GpibResult<()> {
            Ok(())
        }
        fn interface_clear(&self, _assert: bool) {}
        fn remote_enable(&self, _enable: bool) {}
        fn request_system_control(&self, _request: bool) {}
        fn enable_eos(&self, _byte: u8, _compare_8_bits: bool) {}
        fn disable_eos(&self) {}
        fn parallel_poll(&self) -> GpibResult<u8> {
            Ok(0)
        }
        fn parallel_poll_configure(&self, _config: u8) {}
        fn serial_poll_response(&self, _status: u8) {}
        fn serial_poll_status(&self) -> u8 {
            0
        }
        fn update_status(&self, board: &Board) -> BoardStatus {
            board.status().load()
        }
        fn primary_address(&self, _address: u8) {}
        fn secondary_address(&self, _address: u8, _enable: bool) {}
        fn return_to_local(&self) {}
        fn t1_delay(&self, nano_sec: u32) -> u32 {
            nano_sec
        }
    }

    fn runtime_with_null_adapter() -> BusRuntime {
        let runtime = BusRuntime::new(1);
        let board = runtime.board(BoardId::from_raw(0)).unwrap();
        board.assign_interface(Arc::new(NullAdapter));
        runtime
    }

    #[test]
    fn test_io_requires_online() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let err = dispatch(
            &runtime,
            &session,
            BoardId::from_raw(0),
            Request::Write {
                data: vec![1],
                send_eoi: false,
            },
        )
        .unwrap_err();
        assert_eq!(err.error, GpibError::NotConfigured);
    }

    #[test]
    fn test_data_transfer_needs_no_mutex() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let id = BoardId::from_raw(0);
        dispatch(&runtime, &session, id, Request::Online { exclusive: false }).unwrap();
        let reply = dispatch(
            &runtime,
            &session,
            id,
            Request::Write {
                data: vec![1, 2],
                send_eoi: false,
            },
        )
        .unwrap();
        assert_eq!(reply, Reply::Transfer { bytes: 2, end: false });
    }

    #[test]
    fn test_control_plane_requires_mutex() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let id = BoardId::from_raw(0);
        dispatch(&runtime, &session, id, Request::Online { exclusive: false }).unwrap();
        let err = dispatch(
            &runtime,
            &session,
            id,
            Request::Command { data: vec![0x3f] },
        )
        .unwrap_err();
        assert_eq!(err.error, GpibError::PermissionDenied);

        dispatch(&runtime, &session, id, Request::AcquireControl).unwrap();
        dispatch(
            &runtime,
            &session,
            id,
            Request::RequestSystemControl { request: true },
        )
        .unwrap();
        let reply = dispatch(
            &runtime,
            &session,
            id,
            Request::Command { data: vec![0x3f] },
        )
        .unwrap();
        assert_eq!(reply, Reply::Transfer { bytes: 1, end: false });
        dispatch(&runtime, &session, id, Request::ReleaseControl).unwrap();
    }

    #[test]
    fn test_set_resources_requires_admin() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let err = dispatch(
            &runtime,
            &session,
            BoardId::from_raw(0),
            Request::SetResources(BusResources::default()),
        )
        .unwrap_err();
        assert_eq!(err.error, GpibError::PermissionDenied);

        let admin = Session::new(SessionCaps::ADMIN);
        dispatch(
            &runtime,
            &admin,
            BoardId::from_raw(0),
            Request::SetResources(BusResources {
                base: 0x2c0,
                irq: 11,
                dma: 1,
            }),
        )
        .unwrap();
    }

    #[test]
    fn test_open_device_clears_stuck_srq() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let id = BoardId::from_raw(0);
        dispatch(&runtime, &session, id, Request::Online { exclusive: false }).unwrap();
        dispatch(&runtime, &session, id, Request::AcquireControl).unwrap();

        let board = runtime.board(id).unwrap();
        board.set_stuck_srq(true);

        let addr = DeviceAddr::new(5, None).unwrap();
        let reply = dispatch(&runtime, &session, id, Request::OpenDevice { addr }).unwrap();
        assert!(!board.stuck_srq());
        assert_eq!(board.devices().len(), 1);

        let handle = match reply {
            Reply::Handle(h) => h,
            other => panic!("unexpected reply {:?}", other),
        };
        dispatch(&runtime, &session, id, Request::CloseDevice { handle }).unwrap();
        assert!(board.devices().is_empty());
    }

    #[test]
    fn test_set_pad_moves_device_registration() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let id = BoardId::from_raw(0);
        dispatch(&runtime, &session, id, Request::Online { exclusive: false }).unwrap();
        dispatch(&runtime, &session, id, Request::AcquireControl).unwrap();

        let addr = DeviceAddr::new(5, None).unwrap();
        let reply = dispatch(&runtime, &session, id, Request::OpenDevice { addr }).unwrap();
        let handle = match reply {
            Reply::Handle(h) => h,
            other => panic!("unexpected reply {:?}", other),
        };

        dispatch(&runtime, &session, id, Request::SetPad { handle, pad: 9 }).unwrap();
        let board = runtime.board(id).unwrap();
        let open = board.devices().open_addresses();
        assert_eq!(open, vec![DeviceAddr::new(9, None).unwrap()]);
        assert_eq!(session.descriptor(handle).unwrap().addr.pad, 9);
    }

    #[test]
    fn test_invalid_board_id() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let err = dispatch(&runtime, &session, BoardId::from_raw(7), Request::Status).unwrap_err();
        assert_eq!(err.error, GpibError::InvalidHandle);
    }

    #[test]
    fn test_board_info_reply_compares_whole() {
        let runtime = runtime_with_null_adapter();
        let session = Session::new(SessionCaps::empty());
        let id = BoardId::from_raw(0);
        dispatch(&runtime, &session, id, Request::Online { exclusive: false }).unwrap();
        dispatch(&runtime, &session, id, Request::AcquireControl).unwrap();
        dispatch(&runtime, &session, id, Request::SetT1Delay { nano_sec: 800 }).unwrap();

        let reply = dispatch(&runtime, &session, id, Request::BoardInfo).unwrap();
        assert_eq!(
            reply,
            Reply::Info(BoardInfo {
                pad: 0,
                sad: None,
                is_system_controller: false,
                autopolling: false,
                ist: false,
                parallel_poll_configuration: 0,
                t1_nano_sec: 800,
            })
        );
    }
}
