//! # ボード抽象
//!
//! Board - 物理GPIBインターフェース1枚分の状態
//! BoardInterface - アダプタ実装が提供する操作群（トレイト）
//!
//! オーケストレータはこのトレイトにのみ依存し、具体的なアダプタを
//! 知らない。割り込み/イベントはアダプタ側からBoardのステータス
//! ビットと待機キューを通じて上位へ伝搬する。

pub mod lock;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use spin::{Mutex, RwLock};

use crate::error::{GpibError, GpibResult, TransferResult};
use crate::events::{BusEvent, EventQueue};
use crate::registry::{BoardId, DeviceRegistry};
use crate::session::SessionId;
use crate::status::{AtomicStatus, BoardStatus};
use crate::wait::{CancelToken, WaitOutcome, WaitQueue};

pub use lock::OwnedMutex;

/// デフォルトI/Oタイムアウト（マイクロ秒）
pub const DEFAULT_USEC_TIMEOUT: u32 = 3_000_000;

/// アダプタ実装が提供する操作群
///
/// アダプタファミリごとの関数テーブルの役割を担う。転送系はすべて型付き
/// エラーで失敗し、部分転送のバイト数を添えて返す。
pub trait BoardInterface: Send + Sync {
    /// アダプタ名
    fn name(&self) -> &str;

    /// ボードへの接続（チップリセットを含む）
    fn attach(&self, board: &Board) -> GpibResult<()>;

    /// ボードからの切断
    fn detach(&self, board: &Board);

    fn read(&self, board: &Board, cancel: &CancelToken, buffer: &mut [u8]) -> TransferResult;
    fn write(
        &self,
        board: &Board,
        cancel: &CancelToken,
        buffer: &[u8],
        send_eoi: bool,
    ) -> TransferResult;
    fn command(&self, board: &Board, cancel: &CancelToken, buffer: &[u8]) -> TransferResult;

    fn take_control(&self, synchronous: bool) -> GpibResult<()>;
    fn go_to_standby(&self) -> GpibResult<()>;
    fn interface_clear(&self, assert: bool);
    fn remote_enable(&self, enable: bool);
    fn request_system_control(&self, request: bool);

    fn enable_eos(&self, byte: u8, compare_8_bits: bool);
    fn disable_eos(&self);

    fn parallel_poll(&self) -> GpibResult<u8>;
    fn parallel_poll_configure(&self, config: u8);
    fn serial_poll_response(&self, status: u8);
    fn serial_poll_status(&self) -> u8;

    fn update_status(&self, board: &Board) -> BoardStatus;
    fn primary_address(&self, address: u8);
    fn secondary_address(&self, address: u8, enable: bool);
    fn return_to_local(&self);

    /// T1ディレイの設定。実際に適用された値（ナノ秒）を返す
    fn t1_delay(&self, nano_sec: u32) -> u32;

    /// バス管理ラインのサンプリング（非対応アダプタはNotConfigured）
    fn line_status(&self) -> GpibResult<u16> {
        Err(GpibError::NotConfigured)
    }
}

/// 制御ミューテックス保持下でのみ変更されるボード設定
#[derive(Debug, Clone, Copy)]
pub struct BoardConfig {
    /// プライマリアドレス
    pub pad: u8,
    /// セカンダリアドレス
    pub sad: Option<u8>,
    /// I/Oタイムアウト（マイクロ秒、0は無期限）
    pub usec_timeout: u32,
    /// 個別ステータス (ist) ビット
    pub ist: bool,
    /// パラレルポール設定バイト
    pub parallel_poll_configuration: u8,
    /// T1ディレイ（ナノ秒）
    pub t1_nano_sec: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            pad: 0,
            sad: None,
            usec_timeout: DEFAULT_USEC_TIMEOUT,
            ist: false,
            parallel_poll_configuration: 0,
            t1_nano_sec: 2000,
        }
    }
}

/// 永続設定（管理者権限でのみ変更可能）
#[derive(Debug, Clone, Copy, Default)]
pub struct BusResources {
    /// ベースアドレス相当
    pub base: u64,
    /// 割り込みライン
    pub irq: u32,
    /// DMAチャネル
    pub dma: u32,
}

/// セッションのオープン状態
#[derive(Debug, Default)]
struct OpenState {
    count: u32,
    exclusive: bool,
}

/// ボード情報クエリの応答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardInfo {
    pub pad: u8,
    pub sad: Option<u8>,
    pub is_system_controller: bool,
    pub autopolling: bool,
    pub ist: bool,
    pub parallel_poll_configuration: u8,
    pub t1_nano_sec: u32,
}

/// 物理GPIBインターフェース1枚分の状態
pub struct Board {
    id: BoardId,
    /// ステータスビットマスク（割り込みからロックフリー更新）
    status: AtomicStatus,
    /// ブロック中の操作を起こす待機キュー
    wait: WaitQueue,
    /// 接続中のアダプタ実装
    iface: RwLock<Option<Arc<dyn BoardInterface>>>,
    /// ボード設定
    config: Mutex<BoardConfig>,
    /// 永続設定
    resources: Mutex<BusResources>,
    /// オンラインフラグ（オートポール述語からロックフリーで読む）
    online: AtomicBool,
    /// システムコントローラ（マスター）フラグ
    master: AtomicBool,
    /// スタックSRQフラグ
    stuck_srq: AtomicBool,
    /// オートポール参加者数
    autopollers: AtomicI32,
    /// 制御ミューテックス（保持者のセッション識別子を記録）
    control: OwnedMutex,
    /// オートポール許可（同時に1ループのみ）
    autopoll_lock: OwnedMutex,
    /// I/Oタイマーのデッドライン
    deadline: Mutex<Option<Instant>>,
    /// プロトコルイベントキュー
    events: EventQueue,
    /// オープンデバイスレジストリ
    devices: DeviceRegistry,
    /// セッションのオープン状態
    open_state: Mutex<OpenState>,
}

impl Board {
    pub fn new(id: BoardId) -> Self {
        Self {
            id,
            status: AtomicStatus::new(),
            wait: WaitQueue::new(),
            iface: RwLock::new(None),
            config: Mutex::new(BoardConfig::default()),
            resources: Mutex::new(BusResources::default()),
            online: AtomicBool::new(false),
            master: AtomicBool::new(false),
            stuck_srq: AtomicBool::new(false),
            autopollers: AtomicI32::new(0),
            control: OwnedMutex::new(),
            autopoll_lock: OwnedMutex::new(),
            deadline: Mutex::new(None),
            events: EventQueue::new(),
            devices: DeviceRegistry::new(),
            open_state: Mutex::new(OpenState::default()),
        }
    }

    #[inline(always)]
    pub const fn id(&self) -> BoardId {
        self.id
    }

    #[inline]
    pub fn status(&self) -> &AtomicStatus {
        &self.status
    }

    #[inline]
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    #[inline]
    pub fn control_mutex(&self) -> &OwnedMutex {
        &self.control
    }

    #[inline]
    pub fn autopoll_mutex(&self) -> &OwnedMutex {
        &self.autopoll_lock
    }

    // ========================================================================
    // アダプタ接続
    // ========================================================================

    /// アダプタ実装を割り当てる（まだオンラインにはしない）
    pub fn assign_interface(&self, iface: Arc<dyn BoardInterface>) {
        debug!("gpib: board {} assigned interface {}", self.id.raw(), iface.name());
        *self.iface.write() = Some(iface);
    }

    /// アダプタ実装の割り当てを外す
    pub fn clear_interface(&self) {
        *self.iface.write() = None;
    }

    /// 接続中のアダプタ実装を取得する
    pub fn interface(&self) -> GpibResult<Arc<dyn BoardInterface>> {
        self.iface.read().clone().ok_or(GpibError::NotConfigured)
    }

    /// アダプタが割り当て済みか
    pub fn has_interface(&self) -> bool {
        self.iface.read().is_some()
    }

    // ========================================================================
    // オンライン / マスター / SRQ状態
    // ========================================================================

    #[inline]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
        self.wake();
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::Acquire)
    }

    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::Release);
        if master {
            self.status.set(BoardStatus::CIC);
        } else {
            self.status.clear(BoardStatus::CIC);
        }
        self.wake();
    }

    #[inline]
    pub fn stuck_srq(&self) -> bool {
        self.stuck_srq.load(Ordering::Acquire)
    }

    /// スタックSRQフラグを設定 / 解除する
    ///
    /// 新しいデバイスがオープンされた際に解除される（そのデバイスが
    /// SRQをアサートしている本人かもしれないため）。
    pub fn set_stuck_srq(&self, stuck: bool) {
        self.stuck_srq.store(stuck, Ordering::Release);
        if !stuck {
            self.wake();
        }
    }

    /// オートポール参加者数の増減
    pub fn autopoller_arrived(&self) {
        self.autopollers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn autopoller_left(&self) {
        let prev = self.autopollers.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            warn!("gpib: bug! negative number of autopolling processes");
        }
    }

    pub fn autopolling(&self) -> bool {
        self.autopollers.load(Ordering::Acquire) > 0
    }

    // ========================================================================
    // 設定
    // ========================================================================

    pub fn config(&self) -> BoardConfig {
        *self.config.lock()
    }

    pub fn set_pad(&self, pad: u8) {
        self.config.lock().pad = pad;
    }

    pub fn set_sad(&self, sad: Option<u8>) {
        self.config.lock().sad = sad;
    }

    pub fn usec_timeout(&self) -> u32 {
        self.config.lock().usec_timeout
    }

    pub fn set_usec_timeout(&self, usec: u32) {
        self.config.lock().usec_timeout = usec;
        debug!("gpib: timeout set to {} usec", usec);
    }

    pub fn set_t1_delay(&self, nano_sec: u32) {
        self.config.lock().t1_nano_sec = nano_sec;
    }

    pub fn set_ist(&self, ist: bool) {
        self.config.lock().ist = ist;
    }

    pub fn set_parallel_poll_configuration(&self, config: u8) {
        self.config.lock().parallel_poll_configuration = config;
    }

    pub fn resources(&self) -> BusResources {
        *self.resources.lock()
    }

    pub fn set_resources(&self, resources: BusResources) {
        *self.resources.lock() = resources;
    }

    /// ボード情報クエリ
    pub fn info(&self) -> BoardInfo {
        let config = self.config();
        BoardInfo {
            pad: config.pad,
            sad: config.sad,
            is_system_controller: self.is_master(),
            autopolling: self.autopolling(),
            ist: config.ist,
            parallel_poll_configuration: config.parallel_poll_configuration,
            t1_nano_sec: config.t1_nano_sec,
        }
    }

    // ========================================================================
    // I/Oタイマー / 待機
    // ========================================================================

    /// I/Oタイマーを開始する（usec == 0 は無期限）
    pub fn start_timer(&self, usec: u32) {
        self.status.clear(BoardStatus::TIMO);
        *self.deadline.lock() = if usec == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_micros(u64::from(usec)))
        };
    }

    /// I/Oタイマーを停止する
    pub fn stop_timer(&self) {
        *self.deadline.lock() = None;
    }

    /// タイムアウトが発生したか
    ///
    /// デッドライン超過を検出した時点でTIMOビットを立てる。
    pub fn io_timed_out(&self) -> bool {
        if self.status.test(BoardStatus::TIMO) {
            return true;
        }
        let expired = self
            .deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline);
        if expired {
            self.status.set(BoardStatus::TIMO);
        }
        expired
    }

    /// 条件成立・タイムアウト・キャンセルのいずれかまで休止する
    pub fn wait_io<F>(&self, cancel: &CancelToken, ready: F) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let deadline = *self.deadline.lock();
        let outcome = self.wait.wait_until(deadline, cancel, ready);
        if outcome == WaitOutcome::TimedOut {
            self.status.set(BoardStatus::TIMO);
        }
        outcome
    }

    /// タイマーを無視して条件待ちする（ibwait用に呼び出し側が
    /// 独自のデッドラインを渡す）
    pub fn wait_with_deadline<F>(
        &self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
        ready: F,
    ) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        self.wait.wait_until(deadline, cancel, ready)
    }

    /// 待機中の全操作を起こす（割り込み配線から呼ばれる）
    pub fn wake(&self) {
        self.wait.wake_all();
    }

    // ========================================================================
    // イベントキュー
    // ========================================================================

    /// プロトコルイベントを積む（割り込みパスから）
    pub fn push_event(&self, event: BusEvent) {
        // 満杯時は破棄される（pop側で一度だけ通知）
        let _ = self.events.push(event);
        self.wake();
    }

    /// プロトコルイベントを取り出す
    pub fn pop_event(&self) -> GpibResult<BusEvent> {
        self.events.pop()
    }

    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    /// イベントキューを空にする
    pub fn clear_events(&self) {
        self.events.clear();
    }

    // ========================================================================
    // セッションのオープン管理
    // ========================================================================

    /// セッションからのオープン
    pub fn open(&self, exclusive: bool) -> GpibResult<()> {
        let mut state = self.open_state.lock();
        if state.exclusive {
            return Err(GpibError::Busy);
        }
        if exclusive {
            if state.count > 0 {
                return Err(GpibError::Busy);
            }
            state.exclusive = true;
        }
        state.count += 1;
        Ok(())
    }

    /// セッションからのクローズ。残りのオープン数を返す。
    pub fn close(&self) -> u32 {
        let mut state = self.open_state.lock();
        if state.count == 0 {
            warn!("gpib: bug! board {} close without open", self.id.raw());
            return 0;
        }
        state.count -= 1;
        state.exclusive = false;
        state.count
    }

    /// 保持したままのセッション終了時の制御ミューテックス解放
    pub fn force_release_control(&self, session: SessionId) {
        if self.control.is_held_by(session) {
            let _ = self.control.release(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_expiry_sets_timo() {
        let board = Board::new(BoardId::from_raw(0));
        board.start_timer(1);
        std::thread::sleep(Duration::from_millis(2));
        assert!(board.io_timed_out());
        assert!(board.status().test(BoardStatus::TIMO));
    }

    #[test]
    fn test_timer_restart_clears_timo() {
        let board = Board::new(BoardId::from_raw(0));
        board.status().set(BoardStatus::TIMO);
        board.start_timer(1_000_000);
        assert!(!board.io_timed_out());
        board.stop_timer();
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let board = Board::new(BoardId::from_raw(0));
        board.start_timer(0);
        assert!(!board.io_timed_out());
    }

    #[test]
    fn test_exclusive_open() {
        let board = Board::new(BoardId::from_raw(1));
        board.open(false).unwrap();
        assert_eq!(board.open(true), Err(GpibError::Busy));
        board.close();
        board.open(true).unwrap();
        assert_eq!(board.open(false), Err(GpibError::Busy));
        board.close();
        board.open(false).unwrap();
        board.close();
    }

    #[test]
    fn test_interface_not_configured() {
        let board = Board::new(BoardId::from_raw(2));
        assert!(board.interface().is_err());
        assert!(!board.has_interface());
    }

    #[test]
    fn test_master_reflects_cic_bit() {
        let board = Board::new(BoardId::from_raw(3));
        board.set_master(true);
        assert!(board.status().test(BoardStatus::CIC));
        board.set_master(false);
        assert!(!board.status().test(BoardStatus::CIC));
    }
}
