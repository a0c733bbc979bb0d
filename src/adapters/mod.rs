//! # アダプタ層
//!
//! ChipBoard - チップエンジンをボードインターフェースへ接続する
//! 汎用グルー。レジスタアクセス手段（RegisterIo実装）だけが
//! アダプタファミリごとに異なる。
//!
//! IrqLine - 割り込み配線。アダプタ側が `raise()` で通知し、専用の
//! サービススレッドがエンジンの割り込みハンドラを駆動する。

pub mod sim;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::board::{Board, BoardInterface};
use crate::chip::ChipEngine;
use crate::chip::regs::{Isr0, Isr1, write_regs};
use crate::error::{GpibResult, TransferResult};
use crate::regs::SharedRegisterIo;
use crate::status::BoardStatus;
use crate::wait::{CancelToken, WaitQueue};

/// チップエンジン搭載ボードの汎用グルー
pub struct ChipBoard {
    name: String,
    engine: ChipEngine,
    io: SharedRegisterIo,
}

impl ChipBoard {
    pub fn new(name: impl Into<String>, io: SharedRegisterIo) -> Self {
        Self {
            name: name.into(),
            engine: ChipEngine::new(io.clone()),
            io,
        }
    }

    #[inline]
    pub fn engine(&self) -> &ChipEngine {
        &self.engine
    }
}

impl BoardInterface for ChipBoard {
    fn name(&self) -> &str {
        &self.name
    }

    /// チップをリセットし、アドレスとポール応答を設定して割り込みを
    /// 有効化する
    fn attach(&self, board: &Board) -> GpibResult<()> {
        self.engine.reset();
        let config = board.config();
        self.engine.primary_address(config.pad);
        if let Some(sad) = config.sad {
            self.engine.secondary_address(sad, true);
        }
        self.engine.parallel_poll_configure(config.parallel_poll_configuration);
        self.engine.serial_poll_response(0);
        self.io.write(
            (Isr0::BI | Isr0::BO | Isr0::END).bits(),
            write_regs::IMR0,
        );
        self.io.write(
            (Isr1::IFC | Isr1::SRQ | Isr1::DCAS | Isr1::ERR | Isr1::GET).bits(),
            write_regs::IMR1,
        );
        debug!("gpib: {} attached", self.name);
        Ok(())
    }

    fn detach(&self, _board: &Board) {
        self.io.write(0, write_regs::IMR0);
        self.io.write(0, write_regs::IMR1);
        self.engine.reset();
        debug!("gpib: {} detached", self.name);
    }

    fn read(&self, board: &Board, cancel: &CancelToken, buffer: &mut [u8]) -> TransferResult {
        self.engine.read(board, cancel, buffer)
    }

    fn write(
        &self,
        board: &Board,
        cancel: &CancelToken,
        buffer: &[u8],
        send_eoi: bool,
    ) -> TransferResult {
        self.engine.write(board, cancel, buffer, send_eoi)
    }

    fn command(&self, board: &Board, cancel: &CancelToken, buffer: &[u8]) -> TransferResult {
        self.engine.command(board, cancel, buffer)
    }

    fn take_control(&self, synchronous: bool) -> GpibResult<()> {
        self.engine.take_control(synchronous)
    }

    fn go_to_standby(&self) -> GpibResult<()> {
        self.engine.go_to_standby()
    }

    fn interface_clear(&self, assert: bool) {
        self.engine.interface_clear(assert);
    }

    fn remote_enable(&self, enable: bool) {
        self.engine.remote_enable(enable);
    }

    fn request_system_control(&self, request: bool) {
        self.engine.request_system_control(request);
    }

    fn enable_eos(&self, byte: u8, compare_8_bits: bool) {
        self.engine.enable_eos(byte, compare_8_bits);
    }

    fn disable_eos(&self) {
        self.engine.disable_eos();
    }

    fn parallel_poll(&self) -> GpibResult<u8> {
        self.engine.parallel_poll()
    }

    fn parallel_poll_configure(&self, config: u8) {
        self.engine.parallel_poll_configure(config);
    }

    fn serial_poll_response(&self, status: u8) {
        self.engine.serial_poll_response(status);
    }

    fn serial_poll_status(&self) -> u8 {
        self.engine.serial_poll_status()
    }

    fn update_status(&self, board: &Board) -> BoardStatus {
        self.engine.update_status(board)
    }

    fn primary_address(&self, address: u8) {
        self.engine.primary_address(address);
    }

    fn secondary_address(&self, address: u8, enable: bool) {
        self.engine.secondary_address(address, enable);
    }

    fn return_to_local(&self) {
        self.engine.return_to_local();
    }

    fn t1_delay(&self, nano_sec: u32) -> u32 {
        self.engine.set_t1_delay(nano_sec)
    }

    fn line_status(&self) -> GpibResult<u16> {
        Ok(self.engine.line_status())
    }
}

// ============================================================================
// 割り込み配線
// ============================================================================

/// 割り込みライン
///
/// アダプタから `raise()` で通知され、サービススレッドがエンジンの
/// 割り込みハンドラを呼び出す。`close()` でサービスループを終了する。
pub struct IrqLine {
    raised: AtomicBool,
    closed: AtomicBool,
    wait: WaitQueue,
}

impl IrqLine {
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wait: WaitQueue::new(),
        }
    }

    /// 割り込み通知（アダプタ側から呼ばれる）
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.wait.wake_all();
    }

    /// サービスループの終了指示
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wait.wake_all();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 次の通知を待つ。クローズされたらfalseを返す。
    fn wait_raised(&self, cancel: &CancelToken) -> bool {
        let _ = self.wait.wait_until(None, cancel, || {
            self.is_closed() || self.raised.swap(false, Ordering::AcqRel)
        });
        !self.is_closed()
    }
}

impl Default for IrqLine {
    fn default() -> Self {
        Self::new()
    }
}

/// 割り込みサービスループ
///
/// 専用スレッドで実行する。通知のたびにエンジンの割り込みハンドラを
/// 駆動し、ラインのクローズで戻る。
pub fn run_irq_service(line: &IrqLine, adapter: &ChipBoard, board: &Board) {
    let cancel = CancelToken::new();
    while line.wait_raised(&cancel) {
        adapter.engine().interrupt(board);
    }
    debug!("gpib: irq service for {} stopped", adapter.name());
}

/// 割り込みサービススレッドの起動
pub fn spawn_irq_service(
    line: Arc<IrqLine>,
    adapter: Arc<ChipBoard>,
    board: Arc<Board>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || run_irq_service(&line, &adapter, &board))
}
