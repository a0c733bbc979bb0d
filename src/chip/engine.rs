//! # チップ・プロトコルエンジン
//!
//! ChipEngine - バイト転送 / コマンド送出 / ホールドオフ管理 / EOS検出
//!
//! tms9914系コントローラチップに対する汎用ステートマシン。複数の
//! アダプタファミリから再利用される。転送フェーズフラグは割り込み
//! パスから設定されるため AtomicU32 で持ち、フラグクリアと
//! データレジスタ読み出しだけを短い spin クリティカルセクションで
//! 束ねる。長期保持するボード制御ミューテックスとは無関係。

use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, warn};
use spin::Mutex;

use crate::board::Board;
use crate::chip::regs::{Adsr, Bsr, EosFlags, Isr0, Isr1, aux, read_regs, write_regs};
use crate::error::{GpibError, GpibResult, Transfer, TransferError, TransferResult};
use crate::events::BusEvent;
use crate::regs::SharedRegisterIo;
use crate::status::{BoardStatus, BusLines};
use crate::wait::{CancelToken, WaitOutcome};

bitflags! {
    /// 転送フェーズフラグ（割り込みコンテキストから設定される）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferState: u32 {
        /// 受信バイト有効（DIRを読める）
        const READ_READY    = 1 << 0;
        /// 送信レジスタ空（CDORへ書ける）
        const WRITE_READY   = 1 << 1;
        /// コマンドバイト送出可
        const COMMAND_READY = 1 << 2;
        /// END (EOI) またはEOS一致を検出
        const RECEIVED_END  = 1 << 3;
        /// デバイスクリア受信
        const DEV_CLEAR     = 1 << 4;
        /// バスハンドシェイクエラー
        const BUS_ERROR     = 1 << 5;
    }
}

/// ホールドオフモード
///
/// チップが次バイトの受信を自動で要求してよいか、明示的な解除を
/// 待つべきかを制御する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldoffMode {
    /// ホールドオフなし
    None,
    /// EOI受信時のみホールドオフ
    HoldoffEoi,
    /// 全バイトでホールドオフ
    HoldoffAll,
}

/// EOS検出設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct EosConfig {
    byte: u8,
    flags: EosFlags,
}

/// 同期テイクコントロールのACK待ちポーリング上限
const TAKE_CONTROL_POLLS: usize = 100;

/// チップ・プロトコルエンジン本体
pub struct ChipEngine {
    io: SharedRegisterIo,
    /// 転送フェーズフラグ
    state: AtomicU32,
    /// フラグクリア + レジスタアクセスの短いクリティカルセクション
    lock: Mutex<()>,
    /// EOS検出設定（ボードミューテックス保持下で変更される）
    eos: Mutex<EosConfig>,
    /// 現在のホールドオフモード
    holdoff: Mutex<HoldoffMode>,
}

impl ChipEngine {
    pub fn new(io: SharedRegisterIo) -> Self {
        Self {
            io,
            state: AtomicU32::new(0),
            lock: Mutex::new(()),
            eos: Mutex::new(EosConfig::default()),
            holdoff: Mutex::new(HoldoffMode::None),
        }
    }

    // ========================================================================
    // 転送フェーズフラグ操作
    // ========================================================================

    #[inline]
    fn set_state(&self, bits: TransferState) {
        self.state.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    #[inline]
    fn clear_state(&self, bits: TransferState) {
        self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn test_state(&self, bits: TransferState) -> bool {
        TransferState::from_bits_truncate(self.state.load(Ordering::Acquire)).intersects(bits)
    }

    #[inline]
    fn test_and_clear_state(&self, bits: TransferState) -> bool {
        let prev = self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
        TransferState::from_bits_truncate(prev).intersects(bits)
    }

    // ========================================================================
    // リセット / アドレス / EOS設定
    // ========================================================================

    /// チップをリセットして既知状態へ戻す
    pub fn reset(&self) {
        self.io.write(aux::CS | aux::CHIP_RESET, write_regs::AUXCR);
        self.state.store(0, Ordering::Release);
        *self.eos.lock() = EosConfig::default();
        self.set_holdoff_mode(HoldoffMode::None);
        self.io.write(aux::CHIP_RESET, write_regs::AUXCR);
    }

    /// プライマリアドレス設定
    pub fn primary_address(&self, address: u8) {
        self.io.write(address & 0x1f, write_regs::ADR);
    }

    /// セカンダリアドレス設定
    ///
    /// このチップファミリはセカンダリアドレスをハードウェアで照合
    /// しない（APTパススルーでソフトウェア処理）。設定値の記録のみ。
    pub fn secondary_address(&self, address: u8, enable: bool) {
        debug!(
            "gpib: secondary address {} {}",
            address,
            if enable { "enabled" } else { "disabled" }
        );
    }

    /// EOS検出を有効化
    pub fn enable_eos(&self, byte: u8, compare_8_bits: bool) {
        let mut eos = self.eos.lock();
        eos.byte = byte;
        eos.flags = EosFlags::REOS;
        if compare_8_bits {
            eos.flags |= EosFlags::BIN;
        }
    }

    /// EOS検出を無効化
    pub fn disable_eos(&self) {
        self.eos.lock().flags.remove(EosFlags::REOS);
    }

    // ========================================================================
    // ホールドオフ管理
    // ========================================================================

    /// ホールドオフモードを切り替える
    pub fn set_holdoff_mode(&self, mode: HoldoffMode) {
        let mut holdoff = self.holdoff.lock();
        if *holdoff == mode {
            return;
        }
        match mode {
            HoldoffMode::HoldoffAll => {
                self.io.write(aux::CS | aux::HLDA, write_regs::AUXCR);
                self.io.write(aux::HLDE, write_regs::AUXCR);
            }
            HoldoffMode::HoldoffEoi => {
                self.io.write(aux::HLDA, write_regs::AUXCR);
                self.io.write(aux::CS | aux::HLDE, write_regs::AUXCR);
            }
            HoldoffMode::None => {
                self.io.write(aux::HLDA, write_regs::AUXCR);
                self.io.write(aux::HLDE, write_regs::AUXCR);
            }
        }
        *holdoff = mode;
    }

    /// RFDホールドオフを解除して次バイトの受信を許可する
    pub fn release_holdoff(&self) {
        self.io.write(aux::RHDF, write_regs::AUXCR);
    }

    /// 受信バイトをEOS設定と比較し、一致すればENDフラグを立てる
    fn check_for_eos(&self, byte: u8) {
        let eos = *self.eos.lock();
        if !eos.flags.contains(EosFlags::REOS) {
            return;
        }
        let matched = if eos.flags.contains(EosFlags::BIN) {
            eos.byte == byte
        } else {
            (eos.byte & 0x7f) == (byte & 0x7f)
        };
        if matched {
            self.set_state(TransferState::RECEIVED_END);
        }
    }

    // ========================================================================
    // バイト転送ステートマシン
    // ========================================================================

    /// 転送待機の共通部: READY / タイムアウト / デバイスクリア / キャンセル
    fn wait_transfer(
        &self,
        board: &Board,
        cancel: &CancelToken,
        ready: TransferState,
        count: usize,
    ) -> Result<(), TransferError> {
        let outcome = board.wait_io(cancel, || {
            self.test_state(ready | TransferState::DEV_CLEAR) || board.io_timed_out()
        });
        match outcome {
            WaitOutcome::Cancelled => {
                warn!("gpib: pio wait interrupted");
                return Err(TransferError::new(GpibError::Interrupted, count));
            }
            WaitOutcome::TimedOut => {
                return Err(TransferError::new(GpibError::Timeout, count));
            }
            WaitOutcome::Ready => {}
        }
        // タイムアウトは部分的な成功より優先
        if board.io_timed_out() {
            return Err(TransferError::new(GpibError::Timeout, count));
        }
        if self.test_state(TransferState::DEV_CLEAR) {
            return Err(TransferError::new(GpibError::DeviceClear, count));
        }
        Ok(())
    }

    /// PIO読み取り
    ///
    /// バイト受信可能になるまで呼び出し側を休止させながら、1バイト
    /// ずつコピーする。ENDフラグ（EOI受信またはEOS一致）でそのバイト
    /// を含めて早期終了する。ホールドオフ解除は各イテレーション先頭で
    /// 行う - 直前バイトのEND判定が済むまで次バイトはバスに現れない
    /// ので、ENDが常に実際に読んだバイトへ帰着する。最終バイトの手前
    /// では必ず全バイトホールドオフへ切り替え、要求長を超えたバイトを
    /// 取りこぼさない。
    pub fn read(&self, board: &Board, cancel: &CancelToken, buffer: &mut [u8]) -> TransferResult {
        let length = buffer.len();
        if length == 0 {
            return Ok(Transfer {
                bytes: 0,
                end: false,
            });
        }

        // 新しい転送はデバイスクリアの残骸を引き継がない
        self.clear_state(TransferState::DEV_CLEAR);

        // REOS有効時は全バイトホールドオフ、無効時はEOIホールドオフのみ
        if self.eos.lock().flags.contains(EosFlags::REOS) {
            self.set_holdoff_mode(HoldoffMode::HoldoffAll);
        } else {
            self.set_holdoff_mode(HoldoffMode::HoldoffEoi);
        }

        let mut count = 0;
        let mut end = false;
        while count < length && !end {
            if count == length - 1 {
                // 最終バイト前に必ず全ホールドオフ
                self.set_holdoff_mode(HoldoffMode::HoldoffAll);
            }
            self.release_holdoff();

            self.wait_transfer(board, cancel, TransferState::READ_READY, count)?;

            let byte;
            {
                let _guard = self.lock.lock();
                self.clear_state(TransferState::READ_READY);
                byte = self.io.read(read_regs::DIR);
            }
            buffer[count] = byte;
            count += 1;

            self.check_for_eos(byte);
            end = self.test_and_clear_state(TransferState::RECEIVED_END);
        }

        Ok(Transfer { bytes: count, end })
    }

    /// 送出1バイト分の共通部
    fn put_byte(&self, byte: u8, assert_eoi: bool, ready: TransferState) {
        let _guard = self.lock.lock();
        self.clear_state(ready);
        if assert_eoi {
            self.io.write(aux::SEOI, write_regs::AUXCR);
        }
        self.io.write(byte, write_regs::CDOR);
    }

    /// PIO書き込み
    ///
    /// 要求があれば最終バイトでのみEND (EOI) をアサートする。
    pub fn write(
        &self,
        board: &Board,
        cancel: &CancelToken,
        buffer: &[u8],
        send_eoi: bool,
    ) -> TransferResult {
        if buffer.is_empty() {
            return Ok(Transfer {
                bytes: 0,
                end: false,
            });
        }

        self.clear_state(TransferState::DEV_CLEAR);

        let mut count = 0;
        let last = buffer.len() - 1;
        for (i, &byte) in buffer.iter().enumerate() {
            self.wait_transfer(board, cancel, TransferState::WRITE_READY, count)?;
            if self.test_and_clear_state(TransferState::BUS_ERROR) {
                warn!("gpib: bus error during write");
                return Err(TransferError::new(GpibError::Timeout, count));
            }
            self.put_byte(byte, send_eoi && i == last, TransferState::WRITE_READY);
            count += 1;
        }
        // 最終バイトが実際に送出されるまで待つ
        self.wait_transfer(board, cancel, TransferState::WRITE_READY, count)?;

        Ok(Transfer {
            bytes: count,
            end: send_eoi,
        })
    }

    /// コマンドバイト列の送出
    ///
    /// ATNアサート下で同じバイト出力プリミティブを使う。トーカー /
    /// リスナーのアドレッシングはこの経路で行う。
    pub fn command(&self, board: &Board, cancel: &CancelToken, buffer: &[u8]) -> TransferResult {
        self.clear_state(TransferState::DEV_CLEAR);

        let mut count = 0;
        for &byte in buffer {
            self.wait_transfer(board, cancel, TransferState::COMMAND_READY, count)?;
            self.put_byte(byte, false, TransferState::COMMAND_READY);
            count += 1;
        }
        self.wait_transfer(board, cancel, TransferState::COMMAND_READY, count)?;

        Ok(Transfer {
            bytes: count,
            end: false,
        })
    }

    // ========================================================================
    // コントローラロール遷移 / バス管理ライン
    // ========================================================================

    /// アクティブコントローラ状態へ遷移（ATNアサート）
    ///
    /// 同期版はチップのACK（ADSRのATNビット）を待つ。
    pub fn take_control(&self, synchronous: bool) -> GpibResult<()> {
        if synchronous {
            self.io.write(aux::TCS, write_regs::AUXCR);
        } else {
            self.io.write(aux::TCA, write_regs::AUXCR);
        }
        if !synchronous {
            return Ok(());
        }
        for _ in 0..TAKE_CONTROL_POLLS {
            if self.adsr().contains(Adsr::ATN) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_micros(10));
        }
        warn!("gpib: take control acknowledgment timed out");
        Err(GpibError::Timeout)
    }

    /// スタンバイへ移行（ATN解除）
    pub fn go_to_standby(&self) -> GpibResult<()> {
        self.io.write(aux::GTS, write_regs::AUXCR);
        for _ in 0..TAKE_CONTROL_POLLS {
            if !self.adsr().contains(Adsr::ATN) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_micros(10));
        }
        warn!("gpib: go to standby acknowledgment timed out");
        Err(GpibError::Timeout)
    }

    /// IFCラインのアサート / 解除
    pub fn interface_clear(&self, assert: bool) {
        if assert {
            self.io.write(aux::CS | aux::SIC, write_regs::AUXCR);
        } else {
            self.io.write(aux::SIC, write_regs::AUXCR);
        }
    }

    /// RENラインのアサート / 解除
    pub fn remote_enable(&self, enable: bool) {
        if enable {
            self.io.write(aux::CS | aux::SRE, write_regs::AUXCR);
        } else {
            self.io.write(aux::SRE, write_regs::AUXCR);
        }
    }

    /// システムコントローラ権の要求 / 解放
    pub fn request_system_control(&self, request: bool) {
        if request {
            self.io.write(aux::RQC, write_regs::AUXCR);
        } else {
            self.io.write(aux::RLC, write_regs::AUXCR);
        }
    }

    /// ローカル状態へ復帰
    pub fn return_to_local(&self) {
        self.io.write(aux::RTL, write_regs::AUXCR);
    }

    /// バス管理ラインのサンプリング
    ///
    /// BSRを読んで有効フラグ付きのラインマスクへ変換する。この
    /// チップファミリは全8ラインを観測できる。
    pub fn line_status(&self) -> u16 {
        let bsr = Bsr::from_bits_truncate(self.io.read(read_regs::BSR));
        let mut lines = BusLines::VALID_DAV
            | BusLines::VALID_NDAC
            | BusLines::VALID_NRFD
            | BusLines::VALID_IFC
            | BusLines::VALID_REN
            | BusLines::VALID_SRQ
            | BusLines::VALID_ATN
            | BusLines::VALID_EOI;
        if bsr.contains(Bsr::DAV) {
            lines |= BusLines::BUS_DAV;
        }
        if bsr.contains(Bsr::NDAC) {
            lines |= BusLines::BUS_NDAC;
        }
        if bsr.contains(Bsr::NRFD) {
            lines |= BusLines::BUS_NRFD;
        }
        if bsr.contains(Bsr::IFC) {
            lines |= BusLines::BUS_IFC;
        }
        if bsr.contains(Bsr::REN) {
            lines |= BusLines::BUS_REN;
        }
        if bsr.contains(Bsr::SRQ) {
            lines |= BusLines::BUS_SRQ;
        }
        if bsr.contains(Bsr::ATN) {
            lines |= BusLines::BUS_ATN;
        }
        if bsr.contains(Bsr::EOI) {
            lines |= BusLines::BUS_EOI;
        }
        lines.bits()
    }

    /// T1ディレイの設定。実際に適用された値（ナノ秒）を返す
    ///
    /// このチップファミリは 2000 / 1100 / 500 ns の3段階。
    pub fn set_t1_delay(&self, nano_sec: u32) -> u32 {
        if nano_sec >= 2000 {
            self.io.write(aux::STDL, write_regs::AUXCR);
            self.io.write(aux::VSTDL, write_regs::AUXCR);
            2000
        } else if nano_sec >= 1100 {
            self.io.write(aux::CS | aux::STDL, write_regs::AUXCR);
            self.io.write(aux::VSTDL, write_regs::AUXCR);
            1100
        } else {
            self.io.write(aux::CS | aux::VSTDL, write_regs::AUXCR);
            500
        }
    }

    // ========================================================================
    // ポールプリミティブ
    // ========================================================================

    /// パラレルポールを実行し応答バイトを返す
    pub fn parallel_poll(&self) -> GpibResult<u8> {
        self.io.write(aux::CS | aux::RPP, write_regs::AUXCR);
        // 応答確定までの整定時間
        std::thread::sleep(Duration::from_micros(2));
        let result = self.io.read(read_regs::CPTR);
        self.io.write(aux::RPP, write_regs::AUXCR);
        Ok(result)
    }

    /// パラレルポール応答の設定
    pub fn parallel_poll_configure(&self, config: u8) {
        self.io.write(config, write_regs::PPR);
    }

    /// 自ボードのシリアルポール応答バイトを設定
    pub fn serial_poll_response(&self, status: u8) {
        self.io.write(status, write_regs::SPMR);
    }

    /// 自ボードのシリアルポール応答バイトを読み出す
    pub fn serial_poll_status(&self) -> u8 {
        self.io.read(write_regs::SPMR)
    }

    // ========================================================================
    // ステータス / 割り込み
    // ========================================================================

    #[inline]
    fn adsr(&self) -> Adsr {
        Adsr::from_bits_truncate(self.io.read(read_regs::ADSR))
    }

    /// チップステータスレジスタをサンプリングしてボードステータス
    /// ビットマスクへ反映する
    pub fn update_status(&self, board: &Board) -> BoardStatus {
        let adsr = self.adsr();
        let mut bits = BoardStatus::empty();
        if adsr.contains(Adsr::ATN) {
            bits |= BoardStatus::ATN;
        }
        if adsr.contains(Adsr::TADS) {
            bits |= BoardStatus::TACS;
        }
        if adsr.contains(Adsr::LADS) {
            bits |= BoardStatus::LACS;
        }
        if adsr.contains(Adsr::REM) {
            bits |= BoardStatus::REM;
        }
        if adsr.contains(Adsr::LLO) {
            bits |= BoardStatus::LOK;
        }
        let keep = BoardStatus::TIMO
            | BoardStatus::END
            | BoardStatus::SRQI
            | BoardStatus::DCAS
            | BoardStatus::DTAS
            | BoardStatus::CIC
            | BoardStatus::CMPL
            | BoardStatus::ERR;
        board.status().replace(keep, bits);
        board.status().load()
    }

    /// デバイスクリアフラグの消費（転送再開前に呼ぶ）
    pub fn clear_device_clear(&self) {
        self.clear_state(TransferState::DEV_CLEAR);
    }

    /// 割り込みサービス
    ///
    /// アダプタの割り込み配線から呼ばれる。ISRレジスタの読み出しで
    /// ハードウェア側の保留ビットはクリアされる。
    pub fn interrupt(&self, board: &Board) {
        let isr0 = Isr0::from_bits_truncate(self.io.read(read_regs::ISR0));
        let isr1 = Isr1::from_bits_truncate(self.io.read(read_regs::ISR1));

        #[cfg(feature = "verbose_logging")]
        log::trace!("gpib: isr0={:?} isr1={:?}", isr0, isr1);

        // END / ERR はREADYより先。READYで進む転送ループが同一
        // 割り込みの終端条件を必ず観測できる。
        if isr0.contains(Isr0::END) {
            self.set_state(TransferState::RECEIVED_END);
        }
        if isr1.contains(Isr1::ERR) {
            self.set_state(TransferState::BUS_ERROR);
        }
        if isr0.contains(Isr0::BI) {
            self.set_state(TransferState::READ_READY);
        }
        if isr0.contains(Isr0::BO) {
            self.set_state(TransferState::WRITE_READY | TransferState::COMMAND_READY);
        }
        if isr1.contains(Isr1::DCAS) {
            self.set_state(TransferState::DEV_CLEAR);
            board.status().set(BoardStatus::DCAS);
            board.push_event(BusEvent::DeviceClear);
        }
        if isr1.contains(Isr1::GET) {
            board.status().set(BoardStatus::DTAS);
            board.push_event(BusEvent::DeviceTrigger);
        }
        if isr1.contains(Isr1::SRQ) {
            board.status().set(BoardStatus::SRQI);
            board.push_event(BusEvent::ServiceRequest);
        }
        if isr1.contains(Isr1::IFC) {
            debug!("gpib: interface clear received");
        }

        board.wake();
    }
}
