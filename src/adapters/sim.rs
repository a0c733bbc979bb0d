//! # シミュレーションアダプタ
//!
//! 実ハードウェアなしでフルスタックを通すための、レジスタレベルの
//! バスシミュレータ。チップエンジンから見るとtms9914系チップと
//! 計測器群がぶら下がったバスに見える。
//!
//! - ATN下のコマンドバイトを解釈してアドレッシング状態を追跡する
//! - スクリプトされた受信データをRFDホールドオフ解除に応じて提示する
//! - シリアルポール中はアドレスされたデバイスのステータスバイトを返す
//! - デバイスのステータスバイトにRQSビットが立つとSRQを通知する

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use spin::Mutex;

use crate::adapters::{ChipBoard, IrqLine, spawn_irq_service};
use crate::board::Board;
use crate::bus::cmd;
use crate::chip::regs::{Bsr, Isr0, Isr1, aux, read_regs, write_regs};
use crate::regs::{RegisterIo, SharedRegisterIo};

/// 受信スクリプトの1バイト
#[derive(Debug, Clone, Copy)]
struct ScriptByte {
    value: u8,
    eoi: bool,
}

/// シミュレータ内部状態
#[derive(Default)]
struct SimState {
    // --- アドレッシング ---
    listeners: Vec<u8>,
    talker: Option<u8>,
    serial_poll_enabled: bool,

    // --- バスライン ---
    atn: bool,
    ifc: bool,
    ren: bool,

    // --- データ経路 ---
    rx_script: VecDeque<ScriptByte>,
    dir: u8,
    tx: Vec<(u8, bool)>,
    commands: Vec<u8>,
    eoi_next: bool,

    // --- ポール ---
    device_status: HashMap<u8, u8>,
    own_spr: u8,
    own_ppr: u8,
    /// バス側のパラレルポール応答
    pp_byte: u8,
    cptr: u8,

    // --- 保留割り込み ---
    pending0: u8,
    pending1: u8,
}

/// レジスタレベルのバスシミュレータ
pub struct SimAdapter {
    state: Mutex<SimState>,
    line: Arc<IrqLine>,
}

impl SimAdapter {
    pub fn new(line: Arc<IrqLine>) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            line,
        }
    }

    // ========================================================================
    // テストハーネス向け操作
    // ========================================================================

    /// 受信スクリプトへ1バイト追加する（eoi付きならそのバイトでEND）
    pub fn push_rx(&self, value: u8, eoi: bool) {
        self.state.lock().rx_script.push_back(ScriptByte { value, eoi });
    }

    /// コントローラが送出したデータバイト（EOIフラグ付き）
    pub fn tx_data(&self) -> Vec<(u8, bool)> {
        self.state.lock().tx.clone()
    }

    /// ATN下で受理したコマンドバイト列
    pub fn commands(&self) -> Vec<u8> {
        self.state.lock().commands.clone()
    }

    /// デバイスのシリアルポールステータスを設定する
    ///
    /// RQSビット (0x40) が立っていればSRQ割り込みを通知する。
    pub fn set_device_status(&self, pad: u8, status: u8) {
        let raise = {
            let mut state = self.state.lock();
            state.device_status.insert(pad, status);
            if status & 0x40 != 0 {
                state.pending1 |= Isr1::SRQ.bits();
                true
            } else {
                false
            }
        };
        if raise {
            self.line.raise();
        }
    }

    /// 誰も引き取らないSRQを通知する（スタックSRQの再現用）
    pub fn pulse_srq(&self) {
        self.state.lock().pending1 |= Isr1::SRQ.bits();
        self.line.raise();
    }

    /// デバイスクリアの受信を再現する
    pub fn pulse_device_clear(&self) {
        self.state.lock().pending1 |= Isr1::DCAS.bits();
        self.line.raise();
    }

    /// グループ実行トリガの受信を再現する
    pub fn pulse_trigger(&self) {
        self.state.lock().pending1 |= Isr1::GET.bits();
        self.line.raise();
    }

    /// バス側のパラレルポール応答バイトを設定する
    pub fn set_parallel_poll_byte(&self, byte: u8) {
        self.state.lock().pp_byte = byte;
    }

    /// 自ボードに設定されたパラレルポール応答
    pub fn own_parallel_poll_config(&self) -> u8 {
        self.state.lock().own_ppr
    }

    /// 現在アドレスされているリスナー
    pub fn listeners(&self) -> Vec<u8> {
        self.state.lock().listeners.clone()
    }

    /// 現在アドレスされているトーカー
    pub fn talker(&self) -> Option<u8> {
        self.state.lock().talker
    }

    pub fn ifc_asserted(&self) -> bool {
        self.state.lock().ifc
    }

    pub fn ren_asserted(&self) -> bool {
        self.state.lock().ren
    }

    // ========================================================================
    // バス動作
    // ========================================================================

    /// RFDホールドオフ解除に応じて次の受信バイトを提示する
    ///
    /// 提示はRHDFごとに1バイトだけ。ホールドオフ解除が来るまで
    /// 次バイトはバスに現れない。
    fn present_next(state: &mut SimState) -> bool {
        if state.atn {
            return false;
        }
        if state.serial_poll_enabled {
            // シリアルポール中: トーカーのステータスバイトを1回提示し、
            // RQSをサービス済みとして落とす
            let Some(pad) = state.talker else {
                return false;
            };
            let status = state.device_status.get(&pad).copied().unwrap_or(0);
            state.device_status.insert(pad, status & !0x40);
            state.dir = status;
            state.pending0 |= Isr0::BI.bits();
            return true;
        }
        let Some(byte) = state.rx_script.pop_front() else {
            return false;
        };
        state.dir = byte.value;
        state.pending0 |= Isr0::BI.bits();
        if byte.eoi {
            state.pending0 |= Isr0::END.bits();
        }
        true
    }

    /// AUXCRへの補助コマンド書き込みを解釈する
    fn aux_command(&self, value: u8) {
        let set = value & aux::CS != 0;
        let command = value & !aux::CS;
        let raise = {
            let mut state = self.state.lock();
            match command {
                aux::CHIP_RESET => {
                    if !set {
                        // リセット完了。送信レジスタは空になる。
                        *state = SimState::default();
                        state.pending0 |= Isr0::BO.bits();
                        true
                    } else {
                        false
                    }
                }
                aux::RHDF => Self::present_next(&mut state),
                aux::SEOI => {
                    state.eoi_next = true;
                    false
                }
                aux::TCA | aux::TCS => {
                    state.atn = true;
                    false
                }
                aux::GTS => {
                    state.atn = false;
                    false
                }
                aux::SIC => {
                    state.ifc = set;
                    if set {
                        // IFCで全アドレッシングが解かれる
                        state.listeners.clear();
                        state.talker = None;
                        state.serial_poll_enabled = false;
                    }
                    false
                }
                aux::SRE => {
                    state.ren = set;
                    false
                }
                aux::RPP => {
                    if set {
                        state.cptr = state.pp_byte;
                    }
                    false
                }
                _ => false,
            }
        };
        if raise {
            self.line.raise();
        }
    }

    /// ATN下のコマンドバイトを解釈する
    fn interpret_command(state: &mut SimState, byte: u8) {
        match byte {
            cmd::SPE => state.serial_poll_enabled = true,
            cmd::SPD => state.serial_poll_enabled = false,
            cmd::UNL => state.listeners.clear(),
            cmd::UNT => state.talker = None,
            0x20..=0x3e => state.listeners.push(byte & 0x1f),
            0x40..=0x5e => state.talker = Some(byte & 0x1f),
            // セカンダリアドレスとその他の指令は記録のみ
            _ => {}
        }
    }

    /// CDORへのバイト出力を処理する
    fn data_out(&self, byte: u8) {
        {
            let mut state = self.state.lock();
            if state.atn {
                state.commands.push(byte);
                Self::interpret_command(&mut state, byte);
            } else {
                let eoi = state.eoi_next;
                state.eoi_next = false;
                state.tx.push((byte, eoi));
            }
            // バイト受理で送信レジスタが再び空く
            state.pending0 |= Isr0::BO.bits();
        }
        self.line.raise();
    }

}

impl RegisterIo for SimAdapter {
    fn read(&self, offset: usize) -> u8 {
        match offset {
            read_regs::ISR0 => {
                let mut state = self.state.lock();
                core::mem::take(&mut state.pending0)
            }
            read_regs::ISR1 => {
                let mut state = self.state.lock();
                core::mem::take(&mut state.pending1)
            }
            read_regs::ADSR => {
                let state = self.state.lock();
                let mut bits = 0;
                if state.atn {
                    bits |= 0x20;
                }
                if state.ren {
                    bits |= 0x80;
                }
                bits
            }
            read_regs::BSR => {
                let state = self.state.lock();
                let mut bsr = Bsr::empty();
                if state.atn {
                    bsr |= Bsr::ATN;
                }
                if state.ifc {
                    bsr |= Bsr::IFC;
                }
                if state.ren {
                    bsr |= Bsr::REN;
                }
                // SRQライン: いずれかのデバイスがRQSを立てている間アサート
                if state.device_status.values().any(|&s| s & 0x40 != 0) {
                    bsr |= Bsr::SRQ;
                }
                bsr.bits()
            }
            read_regs::CPTR => self.state.lock().cptr,
            read_regs::DIR => self.state.lock().dir,
            // SPMRの読み戻し
            5 => self.state.lock().own_spr,
            _ => 0,
        }
    }

    fn write(&self, value: u8, offset: usize) {
        match offset {
            write_regs::AUXCR => self.aux_command(value),
            write_regs::CDOR => self.data_out(value),
            write_regs::SPMR => self.state.lock().own_spr = value,
            write_regs::PPR => self.state.lock().own_ppr = value,
            // IMR / ADR は記録不要
            _ => {}
        }
    }
}

// ============================================================================
// テストフィクスチャ
// ============================================================================

/// ボードへシミュレータ一式（アダプタ + 割り込みサービススレッド）を
/// 配線するフィクスチャ。ドロップでサービススレッドを停止する。
pub struct SimFixture {
    pub board: Arc<Board>,
    pub sim: Arc<SimAdapter>,
    pub line: Arc<IrqLine>,
    service: Option<std::thread::JoinHandle<()>>,
}

impl SimFixture {
    pub fn new(board: Arc<Board>) -> Self {
        let line = Arc::new(IrqLine::new());
        let sim = Arc::new(SimAdapter::new(Arc::clone(&line)));
        let io: SharedRegisterIo = Arc::clone(&sim) as SharedRegisterIo;
        let adapter = Arc::new(ChipBoard::new("sim", io));
        board.assign_interface(Arc::clone(&adapter) as Arc<dyn crate::board::BoardInterface>);
        let service = spawn_irq_service(Arc::clone(&line), adapter, Arc::clone(&board));
        Self {
            board,
            sim,
            line,
            service: Some(service),
        }
    }
}

impl Drop for SimFixture {
    fn drop(&mut self) {
        self.line.close();
        if let Some(service) = self.service.take() {
            let _ = service.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_interpretation() {
        let mut state = SimState::default();
        SimAdapter::interpret_command(&mut state, cmd::mla(5));
        SimAdapter::interpret_command(&mut state, cmd::mta(9));
        assert_eq!(state.listeners, vec![5]);
        assert_eq!(state.talker, Some(9));
        SimAdapter::interpret_command(&mut state, cmd::UNL);
        SimAdapter::interpret_command(&mut state, cmd::UNT);
        assert!(state.listeners.is_empty());
        assert_eq!(state.talker, None);
    }

    #[test]
    fn test_serial_poll_presents_status_and_clears_rqs() {
        let mut state = SimState::default();
        state.device_status.insert(3, 0x41);
        state.talker = Some(3);
        state.serial_poll_enabled = true;
        assert!(SimAdapter::present_next(&mut state));
        assert_eq!(state.dir, 0x41);
        assert_eq!(state.device_status.get(&3).copied(), Some(0x01));
    }

    #[test]
    fn test_present_nothing_when_script_empty() {
        let mut state = SimState::default();
        assert!(!SimAdapter::present_next(&mut state));
    }
}
