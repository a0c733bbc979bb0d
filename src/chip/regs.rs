//! # 汎用コントローラチップのレジスタ定義
//!
//! レジスタオフセット / 補助コマンド / 割り込みステータスビット
//!
//! tms9914系コントローラチップのレジスタモデル。読み出しと書き込みで
//! 同一オフセットが別レジスタになる点に注意（例: 7 は DIR/CDOR）。

use bitflags::bitflags;

/// 読み出しレジスタオフセット
pub mod read_regs {
    /// 割り込みステータス0
    pub const ISR0: usize = 0;
    /// 割り込みステータス1
    pub const ISR1: usize = 1;
    /// アドレスステータス
    pub const ADSR: usize = 2;
    /// バスステータス
    pub const BSR: usize = 3;
    /// コマンドパススルー（パラレルポール結果もここから読む）
    pub const CPTR: usize = 6;
    /// データ入力
    pub const DIR: usize = 7;
}

/// 書き込みレジスタオフセット
pub mod write_regs {
    /// 割り込みマスク0
    pub const IMR0: usize = 0;
    /// 割り込みマスク1
    pub const IMR1: usize = 1;
    /// 補助コマンド
    pub const AUXCR: usize = 3;
    /// プライマリアドレス
    pub const ADR: usize = 4;
    /// シリアルポール応答
    pub const SPMR: usize = 5;
    /// パラレルポール応答
    pub const PPR: usize = 6;
    /// データ/コマンド出力
    pub const CDOR: usize = 7;
}

/// 補助コマンド（AUXCRへ書く値）
pub mod aux {
    /// セット/クリア指定ビット（対象コマンドとORして書く）
    pub const CS: u8 = 0x80;
    /// チップリセット
    pub const CHIP_RESET: u8 = 0x00;
    /// RFDホールドオフ解除（次バイトの受信を許可）
    pub const RHDF: u8 = 0x02;
    /// 全バイトでホールドオフ
    pub const HLDA: u8 = 0x03;
    /// EOI受信時のみホールドオフ
    pub const HLDE: u8 = 0x04;
    /// new byte available false
    pub const NBAF: u8 = 0x05;
    /// ローカル復帰
    pub const RTL: u8 = 0x07;
    /// 次の送信バイトでEOIをアサート
    pub const SEOI: u8 = 0x08;
    /// リスンオンリー
    pub const LON: u8 = 0x09;
    /// トークオンリー
    pub const TON: u8 = 0x0a;
    /// スタンバイへ移行（ATN解除）
    pub const GTS: u8 = 0x0b;
    /// 非同期テイクコントロール
    pub const TCA: u8 = 0x0c;
    /// 同期テイクコントロール
    pub const TCS: u8 = 0x0d;
    /// パラレルポール実行
    pub const RPP: u8 = 0x0e;
    /// インターフェースクリア（IFCライン）
    pub const SIC: u8 = 0x0f;
    /// リモートイネーブル（RENライン）
    pub const SRE: u8 = 0x10;
    /// コントロール要求
    pub const RQC: u8 = 0x11;
    /// コントロール解放
    pub const RLC: u8 = 0x12;
    /// 全割り込み禁止
    pub const DAI: u8 = 0x13;
    /// 短縮T1ディレイ
    pub const STDL: u8 = 0x15;
    /// 超短縮T1ディレイ
    pub const VSTDL: u8 = 0x17;
}

bitflags! {
    /// 割り込みステータス0（ISR0）のビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Isr0: u8 {
        /// My Address Change
        const MAC  = 0x01;
        /// コントロール解放完了
        const RLC  = 0x02;
        /// シリアルポール応答送出
        const SPAS = 0x04;
        /// EOI付きバイト受信
        const END  = 0x08;
        /// 出力レジスタ空（次バイト送信可）
        const BO   = 0x10;
        /// 入力レジスタ有効（バイト受信済み）
        const BI   = 0x20;
    }
}

bitflags! {
    /// 割り込みステータス1（ISR1）のビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Isr1: u8 {
        /// IFC受信
        const IFC  = 0x01;
        /// SRQライン検出（コントローラ時）
        const SRQ  = 0x02;
        /// マイアドレス一致
        const MA   = 0x04;
        /// デバイスクリア受信
        const DCAS = 0x08;
        /// セカンダリアドレスパススルー
        const APT  = 0x10;
        /// 未定義コマンド受信
        const UNC  = 0x20;
        /// ハンドシェイクエラー
        const ERR  = 0x40;
        /// グループ実行トリガ受信
        const GET  = 0x80;
    }
}

bitflags! {
    /// アドレスステータスレジスタ（ADSR）のビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Adsr: u8 {
        const ULPA = 0x01;
        /// トーカーとしてアドレス済み
        const TADS = 0x02;
        /// リスナーとしてアドレス済み
        const LADS = 0x04;
        const TPAS = 0x08;
        const LPAS = 0x10;
        /// ATNアサート中
        const ATN  = 0x20;
        /// ロックアウト
        const LLO  = 0x40;
        /// リモート状態
        const REM  = 0x80;
    }
}

bitflags! {
    /// バスステータスレジスタ（BSR）のビット
    ///
    /// バス管理ラインの生のサンプル値。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Bsr: u8 {
        const ATN  = 0x01;
        const DAV  = 0x02;
        const EOI  = 0x04;
        const NDAC = 0x08;
        const NRFD = 0x10;
        const REN  = 0x20;
        const IFC  = 0x40;
        const SRQ  = 0x80;
    }
}

bitflags! {
    /// EOS検出の設定フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EosFlags: u16 {
        /// 受信時のEOS検出を有効化
        const REOS = 0x0400;
        /// 送信時にEOSバイトでEOIをアサート
        const XEOS = 0x0800;
        /// 8ビット全比較（無効なら下位7ビット比較）
        const BIN  = 0x1000;
    }
}
