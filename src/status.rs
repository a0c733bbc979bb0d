//! # ボードステータスワード
//!
//! BoardStatus (ibsta互換ビット), AtomicStatus (ロックフリー更新),
//! BusLines (バス管理ラインのサンプル結果)

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// ボードステータスビットマスク
    ///
    /// 一部のビット（TIMO / END / SRQI / DCAS / DTAS）は割り込み
    /// コンテキストからアトミック操作で設定される。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoardStatus: u32 {
        /// 直前の操作でエラーが発生
        const ERR  = 1 << 15;
        /// タイムアウト発生
        const TIMO = 1 << 14;
        /// END (EOI) または EOS を検出
        const END  = 1 << 13;
        /// サービスリクエスト（SRQライン）検出
        const SRQI = 1 << 12;
        /// I/O完了
        const CMPL = 1 << 8;
        /// ロックアウト状態
        const LOK  = 1 << 7;
        /// リモート状態
        const REM  = 1 << 6;
        /// Controller-In-Charge
        const CIC  = 1 << 5;
        /// アテンション（ATNライン）アサート中
        const ATN  = 1 << 4;
        /// トーカーとしてアドレス済み
        const TACS = 1 << 3;
        /// リスナーとしてアドレス済み
        const LACS = 1 << 2;
        /// デバイストリガ受信
        const DTAS = 1 << 1;
        /// デバイスクリア受信
        const DCAS = 1 << 0;
    }
}

bitflags! {
    /// バス管理ラインのサンプル結果
    ///
    /// 下位バイトはアダプタが観測できるラインの有効フラグ、上位
    /// バイトが実際のライン状態。BUS_* ビットは対応する VALID_* が
    /// 立っているときのみ意味を持つ。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusLines: u16 {
        const VALID_DAV  = 0x0001;
        const VALID_NDAC = 0x0002;
        const VALID_NRFD = 0x0004;
        const VALID_IFC  = 0x0008;
        const VALID_REN  = 0x0010;
        const VALID_SRQ  = 0x0020;
        const VALID_ATN  = 0x0040;
        const VALID_EOI  = 0x0080;
        const BUS_DAV    = 0x0100;
        const BUS_NDAC   = 0x0200;
        const BUS_NRFD   = 0x0400;
        const BUS_IFC    = 0x0800;
        const BUS_REN    = 0x1000;
        const BUS_SRQ    = 0x2000;
        const BUS_ATN    = 0x4000;
        const BUS_EOI    = 0x8000;
    }
}

/// ロックフリーなステータスワード
///
/// 割り込みパスからは set / clear のみ、テイクアンドクリア系の
/// 読み取り改変は CAS ベースで行う。
pub struct AtomicStatus(AtomicU32);

impl AtomicStatus {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// 現在値を取得
    #[inline]
    pub fn load(&self) -> BoardStatus {
        BoardStatus::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// ビットを設定
    #[inline]
    pub fn set(&self, bits: BoardStatus) {
        self.0.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// ビットをクリア
    #[inline]
    pub fn clear(&self, bits: BoardStatus) {
        self.0.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// ビットが立っているか
    #[inline]
    pub fn test(&self, bits: BoardStatus) -> bool {
        self.load().intersects(bits)
    }

    /// test_and_clear: 立っていればクリアして true を返す
    #[inline]
    pub fn test_and_clear(&self, bits: BoardStatus) -> bool {
        let prev = self.0.fetch_and(!bits.bits(), Ordering::AcqRel);
        BoardStatus::from_bits_truncate(prev).intersects(bits)
    }

    /// 指定マスク以外を保持したまま置き換える
    pub fn replace(&self, keep: BoardStatus, new: BoardStatus) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let next = (cur & keep.bits()) | new.bits();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(v) => cur = v,
            }
        }
    }
}

impl Default for AtomicStatus {
    fn default() -> Self {
        Self::new()
    }
}
