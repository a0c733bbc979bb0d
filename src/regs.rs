//! # レジスタアクセスシム
//!
//! RegisterIo - アダプタレジスタへのバイト読み書きを抽象化するトレイト
//!
//! メモリマップド / ポートマップドの違いはこのトレイトの実装側に
//! 閉じ込める。readb/outb 系のポートアクセスもここで抽象化され、チップエンジンは
//! このトレイト越しにしかレジスタへ触れない。

use std::sync::Arc;

/// アダプタレジスタへのバイト単位アクセサ
///
/// 実装は割り込みパスと転送パスの双方から呼ばれるため
/// Send + Sync であること。
pub trait RegisterIo: Send + Sync {
    /// オフセット位置のレジスタを読む
    fn read(&self, offset: usize) -> u8;

    /// オフセット位置のレジスタへ書く
    fn write(&self, value: u8, offset: usize);
}

/// 共有レジスタハンドル
pub type SharedRegisterIo = Arc<dyn RegisterIo>;

/// レジスタオフセットをシフトするラッパー
///
/// 一部のISAアダプタはチップレジスタを等間隔で飛ばして
/// マップする（例: offset << 1）。
pub struct ShiftedRegisterIo {
    inner: SharedRegisterIo,
    shift: u32,
}

impl ShiftedRegisterIo {
    pub fn new(inner: SharedRegisterIo, shift: u32) -> Self {
        Self { inner, shift }
    }
}

impl RegisterIo for ShiftedRegisterIo {
    fn read(&self, offset: usize) -> u8 {
        self.inner.read(offset << self.shift)
    }

    fn write(&self, value: u8, offset: usize) {
        self.inner.write(value, offset << self.shift)
    }
}
