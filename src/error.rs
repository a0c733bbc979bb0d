//! 統一エラーハンドリングモジュール
//!
//! GPIBコア全体で使用される統一エラー型を定義し、
//! 各サブシステムから返される失敗条件を一箇所に集約します。

use core::fmt;

/// GPIBコア全体の統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpibError {
    /// 設定タイムアウト時間内にイベントが発生しなかった
    /// （部分的な成功よりも優先して報告される）
    Timeout,
    /// ブロッキング待機が外部からキャンセルされた
    /// （呼び出し側はリトライ可能な一時的エラーとして扱う）
    Interrupted,
    /// 転送中にバスレベルのデバイスクリアが発生した
    /// （バッファは中断点まで有効）
    DeviceClear,
    /// 無効なセッションハンドル
    InvalidHandle,
    /// 無効なGPIBアドレス（pad 0-30, sad なし または 0-30）
    InvalidAddress,
    /// 参照カウント / レジストリ不変条件の違反（呼び出し側のバグ）
    ConsistencyFault,
    /// 権限またはミューテックス所有権チェックの失敗
    PermissionDenied,
    /// インターフェース未接続またはボードがオフライン
    NotConfigured,
    /// イベントキューが空
    EventQueueEmpty,
    /// イベントキューが満杯（イベントは破棄された）
    EventQueueFull,
    /// ハンドルテーブルに空きがない
    TableFull,
    /// ボードが排他オープンされている
    Busy,
}

impl fmt::Display for GpibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpibError::Timeout => write!(f, "io timed out"),
            GpibError::Interrupted => write!(f, "wait interrupted"),
            GpibError::DeviceClear => write!(f, "device clear asserted during transfer"),
            GpibError::InvalidHandle => write!(f, "invalid descriptor handle"),
            GpibError::InvalidAddress => write!(f, "invalid gpib address"),
            GpibError::ConsistencyFault => write!(f, "registry consistency fault"),
            GpibError::PermissionDenied => write!(f, "permission denied"),
            GpibError::NotConfigured => write!(f, "no interface configured or board offline"),
            GpibError::EventQueueEmpty => write!(f, "event queue empty"),
            GpibError::EventQueueFull => write!(f, "event queue full"),
            GpibError::TableFull => write!(f, "descriptor table full"),
            GpibError::Busy => write!(f, "board is open exclusively"),
        }
    }
}

impl core::error::Error for GpibError {}

/// GPIBコア共通のResult型
pub type GpibResult<T> = Result<T, GpibError>;

/// バイト転送の結果（正常終了）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// 実際に転送されたバイト数
    pub bytes: usize,
    /// END (EOI) または EOS 一致で終了したか
    pub end: bool,
}

/// バイト転送の失敗
///
/// 部分転送のバイト数は常にエラーと一緒に報告される。
/// 呼び出し側はここから転送を再開できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferError {
    /// 失敗の種類（Timeout / Interrupted / DeviceClear）
    pub error: GpibError,
    /// エラー発生までに転送されたバイト数
    pub bytes: usize,
}

impl TransferError {
    pub const fn new(error: GpibError, bytes: usize) -> Self {
        Self { error, bytes }
    }
}

impl From<GpibError> for TransferError {
    fn from(error: GpibError) -> Self {
        Self { error, bytes: 0 }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} bytes", self.error, self.bytes)
    }
}

/// 転送関数共通のResult型
pub type TransferResult = Result<Transfer, TransferError>;
