//! # チップ・プロトコルエンジン
//!
//! 汎用コントローラチップファミリのレジスタ定義と転送ステートマシン

pub mod engine;
pub mod regs;

pub use engine::{ChipEngine, HoldoffMode, TransferState};
pub use regs::EosFlags;
