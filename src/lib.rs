//! # GPIBコントローラコア
//!
//! IEEE-488バスのホスト側コントローラコア。チップ・プロトコル
//! エンジン、バストランザクション・オーケストレータ、デバイス /
//! セッションレジストリ、コマンドディスパッチャを提供する。
//!
//! ## 階層
//!
//! ```text
//! dispatch  -- セッション要求の検証と振り分け
//! bus       -- バス全体のトランザクション（転送・ポール・バス管理）
//! board     -- ボード状態とアダプタ抽象（BoardInterface）
//! chip      -- チップ・プロトコルエンジン（転送ステートマシン）
//! adapters  -- アダプタファミリ（チップグルー、シミュレータ）
//! ```
//!
//! アダプタの割り込み配線はチップエンジンの転送フェーズフラグと
//! ボードのステータスビットを更新し、待機中の操作を起こす。上位は
//! すべてブロッキングAPIで、タイムアウトとキャンセルで律速される。

pub mod adapters;
pub mod board;
pub mod bus;
pub mod chip;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod regs;
pub mod registry;
pub mod session;
pub mod status;
pub mod wait;

pub use board::{Board, BoardConfig, BoardInfo, BoardInterface, BusResources};
pub use dispatch::{DispatchResult, Reply, Request, dispatch};
pub use error::{GpibError, GpibResult, Transfer, TransferError, TransferResult};
pub use events::BusEvent;
pub use registry::{BoardId, BusRuntime, DeviceAddr};
pub use session::{Handle, Session, SessionCaps, SessionId};
pub use status::{BoardStatus, BusLines};
pub use wait::{CancelToken, WaitOutcome};
