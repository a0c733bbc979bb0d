//! # キャンセル可能なタイムアウト付き待機プリミティブ
//!
//! WaitQueue, WaitOutcome, CancelToken
//!
//! ブロッキング待機はすべて条件変数 + デッドライン + キャンセル
//! フラグで実装し、タグ付き結果 {Ready / TimedOut / Cancelled} を
//! 返す。割り込みパスは wake_all() で待機側を起こすだけでよい。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// 待機の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 条件が成立した
    Ready,
    /// デッドラインまでに条件が成立しなかった
    TimedOut,
    /// 外部からキャンセルされた
    Cancelled,
}

/// 待機キャンセル用トークン
///
/// ブロッキング待機を外部から中断する手段。cancel() を呼んだ後は
/// 対象ボードの WaitQueue を wake しないと、スライス待機の
/// 次の再評価まで検出が遅れる。
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// キャンセルを要求
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// キャンセル済みか
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// フラグを戻す（リトライ前に呼ぶ）
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// 条件変数ベースの待機キュー
///
/// 条件そのものはアトミックなフラグ側に持たせ、ここでは
/// 起床通知だけを扱う（ミューテックスはごく短時間しか保持しない）。
pub struct WaitQueue {
    guard: Mutex<u64>,
    condvar: Condvar,
}

/// 取りこぼし対策の最大スライス幅
const WAIT_SLICE: Duration = Duration::from_millis(50);

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            guard: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// 待機中の全スレッドを起こす
    pub fn wake_all(&self) {
        // 世代カウンタを進めてから通知（通知前の再評価漏れを防ぐ）
        let mut generation = self.guard.lock().unwrap();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.condvar.notify_all();
    }

    /// 条件成立・デッドライン・キャンセルのいずれかまで待機する
    ///
    /// `deadline == None` は無期限待機（タイムアウト0設定に対応）。
    /// 条件は起床のたびに再評価される。
    pub fn wait_until<F>(
        &self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
        mut cond: F,
    ) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let mut generation = self.guard.lock().unwrap();
        loop {
            if cond() {
                return WaitOutcome::Ready;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            let now = Instant::now();
            let slice = match deadline {
                Some(d) => {
                    if now >= d {
                        return WaitOutcome::TimedOut;
                    }
                    (d - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            let observed = *generation;
            let (guard, _timeout) = self
                .condvar
                .wait_timeout_while(generation, slice, |g| *g == observed)
                .unwrap();
            generation = guard;
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
