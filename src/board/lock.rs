//! # 所有者記録付きミューテックス
//!
//! OwnedMutex - 保持者のセッション識別子を記録するブロッキングロック
//!
//! ボード制御ミューテックスとオートポール許可の両方に使う。
//! 解放はロック取得時と同じセッションからのみ許され、それ以外は
//! PermissionDenied になる。所有権の移転はアトミックで、二つの
//! セッションが同時に保持していると信じる窓は存在しない。

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

use crate::error::{GpibError, GpibResult};
use crate::session::SessionId;
use crate::wait::CancelToken;

/// キャンセル検出のための再評価間隔
const ACQUIRE_SLICE: Duration = Duration::from_millis(50);

/// 所有者記録付きミューテックス
pub struct OwnedMutex {
    owner: Mutex<Option<SessionId>>,
    condvar: Condvar,
}

impl OwnedMutex {
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    /// ロックを取得する。解放されるまでブロックする。
    ///
    /// キャンセルされた場合は Interrupted を返す（リトライ可能）。
    pub fn acquire(&self, session: SessionId, cancel: &CancelToken) -> GpibResult<()> {
        let mut owner = self.owner.lock().unwrap();
        loop {
            match *owner {
                None => {
                    *owner = Some(session);
                    return Ok(());
                }
                Some(holder) if holder == session => {
                    // 再入は不変条件違反
                    warn!("gpib: session {:?} tried to re-acquire held lock", session);
                    return Err(GpibError::ConsistencyFault);
                }
                Some(_) => {
                    if cancel.is_cancelled() {
                        return Err(GpibError::Interrupted);
                    }
                    let (guard, _) = self
                        .condvar
                        .wait_timeout_while(owner, ACQUIRE_SLICE, |o| o.is_some())
                        .unwrap();
                    owner = guard;
                }
            }
        }
    }

    /// ロックを解放する。保持者以外からの解放は拒否される。
    pub fn release(&self, session: SessionId) -> GpibResult<()> {
        let mut owner = self.owner.lock().unwrap();
        match *owner {
            Some(holder) if holder == session => {
                *owner = None;
                drop(owner);
                self.condvar.notify_one();
                Ok(())
            }
            Some(holder) => {
                warn!(
                    "gpib: session {:?} tried to release lock held by {:?}",
                    session, holder
                );
                Err(GpibError::PermissionDenied)
            }
            None => {
                warn!("gpib: session {:?} tried to release unheld lock", session);
                Err(GpibError::PermissionDenied)
            }
        }
    }

    /// 現在の保持者
    pub fn owner(&self) -> Option<SessionId> {
        *self.owner.lock().unwrap()
    }

    /// 指定セッションが保持中か
    pub fn is_held_by(&self, session: SessionId) -> bool {
        self.owner() == Some(session)
    }
}

impl Default for OwnedMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let m = OwnedMutex::new();
        let s = SessionId::from_raw(1);
        m.acquire(s, &CancelToken::new()).unwrap();
        assert!(m.is_held_by(s));
        m.release(s).unwrap();
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn test_release_by_non_owner_denied() {
        let m = OwnedMutex::new();
        let a = SessionId::from_raw(1);
        let b = SessionId::from_raw(2);
        m.acquire(a, &CancelToken::new()).unwrap();
        assert_eq!(m.release(b), Err(GpibError::PermissionDenied));
        m.release(a).unwrap();
        assert_eq!(m.release(a), Err(GpibError::PermissionDenied));
    }

    #[test]
    fn test_second_acquire_blocks_until_release() {
        let m = Arc::new(OwnedMutex::new());
        let a = SessionId::from_raw(1);
        let b = SessionId::from_raw(2);
        let order = Arc::new(AtomicU32::new(0));

        m.acquire(a, &CancelToken::new()).unwrap();

        let m2 = Arc::clone(&m);
        let order2 = Arc::clone(&order);
        let h = thread::spawn(move || {
            m2.acquire(b, &CancelToken::new()).unwrap();
            // 解放後にのみ到達できる
            assert_eq!(order2.load(Ordering::Acquire), 1);
            m2.release(b).unwrap();
        });

        thread::sleep(Duration::from_millis(30));
        order.store(1, Ordering::Release);
        m.release(a).unwrap();
        h.join().unwrap();
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn test_acquire_cancelled() {
        let m = Arc::new(OwnedMutex::new());
        let a = SessionId::from_raw(1);
        let b = SessionId::from_raw(2);
        m.acquire(a, &CancelToken::new()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(m.acquire(b, &cancel), Err(GpibError::Interrupted));
        m.release(a).unwrap();
    }
}
