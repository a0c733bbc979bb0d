//! # セッション / ハンドルテーブル
//!
//! SessionId, Session, Descriptor - クライアントセッションごとの
//! デバイス記述子テーブル
//!
//! ハンドル0は常に「ボード自身」を指し、汎用クローズ経路では決して
//! 閉じられない。記述子の増減はボード側デバイスレジストリの参照
//! カウントと対になる。

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use log::{debug, warn};
use spin::Mutex;

use crate::board::Board;
use crate::error::{GpibError, GpibResult};
use crate::registry::DeviceAddr;
use crate::wait::CancelToken;

/// セッションあたりの記述子テーブルサイズ
pub const MAX_NUM_DESCRIPTORS: usize = 16;

/// セッション識別子（プロセス単位で一意）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
    #[inline(always)]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// 次のセッション識別子
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// セッションの権限
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionCaps: u32 {
        /// ボード構成（ベース/IRQ/DMA）の変更を許可
        const ADMIN = 1 << 0;
    }
}

/// 記述子ハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// ボード自身を指す予約ハンドル
    pub const BOARD: Self = Self(0);

    #[inline(always)]
    pub const fn from_raw(handle: u32) -> Self {
        Self(handle)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// デバイス記述子
///
/// 「ボード自身」を指すのかリモート計測器を指すのかを区別する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: DeviceAddr,
    pub is_board: bool,
}

/// クライアントセッション
pub struct Session {
    id: SessionId,
    caps: SessionCaps,
    /// このセッションのブロッキング待機をキャンセルするトークン
    cancel: CancelToken,
    /// 記述子テーブル（インデックスがハンドル）
    descriptors: Mutex<[Option<Descriptor>; MAX_NUM_DESCRIPTORS]>,
    /// このセッションが行ったオンライン化の回数
    online_count: AtomicU32,
}

impl Session {
    /// 新規セッション。ハンドル0はボード記述子で初期化される。
    pub fn new(caps: SessionCaps) -> Self {
        let mut descriptors = [None; MAX_NUM_DESCRIPTORS];
        descriptors[0] = Some(Descriptor {
            addr: DeviceAddr { pad: 0, sad: None },
            is_board: true,
        });
        Self {
            id: SessionId::from_raw(NEXT_SESSION.fetch_add(1, Ordering::Relaxed)),
            caps,
            cancel: CancelToken::new(),
            descriptors: Mutex::new(descriptors),
            online_count: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn is_admin(&self) -> bool {
        self.caps.contains(SessionCaps::ADMIN)
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// ハンドルから記述子を引く
    pub fn descriptor(&self, handle: Handle) -> GpibResult<Descriptor> {
        let index = handle.raw() as usize;
        if index >= MAX_NUM_DESCRIPTORS {
            warn!("gpib: invalid handle {}", handle.raw());
            return Err(GpibError::InvalidHandle);
        }
        self.descriptors.lock()[index].ok_or(GpibError::InvalidHandle)
    }

    /// 空きスロットへ記述子を登録してハンドルを返す
    pub fn insert_descriptor(&self, desc: Descriptor) -> GpibResult<Handle> {
        let mut table = self.descriptors.lock();
        for (index, slot) in table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(desc);
                return Ok(Handle::from_raw(index as u32));
            }
        }
        Err(GpibError::TableFull)
    }

    /// 記述子を取り外す。ハンドル0（ボード自身）は閉じられない。
    pub fn remove_descriptor(&self, handle: Handle) -> GpibResult<Descriptor> {
        if handle == Handle::BOARD {
            return Err(GpibError::InvalidHandle);
        }
        let index = handle.raw() as usize;
        if index >= MAX_NUM_DESCRIPTORS {
            return Err(GpibError::InvalidHandle);
        }
        self.descriptors.lock()[index]
            .take()
            .ok_or(GpibError::InvalidHandle)
    }

    /// 記述子のアドレスを差し替える（pad/sad割り当て用）
    pub fn update_descriptor_addr(&self, handle: Handle, addr: DeviceAddr) -> GpibResult<()> {
        let index = handle.raw() as usize;
        if index >= MAX_NUM_DESCRIPTORS {
            return Err(GpibError::InvalidHandle);
        }
        let mut table = self.descriptors.lock();
        match table[index].as_mut() {
            Some(desc) => {
                desc.addr = addr;
                Ok(())
            }
            None => Err(GpibError::InvalidHandle),
        }
    }

    /// オンライン化回数の記録
    pub fn online_count(&self) -> u32 {
        self.online_count.load(Ordering::Acquire)
    }

    pub fn note_online(&self) {
        self.online_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn note_offline(&self) {
        let prev = self.online_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            warn!("gpib: bug! session {:?} offline without online", self.id);
            self.online_count.store(0, Ordering::Release);
        }
    }

    /// セッション終了時の後始末
    ///
    /// 開いたままの全デバイスの参照カウントを戻し、保持したままの
    /// 制御ミューテックスを解放する。レジストリの不整合は報告される
    /// が、残りの後始末は続行する。
    pub fn cleanup(&self, board: &Board) -> GpibResult<()> {
        let mut result = Ok(());
        let mut table = self.descriptors.lock();
        for slot in table.iter_mut() {
            let Some(desc) = slot.take() else {
                continue;
            };
            if !desc.is_board {
                if let Err(e) = board.devices().decrement_open(desc.addr) {
                    result = Err(e);
                }
            }
        }
        drop(table);

        board.force_release_control(self.id);
        debug!("gpib: cleaned up session {:?}", self.id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(pad: u8) -> DeviceAddr {
        DeviceAddr::new(pad, None).unwrap()
    }

    #[test]
    fn test_handle_zero_is_board() {
        let session = Session::new(SessionCaps::empty());
        let desc = session.descriptor(Handle::BOARD).unwrap();
        assert!(desc.is_board);
    }

    #[test]
    fn test_board_handle_not_closable() {
        let session = Session::new(SessionCaps::empty());
        assert_eq!(
            session.remove_descriptor(Handle::BOARD),
            Err(GpibError::InvalidHandle)
        );
    }

    #[test]
    fn test_insert_remove() {
        let session = Session::new(SessionCaps::empty());
        let handle = session
            .insert_descriptor(Descriptor {
                addr: addr(5),
                is_board: false,
            })
            .unwrap();
        assert_ne!(handle, Handle::BOARD);
        let desc = session.descriptor(handle).unwrap();
        assert_eq!(desc.addr.pad, 5);
        session.remove_descriptor(handle).unwrap();
        assert_eq!(session.descriptor(handle), Err(GpibError::InvalidHandle));
    }

    #[test]
    fn test_table_full() {
        let session = Session::new(SessionCaps::empty());
        for _ in 1..MAX_NUM_DESCRIPTORS {
            session
                .insert_descriptor(Descriptor {
                    addr: addr(1),
                    is_board: false,
                })
                .unwrap();
        }
        assert_eq!(
            session.insert_descriptor(Descriptor {
                addr: addr(1),
                is_board: false,
            }),
            Err(GpibError::TableFull)
        );
    }

    #[test]
    fn test_invalid_handle_out_of_range() {
        let session = Session::new(SessionCaps::empty());
        assert_eq!(
            session.descriptor(Handle::from_raw(99)),
            Err(GpibError::InvalidHandle)
        );
    }
}
