//! # デバイスレジストリ / ボードレジストリ
//!
//! DeviceAddr, StatusQueue, DeviceRegistry, BusRuntime
//!
//! オープン中の (プライマリ, セカンダリ) アドレスごとに参照カウントと
//! シリアルポールステータスのFIFOを保持する。リストの変更はボード
//! 制御ミューテックス保持下で行われるが、キュー自体は独立した短い
//! クリティカルセクションで守る。

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, error, warn};
use spin::Mutex;

use crate::board::Board;
use crate::error::{GpibError, GpibResult};

/// GPIBアドレスの最大値（0-30; 31はUNL/UNT）
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// GPIBデバイスアドレス（プライマリ + 任意のセカンダリ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr {
    pub pad: u8,
    pub sad: Option<u8>,
}

impl DeviceAddr {
    /// 検証付きで生成する
    pub fn new(pad: u8, sad: Option<u8>) -> GpibResult<Self> {
        if pad > MAX_GPIB_ADDRESS {
            return Err(GpibError::InvalidAddress);
        }
        if let Some(sad) = sad {
            if sad > MAX_GPIB_ADDRESS {
                return Err(GpibError::InvalidAddress);
            }
        }
        Ok(Self { pad, sad })
    }
}

/// アドレス単位のシリアルポールステータスFIFO
///
/// オートポール中に収集されたステータスバイトを溜め、ポール要求が
/// 消費する。同一アドレスを共有するセッション間で参照カウントされる。
struct StatusQueue {
    reference_count: usize,
    bytes: VecDeque<u8>,
}

/// 1アドレスに溜め込むステータスバイトの上限
const MAX_STATUS_BYTES: usize = 1024;

impl StatusQueue {
    fn new() -> Self {
        Self {
            reference_count: 1,
            bytes: VecDeque::new(),
        }
    }
}

/// ボード単位のオープンデバイスレジストリ
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceAddr, StatusQueue>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// アドレスのオープンカウントを増やす。未登録なら新規登録する。
    pub fn increment_open(&self, addr: DeviceAddr) {
        let mut devices = self.devices.lock();
        match devices.get_mut(&addr) {
            Some(entry) => {
                entry.reference_count += 1;
                debug!(
                    "gpib: incremented open count for pad {} sad {:?}",
                    addr.pad, addr.sad
                );
            }
            None => {
                devices.insert(addr, StatusQueue::new());
                debug!("gpib: opened pad {} sad {:?}", addr.pad, addr.sad);
            }
        }
    }

    /// オープンカウントを count 分減らす。0でエントリを破棄する。
    ///
    /// 過剰な減算や未オープンのアドレスのクローズは呼び出し側の
    /// バグであり、ConsistencyFault として拒否する。
    pub fn subtract_open(&self, addr: DeviceAddr, count: usize) -> GpibResult<()> {
        let mut devices = self.devices.lock();
        let Some(entry) = devices.get_mut(&addr) else {
            error!(
                "gpib: bug! tried to close pad {} sad {:?} that was never opened",
                addr.pad, addr.sad
            );
            return Err(GpibError::ConsistencyFault);
        };
        if count > entry.reference_count {
            error!("gpib: bug! open count underflow for pad {}", addr.pad);
            return Err(GpibError::ConsistencyFault);
        }
        entry.reference_count -= count;
        if entry.reference_count == 0 {
            debug!("gpib: closing pad {} sad {:?}", addr.pad, addr.sad);
            devices.remove(&addr);
        }
        Ok(())
    }

    /// オープンカウントを1減らす
    pub fn decrement_open(&self, addr: DeviceAddr) -> GpibResult<()> {
        self.subtract_open(addr, 1)
    }

    /// オープン中のエントリ数
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// オープン中の全アドレス（オートポールの巡回用）
    pub fn open_addresses(&self) -> Vec<DeviceAddr> {
        self.devices.lock().keys().copied().collect()
    }

    /// ステータスバイトを積む。上限を超えたら最古を捨てる。
    pub fn push_status_byte(&self, addr: DeviceAddr, byte: u8) {
        let mut devices = self.devices.lock();
        let Some(entry) = devices.get_mut(&addr) else {
            // ポール中にクローズされた場合は捨てるだけでよい
            debug!("gpib: dropping status byte for closed pad {}", addr.pad);
            return;
        };
        if entry.bytes.len() >= MAX_STATUS_BYTES {
            warn!("gpib: status queue overflow for pad {}", addr.pad);
            entry.bytes.pop_front();
        }
        entry.bytes.push_back(byte);
    }

    /// 溜まっているステータスバイトを1つ取り出す
    pub fn pop_status_byte(&self, addr: DeviceAddr) -> Option<u8> {
        self.devices.lock().get_mut(&addr)?.bytes.pop_front()
    }

    /// 溜まっているステータスバイト数
    pub fn num_status_bytes(&self, addr: DeviceAddr) -> usize {
        self.devices
            .lock()
            .get(&addr)
            .map_or(0, |entry| entry.bytes.len())
    }

    /// 全エントリ破棄（オフライン化時）
    pub fn clear(&self) {
        self.devices.lock().clear();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Board registry
// ============================================================================

/// ボード識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BoardId(u32);

impl BoardId {
    #[inline(always)]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// プロセス全体のボードレジストリ
///
/// 起動時に固定数のボードを生成し、利用側へ明示的に注入する。
/// グローバル状態は持たない。
pub struct BusRuntime {
    boards: HashMap<BoardId, Arc<Board>>,
}

impl BusRuntime {
    /// 固定数のボードを持つランタイムを生成する
    pub fn new(num_boards: u32) -> Self {
        let mut boards = HashMap::new();
        for minor in 0..num_boards {
            let id = BoardId::from_raw(minor);
            boards.insert(id, Arc::new(Board::new(id)));
        }
        Self { boards }
    }

    /// 識別子からボードを取得する
    pub fn board(&self, id: BoardId) -> GpibResult<Arc<Board>> {
        self.boards.get(&id).cloned().ok_or(GpibError::InvalidHandle)
    }

    /// 登録ボード数
    pub fn num_boards(&self) -> usize {
        self.boards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(pad: u8) -> DeviceAddr {
        DeviceAddr::new(pad, None).unwrap()
    }

    #[test]
    fn test_address_validation() {
        assert!(DeviceAddr::new(30, Some(30)).is_ok());
        assert_eq!(DeviceAddr::new(31, None), Err(GpibError::InvalidAddress));
        assert_eq!(
            DeviceAddr::new(5, Some(31)),
            Err(GpibError::InvalidAddress)
        );
    }

    #[test]
    fn test_open_close_reference_counting() {
        let reg = DeviceRegistry::new();
        reg.increment_open(addr(7));
        reg.increment_open(addr(7));
        assert_eq!(reg.len(), 1);
        reg.decrement_open(addr(7)).unwrap();
        assert_eq!(reg.len(), 1);
        reg.decrement_open(addr(7)).unwrap();
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_close_never_opened_is_fault() {
        let reg = DeviceRegistry::new();
        assert_eq!(
            reg.decrement_open(addr(3)),
            Err(GpibError::ConsistencyFault)
        );
    }

    #[test]
    fn test_subtract_underflow_is_fault() {
        let reg = DeviceRegistry::new();
        reg.increment_open(addr(4));
        assert_eq!(
            reg.subtract_open(addr(4), 2),
            Err(GpibError::ConsistencyFault)
        );
        // エントリは無傷で残る
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_status_byte_fifo() {
        let reg = DeviceRegistry::new();
        reg.increment_open(addr(9));
        reg.push_status_byte(addr(9), 0x41);
        reg.push_status_byte(addr(9), 0x42);
        assert_eq!(reg.num_status_bytes(addr(9)), 2);
        assert_eq!(reg.pop_status_byte(addr(9)), Some(0x41));
        assert_eq!(reg.pop_status_byte(addr(9)), Some(0x42));
        assert_eq!(reg.pop_status_byte(addr(9)), None);
    }

    #[test]
    fn test_runtime_board_lookup() {
        let runtime = BusRuntime::new(2);
        assert_eq!(runtime.num_boards(), 2);
        assert!(runtime.board(BoardId::from_raw(0)).is_ok());
        assert_eq!(
            runtime.board(BoardId::from_raw(5)).err(),
            Some(GpibError::InvalidHandle)
        );
    }
}
