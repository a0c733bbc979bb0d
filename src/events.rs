//! # プロトコルイベントキュー
//!
//! BusEvent, EventQueue - クライアントへ届けるボード単位のFIFO
//!
//! 容量は有界で、満杯時はイベントを破棄してオーバーフローを記録する。
//! 制御ミューテックスとは独立した短いクリティカルセクションで守り、
//! オートポールと読み書きフローが互いにデッドロックしないようにする。

use std::collections::VecDeque;

use log::warn;
use spin::Mutex;

use crate::error::{GpibError, GpibResult};

/// バスプロトコルイベント種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// デバイスクリア受信
    DeviceClear,
    /// グループ実行トリガ受信
    DeviceTrigger,
    /// サービスリクエスト検出
    ServiceRequest,
}

/// ボード単位の有界イベントキュー
pub struct EventQueue {
    events: Mutex<VecDeque<BusEvent>>,
    /// 一度でもオーバーフローしたか（次のpopでエラー報告してクリア）
    overflowed: Mutex<bool>,
}

impl EventQueue {
    /// キュー容量
    const CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            overflowed: Mutex::new(false),
        }
    }

    /// イベントを積む。満杯なら破棄してオーバーフローを記録する。
    pub fn push(&self, event: BusEvent) -> GpibResult<()> {
        let mut events = self.events.lock();
        if events.len() >= Self::CAPACITY {
            *self.overflowed.lock() = true;
            warn!("gpib: event queue overflow, dropping {:?}", event);
            return Err(GpibError::EventQueueFull);
        }
        events.push_back(event);
        Ok(())
    }

    /// 先頭イベントを取り出す
    ///
    /// オーバーフローが起きていた場合は取りこぼしを呼び出し側へ
    /// 一度だけエラーとして伝える。
    pub fn pop(&self) -> GpibResult<BusEvent> {
        let mut overflowed = self.overflowed.lock();
        if *overflowed {
            *overflowed = false;
            return Err(GpibError::EventQueueFull);
        }
        self.events.lock().pop_front().ok_or(GpibError::EventQueueEmpty)
    }

    /// 積まれているイベント数
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// 全イベントを破棄（オフライン化時）
    pub fn clear(&self) {
        self.events.lock().clear();
        *self.overflowed.lock() = false;
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
