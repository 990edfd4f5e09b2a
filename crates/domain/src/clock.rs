//! # Clock（時刻提供）
//!
//! トークン有効期限・セッション期限の判定で `Utc::now()` を直接呼ばず、
//! テストで時刻を注入・進められるようにするための抽象化。

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
   fn now(&self) -> DateTime<Utc>;
}

/// 実際のシステム時刻を返す実装
pub struct SystemClock;

impl Clock for SystemClock {
   fn now(&self) -> DateTime<Utc> {
      Utc::now()
   }
}

/// 固定時刻を返すテスト用実装
pub struct FixedClock {
   now: DateTime<Utc>,
}

impl FixedClock {
   pub fn new(now: DateTime<Utc>) -> Self {
      Self { now }
   }
}

impl Clock for FixedClock {
   fn now(&self) -> DateTime<Utc> {
      self.now
   }
}

/// 手動で進められるテスト用実装
///
/// クロックスキュー・トークン期限切れのシミュレーションに使う。
pub struct ManualClock {
   now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
   pub fn new(now: DateTime<Utc>) -> Self {
      Self {
         now: Mutex::new(now),
      }
   }

   /// 時刻を `delta` だけ進める（負の値で戻す）
   pub fn advance(&self, delta: Duration) {
      let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
      *now += delta;
   }

   pub fn set(&self, at: DateTime<Utc>) {
      *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
   }
}

impl Clock for ManualClock {
   fn now(&self) -> DateTime<Utc> {
      *self.now.lock().unwrap_or_else(|e| e.into_inner())
   }
}
