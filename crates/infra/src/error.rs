//! # インフラ層エラー定義
//!
//! セッションストアとの通信で発生するエラーを表現する。
//!
//! ## 構造
//!
//! `std::io::Error` と同じ struct + enum パターン:
//! - [`InfraError`]: エラー種別と [`SpanTrace`] を保持するラッパー
//! - [`InfraErrorKind`]: 具体的な種別（Redis, Serialization 等）
//!
//! `From` 実装と convenience constructor が生成時点のスパンを自動で捕捉する。
//! 捕捉には subscriber 側に `tracing_error::ErrorLayer` が必要。

use std::fmt;

use derive_more::Display;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Display)]
#[display("{kind}")]
pub struct InfraError {
   kind:       InfraErrorKind,
   span_trace: SpanTrace,
}

#[derive(Debug, Error)]
pub enum InfraErrorKind {
   /// Redis への接続失敗、コマンド実行エラーなど
   #[error("Redis エラー: {0}")]
   Redis(#[source] redis::RedisError),

   /// 保存値の JSON 変換失敗
   #[error("シリアライズエラー: {0}")]
   Serialization(#[source] serde_json::Error),

   /// 上記に分類できないエラー
   #[error("予期しないエラー: {0}")]
   Unexpected(String),
}

impl InfraError {
   pub fn kind(&self) -> &InfraErrorKind {
      &self.kind
   }

   pub fn span_trace(&self) -> &SpanTrace {
      &self.span_trace
   }

   /// 接続断・タイムアウトなど、ストア自体が利用できない状態か
   ///
   /// readiness 判定と 503 応答の切り分けに使う。
   pub fn is_unavailable(&self) -> bool {
      match &self.kind {
         InfraErrorKind::Redis(e) => {
            e.is_connection_dropped() || e.is_timeout() || e.is_io_error()
         }
         InfraErrorKind::Serialization(_) | InfraErrorKind::Unexpected(_) => false,
      }
   }

   pub fn unexpected(msg: impl Into<String>) -> Self {
      Self {
         kind:       InfraErrorKind::Unexpected(msg.into()),
         span_trace: SpanTrace::capture(),
      }
   }
}

impl fmt::Debug for InfraError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("InfraError")
         .field("kind", &self.kind)
         .field("span_trace", &self.span_trace)
         .finish()
   }
}

impl std::error::Error for InfraError {
   fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
      self.kind.source()
   }
}

impl From<redis::RedisError> for InfraError {
   fn from(source: redis::RedisError) -> Self {
      Self {
         kind:       InfraErrorKind::Redis(source),
         span_trace: SpanTrace::capture(),
      }
   }
}

impl From<serde_json::Error> for InfraError {
   fn from(source: serde_json::Error) -> Self {
      Self {
         kind:       InfraErrorKind::Serialization(source),
         span_trace: SpanTrace::capture(),
      }
   }
}
