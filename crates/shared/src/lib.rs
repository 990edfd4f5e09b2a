//! # RelayGate 共有ユーティリティ
//!
//! ゲートウェイ全体（domain / infra / bff）で使用される共通ユーティリティを提供する。
//!
//! ## 設計方針
//!
//! - ビジネスロジック（セッション・トークンの扱い）を含まない
//! - HTTP フレームワーク（axum）には依存しない
//! - トレーシング関連は `observability` feature で有効化する

pub mod api_response;
#[cfg(feature = "observability")]
pub mod canonical_log;
pub mod error_response;
pub mod event_log;
pub mod health;
pub mod observability;

pub use api_response::ApiResponse;
pub use error_response::ErrorResponse;
pub use health::{CheckStatus, HealthResponse, ReadinessResponse, ReadinessStatus};
