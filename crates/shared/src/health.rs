//! # ヘルスチェック共通型
//!
//! `/health`（liveness）と `/health/ready`（readiness）が返すレスポンス型。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Liveness レスポンス
///
/// ```
/// use relaygate_shared::HealthResponse;
///
/// let response = HealthResponse::healthy("0.1.0");
/// assert_eq!(response.status, "healthy");
/// ```
#[derive(Debug, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthResponse {
   /// 稼働状態
   pub status:  String,
   /// アプリケーションバージョン（Cargo.toml から取得）
   pub version: String,
}

impl HealthResponse {
   pub fn healthy(version: impl Into<String>) -> Self {
      Self {
         status:  "healthy".to_string(),
         version: version.into(),
      }
   }
}

/// 個別チェックの結果ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum CheckStatus {
   Ok,
   Error,
}

/// Readiness 全体のステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ReadinessStatus {
   Ready,
   NotReady,
}

/// Readiness レスポンス
///
/// `checks` のキーはチェック名（例: `"session_store"`）。
/// 1つでも `Error` があれば全体は `NotReady` になる。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReadinessResponse {
   pub status: ReadinessStatus,
   pub checks: HashMap<String, CheckStatus>,
}

impl ReadinessResponse {
   /// 個別チェック結果から全体ステータスを導出する
   pub fn from_checks(checks: HashMap<String, CheckStatus>) -> Self {
      let status = if checks.values().all(|c| *c == CheckStatus::Ok) {
         ReadinessStatus::Ready
      } else {
         ReadinessStatus::NotReady
      };
      Self { status, checks }
   }
}
