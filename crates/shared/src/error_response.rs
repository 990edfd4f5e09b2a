//! # エラーレスポンス（RFC 9457 Problem Details）
//!
//! ゲートウェイが自ら生成するエラーの共通形式を提供する。
//!
//! ## 設計
//!
//! - `ErrorResponse` は純粋なデータ構造（axum の `IntoResponse` 変換は bff 側の責務）
//! - `detail` にはトークン・IdP の診断情報を載せない
//! - 上流 API が返したエラーはこの型に詰め替えず、ステータスごと中継する

use serde::{Deserialize, Serialize};

/// error_type URI のベースパス
const ERROR_TYPE_BASE: &str = "https://relaygate.example.com/errors";

/// エラーレスポンス（RFC 9457 Problem Details）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ErrorResponse {
   #[serde(rename = "type")]
   pub error_type: String,
   pub title:      String,
   pub status:     u16,
   pub detail:     String,
}

impl ErrorResponse {
   /// 汎用コンストラクタ
   ///
   /// `error_type_suffix` はベース URI に付加される（例: `"csrf-mismatch"`）。
   pub fn new(
      error_type_suffix: &str,
      title: impl Into<String>,
      status: u16,
      detail: impl Into<String>,
   ) -> Self {
      Self {
         error_type: format!("{ERROR_TYPE_BASE}/{error_type_suffix}"),
         title: title.into(),
         status,
         detail: detail.into(),
      }
   }

   /// 400 Bad Request
   pub fn bad_request(detail: impl Into<String>) -> Self {
      Self::new("bad-request", "Bad Request", 400, detail)
   }

   /// 401 Unauthorized
   pub fn unauthorized(detail: impl Into<String>) -> Self {
      Self::new("unauthorized", "Unauthorized", 401, detail)
   }

   /// 403 Forbidden（CSRF 検証失敗）
   pub fn csrf_mismatch() -> Self {
      Self::new(
         "csrf-mismatch",
         "Forbidden",
         403,
         "CSRF トークンが無効です",
      )
   }

   /// 404 Not Found
   pub fn not_found(detail: impl Into<String>) -> Self {
      Self::new("not-found", "Not Found", 404, detail)
   }

   /// 413 Payload Too Large
   pub fn payload_too_large() -> Self {
      Self::new(
         "payload-too-large",
         "Payload Too Large",
         413,
         "リクエストボディが大きすぎます",
      )
   }

   /// 500 Internal Server Error
   ///
   /// detail は固定値（内部情報を漏らさないため）。
   pub fn internal_error() -> Self {
      Self::new(
         "internal-error",
         "Internal Server Error",
         500,
         "内部エラーが発生しました",
      )
   }

   /// 502 Bad Gateway
   pub fn bad_gateway() -> Self {
      Self::new(
         "upstream-unavailable",
         "Bad Gateway",
         502,
         "上流サービスとの通信に失敗しました",
      )
   }

   /// 503 Service Unavailable
   pub fn service_unavailable(detail: impl Into<String>) -> Self {
      Self::new("service-unavailable", "Service Unavailable", 503, detail)
   }
}
