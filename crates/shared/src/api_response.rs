//! # API レスポンスエンベロープ
//!
//! ゲートウェイ自身が返す JSON の統一形式 `{ "data": T }` を提供する。
//! 上流 API のレスポンスは中継するだけなので、この型で包まない。

use serde::{Deserialize, Serialize};

/// ゲートウェイ自身のエンドポイントが返すレスポンス型
///
/// `/login-options` や `/me` がこの形式で返す。
///
/// ```
/// use relaygate_shared::ApiResponse;
///
/// let response = ApiResponse::new(vec!["keycloak"]);
/// assert_eq!(response.data, vec!["keycloak"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ApiResponse<T> {
   pub data: T,
}

impl<T> ApiResponse<T> {
   pub fn new(data: T) -> Self {
      Self { data }
   }
}
