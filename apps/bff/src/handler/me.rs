//! # セッション情報ハンドラ
//!
//! `GET /me` - 現在のセッションの認証状態を返す。トークンそのものは返さない。

use std::sync::Arc;

use axum::{
   Extension,
   Json,
   extract::State,
   response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use relaygate_infra::SessionManager;
use relaygate_shared::ApiResponse;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{error::store_error_response, middleware::CurrentSession};

pub struct MeState {
   pub store: Arc<dyn SessionManager>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
   pub authenticated: bool,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub subject: Option<String>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub issuer: Option<String>,
   pub roles: Vec<String>,
   /// セッションの有効期限（アイドル期限と絶対期限の早い方）
   #[serde(skip_serializing_if = "Option::is_none")]
   pub expires_at: Option<DateTime<Utc>>,
}

impl MeResponse {
   fn anonymous() -> Self {
      Self {
         authenticated: false,
         subject: None,
         issuer: None,
         roles: Vec::new(),
         expires_at: None,
      }
   }
}

#[utoipa::path(
   get,
   path = "/me",
   tag = "auth",
   responses(
      (status = 200, description = "現在のセッション情報", body = ApiResponse<MeResponse>)
   )
)]
pub async fn me(State(state): State<Arc<MeState>>, Extension(current): Extension<CurrentSession>) -> Response {
   let Some(session) = current.0 else {
      return Json(ApiResponse::new(MeResponse::anonymous())).into_response();
   };
   let Some(principal) = session.principal() else {
      return Json(ApiResponse::new(MeResponse::anonymous())).into_response();
   };

   let tokens = match state.store.get_token_set(session.id()).await {
      Ok(tokens) => tokens,
      Err(e) => return store_error_response("トークンの取得に失敗しました", &e),
   };
   let roles = tokens
      .as_ref()
      .and_then(|t| t.id_token_claims())
      .map(|claims| claims.roles().to_vec())
      .unwrap_or_default();

   Json(ApiResponse::new(MeResponse {
      authenticated: true,
      subject: Some(principal.subject().subject().to_string()),
      issuer: Some(principal.subject().issuer().to_string()),
      roles,
      expires_at: Some(session.expires_at()),
   }))
   .into_response()
}
