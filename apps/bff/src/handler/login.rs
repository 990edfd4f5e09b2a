//! # ログインハンドラ
//!
//! ## エンドポイント
//!
//! - `GET /login-options` - 設定済みプロバイダとログイン開始 URL の一覧
//! - `GET /oauth2/authorization/{provider}` - IdP の認可エンドポイントへリダイレクト
//! - `GET /login/oauth2/code/{provider}` - IdP からのコールバック
//!
//! 失敗はブラウザを `LOGIN_ERROR_REDIRECT?error=<code>` に戻す。プロトコルの詳細は返さない。

use std::sync::Arc;

use axum::{
   Extension,
   Json,
   extract::{Path, Query, State},
   response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use relaygate_shared::{ApiResponse, ErrorResponse};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::found;
use crate::{
   cookie::{CookieSettings, STATE_COOKIE_NAME},
   error::{internal_error_response, problem_response},
   middleware::CurrentSession,
   provider::ProviderRegistry,
   usecase::{AuthError, CallbackParams, LoginUseCase},
};

/// ログイン開始 URL のパス
pub fn login_uri(provider_id: &str) -> String {
   format!("/oauth2/authorization/{provider_id}")
}

pub struct LoginState {
   pub login: Arc<LoginUseCase>,
   pub providers: Arc<ProviderRegistry>,
   pub cookies: CookieSettings,
   pub login_error_redirect: String,
}

/// ログイン選択肢
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginOption {
   pub id: String,
   pub label: String,
   pub login_uri: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartLoginQuery {
   /// ログイン後の戻り先（同一オリジンの相対パスのみ有効）
   pub return_to: Option<String>,
}

/// 設定済みのプロバイダ一覧
#[utoipa::path(
   get,
   path = "/login-options",
   tag = "auth",
   responses(
      (status = 200, description = "ログイン選択肢", body = ApiResponse<Vec<LoginOption>>)
   )
)]
pub async fn login_options(State(state): State<Arc<LoginState>>) -> Json<ApiResponse<Vec<LoginOption>>> {
   let options = state
      .providers
      .iter()
      .map(|p| LoginOption {
         id: p.id.to_string(),
         label: p.label.clone(),
         login_uri: login_uri(p.id.as_str()),
      })
      .collect();
   Json(ApiResponse::new(options))
}

/// ログインを開始する
#[utoipa::path(
   get,
   path = "/oauth2/authorization/{provider}",
   tag = "auth",
   params(
      ("provider" = String, Path, description = "プロバイダ ID"),
      ("return_to" = Option<String>, Query, description = "ログイン後の戻り先")
   ),
   responses(
      (status = 302, description = "IdP の認可エンドポイントへリダイレクト"),
      (status = 404, description = "未知のプロバイダ", body = ErrorResponse)
   )
)]
#[tracing::instrument(skip_all, fields(provider = %provider))]
pub async fn start_authorization(
   State(state): State<Arc<LoginState>>,
   Path(provider): Path<String>,
   Query(query): Query<StartLoginQuery>,
) -> Response {
   match state.login.start_login(&provider, query.return_to.as_deref()).await {
      Ok(redirect) => {
         let jar = CookieJar::new().add(state.cookies.state_cookie(&redirect.state, redirect.state_ttl));
         (jar, found(redirect.authorization_url.as_str())).into_response()
      }
      Err(AuthError::UnknownProvider) => {
         problem_response(ErrorResponse::not_found("プロバイダが見つかりません"))
      }
      Err(e) => {
         tracing::error!(error = %e, "ログインを開始できませんでした");
         internal_error_response()
      }
   }
}

/// IdP からのコールバック
///
/// 成功時はログイン前のセッションを破棄し、新しいセッション ID の Cookie で戻り先へリダイレクトする。
#[utoipa::path(
   get,
   path = "/login/oauth2/code/{provider}",
   tag = "auth",
   params(
      ("provider" = String, Path, description = "プロバイダ ID"),
      ("code" = Option<String>, Query, description = "認可コード"),
      ("state" = Option<String>, Query, description = "認可リクエストの state"),
      ("error" = Option<String>, Query, description = "IdP のエラーコード")
   ),
   responses(
      (status = 302, description = "戻り先またはログイン失敗画面へリダイレクト")
   )
)]
#[tracing::instrument(skip_all, fields(provider = %provider))]
pub async fn authorization_callback(
   State(state): State<Arc<LoginState>>,
   Path(provider): Path<String>,
   Query(params): Query<CallbackParams>,
   Extension(current): Extension<CurrentSession>,
   jar: CookieJar,
) -> Response {
   let state_cookie = jar.get(STATE_COOKIE_NAME).map(|c| c.value().to_string());
   let previous = current.0.as_ref().map(|s| s.id().clone());

   let result = state
      .login
      .handle_callback(&provider, params, state_cookie.as_deref(), previous.as_ref())
      .await;

   let jar = CookieJar::new().add(state.cookies.clear_state_cookie());
   match result {
      Ok(success) => {
         let jar = jar
            .add(state.cookies.session_cookie(success.issued.session.id()))
            .add(state.cookies.csrf_cookie(&success.issued.csrf_token));
         (jar, found(success.return_target.as_str())).into_response()
      }
      Err(e) => {
         let location = error_location(&state.login_error_redirect, e.code());
         (jar, found(&location)).into_response()
      }
   }
}

/// ログイン失敗画面の URL にエラーコードを付ける
fn error_location(base: &str, code: &str) -> String {
   let separator = if base.contains('?') { '&' } else { '?' };
   format!("{base}{separator}error={code}")
}
