//! # ログアウトハンドラ
//!
//! ## エンドポイント
//!
//! - `POST /logout` - RP-initiated ログアウト（CSRF 検証あり）
//! - `GET /logout/complete` - IdP のログアウト後の戻り先
//! - `POST /backchannel-logout` - IdP からのバックチャネルログアウト通知

use std::sync::Arc;

use axum::{
   Extension,
   Form,
   extract::{State, rejection::FormRejection},
   http::{HeaderValue, StatusCode, header},
   response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use utoipa::ToSchema;

use super::found;
use crate::{
   config::LogoutResponseMode,
   cookie::CookieSettings,
   error::{bad_request_response, internal_error_response, store_error_response},
   middleware::CurrentSession,
   usecase::{BackchannelLogoutError, LogoutUseCase},
};

pub struct LogoutState {
   pub logout: Arc<LogoutUseCase>,
   pub cookies: CookieSettings,
   pub response_mode: LogoutResponseMode,
}

/// バックチャネルログアウトのフォーム
#[derive(Debug, Deserialize, ToSchema)]
pub struct BackchannelLogoutForm {
   pub logout_token: String,
}

/// ログアウトする
///
/// セッションを破棄して Cookie を削除し、IdP の end-session エンドポイントへ遷移させる。
#[utoipa::path(
   post,
   path = "/logout",
   tag = "auth",
   responses(
      (status = 302, description = "IdP のログアウトまたはログアウト後の画面へリダイレクト"),
      (status = 202, description = "遷移先を Location で返す（LOGOUT_RESPONSE_STATUS=202）"),
      (status = 403, description = "CSRF 検証失敗", body = relaygate_shared::ErrorResponse)
   )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(
   State(state): State<Arc<LogoutState>>,
   Extension(current): Extension<CurrentSession>,
) -> Response {
   let location = match state.logout.logout(current.0.as_ref()).await {
      Ok(location) => location,
      Err(e) => return store_error_response("ログアウトでストアエラー", &e),
   };

   let jar = CookieJar::new()
      .add(state.cookies.clear_session_cookie())
      .add(state.cookies.clear_csrf_cookie());
   match state.response_mode {
      LogoutResponseMode::Redirect => (jar, found(&location)).into_response(),
      LogoutResponseMode::Accepted => match HeaderValue::from_str(&location) {
         Ok(value) => (StatusCode::ACCEPTED, jar, [(header::LOCATION, value)]).into_response(),
         Err(_) => internal_error_response(),
      },
   }
}

/// IdP のログアウト完了後の戻り先
#[utoipa::path(
   get,
   path = "/logout/complete",
   tag = "auth",
   responses(
      (status = 302, description = "ログアウト後の画面へリダイレクト")
   )
)]
pub async fn logout_complete(State(state): State<Arc<LogoutState>>) -> Response {
   found(state.logout.post_logout_redirect())
}

/// バックチャネルログアウト
///
/// ブラウザを介さない IdP からの通知。該当セッションがなくても 200 を返す。
#[utoipa::path(
   post,
   path = "/backchannel-logout",
   tag = "auth",
   request_body(content = BackchannelLogoutForm, content_type = "application/x-www-form-urlencoded"),
   responses(
      (status = 200, description = "受理"),
      (status = 400, description = "ログアウトトークンが不正", body = relaygate_shared::ErrorResponse)
   )
)]
#[tracing::instrument(skip_all)]
pub async fn backchannel_logout(
   State(state): State<Arc<LogoutState>>,
   form: Result<Form<BackchannelLogoutForm>, FormRejection>,
) -> Response {
   let Ok(Form(form)) = form else {
      return bad_request_response("logout_token が必要です");
   };
   match state.logout.backchannel_logout(&form.logout_token).await {
      Ok(_) => StatusCode::OK.into_response(),
      Err(BackchannelLogoutError::InvalidToken(_)) => {
         bad_request_response("ログアウトトークンが不正です")
      }
      Err(BackchannelLogoutError::Store(_)) => internal_error_response(),
   }
}
