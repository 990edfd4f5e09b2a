//! # CSRF 検証ミドルウェア
//!
//! 状態変更リクエスト（GET/HEAD/OPTIONS 以外）で Double-submit の CSRF トークンを検証する。
//!
//! ヘッダー・Cookie・セッションに紐づく値の 3 つが一致しない場合、
//! 中継やセッション操作より前に 403 で拒否する。
//!
//! [`super::resolve_session`] の内側に配置する。

use std::sync::Arc;

use axum::{
   body::Body,
   extract::State,
   http::{HeaderName, Method, Request},
   middleware::Next,
   response::Response,
};
use axum_extra::extract::CookieJar;
use relaygate_shared::event_log::error::{category, kind};
use subtle::ConstantTimeEq;

use super::CurrentSession;
use crate::{error::csrf_rejected_response, usecase::SessionService};

#[derive(Clone)]
pub struct CsrfState {
   pub sessions: Arc<SessionService>,
   pub cookie_name: String,
   pub header_name: HeaderName,
}

/// CSRF 検証が必要なメソッドかどうか
fn requires_csrf_validation(method: &Method) -> bool {
   !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

fn reject(reason: &'static str) -> Response {
   tracing::warn!(
      error.category = category::SECURITY,
      error.kind = kind::CSRF_TOKEN,
      reason,
      "CSRF 検証に失敗しました"
   );
   csrf_rejected_response()
}

pub async fn csrf_guard(
   State(state): State<CsrfState>,
   jar: CookieJar,
   request: Request<Body>,
   next: Next,
) -> Response {
   if !requires_csrf_validation(request.method()) {
      return next.run(request).await;
   }

   let Some(provided) = request
      .headers()
      .get(&state.header_name)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string)
   else {
      return reject("header_missing");
   };

   let Some(cookie) = jar.get(&state.cookie_name) else {
      return reject("cookie_missing");
   };
   let cookie_matches: bool = cookie.value().as_bytes().ct_eq(provided.as_bytes()).into();
   if !cookie_matches {
      return reject("cookie_mismatch");
   }

   let session = request
      .extensions()
      .get::<CurrentSession>()
      .and_then(|c| c.0.clone());
   let Some(session) = session else {
      return reject("session_missing");
   };

   match state.sessions.csrf_token(session.id()).await {
      Ok(Some(stored)) if stored.matches(&provided) => next.run(request).await,
      Ok(_) => reject("session_mismatch"),
      Err(e) => {
         tracing::error!(
            error.category = category::INFRASTRUCTURE,
            error.kind = kind::SESSION,
            error = %e,
            "CSRF トークン取得で内部エラー"
         );
         // 検証できない場合も拒否する
         csrf_rejected_response()
      }
   }
}
