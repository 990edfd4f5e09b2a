//! # セッション解決ミドルウェア
//!
//! Cookie のセッション ID を解決し、[`CurrentSession`] としてリクエスト拡張に積む。
//!
//! - 有効なセッションがない安全メソッドのリクエストでは、匿名セッションと CSRF トークンを発行し
//!   レスポンスで Cookie を設定する（`create_anonymous` が有効なルートのみ）
//! - [`touch_session`] は認証済みセッションの最終アクセス時刻を更新する

use std::sync::Arc;

use axum::{
   body::Body,
   extract::State,
   http::{Method, Request},
   middleware::Next,
   response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use relaygate_domain::session::Session;

use crate::{cookie::CookieSettings, error::store_error_response, usecase::SessionService};

/// 解決済みのセッション（`None` は匿名かつセッションなし）
#[derive(Debug, Clone, Default)]
pub struct CurrentSession(pub Option<Session>);

#[derive(Clone)]
pub struct SessionLayerState {
   pub sessions: Arc<SessionService>,
   pub cookies: CookieSettings,
   /// セッションがないとき匿名セッションを発行するか
   pub create_anonymous: bool,
}

fn is_safe_method(method: &Method) -> bool {
   matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub async fn resolve_session(
   State(state): State<SessionLayerState>,
   jar: CookieJar,
   mut request: Request<Body>,
   next: Next,
) -> Response {
   let raw = jar.get(&state.cookies.session_cookie_name).map(|c| c.value().to_string());
   let session = match state.sessions.resolve(raw.as_deref()).await {
      Ok(session) => session,
      Err(e) => return store_error_response("セッションの解決に失敗しました", &e),
   };

   if session.is_some() || !state.create_anonymous || !is_safe_method(request.method()) {
      request.extensions_mut().insert(CurrentSession(session));
      return next.run(request).await;
   }

   let issued = match state.sessions.create_anonymous().await {
      Ok(issued) => issued,
      Err(e) => return store_error_response("匿名セッションの作成に失敗しました", &e),
   };
   request
      .extensions_mut()
      .insert(CurrentSession(Some(issued.session.clone())));

   let response = next.run(request).await;
   let jar = CookieJar::new()
      .add(state.cookies.session_cookie(issued.session.id()))
      .add(state.cookies.csrf_cookie(&issued.csrf_token));
   (jar, response).into_response()
}

/// 認証済みセッションの最終アクセス時刻を更新する
///
/// [`resolve_session`] の内側に配置する。
pub async fn touch_session(
   State(sessions): State<Arc<SessionService>>,
   mut request: Request<Body>,
   next: Next,
) -> Response {
   let current = request
      .extensions()
      .get::<CurrentSession>()
      .and_then(|c| c.0.clone());

   if let Some(session) = current.filter(Session::is_authenticated) {
      match sessions.touch(&session).await {
         Ok(touched) => {
            request.extensions_mut().insert(CurrentSession(Some(touched)));
         }
         Err(e) => return store_error_response("セッションの更新に失敗しました", &e),
      }
   }

   next.run(request).await
}
