//! # トークン中継ハンドラ
//!
//! `/api/{*path}` へのリクエストを上流に中継する。
//!
//! 1. ルート表で公開・保護を判定する（公開ルートはセッションに関わらず Bearer なしで中継）
//! 2. 保護ルートは認証済みセッションを要求し、期限が近ければリフレッシュしたアクセストークンを付与する
//! 3. 上流が 401 を返した場合のみ、1 回だけ強制リフレッシュして再送する
//!
//! ブラウザが送ってきた `Authorization` は必ず捨て、ゲートウェイが付与したものだけを上流に渡す。

use std::{net::SocketAddr, sync::Arc};

use axum::{
   Extension,
   body::{Body, Bytes},
   extract::{ConnectInfo, Request, State},
   http::{HeaderName, Method, StatusCode, header, request::Parts},
   response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use relaygate_domain::session::Session;
use relaygate_shared::canonical_log::AuthOutcome;

use super::found;
use crate::{
   client::{
      RelayRequest,
      RelayResponse,
      UpstreamClient,
      upstream::{append_forwarding_headers, sanitize_request_headers, sanitize_response_headers},
   },
   cookie::CookieSettings,
   error::{
      payload_too_large_response,
      refresh_error_response,
      unauthorized_response,
      upstream_error_response,
      with_outcome,
   },
   middleware::CurrentSession,
   route_table::{RouteClass, RouteTable},
   usecase::{RefreshError, TokenService, ValidAccessToken},
};

/// 中継するパスのプレフィックス（上流には除去して渡す）
pub const RELAY_PREFIX: &str = "/api";

pub struct RelayState {
   pub tokens: TokenService,
   pub upstream: Arc<dyn UpstreamClient>,
   pub routes: RouteTable,
   pub cookies: CookieSettings,
   pub csrf_header: HeaderName,
   /// 未認証のブラウザ遷移の行き先（未設定なら 401）
   pub login_redirect_url: Option<String>,
   pub max_body_bytes: usize,
   /// `X-Forwarded-Proto` に設定する値
   pub forwarded_proto: String,
}

/// 中継時の認可状態
struct Credential {
   session: Session,
   token:   ValidAccessToken,
}

pub async fn relay(
   State(state): State<Arc<RelayState>>,
   Extension(current): Extension<CurrentSession>,
   request: Request,
) -> Response {
   let (parts, body) = request.into_parts();

   let credential = match state.routes.classify(parts.uri.path()) {
      RouteClass::Public => None,
      RouteClass::Protected => {
         let Some(session) = current.0.filter(Session::is_authenticated) else {
            return unauthenticated_response(&state, &parts);
         };
         match state.tokens.valid_access_token(&session).await {
            Ok(token) => Some(Credential { session, token }),
            Err(e) => return refresh_failure_response(&state, &e),
         }
      }
   };

   let Ok(body) = axum::body::to_bytes(body, state.max_body_bytes).await else {
      return payload_too_large_response();
   };
   let relay_request = build_relay_request(&state, &parts, body);

   let Some(mut credential) = credential else {
      return match state.upstream.send(&relay_request, None).await {
         Ok(response) => with_outcome(into_client_response(response), AuthOutcome::ANONYMOUS),
         Err(e) => upstream_error_response(&e),
      };
   };

   let mut refreshed = credential.token.refreshed;
   let mut response = match state
      .upstream
      .send(&relay_request, Some(&credential.token.access_token))
      .await
   {
      Ok(response) => response,
      Err(e) => return upstream_error_response(&e),
   };

   // 上流側で失効していた場合の再試行は 1 回まで
   if response.status == StatusCode::UNAUTHORIZED {
      match state
         .tokens
         .force_refresh(&credential.session, &credential.token.access_token)
         .await
      {
         Ok(token) => {
            credential.token = token;
            refreshed = true;
            response = match state
               .upstream
               .send(&relay_request, Some(&credential.token.access_token))
               .await
            {
               Ok(response) => response,
               Err(e) => return upstream_error_response(&e),
            };
         }
         Err(e @ RefreshError::Rejected(_)) => return refresh_failure_response(&state, &e),
         Err(e) => {
            tracing::warn!(error = %e, "上流の 401 後のリフレッシュに失敗しました");
         }
      }
   }

   let outcome = if refreshed {
      AuthOutcome::REFRESHED
   } else {
      AuthOutcome::AUTHENTICATED
   };
   with_outcome(into_client_response(response), outcome)
}

fn build_relay_request(state: &RelayState, parts: &Parts, body: Bytes) -> RelayRequest {
   let path = parts
      .uri
      .path()
      .strip_prefix(RELAY_PREFIX)
      .filter(|rest| !rest.is_empty())
      .unwrap_or("/");
   let path_and_query = match parts.uri.query() {
      Some(query) => format!("{path}?{query}"),
      None => path.to_string(),
   };

   let mut headers = sanitize_request_headers(&parts.headers, &state.csrf_header);
   let client_ip = parts
      .extensions
      .get::<ConnectInfo<SocketAddr>>()
      .map(|info| info.0.ip());
   append_forwarding_headers(
      &mut headers,
      client_ip,
      parts.headers.get(header::HOST),
      &state.forwarded_proto,
   );

   RelayRequest {
      method: parts.method.clone(),
      path_and_query,
      headers,
      body,
   }
}

fn into_client_response(upstream: RelayResponse) -> Response {
   let mut response = Response::new(Body::from(upstream.body));
   *response.status_mut() = upstream.status;
   *response.headers_mut() = sanitize_response_headers(&upstream.headers);
   response
}

/// ブラウザ遷移（HTML を受け付ける GET）かどうか
fn is_browser_navigation(parts: &Parts) -> bool {
   parts.method == Method::GET
      && parts
         .headers
         .get(header::ACCEPT)
         .and_then(|v| v.to_str().ok())
         .is_some_and(|accept| accept.contains("text/html"))
}

fn unauthenticated_response(state: &RelayState, parts: &Parts) -> Response {
   match &state.login_redirect_url {
      Some(url) if is_browser_navigation(parts) => with_outcome(found(url), AuthOutcome::REJECTED),
      _ => unauthorized_response(),
   }
}

/// リフレッシュ失敗時の応答
///
/// `Rejected` の場合セッションは破棄済みなので Cookie も削除する。
fn refresh_failure_response(state: &RelayState, err: &RefreshError) -> Response {
   let response = refresh_error_response(err);
   if !matches!(err, RefreshError::Rejected(_)) {
      return response;
   }
   let jar = CookieJar::new()
      .add(state.cookies.clear_session_cookie())
      .add(state.cookies.clear_csrf_cookie());
   (jar, response).into_response()
}

