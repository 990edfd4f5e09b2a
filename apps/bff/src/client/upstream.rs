//! # 上流リソース API クライアント
//!
//! `/api/**` へのリクエストを上流に中継する。
//!
//! 中継時のヘッダー処理:
//!
//! - リクエスト: hop-by-hop ヘッダー・`Host`・`Cookie`・`Authorization`・CSRF ヘッダーを除去し、
//!   `X-Forwarded-*` と `X-Request-Id` を設定する。Bearer はゲートウェイが付与したものだけ
//! - レスポンス: hop-by-hop ヘッダーと `Set-Cookie` を除去する

use std::net::IpAddr;

use async_trait::async_trait;
use axum::{
   body::Bytes,
   http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
};
use relaygate_domain::token::AccessToken;
use relaygate_shared::observability::REQUEST_ID_HEADER;
use thiserror::Error;
use url::Url;

use crate::middleware::request_id::current_request_id;

/// 上流クライアントエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
   /// 接続失敗・プロトコルエラー
   #[error("上流に接続できません: {0}")]
   Unavailable(String),

   /// タイムアウト
   #[error("上流の応答がタイムアウトしました")]
   Timeout,
}

impl From<reqwest::Error> for UpstreamError {
   fn from(err: reqwest::Error) -> Self {
      if err.is_timeout() {
         Self::Timeout
      } else {
         Self::Unavailable(err.to_string())
      }
   }
}

/// 中継するリクエスト（ヘッダーは除去済み）
#[derive(Debug, Clone)]
pub struct RelayRequest {
   pub method: Method,
   /// 上流側のパス + クエリ（`/api` プレフィックス除去済み）
   pub path_and_query: String,
   pub headers: HeaderMap,
   pub body: Bytes,
}

/// 上流の応答
#[derive(Debug, Clone)]
pub struct RelayResponse {
   pub status: StatusCode,
   pub headers: HeaderMap,
   pub body: Bytes,
}

/// 上流クライアントトレイト
#[async_trait]
pub trait UpstreamClient: Send + Sync {
   /// リクエストを送る
   ///
   /// `bearer` が `Some` の場合のみ `Authorization: Bearer` を付与する。
   async fn send(
      &self,
      request: &RelayRequest,
      bearer: Option<&AccessToken>,
   ) -> Result<RelayResponse, UpstreamError>;
}

pub struct ReqwestUpstreamClient {
   base_url: String,
   client:   reqwest::Client,
}

impl ReqwestUpstreamClient {
   /// 上流のリダイレクトは追従せずにブラウザへ返す
   pub fn new(base_url: &Url, timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
      let client = reqwest::Client::builder()
         .timeout(timeout)
         .redirect(reqwest::redirect::Policy::none())
         .build()?;
      Ok(Self {
         base_url: base_url.as_str().trim_end_matches('/').to_string(),
         client,
      })
   }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
   #[tracing::instrument(skip_all, fields(method = %request.method, status = tracing::field::Empty))]
   async fn send(
      &self,
      request: &RelayRequest,
      bearer: Option<&AccessToken>,
   ) -> Result<RelayResponse, UpstreamError> {
      let url = format!("{}{}", self.base_url, request.path_and_query);
      let mut builder = self
         .client
         .request(request.method.clone(), url)
         .headers(request.headers.clone())
         .body(request.body.clone());
      if let Some(token) = bearer {
         builder = builder.bearer_auth(token.as_str());
      }

      let response = builder.send().await?;
      let status = response.status();
      tracing::Span::current().record("status", status.as_u16());
      let headers = response.headers().clone();
      let body = response.bytes().await?;

      Ok(RelayResponse {
         status,
         headers,
         body,
      })
   }
}

/// RFC 9110 §7.6.1 の hop-by-hop ヘッダー
const HOP_BY_HOP: [&str; 8] = [
   "connection",
   "keep-alive",
   "proxy-authenticate",
   "proxy-authorization",
   "te",
   "trailer",
   "transfer-encoding",
   "upgrade",
];

/// `Connection` ヘッダーで列挙されたヘッダー名
fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
   headers
      .get_all(header::CONNECTION)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
      .collect()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
   for name in connection_listed(headers) {
      headers.remove(name);
   }
   for name in HOP_BY_HOP {
      headers.remove(name);
   }
}

/// ブラウザ由来のリクエストヘッダーから上流に渡してよいものだけを残す
pub fn sanitize_request_headers(incoming: &HeaderMap, csrf_header: &HeaderName) -> HeaderMap {
   let mut headers = incoming.clone();
   strip_hop_by_hop(&mut headers);
   for name in [
      header::HOST,
      header::COOKIE,
      header::AUTHORIZATION,
      header::CONTENT_LENGTH,
      HeaderName::from_static("forwarded"),
      HeaderName::from_static("x-forwarded-for"),
      HeaderName::from_static("x-forwarded-host"),
      HeaderName::from_static("x-forwarded-proto"),
      HeaderName::from_static(REQUEST_ID_HEADER),
   ] {
      headers.remove(name);
   }
   headers.remove(csrf_header);
   headers
}

/// 上流の応答ヘッダーからブラウザに返してよいものだけを残す
pub fn sanitize_response_headers(incoming: &HeaderMap) -> HeaderMap {
   let mut headers = incoming.clone();
   strip_hop_by_hop(&mut headers);
   headers.remove(header::SET_COOKIE);
   headers.remove(header::CONTENT_LENGTH);
   headers
}

/// `X-Forwarded-*` と `X-Request-Id` を設定する
pub fn append_forwarding_headers(
   headers: &mut HeaderMap,
   client_ip: Option<IpAddr>,
   original_host: Option<&HeaderValue>,
   proto: &str,
) {
   if let Some(ip) = client_ip
      && let Ok(value) = HeaderValue::from_str(&ip.to_string())
   {
      headers.insert(HeaderName::from_static("x-forwarded-for"), value);
   }
   if let Some(host) = original_host {
      headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
   }
   if let Ok(value) = HeaderValue::from_str(proto) {
      headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
   }
   if let Some(id) = current_request_id()
      && let Ok(value) = HeaderValue::from_str(&id)
   {
      headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
   }
}
