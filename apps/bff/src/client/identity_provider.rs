//! # Identity Provider クライアント
//!
//! IdP の OAuth2 / OIDC エンドポイントとの通信を担当する。
//!
//! ## エンドポイント
//!
//! - トークンエンドポイント: `authorization_code` / `refresh_token` グラント
//! - Discovery: `{issuer}/.well-known/openid-configuration`
//! - JWKS: ID トークン・ログアウトトークンの署名検証鍵
//!
//! クライアント認証は `client_secret_basic`（RFC 6749 §2.3.1）。

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use relaygate_domain::{
   authorization::{AuthorizationCode, CodeVerifier},
   token::{AccessToken, IdToken, RefreshToken},
};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{middleware::request_id::inject_request_id, provider::Provider};

/// IdP クライアントエラー
///
/// IdP が返したエラー説明文（`error_description`）は保持しない。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityProviderError {
   /// グラントが無効（コード使用済み・リフレッシュトークン失効など）
   #[error("IdP がグラントを拒否しました")]
   InvalidGrant,

   /// その他の 4xx
   #[error("IdP がリクエストを拒否しました（{status}: {error}）")]
   Rejected { status: u16, error: String },

   /// 接続失敗・タイムアウト・5xx
   #[error("IdP に接続できません: {0}")]
   Unavailable(String),

   /// 応答を解釈できない
   #[error("IdP の応答が不正です: {0}")]
   InvalidResponse(String),
}

impl IdentityProviderError {
   /// 時間をおけば成功しうるか
   pub fn is_retryable(&self) -> bool {
      matches!(self, Self::Unavailable(_))
   }
}

impl From<reqwest::Error> for IdentityProviderError {
   fn from(err: reqwest::Error) -> Self {
      if err.is_connect() || err.is_timeout() || err.is_request() {
         Self::Unavailable(err.to_string())
      } else {
         Self::InvalidResponse(err.to_string())
      }
   }
}

/// トークンエンドポイントの成功応答
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
   pub access_token: AccessToken,
   #[serde(default)]
   pub token_type: Option<String>,
   #[serde(default)]
   pub expires_in: Option<i64>,
   #[serde(default)]
   pub refresh_token: Option<RefreshToken>,
   #[serde(default)]
   pub id_token: Option<IdToken>,
   #[serde(default)]
   pub scope: Option<String>,
}

/// OpenID Provider Metadata のうち使用する項目
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DiscoveryDocument {
   pub issuer: String,
   pub authorization_endpoint: Url,
   pub token_endpoint: Url,
   #[serde(default)]
   pub jwks_uri: Option<Url>,
   #[serde(default)]
   pub end_session_endpoint: Option<Url>,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
   error: String,
}

/// IdP クライアントトレイト
///
/// テスト時にスタブ IdP を使用できるようトレイトで定義。
#[async_trait]
pub trait IdentityProviderClient: Send + Sync {
   /// 認可コードをトークンに交換する
   async fn exchange_code(
      &self,
      provider: &Provider,
      code: &AuthorizationCode,
      code_verifier: &CodeVerifier,
   ) -> Result<TokenResponse, IdentityProviderError>;

   /// リフレッシュトークンで新しいトークンを取得する
   async fn refresh(
      &self,
      provider: &Provider,
      refresh_token: &RefreshToken,
   ) -> Result<TokenResponse, IdentityProviderError>;

   /// Provider Metadata を取得する
   async fn discover(&self, issuer: &str) -> Result<DiscoveryDocument, IdentityProviderError>;

   /// JWKS を取得する
   async fn fetch_jwks(&self, jwks_uri: &Url) -> Result<JwkSet, IdentityProviderError>;
}

/// reqwest による IdP クライアント実装
pub struct ReqwestIdentityProviderClient {
   client:           reqwest::Client,
   exchange_timeout: Duration,
   refresh_timeout:  Duration,
}

impl ReqwestIdentityProviderClient {
   /// 全リクエストに `timeout` を適用するクライアントを作成する
   pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
      let client = reqwest::Client::builder().timeout(timeout).build()?;
      Ok(Self {
         client,
         exchange_timeout: timeout,
         refresh_timeout: timeout,
      })
   }

   /// コード交換とリフレッシュのタイムアウトを個別に設定する
   #[must_use]
   pub fn with_token_timeouts(mut self, exchange: Duration, refresh: Duration) -> Self {
      self.exchange_timeout = exchange;
      self.refresh_timeout = refresh;
      self
   }

   async fn token_request(
      &self,
      provider: &Provider,
      form: &[(&str, &str)],
      timeout: Duration,
   ) -> Result<TokenResponse, IdentityProviderError> {
      let request = self
         .client
         .post(provider.token_endpoint.clone())
         .timeout(timeout)
         .basic_auth(
            form_encode(&provider.client_id),
            Some(form_encode(provider.client_secret())),
         )
         .header(ACCEPT, "application/json")
         .form(form);
      let response = inject_request_id(request).send().await?;

      let status = response.status();
      if status.is_success() {
         return response
            .json::<TokenResponse>()
            .await
            .map_err(|e| IdentityProviderError::InvalidResponse(e.to_string()));
      }
      if status.is_server_error() {
         return Err(IdentityProviderError::Unavailable(format!(
            "トークンエンドポイントがステータス {status} を返しました"
         )));
      }

      let error = response
         .json::<OAuthErrorBody>()
         .await
         .map(|body| body.error)
         .unwrap_or_else(|_| "unknown".to_string());
      if error == "invalid_grant" {
         Err(IdentityProviderError::InvalidGrant)
      } else {
         Err(IdentityProviderError::Rejected {
            status: status.as_u16(),
            error,
         })
      }
   }

   async fn get_json<T>(&self, url: Url) -> Result<T, IdentityProviderError>
   where
      T: serde::de::DeserializeOwned,
   {
      let request = self.client.get(url).header(ACCEPT, "application/json");
      let response = inject_request_id(request).send().await?;

      let status = response.status();
      if !status.is_success() {
         return Err(IdentityProviderError::Unavailable(format!(
            "ステータス {status} が返されました"
         )));
      }
      response
         .json::<T>()
         .await
         .map_err(|e| IdentityProviderError::InvalidResponse(e.to_string()))
   }
}

#[async_trait]
impl IdentityProviderClient for ReqwestIdentityProviderClient {
   #[tracing::instrument(skip_all, fields(provider = %provider.id))]
   async fn exchange_code(
      &self,
      provider: &Provider,
      code: &AuthorizationCode,
      code_verifier: &CodeVerifier,
   ) -> Result<TokenResponse, IdentityProviderError> {
      self.token_request(
         provider,
         &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", provider.redirect_uri.as_str()),
            ("code_verifier", code_verifier.as_str()),
            ("client_id", provider.client_id.as_str()),
         ],
         self.exchange_timeout,
      )
      .await
   }

   #[tracing::instrument(skip_all, fields(provider = %provider.id))]
   async fn refresh(
      &self,
      provider: &Provider,
      refresh_token: &RefreshToken,
   ) -> Result<TokenResponse, IdentityProviderError> {
      self.token_request(
         provider,
         &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", provider.client_id.as_str()),
         ],
         self.refresh_timeout,
      )
      .await
   }

   #[tracing::instrument(skip(self))]
   async fn discover(&self, issuer: &str) -> Result<DiscoveryDocument, IdentityProviderError> {
      let url = discovery_url(issuer)?;
      let document: DiscoveryDocument = self.get_json(url).await?;

      // OIDC Discovery 1.0 §4.3: issuer は設定値と完全一致すること
      if document.issuer != issuer {
         return Err(IdentityProviderError::InvalidResponse(format!(
            "issuer が一致しません（{}）",
            document.issuer
         )));
      }
      Ok(document)
   }

   #[tracing::instrument(skip_all, fields(jwks_uri = %jwks_uri))]
   async fn fetch_jwks(&self, jwks_uri: &Url) -> Result<JwkSet, IdentityProviderError> {
      self.get_json(jwks_uri.clone()).await
   }
}

/// `{issuer}/.well-known/openid-configuration`
fn discovery_url(issuer: &str) -> Result<Url, IdentityProviderError> {
   let url = format!(
      "{}/.well-known/openid-configuration",
      issuer.trim_end_matches('/')
   );
   Url::parse(&url).map_err(|e| IdentityProviderError::InvalidResponse(e.to_string()))
}

/// Basic 認証に載せる前に form-urlencode する（RFC 6749 §2.3.1）
fn form_encode(value: &str) -> String {
   url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
