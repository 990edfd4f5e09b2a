//! # プロバイダレジストリ
//!
//! 設定された IdP を、エンドポイント解決済みの [`Provider`] として保持する。
//! 起動時に一度だけ構築し、以降は不変。

use std::sync::Arc;

use relaygate_domain::{
   authorization::{PendingAuthorizationRequest, ProviderId},
   token::IdToken,
};
use thiserror::Error;
use url::Url;

use crate::{
   client::{IdentityProviderClient, IdentityProviderError},
   config::{BffConfig, ConfigError, ProviderConfig},
};

/// エンドポイント解決済みの IdP
#[derive(Clone)]
pub struct Provider {
   pub id: ProviderId,
   pub label: String,
   pub issuer: String,
   pub client_id: String,
   client_secret: String,
   pub scopes: Vec<String>,
   pub roles_claim: String,
   pub redirect_uri: Url,
   pub authorization_endpoint: Url,
   pub token_endpoint: Url,
   pub jwks_uri: Option<Url>,
   pub end_session_endpoint: Option<Url>,
}

impl std::fmt::Debug for Provider {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Provider")
         .field("id", &self.id)
         .field("issuer", &self.issuer)
         .field("client_id", &self.client_id)
         .field("client_secret", &"[REDACTED]")
         .field("redirect_uri", &self.redirect_uri.as_str())
         .finish_non_exhaustive()
   }
}

/// [`Provider`] 構築パラメータ
pub struct NewProvider {
   pub id: ProviderId,
   pub label: String,
   pub issuer: String,
   pub client_id: String,
   pub client_secret: String,
   pub scopes: Vec<String>,
   pub roles_claim: String,
   pub redirect_uri: Url,
   pub authorization_endpoint: Url,
   pub token_endpoint: Url,
   pub jwks_uri: Option<Url>,
   pub end_session_endpoint: Option<Url>,
}

impl Provider {
   pub fn new(params: NewProvider) -> Self {
      Self {
         id: params.id,
         label: params.label,
         issuer: params.issuer,
         client_id: params.client_id,
         client_secret: params.client_secret,
         scopes: params.scopes,
         roles_claim: params.roles_claim,
         redirect_uri: params.redirect_uri,
         authorization_endpoint: params.authorization_endpoint,
         token_endpoint: params.token_endpoint,
         jwks_uri: params.jwks_uri,
         end_session_endpoint: params.end_session_endpoint,
      }
   }

   pub fn client_secret(&self) -> &str {
      &self.client_secret
   }

   /// 認可エンドポイントへのリダイレクト URL（PKCE S256 + nonce）
   pub fn authorization_url(&self, request: &PendingAuthorizationRequest) -> Url {
      let mut url = self.authorization_endpoint.clone();
      url.query_pairs_mut()
         .append_pair("response_type", "code")
         .append_pair("client_id", &self.client_id)
         .append_pair("redirect_uri", self.redirect_uri.as_str())
         .append_pair("scope", &self.scopes.join(" "))
         .append_pair("state", request.state().as_str())
         .append_pair("nonce", request.nonce().as_str())
         .append_pair("code_challenge", &request.code_verifier().challenge())
         .append_pair("code_challenge_method", "S256");
      url
   }

   /// RP-Initiated Logout の URL
   ///
   /// end_session_endpoint が未設定なら `None`。
   pub fn end_session_url(&self, id_token_hint: Option<&IdToken>, post_logout_redirect_uri: &Url) -> Option<Url> {
      let mut url = self.end_session_endpoint.clone()?;
      {
         let mut query = url.query_pairs_mut();
         if let Some(hint) = id_token_hint {
            query.append_pair("id_token_hint", hint.as_str());
         }
         query
            .append_pair("client_id", &self.client_id)
            .append_pair("post_logout_redirect_uri", post_logout_redirect_uri.as_str());
      }
      Some(url)
   }
}

/// プロバイダ解決エラー
#[derive(Debug, Error)]
pub enum ProviderResolutionError {
   #[error(transparent)]
   Config(#[from] ConfigError),

   #[error("{provider} の Discovery に失敗しました: {source}")]
   Discovery {
      provider: ProviderId,
      #[source]
      source:   IdentityProviderError,
   },
}

#[derive(Debug, Default)]
pub struct ProviderRegistry {
   providers: Vec<Arc<Provider>>,
}

impl ProviderRegistry {
   pub fn new(providers: Vec<Provider>) -> Self {
      Self {
         providers: providers.into_iter().map(Arc::new).collect(),
      }
   }

   /// 設定からレジストリを構築する
   ///
   /// 認可・トークンエンドポイントのどちらかが未設定のプロバイダは Discovery で補完する。
   /// 明示設定された値は Discovery の値より優先する。
   pub async fn resolve(
      config: &BffConfig,
      idp: &dyn IdentityProviderClient,
   ) -> Result<Self, ProviderResolutionError> {
      let mut providers = Vec::with_capacity(config.providers.len());
      for provider_config in &config.providers {
         let redirect_uri = config.redirect_uri(&provider_config.id)?;
         providers.push(resolve_one(provider_config, redirect_uri, idp).await?);
      }
      Ok(Self::new(providers))
   }

   pub fn get(&self, id: &ProviderId) -> Option<Arc<Provider>> {
      self.providers.iter().find(|p| &p.id == id).cloned()
   }

   pub fn find_by_issuer(&self, issuer: &str) -> Option<Arc<Provider>> {
      self.providers.iter().find(|p| p.issuer == issuer).cloned()
   }

   /// 設定順に列挙する
   pub fn iter(&self) -> impl Iterator<Item = &Arc<Provider>> {
      self.providers.iter()
   }
}

async fn resolve_one(
   config: &ProviderConfig,
   redirect_uri: Url,
   idp: &dyn IdentityProviderClient,
) -> Result<Provider, ProviderResolutionError> {
   let (authorization_endpoint, token_endpoint, jwks_uri, end_session_endpoint) =
      match (&config.authorization_endpoint, &config.token_endpoint) {
         (Some(authorization), Some(token)) => (
            authorization.clone(),
            token.clone(),
            config.jwks_uri.clone(),
            config.end_session_endpoint.clone(),
         ),
         _ => {
            let document = idp.discover(&config.issuer).await.map_err(|source| {
               ProviderResolutionError::Discovery {
                  provider: config.id.clone(),
                  source,
               }
            })?;
            tracing::info!(provider = %config.id, "Discovery でエンドポイントを解決しました");
            (
               config
                  .authorization_endpoint
                  .clone()
                  .unwrap_or(document.authorization_endpoint),
               config.token_endpoint.clone().unwrap_or(document.token_endpoint),
               config.jwks_uri.clone().or(document.jwks_uri),
               config
                  .end_session_endpoint
                  .clone()
                  .or(document.end_session_endpoint),
            )
         }
      };

   Ok(Provider::new(NewProvider {
      id: config.id.clone(),
      label: config.label.clone(),
      issuer: config.issuer.clone(),
      client_id: config.client_id.clone(),
      client_secret: config.client_secret.clone(),
      scopes: config.scopes.clone(),
      roles_claim: config.roles_claim.clone(),
      redirect_uri,
      authorization_endpoint,
      token_endpoint,
      jwks_uri,
      end_session_endpoint,
   }))
}
