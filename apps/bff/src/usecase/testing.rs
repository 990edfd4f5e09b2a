//! ユースケースのテスト用スタブとフィクスチャ

use std::{
   collections::VecDeque,
   sync::{
      Arc,
      Mutex,
      atomic::{AtomicUsize, Ordering},
   },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, jwk::JwkSet};
use relaygate_domain::{
   authorization::{AuthorizationCode, CodeVerifier, ProviderId},
   clock::Clock,
   session::SessionLifetime,
   token::{AccessToken, IdToken, RefreshToken},
};
use serde_json::{Value, json};
use url::Url;

use crate::{
   client::{DiscoveryDocument, IdentityProviderClient, IdentityProviderError, TokenResponse},
   jwt::{StaticKeySource, TokenVerifier},
   provider::{NewProvider, Provider, ProviderRegistry},
};

pub(crate) const ISSUER: &str = "https://idp.example.com/realms/main";
pub(crate) const CLIENT_ID: &str = "bff";
const SIGNING_SECRET: &[u8] = b"usecase-test-secret";

pub(crate) fn epoch() -> DateTime<Utc> {
   DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub(crate) fn lifetime() -> SessionLifetime {
   SessionLifetime {
      idle:     Duration::minutes(30),
      absolute: Duration::hours(8),
   }
}

pub(crate) fn provider() -> Provider {
   Provider::new(NewProvider {
      id: ProviderId::parse("keycloak").unwrap(),
      label: "Keycloak".to_string(),
      issuer: ISSUER.to_string(),
      client_id: CLIENT_ID.to_string(),
      client_secret: "secret".to_string(),
      scopes: vec!["openid".to_string(), "offline_access".to_string()],
      roles_claim: "realm_access.roles".to_string(),
      redirect_uri: Url::parse("https://app.example.com/login/oauth2/code/keycloak").unwrap(),
      authorization_endpoint: Url::parse("https://idp.example.com/auth").unwrap(),
      token_endpoint: Url::parse("https://idp.example.com/token").unwrap(),
      jwks_uri: None,
      end_session_endpoint: Some(Url::parse("https://idp.example.com/logout").unwrap()),
   })
}

pub(crate) fn registry() -> Arc<ProviderRegistry> {
   Arc::new(ProviderRegistry::new(vec![provider()]))
}

pub(crate) fn verifier(clock: Arc<dyn Clock>) -> Arc<TokenVerifier> {
   Arc::new(TokenVerifier::new(
      Arc::new(StaticKeySource::hs256(SIGNING_SECRET)),
      clock,
      Duration::seconds(60),
   ))
}

pub(crate) fn sign(claims: &Value) -> String {
   encode(
      &Header::new(Algorithm::HS256),
      claims,
      &EncodingKey::from_secret(SIGNING_SECRET),
   )
   .unwrap()
}

pub(crate) fn id_token(
   subject: &str,
   nonce: Option<&str>,
   sid: Option<&str>,
   issued_at: DateTime<Utc>,
) -> IdToken {
   let mut claims = json!({
      "iss": ISSUER,
      "sub": subject,
      "aud": CLIENT_ID,
      "iat": issued_at.timestamp(),
      "exp": (issued_at + Duration::minutes(5)).timestamp(),
      "realm_access": { "roles": ["user"] }
   });
   if let Some(nonce) = nonce {
      claims["nonce"] = json!(nonce);
   }
   if let Some(sid) = sid {
      claims["sid"] = json!(sid);
   }
   IdToken::new(sign(&claims))
}

pub(crate) fn token_response(access: &str, refresh: Option<&str>, id_token: Option<IdToken>) -> TokenResponse {
   TokenResponse {
      access_token: AccessToken::new(access),
      token_type: Some("Bearer".to_string()),
      expires_in: Some(300),
      refresh_token: refresh.map(RefreshToken::new),
      id_token,
      scope: Some("openid offline_access".to_string()),
   }
}

type Responses = Mutex<VecDeque<Result<TokenResponse, IdentityProviderError>>>;

/// 応答を順に返し、呼び出し回数を数えるスタブ IdP
#[derive(Default)]
pub(crate) struct StubIdp {
   exchange_results: Responses,
   refresh_results:  Responses,
   exchange_calls:   AtomicUsize,
   refresh_calls:    AtomicUsize,
   refresh_delay:    std::time::Duration,
}

impl StubIdp {
   pub(crate) fn new() -> Self {
      Self::default()
   }

   pub(crate) fn with_refresh_delay(self, delay: std::time::Duration) -> Self {
      Self {
         refresh_delay: delay,
         ..self
      }
   }

   pub(crate) fn push_exchange(&self, result: Result<TokenResponse, IdentityProviderError>) {
      self.exchange_results.lock().unwrap().push_back(result);
   }

   pub(crate) fn push_refresh(&self, result: Result<TokenResponse, IdentityProviderError>) {
      self.refresh_results.lock().unwrap().push_back(result);
   }

   pub(crate) fn exchange_calls(&self) -> usize {
      self.exchange_calls.load(Ordering::SeqCst)
   }

   pub(crate) fn refresh_calls(&self) -> usize {
      self.refresh_calls.load(Ordering::SeqCst)
   }
}

#[async_trait]
impl IdentityProviderClient for StubIdp {
   async fn exchange_code(
      &self,
      _provider: &Provider,
      _code: &AuthorizationCode,
      _code_verifier: &CodeVerifier,
   ) -> Result<TokenResponse, IdentityProviderError> {
      self.exchange_calls.fetch_add(1, Ordering::SeqCst);
      self.exchange_results
         .lock()
         .unwrap()
         .pop_front()
         .unwrap_or(Err(IdentityProviderError::InvalidGrant))
   }

   async fn refresh(
      &self,
      _provider: &Provider,
      _refresh_token: &RefreshToken,
   ) -> Result<TokenResponse, IdentityProviderError> {
      self.refresh_calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(self.refresh_delay).await;
      self.refresh_results
         .lock()
         .unwrap()
         .pop_front()
         .unwrap_or(Err(IdentityProviderError::InvalidGrant))
   }

   async fn discover(&self, _issuer: &str) -> Result<DiscoveryDocument, IdentityProviderError> {
      Err(IdentityProviderError::Unavailable("stub".to_string()))
   }

   async fn fetch_jwks(&self, _jwks_uri: &Url) -> Result<JwkSet, IdentityProviderError> {
      Err(IdentityProviderError::Unavailable("stub".to_string()))
   }
}
