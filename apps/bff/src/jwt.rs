//! # JWT 検証
//!
//! ID トークンとバックチャネルログアウトトークンの署名・クレームを検証する。
//!
//! ## 検証の流れ
//!
//! 1. ヘッダーを検証なしでデコードし、`alg` と `kid` を取り出す
//! 2. [`KeySource`] から検証鍵を取得する（JWKS はキャッシュし、未知の `kid` で一度だけ再取得）
//! 3. 署名・`iss`・`aud` を jsonwebtoken で検証する
//! 4. `exp` / `iat` は注入された [`Clock`] に対してリーウェイ付きで検証する
//! 5. トークン種別ごとのクレーム（`nonce`、`events` など）を検証する
//!
//! 時刻検証をライブラリに任せないのは、テストで時計を進めて失効を再現するため。

use std::{
   sync::Arc,
   time::{Duration as StdDuration, Instant},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{
   Algorithm,
   DecodingKey,
   Header,
   Validation,
   jwk::{AlgorithmParameters, JwkSet},
};
use relaygate_domain::{
   authorization::Nonce,
   clock::Clock,
   token::{IdToken, IdTokenClaims},
};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::{client::IdentityProviderClient, provider::Provider};

/// バックチャネルログアウトのイベント種別（OIDC Back-Channel Logout 1.0 §2.4）
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// JWKS で受け付ける署名アルゴリズム（共通鍵系は受け付けない）
const ASYMMETRIC_ALGORITHMS: [Algorithm; 8] = [
   Algorithm::RS256,
   Algorithm::RS384,
   Algorithm::RS512,
   Algorithm::PS256,
   Algorithm::PS384,
   Algorithm::PS512,
   Algorithm::ES256,
   Algorithm::ES384,
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JwtError {
   #[error("JWT の形式が不正です")]
   Malformed,

   #[error("許可されていない署名アルゴリズムです: {0}")]
   UnsupportedAlgorithm(String),

   #[error("JWT ヘッダーに kid がありません")]
   MissingKeyId,

   #[error("未知の kid です: {0}")]
   UnknownKeyId(String),

   #[error("検証鍵を取得できません: {0}")]
   KeysUnavailable(String),

   /// 署名・iss・aud の検証失敗
   #[error("署名またはクレームが不正です: {0}")]
   Invalid(String),

   #[error("トークンの有効期限が切れています")]
   Expired,

   #[error("iat が未来の時刻です")]
   IssuedInFuture,

   #[error("{0} クレームがありません")]
   MissingClaim(&'static str),

   #[error("nonce が一致しません")]
   NonceMismatch,

   #[error("クレームが不正です: {0}")]
   Claims(String),
}

/// ログアウトトークン固有の検証エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogoutTokenError {
   #[error("issuer に対応するプロバイダがありません")]
   UnknownIssuer,

   #[error(transparent)]
   Jwt(#[from] JwtError),

   #[error("events にバックチャネルログアウトイベントがありません")]
   MissingEvent,

   #[error("sub と sid のどちらもありません")]
   MissingSubject,

   #[error("ログアウトトークンに nonce を含めてはいけません")]
   NoncePresent,
}

/// 検証済みログアウトトークンのクレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutTokenClaims {
   pub issuer: String,
   pub subject: Option<String>,
   pub session_id: Option<String>,
}

/// 検証鍵の取得元
#[async_trait]
pub trait KeySource: Send + Sync {
   /// ヘッダーの `alg` / `kid` に対応する検証鍵を返す
   ///
   /// 取得元が許可しないアルゴリズムは `UnsupportedAlgorithm`。
   async fn decoding_key(&self, provider: &Provider, header: &Header) -> Result<DecodingKey, JwtError>;
}

struct CachedJwks {
   keys:       JwkSet,
   fetched_at: Instant,
}

/// プロバイダの JWKS から鍵を取得する
///
/// issuer ごとに `ttl` の間キャッシュする。未知の `kid` を見たときは TTL 内でも一度だけ再取得する
/// （IdP の鍵ローテーション直後に備える）。
pub struct JwksKeySource {
   idp:   Arc<dyn IdentityProviderClient>,
   cache: DashMap<String, CachedJwks>,
   ttl:   StdDuration,
}

impl JwksKeySource {
   pub fn new(idp: Arc<dyn IdentityProviderClient>, ttl: StdDuration) -> Self {
      Self {
         idp,
         cache: DashMap::new(),
         ttl,
      }
   }

   async fn jwks(&self, provider: &Provider, force_refresh: bool) -> Result<JwkSet, JwtError> {
      if !force_refresh
         && let Some(cached) = self.cache.get(&provider.issuer)
         && cached.fetched_at.elapsed() < self.ttl
      {
         return Ok(cached.keys.clone());
      }

      let jwks_uri = provider
         .jwks_uri
         .as_ref()
         .ok_or_else(|| JwtError::KeysUnavailable("jwks_uri が設定されていません".to_string()))?;
      tracing::debug!(provider = %provider.id, "JWKS を取得します");
      let keys = self
         .idp
         .fetch_jwks(jwks_uri)
         .await
         .map_err(|e| JwtError::KeysUnavailable(e.to_string()))?;

      self.cache.insert(
         provider.issuer.clone(),
         CachedJwks {
            keys:       keys.clone(),
            fetched_at: Instant::now(),
         },
      );
      Ok(keys)
   }
}

#[async_trait]
impl KeySource for JwksKeySource {
   async fn decoding_key(&self, provider: &Provider, header: &Header) -> Result<DecodingKey, JwtError> {
      if !ASYMMETRIC_ALGORITHMS.contains(&header.alg) {
         return Err(JwtError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
      }
      let kid = header.kid.as_deref().ok_or(JwtError::MissingKeyId)?;

      let jwks = self.jwks(provider, false).await?;
      if let Some(key) = find_key_in_jwks(&jwks, kid) {
         return Ok(key);
      }

      tracing::debug!(provider = %provider.id, "キャッシュに kid がないため JWKS を再取得します");
      let jwks = self.jwks(provider, true).await?;
      find_key_in_jwks(&jwks, kid).ok_or_else(|| JwtError::UnknownKeyId(kid.to_string()))
   }
}

/// 共通鍵（`oct`）は公開鍵セットから受け付けない
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
   let jwk = jwks.find(kid)?;
   match jwk.algorithm {
      AlgorithmParameters::OctetKey(_) => None,
      _ => DecodingKey::from_jwk(jwk).ok(),
   }
}

/// 単一の固定鍵（テスト・閉域環境の共通鍵署名用）
pub struct StaticKeySource {
   algorithm: Algorithm,
   key:       DecodingKey,
}

impl StaticKeySource {
   pub fn new(algorithm: Algorithm, key: DecodingKey) -> Self {
      Self { algorithm, key }
   }

   pub fn hs256(secret: &[u8]) -> Self {
      Self::new(Algorithm::HS256, DecodingKey::from_secret(secret))
   }
}

#[async_trait]
impl KeySource for StaticKeySource {
   async fn decoding_key(&self, _provider: &Provider, header: &Header) -> Result<DecodingKey, JwtError> {
      if header.alg != self.algorithm {
         return Err(JwtError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
      }
      Ok(self.key.clone())
   }
}

/// 署名検証前のペイロードから `iss` を読む
///
/// 検証に使うプロバイダを選ぶためだけに使う。戻り値を信用してはならない。
pub fn unverified_issuer(token: &str) -> Option<String> {
   let payload = token.split('.').nth(1)?;
   let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
   let claims: Map<String, Value> = serde_json::from_slice(&bytes).ok()?;
   claims.get("iss")?.as_str().map(str::to_string)
}

pub struct TokenVerifier {
   keys:   Arc<dyn KeySource>,
   clock:  Arc<dyn Clock>,
   leeway: Duration,
}

impl TokenVerifier {
   pub fn new(keys: Arc<dyn KeySource>, clock: Arc<dyn Clock>, leeway: Duration) -> Self {
      Self { keys, clock, leeway }
   }

   /// ID トークンを検証して型付きクレームを返す
   ///
   /// `expected_nonce` が `Some` の場合は `nonce` クレームの一致を要求する
   /// （リフレッシュ応答の ID トークンは nonce を持たないため `None` を渡す）。
   pub async fn verify_id_token(
      &self,
      provider: &Provider,
      raw: &IdToken,
      expected_nonce: Option<&Nonce>,
   ) -> Result<IdTokenClaims, JwtError> {
      let claims = self.decode_verified(provider, raw.as_str()).await?;
      let claims = IdTokenClaims::from_claims(&claims, &provider.roles_claim)
         .map_err(|e| JwtError::Claims(e.to_string()))?;

      if claims.issuer() != provider.issuer {
         return Err(JwtError::Invalid("iss が一致しません".to_string()));
      }
      self.check_time(Some(claims.expires_at()), claims.issued_at())?;

      if let Some(expected) = expected_nonce {
         let matches = claims
            .nonce()
            .is_some_and(|nonce| bool::from(nonce.as_bytes().ct_eq(expected.as_str().as_bytes())));
         if !matches {
            return Err(JwtError::NonceMismatch);
         }
      }
      Ok(claims)
   }

   /// バックチャネルログアウトトークンを検証する
   pub async fn verify_logout_token(
      &self,
      provider: &Provider,
      raw: &str,
   ) -> Result<LogoutTokenClaims, LogoutTokenError> {
      let claims = self.decode_verified(provider, raw).await?;

      let issuer = claims
         .get("iss")
         .and_then(Value::as_str)
         .ok_or(JwtError::MissingClaim("iss"))?
         .to_string();
      if !claims.contains_key("aud") {
         return Err(JwtError::MissingClaim("aud").into());
      }
      let issued_at = timestamp(&claims, "iat")?.ok_or(JwtError::MissingClaim("iat"))?;
      self.check_time(timestamp(&claims, "exp")?, Some(issued_at))?;

      let has_event = claims
         .get("events")
         .and_then(Value::as_object)
         .is_some_and(|events| events.contains_key(BACKCHANNEL_LOGOUT_EVENT));
      if !has_event {
         return Err(LogoutTokenError::MissingEvent);
      }
      if claims.contains_key("nonce") {
         return Err(LogoutTokenError::NoncePresent);
      }

      let subject = string_claim(&claims, "sub");
      let session_id = string_claim(&claims, "sid");
      if subject.is_none() && session_id.is_none() {
         return Err(LogoutTokenError::MissingSubject);
      }

      Ok(LogoutTokenClaims {
         issuer,
         subject,
         session_id,
      })
   }

   /// 署名・iss・aud を検証してクレームマップを返す
   async fn decode_verified(&self, provider: &Provider, raw: &str) -> Result<Map<String, Value>, JwtError> {
      let header = jsonwebtoken::decode_header(raw).map_err(|_| JwtError::Malformed)?;
      let key = self.keys.decoding_key(provider, &header).await?;

      let mut validation = Validation::new(header.alg);
      validation.validate_exp = false;
      validation.required_spec_claims.clear();
      validation.set_issuer(&[provider.issuer.as_str()]);
      validation.set_audience(&[provider.client_id.as_str()]);

      jsonwebtoken::decode::<Map<String, Value>>(raw, &key, &validation)
         .map(|data| data.claims)
         .map_err(|e| JwtError::Invalid(e.to_string()))
   }

   fn check_time(
      &self,
      expires_at: Option<DateTime<Utc>>,
      issued_at: Option<DateTime<Utc>>,
   ) -> Result<(), JwtError> {
      let now = self.clock.now();
      if let Some(exp) = expires_at
         && now >= exp + self.leeway
      {
         return Err(JwtError::Expired);
      }
      if let Some(iat) = issued_at
         && iat > now + self.leeway
      {
         return Err(JwtError::IssuedInFuture);
      }
      Ok(())
   }
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
   claims
      .get(name)
      .and_then(Value::as_str)
      .filter(|s| !s.is_empty())
      .map(str::to_string)
}

fn timestamp(claims: &Map<String, Value>, name: &'static str) -> Result<Option<DateTime<Utc>>, JwtError> {
   match claims.get(name) {
      None => Ok(None),
      Some(value) => value
         .as_i64()
         .and_then(|secs| DateTime::from_timestamp(secs, 0))
         .map(Some)
         .ok_or_else(|| JwtError::Claims(format!("{name} が数値ではありません"))),
   }
}

#[cfg(test)]
mod tests {
   use jsonwebtoken::{EncodingKey, encode};
   use relaygate_domain::{authorization::ProviderId, clock::FixedClock};
   use serde_json::json;
   use url::Url;

   use super::*;
   use crate::provider::NewProvider;

   const SECRET: &[u8] = b"test-signing-secret";
   const ISSUER: &str = "https://idp.example.com/realms/main";
   const NOW: i64 = 1_700_000_000;

   fn provider() -> Provider {
      Provider::new(NewProvider {
         id: ProviderId::parse("keycloak").unwrap(),
         label: "Keycloak".to_string(),
         issuer: ISSUER.to_string(),
         client_id: "bff".to_string(),
         client_secret: "secret".to_string(),
         scopes: vec!["openid".to_string()],
         roles_claim: "realm_access.roles".to_string(),
         redirect_uri: Url::parse("https://app.example.com/login/oauth2/code/keycloak").unwrap(),
         authorization_endpoint: Url::parse("https://idp.example.com/auth").unwrap(),
         token_endpoint: Url::parse("https://idp.example.com/token").unwrap(),
         jwks_uri: None,
         end_session_endpoint: None,
      })
   }

   fn verifier_at(now: i64) -> TokenVerifier {
      TokenVerifier::new(
         Arc::new(StaticKeySource::hs256(SECRET)),
         Arc::new(FixedClock::new(DateTime::from_timestamp(now, 0).unwrap())),
         Duration::seconds(60),
      )
   }

   fn sign(claims: &Value) -> String {
      encode(
         &jsonwebtoken::Header::new(Algorithm::HS256),
         claims,
         &EncodingKey::from_secret(SECRET),
      )
      .unwrap()
   }

   fn id_token_claims(nonce: &str) -> Value {
      json!({
         "iss": ISSUER,
         "sub": "alice",
         "aud": "bff",
         "exp": NOW + 300,
         "iat": NOW,
         "nonce": nonce,
         "sid": "idp-session-1",
         "realm_access": { "roles": ["user", "admin"] }
      })
   }

   fn logout_claims() -> Value {
      json!({
         "iss": ISSUER,
         "aud": ["bff"],
         "iat": NOW,
         "jti": "logout-1",
         "sub": "alice",
         "events": { BACKCHANNEL_LOGOUT_EVENT: {} }
      })
   }

   #[tokio::test]
   async fn test_正しいid_tokenを検証できる() {
      let nonce = Nonce::generate();
      let raw = IdToken::new(sign(&id_token_claims(nonce.as_str())));

      let claims = verifier_at(NOW)
         .verify_id_token(&provider(), &raw, Some(&nonce))
         .await
         .unwrap();

      assert_eq!(claims.subject(), "alice");
      assert_eq!(claims.session_id(), Some("idp-session-1"));
      assert_eq!(claims.roles(), ["user", "admin"]);
   }

   #[tokio::test]
   async fn test_nonce不一致は拒否する() {
      let raw = IdToken::new(sign(&id_token_claims("other-nonce")));

      let err = verifier_at(NOW)
         .verify_id_token(&provider(), &raw, Some(&Nonce::generate()))
         .await
         .unwrap_err();

      assert_eq!(err, JwtError::NonceMismatch);
   }

   #[tokio::test]
   async fn test_audが異なるid_tokenは拒否する() {
      let mut claims = id_token_claims("n");
      claims["aud"] = json!("another-client");
      let raw = IdToken::new(sign(&claims));

      let err = verifier_at(NOW)
         .verify_id_token(&provider(), &raw, None)
         .await
         .unwrap_err();

      assert!(matches!(err, JwtError::Invalid(_)));
   }

   #[tokio::test]
   async fn test_issが異なるid_tokenは拒否する() {
      let mut claims = id_token_claims("n");
      claims["iss"] = json!("https://evil.example.com");
      let raw = IdToken::new(sign(&claims));

      let err = verifier_at(NOW)
         .verify_id_token(&provider(), &raw, None)
         .await
         .unwrap_err();

      assert!(matches!(err, JwtError::Invalid(_)));
   }

   #[tokio::test]
   async fn test_リーウェイを超えて期限切れのid_tokenは拒否する() {
      let raw = IdToken::new(sign(&id_token_claims("n")));

      let within_leeway = verifier_at(NOW + 330)
         .verify_id_token(&provider(), &raw, None)
         .await;
      let beyond_leeway = verifier_at(NOW + 360)
         .verify_id_token(&provider(), &raw, None)
         .await;

      assert!(within_leeway.is_ok());
      assert_eq!(beyond_leeway.unwrap_err(), JwtError::Expired);
   }

   #[tokio::test]
   async fn test_別の鍵で署名されたid_tokenは拒否する() {
      let raw = encode(
         &jsonwebtoken::Header::new(Algorithm::HS256),
         &id_token_claims("n"),
         &EncodingKey::from_secret(b"attacker-secret"),
      )
      .unwrap();

      let err = verifier_at(NOW)
         .verify_id_token(&provider(), &IdToken::new(raw), None)
         .await
         .unwrap_err();

      assert!(matches!(err, JwtError::Invalid(_)));
   }

   #[tokio::test]
   async fn test_鍵と異なるアルゴリズムは拒否する() {
      let raw = encode(
         &jsonwebtoken::Header::new(Algorithm::HS512),
         &id_token_claims("n"),
         &EncodingKey::from_secret(SECRET),
      )
      .unwrap();

      let err = verifier_at(NOW)
         .verify_id_token(&provider(), &IdToken::new(raw), None)
         .await
         .unwrap_err();

      assert!(matches!(err, JwtError::UnsupportedAlgorithm(_)));
   }

   #[tokio::test]
   async fn test_正しいログアウトトークンを検証できる() {
      let raw = sign(&logout_claims());

      let claims = verifier_at(NOW)
         .verify_logout_token(&provider(), &raw)
         .await
         .unwrap();

      assert_eq!(
         claims,
         LogoutTokenClaims {
            issuer:     ISSUER.to_string(),
            subject:    Some("alice".to_string()),
            session_id: None,
         }
      );
   }

   #[tokio::test]
   async fn test_eventsのないログアウトトークンは拒否する() {
      let mut claims = logout_claims();
      claims.as_object_mut().unwrap().remove("events");

      let err = verifier_at(NOW)
         .verify_logout_token(&provider(), &sign(&claims))
         .await
         .unwrap_err();

      assert_eq!(err, LogoutTokenError::MissingEvent);
   }

   #[tokio::test]
   async fn test_nonceを含むログアウトトークンは拒否する() {
      let mut claims = logout_claims();
      claims["nonce"] = json!("n");

      let err = verifier_at(NOW)
         .verify_logout_token(&provider(), &sign(&claims))
         .await
         .unwrap_err();

      assert_eq!(err, LogoutTokenError::NoncePresent);
   }

   #[tokio::test]
   async fn test_subもsidもないログアウトトークンは拒否する() {
      let mut claims = logout_claims();
      claims.as_object_mut().unwrap().remove("sub");

      let err = verifier_at(NOW)
         .verify_logout_token(&provider(), &sign(&claims))
         .await
         .unwrap_err();

      assert_eq!(err, LogoutTokenError::MissingSubject);
   }

   #[tokio::test]
   async fn test_iatのないログアウトトークンは拒否する() {
      let mut claims = logout_claims();
      claims.as_object_mut().unwrap().remove("iat");

      let err = verifier_at(NOW)
         .verify_logout_token(&provider(), &sign(&claims))
         .await
         .unwrap_err();

      assert_eq!(err, LogoutTokenError::Jwt(JwtError::MissingClaim("iat")));
   }

   #[tokio::test]
   async fn test_未来に発行されたログアウトトークンは拒否する() {
      let mut claims = logout_claims();
      claims["iat"] = json!(NOW + 600);

      let err = verifier_at(NOW)
         .verify_logout_token(&provider(), &sign(&claims))
         .await
         .unwrap_err();

      assert_eq!(err, LogoutTokenError::Jwt(JwtError::IssuedInFuture));
   }

   #[test]
   fn test_unverified_issuerは署名を検証せずissを読む() {
      let raw = sign(&logout_claims());

      assert_eq!(unverified_issuer(&raw).as_deref(), Some(ISSUER));
      assert_eq!(unverified_issuer("not-a-jwt"), None);
   }
}
