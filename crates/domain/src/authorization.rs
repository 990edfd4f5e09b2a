//! # 認可リクエスト
//!
//! IdP へのリダイレクトからコールバックまでの間だけ存在する一時状態。
//!
//! - `state`: CSRF / リプレイ対策。短命の Cookie でブラウザにも結び付ける
//! - `code_verifier`: PKCE（S256）の verifier。試行ごとに生成
//! - `nonce`: ID トークンのリプレイ対策
//!
//! [`PendingAuthorizationRequest`] は一度きりの使用で、コールバック処理の成否に
//! かかわらず取り出した時点でストアから消える。

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::DomainError;

/// プロバイダ ID（設定上の登録名。例: `keycloak`）
///
/// URL パスとストアのキーに使うため、英小文字・数字・`-`・`_` に限定する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
   pub fn parse(value: &str) -> Result<Self, DomainError> {
      let valid = !value.is_empty()
         && value.len() <= 64
         && value.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_'
         });
      if !valid {
         return Err(DomainError::Validation(format!(
            "プロバイダ ID の形式が不正です: {value:?}"
         )));
      }
      Ok(Self(value.to_string()))
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl TryFrom<String> for ProviderId {
   type Error = DomainError;

   fn try_from(value: String) -> Result<Self, Self::Error> {
      Self::parse(&value)
   }
}

impl From<ProviderId> for String {
   fn from(value: ProviderId) -> Self {
      value.0
   }
}

define_random_token! {
   /// OAuth2 `state` パラメータ
   pub struct State { bytes: 32 }
}

define_random_token! {
   /// OIDC `nonce` パラメータ
   pub struct Nonce { bytes: 32 }
}

define_random_token! {
   /// PKCE code verifier
   ///
   /// 48 バイト → 64 文字（RFC 7636 の 43〜128 文字に収まる）。
   pub struct CodeVerifier { bytes: 48 }
}

impl CodeVerifier {
   /// S256 の code challenge を計算する
   pub fn challenge(&self) -> String {
      let digest = Sha256::digest(self.as_str().as_bytes());
      URL_SAFE_NO_PAD.encode(digest)
   }
}

define_secret_string! {
   /// IdP から受け取った認可コード
   pub struct AuthorizationCode;
}

/// ログイン後の戻り先
///
/// 同一オリジンの相対パスのみ受け付ける（オープンリダイレクト対策）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnTarget(String);

impl ReturnTarget {
   /// 外部入力を検証する
   ///
   /// `/` で始まり、`//` や `/\` で始まらず、制御文字・バックスラッシュを含まないこと。
   pub fn parse(value: &str) -> Option<Self> {
      let bytes = value.as_bytes();
      let relative = bytes.first() == Some(&b'/')
         && !matches!(bytes.get(1), Some(b'/' | b'\\'))
         && !value.contains('\\')
         && !value.chars().any(char::is_control);
      relative.then(|| Self(value.to_string()))
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

/// IdP リダイレクトとコールバックを橋渡しする一時状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAuthorizationRequest {
   state:         State,
   code_verifier: CodeVerifier,
   nonce:         Nonce,
   provider_id:   ProviderId,
   return_target: ReturnTarget,
   created_at:    DateTime<Utc>,
   expires_at:    DateTime<Utc>,
}

impl PendingAuthorizationRequest {
   /// 新しい認可リクエストを生成する（state / verifier / nonce は毎回新規）
   pub fn generate(
      provider_id: ProviderId,
      return_target: ReturnTarget,
      ttl: Duration,
      now: DateTime<Utc>,
   ) -> Self {
      Self {
         state: State::generate(),
         code_verifier: CodeVerifier::generate(),
         nonce: Nonce::generate(),
         provider_id,
         return_target,
         created_at: now,
         expires_at: now + ttl,
      }
   }

   pub fn state(&self) -> &State {
      &self.state
   }

   pub fn code_verifier(&self) -> &CodeVerifier {
      &self.code_verifier
   }

   pub fn nonce(&self) -> &Nonce {
      &self.nonce
   }

   pub fn provider_id(&self) -> &ProviderId {
      &self.provider_id
   }

   pub fn return_target(&self) -> &ReturnTarget {
      &self.return_target
   }

   pub fn created_at(&self) -> DateTime<Utc> {
      self.created_at
   }

   pub fn expires_at(&self) -> DateTime<Utc> {
      self.expires_at
   }

   pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
      now >= self.expires_at
   }

   /// ストアに設定する残り TTL
   pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
      (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
   }
}
