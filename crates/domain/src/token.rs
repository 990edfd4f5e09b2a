//! # TokenSet と ID トークンクレーム
//!
//! IdP から取得した資格情報一式。サーバー側でのみ保持し、ブラウザには一切渡さない。
//!
//! リフレッシュ時は既存の TokenSet を部分更新せず、新しい TokenSet で丸ごと置き換える。
//! IdP がリフレッシュ応答で `refresh_token` / `id_token` を省略した場合のみ、
//! [`TokenSet::rotated`] で前回値を引き継ぐ。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DomainError, session::Subject};

define_secret_string! {
   /// アクセストークン（上流に Bearer として付与する）
   pub struct AccessToken;
}

define_secret_string! {
   /// リフレッシュトークン
   pub struct RefreshToken;
}

define_secret_string! {
   /// ID トークン（生の JWT。RP-initiated logout の `id_token_hint` に使う）
   pub struct IdToken;
}

/// ID トークンから取り出した型付きクレーム
///
/// 毎リクエストで JWT を再パースしないよう、TokenSet にキャッシュされる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
   issuer:             String,
   subject:            String,
   audience:           Vec<String>,
   expires_at:         DateTime<Utc>,
   issued_at:          Option<DateTime<Utc>>,
   nonce:              Option<String>,
   session_id:         Option<String>,
   roles:              Vec<String>,
   name:               Option<String>,
   email:              Option<String>,
   preferred_username: Option<String>,
}

impl IdTokenClaims {
   /// 生のクレームマップから型付きクレームを構築する
   ///
   /// 署名検証済みのペイロードを渡すこと。`roles_claim_path` はドット区切りのパス
   /// （例: `realm_access.roles`）で、空文字ならロールを読まない。
   /// ロールは文字列配列、またはスペース / カンマ区切りの文字列を受け付ける。
   pub fn from_claims(claims: &Map<String, Value>, roles_claim_path: &str) -> Result<Self, DomainError> {
      let issuer = required_str(claims, "iss")?;
      let subject = required_str(claims, "sub")?;
      let expires_at = timestamp(claims, "exp")?
         .ok_or_else(|| DomainError::Validation("exp クレームがありません".to_string()))?;

      let audience = match claims.get("aud") {
         Some(Value::String(aud)) => vec![aud.clone()],
         Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
         _ => return Err(DomainError::Validation("aud クレームがありません".to_string())),
      };

      Ok(Self {
         issuer,
         subject,
         audience,
         expires_at,
         issued_at: timestamp(claims, "iat")?,
         nonce: optional_str(claims, "nonce"),
         session_id: optional_str(claims, "sid"),
         roles: extract_roles(claims, roles_claim_path),
         name: optional_str(claims, "name"),
         email: optional_str(claims, "email"),
         preferred_username: optional_str(claims, "preferred_username"),
      })
   }

   pub fn issuer(&self) -> &str {
      &self.issuer
   }

   pub fn subject(&self) -> &str {
      &self.subject
   }

   /// issuer スコープの主体識別子
   pub fn to_subject(&self) -> Subject {
      Subject::new(&self.issuer, &self.subject)
   }

   pub fn audience(&self) -> &[String] {
      &self.audience
   }

   pub fn expires_at(&self) -> DateTime<Utc> {
      self.expires_at
   }

   pub fn issued_at(&self) -> Option<DateTime<Utc>> {
      self.issued_at
   }

   pub fn nonce(&self) -> Option<&str> {
      self.nonce.as_deref()
   }

   pub fn session_id(&self) -> Option<&str> {
      self.session_id.as_deref()
   }

   pub fn roles(&self) -> &[String] {
      &self.roles
   }

   pub fn name(&self) -> Option<&str> {
      self.name.as_deref()
   }

   pub fn email(&self) -> Option<&str> {
      self.email.as_deref()
   }

   pub fn preferred_username(&self) -> Option<&str> {
      self.preferred_username.as_deref()
   }
}

fn required_str(claims: &Map<String, Value>, name: &str) -> Result<String, DomainError> {
   optional_str(claims, name)
      .filter(|v| !v.is_empty())
      .ok_or_else(|| DomainError::Validation(format!("{name} クレームがありません")))
}

fn optional_str(claims: &Map<String, Value>, name: &str) -> Option<String> {
   claims.get(name).and_then(Value::as_str).map(str::to_string)
}

/// NumericDate（秒、小数可）を読む
fn timestamp(claims: &Map<String, Value>, name: &str) -> Result<Option<DateTime<Utc>>, DomainError> {
   let Some(value) = claims.get(name) else {
      return Ok(None);
   };
   let seconds = value
      .as_i64()
      .or_else(|| value.as_f64().map(|f| f.trunc() as i64))
      .ok_or_else(|| DomainError::Validation(format!("{name} クレームが数値ではありません")))?;
   DateTime::from_timestamp(seconds, 0)
      .map(Some)
      .ok_or_else(|| DomainError::Validation(format!("{name} クレームが範囲外です")))
}

fn extract_roles(claims: &Map<String, Value>, path: &str) -> Vec<String> {
   if path.is_empty() {
      return Vec::new();
   }

   let mut segments = path.split('.');
   let Some(first) = segments.next() else {
      return Vec::new();
   };
   let mut current = claims.get(first);
   for segment in segments {
      current = current.and_then(|v| v.get(segment));
   }

   match current {
      Some(Value::Array(values)) => values
         .iter()
         .filter_map(|v| v.as_str().map(str::to_string))
         .collect(),
      Some(Value::String(joined)) => joined
         .split([' ', ','])
         .filter(|s| !s.is_empty())
         .map(str::to_string)
         .collect(),
      _ => Vec::new(),
   }
}

/// TokenSet 構築パラメータ
pub struct NewTokenSet {
   pub access_token:        AccessToken,
   pub refresh_token:       Option<RefreshToken>,
   pub access_token_expiry: DateTime<Utc>,
   pub id_token:            Option<IdToken>,
   pub id_token_claims:     Option<IdTokenClaims>,
   pub scope:               Option<String>,
}

/// セッションに紐づく資格情報一式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
   access_token:        AccessToken,
   refresh_token:       Option<RefreshToken>,
   access_token_expiry: DateTime<Utc>,
   id_token:            Option<IdToken>,
   id_token_claims:     Option<IdTokenClaims>,
   scope:               Option<String>,
}

impl TokenSet {
   pub fn new(params: NewTokenSet) -> Self {
      Self {
         access_token:        params.access_token,
         refresh_token:       params.refresh_token,
         access_token_expiry: params.access_token_expiry,
         id_token:            params.id_token,
         id_token_claims:     params.id_token_claims,
         scope:               params.scope,
      }
   }

   pub fn access_token(&self) -> &AccessToken {
      &self.access_token
   }

   pub fn refresh_token(&self) -> Option<&RefreshToken> {
      self.refresh_token.as_ref()
   }

   pub fn access_token_expiry(&self) -> DateTime<Utc> {
      self.access_token_expiry
   }

   pub fn id_token(&self) -> Option<&IdToken> {
      self.id_token.as_ref()
   }

   pub fn id_token_claims(&self) -> Option<&IdTokenClaims> {
      self.id_token_claims.as_ref()
   }

   pub fn scope(&self) -> Option<&str> {
      self.scope.as_deref()
   }

   /// 安全マージン内に期限切れになるか
   ///
   /// `true` の間はこのアクセストークンを上流に転送してはならない。
   pub fn needs_refresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
      now + safety_margin >= self.access_token_expiry
   }

   /// リフレッシュ応答で得た TokenSet に置き換える
   ///
   /// 新しい側が省略した `refresh_token` と ID トークン（+ クレーム）のみ前回値を引き継ぐ。
   pub fn rotated(self, next: TokenSet) -> TokenSet {
      let (id_token, id_token_claims) = match next.id_token {
         Some(id_token) => (Some(id_token), next.id_token_claims),
         None => (self.id_token, self.id_token_claims),
      };
      TokenSet {
         access_token: next.access_token,
         refresh_token: next.refresh_token.or(self.refresh_token),
         access_token_expiry: next.access_token_expiry,
         id_token,
         id_token_claims,
         scope: next.scope.or(self.scope),
      }
   }
}
