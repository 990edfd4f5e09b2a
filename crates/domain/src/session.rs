//! # セッション
//!
//! ブラウザコンテキスト1つ分（匿名または認証済み）を表す。
//! Cookie に載るのは [`SessionId`] だけで、その他の値はすべてサーバー側に保持する。
//!
//! セッションの期限はトークンの期限と独立している:
//!
//! - **絶対期限** (`absolute_expiry`): 作成から一定時間で必ず失効
//! - **アイドル期限**: 最終アクセスから一定時間アクセスがなければ失効
//!
//! 実効期限は両者の早い方。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::authorization::ProviderId;

define_random_token! {
   /// セッション ID
   ///
   /// 256 ビットの乱数。Cookie の値として使う唯一の値。
   pub struct SessionId { bytes: 32 }
}

/// 認証済み主体の識別子
///
/// `sub` は IdP ごとにしか一意でないため、常に issuer とセットで扱う。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
   issuer:  String,
   subject: String,
}

impl Subject {
   pub fn new(issuer: impl Into<String>, subject: impl Into<String>) -> Self {
      Self {
         issuer:  issuer.into(),
         subject: subject.into(),
      }
   }

   pub fn issuer(&self) -> &str {
      &self.issuer
   }

   pub fn subject(&self) -> &str {
      &self.subject
   }
}

/// 認証済みセッションの主体情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
   provider_id:    ProviderId,
   subject:        Subject,
   /// IdP 側のセッション ID（ID トークンの `sid`）
   idp_session_id: Option<String>,
}

impl Principal {
   pub fn new(provider_id: ProviderId, subject: Subject, idp_session_id: Option<String>) -> Self {
      Self {
         provider_id,
         subject,
         idp_session_id,
      }
   }

   pub fn provider_id(&self) -> &ProviderId {
      &self.provider_id
   }

   pub fn subject(&self) -> &Subject {
      &self.subject
   }

   pub fn idp_session_id(&self) -> Option<&str> {
      self.idp_session_id.as_deref()
   }
}

/// セッションの寿命設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLifetime {
   pub idle:     Duration,
   pub absolute: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
   id:                SessionId,
   principal:         Option<Principal>,
   created_at:        DateTime<Utc>,
   last_accessed_at:  DateTime<Utc>,
   absolute_expiry:   DateTime<Utc>,
   idle_timeout_secs: i64,
}

impl Session {
   /// 匿名セッションを作成する
   pub fn anonymous(id: SessionId, lifetime: SessionLifetime, now: DateTime<Utc>) -> Self {
      Self {
         id,
         principal: None,
         created_at: now,
         last_accessed_at: now,
         absolute_expiry: now + lifetime.absolute,
         idle_timeout_secs: lifetime.idle.num_seconds(),
      }
   }

   /// 認証済みセッションを作成する
   ///
   /// ログイン成功時は必ず新しい ID で作り直す（セッション固定攻撃対策）。
   /// 既存の匿名セッションを昇格させるメソッドは提供しない。
   pub fn authenticated(
      id: SessionId,
      principal: Principal,
      lifetime: SessionLifetime,
      now: DateTime<Utc>,
   ) -> Self {
      Self {
         principal: Some(principal),
         ..Self::anonymous(id, lifetime, now)
      }
   }

   pub fn id(&self) -> &SessionId {
      &self.id
   }

   pub fn principal(&self) -> Option<&Principal> {
      self.principal.as_ref()
   }

   pub fn is_authenticated(&self) -> bool {
      self.principal.is_some()
   }

   pub fn created_at(&self) -> DateTime<Utc> {
      self.created_at
   }

   pub fn last_accessed_at(&self) -> DateTime<Utc> {
      self.last_accessed_at
   }

   pub fn absolute_expiry(&self) -> DateTime<Utc> {
      self.absolute_expiry
   }

   /// 実効期限（アイドル期限と絶対期限の早い方）
   pub fn expires_at(&self) -> DateTime<Utc> {
      let idle_expiry = self.last_accessed_at + Duration::seconds(self.idle_timeout_secs);
      idle_expiry.min(self.absolute_expiry)
   }

   pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
      now >= self.expires_at()
   }

   /// 最終アクセス時刻を更新する
   ///
   /// 時刻が巻き戻った場合は更新しない。絶対期限は延長されない。
   pub fn touched(self, now: DateTime<Utc>) -> Self {
      Self {
         last_accessed_at: self.last_accessed_at.max(now),
         ..self
      }
   }

   /// ストアに設定する残り TTL
   ///
   /// 失効済みなら `None`。
   pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
      (self.expires_at() - now)
         .to_std()
         .ok()
         .filter(|d| !d.is_zero())
   }
}
