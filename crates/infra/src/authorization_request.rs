//! # 認可リクエストストア
//!
//! `/oauth2/authorization/{provider}` で生成した PKCE verifier・nonce・戻り先を
//! state をキーに保持し、コールバックで一度だけ取り出す。
//!
//! ## Redis キー設計
//!
//! - キー: `auth_request:{state}`
//! - 値: PendingAuthorizationRequest (JSON)
//! - TTL: 認可リクエストの有効期限まで
//!
//! 取り出しは `GETDEL` で行い、同じ state による二度目のコールバックは必ず失敗する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use relaygate_domain::authorization::{PendingAuthorizationRequest, State};

use crate::InfraError;

#[async_trait]
pub trait AuthorizationRequestStore: Send + Sync {
   /// 認可リクエストを保存する
   ///
   /// 同じ state が既に存在する場合は上書きせずエラーにする。
   async fn save(&self, request: &PendingAuthorizationRequest, now: DateTime<Utc>) -> Result<(), InfraError>;

   /// state に対応する認可リクエストを取り出して削除する
   ///
   /// 未知・使用済みの state は `None`。
   async fn take(&self, state: &State) -> Result<Option<PendingAuthorizationRequest>, InfraError>;
}

pub struct RedisAuthorizationRequestStore {
   conn: ConnectionManager,
}

impl RedisAuthorizationRequestStore {
   pub fn new(conn: ConnectionManager) -> Self {
      Self { conn }
   }

   fn key(state: &State) -> String {
      format!("auth_request:{}", state.as_str())
   }
}

#[async_trait]
impl AuthorizationRequestStore for RedisAuthorizationRequestStore {
   async fn save(&self, request: &PendingAuthorizationRequest, now: DateTime<Utc>) -> Result<(), InfraError> {
      let ttl = request
         .remaining_ttl(now)
         .ok_or_else(|| InfraError::unexpected("期限切れの認可リクエストは保存できません"))?;
      let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

      let mut conn = self.conn.clone();
      let reply: Option<String> = redis::cmd("SET")
         .arg(Self::key(request.state()))
         .arg(serde_json::to_string(request)?)
         .arg("NX")
         .arg("PX")
         .arg(ttl_ms)
         .query_async(&mut conn)
         .await?;

      match reply {
         Some(_) => Ok(()),
         None => Err(InfraError::unexpected("state が衝突しました")),
      }
   }

   async fn take(&self, state: &State) -> Result<Option<PendingAuthorizationRequest>, InfraError> {
      let mut conn = self.conn.clone();
      let json: Option<String> = redis::cmd("GETDEL")
         .arg(Self::key(state))
         .query_async(&mut conn)
         .await?;

      json.map(|json| serde_json::from_str(&json))
         .transpose()
         .map_err(InfraError::from)
   }
}
