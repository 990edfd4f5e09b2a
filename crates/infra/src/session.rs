//! # セッションストア
//!
//! セッション・TokenSet・CSRF トークンを保持し、主体 / IdP セッション ID からの
//! 逆引きインデックスを管理する。セッションを変更できるのはこのストアだけ。
//!
//! ## Redis キー設計
//!
//! | キー | 値 | TTL |
//! |-----|-----|-----|
//! | `session:{session_id}` | Session (JSON) | 実効期限まで |
//! | `session_tokens:{session_id}` | TokenSet (JSON) | 同上 |
//! | `csrf:{session_id}` | CSRF トークン | 同上 |
//! | `subject_sessions:["{iss}","{sub}"]` | Set<session_id> | 最新セッションの絶対期限まで |
//! | `idp_sessions:["{iss}","{sid}"]` | Set<session_id> | 同上 |
//!
//! ## 原子性
//!
//! - 複数キーにまたがる書き込みは `MULTI/EXEC` で行い、読み手が中途半端な状態を見ない
//! - `touch` と `replace_token_set` は `SET ... XX` で、削除済みセッションを復活させない

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use relaygate_domain::{
   csrf::CsrfToken,
   session::{Session, SessionId, Subject},
   token::TokenSet,
};

use crate::InfraError;

/// セッション検索結果
///
/// 不明・期限切れのセッション ID は例外ではなく `NoSession` として返し、
/// 呼び出し側は匿名と同様に扱う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
   Found(Session),
   NoSession,
}

impl SessionLookup {
   pub fn into_session(self) -> Option<Session> {
      match self {
         Self::Found(session) => Some(session),
         Self::NoSession => None,
      }
   }
}

/// 一括削除で実際に削除されたセッション数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DestroyedSessions(pub usize);

#[async_trait]
pub trait SessionManager: Send + Sync {
   /// セッションを保存する
   ///
   /// CSRF トークン・TokenSet（認証済みの場合）・逆引きインデックスを同時に書き込む。
   async fn create(
      &self,
      session: &Session,
      csrf_token: &CsrfToken,
      tokens: Option<&TokenSet>,
      now: DateTime<Utc>,
   ) -> Result<(), InfraError>;

   /// セッション ID からセッションを解決する
   async fn resolve(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<SessionLookup, InfraError>;

   /// 最終アクセス時刻を更新し、更新後のセッションを返す
   ///
   /// 既に削除されていた場合は何もしない。
   async fn touch(&self, session: &Session, now: DateTime<Utc>) -> Result<Session, InfraError>;

   /// セッション（TokenSet・CSRF トークン含む）を削除する
   ///
   /// 存在していた場合 `true`。存在しない ID の削除も成功とする。
   async fn destroy(&self, session_id: &SessionId) -> Result<bool, InfraError>;

   /// 主体に紐づく全セッションを削除する（バックチャネルログアウト）
   async fn destroy_by_subject(&self, subject: &Subject) -> Result<DestroyedSessions, InfraError>;

   /// IdP セッション ID に紐づく全セッションを削除する（バックチャネルログアウト）
   async fn destroy_by_idp_session(
      &self,
      issuer: &str,
      idp_session_id: &str,
   ) -> Result<DestroyedSessions, InfraError>;

   async fn get_token_set(&self, session_id: &SessionId) -> Result<Option<TokenSet>, InfraError>;

   /// TokenSet を丸ごと置き換える
   ///
   /// セッションが既に削除されていれば書き込まず `false` を返す。
   async fn replace_token_set(&self, session_id: &SessionId, tokens: &TokenSet) -> Result<bool, InfraError>;

   async fn get_csrf_token(&self, session_id: &SessionId) -> Result<Option<CsrfToken>, InfraError>;

   /// ストアの疎通確認（readiness 用）
   async fn ping(&self) -> Result<(), InfraError>;
}

/// ストア TTL をミリ秒に変換する（0 は即時失効扱いになるため最低 1ms）
fn ttl_millis(ttl: std::time::Duration) -> u64 {
   u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

pub struct RedisSessionManager {
   conn: ConnectionManager,
}

impl RedisSessionManager {
   pub fn new(conn: ConnectionManager) -> Self {
      Self { conn }
   }

   /// 接続 URL から作成する
   pub async fn connect(redis_url: &str) -> Result<Self, InfraError> {
      let conn = crate::redis::create_connection_manager(redis_url).await?;
      Ok(Self::new(conn))
   }

   fn session_key(session_id: &SessionId) -> String {
      format!("session:{}", session_id.as_str())
   }

   fn tokens_key(session_id: &SessionId) -> String {
      format!("session_tokens:{}", session_id.as_str())
   }

   fn csrf_key(session_id: &SessionId) -> String {
      format!("csrf:{}", session_id.as_str())
   }

   /// issuer と値の組を曖昧さなくキー化する
   fn index_key(prefix: &str, issuer: &str, value: &str) -> Result<String, InfraError> {
      let suffix = serde_json::to_string(&[issuer, value])?;
      Ok(format!("{prefix}:{suffix}"))
   }

   fn subject_index_key(subject: &Subject) -> Result<String, InfraError> {
      Self::index_key("subject_sessions", subject.issuer(), subject.subject())
   }

   fn idp_session_index_key(issuer: &str, idp_session_id: &str) -> Result<String, InfraError> {
      Self::index_key("idp_sessions", issuer, idp_session_id)
   }

   async fn load_session(&self, session_id: &SessionId) -> Result<Option<Session>, InfraError> {
      let mut conn = self.conn.clone();
      let json: Option<String> = conn.get(Self::session_key(session_id)).await?;
      json.map(|json| serde_json::from_str(&json))
         .transpose()
         .map_err(InfraError::from)
   }

   async fn destroy_indexed(&self, index_key: &str) -> Result<DestroyedSessions, InfraError> {
      let mut conn = self.conn.clone();
      let members: Vec<String> = conn.smembers(index_key).await?;

      let mut destroyed = 0;
      // destroy が SREM しない要素（形式外・失効済み）
      let mut stale = Vec::new();
      for member in members {
         let Some(session_id) = SessionId::parse(&member) else {
            stale.push(member);
            continue;
         };
         if self.destroy(&session_id).await? {
            destroyed += 1;
         } else {
            stale.push(member);
         }
      }

      // 読み取った要素だけを外す（SMEMBERS 以降に作成されたセッションは索引に残る）
      if !stale.is_empty() {
         let _: () = conn.srem(index_key, stale).await?;
      }
      Ok(DestroyedSessions(destroyed))
   }
}

#[async_trait]
impl SessionManager for RedisSessionManager {
   async fn create(
      &self,
      session: &Session,
      csrf_token: &CsrfToken,
      tokens: Option<&TokenSet>,
      now: DateTime<Utc>,
   ) -> Result<(), InfraError> {
      let ttl = session
         .remaining_ttl(now)
         .ok_or_else(|| InfraError::unexpected("期限切れのセッションは保存できません"))?;
      let ttl_ms = ttl_millis(ttl);
      let id = session.id();

      let mut pipe = redis::pipe();
      pipe.atomic();
      pipe.cmd("SET")
         .arg(Self::session_key(id))
         .arg(serde_json::to_string(session)?)
         .arg("PX")
         .arg(ttl_ms)
         .ignore();
      pipe.cmd("SET")
         .arg(Self::csrf_key(id))
         .arg(csrf_token.as_str())
         .arg("PX")
         .arg(ttl_ms)
         .ignore();
      if let Some(tokens) = tokens {
         pipe.cmd("SET")
            .arg(Self::tokens_key(id))
            .arg(serde_json::to_string(tokens)?)
            .arg("PX")
            .arg(ttl_ms)
            .ignore();
      }

      if let Some(principal) = session.principal() {
         let index_ttl_ms = (session.absolute_expiry() - now)
            .to_std()
            .map(ttl_millis)
            .unwrap_or(ttl_ms);
         let mut index_keys = vec![Self::subject_index_key(principal.subject())?];
         if let Some(sid) = principal.idp_session_id() {
            index_keys.push(Self::idp_session_index_key(principal.subject().issuer(), sid)?);
         }
         for key in index_keys {
            pipe.cmd("SADD").arg(&key).arg(id.as_str()).ignore();
            pipe.cmd("PEXPIRE").arg(&key).arg(index_ttl_ms).ignore();
         }
      }

      let mut conn = self.conn.clone();
      pipe.query_async::<()>(&mut conn).await?;
      Ok(())
   }

   async fn resolve(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<SessionLookup, InfraError> {
      let lookup = match self.load_session(session_id).await? {
         Some(session) if !session.is_expired(now) => SessionLookup::Found(session),
         _ => SessionLookup::NoSession,
      };
      Ok(lookup)
   }

   async fn touch(&self, session: &Session, now: DateTime<Utc>) -> Result<Session, InfraError> {
      let touched = session.clone().touched(now);
      let Some(ttl) = touched.remaining_ttl(now) else {
         return Ok(touched);
      };
      let ttl_ms = ttl_millis(ttl);
      let id = touched.id();

      let mut pipe = redis::pipe();
      pipe.atomic();
      pipe.cmd("SET")
         .arg(Self::session_key(id))
         .arg(serde_json::to_string(&touched)?)
         .arg("XX")
         .arg("PX")
         .arg(ttl_ms)
         .ignore();
      pipe.cmd("PEXPIRE").arg(Self::tokens_key(id)).arg(ttl_ms).ignore();
      pipe.cmd("PEXPIRE").arg(Self::csrf_key(id)).arg(ttl_ms).ignore();

      let mut conn = self.conn.clone();
      pipe.query_async::<()>(&mut conn).await?;
      Ok(touched)
   }

   async fn destroy(&self, session_id: &SessionId) -> Result<bool, InfraError> {
      let session = self.load_session(session_id).await?;

      let mut pipe = redis::pipe();
      pipe.atomic();
      pipe.cmd("DEL")
         .arg(Self::session_key(session_id))
         .arg(Self::tokens_key(session_id))
         .arg(Self::csrf_key(session_id))
         .ignore();
      if let Some(principal) = session.as_ref().and_then(Session::principal) {
         pipe.cmd("SREM")
            .arg(Self::subject_index_key(principal.subject())?)
            .arg(session_id.as_str())
            .ignore();
         if let Some(sid) = principal.idp_session_id() {
            pipe.cmd("SREM")
               .arg(Self::idp_session_index_key(principal.subject().issuer(), sid)?)
               .arg(session_id.as_str())
               .ignore();
         }
      }

      let mut conn = self.conn.clone();
      pipe.query_async::<()>(&mut conn).await?;
      Ok(session.is_some())
   }

   async fn destroy_by_subject(&self, subject: &Subject) -> Result<DestroyedSessions, InfraError> {
      self.destroy_indexed(&Self::subject_index_key(subject)?).await
   }

   async fn destroy_by_idp_session(
      &self,
      issuer: &str,
      idp_session_id: &str,
   ) -> Result<DestroyedSessions, InfraError> {
      self.destroy_indexed(&Self::idp_session_index_key(issuer, idp_session_id)?)
         .await
   }

   async fn get_token_set(&self, session_id: &SessionId) -> Result<Option<TokenSet>, InfraError> {
      let mut conn = self.conn.clone();
      let json: Option<String> = conn.get(Self::tokens_key(session_id)).await?;
      json.map(|json| serde_json::from_str(&json))
         .transpose()
         .map_err(InfraError::from)
   }

   async fn replace_token_set(&self, session_id: &SessionId, tokens: &TokenSet) -> Result<bool, InfraError> {
      let mut conn = self.conn.clone();
      let reply: Option<String> = redis::cmd("SET")
         .arg(Self::tokens_key(session_id))
         .arg(serde_json::to_string(tokens)?)
         .arg("XX")
         .arg("KEEPTTL")
         .query_async(&mut conn)
         .await?;
      Ok(reply.is_some())
   }

   async fn get_csrf_token(&self, session_id: &SessionId) -> Result<Option<CsrfToken>, InfraError> {
      let mut conn = self.conn.clone();
      let value: Option<String> = conn.get(Self::csrf_key(session_id)).await?;
      Ok(value.map(CsrfToken::new))
   }

   async fn ping(&self) -> Result<(), InfraError> {
      let mut conn = self.conn.clone();
      let _: String = redis::cmd("PING").query_async(&mut conn).await?;
      Ok(())
   }
}
