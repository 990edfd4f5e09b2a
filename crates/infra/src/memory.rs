//! # インメモリストア
//!
//! 単一インスタンス運用・テスト用の [`SessionManager`] / [`AuthorizationRequestStore`] 実装。
//! プロセス再起動でセッションは失われる。
//!
//! TTL は保持せず、読み出し時に期限を判定して失効分を削除する。
//! 読まれないまま残った失効エントリは [`InMemorySessionManager::purge_expired`] で掃除する。

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use relaygate_domain::{
   authorization::{PendingAuthorizationRequest, State},
   csrf::CsrfToken,
   session::{Session, SessionId, Subject},
   token::TokenSet,
};

use crate::{
   AuthorizationRequestStore,
   DestroyedSessions,
   InfraError,
   SessionLookup,
   SessionManager,
};

#[derive(Debug, Clone)]
struct SessionEntry {
   session:    Session,
   tokens:     Option<TokenSet>,
   csrf_token: CsrfToken,
}

/// IdP セッションの索引キー（issuer, sid）
type IdpSessionKey = (String, String);

#[derive(Default)]
pub struct InMemorySessionManager {
   sessions:       DashMap<SessionId, SessionEntry>,
   by_subject:     DashMap<Subject, HashSet<SessionId>>,
   by_idp_session: DashMap<IdpSessionKey, HashSet<SessionId>>,
}

impl InMemorySessionManager {
   pub fn new() -> Self {
      Self::default()
   }

   /// 失効済みセッションを全て削除し、削除件数を返す
   pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
      let expired: Vec<SessionId> = self
         .sessions
         .iter()
         .filter(|entry| entry.session.is_expired(now))
         .map(|entry| entry.key().clone())
         .collect();

      expired.iter().filter(|id| self.remove(id)).count()
   }

   /// 保持しているセッション数（失効済みを含む）
   pub fn len(&self) -> usize {
      self.sessions.len()
   }

   pub fn is_empty(&self) -> bool {
      self.sessions.is_empty()
   }

   fn remove(&self, session_id: &SessionId) -> bool {
      let Some((_, entry)) = self.sessions.remove(session_id) else {
         return false;
      };

      if let Some(principal) = entry.session.principal() {
         unlink(&self.by_subject, principal.subject(), session_id);
         if let Some(sid) = principal.idp_session_id() {
            let key = (principal.subject().issuer().to_string(), sid.to_string());
            unlink(&self.by_idp_session, &key, session_id);
         }
      }
      true
   }

   fn remove_all(&self, ids: Option<HashSet<SessionId>>) -> DestroyedSessions {
      let destroyed = ids
         .unwrap_or_default()
         .iter()
         .filter(|id| self.remove(id))
         .count();
      DestroyedSessions(destroyed)
   }
}

/// 索引から ID を外し、空になった集合は削除する
fn unlink<K>(index: &DashMap<K, HashSet<SessionId>>, key: &K, session_id: &SessionId)
where
   K: std::hash::Hash + Eq,
{
   index.remove_if_mut(key, |_, ids| {
      ids.remove(session_id);
      ids.is_empty()
   });
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
   async fn create(
      &self,
      session: &Session,
      csrf_token: &CsrfToken,
      tokens: Option<&TokenSet>,
      now: DateTime<Utc>,
   ) -> Result<(), InfraError> {
      if session.is_expired(now) {
         return Err(InfraError::unexpected("期限切れのセッションは保存できません"));
      }

      let id = session.id().clone();
      self.sessions.insert(
         id.clone(),
         SessionEntry {
            session:    session.clone(),
            tokens:     tokens.cloned(),
            csrf_token: csrf_token.clone(),
         },
      );

      // 索引への登録はセッション本体の後（生存セッションは必ず索引から辿れる）
      if let Some(principal) = session.principal() {
         self.by_subject
            .entry(principal.subject().clone())
            .or_default()
            .insert(id.clone());
         if let Some(sid) = principal.idp_session_id() {
            self.by_idp_session
               .entry((principal.subject().issuer().to_string(), sid.to_string()))
               .or_default()
               .insert(id);
         }
      }
      Ok(())
   }

   async fn resolve(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<SessionLookup, InfraError> {
      let found = self
         .sessions
         .get(session_id)
         .map(|entry| entry.session.clone());

      let lookup = match found {
         Some(session) if !session.is_expired(now) => SessionLookup::Found(session),
         Some(_) => {
            self.remove(session_id);
            SessionLookup::NoSession
         }
         None => SessionLookup::NoSession,
      };
      Ok(lookup)
   }

   async fn touch(&self, session: &Session, now: DateTime<Utc>) -> Result<Session, InfraError> {
      let touched = session.clone().touched(now);
      if let Some(mut entry) = self.sessions.get_mut(session.id()) {
         entry.session = touched.clone();
      }
      Ok(touched)
   }

   async fn destroy(&self, session_id: &SessionId) -> Result<bool, InfraError> {
      Ok(self.remove(session_id))
   }

   async fn destroy_by_subject(&self, subject: &Subject) -> Result<DestroyedSessions, InfraError> {
      let ids = self.by_subject.remove(subject).map(|(_, ids)| ids);
      Ok(self.remove_all(ids))
   }

   async fn destroy_by_idp_session(
      &self,
      issuer: &str,
      idp_session_id: &str,
   ) -> Result<DestroyedSessions, InfraError> {
      let key = (issuer.to_string(), idp_session_id.to_string());
      let ids = self.by_idp_session.remove(&key).map(|(_, ids)| ids);
      Ok(self.remove_all(ids))
   }

   async fn get_token_set(&self, session_id: &SessionId) -> Result<Option<TokenSet>, InfraError> {
      Ok(self
         .sessions
         .get(session_id)
         .and_then(|entry| entry.tokens.clone()))
   }

   async fn replace_token_set(&self, session_id: &SessionId, tokens: &TokenSet) -> Result<bool, InfraError> {
      match self.sessions.get_mut(session_id) {
         Some(mut entry) => {
            entry.tokens = Some(tokens.clone());
            Ok(true)
         }
         None => Ok(false),
      }
   }

   async fn get_csrf_token(&self, session_id: &SessionId) -> Result<Option<CsrfToken>, InfraError> {
      Ok(self
         .sessions
         .get(session_id)
         .map(|entry| entry.csrf_token.clone()))
   }

   async fn ping(&self) -> Result<(), InfraError> {
      Ok(())
   }
}

#[derive(Default)]
pub struct InMemoryAuthorizationRequestStore {
   requests: DashMap<State, PendingAuthorizationRequest>,
}

impl InMemoryAuthorizationRequestStore {
   pub fn new() -> Self {
      Self::default()
   }

   /// 失効済みの認可リクエストを削除し、削除件数を返す
   pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
      let before = self.requests.len();
      self.requests.retain(|_, request| !request.is_expired(now));
      before.saturating_sub(self.requests.len())
   }
}

#[async_trait]
impl AuthorizationRequestStore for InMemoryAuthorizationRequestStore {
   async fn save(&self, request: &PendingAuthorizationRequest, now: DateTime<Utc>) -> Result<(), InfraError> {
      if request.is_expired(now) {
         return Err(InfraError::unexpected("期限切れの認可リクエストは保存できません"));
      }
      match self.requests.entry(request.state().clone()) {
         Entry::Occupied(_) => Err(InfraError::unexpected("state が衝突しました")),
         Entry::Vacant(vacant) => {
            vacant.insert(request.clone());
            Ok(())
         }
      }
   }

   /// 期限切れでも取り出して返す（呼び出し側が Expired として扱う）
   async fn take(&self, state: &State) -> Result<Option<PendingAuthorizationRequest>, InfraError> {
      Ok(self.requests.remove(state).map(|(_, request)| request))
   }
}
