//! セッション管理ユースケース

use std::sync::Arc;

use relaygate_domain::{
   clock::Clock,
   csrf::CsrfToken,
   session::{Principal, Session, SessionId, SessionLifetime},
   token::TokenSet,
};
use relaygate_infra::{InfraError, SessionLookup, SessionManager};
use relaygate_shared::{event_log::event, log_business_event};

/// 新しく発行したセッションと CSRF トークン
///
/// ハンドラはこの 2 つを Cookie として設定する。
#[derive(Debug, Clone)]
pub struct IssuedSession {
   pub session:    Session,
   pub csrf_token: CsrfToken,
}

pub struct SessionService {
   sessions: Arc<dyn SessionManager>,
   clock:    Arc<dyn Clock>,
   lifetime: SessionLifetime,
}

impl SessionService {
   pub fn new(sessions: Arc<dyn SessionManager>, clock: Arc<dyn Clock>, lifetime: SessionLifetime) -> Self {
      Self {
         sessions,
         clock,
         lifetime,
      }
   }

   /// Cookie の値からセッションを解決する
   ///
   /// Cookie なし・形式不正・未知・期限切れはすべて `None`（匿名扱い）。
   pub async fn resolve(&self, raw_session_id: Option<&str>) -> Result<Option<Session>, InfraError> {
      let Some(session_id) = raw_session_id.and_then(SessionId::parse) else {
         return Ok(None);
      };
      let lookup = self.sessions.resolve(&session_id, self.clock.now()).await?;
      Ok(match lookup {
         SessionLookup::Found(session) => Some(session),
         SessionLookup::NoSession => None,
      })
   }

   pub async fn create_anonymous(&self) -> Result<IssuedSession, InfraError> {
      let now = self.clock.now();
      let session = Session::anonymous(SessionId::generate(), self.lifetime, now);
      let csrf_token = CsrfToken::generate();
      self.sessions.create(&session, &csrf_token, None, now).await?;

      tracing::debug!("匿名セッションを作成しました");
      Ok(IssuedSession {
         session,
         csrf_token,
      })
   }

   /// ログイン成功時のセッションを作成する
   ///
   /// セッション ID と CSRF トークンは常に新規に生成する。
   pub async fn create_authenticated(
      &self,
      principal: Principal,
      tokens: &TokenSet,
   ) -> Result<IssuedSession, InfraError> {
      let now = self.clock.now();
      let provider = principal.provider_id().to_string();
      let subject = principal.subject().subject().to_string();
      let session = Session::authenticated(SessionId::generate(), principal, self.lifetime, now);
      let csrf_token = CsrfToken::generate();
      self.sessions
         .create(&session, &csrf_token, Some(tokens), now)
         .await?;

      log_business_event!(
         event.category = event::category::SESSION,
         event.action = event::action::SESSION_CREATED,
         event.result = event::result::SUCCESS,
         event.provider = %provider,
         event.subject = %subject,
         "認証済みセッションを作成しました"
      );
      Ok(IssuedSession {
         session,
         csrf_token,
      })
   }

   pub async fn touch(&self, session: &Session) -> Result<Session, InfraError> {
      self.sessions.touch(session, self.clock.now()).await
   }

   pub async fn destroy(&self, session_id: &SessionId) -> Result<bool, InfraError> {
      let existed = self.sessions.destroy(session_id).await?;
      if existed {
         log_business_event!(
            event.category = event::category::SESSION,
            event.action = event::action::SESSION_DESTROYED,
            event.result = event::result::SUCCESS,
            "セッションを破棄しました"
         );
      }
      Ok(existed)
   }

   pub async fn csrf_token(&self, session_id: &SessionId) -> Result<Option<CsrfToken>, InfraError> {
      self.sessions.get_csrf_token(session_id).await
   }
}
