//! # ログアウトユースケース
//!
//! - **RP-initiated**: ブラウザからの `POST /logout`。セッションを破棄し、IdP の
//!   end_session_endpoint へのリダイレクト先を返す
//! - **バックチャネル**: IdP からの `POST /backchannel-logout`。署名済みログアウトトークンの
//!   `sid`（なければ `sub`）に紐づくセッションをすべて破棄する

use std::sync::Arc;

use relaygate_domain::{
   login_flow::LoginFlow,
   session::{Session, Subject},
};
use relaygate_infra::{DestroyedSessions, InfraError, SessionManager};
use relaygate_shared::{
   event_log::{error, event},
   log_business_event,
};
use thiserror::Error;
use url::Url;

use super::session::SessionService;
use crate::{
   config::{BffConfig, ConfigError},
   jwt::{JwtError, LogoutTokenError, TokenVerifier, unverified_issuer},
   provider::ProviderRegistry,
};

/// IdP の end_session_endpoint から戻ってくるパス
pub const LOGOUT_COMPLETE_PATH: &str = "/logout/complete";

#[derive(Debug, Error)]
pub enum BackchannelLogoutError {
   #[error("ログアウトトークンが不正です: {0}")]
   InvalidToken(#[from] LogoutTokenError),

   #[error(transparent)]
   Store(#[from] InfraError),
}

pub struct LogoutUseCase {
   providers:            Arc<ProviderRegistry>,
   sessions:             Arc<SessionService>,
   store:                Arc<dyn SessionManager>,
   verifier:             Arc<TokenVerifier>,
   post_logout_redirect: String,
   logout_complete_url:  Url,
}

impl LogoutUseCase {
   pub fn new(
      config: &BffConfig,
      providers: Arc<ProviderRegistry>,
      sessions: Arc<SessionService>,
      store: Arc<dyn SessionManager>,
      verifier: Arc<TokenVerifier>,
   ) -> Result<Self, ConfigError> {
      Ok(Self {
         providers,
         sessions,
         store,
         verifier,
         post_logout_redirect: config.post_logout_redirect.clone(),
         logout_complete_url: config.public_url(LOGOUT_COMPLETE_PATH)?,
      })
   }

   pub fn post_logout_redirect(&self) -> &str {
      &self.post_logout_redirect
   }

   /// セッションを破棄し、ブラウザの遷移先を返す
   ///
   /// 認証済みでプロバイダに end_session_endpoint があれば IdP のログアウト URL
   /// （`id_token_hint` 付き）、それ以外は `POST_LOGOUT_REDIRECT`。
   pub async fn logout(&self, session: Option<&Session>) -> Result<String, InfraError> {
      let Some(session) = session else {
         return Ok(self.post_logout_redirect.clone());
      };

      let flow = session.principal().cloned().map(LoginFlow::established);
      let mut location = None;
      if let Some(principal) = flow.as_ref().and_then(LoginFlow::principal)
         && let Some(provider) = self.providers.get(principal.provider_id())
      {
         let tokens = self.store.get_token_set(session.id()).await?;
         let id_token_hint = tokens.as_ref().and_then(|t| t.id_token());
         location = provider
            .end_session_url(id_token_hint, &self.logout_complete_url)
            .map(String::from);

         log_business_event!(
            event.category = event::category::AUTH,
            event.action = event::action::LOGOUT,
            event.result = event::result::SUCCESS,
            event.provider = %provider.id,
            event.subject = principal.subject().subject(),
            "ログアウトしました"
         );
      }

      self.sessions.destroy(session.id()).await?;
      if let Some(Err(e)) = flow.map(LoginFlow::logged_out) {
         tracing::warn!("ログインフローの状態が不正です: {}", e);
      }
      Ok(location.unwrap_or_else(|| self.post_logout_redirect.clone()))
   }

   /// バックチャネルログアウトを処理する
   ///
   /// 該当セッションがなくても、トークンが正しければ成功とする。
   pub async fn backchannel_logout(&self, logout_token: &str) -> Result<DestroyedSessions, BackchannelLogoutError> {
      let result = self.verify_and_destroy(logout_token).await;
      match &result {
         Ok(destroyed) => {
            log_business_event!(
               event.category = event::category::AUTH,
               event.action = event::action::BACKCHANNEL_LOGOUT,
               event.result = event::result::SUCCESS,
               event.destroyed_sessions = destroyed.0,
               "バックチャネルログアウトを処理しました"
            );
         }
         Err(BackchannelLogoutError::InvalidToken(e)) => {
            tracing::warn!(
               error.category = error::category::SECURITY,
               error.kind = error::kind::LOGOUT_TOKEN,
               "不正なログアウトトークンを拒否しました: {}",
               e
            );
         }
         Err(BackchannelLogoutError::Store(e)) => {
            tracing::error!(
               error.category = error::category::INFRASTRUCTURE,
               error.kind = error::kind::SESSION,
               "バックチャネルログアウトでストアエラー: {}",
               e
            );
         }
      }
      result
   }

   async fn verify_and_destroy(&self, logout_token: &str) -> Result<DestroyedSessions, BackchannelLogoutError> {
      let issuer = unverified_issuer(logout_token).ok_or(LogoutTokenError::Jwt(JwtError::Malformed))?;
      let provider = self
         .providers
         .find_by_issuer(&issuer)
         .ok_or(LogoutTokenError::UnknownIssuer)?;
      let claims = self.verifier.verify_logout_token(&provider, logout_token).await?;

      let destroyed = match (&claims.session_id, &claims.subject) {
         (Some(sid), _) => self.store.destroy_by_idp_session(&claims.issuer, sid).await?,
         (None, Some(sub)) => {
            self.store
               .destroy_by_subject(&Subject::new(claims.issuer.clone(), sub.clone()))
               .await?
         }
         (None, None) => return Err(LogoutTokenError::MissingSubject.into()),
      };
      Ok(destroyed)
   }
}
