//! # アクセストークン取得ユースケース
//!
//! 上流へ転送するアクセストークンを返す。安全マージン内に期限切れになるトークンは
//! 転送前にリフレッシュする。
//!
//! ## シングルフライト
//!
//! 同じセッションで同時にリフレッシュが必要になった場合、IdP への交換は 1 回だけ行う。
//!
//! 1. 最初のリクエスト（リーダー）が進行中マップに `watch::Receiver` を登録し、
//!    リフレッシュを `tokio::spawn` したタスクで実行する
//! 2. 後続のリクエスト（フォロワー）は登録済みの Receiver で結果を待つ
//! 3. タスクは TokenSet をストアに書き込んでから結果を送信し、マップから外す
//!
//! 別タスクで実行するため、リーダーのクライアントが切断してもリフレッシュは完了し、
//! 結果はストアに残る。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use relaygate_domain::{
   clock::Clock,
   session::{Session, SessionId},
   token::{AccessToken, IdTokenClaims, NewTokenSet, TokenSet},
};
use relaygate_infra::{InfraError, SessionManager};
use relaygate_shared::{
   event_log::{error, event},
   log_business_event,
};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
   client::{IdentityProviderClient, TokenResponse},
   jwt::{JwtError, TokenVerifier},
   middleware::request_id::{current_request_id, scope_request_id},
   provider::ProviderRegistry,
};

/// リフレッシュ失敗
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
   /// 再ログインが必要（セッションは破棄済み）
   ///
   /// 値は失敗理由のコード値。
   #[error("トークンをリフレッシュできません: {0}")]
   Rejected(&'static str),

   /// IdP に接続できない（セッションは維持）
   #[error("IdP に接続できません")]
   Unavailable,

   #[error("セッションストアエラー: {0}")]
   Store(String),
}

impl From<InfraError> for RefreshError {
   fn from(err: InfraError) -> Self {
      Self::Store(err.to_string())
   }
}

type RefreshOutcome = Result<AccessToken, RefreshError>;

/// 転送に使えるアクセストークン
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidAccessToken {
   pub access_token: AccessToken,
   /// このリクエストの処理中にリフレッシュを待ったか
   pub refreshed:    bool,
}

/// リフレッシュの契機
#[derive(Debug, Clone)]
enum RefreshTrigger {
   /// 期限が安全マージン内に入った
   Expiring,
   /// 上流がこのトークンを 401 で拒否した
   RejectedByUpstream(AccessToken),
}

#[derive(Clone)]
pub struct TokenService {
   sessions:               Arc<dyn SessionManager>,
   providers:              Arc<ProviderRegistry>,
   idp:                    Arc<dyn IdentityProviderClient>,
   verifier:               Arc<TokenVerifier>,
   clock:                  Arc<dyn Clock>,
   refresh_margin:         Duration,
   default_token_lifetime: Duration,
   in_flight:              Arc<DashMap<SessionId, watch::Receiver<Option<RefreshOutcome>>>>,
}

impl TokenService {
   pub fn new(
      sessions: Arc<dyn SessionManager>,
      providers: Arc<ProviderRegistry>,
      idp: Arc<dyn IdentityProviderClient>,
      verifier: Arc<TokenVerifier>,
      clock: Arc<dyn Clock>,
      refresh_margin: Duration,
      default_token_lifetime: Duration,
   ) -> Self {
      Self {
         sessions,
         providers,
         idp,
         verifier,
         clock,
         refresh_margin,
         default_token_lifetime,
         in_flight: Arc::new(DashMap::new()),
      }
   }

   /// 転送可能なアクセストークンを返す
   ///
   /// 期限が安全マージン内なら、リフレッシュの完了を待ってから新しいトークンを返す。
   pub async fn valid_access_token(&self, session: &Session) -> Result<ValidAccessToken, RefreshError> {
      let tokens = self.sessions.get_token_set(session.id()).await?;
      let Some(tokens) = tokens else {
         self.reject(session, "token_set_missing").await;
         return Err(RefreshError::Rejected("token_set_missing"));
      };

      if !tokens.needs_refresh(self.clock.now(), self.refresh_margin) {
         return Ok(ValidAccessToken {
            access_token: tokens.access_token().clone(),
            refreshed:    false,
         });
      }

      let access_token = self
         .refresh_single_flight(session, RefreshTrigger::Expiring)
         .await?;
      Ok(ValidAccessToken {
         access_token,
         refreshed: true,
      })
   }

   /// 上流に拒否されたトークンを強制的にリフレッシュする
   ///
   /// ストア上のトークンが既に別リクエストで置き換わっていれば、交換せずそれを返す。
   pub async fn force_refresh(
      &self,
      session: &Session,
      rejected: &AccessToken,
   ) -> Result<ValidAccessToken, RefreshError> {
      let access_token = self
         .refresh_single_flight(session, RefreshTrigger::RejectedByUpstream(rejected.clone()))
         .await?;
      Ok(ValidAccessToken {
         access_token,
         refreshed: true,
      })
   }

   async fn refresh_single_flight(&self, session: &Session, trigger: RefreshTrigger) -> RefreshOutcome {
      let (leader, mut receiver) = match self.in_flight.entry(session.id().clone()) {
         Entry::Occupied(entry) => (None, entry.get().clone()),
         Entry::Vacant(entry) => {
            let (sender, receiver) = watch::channel(None);
            entry.insert(receiver.clone());
            (Some(sender), receiver)
         }
      };

      if let Some(sender) = leader {
         let worker = self.clone();
         let session = session.clone();
         tokio::spawn(scope_request_id(current_request_id(), async move {
            let outcome = worker.refresh_and_record(&session, trigger).await;
            sender.send_replace(Some(outcome));
            worker.in_flight.remove(session.id());
         }));
      }

      let outcome = receiver
         .wait_for(Option::is_some)
         .await
         .map(|value| (*value).clone());
      match outcome {
         Ok(Some(outcome)) => outcome,
         _ => {
            // タスクが結果を送らずに終了した
            self.in_flight
               .remove_if(session.id(), |_, registered| registered.same_channel(&receiver));
            Err(RefreshError::Unavailable)
         }
      }
   }

   async fn refresh_and_record(&self, session: &Session, trigger: RefreshTrigger) -> RefreshOutcome {
      let outcome = self.refresh(session, trigger).await;
      if let Err(RefreshError::Rejected(reason)) = &outcome {
         self.reject(session, reason).await;
      }
      outcome
   }

   async fn refresh(&self, session: &Session, trigger: RefreshTrigger) -> RefreshOutcome {
      let now = self.clock.now();
      let current = self
         .sessions
         .get_token_set(session.id())
         .await?
         .ok_or(RefreshError::Rejected("session_gone"))?;

      // 先行したリフレッシュで既に置き換わっている
      let fresh = !current.needs_refresh(now, self.refresh_margin);
      let already_replaced = match &trigger {
         RefreshTrigger::Expiring => fresh,
         RefreshTrigger::RejectedByUpstream(rejected) => fresh && current.access_token() != rejected,
      };
      if already_replaced {
         return Ok(current.access_token().clone());
      }

      let principal = session
         .principal()
         .ok_or(RefreshError::Rejected("anonymous"))?;
      let provider = self
         .providers
         .get(principal.provider_id())
         .ok_or(RefreshError::Rejected("unknown_provider"))?;
      let refresh_token = current
         .refresh_token()
         .cloned()
         .ok_or(RefreshError::Rejected("no_refresh_token"))?;

      let response = match self.idp.refresh(&provider, &refresh_token).await {
         Ok(response) => response,
         Err(e) if e.is_retryable() => {
            tracing::warn!(
               error.category = error::category::EXTERNAL_SERVICE,
               error.kind = error::kind::TOKEN_REFRESH,
               provider = %provider.id,
               "IdP に接続できないためリフレッシュできません: {}",
               e
            );
            return Err(RefreshError::Unavailable);
         }
         Err(e) => {
            tracing::info!(provider = %provider.id, "IdP がリフレッシュを拒否しました: {}", e);
            return Err(RefreshError::Rejected("refresh_rejected"));
         }
      };

      let claims = match &response.id_token {
         Some(id_token) => {
            let claims = self
               .verifier
               .verify_id_token(&provider, id_token, None)
               .await
               .map_err(|e| match e {
                  JwtError::KeysUnavailable(_) => RefreshError::Unavailable,
                  _ => RefreshError::Rejected("invalid_id_token"),
               })?;
            if claims.to_subject() != *principal.subject() {
               return Err(RefreshError::Rejected("subject_mismatch"));
            }
            Some(claims)
         }
         None => None,
      };

      let next = token_set_from_response(response, claims, self.clock.now(), self.default_token_lifetime);
      let rotated = current.rotated(next);
      if !self.sessions.replace_token_set(session.id(), &rotated).await? {
         return Err(RefreshError::Rejected("session_gone"));
      }

      log_business_event!(
         event.category = event::category::AUTH,
         event.action = event::action::TOKEN_REFRESHED,
         event.result = event::result::SUCCESS,
         event.provider = %provider.id,
         "アクセストークンをリフレッシュしました"
      );
      Ok(rotated.access_token().clone())
   }

   /// リフレッシュ不能なセッションを破棄する
   async fn reject(&self, session: &Session, reason: &'static str) {
      log_business_event!(
         event.category = event::category::AUTH,
         event.action = event::action::REFRESH_FAILURE,
         event.result = event::result::FAILURE,
         event.reason = reason,
         "トークンをリフレッシュできないためセッションを破棄します"
      );
      if let Err(e) = self.sessions.destroy(session.id()).await {
         tracing::error!(
            error.category = error::category::INFRASTRUCTURE,
            error.kind = error::kind::SESSION,
            "セッション破棄に失敗しました: {}",
            e
         );
      }
   }
}

/// トークンエンドポイントの応答から TokenSet を作る
///
/// `expires_in` がなければ `default_lifetime` を有効期間とみなす。
pub(crate) fn token_set_from_response(
   response: TokenResponse,
   id_token_claims: Option<IdTokenClaims>,
   now: DateTime<Utc>,
   default_lifetime: Duration,
) -> TokenSet {
   let lifetime = response
      .expires_in
      .filter(|secs| *secs > 0)
      .map_or(default_lifetime, Duration::seconds);
   TokenSet::new(NewTokenSet {
      access_token: response.access_token,
      refresh_token: response.refresh_token,
      access_token_expiry: now + lifetime,
      id_token: response.id_token,
      id_token_claims,
      scope: response.scope,
   })
}
