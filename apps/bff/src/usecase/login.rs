//! # ログインユースケース
//!
//! 認可コードフロー（PKCE S256 + nonce）の開始とコールバック処理。
//!
//! ## コールバックの処理順
//!
//! 1. state で認可リクエストを取り出す（この時点でストアから消え、以降の成否に関わらず再利用できない）
//! 2. state Cookie・プロバイダ・期限を照合する
//! 3. 認可コードをトークンに交換する（接続失敗は 1 回だけ待って再試行）
//! 4. ID トークンを検証する（署名・iss・aud・exp・nonce）
//! 5. ログイン前のセッションを破棄し、新しい ID で認証済みセッションを作る

use std::sync::Arc;

use chrono::Duration;
use relaygate_domain::{
   DomainError,
   authorization::{AuthorizationCode, CodeVerifier, PendingAuthorizationRequest, ProviderId, ReturnTarget, State},
   clock::Clock,
   login_flow::{ExchangingState, LoginFailure, LoginFlow},
   session::{Principal, SessionId},
   token::TokenSet,
};
use relaygate_infra::{AuthorizationRequestStore, InfraError};
use relaygate_shared::{
   event_log::{error, event},
   log_business_event,
};
use serde::Deserialize;
use subtle::ConstantTimeEq as _;
use thiserror::Error;
use url::Url;

use super::{
   session::{IssuedSession, SessionService},
   token::token_set_from_response,
};
use crate::{
   client::{IdentityProviderClient, IdentityProviderError, TokenResponse},
   config::BffConfig,
   jwt::TokenVerifier,
   provider::{Provider, ProviderRegistry},
};

/// トークン交換の再試行までの待ち時間
const EXCHANGE_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);

/// ログイン失敗
///
/// ブラウザには [`AuthError::code`] のコード値だけを返す。
#[derive(Debug, Error)]
pub enum AuthError {
   #[error("未知のプロバイダです")]
   UnknownProvider,

   /// state が不明・使用済み・Cookie と不一致（CSRF もしくはリプレイ）
   #[error("state が不正です")]
   InvalidState,

   #[error("認可リクエストの期限が切れています")]
   Expired,

   /// IdP がエラーでリダイレクトしてきた（値は IdP のエラーコード）
   #[error("IdP が認可を拒否しました: {0}")]
   AuthorizationDenied(String),

   #[error("トークン交換に失敗しました: {0}")]
   TokenExchangeFailed(#[source] IdentityProviderError),

   #[error("ID トークンの検証に失敗しました: {0}")]
   InvalidIdToken(String),

   #[error(transparent)]
   Flow(#[from] DomainError),

   #[error(transparent)]
   Store(#[from] InfraError),
}

impl AuthError {
   /// ログイン失敗画面に渡すコード値
   pub fn code(&self) -> &'static str {
      match self {
         Self::UnknownProvider => "unknown_provider",
         Self::Flow(_) | Self::Store(_) => "server_error",
         Self::InvalidState => LoginFailure::InvalidState.into(),
         Self::Expired => LoginFailure::Expired.into(),
         Self::AuthorizationDenied(_) => LoginFailure::AuthorizationDenied.into(),
         Self::TokenExchangeFailed(_) => LoginFailure::TokenExchangeFailed.into(),
         Self::InvalidIdToken(_) => LoginFailure::InvalidIdToken.into(),
      }
   }
}

/// コールバックのクエリパラメータ
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
   pub code:  Option<String>,
   pub state: Option<String>,
   pub error: Option<String>,
}

/// IdP へのリダイレクト
#[derive(Debug, Clone)]
pub struct LoginRedirect {
   pub authorization_url: Url,
   /// ブラウザに state Cookie として結び付ける値
   pub state:             State,
   pub state_ttl:         Duration,
}

/// ログイン成功
#[derive(Debug, Clone)]
pub struct LoginSuccess {
   pub issued:        IssuedSession,
   pub return_target: ReturnTarget,
}

pub struct LoginUseCase {
   providers:                 Arc<ProviderRegistry>,
   requests:                  Arc<dyn AuthorizationRequestStore>,
   idp:                       Arc<dyn IdentityProviderClient>,
   verifier:                  Arc<TokenVerifier>,
   sessions:                  Arc<SessionService>,
   clock:                     Arc<dyn Clock>,
   authorization_request_ttl: Duration,
   default_token_lifetime:    Duration,
   post_login_redirect:       ReturnTarget,
   exchange_retry_backoff:    std::time::Duration,
}

impl LoginUseCase {
   pub fn new(
      config: &BffConfig,
      providers: Arc<ProviderRegistry>,
      requests: Arc<dyn AuthorizationRequestStore>,
      idp: Arc<dyn IdentityProviderClient>,
      verifier: Arc<TokenVerifier>,
      sessions: Arc<SessionService>,
      clock: Arc<dyn Clock>,
   ) -> Self {
      Self {
         providers,
         requests,
         idp,
         verifier,
         sessions,
         clock,
         authorization_request_ttl: config.lifetimes.authorization_request,
         default_token_lifetime: config.lifetimes.default_token_lifetime,
         post_login_redirect: config.post_login_redirect.clone(),
         exchange_retry_backoff: EXCHANGE_RETRY_BACKOFF,
      }
   }

   /// 再試行の待ち時間を変更する（テスト用）
   pub fn with_exchange_retry_backoff(self, backoff: std::time::Duration) -> Self {
      Self {
         exchange_retry_backoff: backoff,
         ..self
      }
   }

   fn provider(&self, provider_id: &str) -> Result<Arc<Provider>, AuthError> {
      ProviderId::parse(provider_id)
         .ok()
         .and_then(|id| self.providers.get(&id))
         .ok_or(AuthError::UnknownProvider)
   }

   /// ログインを開始する
   ///
   /// `return_to` が同一オリジンの相対パスでなければ既定の戻り先を使う。
   pub async fn start_login(&self, provider_id: &str, return_to: Option<&str>) -> Result<LoginRedirect, AuthError> {
      let provider = self.provider(provider_id)?;
      let return_target = return_to
         .and_then(ReturnTarget::parse)
         .unwrap_or_else(|| self.post_login_redirect.clone());

      let now = self.clock.now();
      let pending = LoginFlow::start(PendingAuthorizationRequest::generate(
         provider.id.clone(),
         return_target,
         self.authorization_request_ttl,
         now,
      ))
      .redirected()?;
      self.requests.save(&pending, now).await?;

      log_business_event!(
         event.category = event::category::AUTH,
         event.action = event::action::LOGIN_STARTED,
         event.result = event::result::SUCCESS,
         event.provider = %provider.id,
         "ログインを開始しました"
      );
      Ok(LoginRedirect {
         authorization_url: provider.authorization_url(&pending),
         state:             pending.state().clone(),
         state_ttl:         self.authorization_request_ttl,
      })
   }

   /// IdP からのコールバックを処理する
   ///
   /// 成功時は `previous_session`（ログイン前のセッション）を破棄し、新しいセッションを返す。
   pub async fn handle_callback(
      &self,
      provider_id: &str,
      params: CallbackParams,
      state_cookie: Option<&str>,
      previous_session: Option<&SessionId>,
   ) -> Result<LoginSuccess, AuthError> {
      let result = self
         .complete_login(provider_id, params, state_cookie, previous_session)
         .await;

      match &result {
         Ok(_) => {}
         Err(AuthError::Store(e)) => {
            tracing::error!(
               error.category = error::category::INFRASTRUCTURE,
               error.kind = error::kind::AUTHORIZATION_REQUEST,
               "ログイン処理でストアエラー: {}",
               e
            );
         }
         Err(e) => {
            log_business_event!(
               event.category = event::category::AUTH,
               event.action = event::action::LOGIN_FAILURE,
               event.result = event::result::FAILURE,
               event.provider = provider_id,
               event.reason = e.code(),
               "ログインに失敗しました: {}",
               e
            );
         }
      }
      result
   }

   async fn complete_login(
      &self,
      provider_id: &str,
      params: CallbackParams,
      state_cookie: Option<&str>,
      previous_session: Option<&SessionId>,
   ) -> Result<LoginSuccess, AuthError> {
      let state = params
         .state
         .as_deref()
         .and_then(State::parse)
         .ok_or(AuthError::InvalidState)?;
      let pending = self
         .requests
         .take(&state)
         .await?
         .ok_or(AuthError::InvalidState)?;

      let flow = LoginFlow::resume(pending);

      let bound_to_browser = state_cookie
         .is_some_and(|cookie| bool::from(cookie.as_bytes().ct_eq(state.as_str().as_bytes())));
      if !bound_to_browser {
         return Err(abandon(flow, AuthError::InvalidState));
      }
      let provider = match self.provider(provider_id) {
         Ok(provider) if flow.pending().is_some_and(|p| p.provider_id() == &provider.id) => provider,
         Ok(_) => return Err(abandon(flow, AuthError::InvalidState)),
         Err(e) => return Err(abandon(flow, e)),
      };

      if let Some(error) = params.error {
         return Err(abandon(flow, AuthError::AuthorizationDenied(error)));
      }
      let Some(code) = params.code.filter(|code| !code.is_empty()) else {
         return Err(abandon(flow, AuthError::AuthorizationDenied("invalid_request".to_string())));
      };

      let flow = flow
         .callback_received(AuthorizationCode::new(code), self.clock.now())
         .map_err(|failure| match failure {
            LoginFailure::Expired => AuthError::Expired,
            _ => AuthError::InvalidState,
         })?;
      let verified = match flow.exchanging() {
         Some(exchange) => self.exchange_and_verify(&provider, exchange).await,
         None => Err(AuthError::InvalidState),
      };
      let (principal, tokens) = match verified {
         Ok(verified) => verified,
         Err(e) => return Err(abandon(flow, e)),
      };
      let return_target = flow
         .pending()
         .map_or_else(|| self.post_login_redirect.clone(), |p| p.return_target().clone());
      let flow = flow.authenticated(principal.clone())?;
      tracing::debug!(login.state = flow.state_name(), "コード交換と ID トークン検証が完了しました");

      if let Some(previous) = previous_session {
         self.sessions.destroy(previous).await?;
      }
      let issued = self.sessions.create_authenticated(principal, &tokens).await?;

      log_business_event!(
         event.category = event::category::AUTH,
         event.action = event::action::LOGIN_SUCCESS,
         event.result = event::result::SUCCESS,
         event.provider = %provider.id,
         event.subject = %issued.session.principal().map(|p| p.subject().subject()).unwrap_or_default(),
         "ログインしました"
      );
      Ok(LoginSuccess {
         issued,
         return_target,
      })
   }

   /// コードを交換し、ID トークンを検証する（Exchanging の処理本体）
   async fn exchange_and_verify(
      &self,
      provider: &Provider,
      exchange: &ExchangingState,
   ) -> Result<(Principal, TokenSet), AuthError> {
      let response = self
         .exchange_with_retry(provider, exchange.code(), exchange.pending().code_verifier())
         .await
         .map_err(AuthError::TokenExchangeFailed)?;

      let id_token = response
         .id_token
         .clone()
         .ok_or_else(|| AuthError::InvalidIdToken("id_token がありません".to_string()))?;
      let claims = self
         .verifier
         .verify_id_token(provider, &id_token, Some(exchange.pending().nonce()))
         .await
         .map_err(|e| AuthError::InvalidIdToken(e.to_string()))?;

      let principal = Principal::new(
         provider.id.clone(),
         claims.to_subject(),
         claims.session_id().map(str::to_string),
      );
      let tokens = token_set_from_response(response, Some(claims), self.clock.now(), self.default_token_lifetime);
      Ok((principal, tokens))
   }

   async fn exchange_with_retry(
      &self,
      provider: &Provider,
      code: &AuthorizationCode,
      code_verifier: &CodeVerifier,
   ) -> Result<TokenResponse, IdentityProviderError> {
      match self.idp.exchange_code(provider, code, code_verifier).await {
         Err(e) if e.is_retryable() => {
            tracing::warn!(
               error.category = error::category::EXTERNAL_SERVICE,
               error.kind = error::kind::TOKEN_EXCHANGE,
               provider = %provider.id,
               "トークン交換に失敗したため再試行します: {}",
               e
            );
            tokio::time::sleep(self.exchange_retry_backoff).await;
            self.idp.exchange_code(provider, code, code_verifier).await
         }
         other => other,
      }
   }
}

/// 途中状態のフローを失敗として Idle に戻す
fn abandon(flow: LoginFlow, err: AuthError) -> AuthError {
   let from = flow.state_name();
   match flow.failed() {
      Ok(_) => tracing::debug!(login.from = from, login.reason = err.code(), "ログインフローを中断しました"),
      Err(e) => tracing::warn!("ログインフローの状態が不正です: {}", e),
   }
   err
}
