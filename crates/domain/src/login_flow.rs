//! # OAuth2 クライアント状態機械
//!
//! 認可コードフロー1回分の状態遷移を ADT で表現する。
//!
//! ```text
//! Idle → AuthorizationRequested → AwaitingCallback → Exchanging → Authenticated
//!  ↑              │                       │               │             │
//!  └──────────────┴──── fail ─────────────┴───────────────┘   logout ───┘
//! ```
//!
//! HTTP リクエストをまたぐため、`AwaitingCallback` の実体は
//! ストアに保存された [`PendingAuthorizationRequest`] になる。
//!
//! - ログイン開始: [`LoginFlow::start`] → [`LoginFlow::redirected`] が保存すべき認可リクエストを返す
//! - コールバック: ストアから取り出した値で [`LoginFlow::resume`] し、続きの遷移を行う
//! - ログアウト: 認証済みセッションから [`LoginFlow::established`] で復元し、[`LoginFlow::logged_out`]

use chrono::{DateTime, Utc};
use strum::IntoStaticStr;

use crate::{
   DomainError,
   authorization::{AuthorizationCode, PendingAuthorizationRequest},
   session::Principal,
};

/// コードを交換中の状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangingState {
   pending: PendingAuthorizationRequest,
   code:    AuthorizationCode,
}

impl ExchangingState {
   pub fn pending(&self) -> &PendingAuthorizationRequest {
      &self.pending
   }

   pub fn code(&self) -> &AuthorizationCode {
      &self.code
   }
}

/// ログイン失敗理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LoginFailure {
   /// state が不明・使用済み・Cookie と不一致（CSRF もしくはリプレイ）
   InvalidState,
   /// 認可リクエストの期限切れ
   Expired,
   /// IdP がエラーでリダイレクトしてきた
   AuthorizationDenied,
   /// トークンエンドポイントとの交換に失敗
   TokenExchangeFailed,
   /// ID トークンの検証に失敗
   InvalidIdToken,
}

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum LoginFlow {
   Idle,
   AuthorizationRequested(PendingAuthorizationRequest),
   AwaitingCallback(PendingAuthorizationRequest),
   Exchanging(ExchangingState),
   Authenticated(Principal),
}

impl LoginFlow {
   /// ログインを開始する（Idle → AuthorizationRequested）
   pub fn start(pending: PendingAuthorizationRequest) -> Self {
      Self::AuthorizationRequested(pending)
   }

   /// ストアから取り出した認可リクエストでフローを再開する
   pub fn resume(pending: PendingAuthorizationRequest) -> Self {
      Self::AwaitingCallback(pending)
   }

   /// 認証済みセッションの主体でフローを復元する
   pub fn established(principal: Principal) -> Self {
      Self::Authenticated(principal)
   }

   /// 状態名（snake_case、ログ用）
   pub fn state_name(&self) -> &'static str {
      self.into()
   }

   fn invalid(&self, to: &'static str) -> DomainError {
      DomainError::InvalidTransition {
         from: self.state_name(),
         to,
      }
   }

   /// IdP へのリダイレクトを発行する（AuthorizationRequested → AwaitingCallback）
   ///
   /// 以降の状態はリクエストをまたぐため、保存すべき認可リクエストを返す。
   pub fn redirected(self) -> Result<PendingAuthorizationRequest, DomainError> {
      match self {
         Self::AuthorizationRequested(pending) => Ok(pending),
         other => Err(other.invalid("awaiting_callback")),
      }
   }

   /// コールバックを受理する（AwaitingCallback → Exchanging）
   ///
   /// state の照合はストア検索（+ Cookie 照合）で済んでいる前提で、期限のみ判定する。
   /// AwaitingCallback 以外で届いたコールバックは `InvalidState` として扱う。
   /// 失敗時のフローは Idle に戻る。
   pub fn callback_received(
      self,
      code: AuthorizationCode,
      now: DateTime<Utc>,
   ) -> Result<Self, LoginFailure> {
      match self {
         Self::AwaitingCallback(pending) if pending.is_expired(now) => Err(LoginFailure::Expired),
         Self::AwaitingCallback(pending) => Ok(Self::Exchanging(ExchangingState { pending, code })),
         _ => Err(LoginFailure::InvalidState),
      }
   }

   /// コード交換と ID トークン検証が成功した（Exchanging → Authenticated）
   pub fn authenticated(self, principal: Principal) -> Result<Self, DomainError> {
      match self {
         Self::Exchanging(_) => Ok(Self::Authenticated(principal)),
         other => Err(other.invalid("authenticated")),
      }
   }

   /// 失敗により Idle に戻る（AuthorizationRequested / AwaitingCallback / Exchanging → Idle）
   pub fn failed(self) -> Result<Self, DomainError> {
      match self {
         Self::AuthorizationRequested(_) | Self::AwaitingCallback(_) | Self::Exchanging(_) => {
            Ok(Self::Idle)
         }
         other => Err(other.invalid("idle")),
      }
   }

   /// ログアウトで Idle に戻る（Authenticated → Idle）
   pub fn logged_out(self) -> Result<Self, DomainError> {
      match self {
         Self::Authenticated(_) => Ok(Self::Idle),
         other => Err(other.invalid("idle")),
      }
   }

   pub fn pending(&self) -> Option<&PendingAuthorizationRequest> {
      match self {
         Self::AuthorizationRequested(pending) | Self::AwaitingCallback(pending) => Some(pending),
         Self::Exchanging(state) => Some(&state.pending),
         Self::Idle | Self::Authenticated(_) => None,
      }
   }

   pub fn exchanging(&self) -> Option<&ExchangingState> {
      match self {
         Self::Exchanging(state) => Some(state),
         _ => None,
      }
   }

   pub fn principal(&self) -> Option<&Principal> {
      match self {
         Self::Authenticated(principal) => Some(principal),
         _ => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use chrono::Duration;
   use pretty_assertions::assert_eq;
   use rstest::{fixture, rstest};

   use super::*;
   use crate::{
      authorization::{ProviderId, ReturnTarget},
      session::Subject,
   };

   fn base_time() -> DateTime<Utc> {
      DateTime::from_timestamp(1_700_000_000, 0).unwrap()
   }

   fn new_pending(now: DateTime<Utc>) -> PendingAuthorizationRequest {
      PendingAuthorizationRequest::generate(
         ProviderId::parse("keycloak").unwrap(),
         ReturnTarget::parse("/orders").unwrap(),
         Duration::minutes(5),
         now,
      )
   }

   #[fixture]
   fn now() -> DateTime<Utc> {
      base_time()
   }

   #[fixture]
   fn pending(now: DateTime<Utc>) -> PendingAuthorizationRequest {
      new_pending(now)
   }

   fn principal() -> Principal {
      Principal::new(
         ProviderId::parse("keycloak").unwrap(),
         Subject::new("https://idp.example.com", "user-1"),
         None,
      )
   }

   fn code() -> AuthorizationCode {
      AuthorizationCode::new("auth-code")
   }

   #[rstest]
   fn test_正常系で全状態を順に遷移する(pending: PendingAuthorizationRequest, now: DateTime<Utc>) {
      let flow = LoginFlow::start(pending.clone());
      assert_eq!(flow.pending(), Some(&pending));
      assert_eq!(flow.state_name(), "authorization_requested");

      let saved = flow.redirected().unwrap();
      assert_eq!(saved, pending);

      let flow = LoginFlow::resume(saved);
      assert_eq!(flow.state_name(), "awaiting_callback");

      let flow = flow.callback_received(code(), now).unwrap();
      assert_eq!(flow.exchanging().unwrap().code(), &code());

      let flow = flow.authenticated(principal()).unwrap();
      assert_eq!(flow.principal(), Some(&principal()));

      let flow = flow.logged_out().unwrap();
      assert_eq!(flow, LoginFlow::Idle);
   }

   #[rstest]
   fn test_期限切れのコールバックはexpiredになる(
      pending: PendingAuthorizationRequest,
      now: DateTime<Utc>,
   ) {
      let result = LoginFlow::resume(pending).callback_received(code(), now + Duration::minutes(5));

      assert_eq!(result, Err(LoginFailure::Expired));
   }

   #[rstest]
   fn test_交換前に認証済みへは遷移できない(pending: PendingAuthorizationRequest) {
      let result = LoginFlow::resume(pending).authenticated(principal());

      assert_eq!(
         result,
         Err(DomainError::InvalidTransition {
            from: "awaiting_callback",
            to:   "authenticated",
         })
      );
   }

   #[rstest]
   fn test_待機中以外で届いたコールバックはinvalid_state(now: DateTime<Utc>) {
      assert_eq!(
         LoginFlow::Idle.callback_received(code(), now),
         Err(LoginFailure::InvalidState)
      );
      assert_eq!(
         LoginFlow::Authenticated(principal()).callback_received(code(), now),
         Err(LoginFailure::InvalidState)
      );
   }

   #[rstest]
   #[case::authorization_requested(LoginFlow::start(new_pending(base_time())))]
   #[case::awaiting_callback(LoginFlow::resume(new_pending(base_time())))]
   #[case::exchanging(
      LoginFlow::resume(new_pending(base_time()))
         .callback_received(code(), base_time())
         .unwrap()
   )]
   fn test_途中状態はすべて失敗でidleに戻れる(#[case] flow: LoginFlow) {
      assert_eq!(flow.failed(), Ok(LoginFlow::Idle));
   }

   #[rstest]
   fn test_リダイレクト済みのフローから再度リダイレクトできない(pending: PendingAuthorizationRequest) {
      let result = LoginFlow::resume(pending).redirected();

      assert_eq!(
         result,
         Err(DomainError::InvalidTransition {
            from: "awaiting_callback",
            to:   "awaiting_callback",
         })
      );
   }

   #[test]
   fn test_認証済みセッションから復元したフローはログアウトでidleに戻る() {
      let flow = LoginFlow::established(principal());
      assert_eq!(flow.principal(), Some(&principal()));

      assert_eq!(flow.logged_out(), Ok(LoginFlow::Idle));
   }

   #[rstest]
   fn test_未認証のフローからはログアウトできない(pending: PendingAuthorizationRequest) {
      assert!(LoginFlow::Idle.logged_out().is_err());
      assert!(LoginFlow::resume(pending).logged_out().is_err());
   }

   #[test]
   fn test_認証済みからfailedは不正遷移() {
      let result = LoginFlow::Authenticated(principal()).failed();

      assert!(result.is_err());
   }

   #[test]
   fn test_login_failureのコード値() {
      assert_eq!(LoginFailure::InvalidState.to_string(), "invalid_state");
      assert_eq!(LoginFailure::TokenExchangeFailed.to_string(), "token_exchange_failed");
   }
}
