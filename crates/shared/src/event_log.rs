//! # ビジネスイベントログとエラーコンテキストの構造化ヘルパー
//!
//! 認証ライフサイクル（ログイン、リフレッシュ、ログアウト）を `jq` で追跡できるよう、
//! フィールド命名規約とヘルパーマクロを提供する。
//!
//! ## ビジネスイベント
//!
//! [`log_business_event!`] マクロで出力する。`event.kind = "business_event"` が
//! 自動付与され、`jq 'select(.["event.kind"] == "business_event")'` でフィルタできる。
//!
//! ## エラーコンテキスト
//!
//! `tracing::error!` / `tracing::warn!` に `error.category` + `error.kind` を直接追加する。
//!
//! ## 禁止フィールド
//!
//! トークン値・セッション ID・PKCE verifier・CSRF トークンはどのフィールドにも出力しない。

/// ビジネスイベントを構造化ログとして出力する。
///
/// ## 必須フィールド（慣例）
///
/// - `event.category`: [`event::category`] の定数
/// - `event.action`: [`event::action`] の定数
/// - `event.result`: [`event::result`] の定数
///
/// ## 推奨フィールド
///
/// - `event.provider`: プロバイダ ID
/// - `event.subject`: 主体の subject（issuer スコープ）
/// - `event.reason`: 失敗理由（コード値のみ）
#[macro_export]
macro_rules! log_business_event {
   ($($args:tt)*) => {
      ::tracing::info!(
         event.kind = "business_event",
         $($args)*
      )
   };
}

/// イベントフィールドの定数
pub mod event {
   pub mod category {
      pub const AUTH: &str = "auth";
      pub const SESSION: &str = "session";
   }

   pub mod action {
      pub const LOGIN_STARTED: &str = "auth.login_started";
      pub const LOGIN_SUCCESS: &str = "auth.login_success";
      pub const LOGIN_FAILURE: &str = "auth.login_failure";
      pub const TOKEN_REFRESHED: &str = "auth.token_refreshed";
      pub const REFRESH_FAILURE: &str = "auth.refresh_failure";
      pub const LOGOUT: &str = "auth.logout";
      pub const BACKCHANNEL_LOGOUT: &str = "auth.backchannel_logout";
      pub const SESSION_CREATED: &str = "session.created";
      pub const SESSION_DESTROYED: &str = "session.destroyed";
   }

   pub mod result {
      pub const SUCCESS: &str = "success";
      pub const FAILURE: &str = "failure";
   }
}

/// エラーコンテキストフィールドの定数
pub mod error {
   pub mod category {
      /// セッションストア（Redis / インメモリ）
      pub const INFRASTRUCTURE: &str = "infrastructure";
      /// IdP・上流 API 呼び出し
      pub const EXTERNAL_SERVICE: &str = "external_service";
      /// 不正なクライアント入力・署名検証失敗
      pub const SECURITY: &str = "security";
   }

   pub mod kind {
      pub const SESSION: &str = "session";
      pub const CSRF_TOKEN: &str = "csrf_token";
      pub const AUTHORIZATION_REQUEST: &str = "authorization_request";
      pub const TOKEN_EXCHANGE: &str = "token_exchange";
      pub const TOKEN_REFRESH: &str = "token_refresh";
      pub const ID_TOKEN: &str = "id_token";
      pub const LOGOUT_TOKEN: &str = "logout_token";
      pub const UPSTREAM: &str = "upstream";
      pub const INTERNAL: &str = "internal";
   }
}
