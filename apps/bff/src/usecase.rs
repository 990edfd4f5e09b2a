//! # ユースケース層
//!
//! ゲートウェイの認証ロジックを実装する。
//!
//! ## 設計方針
//!
//! - **依存性注入**: ストア・IdP クライアント・時計を `Arc<dyn Trait>` で外部から注入
//! - **薄いハンドラ**: ハンドラは Cookie と HTTP ステータスの変換に専念し、判断はユースケースに集約
//!
//! ## モジュール構成
//!
//! - `session`: セッションの解決・発行・破棄
//! - `login`: 認可コードフロー（開始とコールバック）
//! - `token`: アクセストークンの取得とシングルフライトのリフレッシュ
//! - `logout`: RP-initiated ログアウトとバックチャネルログアウト

pub mod login;
pub mod logout;
pub mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use login::{AuthError, CallbackParams, LoginRedirect, LoginUseCase};
pub use logout::{BackchannelLogoutError, LogoutUseCase};
pub use session::{IssuedSession, SessionService};
pub use token::{RefreshError, TokenService, ValidAccessToken};
