//! # HTTP リクエストハンドラ
//!
//! axum のルートに対応するハンドラ関数を定義する。
//!
//! ## 設計方針
//!
//! - 各ハンドラはサブモジュールに配置
//! - 親モジュールで re-export し、フラットな API を提供
//! - ハンドラは Cookie と HTTP ステータスへの変換に専念し、判断はユースケースに委譲
//!
//! ## ハンドラ一覧
//!
//! - `health`: ヘルスチェック
//! - `login`: ログイン選択肢・認可コードフロー
//! - `logout`: RP-initiated / バックチャネルログアウト
//! - `me`: セッション情報
//! - `relay`: `/api/**` の上流中継

pub mod health;
pub mod login;
pub mod logout;
pub mod me;
pub mod relay;

use axum::{
   http::{HeaderValue, StatusCode, header},
   response::{IntoResponse, Response},
};
pub use health::{ReadinessState, health_check, readiness_check};
pub use login::{LoginOption, LoginState, authorization_callback, login_options, start_authorization};
pub use logout::{LogoutState, backchannel_logout, logout, logout_complete};
pub use me::{MeResponse, MeState, me};
pub use relay::{RelayState, relay};

use crate::error::internal_error_response;

/// `302 Found` でリダイレクトする
///
/// axum の `Redirect` は 303/307/308 のみのため自前で組み立てる。
pub(crate) fn found(location: &str) -> Response {
   match HeaderValue::from_str(location) {
      Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
      Err(_) => internal_error_response(),
   }
}
