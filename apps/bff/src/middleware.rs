//! # ミドルウェア
//!
//! ゲートウェイの横断処理を提供する。
//!
//! ## レイヤーの内外関係
//!
//! ```text
//! resolve_session → csrf_guard → touch_session → handler
//! ```
//!
//! CSRF 検証は解決済みセッションを参照するため、セッション解決の内側に置く。

mod cache_control;
mod csrf;
pub mod request_id;
mod session;

pub use cache_control::no_store;
pub use csrf::{CsrfState, csrf_guard};
pub use request_id::store_request_id;
pub use session::{CurrentSession, SessionLayerState, resolve_session, touch_session};
