//! # RelayGate ドメイン層
//!
//! ブラウザセッションと IdP トークンを橋渡しするためのデータモデルを定義する。
//!
//! ## 設計方針
//!
//! - I/O を一切持たない（ストア・HTTP はインフラ層 / bff の責務）
//! - トークン・セッション ID などの秘密値は専用の Newtype で包み、`Debug` でマスクする
//! - ログインフローの状態遷移は ADT で表現し、不正な遷移を型で防ぐ
//! - 現在時刻は引数または [`clock::Clock`] で受け取る
//!
//! ## モジュール構成
//!
//! - [`session`] - セッション（匿名 / 認証済み）と主体
//! - [`token`] - TokenSet と ID トークンクレーム
//! - [`authorization`] - 認可リクエスト（state, PKCE, nonce）
//! - [`login_flow`] - OAuth2 クライアントの状態機械
//! - [`csrf`] - CSRF トークン
//! - [`clock`] - 時刻プロバイダ
//! - [`error`] - ドメインエラー
//!
//! ## 使用例
//!
//! ```rust
//! use relaygate_domain::{authorization::CodeVerifier, session::SessionId};
//!
//! let session_id = SessionId::generate();
//! assert_eq!(session_id.as_str().len(), 43);
//!
//! let verifier = CodeVerifier::generate();
//! assert_eq!(verifier.challenge().len(), 43);
//! ```

#[macro_use]
mod macros;

pub mod authorization;
pub mod clock;
pub mod csrf;
pub mod error;
pub mod login_flow;
pub mod session;
pub mod token;

pub use error::DomainError;
