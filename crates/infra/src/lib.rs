//! # RelayGate インフラ層
//!
//! セッション・TokenSet・CSRF トークン・認可リクエストの保存を担当する。
//!
//! ## 責務
//!
//! - **セッションストア**: [`SessionManager`] トレイトと Redis / インメモリ実装
//! - **認可リクエストストア**: [`AuthorizationRequestStore`] トレイトと Redis / インメモリ実装
//! - **Redis 接続**: 自動再接続付き接続マネージャの生成
//!
//! ## 依存関係
//!
//! ```text
//! bff → infra → domain
//! ```
//!
//! 単一インスタンス運用ではインメモリ実装、複数インスタンス運用では Redis 実装を使う。
//! どちらも同じトレイトを実装し、bff 側はトレイトオブジェクトとして扱う。
//!
//! ## 使用例
//!
//! ```rust,ignore
//! use relaygate_infra::{RedisSessionManager, redis};
//!
//! let conn = redis::create_connection_manager("redis://localhost:6379").await?;
//! let sessions = RedisSessionManager::new(conn.clone());
//! ```

pub mod authorization_request;
pub mod error;
pub mod memory;
pub mod redis;
pub mod session;

pub use authorization_request::{AuthorizationRequestStore, RedisAuthorizationRequestStore};
pub use error::{InfraError, InfraErrorKind};
pub use memory::{InMemoryAuthorizationRequestStore, InMemorySessionManager};
pub use session::{DestroyedSessions, RedisSessionManager, SessionLookup, SessionManager};
