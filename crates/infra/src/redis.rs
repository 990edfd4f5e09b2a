//! # Redis 接続管理
//!
//! `ConnectionManager` は切断時に自動で再接続するため、起動時に一度だけ作成し、
//! セッションストアと認可リクエストストアで共有する（clone は安価）。

use redis::{Client, aio::ConnectionManager};

/// Redis 接続マネージャを作成する
///
/// `redis_url` の形式: `redis://[[username:]password@]host[:port][/database]`
/// （TLS は `rediss://`）
pub async fn create_connection_manager(redis_url: &str) -> Result<ConnectionManager, redis::RedisError> {
   let client = Client::open(redis_url)?;
   let manager = ConnectionManager::new(client).await?;
   tracing::info!("Redis に接続しました");
   Ok(manager)
}
