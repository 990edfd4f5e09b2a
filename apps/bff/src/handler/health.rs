//! # ヘルスチェックハンドラ
//!
//! - `/health`: Liveness Check（常に `"healthy"` を返す）
//! - `/health/ready`: Readiness Check（セッションストアの疎通を確認する）

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use relaygate_infra::SessionManager;
use relaygate_shared::{CheckStatus, HealthResponse, ReadinessResponse, ReadinessStatus};

/// ストア疎通確認のタイムアウト
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[utoipa::path(
   get,
   path = "/health",
   tag = "health",
   responses(
      (status = 200, description = "サーバー稼働中", body = HealthResponse)
   )
)]
pub async fn health_check() -> Json<HealthResponse> {
   Json(HealthResponse::healthy(env!("CARGO_PKG_VERSION")))
}

pub struct ReadinessState {
   pub store: Arc<dyn SessionManager>,
}

/// 全チェック OK → 200、1 つでも失敗 → 503。
#[utoipa::path(
   get,
   path = "/health/ready",
   tag = "health",
   responses(
      (status = 200, description = "セッションストア稼働中", body = ReadinessResponse),
      (status = 503, description = "セッションストアが利用不可", body = ReadinessResponse)
   )
)]
#[tracing::instrument(skip_all)]
pub async fn readiness_check(State(state): State<Arc<ReadinessState>>) -> impl IntoResponse {
   let mut checks = HashMap::new();
   checks.insert("session_store".to_string(), check_store(state.store.as_ref()).await);

   let response = ReadinessResponse::from_checks(checks);
   let status = match response.status {
      ReadinessStatus::Ready => StatusCode::OK,
      ReadinessStatus::NotReady => StatusCode::SERVICE_UNAVAILABLE,
   };
   (status, Json(response))
}

async fn check_store(store: &dyn SessionManager) -> CheckStatus {
   match tokio::time::timeout(PING_TIMEOUT, store.ping()).await {
      Ok(Ok(())) => CheckStatus::Ok,
      Ok(Err(e)) => {
         tracing::warn!(error = %e, "readiness check: session store ping failed");
         CheckStatus::Error
      }
      Err(_) => {
         tracing::warn!("readiness check: session store ping timed out");
         CheckStatus::Error
      }
   }
}
