//! # Request ID 伝播
//!
//! ゲートウェイが受けたリクエストの Request ID を、IdP 呼び出しと上流転送に引き継ぐ。
//!
//! 1. [`store_request_id`] が `SetRequestIdLayer` の付与した
//!    [`RequestId`](tower_http::request_id::RequestId) を task-local に保存する
//! 2. [`inject_request_id`] / [`current_request_id`] がクライアント側で参照する
//!
//! トークンリフレッシュは `tokio::spawn` した別タスクで走るため、
//! [`scope_request_id`] でリーダーの Request ID を引き継ぐ。

use std::future::Future;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use relaygate_shared::observability::REQUEST_ID_HEADER;
use tower_http::request_id::RequestId;

tokio::task_local! {
   static REQUEST_ID: String;
}

/// 現在のタスクの Request ID（スコープ外では `None`）
pub fn current_request_id() -> Option<String> {
   REQUEST_ID.try_with(|id| id.clone()).ok()
}

pub async fn store_request_id(request: Request<Body>, next: Next) -> Response {
   let request_id = request
      .extensions()
      .get::<RequestId>()
      .and_then(|id| id.header_value().to_str().ok())
      .unwrap_or("-")
      .to_string();

   REQUEST_ID.scope(request_id, next.run(request)).await
}

/// 別タスクで実行する future に Request ID を引き継ぐ
pub async fn scope_request_id<F: Future>(request_id: Option<String>, future: F) -> F::Output {
   match request_id {
      Some(id) => REQUEST_ID.scope(id, future).await,
      None => future.await,
   }
}

/// reqwest のリクエストに `X-Request-Id` を付与する
pub fn inject_request_id(builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
   match current_request_id() {
      Some(id) => builder.header(REQUEST_ID_HEADER, id),
      None => builder,
   }
}
