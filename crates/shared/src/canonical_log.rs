//! # Canonical Log Line ミドルウェア
//!
//! リクエスト完了時に、そのリクエストの要点を1行に集約したサマリログを出力する tower Layer。
//! ([Canonical Log Lines](https://brandur.org/canonical-log-lines))
//!
//! ゲートウェイでは「誰として中継したか」が調査の起点になるため、
//! ハンドラがレスポンス拡張に積んだ [`AuthOutcome`] を `auth.outcome` として出力する。
//!
//! ## レイヤー配置
//!
//! ```text
//! SetRequestIdLayer → TraceLayer → CanonicalLogLineLayer → [他のミドルウェア] → handler
//! ```

use std::{
   future::Future,
   pin::Pin,
   task::{Context, Poll},
   time::Instant,
};

use http::{Request, Response};
use tower::{Layer, Service};

/// ヘルスチェックパスは出力対象外
fn is_health_check_path(path: &str) -> bool {
   path == "/health" || path.starts_with("/health/")
}

/// 認証上の結果
///
/// ハンドラ・ミドルウェアがレスポンス拡張に挿入する。値はコード値のみで、
/// 主体やトークンの情報は含めない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome(pub &'static str);

impl AuthOutcome {
   pub const ANONYMOUS: Self = Self("anonymous");
   pub const AUTHENTICATED: Self = Self("authenticated");
   pub const REFRESHED: Self = Self("refreshed");
   pub const REJECTED: Self = Self("rejected");
}

#[derive(Clone, Debug)]
pub struct CanonicalLogLineLayer;

impl<S> Layer<S> for CanonicalLogLineLayer {
   type Service = CanonicalLogLineService<S>;

   fn layer(&self, inner: S) -> Self::Service {
      CanonicalLogLineService { inner }
   }
}

#[derive(Clone, Debug)]
pub struct CanonicalLogLineService<S> {
   inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CanonicalLogLineService<S>
where
   S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
   S::Future: Send + 'static,
   S::Error: std::fmt::Display + 'static,
   ReqBody: Send + 'static,
   ResBody: Send + 'static,
{
   type Error = S::Error;
   type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
   type Response = S::Response;

   fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
      self.inner.poll_ready(cx)
   }

   fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
      // poll_ready 済みの inner を使い、代わりに clone を残す
      let clone = self.inner.clone();
      let mut inner = std::mem::replace(&mut self.inner, clone);

      if is_health_check_path(req.uri().path()) {
         return Box::pin(async move { inner.call(req).await });
      }

      let method = req.method().clone();
      let start = Instant::now();

      Box::pin(async move {
         let result = inner.call(req).await;
         let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

         match &result {
            Ok(response) => {
               let outcome = response
                  .extensions()
                  .get::<AuthOutcome>()
                  .map_or("none", |o| o.0);
               tracing::info!(
                  log.r#type = "canonical",
                  http.method = %method,
                  http.status_code = response.status().as_u16(),
                  http.latency_ms = latency_ms,
                  auth.outcome = outcome,
                  "リクエスト完了"
               );
            }
            Err(err) => {
               tracing::error!(
                  log.r#type = "canonical",
                  http.method = %method,
                  http.latency_ms = latency_ms,
                  error.message = %err,
                  "リクエスト処理エラー"
               );
            }
         }

         result
      })
   }
}

#[cfg(test)]
mod tests {
   use std::{
      convert::Infallible,
      sync::{Arc, Mutex},
   };

   use tower::ServiceExt as _;
   use tracing_subscriber::layer::SubscriberExt;

   use super::*;

   #[derive(Clone)]
   struct StubService {
      status:  http::StatusCode,
      outcome: Option<AuthOutcome>,
   }

   impl Service<Request<()>> for StubService {
      type Error = Infallible;
      type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
      type Response = Response<()>;

      fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
         Poll::Ready(Ok(()))
      }

      fn call(&mut self, _req: Request<()>) -> Self::Future {
         let status = self.status;
         let outcome = self.outcome;
         Box::pin(async move {
            let mut response = Response::builder().status(status).body(()).unwrap();
            if let Some(outcome) = outcome {
               response.extensions_mut().insert(outcome);
            }
            Ok(response)
         })
      }
   }

   #[derive(Clone, Default)]
   struct CaptureLayer {
      events: Arc<Mutex<Vec<Vec<(String, String)>>>>,
   }

   impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CaptureLayer {
      fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
         let mut visitor = FieldVisitor::default();
         event.record(&mut visitor);
         self.events.lock().unwrap().push(visitor.fields);
      }
   }

   #[derive(Default)]
   struct FieldVisitor {
      fields: Vec<(String, String)>,
   }

   impl tracing::field::Visit for FieldVisitor {
      fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
         self.fields.push((field.name().to_string(), format!("{value:?}")));
      }

      fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
         self.fields.push((field.name().to_string(), value.to_string()));
      }

      fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
         self.fields.push((field.name().to_string(), value.to_string()));
      }
   }

   fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
      fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
   }

   async fn run(path: &str, service: StubService) -> Vec<Vec<(String, String)>> {
      let capture = CaptureLayer::default();
      let events = capture.events.clone();
      let subscriber = tracing_subscriber::registry().with(capture);
      let _guard = tracing::subscriber::set_default(subscriber);

      let request = Request::builder().uri(path).body(()).unwrap();
      CanonicalLogLineLayer
         .layer(service)
         .oneshot(request)
         .await
         .unwrap();

      events.lock().unwrap().clone()
   }

   #[test]
   fn test_is_health_check_pathの判定() {
      assert!(is_health_check_path("/health"));
      assert!(is_health_check_path("/health/ready"));
      assert!(!is_health_check_path("/healthz-proxy"));
      assert!(!is_health_check_path("/api/health"));
   }

   #[tokio::test]
   async fn test_関連付けられたauth_outcomeが出力される() {
      let events = run(
         "/api/orders",
         StubService {
            status:  http::StatusCode::OK,
            outcome: Some(AuthOutcome::REFRESHED),
         },
      )
      .await;

      assert_eq!(events.len(), 1);
      assert_eq!(field(&events[0], "log.type"), Some("canonical"));
      assert_eq!(field(&events[0], "http.status_code"), Some("200"));
      assert_eq!(field(&events[0], "auth.outcome"), Some("refreshed"));
   }

   #[tokio::test]
   async fn test_auth_outcome未設定ではnoneになる() {
      let events = run(
         "/login-options",
         StubService {
            status:  http::StatusCode::OK,
            outcome: None,
         },
      )
      .await;

      assert_eq!(field(&events[0], "auth.outcome"), Some("none"));
   }

   #[tokio::test]
   async fn test_healthパスでは出力されない() {
      let events = run(
         "/health/ready",
         StubService {
            status:  http::StatusCode::OK,
            outcome: None,
         },
      )
      .await;

      assert!(events.is_empty());
   }
}
