//! # Observability 基盤
//!
//! トレーシング初期化、ログ出力形式の切り替え、リクエスト ID 生成、
//! リクエストスパン構築を提供する。
//!
//! リクエストスパンには URI のパスのみを記録する。
//! OAuth2 コールバックのクエリ（`code`, `state`）をログに残さないため。

/// ログ出力形式
///
/// 環境変数 `LOG_FORMAT` で切り替える。
/// 値が未設定または不正な場合は [`Pretty`](LogFormat::Pretty) にフォールバックする。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
   /// JSON 形式（本番環境向け）
   Json,
   /// 人間が読みやすい形式（開発環境向け）
   #[default]
   Pretty,
}

impl LogFormat {
   /// 文字列からログ形式をパースする
   ///
   /// tracing 初期化前に呼ばれるため、警告は stderr に直接出す。
   pub fn parse(s: &str) -> Self {
      match s {
         "json" => Self::Json,
         "pretty" => Self::Pretty,
         other => {
            eprintln!("WARNING: unknown LOG_FORMAT={other:?}, falling back to pretty");
            Self::Pretty
         }
      }
   }

   pub fn from_env() -> Self {
      std::env::var("LOG_FORMAT")
         .map(|val| Self::parse(&val))
         .unwrap_or_default()
   }
}

/// トレーシング初期化設定
#[derive(Debug, Clone)]
pub struct TracingConfig {
   /// サービス名（JSON ログの `span.service` に出力）
   pub service_name: String,
   pub log_format:   LogFormat,
}

impl TracingConfig {
   pub fn new(service_name: impl Into<String>, log_format: LogFormat) -> Self {
      Self {
         service_name: service_name.into(),
         log_format,
      }
   }

   pub fn from_env(service_name: impl Into<String>) -> Self {
      Self::new(service_name, LogFormat::from_env())
   }
}

/// トレーシングを初期化する
///
/// `RUST_LOG` 未設定時は `"info,relaygate=debug"` をデフォルトとする。
/// `ErrorLayer` を登録し、`InfraError` が `SpanTrace` を捕捉できるようにする。
#[cfg(feature = "observability")]
pub fn init_tracing(config: TracingConfig) {
   use tracing_subscriber::{Layer as _, layer::SubscriberExt, util::SubscriberInitExt};

   let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| "info,relaygate=debug".into());

   let fmt_layer = match config.log_format {
      LogFormat::Json => tracing_subscriber::fmt::layer()
         .json()
         .flatten_event(true)
         .with_target(true)
         .with_current_span(true)
         .with_span_list(false)
         .boxed(),
      LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
   };

   tracing_subscriber::registry()
      .with(env_filter)
      .with(fmt_layer)
      .with(tracing_error::ErrorLayer::default())
      .init();

   tracing::debug!(service = %config.service_name, "トレーシングを初期化しました");
}

/// リクエスト ID ヘッダー名
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// UUID v7 でリクエスト ID を生成する
///
/// `SetRequestIdLayer` はクライアントが `X-Request-Id` を送ってきた場合その値を使い、
/// 無い場合のみこの生成器を呼ぶ。
#[cfg(feature = "observability")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuidV7;

#[cfg(feature = "observability")]
impl tower_http::request_id::MakeRequestId for MakeRequestUuidV7 {
   fn make_request_id<B>(
      &mut self,
      _request: &http::Request<B>,
   ) -> Option<tower_http::request_id::RequestId> {
      let id = uuid::Uuid::now_v7().to_string();
      http::HeaderValue::from_str(&id)
         .ok()
         .map(tower_http::request_id::RequestId::new)
   }
}

/// `TraceLayer` 用のリクエストスパンを構築する
///
/// `SetRequestIdLayer` の内側で呼ばれるため、`X-Request-Id` は常に存在する。
#[cfg(feature = "observability")]
pub fn make_request_span<B>(request: &http::Request<B>) -> tracing::Span {
   let request_id = request
      .headers()
      .get(REQUEST_ID_HEADER)
      .and_then(|v| v.to_str().ok())
      .unwrap_or("-");

   tracing::info_span!(
      "request",
      method = %request.method(),
      path = %request.uri().path(),
      request_id = %request_id,
   )
}
