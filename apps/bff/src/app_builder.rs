//! # BFF アプリケーション構築
//!
//! DI（ユースケース・State）の初期化とルーター構築を担当する。
//! `main.rs` はインフラ初期化とサーバー起動に集中する。
//!
//! 統合テストもスタブの依存を渡してここからルーターを組み立てる。

use std::{net::SocketAddr, sync::Arc};

use axum::{
   Router,
   http::HeaderName,
   middleware::{from_fn, from_fn_with_state},
   routing::{any, get, post},
};
use relaygate_domain::clock::Clock;
use relaygate_infra::{AuthorizationRequestStore, SessionManager};
use relaygate_shared::{
   canonical_log::CanonicalLogLineLayer,
   observability::{MakeRequestUuidV7, make_request_span},
};
use tokio::{net::TcpListener, signal};
use tower_http::{
   request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
   trace::TraceLayer,
};

use crate::{
   client::{IdentityProviderClient, UpstreamClient},
   config::{BffConfig, ConfigError},
   handler::{
      LoginState,
      LogoutState,
      MeState,
      ReadinessState,
      RelayState,
      authorization_callback,
      backchannel_logout,
      health_check,
      login_options,
      logout,
      logout_complete,
      me,
      readiness_check,
      relay,
      start_authorization,
   },
   jwt::{KeySource, TokenVerifier},
   middleware::{
      CsrfState,
      SessionLayerState,
      csrf_guard,
      no_store,
      resolve_session,
      store_request_id,
      touch_session,
   },
   provider::ProviderRegistry,
   route_table::RouteTable,
   usecase::{LoginUseCase, LogoutUseCase, SessionService, TokenService},
};

/// インフラ初期化済みの依存
pub struct AppDependencies {
   pub store: Arc<dyn SessionManager>,
   pub requests: Arc<dyn AuthorizationRequestStore>,
   pub idp: Arc<dyn IdentityProviderClient>,
   pub upstream: Arc<dyn UpstreamClient>,
   pub key_source: Arc<dyn KeySource>,
   pub providers: Arc<ProviderRegistry>,
   pub clock: Arc<dyn Clock>,
}

/// DI コンテナの構築とルーター定義を行う
///
/// ユースケース → State → Router の順に組み立てる。
pub fn build_app(config: &BffConfig, deps: AppDependencies) -> Result<Router, ConfigError> {
   let csrf_header = HeaderName::from_bytes(config.cookies.csrf_header_name.as_bytes())
      .map_err(|e| ConfigError::invalid("CSRF_HEADER_NAME", e.to_string()))?;

   // ユースケース
   let verifier = Arc::new(TokenVerifier::new(
      deps.key_source,
      deps.clock.clone(),
      config.lifetimes.clock_skew_leeway,
   ));
   let sessions = Arc::new(SessionService::new(
      deps.store.clone(),
      deps.clock.clone(),
      config.lifetimes.session,
   ));
   let tokens = TokenService::new(
      deps.store.clone(),
      deps.providers.clone(),
      deps.idp.clone(),
      verifier.clone(),
      deps.clock.clone(),
      config.lifetimes.token_refresh_margin,
      config.lifetimes.default_token_lifetime,
   );
   let login = Arc::new(LoginUseCase::new(
      config,
      deps.providers.clone(),
      deps.requests,
      deps.idp,
      verifier.clone(),
      sessions.clone(),
      deps.clock,
   ));
   let logout_usecase = Arc::new(LogoutUseCase::new(
      config,
      deps.providers.clone(),
      sessions.clone(),
      deps.store.clone(),
      verifier,
   )?);

   // ミドルウェア用の状態
   let session_layer = SessionLayerState {
      sessions: sessions.clone(),
      cookies: config.cookies.clone(),
      create_anonymous: true,
   };
   // 認可コードフローのパスでは匿名セッションを作らない
   let oauth_session_layer = SessionLayerState {
      create_anonymous: false,
      ..session_layer.clone()
   };
   let csrf_state = CsrfState {
      sessions: sessions.clone(),
      cookie_name: config.cookies.csrf_cookie_name.clone(),
      header_name: csrf_header.clone(),
   };

   // ハンドラ用の状態
   let login_state = Arc::new(LoginState {
      login,
      providers: deps.providers,
      cookies: config.cookies.clone(),
      login_error_redirect: config.login_error_redirect.clone(),
   });
   let logout_state = Arc::new(LogoutState {
      logout: logout_usecase,
      cookies: config.cookies.clone(),
      response_mode: config.logout_response,
   });
   let me_state = Arc::new(MeState {
      store: deps.store.clone(),
   });
   let readiness_state = Arc::new(ReadinessState { store: deps.store });
   let relay_state = Arc::new(RelayState {
      tokens,
      upstream: deps.upstream,
      routes: RouteTable::new(&config.public_routes),
      cookies: config.cookies.clone(),
      csrf_header,
      login_redirect_url: config.login_redirect_url.clone(),
      max_body_bytes: config.max_relay_body_bytes,
      forwarded_proto: config.public_base_url.scheme().to_string(),
   });

   let app = Router::new()
      // ヘルスチェック
      .route("/health", get(health_check))
      .merge(
         Router::new()
            .route("/health/ready", get(readiness_check))
            .with_state(readiness_state),
      )
      // セッションを扱わないエンドポイント
      .merge(
         Router::new()
            .route("/login-options", get(login_options))
            .with_state(login_state.clone())
            .merge(
               Router::new()
                  .route("/logout/complete", get(logout_complete))
                  .route("/backchannel-logout", post(backchannel_logout))
                  .with_state(logout_state.clone()),
            )
            .layer(from_fn(no_store)),
      )
      // 認可コードフロー
      .merge(
         Router::new()
            .route("/oauth2/authorization/{provider}", get(start_authorization))
            .route("/login/oauth2/code/{provider}", get(authorization_callback))
            .with_state(login_state)
            .layer(from_fn_with_state(oauth_session_layer, resolve_session))
            .layer(from_fn(no_store)),
      )
      // セッション必須のゲートウェイエンドポイント
      .merge(
         Router::new()
            .route("/me", get(me))
            .with_state(me_state)
            .merge(
               Router::new()
                  .route("/logout", post(logout))
                  .with_state(logout_state),
            )
            .layer(from_fn_with_state(csrf_state.clone(), csrf_guard))
            .layer(from_fn_with_state(session_layer.clone(), resolve_session))
            .layer(from_fn(no_store)),
      )
      // 上流中継（下に書いたものが外側: セッション解決 → CSRF 検証 → touch → relay）
      .merge(
         Router::new()
            .route("/api/{*path}", any(relay))
            .with_state(relay_state)
            .layer(from_fn_with_state(sessions, touch_session))
            .layer(from_fn_with_state(csrf_state, csrf_guard))
            .layer(from_fn_with_state(session_layer, resolve_session)),
      )
      // Request ID レイヤー（レイヤー順序が重要: 下に書いたものが外側）
      // 1. SetRequestIdLayer（最外）: リクエスト受信時に UUID v7 を生成（またはクライアント提供値を使用）
      // 2. TraceLayer: カスタムスパンに request_id を含め、全ログに自動注入
      // 3. CanonicalLogLineLayer: リクエスト完了時に1行サマリログを出力（スパン内）
      // 4. PropagateRequestIdLayer: レスポンスヘッダーに X-Request-Id をコピー
      // 5. store_request_id: task-local に保存し、IdP・上流へのヘッダー伝播に使用
      .layer(from_fn(store_request_id))
      .layer(PropagateRequestIdLayer::x_request_id())
      .layer(CanonicalLogLineLayer)
      .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
      .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7));

   Ok(app)
}

/// 停止シグナルまでリクエストを受け付ける
///
/// シグナル後は新規接続を止め、処理中のリクエストの完了を待って戻る。
pub async fn serve(
   listener: TcpListener,
   app: Router,
   shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
   // X-Forwarded-For のため接続元アドレスを拡張に積む
   axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
      .with_graceful_shutdown(shutdown)
      .await
}

/// Ctrl+C または SIGTERM を待つ
pub async fn shutdown_signal() {
   let ctrl_c = async {
      if let Err(e) = signal::ctrl_c().await {
         tracing::error!("Ctrl+C ハンドラを登録できません: {}", e);
         std::future::pending::<()>().await;
      }
   };

   #[cfg(unix)]
   let terminate = async {
      match signal::unix::signal(signal::unix::SignalKind::terminate()) {
         Ok(mut sigterm) => {
            sigterm.recv().await;
         }
         Err(e) => {
            tracing::error!("SIGTERM ハンドラを登録できません: {}", e);
            std::future::pending::<()>().await;
         }
      }
   };

   #[cfg(not(unix))]
   let terminate = std::future::pending::<()>();

   tokio::select! {
      () = ctrl_c => {},
      () = terminate => {},
   }
   tracing::info!("停止シグナルを受信しました。処理中のリクエストを待って終了します");
}
