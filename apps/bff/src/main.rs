//! # BFF 認証ゲートウェイ
//!
//! ブラウザと上流リソース API の間に立ち、トークンをブラウザに渡さずに中継する。
//!
//! ## 役割
//!
//! - **認証**: OAuth2 / OIDC 認可コードフロー（PKCE + nonce）をブラウザの代わりに実行
//! - **セッション管理**: HttpOnly Cookie の不透明なセッション ID とトークンの対応を保持
//! - **トークン中継**: `/api/**` に Bearer を付与して上流へ転送し、期限前にリフレッシュ
//! - **CSRF 防御**: 状態変更リクエストの Double-submit 検証
//! - **ログアウト**: RP-initiated ログアウトとバックチャネルログアウト
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Browser    │────▶│  relaygate   │────▶│ Upstream API │
//! │              │     │     BFF      │     │ (Bearer 検証) │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                        │          │
//!                        ▼          ▼
//!                 ┌──────────┐ ┌──────────┐
//!                 │  Redis   │ │   IdP    │
//!                 │(Session) │ │ (OIDC)   │
//!                 └──────────┘ └──────────┘
//! ```
//!
//! ## 環境変数
//!
//! 主要なもののみ。全量は [`relaygate_bff::config`] を参照。
//!
//! | 変数名 | 必須 | 説明 |
//! |--------|------|------|
//! | `PUBLIC_BASE_URL` | **Yes** | ブラウザから見たゲートウェイの URL |
//! | `UPSTREAM_URL` | **Yes** | 上流リソース API の URL |
//! | `OIDC_PROVIDERS` | **Yes** | プロバイダ ID（カンマ区切り） |
//! | `SESSION_STORE` | No | `redis`（デフォルト）または `memory` |
//! | `REDIS_URL` | `redis` 時 | Redis 接続 URL |
//!
//! ## 起動方法
//!
//! ```bash
//! cargo run -p relaygate-bff
//! ```

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use relaygate_bff::{
   app_builder::{AppDependencies, build_app, serve, shutdown_signal},
   client::{IdentityProviderClient, ReqwestIdentityProviderClient, ReqwestUpstreamClient},
   config::{BffConfig, SessionStoreKind},
   jwt::JwksKeySource,
   provider::ProviderRegistry,
};
use relaygate_domain::clock::{Clock, SystemClock};
use relaygate_infra::{
   AuthorizationRequestStore,
   InMemoryAuthorizationRequestStore,
   InMemorySessionManager,
   RedisAuthorizationRequestStore,
   RedisSessionManager,
   SessionManager,
   redis::create_connection_manager,
};
use relaygate_shared::observability::{TracingConfig, init_tracing};
use tokio::net::TcpListener;

/// JWKS のキャッシュ期間
const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);

/// インメモリストアの期限切れエントリを掃除する間隔
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// BFF サーバーのエントリーポイント
///
/// 以下の順序で初期化を行う:
///
/// 1. 環境変数の読み込み（.env ファイル）
/// 2. トレーシングの初期化
/// 3. アプリケーション設定の読み込み
/// 4. セッションストア・IdP・上流クライアントの初期化
/// 5. プロバイダの解決（必要なら Discovery）
/// 6. ルーターの構築と HTTP サーバーの起動
#[tokio::main]
async fn main() -> anyhow::Result<()> {
   // .env ファイルを読み込む（存在する場合）
   dotenvy::dotenv().ok();

   init_tracing(TracingConfig::from_env("bff"));
   let _tracing_guard = tracing::info_span!("app", service = "bff").entered();

   let config = BffConfig::from_env().context("設定の読み込みに失敗しました")?;

   tracing::info!("BFF サーバーを起動します: {}:{}", config.host, config.port);

   let clock: Arc<dyn Clock> = Arc::new(SystemClock);
   let (store, requests) = init_stores(&config, clock.clone()).await?;

   let idp: Arc<dyn IdentityProviderClient> = Arc::new(
      ReqwestIdentityProviderClient::new(config.timeouts.identity_provider)
         .context("IdP クライアントの初期化に失敗しました")?
         .with_token_timeouts(config.timeouts.token_exchange, config.timeouts.token_refresh),
   );
   let upstream = Arc::new(
      ReqwestUpstreamClient::new(&config.upstream_url, config.timeouts.upstream)
         .context("上流クライアントの初期化に失敗しました")?,
   );
   let providers = Arc::new(
      ProviderRegistry::resolve(&config, idp.as_ref())
         .await
         .context("プロバイダの解決に失敗しました")?,
   );
   for provider in providers.iter() {
      tracing::info!(provider = %provider.id, issuer = %provider.issuer, "プロバイダを登録しました");
   }

   let app = build_app(
      &config,
      AppDependencies {
         store,
         requests,
         idp: idp.clone(),
         upstream,
         key_source: Arc::new(JwksKeySource::new(idp, JWKS_CACHE_TTL)),
         providers,
         clock,
      },
   )?;

   let addr: SocketAddr = format!("{}:{}", config.host, config.port)
      .parse()
      .context("バインドアドレスが不正です")?;
   let listener = TcpListener::bind(addr).await?;
   tracing::info!("BFF サーバーが起動しました: {}", addr);

   serve(listener, app, shutdown_signal()).await?;
   tracing::info!("BFF サーバーを停止しました");

   Ok(())
}

type Stores = (Arc<dyn SessionManager>, Arc<dyn AuthorizationRequestStore>);

/// 設定に応じてセッションストアを初期化する
async fn init_stores(config: &BffConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Stores> {
   match config.session_store {
      SessionStoreKind::Redis => {
         let url = config
            .redis_url
            .as_deref()
            .context("REDIS_URL が設定されていません")?;
         let conn = create_connection_manager(url)
            .await
            .context("Redis への接続に失敗しました")?;
         let store: Arc<dyn SessionManager> = Arc::new(RedisSessionManager::new(conn.clone()));
         let requests: Arc<dyn AuthorizationRequestStore> =
            Arc::new(RedisAuthorizationRequestStore::new(conn));
         Ok((store, requests))
      }
      SessionStoreKind::Memory => {
         tracing::warn!("インメモリのセッションストアを使用します（単一インスタンス専用）");
         let sessions = Arc::new(InMemorySessionManager::new());
         let requests = Arc::new(InMemoryAuthorizationRequestStore::new());
         spawn_purge_task(sessions.clone(), requests.clone(), clock);
         let store: Arc<dyn SessionManager> = sessions;
         let requests: Arc<dyn AuthorizationRequestStore> = requests;
         Ok((store, requests))
      }
   }
}

fn spawn_purge_task(
   sessions: Arc<InMemorySessionManager>,
   requests: Arc<InMemoryAuthorizationRequestStore>,
   clock: Arc<dyn Clock>,
) {
   tokio::spawn(async move {
      let mut interval = tokio::time::interval(PURGE_INTERVAL);
      loop {
         interval.tick().await;
         let now = clock.now();
         let purged = sessions.purge_expired(now) + requests.purge_expired(now);
         if purged > 0 {
            tracing::debug!(purged, "期限切れエントリを削除しました");
         }
      }
   });
}
