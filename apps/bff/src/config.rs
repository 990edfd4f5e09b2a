//! # BFF 設定
//!
//! 環境変数からゲートウェイの設定を読み込み、明示的な [`BffConfig`] として各コンポーネントに渡す。
//! グローバルな設定レジストリは持たない。
//!
//! 読み込みは [`BffConfig::from_lookup`] に集約しており、テストではマップから直接構築できる。

use std::{env, str::FromStr};

use axum_extra::extract::cookie::SameSite;
use chrono::Duration;
use relaygate_domain::{
   authorization::{ProviderId, ReturnTarget},
   session::SessionLifetime,
};
use thiserror::Error;
use url::Url;

use crate::cookie::CookieSettings;

/// 設定読み込みエラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
   #[error("{0} が設定されていません")]
   Missing(String),

   #[error("{key} の値が不正です: {reason}")]
   Invalid { key: String, reason: String },
}

impl ConfigError {
   pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
      Self::Invalid {
         key:    key.to_string(),
         reason: reason.into(),
      }
   }
}

/// セッションストアの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStoreKind {
   /// Redis（複数インスタンス運用）
   Redis,
   /// プロセス内メモリ（単一インスタンス運用・開発用）
   Memory,
}

/// `POST /logout` の応答形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutResponseMode {
   /// 302 Found + Location
   Redirect,
   /// 202 Accepted + Location（スクリプトから呼ぶクライアント向け）
   Accepted,
}

/// IdP ごとの設定
///
/// エンドポイントを省略した場合は起動時に Discovery で解決する。
#[derive(Clone)]
pub struct ProviderConfig {
   pub id: ProviderId,
   pub label: String,
   pub issuer: String,
   pub client_id: String,
   pub client_secret: String,
   pub scopes: Vec<String>,
   pub authorization_endpoint: Option<Url>,
   pub token_endpoint: Option<Url>,
   pub jwks_uri: Option<Url>,
   pub end_session_endpoint: Option<Url>,
   /// ロールを読むクレームのドット区切りパス
   pub roles_claim: String,
}

impl std::fmt::Debug for ProviderConfig {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ProviderConfig")
         .field("id", &self.id)
         .field("label", &self.label)
         .field("issuer", &self.issuer)
         .field("client_id", &self.client_id)
         .field("client_secret", &"[REDACTED]")
         .field("scopes", &self.scopes)
         .field("authorization_endpoint", &self.authorization_endpoint)
         .field("token_endpoint", &self.token_endpoint)
         .field("jwks_uri", &self.jwks_uri)
         .field("end_session_endpoint", &self.end_session_endpoint)
         .field("roles_claim", &self.roles_claim)
         .finish()
   }
}

/// 寿命・安全マージン
#[derive(Debug, Clone, Copy)]
pub struct Lifetimes {
   pub session: SessionLifetime,
   pub authorization_request: Duration,
   /// この時間内に失効するアクセストークンは転送前にリフレッシュする
   pub token_refresh_margin: Duration,
   /// トークン応答に `expires_in` がない場合の寿命
   pub default_token_lifetime: Duration,
   /// JWT 時刻検証の許容誤差
   pub clock_skew_leeway: Duration,
}

/// 外部呼び出しのタイムアウト
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
   /// Discovery・JWKS 取得を含む IdP 呼び出し全般
   pub identity_provider: std::time::Duration,
   /// 認可コードの交換（未設定なら `identity_provider` と同じ）
   pub token_exchange: std::time::Duration,
   /// リフレッシュ（未設定なら `identity_provider` と同じ）
   pub token_refresh: std::time::Duration,
   pub upstream: std::time::Duration,
}

/// BFF サーバーの設定
#[derive(Debug, Clone)]
pub struct BffConfig {
   /// バインドアドレス
   pub host: String,
   /// ポート番号
   pub port: u16,
   /// ブラウザから見たゲートウェイのベース URL（リダイレクト URI の生成に使う）
   pub public_base_url: Url,
   /// 上流リソース API のベース URL
   pub upstream_url: Url,
   pub session_store: SessionStoreKind,
   /// `SESSION_STORE=redis` のとき必須
   pub redis_url: Option<String>,
   /// 設定順を保持する（ログイン選択肢の表示順）
   pub providers: Vec<ProviderConfig>,
   /// `{baseUrl}` と `{provider}` を置換してリダイレクト URI を作る
   pub redirect_uri_template: String,
   /// 公開ルート（完全一致、または `/**` 終端の前方一致）
   pub public_routes: Vec<String>,
   /// 設定時、ブラウザ遷移の未認証リクエストは 401 ではなくここへリダイレクトする
   pub login_redirect_url: Option<String>,
   /// ログイン後の既定の戻り先（同一オリジンの相対パス）
   pub post_login_redirect: ReturnTarget,
   pub post_logout_redirect: String,
   pub login_error_redirect: String,
   pub logout_response: LogoutResponseMode,
   pub cookies: CookieSettings,
   pub lifetimes: Lifetimes,
   pub timeouts: Timeouts,
   pub max_relay_body_bytes: usize,
}

const DEFAULT_SCOPES: &str = "openid profile email offline_access";
const DEFAULT_ROLES_CLAIM: &str = "realm_access.roles";
const DEFAULT_REDIRECT_URI_TEMPLATE: &str = "{baseUrl}/login/oauth2/code/{provider}";

impl BffConfig {
   /// 環境変数から設定を読み込む
   pub fn from_env() -> Result<Self, ConfigError> {
      Self::from_lookup(|key| env::var(key).ok())
   }

   /// 任意のキー参照関数から設定を読み込む
   pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
      let vars = Vars { lookup };

      let session_store = match vars.optional("SESSION_STORE").as_deref() {
         None | Some("redis") => SessionStoreKind::Redis,
         Some("memory") => SessionStoreKind::Memory,
         Some(other) => {
            return Err(ConfigError::invalid(
               "SESSION_STORE",
               format!("redis または memory を指定してください（{other}）"),
            ));
         }
      };
      let redis_url = vars.optional("REDIS_URL");
      if session_store == SessionStoreKind::Redis && redis_url.is_none() {
         return Err(ConfigError::Missing("REDIS_URL".to_string()));
      }

      let provider_ids = vars.list("OIDC_PROVIDERS");
      if provider_ids.is_empty() {
         return Err(ConfigError::Missing("OIDC_PROVIDERS".to_string()));
      }
      let providers = provider_ids
         .iter()
         .map(|id| vars.provider(id))
         .collect::<Result<Vec<_>, _>>()?;

      let logout_response = match vars.parse_or::<u16>("LOGOUT_RESPONSE_STATUS", 302)? {
         302 => LogoutResponseMode::Redirect,
         202 => LogoutResponseMode::Accepted,
         other => {
            return Err(ConfigError::invalid(
               "LOGOUT_RESPONSE_STATUS",
               format!("302 または 202 を指定してください（{other}）"),
            ));
         }
      };

      let same_site = match vars.optional("COOKIE_SAME_SITE").as_deref() {
         None | Some("lax") => SameSite::Lax,
         Some("strict") => SameSite::Strict,
         Some(other) => {
            return Err(ConfigError::invalid(
               "COOKIE_SAME_SITE",
               format!("lax または strict を指定してください（{other}）"),
            ));
         }
      };

      let session = SessionLifetime {
         idle:     vars.seconds_or("SESSION_IDLE_TIMEOUT_SECS", 1800)?,
         absolute: vars.seconds_or("SESSION_ABSOLUTE_TIMEOUT_SECS", 28800)?,
      };

      let idp_timeout_secs: u64 = vars.parse_or("IDP_TIMEOUT_SECS", 10)?;
      let cookies = CookieSettings {
         session_cookie_name: vars.string_or("SESSION_COOKIE_NAME", "session_id"),
         csrf_cookie_name: vars.string_or("CSRF_COOKIE_NAME", "XSRF-TOKEN"),
         csrf_header_name: vars.string_or("CSRF_HEADER_NAME", "X-XSRF-TOKEN"),
         secure: vars.parse_or("COOKIE_SECURE", true)?,
         same_site,
         session_max_age: session.absolute,
      };

      Ok(Self {
         host: vars.string_or("BFF_HOST", "0.0.0.0"),
         port: vars.parse_or("BFF_PORT", 8080)?,
         public_base_url: vars.url("PUBLIC_BASE_URL")?,
         upstream_url: vars.url("UPSTREAM_URL")?,
         session_store,
         redis_url,
         providers,
         redirect_uri_template: vars.string_or("REDIRECT_URI_TEMPLATE", DEFAULT_REDIRECT_URI_TEMPLATE),
         public_routes: vars.list("PUBLIC_ROUTES"),
         login_redirect_url: vars.optional("LOGIN_REDIRECT_URL"),
         post_login_redirect: vars.return_target("POST_LOGIN_REDIRECT")?,
         post_logout_redirect: vars.string_or("POST_LOGOUT_REDIRECT", "/"),
         login_error_redirect: vars.string_or("LOGIN_ERROR_REDIRECT", "/"),
         logout_response,
         cookies,
         lifetimes: Lifetimes {
            session,
            authorization_request: vars.seconds_or("AUTHORIZATION_REQUEST_TTL_SECS", 300)?,
            token_refresh_margin: vars.seconds_or("TOKEN_REFRESH_MARGIN_SECS", 30)?,
            default_token_lifetime: vars.seconds_or("DEFAULT_TOKEN_LIFETIME_SECS", 300)?,
            clock_skew_leeway: vars.seconds_or("CLOCK_SKEW_LEEWAY_SECS", 60)?,
         },
         timeouts: Timeouts {
            identity_provider: std::time::Duration::from_secs(idp_timeout_secs),
            token_exchange: std::time::Duration::from_secs(
               vars.parse_or("TOKEN_EXCHANGE_TIMEOUT_SECS", idp_timeout_secs)?,
            ),
            token_refresh: std::time::Duration::from_secs(
               vars.parse_or("TOKEN_REFRESH_TIMEOUT_SECS", idp_timeout_secs)?,
            ),
            upstream: std::time::Duration::from_secs(vars.parse_or("UPSTREAM_TIMEOUT_SECS", 30)?),
         },
         max_relay_body_bytes: vars.parse_or("MAX_RELAY_BODY_BYTES", 10 * 1024 * 1024)?,
      })
   }

   /// プロバイダのリダイレクト URI（コールバック URL）
   pub fn redirect_uri(&self, provider_id: &ProviderId) -> Result<Url, ConfigError> {
      let base = self.public_base_url.as_str().trim_end_matches('/');
      let uri = self
         .redirect_uri_template
         .replace("{baseUrl}", base)
         .replace("{provider}", provider_id.as_str());
      Url::parse(&uri).map_err(|e| ConfigError::invalid("REDIRECT_URI_TEMPLATE", e.to_string()))
   }

   /// ゲートウェイ上のパスを絶対 URL にする
   pub fn public_url(&self, path: &str) -> Result<Url, ConfigError> {
      self.public_base_url
         .join(path)
         .map_err(|e| ConfigError::invalid("PUBLIC_BASE_URL", e.to_string()))
   }
}

/// キー参照のヘルパー
struct Vars<F> {
   lookup: F,
}

impl<F> Vars<F>
where
   F: Fn(&str) -> Option<String>,
{
   /// 空文字は未設定として扱う
   fn optional(&self, key: &str) -> Option<String> {
      (self.lookup)(key)
         .map(|v| v.trim().to_string())
         .filter(|v| !v.is_empty())
   }

   fn required(&self, key: &str) -> Result<String, ConfigError> {
      self.optional(key)
         .ok_or_else(|| ConfigError::Missing(key.to_string()))
   }

   fn return_target(&self, key: &str) -> Result<ReturnTarget, ConfigError> {
      let value = self.string_or(key, "/");
      ReturnTarget::parse(&value)
         .ok_or_else(|| ConfigError::invalid(key, "同一オリジンの相対パスを指定してください"))
   }

   fn string_or(&self, key: &str, default: &str) -> String {
      self.optional(key).unwrap_or_else(|| default.to_string())
   }

   fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
   where
      T: FromStr,
      T::Err: std::fmt::Display,
   {
      match self.optional(key) {
         Some(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
         None => Ok(default),
      }
   }

   fn seconds_or(&self, key: &str, default: i64) -> Result<Duration, ConfigError> {
      let secs: i64 = self.parse_or(key, default)?;
      if secs <= 0 {
         return Err(ConfigError::invalid(key, "正の秒数を指定してください"));
      }
      Ok(Duration::seconds(secs))
   }

   fn url(&self, key: &str) -> Result<Url, ConfigError> {
      let value = self.required(key)?;
      Url::parse(&value).map_err(|e| ConfigError::invalid(key, e.to_string()))
   }

   fn optional_url(&self, key: &str) -> Result<Option<Url>, ConfigError> {
      self.optional(key)
         .map(|value| Url::parse(&value).map_err(|e| ConfigError::invalid(key, e.to_string())))
         .transpose()
   }

   /// カンマ区切りのリスト
   fn list(&self, key: &str) -> Vec<String> {
      self.optional(key)
         .map(|value| {
            value
               .split(',')
               .map(str::trim)
               .filter(|s| !s.is_empty())
               .map(str::to_string)
               .collect()
         })
         .unwrap_or_default()
   }

   fn provider(&self, raw_id: &str) -> Result<ProviderConfig, ConfigError> {
      let id = ProviderId::parse(raw_id).map_err(|e| ConfigError::invalid("OIDC_PROVIDERS", e.to_string()))?;
      let prefix = format!("OIDC_{}", raw_id.to_ascii_uppercase().replace('-', "_"));
      let key = |suffix: &str| format!("{prefix}_{suffix}");

      Ok(ProviderConfig {
         label: self.string_or(&key("LABEL"), raw_id),
         issuer: self.required(&key("ISSUER"))?,
         client_id: self.required(&key("CLIENT_ID"))?,
         client_secret: self.required(&key("CLIENT_SECRET"))?,
         scopes: self
            .string_or(&key("SCOPES"), DEFAULT_SCOPES)
            .split_whitespace()
            .map(str::to_string)
            .collect(),
         authorization_endpoint: self.optional_url(&key("AUTHORIZATION_ENDPOINT"))?,
         token_endpoint: self.optional_url(&key("TOKEN_ENDPOINT"))?,
         jwks_uri: self.optional_url(&key("JWKS_URI"))?,
         end_session_endpoint: self.optional_url(&key("END_SESSION_ENDPOINT"))?,
         roles_claim: self.string_or(&key("ROLES_CLAIM"), DEFAULT_ROLES_CLAIM),
         id,
      })
   }
}

#[cfg(test)]
mod tests {
   // テスト間で環境変数の競合を避けるため、マップから読み込んで検証する

   use std::collections::HashMap;

   use pretty_assertions::assert_eq;
   use rstest::rstest;

   use super::*;

   fn base_vars() -> HashMap<&'static str, &'static str> {
      HashMap::from([
         ("PUBLIC_BASE_URL", "https://app.example.com"),
         ("UPSTREAM_URL", "http://resource:8081"),
         ("REDIS_URL", "redis://localhost:6379"),
         ("OIDC_PROVIDERS", "keycloak"),
         ("OIDC_KEYCLOAK_ISSUER", "https://idp.example.com/realms/main"),
         ("OIDC_KEYCLOAK_CLIENT_ID", "bff"),
         ("OIDC_KEYCLOAK_CLIENT_SECRET", "secret"),
      ])
   }

   fn load(vars: &HashMap<&'static str, &'static str>) -> Result<BffConfig, ConfigError> {
      BffConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
   }

   #[test]
   fn test_必須項目のみで既定値が入る() {
      let config = load(&base_vars()).unwrap();

      assert_eq!(config.port, 8080);
      assert_eq!(config.session_store, SessionStoreKind::Redis);
      assert_eq!(config.logout_response, LogoutResponseMode::Redirect);
      assert_eq!(config.cookies.session_cookie_name, "session_id");
      assert_eq!(config.cookies.csrf_cookie_name, "XSRF-TOKEN");
      assert_eq!(config.cookies.csrf_header_name, "X-XSRF-TOKEN");
      assert!(config.cookies.secure);
      assert_eq!(config.lifetimes.session.idle, Duration::seconds(1800));
      assert_eq!(config.lifetimes.session.absolute, Duration::seconds(28800));
      assert_eq!(config.lifetimes.token_refresh_margin, Duration::seconds(30));
      assert_eq!(config.max_relay_body_bytes, 10 * 1024 * 1024);

      let provider = &config.providers[0];
      assert_eq!(provider.label, "keycloak");
      assert_eq!(provider.roles_claim, "realm_access.roles");
      assert_eq!(
         provider.scopes,
         vec!["openid", "profile", "email", "offline_access"]
      );
   }

   #[rstest]
   #[case(&[], 10, 10, 10)]
   #[case(&[("IDP_TIMEOUT_SECS", "5")], 5, 5, 5)]
   #[case(&[("TOKEN_EXCHANGE_TIMEOUT_SECS", "3"), ("TOKEN_REFRESH_TIMEOUT_SECS", "2")], 10, 3, 2)]
   fn test_トークン呼び出しのタイムアウトは個別指定がなければidpの値を使う(
      #[case] overrides: &[(&'static str, &'static str)],
      #[case] idp: u64,
      #[case] exchange: u64,
      #[case] refresh: u64,
   ) {
      let mut vars = base_vars();
      vars.extend(overrides.iter().copied());

      let timeouts = load(&vars).unwrap().timeouts;

      assert_eq!(timeouts.identity_provider, std::time::Duration::from_secs(idp));
      assert_eq!(timeouts.token_exchange, std::time::Duration::from_secs(exchange));
      assert_eq!(timeouts.token_refresh, std::time::Duration::from_secs(refresh));
   }

   #[test]
   fn test_redisストアでredis_urlがなければエラー() {
      let mut vars = base_vars();
      vars.remove("REDIS_URL");

      assert_eq!(
         load(&vars).unwrap_err(),
         ConfigError::Missing("REDIS_URL".to_string())
      );
   }

   #[test]
   fn test_memoryストアではredis_url不要() {
      let mut vars = base_vars();
      vars.remove("REDIS_URL");
      vars.insert("SESSION_STORE", "memory");

      assert_eq!(load(&vars).unwrap().session_store, SessionStoreKind::Memory);
   }

   #[test]
   fn test_プロバイダのclient_secret欠落はエラー() {
      let mut vars = base_vars();
      vars.remove("OIDC_KEYCLOAK_CLIENT_SECRET");

      assert_eq!(
         load(&vars).unwrap_err(),
         ConfigError::Missing("OIDC_KEYCLOAK_CLIENT_SECRET".to_string())
      );
   }

   #[test]
   fn test_ハイフンを含むプロバイダidは環境変数でアンダースコアになる() {
      let mut vars = base_vars();
      vars.insert("OIDC_PROVIDERS", "corp-sso");
      vars.insert("OIDC_CORP_SSO_ISSUER", "https://sso.corp.example.com");
      vars.insert("OIDC_CORP_SSO_CLIENT_ID", "bff");
      vars.insert("OIDC_CORP_SSO_CLIENT_SECRET", "s");
      vars.insert("OIDC_CORP_SSO_LABEL", "社内 SSO");

      let config = load(&vars).unwrap();

      assert_eq!(config.providers[0].id.as_str(), "corp-sso");
      assert_eq!(config.providers[0].label, "社内 SSO");
   }

   #[test]
   fn test_logout_response_statusは302と202のみ() {
      let mut vars = base_vars();
      vars.insert("LOGOUT_RESPONSE_STATUS", "202");
      assert_eq!(load(&vars).unwrap().logout_response, LogoutResponseMode::Accepted);

      vars.insert("LOGOUT_RESPONSE_STATUS", "200");
      assert!(matches!(
         load(&vars).unwrap_err(),
         ConfigError::Invalid { key, .. } if key == "LOGOUT_RESPONSE_STATUS"
      ));
   }

   #[test]
   fn test_ログイン後の戻り先は相対パスに限る() {
      let mut vars = base_vars();
      vars.insert("POST_LOGIN_REDIRECT", "https://evil.example.com/");

      assert!(matches!(
         load(&vars).unwrap_err(),
         ConfigError::Invalid { key, .. } if key == "POST_LOGIN_REDIRECT"
      ));
   }

   #[test]
   fn test_不正なポートはエラー() {
      let mut vars = base_vars();
      vars.insert("BFF_PORT", "http");

      assert!(matches!(
         load(&vars).unwrap_err(),
         ConfigError::Invalid { key, .. } if key == "BFF_PORT"
      ));
   }

   #[test]
   fn test_0秒の寿命はエラー() {
      let mut vars = base_vars();
      vars.insert("SESSION_IDLE_TIMEOUT_SECS", "0");

      assert!(load(&vars).is_err());
   }

   #[test]
   fn test_公開ルートはカンマ区切りで空要素を無視する() {
      let mut vars = base_vars();
      vars.insert("PUBLIC_ROUTES", "/api/public/**, ,/api/status");

      assert_eq!(
         load(&vars).unwrap().public_routes,
         vec!["/api/public/**", "/api/status"]
      );
   }

   #[test]
   fn test_リダイレクトuriはテンプレートから生成される() {
      let config = load(&base_vars()).unwrap();
      let id = ProviderId::parse("keycloak").unwrap();

      assert_eq!(
         config.redirect_uri(&id).unwrap().as_str(),
         "https://app.example.com/login/oauth2/code/keycloak"
      );
   }

   #[test]
   fn test_client_secretはdebug出力に含まれない() {
      let config = load(&base_vars()).unwrap();

      let debug = format!("{:?}", config.providers[0]);

      assert!(!debug.contains("secret\""));
      assert!(debug.contains("[REDACTED]"));
   }
}
