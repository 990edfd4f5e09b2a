//! 統合テスト共通のハーネス
//!
//! `build_app` に以下のスタブを渡してゲートウェイ全体を組み立てる。
//!
//! - [`StubIdp`]: 認可コードごとに主体と nonce を登録し、HS256 で署名した ID トークンを発行する
//! - [`StubUpstream`]: 受け取ったリクエストを記録し、失効させたトークンには 401 を返す
//! - [`ManualClock`]: トークンの期限を任意に進める
//!
//! セッションストアはインメモリ実装を使う。

#![allow(dead_code)]

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc,
      Mutex,
      atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
   },
   time::Duration as StdDuration,
};

use async_trait::async_trait;
use axum::{Router, body::Body};
use chrono::{DateTime, Duration, Utc};
use http::{HeaderMap, Method, Request, Response, StatusCode, header};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, jwk::JwkSet};
use relaygate_bff::{
   app_builder::{AppDependencies, build_app},
   client::{
      DiscoveryDocument,
      IdentityProviderClient,
      IdentityProviderError,
      RelayRequest,
      RelayResponse,
      TokenResponse,
      UpstreamClient,
      UpstreamError,
   },
   config::BffConfig,
   jwt::{BACKCHANNEL_LOGOUT_EVENT, StaticKeySource},
   provider::{Provider, ProviderRegistry},
};
use relaygate_domain::{
   authorization::{AuthorizationCode, CodeVerifier},
   clock::{Clock, ManualClock},
   session::SessionId,
   token::{AccessToken, IdToken, RefreshToken, TokenSet},
};
use relaygate_infra::{InMemoryAuthorizationRequestStore, InMemorySessionManager, SessionManager};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;

pub const PROVIDER: &str = "keycloak";
pub const ISSUER: &str = "https://idp.example.com/realms/main";
pub const PARTNER_PROVIDER: &str = "partner";
pub const PARTNER_ISSUER: &str = "https://sso.partner.example.com";
pub const CLIENT_ID: &str = "bff";
pub const SECRET: &[u8] = b"integration-test-secret";
pub const SESSION_COOKIE: &str = "session_id";
pub const CSRF_COOKIE: &str = "XSRF-TOKEN";
pub const CSRF_HEADER: &str = "x-xsrf-token";
/// アクセストークンの有効期間（秒）
pub const ACCESS_TOKEN_LIFETIME: i64 = 300;
/// リフレッシュの安全マージン（秒）
pub const REFRESH_MARGIN: i64 = 30;

pub fn epoch() -> DateTime<Utc> {
   DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn base_vars() -> HashMap<String, String> {
   let mut vars: HashMap<String, String> = [
      ("PUBLIC_BASE_URL", "https://app.example.com".to_string()),
      ("UPSTREAM_URL", "http://resource.internal:8081".to_string()),
      ("SESSION_STORE", "memory".to_string()),
      ("PUBLIC_ROUTES", "/api/public/**".to_string()),
      ("TOKEN_REFRESH_MARGIN_SECS", REFRESH_MARGIN.to_string()),
      ("OIDC_PROVIDERS", format!("{PROVIDER},{PARTNER_PROVIDER}")),
   ]
   .into_iter()
   .map(|(key, value)| (key.to_string(), value))
   .collect();
   for (id, issuer, host) in [
      ("KEYCLOAK", ISSUER, "idp.example.com"),
      ("PARTNER", PARTNER_ISSUER, "sso.partner.example.com"),
   ] {
      for (suffix, value) in [
         ("ISSUER", issuer.to_string()),
         ("CLIENT_ID", CLIENT_ID.to_string()),
         ("CLIENT_SECRET", "secret".to_string()),
         ("AUTHORIZATION_ENDPOINT", format!("https://{host}/auth")),
         ("TOKEN_ENDPOINT", format!("https://{host}/token")),
      ] {
         vars.insert(format!("OIDC_{id}_{suffix}"), value);
      }
   }
   vars.insert(
      "OIDC_KEYCLOAK_END_SESSION_ENDPOINT".to_string(),
      "https://idp.example.com/logout".to_string(),
   );
   vars
}

/// ID トークン・ログアウトトークンを署名する
pub fn sign(claims: &Value) -> String {
   encode(
      &Header::new(Algorithm::HS256),
      claims,
      &EncodingKey::from_secret(SECRET),
   )
   .unwrap()
}

/// バックチャネルログアウトトークン
pub fn logout_token(issuer: &str, subject: Option<&str>, sid: Option<&str>, issued_at: DateTime<Utc>) -> String {
   let mut claims = json!({
      "iss": issuer,
      "aud": CLIENT_ID,
      "iat": issued_at.timestamp(),
      "jti": format!("logout-{}", issued_at.timestamp_millis()),
      "events": { BACKCHANNEL_LOGOUT_EVENT: {} }
   });
   if let Some(sub) = subject {
      claims["sub"] = Value::from(sub);
   }
   if let Some(sid) = sid {
      claims["sid"] = Value::from(sid);
   }
   sign(&claims)
}

// ===== スタブ IdP =====

/// 認可コードに結び付いた認可結果
#[derive(Debug, Clone)]
struct Grant {
   subject: String,
   nonce:   String,
   sid:     Option<String>,
}

/// 発行したトークン
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTokens {
   pub access_token:  String,
   pub refresh_token: Option<String>,
   pub id_token:      Option<String>,
   pub expires_at:    DateTime<Utc>,
}

pub struct StubIdp {
   clock:          Arc<ManualClock>,
   grants:         Mutex<HashMap<String, Grant>>,
   issued:         Mutex<Vec<IssuedTokens>>,
   sequence:       AtomicUsize,
   lifetime_secs:  AtomicI64,
   refresh_delay:  Mutex<StdDuration>,
   refresh_error:  Mutex<Option<IdentityProviderError>>,
   exchange_calls: AtomicUsize,
   refresh_calls:  AtomicUsize,
}

impl StubIdp {
   fn new(clock: Arc<ManualClock>) -> Self {
      Self {
         clock,
         grants: Mutex::new(HashMap::new()),
         issued: Mutex::new(Vec::new()),
         sequence: AtomicUsize::new(0),
         lifetime_secs: AtomicI64::new(ACCESS_TOKEN_LIFETIME),
         refresh_delay: Mutex::new(StdDuration::ZERO),
         refresh_error: Mutex::new(None),
         exchange_calls: AtomicUsize::new(0),
         refresh_calls: AtomicUsize::new(0),
      }
   }

   /// ユーザーがログインを承認し、IdP が認可コードを発行したことにする
   pub fn approve(&self, code: &str, subject: &str, nonce: &str, sid: Option<&str>) {
      self.grants.lock().unwrap().insert(
         code.to_string(),
         Grant {
            subject: subject.to_string(),
            nonce:   nonce.to_string(),
            sid:     sid.map(str::to_string),
         },
      );
   }

   pub fn set_access_token_lifetime(&self, secs: i64) {
      self.lifetime_secs.store(secs, Ordering::SeqCst);
   }

   pub fn set_refresh_delay(&self, delay: StdDuration) {
      *self.refresh_delay.lock().unwrap() = delay;
   }

   /// 以降のリフレッシュを `error` で失敗させる（`None` で復旧）
   pub fn fail_refresh(&self, error: Option<IdentityProviderError>) {
      *self.refresh_error.lock().unwrap() = error;
   }

   pub fn exchange_calls(&self) -> usize {
      self.exchange_calls.load(Ordering::SeqCst)
   }

   pub fn refresh_calls(&self) -> usize {
      self.refresh_calls.load(Ordering::SeqCst)
   }

   /// 発行順のトークン一覧
   pub fn issued(&self) -> Vec<IssuedTokens> {
      self.issued.lock().unwrap().clone()
   }

   pub fn last_issued(&self) -> IssuedTokens {
      self.issued().last().cloned().expect("トークンが発行されていること")
   }

   /// アクセストークンの期限
   pub fn expiry_of(&self, access_token: &str) -> Option<DateTime<Utc>> {
      self.issued()
         .into_iter()
         .find(|t| t.access_token == access_token)
         .map(|t| t.expires_at)
   }

   fn issue(
      &self,
      subject: &str,
      refresh_token: Option<String>,
      id_token: Option<String>,
   ) -> TokenResponse {
      let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
      let lifetime = self.lifetime_secs.load(Ordering::SeqCst);
      let tokens = IssuedTokens {
         access_token: format!("access-{subject}-{n}"),
         refresh_token,
         id_token,
         expires_at: self.clock.now() + Duration::seconds(lifetime),
      };
      self.issued.lock().unwrap().push(tokens.clone());

      TokenResponse {
         access_token:  AccessToken::new(tokens.access_token),
         token_type:    Some("Bearer".to_string()),
         expires_in:    Some(lifetime),
         refresh_token: tokens.refresh_token.map(RefreshToken::new),
         id_token:      tokens.id_token.map(IdToken::new),
         scope:         Some("openid offline_access".to_string()),
      }
   }

   fn id_token(&self, provider: &Provider, grant: &Grant) -> String {
      let now = self.clock.now();
      let mut claims = json!({
         "iss": provider.issuer,
         "sub": grant.subject,
         "aud": provider.client_id,
         "iat": now.timestamp(),
         "exp": (now + Duration::minutes(5)).timestamp(),
         "nonce": grant.nonce,
         "realm_access": { "roles": ["user"] }
      });
      if let Some(sid) = &grant.sid {
         claims["sid"] = Value::from(sid.as_str());
      }
      sign(&claims)
   }
}

#[async_trait]
impl IdentityProviderClient for StubIdp {
   async fn exchange_code(
      &self,
      provider: &Provider,
      code: &AuthorizationCode,
      _code_verifier: &CodeVerifier,
   ) -> Result<TokenResponse, IdentityProviderError> {
      self.exchange_calls.fetch_add(1, Ordering::SeqCst);
      // 認可コードは 1 回しか使えない
      let grant = self
         .grants
         .lock()
         .unwrap()
         .remove(code.as_str())
         .ok_or(IdentityProviderError::InvalidGrant)?;

      let id_token = self.id_token(provider, &grant);
      let refresh_token = format!("refresh-{}", grant.subject);
      Ok(self.issue(&grant.subject, Some(refresh_token), Some(id_token)))
   }

   async fn refresh(
      &self,
      _provider: &Provider,
      refresh_token: &RefreshToken,
   ) -> Result<TokenResponse, IdentityProviderError> {
      self.refresh_calls.fetch_add(1, Ordering::SeqCst);
      let delay = *self.refresh_delay.lock().unwrap();
      tokio::time::sleep(delay).await;

      if let Some(error) = self.refresh_error.lock().unwrap().clone() {
         return Err(error);
      }
      let subject = refresh_token
         .as_str()
         .strip_prefix("refresh-")
         .ok_or(IdentityProviderError::InvalidGrant)?
         .to_string();
      // リフレッシュトークンはローテーションしない
      Ok(self.issue(&subject, None, None))
   }

   async fn discover(&self, _issuer: &str) -> Result<DiscoveryDocument, IdentityProviderError> {
      Err(IdentityProviderError::Unavailable("discovery is not stubbed".to_string()))
   }

   async fn fetch_jwks(&self, _jwks_uri: &Url) -> Result<JwkSet, IdentityProviderError> {
      Err(IdentityProviderError::Unavailable("jwks is not stubbed".to_string()))
   }
}

// ===== スタブ上流 =====

/// 上流が受け取ったリクエスト
#[derive(Debug, Clone)]
pub struct Received {
   pub method:         Method,
   pub path_and_query: String,
   pub bearer:         Option<String>,
   pub headers:        HeaderMap,
   pub body:           Vec<u8>,
}

#[derive(Default)]
pub struct StubUpstream {
   received:   Mutex<Vec<Received>>,
   revoked:    Mutex<HashSet<String>>,
   reject_all: AtomicBool,
}

impl StubUpstream {
   /// このアクセストークンを 401 で拒否する
   pub fn revoke(&self, access_token: &str) {
      self.revoked.lock().unwrap().insert(access_token.to_string());
   }

   /// すべての Bearer を 401 で拒否する
   pub fn reject_every_token(&self) {
      self.reject_all.store(true, Ordering::SeqCst);
   }

   pub fn received(&self) -> Vec<Received> {
      self.received.lock().unwrap().clone()
   }

   pub fn last_received(&self) -> Received {
      self.received().last().cloned().expect("上流にリクエストが届いていること")
   }
}

#[async_trait]
impl UpstreamClient for StubUpstream {
   async fn send(
      &self,
      request: &RelayRequest,
      bearer: Option<&AccessToken>,
   ) -> Result<RelayResponse, UpstreamError> {
      let bearer = bearer.map(|t| t.as_str().to_string());
      self.received.lock().unwrap().push(Received {
         method:         request.method.clone(),
         path_and_query: request.path_and_query.clone(),
         bearer:         bearer.clone(),
         headers:        request.headers.clone(),
         body:           request.body.to_vec(),
      });

      let rejected = bearer.as_ref().is_some_and(|token| {
         self.reject_all.load(Ordering::SeqCst) || self.revoked.lock().unwrap().contains(token)
      });
      let mut headers = HeaderMap::new();
      if rejected {
         return Ok(RelayResponse {
            status: StatusCode::UNAUTHORIZED,
            headers,
            body: Default::default(),
         });
      }

      headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
      // 上流の Set-Cookie はブラウザに渡らないこと
      headers.insert(header::SET_COOKIE, "upstream=1".parse().unwrap());
      Ok(RelayResponse {
         status: StatusCode::OK,
         headers,
         body: r#"{"ok":true}"#.into(),
      })
   }
}

// ===== ゲートウェイ =====

/// ログイン済みのブラウザ
#[derive(Debug, Clone)]
pub struct Browser {
   pub session_id: String,
   pub csrf_token: String,
}

impl Browser {
   pub fn cookie_header(&self) -> String {
      format!("{SESSION_COOKIE}={}; {CSRF_COOKIE}={}", self.session_id, self.csrf_token)
   }

   pub fn session_id(&self) -> SessionId {
      SessionId::parse(&self.session_id).expect("セッション ID の形式であること")
   }

   /// Cookie だけを付けたリクエスト
   pub fn request(&self, method: Method, uri: &str) -> Request<Body> {
      Request::builder()
         .method(method)
         .uri(uri)
         .header(header::COOKIE, self.cookie_header())
         .body(Body::empty())
         .unwrap()
   }

   /// Cookie と CSRF ヘッダーを付けたリクエスト
   pub fn request_with_csrf(&self, method: Method, uri: &str) -> Request<Body> {
      Request::builder()
         .method(method)
         .uri(uri)
         .header(header::COOKIE, self.cookie_header())
         .header(CSRF_HEADER, &self.csrf_token)
         .body(Body::empty())
         .unwrap()
   }
}

/// 認可エンドポイントへのリダイレクトから読み取った値
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
   pub location:     Url,
   pub state:        String,
   pub nonce:        String,
   pub state_cookie: String,
}

pub struct Gateway {
   pub app:      Router,
   pub idp:      Arc<StubIdp>,
   pub upstream: Arc<StubUpstream>,
   pub clock:    Arc<ManualClock>,
   pub store:    Arc<InMemorySessionManager>,
   codes:        AtomicUsize,
}

impl Gateway {
   pub async fn start() -> Self {
      Self::start_with(&[]).await
   }

   /// 既定の設定に `overrides` を上書きして起動する
   pub async fn start_with(overrides: &[(&'static str, &str)]) -> Self {
      let mut vars = base_vars();
      for (key, value) in overrides {
         vars.insert((*key).to_string(), (*value).to_string());
      }
      let config = BffConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

      let clock = Arc::new(ManualClock::new(epoch()));
      let idp = Arc::new(StubIdp::new(clock.clone()));
      let upstream = Arc::new(StubUpstream::default());
      let store = Arc::new(InMemorySessionManager::new());
      let providers = ProviderRegistry::resolve(&config, idp.as_ref()).await.unwrap();

      let app = build_app(
         &config,
         AppDependencies {
            store:      store.clone(),
            requests:   Arc::new(InMemoryAuthorizationRequestStore::new()),
            idp:        idp.clone(),
            upstream:   upstream.clone(),
            key_source: Arc::new(StaticKeySource::hs256(SECRET)),
            providers:  Arc::new(providers),
            clock:      clock.clone(),
         },
      )
      .unwrap();

      Self {
         app,
         idp,
         upstream,
         clock,
         store,
         codes: AtomicUsize::new(0),
      }
   }

   pub async fn send(&self, request: Request<Body>) -> Response<Body> {
      self.app.clone().oneshot(request).await.unwrap()
   }

   pub async fn get(&self, uri: &str) -> Response<Body> {
      self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
         .await
   }

   pub fn advance(&self, secs: i64) {
      self.clock.advance(Duration::seconds(secs));
   }

   /// ログインを開始し、IdP へのリダイレクトを読み取る
   pub async fn begin_login(&self, provider: &str) -> AuthorizationRedirect {
      let response = self.get(&format!("/oauth2/authorization/{provider}")).await;
      assert_eq!(response.status(), StatusCode::FOUND);

      let location = Url::parse(location(&response)).unwrap();
      let query: HashMap<String, String> = location.query_pairs().into_owned().collect();
      let state_cookie = set_cookies(&response)
         .remove("oauth2_state")
         .expect("state Cookie が設定されること");

      AuthorizationRedirect {
         state: query["state"].clone(),
         nonce: query["nonce"].clone(),
         location,
         state_cookie,
      }
   }

   /// IdP からのコールバックを送る
   pub async fn callback(
      &self,
      provider: &str,
      query: &str,
      cookie: Option<&str>,
   ) -> Response<Body> {
      let mut builder = Request::builder().uri(format!("/login/oauth2/code/{provider}?{query}"));
      if let Some(cookie) = cookie {
         builder = builder.header(header::COOKIE, cookie);
      }
      self.send(builder.body(Body::empty()).unwrap()).await
   }

   /// IdP で承認された認可コードを新しく払い出す
   pub fn approve(&self, redirect: &AuthorizationRedirect, subject: &str, sid: Option<&str>) -> String {
      let code = format!("code-{}", self.codes.fetch_add(1, Ordering::SeqCst) + 1);
      self.idp.approve(&code, subject, &redirect.nonce, sid);
      code
   }

   pub async fn login(&self, subject: &str) -> Browser {
      self.login_via(PROVIDER, subject, None).await
   }

   /// 認可コードフローを最後まで進め、発行された Cookie を返す
   pub async fn login_via(&self, provider: &str, subject: &str, sid: Option<&str>) -> Browser {
      let redirect = self.begin_login(provider).await;
      let code = self.approve(&redirect, subject, sid);

      let response = self
         .callback(
            provider,
            &format!("code={code}&state={}", redirect.state),
            Some(&format!("oauth2_state={}", redirect.state_cookie)),
         )
         .await;
      assert_eq!(response.status(), StatusCode::FOUND, "ログインが成功すること");

      let mut cookies = set_cookies(&response);
      Browser {
         session_id: cookies.remove(SESSION_COOKIE).expect("セッション Cookie が設定されること"),
         csrf_token: cookies.remove(CSRF_COOKIE).expect("CSRF Cookie が設定されること"),
      }
   }

   /// ストアに保存されたトークン
   pub async fn token_set(&self, browser: &Browser) -> Option<TokenSet> {
      self.store.get_token_set(&browser.session_id()).await.unwrap()
   }

   /// セッションがまだ有効か
   pub async fn is_alive(&self, browser: &Browser) -> bool {
      self.store
         .resolve(&browser.session_id(), self.clock.now())
         .await
         .unwrap()
         .into_session()
         .is_some()
   }
}

pub fn location(response: &Response<Body>) -> &str {
   response
      .headers()
      .get(header::LOCATION)
      .expect("Location ヘッダーがあること")
      .to_str()
      .unwrap()
}

/// Set-Cookie の名前と値（削除指示は空文字）
pub fn set_cookies(response: &Response<Body>) -> HashMap<String, String> {
   response
      .headers()
      .get_all(header::SET_COOKIE)
      .iter()
      .filter_map(|value| value.to_str().ok())
      .filter_map(|raw| {
         let pair = raw.split(';').next()?;
         let (name, value) = pair.split_once('=')?;
         Some((name.trim().to_string(), value.trim().to_string()))
      })
      .collect()
}

pub async fn body_json(response: Response<Body>) -> Value {
   let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
   serde_json::from_slice(&bytes).unwrap()
}
