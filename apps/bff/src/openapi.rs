//! # OpenAPI 仕様定義
//!
//! utoipa を使用してゲートウェイ自身のエンドポイントの OpenAPI 仕様を生成する。
//! `/api/**` は上流 API をそのまま中継するため含めない。

use utoipa::{
   Modify,
   OpenApi,
   openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::handler::{health, login, logout, me};

#[derive(OpenApi)]
#[openapi(
   info(
      title = "relaygate BFF API",
      version = "0.1.0",
      description = "OAuth2 / OIDC 認証ゲートウェイ relaygate のエンドポイント"
   ),
   paths(
      // health
      health::health_check,
      health::readiness_check,
      // auth
      login::login_options,
      login::start_authorization,
      login::authorization_callback,
      logout::logout,
      logout::logout_complete,
      logout::backchannel_logout,
      me::me,
   ),
   components(schemas(
      relaygate_shared::ErrorResponse,
   )),
   tags(
      (name = "health", description = "ヘルスチェック"),
      (name = "auth", description = "認証・セッション"),
   ),
   modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// セキュリティスキーム定義
///
/// 既定の Cookie 名・ヘッダー名で記述する。
struct SecurityAddon;

impl Modify for SecurityAddon {
   fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
      let components = openapi.components.get_or_insert_default();
      components.add_security_scheme(
         "session_auth",
         SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::new("session_id"))),
      );
      components.add_security_scheme(
         "csrf_token",
         SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-XSRF-TOKEN"))),
      );
   }
}
