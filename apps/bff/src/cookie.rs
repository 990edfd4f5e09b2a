//! # Cookie 構築
//!
//! ゲートウェイが発行する 3 種類の Cookie を一箇所で組み立てる。
//!
//! | Cookie | HttpOnly | 用途 |
//! |--------|----------|------|
//! | セッション（既定 `session_id`） | Yes | 不透明なセッション ID |
//! | CSRF（既定 `XSRF-TOKEN`） | No | Double-submit 用。スクリプトが読んでヘッダーに載せる |
//! | `oauth2_state` | Yes | 認可リクエストの state をブラウザに束縛する |

use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::Duration;
use relaygate_domain::{authorization::State, csrf::CsrfToken, session::SessionId};

/// state Cookie 名
pub const STATE_COOKIE_NAME: &str = "oauth2_state";

/// state Cookie はコールバックにのみ送られればよい
const STATE_COOKIE_PATH: &str = "/login/oauth2/code";

#[derive(Debug, Clone)]
pub struct CookieSettings {
   pub session_cookie_name: String,
   pub csrf_cookie_name: String,
   pub csrf_header_name: String,
   pub secure: bool,
   pub same_site: SameSite,
   pub session_max_age: Duration,
}

impl CookieSettings {
   pub fn session_cookie(&self, session_id: &SessionId) -> Cookie<'static> {
      Cookie::build((self.session_cookie_name.clone(), session_id.as_str().to_string()))
         .path("/")
         .http_only(true)
         .secure(self.secure)
         .same_site(self.same_site)
         .max_age(to_time(self.session_max_age))
         .build()
   }

   pub fn clear_session_cookie(&self) -> Cookie<'static> {
      Cookie::build((self.session_cookie_name.clone(), ""))
         .path("/")
         .http_only(true)
         .secure(self.secure)
         .same_site(self.same_site)
         .max_age(time::Duration::ZERO)
         .build()
   }

   /// CSRF Cookie（スクリプトから読めるよう HttpOnly にしない）
   pub fn csrf_cookie(&self, token: &CsrfToken) -> Cookie<'static> {
      Cookie::build((self.csrf_cookie_name.clone(), token.as_str().to_string()))
         .path("/")
         .http_only(false)
         .secure(self.secure)
         .same_site(self.same_site)
         .max_age(to_time(self.session_max_age))
         .build()
   }

   pub fn clear_csrf_cookie(&self) -> Cookie<'static> {
      Cookie::build((self.csrf_cookie_name.clone(), ""))
         .path("/")
         .http_only(false)
         .secure(self.secure)
         .same_site(self.same_site)
         .max_age(time::Duration::ZERO)
         .build()
   }

   /// state Cookie
   ///
   /// IdP からのトップレベル遷移で送られる必要があるため、設定に関わらず SameSite=Lax。
   pub fn state_cookie(&self, state: &State, ttl: Duration) -> Cookie<'static> {
      Cookie::build((STATE_COOKIE_NAME, state.as_str().to_string()))
         .path(STATE_COOKIE_PATH)
         .http_only(true)
         .secure(self.secure)
         .same_site(SameSite::Lax)
         .max_age(to_time(ttl))
         .build()
   }

   pub fn clear_state_cookie(&self) -> Cookie<'static> {
      Cookie::build((STATE_COOKIE_NAME, ""))
         .path(STATE_COOKIE_PATH)
         .http_only(true)
         .secure(self.secure)
         .same_site(SameSite::Lax)
         .max_age(time::Duration::ZERO)
         .build()
   }
}

fn to_time(duration: Duration) -> time::Duration {
   time::Duration::seconds(duration.num_seconds())
}

#[cfg(test)]
mod tests {
   use super::*;

   fn settings() -> CookieSettings {
      CookieSettings {
         session_cookie_name: "session_id".to_string(),
         csrf_cookie_name: "XSRF-TOKEN".to_string(),
         csrf_header_name: "X-XSRF-TOKEN".to_string(),
         secure: true,
         same_site: SameSite::Strict,
         session_max_age: Duration::hours(8),
      }
   }

   #[test]
   fn test_セッションcookieはhttponlyでsecure() {
      let id = SessionId::generate();

      let cookie = settings().session_cookie(&id);

      assert_eq!(cookie.name(), "session_id");
      assert_eq!(cookie.value(), id.as_str());
      assert_eq!(cookie.http_only(), Some(true));
      assert_eq!(cookie.secure(), Some(true));
      assert_eq!(cookie.same_site(), Some(SameSite::Strict));
      assert_eq!(cookie.max_age(), Some(time::Duration::hours(8)));
   }

   #[test]
   fn test_csrf_cookieはスクリプトから読める() {
      let token = CsrfToken::generate();

      let cookie = settings().csrf_cookie(&token);

      assert_eq!(cookie.name(), "XSRF-TOKEN");
      assert_eq!(cookie.http_only(), Some(false));
      assert_eq!(cookie.path(), Some("/"));
   }

   #[test]
   fn test_state_cookieは常にlaxでコールバックパス限定() {
      let state = State::generate();

      let cookie = settings().state_cookie(&state, Duration::minutes(5));

      assert_eq!(cookie.same_site(), Some(SameSite::Lax));
      assert_eq!(cookie.path(), Some("/login/oauth2/code"));
      assert_eq!(cookie.max_age(), Some(time::Duration::minutes(5)));
   }

   #[test]
   fn test_削除用cookieはmax_age0() {
      let cookie = settings().clear_session_cookie();

      assert_eq!(cookie.value(), "");
      assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
   }
}
