//! # キャッシュ制御ミドルウェア
//!
//! ゲートウェイ自身のエンドポイント（ログイン・ログアウト・`/me` 等）の応答を
//! ブラウザや中間プロキシに保存させない。中継した上流の応答には適用しない。

use axum::{
   extract::Request,
   http::{HeaderValue, header},
   middleware::Next,
   response::Response,
};

/// `Cache-Control: no-store` と `Pragma: no-cache` を付与する
pub async fn no_store(request: Request, next: Next) -> Response {
   let mut response = next.run(request).await;
   let headers = response.headers_mut();
   headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
   headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
   response
}
