//! # BFF エラーレスポンス
//!
//! ゲートウェイ自身が返すエラーを RFC 9457 形式の axum レスポンスに変換する。
//!
//! 上流 API のエラーはここを通さず、ステータスごと中継する。

use axum::{
   Json,
   http::{HeaderValue, StatusCode, header},
   response::{IntoResponse, Response},
};
use relaygate_infra::InfraError;
use relaygate_shared::{
   ErrorResponse,
   canonical_log::AuthOutcome,
   event_log::error::{category, kind},
};

use crate::{client::UpstreamError, usecase::RefreshError};

const PROBLEM_JSON: &str = "application/problem+json";

/// `ErrorResponse` を `application/problem+json` で返す
pub fn problem_response(body: ErrorResponse) -> Response {
   let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
   (
      status,
      [(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON))],
      Json(body),
   )
      .into_response()
}

pub fn unauthorized_response() -> Response {
   with_outcome(
      problem_response(ErrorResponse::unauthorized("認証が必要です")),
      AuthOutcome::REJECTED,
   )
}

pub fn csrf_rejected_response() -> Response {
   with_outcome(problem_response(ErrorResponse::csrf_mismatch()), AuthOutcome::REJECTED)
}

pub fn bad_request_response(detail: impl Into<String>) -> Response {
   problem_response(ErrorResponse::bad_request(detail))
}

pub fn payload_too_large_response() -> Response {
   problem_response(ErrorResponse::payload_too_large())
}

pub fn internal_error_response() -> Response {
   problem_response(ErrorResponse::internal_error())
}

pub fn bad_gateway_response() -> Response {
   problem_response(ErrorResponse::bad_gateway())
}

pub fn service_unavailable_response(detail: impl Into<String>) -> Response {
   problem_response(ErrorResponse::service_unavailable(detail))
}

/// レスポンス拡張に認証結果を積む（Canonical Log Line 用）
pub fn with_outcome(mut response: Response, outcome: AuthOutcome) -> Response {
   response.extensions_mut().insert(outcome);
   response
}

/// ストア障害をログに残して応答する
///
/// 接続断・タイムアウトは 503、それ以外は 500。
pub fn store_error_response(context: &str, err: &InfraError) -> Response {
   let unavailable = err.is_unavailable();
   tracing::error!(
      error.category = category::INFRASTRUCTURE,
      error.kind = kind::SESSION,
      error.unavailable = unavailable,
      error = %err,
      "{context}"
   );
   if unavailable {
      service_unavailable_response("セッションストアに一時的に接続できません")
   } else {
      internal_error_response()
   }
}

/// リフレッシュ失敗の応答
///
/// `Rejected` はセッション破棄済みなので 401、IdP 不達はセッションを残して 503。
pub fn refresh_error_response(err: &RefreshError) -> Response {
   match err {
      RefreshError::Rejected(_) => unauthorized_response(),
      RefreshError::Unavailable => {
         service_unavailable_response("認証基盤に一時的に接続できません")
      }
      RefreshError::Store(_) => internal_error_response(),
   }
}

/// 上流到達失敗の応答
pub fn upstream_error_response(err: &UpstreamError) -> Response {
   tracing::warn!(
      error.category = category::EXTERNAL_SERVICE,
      error.kind = kind::UPSTREAM,
      error = %err,
      "上流への中継に失敗しました"
   );
   match err {
      UpstreamError::Unavailable(_) => bad_gateway_response(),
      UpstreamError::Timeout => service_unavailable_response("上流の応答がタイムアウトしました"),
   }
}
