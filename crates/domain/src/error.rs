//! # ドメイン層エラー定義
//!
//! データモデルの整合性違反と、ログインフローの不正遷移を表現する。
//!
//! | エラー種別 | 用途 |
//! |-----------|------|
//! | `Validation` | 値の形式不正（クレーム欠落など） |
//! | `InvalidTransition` | ログインフロー・セッションの不正な状態遷移 |

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
   /// 値の検証失敗
   #[error("バリデーションエラー: {0}")]
   Validation(String),

   /// 不正な状態遷移
   ///
   /// `from` / `to` には状態名（`strum::IntoStaticStr` の値）が入る。
   #[error("不正な状態遷移: {from} -> {to}")]
   InvalidTransition {
      from: &'static str,
      to:   &'static str,
   },
}
