//! # CSRF トークン
//!
//! ダブルサブミット方式のトークン。スクリプトから読める Cookie で配布しつつ、
//! サーバー側でもセッションに紐付けて保持する。Cookie の値だけを盗んでも
//! セッション Cookie が無ければ検証を通らない。

use subtle::ConstantTimeEq as _;

define_random_token! {
   /// CSRF トークン
   pub struct CsrfToken { bytes: 32 }
}

impl CsrfToken {
   /// 提示された値と定数時間で比較する
   pub fn matches(&self, candidate: &str) -> bool {
      self.as_str().as_bytes().ct_eq(candidate.as_bytes()).into()
   }
}
