//! 秘密値 Newtype を定義する内部マクロ群

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore as _;

/// `len` バイトの暗号論的乱数を base64url（パディングなし）で返す
pub(crate) fn random_urlsafe(len: usize) -> String {
   let mut bytes = vec![0u8; len];
   rand::rng().fill_bytes(&mut bytes);
   URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url 文字のみで構成されているか
pub(crate) fn is_urlsafe(value: &str) -> bool {
   value
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// 秘密値を保持する String Newtype を定義する宣言型マクロ
///
/// - `Debug` 出力を `[REDACTED]` にマスクする
/// - `Display` を実装しない（平文出力を防止）
/// - serde は中身の文字列として透過的に扱う（ストア保存用）
///
/// ```rust,ignore
/// define_secret_string! {
///     /// アクセストークン
///     pub struct AccessToken;
/// }
///
/// let token = AccessToken::new("eyJ...");
/// assert!(format!("{token:?}").contains("[REDACTED]"));
/// ```
macro_rules! define_secret_string {
   (
      $(#[$meta:meta])*
      $vis:vis struct $Name:ident;
   ) => {
      $(#[$meta])*
      #[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
      #[serde(transparent)]
      $vis struct $Name(String);

      impl std::fmt::Debug for $Name {
         fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_tuple(stringify!($Name)).field(&"[REDACTED]").finish()
         }
      }

      impl $Name {
         pub fn new(value: impl Into<String>) -> Self {
            Self(value.into())
         }

         /// 平文を参照する（HTTP ヘッダー・ストアキーへの設定専用）
         pub fn as_str(&self) -> &str {
            &self.0
         }

         pub fn into_string(self) -> String {
            self.0
         }
      }
   };
}

/// 乱数から生成される秘密トークンを定義する宣言型マクロ
///
/// [`define_secret_string!`] に加えて以下を生成する:
/// - `generate()`: `bytes` バイトの乱数を base64url で符号化して生成
/// - `parse()`: 外部入力（Cookie・クエリ）を長さと文字種で検証して受け入れる
///
/// `parse()` はストアのキーに埋め込まれる値の形式を固定する。
macro_rules! define_random_token {
   (
      $(#[$meta:meta])*
      $vis:vis struct $Name:ident {
         bytes: $bytes:expr $(,)?
      }
   ) => {
      define_secret_string! {
         $(#[$meta])*
         $vis struct $Name;
      }

      impl $Name {
         /// 乱数のバイト数
         pub const BYTES: usize = $bytes;

         /// 符号化後の文字数
         pub const ENCODED_LEN: usize = ($bytes * 4usize).div_ceil(3);

         pub fn generate() -> Self {
            Self($crate::macros::random_urlsafe(Self::BYTES))
         }

         /// 外部入力を検証して受け入れる
         ///
         /// 長さ・文字種が生成形式と一致しない値は `None`。
         pub fn parse(value: &str) -> Option<Self> {
            (value.len() == Self::ENCODED_LEN && $crate::macros::is_urlsafe(value))
               .then(|| Self(value.to_string()))
         }
      }
   };
}
