//! # 中継ルートの分類
//!
//! `PUBLIC_ROUTES` に列挙したパスパターンに一致するリクエストは未認証でも中継し、
//! それ以外はすべて認証必須として扱う。
//!
//! パターンは完全一致か、末尾 `/**` による前方一致（セグメント境界）のみ。
//! 照合は受信したパス全体（`/api/...`）に対して行う。

/// ルートの分類結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
   Public,
   Protected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoutePattern {
   Exact(String),
   Prefix(String),
}

impl RoutePattern {
   fn parse(pattern: &str) -> Option<Self> {
      let pattern = pattern.trim();
      if !pattern.starts_with('/') {
         return None;
      }
      match pattern.strip_suffix("/**") {
         Some(prefix) => Some(Self::Prefix(prefix.to_string())),
         None => Some(Self::Exact(pattern.to_string())),
      }
   }

   fn matches(&self, path: &str) -> bool {
      match self {
         Self::Exact(exact) => path == exact,
         Self::Prefix(prefix) => path
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
      }
   }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
   public: Vec<RoutePattern>,
}

impl RouteTable {
   /// `/` で始まらないパターンは無視する
   pub fn new<I, S>(patterns: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      let public = patterns
         .into_iter()
         .filter_map(|p| {
            let parsed = RoutePattern::parse(p.as_ref());
            if parsed.is_none() {
               tracing::warn!(pattern = p.as_ref(), "不正な公開ルートパターンを無視しました");
            }
            parsed
         })
         .collect();
      Self { public }
   }

   pub fn classify(&self, path: &str) -> RouteClass {
      if self.public.iter().any(|p| p.matches(path)) {
         RouteClass::Public
      } else {
         RouteClass::Protected
      }
   }
}

#[cfg(test)]
mod tests {
   use rstest::rstest;

   use super::*;

   fn table() -> RouteTable {
      RouteTable::new(["/api/public/**", "/api/status", "invalid"])
   }

   #[rstest]
   #[case("/api/public", RouteClass::Public)]
   #[case("/api/public/news/1", RouteClass::Public)]
   #[case("/api/status", RouteClass::Public)]
   #[case("/api/status/detail", RouteClass::Protected)]
   #[case("/api/publicity", RouteClass::Protected)]
   #[case("/api/orders", RouteClass::Protected)]
   #[case("/api", RouteClass::Protected)]
   fn test_パスを公開と保護に分類する(#[case] path: &str, #[case] expected: RouteClass) {
      assert_eq!(table().classify(path), expected);
   }

   #[test]
   fn test_パターンが空なら全て保護ルート() {
      let table = RouteTable::new(Vec::<String>::new());

      assert_eq!(table.classify("/api/public"), RouteClass::Protected);
   }
}
