//! # 外部サービスクライアント
//!
//! - `identity_provider`: IdP（トークン・Discovery・JWKS）
//! - `upstream`: 上流リソース API（`/api/**` の中継先）

pub mod identity_provider;
pub mod upstream;

pub use identity_provider::{
   DiscoveryDocument,
   IdentityProviderClient,
   IdentityProviderError,
   ReqwestIdentityProviderClient,
   TokenResponse,
};
pub use upstream::{RelayRequest, RelayResponse, ReqwestUpstreamClient, UpstreamClient, UpstreamError};
