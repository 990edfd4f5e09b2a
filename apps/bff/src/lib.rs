//! # relaygate BFF ライブラリ
//!
//! ブラウザ向け認証ゲートウェイのコアモジュール。
//!
//! ## モジュール構成
//!
//! - `app_builder`: DI とルーター構築
//! - `client`: 外部クライアント（IdP・上流 API）
//! - `config`: 環境変数からの設定読み込み
//! - `cookie`: セッション・CSRF・state Cookie の組み立て
//! - `handler`: HTTP ハンドラ
//! - `jwt`: ID トークン・ログアウトトークンの署名検証
//! - `middleware`: ミドルウェア（セッション解決・CSRF 検証等）
//! - `provider`: IdP プロバイダの解決
//! - `route_table`: 中継ルートの公開・保護の分類
//! - `usecase`: ログイン・トークン・ログアウトのユースケース

pub mod app_builder;
pub mod client;
pub mod config;
pub mod cookie;
pub mod error;
pub mod handler;
pub mod jwt;
pub mod middleware;
pub mod openapi;
pub mod provider;
pub mod route_table;
pub mod usecase;
