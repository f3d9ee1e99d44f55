//! HTTP 中间件与提取器

pub mod auth;
pub mod json;

pub use auth::RequireApiKey;
pub use json::ApiJson;
