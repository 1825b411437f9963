mod client;

pub use client::{Endpoints, TokenRefresh, UpstreamClient, UserInfo};
