pub mod oauth;
pub mod storage;

pub use oauth::{AuthStatus, OAuthManager};
pub use storage::TokenStore;
