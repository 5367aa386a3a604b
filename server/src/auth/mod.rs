//! Authentication
//!
//! Bearer access tokens issued by the main server, verified locally.

mod error;
pub mod jwt;
mod middleware;

pub use error::{AuthError, AuthResult};
pub use jwt::JwtVerifier;
pub use middleware::{require_auth, AuthUser};
