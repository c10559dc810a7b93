//! Authentication module for ThinkInk

pub mod jwt;
pub mod middleware;
pub mod password;
pub mod reset;
pub mod revocation;

pub use jwt::{Claims, IssuedToken, JwtManager};
pub use middleware::{
    authenticate, extract_bearer_token, require_auth, AuthError, AuthState, AuthUser,
    PresentedToken,
};
pub use password::{hash_password, validate_password_strength, verify_password};
pub use reset::{new_reset_token, reset_token_digest, RESET_TOKEN_TTL};
pub use revocation::{
    spawn_purge_task, DynRevocationList, InMemoryRevocationList, PgRevocationList,
    RevocationList, PURGE_INTERVAL,
};
