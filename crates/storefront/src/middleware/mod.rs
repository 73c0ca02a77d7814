//! HTTP middleware stack for storefront.
//!
//! # Middleware Order (bottom to top in Router)
//!
//! 1. Sentry layer (capture errors)
//! 2. `TraceLayer` (request tracing)
//! 3. Request ID (add unique ID to each request)
//! 4. Session layer (tower-sessions)
//!
//! [`Actor`] and [`RequireUser`] are extractors rather than layers; they read
//! the session installed by step 4.

pub mod actor;
pub mod request_id;
pub mod session;

pub use actor::{Actor, CurrentUser, RequireUser, sign_in, sign_out};
pub use request_id::{RequestId, request_id_middleware};
pub use session::{create_session_layer, session_layer};
