//! HTTP API module.
//!
//! Health, the container mirror, proxy settings and the control channel
//! upgrade endpoint.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
