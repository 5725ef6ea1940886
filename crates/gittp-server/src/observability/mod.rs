//! # Observability
//!
//! - **Structured logging**: pretty or JSON output, filtered through `RUST_LOG`
//! - **Request IDs**: every request runs in a span carrying its `x-request-id`
//!
//! ```rust,ignore
//! use gittp_server::observability::{init_logging, request_id_layer, LogFormat};
//!
//! init_logging("info", LogFormat::Json);
//! let app = axum::Router::new().layer(request_id_layer());
//! ```

mod logging;
pub mod middleware;

pub use logging::{init_logging, LogFormat};
pub use middleware::{request_id_layer, RequestId, REQUEST_ID_HEADER};
