//! # gittp
//!
//! A git smart HTTP server that shells out to `git-upload-pack` and
//! `git-receive-pack`, with policy hooks around every push.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP Bridge (axum)                     │
//! │  • One fallback handler for every smart HTTP URL            │
//! │  • Streaming response body, no-cache headers                │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         GitServer                           │
//! │  • Request classification (gittp-git)                       │
//! │  • Hook pipeline: pre-receive → create → git → post-receive │
//! │  • Side-band progress written straight to the client        │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         GitBackend                          │
//! │  • git init --bare, git archive                             │
//! │  • git <service> --stateless-rpc [--advertise-refs]         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin gittp -- --port 8080 --path ./repositories --autocreate
//! git push http://localhost:8080/adam/project.git master
//! ```
//!
//! ## Example: Custom Hooks
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gittp_server::{
//!     api::{create_router, AppState},
//!     hooks::{AllowCreate, Decision, HookContext},
//!     GitCli, GitServer, ServerConfig,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ServerConfig::new("./repositories")?
//!     .with_pre_create(AllowCreate)
//!     .with_pre_receive(|ctx: &mut HookContext| {
//!         let _ = ctx.writeln("Checking push...");
//!         Decision::from(ctx.authorization.is_some())
//!     });
//!
//! let server = GitServer::new(config, Arc::new(GitCli::default()));
//! let app = create_router(AppState::new(server, 64 * 1024 * 1024));
//! # let _ = app;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`api`] - HTTP router and the smart HTTP handler
//! - [`config`] - File/CLI configuration and the runtime [`ServerConfig`]
//! - [`hooks`] - Hook context and pre-receive, post-receive, pre-create policies
//! - [`repo`] - Repository lifecycle and the git process
//! - [`sink`] - Response sinks with and without incremental flush
//! - [`observability`] - Logging and request IDs

pub mod api;
pub mod config;
pub mod error;
pub mod hooks;
pub mod observability;
mod pipeline;
pub mod repo;
mod server;
pub mod sink;

pub use config::{Config, Hooks, ServerConfig};
pub use error::ServeError;
pub use pipeline::Stage;
pub use repo::{GitBackend, GitCli, Invocation};
pub use server::GitServer;

/// Result type for serving requests.
pub type Result<T> = std::result::Result<T, ServeError>;
