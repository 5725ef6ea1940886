//! Request dispatch.
//!
//! [`GitServer`] takes a classified request and produces its response body:
//! pushes with a ref update go through the hook pipeline, everything else is
//! forwarded straight to the git process.

use crate::config::ServerConfig;
use crate::hooks::HookContext;
use crate::pipeline::PushSession;
use crate::repo::{GitBackend, Invocation};
use crate::sink::ResponseSink;
use crate::{Result, ServeError};
use gittp_git::{
    encode_ref_advertisement, encode_sideband, split_negotiation, ServiceRequest, StreamCode,
    FLUSH_PKT,
};
use std::sync::Arc;

/// The smart HTTP bridge, independent of the HTTP framework.
#[derive(Clone)]
pub struct GitServer {
    config: Arc<ServerConfig>,
    backend: Arc<dyn GitBackend>,
}

impl GitServer {
    /// Creates a server storing repositories as configured in `config`.
    pub fn new(config: ServerConfig, backend: Arc<dyn GitBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    /// Returns the runtime configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the repository backend.
    pub fn backend(&self) -> &dyn GitBackend {
        self.backend.as_ref()
    }

    /// Classifies a request against this server's storage root.
    pub fn classify(&self, method: &str, request_uri: &str, body: &[u8]) -> Result<ServiceRequest> {
        Ok(ServiceRequest::classify(
            method,
            request_uri,
            body,
            &self.config.storage_root,
        )?)
    }

    /// Serves a classified request, writing the response body to `sink`.
    ///
    /// On error the sink's status is set from [`ServeError::status`]; it only
    /// reaches the client if no body bytes were flushed before. Whatever is
    /// still buffered in the sink is flushed before returning.
    pub async fn serve(
        &self,
        request: &ServiceRequest,
        body: &[u8],
        authorization: Option<String>,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let result = self.dispatch(request, body, authorization, sink).await;

        if let Err(e) = &result {
            sink.set_status(e.status());
        }
        if let Err(e) = sink.flush().await {
            tracing::debug!(error = %e, "Could not flush response");
        }

        if let Err(e) = &result {
            match e {
                ServeError::HookRejected(reason) => tracing::info!(
                    repo = %request.repo_name,
                    reason = %reason,
                    "Push rejected by pre-receive policy"
                ),
                e => tracing::warn!(
                    repo = %request.repo_name,
                    service = %request.service,
                    error = %e,
                    "Request failed"
                ),
            }
        }

        result
    }

    async fn dispatch(
        &self,
        request: &ServiceRequest,
        body: &[u8],
        authorization: Option<String>,
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        if request.should_run_hooks {
            let negotiation = match split_negotiation(body) {
                Ok((negotiation, _)) => negotiation,
                Err(e) => {
                    let e = ServeError::from(e);
                    report_fatal(sink, &e).await;
                    return Err(e);
                }
            };

            if let Some(negotiation) = negotiation {
                let repo_exists = self.backend.exists(&request.full_repo_path);
                let ctx = HookContext::new(
                    request.repo_name.as_str(),
                    negotiation,
                    repo_exists,
                    authorization,
                    sink.flush_mode(),
                );
                return PushSession::new(self, request, body, sink, ctx).run().await;
            }
        }

        self.ensure_repository(request).await?;

        if request.is_get_refs_discovery {
            // Buffered only, so a failing git run can still set the status.
            sink.buffer(&encode_ref_advertisement(request.service));
        }

        self.execute(request, body, sink).await
    }

    /// Makes sure the request's repository exists.
    ///
    /// Fetches from a missing repository fail. Pushes create it when the
    /// pre-create policy agrees.
    pub(crate) async fn ensure_repository(&self, request: &ServiceRequest) -> Result<()> {
        let path = &request.full_repo_path;
        if self.backend.exists(path) {
            return Ok(());
        }

        if !request.service.is_receive_pack() {
            return Err(ServeError::RepositoryNotFound(request.repo_name.clone()));
        }

        if !self.config.hooks.pre_create.pre_create(&request.repo_name) {
            return Err(ServeError::RepositoryCreationDenied(
                request.repo_name.clone(),
            ));
        }

        self.backend.init_bare(path).await?;
        tracing::info!(repo = %request.repo_name, "Created repository");
        Ok(())
    }

    /// Runs the request's git service with `input` on stdin.
    pub(crate) async fn execute(
        &self,
        request: &ServiceRequest,
        input: &[u8],
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        let invocation = Invocation {
            service: request.service,
            repo_path: &request.full_repo_path,
            advertise: request.is_advertisement,
        };

        self.backend.run_service(&invocation, input, sink).await
    }
}

impl std::fmt::Debug for GitServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Reports an error to a pushing client on the fatal side-band stream.
async fn report_fatal(sink: &mut dyn ResponseSink, err: &ServeError) {
    sink.set_status(err.status());
    let mut frames = encode_sideband(StreamCode::Fatal, format!("error: {err}\n").as_bytes());
    frames.extend_from_slice(FLUSH_PKT);
    if let Err(e) = sink.send(&frames).await {
        tracing::debug!(error = %e, "Could not report error to client");
    }
}
