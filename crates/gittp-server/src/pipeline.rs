//! The per-push hook pipeline.
//!
//! ```text
//! Start -> PreReceive -> Rejected --------------------------------------+
//!                     -> Accepted -> RepoCreateCheck -> CommandExecuted  |
//!                                                    -> PostReceive -> Closed
//! ```
//!
//! Every path ends in `Closed` with exactly one flush packet closing the
//! response. After a successful git run that is git's own closing flush,
//! held back until the post-receive output was written.
//!
//! Policies are synchronous and run on the blocking pool; their output is
//! forwarded to the client while they run.

use crate::hooks::{Decision, HookContext, PreReceive};
use crate::server::GitServer;
use crate::sink::{CommandOutput, ResponseSink};
use crate::{Result, ServeError};
use bytes::Bytes;
use gittp_git::{encode_sideband, ServiceRequest, StreamCode, FLUSH_PKT};
use tokio::sync::mpsc;

/// Hook output chunks queued before a policy waits for the client.
const HOOK_OUTPUT_CAPACITY: usize = 16;

/// Stages of a push session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Context built, nothing run yet.
    Start,
    /// Pre-receive policies are running.
    PreReceive,
    /// A pre-receive policy declined the push.
    Rejected,
    /// The pre-receive policies accepted the push.
    Accepted,
    /// Checking for, and possibly creating, the repository.
    RepoCreateCheck,
    /// git-receive-pack ran successfully.
    CommandExecuted,
    /// Post-receive policies are running.
    PostReceive,
    /// The response was closed.
    Closed,
}

/// One push going through the hooks.
pub(crate) struct PushSession<'a> {
    server: &'a GitServer,
    request: &'a ServiceRequest,
    body: &'a [u8],
    sink: &'a mut dyn ResponseSink,
    ctx: Option<HookContext>,
    branch: String,
    commit: String,
    is_delete: bool,
    stage: Stage,
    /// Whether closing the session writes a flush packet.
    close_with_flush: bool,
}

impl<'a> PushSession<'a> {
    pub(crate) fn new(
        server: &'a GitServer,
        request: &'a ServiceRequest,
        body: &'a [u8],
        sink: &'a mut dyn ResponseSink,
        ctx: HookContext,
    ) -> Self {
        Self {
            server,
            request,
            body,
            sink,
            branch: ctx.branch.clone(),
            commit: ctx.commit.clone(),
            is_delete: ctx.negotiation.is_delete(),
            ctx: Some(ctx),
            stage: Stage::Start,
            close_with_flush: true,
        }
    }

    /// Runs the push to completion and closes the response.
    pub(crate) async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        self.advance(Stage::Closed);

        if self.close_with_flush {
            if let Err(e) = self.sink.send(FLUSH_PKT).await {
                tracing::debug!(error = %e, "Could not write closing flush packet");
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let server = self.server;
        let hooks = &server.config().hooks;

        self.advance(Stage::PreReceive);
        let chain = hooks.pre_receive.clone();
        let decision = match self.run_hook(move |ctx| chain.pre_receive(ctx)).await {
            Ok(decision) => decision,
            Err(e) => return Err(self.fail(e).await),
        };

        match decision {
            Decision::Accept => self.advance(Stage::Accepted),
            Decision::Reject(reason) => {
                self.advance(Stage::Rejected);
                let reason = reason.unwrap_or_else(|| "pre-receive hook declined".to_string());
                self.report_rejection(&reason).await?;
                return Err(ServeError::HookRejected(reason));
            }
        }

        self.advance(Stage::RepoCreateCheck);
        if let Err(e) = server.ensure_repository(self.request).await {
            return Err(self.fail(e).await);
        }

        let mut output = CommandOutput::new(&mut *self.sink);
        let executed = server.execute(self.request, self.body, &mut output).await;
        let held = output.finish();
        if let Err(e) = executed {
            return Err(self.fail(e).await);
        }
        self.close_with_flush = held;
        self.advance(Stage::CommandExecuted);

        if !hooks.post_receive.is_empty() {
            self.advance(Stage::PostReceive);
            self.post_receive().await;
        }

        Ok(())
    }

    async fn post_receive(&mut self) {
        let server = self.server;

        let archive = if self.is_delete {
            None
        } else {
            match server
                .backend()
                .archive(&self.request.full_repo_path, &self.commit)
                .await
            {
                Ok(archive) => Some(archive),
                Err(e) => {
                    tracing::warn!(
                        repo = %self.request.repo_name,
                        commit = %self.commit,
                        error = %e,
                        "Could not archive pushed commit"
                    );
                    None
                }
            }
        };

        let policies = server.config().hooks.post_receive.clone();
        let repo = self.request.repo_name.clone();
        let ran = self
            .run_hook(move |ctx| {
                for policy in &policies {
                    if let Err(e) = policy.post_receive(ctx, archive.as_deref()) {
                        tracing::warn!(repo = %repo, error = %e, "Post-receive policy failed");
                    }
                }
            })
            .await;
        if let Err(e) = ran {
            tracing::warn!(repo = %self.request.repo_name, error = %e, "Post-receive hooks aborted");
        }
    }

    /// Runs `hook` on the blocking pool, forwarding what it writes to the
    /// client until it returns.
    async fn run_hook<T, F>(&mut self, hook: F) -> Result<T>
    where
        F: FnOnce(&mut HookContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut ctx = self
            .ctx
            .take()
            .ok_or_else(|| ServeError::HookFailed("hook context lost".to_string()))?;
        let (tx, mut rx) = mpsc::channel::<Bytes>(HOOK_OUTPUT_CAPACITY);
        ctx.attach(tx);

        let span = tracing::Span::current();
        let task = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let value = hook(&mut ctx);
            if let Err(e) = ctx.detach() {
                tracing::debug!(error = %e, "Could not send hook output");
            }
            (ctx, value)
        });

        while let Some(chunk) = rx.recv().await {
            if let Err(e) = self.sink.send(&chunk).await {
                tracing::debug!(error = %e, "Could not forward hook output");
                break;
            }
        }
        // Writes still pending in the hook fail from here on.
        drop(rx);

        let (ctx, value) = task
            .await
            .map_err(|e| ServeError::HookFailed(e.to_string()))?;
        self.ctx = Some(ctx);
        Ok(value)
    }

    /// Tells the client which ref was refused, in report-status form.
    async fn report_rejection(&mut self, reason: &str) -> Result<()> {
        self.sink
            .send(&encode_sideband(StreamCode::Progress, b"unpack ok\n"))
            .await?;
        let line = format!("ng {} {reason}\n", self.branch);
        self.sink
            .send(&encode_sideband(StreamCode::Progress, line.as_bytes()))
            .await?;
        Ok(())
    }

    /// Reports `err` to the client and returns it.
    async fn fail(&mut self, err: ServeError) -> ServeError {
        self.sink.set_status(err.status());
        let message = format!("error: {err}\n");
        if let Err(e) = self
            .sink
            .send(&encode_sideband(StreamCode::Fatal, message.as_bytes()))
            .await
        {
            tracing::debug!(error = %e, "Could not report error to client");
        }
        err
    }

    fn advance(&mut self, next: Stage) {
        tracing::debug!(
            repo = %self.request.repo_name,
            branch = %self.branch,
            from = ?self.stage,
            to = ?next,
            "Push stage"
        );
        self.stage = next;
    }
}
