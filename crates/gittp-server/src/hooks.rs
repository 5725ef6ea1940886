//! Push hooks.
//!
//! Policies run around a push: [`PreReceive`] decides whether the push may
//! proceed, [`PreCreate`] whether a missing repository may be created, and
//! [`PostReceive`] reacts to a completed push. Policies talk to the pushing
//! client through the [`HookContext`], whose output shows up as `remote:`
//! lines in the client's terminal.

use bytes::Bytes;
use gittp_git::{FlushMode, ReceivePackNegotiation, SidebandWriter};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Repository names of the form `owner/project.git`.
static OWNER_PROJECT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w+/[\w.-]+\.git$").expect("Invalid regex"));

/// Outcome of a pre-receive policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let the push continue.
    Accept,
    /// Stop the push, optionally telling the client why.
    Reject(Option<String>),
}

impl Decision {
    /// Rejects with a reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(Some(reason.into()))
    }

    /// Returns true for [`Decision::Accept`].
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

impl From<bool> for Decision {
    fn from(accept: bool) -> Self {
        if accept {
            Self::Accept
        } else {
            Self::Reject(None)
        }
    }
}

/// State of an ongoing push, handed to hook policies.
///
/// Policies run on a blocking thread. Writes are side-band encoded on the
/// progress stream and, when the response streams, reach the client before
/// the write returns; a client that falls behind makes them wait.
pub struct HookContext {
    /// Name of the repository being pushed to.
    pub repository: String,
    /// Full name of the ref being pushed, e.g. `refs/heads/master`.
    pub branch: String,
    /// Commit the ref is updated to.
    pub commit: String,
    /// Whether the repository existed before this push. When false and the
    /// push is accepted, the pre-create policy decides whether it is created.
    pub repo_exists: bool,
    /// Value of the request's `Authorization` header.
    pub authorization: Option<String>,
    /// The full ref update, including client capabilities and agent.
    pub negotiation: ReceivePackNegotiation,
    sideband: SidebandWriter<HookOutput>,
}

impl HookContext {
    /// Creates a context. Writes fail until an output channel is attached.
    pub(crate) fn new(
        repository: impl Into<String>,
        negotiation: ReceivePackNegotiation,
        repo_exists: bool,
        authorization: Option<String>,
        mode: FlushMode,
    ) -> Self {
        Self {
            repository: repository.into(),
            branch: negotiation.branch.clone(),
            commit: negotiation.new_ref.clone(),
            repo_exists,
            authorization,
            negotiation,
            sideband: SidebandWriter::new(HookOutput::default(), mode),
        }
    }

    /// Writes raw bytes to the client.
    pub fn write(&mut self, data: &[u8]) -> gittp_git::Result<()> {
        self.sideband.progress(data)
    }

    /// Writes a line of text to the client.
    pub fn writeln(&mut self, text: &str) -> gittp_git::Result<()> {
        self.write(format!("{text}\n").as_bytes())
    }

    /// Writes formatted text to the client, so `write!(ctx, ...)` works.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> gittp_git::Result<()> {
        self.write(args.to_string().as_bytes())
    }

    /// Writes an error on the fatal stream as `error: <msg>`.
    pub fn fatal(&mut self, msg: &str) -> gittp_git::Result<()> {
        self.sideband.fatal(msg)
    }

    /// How writes reach the client.
    pub fn flush_mode(&self) -> FlushMode {
        self.sideband.mode()
    }

    /// Routes writes into `tx` until [`HookContext::detach`].
    pub(crate) fn attach(&mut self, tx: mpsc::Sender<Bytes>) {
        self.sideband.get_mut().tx = Some(tx);
    }

    /// Sends what is still buffered and closes the output channel.
    pub(crate) fn detach(&mut self) -> io::Result<()> {
        let output = self.sideband.get_mut();
        let result = output.flush();
        output.tx = None;
        result
    }
}

impl fmt::Debug for HookContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookContext")
            .field("repository", &self.repository)
            .field("branch", &self.branch)
            .field("commit", &self.commit)
            .field("repo_exists", &self.repo_exists)
            .finish_non_exhaustive()
    }
}

/// Hook output on its way to the pipeline, which forwards it to the client.
#[derive(Default)]
struct HookOutput {
    tx: Option<mpsc::Sender<Bytes>>,
    buf: Vec<u8>,
}

impl Write for HookOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "hook output closed"))?;
        let chunk = Bytes::from(std::mem::take(&mut self.buf));
        tx.blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }
}

/// Runs before a push is applied.
pub trait PreReceive: Send + Sync {
    /// Decides whether the push may proceed.
    fn pre_receive(&self, ctx: &mut HookContext) -> Decision;
}

impl<F> PreReceive for F
where
    F: Fn(&mut HookContext) -> Decision + Send + Sync,
{
    fn pre_receive(&self, ctx: &mut HookContext) -> Decision {
        self(ctx)
    }
}

/// Runs after the git process applied a push.
///
/// Errors are logged; the client already considers the push complete.
pub trait PostReceive: Send + Sync {
    /// Reacts to the push. `archive` is a tar snapshot of the pushed commit,
    /// absent when it could not be produced.
    fn post_receive(&self, ctx: &mut HookContext, archive: Option<&[u8]>)
        -> anyhow::Result<()>;
}

impl<F> PostReceive for F
where
    F: Fn(&mut HookContext, Option<&[u8]>) -> anyhow::Result<()> + Send + Sync,
{
    fn post_receive(
        &self,
        ctx: &mut HookContext,
        archive: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        self(ctx, archive)
    }
}

/// Runs before a missing repository is created by a push.
pub trait PreCreate: Send + Sync {
    /// Returns true to create the repository.
    fn pre_create(&self, repo_name: &str) -> bool;
}

impl<F> PreCreate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn pre_create(&self, repo_name: &str) -> bool {
        self(repo_name)
    }
}

/// Pre-receive policies run in order, stopping at the first rejection.
///
/// An empty chain accepts every push.
#[derive(Clone, Default)]
pub struct PreReceiveChain {
    policies: Vec<Arc<dyn PreReceive>>,
}

impl PreReceiveChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a policy.
    pub fn with(mut self, policy: impl PreReceive + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    /// Appends a policy.
    pub fn push(&mut self, policy: Arc<dyn PreReceive>) {
        self.policies.push(policy);
    }

    /// Number of policies in the chain.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns true if the chain has no policies.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl PreReceive for PreReceiveChain {
    fn pre_receive(&self, ctx: &mut HookContext) -> Decision {
        for policy in &self.policies {
            let decision = policy.pre_receive(ctx);
            if !decision.is_accept() {
                return decision;
            }
        }
        Decision::Accept
    }
}

impl fmt::Debug for PreReceiveChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreReceiveChain")
            .field("len", &self.policies.len())
            .finish()
    }
}

/// Accepts every push.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PreReceive for AcceptAll {
    fn pre_receive(&self, _ctx: &mut HookContext) -> Decision {
        Decision::Accept
    }
}

/// Only accepts pushes to one branch.
#[derive(Debug, Clone)]
pub struct OnlyBranch {
    branch: String,
}

impl OnlyBranch {
    /// Accepts pushes to `branch`, given as `master` or `refs/heads/master`.
    pub fn new(branch: impl Into<String>) -> Self {
        let branch = branch.into();
        let branch = if branch.starts_with("refs/") {
            branch
        } else {
            format!("refs/heads/{branch}")
        };
        Self { branch }
    }

    /// Accepts pushes to `master` only.
    pub fn master() -> Self {
        Self::new("master")
    }
}

impl PreReceive for OnlyBranch {
    fn pre_receive(&self, ctx: &mut HookContext) -> Decision {
        if ctx.branch == self.branch {
            return Decision::Accept;
        }

        let short = self.branch.trim_start_matches("refs/heads/");
        let message = format!("Only pushing to {short} is allowed.");
        if let Err(e) = ctx.writeln(&message) {
            tracing::debug!(error = %e, "Could not write to client");
        }
        Decision::reject(format!("only {short} may be pushed"))
    }
}

/// Only accepts repositories named like `owner/project.git`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerProjectNames;

impl PreReceive for OwnerProjectNames {
    fn pre_receive(&self, ctx: &mut HookContext) -> Decision {
        if OWNER_PROJECT_REGEX.is_match(&ctx.repository) {
            return Decision::Accept;
        }

        if let Err(e) = ctx.writeln("Repository names must look like owner/project.git.") {
            tracing::debug!(error = %e, "Could not write to client");
        }
        Decision::reject("invalid repository name")
    }
}

/// Creates every missing repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowCreate;

impl PreCreate for AllowCreate {
    fn pre_create(&self, _repo_name: &str) -> bool {
        true
    }
}

/// Never creates repositories over push.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyCreate;

impl PreCreate for DenyCreate {
    fn pre_create(&self, _repo_name: &str) -> bool {
        false
    }
}
