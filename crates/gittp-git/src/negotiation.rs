//! Receive-pack negotiation parsing.
//!
//! A push body starts with one or more command pkt-lines of the form
//! `<old-id> <new-id> <ref>\0<capabilities>` followed by a flush and the pack.
//! Only the first command carries the capability list; it is what hooks see.

use crate::pktline::{decode, PktLine};
use crate::{GitError, Result};

/// The all-zero object id used for ref creation and deletion.
pub const ZERO_ID: &str = "0000000000000000000000000000000000000000";

const AGENT_PREFIX: &str = "agent=";

/// The ref update announced by the first receive-pack command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivePackNegotiation {
    /// Object id the ref currently points to (zeros for create).
    pub old_ref: String,
    /// Object id the ref will point to (zeros for delete).
    pub new_ref: String,
    /// Full ref name, e.g. `refs/heads/master`.
    pub branch: String,
    /// Client capabilities, in the order sent, without the agent entry.
    pub capabilities: Vec<String>,
    /// Client agent, e.g. `git/2.8.3`.
    pub agent: String,
}

impl ReceivePackNegotiation {
    /// Parses the payload of the first command pkt-line.
    ///
    /// An empty payload yields `None`: there is no ref update to hook on.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        if payload.is_empty() {
            return Ok(None);
        }

        let nul = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("missing NUL before capability list"))?;
        let (ref_line, cap_line) = (&payload[..nul], &payload[nul + 1..]);

        let ref_line =
            std::str::from_utf8(ref_line).map_err(|_| malformed("command is not UTF-8"))?;
        let fields: Vec<&str> = ref_line.split(' ').collect();
        let [old_ref, new_ref, branch] = fields.as_slice() else {
            return Err(malformed(format!(
                "expected 3 command fields, got {}",
                fields.len()
            )));
        };

        check_object_id(old_ref)?;
        check_object_id(new_ref)?;
        if branch.is_empty() {
            return Err(malformed("empty ref name"));
        }

        let cap_line =
            std::str::from_utf8(cap_line).map_err(|_| malformed("capabilities are not UTF-8"))?;
        let mut capabilities: Vec<String> = cap_line
            .trim_end_matches('\n')
            .split(' ')
            .filter(|cap| !cap.is_empty())
            .map(str::to_string)
            .collect();

        let Some(last) = capabilities.last() else {
            return Err(malformed("empty capability list"));
        };

        let agent = match last.strip_prefix(AGENT_PREFIX) {
            Some(agent) => {
                let agent = strip_flush_artifacts(agent).to_string();
                capabilities.pop();
                agent
            }
            None => String::new(),
        };

        Ok(Some(Self {
            old_ref: old_ref.to_string(),
            new_ref: new_ref.to_string(),
            branch: branch.to_string(),
            capabilities,
            agent,
        }))
    }

    /// Returns true if the client announced `name`.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|cap| cap == name)
    }

    /// Checks if this update creates the ref.
    pub fn is_create(&self) -> bool {
        self.old_ref == ZERO_ID
    }

    /// Checks if this update deletes the ref.
    pub fn is_delete(&self) -> bool {
        self.new_ref == ZERO_ID
    }
}

/// Decodes the first pkt-line of a receive-pack body and parses it.
///
/// Returns the negotiation (`None` when the body starts with a flush or is
/// empty) and the bytes after the first pkt-line, untouched.
pub fn split_negotiation(body: &[u8]) -> Result<(Option<ReceivePackNegotiation>, &[u8])> {
    if body.is_empty() {
        return Ok((None, body));
    }

    match decode(body)? {
        (PktLine::Flush, rest) => Ok((None, rest)),
        (PktLine::Data(payload), rest) => Ok((ReceivePackNegotiation::parse(&payload)?, rest)),
    }
}

fn malformed(reason: impl Into<String>) -> GitError {
    GitError::MalformedNegotiation(reason.into())
}

fn check_object_id(id: &str) -> Result<()> {
    if id.len() == ZERO_ID.len() && hex::decode(id).is_ok() {
        Ok(())
    } else {
        Err(malformed(format!("invalid object id {id:?}")))
    }
}

/// Strips trailing NULs and a trailing flush marker some clients leave
/// glued to the agent string.
fn strip_flush_artifacts(agent: &str) -> &str {
    let agent = agent.trim_end_matches('\0');
    agent.strip_suffix("0000").unwrap_or(agent)
}
