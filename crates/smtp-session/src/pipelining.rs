//! RFC 2920 pipelining rules for multi-command submissions.
use crate::command::Command;
use crate::error::SessionError;

/// Commands whose responses change the session phase; they may only
/// conclude a pipelined batch.
const MUST_APPEAR_LAST: [&str; 3] = ["DATA", "EHLO", "NOOP"];

/// Commands that may never be pipelined: their responses cannot be
/// distinguished reliably from the surrounding negotiation.
const NEVER_PIPELINED: [&str; 2] = ["HELO", "HELP"];

/// Check a pipelined command sequence before anything is written.
/// The first violated rule is reported; a single-command sequence is
/// accepted unless it uses a command that can never be pipelined.
pub fn validate_pipelined_commands(commands: &[Command]) -> Result<(), SessionError> {
    if commands.is_empty() {
        return Err(SessionError::InvalidPipelinedRequest(
            "a pipelined request requires at least one command".to_string(),
        ));
    }

    for verb in NEVER_PIPELINED {
        if commands.iter().any(|command| command.verb() == verb) {
            return Err(SessionError::InvalidPipelinedRequest(format!(
                "{verb} cannot be used in a pipelined request"
            )));
        }
    }

    let last = commands.len() - 1;
    for verb in MUST_APPEAR_LAST {
        if let Some(position) = commands.iter().position(|command| command.verb() == verb) {
            if position != last {
                return Err(SessionError::InvalidPipelinedRequest(format!(
                    "{verb} must appear last in a pipelined request"
                )));
            }
        }
    }

    Ok(())
}
