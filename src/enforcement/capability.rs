use crate::model::FoldedName;

/// Unforgeable proof that the authorizer allowed one command on one host.
///
/// Construction is double-locked:
/// 1. `Seal` is a private type, so struct literals fail outside this file.
/// 2. `new()` is `pub(super)`, so only `enforcement/` can mint tokens.
///
/// No `Clone`, `Copy`, `Default`, or `From`: a token is consumed on use.
///
/// ```compile_fail
/// use bastion::enforcement::capability::ExecutionToken;
/// use bastion::model::FoldedName;
///
/// let _token = ExecutionToken::new(FoldedName::new("host1"), "ls".to_owned(), false);
/// ```
#[derive(Debug)]
pub struct ExecutionToken {
    host: FoldedName,
    command: String,
    /// Issued because enforcement was suspended for the host, not because
    /// a grant authorized the command.
    suspended_override: bool,
    _seal: Seal,
}

#[derive(Debug)]
struct Seal;

impl ExecutionToken {
    pub(super) fn new(host: FoldedName, command: String, suspended_override: bool) -> Self {
        Self {
            host,
            command,
            suspended_override,
            _seal: Seal,
        }
    }

    pub fn host(&self) -> &FoldedName {
        &self.host
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn suspended_override(&self) -> bool {
        self.suspended_override
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_carries_host_and_command() {
        let token = ExecutionToken::new(FoldedName::new("HOST1"), "uptime".into(), false);
        assert_eq!(token.host().as_str(), "host1");
        assert_eq!(token.command(), "uptime");
        assert!(!token.suspended_override());
    }

    #[test]
    fn token_is_consumed() {
        let token = ExecutionToken::new(FoldedName::new("h"), "ls".into(), true);
        // Moving the token into a function consumes it. Using `token` again
        // below this line would fail to compile.
        let command = consume(token);
        assert_eq!(command, "ls");
    }

    fn consume(token: ExecutionToken) -> String {
        token.command
    }
}
