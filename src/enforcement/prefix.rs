use crate::model::Blacklist;

fn is_boundary(c: char) -> bool {
    c == ' ' || c == '-'
}

/// Leading token of a command line: everything up to the first space or hyphen.
///
/// `"systemctl restart x"` → `"systemctl"`, `"rm -rf /"` → `"rm"`,
/// `"apt-get install"` → `"apt"`.
pub fn command_prefix(command: &str) -> &str {
    let command = command.trim_start();
    match command.find(is_boundary) {
        Some(end) => &command[..end],
        None => command.trim_end(),
    }
}

/// True when `candidate` starts with `prefix` followed by end-of-string,
/// a space, or a hyphen.
pub fn matches_at_boundary(candidate: &str, prefix: &str) -> bool {
    let candidate = candidate.trim();
    if prefix.is_empty() {
        return false;
    }
    match candidate.strip_prefix(prefix) {
        Some(rest) => rest.chars().next().is_none_or(is_boundary),
        None => false,
    }
}

/// Split a command line into the simple commands a shell would run.
///
/// Separators are the list and pipeline operators (`;`, `&`, `|`, newline)
/// and the substitution delimiters (backtick, `$(`, `(`, `)`). Quoting is
/// not interpreted, so a quoted operator still splits; the extra segment
/// has to pass authorization like any other. Blank segments are dropped.
pub fn command_segments(command: &str) -> Vec<&str> {
    command
        .split(|c| matches!(c, ';' | '&' | '|' | '\n' | '\r' | '`' | '(' | ')'))
        .map(|segment| segment.trim().trim_end_matches('$').trim_end())
        .filter(|segment| !segment.is_empty())
        .collect()
}

pub fn blacklist_matches(blacklist: &Blacklist, prefix: &str) -> bool {
    !prefix.is_empty()
        && blacklist
            .commands
            .iter()
            .any(|entry| command_prefix(entry) == prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stops_at_space_or_hyphen() {
        assert_eq!(command_prefix("systemctl restart x"), "systemctl");
        assert_eq!(command_prefix("rm -rf /"), "rm");
        assert_eq!(command_prefix("apt-get install vim"), "apt");
        assert_eq!(command_prefix("  uptime  "), "uptime");
        assert_eq!(command_prefix(""), "");
    }

    #[test]
    fn boundary_match_requires_separator() {
        assert!(matches_at_boundary("systemctl", "systemctl"));
        assert!(matches_at_boundary("systemctl restart", "systemctl"));
        assert!(matches_at_boundary("apt-get", "apt"));
        assert!(!matches_at_boundary("systemctlx", "systemctl"));
        assert!(!matches_at_boundary("ls", ""));
    }

    #[test]
    fn segments_split_on_shell_operators() {
        assert_eq!(command_segments("systemctl status x"), vec!["systemctl status x"]);
        assert_eq!(
            command_segments("systemctl status x; rm -rf /"),
            vec!["systemctl status x", "rm -rf /"]
        );
        assert_eq!(
            command_segments("a && b || c | d & e\nf"),
            vec!["a", "b", "c", "d", "e", "f"]
        );
        assert_eq!(
            command_segments("echo $(shutdown -h now) `rm x`"),
            vec!["echo", "shutdown -h now", "rm x"]
        );
        assert!(command_segments(" ; && ").is_empty());
    }

    #[test]
    fn blacklist_matches_entry_prefix() {
        let blacklist = Blacklist {
            commands: vec!["rm".into(), "shutdown -h now".into()],
        };
        assert!(blacklist_matches(&blacklist, "rm"));
        assert!(blacklist_matches(&blacklist, "shutdown"));
        assert!(!blacklist_matches(&blacklist, "rmdir"));
        assert!(!blacklist_matches(&blacklist, ""));
    }
}
