//! POSIX shell quoting for values embedded in the generated `config.sh`
//! (spec §4.3).

/// Wrap `s` in single quotes, escaping embedded single quotes as `'\''`.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Shell-quote each token and join with single spaces, matching the array
/// quoting rule for ENTRYPOINT/CMD.
pub fn shell_quote_array<I, S>(tokens: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|t| shell_quote(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_string() {
        assert_eq!(shell_quote("hello"), "'hello'");
    }

    #[test]
    fn escapes_embedded_single_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn empty_string_quotes_to_empty_pair() {
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn array_quoting_joins_with_spaces() {
        assert_eq!(
            shell_quote_array(["/bin/sh", "-c", "echo hi"]),
            "'/bin/sh' '-c' 'echo hi'"
        );
    }

    proptest::proptest! {
        #[test]
        fn quote_unquote_roundtrips(s in ".*") {
            let quoted = shell_quote(&s);
            let unquoted = posix_sh_unquote_single(&quoted);
            proptest::prop_assert_eq!(unquoted, s);
        }
    }

    /// Minimal unquoter for the single-quoted-with-escape form `shell_quote`
    /// produces, used only to validate the round-trip property (P7). Not
    /// part of the crate's public surface — a real POSIX shell performs the
    /// actual unquoting at guest boot.
    fn posix_sh_unquote_single(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars().peekable();
        assert_eq!(chars.next(), Some('\''));
        while let Some(ch) = chars.next() {
            if ch == '\'' {
                // Either the terminating quote, or the start of an escape
                // sequence `'\''` that resumes a quoted run.
                if chars.peek() == Some(&'\\') {
                    chars.next(); // '\\'
                    chars.next(); // '\''
                    out.push('\'');
                } else {
                    break;
                }
            } else {
                out.push(ch);
            }
        }
        out
    }
}
