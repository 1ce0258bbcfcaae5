/// Parameter placeholder found in SQL text outside literals and comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Placeholder {
    /// `:name`, `@name` or `$name`; `token` keeps the prefix.
    Named { token: String, name: String },
    /// `?NNN`
    Numbered(String),
    /// Bare `?`
    Anonymous,
}

#[derive(Clone, Copy)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    Bracket,
    LineComment,
    BlockComment,
}

/// Collect the placeholders of `sql` in order of appearance.
pub(crate) fn scan_placeholders(sql: &str) -> Vec<Placeholder> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut state = State::Normal;
    let mut idx = 0;

    while idx < bytes.len() {
        if let State::Normal = state {
            if let Some((next, skip)) = open_literal(bytes, idx) {
                state = next;
                idx += skip;
                continue;
            }
            match bytes[idx] {
                b'?' => {
                    let end = scan_while(bytes, idx + 1, |c| c.is_ascii_digit());
                    if end > idx + 1 {
                        found.push(Placeholder::Numbered(sql[idx..end].to_owned()));
                        idx = end - 1;
                    } else {
                        found.push(Placeholder::Anonymous);
                    }
                }
                b':' | b'@' | b'$' => {
                    let end = scan_while(bytes, idx + 1, is_identifier_byte);
                    if end > idx + 1 && !bytes[idx + 1].is_ascii_digit() {
                        found.push(Placeholder::Named {
                            token: sql[idx..end].to_owned(),
                            name: sql[idx + 1..end].to_owned(),
                        });
                        idx = end - 1;
                    }
                }
                _ => {}
            }
            idx += 1;
        } else {
            let (next, skip) = step_literal(state, bytes, idx);
            state = next;
            idx += skip;
        }
    }

    found
}

/// Split a template on `{}` slots that sit outside literals and comments.
pub(crate) fn split_template_slots(template: &str) -> Vec<&str> {
    let bytes = template.as_bytes();
    let mut fragments = Vec::new();
    let mut state = State::Normal;
    let mut fragment_start = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        if let State::Normal = state {
            if let Some((next, skip)) = open_literal(bytes, idx) {
                state = next;
                idx += skip;
            } else if bytes[idx] == b'{' && bytes.get(idx + 1) == Some(&b'}') {
                fragments.push(&template[fragment_start..idx]);
                idx += 2;
                fragment_start = idx;
            } else {
                idx += 1;
            }
        } else {
            let (next, skip) = step_literal(state, bytes, idx);
            state = next;
            idx += skip;
        }
    }
    fragments.push(&template[fragment_start..]);
    fragments
}

/// Literal or comment starting at `idx`, with the number of bytes its opener spans.
fn open_literal(bytes: &[u8], idx: usize) -> Option<(State, usize)> {
    match bytes[idx] {
        b'\'' => Some((State::SingleQuoted, 1)),
        b'"' => Some((State::DoubleQuoted, 1)),
        b'`' => Some((State::Backtick, 1)),
        b'[' => Some((State::Bracket, 1)),
        b'-' if bytes.get(idx + 1) == Some(&b'-') => Some((State::LineComment, 2)),
        b'/' if bytes.get(idx + 1) == Some(&b'*') => Some((State::BlockComment, 2)),
        _ => None,
    }
}

/// Advance inside a literal or comment. Returns the next state and bytes consumed.
fn step_literal(state: State, bytes: &[u8], idx: usize) -> (State, usize) {
    let b = bytes[idx];
    let next = bytes.get(idx + 1).copied();
    match state {
        // Doubled quotes are escapes and stay inside the literal.
        State::SingleQuoted if b == b'\'' && next == Some(b'\'') => (state, 2),
        State::DoubleQuoted if b == b'"' && next == Some(b'"') => (state, 2),
        State::SingleQuoted if b == b'\'' => (State::Normal, 1),
        State::DoubleQuoted if b == b'"' => (State::Normal, 1),
        State::Backtick if b == b'`' => (State::Normal, 1),
        State::Bracket if b == b']' => (State::Normal, 1),
        State::LineComment if b == b'\n' => (State::Normal, 1),
        State::BlockComment if b == b'*' && next == Some(b'/') => (State::Normal, 2),
        _ => (state, 1),
    }
}

fn scan_while(bytes: &[u8], start: usize, accept: impl Fn(u8) -> bool) -> usize {
    let mut idx = start;
    while idx < bytes.len() && accept(bytes[idx]) {
        idx += 1;
    }
    idx
}

// Non-ASCII bytes count as identifier characters, as in SQLite's tokenizer.
fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(token: &str) -> Placeholder {
        Placeholder::Named {
            token: token.to_owned(),
            name: token[1..].to_owned(),
        }
    }

    #[test]
    fn finds_every_placeholder_style() {
        let sql = "select * from t where a = :a and b = @b and c = $c and d = ?2 and e = ?";
        assert_eq!(
            scan_placeholders(sql),
            vec![
                named(":a"),
                named("@b"),
                named("$c"),
                Placeholder::Numbered("?2".into()),
                Placeholder::Anonymous,
            ]
        );
    }

    #[test]
    fn skips_inside_literals_and_comments() {
        let sql = "select ':a', \"@b\", [$c] -- :d\n/* ?1 :e */ from t where x = :real";
        assert_eq!(scan_placeholders(sql), vec![named(":real")]);
    }

    #[test]
    fn template_slots_inside_literals_are_text() {
        let template = "SELECT '{}', \"{}\" /* {} */ FROM t WHERE a = {} AND b = {}";
        assert_eq!(
            split_template_slots(template),
            vec!["SELECT '{}', \"{}\" /* {} */ FROM t WHERE a = ", " AND b = ", ""]
        );
    }

    #[test]
    fn escaped_quotes_stay_inside_literal() {
        let sql = "select 'it''s :not' from t where y = $yes";
        assert_eq!(scan_placeholders(sql), vec![named("$yes")]);
    }
}
