//! Escape-clause rewriting.
//!
//! Rewrites `{d '…'}`, `{t '…'}`, `{ts '…'}`, `{fn …}`, `{oj …}` and `{call …}`
//! into plain SQL. String literals, quoted identifiers and comments pass through
//! untouched, as do braces that do not open a known escape.

/// Rewrite escape clauses in `sql`.
pub fn rewrite(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    // one entry per open brace: true when it opened an escape clause
    let mut braces: Vec<bool> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = skip_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map(|p| i + p)
                    .unwrap_or(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = find_comment_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            '{' => match escape_keyword(&chars, i + 1) {
                Some((replacement, next)) => {
                    out.push_str(replacement);
                    braces.push(true);
                    i = next;
                }
                None => {
                    out.push(c);
                    braces.push(false);
                    i += 1;
                }
            },
            '}' => {
                if braces.pop() != Some(true) {
                    out.push(c);
                }
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Index just past the closing quote; doubled quotes stay inside the literal.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn find_comment_end(chars: &[char], from: usize) -> usize {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

/// Recognize the keyword after `{`, returning its replacement and the index of
/// the first character after the keyword and its trailing whitespace.
fn escape_keyword(chars: &[char], from: usize) -> Option<(&'static str, usize)> {
    let mut start = from;
    while start < chars.len() && chars[start].is_whitespace() {
        start += 1;
    }
    let mut end = start;
    while end < chars.len() && chars[end].is_ascii_alphabetic() {
        end += 1;
    }
    // the keyword must be followed by whitespace or a quote
    match chars.get(end) {
        Some(ch) if ch.is_whitespace() || *ch == '\'' => {}
        _ => return None,
    }
    let word: String = chars[start..end].iter().collect::<String>().to_lowercase();
    let replacement = match word.as_str() {
        "d" => "DATE ",
        "t" => "TIME ",
        "ts" => "TIMESTAMP ",
        "fn" | "oj" => "",
        "call" => "CALL ",
        _ => return None,
    };
    let mut next = end;
    while next < chars.len() && chars[next].is_whitespace() {
        next += 1;
    }
    Some((replacement, next))
}
