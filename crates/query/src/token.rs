//! Tokenizer
//!
//! Splits raw query text into tokens, carrying the source line and
//! column of each for error carets. Rules:
//! - `#` starts a comment to end of line (outside strings)
//! - string literals keep their quote character and expand the escapes
//!   `\n \r \t \' \" \\ \/`
//! - multi-char operators (`== != <= >= += -= *= /= << <> ::`) are
//!   recognized greedily
//! - a `.` not followed by a digit starts a member access and is
//!   rewritten to a `__chain_` token, keeping dot-chains lexically
//!   distinct from decimal literals
//! - a `-` directly before a digit begins a negative number

use cohort_core::error::{Error, ErrorCode, Result, SourceLoc};

/// One token plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Tok {
    /// Token text (strings keep their quotes; chains carry `__chain_`)
    pub text: String,
    /// Zero-based source line
    pub line: u32,
    /// Zero-based column of the first character
    pub col: u32,
}

impl Tok {
    fn new(text: impl Into<String>, line: u32, col: u32) -> Self {
        Tok {
            text: text.into(),
            line,
            col,
        }
    }
}

/// Prefix marking a rewritten member access.
pub const CHAIN_PREFIX: &str = "__chain_";

const DOUBLE_SYMBOLS: [&str; 11] = [
    "==", "!=", ">=", "<=", "+=", "-=", "*=", "/=", "<<", "<>", "::",
];

const SINGLE_SYMBOLS: &str = "(){}[],:+-*/=<>";

/// Tokenize `source`, returning tokens and the source lines (kept for
/// error excerpts).
pub fn tokenize(source: &str) -> Result<(Vec<Tok>, Vec<String>)> {
    let lines: Vec<String> = source.lines().map(str::to_owned).collect();
    let mut toks: Vec<Tok> = Vec::new();

    for (line_no, line) in lines.iter().enumerate() {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0usize;
        let mut current = String::new();
        let mut current_col = 0u32;

        macro_rules! flush {
            () => {
                if !current.is_empty() {
                    toks.push(Tok::new(current.clone(), line_no as u32, current_col));
                    current.clear();
                }
            };
        }

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            // comment to end of line
            if c == '#' {
                break;
            }

            // negative number, not subtraction
            if c == '-' && current.is_empty() && next.map(|n| n.is_ascii_digit()).unwrap_or(false)
            {
                current_col = i as u32;
                current.push(c);
                i += 1;
                continue;
            }

            // member access: `.` not followed by a digit
            if c == '.' && !next.map(|n| n.is_ascii_digit()).unwrap_or(false) {
                flush!();
                current_col = i as u32;
                current.push_str(CHAIN_PREFIX);
                i += 1;
                continue;
            }

            // quoted string with escape expansion
            if c == '\'' || c == '"' {
                flush!();
                let quote = c;
                let start_col = i as u32;
                let mut s = String::new();
                s.push(quote);
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    let sc = chars[i];
                    if sc == '\\' {
                        i += 1;
                        match chars.get(i) {
                            Some('t') => s.push('\t'),
                            Some('r') => s.push('\r'),
                            Some('n') => s.push('\n'),
                            Some('\'') => s.push('\''),
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some('/') => s.push('/'),
                            _ => {
                                return Err(Error::parse(
                                    ErrorCode::SyntaxError,
                                    "bad escape in string literal",
                                )
                                .with_loc(SourceLoc::new(line.clone(), i.min(line.len()))));
                            }
                        }
                        i += 1;
                        continue;
                    }
                    s.push(sc);
                    i += 1;
                    if sc == quote {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(Error::parse(
                        ErrorCode::SyntaxError,
                        "unterminated string literal",
                    )
                    .with_loc(SourceLoc::new(line.clone(), start_col as usize)));
                }
                toks.push(Tok::new(s, line_no as u32, start_col));
                continue;
            }

            // greedy two-char operators
            if let Some(n) = next {
                let pair: String = [c, n].iter().collect();
                if DOUBLE_SYMBOLS.contains(&pair.as_str()) {
                    flush!();
                    toks.push(Tok::new(pair, line_no as u32, i as u32));
                    i += 2;
                    continue;
                }
            }

            if SINGLE_SYMBOLS.contains(c) {
                flush!();
                toks.push(Tok::new(c.to_string(), line_no as u32, i as u32));
                i += 1;
                continue;
            }

            if c.is_whitespace() {
                flush!();
                i += 1;
                continue;
            }

            if current.is_empty() {
                current_col = i as u32;
            }
            current.push(c);
            i += 1;
        }
        flush!();
    }

    Ok((toks, lines))
}

/// Classification helpers shared by the block splitter and parser.
pub fn is_digitish(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && (bytes[0].is_ascii_digit()
            || (bytes[0] == b'-' && bytes.len() > 1 && bytes[1].is_ascii_digit()))
}

/// Numeric literal with a decimal point.
pub fn is_float_literal(s: &str) -> bool {
    is_digitish(s) && s.contains('.') && s[1..].chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Quoted string literal.
pub fn is_string_literal(s: &str) -> bool {
    s.starts_with('"') || s.starts_with('\'')
}

/// Identifier-shaped token.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Strip the quotes off a string literal token.
pub fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 && (s.starts_with('"') || s.starts_with('\'')) {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(src: &str) -> Vec<String> {
        tokenize(src).unwrap().0.into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn test_basic_split() {
        assert_eq!(
            texts("counter = counter + 1"),
            vec!["counter", "=", "counter", "+", "1"]
        );
    }

    #[test]
    fn test_chain_rewrite_vs_decimal() {
        assert_eq!(
            texts("each_row.limit(2)"),
            vec!["each_row", "__chain_limit", "(", "2", ")"]
        );
        assert_eq!(texts("price == 5.55"), vec!["price", "==", "5.55"]);
    }

    #[test]
    fn test_double_symbols_greedy() {
        assert_eq!(texts("a <= b << c"), vec!["a", "<=", "b", "<<", "c"]);
        assert_eq!(texts("x==y"), vec!["x", "==", "y"]);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(texts(r#"s = "a\tb""#), vec!["s", "=", "\"a\tb\""]);
        assert_eq!(texts(r#"'it\'s'"#), vec!["'it's'"]);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x = \"oops").unwrap_err();
        assert_eq!(err.code, ErrorCode::SyntaxError);
        assert!(err.loc.is_some());
    }

    #[test]
    fn test_negative_number() {
        assert_eq!(texts("x = -5"), vec!["x", "=", "-5"]);
        assert_eq!(texts("x - 5"), vec!["x", "-", "5"]);
    }

    #[test]
    fn test_comments_stripped() {
        assert_eq!(texts("x = 1 # the meaning\ny = 2"), vec!["x", "=", "1", "y", "=", "2"]);
    }

    #[test]
    fn test_time_shorthand_survives() {
        assert_eq!(texts("gap = 30_minutes"), vec!["gap", "=", "30_minutes"]);
    }
}
