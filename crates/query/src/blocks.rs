//! Block extraction
//!
//! The token stream has no statement terminators; statements are
//! recovered with a *valid-next-token* predicate (what may legally
//! follow a name, a number, an operator, or a closing bracket), and
//! `if` / `elsif` / `else` / `for` / `each_row` / `select` … `end`
//! ranges become numbered nested blocks referenced from the parent
//! line.

use crate::token::{is_digitish, is_identifier, is_string_literal, Tok, CHAIN_PREFIX};
use cohort_core::error::{Error, ErrorCode, Result, SourceLoc};

/// Words that open an `end`-terminated block.
const BLOCK_START_WORDS: [&str; 4] = ["if", "for", "each_row", "select"];

/// One extracted statement: its tokens plus the nested block, if the
/// statement opened one.
#[derive(Debug, Clone)]
pub struct LineItem {
    /// Statement tokens (the `if`/`for`/… keyword included)
    pub words: Vec<Tok>,
    /// Nested code block opened by this statement
    pub code_block: Option<usize>,
}

/// A numbered block of statements. Block 0 is the script body.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block id (index into [`Blocks::blocks`])
    pub id: usize,
    /// Statements in order
    pub lines: Vec<LineItem>,
}

/// All blocks extracted from a script.
#[derive(Debug, Clone, Default)]
pub struct Blocks {
    /// Dense block storage; ids are indexes
    pub blocks: Vec<Block>,
}

impl Blocks {
    /// Allocate an empty block and return its id.
    pub fn new_block(&mut self) -> usize {
        let id = self.blocks.len();
        self.blocks.push(Block {
            id,
            lines: Vec::new(),
        });
        id
    }

    /// Borrow a block.
    pub fn get(&self, id: usize) -> &Block {
        &self.blocks[id]
    }
}

/// Does a block-opening word begin this token?
fn is_block_start(tok: &Tok) -> bool {
    BLOCK_START_WORDS.contains(&tok.text.as_str())
}

/// Extract statements and nested blocks from a token stream.
pub fn extract_blocks(tokens: &[Tok]) -> Result<Blocks> {
    let mut blocks = Blocks::default();
    let root = blocks.new_block();
    extract_into(tokens, &mut blocks, root, 0, tokens.len())?;
    Ok(blocks)
}

fn extract_into(
    tokens: &[Tok],
    blocks: &mut Blocks,
    block_id: usize,
    start: usize,
    end: usize,
) -> Result<()> {
    let mut idx = start;
    let mut line: Vec<Tok> = Vec::new();

    while idx < end {
        line.push(tokens[idx].clone());

        if !valid_next(tokens, idx, end) {
            // statement complete; open a nested block if it starts one
            let mut code_block = None;
            if is_block_start(&line[0]) {
                let body_end = seek_block_end(tokens, idx + 1, end).ok_or_else(|| {
                    Error::parse(
                        ErrorCode::UnmatchedBracket,
                        format!("`{}` without matching `end`", line[0].text),
                    )
                    .with_loc(loc_of(&line))
                })?;
                let sub = blocks.new_block();
                extract_into(tokens, blocks, sub, idx + 1, body_end)?;
                idx = body_end; // skip to the `end` token
                code_block = Some(sub);
            }
            blocks.blocks[block_id].lines.push(LineItem {
                words: std::mem::take(&mut line),
                code_block,
            });
        }
        idx += 1;
    }

    if !line.is_empty() {
        blocks.blocks[block_id].lines.push(LineItem {
            words: line,
            code_block: None,
        });
    }
    Ok(())
}

/// Find the `end` matching a block opened just before `start`.
fn seek_block_end(tokens: &[Tok], start: usize, end: usize) -> Option<usize> {
    let mut depth = 1;
    let mut idx = start;
    while idx < end {
        let text = tokens[idx].text.as_str();
        if BLOCK_START_WORDS.contains(&text) {
            depth += 1;
        } else if text == "end" {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
        idx += 1;
    }
    None
}

fn is_name_or_number(s: &str) -> bool {
    is_identifier(s) || is_digitish(s) || is_string_literal(s)
}

const VALID_AFTER_VAR_OR_NUM: [&str; 27] = [
    "&&", "||", "==", "!=", ">=", "<=", ">", "<", ")", "(", "}", "{", "[", "]", "+", "=", "-",
    "*", "/", "in", "contains", "any", ",", ":", "where", "as", "key",
];

const COMPOUND_ASSIGN: [&str; 4] = ["+=", "-=", "*=", "/="];

const VALID_AFTER_CLOSING_BRACKET: [&str; 20] = [
    "||", "&&", "==", "!=", ">=", "<=", ">", "<", "where", ",", ")", "(", "]", "[", "{", "}",
    "+", "-", "*", "/",
];

/// May the token after `offset` belong to the same statement?
fn valid_next(tokens: &[Tok], offset: usize, end: usize) -> bool {
    let token = tokens[offset].text.as_str();
    let next = if offset + 1 >= end {
        ""
    } else {
        tokens[offset + 1].text.as_str()
    };

    // statement terminators
    if token == "end" || token == "else" || token == "continue" {
        return false;
    }

    // `break` continues only into its parenthesized depth
    if token == "break" {
        return next == "(";
    }

    let is_chain_next = next.starts_with(CHAIN_PREFIX);

    // `each_row` headers carry only chains and an optional `where`; a
    // bare header ends immediately
    if token == "each_row" {
        return is_chain_next || next == "where";
    }
    // `select` headers are always bare
    if token == "select" {
        return false;
    }

    // conditionals and loops keep accumulating their condition
    if matches!(token, "if" | "elsif" | "for" | "<<") {
        return is_name_or_number(next) || next == "(" || is_chain_next;
    }

    let after_bracket_ok = VALID_AFTER_CLOSING_BRACKET.contains(&next);

    if token == ")" {
        // `)` closing a chain call may be followed by another chain or,
        // in an `each_row` header, by `where`; otherwise only
        // operator-ish tokens continue the statement
        if is_chain_next || next == "where" {
            return true;
        }
        return after_bracket_ok && !is_name_or_number(next);
    }

    if (token == "]" || token == "}") && (is_name_or_number(next) || !after_bracket_ok) {
        return false;
    }

    if is_chain_next {
        return true;
    }

    if is_name_or_number(token)
        && (VALID_AFTER_VAR_OR_NUM.contains(&next) || COMPOUND_ASSIGN.contains(&next))
    {
        return true;
    }

    if VALID_AFTER_VAR_OR_NUM.contains(&token) || COMPOUND_ASSIGN.contains(&token) {
        return true;
    }

    false
}

/// Source location of a statement (first token wins).
pub fn loc_of(words: &[Tok]) -> SourceLoc {
    match words.first() {
        Some(tok) => SourceLoc::new(
            words
                .iter()
                .map(|t| t.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            tok.col as usize,
        ),
        None => SourceLoc::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn lines_of(src: &str) -> Vec<Vec<String>> {
        let (toks, _) = tokenize(src).unwrap();
        let blocks = extract_blocks(&toks).unwrap();
        blocks.blocks[0]
            .lines
            .iter()
            .map(|l| l.words.iter().map(|t| t.text.clone()).collect())
            .collect()
    }

    #[test]
    fn test_two_statements_split() {
        let lines = lines_of("x = 1\ny = x * 2");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], vec!["x", "=", "1"]);
        assert_eq!(lines[1], vec!["y", "=", "x", "*", "2"]);
    }

    #[test]
    fn test_nested_if_block() {
        let (toks, _) = tokenize("if x == 1\n  y = 2\nend\nz = 3").unwrap();
        let blocks = extract_blocks(&toks).unwrap();
        let root = &blocks.blocks[0];
        assert_eq!(root.lines.len(), 2);
        assert_eq!(root.lines[0].words[0].text, "if");
        let sub = root.lines[0].code_block.unwrap();
        assert_eq!(blocks.get(sub).lines.len(), 1);
        assert_eq!(root.lines[1].words[0].text, "z");
    }

    #[test]
    fn test_each_row_with_chains_and_where() {
        let lines = lines_of("each_row.limit(2) where event == \"purchase\"\n  x = 1\nend");
        assert_eq!(
            lines[0],
            vec![
                "each_row",
                "__chain_limit",
                "(",
                "2",
                ")",
                "where",
                "event",
                "==",
                "\"purchase\""
            ]
        );
    }

    #[test]
    fn test_missing_end_detected() {
        let (toks, _) = tokenize("if x == 1\n  y = 2").unwrap();
        let err = extract_blocks(&toks).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnmatchedBracket);
    }

    #[test]
    fn test_call_statements_split() {
        let lines = lines_of("debug(true)\ndebug(len(x) == 7)");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1][0], "debug");
    }

    #[test]
    fn test_tally_statement() {
        let lines = lines_of("<< fruit, price");
        assert_eq!(lines[0], vec!["<<", "fruit", ",", "price"]);
    }

    #[test]
    fn test_deep_nesting() {
        let (toks, _) = tokenize(
            "for a in xs\n  for b in ys\n    if a == b\n      n = n + 1\n    end\n  end\nend",
        )
        .unwrap();
        let blocks = extract_blocks(&toks).unwrap();
        // root + for + for + if
        assert_eq!(blocks.blocks.len(), 4);
    }

    #[test]
    fn test_multiline_dict_literal_is_one_statement() {
        let lines = lines_of("d = {\n  fruits: [\"apple\"],\n  n: 3\n}\nx = 1");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0][0], "d");
        assert_eq!(lines[1], vec!["x", "=", "1"]);
    }
}
