//! The projection subset of SQL that mappings are written in.
//!
//! ```text
//! SELECT <source> [AS <alias>] (, <source> [AS <alias>])* FROM df [;]
//! source := identifier | "quoted identifier" | 'string literal' | number | NULL
//! ```
//!
//! Keywords are case-insensitive. Nothing else (joins, filters,
//! functions) is accepted; a mapping only renames and selects columns.

use super::fingerprint::canonicalize_header;
use crate::core::Table;
use crate::errors::MappingError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

// The pattern is a literal; a failure here is a build defect.
#[allow(clippy::expect_used)]
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z]*\s*\n?(.*?)\s*```\s*$").expect("valid regex")
});

/// Removes a surrounding Markdown code fence such as ```` ```sql ````.
#[must_use]
pub fn strip_code_fence(text: &str) -> &str {
    match CODE_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => text.trim(),
    }
}

/// Where a projected value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A column of `df`.
    Column(String),
    /// A constant.
    Literal(Value),
}

/// One `<source> AS <alias>` item.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    /// Value source.
    pub source: Source,
    /// Output name.
    pub alias: String,
}

/// A parsed mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Output items in order.
    pub items: Vec<ProjectionItem>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Str(String),
    Number(String),
    Comma,
    Semicolon,
}

fn syntax(offset: usize, reason: impl Into<String>) -> MappingError {
    MappingError::Syntax {
        offset,
        reason: reason.into(),
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn read_delimited(
    chars: &[(usize, char)],
    mut i: usize,
    delim: char,
) -> Result<(String, usize), MappingError> {
    let start = chars[i].0;
    let mut out = String::new();
    i += 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == delim {
            if chars.get(i + 1).is_some_and(|&(_, n)| n == delim) {
                out.push(delim);
                i += 2;
                continue;
            }
            return Ok((out, i + 1));
        }
        out.push(c);
        i += 1;
    }
    Err(syntax(start, format!("unterminated {delim}")))
}

fn tokenize(sql: &str) -> Result<Vec<(usize, Token)>, MappingError> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            ',' => {
                tokens.push((offset, Token::Comma));
                i += 1;
            }
            ';' => {
                tokens.push((offset, Token::Semicolon));
                i += 1;
            }
            '"' | '`' => {
                let (text, next) = read_delimited(&chars, i, c)?;
                tokens.push((offset, Token::Quoted(text)));
                i = next;
            }
            '\'' => {
                let (text, next) = read_delimited(&chars, i, '\'')?;
                tokens.push((offset, Token::Str(text)));
                i = next;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|&(_, n)| n.is_ascii_digit())) => {
                let mut text = String::from(c);
                i += 1;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    text.push(chars[i].1);
                    i += 1;
                }
                tokens.push((offset, Token::Number(text)));
            }
            c if is_word_char(c) => {
                let mut text = String::new();
                while i < chars.len() && is_word_char(chars[i].1) {
                    text.push(chars[i].1);
                    i += 1;
                }
                tokens.push((offset, Token::Word(text)));
            }
            other => return Err(syntax(offset, format!("unexpected '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), MappingError> {
        if self.at_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected {keyword}")))
        }
    }

    fn source(&mut self) -> Result<Source, MappingError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("null") => Ok(Source::Literal(Value::Null)),
            Some(Token::Word(w)) if is_reserved(&w) => Err(syntax(offset, format!("unexpected {w}"))),
            Some(Token::Word(w) | Token::Quoted(w)) => Ok(Source::Column(w)),
            Some(Token::Str(s)) => Ok(Source::Literal(Value::String(s))),
            Some(Token::Number(n)) => serde_json::from_str::<serde_json::Number>(&n)
                .map(|n| Source::Literal(Value::Number(n)))
                .map_err(|_| syntax(offset, format!("bad number {n}"))),
            _ => Err(syntax(offset, "expected a column or literal")),
        }
    }

    fn alias(&mut self) -> Result<Option<String>, MappingError> {
        let explicit = self.at_keyword("as");
        if explicit {
            self.pos += 1;
        }
        let offset = self.offset();
        match self.peek() {
            Some(Token::Quoted(_)) => match self.advance() {
                Some(Token::Quoted(a)) => Ok(Some(a)),
                _ => Err(syntax(offset, "expected alias")),
            },
            Some(Token::Word(w)) if !is_reserved(w) => match self.advance() {
                Some(Token::Word(a)) => Ok(Some(a)),
                _ => Err(syntax(offset, "expected alias")),
            },
            _ if explicit => Err(syntax(offset, "expected alias after AS")),
            _ => Ok(None),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    ["select", "from", "as", "where", "join", "null"]
        .iter()
        .any(|k| word.eq_ignore_ascii_case(k))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl Projection {
    /// Parses a mapping, tolerating a surrounding code fence.
    pub fn parse(sql: &str) -> Result<Self, MappingError> {
        let sql = strip_code_fence(sql);
        let mut parser = Parser {
            tokens: tokenize(sql)?,
            pos: 0,
            end: sql.len(),
        };

        parser.expect_keyword("select")?;
        let mut items = Vec::new();
        loop {
            let offset = parser.offset();
            let source = parser.source()?;
            let alias = match (parser.alias()?, &source) {
                (Some(alias), _) => alias,
                (None, Source::Column(name)) => name.clone(),
                (None, Source::Literal(_)) => return Err(syntax(offset, "literal needs an alias")),
            };
            items.push(ProjectionItem { source, alias });
            if parser.peek() == Some(&Token::Comma) {
                parser.pos += 1;
            } else {
                break;
            }
        }

        parser.expect_keyword("from")?;
        let offset = parser.offset();
        match parser.advance() {
            Some(Token::Word(t) | Token::Quoted(t)) if t == "df" => {}
            _ => return Err(syntax(offset, "only FROM df is supported")),
        }
        if parser.peek() == Some(&Token::Semicolon) {
            parser.pos += 1;
        }
        if parser.peek().is_some() {
            return Err(syntax(parser.offset(), "unexpected trailing input"));
        }
        Ok(Self { items })
    }

    /// Renders the projection back to SQL with quoted identifiers.
    #[must_use]
    pub fn to_sql(&self) -> String {
        let items: Vec<String> = self
            .items
            .iter()
            .map(|item| {
                let source = match &item.source {
                    Source::Column(name) => quote_ident(name),
                    Source::Literal(Value::Null) => "NULL".to_string(),
                    Source::Literal(Value::String(s)) => format!("'{}'", s.replace('\'', "''")),
                    Source::Literal(other) => other.to_string(),
                };
                format!("{source} AS {}", quote_ident(&item.alias))
            })
            .collect();
        format!("SELECT {} FROM df", items.join(", "))
    }

    /// Output names in order.
    #[must_use]
    pub fn aliases(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.alias.as_str()).collect()
    }

    /// Applies the projection to every row of a table.
    ///
    /// Columns are matched exactly first, then by canonical form. Empty
    /// cells become `null`.
    pub fn apply(&self, table: &Table) -> Result<Vec<Map<String, Value>>, MappingError> {
        let canonical: Vec<String> = table.columns.iter().map(|c| canonicalize_header(c)).collect();
        let resolved = self
            .items
            .iter()
            .map(|item| match &item.source {
                Source::Column(name) => table
                    .column_index(name)
                    .or_else(|| {
                        let wanted = canonicalize_header(name);
                        canonical.iter().position(|c| *c == wanted)
                    })
                    .map(Some)
                    .ok_or_else(|| MappingError::UnknownColumn(name.clone())),
                Source::Literal(_) => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(table
            .rows
            .iter()
            .map(|row| {
                self.items
                    .iter()
                    .zip(&resolved)
                    .map(|(item, index)| {
                        let value = match (index, &item.source) {
                            (Some(i), _) => match row.get(*i).map(String::as_str) {
                                None | Some("") => Value::Null,
                                Some(cell) => Value::String(cell.to_string()),
                            },
                            (None, Source::Literal(v)) => v.clone(),
                            (None, Source::Column(_)) => Value::Null,
                        };
                        (item.alias.clone(), value)
                    })
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn table() -> Table {
        Table::new(
            vec!["姓名".into(), "金额（元）".into(), "备注".into()],
            vec![
                vec!["Ann".into(), "10".into(), String::new()],
                vec!["Bob".into(), "20".into(), "late".into()],
            ],
        )
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```sql\nSELECT a FROM df\n```"), "SELECT a FROM df");
        assert_eq!(strip_code_fence("  SELECT a FROM df "), "SELECT a FROM df");
    }

    #[test]
    fn test_parse_items() {
        let p = Projection::parse(r#"select 姓名 as name, "金额（元）" AS "amount", 'cny' AS currency, NULL AS note from df;"#)
            .unwrap();

        assert_eq!(p.aliases(), vec!["name", "amount", "currency", "note"]);
        assert_eq!(p.items[0].source, Source::Column("姓名".into()));
        assert_eq!(p.items[2].source, Source::Literal(json!("cny")));
        assert_eq!(p.items[3].source, Source::Literal(Value::Null));
    }

    #[test]
    fn test_parse_rejects_non_projection() {
        assert!(Projection::parse("SELECT a FROM df WHERE a = 1").is_err());
        assert!(Projection::parse("SELECT a FROM other").is_err());
        assert!(Projection::parse("DELETE FROM df").is_err());
        assert!(Projection::parse("SELECT 'x' FROM df").is_err());
        assert!(Projection::parse("SELECT \"a FROM df").is_err());
    }

    #[test]
    fn test_to_sql_reparses() {
        let p = Projection::parse(r#"SELECT "it""s" AS x, 'o''k' AS y, 3 AS z FROM df"#).unwrap();
        assert_eq!(p.to_sql(), r#"SELECT "it""s" AS "x", 'o''k' AS "y", 3 AS "z" FROM df"#);
        assert_eq!(Projection::parse(&p.to_sql()).unwrap(), p);
    }

    #[test]
    fn test_apply() {
        let p = Projection::parse(r#"SELECT 姓名 AS name, "金额(元)" AS amount, 备注 AS note, 'cny' AS cur FROM df"#)
            .unwrap();
        let records = p.apply(&table()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], json!("Ann"));
        assert_eq!(records[0]["amount"], json!("10"));
        assert_eq!(records[0]["note"], Value::Null);
        assert_eq!(records[1]["cur"], json!("cny"));
    }

    #[test]
    fn test_apply_unknown_column() {
        let p = Projection::parse("SELECT phone AS phone FROM df").unwrap();
        assert_eq!(p.apply(&table()), Err(MappingError::UnknownColumn("phone".into())));
    }
}
