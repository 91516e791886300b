//! Lightweight statement text scanning.
//!
//! Extracts referenced tables and WHERE-clause comparisons from SQL text
//! without a full parser. Good enough for bucketing workload by table,
//! mapping placeholders to columns, and spotting unparameterized statements;
//! anything it cannot read it simply skips.

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Placeholder(u32),
    Op(String),
    Punct(char),
}

/// Right-hand side of a WHERE comparison.
#[derive(Clone, Debug, PartialEq)]
pub enum Rhs {
    Placeholder(u32),
    Literal(String),
}

/// One `column <op> value` comparison from a WHERE clause.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub rhs: Rhs,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' {
            chars.next();
            let mut s = String::new();
            while let Some(ch) = chars.next() {
                if ch == '\'' {
                    if chars.peek() == Some(&'\'') {
                        s.push('\'');
                        chars.next();
                    } else {
                        break;
                    }
                } else {
                    s.push(ch);
                }
            }
            tokens.push(Token::Str(s));
        } else if c == '$' {
            chars.next();
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            if let Ok(n) = num.parse() {
                tokens.push(Token::Placeholder(n));
            }
        } else if c.is_alphabetic() || c == '_' || c == '"' {
            let quoted = c == '"';
            if quoted {
                chars.next();
            }
            let mut ident = String::new();
            while let Some(&ch) = chars.peek() {
                if quoted {
                    if ch == '"' {
                        chars.next();
                        break;
                    }
                    ident.push(ch);
                    chars.next();
                } else if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                    ident.push(ch.to_ascii_lowercase());
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(ident));
        } else if c.is_ascii_digit() {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Number(num));
        } else if "=<>!".contains(c) {
            let mut op = String::new();
            while let Some(&o) = chars.peek() {
                if "=<>!".contains(o) {
                    op.push(o);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Op(op));
        } else {
            tokens.push(Token::Punct(c));
            chars.next();
        }
    }
    tokens
}

fn last_component(ident: &str) -> String {
    ident.rsplit('.').next().unwrap_or(ident).to_string()
}

/// Table names referenced via FROM / JOIN / UPDATE / INSERT INTO.
pub fn tables_of(sql: &str) -> Vec<String> {
    let tokens = tokenize(sql);
    let mut tables = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if let Token::Ident(word) = &tokens[i] {
            let grab_next = match word.as_str() {
                "from" | "join" | "update" => true,
                "into" => matches!(&tokens.get(i.wrapping_sub(1)),
                    Some(Token::Ident(w)) if w == "insert"),
                _ => false,
            };
            if grab_next {
                let mut j = i + 1;
                if let Some(Token::Ident(w)) = tokens.get(j) {
                    if w == "only" {
                        j += 1;
                    }
                }
                if let Some(Token::Ident(name)) = tokens.get(j) {
                    let table = last_component(name);
                    if !tables.contains(&table) {
                        tables.push(table);
                    }
                }
            }
        }
        i += 1;
    }
    tables
}

const CLAUSE_ENDERS: &[&str] = &["group", "order", "limit", "having", "returning"];
const COMPARE_OPS: &[&str] = &["=", "<", ">", "<=", ">=", "<>", "!="];

/// Comparisons found in the WHERE clause.
pub fn where_predicates(sql: &str) -> Vec<Predicate> {
    let tokens = tokenize(sql);
    let mut predicates = Vec::new();

    let Some(start) = tokens
        .iter()
        .position(|t| matches!(t, Token::Ident(w) if w == "where"))
    else {
        return predicates;
    };

    let mut i = start + 1;
    while i < tokens.len() {
        if let Token::Ident(w) = &tokens[i] {
            if CLAUSE_ENDERS.contains(&w.as_str()) {
                break;
            }
        }
        if i + 2 < tokens.len() {
            if let (Token::Ident(col), Token::Op(op)) = (&tokens[i], &tokens[i + 1]) {
                if COMPARE_OPS.contains(&op.as_str()) {
                    let rhs = match &tokens[i + 2] {
                        Token::Placeholder(n) => Some(Rhs::Placeholder(*n)),
                        Token::Number(n) => Some(Rhs::Literal(n.clone())),
                        Token::Str(s) => Some(Rhs::Literal(format!("'{}'", s))),
                        _ => None,
                    };
                    if let Some(rhs) = rhs {
                        predicates.push(Predicate {
                            column: last_component(col),
                            rhs,
                        });
                        i += 3;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    predicates
}

/// Whether the statement carries any `$n` placeholder at all.
pub fn has_placeholders(sql: &str) -> bool {
    tokenize(sql)
        .iter()
        .any(|t| matches!(t, Token::Placeholder(_)))
}

/// A statement comparing columns against literals with no placeholder
/// anywhere is a candidate for parameterization.
pub fn is_unparameterized(sql: &str) -> bool {
    if has_placeholders(sql) {
        return false;
    }
    where_predicates(sql)
        .iter()
        .any(|p| matches!(p.rhs, Rhs::Literal(_)))
}
