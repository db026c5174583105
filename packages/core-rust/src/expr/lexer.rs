use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Question,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    In,
}

/// A token with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub pos: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let mut out = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = pos;
            let mut is_float = false;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '_' {
                    end = i + 1;
                    chars.next();
                } else if d == '.' && !is_float {
                    // `1.foo` is not a float; only consume the dot when a digit follows.
                    let next_is_digit = src[i + 1..].chars().next().is_some_and(|n| n.is_ascii_digit());
                    if !next_is_digit {
                        break;
                    }
                    is_float = true;
                    end = i + 1;
                    chars.next();
                } else {
                    break;
                }
            }
            let text: String = src[pos..end].chars().filter(|&ch| ch != '_').collect();
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| ExprError::parse(pos, "invalid number"))?)
            } else {
                Token::Int(text.parse().map_err(|_| ExprError::parse(pos, "integer out of range"))?)
            };
            out.push(Spanned { token, pos });
            continue;
        }

        if c == '\'' || c == '"' {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some((_, ch)) = chars.next() {
                match ch {
                    '\\' => match chars.next() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, 't')) => value.push('\t'),
                        Some((_, 'r')) => value.push('\r'),
                        Some((_, other)) => value.push(other),
                        None => break,
                    },
                    ch if ch == c => {
                        closed = true;
                        break;
                    }
                    ch => value.push(ch),
                }
            }
            if !closed {
                return Err(ExprError::parse(pos, "unterminated string"));
            }
            out.push(Spanned {
                token: Token::Str(value),
                pos,
            });
            continue;
        }

        if is_ident_start(c) {
            let mut end = pos + c.len_utf8();
            chars.next();
            while let Some(&(i, d)) = chars.peek() {
                if !is_ident_continue(d) {
                    break;
                }
                end = i + d.len_utf8();
                chars.next();
            }
            let word = &src[pos..end];
            let token = match word {
                "true" => Token::True,
                "false" => Token::False,
                "null" | "nil" => Token::Null,
                "and" => Token::AndAnd,
                "or" => Token::OrOr,
                "not" => Token::Not,
                "in" => Token::In,
                _ => Token::Ident(word.to_string()),
            };
            out.push(Spanned { token, pos });
            continue;
        }

        chars.next();
        let next = chars.peek().map(|&(_, n)| n);
        let (token, wide) = match (c, next) {
            ('<', Some('=')) => (Token::Le, true),
            ('>', Some('=')) => (Token::Ge, true),
            ('=', Some('=')) => (Token::EqEq, true),
            ('!', Some('=')) => (Token::NotEq, true),
            ('&', Some('&')) => (Token::AndAnd, true),
            ('|', Some('|')) => (Token::OrOr, true),
            ('<', _) => (Token::Lt, false),
            ('>', _) => (Token::Gt, false),
            ('!', _) => (Token::Not, false),
            ('(', _) => (Token::LParen, false),
            (')', _) => (Token::RParen, false),
            ('[', _) => (Token::LBracket, false),
            (']', _) => (Token::RBracket, false),
            ('{', _) => (Token::LBrace, false),
            ('}', _) => (Token::RBrace, false),
            (',', _) => (Token::Comma, false),
            ('.', _) => (Token::Dot, false),
            (':', _) => (Token::Colon, false),
            ('?', _) => (Token::Question, false),
            ('+', _) => (Token::Plus, false),
            ('-', _) => (Token::Minus, false),
            ('*', _) => (Token::Star, false),
            ('/', _) => (Token::Slash, false),
            ('%', _) => (Token::Percent, false),
            _ => return Err(ExprError::parse(pos, format!("unexpected character {c:?}"))),
        };
        if wide {
            chars.next();
        }
        out.push(Spanned { token, pos });
    }

    Ok(out)
}
