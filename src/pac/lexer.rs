use crate::error::EvalError;

/// Token stream for the PAC script subset. Line numbers are tracked so
/// syntax errors can point somewhere useful.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Keyword(Keyword),
    Punct(Punct),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Function,
    Var,
    If,
    Else,
    While,
    For,
    Return,
    True,
    False,
    Null,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    NotEq,
    EqEqEq,
    NotEqEq,
    AndAnd,
    OrOr,
    Assign,
    Question,
    Colon,
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub line: u32,
}

fn keyword_for(ident: &str) -> Option<Keyword> {
    match ident {
        "function" => Some(Keyword::Function),
        "var" => Some(Keyword::Var),
        "if" => Some(Keyword::If),
        "else" => Some(Keyword::Else),
        "while" => Some(Keyword::While),
        "for" => Some(Keyword::For),
        "return" => Some(Keyword::Return),
        "true" => Some(Keyword::True),
        "false" => Some(Keyword::False),
        "null" => Some(Keyword::Null),
        "undefined" => Some(Keyword::Undefined),
        _ => None,
    }
}

pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, EvalError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;
    let mut line = 1u32;

    let err = |line: u32, message: String| EvalError::Syntax { line, message };

    while pos < bytes.len() {
        let c = bytes[pos];
        match c {
            b'\n' => {
                line += 1;
                pos += 1;
            }
            b' ' | b'\t' | b'\r' => {
                pos += 1;
            }
            b'/' if pos + 1 < bytes.len() && bytes[pos + 1] == b'/' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            }
            b'/' if pos + 1 < bytes.len() && bytes[pos + 1] == b'*' => {
                pos += 2;
                loop {
                    if pos + 1 >= bytes.len() {
                        return Err(err(line, "unterminated block comment".to_string()));
                    }
                    if bytes[pos] == b'\n' {
                        line += 1;
                    }
                    if bytes[pos] == b'*' && bytes[pos + 1] == b'/' {
                        pos += 2;
                        break;
                    }
                    pos += 1;
                }
            }
            b'"' | b'\'' => {
                let quote = c;
                pos += 1;
                let mut value = String::new();
                loop {
                    if pos >= bytes.len() {
                        return Err(err(line, "unterminated string literal".to_string()));
                    }
                    let b = bytes[pos];
                    if b == quote {
                        pos += 1;
                        break;
                    }
                    if b == b'\n' {
                        return Err(err(line, "unterminated string literal".to_string()));
                    }
                    if b == b'\\' {
                        pos += 1;
                        if pos >= bytes.len() {
                            return Err(err(line, "unterminated escape sequence".to_string()));
                        }
                        let escaped = match bytes[pos] {
                            b'n' => '\n',
                            b't' => '\t',
                            b'r' => '\r',
                            b'0' => '\0',
                            other => other as char,
                        };
                        value.push(escaped);
                        pos += 1;
                    } else {
                        // Copy the full UTF-8 sequence starting here.
                        let ch_str = &source[pos..];
                        let ch = ch_str.chars().next().unwrap();
                        value.push(ch);
                        pos += ch.len_utf8();
                    }
                }
                tokens.push(SpannedToken {
                    token: Token::Str(value),
                    line,
                });
            }
            b'0'..=b'9' => {
                let start = pos;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                if pos < bytes.len() && bytes[pos] == b'.' {
                    pos += 1;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
                let text = &source[start..pos];
                let value = text
                    .parse::<f64>()
                    .map_err(|e| err(line, format!("invalid number {text:?}: {e}")))?;
                tokens.push(SpannedToken {
                    token: Token::Num(value),
                    line,
                });
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' | b'$' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric()
                        || bytes[pos] == b'_'
                        || bytes[pos] == b'$')
                {
                    pos += 1;
                }
                let text = &source[start..pos];
                let token = match keyword_for(text) {
                    Some(kw) => Token::Keyword(kw),
                    None => Token::Ident(text.to_string()),
                };
                tokens.push(SpannedToken { token, line });
            }
            _ => {
                let peek = |offset: usize| -> u8 {
                    if pos + offset < bytes.len() {
                        bytes[pos + offset]
                    } else {
                        0
                    }
                };
                let (punct, len) = match (c, peek(1), peek(2)) {
                    (b'=', b'=', b'=') => (Punct::EqEqEq, 3),
                    (b'!', b'=', b'=') => (Punct::NotEqEq, 3),
                    (b'=', b'=', _) => (Punct::EqEq, 2),
                    (b'!', b'=', _) => (Punct::NotEq, 2),
                    (b'<', b'=', _) => (Punct::Le, 2),
                    (b'>', b'=', _) => (Punct::Ge, 2),
                    (b'&', b'&', _) => (Punct::AndAnd, 2),
                    (b'|', b'|', _) => (Punct::OrOr, 2),
                    _ => match c {
                        b'(' => (Punct::LParen, 1),
                        b')' => (Punct::RParen, 1),
                        b'{' => (Punct::LBrace, 1),
                        b'}' => (Punct::RBrace, 1),
                        b',' => (Punct::Comma, 1),
                        b';' => (Punct::Semi, 1),
                        b'.' => (Punct::Dot, 1),
                        b'+' => (Punct::Plus, 1),
                        b'-' => (Punct::Minus, 1),
                        b'*' => (Punct::Star, 1),
                        b'/' => (Punct::Slash, 1),
                        b'%' => (Punct::Percent, 1),
                        b'!' => (Punct::Not, 1),
                        b'<' => (Punct::Lt, 1),
                        b'>' => (Punct::Gt, 1),
                        b'=' => (Punct::Assign, 1),
                        b'?' => (Punct::Question, 1),
                        b':' => (Punct::Colon, 1),
                        other => {
                            return Err(err(
                                line,
                                format!("unexpected character {:?}", other as char),
                            ));
                        }
                    },
                };
                tokens.push(SpannedToken {
                    token: Token::Punct(punct),
                    line,
                });
                pos += len;
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basics() {
        let tokens = tokenize("if (host == \"a.b\") return 1.5; // done").unwrap();
        let kinds: Vec<Token> = tokens.into_iter().map(|t| t.token).collect();
        assert_eq!(
            kinds,
            vec![
                Token::Keyword(Keyword::If),
                Token::Punct(Punct::LParen),
                Token::Ident("host".to_string()),
                Token::Punct(Punct::EqEq),
                Token::Str("a.b".to_string()),
                Token::Punct(Punct::RParen),
                Token::Keyword(Keyword::Return),
                Token::Num(1.5),
                Token::Punct(Punct::Semi),
            ]
        );
    }

    #[test]
    fn test_tokenize_comments_and_escapes() {
        let tokens = tokenize("/* a\nb */ 'x\\ny' === \"z\"").unwrap();
        assert_eq!(tokens[0].token, Token::Str("x\ny".to_string()));
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens[1].token, Token::Punct(Punct::EqEqEq));
    }

    #[test]
    fn test_tokenize_rejects_garbage() {
        assert!(tokenize("host @ 1").is_err());
        assert!(tokenize("\"unterminated").is_err());
    }
}
