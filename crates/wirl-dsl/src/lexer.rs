//! Hand-written lexer for WIRL source.

use crate::error::ParseError;
use crate::token::{Token, TokenKind};

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.char_indices().peekable(),
            src,
            line: 1,
            col: 1,
        }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let next = self.chars.next();
        if let Some((_, c)) = next {
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        next
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let (line, col) = (self.line, self.col);
            let Some((start, c)) = self.chars.peek().copied() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    col,
                });
                break;
            };

            let kind = match c {
                '{' => {
                    self.bump();
                    TokenKind::LBrace
                }
                '}' => {
                    self.bump();
                    TokenKind::RBrace
                }
                '(' => {
                    self.bump();
                    TokenKind::LParen
                }
                ')' => {
                    self.bump();
                    TokenKind::RParen
                }
                '[' => {
                    self.bump();
                    TokenKind::LBracket
                }
                ']' => {
                    self.bump();
                    TokenKind::RBracket
                }
                ';' => {
                    self.bump();
                    TokenKind::Semi
                }
                ':' => {
                    self.bump();
                    TokenKind::Colon
                }
                ',' => {
                    self.bump();
                    TokenKind::Comma
                }
                '.' => {
                    self.bump();
                    TokenKind::Dot
                }
                '=' => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        TokenKind::EqEq
                    } else {
                        TokenKind::Eq
                    }
                }
                '!' => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        TokenKind::NotEq
                    } else {
                        TokenKind::Bang
                    }
                }
                '&' => {
                    self.bump();
                    if self.peek_char() == Some('&') {
                        self.bump();
                        TokenKind::AndAnd
                    } else {
                        return Err(ParseError::new(
                            line,
                            col,
                            "expected '&&'".to_string(),
                        ));
                    }
                }
                '|' => {
                    self.bump();
                    if self.peek_char() == Some('|') {
                        self.bump();
                        TokenKind::OrOr
                    } else {
                        return Err(ParseError::new(
                            line,
                            col,
                            "expected '||'".to_string(),
                        ));
                    }
                }
                '"' => self.lex_string(line, col)?,
                c if c.is_ascii_digit() => self.lex_number(),
                c if c.is_alphabetic() || c == '_' => self.lex_ident(),
                other => {
                    return Err(ParseError::new(
                        line,
                        col,
                        format!("unexpected character '{other}'"),
                    ));
                }
            };
            let _ = start;
            tokens.push(Token { kind, line, col });
        }
        Ok(tokens)
    }

    fn lex_string(&mut self, line: usize, col: usize) -> Result<TokenKind, ParseError> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                Some((_, '"')) => break,
                Some((_, '\\')) => match self.bump() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, '"')) => s.push('"'),
                    Some((_, '\\')) => s.push('\\'),
                    Some((_, other)) => s.push(other),
                    None => return Err(ParseError::new(line, col, "unterminated string".into())),
                },
                Some((_, c)) => s.push(c),
                None => return Err(ParseError::new(line, col, "unterminated string".into())),
            }
        }
        Ok(TokenKind::Str(s))
    }

    fn lex_number(&mut self) -> TokenKind {
        let start_idx = self.chars.peek().unwrap().0;
        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' && !is_float {
                is_float = true;
                self.bump();
            } else {
                break;
            }
        }
        let end_idx = self
            .chars
            .peek()
            .map(|&(i, _)| i)
            .unwrap_or(self.src.len());
        let text = &self.src[start_idx..end_idx];
        if is_float {
            TokenKind::Float(text.parse().unwrap_or(0.0))
        } else {
            TokenKind::Int(text.parse().unwrap_or(0))
        }
    }

    fn lex_ident(&mut self) -> TokenKind {
        let start_idx = self.chars.peek().unwrap().0;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let end_idx = self
            .chars
            .peek()
            .map(|&(i, _)| i)
            .unwrap_or(self.src.len());
        let text = &self.src[start_idx..end_idx];
        match text {
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            "null" => TokenKind::Null,
            _ => TokenKind::Ident(text.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_braces_and_idents() {
        let tokens = Lexer::new("node A { call \"x\"; }").tokenize().unwrap();
        let kinds: Vec<_> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("node".into()),
                TokenKind::Ident("A".into()),
                TokenKind::LBrace,
                TokenKind::Ident("call".into()),
                TokenKind::Str("x".into()),
                TokenKind::Semi,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        let tokens = Lexer::new("# a comment\nnull").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Null);
    }

    #[test]
    fn reports_line_and_col_on_unexpected_char() {
        let err = Lexer::new("node A { @ }").tokenize().unwrap_err();
        assert_eq!(err.line, 1);
    }
}
