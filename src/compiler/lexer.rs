use crate::prelude::*;

/// Token kinds of the conversion-schema language.
///
/// The language is indentation-structured: the lexer synthesizes `Newline`,
/// `Indent` and `Dedent` tokens from the physical layout so the parser can
/// treat blocks like ordinary brackets.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Entity,
    Node,
    Relationship,
    Match,

    // Literals
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),

    Ident(String),

    // Symbols
    LParen,
    RParen,
    Comma,
    Dot,
    Colon,
    Eq,
    Dash,
    Plus,

    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

pub struct Lexer<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    indent_stack: Vec<usize>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            tokens: Vec::new(),
            indent_stack: vec![0],
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let lines: Vec<&str> = self.src.lines().collect();
        for (line_idx, raw_line) in lines.iter().enumerate() {
            let line_no = line_idx + 1;
            let indent = Self::measure_indent(raw_line, line_no)?;
            let body = &raw_line[indent..];
            if body.is_empty() || body.starts_with('#') {
                continue;
            }
            self.emit_layout(indent, line_no)?;
            self.lex_line(body, line_no, indent)?;
            self.push(TokenKind::Newline, line_no, raw_line.len() + 1);
        }
        let last_line = lines.len().max(1);
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.push(TokenKind::Dedent, last_line, 1);
        }
        self.push(TokenKind::Eof, last_line, 1);
        Ok(self.tokens)
    }

    fn measure_indent(line: &str, line_no: usize) -> Result<usize> {
        let mut indent = 0;
        for c in line.chars() {
            match c {
                ' ' => indent += 1,
                '\t' => {
                    return Err(Error::SchemaParse {
                        line: line_no,
                        column: indent + 1,
                        message: "tab characters are not allowed in indentation".to_string(),
                    });
                }
                _ => break,
            }
        }
        Ok(indent)
    }

    fn emit_layout(&mut self, indent: usize, line_no: usize) -> Result<()> {
        let current = *self.indent_stack.last().unwrap();
        if indent > current {
            self.indent_stack.push(indent);
            self.push(TokenKind::Indent, line_no, 1);
        } else if indent < current {
            while *self.indent_stack.last().unwrap() > indent {
                self.indent_stack.pop();
                self.push(TokenKind::Dedent, line_no, 1);
            }
            if *self.indent_stack.last().unwrap() != indent {
                return Err(Error::SchemaParse {
                    line: line_no,
                    column: indent + 1,
                    message: "dedent does not match any outer indentation level".to_string(),
                });
            }
        }
        Ok(())
    }

    fn lex_line(&mut self, body: &str, line_no: usize, indent: usize) -> Result<()> {
        let chars: Vec<char> = body.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let col = indent + i + 1;
            let c = chars[i];
            match c {
                ' ' => {
                    i += 1;
                }
                '#' => break,
                '(' => {
                    self.push(TokenKind::LParen, line_no, col);
                    i += 1;
                }
                ')' => {
                    self.push(TokenKind::RParen, line_no, col);
                    i += 1;
                }
                ',' => {
                    self.push(TokenKind::Comma, line_no, col);
                    i += 1;
                }
                '.' => {
                    self.push(TokenKind::Dot, line_no, col);
                    i += 1;
                }
                ':' => {
                    self.push(TokenKind::Colon, line_no, col);
                    i += 1;
                }
                '=' => {
                    self.push(TokenKind::Eq, line_no, col);
                    i += 1;
                }
                '-' => {
                    self.push(TokenKind::Dash, line_no, col);
                    i += 1;
                }
                '+' => {
                    self.push(TokenKind::Plus, line_no, col);
                    i += 1;
                }
                '"' => {
                    let (s, consumed) = Self::lex_string(&chars[i..], line_no, col)?;
                    self.push(TokenKind::Str(s), line_no, col);
                    i += consumed;
                }
                c if c.is_ascii_digit() => {
                    let (kind, consumed) = Self::lex_number(&chars[i..], line_no, col)?;
                    self.push(kind, line_no, col);
                    i += consumed;
                }
                c if c.is_alphabetic() || c == '_' => {
                    let start = i;
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    let word: String = chars[start..i].iter().collect();
                    self.push(Self::classify_word(word), line_no, col);
                }
                other => {
                    return Err(Error::SchemaParse {
                        line: line_no,
                        column: col,
                        message: format!("unexpected character `{other}`"),
                    });
                }
            }
        }
        Ok(())
    }

    fn classify_word(word: String) -> TokenKind {
        match word.as_str() {
            "ENTITY" => TokenKind::Entity,
            "NODE" => TokenKind::Node,
            // RELATION is a legacy alias.
            "RELATIONSHIP" | "RELATION" => TokenKind::Relationship,
            "MATCH" => TokenKind::Match,
            "true" | "True" => TokenKind::Bool(true),
            "false" | "False" => TokenKind::Bool(false),
            _ => TokenKind::Ident(word),
        }
    }

    fn lex_string(chars: &[char], line_no: usize, col: usize) -> Result<(String, usize)> {
        let mut out = String::new();
        let mut i = 1;
        while i < chars.len() {
            match chars[i] {
                '"' => return Ok((out, i + 1)),
                '\\' => {
                    i += 1;
                    let escaped = chars.get(i).ok_or_else(|| Error::SchemaParse {
                        line: line_no,
                        column: col + i,
                        message: "unterminated escape sequence".to_string(),
                    })?;
                    match escaped {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        other => {
                            return Err(Error::SchemaParse {
                                line: line_no,
                                column: col + i,
                                message: format!("unknown escape `\\{other}`"),
                            });
                        }
                    }
                    i += 1;
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Err(Error::SchemaParse {
            line: line_no,
            column: col,
            message: "unterminated string literal".to_string(),
        })
    }

    fn lex_number(chars: &[char], line_no: usize, col: usize) -> Result<(TokenKind, usize)> {
        let mut i = 0;
        let mut is_float = false;
        while i < chars.len() {
            match chars[i] {
                c if c.is_ascii_digit() => i += 1,
                // A dot is part of the number only when a digit follows;
                // otherwise it is the attribute-access dot.
                '.' if !is_float
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) =>
                {
                    is_float = true;
                    i += 1;
                }
                _ => break,
            }
        }
        let text: String = chars[..i].iter().collect();
        let kind = if is_float {
            TokenKind::Float(text.parse().map_err(|_| Error::SchemaParse {
                line: line_no,
                column: col,
                message: format!("invalid float literal `{text}`"),
            })?)
        } else {
            TokenKind::Int(text.parse().map_err(|_| Error::SchemaParse {
                line: line_no,
                column: col,
                message: format!("invalid integer literal `{text}`"),
            })?)
        };
        Ok((kind, i))
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_entity_header() {
        let toks = kinds("ENTITY(\"Flower\"):\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Entity,
                TokenKind::LParen,
                TokenKind::Str("Flower".into()),
                TokenKind::RParen,
                TokenKind::Colon,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn synthesizes_indent_and_dedent() {
        let toks = kinds("ENTITY(\"A\"):\n    NODE(\"A\"):\nENTITY(\"B\"):\n");
        assert!(toks.contains(&TokenKind::Indent));
        assert!(toks.contains(&TokenKind::Dedent));
        let indent_pos = toks.iter().position(|t| *t == TokenKind::Indent).unwrap();
        let dedent_pos = toks.iter().position(|t| *t == TokenKind::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn closes_open_indents_at_eof() {
        let toks = kinds("ENTITY(\"A\"):\n    NODE(\"A\"):\n        - x = A.x\n");
        let dedents = toks.iter().filter(|t| **t == TokenKind::Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let toks = kinds("# header comment\n\nENTITY(\"A\"):  # trailing\n");
        assert_eq!(toks[0], TokenKind::Entity);
        let newlines = toks.iter().filter(|t| **t == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn relation_is_alias_for_relationship() {
        assert_eq!(kinds("RELATION\n")[0], TokenKind::Relationship);
        assert_eq!(kinds("RELATIONSHIP\n")[0], TokenKind::Relationship);
    }

    #[test]
    fn lexes_numbers_and_attr_dots() {
        let toks = kinds("- x = 3.5\n- y = 42\n- z = Flower.petal\n");
        assert!(toks.contains(&TokenKind::Float(3.5)));
        assert!(toks.contains(&TokenKind::Int(42)));
        assert!(toks.contains(&TokenKind::Dot));
    }

    #[test]
    fn string_escapes() {
        let toks = kinds("- x = \"a\\\"b\\\\c\"\n");
        assert!(toks.contains(&TokenKind::Str("a\"b\\c".into())));
    }

    #[test]
    fn rejects_tabs_in_indentation() {
        let err = Lexer::new("ENTITY(\"A\"):\n\tNODE(\"A\"):\n")
            .tokenize()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaParse { line: 2, .. }));
    }

    #[test]
    fn rejects_inconsistent_dedent() {
        let err = Lexer::new("ENTITY(\"A\"):\n    NODE(\"A\"):\n  NODE(\"B\"):\n")
            .tokenize()
            .unwrap_err();
        assert!(matches!(err, Error::SchemaParse { line: 3, .. }));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = Lexer::new("ENTITY(\"A):\n").tokenize().unwrap_err();
        assert!(matches!(err, Error::SchemaParse { .. }));
    }
}
