use crate::prelude::*;

use crate::base::spec::*;
use crate::base::value::Value;

use super::lexer::{Lexer, Token, TokenKind};

/// Parse schema text into its AST form.
pub fn parse_schema(src: &str) -> Result<SchemaAst> {
    let tokens = Lexer::new(src).tokenize()?;
    Parser::new(tokens).parse()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse(mut self) -> Result<SchemaAst> {
        let mut entities = Vec::new();
        self.skip_layout();
        while !self.at(&TokenKind::Eof) {
            entities.push(self.parse_entity()?);
            self.skip_layout();
        }
        Ok(SchemaAst { entities })
    }

    fn parse_entity(&mut self) -> Result<EntityBlock> {
        self.expect(TokenKind::Entity)?;
        self.expect(TokenKind::LParen)?;
        let entity_type = match self.advance().kind.clone() {
            TokenKind::Str(s) => s,
            _ => return Err(self.error_at_prev("ENTITY type must be a string literal")),
        };
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;
        self.expect(TokenKind::Newline)?;
        self.expect(TokenKind::Indent)?;

        let mut sub_blocks = Vec::new();
        while !self.at(&TokenKind::Dedent) && !self.at(&TokenKind::Eof) {
            sub_blocks.push(self.parse_sub_block()?);
        }
        if self.at(&TokenKind::Dedent) {
            self.advance();
        }
        if sub_blocks.is_empty() {
            return Err(self.error_here("ENTITY block must contain at least one NODE or RELATIONSHIP"));
        }
        Ok(EntityBlock {
            entity_type,
            sub_blocks,
        })
    }

    /// `wrapper* (node_block | relationship_block)`, with wrapper calls
    /// closing after the wrapped block: `W(NODE(...) n: ... , "arg")`.
    fn parse_sub_block(&mut self) -> Result<SubBlock> {
        let mut wrappers = Vec::new();
        while let TokenKind::Ident(name) = &self.peek().kind {
            let name = name.clone();
            if self.peek_nth(1).kind != TokenKind::LParen {
                return Err(self.error_here("expected NODE, RELATIONSHIP, or a wrapper call"));
            }
            self.advance();
            self.advance();
            self.skip_layout();
            wrappers.push(WrapperUse {
                name,
                static_args: Vec::new(),
            });
        }

        let kind = match self.peek().kind {
            TokenKind::Node => SubBlockKind::Node(self.parse_node_block()?),
            TokenKind::Relationship => {
                SubBlockKind::Relationship(self.parse_relationship_block()?)
            }
            _ => return Err(self.error_here("expected NODE or RELATIONSHIP")),
        };

        // Close wrapper calls innermost-first, collecting static arguments.
        for wrapper in wrappers.iter_mut().rev() {
            self.skip_layout();
            while self.at(&TokenKind::Comma) {
                self.advance();
                self.skip_layout();
                wrapper.static_args.push(self.parse_literal()?);
                self.skip_layout();
            }
            self.expect(TokenKind::RParen)?;
        }
        if self.at(&TokenKind::Newline) {
            self.advance();
        }
        Ok(SubBlock { wrappers, kind })
    }

    fn parse_node_block(&mut self) -> Result<NodeBlock> {
        self.expect(TokenKind::Node)?;
        self.expect(TokenKind::LParen)?;
        let labels = self.parse_label_list()?;
        self.expect(TokenKind::RParen)?;
        let identifier = match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            _ => None,
        };
        self.expect(TokenKind::Colon)?;
        let attributes = self.parse_attr_block()?;
        Ok(NodeBlock {
            labels,
            identifier,
            attributes,
        })
    }

    fn parse_relationship_block(&mut self) -> Result<RelationshipBlock> {
        self.expect(TokenKind::Relationship)?;
        self.expect(TokenKind::LParen)?;
        let start = self.parse_endpoint()?;
        self.expect(TokenKind::Comma)?;
        let rel_type = match self.advance().kind.clone() {
            TokenKind::Str(s) => s,
            _ => return Err(self.error_at_prev("relationship type must be a string literal")),
        };
        self.expect(TokenKind::Comma)?;
        let end = self.parse_endpoint()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;
        let attributes = self.parse_attr_block()?;
        Ok(RelationshipBlock {
            start,
            rel_type,
            end,
            attributes,
        })
    }

    /// After the `:` of a NODE/RELATIONSHIP header: either an indented block
    /// of attribute lines or nothing.
    fn parse_attr_block(&mut self) -> Result<Vec<AttrLine>> {
        if !(self.at(&TokenKind::Newline) && self.peek_nth(1).kind == TokenKind::Indent) {
            if self.at(&TokenKind::Newline) {
                self.advance();
            }
            return Ok(Vec::new());
        }
        self.advance();
        self.advance();
        let mut attributes = Vec::new();
        while !self.at(&TokenKind::Dedent) && !self.at(&TokenKind::Eof) {
            attributes.push(self.parse_attr_line()?);
        }
        if self.at(&TokenKind::Dedent) {
            self.advance();
        }
        Ok(attributes)
    }

    fn parse_attr_line(&mut self) -> Result<AttrLine> {
        let primary = match self.advance().kind {
            TokenKind::Dash => false,
            TokenKind::Plus => true,
            _ => return Err(self.error_at_prev("attribute lines start with `-` or `+`")),
        };
        let name = self.expect_ident("attribute name")?;
        self.expect(TokenKind::Eq)?;
        let value = self.parse_value_expr()?;
        if self.at(&TokenKind::Newline) {
            self.advance();
        }
        Ok(AttrLine {
            name,
            value,
            primary,
        })
    }

    fn parse_endpoint(&mut self) -> Result<EndpointExpr> {
        if self.at(&TokenKind::Match) {
            self.advance();
            self.expect(TokenKind::LParen)?;
            let mut labels = Vec::new();
            let mut conditions = Vec::new();
            loop {
                // `NAME = value` is a condition; anything else is a label.
                if matches!(self.peek().kind, TokenKind::Ident(_))
                    && self.peek_nth(1).kind == TokenKind::Eq
                {
                    let name = self.expect_ident("condition name")?;
                    self.advance();
                    conditions.push((name, self.parse_value_expr()?));
                } else {
                    if !conditions.is_empty() {
                        return Err(self.error_here("labels must come before conditions in MATCH"));
                    }
                    labels.push(self.parse_label_expr()?);
                }
                if self.at(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            Ok(EndpointExpr::Match(MatchExpr { labels, conditions }))
        } else {
            Ok(EndpointExpr::Ident(self.expect_ident("endpoint identifier")?))
        }
    }

    fn parse_label_list(&mut self) -> Result<Vec<LabelExpr>> {
        let mut labels = vec![self.parse_label_expr()?];
        while self.at(&TokenKind::Comma) {
            self.advance();
            labels.push(self.parse_label_expr()?);
        }
        Ok(labels)
    }

    fn parse_label_expr(&mut self) -> Result<LabelExpr> {
        match self.peek().kind.clone() {
            TokenKind::Str(s) => {
                self.advance();
                Ok(LabelExpr::Literal(s))
            }
            TokenKind::Ident(entity) => {
                self.advance();
                self.expect(TokenKind::Dot)?;
                let attr = self.expect_ident("attribute name")?;
                Ok(LabelExpr::EntityAttr { entity, attr })
            }
            _ => Err(self.error_here("expected a label (string literal or Entity.attribute)")),
        }
    }

    fn parse_value_expr(&mut self) -> Result<ValueExpr> {
        match self.peek().kind.clone() {
            TokenKind::Str(_)
            | TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Bool(_)
            | TokenKind::Dash => Ok(ValueExpr::Literal(self.parse_literal()?)),
            TokenKind::Ident(name) => {
                self.advance();
                match self.peek().kind {
                    TokenKind::Dot => {
                        self.advance();
                        let attr = self.expect_ident("attribute name")?;
                        Ok(ValueExpr::EntityAttr { entity: name, attr })
                    }
                    TokenKind::LParen => {
                        self.advance();
                        let inner = Box::new(self.parse_value_expr()?);
                        let mut static_args = Vec::new();
                        while self.at(&TokenKind::Comma) {
                            self.advance();
                            static_args.push(self.parse_literal()?);
                        }
                        self.expect(TokenKind::RParen)?;
                        Ok(ValueExpr::Call {
                            name,
                            inner,
                            static_args,
                        })
                    }
                    _ => Err(self.error_here("expected `.attr` or `(` after identifier")),
                }
            }
            _ => Err(self.error_here("expected a value expression")),
        }
    }

    fn parse_literal(&mut self) -> Result<Value> {
        let negate = if self.at(&TokenKind::Dash) {
            self.advance();
            true
        } else {
            false
        };
        let token = self.advance().kind.clone();
        let value = match token {
            TokenKind::Str(s) if !negate => Value::Str(s),
            TokenKind::Int(v) => Value::Int(if negate { -v } else { v }),
            TokenKind::Float(v) => Value::Float(if negate { -v } else { v }),
            TokenKind::Bool(v) if !negate => Value::Bool(v),
            _ => return Err(self.error_at_prev("expected a literal value")),
        };
        Ok(value)
    }

    // Token plumbing

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_nth(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> &Token {
        let idx = self.pos.min(self.tokens.len() - 1);
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        &self.tokens[idx]
    }

    fn expect(&mut self, kind: TokenKind) -> Result<()> {
        if self.at(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(format!("expected {kind:?}, found {:?}", self.peek().kind)))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!("expected {what}, found {other:?}"))),
        }
    }

    /// Skip layout tokens where the grammar is layout-flexible (inside
    /// wrapper parentheses).
    fn skip_layout(&mut self) {
        while matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent
        ) {
            self.advance();
        }
    }

    fn error_here(&self, message: impl Into<String>) -> Error {
        let token = self.peek();
        Error::SchemaParse {
            line: token.line,
            column: token.column,
            message: message.into(),
        }
    }

    fn error_at_prev(&self, message: impl Into<String>) -> Error {
        let token = &self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)];
        Error::SchemaParse {
            line: token.line,
            column: token.column,
            message: message.into(),
        }
    }
}
