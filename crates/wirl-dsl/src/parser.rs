//! Recursive-descent, LL(1)-precision parser for WIRL source.

use std::collections::BTreeMap;

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> Result<Self, ParseError> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Parser { tokens, pos: 0 })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        let t = self.peek();
        ParseError::new(t.line, t.col, message.into())
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if *self.peek_kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.err(format!("expected {kind}, found {}", self.peek_kind())))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Ident(s) => {
                self.advance();
                Ok(s)
            }
            other => Err(self.err(format!("expected identifier, found {other}"))),
        }
    }

    /// Consumes a specific keyword identifier (WIRL keywords are contextual,
    /// not reserved globally).
    fn expect_keyword(&mut self, word: &str) -> Result<(), ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Ident(s) if s == word => {
                self.advance();
                Ok(())
            }
            other => Err(self.err(format!("expected '{word}', found {other}"))),
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Ident(s) if s == word)
    }

    fn eat_semi(&mut self) {
        if *self.peek_kind() == TokenKind::Semi {
            self.advance();
        }
    }

    pub fn parse_workflow(&mut self) -> Result<WorkflowAst, ParseError> {
        self.expect_keyword("workflow")?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;

        let mut metadata = BTreeMap::new();
        if self.is_keyword("metadata") {
            metadata = self.parse_literal_block("metadata")?;
        }

        self.expect_keyword("inputs")?;
        let inputs = self.parse_input_decls()?;

        self.expect_keyword("outputs")?;
        let outputs = self.parse_output_bindings()?;

        let mut nodes = Vec::new();
        let mut cycles = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            if self.is_keyword("node") {
                nodes.push(self.parse_node()?);
            } else if self.is_keyword("cycle") {
                cycles.push(self.parse_cycle()?);
            } else {
                return Err(self.err(format!(
                    "expected 'node', 'cycle', or '}}', found {}",
                    self.peek_kind()
                )));
            }
        }
        self.expect(TokenKind::RBrace)?;

        Ok(WorkflowAst {
            name,
            metadata,
            inputs,
            outputs,
            nodes,
            cycles,
        })
    }

    fn parse_literal_block(&mut self, keyword: &str) -> Result<BTreeMap<String, Literal>, ParseError> {
        self.expect_keyword(keyword)?;
        self.expect(TokenKind::LBrace)?;
        let mut map = BTreeMap::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            let key = self.expect_ident()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_literal()?;
            map.insert(key, value);
            if *self.peek_kind() == TokenKind::Comma {
                self.advance();
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(map)
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Null => {
                self.advance();
                Ok(Literal::Null)
            }
            TokenKind::Bool(b) => {
                self.advance();
                Ok(Literal::Bool(b))
            }
            TokenKind::Int(n) => {
                self.advance();
                Ok(Literal::Int(n))
            }
            TokenKind::Float(n) => {
                self.advance();
                Ok(Literal::Float(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Literal::Str(s))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !matches!(self.peek_kind(), TokenKind::RBracket) {
                    items.push(self.parse_literal()?);
                    if *self.peek_kind() == TokenKind::Comma {
                        self.advance();
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Literal::List(items))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut map = BTreeMap::new();
                while !matches!(self.peek_kind(), TokenKind::RBrace) {
                    let key = match self.peek_kind().clone() {
                        TokenKind::Str(s) => {
                            self.advance();
                            s
                        }
                        TokenKind::Ident(s) => {
                            self.advance();
                            s
                        }
                        other => return Err(self.err(format!("expected object key, found {other}"))),
                    };
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_literal()?;
                    map.insert(key, value);
                    if *self.peek_kind() == TokenKind::Comma {
                        self.advance();
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Literal::Map(map))
            }
            other => Err(self.err(format!("expected a literal, found {other}"))),
        }
    }

    fn maybe_type(&mut self) -> Option<String> {
        // TYPE? NAME — a leading identifier is a type annotation only if
        // it is followed by another identifier (the actual name).
        if let TokenKind::Ident(ty) = self.peek_kind().clone() {
            if let Some(TokenKind::Ident(_)) = self.tokens.get(self.pos + 1).map(|t| &t.kind) {
                self.advance();
                return Some(ty);
            }
        }
        None
    }

    fn parse_input_decls(&mut self) -> Result<Vec<InputDecl>, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut decls = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            let ty = self.maybe_type();
            let name = self.expect_ident()?;
            self.eat_semi();
            decls.push(InputDecl { name, ty });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(decls)
    }

    fn parse_output_bindings(&mut self) -> Result<Vec<OutputBinding>, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut decls = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            let ty = self.maybe_type();
            let name = self.expect_ident()?;
            self.expect(TokenKind::Eq)?;
            let source = self.parse_value_expr()?;
            self.eat_semi();
            decls.push(OutputBinding { name, ty, source });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(decls)
    }

    fn parse_value_expr(&mut self) -> Result<ValueExpr, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Ident(first) => {
                self.advance();
                if *self.peek_kind() == TokenKind::Dot {
                    self.advance();
                    let field = self.expect_ident()?;
                    let reducer = self.maybe_reducer_tag()?;
                    Ok(ValueExpr::Dotted {
                        scope: first,
                        field,
                        reducer,
                    })
                } else {
                    Ok(ValueExpr::Ident(first))
                }
            }
            _ => Ok(ValueExpr::Literal(self.parse_literal()?)),
        }
    }

    fn maybe_reducer_tag(&mut self) -> Result<Option<ReducerKind>, ParseError> {
        if *self.peek_kind() != TokenKind::LParen {
            return Ok(None);
        }
        self.advance();
        let word = self.expect_ident()?;
        let kind = match word.as_str() {
            "replace" => ReducerKind::Replace,
            "append" => ReducerKind::Append,
            "merge" => ReducerKind::Merge,
            other => return Err(self.err(format!("unknown reducer '{other}'"))),
        };
        self.expect(TokenKind::RParen)?;
        Ok(Some(kind))
    }

    fn parse_node(&mut self) -> Result<NodeDecl, ParseError> {
        self.expect_keyword("node")?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;

        self.expect_keyword("call")?;
        let call_target = match self.peek_kind().clone() {
            TokenKind::Str(s) => {
                self.advance();
                s
            }
            other => return Err(self.err(format!("expected call target string, found {other}"))),
        };
        self.eat_semi();

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut consts = BTreeMap::new();
        let mut when = None;
        let mut hitl = None;

        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            if self.is_keyword("inputs") {
                inputs = self.parse_node_inputs()?;
            } else if self.is_keyword("outputs") {
                outputs = self.parse_node_outputs()?;
            } else if self.is_keyword("const") {
                consts = self.parse_literal_block("const")?;
            } else if self.is_keyword("when") {
                self.advance();
                when = Some(self.parse_bool_expr()?);
                self.eat_semi();
            } else if self.is_keyword("hitl") {
                self.advance();
                self.expect(TokenKind::LBrace)?;
                let mut correlation = BTreeMap::new();
                while !matches!(self.peek_kind(), TokenKind::RBrace) {
                    let key = self.expect_ident()?;
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_literal()?;
                    correlation.insert(key, value);
                    if *self.peek_kind() == TokenKind::Comma {
                        self.advance();
                    }
                }
                self.expect(TokenKind::RBrace)?;
                hitl = Some(HitlBlock { correlation });
            } else {
                return Err(self.err(format!(
                    "unexpected token in node body: {}",
                    self.peek_kind()
                )));
            }
        }
        self.expect(TokenKind::RBrace)?;

        Ok(NodeDecl {
            name,
            call_target,
            inputs,
            outputs,
            consts,
            when,
            hitl,
        })
    }

    fn parse_node_inputs(&mut self) -> Result<Vec<NodeInput>, ParseError> {
        self.expect_keyword("inputs")?;
        self.expect(TokenKind::LBrace)?;
        let mut decls = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            let ty = self.maybe_type();
            let name = self.expect_ident()?;
            self.expect(TokenKind::Eq)?;
            let expr = self.parse_value_expr()?;
            self.eat_semi();
            decls.push(NodeInput { name, ty, expr });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(decls)
    }

    fn parse_node_outputs(&mut self) -> Result<Vec<OutputDecl>, ParseError> {
        self.expect_keyword("outputs")?;
        self.expect(TokenKind::LBrace)?;
        let mut decls = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            let ty = self.maybe_type();
            let name = self.expect_ident()?;
            self.eat_semi();
            decls.push(OutputDecl { name, ty });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(decls)
    }

    fn parse_cycle(&mut self) -> Result<CycleDecl, ParseError> {
        self.expect_keyword("cycle")?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;

        self.expect_keyword("inputs")?;
        let inputs = self.parse_input_decls()?;
        self.expect_keyword("outputs")?;
        let outputs = self.parse_output_bindings()?;

        self.expect_keyword("nodes")?;
        self.expect(TokenKind::LBrace)?;
        let mut nodes = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace) {
            nodes.push(self.parse_node()?);
        }
        self.expect(TokenKind::RBrace)?;

        self.expect_keyword("guard")?;
        let guard = self.parse_bool_expr()?;
        self.eat_semi();

        self.expect_keyword("max_iterations")?;
        let max_iterations = match self.peek_kind().clone() {
            TokenKind::Int(n) if n > 0 => {
                self.advance();
                n as u32
            }
            other => return Err(self.err(format!("expected positive integer, found {other}"))),
        };
        self.eat_semi();

        self.expect(TokenKind::RBrace)?;

        Ok(CycleDecl {
            name,
            inputs,
            outputs,
            nodes,
            guard,
            max_iterations,
        })
    }

    // Boolean expression grammar:
    //   expr   := or
    //   or     := and ( '||' and )*
    //   and    := unary ( '&&' unary )*
    //   unary  := '!' unary | cmp
    //   cmp    := primary ( ('==' | '!=') primary )?
    //   primary:= 'true' | 'false' | value_expr | '(' expr ')'
    fn parse_bool_expr(&mut self) -> Result<BoolExpr, ParseError> {
        self.parse_bool_or()
    }

    fn parse_bool_or(&mut self) -> Result<BoolExpr, ParseError> {
        let mut lhs = self.parse_bool_and()?;
        while *self.peek_kind() == TokenKind::OrOr {
            self.advance();
            let rhs = self.parse_bool_and()?;
            lhs = BoolExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bool_and(&mut self) -> Result<BoolExpr, ParseError> {
        let mut lhs = self.parse_bool_unary()?;
        while *self.peek_kind() == TokenKind::AndAnd {
            self.advance();
            let rhs = self.parse_bool_unary()?;
            lhs = BoolExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bool_unary(&mut self) -> Result<BoolExpr, ParseError> {
        if *self.peek_kind() == TokenKind::Bang {
            self.advance();
            return Ok(BoolExpr::Not(Box::new(self.parse_bool_unary()?)));
        }
        self.parse_bool_cmp()
    }

    fn parse_bool_cmp(&mut self) -> Result<BoolExpr, ParseError> {
        let lhs = self.parse_bool_primary()?;
        match self.peek_kind().clone() {
            TokenKind::EqEq => {
                self.advance();
                let rhs_expr = self.parse_value_expr_or_bool_atom()?;
                Ok(BoolExpr::Eq(bool_expr_to_value(lhs)?, rhs_expr))
            }
            TokenKind::NotEq => {
                self.advance();
                let rhs_expr = self.parse_value_expr_or_bool_atom()?;
                Ok(BoolExpr::NotEq(bool_expr_to_value(lhs)?, rhs_expr))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_value_expr_or_bool_atom(&mut self) -> Result<ValueExpr, ParseError> {
        self.parse_value_expr()
    }

    fn parse_bool_primary(&mut self) -> Result<BoolExpr, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Bool(b) => {
                self.advance();
                Ok(BoolExpr::Lit(b))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_bool_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            _ => Ok(BoolExpr::Ref(self.parse_value_expr()?)),
        }
    }
}

fn bool_expr_to_value(expr: BoolExpr) -> Result<ValueExpr, ParseError> {
    match expr {
        BoolExpr::Ref(v) => Ok(v),
        BoolExpr::Lit(b) => Ok(ValueExpr::Literal(Literal::Bool(b))),
        _ => Err(ParseError::new(0, 0, "left side of comparison must be a value".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_branch_skipped_example() {
        let source = r#"
            workflow BranchSkipped {
                inputs { bool flag; }
                outputs { result = B.out; }
                node A {
                    call "flags.identity";
                    inputs { bool flag = flag; }
                    outputs { bool flag; }
                }
                node B {
                    call "flags.act";
                    inputs { bool flag = A.flag; }
                    outputs { out; }
                    when A.flag;
                }
            }
        "#;
        let ast = Parser::new(source).unwrap().parse_workflow().unwrap();
        assert_eq!(ast.nodes.len(), 2);
        assert!(ast.nodes[1].when.is_some());
    }

    #[test]
    fn parses_cycle_with_guard_and_reducer() {
        let source = r#"
            workflow CycleWithAppend {
                inputs { int seed; }
                outputs { items = C.items; }
                cycle C {
                    inputs { int seed; }
                    outputs { items = Accumulate.items (append); }
                    nodes {
                        node Pick {
                            call "pick.next";
                            inputs { int seed = C.seed; }
                            outputs { value; done; }
                        }
                        node Accumulate {
                            call "acc.push";
                            inputs { value = Pick.value; }
                            outputs { items; }
                        }
                    }
                    guard !Pick.done;
                    max_iterations 10;
                }
            }
        "#;
        let ast = Parser::new(source).unwrap().parse_workflow().unwrap();
        assert_eq!(ast.cycles.len(), 1);
        assert_eq!(ast.cycles[0].max_iterations, 10);
        assert!(matches!(ast.cycles[0].guard, BoolExpr::Not(_)));
    }

    #[test]
    fn reports_line_col_for_bad_token() {
        let source = "workflow X { inputs { int x; } outputs { y = x; } node A { } }";
        let err = Parser::new(source).unwrap().parse_workflow().unwrap_err();
        assert!(err.line >= 1);
        assert!(err.message.contains("call"));
    }
}
