//! Parser for array programs
//!
//! Parses statements like:
//! - `C = A + B`
//! - `D = (A - 1) * s / B`
//! - `total = A.sum()` or `total = sum(A * 2)`
//! - `E = [[1, 2], [3, 4]] + C`

use crate::ast::{ArrayLiteral, Expr, Program, Statement};
use crate::error::{CompileError, CompileResult};
use crate::ir::BinaryOp;
use crate::lexer::{Lexer, Token};

/// Parse a whole program
pub fn parse(source: &str) -> CompileResult<Program> {
    Parser::new(source)?.parse_program()
}

/// Parser for array programs
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Token>,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> CompileResult<Self> {
        let mut parser = Self {
            lexer: Lexer::new(source),
            current: None,
        };
        parser.advance()?;
        Ok(parser)
    }

    /// Advance to the next token, returning the previous one
    fn advance(&mut self) -> CompileResult<Option<Token>> {
        let next = match self.lexer.next() {
            Some(Ok(token)) => Some(token),
            Some(Err(())) => {
                return Err(CompileError::LexerError {
                    position: self.lexer.span().start,
                    message: format!("unexpected character '{}'", self.lexer.slice()),
                })
            }
            None => None,
        };
        Ok(std::mem::replace(&mut self.current, next))
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<()> {
        if self.check(&expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(CompileError::parse_error(format!(
                "Expected '{}', got {}",
                expected,
                describe(&self.current)
            )))
        }
    }

    /// Parse a complete program (`;`-separated statements)
    pub fn parse_program(&mut self) -> CompileResult<Program> {
        let mut statements = Vec::new();

        while self.current.is_some() {
            statements.push(self.parse_statement()?);

            if self.check(&Token::Semicolon) {
                while self.check(&Token::Semicolon) {
                    self.advance()?;
                }
            } else if self.current.is_some() {
                return Err(CompileError::parse_error(format!(
                    "Expected ';' between statements, got {}",
                    describe(&self.current)
                )));
            }
        }

        if statements.is_empty() {
            return Err(CompileError::parse_error("Program has no statements"));
        }
        Ok(Program { statements })
    }

    /// Parse `NAME = expr`
    fn parse_statement(&mut self) -> CompileResult<Statement> {
        let target = match self.advance()? {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(CompileError::parse_error(format!(
                    "Expected assignment target, got {}",
                    describe(&other)
                )))
            }
        };
        self.expect(Token::Equals)?;
        let value = self.parse_expr()?;
        Ok(Statement { target, value })
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_additive()
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = if self.check(&Token::Plus) {
                BinaryOp::Add
            } else if self.check(&Token::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse multiplicative expressions: a * b, a / b
    fn parse_multiplicative(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = if self.check(&Token::Star) {
                BinaryOp::Mul
            } else if self.check(&Token::Slash) {
                BinaryOp::Div
            } else {
                break;
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse unary expressions: -2, -a
    fn parse_unary(&mut self) -> CompileResult<Expr> {
        if self.check(&Token::Minus) {
            self.advance()?;
            let operand = self.parse_unary()?;
            Ok(match operand {
                Expr::Number(n) => Expr::Number(-n),
                other => Expr::binary(BinaryOp::Mul, Expr::Number(-1.0), other),
            })
        } else {
            self.parse_postfix()
        }
    }

    /// Parse postfix method calls: a.sum()
    fn parse_postfix(&mut self) -> CompileResult<Expr> {
        let mut expr = self.parse_primary()?;

        while self.check(&Token::Dot) {
            self.advance()?;
            let name = match self.advance()? {
                Some(Token::Ident(name)) => name,
                _ => return Err(CompileError::parse_error("Expected method name after '.'")),
            };
            self.expect(Token::LParen)?;
            self.expect(Token::RParen)?;
            expr = match name.as_str() {
                "sum" => Expr::Sum(Box::new(expr)),
                _ => {
                    return Err(CompileError::parse_error(format!(
                        "Unknown method: {}",
                        name
                    )))
                }
            };
        }

        Ok(expr)
    }

    /// Parse primary expressions: literals, variables, parenthesized, calls
    fn parse_primary(&mut self) -> CompileResult<Expr> {
        match self.advance()? {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),

            Some(Token::Ident(name)) => {
                if !self.check(&Token::LParen) {
                    return Ok(Expr::Variable(name));
                }

                self.advance()?;
                let arg = self.parse_expr()?;
                self.expect(Token::RParen)?;
                match name.as_str() {
                    "sum" => Ok(Expr::Sum(Box::new(arg))),
                    _ => Err(CompileError::parse_error(format!(
                        "Unknown function: {}",
                        name
                    ))),
                }
            }

            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }

            Some(Token::LBracket) => self.parse_array_literal(),

            None => Err(CompileError::parse_error("Unexpected end of input")),

            Some(other) => Err(CompileError::parse_error(format!(
                "Unexpected token: '{}'",
                other
            ))),
        }
    }

    /// Parse an array literal after its opening bracket
    fn parse_array_literal(&mut self) -> CompileResult<Expr> {
        if !self.check(&Token::LBracket) {
            let values = self.parse_number_list()?;
            return Ok(Expr::Array(ArrayLiteral::vector(values)));
        }

        let mut rows = Vec::new();
        loop {
            self.expect(Token::LBracket)?;
            rows.push(self.parse_number_list()?);
            if self.check(&Token::Comma) {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect(Token::RBracket)?;

        ArrayLiteral::from_rows(rows)
            .map(Expr::Array)
            .ok_or_else(|| CompileError::parse_error("Rows of an array literal differ in length"))
    }

    /// Parse `1, -2, 3]` including the closing bracket
    fn parse_number_list(&mut self) -> CompileResult<Vec<f64>> {
        let mut values = Vec::new();

        while !self.check(&Token::RBracket) {
            let negative = if self.check(&Token::Minus) {
                self.advance()?;
                true
            } else {
                false
            };
            match self.advance()? {
                Some(Token::Number(n)) => values.push(if negative { -n } else { n }),
                other => {
                    return Err(CompileError::parse_error(format!(
                        "Expected number in array literal, got {}",
                        describe(&other)
                    )))
                }
            }

            if self.check(&Token::Comma) {
                self.advance()?;
            } else if !self.check(&Token::RBracket) {
                return Err(CompileError::parse_error(format!(
                    "Expected ',' or ']' in array literal, got {}",
                    describe(&self.current)
                )));
            }
        }
        self.expect(Token::RBracket)?;

        Ok(values)
    }
}

fn describe(token: &Option<Token>) -> String {
    match token {
        Some(token) => format!("'{}'", token),
        None => "end of input".to_string(),
    }
}
