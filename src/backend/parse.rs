//! Parser for generated kernel text
//!
//! Accepts the subset of OpenCL C the code generator emits:
//! - `__kernel void name(__global float* P0, ...){`
//! - `float X = 0;` / `float X;` declarations
//! - `for(int i = 0; i < N; i++)` loops with a statement or block body
//! - `dest = a;` and `dest = a <op> b;` where operands are locals,
//!   `P[i0*4 + i1]` elements, `*P` dereferences or numbers

use logos::Logos;

use crate::error::{BackendError, BackendResult};
use crate::ir::BinaryOp;

/// Tokens of the kernel language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum KernelToken {
    #[token("__kernel")]
    Kernel,

    #[token("__global")]
    Global,

    #[token("void")]
    Void,

    #[token("float")]
    Float,

    #[token("int")]
    Int,

    #[token("for")]
    For,

    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("++")]
    Increment,

    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("/")]
    Slash,

    #[token("=")]
    Equals,

    #[token("<")]
    Less,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    #[token(",")]
    Comma,

    #[token(";")]
    Semicolon,
}

/// Parsed kernel
#[derive(Debug, Clone, PartialEq)]
pub struct KernelProgram {
    pub name: String,
    pub params: Vec<String>,
    pub declarations: Vec<Declaration>,
    pub body: Vec<Statement>,
}

/// `float name;` or `float name = init;`
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub init: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Loop {
        index: String,
        start: usize,
        bound: usize,
        body: Vec<Statement>,
    },
    Assign {
        target: Place,
        value: Rhs,
    },
}

/// Something that can be read or written
#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    Variable(String),
    Element { buffer: String, offset: Vec<IndexTerm> },
    Deref(String),
}

/// `index*scale`, `index`, or a constant when `index` is `None`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTerm {
    pub index: Option<String>,
    pub scale: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Place(Place),
    Number(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rhs {
    Copy(Operand),
    Binary {
        op: BinaryOp,
        left: Operand,
        right: Operand,
    },
}

/// Parse kernel text into a [`KernelProgram`]
pub fn parse_kernel(source: &str) -> BackendResult<KernelProgram> {
    KernelParser::new(source)?.parse_kernel()
}

struct KernelParser<'source> {
    lexer: logos::Lexer<'source, KernelToken>,
    current: Option<KernelToken>,
}

impl<'source> KernelParser<'source> {
    fn new(source: &'source str) -> BackendResult<Self> {
        let mut parser = Self {
            lexer: KernelToken::lexer(source),
            current: None,
        };
        parser.advance()?;
        Ok(parser)
    }

    /// Move to the next token, returning the previous one
    fn advance(&mut self) -> BackendResult<Option<KernelToken>> {
        let next = match self.lexer.next() {
            Some(Ok(token)) => Some(token),
            Some(Err(())) => {
                return Err(BackendError::compile(format!(
                    "unexpected input '{}' at {:?}",
                    self.lexer.slice(),
                    self.lexer.span()
                )))
            }
            None => None,
        };
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn check(&self, expected: &KernelToken) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    fn expect(&mut self, expected: KernelToken) -> BackendResult<()> {
        if self.check(&expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(BackendError::compile(format!(
                "expected {:?}, got {:?}",
                expected, self.current
            )))
        }
    }

    fn ident(&mut self) -> BackendResult<String> {
        match self.advance()? {
            Some(KernelToken::Ident(name)) => Ok(name),
            other => Err(BackendError::compile(format!(
                "expected identifier, got {:?}",
                other
            ))),
        }
    }

    fn number(&mut self) -> BackendResult<f64> {
        match self.advance()? {
            Some(KernelToken::Number(n)) => Ok(n),
            other => Err(BackendError::compile(format!(
                "expected number, got {:?}",
                other
            ))),
        }
    }

    fn count(&mut self) -> BackendResult<usize> {
        let n = self.number()?;
        if n.fract() != 0.0 || n < 0.0 {
            return Err(BackendError::compile(format!("expected an integer, got {}", n)));
        }
        Ok(n as usize)
    }

    fn parse_kernel(&mut self) -> BackendResult<KernelProgram> {
        self.expect(KernelToken::Kernel)?;
        self.expect(KernelToken::Void)?;
        let name = self.ident()?;

        self.expect(KernelToken::LParen)?;
        let mut params = Vec::new();
        if !self.check(&KernelToken::RParen) {
            loop {
                self.expect(KernelToken::Global)?;
                self.expect(KernelToken::Float)?;
                self.expect(KernelToken::Star)?;
                params.push(self.ident()?);
                if self.check(&KernelToken::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.expect(KernelToken::RParen)?;
        self.expect(KernelToken::LBrace)?;

        let mut declarations = Vec::new();
        while self.check(&KernelToken::Float) {
            declarations.push(self.parse_declaration()?);
        }

        let body = self.parse_block_contents()?;

        if self.current.is_some() {
            return Err(BackendError::compile(format!(
                "trailing input after kernel body: {:?}",
                self.current
            )));
        }

        Ok(KernelProgram {
            name,
            params,
            declarations,
            body,
        })
    }

    fn parse_declaration(&mut self) -> BackendResult<Declaration> {
        self.expect(KernelToken::Float)?;
        let name = self.ident()?;
        let init = if self.check(&KernelToken::Equals) {
            self.advance()?;
            Some(self.number()? as f32)
        } else {
            None
        };
        self.expect(KernelToken::Semicolon)?;
        Ok(Declaration { name, init })
    }

    /// Statements up to and including the closing brace
    fn parse_block_contents(&mut self) -> BackendResult<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.check(&KernelToken::RBrace) {
            if self.current.is_none() {
                return Err(BackendError::compile("unexpected end of kernel, missing '}'"));
            }
            statements.extend(self.parse_statement()?);
        }
        self.expect(KernelToken::RBrace)?;
        Ok(statements)
    }

    /// A block flattens into its statements
    fn parse_statement(&mut self) -> BackendResult<Vec<Statement>> {
        if self.check(&KernelToken::For) {
            Ok(vec![self.parse_loop()?])
        } else if self.check(&KernelToken::LBrace) {
            self.advance()?;
            self.parse_block_contents()
        } else {
            Ok(vec![self.parse_assignment()?])
        }
    }

    fn parse_loop(&mut self) -> BackendResult<Statement> {
        self.expect(KernelToken::For)?;
        self.expect(KernelToken::LParen)?;
        self.expect(KernelToken::Int)?;
        let index = self.ident()?;
        self.expect(KernelToken::Equals)?;
        let start = self.count()?;
        self.expect(KernelToken::Semicolon)?;

        let condition = self.ident()?;
        self.expect(KernelToken::Less)?;
        let bound = self.count()?;
        self.expect(KernelToken::Semicolon)?;

        let step = self.ident()?;
        self.expect(KernelToken::Increment)?;
        self.expect(KernelToken::RParen)?;

        if condition != index || step != index {
            return Err(BackendError::compile(format!(
                "loop over {} tests {} and steps {}",
                index, condition, step
            )));
        }

        let body = self.parse_statement()?;
        Ok(Statement::Loop {
            index,
            start,
            bound,
            body,
        })
    }

    fn parse_assignment(&mut self) -> BackendResult<Statement> {
        let target = self.parse_place()?;
        self.expect(KernelToken::Equals)?;
        let left = self.parse_operand()?;

        let op = match &self.current {
            Some(KernelToken::Plus) => Some(BinaryOp::Add),
            Some(KernelToken::Minus) => Some(BinaryOp::Sub),
            Some(KernelToken::Star) => Some(BinaryOp::Mul),
            Some(KernelToken::Slash) => Some(BinaryOp::Div),
            _ => None,
        };

        let value = match op {
            Some(op) => {
                self.advance()?;
                let right = self.parse_operand()?;
                Rhs::Binary { op, left, right }
            }
            None => Rhs::Copy(left),
        };
        self.expect(KernelToken::Semicolon)?;
        Ok(Statement::Assign { target, value })
    }

    fn parse_operand(&mut self) -> BackendResult<Operand> {
        if let Some(KernelToken::Number(n)) = &self.current {
            let n = *n as f32;
            self.advance()?;
            return Ok(Operand::Number(n));
        }
        Ok(Operand::Place(self.parse_place()?))
    }

    fn parse_place(&mut self) -> BackendResult<Place> {
        if self.check(&KernelToken::Star) {
            self.advance()?;
            return Ok(Place::Deref(self.ident()?));
        }

        let name = self.ident()?;
        if !self.check(&KernelToken::LBracket) {
            return Ok(Place::Variable(name));
        }

        self.advance()?;
        let mut offset = vec![self.parse_index_term()?];
        while self.check(&KernelToken::Plus) {
            self.advance()?;
            offset.push(self.parse_index_term()?);
        }
        self.expect(KernelToken::RBracket)?;
        Ok(Place::Element {
            buffer: name,
            offset,
        })
    }

    fn parse_index_term(&mut self) -> BackendResult<IndexTerm> {
        if let Some(KernelToken::Number(_)) = &self.current {
            let scale = self.count()?;
            return Ok(IndexTerm { index: None, scale });
        }

        let index = self.ident()?;
        let scale = if self.check(&KernelToken::Star) {
            self.advance()?;
            self.count()?
        } else {
            1
        };
        Ok(IndexTerm {
            index: Some(index),
            scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELEMENTWISE: &str = "__kernel void executable(__global float* A0, __global float* A1, __global float* C2){\n\
        float L3;\n\
        for(int i0 = 0; i0 < 2; i0++)\n\
        for(int i1 = 0; i1 < 3; i1++)\n\
        {\n\
        L3 = A1[i0*3 + i1] * *C2;\n\
        A0[i0*3 + i1] = L3;\n\
        }\n\
        }";

    #[test]
    fn test_tokens() {
        let tokens: Vec<_> = KernelToken::lexer("for(int i0 = 0; i0 < 2; i0++)")
            .filter_map(Result::ok)
            .collect();
        assert_eq!(
            tokens,
            vec![
                KernelToken::For,
                KernelToken::LParen,
                KernelToken::Int,
                KernelToken::Ident("i0".to_string()),
                KernelToken::Equals,
                KernelToken::Number(0.0),
                KernelToken::Semicolon,
                KernelToken::Ident("i0".to_string()),
                KernelToken::Less,
                KernelToken::Number(2.0),
                KernelToken::Semicolon,
                KernelToken::Ident("i0".to_string()),
                KernelToken::Increment,
                KernelToken::RParen,
            ]
        );
    }

    #[test]
    fn test_parse_elementwise_kernel() {
        let program = parse_kernel(ELEMENTWISE).unwrap();
        assert_eq!(program.name, "executable");
        assert_eq!(program.params, vec!["A0", "A1", "C2"]);
        assert_eq!(
            program.declarations,
            vec![Declaration { name: "L3".to_string(), init: None }]
        );
        assert_eq!(program.body.len(), 1);

        if let Statement::Loop { index, bound, body, .. } = &program.body[0] {
            assert_eq!(index, "i0");
            assert_eq!(*bound, 2);
            if let Statement::Loop { index, bound, body, .. } = &body[0] {
                assert_eq!(index, "i1");
                assert_eq!(*bound, 3);
                assert_eq!(body.len(), 2);
                assert_eq!(
                    body[0],
                    Statement::Assign {
                        target: Place::Variable("L3".to_string()),
                        value: Rhs::Binary {
                            op: BinaryOp::Mul,
                            left: Operand::Place(Place::Element {
                                buffer: "A1".to_string(),
                                offset: vec![
                                    IndexTerm { index: Some("i0".to_string()), scale: 3 },
                                    IndexTerm { index: Some("i1".to_string()), scale: 1 },
                                ],
                            }),
                            right: Operand::Place(Place::Deref("C2".to_string())),
                        },
                    }
                );
            } else {
                panic!("Expected inner loop");
            }
        } else {
            panic!("Expected loop");
        }
    }

    #[test]
    fn test_parse_accumulator_declaration() {
        let source = "__kernel void k(__global float* C0, __global float* A1){\n\
            float G2 = 0;\n\
            for(int i0 = 0; i0 < 3; i0++)\n\
            {\n\
            G2 = G2 + A1[i0];\n\
            }\n\
            *C0 = G2;\n\
            }";
        let program = parse_kernel(source).unwrap();
        assert_eq!(program.declarations[0].init, Some(0.0));
        assert_eq!(
            program.body[1],
            Statement::Assign {
                target: Place::Deref("C0".to_string()),
                value: Rhs::Copy(Operand::Place(Place::Variable("G2".to_string()))),
            }
        );
    }

    #[test]
    fn test_reject_malformed_kernels() {
        // Missing closing brace
        assert!(matches!(
            parse_kernel("__kernel void k(__global float* A0){\nA0[0] = 1;"),
            Err(BackendError::Compile { .. })
        ));
        // Loop that steps a different variable
        assert!(parse_kernel(
            "__kernel void k(__global float* A0){ for(int i0 = 0; i0 < 2; i1++) { A0[i0] = 1; } }"
        )
        .is_err());
        // Stray character
        assert!(parse_kernel("__kernel void k(__global float* A0){ A0[0] = 1 % 2; }").is_err());
    }
}
