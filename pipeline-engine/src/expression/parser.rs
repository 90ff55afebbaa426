// Expression Parser
// Recursive descent parser producing an AST for condition predicates

use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),

    /// Context reference: variables.foo, parameters['key'], dependencies.A.result
    Reference(Reference),

    /// Function call: eq(a, b), succeeded()
    FunctionCall { name: String, args: Vec<Expr> },

    /// Index applied to a non-reference expression: split(x, ',')[0]
    Index { object: Box<Expr>, index: Box<Expr> },

    Unary { op: UnaryOp, expr: Box<Expr> },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Array literal, used with `in`/`each`
    Array(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub parts: Vec<ReferencePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferencePart {
    Property(String),
    Index(Box<Expr>),
}

impl Reference {
    pub fn new(name: String) -> Self {
        Self {
            parts: vec![ReferencePart::Property(name)],
        }
    }

    /// The leading identifier (`variables`, `parameters`, ...)
    pub fn root(&self) -> &str {
        match self.parts.first() {
            Some(ReferencePart::Property(name)) => name,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at token {position}: {message}")]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Eof) {
            return Err(self.error("empty expression"));
        }

        let expr = self.parse_or()?;
        if !self.check(&Token::Eof) {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }
        Ok(expr)
    }

    // Precedence (lowest to highest): || , && , == != , < <= > >= , ! , postfix

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_equality()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseExprError> {
        let mut expr = self.parse_primary()?;
        while self.check(&Token::LBracket) {
            self.advance();
            let index = self.parse_or()?;
            self.expect(&Token::RBracket, "expected ']'")?;
            expr = Expr::Index {
                object: Box::new(expr),
                index: Box::new(index),
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        match self.advance() {
            Token::Null => Ok(Expr::Null),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::String(s) => Ok(Expr::String(s)),
            Token::Identifier(name) => {
                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    return Ok(Expr::FunctionCall { name, args });
                }
                self.parse_reference(name).map(Expr::Reference)
            }
            Token::LParen => {
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                while !self.check(&Token::RBracket) {
                    items.push(self.parse_or()?);
                    if !self.check(&Token::Comma) {
                        break;
                    }
                    self.advance();
                }
                self.expect(&Token::RBracket, "expected ']'")?;
                Ok(Expr::Array(items))
            }
            other => {
                self.position = self.position.saturating_sub(1);
                Err(self.error(&format!("unexpected token: {}", other)))
            }
        }
    }

    fn parse_reference(&mut self, name: String) -> Result<Reference, ParseExprError> {
        let mut reference = Reference::new(name);
        loop {
            if self.check(&Token::Dot) {
                self.advance();
                let Token::Identifier(prop) = self.advance() else {
                    return Err(self.error("expected property name after '.'"));
                };
                reference.parts.push(ReferencePart::Property(prop));
            } else if self.check(&Token::LBracket) {
                self.advance();
                let index = self.parse_or()?;
                self.expect(&Token::RBracket, "expected ']'")?;
                reference.parts.push(ReferencePart::Index(Box::new(index)));
            } else {
                return Ok(reference);
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseExprError> {
        self.expect(&Token::LParen, "expected '('")?;
        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            args.push(self.parse_or()?);
            while self.check(&Token::Comma) {
                self.advance();
                args.push(self.parse_or()?);
            }
        }
        self.expect(&Token::RParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ParseExprError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Expr {
        ExprParser::parse_str(input).unwrap()
    }

    #[test]
    fn test_parse_reference() {
        let Expr::Reference(r) = parse("variables.BuildDocs") else {
            panic!("expected reference");
        };
        assert_eq!(r.root(), "variables");
        assert_eq!(
            r.parts[1],
            ReferencePart::Property("BuildDocs".to_string())
        );
    }

    #[test]
    fn test_parse_index_reference() {
        let Expr::Reference(r) = parse("dependencies.Build.outputs['setVars.tag']") else {
            panic!("expected reference");
        };
        assert_eq!(r.parts.len(), 4);
        assert_eq!(
            r.parts[3],
            ReferencePart::Index(Box::new(Expr::String("setVars.tag".to_string())))
        );
    }

    #[test]
    fn test_parse_nested_function_call() {
        let expr = parse("and(succeeded(), eq(parameters.BuildDocs, true))");
        let Expr::FunctionCall { name, args } = expr else {
            panic!("expected function call");
        };
        assert_eq!(name, "and");
        assert_eq!(args.len(), 2);
        assert_eq!(
            args[0],
            Expr::FunctionCall {
                name: "succeeded".to_string(),
                args: vec![]
            }
        );
    }

    #[test]
    fn test_parse_operator_precedence() {
        // a || b && c parses as a || (b && c)
        let Expr::Binary { op, right, .. } = parse("a || b && c") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn test_parse_not_and_array() {
        assert!(matches!(parse("!true"), Expr::Unary { op: UnaryOp::Not, .. }));
        assert_eq!(
            parse("['a', 'b']"),
            Expr::Array(vec![
                Expr::String("a".to_string()),
                Expr::String("b".to_string())
            ])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(ExprParser::parse_str("").is_err());
        assert!(ExprParser::parse_str("eq(a, ").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
        assert!(ExprParser::parse_str("variables.").is_err());
        assert!(ExprParser::parse_str("(a").is_err());
    }
}
