use crate::error::EvalError;
use crate::pac::lexer::{tokenize, Keyword, Punct, SpannedToken, Token};

/// AST for the PAC script subset. Only constructs real-world PAC files use:
/// function declarations, var/if/while/for/return, and plain expressions.
#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<FunctionDecl>,
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Var(Vec<(String, Option<Expr>)>),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        update: Option<Expr>,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Ident(String),
    Assign {
        target: String,
        value: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
    /// String property access or method call, e.g. `host.length` or
    /// `host.substring(0, 4)`. `args` is None for bare property access.
    Member {
        object: Box<Expr>,
        property: String,
        args: Option<Vec<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

pub fn parse(source: &str) -> Result<Program, EvalError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    fn parse_program(&mut self) -> Result<Program, EvalError> {
        let mut functions = Vec::new();
        let mut statements = Vec::new();
        while !self.at_end() {
            if self.check_keyword(Keyword::Function) {
                functions.push(self.parse_function()?);
            } else {
                statements.push(self.parse_statement()?);
            }
        }
        Ok(Program {
            functions,
            statements,
        })
    }

    fn parse_function(&mut self) -> Result<FunctionDecl, EvalError> {
        self.expect_keyword(Keyword::Function)?;
        let name = self.expect_ident()?;
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        if !self.check_punct(Punct::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.consume_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen)?;
        let body = self.parse_block()?;
        Ok(FunctionDecl { name, params, body })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, EvalError> {
        self.expect_punct(Punct::LBrace)?;
        let mut statements = Vec::new();
        while !self.check_punct(Punct::RBrace) {
            if self.at_end() {
                return Err(self.error("unexpected end of script in block"));
            }
            statements.push(self.parse_statement()?);
        }
        self.expect_punct(Punct::RBrace)?;
        Ok(statements)
    }

    /// A single statement, or a block treated as a statement list of one
    /// level (for `if (..) stmt` without braces).
    fn parse_statement_or_block(&mut self) -> Result<Vec<Stmt>, EvalError> {
        if self.check_punct(Punct::LBrace) {
            self.parse_block()
        } else {
            Ok(vec![self.parse_statement()?])
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, EvalError> {
        if self.consume_punct(Punct::Semi) {
            // Empty statement.
            return Ok(Stmt::Expr(Expr::Undefined));
        }
        if self.check_keyword(Keyword::Var) {
            let stmt = self.parse_var()?;
            self.consume_punct(Punct::Semi);
            return Ok(stmt);
        }
        if self.consume_keyword(Keyword::If) {
            self.expect_punct(Punct::LParen)?;
            let condition = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            let then_branch = self.parse_statement_or_block()?;
            let else_branch = if self.consume_keyword(Keyword::Else) {
                Some(self.parse_statement_or_block()?)
            } else {
                None
            };
            return Ok(Stmt::If {
                condition,
                then_branch,
                else_branch,
            });
        }
        if self.consume_keyword(Keyword::While) {
            self.expect_punct(Punct::LParen)?;
            let condition = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            let body = self.parse_statement_or_block()?;
            return Ok(Stmt::While { condition, body });
        }
        if self.consume_keyword(Keyword::For) {
            self.expect_punct(Punct::LParen)?;
            let init = if self.consume_punct(Punct::Semi) {
                None
            } else {
                let stmt = if self.check_keyword(Keyword::Var) {
                    self.parse_var()?
                } else {
                    Stmt::Expr(self.parse_expr()?)
                };
                self.expect_punct(Punct::Semi)?;
                Some(Box::new(stmt))
            };
            let condition = if self.check_punct(Punct::Semi) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(Punct::Semi)?;
            let update = if self.check_punct(Punct::RParen) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(Punct::RParen)?;
            let body = self.parse_statement_or_block()?;
            return Ok(Stmt::For {
                init,
                condition,
                update,
                body,
            });
        }
        if self.consume_keyword(Keyword::Return) {
            let value = if self.check_punct(Punct::Semi) || self.check_punct(Punct::RBrace) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.consume_punct(Punct::Semi);
            return Ok(Stmt::Return(value));
        }

        let expr = self.parse_expr()?;
        self.consume_punct(Punct::Semi);
        Ok(Stmt::Expr(expr))
    }

    fn parse_var(&mut self) -> Result<Stmt, EvalError> {
        self.expect_keyword(Keyword::Var)?;
        let mut declarations = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let init = if self.consume_punct(Punct::Assign) {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            declarations.push((name, init));
            if !self.consume_punct(Punct::Comma) {
                break;
            }
        }
        Ok(Stmt::Var(declarations))
    }

    fn parse_expr(&mut self) -> Result<Expr, EvalError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, EvalError> {
        // Only `ident = expr` is assignable in this subset.
        if let Some(Token::Ident(name)) = self.peek_token().cloned() {
            if self.peek_punct_at(1) == Some(Punct::Assign) {
                self.pos += 2;
                let value = self.parse_assignment()?;
                return Ok(Expr::Assign {
                    target: name,
                    value: Box::new(value),
                });
            }
        }
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, EvalError> {
        let condition = self.parse_or()?;
        if self.consume_punct(Punct::Question) {
            let then_value = self.parse_assignment()?;
            self.expect_punct(Punct::Colon)?;
            let else_value = self.parse_assignment()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
            });
        }
        Ok(condition)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.consume_punct(Punct::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_equality()?;
        while self.consume_punct(Punct::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = if self.consume_punct(Punct::EqEq) {
                BinaryOp::Eq
            } else if self.consume_punct(Punct::NotEq) {
                BinaryOp::NotEq
            } else if self.consume_punct(Punct::EqEqEq) {
                BinaryOp::StrictEq
            } else if self.consume_punct(Punct::NotEqEq) {
                BinaryOp::StrictNotEq
            } else {
                break;
            };
            let right = self.parse_relational()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.consume_punct(Punct::Lt) {
                BinaryOp::Lt
            } else if self.consume_punct(Punct::Le) {
                BinaryOp::Le
            } else if self.consume_punct(Punct::Gt) {
                BinaryOp::Gt
            } else if self.consume_punct(Punct::Ge) {
                BinaryOp::Ge
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.consume_punct(Punct::Plus) {
                BinaryOp::Add
            } else if self.consume_punct(Punct::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.consume_punct(Punct::Star) {
                BinaryOp::Mul
            } else if self.consume_punct(Punct::Slash) {
                BinaryOp::Div
            } else if self.consume_punct(Punct::Percent) {
                BinaryOp::Rem
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        let op = if self.consume_punct(Punct::Not) {
            Some(UnaryOp::Not)
        } else if self.consume_punct(Punct::Minus) {
            Some(UnaryOp::Neg)
        } else if self.consume_punct(Punct::Plus) {
            Some(UnaryOp::Plus)
        } else {
            None
        };
        if let Some(op) = op {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary()?;
        while self.consume_punct(Punct::Dot) {
            let property = self.expect_ident()?;
            let args = if self.consume_punct(Punct::LParen) {
                Some(self.parse_call_args()?)
            } else {
                None
            };
            expr = Expr::Member {
                object: Box::new(expr),
                property,
                args,
            };
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, EvalError> {
        let mut args = Vec::new();
        if !self.check_punct(Punct::RParen) {
            loop {
                args.push(self.parse_assignment()?);
                if !self.consume_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        if self.consume_punct(Punct::LParen) {
            let expr = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            return Ok(expr);
        }
        if self.consume_keyword(Keyword::True) {
            return Ok(Expr::Bool(true));
        }
        if self.consume_keyword(Keyword::False) {
            return Ok(Expr::Bool(false));
        }
        if self.consume_keyword(Keyword::Null) {
            return Ok(Expr::Null);
        }
        if self.consume_keyword(Keyword::Undefined) {
            return Ok(Expr::Undefined);
        }

        let token = self
            .peek_token()
            .ok_or_else(|| self.error("unexpected end of script"))?
            .clone();
        match token {
            Token::Num(n) => {
                self.pos += 1;
                Ok(Expr::Num(n))
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Str(s))
            }
            Token::Ident(name) => {
                self.pos += 1;
                if self.consume_punct(Punct::LParen) {
                    let args = self.parse_call_args()?;
                    Ok(Expr::Call {
                        function: name,
                        args,
                    })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(self.error(&format!("unexpected token {other:?}"))),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek_token(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_punct_at(&self, offset: usize) -> Option<Punct> {
        match self.tokens.get(self.pos + offset).map(|t| &t.token) {
            Some(Token::Punct(p)) => Some(*p),
            _ => None,
        }
    }

    fn current_line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn error(&self, message: &str) -> EvalError {
        EvalError::Syntax {
            line: self.current_line(),
            message: message.to_string(),
        }
    }

    fn check_punct(&self, punct: Punct) -> bool {
        matches!(self.peek_token(), Some(Token::Punct(p)) if *p == punct)
    }

    fn consume_punct(&mut self, punct: Punct) -> bool {
        if self.check_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: Punct) -> Result<(), EvalError> {
        if self.consume_punct(punct) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {punct:?}")))
        }
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        matches!(self.peek_token(), Some(Token::Keyword(k)) if *k == keyword)
    }

    fn consume_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<(), EvalError> {
        if self.consume_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(&format!("expected keyword {keyword:?}")))
        }
    }

    fn expect_ident(&mut self) -> Result<String, EvalError> {
        match self.peek_token() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            other => {
                let message = format!("expected identifier, found {other:?}");
                Err(self.error(&message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_find_proxy_function() {
        let program = parse(
            r#"
            function FindProxyForURL(url, host) {
                if (isPlainHostName(host) || dnsDomainIs(host, ".internal"))
                    return "DIRECT";
                return "PROXY proxy.example.com:8080; DIRECT";
            }
            "#,
        )
        .unwrap();
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].name, "FindProxyForURL");
        assert_eq!(program.functions[0].params, vec!["url", "host"]);
        assert!(program.statements.is_empty());
    }

    #[test]
    fn test_parse_statements() {
        let program = parse("var a = 1, b; a = a + 2; for (var i = 0; i < 3; i = i + 1) { b = i; }")
            .unwrap();
        assert_eq!(program.statements.len(), 3);
        assert!(matches!(program.statements[0], Stmt::Var(_)));
        assert!(matches!(program.statements[2], Stmt::For { .. }));
    }

    #[test]
    fn test_parse_member_access() {
        let program = parse("host.substring(0, 4).toLowerCase()").unwrap();
        match &program.statements[0] {
            Stmt::Expr(Expr::Member { property, args, .. }) => {
                assert_eq!(property, "toLowerCase");
                assert!(args.is_some());
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("function () {}").is_err());
        assert!(parse("if (a {").is_err());
        assert!(parse("return )").is_err());
    }
}
