//! SQL Parser
//!
//! Recursive-descent parser turning a token stream into an AST. WHERE
//! clauses are conjunctions of `col op {col | value}`.

use super::ast::*;
use super::lexer::Lexer;
use super::token::Token;
use crate::catalog::types::{ColType, Value};
use crate::error::{Error, Result};

/// SQL Parser
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self> {
        let tokens = Lexer::new(input).tokenize()?;
        Ok(Self {
            tokens,
            position: 0,
        })
    }

    /// Parse a single statement, consuming a trailing semicolon if present.
    pub fn parse(&mut self) -> Result<Statement> {
        let stmt = match self.peek() {
            Token::Create => self.parse_create()?,
            Token::Drop => self.parse_drop()?,
            Token::Show => self.parse_show()?,
            Token::Desc => {
                self.advance();
                Statement::DescTable {
                    table: self.expect_identifier()?,
                }
            }
            Token::Insert => self.parse_insert()?,
            Token::Delete => self.parse_delete()?,
            Token::Update => self.parse_update()?,
            Token::Select => self.parse_select()?,
            Token::Begin => {
                self.advance();
                Statement::Begin
            }
            Token::Commit => {
                self.advance();
                Statement::Commit
            }
            Token::Abort => {
                self.advance();
                Statement::Abort
            }
            Token::Rollback => {
                self.advance();
                Statement::Rollback
            }
            Token::Help => {
                self.advance();
                Statement::Help
            }
            Token::Exit => {
                self.advance();
                Statement::Exit
            }
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "a statement".to_string(),
                    found: other.to_string(),
                })
            }
        };
        if *self.peek() == Token::Semicolon {
            self.advance();
        }
        self.expect(Token::Eof)?;
        Ok(stmt)
    }

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect(Token::Create)?;
        match self.peek() {
            Token::Table => {
                self.advance();
                let table = self.expect_identifier()?;
                self.expect(Token::LParen)?;
                let mut cols = Vec::new();
                loop {
                    let name = self.expect_identifier()?;
                    let (col_type, len) = self.parse_col_type()?;
                    cols.push(ColumnDef {
                        name,
                        col_type,
                        len,
                    });
                    if !self.consume_if(Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Statement::CreateTable { table, cols })
            }
            Token::Index => {
                self.advance();
                let table = self.expect_identifier()?;
                let cols = self.parse_column_name_list()?;
                Ok(Statement::CreateIndex { table, cols })
            }
            other => Err(Error::UnexpectedToken {
                expected: "TABLE or INDEX".to_string(),
                found: other.to_string(),
            }),
        }
    }

    fn parse_drop(&mut self) -> Result<Statement> {
        self.expect(Token::Drop)?;
        match self.peek() {
            Token::Table => {
                self.advance();
                Ok(Statement::DropTable {
                    table: self.expect_identifier()?,
                })
            }
            Token::Index => {
                self.advance();
                let table = self.expect_identifier()?;
                let cols = self.parse_column_name_list()?;
                Ok(Statement::DropIndex { table, cols })
            }
            other => Err(Error::UnexpectedToken {
                expected: "TABLE or INDEX".to_string(),
                found: other.to_string(),
            }),
        }
    }

    fn parse_show(&mut self) -> Result<Statement> {
        self.expect(Token::Show)?;
        match self.peek() {
            Token::Tables => {
                self.advance();
                Ok(Statement::ShowTables)
            }
            Token::Index => {
                self.advance();
                self.expect(Token::From)?;
                Ok(Statement::ShowIndex {
                    table: self.expect_identifier()?,
                })
            }
            other => Err(Error::UnexpectedToken {
                expected: "TABLES or INDEX".to_string(),
                found: other.to_string(),
            }),
        }
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect(Token::Insert)?;
        self.expect(Token::Into)?;
        let table = self.expect_identifier()?;
        self.expect(Token::Values)?;
        let mut rows = Vec::new();
        loop {
            self.expect(Token::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_value()?);
                if !self.consume_if(Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen)?;
            rows.push(row);
            if !self.consume_if(Token::Comma) {
                break;
            }
        }
        Ok(Statement::Insert { table, rows })
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect(Token::Delete)?;
        self.expect(Token::From)?;
        let table = self.expect_identifier()?;
        let conds = self.parse_where_clause()?;
        Ok(Statement::Delete { table, conds })
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.expect(Token::Update)?;
        let table = self.expect_identifier()?;
        self.expect(Token::Set)?;
        let mut set_clauses = Vec::new();
        loop {
            set_clauses.push(self.parse_set_clause()?);
            if !self.consume_if(Token::Comma) {
                break;
            }
        }
        let conds = self.parse_where_clause()?;
        Ok(Statement::Update {
            table,
            set_clauses,
            conds,
        })
    }

    fn parse_set_clause(&mut self) -> Result<SetClauseExpr> {
        let col_name = self.expect_identifier()?;
        self.expect(Token::Eq)?;
        // `col = col + value` / `col = col - value` arithmetic
        if let Token::Identifier(rhs_name) = self.peek().clone() {
            self.advance();
            if rhs_name != col_name {
                return Err(Error::UnexpectedToken {
                    expected: format!("'{}' on the right of its own assignment", col_name),
                    found: rhs_name,
                });
            }
            let add = match self.peek() {
                Token::Plus => true,
                Token::Minus => false,
                other => {
                    return Err(Error::UnexpectedToken {
                        expected: "+ or -".to_string(),
                        found: other.to_string(),
                    })
                }
            };
            self.advance();
            let rhs = self.parse_value()?;
            return Ok(SetClauseExpr {
                col_name,
                rhs,
                is_expr: true,
                add,
            });
        }
        let rhs = self.parse_value()?;
        Ok(SetClauseExpr {
            col_name,
            rhs,
            is_expr: false,
            add: false,
        })
    }

    fn parse_select(&mut self) -> Result<Statement> {
        self.expect(Token::Select)?;
        let selector = self.parse_selector()?;
        self.expect(Token::From)?;

        let mut tables = vec![self.expect_identifier()?];
        let mut conds = Vec::new();
        if self.consume_if(Token::Comma) {
            tables.push(self.expect_identifier()?);
        } else if self.consume_if(Token::Join) {
            tables.push(self.expect_identifier()?);
            if self.consume_if(Token::On) {
                conds.push(self.parse_condition()?);
            }
        }

        conds.extend(self.parse_where_clause()?);

        let mut order_by = Vec::new();
        if self.consume_if(Token::Order) {
            self.expect(Token::By)?;
            loop {
                let col = self.parse_col_ref()?;
                let ascending = match self.peek() {
                    Token::Asc => {
                        self.advance();
                        true
                    }
                    Token::Desc => {
                        self.advance();
                        false
                    }
                    _ => true,
                };
                order_by.push(OrderByExpr { col, ascending });
                if !self.consume_if(Token::Comma) {
                    break;
                }
            }
        }

        let mut limit = None;
        if self.consume_if(Token::Limit) {
            match self.advance().clone() {
                Token::IntegerLiteral(n) if n >= 0 => limit = Some(n as usize),
                other => {
                    return Err(Error::UnexpectedToken {
                        expected: "a row count".to_string(),
                        found: other.to_string(),
                    })
                }
            }
        }

        Ok(Statement::Select(SelectStatement {
            selector,
            tables,
            conds,
            order_by,
            limit,
        }))
    }

    fn parse_selector(&mut self) -> Result<Selector> {
        if self.consume_if(Token::Asterisk) {
            return Ok(Selector::Wildcard);
        }
        // Aggregate: COUNT(*|col), SUM(col), MIN(col), MAX(col)
        let func = match self.peek() {
            Token::Count => Some(AggFunc::Count),
            Token::Sum => Some(AggFunc::Sum),
            Token::Min => Some(AggFunc::Min),
            Token::Max => Some(AggFunc::Max),
            _ => None,
        };
        if let Some(func) = func {
            self.advance();
            self.expect(Token::LParen)?;
            let col = if self.consume_if(Token::Asterisk) {
                None
            } else {
                Some(self.parse_col_ref()?)
            };
            self.expect(Token::RParen)?;
            let alias = if self.consume_if(Token::As) {
                Some(self.expect_identifier()?)
            } else {
                None
            };
            return Ok(Selector::Agg { func, col, alias });
        }

        let mut cols = vec![self.parse_col_ref()?];
        while self.consume_if(Token::Comma) {
            cols.push(self.parse_col_ref()?);
        }
        Ok(Selector::Cols(cols))
    }

    fn parse_where_clause(&mut self) -> Result<Vec<CondExpr>> {
        let mut conds = Vec::new();
        if self.consume_if(Token::Where) {
            loop {
                conds.push(self.parse_condition()?);
                if !self.consume_if(Token::And) {
                    break;
                }
            }
        }
        Ok(conds)
    }

    fn parse_condition(&mut self) -> Result<CondExpr> {
        let lhs = self.parse_col_ref()?;
        let op = self.parse_comp_op()?;
        let rhs = if matches!(self.peek(), Token::Identifier(_)) {
            CondRhs::Col(self.parse_col_ref()?)
        } else {
            CondRhs::Value(self.parse_value()?)
        };
        Ok(CondExpr { lhs, op, rhs })
    }

    fn parse_comp_op(&mut self) -> Result<CompOp> {
        let op = match self.peek() {
            Token::Eq => CompOp::Eq,
            Token::Neq => CompOp::Ne,
            Token::Lt => CompOp::Lt,
            Token::Gt => CompOp::Gt,
            Token::Lte => CompOp::Le,
            Token::Gte => CompOp::Ge,
            other => {
                return Err(Error::UnexpectedToken {
                    expected: "a comparison operator".to_string(),
                    found: other.to_string(),
                })
            }
        };
        self.advance();
        Ok(op)
    }

    fn parse_col_ref(&mut self) -> Result<ColRef> {
        let first = self.expect_identifier()?;
        if self.consume_if(Token::Dot) {
            let col_name = self.expect_identifier()?;
            Ok(ColRef {
                tab_name: Some(first),
                col_name,
            })
        } else {
            Ok(ColRef {
                tab_name: None,
                col_name: first,
            })
        }
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.advance().clone() {
            // An INT literal widens to BIGINT only when it does not fit.
            Token::IntegerLiteral(n) => match i32::try_from(n) {
                Ok(n) => Ok(Value::Int(n)),
                Err(_) => Ok(Value::BigInt(n)),
            },
            Token::FloatLiteral(n) => Ok(Value::Float(n as f32)),
            Token::StringLiteral(s) => Ok(Value::Str(s)),
            other => Err(Error::UnexpectedToken {
                expected: "a literal value".to_string(),
                found: other.to_string(),
            }),
        }
    }

    fn parse_col_type(&mut self) -> Result<(ColType, usize)> {
        match self.advance().clone() {
            Token::Int => Ok((ColType::Int, 4)),
            Token::BigInt => Ok((ColType::BigInt, 8)),
            Token::Float => Ok((ColType::Float, 4)),
            Token::Datetime => Ok((ColType::Datetime, 19)),
            Token::Char => {
                self.expect(Token::LParen)?;
                let len = match self.advance().clone() {
                    Token::IntegerLiteral(n) if n > 0 => n as usize,
                    other => {
                        return Err(Error::UnexpectedToken {
                            expected: "a positive length".to_string(),
                            found: other.to_string(),
                        })
                    }
                };
                self.expect(Token::RParen)?;
                Ok((ColType::Char, len))
            }
            other => Err(Error::UnexpectedToken {
                expected: "a column type".to_string(),
                found: other.to_string(),
            }),
        }
    }

    fn parse_column_name_list(&mut self) -> Result<Vec<String>> {
        self.expect(Token::LParen)?;
        let mut cols = vec![self.expect_identifier()?];
        while self.consume_if(Token::Comma) {
            cols.push(self.expect_identifier()?);
        }
        self.expect(Token::RParen)?;
        Ok(cols)
    }

    // ========== token helpers ==========

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self.tokens.get(self.position).unwrap_or(&Token::Eof);
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn consume_if(&mut self, token: Token) -> bool {
        if *self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        let found = self.peek().clone();
        if found == token {
            self.advance();
            Ok(())
        } else {
            Err(Error::UnexpectedToken {
                expected: token.to_string(),
                found: found.to_string(),
            })
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.advance().clone() {
            Token::Identifier(name) => Ok(name),
            other => Err(Error::UnexpectedToken {
                expected: "an identifier".to_string(),
                found: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> Statement {
        Parser::new(sql).unwrap().parse().unwrap()
    }

    #[test]
    fn test_parse_create_table() {
        let stmt = parse("CREATE TABLE t (id INT, v CHAR(4), w DATETIME);");
        assert_eq!(
            stmt,
            Statement::CreateTable {
                table: "t".to_string(),
                cols: vec![
                    ColumnDef {
                        name: "id".to_string(),
                        col_type: ColType::Int,
                        len: 4
                    },
                    ColumnDef {
                        name: "v".to_string(),
                        col_type: ColType::Char,
                        len: 4
                    },
                    ColumnDef {
                        name: "w".to_string(),
                        col_type: ColType::Datetime,
                        len: 19
                    },
                ]
            }
        );
    }

    #[test]
    fn test_parse_create_index() {
        let stmt = parse("CREATE INDEX t(id, v);");
        assert_eq!(
            stmt,
            Statement::CreateIndex {
                table: "t".to_string(),
                cols: vec!["id".to_string(), "v".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_multi_row_insert() {
        let stmt = parse("INSERT INTO t VALUES (1,'aa'), (2,'bb');");
        assert_eq!(
            stmt,
            Statement::Insert {
                table: "t".to_string(),
                rows: vec![
                    vec![Value::Int(1), Value::Str("aa".to_string())],
                    vec![Value::Int(2), Value::Str("bb".to_string())],
                ]
            }
        );
    }

    #[test]
    fn test_big_literal_widens() {
        let stmt = parse("INSERT INTO t VALUES (5000000000);");
        assert_eq!(
            stmt,
            Statement::Insert {
                table: "t".to_string(),
                rows: vec![vec![Value::BigInt(5_000_000_000)]]
            }
        );
    }

    #[test]
    fn test_parse_select_with_everything() {
        let stmt = parse("SELECT id, v FROM t WHERE id > 3 AND v = 'x' ORDER BY id DESC LIMIT 5;");
        match stmt {
            Statement::Select(select) => {
                assert_eq!(
                    select.selector,
                    Selector::Cols(vec![
                        ColRef {
                            tab_name: None,
                            col_name: "id".to_string()
                        },
                        ColRef {
                            tab_name: None,
                            col_name: "v".to_string()
                        },
                    ])
                );
                assert_eq!(select.tables, vec!["t".to_string()]);
                assert_eq!(select.conds.len(), 2);
                assert_eq!(select.conds[0].op, CompOp::Gt);
                assert_eq!(select.order_by.len(), 1);
                assert!(!select.order_by[0].ascending);
                assert_eq!(select.limit, Some(5));
            }
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_join() {
        let stmt = parse("SELECT * FROM a JOIN b WHERE a.x = b.y;");
        match stmt {
            Statement::Select(select) => {
                assert_eq!(select.tables, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(select.conds.len(), 1);
                assert_eq!(
                    select.conds[0].rhs,
                    CondRhs::Col(ColRef {
                        tab_name: Some("b".to_string()),
                        col_name: "y".to_string()
                    })
                );
            }
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_aggregate() {
        let stmt = parse("SELECT SUM(amount) AS total FROM t;");
        match stmt {
            Statement::Select(select) => {
                assert_eq!(
                    select.selector,
                    Selector::Agg {
                        func: AggFunc::Sum,
                        col: Some(ColRef {
                            tab_name: None,
                            col_name: "amount".to_string()
                        }),
                        alias: Some("total".to_string()),
                    }
                );
            }
            other => panic!("expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_arithmetic() {
        let stmt = parse("UPDATE t SET n = n + 2, v = 'z' WHERE id = 1;");
        match stmt {
            Statement::Update { set_clauses, .. } => {
                assert_eq!(set_clauses.len(), 2);
                assert!(set_clauses[0].is_expr);
                assert!(set_clauses[0].add);
                assert_eq!(set_clauses[0].rhs, Value::Int(2));
                assert!(!set_clauses[1].is_expr);
            }
            other => panic!("expected UPDATE, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_txn_control() {
        assert_eq!(parse("begin;"), Statement::Begin);
        assert_eq!(parse("commit;"), Statement::Commit);
        assert_eq!(parse("abort;"), Statement::Abort);
        assert_eq!(parse("rollback;"), Statement::Rollback);
        assert_eq!(parse("help;"), Statement::Help);
        assert_eq!(parse("exit"), Statement::Exit);
    }

    #[test]
    fn test_parse_error_reports_token() {
        let err = Parser::new("SELECT FROM t;").unwrap().parse().unwrap_err();
        assert!(matches!(err, Error::UnexpectedToken { .. }));
    }
}
