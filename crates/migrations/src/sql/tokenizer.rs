//! Statement Tokenizer - Splits a block of SQL into executable statements
//!
//! Only statement boundaries matter here: single and double quoted literals
//! are skipped over so that `;` and `--` inside them never split or truncate a
//! statement, and `--` line comments outside of quotes are dropped.

use crate::error::ParseError;

/// Splits SQL text into trimmed statements without their terminating `;`
///
/// The tokenizer is restartable: every call to [`StatementTokenizer::statements`]
/// walks the text again from the beginning.
#[derive(Debug, Clone, Copy)]
pub struct StatementTokenizer<'a> {
    sql: &'a str,
}

impl<'a> StatementTokenizer<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self { sql }
    }

    /// A fresh iterator over the statements in the text
    pub fn statements(&self) -> Statements<'a> {
        Statements {
            sql: self.sql,
            pos: 0,
            done: false,
        }
    }
}

impl<'a> IntoIterator for &StatementTokenizer<'a> {
    type Item = Result<String, ParseError>;
    type IntoIter = Statements<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.statements()
    }
}

/// Collect every statement, failing on the first parse error
pub fn split_statements(sql: &str) -> Result<Vec<String>, ParseError> {
    StatementTokenizer::new(sql).statements().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Quoted { quote: char, offset: usize },
}

/// Iterator over the statements of a [`StatementTokenizer`]
///
/// Walks the borrowed text in place; `pos` is a byte offset into it.
#[derive(Debug, Clone)]
pub struct Statements<'a> {
    sql: &'a str,
    pos: usize,
    done: bool,
}

impl<'a> Statements<'a> {
    fn peek(&self, ahead: usize) -> Option<char> {
        self.sql[self.pos..].chars().nth(ahead)
    }

    fn advance(&mut self, ch: char) {
        self.pos += ch.len_utf8();
    }

    /// Skip a `--` comment, leaving the position after its newline
    fn skip_comment(&mut self) -> bool {
        match self.sql[self.pos..].find('\n') {
            Some(newline) => {
                self.pos += newline + 1;
                true
            }
            None => {
                self.pos = self.sql.len();
                false
            }
        }
    }
}

impl<'a> Iterator for Statements<'a> {
    type Item = Result<String, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut statement = String::new();
        let mut state = State::Normal;

        while let Some(ch) = self.peek(0) {
            let offset = self.pos;
            match state {
                State::Normal => match ch {
                    '\'' | '"' => {
                        statement.push(ch);
                        self.advance(ch);
                        state = State::Quoted { quote: ch, offset };
                    }
                    '-' if self.peek(1) == Some('-') => {
                        // The comment is replaced by its terminating newline
                        if self.skip_comment() {
                            statement.push('\n');
                        }
                    }
                    ';' => {
                        self.advance(ch);
                        let trimmed = statement.trim();
                        if !trimmed.is_empty() {
                            return Some(Ok(trimmed.to_string()));
                        }
                        statement.clear();
                    }
                    _ => {
                        statement.push(ch);
                        self.advance(ch);
                    }
                },
                State::Quoted { quote, .. } => {
                    statement.push(ch);
                    self.advance(ch);

                    if ch == '\\' {
                        if self.peek(0) == Some(quote) {
                            statement.push(quote);
                            self.advance(quote);
                        }
                    } else if ch == quote {
                        if self.peek(0) == Some(quote) && self.peek(1) == Some(quote) {
                            statement.push(quote);
                            statement.push(quote);
                            self.advance(quote);
                            self.advance(quote);
                        } else if self.peek(0) == Some(quote) {
                            statement.push(quote);
                            self.advance(quote);
                        } else {
                            state = State::Normal;
                        }
                    }
                }
            }
        }

        self.done = true;

        if let State::Quoted { quote, offset } = state {
            return Some(Err(ParseError::UnterminatedQuote { quote, offset }));
        }

        let trimmed = statement.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Ok(trimmed.to_string()))
        }
    }
}

impl<'a> std::iter::FusedIterator for Statements<'a> {}
