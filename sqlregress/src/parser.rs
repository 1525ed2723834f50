//! Parser for the `.fixture` text format.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use itertools::Itertools;

use crate::session::is_copy_from_stdin;
use crate::{Expectation, Fixture, FixtureName, RowOrder, Statement, Value};

/// The location in source file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Location {
    file: Arc<str>,
    line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl Location {
    /// File path.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// Line number.
    pub fn line(&self) -> u32 {
        self.line
    }

    fn new(file: impl Into<Arc<str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Returns the location of next line.
    #[must_use]
    fn next_line(mut self) -> Self {
        self.line += 1;
        self
    }

    #[must_use]
    fn at_line(&self, line: usize) -> Self {
        Self {
            file: self.file.clone(),
            line: line as u32,
        }
    }
}

/// The error type for parsing fixture files.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
#[error("parse error at {loc}: {kind}")]
pub struct ParseError {
    kind: ParseErrorKind,
    loc: Location,
}

impl ParseError {
    /// Returns the corresponding [`ParseErrorKind`] for this error.
    pub fn kind(&self) -> ParseErrorKind {
        self.kind.clone()
    }

    /// Returns the location from which the error originated.
    pub fn location(&self) -> Location {
        self.loc.clone()
    }
}

/// The error kind for parsing fixture files.
#[derive(thiserror::Error, Debug, Eq, PartialEq, Clone)]
pub enum ParseErrorKind {
    #[error("invalid line: {0:?}")]
    InvalidLine(String),
    #[error("unexpected EOF")]
    UnexpectedEOF,
    #[error("missing `fixture <name>` header")]
    MissingFixtureName,
    #[error("fixture name declared twice: {0:?}")]
    DuplicateFixtureName(String),
    #[error("`skip` must be followed by a record")]
    DanglingSkip,
    #[error("copy payload is not terminated by `\\.`")]
    UnterminatedCopy,
    #[error("failed to read file: {0}")]
    Io(String),
}

impl ParseErrorKind {
    fn at(self, loc: Location) -> ParseError {
        ParseError { kind: self, loc }
    }
}

/// Parse a fixture script. The script must declare its name with a `fixture` line.
pub fn parse(script: &str) -> Result<Fixture, ParseError> {
    parse_inner(&Location::new("<unknown>", 0), script, None)
}

/// Parse a fixture script with a given script name, used in locations.
pub fn parse_with_name(script: &str, name: impl Into<Arc<str>>) -> Result<Fixture, ParseError> {
    parse_inner(&Location::new(name, 0), script, None)
}

/// Parse a fixture file. Without a `fixture` header the file stem names the fixture.
pub fn parse_file(filename: impl AsRef<Path>) -> Result<Fixture, ParseError> {
    let path = filename.as_ref();
    let loc = Location::new(path.to_string_lossy(), 0);
    if !path.exists() {
        return Err(ParseErrorKind::Io("no such file".to_string()).at(loc));
    }
    let script =
        fs_err::read_to_string(path).map_err(|e| ParseErrorKind::Io(e.to_string()).at(loc.clone()))?;
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    parse_inner(&loc, &script, stem.as_deref())
}

fn parse_inner(
    loc: &Location,
    script: &str,
    default_name: Option<&str>,
) -> Result<Fixture, ParseError> {
    let mut lines = script.lines().enumerate();
    let mut name: Option<String> = None;
    let mut depends_on = vec![];
    let mut statements = vec![];
    let mut skip: Option<Location> = None;

    while let Some((num, line)) = lines.next() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }

        let loc = loc.at_line(num + 1);

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["fixture", fixture_name] => {
                if let Some(prev) = name.replace(fixture_name.to_string()) {
                    return Err(ParseErrorKind::DuplicateFixtureName(prev).at(loc));
                }
            }
            ["depends_on", deps @ ..] if !deps.is_empty() => {
                depends_on.extend(deps.iter().map(|d| d.to_string()));
            }
            ["skip"] => skip = Some(loc),
            ["statement", res @ ..] => {
                let mut statement = match res {
                    ["ok"] => Statement::new(String::new()),
                    ["error", ..] => {
                        let text = line
                            .trim_start()
                            .trim_start_matches("statement")
                            .trim_start()
                            .trim_start_matches("error")
                            .trim();
                        Statement::new(String::new()).expect_error(text)
                    }
                    _ => return Err(ParseErrorKind::InvalidLine(line.into()).at(loc)),
                };
                let (sql, _) = read_sql(&mut lines, &loc, false)?;
                statement.sql = sql;
                if skip.take().is_some() {
                    statement.skip = true;
                }
                statements.push(statement.at(loc));
            }
            ["query", res @ ..] => {
                let mut statement = Statement::new(String::new());
                for flag in res {
                    statement = match *flag {
                        "unordered" => statement.unordered(),
                        "raw" => statement.raw(),
                        _ => return Err(ParseErrorKind::InvalidLine(line.into()).at(loc)),
                    };
                }

                // The SQL runs up to a `----` line; the rows follow it.
                let (sql, has_result) = read_sql(&mut lines, &loc, true)?;
                let mut rows = vec![];
                if has_result {
                    for (_, line) in &mut lines {
                        if line.is_empty() {
                            break;
                        }
                        rows.push(line.split('\t').map(Value::from_fixture_text).collect());
                    }
                }
                statement.sql = sql;
                statement.expected = Expectation::Rows(rows);
                if skip.take().is_some() {
                    statement.skip = true;
                }
                statements.push(statement.at(loc));
            }
            _ => return Err(ParseErrorKind::InvalidLine(line.into()).at(loc)),
        }
    }

    if let Some(loc) = skip {
        return Err(ParseErrorKind::DanglingSkip.at(loc));
    }

    let name = match name.as_deref().or(default_name) {
        Some(name) => FixtureName::from(name),
        None => return Err(ParseErrorKind::MissingFixtureName.at(loc.clone())),
    };
    Ok(Fixture::new(name)
        .depends_on(depends_on)
        .with_statements(statements))
}

/// Reads the SQL of a record, starting at the line after the record header.
///
/// The SQL ends at a blank line, at EOF, or (when `query` is set) at a `----`
/// line, in which case the second returned value is true. A
/// `COPY ... FROM STDIN` command continues with raw payload lines, blank ones
/// included, up to and including the `\.` line.
fn read_sql<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    loc: &Location,
    query: bool,
) -> Result<(String, bool), ParseError> {
    let mut sql = match lines.next() {
        Some((_, line)) if !line.is_empty() => line.to_string(),
        _ => return Err(ParseErrorKind::UnexpectedEOF.at(loc.clone().next_line())),
    };

    if is_copy_command_end(&sql) {
        return read_copy_payload(lines, loc, sql).map(|sql| (sql, false));
    }
    while let Some((_, line)) = lines.next() {
        if line.is_empty() {
            break;
        }
        if query && line == "----" {
            return Ok((sql, true));
        }
        sql += "\n";
        sql += line;
        if is_copy_command_end(&sql) {
            return read_copy_payload(lines, loc, sql).map(|sql| (sql, false));
        }
    }
    Ok((sql, false))
}

fn is_copy_command_end(sql: &str) -> bool {
    sql.trim_end().ends_with(';') && is_copy_from_stdin(sql)
}

fn read_copy_payload<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    loc: &Location,
    mut sql: String,
) -> Result<String, ParseError> {
    for (_, line) in lines {
        sql += "\n";
        sql += line;
        if line == "\\." {
            return Ok(sql);
        }
    }
    Err(ParseErrorKind::UnterminatedCopy.at(loc.clone()))
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skip {
            writeln!(f, "skip")?;
        }
        match &self.expected {
            Expectation::None => writeln!(f, "statement ok")?,
            Expectation::Error(err) if err.is_empty() => writeln!(f, "statement error")?,
            Expectation::Error(err) => writeln!(f, "statement error {err}")?,
            Expectation::Rows(_) => {
                write!(f, "query")?;
                if self.order == RowOrder::Unordered {
                    write!(f, " unordered")?;
                }
                if !self.normalize {
                    write!(f, " raw")?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "{}", self.sql)?;
        if let Expectation::Rows(rows) = &self.expected {
            writeln!(f, "----")?;
            for row in rows {
                writeln!(f, "{}", row.iter().map(Value::to_fixture_text).join("\t"))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fixture {}", self.name())?;
        if !self.dependencies().is_empty() {
            writeln!(f, "depends_on {}", self.dependencies().iter().join(" "))?;
        }
        for statement in self.statements() {
            writeln!(f)?;
            write!(f, "{statement}")?;
        }
        Ok(())
    }
}
