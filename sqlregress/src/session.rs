//! Session state tracked while replaying fixtures.
//!
//! Fixtures embed a transaction state machine in their expectations: once a
//! statement fails inside a transaction block, every following statement is
//! expected to fail with the aborted-transaction error until the block ends.
//! [`SessionState`] tracks that machine explicitly, driven by the
//! [`SessionCommand`] each statement is classified as.

/// The error Postgres-compatible engines raise inside an aborted transaction.
pub const ABORTED_TRANSACTION_ERROR: &str =
    "current transaction is aborted, commands ignored until end of transaction block";

/// Returns whether an error message belongs to the aborted-transaction class.
pub fn is_aborted_transaction_error(message: &str) -> bool {
    message.contains("current transaction is aborted")
}

/// The session-level effect of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    SetRole(String),
    ResetRole,
    /// `SET LOCAL ROLE`: lasts until the end of the transaction. `None` is `NONE`.
    SetLocalRole(Option<String>),
    /// `PREPARE TRANSACTION`: detaches the transaction from the session.
    PrepareTransaction,
    /// Any statement without session-level effect.
    Other,
}

impl SessionCommand {
    /// Classifies the first statement of `sql`.
    pub fn classify(sql: &str) -> Self {
        let sql = strip_leading_comments(sql);
        let first = sql.split(';').next().unwrap_or_default();
        let raw: Vec<&str> = first.split_whitespace().collect();
        let upper: Vec<String> = raw.iter().map(|t| t.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        match upper.as_slice() {
            ["BEGIN"] | ["BEGIN", "WORK" | "TRANSACTION" | "ISOLATION" | "READ", ..] => {
                SessionCommand::Begin
            }
            ["START", "TRANSACTION", ..] => SessionCommand::Begin,
            ["COMMIT" | "END"] | ["COMMIT" | "END", "WORK" | "TRANSACTION"] => {
                SessionCommand::Commit
            }
            ["ROLLBACK" | "ABORT"] | ["ROLLBACK" | "ABORT", "WORK" | "TRANSACTION"] => {
                SessionCommand::Rollback
            }
            ["ROLLBACK", "TO", "SAVEPOINT", _]
            | ["ROLLBACK", "WORK" | "TRANSACTION", "TO", "SAVEPOINT", _]
            | ["ROLLBACK", "TO", _]
            | ["ROLLBACK", "WORK" | "TRANSACTION", "TO", _] => {
                SessionCommand::RollbackToSavepoint(identifier(raw[raw.len() - 1]))
            }
            ["SAVEPOINT", _] => SessionCommand::Savepoint(identifier(raw[1])),
            ["RELEASE", "SAVEPOINT", _] | ["RELEASE", _] => {
                SessionCommand::ReleaseSavepoint(identifier(raw[raw.len() - 1]))
            }
            ["SET", "LOCAL", "ROLE", "NONE"] => SessionCommand::SetLocalRole(None),
            ["SET", "LOCAL", "ROLE", _] => {
                SessionCommand::SetLocalRole(Some(identifier(raw[raw.len() - 1])))
            }
            ["PREPARE", "TRANSACTION", _] => SessionCommand::PrepareTransaction,
            ["SET", "ROLE", "NONE"]
            | ["SET", "SESSION", "ROLE", "NONE"]
            | ["RESET", "ROLE"]
            | ["RESET", "SESSION", "AUTHORIZATION"]
            | ["SET", "SESSION", "AUTHORIZATION", "DEFAULT"] => SessionCommand::ResetRole,
            ["SET", "ROLE", _]
            | ["SET", "SESSION", "ROLE", _]
            | ["SET", "SESSION", "AUTHORIZATION", _] => {
                SessionCommand::SetRole(identifier(raw[raw.len() - 1]))
            }
            _ => SessionCommand::Other,
        }
    }

    /// Statements that end an aborted transaction (or return to a savepoint)
    /// and are therefore not subject to the aborted-transaction error.
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            SessionCommand::Commit
                | SessionCommand::Rollback
                | SessionCommand::RollbackToSavepoint(_)
                | SessionCommand::PrepareTransaction
        )
    }
}

/// A statement that makes no sense in the current session state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionMisuse {
    #[error("COMMIT with no open transaction")]
    CommitWithoutTransaction,
    #[error("ROLLBACK with no open transaction")]
    RollbackWithoutTransaction,
    #[error("ROLLBACK TO SAVEPOINT {0} outside of a transaction")]
    RollbackToOutsideTransaction(String),
    #[error("PREPARE TRANSACTION with no open transaction")]
    PrepareWithoutTransaction,
}

/// Session-level state of one logical database session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    in_transaction: bool,
    transaction_aborted: bool,
    current_role: String,
    session_role: String,
    /// Role in effect when the open transaction began; restored on rollback.
    role_at_begin: Option<String>,
    /// Session-level role shadowed by `SET LOCAL ROLE`; restored on commit.
    role_before_local: Option<String>,
    savepoints: Vec<String>,
}

impl SessionState {
    /// A fresh session authenticated as `role`.
    pub fn new(role: impl Into<String>) -> Self {
        let role = role.into();
        SessionState {
            in_transaction: false,
            transaction_aborted: false,
            current_role: role.clone(),
            session_role: role,
            role_at_begin: None,
            role_before_local: None,
            savepoints: vec![],
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn transaction_aborted(&self) -> bool {
        self.transaction_aborted
    }

    pub fn current_role(&self) -> &str {
        &self.current_role
    }

    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    /// Checks that `command` is meaningful in the current state.
    pub fn check(&self, command: &SessionCommand) -> Result<(), SessionMisuse> {
        match command {
            SessionCommand::Commit if !self.in_transaction => {
                Err(SessionMisuse::CommitWithoutTransaction)
            }
            SessionCommand::Rollback if !self.in_transaction => {
                Err(SessionMisuse::RollbackWithoutTransaction)
            }
            SessionCommand::RollbackToSavepoint(name) if !self.in_transaction => Err(
                SessionMisuse::RollbackToOutsideTransaction(name.clone()),
            ),
            SessionCommand::PrepareTransaction if !self.in_transaction => {
                Err(SessionMisuse::PrepareWithoutTransaction)
            }
            _ => Ok(()),
        }
    }

    /// Applies the effect of an executed statement.
    pub fn apply(&mut self, command: &SessionCommand, succeeded: bool) {
        match command {
            SessionCommand::Begin if succeeded => {
                if !self.in_transaction {
                    self.in_transaction = true;
                    self.role_at_begin = Some(self.current_role.clone());
                }
            }
            // A failed or aborted COMMIT rolls the transaction back.
            SessionCommand::Commit | SessionCommand::PrepareTransaction => {
                let rolled_back = self.transaction_aborted || !succeeded;
                self.end_transaction(rolled_back);
            }
            SessionCommand::Rollback => self.end_transaction(true),
            SessionCommand::RollbackToSavepoint(name) if succeeded => {
                if let Some(pos) = self.savepoints.iter().rposition(|s| s == name) {
                    self.savepoints.truncate(pos + 1);
                }
                self.transaction_aborted = false;
            }
            SessionCommand::Savepoint(name) if succeeded => self.savepoints.push(name.clone()),
            SessionCommand::ReleaseSavepoint(name) if succeeded => {
                if let Some(pos) = self.savepoints.iter().rposition(|s| s == name) {
                    self.savepoints.truncate(pos);
                }
            }
            SessionCommand::SetRole(role) if succeeded => self.set_session_role(role.clone()),
            SessionCommand::ResetRole if succeeded => {
                self.set_session_role(self.session_role.clone());
            }
            // Outside a transaction block SET LOCAL has no effect.
            SessionCommand::SetLocalRole(role) if succeeded => {
                if self.in_transaction {
                    let role = role.clone().unwrap_or_else(|| self.session_role.clone());
                    let previous = std::mem::replace(&mut self.current_role, role);
                    self.role_before_local.get_or_insert(previous);
                }
            }
            SessionCommand::Other if succeeded => {}
            _ => self.statement_failed(),
        }
    }

    fn statement_failed(&mut self) {
        if self.in_transaction {
            self.transaction_aborted = true;
        }
    }

    fn set_session_role(&mut self, role: String) {
        if let Some(shadowed) = &mut self.role_before_local {
            shadowed.clone_from(&role);
        }
        self.current_role = role;
    }

    fn end_transaction(&mut self, rolled_back: bool) {
        let role_at_begin = self.role_at_begin.take();
        let role_before_local = self.role_before_local.take();
        if rolled_back {
            if let Some(role) = role_at_begin {
                self.current_role = role;
            }
        } else if let Some(role) = role_before_local {
            self.current_role = role;
        }
        self.in_transaction = false;
        self.transaction_aborted = false;
        self.savepoints.clear();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new("postgres")
    }
}

/// A bulk-load command split from the data lines that follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPayload<'a> {
    /// The `COPY ... FROM STDIN` command, up to and including its `;`.
    pub command: &'a str,
    /// Raw data lines, without the `\.` terminator.
    pub data: &'a str,
}

/// Splits a `COPY ... FROM STDIN` statement from its inline data.
///
/// Returns `None` for any other statement. The data runs up to a line that is
/// exactly `\.`, or to the end of the text if there is no terminator.
pub fn split_copy_payload(sql: &str) -> Option<CopyPayload<'_>> {
    let body = strip_leading_comments(sql);
    let offset = sql.len() - body.len();

    let mut command_end = None;
    let mut pos = 0;
    for line in body.split_inclusive('\n') {
        pos += line.len();
        if line.trim_end().ends_with(';') {
            command_end = Some(pos);
            break;
        }
    }
    // Without a `;` the command is the first line.
    let command_end =
        command_end.unwrap_or_else(|| body.find('\n').map_or(body.len(), |i| i + 1));
    let command = body[..command_end].trim_end();
    if !is_copy_from_stdin(command) {
        return None;
    }

    let rest = &sql[offset + command_end..];
    let mut data_end = rest.len();
    let mut pos = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == "\\." {
            data_end = pos;
            break;
        }
        pos += line.len();
    }

    Some(CopyPayload {
        command: &sql[offset..offset + command.len()],
        data: &rest[..data_end],
    })
}

/// Returns whether `command` is a `COPY ... FROM STDIN` statement.
pub(crate) fn is_copy_from_stdin(command: &str) -> bool {
    let tokens: Vec<String> = strip_leading_comments(command)
        .split_whitespace()
        .map(|t| t.trim_end_matches(';').to_ascii_uppercase())
        .collect();
    tokens.first().map(String::as_str) == Some("COPY")
        && tokens
            .windows(2)
            .any(|w| w[0] == "FROM" && w[1] == "STDIN")
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut sql = sql.trim_start();
    while let Some(rest) = sql.strip_prefix("--") {
        sql = match rest.split_once('\n') {
            Some((_, rest)) => rest.trim_start(),
            None => "",
        };
    }
    sql
}

/// Unquotes a SQL identifier or string literal; bare identifiers fold to lower case.
fn identifier(token: &str) -> String {
    let token = token.trim_end_matches(';');
    if let Some(inner) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        inner.replace("\"\"", "\"")
    } else if let Some(inner) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        inner.replace("''", "'")
    } else {
        token.to_lowercase()
    }
}
