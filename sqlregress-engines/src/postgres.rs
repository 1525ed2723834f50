use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{pin_mut, SinkExt};
use sqlregress::{EngineOutput, ErrorInfo, Row, Value};
use tokio::task::JoinHandle;
use tokio_postgres::SimpleQueryMessage;

type Result<T> = std::result::Result<T, tokio_postgres::Error>;

/// Connection configuration. This is a re-export of [`tokio_postgres::Config`].
pub type PostgresConfig = tokio_postgres::Config;

/// Postgres engine based on the client from [`tokio_postgres`].
///
/// Statements go through the simple query protocol, so values come back as
/// the server's own text rendering: `t`/`f` booleans, `NULL` as a null value.
pub struct Postgres {
    /// `None` means the connection is closed.
    conn: Option<(tokio_postgres::Client, JoinHandle<()>)>,
}

impl Postgres {
    /// Connects to the Postgres server with the given `config`.
    ///
    /// Must be called within a tokio runtime, which drives the connection.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let (client, connection) = config.connect(tokio_postgres::NoTls).await?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("Postgres connection error: {:?}", e);
            }
        });

        Ok(Self {
            conn: Some((client, connection)),
        })
    }

    /// Returns a reference of the inner Postgres client.
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.conn.as_ref().expect("connection is shutdown").0
    }

    /// Shutdown the Postgres connection.
    pub async fn shutdown(mut self) {
        if let Some((client, connection)) = self.conn.take() {
            drop(client);
            connection.await.ok();
        }
    }
}

impl Drop for Postgres {
    fn drop(&mut self) {
        if let Some((_, connection)) = &self.conn {
            connection.abort();
        }
    }
}

#[async_trait]
impl sqlregress::AsyncEngine for Postgres {
    type Error = tokio_postgres::Error;

    async fn run(&mut self, sql: &str) -> Result<EngineOutput> {
        // NOTE:
        // We use `simple_query` API which returns the query results as strings.
        // This means that we can not reformat values based on their type,
        // and we have to follow the format given by the server. Expected rows
        // are compared against this text.
        let messages = self.client().simple_query(sql).await?;

        let mut rows: Vec<Row> = vec![];
        let mut has_rows = false;
        let mut count = 0;
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(_) => has_rows = true,
                SimpleQueryMessage::Row(row) => {
                    has_rows = true;
                    rows.push(
                        (0..row.len())
                            .map(|i| match row.get(i) {
                                Some(v) => Value::Text(v.to_string()),
                                None => Value::Null,
                            })
                            .collect(),
                    );
                }
                SimpleQueryMessage::CommandComplete(n) => count = n,
                _ => {}
            }
        }

        if has_rows {
            Ok(EngineOutput::Rows { rows })
        } else {
            Ok(EngineOutput::StatementComplete(count))
        }
    }

    async fn copy_in(&mut self, command: &str, data: &str) -> Result<EngineOutput> {
        let sink = self.client().copy_in::<_, Bytes>(command).await?;
        pin_mut!(sink);
        sink.send(Bytes::copy_from_slice(data.as_bytes())).await?;
        let count = sink.finish().await?;
        Ok(EngineOutput::StatementComplete(count))
    }

    fn engine_name(&self) -> &str {
        "postgres"
    }

    fn describe_error(&self, err: &Self::Error) -> ErrorInfo {
        match err.as_db_error() {
            Some(db) => ErrorInfo::new(db.message()).with_context(
                [
                    db.detail().map(|d| format!("DETAIL: {d}")),
                    db.hint().map(|h| format!("HINT: {h}")),
                    db.where_().map(|w| format!("CONTEXT: {w}")),
                ]
                .into_iter()
                .flatten(),
            ),
            None => ErrorInfo::from_error(err),
        }
    }

    fn is_connection_fault(&self, err: &Self::Error) -> bool {
        err.is_closed()
            || (err.as_db_error().is_none()
                && self
                    .conn
                    .as_ref()
                    .map_or(true, |(client, _)| client.is_closed()))
    }

    async fn sleep(dur: Duration) {
        tokio::time::sleep(dur).await
    }
}
