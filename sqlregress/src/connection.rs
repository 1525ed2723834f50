use std::future::IntoFuture;

use futures::Future;

use crate::{AsyncEngine, HarnessError, SessionState};

/// Trait for making connections to an [`AsyncEngine`].
///
/// Each connection is a separate session. The orchestrator makes one per run,
/// one per fixture, or one per parallel root, depending on the session scope.
pub trait MakeConnection {
    /// The engine type.
    type Conn: AsyncEngine;
    /// The future returned by [`MakeConnection::make`].
    type MakeFuture: Future<Output = Result<Self::Conn, <Self::Conn as AsyncEngine>::Error>>;

    /// Creates a new connection to the engine.
    fn make(&mut self) -> Self::MakeFuture;
}

/// Make connections directly from a closure returning a future.
impl<D: AsyncEngine, F, Fut> MakeConnection for F
where
    F: FnMut() -> Fut,
    Fut: IntoFuture<Output = Result<D, D::Error>>,
{
    type Conn = D;
    type MakeFuture = Fut::IntoFuture;

    fn make(&mut self) -> Self::MakeFuture {
        self().into_future()
    }
}

/// Make connections with a synchronous infallible function.
#[derive(Debug, Clone)]
pub struct MakeWith<F>(pub F);

impl<F: FnMut() -> D, D: AsyncEngine> MakeConnection for MakeWith<F> {
    type Conn = D;
    type MakeFuture = futures::future::Ready<Result<D, D::Error>>;

    fn make(&mut self) -> Self::MakeFuture {
        futures::future::ready(Ok((self.0)()))
    }
}

/// The session currently in use by a run, made lazily.
pub(crate) struct Connections<'a, M: MakeConnection> {
    make_conn: &'a mut M,
    role: &'a str,
    current: Option<(M::Conn, SessionState)>,
}

impl<'a, M: MakeConnection> Connections<'a, M> {
    pub fn new(make_conn: &'a mut M, role: &'a str) -> Self {
        Connections {
            make_conn,
            role,
            current: None,
        }
    }

    /// Get the current session. Make a new connection if there is none.
    pub async fn get(&mut self) -> Result<(&mut M::Conn, &mut SessionState), HarnessError> {
        let (conn, session) = match &mut self.current {
            Some(current) => current,
            current @ None => {
                let conn = self.make_conn.make().await.map_err(|e| {
                    tracing::error!(error = %e, "failed to connect");
                    HarnessError::Connect {
                        message: e.to_string(),
                    }
                })?;
                current.insert((conn, SessionState::new(self.role)))
            }
        };
        Ok((conn, session))
    }

    /// Drops the current session, so that the next [`Connections::get`] starts a fresh one.
    pub fn reset(&mut self) {
        self.current = None;
    }
}
