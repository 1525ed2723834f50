//! Built-in engines for [`sqlregress`].

mod postgres;

pub use postgres::{Postgres, PostgresConfig};
