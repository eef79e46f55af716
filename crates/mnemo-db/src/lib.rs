//! PostgreSQL substrate for the mnemo broker.
//!
//! Row models, connection pool helpers, migrations, and raw-SQL query
//! functions over the `tasks` table. All status mutations go through
//! guarded `UPDATE ... WHERE status = ...` statements so concurrent
//! callers can never double-apply a transition.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
