//! SQLite database for the `PaperMinder` server.

pub use paperminder_core::db::DatabaseError;

paperminder_core::define_database!(Database, "Server database migrations complete");
