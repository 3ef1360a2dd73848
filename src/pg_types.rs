/// This module contains data about postgres lock modes and their capabilities.
pub mod lock_modes;
/// Postgres constraint types (`pg_constraint.contype`).
pub mod contype;
/// Postgres object types like tables, indexes, sequences, etc.
pub mod relkinds;
/// `MigrationOperation`, its classification, and the data derived for it.
pub mod operation;
