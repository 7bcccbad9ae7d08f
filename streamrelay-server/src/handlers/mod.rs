pub mod follows;
pub mod webhook;
