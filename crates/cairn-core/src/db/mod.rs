//! Database layer for Cairn

mod connection;
mod migrations;
mod repository;

pub use connection::Database;
pub use repository::{Entity, EntityRepository, Table};
