mod database;
mod repositories;

pub use database::Database;
pub use repositories::{
    CommandJournal, CredentialRepository, SnapshotRepository, StoredSnapshot, StrategyRepository,
};
