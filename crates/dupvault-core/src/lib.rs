pub mod backup;
pub mod channel;
pub mod codec;
pub mod compress;
pub mod config;
pub mod control;
pub mod db;
pub mod limits;
pub mod stats;
pub mod volume;

pub use backup::{run, Backup, BackupFailure, BackupOutcome, SourceEntry};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
