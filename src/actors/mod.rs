//! The actors that make up the archiver.

pub mod board;
pub mod database;
pub mod fetcher;
pub mod state_keeper;

pub use self::board::BoardScraper;
pub use self::database::Database;
pub use self::fetcher::Fetcher;
pub use self::state_keeper::StateKeeper;
