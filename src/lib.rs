//! Listening-history sync and guild competition engine.
//!
//! Pulls per-user listening data from an external scrobble source into
//! Postgres ([`sync::SyncEngine`]), ranks guild members per artist or track
//! ([`leaderboard`]), runs the exclusive per-artist crown contest
//! ([`crowns::CrownLedger`]) and estimates listening time from play events
//! ([`playtime::PlaytimeEstimator`]).

pub mod config;
pub mod crowns;
pub mod db;
pub mod leaderboard;
pub mod models;
pub mod playtime;
pub mod source;
pub mod stats;
pub mod store;
pub mod sync;

pub use config::Config;
pub use crowns::{CrownLedger, CrownOutcome};
pub use playtime::PlaytimeEstimator;
pub use source::{LastfmClient, ListeningSource};
pub use store::{MusicStore, PgStore};
pub use sync::{SyncEngine, SyncOutcome};
