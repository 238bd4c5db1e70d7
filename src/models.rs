use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Membership tier, affects how many pages a sync may fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
pub enum UserType {
    User = 0,
    Supporter = 1,
    Contributor = 2,
    Admin = 3,
    Owner = 4,
}

impl UserType {
    /// Privileged tiers get the deep index limit (~200 pages per category).
    pub fn has_higher_index_limit(self) -> bool {
        !matches!(self, UserType::User)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct UserAccount {
    pub user_id: i64,
    pub username: String,
    pub session_key: Option<String>,
    pub user_type: UserType,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_indexed: Option<DateTime<Utc>>,
    pub last_scrobble: Option<DateTime<Utc>>,
    pub total_playcount: Option<i64>,
}

/// Per-user artist aggregate, fully replaced on each sync.
#[derive(Debug, Clone, FromRow)]
pub struct ArtistAggregate {
    pub user_id: i64,
    pub name: String,
    pub playcount: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct AlbumAggregate {
    pub user_id: i64,
    pub name: String,
    pub artist_name: String,
    pub playcount: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct TrackAggregate {
    pub user_id: i64,
    pub name: String,
    pub artist_name: String,
    pub playcount: i64,
}

/// One timestamped play, kept only inside the rolling retention window.
#[derive(Debug, Clone, FromRow)]
pub struct PlayEvent {
    pub user_id: i64,
    pub track_name: String,
    pub album_name: Option<String>,
    pub artist_name: String,
    pub played_at: DateTime<Utc>,
}

/// Per-guild crown settings.
#[derive(Debug, Clone, Default, FromRow)]
pub struct GuildConfig {
    pub guild_id: i64,
    pub crown_activity_threshold_days: Option<i32>,
    pub crown_min_playcount: Option<i64>,
    pub whitelist_enabled: bool,
}

/// Guild membership row joined with the member's external handle.
#[derive(Debug, Clone, FromRow)]
pub struct GuildMember {
    pub guild_id: i64,
    pub user_id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub blocked_from_crowns: bool,
    pub whitelisted: Option<bool>,
    pub last_used: Option<DateTime<Utc>>,
}

/// A crown row. Transfers deactivate the old row and insert a new one, so
/// for a given (guild, artist) at most one row is active at a time.
#[derive(Debug, Clone, FromRow)]
pub struct CrownRecord {
    pub crown_id: i64,
    pub guild_id: i64,
    pub user_id: i64,
    pub artist_name: String,
    pub active: bool,
    pub seeded: bool,
    pub start_playcount: i64,
    pub current_playcount: i64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// A crown row about to be inserted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewCrown {
    pub guild_id: i64,
    pub user_id: i64,
    pub artist_name: String,
    pub active: bool,
    pub seeded: bool,
    pub start_playcount: i64,
    pub current_playcount: i64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Highest-playcount listener for one artist, produced by the reseed query.
#[derive(Debug, Clone, FromRow)]
pub struct SeedCandidate {
    pub user_id: i64,
    pub artist_name: String,
    pub playcount: i64,
}

/// Global track metadata row feeding the playtime estimator.
#[derive(Debug, Clone, FromRow)]
pub struct TrackDuration {
    pub name: String,
    pub artist_name: String,
    pub duration_ms: Option<i64>,
}
