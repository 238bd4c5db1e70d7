//! Storage port. The sync engine, leaderboard builders and crown ledger are
//! written against [`MusicStore`]; `postgres` is the production backend and
//! `memory` backs the test suite.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::leaderboard::{ListTrack, RankedEntry};
use crate::models::{
    AlbumAggregate, ArtistAggregate, CrownRecord, GuildConfig, GuildMember, NewCrown, PlayEvent,
    SeedCandidate, TrackAggregate, TrackDuration, UserAccount,
};

pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

/// Ordering for a user's crown listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrownOrder {
    Playcount,
    Created,
}

#[async_trait]
pub trait MusicStore: Send + Sync {
    // --- users ---

    async fn user_by_id(&self, user_id: i64) -> Result<Option<UserAccount>>;

    async fn user_ids(&self) -> Result<Vec<i64>>;

    async fn set_registered_at(&self, user_id: i64, registered_at: DateTime<Utc>) -> Result<()>;

    async fn set_total_playcount(&self, user_id: i64, total_playcount: i64) -> Result<()>;

    async fn set_index_times(
        &self,
        user_id: i64,
        indexed_at: DateTime<Utc>,
        last_scrobble: DateTime<Utc>,
    ) -> Result<()>;

    // --- per-user aggregates, replaced wholesale on sync ---

    async fn replace_artists(&self, user_id: i64, rows: &[ArtistAggregate]) -> Result<()>;

    async fn replace_albums(&self, user_id: i64, rows: &[AlbumAggregate]) -> Result<()>;

    async fn replace_tracks(&self, user_id: i64, rows: &[TrackAggregate]) -> Result<()>;

    async fn replace_plays(&self, user_id: i64, rows: &[PlayEvent]) -> Result<()>;

    /// Overwrite one stored artist playcount with a re-verified value.
    async fn set_artist_playcount(&self, user_id: i64, artist: &str, playcount: i64)
        -> Result<()>;

    // --- guilds ---

    async fn guild_config(&self, guild_id: i64) -> Result<Option<GuildConfig>>;

    async fn guild_members(&self, guild_id: i64) -> Result<Vec<GuildMember>>;

    // --- leaderboard reads ---

    async fn who_knows_artist(&self, guild_id: i64, artist: &str) -> Result<Vec<RankedEntry>>;

    async fn who_knows_track(
        &self,
        guild_id: i64,
        artist: &str,
        track: &str,
    ) -> Result<Vec<RankedEntry>>;

    async fn guild_plays(
        &self,
        guild_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlayEvent>>;

    async fn guild_track_totals(&self, guild_id: i64) -> Result<Vec<ListTrack>>;

    // --- crowns ---

    /// All active crown rows for (guild, artist). More than one element means
    /// the single-active invariant is broken; callers surface that.
    async fn active_crowns(&self, guild_id: i64, artist: &str) -> Result<Vec<CrownRecord>>;

    async fn update_crown(&self, crown: &CrownRecord) -> Result<()>;

    async fn insert_crown(&self, crown: &NewCrown) -> Result<CrownRecord>;

    async fn insert_crowns(&self, crowns: &[NewCrown]) -> Result<()>;

    async fn guild_crowns(&self, guild_id: i64) -> Result<Vec<CrownRecord>>;

    async fn crown_seed_candidates(
        &self,
        guild_id: i64,
        min_playcount: i64,
    ) -> Result<Vec<SeedCandidate>>;

    async fn delete_seeded_crowns(&self, guild_id: i64) -> Result<u64>;

    async fn crowns_for_artist(&self, guild_id: i64, artist: &str) -> Result<Vec<CrownRecord>>;

    async fn crowns_for_user(
        &self,
        guild_id: i64,
        user_id: i64,
        order: CrownOrder,
    ) -> Result<Vec<CrownRecord>>;

    /// (user_id, active crown count) per member, most crowns first.
    async fn top_crown_holders(&self, guild_id: i64) -> Result<Vec<(i64, i64)>>;

    async fn active_crown_count(&self, guild_id: i64) -> Result<i64>;

    async fn remove_guild_crowns(&self, guild_id: i64) -> Result<u64>;

    async fn remove_member_crowns(&self, guild_id: i64, user_id: i64) -> Result<u64>;

    // --- estimator ---

    /// All known track durations, consumed by the playtime cache refresh.
    async fn track_durations(&self) -> Result<Vec<TrackDuration>>;
}
