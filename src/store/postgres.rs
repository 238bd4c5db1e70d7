//! Postgres [`MusicStore`] backend. Aggregate replacement happens in a
//! transaction (delete then bulk insert via UNNEST) so readers never see a
//! half-replaced snapshot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::leaderboard::{ListTrack, RankedEntry};
use crate::models::{
    AlbumAggregate, ArtistAggregate, CrownRecord, GuildConfig, GuildMember, NewCrown, PlayEvent,
    SeedCandidate, TrackAggregate, TrackDuration, UserAccount,
};
use crate::store::{CrownOrder, MusicStore};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CROWN_COLUMNS: &str =
    "crown_id, guild_id, user_id, artist_name, active, seeded, start_playcount, \
     current_playcount, created, modified";

#[async_trait]
impl MusicStore for PgStore {
    async fn user_by_id(&self, user_id: i64) -> Result<Option<UserAccount>> {
        let user = sqlx::query_as::<_, UserAccount>(
            "SELECT user_id, username, session_key, user_type, registered_at, last_indexed, \
             last_scrobble, total_playcount \
             FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load user")?;
        Ok(user)
    }

    async fn user_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT user_id FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .context("failed to list user ids")?;
        Ok(ids)
    }

    async fn set_registered_at(&self, user_id: i64, registered_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET registered_at = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(registered_at)
            .execute(&self.pool)
            .await
            .context("failed to update registration date")?;
        Ok(())
    }

    async fn set_total_playcount(&self, user_id: i64, total_playcount: i64) -> Result<()> {
        sqlx::query("UPDATE users SET total_playcount = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(total_playcount)
            .execute(&self.pool)
            .await
            .context("failed to update total playcount")?;
        Ok(())
    }

    async fn set_index_times(
        &self,
        user_id: i64,
        indexed_at: DateTime<Utc>,
        last_scrobble: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET last_indexed = $2, last_scrobble = $3 WHERE user_id = $1")
            .bind(user_id)
            .bind(indexed_at)
            .bind(last_scrobble)
            .execute(&self.pool)
            .await
            .context("failed to stamp index times")?;
        Ok(())
    }

    async fn replace_artists(&self, user_id: i64, rows: &[ArtistAggregate]) -> Result<()> {
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let playcounts: Vec<i64> = rows.iter().map(|r| r.playcount).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_artists WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO user_artists (user_id, name, playcount) \
             SELECT $1, t.name, t.playcount \
             FROM UNNEST($2::text[], $3::bigint[]) AS t(name, playcount)",
        )
        .bind(user_id)
        .bind(&names)
        .bind(&playcounts)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.context("failed to replace artists")?;
        Ok(())
    }

    async fn replace_albums(&self, user_id: i64, rows: &[AlbumAggregate]) -> Result<()> {
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let artists: Vec<&str> = rows.iter().map(|r| r.artist_name.as_str()).collect();
        let playcounts: Vec<i64> = rows.iter().map(|r| r.playcount).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_albums WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO user_albums (user_id, name, artist_name, playcount) \
             SELECT $1, t.name, t.artist_name, t.playcount \
             FROM UNNEST($2::text[], $3::text[], $4::bigint[]) AS t(name, artist_name, playcount)",
        )
        .bind(user_id)
        .bind(&names)
        .bind(&artists)
        .bind(&playcounts)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.context("failed to replace albums")?;
        Ok(())
    }

    async fn replace_tracks(&self, user_id: i64, rows: &[TrackAggregate]) -> Result<()> {
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let artists: Vec<&str> = rows.iter().map(|r| r.artist_name.as_str()).collect();
        let playcounts: Vec<i64> = rows.iter().map(|r| r.playcount).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_tracks WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO user_tracks (user_id, name, artist_name, playcount) \
             SELECT $1, t.name, t.artist_name, t.playcount \
             FROM UNNEST($2::text[], $3::text[], $4::bigint[]) AS t(name, artist_name, playcount)",
        )
        .bind(user_id)
        .bind(&names)
        .bind(&artists)
        .bind(&playcounts)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.context("failed to replace tracks")?;
        Ok(())
    }

    async fn replace_plays(&self, user_id: i64, rows: &[PlayEvent]) -> Result<()> {
        let tracks: Vec<&str> = rows.iter().map(|r| r.track_name.as_str()).collect();
        let albums: Vec<Option<&str>> = rows.iter().map(|r| r.album_name.as_deref()).collect();
        let artists: Vec<&str> = rows.iter().map(|r| r.artist_name.as_str()).collect();
        let played: Vec<DateTime<Utc>> = rows.iter().map(|r| r.played_at).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_plays WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO user_plays (user_id, track_name, album_name, artist_name, played_at) \
             SELECT $1, t.track_name, t.album_name, t.artist_name, t.played_at \
             FROM UNNEST($2::text[], $3::text[], $4::text[], $5::timestamptz[]) \
             AS t(track_name, album_name, artist_name, played_at)",
        )
        .bind(user_id)
        .bind(&tracks)
        .bind(&albums)
        .bind(&artists)
        .bind(&played)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.context("failed to replace plays")?;
        Ok(())
    }

    async fn set_artist_playcount(
        &self,
        user_id: i64,
        artist: &str,
        playcount: i64,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE user_artists SET playcount = $3 \
             WHERE user_id = $1 AND LOWER(name) = LOWER($2)",
        )
        .bind(user_id)
        .bind(artist)
        .bind(playcount)
        .execute(&self.pool)
        .await
        .context("failed to update artist playcount")?;

        if updated.rows_affected() == 0 {
            sqlx::query("INSERT INTO user_artists (user_id, name, playcount) VALUES ($1, $2, $3)")
                .bind(user_id)
                .bind(artist)
                .bind(playcount)
                .execute(&self.pool)
                .await
                .context("failed to insert artist playcount")?;
        }
        Ok(())
    }

    async fn guild_config(&self, guild_id: i64) -> Result<Option<GuildConfig>> {
        let config = sqlx::query_as::<_, GuildConfig>(
            "SELECT guild_id, crown_activity_threshold_days, crown_min_playcount, \
             whitelist_enabled \
             FROM guilds WHERE guild_id = $1",
        )
        .bind(guild_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load guild config")?;
        Ok(config)
    }

    async fn guild_members(&self, guild_id: i64) -> Result<Vec<GuildMember>> {
        let members = sqlx::query_as::<_, GuildMember>(
            "SELECT gu.guild_id, gu.user_id, u.username, gu.display_name, \
             gu.blocked_from_crowns, gu.whitelisted, gu.last_used \
             FROM guild_users gu \
             JOIN users u ON u.user_id = gu.user_id \
             WHERE gu.guild_id = $1",
        )
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load guild members")?;
        Ok(members)
    }

    async fn who_knows_artist(&self, guild_id: i64, artist: &str) -> Result<Vec<RankedEntry>> {
        let entries = sqlx::query_as::<_, RankedEntry>(
            "SELECT ua.user_id, u.username, gu.display_name, ua.name, ua.playcount \
             FROM user_artists ua \
             JOIN guild_users gu ON gu.user_id = ua.user_id AND gu.guild_id = $1 \
             JOIN users u ON u.user_id = ua.user_id \
             WHERE LOWER(ua.name) = LOWER($2) \
             ORDER BY ua.playcount DESC, ua.user_id ASC",
        )
        .bind(guild_id)
        .bind(artist)
        .fetch_all(&self.pool)
        .await
        .context("failed to rank artist listeners")?;
        Ok(entries)
    }

    async fn who_knows_track(
        &self,
        guild_id: i64,
        artist: &str,
        track: &str,
    ) -> Result<Vec<RankedEntry>> {
        let entries = sqlx::query_as::<_, RankedEntry>(
            "SELECT ut.user_id, u.username, gu.display_name, ut.name, ut.playcount \
             FROM user_tracks ut \
             JOIN guild_users gu ON gu.user_id = ut.user_id AND gu.guild_id = $1 \
             JOIN users u ON u.user_id = ut.user_id \
             WHERE LOWER(ut.artist_name) = LOWER($2) AND LOWER(ut.name) = LOWER($3) \
             ORDER BY ut.playcount DESC, ut.user_id ASC",
        )
        .bind(guild_id)
        .bind(artist)
        .bind(track)
        .fetch_all(&self.pool)
        .await
        .context("failed to rank track listeners")?;
        Ok(entries)
    }

    async fn guild_plays(
        &self,
        guild_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlayEvent>> {
        let plays = sqlx::query_as::<_, PlayEvent>(
            "SELECT up.user_id, up.track_name, up.album_name, up.artist_name, up.played_at \
             FROM user_plays up \
             JOIN guild_users gu ON gu.user_id = up.user_id AND gu.guild_id = $1 \
             WHERE $2::timestamptz IS NULL OR up.played_at >= $2",
        )
        .bind(guild_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to load guild plays")?;
        Ok(plays)
    }

    async fn guild_track_totals(&self, guild_id: i64) -> Result<Vec<ListTrack>> {
        let tracks = sqlx::query_as::<_, ListTrack>(
            "SELECT MIN(ut.artist_name) AS artist_name, MIN(ut.name) AS track_name, \
             SUM(ut.playcount)::bigint AS playcount, COUNT(*)::bigint AS listener_count \
             FROM user_tracks ut \
             JOIN guild_users gu ON gu.user_id = ut.user_id AND gu.guild_id = $1 \
             GROUP BY LOWER(ut.artist_name), LOWER(ut.name)",
        )
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to total guild tracks")?;
        Ok(tracks)
    }

    async fn active_crowns(&self, guild_id: i64, artist: &str) -> Result<Vec<CrownRecord>> {
        let crowns = sqlx::query_as::<_, CrownRecord>(&format!(
            "SELECT {CROWN_COLUMNS} FROM user_crowns \
             WHERE guild_id = $1 AND active AND LOWER(artist_name) = LOWER($2)"
        ))
        .bind(guild_id)
        .bind(artist)
        .fetch_all(&self.pool)
        .await
        .context("failed to load active crowns")?;
        Ok(crowns)
    }

    async fn update_crown(&self, crown: &CrownRecord) -> Result<()> {
        sqlx::query(
            "UPDATE user_crowns \
             SET active = $2, seeded = $3, current_playcount = $4, modified = $5 \
             WHERE crown_id = $1",
        )
        .bind(crown.crown_id)
        .bind(crown.active)
        .bind(crown.seeded)
        .bind(crown.current_playcount)
        .bind(crown.modified)
        .execute(&self.pool)
        .await
        .context("failed to update crown")?;
        Ok(())
    }

    async fn insert_crown(&self, crown: &NewCrown) -> Result<CrownRecord> {
        let record = sqlx::query_as::<_, CrownRecord>(&format!(
            "INSERT INTO user_crowns \
             (guild_id, user_id, artist_name, active, seeded, start_playcount, \
              current_playcount, created, modified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {CROWN_COLUMNS}"
        ))
        .bind(crown.guild_id)
        .bind(crown.user_id)
        .bind(&crown.artist_name)
        .bind(crown.active)
        .bind(crown.seeded)
        .bind(crown.start_playcount)
        .bind(crown.current_playcount)
        .bind(crown.created)
        .bind(crown.modified)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert crown")?;
        Ok(record)
    }

    async fn insert_crowns(&self, crowns: &[NewCrown]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for crown in crowns {
            sqlx::query(
                "INSERT INTO user_crowns \
                 (guild_id, user_id, artist_name, active, seeded, start_playcount, \
                  current_playcount, created, modified) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(crown.guild_id)
            .bind(crown.user_id)
            .bind(&crown.artist_name)
            .bind(crown.active)
            .bind(crown.seeded)
            .bind(crown.start_playcount)
            .bind(crown.current_playcount)
            .bind(crown.created)
            .bind(crown.modified)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.context("failed to insert crowns")?;
        Ok(())
    }

    async fn guild_crowns(&self, guild_id: i64) -> Result<Vec<CrownRecord>> {
        let crowns = sqlx::query_as::<_, CrownRecord>(&format!(
            "SELECT {CROWN_COLUMNS} FROM user_crowns WHERE guild_id = $1"
        ))
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load guild crowns")?;
        Ok(crowns)
    }

    async fn crown_seed_candidates(
        &self,
        guild_id: i64,
        min_playcount: i64,
    ) -> Result<Vec<SeedCandidate>> {
        // one candidate per artist: the highest-playcount unblocked member
        let candidates = sqlx::query_as::<_, SeedCandidate>(
            "SELECT DISTINCT ON (LOWER(ua.name)) \
             ua.user_id, ua.name AS artist_name, ua.playcount \
             FROM user_artists ua \
             JOIN guild_users gu ON gu.user_id = ua.user_id AND gu.guild_id = $1 \
             WHERE ua.playcount >= $2 AND NOT gu.blocked_from_crowns \
             ORDER BY LOWER(ua.name), ua.playcount DESC, ua.user_id ASC",
        )
        .bind(guild_id)
        .bind(min_playcount)
        .fetch_all(&self.pool)
        .await
        .context("failed to load seed candidates")?;
        Ok(candidates)
    }

    async fn delete_seeded_crowns(&self, guild_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_crowns WHERE guild_id = $1 AND seeded")
            .bind(guild_id)
            .execute(&self.pool)
            .await
            .context("failed to delete seeded crowns")?;
        Ok(result.rows_affected())
    }

    async fn crowns_for_artist(&self, guild_id: i64, artist: &str) -> Result<Vec<CrownRecord>> {
        let crowns = sqlx::query_as::<_, CrownRecord>(&format!(
            "SELECT {CROWN_COLUMNS} FROM user_crowns \
             WHERE guild_id = $1 AND LOWER(artist_name) = LOWER($2) \
             ORDER BY created DESC"
        ))
        .bind(guild_id)
        .bind(artist)
        .fetch_all(&self.pool)
        .await
        .context("failed to load artist crown history")?;
        Ok(crowns)
    }

    async fn crowns_for_user(
        &self,
        guild_id: i64,
        user_id: i64,
        order: CrownOrder,
    ) -> Result<Vec<CrownRecord>> {
        let order_clause = match order {
            CrownOrder::Playcount => "current_playcount DESC",
            CrownOrder::Created => "created DESC",
        };
        let crowns = sqlx::query_as::<_, CrownRecord>(&format!(
            "SELECT {CROWN_COLUMNS} FROM user_crowns \
             WHERE guild_id = $1 AND user_id = $2 AND active \
             ORDER BY {order_clause}"
        ))
        .bind(guild_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load member crowns")?;
        Ok(crowns)
    }

    async fn top_crown_holders(&self, guild_id: i64) -> Result<Vec<(i64, i64)>> {
        let holders = sqlx::query_as::<_, (i64, i64)>(
            "SELECT user_id, COUNT(*)::bigint AS crowns \
             FROM user_crowns WHERE guild_id = $1 AND active \
             GROUP BY user_id \
             ORDER BY COUNT(*) DESC, user_id ASC",
        )
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to count crown holders")?;
        Ok(holders)
    }

    async fn active_crown_count(&self, guild_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::bigint FROM user_crowns WHERE guild_id = $1 AND active",
        )
        .bind(guild_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count active crowns")?;
        Ok(count)
    }

    async fn remove_guild_crowns(&self, guild_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_crowns WHERE guild_id = $1")
            .bind(guild_id)
            .execute(&self.pool)
            .await
            .context("failed to delete guild crowns")?;
        Ok(result.rows_affected())
    }

    async fn remove_member_crowns(&self, guild_id: i64, user_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_crowns WHERE guild_id = $1 AND user_id = $2")
            .bind(guild_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to delete member crowns")?;
        Ok(result.rows_affected())
    }

    async fn track_durations(&self) -> Result<Vec<TrackDuration>> {
        let rows = sqlx::query_as::<_, TrackDuration>(
            "SELECT name, artist_name, duration_ms FROM tracks",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load track durations")?;
        Ok(rows)
    }
}
