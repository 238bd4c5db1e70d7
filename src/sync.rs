//! Pulls a user's aggregates and recent plays from the listening source and
//! replaces their stored snapshot.
//!
//! Each category is delete-then-bulk-insert: the stored rows always match
//! the latest fetch exactly, and a failed category fetch degrades to an
//! empty replacement set without aborting the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::{AlbumAggregate, ArtistAggregate, PlayEvent, TrackAggregate, UserAccount};
use crate::source::ListeningSource;
use crate::stats;
use crate::store::MusicStore;

pub const PAGE_SIZE: u32 = 1000;

/// Page depth per category for ordinary accounts.
const ARTIST_PAGES: u32 = 4;
const ALBUM_PAGES: u32 = 5;
const TRACK_PAGES: u32 = 6;
/// Page depth for privileged tiers.
const DEEP_PAGES: u32 = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncSummary {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
    pub plays: usize,
    pub total_playcount: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    /// A sync for this user was already in flight; nothing was done.
    AlreadyRunning,
}

pub struct SyncEngine {
    source: Arc<dyn ListeningSource>,
    store: Arc<dyn MusicStore>,
    play_retention_days: i64,
    in_flight: Mutex<HashSet<i64>>,
}

/// Clears the in-flight marker on every exit path, including errors.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<i64>>,
    user_id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().expect("in-flight set poisoned").remove(&self.user_id);
    }
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn ListeningSource>,
        store: Arc<dyn MusicStore>,
        play_retention_days: i64,
    ) -> Self {
        Self {
            source,
            store,
            play_retention_days,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Refresh one user's stored snapshot. `start_delay` is a pre-work pause
    /// the caller uses to stagger outbound calls across a queue of users; it
    /// suspends rather than blocks the worker.
    pub async fn sync_user(&self, user_id: i64, start_delay: Duration) -> Result<SyncOutcome> {
        let _guard = {
            let mut in_flight = self.in_flight.lock().expect("in-flight set poisoned");
            if !in_flight.insert(user_id) {
                tracing::info!("sync already in flight for user {}, skipping", user_id);
                return Ok(SyncOutcome::AlreadyRunning);
            }
            InFlightGuard {
                set: &self.in_flight,
                user_id,
            }
        };

        tokio::time::sleep(start_delay).await;

        let user = self
            .store
            .user_by_id(user_id)
            .await?
            .with_context(|| format!("unknown user {user_id}"))?;

        tracing::info!("starting index for {}", user.username);
        let now = Utc::now();
        let mut summary = SyncSummary::default();

        match self.source.profile(&user.username).await {
            Ok(profile) => {
                if let Some(registered_at) = profile.registered_at {
                    self.store.set_registered_at(user_id, registered_at).await?;
                }
            }
            Err(e) => {
                stats::inc(&stats::SOURCE_ERRORS);
                tracing::warn!("profile fetch failed for {}: {}", user.username, e);
            }
        }

        match self.source.recent_plays(&user.username, 1, None).await {
            Ok(recent) => {
                if let Some(total) = recent.total_playcount {
                    self.store.set_total_playcount(user_id, total).await?;
                    summary.total_playcount = Some(total);
                }
            }
            Err(e) => {
                stats::inc(&stats::SOURCE_ERRORS);
                tracing::warn!("playcount fetch failed for {}: {}", user.username, e);
            }
        }

        let plays = self.fetch_plays(&user).await;
        summary.plays = plays.len();
        self.store.replace_plays(user_id, &plays).await?;

        let artists = self.fetch_artists(&user).await;
        summary.artists = artists.len();
        self.store.replace_artists(user_id, &artists).await?;

        let albums = self.fetch_albums(&user).await;
        summary.albums = albums.len();
        self.store.replace_albums(user_id, &albums).await?;

        let tracks = self.fetch_tracks(&user).await;
        summary.tracks = tracks.len();
        self.store.replace_tracks(user_id, &tracks).await?;

        let last_scrobble = self.latest_scrobble_date(&user).await;
        self.store.set_index_times(user_id, now, last_scrobble).await?;

        stats::inc(&stats::INDEXED_USERS);
        tracing::info!(
            "indexed {}: {} artists, {} albums, {} tracks, {} plays",
            user.username,
            summary.artists,
            summary.albums,
            summary.tracks,
            summary.plays
        );

        Ok(SyncOutcome::Completed(summary))
    }

    async fn fetch_plays(&self, user: &UserAccount) -> Vec<PlayEvent> {
        let cutoff = Utc::now() - chrono::Duration::days(self.play_retention_days);

        let recent = match self
            .source
            .recent_plays(&user.username, PAGE_SIZE, Some(cutoff))
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                stats::inc(&stats::SOURCE_ERRORS);
                tracing::warn!("plays fetch failed for {}: {}", user.username, e);
                return Vec::new();
            }
        };

        recent
            .plays
            .into_iter()
            .filter_map(|p| {
                // now-playing entries carry no timestamp and are not stored
                let played_at = p.played_at.filter(|at| *at > cutoff)?;
                Some(PlayEvent {
                    user_id: user.user_id,
                    track_name: p.track_name,
                    album_name: p.album_name,
                    artist_name: p.artist_name,
                    played_at,
                })
            })
            .collect()
    }

    async fn fetch_artists(&self, user: &UserAccount) -> Vec<ArtistAggregate> {
        let mut rows = Vec::new();
        for page in 1..=page_limit(user, ARTIST_PAGES) {
            match self.source.top_artists(&user.username, page, PAGE_SIZE).await {
                Ok(batch) => {
                    let short_page = batch.len() < PAGE_SIZE as usize;
                    rows.extend(batch.into_iter().map(|a| ArtistAggregate {
                        user_id: user.user_id,
                        name: a.name,
                        playcount: a.playcount,
                    }));
                    if short_page {
                        break;
                    }
                }
                Err(e) => {
                    stats::inc(&stats::SOURCE_ERRORS);
                    tracing::warn!("artist fetch failed for {}: {}", user.username, e);
                    return Vec::new();
                }
            }
        }
        dedupe_by_key(rows, |a| a.name.to_lowercase())
    }

    async fn fetch_albums(&self, user: &UserAccount) -> Vec<AlbumAggregate> {
        let mut rows = Vec::new();
        for page in 1..=page_limit(user, ALBUM_PAGES) {
            match self.source.top_albums(&user.username, page, PAGE_SIZE).await {
                Ok(batch) => {
                    let short_page = batch.len() < PAGE_SIZE as usize;
                    rows.extend(batch.into_iter().map(|a| AlbumAggregate {
                        user_id: user.user_id,
                        name: a.name,
                        artist_name: a.artist_name,
                        playcount: a.playcount,
                    }));
                    if short_page {
                        break;
                    }
                }
                Err(e) => {
                    stats::inc(&stats::SOURCE_ERRORS);
                    tracing::warn!("album fetch failed for {}: {}", user.username, e);
                    return Vec::new();
                }
            }
        }
        dedupe_by_key(rows, |a| {
            (a.artist_name.to_lowercase(), a.name.to_lowercase())
        })
    }

    async fn fetch_tracks(&self, user: &UserAccount) -> Vec<TrackAggregate> {
        let mut rows = Vec::new();
        for page in 1..=page_limit(user, TRACK_PAGES) {
            match self.source.top_tracks(&user.username, page, PAGE_SIZE).await {
                Ok(batch) => {
                    let short_page = batch.len() < PAGE_SIZE as usize;
                    rows.extend(batch.into_iter().map(|t| TrackAggregate {
                        user_id: user.user_id,
                        name: t.name,
                        artist_name: t.artist_name,
                        playcount: t.playcount,
                    }));
                    if short_page {
                        break;
                    }
                }
                Err(e) => {
                    stats::inc(&stats::SOURCE_ERRORS);
                    tracing::warn!("track fetch failed for {}: {}", user.username, e);
                    return Vec::new();
                }
            }
        }
        dedupe_by_key(rows, |t| {
            (t.artist_name.to_lowercase(), t.name.to_lowercase())
        })
    }

    /// One-item recent query to stamp the last-scrobble time; falls back to
    /// now rather than holding up the sync.
    async fn latest_scrobble_date(&self, user: &UserAccount) -> chrono::DateTime<Utc> {
        match self.source.recent_plays(&user.username, 1, None).await {
            Ok(recent) => recent
                .plays
                .iter()
                .find_map(|p| p.played_at)
                .unwrap_or_else(Utc::now),
            Err(e) => {
                stats::inc(&stats::SOURCE_ERRORS);
                tracing::info!("recent call to stamp last scrobble failed: {}", e);
                Utc::now()
            }
        }
    }
}

fn page_limit(user: &UserAccount, base: u32) -> u32 {
    if user.user_type.has_higher_index_limit() {
        DEEP_PAGES
    } else {
        base
    }
}

/// Keeps the first row per key so a category never violates the
/// one-row-per-entity invariant, whatever the source returned.
fn dedupe_by_key<T, K: std::hash::Hash + Eq>(rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut seen: HashMap<K, ()> = HashMap::with_capacity(rows.len());
    rows.into_iter()
        .filter(|row| seen.insert(key(row), ()).is_none())
        .collect()
}
