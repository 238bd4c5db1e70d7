//! Converts playcounts into estimated listening time.
//!
//! Track lengths are cached from the store and refreshed on a TTL. Lookup
//! falls back from the exact track length to the artist's average and
//! finally to a fixed default, so an estimate is always available.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::models::PlayEvent;
use crate::store::MusicStore;

/// Fallback when neither the track nor the artist is known: 3m30s.
pub const DEFAULT_TRACK_LENGTH_MS: i64 = 210_000;

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Default)]
struct DurationCache {
    /// (artist, track) -> duration, keys lowercased.
    tracks: HashMap<(String, String), i64>,
    /// artist -> average duration across that artist's known tracks.
    artist_avg: HashMap<String, i64>,
    refreshed_at: Option<Instant>,
}

impl DurationCache {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.refreshed_at
            .map(|at| at.elapsed() < ttl)
            .unwrap_or(false)
    }

    fn length_ms(&self, artist: &str, track: &str) -> i64 {
        let key = (artist.to_lowercase(), track.to_lowercase());
        if let Some(ms) = self.tracks.get(&key) {
            return *ms;
        }
        self.artist_avg
            .get(&key.0)
            .copied()
            .unwrap_or(DEFAULT_TRACK_LENGTH_MS)
    }
}

pub struct PlaytimeEstimator {
    store: Arc<dyn MusicStore>,
    ttl: Duration,
    cache: RwLock<DurationCache>,
}

impl PlaytimeEstimator {
    pub fn new(store: Arc<dyn MusicStore>) -> Self {
        Self::with_ttl(store, CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn MusicStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(DurationCache::default()),
        }
    }

    /// Estimated time spent on `playcount` plays of one track.
    pub async fn estimate(&self, artist: &str, track: &str, playcount: i64) -> Result<Duration> {
        self.ensure_fresh().await?;

        let cache = self.cache.read().expect("duration cache poisoned");
        let total_ms = cache.length_ms(artist, track).saturating_mul(playcount.max(0));
        Ok(Duration::from_millis(total_ms as u64))
    }

    /// Summed estimate across a batch of play events.
    pub async fn playtime_for_plays(&self, plays: &[PlayEvent]) -> Result<Duration> {
        self.ensure_fresh().await?;

        let cache = self.cache.read().expect("duration cache poisoned");
        let total_ms: i64 = plays
            .iter()
            .map(|p| cache.length_ms(&p.artist_name, &p.track_name))
            .sum();
        Ok(Duration::from_millis(total_ms as u64))
    }

    /// Recompute-if-stale. The lock is never held across the store read, so
    /// two callers may refresh concurrently; writes converge per key and the
    /// duplicated read is tolerated.
    async fn ensure_fresh(&self) -> Result<()> {
        {
            let cache = self.cache.read().expect("duration cache poisoned");
            if cache.is_fresh(self.ttl) {
                return Ok(());
            }
        }

        let rows = self.store.track_durations().await?;

        let mut tracks = HashMap::new();
        let mut sums: HashMap<String, (i64, i64)> = HashMap::new();
        for row in rows {
            let Some(ms) = row.duration_ms else { continue };
            let artist = row.artist_name.to_lowercase();
            tracks.insert((artist.clone(), row.name.to_lowercase()), ms);
            let (total, count) = sums.entry(artist).or_insert((0, 0));
            *total += ms;
            *count += 1;
        }

        let artist_avg = sums
            .into_iter()
            .map(|(artist, (total, count))| (artist, total / count.max(1)))
            .collect();

        let mut cache = self.cache.write().expect("duration cache poisoned");
        *cache = DurationCache {
            tracks,
            artist_avg,
            refreshed_at: Some(Instant::now()),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn estimator_with(durations: &[(&str, &str, i64)]) -> PlaytimeEstimator {
        let store = MemoryStore::new();
        for (artist, track, ms) in durations {
            store.add_track_duration(artist, track, Some(*ms));
        }
        PlaytimeEstimator::new(Arc::new(store))
    }

    #[tokio::test]
    async fn known_track_length_is_multiplied_exactly() {
        let estimator = estimator_with(&[("Artist", "Song", 200_000)]);
        let estimate = estimator.estimate("Artist", "Song", 10).await.unwrap();
        assert_eq!(estimate, Duration::from_millis(2_000_000));
    }

    #[tokio::test]
    async fn unknown_track_falls_back_to_artist_average() {
        let estimator = estimator_with(&[
            ("Artist", "One", 160_000),
            ("Artist", "Two", 200_000),
        ]);
        let estimate = estimator.estimate("Artist", "Unknown", 2).await.unwrap();
        assert_eq!(estimate, Duration::from_millis(2 * 180_000));
    }

    #[tokio::test]
    async fn unknown_artist_falls_back_to_default() {
        let estimator = estimator_with(&[]);
        let estimate = estimator.estimate("Nobody", "Nothing", 3).await.unwrap();
        assert_eq!(
            estimate,
            Duration::from_millis(3 * DEFAULT_TRACK_LENGTH_MS as u64)
        );
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let estimator = estimator_with(&[("Artist", "Song", 120_000)]);
        let estimate = estimator.estimate("ARTIST", "song", 1).await.unwrap();
        assert_eq!(estimate, Duration::from_millis(120_000));
    }

    #[tokio::test]
    async fn rows_without_duration_are_skipped() {
        let store = MemoryStore::new();
        store.add_track_duration("Artist", "Song", None);
        let estimator = PlaytimeEstimator::new(Arc::new(store));
        let estimate = estimator.estimate("Artist", "Song", 1).await.unwrap();
        assert_eq!(estimate, Duration::from_millis(DEFAULT_TRACK_LENGTH_MS as u64));
    }
}
