//! Guild leaderboards: who listens to an artist or track the most, either by
//! playcount or by estimated listening time.
//!
//! Full rankings come straight from the store; the single-user upsert exists
//! so one member's fresh count can be repositioned without rebuilding the
//! whole ranking.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use sqlx::FromRow;

use crate::models::UserAccount;
use crate::playtime::PlaytimeEstimator;
use crate::store::MusicStore;

/// How many positioned entries a rendered leaderboard shows.
pub const VISIBLE_POSITIONS: usize = 14;

/// One leaderboard line: a guild member and their value for the subject.
#[derive(Debug, Clone, FromRow)]
pub struct RankedEntry {
    pub user_id: i64,
    pub username: String,
    pub display_name: Option<String>,
    /// Subject label (artist, "artist - track", or a listening-time string).
    pub name: String,
    pub playcount: i64,
    /// Set when the entry was upserted without replacing an existing one and
    /// its position is not yet authoritative.
    #[sqlx(default)]
    pub unpositioned: bool,
}

/// A guild-wide track line with its listener count tie-breaker.
#[derive(Debug, Clone, FromRow)]
pub struct ListTrack {
    pub artist_name: String,
    pub track_name: String,
    pub playcount: i64,
    pub listener_count: i64,
}

/// Ordering for guild-wide track lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOrder {
    Playcount,
    Listeners,
}

/// Descending by value; equal values order by ascending user id so rankings
/// are deterministic regardless of input order.
pub fn sort_ranking(ranking: &mut [RankedEntry]) {
    ranking.sort_by(|a, b| {
        b.playcount
            .cmp(&a.playcount)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

/// Replace or insert one member's entry and re-sort.
///
/// Any existing entry for the same external handle (case-insensitive) is
/// dropped first. When no entry existed the new one is flagged unpositioned,
/// since it was never part of the stored ranking.
pub fn upsert(
    ranking: Vec<RankedEntry>,
    account: &UserAccount,
    display_name: Option<String>,
    name: &str,
    playcount: i64,
) -> Vec<RankedEntry> {
    let handle = account.username.to_lowercase();
    let before = ranking.len();

    let mut ranking: Vec<RankedEntry> = ranking
        .into_iter()
        .filter(|e| e.username.to_lowercase() != handle)
        .collect();
    let replaced = ranking.len() < before;

    ranking.push(RankedEntry {
        user_id: account.user_id,
        username: account.username.clone(),
        display_name,
        name: name.to_string(),
        playcount,
        unpositioned: !replaced,
    });

    sort_ranking(&mut ranking);
    ranking
}

/// The renderable slice of a ranking: the top positioned entries plus, when
/// the queried member sits outside that window, one trailing line.
#[derive(Debug, Clone)]
pub struct LeaderboardWindow {
    /// (1-based rank, entry), at most [`VISIBLE_POSITIONS`] long.
    pub rows: Vec<(usize, RankedEntry)>,
    /// The first unpositioned entry, with its true rank when it falls inside
    /// the visible window and `None` (overflow) otherwise.
    pub trailing: Option<(Option<usize>, RankedEntry)>,
}

pub fn window(ranking: &[RankedEntry]) -> LeaderboardWindow {
    let rows = ranking
        .iter()
        .filter(|e| !e.unpositioned)
        .take(VISIBLE_POSITIONS)
        .cloned()
        .enumerate()
        .map(|(i, e)| (i + 1, e))
        .collect();

    let trailing = ranking
        .iter()
        .position(|e| e.unpositioned)
        .map(|idx| {
            let rank = if idx < VISIBLE_POSITIONS {
                Some(idx + 1)
            } else {
                None
            };
            (rank, ranking[idx].clone())
        });

    LeaderboardWindow { rows, trailing }
}

/// Playcount ranking of a guild's members for one artist.
pub async fn who_knows_artist(
    store: &dyn MusicStore,
    guild_id: i64,
    artist: &str,
) -> Result<Vec<RankedEntry>> {
    let mut ranking = store.who_knows_artist(guild_id, artist).await?;
    sort_ranking(&mut ranking);
    Ok(ranking)
}

/// Playcount ranking of a guild's members for one track.
pub async fn who_knows_track(
    store: &dyn MusicStore,
    guild_id: i64,
    artist: &str,
    track: &str,
) -> Result<Vec<RankedEntry>> {
    let mut ranking = store.who_knows_track(guild_id, artist, track).await?;
    sort_ranking(&mut ranking);
    Ok(ranking)
}

/// Ranking of a guild's members by estimated listening time over the stored
/// play window. The value is whole minutes; the label carries the formatted
/// duration.
pub async fn listening_time_leaderboard(
    store: &dyn MusicStore,
    estimator: &PlaytimeEstimator,
    guild_id: i64,
) -> Result<Vec<RankedEntry>> {
    let members = store.guild_members(guild_id).await?;
    let plays = store.guild_plays(guild_id, None).await?;

    let mut per_user: HashMap<i64, Vec<_>> = HashMap::new();
    for play in plays {
        per_user.entry(play.user_id).or_default().push(play);
    }

    let mut ranking = Vec::new();
    for member in &members {
        let Some(user_plays) = per_user.get(&member.user_id) else {
            continue;
        };
        let listened = estimator.playtime_for_plays(user_plays).await?;
        ranking.push(RankedEntry {
            user_id: member.user_id,
            username: member.username.clone(),
            display_name: member.display_name.clone(),
            name: format_listening_time(listened),
            playcount: listened.as_secs() as i64 / 60,
            unpositioned: false,
        });
    }

    sort_ranking(&mut ranking);
    Ok(ranking)
}

/// Guild-wide top tracks across all members' aggregates.
pub async fn top_tracks_for_guild(
    store: &dyn MusicStore,
    guild_id: i64,
    order: TrackOrder,
) -> Result<Vec<ListTrack>> {
    let mut tracks = store.guild_track_totals(guild_id).await?;

    match order {
        TrackOrder::Playcount => tracks.sort_by(|a, b| {
            b.playcount
                .cmp(&a.playcount)
                .then_with(|| b.listener_count.cmp(&a.listener_count))
        }),
        TrackOrder::Listeners => tracks.sort_by(|a, b| {
            b.listener_count
                .cmp(&a.listener_count)
                .then_with(|| b.playcount.cmp(&a.playcount))
        }),
    }

    tracks.truncate(VISIBLE_POSITIONS);
    Ok(tracks)
}

pub fn format_listening_time(listened: Duration) -> String {
    let minutes = listened.as_secs() / 60;
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserType;

    fn entry(user_id: i64, username: &str, playcount: i64) -> RankedEntry {
        RankedEntry {
            user_id,
            username: username.to_string(),
            display_name: None,
            name: "Artist".to_string(),
            playcount,
            unpositioned: false,
        }
    }

    fn account(user_id: i64, username: &str) -> UserAccount {
        UserAccount {
            user_id,
            username: username.to_string(),
            session_key: None,
            user_type: UserType::User,
            registered_at: None,
            last_indexed: None,
            last_scrobble: None,
            total_playcount: None,
        }
    }

    #[test]
    fn upsert_inserts_new_user_as_unpositioned() {
        let ranking = vec![entry(1, "a", 50), entry(2, "b", 40)];
        let ranking = upsert(ranking, &account(3, "c"), None, "Artist", 45);

        let summary: Vec<(i64, bool)> = ranking
            .iter()
            .map(|e| (e.playcount, e.unpositioned))
            .collect();
        assert_eq!(summary, vec![(50, false), (45, true), (40, false)]);
    }

    #[test]
    fn upsert_replaces_existing_handle_case_insensitively() {
        let ranking = vec![entry(1, "Alice", 50), entry(2, "bob", 40)];
        let ranking = upsert(ranking, &account(1, "alice"), None, "Artist", 60);

        assert_eq!(ranking.len(), 2);
        assert_eq!(ranking[0].playcount, 60);
        assert!(!ranking[0].unpositioned);
    }

    #[test]
    fn equal_values_order_by_user_id() {
        let mut ranking = vec![entry(9, "z", 10), entry(3, "m", 10), entry(5, "a", 20)];
        sort_ranking(&mut ranking);
        let ids: Vec<i64> = ranking.iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![5, 3, 9]);
    }

    #[test]
    fn window_caps_positions_and_marks_overflow() {
        let mut ranking: Vec<RankedEntry> =
            (0..20).map(|i| entry(i, &format!("u{i}"), 100 - i)).collect();
        ranking.push(RankedEntry {
            unpositioned: true,
            ..entry(99, "late", 1)
        });
        sort_ranking(&mut ranking);

        let view = window(&ranking);
        assert_eq!(view.rows.len(), VISIBLE_POSITIONS);
        assert_eq!(view.rows[0].0, 1);
        let (rank, trailing) = view.trailing.expect("trailing line");
        assert_eq!(trailing.user_id, 99);
        assert_eq!(rank, None);
    }

    #[test]
    fn window_gives_true_rank_inside_the_visible_window() {
        let ranking = vec![
            entry(1, "a", 50),
            RankedEntry {
                unpositioned: true,
                ..entry(3, "c", 45)
            },
            entry(2, "b", 40),
        ];
        let view = window(&ranking);
        assert_eq!(view.rows.len(), 2);
        let (rank, trailing) = view.trailing.expect("trailing line");
        assert_eq!(trailing.user_id, 3);
        assert_eq!(rank, Some(2));
    }

    #[test]
    fn listening_time_formats_hours_and_minutes() {
        assert_eq!(format_listening_time(Duration::from_secs(90 * 60)), "1h 30m");
        assert_eq!(format_listening_time(Duration::from_secs(25 * 60)), "25m");
    }
}
