//! In-memory [`MusicStore`] backing the test suite. Everything lives behind
//! one mutex; locks are never held across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::leaderboard::{ListTrack, RankedEntry};
use crate::models::{
    AlbumAggregate, ArtistAggregate, CrownRecord, GuildConfig, GuildMember, NewCrown, PlayEvent,
    SeedCandidate, TrackAggregate, TrackDuration, UserAccount, UserType,
};
use crate::store::{CrownOrder, MusicStore};

#[derive(Default)]
struct State {
    users: HashMap<i64, UserAccount>,
    next_user_id: i64,
    artists: HashMap<i64, Vec<ArtistAggregate>>,
    albums: HashMap<i64, Vec<AlbumAggregate>>,
    tracks: HashMap<i64, Vec<TrackAggregate>>,
    plays: HashMap<i64, Vec<PlayEvent>>,
    guilds: HashMap<i64, GuildConfig>,
    members: HashMap<i64, Vec<GuildMember>>,
    crowns: Vec<CrownRecord>,
    next_crown_id: i64,
    seed_candidates: HashMap<i64, Vec<SeedCandidate>>,
    durations: Vec<TrackDuration>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store poisoned")
    }
}

/// Seeding and inspection helpers for tests.
impl MemoryStore {
    pub fn add_user(&self, username: &str, user_type: UserType) -> i64 {
        let mut state = self.state();
        state.next_user_id += 1;
        let user_id = state.next_user_id;
        state.users.insert(
            user_id,
            UserAccount {
                user_id,
                username: username.to_string(),
                session_key: None,
                user_type,
                registered_at: None,
                last_indexed: None,
                last_scrobble: None,
                total_playcount: None,
            },
        );
        user_id
    }

    pub fn add_guild(&self, config: GuildConfig) {
        let mut state = self.state();
        state.guilds.insert(config.guild_id, config);
    }

    pub fn add_member(&self, member: GuildMember) {
        let mut state = self.state();
        state.members.entry(member.guild_id).or_default().push(member);
    }

    pub fn add_track_duration(&self, artist: &str, track: &str, duration_ms: Option<i64>) {
        self.state().durations.push(TrackDuration {
            name: track.to_string(),
            artist_name: artist.to_string(),
            duration_ms,
        });
    }

    pub fn set_seed_candidates(&self, guild_id: i64, rows: &[(i64, &str, i64)]) {
        let candidates = rows
            .iter()
            .map(|(user_id, artist, playcount)| SeedCandidate {
                user_id: *user_id,
                artist_name: artist.to_string(),
                playcount: *playcount,
            })
            .collect();
        self.state().seed_candidates.insert(guild_id, candidates);
    }

    pub fn artist_names(&self, user_id: i64) -> Vec<String> {
        self.state()
            .artists
            .get(&user_id)
            .map(|rows| rows.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn track_count(&self, user_id: i64) -> usize {
        self.state()
            .tracks
            .get(&user_id)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    pub fn plays_for(&self, user_id: i64) -> Vec<PlayEvent> {
        self.state().plays.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn user_artist_playcount(&self, user_id: i64, artist: &str) -> Option<i64> {
        self.state()
            .artists
            .get(&user_id)?
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(artist))
            .map(|r| r.playcount)
    }
}

fn ranked(member: &GuildMember, name: &str, playcount: i64) -> RankedEntry {
    RankedEntry {
        user_id: member.user_id,
        username: member.username.clone(),
        display_name: member.display_name.clone(),
        name: name.to_string(),
        playcount,
        unpositioned: false,
    }
}

fn sort_entries(entries: &mut [RankedEntry]) {
    entries.sort_by(|a, b| {
        b.playcount
            .cmp(&a.playcount)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

#[async_trait]
impl MusicStore for MemoryStore {
    async fn user_by_id(&self, user_id: i64) -> Result<Option<UserAccount>> {
        Ok(self.state().users.get(&user_id).cloned())
    }

    async fn user_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self.state().users.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn set_registered_at(&self, user_id: i64, registered_at: DateTime<Utc>) -> Result<()> {
        if let Some(user) = self.state().users.get_mut(&user_id) {
            user.registered_at = Some(registered_at);
        }
        Ok(())
    }

    async fn set_total_playcount(&self, user_id: i64, total_playcount: i64) -> Result<()> {
        if let Some(user) = self.state().users.get_mut(&user_id) {
            user.total_playcount = Some(total_playcount);
        }
        Ok(())
    }

    async fn set_index_times(
        &self,
        user_id: i64,
        indexed_at: DateTime<Utc>,
        last_scrobble: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(user) = self.state().users.get_mut(&user_id) {
            user.last_indexed = Some(indexed_at);
            user.last_scrobble = Some(last_scrobble);
        }
        Ok(())
    }

    async fn replace_artists(&self, user_id: i64, rows: &[ArtistAggregate]) -> Result<()> {
        self.state().artists.insert(user_id, rows.to_vec());
        Ok(())
    }

    async fn replace_albums(&self, user_id: i64, rows: &[AlbumAggregate]) -> Result<()> {
        self.state().albums.insert(user_id, rows.to_vec());
        Ok(())
    }

    async fn replace_tracks(&self, user_id: i64, rows: &[TrackAggregate]) -> Result<()> {
        self.state().tracks.insert(user_id, rows.to_vec());
        Ok(())
    }

    async fn replace_plays(&self, user_id: i64, rows: &[PlayEvent]) -> Result<()> {
        self.state().plays.insert(user_id, rows.to_vec());
        Ok(())
    }

    async fn set_artist_playcount(
        &self,
        user_id: i64,
        artist: &str,
        playcount: i64,
    ) -> Result<()> {
        let mut state = self.state();
        let rows = state.artists.entry(user_id).or_default();
        match rows.iter_mut().find(|r| r.name.eq_ignore_ascii_case(artist)) {
            Some(row) => row.playcount = playcount,
            None => rows.push(ArtistAggregate {
                user_id,
                name: artist.to_string(),
                playcount,
            }),
        }
        Ok(())
    }

    async fn guild_config(&self, guild_id: i64) -> Result<Option<GuildConfig>> {
        Ok(self.state().guilds.get(&guild_id).cloned())
    }

    async fn guild_members(&self, guild_id: i64) -> Result<Vec<GuildMember>> {
        Ok(self.state().members.get(&guild_id).cloned().unwrap_or_default())
    }

    async fn who_knows_artist(&self, guild_id: i64, artist: &str) -> Result<Vec<RankedEntry>> {
        let state = self.state();
        let mut entries = Vec::new();
        for member in state.members.get(&guild_id).into_iter().flatten() {
            let row = state
                .artists
                .get(&member.user_id)
                .into_iter()
                .flatten()
                .find(|r| r.name.eq_ignore_ascii_case(artist));
            if let Some(row) = row {
                entries.push(ranked(member, &row.name, row.playcount));
            }
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn who_knows_track(
        &self,
        guild_id: i64,
        artist: &str,
        track: &str,
    ) -> Result<Vec<RankedEntry>> {
        let state = self.state();
        let mut entries = Vec::new();
        for member in state.members.get(&guild_id).into_iter().flatten() {
            let row = state
                .tracks
                .get(&member.user_id)
                .into_iter()
                .flatten()
                .find(|r| {
                    r.artist_name.eq_ignore_ascii_case(artist) && r.name.eq_ignore_ascii_case(track)
                });
            if let Some(row) = row {
                entries.push(ranked(member, &row.name, row.playcount));
            }
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn guild_plays(
        &self,
        guild_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlayEvent>> {
        let state = self.state();
        let mut plays = Vec::new();
        for member in state.members.get(&guild_id).into_iter().flatten() {
            for play in state.plays.get(&member.user_id).into_iter().flatten() {
                if since.map(|cutoff| play.played_at >= cutoff).unwrap_or(true) {
                    plays.push(play.clone());
                }
            }
        }
        Ok(plays)
    }

    async fn guild_track_totals(&self, guild_id: i64) -> Result<Vec<ListTrack>> {
        let state = self.state();
        let mut totals: HashMap<(String, String), ListTrack> = HashMap::new();
        for member in state.members.get(&guild_id).into_iter().flatten() {
            for row in state.tracks.get(&member.user_id).into_iter().flatten() {
                let key = (row.artist_name.to_lowercase(), row.name.to_lowercase());
                let entry = totals.entry(key).or_insert_with(|| ListTrack {
                    artist_name: row.artist_name.clone(),
                    track_name: row.name.clone(),
                    playcount: 0,
                    listener_count: 0,
                });
                entry.playcount += row.playcount;
                entry.listener_count += 1;
            }
        }
        Ok(totals.into_values().collect())
    }

    async fn active_crowns(&self, guild_id: i64, artist: &str) -> Result<Vec<CrownRecord>> {
        Ok(self
            .state()
            .crowns
            .iter()
            .filter(|c| {
                c.guild_id == guild_id && c.active && c.artist_name.eq_ignore_ascii_case(artist)
            })
            .cloned()
            .collect())
    }

    async fn update_crown(&self, crown: &CrownRecord) -> Result<()> {
        let mut state = self.state();
        if let Some(row) = state.crowns.iter_mut().find(|c| c.crown_id == crown.crown_id) {
            *row = crown.clone();
        }
        Ok(())
    }

    async fn insert_crown(&self, crown: &NewCrown) -> Result<CrownRecord> {
        let mut state = self.state();
        state.next_crown_id += 1;
        let record = CrownRecord {
            crown_id: state.next_crown_id,
            guild_id: crown.guild_id,
            user_id: crown.user_id,
            artist_name: crown.artist_name.clone(),
            active: crown.active,
            seeded: crown.seeded,
            start_playcount: crown.start_playcount,
            current_playcount: crown.current_playcount,
            created: crown.created,
            modified: crown.modified,
        };
        state.crowns.push(record.clone());
        Ok(record)
    }

    async fn insert_crowns(&self, crowns: &[NewCrown]) -> Result<()> {
        for crown in crowns {
            self.insert_crown(crown).await?;
        }
        Ok(())
    }

    async fn guild_crowns(&self, guild_id: i64) -> Result<Vec<CrownRecord>> {
        Ok(self
            .state()
            .crowns
            .iter()
            .filter(|c| c.guild_id == guild_id)
            .cloned()
            .collect())
    }

    async fn crown_seed_candidates(
        &self,
        guild_id: i64,
        min_playcount: i64,
    ) -> Result<Vec<SeedCandidate>> {
        Ok(self
            .state()
            .seed_candidates
            .get(&guild_id)
            .into_iter()
            .flatten()
            .filter(|c| c.playcount >= min_playcount)
            .cloned()
            .collect())
    }

    async fn delete_seeded_crowns(&self, guild_id: i64) -> Result<u64> {
        let mut state = self.state();
        let before = state.crowns.len();
        state.crowns.retain(|c| !(c.guild_id == guild_id && c.seeded));
        Ok((before - state.crowns.len()) as u64)
    }

    async fn crowns_for_artist(&self, guild_id: i64, artist: &str) -> Result<Vec<CrownRecord>> {
        let mut crowns: Vec<CrownRecord> = self
            .state()
            .crowns
            .iter()
            .filter(|c| c.guild_id == guild_id && c.artist_name.eq_ignore_ascii_case(artist))
            .cloned()
            .collect();
        crowns.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(crowns)
    }

    async fn crowns_for_user(
        &self,
        guild_id: i64,
        user_id: i64,
        order: CrownOrder,
    ) -> Result<Vec<CrownRecord>> {
        let mut crowns: Vec<CrownRecord> = self
            .state()
            .crowns
            .iter()
            .filter(|c| c.guild_id == guild_id && c.user_id == user_id && c.active)
            .cloned()
            .collect();
        match order {
            CrownOrder::Playcount => {
                crowns.sort_by(|a, b| b.current_playcount.cmp(&a.current_playcount))
            }
            CrownOrder::Created => crowns.sort_by(|a, b| b.created.cmp(&a.created)),
        }
        Ok(crowns)
    }

    async fn top_crown_holders(&self, guild_id: i64) -> Result<Vec<(i64, i64)>> {
        let state = self.state();
        let mut counts: HashMap<i64, i64> = HashMap::new();
        for crown in state.crowns.iter().filter(|c| c.guild_id == guild_id && c.active) {
            *counts.entry(crown.user_id).or_insert(0) += 1;
        }
        let mut holders: Vec<(i64, i64)> = counts.into_iter().collect();
        holders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(holders)
    }

    async fn active_crown_count(&self, guild_id: i64) -> Result<i64> {
        Ok(self
            .state()
            .crowns
            .iter()
            .filter(|c| c.guild_id == guild_id && c.active)
            .count() as i64)
    }

    async fn remove_guild_crowns(&self, guild_id: i64) -> Result<u64> {
        let mut state = self.state();
        let before = state.crowns.len();
        state.crowns.retain(|c| c.guild_id != guild_id);
        Ok((before - state.crowns.len()) as u64)
    }

    async fn remove_member_crowns(&self, guild_id: i64, user_id: i64) -> Result<u64> {
        let mut state = self.state();
        let before = state.crowns.len();
        state
            .crowns
            .retain(|c| !(c.guild_id == guild_id && c.user_id == user_id));
        Ok((before - state.crowns.len()) as u64)
    }

    async fn track_durations(&self) -> Result<Vec<TrackDuration>> {
        Ok(self.state().durations.clone())
    }
}
