//! The crown ledger: exclusive, contested per-(guild, artist) ownership.
//!
//! A crown is held by the guild member with the most plays for an artist.
//! Contests re-verify the sitting holder's playcount against the live source
//! before any transfer, so a challenger can never steal on stale data.
//! Transfers deactivate the old row and insert a new one; history stays.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::leaderboard::RankedEntry;
use crate::models::{CrownRecord, GuildConfig, GuildMember, NewCrown};
use crate::source::ListeningSource;
use crate::stats;
use crate::store::{CrownOrder, MusicStore};

pub const DEFAULT_PLAYS_FOR_CROWN: i64 = 30;

/// What a crown resolution did, so callers can render an accurate message
/// instead of inferring the outcome from the absence of an error.
#[derive(Debug, Clone)]
pub enum CrownOutcome {
    /// Nobody eligible came close to the threshold; nothing changed.
    NoQualifyingListener,
    /// The top eligible listener is within a third of the threshold.
    NeedsMorePlays { user_id: i64, plays_needed: i64 },
    /// A new crown was created for the top listener.
    Claimed { crown: CrownRecord },
    /// The sitting holder keeps the crown (renewal or defended contest).
    Retained { crown: CrownRecord },
    /// The crown moved to a challenger.
    Stolen {
        crown: CrownRecord,
        previous_user_id: i64,
        previous_playcount: i64,
    },
    /// The holder's count could not be re-verified; the holder keeps the
    /// crown and the caller reports "could not confirm".
    VerificationFailed { crown: CrownRecord },
}

type ContestKey = (i64, String);

pub struct CrownLedger {
    store: Arc<dyn MusicStore>,
    source: Arc<dyn ListeningSource>,
    default_plays_for_crown: i64,
    /// Serializes contest resolution per (guild, artist) so two concurrent
    /// resolutions queue instead of racing the read-compare-write sequence.
    contest_locks: Mutex<HashMap<ContestKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CrownLedger {
    pub fn new(
        store: Arc<dyn MusicStore>,
        source: Arc<dyn ListeningSource>,
        default_plays_for_crown: i64,
    ) -> Self {
        Self {
            store,
            source,
            default_plays_for_crown,
            contest_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the crown for one artist given a current ranking of the
    /// guild's members.
    pub async fn resolve_crown(
        &self,
        ranking: &[RankedEntry],
        guild: &GuildConfig,
        members: &[GuildMember],
        artist: &str,
    ) -> Result<CrownOutcome> {
        let now = Utc::now();
        let eligible_ids = eligible_member_ids(guild, members, now);
        let threshold = guild
            .crown_min_playcount
            .unwrap_or(self.default_plays_for_crown);

        let Some(top) = ranking.iter().find(|e| eligible_ids.contains(&e.user_id)) else {
            return Ok(CrownOutcome::NoQualifyingListener);
        };

        if top.playcount < threshold {
            if top.playcount >= threshold / 3 {
                return Ok(CrownOutcome::NeedsMorePlays {
                    user_id: top.user_id,
                    plays_needed: threshold - top.playcount,
                });
            }
            return Ok(CrownOutcome::NoQualifyingListener);
        }

        let _contest_guard = self.lock_artist(guild.guild_id, artist).await;

        let mut holders = self.store.active_crowns(guild.guild_id, artist).await?;
        if holders.len() > 1 {
            bail!(
                "{} active crowns for guild {} artist {:?}, expected at most one",
                holders.len(),
                guild.guild_id,
                artist
            );
        }

        let Some(mut crown) = holders.pop() else {
            let crown = self
                .store
                .insert_crown(&NewCrown {
                    guild_id: guild.guild_id,
                    user_id: top.user_id,
                    artist_name: artist.to_string(),
                    active: true,
                    seeded: false,
                    start_playcount: top.playcount,
                    current_playcount: top.playcount,
                    created: now,
                    modified: now,
                })
                .await?;
            return Ok(CrownOutcome::Claimed { crown });
        };

        if crown.user_id == top.user_id {
            // renewal: counts only move up within a holding
            if crown.current_playcount < top.playcount {
                crown.current_playcount = top.playcount;
            }
            crown.seeded = false;
            crown.modified = now;
            self.store.update_crown(&crown).await?;
            return Ok(CrownOutcome::Retained { crown });
        }

        // Contest. Re-verify the holder against the source of truth rather
        // than trusting the (possibly stale) ranking.
        let holder = self
            .store
            .user_by_id(crown.user_id)
            .await?
            .with_context(|| format!("crown holder {} not found", crown.user_id))?;

        let verified = match self.source.artist_playcount(&holder.username, artist).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                tracing::warn!(
                    "no playcount for holder {} on {:?}, keeping crown",
                    holder.username,
                    artist
                );
                return Ok(CrownOutcome::VerificationFailed { crown });
            }
            Err(e) => {
                stats::inc(&stats::SOURCE_ERRORS);
                tracing::warn!(
                    "could not verify holder {} on {:?}: {}",
                    holder.username,
                    artist,
                    e
                );
                return Ok(CrownOutcome::VerificationFailed { crown });
            }
        };

        // carry the fresh count back into the holder's stored aggregate
        self.store
            .set_artist_playcount(crown.user_id, artist, verified)
            .await?;

        if eligible_ids.contains(&crown.user_id) && verified >= top.playcount {
            if crown.current_playcount < verified {
                crown.current_playcount = verified;
            }
            crown.modified = now;
            self.store.update_crown(&crown).await?;
            return Ok(CrownOutcome::Retained { crown });
        }

        let previous_playcount = crown.current_playcount;
        let previous_user_id = crown.user_id;
        crown.active = false;
        crown.modified = now;
        self.store.update_crown(&crown).await?;

        let new_crown = self
            .store
            .insert_crown(&NewCrown {
                guild_id: guild.guild_id,
                user_id: top.user_id,
                artist_name: artist.to_string(),
                active: true,
                seeded: false,
                start_playcount: top.playcount,
                current_playcount: top.playcount,
                created: now,
                modified: now,
            })
            .await?;

        stats::inc(&stats::CROWNS_TRANSFERRED);
        tracing::info!(
            "crown for {:?} in guild {} moved from {} to {}",
            artist,
            guild.guild_id,
            previous_user_id,
            top.user_id
        );

        Ok(CrownOutcome::Stolen {
            crown: new_crown,
            previous_user_id,
            previous_playcount,
        })
    }

    /// Rebuild the guild's seeded crowns from the stored aggregates: one row
    /// per artist for its top listener over the threshold. Organically earned
    /// crowns always win over seeding; previously seeded rows not recreated
    /// in this pass are removed.
    pub async fn seed_guild(&self, guild: &GuildConfig) -> Result<usize> {
        let min_playcount = guild
            .crown_min_playcount
            .unwrap_or(self.default_plays_for_crown);

        let existing = self.store.guild_crowns(guild.guild_id).await?;
        let candidates = self
            .store
            .crown_seed_candidates(guild.guild_id, min_playcount)
            .await?;

        let organic: HashSet<String> = existing
            .iter()
            .filter(|c| !c.seeded)
            .map(|c| c.artist_name.to_lowercase())
            .collect();

        let now = Utc::now();
        let rows: Vec<NewCrown> = candidates
            .iter()
            .filter(|c| !organic.contains(&c.artist_name.to_lowercase()))
            .map(|c| {
                let prior = existing.iter().find(|e| {
                    e.user_id == c.user_id && e.artist_name.eq_ignore_ascii_case(&c.artist_name)
                });
                NewCrown {
                    guild_id: guild.guild_id,
                    user_id: c.user_id,
                    artist_name: c.artist_name.clone(),
                    active: true,
                    seeded: true,
                    start_playcount: prior.map(|p| p.start_playcount).unwrap_or(c.playcount),
                    current_playcount: c.playcount,
                    created: prior.map(|p| p.created).unwrap_or(now),
                    modified: now,
                }
            })
            .collect();

        self.store.delete_seeded_crowns(guild.guild_id).await?;
        self.store.insert_crowns(&rows).await?;

        tracing::info!("seeded {} crowns for guild {}", rows.len(), guild.guild_id);
        Ok(rows.len())
    }

    // --- browse & maintenance ---

    pub async fn crowns_for_artist(&self, guild_id: i64, artist: &str) -> Result<Vec<CrownRecord>> {
        self.store.crowns_for_artist(guild_id, artist).await
    }

    pub async fn crowns_for_user(
        &self,
        guild_id: i64,
        user_id: i64,
        order: CrownOrder,
    ) -> Result<Vec<CrownRecord>> {
        self.store.crowns_for_user(guild_id, user_id, order).await
    }

    /// (user_id, active crown count), most crowns first.
    pub async fn top_crown_holders(&self, guild_id: i64) -> Result<Vec<(i64, i64)>> {
        self.store.top_crown_holders(guild_id).await
    }

    pub async fn active_crown_count(&self, guild_id: i64) -> Result<i64> {
        self.store.active_crown_count(guild_id).await
    }

    pub async fn remove_guild_crowns(&self, guild_id: i64) -> Result<u64> {
        self.store.remove_guild_crowns(guild_id).await
    }

    pub async fn remove_seeded_crowns(&self, guild_id: i64) -> Result<u64> {
        self.store.delete_seeded_crowns(guild_id).await
    }

    /// Drops all crown rows for a member who left the guild.
    pub async fn remove_member_crowns(&self, guild_id: i64, user_id: i64) -> Result<u64> {
        self.store.remove_member_crowns(guild_id, user_id).await
    }

    async fn lock_artist(&self, guild_id: i64, artist: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let key = (guild_id, artist.to_lowercase());
        let mutex = {
            let mut locks = self.contest_locks.lock().expect("contest lock map poisoned");
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

/// Members allowed to hold crowns: recently active when the guild configures
/// an activity threshold, not crown-blocked, and on the whitelist when the
/// guild gates on one (unset counts as whitelisted).
fn eligible_member_ids(
    guild: &GuildConfig,
    members: &[GuildMember],
    now: chrono::DateTime<Utc>,
) -> HashSet<i64> {
    members
        .iter()
        .filter(|m| {
            if let Some(days) = guild.crown_activity_threshold_days {
                let cutoff = now - chrono::Duration::days(days as i64);
                if !m.last_used.map(|at| at >= cutoff).unwrap_or(false) {
                    return false;
                }
            }
            if m.blocked_from_crowns {
                return false;
            }
            if guild.whitelist_enabled && m.whitelisted == Some(false) {
                return false;
            }
            true
        })
        .map(|m| m.user_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserType;
    use crate::source::testing::FakeSource;
    use crate::store::memory::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        source: Arc<FakeSource>,
        ledger: CrownLedger,
        guild: GuildConfig,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeSource::new());
        let ledger = CrownLedger::new(store.clone(), source.clone(), DEFAULT_PLAYS_FOR_CROWN);
        let guild = GuildConfig {
            guild_id: 1,
            ..GuildConfig::default()
        };
        Fixture {
            store,
            source,
            ledger,
            guild,
        }
    }

    fn member(user_id: i64, username: &str) -> GuildMember {
        GuildMember {
            guild_id: 1,
            user_id,
            username: username.to_string(),
            display_name: None,
            blocked_from_crowns: false,
            whitelisted: None,
            last_used: Some(Utc::now()),
        }
    }

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

    async fn active_crown(store: &MemoryStore, artist: &str) -> CrownRecord {
        let mut crowns = store.active_crowns(1, artist).await.unwrap();
        assert_eq!(crowns.len(), 1, "expected exactly one active crown");
        crowns.pop().unwrap()
    }

    #[tokio::test]
    async fn top_listener_over_threshold_claims_a_new_crown() {
        let f = fixture();
        f.store.add_user("alice", UserType::User);
        let members = vec![member(1, "alice")];
        let ranking = vec![entry(1, "alice", 44)];

        let outcome = f
            .ledger
            .resolve_crown(&ranking, &f.guild, &members, "Artist")
            .await
            .unwrap();

        let CrownOutcome::Claimed { crown } = outcome else {
            panic!("expected claim, got {outcome:?}");
        };
        assert_eq!(crown.user_id, 1);
        assert_eq!(crown.start_playcount, 44);
        assert_eq!(crown.current_playcount, 44);
        assert!(crown.active);
        assert!(!crown.seeded);
    }

    #[tokio::test]
    async fn near_threshold_listener_gets_a_needs_more_plays_hint() {
        let f = fixture();
        let members = vec![member(1, "alice")];

        // 10 of 30 plays: exactly a third, hint with the missing 20
        let outcome = f
            .ledger
            .resolve_crown(&[entry(1, "alice", 10)], &f.guild, &members, "Artist")
            .await
            .unwrap();
        let CrownOutcome::NeedsMorePlays {
            user_id,
            plays_needed,
        } = outcome
        else {
            panic!("expected hint, got {outcome:?}");
        };
        assert_eq!(user_id, 1);
        assert_eq!(plays_needed, 20);

        // 5 of 30: below a third, stay quiet
        let outcome = f
            .ledger
            .resolve_crown(&[entry(1, "alice", 5)], &f.guild, &members, "Artist")
            .await
            .unwrap();
        assert!(matches!(outcome, CrownOutcome::NoQualifyingListener));
        assert!(f.store.active_crowns(1, "Artist").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renewal_never_decreases_the_held_count() {
        let f = fixture();
        f.store.add_user("alice", UserType::User);
        let members = vec![member(1, "alice")];

        f.ledger
            .resolve_crown(&[entry(1, "alice", 50)], &f.guild, &members, "Artist")
            .await
            .unwrap();

        // a stale ranking with a lower count must not drag the crown down
        let outcome = f
            .ledger
            .resolve_crown(&[entry(1, "alice", 40)], &f.guild, &members, "Artist")
            .await
            .unwrap();
        assert!(matches!(outcome, CrownOutcome::Retained { .. }));
        assert_eq!(active_crown(&f.store, "Artist").await.current_playcount, 50);

        let outcome = f
            .ledger
            .resolve_crown(&[entry(1, "alice", 65)], &f.guild, &members, "Artist")
            .await
            .unwrap();
        assert!(matches!(outcome, CrownOutcome::Retained { .. }));
        assert_eq!(active_crown(&f.store, "Artist").await.current_playcount, 65);
    }

    #[tokio::test]
    async fn contest_with_fresher_holder_count_keeps_the_crown() {
        let f = fixture();
        f.store.add_user("holder", UserType::User);
        f.store.add_user("challenger", UserType::User);
        let members = vec![member(1, "holder"), member(2, "challenger")];

        f.ledger
            .resolve_crown(&[entry(1, "holder", 90)], &f.guild, &members, "Artist")
            .await
            .unwrap();

        // challenger's cached 100 loses to the holder's re-verified 120
        f.source.set_artist_playcount("holder", "Artist", Some(120));
        let ranking = vec![entry(2, "challenger", 100), entry(1, "holder", 90)];
        let outcome = f
            .ledger
            .resolve_crown(&ranking, &f.guild, &members, "Artist")
            .await
            .unwrap();

        let CrownOutcome::Retained { crown } = outcome else {
            panic!("expected retained, got {outcome:?}");
        };
        assert_eq!(crown.user_id, 1);
        assert_eq!(crown.current_playcount, 120);
        // the fresh count also lands in the holder's stored aggregate
        assert_eq!(f.store.user_artist_playcount(1, "Artist"), Some(120));
    }

    #[tokio::test]
    async fn contest_with_higher_challenger_count_transfers_the_crown() {
        let f = fixture();
        f.store.add_user("holder", UserType::User);
        f.store.add_user("challenger", UserType::User);
        let members = vec![member(1, "holder"), member(2, "challenger")];

        f.ledger
            .resolve_crown(&[entry(1, "holder", 80)], &f.guild, &members, "Artist")
            .await
            .unwrap();

        f.source.set_artist_playcount("holder", "Artist", Some(80));
        let ranking = vec![entry(2, "challenger", 150), entry(1, "holder", 80)];
        let outcome = f
            .ledger
            .resolve_crown(&ranking, &f.guild, &members, "Artist")
            .await
            .unwrap();

        let CrownOutcome::Stolen {
            crown,
            previous_user_id,
            previous_playcount,
        } = outcome
        else {
            panic!("expected transfer, got {outcome:?}");
        };
        assert_eq!(crown.user_id, 2);
        assert_eq!(crown.start_playcount, 150);
        assert_eq!(crown.current_playcount, 150);
        assert_eq!(previous_user_id, 1);
        assert_eq!(previous_playcount, 80);

        // old row preserved but inactive; exactly one active row remains
        let all = f.store.crowns_for_artist(1, "Artist").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|c| c.active).count(), 1);
    }

    #[tokio::test]
    async fn failed_verification_keeps_the_holder_and_says_so() {
        let f = fixture();
        f.store.add_user("holder", UserType::User);
        f.store.add_user("challenger", UserType::User);
        let members = vec![member(1, "holder"), member(2, "challenger")];

        f.ledger
            .resolve_crown(&[entry(1, "holder", 80)], &f.guild, &members, "Artist")
            .await
            .unwrap();

        f.source.data.lock().unwrap().fail_artist_playcount = true;
        let ranking = vec![entry(2, "challenger", 150)];
        let outcome = f
            .ledger
            .resolve_crown(&ranking, &f.guild, &members, "Artist")
            .await
            .unwrap();

        let CrownOutcome::VerificationFailed { crown } = outcome else {
            panic!("expected verification failure, got {outcome:?}");
        };
        assert_eq!(crown.user_id, 1);
        assert_eq!(active_crown(&f.store, "Artist").await.user_id, 1);
    }

    #[tokio::test]
    async fn blocked_and_inactive_members_cannot_take_crowns() {
        let f = fixture();
        let mut blocked = member(1, "blocked");
        blocked.blocked_from_crowns = true;
        let mut stale = member(2, "stale");
        stale.last_used = Some(Utc::now() - chrono::Duration::days(90));
        let fresh = member(3, "fresh");

        let guild = GuildConfig {
            guild_id: 1,
            crown_activity_threshold_days: Some(30),
            ..GuildConfig::default()
        };

        let ranking = vec![
            entry(1, "blocked", 500),
            entry(2, "stale", 400),
            entry(3, "fresh", 60),
        ];
        let outcome = f
            .ledger
            .resolve_crown(&ranking, &guild, &[blocked, stale, fresh], "Artist")
            .await
            .unwrap();

        let CrownOutcome::Claimed { crown } = outcome else {
            panic!("expected claim, got {outcome:?}");
        };
        assert_eq!(crown.user_id, 3);
    }

    #[tokio::test]
    async fn whitelist_gate_excludes_members_flagged_out() {
        let f = fixture();
        let mut outsider = member(1, "outsider");
        outsider.whitelisted = Some(false);
        let insider = member(2, "insider");

        let guild = GuildConfig {
            guild_id: 1,
            whitelist_enabled: true,
            ..GuildConfig::default()
        };

        let ranking = vec![entry(1, "outsider", 500), entry(2, "insider", 60)];
        let outcome = f
            .ledger
            .resolve_crown(&ranking, &guild, &[outsider, insider], "Artist")
            .await
            .unwrap();

        let CrownOutcome::Claimed { crown } = outcome else {
            panic!("expected claim, got {outcome:?}");
        };
        assert_eq!(crown.user_id, 2);
    }

    #[tokio::test]
    async fn duplicate_active_crowns_surface_as_an_error() {
        let f = fixture();
        let now = Utc::now();
        for user_id in [1, 2] {
            f.store
                .insert_crown(&NewCrown {
                    guild_id: 1,
                    user_id,
                    artist_name: "Artist".to_string(),
                    active: true,
                    seeded: false,
                    start_playcount: 10,
                    current_playcount: 10,
                    created: now,
                    modified: now,
                })
                .await
                .unwrap();
        }

        let members = vec![member(3, "someone")];
        let result = f
            .ledger
            .resolve_crown(&[entry(3, "someone", 99)], &f.guild, &members, "Artist")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_resolutions_for_one_artist_leave_one_active_crown() {
        let f = fixture();
        f.store.add_user("alice", UserType::User);
        let store = f.store.clone();
        let ledger = Arc::new(f.ledger);
        let guild = f.guild.clone();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = ledger.clone();
            let guild = guild.clone();
            handles.push(tokio::spawn(async move {
                let members = vec![member(1, "alice")];
                ledger
                    .resolve_crown(&[entry(1, "alice", 44)], &guild, &members, "Artist")
                    .await
            }));
        }

        let mut claims = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                CrownOutcome::Claimed { .. } => claims += 1,
                CrownOutcome::Retained { .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(claims, 1);
        assert_eq!(store.active_crowns(1, "Artist").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn seeding_respects_organic_crowns_and_drops_stale_seeds() {
        let f = fixture();
        let now = Utc::now();

        // organic crown for X, old seeded crown for Y
        f.store
            .insert_crown(&NewCrown {
                guild_id: 1,
                user_id: 1,
                artist_name: "X".to_string(),
                active: true,
                seeded: false,
                start_playcount: 40,
                current_playcount: 40,
                created: now,
                modified: now,
            })
            .await
            .unwrap();
        f.store
            .insert_crown(&NewCrown {
                guild_id: 1,
                user_id: 1,
                artist_name: "Y".to_string(),
                active: true,
                seeded: true,
                start_playcount: 35,
                current_playcount: 35,
                created: now,
                modified: now,
            })
            .await
            .unwrap();

        // aggregates now only support artists X and Z
        f.store.add_member(member(1, "alice"));
        f.store.add_member(member(2, "bob"));
        f.store.set_seed_candidates(1, &[(2, "X", 90), (2, "Z", 55)]);

        let seeded = f.ledger.seed_guild(&f.guild).await.unwrap();
        assert_eq!(seeded, 1);

        // organic crown for X untouched, stale seed for Y gone, Z seeded
        let x = active_crown(&f.store, "X").await;
        assert_eq!(x.user_id, 1);
        assert!(!x.seeded);
        assert!(f.store.active_crowns(1, "Y").await.unwrap().is_empty());
        let z = active_crown(&f.store, "Z").await;
        assert_eq!(z.user_id, 2);
        assert!(z.seeded);
        assert_eq!(z.start_playcount, 55);
    }

    #[tokio::test]
    async fn reseeding_preserves_history_for_a_repeat_holder() {
        let f = fixture();
        let created = Utc::now() - chrono::Duration::days(10);
        f.store
            .insert_crown(&NewCrown {
                guild_id: 1,
                user_id: 2,
                artist_name: "Z".to_string(),
                active: true,
                seeded: true,
                start_playcount: 31,
                current_playcount: 48,
                created,
                modified: created,
            })
            .await
            .unwrap();
        f.store.set_seed_candidates(1, &[(2, "Z", 55)]);

        f.ledger.seed_guild(&f.guild).await.unwrap();

        let z = active_crown(&f.store, "Z").await;
        assert_eq!(z.start_playcount, 31);
        assert_eq!(z.current_playcount, 55);
        assert_eq!(z.created, created);
    }
}
