use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crownboard::leaderboard::{self, LeaderboardWindow, TrackOrder};
use crownboard::models::GuildConfig;
use crownboard::store::CrownOrder;
use crownboard::{
    db, stats, Config, CrownLedger, CrownOutcome, LastfmClient, MusicStore, PgStore,
    PlaytimeEstimator, SyncEngine, SyncOutcome,
};

#[derive(Parser)]
#[command(name = "crownctl")]
#[command(about = "sync listening history and run guild crown contests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a user's listening history, or all users
    Sync {
        /// User id to sync, or "all"
        #[arg(value_name = "USER")]
        user: String,

        /// Number of concurrent syncs
        #[arg(short, long, default_value_t = 10)]
        parallelism: usize,

        /// Milliseconds of start stagger between queued syncs
        #[arg(long, default_value_t = 250)]
        stagger_ms: u64,
    },

    /// Rank a guild's listeners for an artist or track
    WhoKnows {
        guild_id: i64,
        artist: String,

        /// Rank a single track instead of the artist
        #[arg(short, long)]
        track: Option<String>,
    },

    /// Resolve the crown contest for one artist in a guild
    Crown { guild_id: i64, artist: String },

    /// Rebuild a guild's seeded crowns from stored playcounts
    Seed { guild_id: i64 },

    /// Browse a guild's crowns
    Crowns {
        guild_id: i64,

        /// Show one member's crowns instead of the holder leaderboard
        #[arg(short, long)]
        user: Option<i64>,

        /// Show the ownership history for one artist
        #[arg(short, long)]
        artist: Option<String>,

        /// Order a member's crowns by claim date instead of playcount
        #[arg(long)]
        by_date: bool,
    },

    /// Rank a guild's members by estimated listening time
    Playtime { guild_id: i64 },

    /// Guild-wide top tracks
    TopTracks {
        guild_id: i64,

        /// Order by listener count instead of total playcount
        #[arg(long)]
        by_listeners: bool,
    },

    /// Print process counters
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("crownctl=info,crownboard=info")
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pool = db::init_db(&config.database_url).await?;
    let store: Arc<dyn MusicStore> = Arc::new(PgStore::new(pool));
    let source = Arc::new(LastfmClient::new(
        &config.source_base_url,
        &config.source_api_key,
    ));

    match cli.command {
        Commands::Sync {
            user,
            parallelism,
            stagger_ms,
        } => handle_sync(&config, store, source, &user, parallelism, stagger_ms).await,
        Commands::WhoKnows {
            guild_id,
            artist,
            track,
        } => handle_who_knows(store, guild_id, &artist, track.as_deref()).await,
        Commands::Crown { guild_id, artist } => {
            let ledger = CrownLedger::new(store.clone(), source, config.default_plays_for_crown);
            handle_crown(store, ledger, guild_id, &artist).await
        }
        Commands::Seed { guild_id } => {
            let ledger = CrownLedger::new(store.clone(), source, config.default_plays_for_crown);
            handle_seed(store, ledger, guild_id).await
        }
        Commands::Crowns {
            guild_id,
            user,
            artist,
            by_date,
        } => handle_crowns(store, guild_id, user, artist.as_deref(), by_date).await,
        Commands::Playtime { guild_id } => handle_playtime(store, guild_id).await,
        Commands::TopTracks {
            guild_id,
            by_listeners,
        } => handle_top_tracks(store, guild_id, by_listeners).await,
        Commands::Stats => {
            let snapshot = stats::snapshot();
            println!("source api calls:   {}", snapshot.source_api_calls);
            println!("source errors:      {}", snapshot.source_errors);
            println!("source bad auth:    {}", snapshot.source_bad_auth);
            println!("indexed users:      {}", snapshot.indexed_users);
            println!("crowns transferred: {}", snapshot.crowns_transferred);
            Ok(())
        }
    }
}

async fn handle_sync(
    config: &Config,
    store: Arc<dyn MusicStore>,
    source: Arc<LastfmClient>,
    user: &str,
    parallelism: usize,
    stagger_ms: u64,
) -> Result<()> {
    let engine = Arc::new(SyncEngine::new(
        source,
        store.clone(),
        config.play_retention_days,
    ));

    let user_ids = if user == "all" {
        store.user_ids().await?
    } else {
        vec![user.parse().context("USER must be a user id or \"all\"")?]
    };

    let total = user_ids.len();
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let skipped = Arc::new(AtomicUsize::new(0));

    stream::iter(user_ids.into_iter().enumerate())
        .map(|(position, user_id)| {
            let engine = engine.clone();
            let completed = completed.clone();
            let failed = failed.clone();
            let skipped = skipped.clone();
            let delay = Duration::from_millis(stagger_ms * position as u64);

            async move {
                match engine.sync_user(user_id, delay).await {
                    Ok(SyncOutcome::Completed(summary)) => {
                        let current = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::info!(
                            "[{}/{}] synced user {}: {} artists, {} albums, {} tracks, {} plays",
                            current,
                            total,
                            user_id,
                            summary.artists,
                            summary.albums,
                            summary.tracks,
                            summary.plays
                        );
                    }
                    Ok(SyncOutcome::AlreadyRunning) => {
                        skipped.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::SeqCst);
                        tracing::error!("failed to sync user {}: {}", user_id, e);
                    }
                }
            }
        })
        .buffer_unordered(parallelism)
        .collect::<Vec<_>>()
        .await;

    tracing::info!(
        "sync run complete: {} synced, {} failed, {} already running",
        completed.load(Ordering::SeqCst),
        failed.load(Ordering::SeqCst),
        skipped.load(Ordering::SeqCst)
    );
    Ok(())
}

async fn handle_who_knows(
    store: Arc<dyn MusicStore>,
    guild_id: i64,
    artist: &str,
    track: Option<&str>,
) -> Result<()> {
    let ranking = match track {
        Some(track) => {
            leaderboard::who_knows_track(store.as_ref(), guild_id, artist, track).await?
        }
        None => leaderboard::who_knows_artist(store.as_ref(), guild_id, artist).await?,
    };

    if ranking.is_empty() {
        println!("nobody in this guild has plays for that");
        return Ok(());
    }
    print_window(&leaderboard::window(&ranking));
    Ok(())
}

async fn handle_crown(
    store: Arc<dyn MusicStore>,
    ledger: CrownLedger,
    guild_id: i64,
    artist: &str,
) -> Result<()> {
    let guild = store
        .guild_config(guild_id)
        .await?
        .unwrap_or(GuildConfig {
            guild_id,
            ..GuildConfig::default()
        });
    let members = store.guild_members(guild_id).await?;
    let ranking = leaderboard::who_knows_artist(store.as_ref(), guild_id, artist).await?;

    match ledger
        .resolve_crown(&ranking, &guild, &members, artist)
        .await?
    {
        CrownOutcome::NoQualifyingListener => {
            println!("no qualifying listener for {artist}");
        }
        CrownOutcome::NeedsMorePlays {
            user_id,
            plays_needed,
        } => {
            println!("user {user_id} needs {plays_needed} more plays to claim {artist}");
        }
        CrownOutcome::Claimed { crown } => {
            println!(
                "crown for {artist} claimed by user {} with {} plays",
                crown.user_id, crown.current_playcount
            );
        }
        CrownOutcome::Retained { crown } => {
            println!(
                "user {} keeps the crown for {artist} with {} plays",
                crown.user_id, crown.current_playcount
            );
        }
        CrownOutcome::Stolen {
            crown,
            previous_user_id,
            previous_playcount,
        } => {
            println!(
                "crown for {artist} stolen by user {} ({} plays) from user {} ({} plays)",
                crown.user_id, crown.current_playcount, previous_user_id, previous_playcount
            );
        }
        CrownOutcome::VerificationFailed { crown } => {
            println!(
                "could not confirm the current playcount for user {}, crown unchanged",
                crown.user_id
            );
        }
    }
    Ok(())
}

async fn handle_seed(
    store: Arc<dyn MusicStore>,
    ledger: CrownLedger,
    guild_id: i64,
) -> Result<()> {
    let guild = store
        .guild_config(guild_id)
        .await?
        .unwrap_or(GuildConfig {
            guild_id,
            ..GuildConfig::default()
        });
    let seeded = ledger.seed_guild(&guild).await?;
    println!("seeded {seeded} crowns for guild {guild_id}");
    Ok(())
}

async fn handle_crowns(
    store: Arc<dyn MusicStore>,
    guild_id: i64,
    user: Option<i64>,
    artist: Option<&str>,
    by_date: bool,
) -> Result<()> {
    if let Some(artist) = artist {
        let history = store.crowns_for_artist(guild_id, artist).await?;
        for crown in history {
            let state = if crown.active { "active" } else { "lost" };
            println!(
                "{}  user {}  {} -> {} plays  {}",
                crown.created.format("%Y-%m-%d"),
                crown.user_id,
                crown.start_playcount,
                crown.current_playcount,
                state
            );
        }
        return Ok(());
    }

    if let Some(user_id) = user {
        let order = if by_date {
            CrownOrder::Created
        } else {
            CrownOrder::Playcount
        };
        let crowns = store.crowns_for_user(guild_id, user_id, order).await?;
        for crown in crowns {
            println!(
                "{}  {} plays  since {}",
                crown.artist_name,
                crown.current_playcount,
                crown.created.format("%Y-%m-%d")
            );
        }
        return Ok(());
    }

    let total = store.active_crown_count(guild_id).await?;
    println!("{total} active crowns in guild {guild_id}");
    for (position, (user_id, count)) in store
        .top_crown_holders(guild_id)
        .await?
        .iter()
        .enumerate()
    {
        println!("{}. user {user_id}: {count} crowns", position + 1);
    }
    Ok(())
}

async fn handle_playtime(store: Arc<dyn MusicStore>, guild_id: i64) -> Result<()> {
    let estimator = PlaytimeEstimator::new(store.clone());
    let ranking =
        leaderboard::listening_time_leaderboard(store.as_ref(), &estimator, guild_id).await?;
    if ranking.is_empty() {
        println!("no stored plays for this guild");
        return Ok(());
    }
    print_window(&leaderboard::window(&ranking));
    Ok(())
}

async fn handle_top_tracks(
    store: Arc<dyn MusicStore>,
    guild_id: i64,
    by_listeners: bool,
) -> Result<()> {
    let order = if by_listeners {
        TrackOrder::Listeners
    } else {
        TrackOrder::Playcount
    };
    let tracks = leaderboard::top_tracks_for_guild(store.as_ref(), guild_id, order).await?;
    for (position, track) in tracks.iter().enumerate() {
        println!(
            "{}. {} - {}  {} plays, {} listeners",
            position + 1,
            track.artist_name,
            track.track_name,
            track.playcount,
            track.listener_count
        );
    }
    Ok(())
}

fn print_window(window: &LeaderboardWindow) {
    for (position, entry) in &window.rows {
        let label = entry.display_name.as_deref().unwrap_or(&entry.username);
        println!("{position}. {label}  {}  {}", entry.name, entry.playcount);
    }
    if let Some((rank, entry)) = &window.trailing {
        let label = entry.display_name.as_deref().unwrap_or(&entry.username);
        match rank {
            Some(rank) => println!("{rank}. {label}  {}  {}", entry.name, entry.playcount),
            None => println!("...  {label}  {}  {}", entry.name, entry.playcount),
        }
    }
}
