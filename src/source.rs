//! Port and client for the external music-profile service.
//!
//! The wire format is the audioscrobbler-style REST API: one endpoint, a
//! `method` parameter per call, JSON responses with numbers encoded as
//! strings. All timestamps are UTC at second precision.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::stats;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source rejected credentials")]
    BadAuth,
    #[error("source rate limit hit")]
    RateLimited,
    #[error("source request timed out")]
    Timeout,
    #[error("source returned http status {0}")]
    Http(u16),
    #[error("source error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("could not parse source response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl SourceError {
    /// Everything except bad credentials is worth retrying on a later sync.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::BadAuth)
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else {
            SourceError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceProfile {
    pub registered_at: Option<DateTime<Utc>>,
    pub total_playcount: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SourcePlay {
    pub track_name: String,
    pub album_name: Option<String>,
    pub artist_name: String,
    /// Absent for a now-playing entry.
    pub played_at: Option<DateTime<Utc>>,
}

/// A page of recent plays plus the lifetime total the source reports with it.
#[derive(Debug, Clone, Default)]
pub struct RecentPlays {
    pub plays: Vec<SourcePlay>,
    pub total_playcount: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SourceArtist {
    pub name: String,
    pub playcount: i64,
}

#[derive(Debug, Clone)]
pub struct SourceAlbum {
    pub name: String,
    pub artist_name: String,
    pub playcount: i64,
}

#[derive(Debug, Clone)]
pub struct SourceTrack {
    pub name: String,
    pub artist_name: String,
    pub playcount: i64,
}

/// Abstract contract for the external listening source. The sync engine and
/// crown ledger only see this trait; tests substitute a fake.
#[async_trait]
pub trait ListeningSource: Send + Sync {
    async fn profile(&self, handle: &str) -> Result<SourceProfile, SourceError>;

    async fn recent_plays(
        &self,
        handle: &str,
        count: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<RecentPlays, SourceError>;

    async fn top_artists(
        &self,
        handle: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<SourceArtist>, SourceError>;

    async fn top_albums(
        &self,
        handle: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<SourceAlbum>, SourceError>;

    async fn top_tracks(
        &self,
        handle: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<SourceTrack>, SourceError>;

    /// The user's lifetime playcount for one artist, used to re-verify a
    /// contested crown against the source of truth.
    async fn artist_playcount(
        &self,
        handle: &str,
        artist: &str,
    ) -> Result<Option<i64>, SourceError>;
}

pub struct LastfmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LastfmClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value, SourceError> {
        let mut query: Vec<(&str, String)> = vec![
            ("method", method.to_string()),
            ("api_key", self.api_key.clone()),
            ("format", "json".to_string()),
        ];
        query.extend_from_slice(params);

        stats::inc(&stats::SOURCE_API_CALLS);

        let response = self.http.get(&self.base_url).query(&query).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            stats::inc(&stats::SOURCE_BAD_AUTH);
            return Err(SourceError::BadAuth);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        // The source reports api errors in the body with a 200 status.
        if let Some(code) = body.get("error").and_then(as_i64) {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(match code {
                // invalid key, invalid session, suspended key
                4 | 9 | 10 | 17 | 26 => {
                    stats::inc(&stats::SOURCE_BAD_AUTH);
                    SourceError::BadAuth
                }
                29 => SourceError::RateLimited,
                _ => SourceError::Api { code, message },
            });
        }

        if !status.is_success() {
            return Err(SourceError::Http(status.as_u16()));
        }

        Ok(body)
    }
}

#[async_trait]
impl ListeningSource for LastfmClient {
    async fn profile(&self, handle: &str) -> Result<SourceProfile, SourceError> {
        let body = self
            .call("user.getinfo", &[("user", handle.to_string())])
            .await?;

        let user = body
            .get("user")
            .ok_or_else(|| SourceError::Malformed("missing user object".to_string()))?;

        let registered_at = user
            .get("registered")
            .and_then(|r| r.get("unixtime"))
            .and_then(as_i64)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        Ok(SourceProfile {
            registered_at,
            total_playcount: user.get("playcount").and_then(as_i64),
        })
    }

    async fn recent_plays(
        &self,
        handle: &str,
        count: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<RecentPlays, SourceError> {
        let mut params = vec![
            ("user", handle.to_string()),
            ("limit", count.to_string()),
        ];
        if let Some(since) = since {
            params.push(("from", since.timestamp().to_string()));
        }

        let body = self.call("user.getrecenttracks", &params).await?;
        let recent = body
            .get("recenttracks")
            .ok_or_else(|| SourceError::Malformed("missing recenttracks".to_string()))?;

        let total_playcount = recent
            .get("@attr")
            .and_then(|a| a.get("total"))
            .and_then(as_i64);

        let plays = items(recent.get("track"))
            .iter()
            .map(|t| SourcePlay {
                track_name: text(t.get("name")),
                album_name: nested_text(t.get("album")).filter(|a| !a.is_empty()),
                artist_name: nested_text(t.get("artist")).unwrap_or_default(),
                played_at: t
                    .get("date")
                    .and_then(|d| d.get("uts"))
                    .and_then(as_i64)
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            })
            .collect();

        Ok(RecentPlays {
            plays,
            total_playcount,
        })
    }

    async fn top_artists(
        &self,
        handle: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<SourceArtist>, SourceError> {
        let body = self
            .call(
                "user.gettopartists",
                &[
                    ("user", handle.to_string()),
                    ("page", page.to_string()),
                    ("limit", page_size.to_string()),
                ],
            )
            .await?;

        Ok(items(body.get("topartists").and_then(|t| t.get("artist")))
            .iter()
            .map(|a| SourceArtist {
                name: text(a.get("name")),
                playcount: a.get("playcount").and_then(as_i64).unwrap_or(0),
            })
            .collect())
    }

    async fn top_albums(
        &self,
        handle: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<SourceAlbum>, SourceError> {
        let body = self
            .call(
                "user.gettopalbums",
                &[
                    ("user", handle.to_string()),
                    ("page", page.to_string()),
                    ("limit", page_size.to_string()),
                ],
            )
            .await?;

        Ok(items(body.get("topalbums").and_then(|t| t.get("album")))
            .iter()
            .map(|a| SourceAlbum {
                name: text(a.get("name")),
                artist_name: nested_text(a.get("artist")).unwrap_or_default(),
                playcount: a.get("playcount").and_then(as_i64).unwrap_or(0),
            })
            .collect())
    }

    async fn top_tracks(
        &self,
        handle: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<SourceTrack>, SourceError> {
        let body = self
            .call(
                "user.gettoptracks",
                &[
                    ("user", handle.to_string()),
                    ("page", page.to_string()),
                    ("limit", page_size.to_string()),
                ],
            )
            .await?;

        Ok(items(body.get("toptracks").and_then(|t| t.get("track")))
            .iter()
            .map(|t| SourceTrack {
                name: text(t.get("name")),
                artist_name: nested_text(t.get("artist")).unwrap_or_default(),
                playcount: t.get("playcount").and_then(as_i64).unwrap_or(0),
            })
            .collect())
    }

    async fn artist_playcount(
        &self,
        handle: &str,
        artist: &str,
    ) -> Result<Option<i64>, SourceError> {
        let body = self
            .call(
                "artist.getinfo",
                &[
                    ("artist", artist.to_string()),
                    ("username", handle.to_string()),
                ],
            )
            .await?;

        Ok(body
            .get("artist")
            .and_then(|a| a.get("stats"))
            .and_then(|s| s.get("userplaycount"))
            .and_then(as_i64))
    }
}

/// The source encodes numbers as strings in most payloads.
fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn text(v: Option<&Value>) -> String {
    v.and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

/// Artist/album fields arrive either as `{"#text": ..}` or `{"name": ..}`.
fn nested_text(v: Option<&Value>) -> Option<String> {
    let v = v?;
    v.get("#text")
        .or_else(|| v.get("name"))
        .and_then(|t| t.as_str())
        .map(String::from)
        .or_else(|| v.as_str().map(String::from))
}

/// A list field arrives as an array, a single object, or is absent.
fn items(v: Option<&Value>) -> Vec<Value> {
    match v {
        Some(Value::Array(arr)) => arr.clone(),
        Some(obj @ Value::Object(_)) => vec![obj.clone()],
        _ => Vec::new(),
    }
}

/// Scriptable in-memory source shared by the sync and crown test suites.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeData {
        pub registered_at: Option<DateTime<Utc>>,
        pub total_playcount: Option<i64>,
        /// Most recent first, as the live source returns them.
        pub plays: Vec<SourcePlay>,
        pub artists: Vec<SourceArtist>,
        pub albums: Vec<SourceAlbum>,
        pub tracks: Vec<SourceTrack>,
        /// (handle, artist) -> lifetime playcount, keys lowercased.
        pub artist_playcounts: HashMap<(String, String), Option<i64>>,
        pub fail_profile: bool,
        pub fail_recent: bool,
        pub fail_artists: bool,
        pub fail_albums: bool,
        pub fail_tracks: bool,
        pub fail_artist_playcount: bool,
    }

    #[derive(Default)]
    pub struct FakeSource {
        pub data: Mutex<FakeData>,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_artist_playcount(&self, handle: &str, artist: &str, playcount: Option<i64>) {
            self.data.lock().unwrap().artist_playcounts.insert(
                (handle.to_lowercase(), artist.to_lowercase()),
                playcount,
            );
        }
    }

    fn page<T: Clone>(rows: &[T], page: u32, page_size: u32) -> Vec<T> {
        let start = ((page - 1) * page_size) as usize;
        rows.iter().skip(start).take(page_size as usize).cloned().collect()
    }

    #[async_trait]
    impl ListeningSource for FakeSource {
        async fn profile(&self, _handle: &str) -> Result<SourceProfile, SourceError> {
            let data = self.data.lock().unwrap();
            if data.fail_profile {
                return Err(SourceError::Timeout);
            }
            Ok(SourceProfile {
                registered_at: data.registered_at,
                total_playcount: data.total_playcount,
            })
        }

        async fn recent_plays(
            &self,
            _handle: &str,
            count: u32,
            since: Option<DateTime<Utc>>,
        ) -> Result<RecentPlays, SourceError> {
            let data = self.data.lock().unwrap();
            if data.fail_recent {
                return Err(SourceError::Timeout);
            }
            let plays = data
                .plays
                .iter()
                .filter(|p| match (since, p.played_at) {
                    (Some(since), Some(at)) => at > since,
                    _ => true,
                })
                .take(count as usize)
                .cloned()
                .collect();
            Ok(RecentPlays {
                plays,
                total_playcount: data.total_playcount,
            })
        }

        async fn top_artists(
            &self,
            _handle: &str,
            page_no: u32,
            page_size: u32,
        ) -> Result<Vec<SourceArtist>, SourceError> {
            let data = self.data.lock().unwrap();
            if data.fail_artists {
                return Err(SourceError::Timeout);
            }
            Ok(page(&data.artists, page_no, page_size))
        }

        async fn top_albums(
            &self,
            _handle: &str,
            page_no: u32,
            page_size: u32,
        ) -> Result<Vec<SourceAlbum>, SourceError> {
            let data = self.data.lock().unwrap();
            if data.fail_albums {
                return Err(SourceError::Timeout);
            }
            Ok(page(&data.albums, page_no, page_size))
        }

        async fn top_tracks(
            &self,
            _handle: &str,
            page_no: u32,
            page_size: u32,
        ) -> Result<Vec<SourceTrack>, SourceError> {
            let data = self.data.lock().unwrap();
            if data.fail_tracks {
                return Err(SourceError::Timeout);
            }
            Ok(page(&data.tracks, page_no, page_size))
        }

        async fn artist_playcount(
            &self,
            handle: &str,
            artist: &str,
        ) -> Result<Option<i64>, SourceError> {
            let data = self.data.lock().unwrap();
            if data.fail_artist_playcount {
                return Err(SourceError::Timeout);
            }
            Ok(data
                .artist_playcounts
                .get(&(handle.to_lowercase(), artist.to_lowercase()))
                .copied()
                .flatten())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_parse_from_strings_and_numbers() {
        assert_eq!(as_i64(&json!("1234")), Some(1234));
        assert_eq!(as_i64(&json!(1234)), Some(1234));
        assert_eq!(as_i64(&json!("not a number")), None);
    }

    #[test]
    fn single_item_payload_becomes_one_element() {
        let single = json!({"name": "Only"});
        assert_eq!(items(Some(&single)).len(), 1);
        let many = json!([{"name": "A"}, {"name": "B"}]);
        assert_eq!(items(Some(&many)).len(), 2);
        assert!(items(None).is_empty());
    }

    #[test]
    fn nested_text_handles_both_shapes() {
        assert_eq!(
            nested_text(Some(&json!({"#text": "Artist"}))),
            Some("Artist".to_string())
        );
        assert_eq!(
            nested_text(Some(&json!({"name": "Artist"}))),
            Some("Artist".to_string())
        );
        assert_eq!(
            nested_text(Some(&json!("Artist"))),
            Some("Artist".to_string())
        );
    }

    #[test]
    fn bad_auth_is_not_transient() {
        assert!(!SourceError::BadAuth.is_transient());
        assert!(SourceError::Timeout.is_transient());
        assert!(SourceError::RateLimited.is_transient());
    }
}
