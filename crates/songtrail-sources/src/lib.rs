//! Chart and song source contracts plus live and fixture-backed source clients.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize};
use songtrail_core::{
    split_featuring, ChartEntry, FactValue, SourceFacts, SourceId, LINE_COUNT_FIELD, LYRICS_FIELD,
};
use songtrail_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "songtrail-sources";

const BILLBOARD_BASE_URL: &str = "https://www.billboard.com";
const AZLYRICS_BASE_URL: &str = "https://www.azlyrics.com";
const LYRICWIKI_BASE_URL: &str = "https://lyrics.fandom.com";
const GENIUS_API_URL: &str = "https://api.genius.com";
const SPOTIFY_API_URL: &str = "https://api.spotify.com/v1";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{source_id} fetch failed: {cause}")]
    Fetch {
        source_id: SourceId,
        #[source]
        cause: FetchError,
    },
    #[error("{source_id} response could not be parsed: {message}")]
    Parse { source_id: SourceId, message: String },
    #[error("{source_id} is not configured: {message}")]
    NotConfigured { source_id: SourceId, message: String },
    #[error("{source_id} fixture unreadable: {message}")]
    Fixture { source_id: SourceId, message: String },
}

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("no {chart} chart published for week {week}")]
    NotPublished { chart: String, week: NaiveDate },
    #[error("unknown chart `{0}`")]
    UnknownChart(String),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongQuery {
    pub artist: String,
    pub title: String,
    pub flatten_lyrics: bool,
}

impl SongQuery {
    pub fn new(artist: impl Into<String>, title: impl Into<String>, flatten_lyrics: bool) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            flatten_lyrics,
        }
    }
}

#[async_trait]
pub trait ChartSource: Send + Sync {
    fn source_id(&self) -> SourceId {
        SourceId::Billboard
    }

    fn supports_chart(&self, chart: &str) -> bool;

    /// Entries of one chart week, in rank order.
    async fn get_chart(&self, chart: &str, week: NaiveDate) -> Result<Vec<ChartEntry>, ChartError>;

    fn rewind_one_week(&self, week: NaiveDate) -> NaiveDate {
        rewind_one_week(week)
    }
}

#[async_trait]
pub trait SongSource: Send + Sync {
    fn source_id(&self) -> SourceId;

    /// Facts for one song. An empty result means the source had no match.
    async fn get_song_data(&self, query: &SongQuery) -> Result<SourceFacts, SourceError>;
}

pub fn rewind_one_week(week: NaiveDate) -> NaiveDate {
    week.checked_sub_days(Days::new(7)).unwrap_or(NaiveDate::MIN)
}

/// Chart ids are lowercase slugs such as `hot-100` or `r-b-hip-hop-songs`.
pub fn is_valid_chart_slug(chart: &str) -> bool {
    !chart.is_empty()
        && !chart.starts_with('-')
        && chart
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Lowercases lyrics and strips punctuation and line breaks.
pub fn flatten_lyrics(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn names_match(a: &str, b: &str) -> bool {
    normalize_name(a) == normalize_name(b)
}

fn finish_lyrics(raw: &str, flatten: bool) -> Option<String> {
    let text = if flatten { flatten_lyrics(raw) } else { raw.trim().to_string() };
    (!text.is_empty()).then_some(text)
}

/// Stores the lyrics and the line count of `raw`. Flattening joins lines, so the count is taken first.
fn insert_lyrics(facts: &mut SourceFacts, raw: &str, flatten: bool) -> bool {
    let Some(text) = finish_lyrics(raw, flatten) else {
        return false;
    };
    let lines = raw.lines().filter(|line| !line.trim().is_empty()).count();
    facts.insert(LYRICS_FIELD, text);
    facts.insert(LINE_COUNT_FIELD, lines as i64);
    true
}

fn parse_selector(source_id: SourceId, css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse {
        source_id,
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn select_first_text(
    source_id: SourceId,
    document: &Html,
    css: &str,
) -> Result<Option<String>, SourceError> {
    let sel = parse_selector(source_id, css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(element_text(n))))
}

fn fetch_error(source_id: SourceId) -> impl FnOnce(FetchError) -> SourceError {
    move |cause| SourceError::Fetch { source_id, cause }
}

fn url_with_params(
    source_id: SourceId,
    base: &str,
    params: &[(&str, String)],
) -> Result<Url, SourceError> {
    Url::parse_with_params(base, params).map_err(|e| SourceError::Parse {
        source_id,
        message: format!("building url from {base}: {e}"),
    })
}

/// Parses a chart week page. Rows carry `data-rank`, `data-artist` and `data-title`.
pub fn parse_chart_page(
    html: &str,
    chart: &str,
    week: NaiveDate,
) -> Result<Vec<ChartEntry>, SourceError> {
    let source_id = SourceId::Billboard;
    let document = Html::parse_document(html);
    let rows = parse_selector(source_id, "[data-rank][data-artist][data-title]")?;
    let peak = parse_selector(source_id, ".chart-list-item__peak")?;

    let mut entries = Vec::new();
    for row in document.select(&rows) {
        let attrs = row.value();
        let Some(rank) = attrs.attr("data-rank").and_then(|r| r.trim().parse::<u32>().ok()) else {
            continue;
        };
        let (artist, featuring) = split_featuring(attrs.attr("data-artist").unwrap_or_default());
        let title = attrs.attr("data-title").unwrap_or_default().trim().to_string();
        if artist.is_empty() || title.is_empty() {
            continue;
        }
        let peak_rank = row
            .select(&peak)
            .next()
            .and_then(|n| element_text(n).trim().parse::<u32>().ok())
            .unwrap_or(rank);
        entries.push(ChartEntry {
            artist,
            title,
            featuring,
            chart_name: chart.to_string(),
            rank,
            peak_rank,
            week,
        });
    }
    entries.sort_by_key(|e| e.rank);
    Ok(entries)
}

#[derive(Debug)]
pub struct BillboardChartClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl BillboardChartClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, BILLBOARD_BASE_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn chart_url(&self, chart: &str, week: NaiveDate) -> String {
        format!(
            "{}/charts/{}/{}",
            self.base_url.trim_end_matches('/'),
            chart,
            week.format("%Y-%m-%d")
        )
    }
}

#[async_trait]
impl ChartSource for BillboardChartClient {
    fn supports_chart(&self, chart: &str) -> bool {
        is_valid_chart_slug(chart)
    }

    async fn get_chart(&self, chart: &str, week: NaiveDate) -> Result<Vec<ChartEntry>, ChartError> {
        if !self.supports_chart(chart) {
            return Err(ChartError::UnknownChart(chart.to_string()));
        }
        let resp = match self.http.fetch_bytes("billboard", &self.chart_url(chart, week)).await {
            Ok(resp) => resp,
            Err(err) if err.is_not_found() => {
                return Err(ChartError::NotPublished {
                    chart: chart.to_string(),
                    week,
                })
            }
            Err(err) => return Err(fetch_error(SourceId::Billboard)(err).into()),
        };
        let entries = parse_chart_page(&resp.text(), chart, week)?;
        if entries.is_empty() {
            return Err(ChartError::NotPublished {
                chart: chart.to_string(),
                week,
            });
        }
        Ok(entries)
    }
}

/// Url slug used by AZLyrics: lowercase alphanumerics only, artist without a leading "The".
pub fn azlyrics_slug(input: &str, is_artist: bool) -> String {
    let lower = input.trim().to_lowercase();
    let lower = if is_artist {
        lower.strip_prefix("the ").unwrap_or(&lower).to_string()
    } else {
        lower
    };
    lower.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

pub fn parse_azlyrics_page(html: &str, flatten: bool) -> Result<SourceFacts, SourceError> {
    let source_id = SourceId::AzLyrics;
    let document = Html::parse_document(html);
    let mut facts = SourceFacts::empty(source_id);

    let lyrics_sel = parse_selector(source_id, "div.col-xs-12.col-lg-8.text-center > div:not([class])")?;
    let raw = document.select(&lyrics_sel).next().map(element_text);
    if !raw.is_some_and(|raw| insert_lyrics(&mut facts, &raw, flatten)) {
        return Ok(facts);
    }

    if let Some(album) = select_first_text(source_id, &document, ".songinalbum_title b")? {
        facts.insert("Album", album.trim_matches('"').to_string());
    }
    if let Some(header) = select_first_text(source_id, &document, ".songinalbum_title")? {
        if let Some(year) = header
            .rsplit_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(year, _)| year.trim())
            .filter(|year| year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()))
        {
            facts.insert("Year", year);
        }
    }

    let credits_sel = parse_selector(source_id, "div.smt small")?;
    for credit in document.select(&credits_sel) {
        let text = element_text(credit);
        if let Some((_, writers)) = text.split_once("Writer(s):") {
            let writers: Vec<String> = writers
                .split(',')
                .filter_map(|w| text_or_none(w.to_string()))
                .collect();
            if !writers.is_empty() {
                facts.insert("Written_By", writers);
            }
        }
    }

    if let Some(genre) = select_first_text(source_id, &document, ".songinalbum_genre")? {
        facts.insert("Genre", genre);
    }
    Ok(facts)
}

#[derive(Debug)]
pub struct AzLyricsClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl AzLyricsClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: AZLYRICS_BASE_URL.to_string(),
        }
    }

    pub fn song_url(&self, artist: &str, title: &str) -> String {
        format!(
            "{}/lyrics/{}/{}.html",
            self.base_url.trim_end_matches('/'),
            azlyrics_slug(artist, true),
            azlyrics_slug(title, false)
        )
    }
}

#[async_trait]
impl SongSource for AzLyricsClient {
    fn source_id(&self) -> SourceId {
        SourceId::AzLyrics
    }

    async fn get_song_data(&self, query: &SongQuery) -> Result<SourceFacts, SourceError> {
        let url = self.song_url(&query.artist, &query.title);
        match self.http.fetch_bytes("azlyrics", &url).await {
            Ok(resp) => parse_azlyrics_page(&resp.text(), query.flatten_lyrics),
            Err(err) if err.is_not_found() => Ok(SourceFacts::empty(SourceId::AzLyrics)),
            Err(err) => Err(fetch_error(SourceId::AzLyrics)(err)),
        }
    }
}

pub fn lyricwiki_page_name(artist: &str, title: &str) -> String {
    format!("{}:{}", artist.trim(), title.trim()).replace(' ', "_")
}

pub fn parse_lyricwiki_page(html: &str, flatten: bool) -> Result<SourceFacts, SourceError> {
    let source_id = SourceId::LyricWiki;
    let document = Html::parse_document(html);
    let sel = parse_selector(source_id, "div.lyricbox")?;
    let mut facts = SourceFacts::empty(source_id);
    if let Some(node) = document.select(&sel).next() {
        insert_lyrics(&mut facts, &element_text(node), flatten);
    }
    Ok(facts)
}

#[derive(Debug)]
pub struct LyricWikiClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl LyricWikiClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: LYRICWIKI_BASE_URL.to_string(),
        }
    }

    pub fn page_url(&self, artist: &str, title: &str) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| SourceError::Parse {
            source_id: SourceId::LyricWiki,
            message: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|_| SourceError::Parse {
                source_id: SourceId::LyricWiki,
                message: format!("{} cannot carry a path", self.base_url),
            })?
            .push("wiki")
            .push(&lyricwiki_page_name(artist, title));
        Ok(url)
    }
}

#[async_trait]
impl SongSource for LyricWikiClient {
    fn source_id(&self) -> SourceId {
        SourceId::LyricWiki
    }

    async fn get_song_data(&self, query: &SongQuery) -> Result<SourceFacts, SourceError> {
        let url = self.page_url(&query.artist, &query.title)?;
        match self.http.fetch_bytes("lyricwiki", url.as_str()).await {
            Ok(resp) => parse_lyricwiki_page(&resp.text(), query.flatten_lyrics),
            Err(err) if err.is_not_found() => Ok(SourceFacts::empty(SourceId::LyricWiki)),
            Err(err) => Err(fetch_error(SourceId::LyricWiki)(err)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GeniusSearch {
    response: GeniusSearchResponse,
}

#[derive(Debug, Deserialize)]
struct GeniusSearchResponse {
    #[serde(default)]
    hits: Vec<GeniusHit>,
}

#[derive(Debug, Deserialize)]
struct GeniusHit {
    result: GeniusSong,
}

#[derive(Debug, Deserialize)]
struct GeniusSong {
    id: i64,
    title: String,
    url: String,
    primary_artist: GeniusArtist,
}

#[derive(Debug, Deserialize)]
struct GeniusArtist {
    name: String,
}

/// Song id and page url of the first hit matching both artist and title.
pub fn pick_genius_hit(search: &GeniusSearch, artist: &str, title: &str) -> Option<(i64, String)> {
    search
        .response
        .hits
        .iter()
        .map(|hit| &hit.result)
        .find(|song| names_match(&song.title, title) && names_match(&song.primary_artist.name, artist))
        .map(|song| (song.id, song.url.clone()))
}

pub fn parse_genius_lyrics(html: &str, flatten: bool) -> Result<Option<String>, SourceError> {
    let source_id = SourceId::Genius;
    let document = Html::parse_document(html);
    let sel = parse_selector(source_id, "div[data-lyrics-container=\"true\"]")?;
    let raw = document
        .select(&sel)
        .map(|n| n.text().collect::<Vec<_>>().join("\n"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(finish_lyrics(&raw, flatten))
}

#[derive(Debug)]
pub struct GeniusClient {
    http: Arc<HttpFetcher>,
    token: Option<String>,
    api_url: String,
}

impl GeniusClient {
    pub fn new(http: Arc<HttpFetcher>, token: Option<String>) -> Self {
        Self {
            http,
            token,
            api_url: GENIUS_API_URL.to_string(),
        }
    }
}

#[async_trait]
impl SongSource for GeniusClient {
    fn source_id(&self) -> SourceId {
        SourceId::Genius
    }

    async fn get_song_data(&self, query: &SongQuery) -> Result<SourceFacts, SourceError> {
        let source_id = SourceId::Genius;
        let token = self.token.as_deref().ok_or_else(|| SourceError::NotConfigured {
            source_id,
            message: "GENIUS_TOKEN is not set".to_string(),
        })?;
        let url = url_with_params(
            source_id,
            &format!("{}/search", self.api_url),
            &[("q", format!("{} {}", query.artist, query.title))],
        )?;
        let search: GeniusSearch = self
            .http
            .fetch_json("genius", url.as_str(), Some(token))
            .await
            .map_err(fetch_error(source_id))?;

        let Some((song_id, page_url)) = pick_genius_hit(&search, &query.artist, &query.title) else {
            debug!(artist = %query.artist, title = %query.title, "no genius match");
            return Ok(SourceFacts::empty(source_id));
        };
        let page = self
            .http
            .fetch_bytes("genius", &page_url)
            .await
            .map_err(fetch_error(source_id))?;

        let mut facts = SourceFacts::empty(source_id);
        let raw = parse_genius_lyrics(&page.text(), false)?;
        if raw.is_some_and(|raw| insert_lyrics(&mut facts, &raw, query.flatten_lyrics)) {
            facts.insert("Song_ID", song_id);
            facts.insert("Url", page_url);
        }
        Ok(facts)
    }
}

#[derive(Debug, Deserialize)]
pub struct SpotifySearch {
    tracks: SpotifyTrackPage,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrackPage {
    #[serde(default)]
    items: Vec<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    name: String,
    #[serde(default)]
    popularity: i64,
    album: SpotifyAlbum,
    artists: Vec<SpotifyArtistRef>,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtistRef {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct SpotifyArtist {
    #[serde(default)]
    genres: Vec<String>,
    followers: SpotifyFollowers,
    #[serde(default)]
    popularity: i64,
}

#[derive(Debug, Deserialize)]
struct SpotifyFollowers {
    total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyTrackMatch {
    pub artist_id: String,
    pub release_date: String,
    pub popularity: i64,
}

/// Exact title and main-artist match among the search results.
pub fn pick_spotify_track(search: &SpotifySearch, artist: &str, title: &str) -> Option<SpotifyTrackMatch> {
    search.tracks.items.iter().find_map(|track| {
        let main = track.artists.first()?;
        (names_match(&track.name, title) && names_match(&main.name, artist)).then(|| SpotifyTrackMatch {
            artist_id: main.id.clone(),
            release_date: track.album.release_date.clone().unwrap_or_default(),
            popularity: track.popularity,
        })
    })
}

pub fn spotify_facts(track: &SpotifyTrackMatch, artist: &SpotifyArtist) -> SourceFacts {
    SourceFacts::empty(SourceId::Spotify)
        .with("Artist_ID", track.artist_id.as_str())
        .with("Release_Date", track.release_date.as_str())
        .with("Song_Popularity", track.popularity)
        .with("Genres", artist.genres.clone())
        .with("Artist_Followers", artist.followers.total)
        .with("Artist_Popularity", artist.popularity)
}

#[derive(Debug)]
pub struct SpotifyClient {
    http: Arc<HttpFetcher>,
    token: Option<String>,
    api_url: String,
}

impl SpotifyClient {
    pub fn new(http: Arc<HttpFetcher>, token: Option<String>) -> Self {
        Self {
            http,
            token,
            api_url: SPOTIFY_API_URL.to_string(),
        }
    }
}

#[async_trait]
impl SongSource for SpotifyClient {
    fn source_id(&self) -> SourceId {
        SourceId::Spotify
    }

    async fn get_song_data(&self, query: &SongQuery) -> Result<SourceFacts, SourceError> {
        let source_id = SourceId::Spotify;
        let token = self.token.as_deref().ok_or_else(|| SourceError::NotConfigured {
            source_id,
            message: "SPOTIFY_TOKEN is not set".to_string(),
        })?;
        let url = url_with_params(
            source_id,
            &format!("{}/search", self.api_url),
            &[
                ("q", format!("track:{} artist:{}", query.title, query.artist)),
                ("type", "track".to_string()),
                ("limit", "10".to_string()),
            ],
        )?;
        let search: SpotifySearch = self
            .http
            .fetch_json("spotify", url.as_str(), Some(token))
            .await
            .map_err(fetch_error(source_id))?;
        let Some(track) = pick_spotify_track(&search, &query.artist, &query.title) else {
            return Ok(SourceFacts::empty(source_id));
        };

        let artist_url = format!("{}/artists/{}", self.api_url, track.artist_id);
        let artist: SpotifyArtist = self
            .http
            .fetch_json("spotify", &artist_url, Some(token))
            .await
            .map_err(fetch_error(source_id))?;
        Ok(spotify_facts(&track, &artist))
    }
}

#[derive(Debug, Clone)]
pub struct SourceTokens {
    pub genius: Option<String>,
    pub spotify: Option<String>,
}

/// Live HTTP song sources in merge order.
pub fn live_song_sources(http: Arc<HttpFetcher>, tokens: &SourceTokens) -> Vec<Arc<dyn SongSource>> {
    SourceId::SONG_SOURCES
        .iter()
        .filter_map(|source_id| -> Option<Arc<dyn SongSource>> {
            match source_id {
                SourceId::Genius => Some(Arc::new(GeniusClient::new(http.clone(), tokens.genius.clone()))),
                SourceId::LyricWiki => Some(Arc::new(LyricWikiClient::new(http.clone()))),
                SourceId::AzLyrics => Some(Arc::new(AzLyricsClient::new(http.clone()))),
                SourceId::Spotify => Some(Arc::new(SpotifyClient::new(http.clone(), tokens.spotify.clone()))),
                SourceId::Billboard => None,
            }
        })
        .collect()
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureChartWeek {
    entries: Vec<FixtureChartRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureChartRow {
    rank: u32,
    artist: String,
    title: String,
    #[serde(default)]
    peak_rank: Option<u32>,
}

/// Chart weeks captured as `<root>/charts/<chart>/<YYYY-MM-DD>.json`.
#[derive(Debug, Clone)]
pub struct FixtureChartSource {
    root: PathBuf,
}

impl FixtureChartSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn week_path(&self, chart: &str, week: NaiveDate) -> PathBuf {
        self.root
            .join("charts")
            .join(chart)
            .join(format!("{}.json", week.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl ChartSource for FixtureChartSource {
    fn supports_chart(&self, chart: &str) -> bool {
        is_valid_chart_slug(chart) && self.root.join("charts").join(chart).is_dir()
    }

    async fn get_chart(&self, chart: &str, week: NaiveDate) -> Result<Vec<ChartEntry>, ChartError> {
        if !self.supports_chart(chart) {
            return Err(ChartError::UnknownChart(chart.to_string()));
        }
        let path = self.week_path(chart, week);
        if !path.exists() {
            return Err(ChartError::NotPublished {
                chart: chart.to_string(),
                week,
            });
        }
        let fixture: FixtureChartWeek = read_json_file(&path).map_err(|e| SourceError::Fixture {
            source_id: SourceId::Billboard,
            message: format!("{e:#}"),
        })?;

        let mut entries: Vec<ChartEntry> = fixture
            .entries
            .into_iter()
            .map(|row| {
                let (artist, featuring) = split_featuring(&row.artist);
                ChartEntry {
                    artist,
                    title: row.title,
                    featuring,
                    chart_name: chart.to_string(),
                    rank: row.rank,
                    peak_rank: row.peak_rank.unwrap_or(row.rank),
                    week,
                }
            })
            .collect();
        entries.sort_by_key(|e| e.rank);
        Ok(entries)
    }
}

/// Song facts captured as `<root>/songs/<source>.json`, keyed by song key.
#[derive(Debug, Clone)]
pub struct FixtureSongSource {
    source_id: SourceId,
    facts: BTreeMap<String, BTreeMap<String, FactValue>>,
}

impl FixtureSongSource {
    pub fn fixture_path(root: &Path, source_id: SourceId) -> PathBuf {
        root.join("songs")
            .join(format!("{}.json", source_id.short_name().to_lowercase()))
    }

    /// A missing fixture file yields a source that never matches.
    pub fn load(root: &Path, source_id: SourceId) -> Result<Self> {
        let path = Self::fixture_path(root, source_id);
        let facts = if path.exists() {
            read_json_file(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { source_id, facts })
    }
}

#[async_trait]
impl SongSource for FixtureSongSource {
    fn source_id(&self) -> SourceId {
        self.source_id
    }

    async fn get_song_data(&self, query: &SongQuery) -> Result<SourceFacts, SourceError> {
        let key = format!("{}_{}", query.artist, query.title);
        let mut facts = SourceFacts::empty(self.source_id);
        let Some(fields) = self.facts.get(&key) else {
            return Ok(facts);
        };
        for (name, value) in fields {
            match value {
                FactValue::Text(text) if name == LYRICS_FIELD => {
                    insert_lyrics(&mut facts, text, query.flatten_lyrics);
                }
                other => {
                    facts.fields.insert(name.clone(), other.clone());
                }
            }
        }
        Ok(facts)
    }
}

/// Fixture-backed song sources in merge order.
pub fn fixture_song_sources(root: &Path) -> Result<Vec<Arc<dyn SongSource>>> {
    SourceId::SONG_SOURCES
        .iter()
        .map(|source_id| -> Result<Arc<dyn SongSource>> {
            Ok(Arc::new(FixtureSongSource::load(root, *source_id)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 10, 13).unwrap()
    }

    const CHART_HTML: &str = r#"
        <html><body>
          <div class="chart-list-item" data-rank="2" data-artist="Maroon 5 Featuring Cardi B" data-title="Girls Like You">
            <div class="chart-list-item__peak">1</div>
          </div>
          <div class="chart-list-item" data-rank="1" data-artist="Drake" data-title="In My Feelings"></div>
          <div class="chart-list-item" data-rank="x" data-artist="Broken" data-title="Row"></div>
        </body></html>
    "#;

    #[test]
    fn chart_page_rows_are_parsed_in_rank_order() {
        let entries = parse_chart_page(CHART_HTML, "hot-100", week()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].artist, "Drake");
        assert_eq!(entries[0].peak_rank, 1);
        assert_eq!(entries[1].artist, "Maroon 5");
        assert_eq!(entries[1].featuring.as_deref(), Some("Cardi B"));
        assert_eq!(entries[1].rank, 2);
        assert_eq!(entries[1].peak_rank, 1);
        assert!(entries.iter().all(|e| e.week == week() && e.chart_name == "hot-100"));
    }

    const AZ_HTML: &str = r#"
        <html><body>
          <div class="col-xs-12 col-lg-8 text-center">
            <div class="ringtone">ringtone</div>
            <div class="div-share"><h1>"In My Feelings" lyrics</h1></div>
            <div>
              Kiki, do you love me?<br>
              Are you riding?
            </div>
            <div class="smt"><small>Writer(s): Aubrey Graham, Matthew Samuels</small></div>
            <div class="songinalbum_title">album: <b>"Scorpion"</b> (2018)</div>
          </div>
        </body></html>
    "#;

    #[test]
    fn azlyrics_page_yields_lyrics_album_year_and_writers() {
        let facts = parse_azlyrics_page(AZ_HTML, true).unwrap();
        assert_eq!(facts.lyrics(), Some("kiki do you love me are you riding"));
        assert_eq!(facts.get("Album"), Some(&FactValue::from("Scorpion")));
        assert_eq!(facts.get("Year"), Some(&FactValue::from("2018")));
        assert_eq!(
            facts.get("Written_By"),
            Some(&FactValue::from(vec![
                "Aubrey Graham".to_string(),
                "Matthew Samuels".to_string()
            ]))
        );
    }

    #[test]
    fn azlyrics_page_without_lyrics_is_an_empty_match() {
        let facts = parse_azlyrics_page("<html><body><p>Not found</p></body></html>", true).unwrap();
        assert!(facts.is_empty());
    }

    #[test]
    fn azlyrics_slugs_drop_leading_article_and_punctuation() {
        assert_eq!(azlyrics_slug("The Weeknd", true), "weeknd");
        assert_eq!(azlyrics_slug("Can't Feel My Face", false), "cantfeelmyface");
    }

    #[test]
    fn genius_hit_requires_artist_and_title_match() {
        let search: GeniusSearch = serde_json::from_value(serde_json::json!({
            "response": {"hits": [
                {"result": {"id": 1, "title": "In My Feelings (Remix)", "url": "https://genius.com/a",
                            "primary_artist": {"name": "Drake"}}},
                {"result": {"id": 2, "title": "In My Feelings", "url": "https://genius.com/b",
                            "primary_artist": {"name": "Drake"}}}
            ]}
        }))
        .unwrap();
        assert_eq!(
            pick_genius_hit(&search, "Drake", "in my feelings"),
            Some((2, "https://genius.com/b".to_string()))
        );
        assert_eq!(pick_genius_hit(&search, "Future", "In My Feelings"), None);
    }

    #[test]
    fn genius_lyrics_containers_are_joined() {
        let html = r#"<div data-lyrics-container="true">Line one</div>
                      <div data-lyrics-container="true">Line two</div>"#;
        let lyrics = parse_genius_lyrics(html, false).unwrap().unwrap();
        assert_eq!(lyrics, "Line one\nLine two");
        assert_eq!(parse_genius_lyrics("<p>nothing</p>", false).unwrap(), None);
    }

    #[test]
    fn line_count_is_taken_before_flattening() {
        let html = "<div class=\"lyricbox\">Line one,\nLine two!\n\nLine three</div>";
        let flat = parse_lyricwiki_page(html, true).unwrap();
        assert_eq!(flat.lyrics(), Some("line one line two line three"));
        assert_eq!(flat.lyric_line_count(), Some(3));

        let raw = parse_lyricwiki_page(html, false).unwrap();
        assert_eq!(raw.lyric_line_count(), Some(3));
    }

    #[test]
    fn lyricwiki_lyricbox_is_extracted() {
        let facts = parse_lyricwiki_page(r#"<div class="lyricbox">Hello, World!</div>"#, true).unwrap();
        assert_eq!(facts.lyrics(), Some("hello world"));
        assert_eq!(lyricwiki_page_name("Ella Mai", "Boo'd Up"), "Ella_Mai:Boo'd_Up");
    }

    #[test]
    fn spotify_track_and_artist_become_facts() {
        let search: SpotifySearch = serde_json::from_value(serde_json::json!({
            "tracks": {"items": [
                {"name": "Girls Like You (feat. Cardi B)", "popularity": 80,
                 "album": {"release_date": "2018-05-30"}, "artists": [{"id": "x", "name": "Maroon 5"}]},
                {"name": "Girls Like You", "popularity": 85,
                 "album": {"release_date": "2017-11-03"}, "artists": [{"id": "04gDigrS5kc9YWfZHwBETP", "name": "Maroon 5"}]}
            ]}
        }))
        .unwrap();
        let track = pick_spotify_track(&search, "Maroon 5", "Girls Like You").unwrap();
        assert_eq!(track.artist_id, "04gDigrS5kc9YWfZHwBETP");

        let artist: SpotifyArtist = serde_json::from_value(serde_json::json!({
            "genres": ["pop"], "followers": {"total": 29000000}, "popularity": 90
        }))
        .unwrap();
        let facts = spotify_facts(&track, &artist);
        assert_eq!(facts.get("Song_Popularity"), Some(&FactValue::Integer(85)));
        assert_eq!(facts.get("Release_Date"), Some(&FactValue::from("2017-11-03")));
        assert_eq!(facts.get("Genres"), Some(&FactValue::from(vec!["pop".to_string()])));
        assert_eq!(facts.get("Artist_Followers"), Some(&FactValue::Integer(29_000_000)));
    }

    #[test]
    fn flattening_removes_case_punctuation_and_newlines() {
        assert_eq!(flatten_lyrics("Hello,\nWORLD!  It's me"), "hello world its me");
        assert_eq!(flatten_lyrics("  \n "), "");
    }

    #[test]
    fn rewinding_steps_back_exactly_one_week() {
        assert_eq!(rewind_one_week(week()), NaiveDate::from_ymd_opt(2018, 10, 6).unwrap());
        assert_eq!(
            rewind_one_week(NaiveDate::from_ymd_opt(2018, 1, 3).unwrap()),
            NaiveDate::from_ymd_opt(2017, 12, 27).unwrap()
        );
    }

    #[test]
    fn chart_slugs_are_lowercase_and_dashed() {
        assert!(is_valid_chart_slug("hot-100"));
        assert!(is_valid_chart_slug("r-b-hip-hop-songs"));
        assert!(!is_valid_chart_slug("Hot 100"));
        assert!(!is_valid_chart_slug(""));
        assert!(!is_valid_chart_slug("-hot"));
    }

    #[tokio::test]
    async fn fixture_chart_source_distinguishes_missing_week_from_unknown_chart() {
        let dir = tempdir().unwrap();
        let chart_dir = dir.path().join("charts").join("hot-100");
        fs::create_dir_all(&chart_dir).unwrap();
        fs::write(
            chart_dir.join("2018-10-13.json"),
            r#"{"entries": [{"rank": 2, "artist": "B", "title": "Two"},
                            {"rank": 1, "artist": "A Featuring C", "title": "One", "peak_rank": 1}]}"#,
        )
        .unwrap();
        let source = FixtureChartSource::new(dir.path());

        let entries = source.get_chart("hot-100", week()).await.unwrap();
        assert_eq!(entries[0].title, "One");
        assert_eq!(entries[0].featuring.as_deref(), Some("C"));
        assert_eq!(entries[1].peak_rank, 2);

        let missing = source.get_chart("hot-100", rewind_one_week(week())).await;
        assert!(matches!(missing, Err(ChartError::NotPublished { .. })));
        let unknown = source.get_chart("country-songs", week()).await;
        assert!(matches!(unknown, Err(ChartError::UnknownChart(_))));
    }

    #[tokio::test]
    async fn fixture_song_source_flattens_lyrics_on_request() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("songs")).unwrap();
        fs::write(
            dir.path().join("songs").join("genius.json"),
            r#"{"Drake_In My Feelings": {"Lyrics": "Kiki, do you love me?", "Song_ID": 3876994}}"#,
        )
        .unwrap();
        let source = FixtureSongSource::load(dir.path(), SourceId::Genius).unwrap();

        let facts = source
            .get_song_data(&SongQuery::new("Drake", "In My Feelings", true))
            .await
            .unwrap();
        assert_eq!(facts.lyrics(), Some("kiki do you love me"));
        assert_eq!(facts.lyric_line_count(), Some(1));
        assert_eq!(facts.get("Song_ID"), Some(&FactValue::Integer(3876994)));

        let none = source
            .get_song_data(&SongQuery::new("Drake", "Nice For What", true))
            .await
            .unwrap();
        assert!(none.is_empty());

        let absent = FixtureSongSource::load(dir.path(), SourceId::Spotify).unwrap();
        assert!(absent
            .get_song_data(&SongQuery::new("Drake", "In My Feelings", true))
            .await
            .unwrap()
            .is_empty());
    }
}
