use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use songtrail_core::{SongKey, SourceId};
use songtrail_storage::InMemoryRecordStore;
use songtrail_sync::{
    build_collaborators, EnvSettings, RunConfig, RunState, SourceMode, WeeklyOrchestrator,
};
use tempfile::tempdir;

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn fixture_config(output_dir: PathBuf) -> RunConfig {
    RunConfig {
        charts: vec!["hot-100".to_string(), "rap-song".to_string()],
        start_date: NaiveDate::from_ymd_opt(2018, 10, 13).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2018, 9, 29).unwrap(),
        use_elastic_search: false,
        max_entries: 0,
        max_threads: 2,
        output_dir,
        flatten_lyrics: true,
        call_timeout_secs: 5.0,
        source_mode: SourceMode::Fixture,
        fixtures_dir: fixtures_root(),
    }
}

fn read_json(path: PathBuf) -> serde_json::Value {
    let text = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn fixture_walk_writes_one_file_per_published_chart_week() {
    let dir = tempdir().unwrap();
    let config = fixture_config(dir.path().to_path_buf());
    let collaborators = build_collaborators(&config, &EnvSettings::from_env()).unwrap();
    let orchestrator = WeeklyOrchestrator::new(config, collaborators).unwrap();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.final_state, RunState::PastStopDate);
    assert_eq!(summary.weeks_processed, 2);
    assert_eq!(summary.records_processed, 7);
    assert_eq!(summary.records_written, 7);

    let hot = read_json(dir.path().join("hot-100_2018-10-13.json"));
    let hot = hot.as_object().unwrap();
    assert_eq!(hot.len(), 3);

    let maroon = &hot["Maroon 5_Girls Like You"];
    assert_eq!(maroon["BB_Featuring"], "Cardi B");
    assert_eq!(maroon["BB_Chart_Discovered"]["Chart_Name"], "hot-100");
    assert_eq!(maroon["AZ_Lyrics"], "");
    assert_eq!(maroon["AZ_Status"], "no_match");
    assert_eq!(maroon["Genius_Status"], "matched");
    assert!(maroon["Lyric_Stats"]["Genius"]["word_count"].as_u64().unwrap() > 0);

    assert!(dir.path().join("rap-song_2018-10-13.json").exists());
    assert!(dir.path().join("hot-100_2018-10-06.json").exists());
    assert!(!dir.path().join("rap-song_2018-10-06.json").exists());

    let first_week = read_json(dir.path().join("usage_5records.json"));
    assert_eq!(first_week["records_processed"], 5);
    assert_eq!(first_week["counters"]["Billboard"]["calls"], 2);
    assert_eq!(first_week["counters"]["Genius"]["calls"], 5);
    let second_week = read_json(dir.path().join("usage_7records.json"));
    assert_eq!(second_week["week"], "2018-10-06");
    assert_eq!(second_week["counters"]["Billboard"]["errors"], 1);
}

#[tokio::test]
async fn index_mode_stores_each_song_once_across_charts_and_weeks() {
    let dir = tempdir().unwrap();
    let mut config = fixture_config(dir.path().join("unused"));
    config.use_elastic_search = true;
    let store = Arc::new(InMemoryRecordStore::new());
    let mut collaborators = build_collaborators(
        &RunConfig {
            use_elastic_search: false,
            ..config.clone()
        },
        &EnvSettings::from_env(),
    )
    .unwrap();
    collaborators.record_store = Some(store.clone());
    let orchestrator = WeeklyOrchestrator::new(config, collaborators).unwrap();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.weeks_processed, 2);
    assert_eq!(summary.records_processed, 7);
    assert_eq!(store.len().await, 4);
    assert_eq!(summary.records_written, 4);

    let sicko = store
        .get(&SongKey::new("Travis Scott", "Sicko Mode"))
        .await
        .unwrap();
    assert_eq!(sicko.status_of(SourceId::LyricWiki), Some("matched"));
    assert_eq!(store.usage_reports().await.len(), 2);
    assert!(!dir.path().join("unused").exists());
}
