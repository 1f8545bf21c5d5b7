use chrono::{DateTime, Duration, TimeZone, Utc};
use claude_limit_watch::config::{PriorParams, ResourceParams, WatchConfig};
use claude_limit_watch::models::{Likelihood, PredictionOutcome, ResourceKind};
use claude_limit_watch::services::pipeline::Pipeline;
use claude_limit_watch::services::FileEventSource;
use serde_json::{json, Value};
use tempfile::TempDir;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap()
}

fn user_record(at: DateTime<Utc>, text: &str) -> Value {
    json!({
        "timestamp": at.to_rfc3339(),
        "type": "user",
        "message": { "content": text },
    })
}

fn assistant_record(at: DateTime<Utc>, tokens: u64) -> Value {
    json!({
        "timestamp": at.to_rfc3339(),
        "type": "assistant",
        "message": {
            "model": "claude-sonnet-4",
            "usage": { "input_tokens": tokens, "output_tokens": tokens }
        },
    })
}

/// One prompt followed by `replies` assistant messages, 30s apart.
fn exchange(records: &mut Vec<(String, Value)>, mut at: DateTime<Utc>, replies: usize) -> DateTime<Utc> {
    records.push(("log.jsonl".to_string(), user_record(at, "do the thing")));
    for _ in 0..replies {
        at += Duration::seconds(30);
        records.push(("log.jsonl".to_string(), assistant_record(at, 200)));
    }
    at + Duration::seconds(30)
}

#[test]
fn batch_written_prompts_at_session_start_are_filtered() {
    let mut pipeline = Pipeline::new(WatchConfig::default(), "pro").unwrap();
    let t0 = start();

    // Three user events inside two seconds at the very start of the block,
    // then a normal exchange.
    let mut records = vec![
        ("log.jsonl".to_string(), user_record(t0, "old prompt 1")),
        (
            "log.jsonl".to_string(),
            user_record(t0 + Duration::seconds(1), "old prompt 2"),
        ),
        (
            "log.jsonl".to_string(),
            user_record(t0 + Duration::milliseconds(1500), "the real one"),
        ),
    ];
    exchange(&mut records, t0 + Duration::seconds(120), 2);

    pipeline.run(&records, t0 + Duration::minutes(30));
    let block = pipeline.current_block().unwrap();

    assert_eq!(block.user_prompts, 2); // the cluster survivor plus the exchange
    assert_eq!(block.artifacts, 2);
}

#[test]
fn mid_block_duplicate_cluster_warns_but_counts() {
    let mut pipeline = Pipeline::new(WatchConfig::default(), "pro").unwrap();
    let t0 = start();

    let mut records = Vec::new();
    let at = exchange(&mut records, t0, 2) + Duration::seconds(120);
    exchange(&mut records, at, 1);

    // Duplicate-timestamp pair past the 300s batch window but inside the
    // idle gap, so it stays in the same block.
    let cluster_at = t0 + Duration::seconds(450);
    records.push(("log.jsonl".to_string(), user_record(cluster_at, "a")));
    records.push((
        "log.jsonl".to_string(),
        user_record(cluster_at + Duration::seconds(1), "b"),
    ));

    let report = pipeline.run(&records, t0 + Duration::minutes(30));
    let block = pipeline.current_block().unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(block.user_prompts, 4);
    assert_eq!(block.artifacts, 0);
}

#[test]
fn empty_session_reports_insufficient_data() {
    let mut pipeline = Pipeline::new(WatchConfig::default(), "pro").unwrap();
    let report = pipeline.run(&[], start());
    assert!(report.prediction.is_insufficient_data());
}

#[test]
fn malformed_records_are_skipped_without_stopping_the_stream() {
    let mut pipeline = Pipeline::new(WatchConfig::default(), "pro").unwrap();
    let t0 = start();

    let mut records = vec![
        ("log.jsonl".to_string(), json!({ "type": "user" })), // no timestamp
        ("log.jsonl".to_string(), json!("not even an object")),
    ];
    exchange(&mut records, t0, 2);

    let report = pipeline.run(&records, t0 + Duration::minutes(30));
    assert_eq!(report.skipped_records, 2);
    assert_eq!(pipeline.current_block().unwrap().user_prompts, 1);
}

#[test]
fn repeated_limit_hits_shift_the_posterior_toward_observation() {
    // Plan "Pro" variant with nominal prompt quota 18 and a prior centered
    // near 15 (alpha 6, beta 2, scale 20).
    let mut config = WatchConfig::default();
    let plan = config.plans.get_mut("pro").unwrap();
    plan.prompts = ResourceParams {
        nominal: 18.0,
        prior: PriorParams { alpha: 6.0, beta: 2.0, scale: 20.0 },
    };
    // Keep message/token judgements out of the way of this scenario.
    let mut pipeline = Pipeline::new(config, "pro").unwrap();

    let prior_mean = pipeline.estimator().posterior_mean(ResourceKind::Prompts);
    let (prior_low, prior_high) = pipeline
        .estimator()
        .credible_interval(ResourceKind::Prompts, 0.95);
    assert!((prior_mean - 15.0).abs() < 0.01);

    // Three sessions, 6+ hours apart, each stopping at 12-13 prompts.
    let mut records = Vec::new();
    for (session, prompts) in [(0i64, 12usize), (1, 13), (2, 12)] {
        let mut at = start() + Duration::hours(session * 6);
        for _ in 0..prompts {
            at = exchange(&mut records, at, 1);
            at += Duration::seconds(60);
        }
    }

    pipeline.run(&records, start() + Duration::hours(18));

    let posterior_mean = pipeline.estimator().posterior_mean(ResourceKind::Prompts);
    let (low, high) = pipeline
        .estimator()
        .credible_interval(ResourceKind::Prompts, 0.95);

    assert!(posterior_mean < prior_mean);
    assert!(posterior_mean > 12.0 && posterior_mean < 14.5);
    assert!(high - low < prior_high - prior_low);
    assert_eq!(pipeline.estimator().observations(), 3);
}

#[test]
fn confidence_steps_up_with_closed_sessions_only() {
    let mut pipeline = Pipeline::new(WatchConfig::default(), "pro").unwrap();

    let mut records = Vec::new();
    let mut session_start = start();
    let mut last_confidence = None;

    for session in 0u32..12 {
        let mut at = session_start;
        for _ in 0..5 {
            at = exchange(&mut records, at, 2);
            at += Duration::seconds(60);
        }
        session_start += Duration::hours(6);

        let report = pipeline.run(&records, session_start);
        if let Some(previous) = last_confidence {
            assert!(report.prediction.confidence >= previous);
        }
        assert_eq!(report.prediction.sessions_analyzed, session + 1);
        last_confidence = Some(report.prediction.confidence);
    }
}

#[test]
fn heavy_session_is_very_likely_to_hit_limits() {
    let mut pipeline = Pipeline::new(WatchConfig::default(), "pro").unwrap();
    let t0 = start();

    // 50 prompts with replies in the first 50 minutes of a pro session.
    let mut records = Vec::new();
    let mut at = t0;
    for _ in 0..50 {
        at = exchange(&mut records, at, 1);
    }

    let report = pipeline.run(&records, t0 + Duration::hours(1));
    match report.prediction.outcome {
        PredictionOutcome::Projection(p) => {
            assert_eq!(p.likelihood, Likelihood::VeryLikely);
            assert!(p.time_to_limit_hours < p.session_remaining_hours);
        }
        _ => panic!("expected a projection"),
    }
}

#[test]
fn quiet_session_is_unlikely_to_hit_limits() {
    let mut pipeline = Pipeline::new(WatchConfig::default(), "max20x").unwrap();
    let t0 = start();

    // Three light exchanges spread over two hours of a max20x session.
    let mut records = Vec::new();
    exchange(&mut records, t0, 1);
    exchange(&mut records, t0 + Duration::minutes(4), 1);
    exchange(&mut records, t0 + Duration::minutes(8), 2);

    let report = pipeline.run(&records, t0 + Duration::hours(2));
    match report.prediction.outcome {
        PredictionOutcome::Projection(p) => {
            assert!(matches!(
                p.likelihood,
                Likelihood::VeryUnlikely | Likelihood::Unlikely
            ));
        }
        _ => panic!("expected a projection"),
    }
}

#[tokio::test]
async fn file_source_reads_jsonl_and_skips_noise() {
    let temp_dir = TempDir::new().unwrap();
    let project_dir = temp_dir.path().join("project-a");
    std::fs::create_dir_all(&project_dir).unwrap();

    let t0 = start();
    let lines = [
        user_record(t0, "hello").to_string(),
        String::new(),
        "{ this is not json".to_string(),
        assistant_record(t0 + Duration::seconds(30), 100).to_string(),
    ]
    .join("\n");
    std::fs::write(project_dir.join("transcript.jsonl"), lines).unwrap();
    std::fs::write(project_dir.join("notes.txt"), "ignored").unwrap();

    let source = FileEventSource::with_paths(vec![temp_dir.path().to_path_buf()]);
    let records = source.collect_records().await.unwrap();
    assert_eq!(records.len(), 2);

    let mut pipeline = Pipeline::new(WatchConfig::default(), "pro").unwrap();
    let report = pipeline.run(&records, t0 + Duration::minutes(30));
    assert_eq!(report.new_events, 2);
    assert_eq!(pipeline.current_block().unwrap().user_prompts, 1);
}

#[test]
fn state_persists_across_process_restarts() {
    let config = WatchConfig::default();
    let mut pipeline = Pipeline::new(config.clone(), "pro").unwrap();

    let mut records = Vec::new();
    let mut at = start();
    for _ in 0..5 {
        at = exchange(&mut records, at, 2);
        at += Duration::seconds(60);
    }
    // Second session so the first one closes.
    let mut at = start() + Duration::hours(6);
    for _ in 0..4 {
        at = exchange(&mut records, at, 1);
        at += Duration::seconds(60);
    }

    let now = start() + Duration::hours(12);
    pipeline.run(&records, now);
    let observations = pipeline.estimator().observations();
    assert!(observations >= 1);

    let serialized = serde_json::to_string(&pipeline.state_snapshot()).unwrap();

    // "Restart": fresh pipeline, restored state, full re-ingest of the log.
    let mut restarted = Pipeline::new(config, "pro").unwrap();
    restarted
        .restore_state(serde_json::from_str(&serialized).unwrap())
        .unwrap();
    restarted.run(&records, now);

    assert_eq!(restarted.estimator().observations(), observations);
}
