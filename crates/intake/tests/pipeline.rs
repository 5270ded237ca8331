//! End-to-end runs of the intake pipeline with in-memory collaborators.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use engine::parser::{ParseStatus, ParserContext};
use engine::registry::{NewParser, Registry};
use intake::collab::{
    AnalysisStore, Indicator, IndicatorKind, MemoryAnalysisStore, Notification, TechniqueMatch,
};
use intake::config::IntakeConfig;
use intake::fake::{FailingStore, FakeExtractor, FakeMapper, FakeSummarizer, RecordingNotifier};
use intake::pipeline::{Collaborators, IntakePipeline};
use intake::quarantine::{MemoryQuarantine, QuarantineStore};
use intake::state::{AnalysisId, AnalysisRecord, AnalysisStatus, ProcessingMode, Stage};

const SSH_LINE: &str =
    "<34>Oct 11 22:14:15 bastion sshd[42]: Failed password for root from 45.33.32.156 port 22\n";

const FIREWALL: &str = r#"[parser]
name = "acme-fw"
extensions = [".log"]
priority = 5

[detect]
pattern = '^\d{4}-\d{2}-\d{2} \S+ (DENY|ALLOW) '

[[rules]]
pattern = '^(?P<timestamp>\S+ \S+) (?P<action>DENY|ALLOW) (?P<message>.*)$'
timestamp_format = "%Y-%m-%d %H:%M:%S"
"#;

struct Harness {
    pipeline: IntakePipeline,
    quarantine: Arc<MemoryQuarantine>,
    notifier: Arc<RecordingNotifier>,
    store: Arc<MemoryAnalysisStore>,
}

fn harness_with(config: IntakeConfig, tweak: impl FnOnce(&mut Collaborators)) -> Harness {
    let registry = Arc::new(Registry::new(ParserContext::default()));
    let quarantine = Arc::new(MemoryQuarantine::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let store = Arc::new(MemoryAnalysisStore::new());

    let mut collab = Collaborators::builtin(notifier.clone());
    collab.store = store.clone();
    tweak(&mut collab);

    let pipeline = IntakePipeline::new(config, registry, quarantine.clone(), collab).unwrap();
    Harness { pipeline, quarantine, notifier, store }
}

fn harness() -> Harness {
    harness_with(IntakeConfig::default(), |_| {})
}

async fn wait_for(pipeline: &IntakePipeline, id: AnalysisId, done: impl Fn(AnalysisStatus) -> bool) -> AnalysisRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record = pipeline.record(id).unwrap();
            if done(record.status) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("analysis did not reach the expected status")
}

#[tokio::test]
async fn test_syslog_file_completes() {
    let h = harness();
    let content = SSH_LINE.repeat(3).into_bytes();

    let record = h.pipeline.process(content, "auth.log", None).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.mode, Some(ProcessingMode::Direct));
    assert_eq!(record.parser.as_deref(), Some("syslog"));
    assert_eq!(record.parse_status, Some(ParseStatus::Completed));
    assert_eq!(record.event_count, 3);
    assert_eq!(record.sha256.as_deref().map(str::len), Some(64));
    assert!(record.finished_at.is_some());
    assert!(!record.partial);

    let ips: Vec<&Indicator> = record.indicators.iter().filter(|i| i.kind == IndicatorKind::Ipv4).collect();
    assert_eq!(ips.len(), 1);
    assert_eq!(ips[0].value, "45.33.32.156");

    let saved = assert_ok!(h.store.load(record.id).await);
    assert_eq!(saved.map(|r| r.status), Some(AnalysisStatus::Completed));
}

#[tokio::test]
async fn test_notifications_are_ordered() {
    let h = harness();
    let record = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "auth.log", None).await;

    let seen = h.notifier.notifications().await;
    assert!(seen.iter().all(|(id, _)| *id == record.id));

    let percents: Vec<u8> = seen
        .iter()
        .filter_map(|(_, n)| match n {
            Notification::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert!(seen.iter().any(|(_, n)| matches!(n, Notification::IocFound { count: 1 })));
    assert_eq!(
        seen.last().map(|(_, n)| n.clone()),
        Some(Notification::Completed { status: AnalysisStatus::Completed, partial: false })
    );
}

#[tokio::test]
async fn test_magic_mismatch_is_quarantined_once() {
    let h = harness();
    let record = h.pipeline.process(b"<Event>not really evtx</Event>".to_vec(), "Security.evtx", None).await;

    assert_eq!(record.status, AnalysisStatus::Quarantined);
    assert!(record.reason.as_deref().unwrap().starts_with("file format signature mismatch"));
    assert!(record.parser.is_none());

    let quarantined = h.quarantine.list().await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].analysis_id, record.id);
    assert_eq!(Some(quarantined[0].sha256.clone()), record.sha256);
    assert_eq!(h.quarantine.payload(record.id).unwrap(), b"<Event>not really evtx</Event>");
}

#[tokio::test]
async fn test_eicar_is_quarantined() {
    let h = harness();
    let content = format!("header\n{}\n", intake::scan::EICAR).into_bytes();
    let record = h.pipeline.process(content, "notes.txt", None).await;

    assert_eq!(record.status, AnalysisStatus::Quarantined);
    assert!(record.reason.unwrap().contains("EICAR-Test-File"));
    assert_eq!(h.quarantine.len(), 1);
}

#[tokio::test]
async fn test_blocked_extension_is_rejected() {
    let h = harness();
    let record = h.pipeline.process(b"MZ\x90\x00".to_vec(), "payload.exe", None).await;

    assert_eq!(record.status, AnalysisStatus::Rejected);
    assert!(record.reason.is_some());
    assert!(h.quarantine.is_empty());
    assert!(record.indicators.is_empty());
}

#[tokio::test]
async fn test_empty_file_is_rejected() {
    let h = harness();
    let record = h.pipeline.process(Vec::new(), "empty.log", None).await;
    assert_eq!(record.status, AnalysisStatus::Rejected);
}

#[tokio::test]
async fn test_unrecognised_file_continues_unparsed() {
    let h = harness();
    let mut content = vec![0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00, 0x04, 0x00];
    content.extend_from_slice(&[0u8; 64]);

    let record = h.pipeline.process(content, "capture.pcap", None).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert!(record.parser.is_none());
    assert_eq!(record.event_count, 0);
    assert!(record.warnings.iter().any(|w| w.contains("no parser")));
}

#[tokio::test]
async fn test_large_file_is_chunked() {
    let line_len = SSH_LINE.len();
    let mut config = IntakeConfig::default();
    config.limits.chunk_threshold = 64;
    config.limits.chunk_chars = line_len * 2;
    config.limits.chunk_parse_limit = (line_len * 3 + 10) as u64;
    config.limits.yield_every = 2;
    let h = harness_with(config, |_| {});

    let content = SSH_LINE.repeat(20).into_bytes();
    let record = h.pipeline.process(content, "auth.log", None).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.mode, Some(ProcessingMode::Chunked));
    assert_eq!(record.progress, 100);
    // only the parse window was handed to the parser
    assert_eq!(record.event_count, 3);
    assert_eq!(record.parse_metadata.get("parse_window_partial").map(String::as_str), Some("true"));

    let ips: Vec<&Indicator> = record.indicators.iter().filter(|i| i.kind == IndicatorKind::Ipv4).collect();
    assert_eq!(ips.len(), 1);
}

#[tokio::test]
async fn test_large_json_array_is_parsed_from_window() {
    let mut config = IntakeConfig::default();
    config.limits.chunk_threshold = 64;
    config.limits.chunk_parse_limit = 300;
    let h = harness_with(config, |_| {});

    let items: Vec<String> = (0..50)
        .map(|i| format!("  {{\"message\": \"login from 10.0.0.{}\", \"level\": \"info\"}}", i))
        .collect();
    let content = format!("[\n{}\n]\n", items.join(",\n")).into_bytes();

    let record = h.pipeline.process(content, "big.json", None).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.mode, Some(ProcessingMode::Chunked));
    assert_eq!(record.parser.as_deref(), Some("json"));
    assert!(record.event_count > 0);
    assert!(record.event_count < 50);
    assert_eq!(record.parse_metadata.get("parse_window_partial").map(String::as_str), Some("true"));
}

#[tokio::test]
async fn test_finished_record_releases_events_to_store() {
    let h = harness();
    let record = h.pipeline.process(SSH_LINE.repeat(3).into_bytes(), "auth.log", None).await;
    assert_eq!(record.events.len(), 3);

    let live = h.pipeline.record(record.id).unwrap();
    assert!(live.events.is_empty());
    assert_eq!(live.event_count, 3);

    let stored = assert_ok!(h.store.load(record.id).await).unwrap();
    assert_eq!(stored.events.len(), 3);
}

#[tokio::test]
async fn test_finished_records_are_pruned() {
    let mut config = IntakeConfig::default();
    config.limits.retain_finished = 1;
    let h = harness_with(config, |_| {});

    let first = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "a.log", None).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "b.log", None).await;

    assert!(h.pipeline.record(first.id).is_none());
    assert!(h.pipeline.record(second.id).is_some());
    assert!(assert_ok!(h.store.load(first.id).await).is_some());
}

#[tokio::test]
async fn test_sha256_is_computed_off_the_executor() {
    let h = harness();
    let content = SSH_LINE.repeat(2).into_bytes();
    let expected = hex::encode(Sha256::digest(&content));

    let record = h.pipeline.process(content, "auth.log", None).await;

    assert_eq!(record.sha256.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn test_mapper_failure_yields_partial_result() {
    let h = harness_with(IntakeConfig::default(), |c| c.mapper = Arc::new(FakeMapper::failing()));
    let record = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "auth.log", None).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert!(record.partial);
    assert_eq!(record.missing_stages, vec![Stage::Map]);
    assert!(!record.indicators.is_empty());
    assert!(record.techniques.is_empty());

    let seen = h.notifier.notifications().await;
    assert_eq!(
        seen.last().map(|(_, n)| n.clone()),
        Some(Notification::Completed { status: AnalysisStatus::Completed, partial: true })
    );
}

#[tokio::test]
async fn test_extractor_failure_still_maps() {
    let mapper = Arc::new(FakeMapper::returning(vec![TechniqueMatch {
        technique_id: "T1110".into(),
        name: "Brute Force".into(),
        tactic: "credential-access".into(),
        confidence: 0.7,
        evidence: vec![],
    }]));
    let h = harness_with(IntakeConfig::default(), |c| {
        c.extractor = Arc::new(FakeExtractor::failing());
        c.mapper = mapper.clone();
    });
    let record = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "auth.log", None).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.missing_stages, vec![Stage::Extract]);
    assert_eq!(record.techniques.len(), 1);
    assert_eq!(mapper.calls(), 1);
}

#[tokio::test]
async fn test_summary_runs_when_enabled() {
    let mut config = IntakeConfig::default();
    config.stages.summarize = true;
    let summarizer = Arc::new(FakeSummarizer::new());
    let h = harness_with(config, |c| c.summarizer = summarizer.clone());

    let record = h.pipeline.process(SSH_LINE.repeat(2).into_bytes(), "auth.log", None).await;

    assert_eq!(record.summary.as_deref(), Some("auth.log: 2 lines"));
    assert_eq!(summarizer.calls(), 1);
}

#[tokio::test]
async fn test_summary_skipped_by_default() {
    let summarizer = Arc::new(FakeSummarizer::new());
    let h = harness_with(IntakeConfig::default(), |c| c.summarizer = summarizer.clone());

    let record = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "auth.log", None).await;

    assert!(record.summary.is_none());
    assert!(!record.partial);
    assert_eq!(summarizer.calls(), 0);
}

#[tokio::test]
async fn test_disabled_summarizer_marks_stage_missing() {
    let mut config = IntakeConfig::default();
    config.stages.summarize = true;
    let h = harness_with(config, |_| {});

    let record = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "auth.log", None).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.missing_stages, vec![Stage::Summarize]);
}

#[tokio::test]
async fn test_store_failure_does_not_fail_analysis() {
    let h = harness_with(IntakeConfig::default(), |c| c.store = Arc::new(FailingStore));
    let record = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "auth.log", None).await;
    assert_eq!(record.status, AnalysisStatus::Completed);
}

#[tokio::test]
async fn test_custom_parser_via_preference() {
    let h = harness();
    h.pipeline.registry().register(NewParser::from_source(FIREWALL)).unwrap();

    let content = b"2024-03-01 10:00:00 DENY tcp 10.0.0.1\n2024-03-01 10:00:01 ALLOW udp 10.0.0.2\n".to_vec();
    let record = h.pipeline.process(content, "fw.log", Some("acme-fw".into())).await;

    assert_eq!(record.status, AnalysisStatus::Completed);
    assert_eq!(record.parser.as_deref(), Some("acme-fw"));
    assert_eq!(record.event_count, 2);
    assert_eq!(record.events[0].fields.get("action").and_then(|v| v.as_str()), Some("DENY"));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let h = harness();
    let (id, status) = h.pipeline.submit(SSH_LINE.as_bytes().to_vec(), "auth.log", None);
    assert_eq!(status, AnalysisStatus::Queued);
    assert!(h.pipeline.cancel(id));

    let record = wait_for(&h.pipeline, id, |s| s.is_terminal()).await;
    assert_eq!(record.status, AnalysisStatus::Cancelled);
    assert!(!h.pipeline.cancel(id));
}

#[tokio::test]
async fn test_cancel_during_extraction() {
    let extractor = Arc::new(FakeExtractor::default().with_delay(Duration::from_secs(60)));
    let h = harness_with(IntakeConfig::default(), |c| c.extractor = extractor.clone());

    let (id, _) = h.pipeline.submit(SSH_LINE.as_bytes().to_vec(), "auth.log", None);
    wait_for(&h.pipeline, id, |s| s == AnalysisStatus::Extracting).await;
    assert!(h.pipeline.cancel(id));

    let record = wait_for(&h.pipeline, id, |s| s.is_terminal()).await;
    assert_eq!(record.status, AnalysisStatus::Cancelled);
    assert_eq!(record.parser.as_deref(), Some("syslog"));
    assert!(record.techniques.is_empty());
}

#[tokio::test]
async fn test_analysis_timeout_fails() {
    let mut config = IntakeConfig::default();
    config.limits.analysis_timeout_secs = 1;
    config.limits.parse_timeout_secs = 1;
    let h = harness_with(config, |c| {
        c.extractor = Arc::new(FakeExtractor::default().with_delay(Duration::from_secs(30)))
    });

    let record = h.pipeline.process(SSH_LINE.as_bytes().to_vec(), "auth.log", None).await;

    assert_eq!(record.status, AnalysisStatus::Failed);
    assert!(record.reason.as_deref().unwrap().contains("timed out"));
    let seen = h.notifier.notifications().await;
    assert!(matches!(seen.last(), Some((_, Notification::Error { .. }))));
}

#[tokio::test]
async fn test_concurrent_analyses_are_independent() {
    let h = harness();
    let ids: Vec<AnalysisId> = (0..8)
        .map(|i| h.pipeline.submit(SSH_LINE.repeat(i + 1).into_bytes(), format!("auth-{}.log", i), None).0)
        .collect();

    for (i, id) in ids.iter().enumerate() {
        let record = wait_for(&h.pipeline, *id, |s| s.is_terminal()).await;
        assert_eq!(record.status, AnalysisStatus::Completed);
        assert_eq!(record.event_count, i + 1);
    }
}
