//! Integration tests for the transfer engine.
//!
//! The engine runs in-process against a mock media server; a recording
//! [`EventSink`] stands in for the host and answers its RPCs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use streamdl_core::task::StreamResume;
use streamdl_core::{
    EngineConfig, EventSink, ItemKey, MergeCommand, Message, ProtocolError, RenewOutcome,
    ResumePlan, TaskOutcome, TaskSpec, TransferEngine,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::media::{FAR_EXPIRY, PAST_EXPIRY, RangeBody, SegmentBody, range_url, segment_url};
use support::socket_guard::require_mock_server;

/// Host stand-in that records every event.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Message>>,
    /// Grant this many permissions, then deny. `None` grants all.
    grant_limit: Option<usize>,
    granted: AtomicUsize,
    /// Answer to `renew-link`.
    renewal: Option<RenewOutcome>,
    renew_calls: Mutex<Vec<(usize, String, Option<String>)>>,
}

impl Recorder {
    fn events(&self) -> Vec<Message> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, code: &str) -> usize {
        self.events().iter().filter(|m| m.code() == code).count()
    }
}

#[async_trait]
impl EventSink for Recorder {
    fn notify(&self, event: Message) {
        self.events.lock().unwrap().push(event);
    }

    async fn can_proceed(&self, _index: usize) -> Result<bool, ProtocolError> {
        let granted = self.granted.fetch_add(1, Ordering::SeqCst);
        Ok(self.grant_limit.is_none_or(|limit| granted < limit))
    }

    async fn renew_link(
        &self,
        index: usize,
        locator: &str,
        last_successful_url: Option<&str>,
    ) -> Result<RenewOutcome, ProtocolError> {
        self.renew_calls.lock().unwrap().push((
            index,
            locator.to_string(),
            last_successful_url.map(str::to_string),
        ));
        Ok(self.renewal.clone().unwrap_or(RenewOutcome::Failed {
            reason: "no renewal configured".to_string(),
        }))
    }
}

/// Merge by concatenating the stream files in order.
fn cat_merge(streams: usize) -> MergeCommand {
    let inputs: Vec<String> = (1..=streams).map(|i| format!("\"${i}\"")).collect();
    let script = format!("cat {} > \"${}\"", inputs.join(" "), streams + 1);
    MergeCommand {
        program: "sh".to_string(),
        leading_args: vec!["-c".to_string(), script, "merge".to_string()],
        input_flag: None,
        trailing_args: vec![],
    }
}

fn config(temp: &Path, streams: usize) -> EngineConfig {
    EngineConfig {
        temp_root: temp.join("work"),
        retry_delay_ms: 0,
        chunk_ceiling: 4,
        merge: cat_merge(streams),
        ..EngineConfig::default()
    }
}

fn spec(temp: &Path, locators: Vec<String>) -> TaskSpec {
    let streams = locators.len();
    TaskSpec {
        item: ItemKey::new("watch?v=test"),
        destination: temp.join("out.bin"),
        locators,
        config: config(temp, streams),
        resume: None,
    }
}

fn working_dir(events: &[Message]) -> PathBuf {
    events
        .iter()
        .find_map(|m| match m {
            Message::ProcessStarted { working_dir } => Some(working_dir.clone()),
            _ => None,
        })
        .unwrap()
}

async fn run(spec: TaskSpec, recorder: &Arc<Recorder>) -> TaskOutcome {
    TransferEngine::new(spec, Arc::clone(recorder) as Arc<dyn EventSink>)
        .run()
        .await
}

#[tokio::test]
async fn test_two_streams_fetch_and_merge() {
    let mock_server = require_mock_server!();
    let audio = b"0123456789".to_vec();
    let video = SegmentBody::with_header(&[b"seg-one", b"seg-two"]);
    let expected: Vec<u8> = [audio.clone(), video.concat()].concat();
    Mock::given(path("/audio"))
        .respond_with(RangeBody(audio))
        .mount(&mock_server)
        .await;
    Mock::given(path("/video"))
        .respond_with(video)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![
        range_url(&mock_server.uri(), "/audio", "audio/webm", 10, FAR_EXPIRY, "a"),
        segment_url(&mock_server.uri(), "/video", "video/mp4", FAR_EXPIRY, "v"),
    ];
    let recorder = Arc::new(Recorder::default());
    let outcome = run(spec(temp.path(), locators), &recorder).await;

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(std::fs::read(temp.path().join("out.bin")).unwrap(), expected);

    let events = recorder.events();
    assert!(matches!(events.first(), Some(Message::ProcessStarted { .. })));
    assert_eq!(
        events.last(),
        Some(&Message::ProcessFinished {
            outcome: TaskOutcome::Success
        })
    );
    // 0-3, 4-7, 8-9 plus three segments
    assert_eq!(recorder.count("chunk-fetched"), 6);
    assert_eq!(recorder.count("dl-started"), 2);
    assert_eq!(recorder.count("dl-finished"), 2);
    assert_eq!(recorder.count("merge-started"), 1);
    assert!(events.contains(&Message::MergeFinished {
        status: Some(0),
        diagnostics: String::new()
    }));
    assert!(!working_dir(&events).exists(), "stream files should be cleaned up");
}

#[tokio::test]
async fn test_chunks_of_one_stream_arrive_in_order() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(RangeBody((0..=99).collect()))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![range_url(&mock_server.uri(), "/audio", "audio/mp4", 100, FAR_EXPIRY, "a")];
    let mut spec = spec(temp.path(), locators);
    spec.config.chunk_ceiling = 30;
    let recorder = Arc::new(Recorder::default());
    assert_eq!(run(spec, &recorder).await, TaskOutcome::Success);

    let urls: Vec<String> = recorder
        .events()
        .into_iter()
        .filter_map(|m| match m {
            Message::ChunkFetched { url, expected, actual, .. } => {
                assert_eq!(expected, actual);
                Some(url)
            }
            _ => None,
        })
        .collect();
    let ranges: Vec<&str> = urls
        .iter()
        .map(|u| u.split("range=").nth(1).unwrap().split('&').next().unwrap())
        .collect();
    assert_eq!(ranges, ["0-29", "30-59", "60-89", "90-99"]);
}

#[tokio::test]
async fn test_denied_permission_stops_without_merge() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(RangeBody(b"0123456789".to_vec()))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![range_url(&mock_server.uri(), "/audio", "audio/webm", 10, FAR_EXPIRY, "a")];
    let recorder = Arc::new(Recorder {
        grant_limit: Some(1),
        ..Recorder::default()
    });
    let outcome = run(spec(temp.path(), locators), &recorder).await;

    assert_eq!(outcome, TaskOutcome::PermissionDenied);
    let events = recorder.events();
    assert_eq!(events.last(), Some(&Message::ProcessStopped));
    assert_eq!(recorder.count("process-finished"), 0);
    assert_eq!(recorder.count("merge-started"), 0);
    assert_eq!(recorder.count("chunk-fetched"), 1);
    assert!(!temp.path().join("out.bin").exists());

    // The committed chunk stays on disk for a later resume.
    let stream_file = working_dir(&events).join("0.webm");
    assert_eq!(std::fs::read(stream_file).unwrap(), b"0123");
}

#[tokio::test]
async fn test_expired_locator_is_renewed_on_forbidden() {
    let mock_server = require_mock_server!();
    let body = b"renewed-body".to_vec();
    Mock::given(path("/audio"))
        .and(query_param("sig", "stale"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(path("/audio"))
        .and(query_param("sig", "fresh"))
        .respond_with(RangeBody(body.clone()))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let stale = range_url(&mock_server.uri(), "/audio", "audio/mp4", body.len(), PAST_EXPIRY, "stale");
    let fresh = range_url(&mock_server.uri(), "/audio", "audio/mp4", body.len(), FAR_EXPIRY, "fresh");
    let recorder = Arc::new(Recorder {
        renewal: Some(RenewOutcome::Renewed {
            locator: fresh,
            consistent: true,
        }),
        ..Recorder::default()
    });
    let outcome = run(spec(temp.path(), vec![stale.clone()]), &recorder).await;

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(std::fs::read(temp.path().join("out.bin")).unwrap(), body);
    let calls = recorder.renew_calls.lock().unwrap().clone();
    assert_eq!(calls, [(0, stale, None)]);
}

#[tokio::test]
async fn test_empty_body_from_expired_segment_triggers_renewal() {
    let mock_server = require_mock_server!();
    let video = SegmentBody::with_header(&[b"middle", b"tail"]);
    let expected = video.concat();
    // The stale URL still serves probes and segment 0; segment 1 comes back empty.
    Mock::given(method("GET"))
        .and(path("/video"))
        .and(query_param("sig", "stale"))
        .and(query_param("sq", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(path("/video"))
        .respond_with(video)
        .with_priority(2)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let stale = segment_url(&mock_server.uri(), "/video", "video/mp4", PAST_EXPIRY, "stale");
    let fresh = segment_url(&mock_server.uri(), "/video", "video/mp4", FAR_EXPIRY, "fresh");
    let recorder = Arc::new(Recorder {
        renewal: Some(RenewOutcome::Renewed {
            locator: fresh,
            consistent: true,
        }),
        ..Recorder::default()
    });
    let outcome = run(spec(temp.path(), vec![stale.clone()]), &recorder).await;

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(std::fs::read(temp.path().join("out.bin")).unwrap(), expected);

    let calls = recorder.renew_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (index, locator, last) = &calls[0];
    assert_eq!(*index, 0);
    assert_eq!(locator, &stale);
    let last = last.as_deref().unwrap();
    assert!(last.contains("sq=0") && last.contains("sig=stale"), "got {last}");

    let fetched: Vec<String> = recorder
        .events()
        .into_iter()
        .filter_map(|m| match m {
            Message::ChunkFetched { url, .. } => Some(url),
            _ => None,
        })
        .collect();
    assert_eq!(fetched.len(), 3);
    assert!(fetched[1].contains("sq=1") && fetched[1].contains("sig=fresh"));
    assert!(fetched[2].contains("sq=2") && fetched[2].contains("sig=fresh"));
}

#[tokio::test]
async fn test_inconsistent_renewal_discards_partial_output() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let stale = range_url(&mock_server.uri(), "/audio", "audio/mp4", 10, PAST_EXPIRY, "stale");
    let recorder = Arc::new(Recorder {
        renewal: Some(RenewOutcome::Renewed {
            locator: segment_url(&mock_server.uri(), "/audio", "audio/mp4", FAR_EXPIRY, "x"),
            consistent: false,
        }),
        ..Recorder::default()
    });
    let outcome = run(spec(temp.path(), vec![stale]), &recorder).await;

    assert_eq!(outcome, TaskOutcome::InconsistentRenew);
    let events = recorder.events();
    assert_eq!(
        events.last(),
        Some(&Message::ProcessFinished {
            outcome: TaskOutcome::InconsistentRenew
        })
    );
    assert!(!working_dir(&events).exists());
    assert_eq!(recorder.count("merge-started"), 0);
}

#[tokio::test]
async fn test_failed_renewal_fails_the_stream() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let stale = range_url(&mock_server.uri(), "/audio", "audio/mp4", 10, PAST_EXPIRY, "stale");
    let recorder = Arc::new(Recorder::default());
    let outcome = run(spec(temp.path(), vec![stale]), &recorder).await;

    assert_eq!(outcome, TaskOutcome::FetchFailed);
    assert!(recorder.events().iter().any(|m| matches!(
        m,
        Message::DlError { kind, .. } if kind == "renew_failed"
    )));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_task() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![range_url(&mock_server.uri(), "/audio", "audio/mp4", 10, FAR_EXPIRY, "a")];
    let mut spec = spec(temp.path(), locators);
    spec.config.max_retries = 3;
    let recorder = Arc::new(Recorder::default());
    let outcome = run(spec, &recorder).await;

    assert_eq!(outcome, TaskOutcome::FetchFailed);
    assert_eq!(recorder.count("dl-error"), 3);
    assert_eq!(recorder.count("merge-started"), 0);
    assert_eq!(
        recorder.events().last(),
        Some(&Message::ProcessFinished {
            outcome: TaskOutcome::FetchFailed
        })
    );
}

#[tokio::test]
async fn test_transient_errors_are_retried_transparently() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(path("/audio"))
        .respond_with(RangeBody(b"abc".to_vec()))
        .with_priority(2)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![range_url(&mock_server.uri(), "/audio", "audio/mp4", 3, FAR_EXPIRY, "a")];
    let recorder = Arc::new(Recorder::default());
    let outcome = run(spec(temp.path(), locators), &recorder).await;

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(recorder.count("dl-error"), 2);
    assert_eq!(std::fs::read(temp.path().join("out.bin")).unwrap(), b"abc");
}

#[tokio::test]
async fn test_unclassifiable_locator_fails_before_workspace() {
    let temp = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let outcome = run(
        spec(temp.path(), vec!["https://example.com/plain.mp4".to_string()]),
        &recorder,
    )
    .await;

    assert_eq!(outcome, TaskOutcome::FetchFailed);
    let events = recorder.events();
    assert!(matches!(
        &events[0],
        Message::DlError { index: 0, kind, .. } if kind == "unsupported_format"
    ));
    assert_eq!(recorder.count("process-started"), 0);
}

#[tokio::test]
async fn test_merge_failure_keeps_stream_files() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(RangeBody(b"data".to_vec()))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![range_url(&mock_server.uri(), "/audio", "audio/webm", 4, FAR_EXPIRY, "a")];
    let mut spec = spec(temp.path(), locators);
    spec.config.merge = MergeCommand {
        program: "sh".to_string(),
        leading_args: vec!["-c".to_string(), "echo broken >&2; exit 3".to_string(), "merge".to_string()],
        input_flag: None,
        trailing_args: vec![],
    };
    let recorder = Arc::new(Recorder::default());
    let outcome = run(spec, &recorder).await;

    assert_eq!(outcome, TaskOutcome::MergeFailed);
    let events = recorder.events();
    assert!(events.iter().any(|m| matches!(
        m,
        Message::MergeFinished { status: Some(3), diagnostics } if diagnostics.contains("broken")
    )));
    assert_eq!(std::fs::read(working_dir(&events).join("0.webm")).unwrap(), b"data");
}

#[tokio::test]
async fn test_resumed_stream_appends_after_last_chunk() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .and(query_param("range", "0-3"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(path("/audio"))
        .respond_with(RangeBody(b"0123456789".to_vec()))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("previous");
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("0.webm");
    std::fs::write(&file, b"0123").unwrap();

    let raw = range_url(&mock_server.uri(), "/audio", "audio/webm", 10, FAR_EXPIRY, "a");
    let last = raw.replace("range=0-0", "range=0-3");
    let mut spec = spec(temp.path(), vec![raw]);
    spec.resume = Some(ResumePlan {
        working_dir: Some(dir.clone()),
        output_files: Some(vec![file]),
        should_resume: true,
        streams: vec![StreamResume {
            resumed: true,
            last_successful_url: Some(last),
        }],
    });
    let recorder = Arc::new(Recorder::default());
    let outcome = run(spec, &recorder).await;

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(recorder.count("chunk-fetched"), 2);
    assert_eq!(std::fs::read(temp.path().join("out.bin")).unwrap(), b"0123456789");
}

#[tokio::test]
async fn test_completed_resume_skips_straight_to_merge() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("done");
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("0.webm");
    std::fs::write(&file, b"complete").unwrap();

    // No server: any fetch would fail.
    let raw = "http://127.0.0.1:9/a?expire=4102444800&mime=audio%2Fwebm&clen=8&range=0-0".to_string();
    let mut spec = spec(temp.path(), vec![raw]);
    spec.resume = Some(ResumePlan {
        working_dir: Some(dir),
        output_files: Some(vec![file]),
        should_resume: false,
        streams: vec![StreamResume {
            resumed: true,
            last_successful_url: Some("http://127.0.0.1:9/a?range=0-7".to_string()),
        }],
    });
    let recorder = Arc::new(Recorder::default());
    let outcome = run(spec, &recorder).await;

    assert_eq!(outcome, TaskOutcome::Success);
    assert_eq!(recorder.count("dl-started"), 0);
    assert_eq!(std::fs::read(temp.path().join("out.bin")).unwrap(), b"complete");
}

#[tokio::test]
async fn test_unusable_renewed_locator_fails_stream_and_keeps_data() {
    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .and(query_param("range", "4-7"))
        .respond_with(ResponseTemplate::new(403))
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(path("/audio"))
        .respond_with(RangeBody(b"0123456789".to_vec()))
        .with_priority(2)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let stale = range_url(&mock_server.uri(), "/audio", "audio/webm", 10, PAST_EXPIRY, "stale");
    let recorder = Arc::new(Recorder {
        renewal: Some(RenewOutcome::Renewed {
            locator: "https://example.com/plain.webm".to_string(),
            consistent: true,
        }),
        ..Recorder::default()
    });
    let outcome = run(spec(temp.path(), vec![stale]), &recorder).await;

    assert_eq!(outcome, TaskOutcome::FetchFailed);
    let events = recorder.events();
    assert!(events.iter().any(|m| matches!(
        m,
        Message::DlError { kind, .. } if kind == "unsupported_format"
    )));
    assert_eq!(
        std::fs::read(working_dir(&events).join("0.webm")).unwrap(),
        b"0123"
    );
}

#[tokio::test]
async fn test_aborted_engine_stops_its_streams() {
    let mock_server = require_mock_server!();
    Mock::given(path("/slow"))
        .respond_with(RangeBody(vec![7; 400]).delayed())
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![range_url(&mock_server.uri(), "/slow", "audio/webm", 400, FAR_EXPIRY, "a")];
    let recorder = Arc::new(Recorder::default());
    let engine = TransferEngine::new(
        spec(temp.path(), locators),
        Arc::clone(&recorder) as Arc<dyn EventSink>,
    );
    let task = tokio::spawn(engine.run());

    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while recorder.count("chunk-fetched") == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // Let a request already on the wire land, then expect silence.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let settled = mock_server.received_requests().await.unwrap().len();
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    assert_eq!(mock_server.received_requests().await.unwrap().len(), settled);
    assert!(settled < 100, "the stream should not have run to the end");
}

#[tokio::test]
async fn test_unanswered_permission_request_stops_the_task() {
    use streamdl_core::protocol::{MessageReader, encode};
    use streamdl_core::worker::{WorkerExit, run_worker};
    use tokio::io::AsyncWriteExt;

    let mock_server = require_mock_server!();
    Mock::given(path("/audio"))
        .respond_with(RangeBody(b"0123456789".to_vec()))
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let locators = vec![range_url(&mock_server.uri(), "/audio", "audio/webm", 10, FAR_EXPIRY, "a")];
    let mut spec = spec(temp.path(), locators);
    spec.config.rpc_timeout_ms = Some(100);

    let (host, worker) = tokio::io::duplex(64 * 1024);
    let (worker_read, worker_write) = tokio::io::split(worker);
    let (host_read, mut host_write) = tokio::io::split(host);
    let worker = tokio::spawn(run_worker(worker_read, worker_write));

    host_write
        .write_all(encode(&Message::Start(Box::new(spec))).unwrap().as_bytes())
        .await
        .unwrap();

    // Read everything, answer nothing.
    let mut inbound = MessageReader::new(host_read);
    let mut seen = Vec::new();
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(message) = inbound.next().await.unwrap() {
            let terminal = message.is_terminal();
            seen.push(message);
            if terminal {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(seen.iter().any(|m| m.code() == "can-proceed-dl"));
    assert_eq!(seen.last(), Some(&Message::ProcessStopped));
    assert_eq!(seen.iter().filter(|m| m.code() == "chunk-fetched").count(), 0);
    assert_eq!(
        worker.await.unwrap().unwrap(),
        WorkerExit::Finished(TaskOutcome::PermissionDenied)
    );
    drop(host_write);
}
