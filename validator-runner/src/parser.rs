// Copyright (c) The validator-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns a line-delimited JSON event stream from a test subprocess into a
//! [`TestResult`] tree.
//!
//! The parser never fails: on malformed or empty input it returns a failing
//! [`TestResult`] carrying a descriptive error, rather than an `Err`. This
//! mirrors the contract in the orchestrator's event parser -- downstream
//! code (the executor, the hierarchy manager) never has to special-case "no
//! result at all" for a test that ran.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Deserialize;
use std::time::Duration;
use validator_metadata::{TestResult, TestStatus, ValidatorMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Action {
    Start,
    Run,
    Pass,
    Fail,
    Skip,
    Output,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    #[serde(rename = "Time", default)]
    time: Option<DateTime<Utc>>,
    #[serde(rename = "Action")]
    action: Action,
    #[serde(rename = "Test", default)]
    test: String,
    #[serde(rename = "Output", default)]
    output: Option<String>,
    #[serde(rename = "Elapsed", default)]
    elapsed: Option<f64>,
}

/// Where a classified event's timing/output updates should be applied.
enum Target {
    Main,
    Sub(String),
    Ignore,
}

/// Per-test-path accumulator used while scanning the event stream.
#[derive(Default)]
struct TestState {
    start_time: Option<DateTime<Utc>>,
    terminal: Option<TestStatus>,
    terminal_time: Option<DateTime<Utc>>,
    terminal_elapsed: Option<f64>,
    output: String,
    error: String,
}

const NO_OUTPUT_ERROR: &str = "no/empty/invalid test output";

/// Parses a complete event stream (the test subprocess ran to completion).
///
/// Unparseable individual lines are debug-logged but do not abort parsing,
/// per the parser's "never fails the run" contract.
pub fn parse(bytes: &[u8], metadata: &ValidatorMetadata) -> TestResult {
    engine(bytes, metadata, None, true)
}

/// Parses a possibly-truncated event stream captured up to a timeout.
///
/// The main test defaults to `Fail`/`TimedOut=true` unless a terminal event
/// for it was actually observed before truncation. Subtests that started
/// but never terminated are marked `Fail`, `TimedOut=true`, with a duration
/// of `timeout` (or `timeout / 2` if no start was even observed for them).
/// Malformed JSON lines are silently skipped here -- the stream is expected
/// to be truncated mid-line.
pub fn parse_with_timeout(bytes: &[u8], metadata: &ValidatorMetadata, timeout: Duration) -> TestResult {
    engine(bytes, metadata, Some(timeout), false)
}

fn engine(
    bytes: &[u8],
    metadata: &ValidatorMetadata,
    timeout: Option<Duration>,
    log_malformed: bool,
) -> TestResult {
    if bytes.is_empty() {
        return TestResult::synthetic_failure(metadata.clone(), NO_OUTPUT_ERROR);
    }

    let main_test_name: &str = if metadata.targets_whole_package() {
        ""
    } else {
        metadata.func_name.as_deref().unwrap_or("")
    };

    let mut main = TestState::default();
    let mut subs: IndexMap<String, TestState> = IndexMap::new();
    let mut has_skip = false;
    let mut any_event_parsed = false;

    for line in bytes.split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let event: RawEvent = match serde_json::from_slice(line) {
            Ok(event) => event,
            Err(err) => {
                if log_malformed {
                    tracing::debug!(error = %err, "skipping malformed test event line");
                }
                continue;
            }
        };
        any_event_parsed = true;

        match classify(&event, main_test_name) {
            Target::Main => apply_event(&mut main, &event, &mut has_skip),
            Target::Sub(path) => {
                let state = subs.entry(path).or_default();
                apply_event(state, &event, &mut has_skip);
            }
            Target::Ignore => {}
        }
    }

    if !any_event_parsed {
        return TestResult::synthetic_failure(metadata.clone(), NO_OUTPUT_ERROR);
    }

    let mut sub_tests = IndexMap::new();
    let mut any_sub_failed = false;
    for (path, state) in subs {
        let result = finalize_sub(metadata, &path, &state, timeout);
        if result.status == TestStatus::Fail {
            any_sub_failed = true;
        }
        sub_tests.insert(path, result);
    }

    let status = finalize_main_status(&main, any_sub_failed, sub_tests.is_empty(), has_skip);
    let timed_out = timeout.is_some() && main.terminal.is_none();

    let duration = match timeout {
        Some(t) if main.terminal.is_none() => t,
        _ => compute_duration(main.start_time, main.terminal_time, main.terminal_elapsed),
    };

    let error = if timed_out {
        Some(format!(
            "TIMEOUT: Test timed out after {:?}",
            timeout.expect("timed_out implies timeout is Some")
        ))
    } else {
        non_empty(&main.error)
    };

    TestResult {
        metadata: metadata.clone(),
        status,
        duration,
        error,
        stdout: non_empty(&main.output),
        timed_out,
        sub_tests,
    }
}

/// Classifies a raw event against the test this parse call is targeting.
///
/// See the event classification rules: a main-test event either names the
/// target exactly, or is a same-named-empty "both empty" package-mode
/// framing event (any action, including `output` -- the source asymmetry
/// noted as an open question: such output lines are not timing events but
/// their text still accumulates into the package result), or is a
/// `start`/`pass`/`fail` single-test-mode framing event with an empty test
/// name. A subtest event has a non-empty test name that either nests
/// (`contains('/')`) or stands alone in package mode.
fn classify(event: &RawEvent, main_test_name: &str) -> Target {
    if event.test == main_test_name {
        return Target::Main;
    }
    if !main_test_name.is_empty()
        && event.test.is_empty()
        && matches!(event.action, Action::Start | Action::Pass | Action::Fail)
    {
        return Target::Main;
    }
    if !event.test.is_empty() && (event.test.contains('/') || main_test_name.is_empty()) {
        return Target::Sub(event.test.clone());
    }
    Target::Ignore
}

fn apply_event(state: &mut TestState, event: &RawEvent, has_skip: &mut bool) {
    match event.action {
        Action::Start | Action::Run => {
            if state.start_time.is_none() {
                state.start_time = event.time;
            }
        }
        Action::Pass | Action::Fail | Action::Skip => {
            state.terminal = Some(match event.action {
                Action::Pass => TestStatus::Pass,
                Action::Fail => TestStatus::Fail,
                Action::Skip => TestStatus::Skip,
                _ => unreachable!("guarded by outer match"),
            });
            state.terminal_time = event.time;
            state.terminal_elapsed = event.elapsed;
            if event.action == Action::Skip {
                *has_skip = true;
            }
        }
        Action::Output => {}
    }

    if let Some(text) = &event.output {
        state.output.push_str(text);
        if text.contains("Error:") || text.contains("panic:") || text.contains("--- FAIL:") {
            state.error.push_str(text);
        }
        if text.contains("--- SKIP:") {
            *has_skip = true;
        }
    }
}

/// Duration rule: time delta if a start was observed, else the `Elapsed`
/// fallback; a negative or zero delta is clamped to zero and then the
/// `Elapsed` fallback is applied if present.
fn compute_duration(
    start: Option<DateTime<Utc>>,
    terminal_time: Option<DateTime<Utc>>,
    elapsed: Option<f64>,
) -> Duration {
    let mut duration = match (start, terminal_time) {
        (Some(start), Some(terminal)) => (terminal - start).to_std().unwrap_or(Duration::ZERO),
        _ => elapsed.map(duration_from_elapsed).unwrap_or(Duration::ZERO),
    };
    if duration.is_zero() {
        if let Some(elapsed) = elapsed {
            duration = duration_from_elapsed(elapsed);
        }
    }
    duration
}

fn duration_from_elapsed(elapsed: f64) -> Duration {
    Duration::from_secs_f64(elapsed.max(0.0))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// A subtest's metadata is the parent's, with the function name narrowed to
/// the subtest's full path -- back-references are by value, not by
/// pointer, per the owned-tree design.
fn sub_metadata(parent: &ValidatorMetadata, path: &str) -> ValidatorMetadata {
    let mut metadata = parent.clone();
    metadata.func_name = Some(path.to_string());
    metadata.run_all = false;
    metadata
}

fn finalize_main_status(
    main: &TestState,
    any_sub_failed: bool,
    subs_empty: bool,
    has_skip: bool,
) -> TestStatus {
    if any_sub_failed {
        return TestStatus::Fail;
    }
    if let Some(status) = main.terminal {
        if status == TestStatus::Fail {
            return TestStatus::Fail;
        }
        if subs_empty && has_skip {
            return TestStatus::Skip;
        }
        return status;
    }
    if subs_empty && has_skip {
        return TestStatus::Skip;
    }
    // No terminal event was ever observed for the main test: fail-closed.
    TestStatus::Fail
}

fn finalize_sub(
    parent: &ValidatorMetadata,
    path: &str,
    state: &TestState,
    timeout: Option<Duration>,
) -> TestResult {
    let metadata = sub_metadata(parent, path);

    if let Some(timeout) = timeout {
        if let Some(status) = state.terminal {
            return TestResult {
                metadata,
                status,
                duration: compute_duration(state.start_time, state.terminal_time, state.terminal_elapsed),
                error: non_empty(&state.error),
                stdout: non_empty(&state.output),
                timed_out: false,
                sub_tests: IndexMap::new(),
            };
        }
        let duration = if state.start_time.is_some() {
            timeout
        } else {
            timeout / 2
        };
        return TestResult {
            metadata,
            status: TestStatus::Fail,
            duration,
            error: Some(format!("TIMEOUT: Test timed out after {timeout:?}")),
            stdout: non_empty(&state.output),
            timed_out: true,
            sub_tests: IndexMap::new(),
        };
    }

    TestResult {
        metadata,
        status: state.terminal.unwrap_or(TestStatus::Fail),
        duration: compute_duration(state.start_time, state.terminal_time, state.terminal_elapsed),
        error: non_empty(&state.error),
        stdout: non_empty(&state.output),
        timed_out: false,
        sub_tests: IndexMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn metadata(func_name: Option<&str>, run_all: bool) -> ValidatorMetadata {
        ValidatorMetadata {
            id: "v1".to_string(),
            gate: "gate-a".to_string(),
            suite: None,
            package: Utf8PathBuf::from("./a"),
            func_name: func_name.map(str::to_string),
            run_all,
            timeout: Duration::ZERO,
            validator_type: validator_metadata::ValidatorType::Acceptance,
        }
    }

    fn line(json: &str) -> String {
        format!("{json}\n")
    }

    #[test]
    fn empty_input_fails_closed() {
        let result = parse(b"", &metadata(Some("TestFoo"), false));
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.error.as_deref(), Some(NO_OUTPUT_ERROR));
    }

    #[test]
    fn all_malformed_lines_fail_closed() {
        let result = parse(b"not json\nalso not json\n", &metadata(Some("TestFoo"), false));
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.error.as_deref(), Some(NO_OUTPUT_ERROR));
    }

    // S1 -- passing package, RunAll.
    #[test]
    fn package_mode_passing_subtests() {
        let mut stream = String::new();
        stream.push_str(&line(r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":""}"#));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":"TestOne"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:01Z","Action":"pass","Test":"TestOne","Elapsed":1}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:01Z","Action":"start","Test":"TestTwo"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:02Z","Action":"pass","Test":"TestTwo","Elapsed":1}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:02Z","Action":"pass","Test":""}"#,
        ));

        let result = parse(stream.as_bytes(), &metadata(None, true));
        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.sub_tests.len(), 2);
        assert_eq!(result.sub_tests["TestOne"].status, TestStatus::Pass);
        assert_eq!(result.sub_tests["TestTwo"].status, TestStatus::Pass);
        assert_eq!(result.leaf_count(), 3);
    }

    // S2 -- subtest failure forces the parent to fail.
    #[test]
    fn failing_subtest_forces_parent_fail() {
        let mut stream = String::new();
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":"TestFoo"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"run","Test":"TestFoo/SubA"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:01Z","Action":"pass","Test":"TestFoo/SubA","Elapsed":1}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:01Z","Action":"run","Test":"TestFoo/SubB"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:02Z","Action":"output","Test":"TestFoo/SubB","Output":"    --- FAIL: TestFoo/SubB (1.00s)\n"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:02Z","Action":"fail","Test":"TestFoo/SubB","Elapsed":1}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:02Z","Action":"pass","Test":"TestFoo","Elapsed":2}"#,
        ));

        let result = parse(stream.as_bytes(), &metadata(Some("TestFoo"), false));
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.sub_tests["TestFoo/SubA"].status, TestStatus::Pass);
        assert_eq!(result.sub_tests["TestFoo/SubB"].status, TestStatus::Fail);
        assert!(result.sub_tests["TestFoo/SubB"]
            .error
            .as_deref()
            .unwrap()
            .contains("--- FAIL:"));
        assert_eq!(result.leaf_count(), 3);
    }

    // S3 -- timeout with partial output.
    #[test]
    fn timeout_marks_unterminated_subtest() {
        let mut stream = String::new();
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":"TestX"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00.000Z","Action":"start","Test":"TestX/S1"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00.100Z","Action":"pass","Test":"TestX/S1","Elapsed":0.1}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00.100Z","Action":"start","Test":"TestX/S2"}"#,
        ));

        let result = parse_with_timeout(
            stream.as_bytes(),
            &metadata(Some("TestX"), false),
            Duration::from_millis(500),
        );
        assert_eq!(result.status, TestStatus::Fail);
        assert!(result.timed_out);
        assert_eq!(result.sub_tests["TestX/S1"].status, TestStatus::Pass);
        let s2 = &result.sub_tests["TestX/S2"];
        assert_eq!(s2.status, TestStatus::Fail);
        assert!(s2.timed_out);
        assert_eq!(s2.duration, Duration::from_millis(500));
    }

    #[test]
    fn timeout_with_no_terminal_event_uses_full_timeout_as_duration() {
        let stream = line(r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":"TestX"}"#);
        let result = parse_with_timeout(
            stream.as_bytes(),
            &metadata(Some("TestX"), false),
            Duration::from_millis(500),
        );
        assert!(result.timed_out);
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.duration, Duration::from_millis(500));
    }

    #[test]
    fn timeout_subtest_without_start_gets_half_timeout() {
        let mut stream = String::new();
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":"TestX"}"#,
        ));
        // TestX/S3 is mentioned only via an output line -- it was never
        // started, so it gets the half-timeout duration rather than the
        // full timeout.
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"output","Test":"TestX/S3","Output":"queued\n"}"#,
        ));

        let result = parse_with_timeout(
            stream.as_bytes(),
            &metadata(Some("TestX"), false),
            Duration::from_millis(500),
        );
        let s3 = &result.sub_tests["TestX/S3"];
        assert!(s3.timed_out);
        assert_eq!(s3.status, TestStatus::Fail);
        assert_eq!(s3.duration, Duration::from_millis(250));
    }

    // S6 -- single-test-mode framing.
    #[test]
    fn single_test_mode_package_framing() {
        let mut stream = String::new();
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":""}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:03Z","Action":"pass","Test":"TestChainFork/Network_0","Elapsed":2}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:03.200Z","Action":"pass","Test":""}"#,
        ));

        let result = parse(stream.as_bytes(), &metadata(Some("TestChainFork"), false));
        assert_eq!(result.duration, Duration::from_millis(3200));
        assert_eq!(
            result.sub_tests["TestChainFork/Network_0"].duration,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn skip_with_no_subtests_overrides_status() {
        let mut stream = String::new();
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":"TestSkippy"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"skip","Test":"TestSkippy","Elapsed":0}"#,
        ));

        let result = parse(stream.as_bytes(), &metadata(Some("TestSkippy"), false));
        assert_eq!(result.status, TestStatus::Skip);
    }

    #[test]
    fn skip_does_not_override_when_subtests_present() {
        let mut stream = String::new();
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"start","Test":"TestFoo"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"run","Test":"TestFoo/SubA"}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:00Z","Action":"skip","Test":"TestFoo/SubA","Elapsed":0}"#,
        ));
        stream.push_str(&line(
            r#"{"Time":"2024-01-01T00:00:01Z","Action":"pass","Test":"TestFoo","Elapsed":1}"#,
        ));

        let result = parse(stream.as_bytes(), &metadata(Some("TestFoo"), false));
        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.sub_tests["TestFoo/SubA"].status, TestStatus::Skip);
    }
}
