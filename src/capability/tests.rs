use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use super::json::parse_json_content;
use super::limiter::LeakyBucket;
use super::mock::ScriptedCapability;
use super::*;

fn request(stage: Stage) -> CapabilityRequest {
    CapabilityRequest {
        stage,
        system_prompt: "system".to_string(),
        user_prompt: "user".to_string(),
        response_schema: None,
        sampling: SamplingParams::default(),
    }
}

fn limiter(max_attempts: u32) -> LimiterConfig {
    LimiterConfig {
        max_in_flight: 4,
        max_calls_per_second: 0.0,
        retry: RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(1),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Reading {
    value: f64,
}

impl JsonResponse for Reading {
    fn validate(&self) -> Result<(), String> {
        if (0.0..=1.0).contains(&self.value) {
            Ok(())
        } else {
            Err(format!("value out of range: {}", self.value))
        }
    }
}

#[test]
fn extract_first_json_object_skips_braces_inside_strings() {
    let text = "Here you go: {\"a\": \"}{\", \"b\": {\"c\": 1}} trailing {\"d\": 2}";
    assert_eq!(
        extract_first_json_object(text),
        Some("{\"a\": \"}{\", \"b\": {\"c\": 1}}")
    );
    assert_eq!(extract_first_json_object("{\"q\": \"\\\"}\"}"), Some("{\"q\": \"\\\"}\"}"));
    assert_eq!(extract_first_json_object("no json {"), None);
}

#[test]
fn parse_json_content_enforces_strict_shape_and_bounds() {
    let reading: Reading = parse_json_content("```json\n{\"value\": 0.5}\n```").expect("fenced");
    assert_eq!(reading.value, 0.5);

    assert!(matches!(
        parse_json_content::<Reading>("{\"value\": 0.5, \"extra\": 1}"),
        Err(CapabilityError::Schema(_))
    ));
    assert!(matches!(
        parse_json_content::<Reading>("{\"value\": 1.5}"),
        Err(CapabilityError::Schema(_))
    ));
    assert_eq!(
        parse_json_content::<Reading>("   ").unwrap_err(),
        CapabilityError::EmptyResponse
    );
}

#[tokio::test]
async fn invoke_json_retries_once_with_json_only_prompt() {
    let capability = ScriptedCapability::new()
        .push(Stage::Critique, Ok("I think it is fine.".to_string()))
        .push(Stage::Critique, Ok("Sure: {\"value\": 0.4} done".to_string()));
    let mut ledger = UsageLedger::default();

    let reading: Reading = invoke_json(&capability, &request(Stage::Critique), &mut ledger)
        .await
        .expect("second variant parses");

    assert_eq!(reading.value, 0.4);
    let requests = capability.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].user_prompt, "user");
    assert!(requests[1].user_prompt.starts_with("user\n\nReturn ONLY a valid JSON object"));
    assert_eq!(ledger.stage(Stage::Critique).calls, 2);
    assert_eq!(ledger.stage(Stage::Critique).total_tokens, 30);
}

#[tokio::test]
async fn invoke_json_reports_schema_error_after_second_failure() {
    let capability = ScriptedCapability::new().always(Stage::Selection, Ok("nope".to_string()));
    let mut ledger = UsageLedger::default();

    let err = invoke_json::<Reading, _>(&capability, &request(Stage::Selection), &mut ledger)
        .await
        .expect_err("never parses");

    assert!(matches!(err, CapabilityError::Schema(_)));
    assert_eq!(capability.calls(), 2);
}

#[test]
fn retry_delay_grows_exponentially_and_is_capped() {
    let policy = RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(3));
    assert_eq!(policy.delay_for_attempt(1, 1.0), Duration::from_millis(500));
    assert_eq!(policy.delay_for_attempt(2, 1.0), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(3, 0.5), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(4, 1.0), Duration::from_secs(3));
    assert_eq!(policy.delay_for_attempt(40, 1.4), Duration::from_secs(3));

    for attempt in 1..=3 {
        let delay = policy.jittered_delay(attempt);
        let nominal = policy.delay_for_attempt(attempt, 1.0);
        assert!(delay >= nominal.mul_f64(0.5) && delay <= nominal.mul_f64(1.5));
    }
}

#[tokio::test(start_paused = true)]
async fn limited_capability_retries_transient_failures() {
    let inner = ScriptedCapability::new()
        .push(Stage::Estimation, Err(CapabilityError::RateLimited("slow down".to_string())))
        .push(
            Stage::Estimation,
            Err(CapabilityError::Server {
                status: 503,
                message: "busy".to_string(),
            }),
        )
        .push(Stage::Estimation, Ok("{}".to_string()));
    let limited = LimitedCapability::new(inner, limiter(5));

    let start = Instant::now();
    let response = limited
        .invoke(&request(Stage::Estimation))
        .await
        .expect("third attempt succeeds");

    assert_eq!(response.content, "{}");
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert_eq!(limited.available_permits(), 4);
}

#[tokio::test(start_paused = true)]
async fn limited_capability_does_not_retry_permanent_failures() {
    let inner = std::sync::Arc::new(
        ScriptedCapability::new().always(Stage::Selection, Err(CapabilityError::Auth("bad key".to_string()))),
    );
    let limited = LimitedCapability::new(inner.clone(), limiter(5));

    let err = limited
        .invoke(&request(Stage::Selection))
        .await
        .expect_err("auth fails");

    assert!(matches!(err, CapabilityError::Auth(_)));
    assert_eq!(inner.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn limited_capability_stops_after_max_attempts() {
    let inner = std::sync::Arc::new(
        ScriptedCapability::new().always(Stage::Selection, Err(CapabilityError::Timeout("slow".to_string()))),
    );
    let limited = LimitedCapability::new(inner.clone(), limiter(3));

    let err = limited
        .invoke(&request(Stage::Selection))
        .await
        .expect_err("exhausted");

    assert!(matches!(err, CapabilityError::Timeout(_)));
    assert_eq!(inner.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn leaky_bucket_spaces_call_starts() {
    let bucket = LeakyBucket::per_second(2.0);
    assert_eq!(bucket.interval(), Duration::from_millis(500));

    let start = Instant::now();
    for _ in 0..3 {
        bucket.acquire().await;
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
}

struct SlowCapability {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait::async_trait]
impl Capability for SlowCapability {
    async fn invoke(
        &self,
        _request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(CapabilityResponse {
            content: "{}".to_string(),
            usage: None,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn semaphore_caps_in_flight_calls() {
    let limited = LimitedCapability::new(
        SlowCapability {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        },
        LimiterConfig {
            max_in_flight: 2,
            max_calls_per_second: 0.0,
            retry: RetryPolicy::default(),
        },
    );
    let req = request(Stage::Estimation);

    let calls = (0..6).map(|_| limited.invoke(&req));
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(limited_peak(&limited), 2);
}

fn limited_peak(limited: &LimitedCapability<SlowCapability>) -> usize {
    limited.inner().peak.load(Ordering::SeqCst)
}

#[test]
fn usage_ledger_merges_per_stage() {
    let usage = TokenUsage {
        input_tokens: 100,
        output_tokens: 20,
        total_tokens: 120,
    };
    let mut concept = UsageLedger::default();
    concept.record(Stage::Selection, Some(&usage));
    concept.record(Stage::Estimation, Some(&usage));
    concept.record(Stage::Estimation, None);

    let mut run = UsageLedger::default();
    run.merge(&concept);
    run.merge(&concept);

    assert_eq!(run.stage(Stage::Estimation).calls, 4);
    assert_eq!(run.stage(Stage::Estimation).total_tokens, 240);
    assert_eq!(run.stage(Stage::Critique), StageUsage::default());
    assert_eq!(run.total().calls, 6);
    assert_eq!(run.to_json()["total"]["input_tokens"], 400);
}
