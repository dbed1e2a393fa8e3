//! End-to-end generation flows: fallback across backends, per-backend
//! retry, response decoding and diagnostic records.

use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};

use generation_resilience_rs::fallback::unavailability_rule;
use generation_resilience_rs::payload::{prepare_for_upload, InlineData, UploadOptions, ValidatedPayload};
use generation_resilience_rs::{
    decode_response, BackendChain, Classifier, DiagnosticLogger, FallbackSelector, FaultCategory, ImageFormat,
    OperationResult, ResponsePart, RetryPolicy,
};

fn sample_png() -> Vec<u8> {
    let img = RgbImage::from_fn(48, 48, |x, y| Rgb([(x * 5) as u8, (y * 5) as u8, ((x ^ y) * 3) as u8]));
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .unwrap();
    buffer.into_inner()
}

#[tokio::test(start_paused = true)]
async fn test_region_block_fails_over_and_secondary_retries() -> anyhow::Result<()> {
    let classifier = Classifier::new().with_rule(unavailability_rule());
    let policy = RetryPolicy::generation().with_metrics(false);
    let encoded = STANDARD.encode(sample_png());

    let primary_calls = AtomicU32::new(0);
    let secondary_calls = AtomicU32::new(0);
    let (classifier, policy, encoded) = (&classifier, &policy, &encoded);
    let (primary, secondary) = (&primary_calls, &secondary_calls);

    let chain = BackendChain::new()
        .with_backend("gemini", move || {
            policy.execute("gemini", move || {
                primary.fetch_add(1, Ordering::SeqCst);
                async move {
                    OperationResult::<ValidatedPayload>::fail(
                        classifier.classify_message("400 FAILED_PRECONDITION: User location is not supported for the API use."),
                    )
                }
            })
        })
        .with_backend("openai", move || {
            policy.execute("openai", move || {
                let n = secondary.fetch_add(1, Ordering::SeqCst);
                let encoded = encoded.clone();
                async move {
                    let parts = match n {
                        0 => return OperationResult::fail(classifier.classify_message("503 Service Unavailable")),
                        1 => vec![ResponsePart::Text("Unable to render this request right now".to_string())],
                        _ => vec![
                            ResponsePart::Empty,
                            ResponsePart::Image {
                                data: InlineData::Base64(encoded),
                                media_type: Some("image/png".to_string()),
                            },
                        ],
                    };
                    decode_response(parts)
                }
            })
        });

    let result = FallbackSelector::default().with_metrics(false).invoke(chain).await;

    assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(secondary_calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.metadata()["backend"], "openai");
    assert_eq!(result.metadata()["failed_over_from"], serde_json::json!(["gemini"]));
    assert_eq!(result.metadata()["source"], "inline_data");

    let payload = result.into_result()?;
    assert_eq!(payload.detected_format, ImageFormat::Png);

    let upload = prepare_for_upload(
        payload.bytes,
        UploadOptions {
            target_format: ImageFormat::Jpeg,
            ..UploadOptions::default()
        },
    )
    .into_result()?;
    assert_eq!(upload.media_type, "image/jpeg");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_is_logged_and_not_failed_over() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut logger = DiagnosticLogger::new(dir.path())?;
    let policy = RetryPolicy::generation().with_metrics(false);
    let fallback_calls = AtomicU32::new(0);
    let (policy, fallback) = (&policy, &fallback_calls);

    let chain = BackendChain::new()
        .with_backend("gemini", move || {
            policy.execute("gemini", || async { Err::<Vec<u8>, _>("401 Unauthorized: invalid api key") })
        })
        .with_backend("openai", move || async move {
            fallback.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(Vec::new())
        });

    let start = tokio::time::Instant::now();
    let result = FallbackSelector::default().with_metrics(false).invoke(chain).await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);

    let path = logger
        .log_result(&result, "generate icon set")
        .expect("failure is logged");
    let record: serde_json::Value = serde_json::from_slice(&std::fs::read(path)?)?;
    assert_eq!(record["context"], "generate icon set");
    assert_eq!(record["error_number"], 1);
    assert_eq!(record["error"]["category"], "auth");
    assert_eq!(record["error"]["severity"], "FATAL");
    assert_eq!(record["error"]["is_retryable"], false);
    assert_eq!(record["error"]["traceback"][0], "401 Unauthorized: invalid api key");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_cooldown_is_respected_then_exhausted() {
    let waits = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = waits.clone();
    let policy = RetryPolicy::generation()
        .with_max_retries(2)
        .with_metrics(false)
        .with_observer(move |attempt, fault, wait| {
            assert_eq!(fault.category(), FaultCategory::RateLimit);
            recorded.lock().unwrap().push((attempt, wait));
        });

    let start = tokio::time::Instant::now();
    let result: OperationResult<()> = policy
        .execute("throttled", || async {
            Err::<(), _>(r#"429 Too Many Requests {"error": {"code": 429, "retryAfter": 12}}"#)
        })
        .await;

    assert_eq!(
        *waits.lock().unwrap(),
        vec![(1, Duration::from_secs(12)), (2, Duration::from_secs(12))]
    );
    assert!(start.elapsed() >= Duration::from_secs(24));
    assert_eq!(result.metadata()["total_attempts"], 3);
    assert_eq!(result.metadata()["retries_exhausted"], true);
    let error = result.error().unwrap();
    assert_eq!(error.detail_value("parsed_json").unwrap()["error"]["code"], 429);
}
