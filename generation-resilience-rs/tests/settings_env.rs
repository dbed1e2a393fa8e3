//! Environment overrides for settings. Kept in its own test binary since
//! it mutates process environment.

use std::time::Duration;

use generation_resilience_rs::ResilienceSettings;

#[test]
fn test_environment_overrides_defaults() -> anyhow::Result<()> {
    std::env::set_var("RESILIENCE__RETRY__MAX_RETRIES", "6");
    std::env::set_var("RESILIENCE__RETRY__INITIAL_DELAY_SECS", "0.5");
    std::env::set_var("RESILIENCE__DIAGNOSTICS__LOG_DIR", "ci_error_logs");

    let settings = ResilienceSettings::load(None)?;
    assert_eq!(settings.retry.max_retries, 6);
    assert_eq!(settings.diagnostics.log_dir.to_str(), Some("ci_error_logs"));

    let policy = settings.retry_policy()?;
    assert_eq!(policy.initial_delay(), Duration::from_millis(500));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
    Ok(())
}
