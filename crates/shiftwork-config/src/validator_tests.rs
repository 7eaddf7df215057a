use super::*;
use crate::schema::RecurringConfig;

fn has_error(result: &ValidationResult, path: &str) -> bool {
    result.errors.iter().any(|e| e.path == path)
}

fn recurring(id: &str) -> RecurringConfig {
    RecurringConfig {
        id: id.to_string(),
        cron: "* * * * *".to_string(),
        job_type: "console.write_line".to_string(),
        queue: "default".to_string(),
        timezone: "UTC".to_string(),
        payload: serde_json::json!("Recurring!"),
    }
}

#[test]
fn test_validate_default_config() {
    let result = ConfigValidator::validate(&Config::default());
    assert!(result.is_valid(), "{:?}", result.errors);
}

#[test]
fn test_validate_server_name() {
    let mut config = Config::default();
    config.server.name = "a/b".to_string();
    assert!(has_error(&ConfigValidator::validate(&config), "server.name"));
    config.server.name = " ".to_string();
    assert!(has_error(&ConfigValidator::validate(&config), "server.name"));
}

#[test]
fn test_validate_prefix() {
    let mut config = Config::default();
    config.storage.prefix = "test.hangfire".to_string();
    assert!(has_error(&ConfigValidator::validate(&config), "storage.prefix"));
    config.storage.prefix = "test_hangfire".to_string();
    assert!(ConfigValidator::validate(&config).is_valid());
}

#[test]
fn test_validate_memory_backend_warns() {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    let result = ConfigValidator::validate(&config);
    assert!(result.is_valid());
    assert!(result.warnings.iter().any(|w| w.path == "storage.backend"));
}

#[test]
fn test_validate_queues() {
    let mut config = Config::default();
    config.queues.names.clear();
    assert!(has_error(&ConfigValidator::validate(&config), "queues.names"));

    config.queues.names = vec!["mail".to_string(), "mail".to_string()];
    assert!(has_error(&ConfigValidator::validate(&config), "queues.names"));

    config.queues.names = vec!["default".to_string()];
    config.queues.worker_count = 0;
    assert!(has_error(&ConfigValidator::validate(&config), "queues.worker_count"));
}

#[test]
fn test_validate_lease_must_exceed_heartbeat() {
    let mut config = Config::default();
    config.lease.duration_secs = 15;
    config.lease.heartbeat_interval_secs = 15;
    assert!(has_error(&ConfigValidator::validate(&config), "lease.duration_secs"));
}

#[test]
fn test_validate_sweep_longer_than_lease_warns() {
    let mut config = Config::default();
    config.lease.sweep_interval_secs = 600;
    let result = ConfigValidator::validate(&config);
    assert!(result.is_valid());
    assert!(result.warnings.iter().any(|w| w.path == "lease.sweep_interval_secs"));
}

#[test]
fn test_validate_retry() {
    let mut config = Config::default();
    config.retry.max_attempts = 0;
    assert!(has_error(&ConfigValidator::validate(&config), "retry.max_attempts"));

    config.retry.max_attempts = 1;
    config.retry.multiplier = 0.5;
    assert!(has_error(&ConfigValidator::validate(&config), "retry.multiplier"));
}

#[test]
fn test_validate_dashboard_requires_credentials() {
    let mut config = Config::default();
    config.dashboard.enabled = true;
    let result = ConfigValidator::validate(&config);
    assert!(has_error(&result, "dashboard.user"));
    assert!(has_error(&result, "dashboard.password"));

    config.dashboard.user = Some("admin".to_string());
    config.dashboard.password = Some("secret".to_string());
    assert!(ConfigValidator::validate(&config).is_valid());
}

#[test]
fn test_validate_recurring_entries() {
    let mut config = Config::default();
    config.recurring = vec![recurring("myrecurringjob")];
    assert!(ConfigValidator::validate(&config).is_valid());

    config.recurring.push(recurring("myrecurringjob"));
    assert!(has_error(&ConfigValidator::validate(&config), "recurring[1].id"));

    config.recurring = vec![recurring("a:b")];
    assert!(has_error(&ConfigValidator::validate(&config), "recurring[0].id"));

    let mut entry = recurring("nightly");
    entry.cron = String::new();
    entry.job_type = String::new();
    config.recurring = vec![entry];
    let result = ConfigValidator::validate(&config);
    assert!(has_error(&result, "recurring[0].cron"));
    assert!(has_error(&result, "recurring[0].job_type"));
}

#[test]
fn test_validate_recurring_on_unserved_queue_warns() {
    let mut config = Config::default();
    let mut entry = recurring("mailer");
    entry.queue = "mail".to_string();
    config.recurring = vec![entry];
    let result = ConfigValidator::validate(&config);
    assert!(result.is_valid());
    assert!(result.warnings.iter().any(|w| w.path == "recurring[0].queue"));
}

#[test]
fn test_into_result() {
    let warnings = ConfigValidator::validate(&Config::default())
        .into_result()
        .unwrap();
    assert!(warnings.is_empty());

    let mut config = Config::default();
    config.retry.max_attempts = 0;
    let err = ConfigValidator::validate(&config).into_result().unwrap_err();
    assert!(err.to_string().contains("retry.max_attempts"));
}

#[test]
fn test_validate_health_check_interval() {
    let mut config = Config::default();
    config.server.health_check_interval_secs = 0;
    assert!(has_error(
        &ConfigValidator::validate(&config),
        "server.health_check_interval_secs"
    ));
}
