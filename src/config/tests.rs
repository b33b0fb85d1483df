use super::*;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.exchange, "domain_events");
    assert_eq!(settings.consumer.max_redeliveries, 1);
    assert_eq!(settings.consumer.prefetch, 1);
    assert!(settings.consumer.dead_letter);
    assert!(!settings.outbox.enabled);
    assert!(settings.reconnect.max_delay_ms >= settings.reconnect.initial_delay_ms);
}

#[test]
fn test_partial_merge_keeps_defaults_for_missing_values() {
    let partial = PartialSettings {
        service: Some(settings::PartialServiceSettings {
            name: Some("bookings".into()),
            log_level: None,
        }),
        ..Default::default()
    };

    let merged = partial.merge(Settings::default());
    assert_eq!(merged.service.name, "bookings");
    assert_eq!(merged.service.log_level, "info");
    assert_eq!(merged.broker, Settings::default().broker);
}

#[test]
#[serial]
fn load_config_from_environment() {
    temp_env::with_vars(
        [
            ("TOPICBUS__SERVICE__NAME", Some("payments")),
            ("TOPICBUS__BROKER__URL", Some("memory://local")),
            ("TOPICBUS__CONSUMER__MAX_REDELIVERIES", Some("3")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.service.name, "payments");
            assert_eq!(cfg.broker.url, "memory://local");
            assert_eq!(cfg.consumer.max_redeliveries, 3);
            assert_eq!(cfg.broker.exchange, "domain_events");
        },
    );
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [service]
        name = "reviews"

        [broker]
        exchange = "staging_events"

        [reconnect]
        initial_delay_ms = 5000
        multiplier = 1.0
        jitter = 0.0

        [consumer]
        message_ttl_secs = 86400
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.service.name, "reviews");
    assert_eq!(cfg.broker.exchange, "staging_events");
    assert_eq!(cfg.reconnect.initial_delay_ms, 5000);
    assert_eq!(cfg.reconnect.multiplier, 1.0);
    assert_eq!(cfg.consumer.message_ttl_secs, Some(86400));
    assert_eq!(cfg.consumer.prefetch, 1);
}
