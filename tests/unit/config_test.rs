//! Tests for configuration validation and loading

use farm_dispatch::config::{AgentConfig, DispatchConfig, DispatcherConfig, PoolConfig, StoreEngine};

#[test]
fn test_default_config_is_valid() {
    let cfg = DispatchConfig::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.booking.worker_count >= 2);
    assert_eq!(cfg.store, StoreEngine::InMemory);
    assert_eq!(cfg.dispatcher.job_frame_dispatch_max, 2);
    assert_eq!(cfg.dispatcher.host_frame_dispatch_max, 12);
}

#[test]
fn test_pool_config_invalid_worker_count() {
    let pool = PoolConfig::new().with_worker_count(0);
    assert_eq!(pool.validate().unwrap_err(), "worker_count must be greater than 0");
}

#[test]
fn test_pool_config_invalid_queue_capacity() {
    assert!(PoolConfig::new().with_queue_capacity(0).validate().is_err());
}

#[test]
fn test_pool_config_invalid_stack_size() {
    assert!(PoolConfig::new().with_thread_stack_size(1024).validate().is_err());
}

#[test]
fn test_pool_error_names_the_pool() {
    let mut cfg = DispatchConfig::default();
    cfg.kill = PoolConfig::new().with_worker_count(0);
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("kill"), "{err}");
}

#[test]
fn test_dispatcher_limits_must_be_positive() {
    let limits = DispatcherConfig {
        host_frame_dispatch_max: 0,
        ..DispatcherConfig::default()
    };
    assert_eq!(
        limits.validate().unwrap_err(),
        "host_frame_dispatch_max must be greater than 0"
    );
}

#[test]
fn test_agent_config_invalid_port() {
    let agent = AgentConfig {
        port: 0,
        ..AgentConfig::default()
    };
    assert!(agent.validate().is_err());
}

#[test]
fn test_postgres_engine_needs_url() {
    let cfg = DispatchConfig {
        store: StoreEngine::Postgres { url: String::new() },
        ..DispatchConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_zero_tick_interval_is_invalid() {
    let cfg = DispatchConfig {
        tick_interval_ms: 0,
        ..DispatchConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_json_fills_missing_sections_with_defaults() {
    let json = r#"{
        "booking": { "worker_count": 3, "queue_capacity": 10 },
        "dispatcher": { "job_frame_dispatch_max": 4 },
        "store": { "postgres": { "url": "postgres://dispatch@db/farm" } }
    }"#;
    let cfg = DispatchConfig::from_json_str(json).unwrap();

    assert_eq!(cfg.booking.worker_count, 3);
    assert_eq!(cfg.booking.queue_capacity, 10);
    assert_eq!(cfg.booking.thread_stack_size, PoolConfig::default().thread_stack_size);
    assert_eq!(cfg.dispatcher.job_frame_dispatch_max, 4);
    assert_eq!(cfg.dispatcher.frame_query_max, DispatcherConfig::default().frame_query_max);
    assert_eq!(cfg.agent, AgentConfig::default());
    assert_eq!(
        cfg.store,
        StoreEngine::Postgres {
            url: "postgres://dispatch@db/farm".into()
        }
    );
}

#[test]
fn test_json_rejects_invalid_values() {
    assert!(DispatchConfig::from_json_str(r#"{ "kill": { "worker_count": 0, "queue_capacity": 5 } }"#).is_err());
    assert!(DispatchConfig::from_json_str("not json").is_err());
}

#[test]
fn test_config_round_trips_through_json() {
    let cfg = DispatchConfig::default();
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(DispatchConfig::from_json_str(&json).unwrap(), cfg);
}

#[test]
fn test_from_env_reads_dispatch_variables() {
    std::env::set_var("DISPATCH_KILL_THREADS", "3");
    std::env::set_var("DISPATCH_TEST_MODE", "true");
    std::env::set_var("DISPATCH_TICK_INTERVAL_MS", "250");
    let cfg = DispatchConfig::from_env();
    std::env::set_var("DISPATCH_KILL_THREADS", "three");
    let bad = DispatchConfig::from_env();
    for key in ["DISPATCH_KILL_THREADS", "DISPATCH_TEST_MODE", "DISPATCH_TICK_INTERVAL_MS"] {
        std::env::remove_var(key);
    }

    let cfg = cfg.unwrap();
    assert_eq!(cfg.kill.worker_count, 3);
    assert!(cfg.agent.test_mode);
    assert!(cfg.dispatcher.test_mode);
    assert_eq!(cfg.tick_interval_ms, 250);

    let err = bad.unwrap_err();
    assert!(format!("{err:#}").contains("DISPATCH_KILL_THREADS"), "{err:#}");
}
