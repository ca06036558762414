//! Settings source and local settings file tests
//!
//! Tests focus on what an agent observes: which settings it ends up with,
//! which broker it connects to and how configuration problems surface.


use mads_agent::config::SettingsSource;
use mads_agent::testing::{MockBroker, MockTransportFactory};
use mads_agent::{default_settings_uri, Agent, AgentState, ErrorKind};
use serde_json::json;
use std::time::Duration;
use test_helpers::{connected_agent, write_settings_file};

const SETTINGS: &str = r#"
[agents]
broker_url = "mqtt://broker.local:1884"
keep_alive_secs = 30

[feedback]
sub_topic = ["bridge", "logger"]
pub_topic = "feedback-out"
width = 65

[bridge]
period = 100
"#;

#[test]
fn test_default_settings_uri_is_broker() {
    assert!(!SettingsSource::resolve(default_settings_uri()).is_local());
}

#[tokio::test]
async fn test_local_settings_drive_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_settings_file(&dir, SETTINGS);
    let broker = MockBroker::new();

    let mut agent =
        Agent::create("mads-feedback", Some(path.as_str()), &MockTransportFactory::new(broker.clone()))
            .unwrap();
    agent.init(false).unwrap();

    assert_eq!(agent.settings().get_i64("width"), Some(65));
    assert_eq!(agent.pub_topic(), "feedback-out");

    agent.connect(Duration::ZERO).await.unwrap();
    let options = broker.last_connect_options().unwrap();
    assert_eq!(options.broker.broker_url, "mqtt://broker.local:1884");
    assert_eq!(options.broker.keep_alive_secs, 30);
    assert_eq!(options.subscriptions, vec!["bridge", "logger"]);

    agent.publish_default(&json!({"ok": true})).await.unwrap();
    assert_eq!(broker.sent_on("feedback-out").len(), 1);
}

#[test]
fn test_missing_agent_section_fails_init() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_settings_file(&dir, SETTINGS);

    let mut agent =
        Agent::create("logger", Some(path.as_str()), &MockTransportFactory::default()).unwrap();
    let error = agent.init(false).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Configuration);
    assert_eq!(agent.state(), AgentState::Created);
    assert!(agent.last_error().unwrap().contains("logger"));
}

#[test]
fn test_missing_settings_file_fails_init() {
    let mut agent = Agent::create(
        "feedback",
        Some("/nonexistent/mads.toml"),
        &MockTransportFactory::default(),
    )
    .unwrap();

    assert_eq!(agent.init(false).unwrap_err().kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_local_fetch_rereads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_settings_file(&dir, SETTINGS);
    let broker = MockBroker::new();

    let mut agent =
        Agent::create("bridge", Some(path.as_str()), &MockTransportFactory::new(broker.clone())).unwrap();
    agent.init(false).unwrap();
    agent.connect(Duration::ZERO).await.unwrap();
    assert_eq!(agent.settings().get_i64("period"), Some(100));

    write_settings_file(&dir, "[bridge]\nperiod = 250\n");
    agent.fetch_settings(Duration::from_millis(10)).await.unwrap();
    assert_eq!(agent.settings().get_i64("period"), Some(250));
    assert!(broker.settings_requests().is_empty());
}

#[tokio::test]
async fn test_save_broker_settings_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MockBroker::new();
    let mut agent = connected_agent(&broker, "feedback").await;

    broker.reply_settings(json!({"width": 80, "pub_topic": "fb"}));
    agent.fetch_settings(Duration::from_millis(100)).await.unwrap();

    let path = dir.path().join("saved.toml");
    agent.save_settings(&path).unwrap();

    let mut reloaded = Agent::create(
        "feedback",
        path.to_str(),
        &MockTransportFactory::default(),
    )
    .unwrap();
    reloaded.init(false).unwrap();
    assert_eq!(reloaded.settings().get_i64("width"), Some(80));
    assert_eq!(reloaded.pub_topic(), "fb");
}

#[test]
fn test_print_helpers() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_settings_file(&dir, SETTINGS);
    let mut agent = Agent::create("bridge", Some(path.as_str()), &MockTransportFactory::default()).unwrap();
    agent.init(false).unwrap();

    assert_eq!(agent.format_settings(0), r#"{"period":100}"#);
    assert_eq!(agent.format_settings(2), "{\n  \"period\": 100\n}");
    assert_eq!(agent.settings_uri(), path);
}

#[test]
fn test_settings_timeout_override() {
    let mut agent = Agent::create("feedback", None, &MockTransportFactory::default()).unwrap();
    assert_eq!(agent.settings_timeout(), Duration::from_millis(2000));

    agent.set_settings_timeout(Duration::from_millis(500)).unwrap();
    assert_eq!(agent.settings_timeout(), Duration::from_millis(500));
}
