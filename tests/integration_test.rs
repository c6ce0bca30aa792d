use adchat::config::{Config, SendPolicy};
use adchat::state::SessionOptions;

#[test]
fn test_config_validation_rejects_non_http_url() {
    let config = Config {
        api_url: "ftp://chat.example.com".to_string(),
        auth_token: Some("tok".to_string()),
        ..Config::default()
    };

    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_allows_local_endpoint_without_token() {
    let config = Config {
        api_url: "http://127.0.0.1:8000".to_string(),
        auth_token: None,
        email: None,
        ..Config::default()
    };

    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_accepts_remote_endpoint_with_token() {
    let config = Config {
        api_url: "https://chat.example.com".to_string(),
        auth_token: Some("tok".to_string()),
        ..Config::default()
    };

    assert!(config.validate().is_ok());
}

#[test]
fn test_session_options_follow_config() {
    let config = Config {
        send_policy: SendPolicy::Supersede,
        attachments_enabled: false,
        ..Config::default()
    };

    let options = SessionOptions::from(&config);
    assert_eq!(options.send_policy, SendPolicy::Supersede);
    assert!(!options.attachments_enabled);
}
