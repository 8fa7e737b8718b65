//! CLI tests

use crate::{Cli, Commands, ConfigAction, OutputFormat, parse_permission, parse_source, rejected};
use clap::Parser;
use notehost_plugins::{FetchError, InstallSource, LifecycleError, Permission, PluginError};
use std::path::PathBuf;

#[test]
fn test_parse_install_with_options() {
    let cli = Cli::try_parse_from([
        "notehost",
        "install",
        "https://plugins.example.com/word-count.zip",
        "--checksum",
        "abc",
        "--repository",
        "community",
        "--format",
        "json",
    ])
    .unwrap();

    assert_eq!(cli.format, OutputFormat::Json);
    match cli.command {
        Commands::Install {
            source,
            checksum,
            repository,
            manifest,
        } => {
            assert_eq!(source, "https://plugins.example.com/word-count.zip");
            assert_eq!(checksum.as_deref(), Some("abc"));
            assert_eq!(repository.as_deref(), Some("community"));
            assert!(manifest.is_none());
        }
        _ => panic!("expected install"),
    }
}

#[test]
fn test_parse_grant_defaults_operator() {
    let cli = Cli::try_parse_from(["notehost", "grant", "exporter", "notes:read"]).unwrap();
    match cli.command {
        Commands::Grant { id, permission, by } => {
            assert_eq!(id, "exporter");
            assert_eq!(permission, "notes:read");
            assert_eq!(by, "operator");
        }
        _ => panic!("expected grant"),
    }
}

#[test]
fn test_parse_config_set() {
    let cli = Cli::try_parse_from(["notehost", "config", "set", "events.workers", "8"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Set { .. }
        }
    ));
}

#[test]
fn test_global_flags() {
    let cli = Cli::try_parse_from(["notehost", "list", "--verbose", "--data-dir", "/tmp/nh"]).unwrap();
    assert!(cli.verbose);
    assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/nh")));
}

#[test]
fn test_missing_subcommand_rejected() {
    assert!(Cli::try_parse_from(["notehost"]).is_err());
}

#[test]
fn test_source_detection() {
    assert_eq!(
        parse_source("https://plugins.example.com/a.zip"),
        InstallSource::Remote {
            url: "https://plugins.example.com/a.zip".to_string()
        }
    );
    // Plain http is passed through so the fetcher can reject the scheme
    assert!(matches!(parse_source("http://x/a.zip"), InstallSource::Remote { .. }));
    assert_eq!(
        parse_source("./build/a.zip"),
        InstallSource::Local(PathBuf::from("./build/a.zip"))
    );
}

#[test]
fn test_permission_parsing() {
    assert_eq!(parse_permission("notes:write").unwrap(), Permission::NotesWrite);
    assert!(parse_permission("notes:everything").is_err());
}

#[test]
fn test_rejection_message_carries_category() {
    let message = rejected(PluginError::from(FetchError::InvalidScheme("http".to_string()))).to_string();
    assert!(message.starts_with("[network]"));

    let message = rejected(PluginError::from(LifecycleError::ValidationFailed {
        sha256: "0".repeat(64),
        reasons: vec!["first".to_string(), "second".to_string()],
    }))
    .to_string();
    assert!(message.starts_with("[validation]"));
    assert!(message.contains("first") && message.contains("second"));
}
