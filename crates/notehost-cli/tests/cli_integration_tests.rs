//! CLI integration tests for notehost
//!
//! Runs the notehost binary end-to-end against throwaway config and data
//! directories.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::{SimpleFileOptions, ZipWriter};

struct Env {
    tmp: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
        }
    }

    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("notehost").unwrap();
        cmd.env("NOTEHOST_CONFIG_DIR", self.tmp.path().join("config"));
        cmd.env_remove("RUST_LOG");
        cmd.arg("--data-dir").arg(self.tmp.path().join("data"));
        cmd
    }

    fn archive(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (entry, body) in files {
            writer.start_file(*entry, SimpleFileOptions::default()).unwrap();
            writer.write_all(body).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();
        let path = self.tmp.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn plugin_archive(&self, id: &str) -> PathBuf {
        let manifest = manifest(id);
        self.archive(
            &format!("{}.zip", id),
            &[
                ("plugin.toml", manifest.as_bytes()),
                ("lib/index.js", b"export function onEvent(e) { return e.type; }"),
            ],
        )
    }
}

fn manifest(id: &str) -> String {
    format!(
        r#"id = "{id}"
name = "CLI {id}"
version = "1.0.0"
author = "Notehost Labs"
description = "Plugin used by CLI tests"
type = "INTEGRATION"
required_permissions = ["notes:read"]
subscriptions = ["note.created"]

[runtime]
kind = "queue_consumer"
"#
    )
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_help_lists_commands() {
    let env = Env::new();
    env.cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("install"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("grant"));
}

#[test]
fn test_empty_list() {
    let env = Env::new();
    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins installed"));
}

#[test]
fn test_config_roundtrip() {
    let env = Env::new();
    env.cmd()
        .args(["config", "set", "events.workers", "8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set events.workers = 8"));

    env.cmd()
        .args(["config", "get", "events.workers"])
        .assert()
        .success()
        .stdout(predicate::str::diff("8\n"));

    env.cmd()
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fetcher.max_download_bytes"));
}

#[test]
fn test_config_rejects_unknown_key() {
    let env = Env::new();
    env.cmd()
        .args(["config", "set", "fetcher.nonsense", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_install_grant_and_uninstall() {
    let env = Env::new();
    let archive = env.plugin_archive("cli-demo");

    env.cmd()
        .args(["install", path_arg(&archive)])
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed plugin 'cli-demo'"))
        .stdout(predicate::str::contains("REGISTERED"));

    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("cli-demo 1.0.0 [REGISTERED] queue_consumer"));

    env.cmd()
        .args(["grant", "cli-demo", "notes:read", "--by", "alice"])
        .assert()
        .success();

    env.cmd()
        .args(["grants", "cli-demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("notes:read (by alice"));

    env.cmd()
        .args(["revoke", "cli-demo", "notes:read"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Revoked notes:read"));

    env.cmd()
        .args(["uninstall", "cli-demo"])
        .assert()
        .success();

    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins installed"));
}

#[test]
fn test_duplicate_install_fails() {
    let env = Env::new();
    let archive = env.plugin_archive("twice");
    env.cmd().args(["install", path_arg(&archive)]).assert().success();
    env.cmd()
        .args(["install", path_arg(&archive)])
        .assert()
        .failure()
        .stderr(predicate::str::contains("[lifecycle]"))
        .stderr(predicate::str::contains("already registered"));
}

#[test]
fn test_list_json() {
    let env = Env::new();
    let archive = env.plugin_archive("json-plugin");
    env.cmd().args(["install", path_arg(&archive)]).assert().success();

    let output = env.cmd().args(["list", "--format", "json"]).output().unwrap();
    assert!(output.status.success());
    let plugins: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plugins[0]["id"], "json-plugin");
    assert_eq!(plugins[0]["status"], "REGISTERED");
    assert_eq!(plugins[0]["runtime"]["kind"], "queue_consumer");
}

#[test]
fn test_activate_queue_plugin() {
    let env = Env::new();
    let archive = env.plugin_archive("activatable");
    env.cmd().args(["install", path_arg(&archive)]).assert().success();
    env.cmd()
        .args(["activate", "activatable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is ACTIVE"));
}

#[test]
fn test_plain_http_rejected() {
    let env = Env::new();
    env.cmd()
        .args(["install", "http://plugins.example.com/a.zip"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("[network]"));
}

#[test]
fn test_validate_clean_archive() {
    let env = Env::new();
    let archive = env.plugin_archive("clean");
    env.cmd()
        .args(["validate", path_arg(&archive)])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("PASS"));
}

#[test]
fn test_validate_traversal_archive() {
    let env = Env::new();
    let manifest = manifest("evil");
    let archive = env.archive(
        "evil.zip",
        &[
            ("plugin.toml", manifest.as_bytes()),
            ("../../evil.sh", b"#!/bin/sh\n"),
        ],
    );
    env.cmd()
        .args(["validate", path_arg(&archive)])
        .assert()
        .failure()
        .stdout(predicate::str::starts_with("FAIL"))
        .stdout(predicate::str::contains("escapes the archive root"));

    env.cmd()
        .args(["install", path_arg(&archive)])
        .assert()
        .failure()
        .stderr(predicate::str::contains("[validation]"));
}

#[test]
fn test_grant_unknown_permission() {
    let env = Env::new();
    let archive = env.plugin_archive("perm");
    env.cmd().args(["install", path_arg(&archive)]).assert().success();
    env.cmd()
        .args(["grant", "perm", "notes:everything"])
        .assert()
        .failure();
}

#[test]
fn test_grant_to_missing_plugin() {
    let env = Env::new();
    env.cmd()
        .args(["grant", "ghost", "notes:read"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not registered"));
}
