//! Test fixtures shared across the crate's test modules

use async_trait::async_trait;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::cache::ArtifactRecord;
use crate::handle::queue::QueueHandle;
use crate::handle::{FaultReporter, HandleError, HandleFactory, PluginHandle};
use crate::manifest::{PluginMetadata, parse_manifest};
use crate::model::PluginInfo;

/// In-memory zip archive builder
pub struct ZipBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    fn add(mut self, name: &str, body: &[u8], method: CompressionMethod) -> Self {
        let options = SimpleFileOptions::default().compression_method(method);
        self.writer.start_file(name, options).unwrap();
        self.writer.write_all(body).unwrap();
        self
    }

    pub fn file(self, name: &str, body: &[u8]) -> Self {
        self.add(name, body, CompressionMethod::Stored)
    }

    pub fn deflated(self, name: &str, body: &[u8]) -> Self {
        self.add(name, body, CompressionMethod::Deflated)
    }

    pub fn build(self) -> Vec<u8> {
        self.writer.finish().unwrap().into_inner()
    }
}

pub fn sample_manifest(id: &str) -> String {
    format!(
        r#"id = "{id}"
name = "Sample {id}"
version = "0.3.1"
author = "Notehost Labs"
description = "Fixture plugin"
type = "UTILITY"
required_permissions = ["notes:read"]
subscriptions = ["note.created"]

[runtime]
kind = "queue_consumer"
capacity = 8
"#
    )
}

pub fn sample_metadata(id: &str) -> PluginMetadata {
    parse_manifest(&sample_manifest(id)).unwrap()
}

/// Archive bytes for a well-formed plugin with its manifest at the root
pub fn sample_archive(id: &str) -> Vec<u8> {
    ZipBuilder::new()
        .file("plugin.toml", sample_manifest(id).as_bytes())
        .file("lib/index.js", b"export function onEvent(e) { return e.type; }")
        .build()
}

pub const ECHO_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 1024))
  (func (export "alloc") (param $len i32) (result i32)
    global.get $next)
  (func (export "on_event") (param $ptr i32) (param $len i32) (result i32)
    i32.const 0))
"#;

pub const TRAPPING_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param $len i32) (result i32)
    i32.const 1024)
  (func (export "on_event") (param $ptr i32) (param $len i32) (result i32)
    unreachable))
"#;

pub const LOOPING_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "alloc") (param $len i32) (result i32)
    i32.const 1024)
  (func (export "on_event") (param $ptr i32) (param $len i32) (result i32)
    (loop $spin
      br $spin)
    i32.const 0))
"#;

/// Builds queue handles after an optional delay, or fails every load
pub struct StubFactory {
    delay: Duration,
    fail_with: Option<String>,
    created: AtomicUsize,
    reporters: Mutex<Vec<FaultReporter>>,
}

impl StubFactory {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_with: None,
            created: AtomicUsize::new(0),
            reporters: Mutex::new(Vec::new()),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Self::new()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Raise a fault through the reporter handed to the most recent handle
    pub fn fault(&self, reason: &str) {
        let reporters = self.reporters.lock().unwrap();
        reporters.last().unwrap().report(reason);
    }
}

#[async_trait]
impl HandleFactory for StubFactory {
    async fn create(
        &self,
        plugin: &PluginInfo,
        _artifact: &ArtifactRecord,
        faults: FaultReporter,
    ) -> Result<Arc<dyn PluginHandle>, HandleError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(reason) = &self.fail_with {
            return Err(HandleError::Load(reason.clone()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.reporters.lock().unwrap().push(faults);
        Ok(Arc::new(QueueHandle::new(&plugin.id, 16)))
    }
}
