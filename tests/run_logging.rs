#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::io;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tempfile::tempdir;

use mediamigrate_lib::config::CollectionLayout;
use mediamigrate_lib::copy_engine::FsCopyEngine;
use mediamigrate_lib::essential::migrate_essential_files;
use mediamigrate_lib::progress::Progress;
use mediamigrate_lib::store::StoreHandle;
use mediamigrate_lib::tracker::MigrationTracker;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("json log line"))
            .collect()
    }
}

fn find<'a>(lines: &'a [Value], event: &str) -> &'a Value {
    lines
        .iter()
        .find(|line| line["event"] == event)
        .unwrap_or_else(|| panic!("no {event} line in {lines:?}"))
}

// Estimator and copy engine run on blocking threads; their lines still
// belong to the run.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_work_logs_carry_the_run_id() -> Result<()> {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dir = tempdir()?;
    let source = dir.path().join("legacy");
    let destination = dir.path().join("app");
    fs::create_dir_all(source.join("collection.media"))?;
    fs::write(source.join("collection.anki2"), b"db")?;
    fs::write(source.join("collection.media/a.jpg"), [7u8; 64])?;

    let store = StoreHandle::in_memory();
    let layout = CollectionLayout::default();
    migrate_essential_files(&store, &layout, &source, &destination)?;

    let engine = Arc::new(FsCopyEngine::new(&source, &destination, layout.clone()));
    let tracker = MigrationTracker::new(store, engine, layout);
    let run_id = tracker.run_id().to_string();
    assert_eq!(tracker.run().await, Some(Progress::Success));

    let lines = capture.lines();
    for event in ["migration_run_started", "transfer_size_estimated", "copy_engine_started"] {
        let line = find(&lines, event);
        assert_eq!(line["span"]["name"], "migration_run", "{event}: {line}");
        assert_eq!(line["span"]["run_id"], run_id.as_str(), "{event}: {line}");
    }
    Ok(())
}
