//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use sharelink_client::{
    ClientConfig, SessionError, Session, SessionHandleCache, SessionOptions, TransferTask,
};
use sharelink_common::memory::MemoryEngine;
use tempfile::TempDir;

/// Generous upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Config keeping staging files inside `temp` with small chunks
pub fn test_config(temp: &TempDir, chunk_size: usize, progress_granularity: u64) -> ClientConfig {
    ClientConfig {
        chunk_size,
        progress_granularity,
        staging_dir: Some(temp.path().join("staging")),
        ..ClientConfig::default()
    }
}

/// Guest session against `engine` at a fixed address
pub fn guest_session(
    engine: &MemoryEngine,
    cache: &Arc<SessionHandleCache>,
    config: ClientConfig,
) -> Session {
    Session::new(
        SessionOptions::for_address("10.0.0.2"),
        Arc::new(engine.clone()),
        Arc::clone(cache),
        None,
        config,
    )
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Everything a transfer task reported, in delivery order
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Progress(u64, u64),
    Success(String),
    Failure(SessionError),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::Progress(..))
    }
}

/// Register closure handlers on `task` that forward into a channel
pub fn watch(task: &TransferTask) -> Receiver<Event> {
    let (tx, rx) = mpsc::channel();
    let progress_tx = tx.clone();
    let success_tx = tx.clone();
    task.on_progress(move |bytes, total| {
        let _ = progress_tx.send(Event::Progress(bytes, total));
    })
    .on_success(move |path| {
        let _ = success_tx.send(Event::Success(path));
    })
    .on_fail(move |error| {
        let _ = tx.send(Event::Failure(error));
    });
    rx
}

/// Collect events up to and including the terminal one
pub fn until_terminal(events: &Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = events
            .recv_timeout(WAIT)
            .expect("transfer did not finish in time");
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

/// Poll `condition` until it holds or the wait bound passes
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
