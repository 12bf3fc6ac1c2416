//! In-memory process adapter for tests
//!
//! Records every spawn, write and kill, and lets a test inject output and
//! exit events for any process it spawned.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{
    ProcessAdapter, ProcessEvent, ProcessHandle, PtyError, PtyResult, Signal, SpawnRequest,
    SpawnedProcess, TerminalSize,
};

#[derive(Default)]
struct FakeProcess {
    events_tx: Option<mpsc::UnboundedSender<ProcessEvent>>,
    written: Vec<u8>,
    size: Option<TerminalSize>,
    kills: usize,
}

impl FakeProcess {
    fn finish(&mut self, code: Option<i32>) {
        // Exit fires exactly once per handle
        if let Some(tx) = self.events_tx.take() {
            let _ = tx.send(ProcessEvent::Exit { code });
        }
    }
}

#[derive(Default)]
struct FakeState {
    processes: Mutex<Vec<FakeProcess>>,
    requests: Mutex<Vec<SpawnRequest>>,
    fail_spawns: AtomicBool,
    fail_writes: AtomicBool,
    closed: AtomicUsize,
}

/// Counting fake for [`ProcessAdapter`]
#[derive(Clone, Default)]
pub struct FakeAdapter {
    state: Arc<FakeState>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following spawn fail
    pub fn fail_spawns(&self, fail: bool) {
        self.state.fail_spawns.store(fail, Ordering::SeqCst);
    }

    /// Make every following write fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.state.processes.lock().unwrap().len()
    }

    /// Handles dropped so far (processes closed by their owner)
    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self, index: usize) -> usize {
        self.state.processes.lock().unwrap()[index].kills
    }

    pub fn total_kills(&self) -> usize {
        self.state
            .processes
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.kills)
            .sum()
    }

    pub fn written(&self, index: usize) -> Vec<u8> {
        self.state.processes.lock().unwrap()[index].written.clone()
    }

    pub fn last_size(&self, index: usize) -> Option<TerminalSize> {
        self.state.processes.lock().unwrap()[index].size
    }

    pub fn request(&self, index: usize) -> SpawnRequest {
        self.state.requests.lock().unwrap()[index].clone()
    }

    /// Emit output from process `index`
    pub fn emit(&self, index: usize, data: &[u8]) {
        let processes = self.state.processes.lock().unwrap();
        if let Some(tx) = &processes[index].events_tx {
            let _ = tx.send(ProcessEvent::Data(data.to_vec()));
        }
    }

    /// Make process `index` exit on its own
    pub fn exit(&self, index: usize, code: Option<i32>) {
        self.state.processes.lock().unwrap()[index].finish(code);
    }
}

impl ProcessAdapter for FakeAdapter {
    fn spawn(&self, request: &SpawnRequest) -> PtyResult<SpawnedProcess> {
        if self.state.fail_spawns.load(Ordering::SeqCst) {
            return Err(PtyError::SpawnFailed(format!(
                "fake spawn failure for '{}'",
                request.command
            )));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let mut processes = self.state.processes.lock().unwrap();
        let index = processes.len();
        processes.push(FakeProcess {
            events_tx: Some(events_tx),
            size: Some(request.size),
            ..Default::default()
        });
        self.state.requests.lock().unwrap().push(request.clone());

        Ok(SpawnedProcess {
            handle: Box::new(FakeHandle {
                index,
                state: Arc::clone(&self.state),
            }),
            events,
        })
    }
}

struct FakeHandle {
    index: usize,
    state: Arc<FakeState>,
}

impl ProcessHandle for FakeHandle {
    fn write(&mut self, data: &[u8]) -> PtyResult<()> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(PtyError::WriteFailed("fake write failure".to_string()));
        }
        self.state.processes.lock().unwrap()[self.index]
            .written
            .extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, size: TerminalSize) -> PtyResult<()> {
        self.state.processes.lock().unwrap()[self.index].size = Some(size);
        Ok(())
    }

    fn kill(&mut self, _signal: Signal) -> PtyResult<()> {
        let mut processes = self.state.processes.lock().unwrap();
        let process = &mut processes[self.index];
        process.kills += 1;
        process.finish(None);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(10_000 + self.index as u32)
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}
