//! Transfer tasks
//!
//! A [`TransferTask`] moves one file between the device and the local disk.
//! Its work is split into units, a prepare step followed by one unit per
//! chunk, queued on the owning session's request workers. Transfers therefore
//! share the worker pool with directory operations, and a cancel reaches
//! whichever unit is pending.
//!
//! The state lock orders everything the caller observes: progress and the
//! terminal callback are posted while it is held, so no progress callback can
//! follow the terminal one on the FIFO callback thread.

mod download;
mod file_utils;
mod types;
mod upload;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use sharelink_common::{ErrorKind, SessionError};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use file_utils::generate_unique_path;
pub use types::{TransferDelegate, TransferDirection, TransferStatus};

use crate::constants::MAX_TRACKED_OPERATIONS;
use crate::queue::{Job, OperationSet, RequestHandle};
use crate::session::SessionCore;

// =============================================================================
// Transfer I/O
// =============================================================================

/// Direction-specific half of a running transfer
///
/// Produced by the prepare step; every method runs on a request worker.
pub(crate) trait TransferIo: Send {
    fn total_bytes(&self) -> u64;

    /// Bytes already at the destination
    fn offset(&self) -> u64;

    /// Move the next chunk; `Ok(0)` once everything has been moved
    fn transfer_chunk(&mut self) -> Result<usize, SessionError>;

    /// Close the files; safe to call more than once
    fn finish(&mut self) -> Result<(), SessionError>;

    /// Put the finished file in place, returning where it ended up
    fn promote(&mut self) -> Result<String, SessionError>;

    /// Release everything after a failure or cancel
    fn abandon(&mut self);
}

// =============================================================================
// Task state
// =============================================================================

#[derive(Clone, Copy)]
enum Step {
    Prepare,
    Chunk,
}

struct TaskState {
    status: TransferStatus,
    bytes_transferred: u64,
    total_bytes: u64,
    /// Byte count progress is measured from: the start offset, then the last report
    progress_mark: Option<u64>,
    last_reported: Option<u64>,
    /// Suspended with no unit queued; `resume` must queue the next one
    parked: bool,
    /// Present between units; taken by the unit doing I/O
    io: Option<Box<dyn TransferIo>>,
    final_path: Option<String>,
    error: Option<SessionError>,
}

type ProgressHandler = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    progress: Option<ProgressHandler>,
    success: Option<Box<dyn FnOnce(String) + Send>>,
    failure: Option<Box<dyn FnOnce(SessionError) + Send>>,
    delegate: Option<Arc<dyn TransferDelegate>>,
}

/// State shared between a task, its queued units and its session
pub(crate) struct TaskShared {
    id: Uuid,
    direction: TransferDirection,
    remote_path: String,
    local_path: PathBuf,
    session: Weak<SessionCore>,
    state: Mutex<TaskState>,
    handlers: Mutex<Handlers>,
    units: OperationSet,
}

/// Queue `job` on the callback thread, or keep it for the caller to run once
/// its locks are released
fn deliver(core: Option<&Arc<SessionCore>>, job: Job, deferred: &mut Vec<Job>) {
    let job = match core {
        Some(core) => match core.try_post_callback(job) {
            Ok(()) => return,
            Err(job) => job,
        },
        None => job,
    };
    deferred.push(job);
}

fn run_deferred(deferred: Vec<Job>) {
    for job in deferred {
        job();
    }
}

impl TaskShared {
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().expect("transfer state lock poisoned")
    }

    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().expect("transfer handler lock poisoned")
    }

    fn task(self: &Arc<Self>) -> TransferTask {
        TransferTask {
            shared: Arc::clone(self),
        }
    }

    // =========================================================================
    // Callbacks (called with the state lock held)
    // =========================================================================

    fn post_progress(
        self: &Arc<Self>,
        core: Option<&Arc<SessionCore>>,
        state: &mut TaskState,
        deferred: &mut Vec<Job>,
    ) {
        let (bytes, total) = (state.bytes_transferred, state.total_bytes);
        state.progress_mark = Some(bytes);
        state.last_reported = Some(bytes);

        let handlers = self.handlers();
        let progress = handlers.progress.clone();
        let delegate = handlers.delegate.clone();
        drop(handlers);
        if progress.is_none() && delegate.is_none() {
            return;
        }

        let task = self.task();
        let job: Job = Box::new(move || {
            if let Some(progress) = progress {
                progress(bytes, total);
            }
            if let Some(delegate) = delegate {
                delegate.progress(&task, bytes, total);
            }
        });
        deliver(core, job, deferred);
    }

    /// Enter the terminal state matching `outcome` and post its callback
    fn conclude(
        self: &Arc<Self>,
        core: Option<&Arc<SessionCore>>,
        state: &mut TaskState,
        outcome: Result<String, SessionError>,
        deferred: &mut Vec<Job>,
    ) {
        let mut handlers = self.handlers();
        let delegate = handlers.delegate.take();
        let success = handlers.success.take();
        let failure = handlers.failure.take();
        handlers.progress = None;
        drop(handlers);

        let task = self.task();
        let job: Job = match outcome {
            Ok(path) => {
                info!(task = %self.id, path = %path, "transfer completed");
                state.status = TransferStatus::Completed;
                state.final_path = Some(path.clone());
                Box::new(move || {
                    if let Some(success) = success {
                        success(path.clone());
                    }
                    if let Some(delegate) = delegate {
                        delegate.succeeded(&task, &path);
                    }
                })
            }
            Err(error) => {
                state.status = if error.is_cancelled() {
                    info!(task = %self.id, "transfer cancelled");
                    TransferStatus::Cancelled
                } else {
                    warn!(task = %self.id, error = %error, "transfer failed");
                    TransferStatus::Failed
                };
                state.error = Some(error.clone());
                Box::new(move || {
                    if let Some(failure) = failure {
                        failure(error.clone());
                    }
                    if let Some(delegate) = delegate {
                        delegate.failed(&task, &error);
                    }
                })
            }
        };
        deliver(core, job, deferred);
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// End the task with `error` unless it already finished
    fn fail(self: &Arc<Self>, core: Option<&Arc<SessionCore>>, error: SessionError) {
        let mut deferred = Vec::new();
        let io = {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return;
            }
            let io = state.io.take();
            self.conclude(core, &mut state, Err(error), &mut deferred);
            io
        };
        let cancelled = self.units.cancel_all();
        if cancelled > 0 {
            debug!(task = %self.id, units = cancelled, "cancelled pending transfer units");
        }
        if let Some(io) = io {
            discard_io(core, io);
        }
        run_deferred(deferred);
    }

    /// Cancel from any non-terminal state; a no-op afterwards
    pub(crate) fn cancel(self: &Arc<Self>) {
        let core = self.session.upgrade();
        self.fail(core.as_ref(), SessionError::cancelled());
    }

    /// Queue one unit of work on the session's request workers
    fn schedule(self: &Arc<Self>, core: &Arc<SessionCore>, step: Step) {
        let unit = RequestHandle::new();
        if !self.units.insert(&unit) {
            self.fail(
                Some(core),
                SessionError::with_detail(
                    ErrorKind::TransferFailed,
                    "too many outstanding transfer operations",
                ),
            );
            return;
        }

        let task = Arc::clone(self);
        let token = unit.token().clone();
        let id = unit.id();
        let job: Job = Box::new(move || {
            task.units.remove(id);
            if token.is_cancelled() {
                debug!(task = %task.id, "skipping cancelled transfer unit");
                return;
            }
            let Some(core) = task.session.upgrade() else {
                task.fail(None, SessionError::cancelled());
                return;
            };
            match step {
                Step::Prepare => task.prepare(&core),
                Step::Chunk => task.run_chunk(&core),
            }
        });

        if core.enqueue(job).is_err() {
            self.units.remove(id);
            self.fail(Some(core), SessionError::cancelled());
        }
    }

    fn prepare(self: &Arc<Self>, core: &Arc<SessionCore>) {
        let prepared = match self.direction {
            TransferDirection::Download => {
                download::prepare(core, &self.remote_path, &self.local_path, self.id)
            }
            TransferDirection::Upload => upload::prepare(core, &self.local_path, &self.remote_path),
        };
        match prepared {
            Ok(io) => self.advance(core, io),
            Err(error) => self.fail(Some(core), error),
        }
    }

    fn run_chunk(self: &Arc<Self>, core: &Arc<SessionCore>) {
        let mut io = {
            let mut state = self.lock();
            match state.status {
                TransferStatus::Running => {}
                TransferStatus::Suspended => {
                    state.parked = true;
                    return;
                }
                _ => return,
            }
            match state.io.take() {
                Some(io) => io,
                None => return,
            }
        };

        match io.transfer_chunk() {
            Ok(0) => self.complete(core, io),
            Ok(_) => self.advance(core, io),
            Err(error) => {
                io.abandon();
                self.fail(Some(core), error);
            }
        }
    }

    /// Hand `io` back after a unit, report progress, and queue the next chunk
    /// unless the task was suspended or finished meanwhile
    fn advance(self: &Arc<Self>, core: &Arc<SessionCore>, io: Box<dyn TransferIo>) {
        let granularity = core.config().progress_granularity.max(1);
        let mut deferred = Vec::new();
        let next = {
            let mut state = self.lock();
            if state.status.is_terminal() {
                Err(io)
            } else {
                state.bytes_transferred = io.offset();
                state.total_bytes = io.total_bytes();
                match state.progress_mark {
                    // Progress is counted from where this run started
                    None => state.progress_mark = Some(state.bytes_transferred),
                    Some(last) if state.bytes_transferred.saturating_sub(last) >= granularity => {
                        self.post_progress(Some(core), &mut state, &mut deferred);
                    }
                    Some(_) => {}
                }
                let running = state.status == TransferStatus::Running;
                state.parked = !running;
                state.io = Some(io);
                Ok(running)
            }
        };
        run_deferred(deferred);

        match next {
            Ok(true) => self.schedule(core, Step::Chunk),
            Ok(false) => debug!(task = %self.id, "transfer parked"),
            // Finished while this unit was doing I/O
            Err(mut io) => io.abandon(),
        }
    }

    fn complete(self: &Arc<Self>, core: &Arc<SessionCore>, mut io: Box<dyn TransferIo>) {
        if let Err(error) = io.finish() {
            io.abandon();
            self.fail(Some(core), error);
            return;
        }

        let mut deferred = Vec::new();
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                drop(state);
                io.abandon();
                return;
            }
            if state.status == TransferStatus::Suspended {
                state.io = Some(io);
                state.parked = true;
                return;
            }

            state.bytes_transferred = io.offset();
            state.total_bytes = state.total_bytes.max(state.bytes_transferred);
            let outcome = io.promote();
            if outcome.is_ok() && state.last_reported != Some(state.bytes_transferred) {
                self.post_progress(Some(core), &mut state, &mut deferred);
            }
            self.conclude(Some(core), &mut state, outcome, &mut deferred);
        }
        run_deferred(deferred);
    }
}

/// Abandon `io` on a request worker, or inline if there is none left
fn discard_io(core: Option<&Arc<SessionCore>>, mut io: Box<dyn TransferIo>) {
    let Some(core) = core else {
        io.abandon();
        return;
    };
    if let Err(job) = core.enqueue(Box::new(move || io.abandon())) {
        job();
    }
}

// =============================================================================
// Transfer Task
// =============================================================================

/// One download or upload
///
/// Created by [`Session::download_task`](crate::Session::download_task) or
/// [`Session::upload_task`](crate::Session::upload_task) in the `Ready` state.
/// Register handlers, then [`start`](Self::start). Cheap to clone; clones
/// control the same transfer.
#[derive(Clone)]
pub struct TransferTask {
    shared: Arc<TaskShared>,
}

impl fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("remote_path", &self.shared.remote_path)
            .field("local_path", &self.shared.local_path)
            .field("status", &self.status())
            .finish()
    }
}

impl TransferTask {
    pub(crate) fn new(
        direction: TransferDirection,
        remote_path: &str,
        local_path: PathBuf,
        core: &Arc<SessionCore>,
    ) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: Uuid::new_v4(),
                direction,
                remote_path: remote_path.to_string(),
                local_path,
                session: Arc::downgrade(core),
                state: Mutex::new(TaskState {
                    status: TransferStatus::Ready,
                    bytes_transferred: 0,
                    total_bytes: 0,
                    progress_mark: None,
                    last_reported: None,
                    parked: false,
                    io: None,
                    final_path: None,
                    error: None,
                }),
                handlers: Mutex::new(Handlers::default()),
                units: OperationSet::bounded(MAX_TRACKED_OPERATIONS),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.shared.direction
    }

    /// Remote file (download) or remote destination (upload)
    pub fn remote_path(&self) -> &str {
        &self.shared.remote_path
    }

    /// Local destination (download) or local source (upload)
    pub fn local_path(&self) -> &Path {
        &self.shared.local_path
    }

    pub fn status(&self) -> TransferStatus {
        self.shared.lock().status
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.shared.lock().bytes_transferred
    }

    /// Expected size; 0 until the transfer has been prepared
    pub fn total_bytes(&self) -> u64 {
        self.shared.lock().total_bytes
    }

    /// Where the file ended up, once completed
    pub fn final_path(&self) -> Option<String> {
        self.shared.lock().final_path.clone()
    }

    /// Why the task failed or was cancelled
    pub fn error(&self) -> Option<SessionError> {
        self.shared.lock().error.clone()
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Called with (bytes transferred, bytes expected) as data moves
    pub fn on_progress(&self, handler: impl Fn(u64, u64) + Send + Sync + 'static) -> &Self {
        self.shared.handlers().progress = Some(Arc::new(handler));
        self
    }

    /// Called once with the final path when the transfer completes
    pub fn on_success(&self, handler: impl FnOnce(String) + Send + 'static) -> &Self {
        self.shared.handlers().success = Some(Box::new(handler));
        self
    }

    /// Called once if the transfer fails or is cancelled
    pub fn on_fail(&self, handler: impl FnOnce(SessionError) + Send + 'static) -> &Self {
        self.shared.handlers().failure = Some(Box::new(handler));
        self
    }

    pub fn set_delegate(&self, delegate: Arc<dyn TransferDelegate>) -> &Self {
        self.shared.handlers().delegate = Some(delegate);
        self
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Start a `Ready` task; returns false in any other state
    ///
    /// A task whose session has been closed or dropped is cancelled instead.
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        let core = shared.session.upgrade();
        let usable = core.as_ref().is_some_and(|core| !core.is_closed());
        {
            let mut state = shared.lock();
            if state.status != TransferStatus::Ready {
                return false;
            }
            if usable {
                state.status = TransferStatus::Running;
            }
        }

        match core {
            Some(core) if usable => {
                info!(
                    task = %shared.id,
                    direction = ?shared.direction,
                    remote = %shared.remote_path,
                    local = %shared.local_path.display(),
                    "transfer started"
                );
                shared.schedule(&core, Step::Prepare);
                true
            }
            core => {
                shared.fail(
                    core.as_ref(),
                    SessionError::with_detail(ErrorKind::Cancelled, "session is closed"),
                );
                false
            }
        }
    }

    /// Cancel the transfer; a no-op once it has finished
    ///
    /// The failure handler fires once with `Cancelled`. A partial download
    /// stays in the staging directory for a later resume.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Pause a running transfer at the next chunk boundary
    pub fn suspend(&self) -> bool {
        let mut state = self.shared.lock();
        if state.status != TransferStatus::Running {
            return false;
        }
        state.status = TransferStatus::Suspended;
        debug!(task = %self.shared.id, "transfer suspended");
        true
    }

    /// Continue a suspended transfer
    pub fn resume(&self) -> bool {
        let reschedule = {
            let mut state = self.shared.lock();
            if state.status != TransferStatus::Suspended {
                return false;
            }
            state.status = TransferStatus::Running;
            std::mem::take(&mut state.parked)
        };
        debug!(task = %self.shared.id, "transfer resumed");

        if reschedule {
            match self.shared.session.upgrade() {
                Some(core) => self.shared.schedule(&core, Step::Chunk),
                None => self.shared.fail(None, SessionError::cancelled()),
            }
        }
        true
    }
}
