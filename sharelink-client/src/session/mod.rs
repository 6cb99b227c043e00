//! Sessions
//!
//! A [`Session`] is the caller's view of one device: where it is, which
//! credentials to present, and the queues its operations run on. The
//! authenticated handle itself lives in the shared [`SessionHandleCache`], so
//! any number of sessions presenting the same identity reuse one connection.
//!
//! Every operation takes a completion closure and returns immediately with a
//! [`RequestHandle`]. The work runs on the session's request workers and the
//! completion runs exactly once on its callback thread. `*_async` variants
//! wrap the same calls in a future.

mod connection;
mod operations;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use sharelink_common::{
    DEFAULT_PORT, ErrorKind, NameResolver, ProtocolEngine, RemoteFile, SessionError,
};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::cache::SessionHandleCache;
use crate::config::ClientConfig;
use crate::queue::{
    CallbackQueue, Job, OperationSet, RequestHandle, RequestQueue, panic_message,
};
use crate::transfers::{TaskShared, TransferDirection, TransferTask};
use crate::wrapper::SessionHandleWrapper;

// =============================================================================
// Options
// =============================================================================

/// Where and how to connect
#[derive(Clone)]
pub struct SessionOptions {
    /// NetBIOS or DNS name of the device; may be empty if `ip_address` is set
    pub host_name: String,
    /// IP address of the device; may be empty if `host_name` is set
    pub ip_address: String,
    pub port: u16,
    /// Empty user name and password request a guest logon
    pub user_name: String,
    pub password: String,
    pub domain: String,
    /// Look up whichever of host name / address is missing
    pub use_internal_name_resolution: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            ip_address: String::new(),
            port: DEFAULT_PORT,
            user_name: String::new(),
            password: String::new(),
            domain: String::new(),
            use_internal_name_resolution: true,
        }
    }
}

impl SessionOptions {
    /// Options for a device known by name
    pub fn for_host(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Default::default()
        }
    }

    /// Options for a device known by address
    pub fn for_address(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(
        mut self,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user_name = user_name.into();
        self.password = password.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("host_name", &self.host_name)
            .field("ip_address", &self.ip_address)
            .field("port", &self.port)
            .field("user_name", &self.user_name)
            .field("password", &"[REDACTED]")
            .field("domain", &self.domain)
            .field(
                "use_internal_name_resolution",
                &self.use_internal_name_resolution,
            )
            .finish()
    }
}

// =============================================================================
// Core
// =============================================================================

/// Mutable connection details of a session
struct ConnectionState {
    options: SessionOptions,
    wrapper: Option<Arc<SessionHandleWrapper>>,
    is_guest: bool,
}

/// State shared by a session, its queued work and its transfer tasks
pub(crate) struct SessionCore {
    engine: Arc<dyn ProtocolEngine>,
    cache: Arc<SessionHandleCache>,
    resolver: Option<Arc<dyn NameResolver>>,
    config: ClientConfig,
    connection: Mutex<ConnectionState>,
    requests: RequestQueue,
    callbacks: CallbackQueue,
    operations: OperationSet,
    tasks: Mutex<Vec<Weak<TaskShared>>>,
    closed: AtomicBool,
}

impl SessionCore {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn connection(&self) -> MutexGuard<'_, ConnectionState> {
        self.connection
            .lock()
            .expect("session connection lock poisoned")
    }

    /// Queue a unit of work whose result goes to `completion`
    ///
    /// The unit is skipped if cancelled before it starts; a unit cancelled
    /// while running still finishes but reports `Cancelled`.
    pub(crate) fn submit<T, W, C>(self: &Arc<Self>, work: W, completion: C) -> RequestHandle
    where
        T: Send + 'static,
        W: FnOnce(&SessionCore) -> Result<T, SessionError> + Send + 'static,
        C: FnOnce(Result<T, SessionError>) + Send + 'static,
    {
        let request = RequestHandle::new();
        if self.is_closed() {
            request.cancel();
            self.callbacks
                .post(move || completion(Err(SessionError::cancelled())));
            return request;
        }

        self.operations.insert(&request);
        let core = Arc::clone(self);
        let token = request.token().clone();
        let id = request.id();
        let job: Job = Box::new(move || {
            let result = if token.is_cancelled() {
                debug!(request = id, "skipping cancelled request");
                Err(SessionError::cancelled())
            } else {
                let result = panic::catch_unwind(AssertUnwindSafe(|| work(&core)))
                    .unwrap_or_else(|payload| {
                        Err(SessionError::with_detail(
                            ErrorKind::Unknown,
                            format!("operation panicked: {}", panic_message(payload.as_ref())),
                        ))
                    });
                match result {
                    _ if token.is_cancelled() => Err(SessionError::cancelled()),
                    result => result,
                }
            };
            core.operations.remove(id);
            core.callbacks.post(move || completion(result));
        });

        if let Err(job) = self.requests.submit(job) {
            // Queue already shut down: resolve as cancelled
            request.cancel();
            job();
        }
        request
    }

    /// Queue raw work on the request workers
    pub(crate) fn enqueue(&self, job: Job) -> Result<(), Job> {
        self.requests.submit(job)
    }

    /// Queue a callback, handing it back if the callback thread is gone
    pub(crate) fn try_post_callback(&self, callback: Job) -> Result<(), Job> {
        self.callbacks.try_post(callback)
    }

    pub(crate) fn register_task(&self, task: &Arc<TaskShared>) {
        let mut tasks = self.tasks.lock().expect("session task list lock poisoned");
        tasks.retain(|t| t.strong_count() > 0);
        tasks.push(Arc::downgrade(task));
    }

    /// Cancel every outstanding request and transfer task
    pub(crate) fn cancel_all(&self) {
        let requests = self.operations.cancel_all();
        let tasks: Vec<Arc<TaskShared>> = self
            .tasks
            .lock()
            .expect("session task list lock poisoned")
            .drain(..)
            .filter_map(|t| t.upgrade())
            .collect();
        debug!(requests, tasks = tasks.len(), "cancelling all outstanding work");
        for task in tasks {
            task.cancel();
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_all();
        let wrapper = self.connection().wrapper.take();
        if let Some(wrapper) = wrapper {
            wrapper.close();
        }
        self.requests.close();
        info!("session closed");
    }
}

// =============================================================================
// Session
// =============================================================================

/// Closes the core when the last `Session` clone goes away
struct SessionOwner {
    core: Arc<SessionCore>,
}

impl Drop for SessionOwner {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// Connection to one device
///
/// Cheap to clone; all clones share queues and connection state. Dropping
/// the last clone closes the session.
#[derive(Clone)]
pub struct Session {
    owner: Arc<SessionOwner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core().connection();
        f.debug_struct("Session")
            .field("options", &state.options)
            .field("connected", &state.wrapper.is_some())
            .finish()
    }
}

impl Session {
    /// Create a session; nothing is sent until the first operation
    ///
    /// `resolver` is used for missing host names or addresses when the
    /// options allow it; `None` falls back to the system resolver.
    pub fn new(
        options: SessionOptions,
        engine: Arc<dyn ProtocolEngine>,
        cache: Arc<SessionHandleCache>,
        resolver: Option<Arc<dyn NameResolver>>,
        config: ClientConfig,
    ) -> Self {
        let core = SessionCore {
            engine,
            cache,
            resolver,
            requests: RequestQueue::new(config.effective_concurrency()),
            callbacks: CallbackQueue::new(),
            config,
            connection: Mutex::new(ConnectionState {
                options,
                wrapper: None,
                is_guest: false,
            }),
            operations: OperationSet::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        Self {
            owner: Arc::new(SessionOwner {
                core: Arc::new(core),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.owner.core
    }

    pub fn host_name(&self) -> String {
        self.core().connection().options.host_name.clone()
    }

    pub fn ip_address(&self) -> String {
        self.core().connection().options.ip_address.clone()
    }

    pub fn port(&self) -> u16 {
        self.core().connection().options.port
    }

    pub fn user_name(&self) -> String {
        self.core().connection().options.user_name.clone()
    }

    pub fn domain(&self) -> String {
        self.core().connection().options.domain.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        self.core().config()
    }

    /// Replace the credentials used for future requests
    ///
    /// The session lets go of its current handle; the next request connects
    /// (or reuses a cached handle) under the new identity.
    pub fn set_login_credentials(&self, user_name: &str, password: &str, domain: &str) {
        let mut state = self.core().connection();
        state.options.user_name = user_name.to_string();
        state.options.password = password.to_string();
        state.options.domain = domain.to_string();
        state.wrapper = None;
        state.is_guest = false;
    }

    /// Whether the session holds a valid handle
    pub fn connected(&self) -> bool {
        self.core()
            .connection()
            .wrapper
            .as_ref()
            .is_some_and(|w| w.is_valid())
    }

    /// Whether the server accepted the logon as a guest
    pub fn is_guest(&self) -> bool {
        self.core().connection().is_guest
    }

    pub fn is_closed(&self) -> bool {
        self.core().is_closed()
    }

    /// Cancel every outstanding operation and transfer task
    ///
    /// Queued work never runs and completes with `Cancelled`; work already
    /// running finishes its current protocol call, then completes with
    /// `Cancelled`.
    pub fn cancel_all_requests(&self) {
        self.core().cancel_all();
    }

    /// Cancel everything, close the shared handle and stop the queues
    pub fn close(&self) {
        self.core().close();
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Connect and authenticate without doing anything else
    pub fn open_connection<C>(&self, completion: C) -> RequestHandle
    where
        C: FnOnce(Result<(), SessionError>) + Send + 'static,
    {
        self.core()
            .submit(|core| core.ensure_wrapper().map(|_| ()), completion)
    }

    /// Contents of a directory; the empty path lists the device's shares
    pub fn list_directory<C>(&self, path: &str, completion: C) -> RequestHandle
    where
        C: FnOnce(Result<Vec<RemoteFile>, SessionError>) + Send + 'static,
    {
        let path = path.to_string();
        self.core()
            .submit(move |core| core.list_directory(&path), completion)
    }

    /// Attributes of one item
    pub fn item_attributes<C>(&self, path: &str, completion: C) -> RequestHandle
    where
        C: FnOnce(Result<RemoteFile, SessionError>) + Send + 'static,
    {
        let path = path.to_string();
        self.core()
            .submit(move |core| core.item_attributes(&path), completion)
    }

    /// Rename or move an item within its share; yields the item at its new path
    pub fn move_item<C>(&self, from: &str, to: &str, completion: C) -> RequestHandle
    where
        C: FnOnce(Result<RemoteFile, SessionError>) + Send + 'static,
    {
        let (from, to) = (from.to_string(), to.to_string());
        self.core()
            .submit(move |core| core.move_item(&from, &to), completion)
    }

    /// Create a directory; yields the created directory
    pub fn create_directory<C>(&self, path: &str, completion: C) -> RequestHandle
    where
        C: FnOnce(Result<RemoteFile, SessionError>) + Send + 'static,
    {
        let path = path.to_string();
        self.core()
            .submit(move |core| core.create_directory(&path), completion)
    }

    /// Delete a file or an empty directory
    pub fn delete_item<C>(&self, path: &str, completion: C) -> RequestHandle
    where
        C: FnOnce(Result<(), SessionError>) + Send + 'static,
    {
        let path = path.to_string();
        self.core()
            .submit(move |core| core.delete_item(&path), completion)
    }

    pub async fn open_connection_async(&self) -> Result<(), SessionError> {
        completion(|tx| self.open_connection(tx)).await
    }

    pub async fn list_directory_async(&self, path: &str) -> Result<Vec<RemoteFile>, SessionError> {
        completion(|tx| self.list_directory(path, tx)).await
    }

    pub async fn item_attributes_async(&self, path: &str) -> Result<RemoteFile, SessionError> {
        completion(|tx| self.item_attributes(path, tx)).await
    }

    pub async fn move_item_async(&self, from: &str, to: &str) -> Result<RemoteFile, SessionError> {
        completion(|tx| self.move_item(from, to, tx)).await
    }

    pub async fn create_directory_async(&self, path: &str) -> Result<RemoteFile, SessionError> {
        completion(|tx| self.create_directory(path, tx)).await
    }

    pub async fn delete_item_async(&self, path: &str) -> Result<(), SessionError> {
        completion(|tx| self.delete_item(path, tx)).await
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Task downloading `remote_path` to `local_destination`
    ///
    /// If the destination is an existing directory the remote file name is
    /// appended; an existing file is never overwritten.
    pub fn download_task(
        &self,
        remote_path: &str,
        local_destination: impl Into<PathBuf>,
    ) -> TransferTask {
        self.transfer_task(
            TransferDirection::Download,
            remote_path,
            local_destination.into(),
        )
    }

    /// Task uploading `local_source` to `remote_destination`
    ///
    /// If the destination is an existing remote directory the local file name
    /// is appended; an existing remote file is never overwritten.
    pub fn upload_task(
        &self,
        local_source: impl Into<PathBuf>,
        remote_destination: &str,
    ) -> TransferTask {
        self.transfer_task(
            TransferDirection::Upload,
            remote_destination,
            local_source.into(),
        )
    }

    fn transfer_task(
        &self,
        direction: TransferDirection,
        remote_path: &str,
        local_path: PathBuf,
    ) -> TransferTask {
        let task = TransferTask::new(direction, remote_path, local_path, self.core());
        self.core().register_task(task.shared());
        task
    }
}

/// Bridge a completion closure to a future
async fn completion<T: Send + 'static>(
    start: impl FnOnce(Box<dyn FnOnce(Result<T, SessionError>) + Send>) -> RequestHandle,
) -> Result<T, SessionError> {
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await.unwrap_or_else(|_| Err(SessionError::cancelled()))
}
