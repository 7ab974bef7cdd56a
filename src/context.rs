//! C7: the top-level object owned by the C ABI.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/context.hpp`
//! (the full public surface and private state machine) and
//! `original_source/retrowebvice/src/context.cpp` (the simpler sibling
//! implementation, useful for the option-validation/logging shape). `Context`
//! owns C1 (`TaskQueue`), C2 (`HttpServer`), C4 (`SecretGenerator`), and C6
//! (`WindowManager`); it is the sole `WindowManagerEventHandler`, translating
//! every Window-level callback into whatever the host registered at `start`.
//!
//! One divergence from the source, already reflected in `window.rs`: the
//! source's `Context` owns clipboard CSRF/timeout state directly
//! (`clipboardCSRFToken_`, `clipboardRequests_`, `clipboardTimeout_`) and
//! exposes a single global `putClipboardContent(text)`. This port moved that
//! state onto each `Window` (a handshake token per Window rather than a
//! single Context-wide one), which composes more naturally with `Window`
//! already owning its own inactivity timer and iframe queue; `Context` has no
//! `put_clipboard_content` because nothing upstream of `Window` needs it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;

use crate::config::Config;
use crate::download::FileDownload;
use crate::http::{HttpServer, Request};
use crate::secrets::SecretGenerator;
use crate::task_queue::TaskQueue;
use crate::upload::{FileUpload, TempDir, UploadStorage};
use crate::window_manager::{WindowManager, WindowManagerEventHandler};
use crate::{info_log, require};

/// Host-supplied callbacks registered at [`Context::start`], mirroring the
/// source's `VicePluginAPI_Callbacks` struct. Every callback runs on the API
/// thread: it is invoked only from inside [`Context::pump_events`]'s
/// `TaskQueue::run_tasks` drain, except `needs_pump_events` (which the task
/// queue may call from any thread that just posted work) and
/// `on_shutdown_complete` (which fires from whichever thread's drain empties
/// the queue last, possibly a background shutdown thread, since by that
/// point thread discipline no longer matters).
pub struct ContextCallbacks {
    pub on_create_window_request: Box<dyn Fn() -> Result<u64, String> + Send + Sync>,
    pub on_close_window: Box<dyn Fn(u64) + Send + Sync>,
    pub on_fetch_image: Box<dyn Fn(u64, &mut dyn FnMut(&[u8], usize, usize, usize)) + Send + Sync>,
    pub on_resize_window: Box<dyn Fn(u64, usize, usize) + Send + Sync>,
    pub on_mouse_down: Box<dyn Fn(u64, i64, i64, i32) + Send + Sync>,
    pub on_mouse_up: Box<dyn Fn(u64, i64, i64, i32) + Send + Sync>,
    pub on_mouse_move: Box<dyn Fn(u64, i64, i64) + Send + Sync>,
    pub on_mouse_double_click: Box<dyn Fn(u64, i64, i64, i32) + Send + Sync>,
    pub on_mouse_wheel: Box<dyn Fn(u64, i64, i64, i64) + Send + Sync>,
    pub on_mouse_leave: Box<dyn Fn(u64, i64, i64) + Send + Sync>,
    pub on_key_down: Box<dyn Fn(u64, i32) + Send + Sync>,
    pub on_key_up: Box<dyn Fn(u64, i32) + Send + Sync>,
    pub on_lose_focus: Box<dyn Fn(u64) + Send + Sync>,
    pub on_navigate: Box<dyn Fn(u64, i32) + Send + Sync>,
    pub on_upload_file: Box<dyn Fn(u64, String, Arc<FileUpload>) + Send + Sync>,
    pub on_cancel_file_upload: Box<dyn Fn(u64) + Send + Sync>,
    pub on_clipboard_paste_content_request: Box<dyn Fn(u64) -> String + Send + Sync>,
    pub on_clipboard_copy_content: Box<dyn Fn(u64, String) + Send + Sync>,
    /// The host must call `pump_events()` soon after this fires.
    pub needs_pump_events: Box<dyn Fn() + Send + Sync>,
    pub on_shutdown_complete: Box<dyn Fn() + Send + Sync>,
}

/// Callbacks registered by [`Context::uri_navigation_enable`], mirroring the
/// source's `VicePluginAPI_URINavigation_Callbacks`. Present only when the
/// `"URINavigation"` extension has been enabled.
pub struct UriNavigationCallbacks {
    pub on_create_window_with_uri_request: Box<dyn Fn(String) -> Result<u64, String> + Send + Sync>,
    pub on_navigate_to_uri: Box<dyn Fn(u64, String) + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Pending,
    Running,
    ShuttingDown,
    ShutdownComplete,
}

struct Handles {
    task_queue: Arc<TaskQueue>,
    window_manager: Arc<WindowManager>,
    http_server: Arc<HttpServer>,
    #[allow(dead_code)]
    temp_dir: Arc<TempDir>,
    callbacks: Arc<ContextCallbacks>,
}

impl Clone for Handles {
    fn clone(&self) -> Handles {
        Handles {
            task_queue: Arc::clone(&self.task_queue),
            window_manager: Arc::clone(&self.window_manager),
            http_server: Arc::clone(&self.http_server),
            temp_dir: Arc::clone(&self.temp_dir),
            callbacks: Arc::clone(&self.callbacks),
        }
    }
}

/// Enforces the single-in-flight-API-call rule: the first call
/// captures the calling thread's identity, and a second call from any other
/// thread, or a reentrant call from the same thread, panics (a host
/// programming error, not a recoverable condition — see the glossary's "API
/// call reentrancy guard").
struct ApiLock<'a> {
    ctx: &'a Context,
}

impl<'a> ApiLock<'a> {
    fn acquire(ctx: &'a Context) -> ApiLock<'a> {
        let this_thread = std::thread::current().id();
        let wrong_thread = {
            let mut api_thread = ctx.api_thread.lock().unwrap();
            match *api_thread {
                Some(t) => t != this_thread,
                None => {
                    *api_thread = Some(this_thread);
                    false
                }
            }
        };
        require!(!wrong_thread, "retrojsvice API entry points must all be called from the same thread");

        let already_in_call = ctx.in_api_call.swap(true, Ordering::SeqCst);
        require!(!already_in_call, "retrojsvice API called reentrantly while another call is already in flight");

        ApiLock { ctx }
    }
}

impl<'a> Drop for ApiLock<'a> {
    fn drop(&mut self) {
        self.ctx.in_api_call.store(false, Ordering::SeqCst);
    }
}

/// Owns C1-C6 and orchestrates their startup/shutdown. One
/// `Context` exists per loaded plugin instance; the C ABI layer (`ffi.rs`)
/// holds it behind an `Arc` so `Weak<Context>` back-references (the
/// `WindowManagerEventHandler` impl below) never form a cycle.
pub struct Context {
    config: Config,
    program_name: String,
    api_thread: Mutex<Option<ThreadId>>,
    in_api_call: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    uri_navigation: Mutex<Option<UriNavigationCallbacks>>,
    handles: Mutex<Option<Handles>>,
}

impl Context {
    /// Validates `options` into a [`Config`]. Does not start any threads or
    /// bind any socket; that is deferred to [`Context::start`], matching the
    /// source's split between the constructor (pure option validation) and
    /// `start`.
    pub fn init(options: &[(String, String)], program_name: String) -> Result<Context, String> {
        let config = Config::parse(options).map_err(|e| e.to_string())?;
        info_log!("creating retrojsvice plugin context");
        Ok(Context {
            config,
            program_name,
            api_thread: Mutex::new(None),
            in_api_call: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::Pending),
            uri_navigation: Mutex::new(None),
            handles: Mutex::new(None),
        })
    }

    /// Documents the option table as (name, value spec, description,
    /// default) tuples, mirroring `Context::getOptionDocs`.
    pub fn option_docs() -> Vec<(String, String, String, String)> {
        vec![
            (
                "default-quality".to_string(),
                "PNG|10..100".to_string(),
                "initial image quality for new sessions".to_string(),
                "PNG".to_string(),
            ),
            (
                "http-listen-addr".to_string(),
                "IP:PORT".to_string(),
                "address the HTTP server listens on".to_string(),
                "127.0.0.1:8080".to_string(),
            ),
            (
                "http-max-threads".to_string(),
                "positive integer".to_string(),
                "HTTP worker thread pool size".to_string(),
                "4x the number of CPUs".to_string(),
            ),
            (
                "http-auth".to_string(),
                "USER:PASSWORD|env|<empty>".to_string(),
                "require HTTP Basic auth for all requests; 'env' reads BROWSERVICE_HTTP_AUTH_CREDENTIALS".to_string(),
                "".to_string(),
            ),
        ]
    }

    /// Enables the `"URINavigation"` extension. Must be called
    /// before [`Context::start`].
    pub fn uri_navigation_enable(&self, callbacks: UriNavigationCallbacks) {
        let _lock = ApiLock::acquire(self);
        require!(
            matches!(*self.lifecycle.lock().unwrap(), Lifecycle::Pending),
            "URINavigation_enable() must be called before start()"
        );
        *self.uri_navigation.lock().unwrap() = Some(callbacks);
    }

    pub fn is_uri_navigation_enabled(&self) -> bool {
        self.uri_navigation.lock().unwrap().is_some()
    }

    /// Initializes C1, C2, C4, C6, binds the HTTP listener, and transitions
    /// to `Running`. Must be called exactly once.
    pub fn start(self: &Arc<Context>, callbacks: ContextCallbacks) {
        let _lock = ApiLock::acquire(self);
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            require!(matches!(*lifecycle, Lifecycle::Pending), "start() called more than once");
            *lifecycle = Lifecycle::Running;
        }

        let callbacks = Arc::new(callbacks);
        let task_queue = TaskQueue::new();
        {
            let callbacks = Arc::clone(&callbacks);
            task_queue.set_needs_run_tasks_callback(move || (callbacks.needs_pump_events)());
        }

        let secret_gen = SecretGenerator::new();
        let temp_dir = Arc::new(TempDir::new().expect("failed to create upload scratch directory"));
        let upload_storage = Arc::new(UploadStorage::new(Arc::clone(&temp_dir)));

        let weak_self: Weak<Context> = Arc::downgrade(self);
        let window_manager = WindowManager::new(
            weak_self as Weak<dyn WindowManagerEventHandler>,
            secret_gen,
            Arc::clone(&task_queue),
            upload_storage,
            self.program_name.clone(),
            self.config.default_quality.as_numeric(),
        );

        // Every HTTP request is posted to the API thread rather than routed
        // on its own worker thread: core state, including every Window the
        // router dispatches to, may only be touched from inside `run_tasks()`.
        let uri_navigation_enabled = Arc::new(AtomicBool::new(self.is_uri_navigation_enabled()));
        let routing_queue = Arc::clone(&task_queue);
        let routing_manager = Arc::clone(&window_manager);
        let routing_uri_flag = Arc::clone(&uri_navigation_enabled);
        let on_request: Arc<dyn Fn(Arc<Request>) + Send + Sync> = Arc::new(move |request: Arc<Request>| {
            let manager = Arc::clone(&routing_manager);
            let uri_flag = Arc::clone(&routing_uri_flag);
            routing_queue.post(move || {
                if uri_flag.load(Ordering::SeqCst) && request.method() == "GET" && request.path() == "/" {
                    if let Some(uri) = request.get_query_param("uri") {
                        if !uri.is_empty() {
                            manager.handle_new_window_with_uri_request(request, uri);
                            return;
                        }
                    }
                }
                manager.handle_http_request(request);
            });
        });

        let http_server = HttpServer::start(
            self.config.http_listen_addr,
            self.config.http_max_threads,
            self.config.http_auth.clone(),
            on_request,
        )
        .expect("failed to bind retrojsvice HTTP listener");

        info_log!("retrojsvice plugin context started, listening on {}", self.config.http_listen_addr);

        *self.handles.lock().unwrap() = Some(Handles {
            task_queue,
            window_manager,
            http_server,
            temp_dir,
            callbacks,
        });
    }

    /// Runs `TaskQueue::run_tasks()` on the calling thread, which becomes (or
    /// must already be) the API thread. The host must call this whenever
    /// `needs_pump_events` fires.
    pub fn pump_events(&self) {
        let _lock = ApiLock::acquire(self);
        require!(!matches!(*self.lifecycle.lock().unwrap(), Lifecycle::Pending), "pump_events() called before start()");
        self.task_queue().run_tasks();
    }

    /// Begins the three-phase shutdown sequence: synchronously
    /// closes every Window (Phase A), then asynchronously shuts down the
    /// HTTP server (Phase B) and the task queue (Phase C) in turn, finally
    /// invoking `on_shutdown_complete`.
    pub fn shutdown(self: &Arc<Context>) {
        let _lock = ApiLock::acquire(self);
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            require!(matches!(*lifecycle, Lifecycle::Running), "shutdown() called while not running");
            *lifecycle = Lifecycle::ShuttingDown;
        }
        info_log!("retrojsvice plugin context shutdown initiated");

        let handles = self.handles();

        // Phase A: close every Window synchronously, delivering
        // `on_window_close` for each (WindowManager::close).
        handles.window_manager.close();

        // Phase B, then (chained) Phase C.
        let self_for_http_complete = Arc::clone(self);
        handles.http_server.shutdown(move || {
            self_for_http_complete.begin_task_queue_shutdown();
        });
    }

    fn begin_task_queue_shutdown(self: &Arc<Context>) {
        let handles = self.handles();
        let self_for_queue_complete = Arc::clone(self);
        handles.task_queue.shutdown(move || {
            self_for_queue_complete.finish_shutdown();
        });
    }

    fn finish_shutdown(self: &Arc<Context>) {
        let callbacks = self.handles().callbacks;
        *self.lifecycle.lock().unwrap() = Lifecycle::ShutdownComplete;
        info_log!("retrojsvice plugin context shutdown complete");
        (callbacks.on_shutdown_complete)();
    }

    pub fn create_popup_window(&self, parent: u64, popup: u64) -> anyhow::Result<()> {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().create_popup_window(parent, popup)
    }

    pub fn close_window(&self, window: u64) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().close_window(window);
    }

    pub fn notify_window_view_changed(&self, window: u64) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().notify_view_changed(window);
    }

    pub fn set_window_cursor(&self, window: u64, cursor_signal: i32) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().set_cursor(window, cursor_signal);
    }

    pub fn window_quality_selector_query(&self, window: u64) -> (Vec<String>, usize) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().quality_selector_query(window)
    }

    pub fn window_quality_changed(&self, window: u64, quality_idx: usize) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().quality_changed(window, quality_idx);
    }

    pub fn window_needs_clipboard_button_query(&self, window: u64) -> bool {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().needs_clipboard_button_query(window)
    }

    pub fn window_clipboard_button_pressed(&self, window: u64) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().clipboard_button_pressed(window);
    }

    /// Hands a host-produced file to `window` for download; downloaded
    /// files are owned by the host, so `cleanup` runs once the download's
    /// 30s TTL expires or the Window closes, whichever is first.
    pub fn put_file_download(&self, window: u64, name: &str, path: PathBuf, cleanup: impl FnOnce() + Send + 'static) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        let file = Arc::new(FileDownload::new(name, path, cleanup));
        self.window_manager().put_file_download(window, file);
    }

    pub fn start_file_upload(&self, window: u64) -> bool {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().start_file_upload(window)
    }

    pub fn cancel_file_upload(&self, window: u64) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        self.window_manager().cancel_file_upload(window);
    }

    /// `URINavigation` extension entry point: asks an existing Window's
    /// embedded browser to navigate out-of-band.
    pub fn navigate_to_uri(&self, window: u64, uri: String) {
        let _lock = ApiLock::acquire(self);
        self.require_running();
        require!(self.is_uri_navigation_enabled(), "navigate_to_uri() called without enabling the URINavigation extension");
        self.window_manager().navigate_to_uri(window, uri);
    }

    fn require_running(&self) {
        require!(matches!(*self.lifecycle.lock().unwrap(), Lifecycle::Running), "API call made while context is not running");
    }

    fn handles(&self) -> Handles {
        self.handles.lock().unwrap().clone().expect("Context API called before start()")
    }

    fn task_queue(&self) -> Arc<TaskQueue> {
        self.handles().task_queue
    }

    fn window_manager(&self) -> Arc<WindowManager> {
        self.handles().window_manager
    }

    fn callbacks(&self) -> Arc<ContextCallbacks> {
        self.handles().callbacks
    }

    #[cfg(test)]
    fn http_listen_addr(&self) -> SocketAddr {
        self.config.http_listen_addr
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        info_log!("destroying retrojsvice plugin context");
    }
}

impl WindowManagerEventHandler for Context {
    fn on_create_window_request(&self) -> Result<u64, String> {
        (self.callbacks().on_create_window_request)()
    }

    fn on_create_window_with_uri_request(&self, uri: String) -> Result<u64, String> {
        match self.uri_navigation.lock().unwrap().as_ref() {
            Some(nav) => (nav.on_create_window_with_uri_request)(uri),
            None => Err("URINavigation extension is not enabled".to_string()),
        }
    }

    fn on_close_window(&self, window: u64) {
        (self.callbacks().on_close_window)(window);
    }

    fn on_fetch_image(&self, window: u64, func: &mut dyn FnMut(&[u8], usize, usize, usize)) {
        (self.callbacks().on_fetch_image)(window, func);
    }

    fn on_resize_window(&self, window: u64, width: usize, height: usize) {
        (self.callbacks().on_resize_window)(window, width, height);
    }

    fn on_mouse_down(&self, window: u64, x: i64, y: i64, button: i32) {
        (self.callbacks().on_mouse_down)(window, x, y, button);
    }

    fn on_mouse_up(&self, window: u64, x: i64, y: i64, button: i32) {
        (self.callbacks().on_mouse_up)(window, x, y, button);
    }

    fn on_mouse_move(&self, window: u64, x: i64, y: i64) {
        (self.callbacks().on_mouse_move)(window, x, y);
    }

    fn on_mouse_double_click(&self, window: u64, x: i64, y: i64, button: i32) {
        (self.callbacks().on_mouse_double_click)(window, x, y, button);
    }

    fn on_mouse_wheel(&self, window: u64, x: i64, y: i64, delta: i64) {
        (self.callbacks().on_mouse_wheel)(window, x, y, delta);
    }

    fn on_mouse_leave(&self, window: u64, x: i64, y: i64) {
        (self.callbacks().on_mouse_leave)(window, x, y);
    }

    fn on_key_down(&self, window: u64, key: i32) {
        (self.callbacks().on_key_down)(window, key);
    }

    fn on_key_up(&self, window: u64, key: i32) {
        (self.callbacks().on_key_up)(window, key);
    }

    fn on_lose_focus(&self, window: u64) {
        (self.callbacks().on_lose_focus)(window);
    }

    fn on_navigate(&self, window: u64, direction: i32) {
        (self.callbacks().on_navigate)(window, direction);
    }

    fn on_navigate_to_uri(&self, window: u64, uri: String) {
        if let Some(nav) = self.uri_navigation.lock().unwrap().as_ref() {
            (nav.on_navigate_to_uri)(window, uri);
        }
    }

    fn on_upload_file(&self, window: u64, name: String, file: Arc<FileUpload>) {
        (self.callbacks().on_upload_file)(window, name, file);
    }

    fn on_cancel_file_upload(&self, window: u64) {
        (self.callbacks().on_cancel_file_upload)(window);
    }

    fn on_clipboard_paste_content_request(&self, window: u64) -> String {
        (self.callbacks().on_clipboard_paste_content_request)(window)
    }

    fn on_clipboard_copy_content(&self, window: u64, text: String) {
        (self.callbacks().on_clipboard_copy_content)(window, text);
    }
}
