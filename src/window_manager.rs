//! C6: routes HTTP requests to Windows and mediates their lifecycle.
//!
//! Grounded on
//! `original_source/viceplugins/retrojsvice/src/window_manager.hpp`/`.cpp`.
//! `WindowManager` owns every open `Window` by strong reference and is
//! itself held by `Context` through a plain `Arc`; it only ever reaches
//! back to `Context` through the `Weak<dyn WindowManagerEventHandler>` it
//! was built with, so the two never form an ownership cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::bail;

use crate::download::FileDownload;
use crate::http::Request;
use crate::quality::has_png_support;
use crate::secrets::SecretGenerator;
use crate::task_queue::TaskQueue;
use crate::upload::{FileUpload, UploadStorage};
use crate::window::{Window, WindowEventHandler};
use crate::info_log;

/// Notified of program-visible window lifecycle and input events. Forwarded
/// from `WindowManager` (which itself receives them as `WindowEventHandler`
/// callbacks from individual Windows); implemented by `Context`.
pub trait WindowManagerEventHandler: Send + Sync {
    /// A client requested `GET /`. `Ok(handle)` creates the window;
    /// `Err(reason)` denies it with a host-supplied explanation (spec
    /// §4.6's "on deny, 503 with reason").
    fn on_create_window_request(&self) -> Result<u64, String>;
    /// Same as above, but for the `URINavigation` extension's
    /// `create_window_with_uri` entry point: the returned window's embedded
    /// browser should navigate to `uri` immediately.
    fn on_create_window_with_uri_request(&self, uri: String) -> Result<u64, String>;
    fn on_close_window(&self, window: u64);
    fn on_fetch_image(&self, window: u64, func: &mut dyn FnMut(&[u8], usize, usize, usize));
    fn on_resize_window(&self, window: u64, width: usize, height: usize);
    fn on_mouse_down(&self, window: u64, x: i64, y: i64, button: i32);
    fn on_mouse_up(&self, window: u64, x: i64, y: i64, button: i32);
    fn on_mouse_move(&self, window: u64, x: i64, y: i64);
    fn on_mouse_double_click(&self, window: u64, x: i64, y: i64, button: i32);
    fn on_mouse_wheel(&self, window: u64, x: i64, y: i64, delta: i64);
    fn on_mouse_leave(&self, window: u64, x: i64, y: i64);
    fn on_key_down(&self, window: u64, key: i32);
    fn on_key_up(&self, window: u64, key: i32);
    fn on_lose_focus(&self, window: u64);
    fn on_navigate(&self, window: u64, direction: i32);
    /// `URINavigation` extension: ask an existing window's embedded browser
    /// to navigate out-of-band, without going through the HTTP event
    /// protocol.
    fn on_navigate_to_uri(&self, window: u64, uri: String);
    fn on_upload_file(&self, window: u64, name: String, file: Arc<FileUpload>);
    fn on_cancel_file_upload(&self, window: u64);
    fn on_clipboard_paste_content_request(&self, window: u64) -> String;
    fn on_clipboard_copy_content(&self, window: u64, text: String);
}

/// Owns the `handle -> Window` map. Reachable only through
/// `Context`, which is the sole holder of the strong `Arc<WindowManager>`.
pub struct WindowManager {
    event_handler: Weak<dyn WindowManagerEventHandler>,
    windows: Mutex<HashMap<u64, Arc<Window>>>,
    closed: AtomicBool,
    secret_gen: SecretGenerator,
    task_queue: Arc<TaskQueue>,
    upload_storage: Arc<UploadStorage>,
    program_name: String,
    default_quality: u32,
}

impl WindowManager {
    pub fn new(
        event_handler: Weak<dyn WindowManagerEventHandler>,
        secret_gen: SecretGenerator,
        task_queue: Arc<TaskQueue>,
        upload_storage: Arc<UploadStorage>,
        program_name: String,
        default_quality: u32,
    ) -> Arc<WindowManager> {
        crate::require!(
            (crate::quality::MIN_QUALITY..=crate::quality::MAX_QUALITY).contains(&default_quality),
            "default quality {} out of range",
            default_quality
        );
        Arc::new(WindowManager {
            event_handler,
            windows: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            secret_gen,
            task_queue,
            upload_storage,
            program_name,
            default_quality,
        })
    }

    fn handler(&self) -> Arc<dyn WindowManagerEventHandler> {
        self.event_handler
            .upgrade()
            .expect("window manager event handler dropped while windows are still open")
    }

    fn require_open_and_tracked(&self, window: u64) {
        crate::require!(!self.closed.load(Ordering::SeqCst), "window manager already closed");
        crate::require!(self.windows.lock().unwrap().contains_key(&window), "unknown window {}", window);
    }

    fn find(&self, window: u64) -> Option<Arc<Window>> {
        self.windows.lock().unwrap().get(&window).cloned()
    }

    /// Closes every open Window and forgets the host event handler. After
    /// this returns, `WindowManager` will never call back into the host
    /// again.
    pub fn close(&self) {
        crate::require!(!self.closed.swap(true, Ordering::SeqCst), "window manager closed twice");

        let closing: Vec<(u64, Arc<Window>)> = self.windows.lock().unwrap().drain().collect();
        let handler = self.event_handler.upgrade();
        for (handle, window) in closing {
            info_log!("closing window {} due to plugin shutdown", handle);
            window.close();
            if let Some(handler) = &handler {
                handler.on_close_window(handle);
            }
        }
    }

    /// Routes one HTTP request: `GET /` starts the new-window flow; a
    /// numeric path prefix dispatches to the matching Window; anything else
    /// is a 400.
    pub fn handle_http_request(self: &Arc<Self>, request: Arc<Request>) {
        if self.closed.load(Ordering::SeqCst) {
            request.send_text_response(503, "ERROR: Service is shutting down\n".to_string());
            return;
        }

        if request.method() == "GET" && request.path() == "/" {
            self.handle_new_window_request(request, None);
            return;
        }

        match parse_window_handle(request.path()) {
            Some(handle) => match self.find(handle) {
                Some(window) => window.handle_http_request(request),
                None => request.send_text_response(400, "ERROR: Invalid window handle\n".to_string()),
            },
            None => request.send_text_response(400, "ERROR: Invalid request URI or method\n".to_string()),
        }
    }

    fn handle_new_window_request(self: &Arc<Self>, request: Arc<Request>, uri: Option<String>) {
        info_log!("new window requested by user");

        let result = match &uri {
            Some(uri) => self.handler().on_create_window_with_uri_request(uri.clone()),
            None => self.handler().on_create_window_request(),
        };

        match result {
            Ok(handle) => {
                crate::require!(handle != 0, "host returned a zero window handle");
                crate::require!(!self.windows.lock().unwrap().contains_key(&handle), "host reused an open window handle");

                info_log!("creating window {}", handle);
                let allow_png = has_png_support(request.user_agent());
                let weak_self: Weak<dyn WindowEventHandler> = weak_self_as_event_handler(self);
                let window = Window::new(
                    weak_self,
                    handle,
                    &self.secret_gen,
                    Arc::clone(&self.task_queue),
                    self.program_name.clone(),
                    allow_png,
                    self.default_quality,
                    Arc::clone(&self.upload_storage),
                );
                self.windows.lock().unwrap().insert(handle, Arc::clone(&window));

                if let Some(uri) = uri {
                    self.handler().on_navigate_to_uri(handle, uri);
                }
                window.handle_initial_forward_http_request(request);
            }
            Err(reason) => {
                info_log!("window creation denied by program (reason: {})", reason);
                request.send_text_response(503, format!("ERROR: Could not create window, reason: {}\n", reason));
            }
        }
    }

    /// `URINavigation` extension entry point mirroring the ordinary
    /// new-window flow, except the created window's embedded browser
    /// navigates to `uri` immediately.
    pub fn handle_new_window_with_uri_request(self: &Arc<Self>, request: Arc<Request>, uri: String) {
        if self.closed.load(Ordering::SeqCst) {
            request.send_text_response(503, "ERROR: Service is shutting down\n".to_string());
            return;
        }
        self.handle_new_window_request(request, Some(uri));
    }

    pub fn create_popup_window(&self, parent: u64, popup: u64) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("plugin is shutting down");
        }
        let parent_window = self.find(parent);
        crate::require!(parent_window.is_some(), "unknown parent window {}", parent);
        crate::require!(popup != 0, "popup window handle must be nonzero");
        crate::require!(!self.windows.lock().unwrap().contains_key(&popup), "popup window handle {} already in use", popup);

        info_log!("creating popup window {} with parent {} as requested by the program", popup, parent);
        let popup_window = parent_window.unwrap().create_popup(popup, &self.secret_gen);
        self.windows.lock().unwrap().insert(popup, popup_window);
        Ok(())
    }

    /// Idempotent and silent if `window` is already gone.
    pub fn close_window(&self, window: u64) {
        let removed = self.windows.lock().unwrap().remove(&window);
        if let Some(window) = removed {
            info_log!("closing window {} as requested by program", window.handle());
            window.close();
        }
    }

    pub fn notify_view_changed(&self, window: u64) {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().notify_view_changed();
    }

    pub fn set_cursor(&self, window: u64, cursor_signal: i32) {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().set_cursor(cursor_signal);
    }

    pub fn quality_selector_query(&self, window: u64) -> (Vec<String>, usize) {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().quality_selector_options()
    }

    pub fn quality_changed(&self, window: u64, quality_idx: usize) {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().quality_changed(quality_idx);
    }

    /// Always available for an open window (mirrors the source's stub,
    /// which never gates this on anything but the window's existence).
    pub fn needs_clipboard_button_query(&self, window: u64) -> bool {
        self.require_open_and_tracked(window);
        true
    }

    pub fn clipboard_button_pressed(&self, window: u64) {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().clipboard_button_pressed();
    }

    pub fn put_file_download(&self, window: u64, file: Arc<FileDownload>) {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().put_file_download(file);
    }

    pub fn start_file_upload(&self, window: u64) -> bool {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().start_file_upload()
    }

    pub fn cancel_file_upload(&self, window: u64) {
        self.require_open_and_tracked(window);
        self.find(window).unwrap().cancel_file_upload();
    }

    /// `URINavigation` extension: ask an open window's embedded browser to
    /// navigate, without touching any Window state.
    pub fn navigate_to_uri(&self, window: u64, uri: String) {
        self.require_open_and_tracked(window);
        self.handler().on_navigate_to_uri(window, uri);
    }
}

fn weak_self_as_event_handler(manager: &Arc<WindowManager>) -> Weak<dyn WindowEventHandler> {
    Arc::downgrade(manager) as Weak<dyn WindowEventHandler>
}

fn parse_window_handle(path: &str) -> Option<u64> {
    let rest = path.strip_prefix('/')?;
    let (first, _) = rest.split_once('/')?;
    if first.is_empty() || !first.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    first.parse().ok()
}

impl WindowEventHandler for WindowManager {
    fn on_window_close(&self, window: u64) {
        let existed = self.windows.lock().unwrap().remove(&window).is_some();
        crate::require!(existed, "onWindowClose for untracked window {}", window);
        if let Some(handler) = self.event_handler.upgrade() {
            handler.on_close_window(window);
        }
    }

    fn on_window_fetch_image(&self, window: u64, func: &mut dyn FnMut(&[u8], usize, usize, usize)) {
        self.require_open_and_tracked(window);
        self.handler().on_fetch_image(window, func);
    }

    fn on_window_resize(&self, window: u64, width: usize, height: usize) {
        self.require_open_and_tracked(window);
        self.handler().on_resize_window(window, width, height);
    }

    fn on_window_mouse_down(&self, window: u64, x: i64, y: i64, button: i32) {
        self.require_open_and_tracked(window);
        self.handler().on_mouse_down(window, x, y, button);
    }

    fn on_window_mouse_up(&self, window: u64, x: i64, y: i64, button: i32) {
        self.require_open_and_tracked(window);
        self.handler().on_mouse_up(window, x, y, button);
    }

    fn on_window_mouse_move(&self, window: u64, x: i64, y: i64) {
        self.require_open_and_tracked(window);
        self.handler().on_mouse_move(window, x, y);
    }

    fn on_window_mouse_double_click(&self, window: u64, x: i64, y: i64, button: i32) {
        self.require_open_and_tracked(window);
        self.handler().on_mouse_double_click(window, x, y, button);
    }

    fn on_window_mouse_wheel(&self, window: u64, x: i64, y: i64, delta: i64) {
        self.require_open_and_tracked(window);
        self.handler().on_mouse_wheel(window, x, y, delta);
    }

    fn on_window_mouse_leave(&self, window: u64, x: i64, y: i64) {
        self.require_open_and_tracked(window);
        self.handler().on_mouse_leave(window, x, y);
    }

    fn on_window_key_down(&self, window: u64, key: i32) {
        self.require_open_and_tracked(window);
        self.handler().on_key_down(window, key);
    }

    fn on_window_key_up(&self, window: u64, key: i32) {
        self.require_open_and_tracked(window);
        self.handler().on_key_up(window, key);
    }

    fn on_window_lose_focus(&self, window: u64) {
        self.require_open_and_tracked(window);
        self.handler().on_lose_focus(window);
    }

    fn on_window_navigate(&self, window: u64, direction: i32) {
        self.require_open_and_tracked(window);
        self.handler().on_navigate(window, direction);
    }

    fn on_window_upload_file(&self, window: u64, name: String, file: Arc<FileUpload>) {
        self.require_open_and_tracked(window);
        self.handler().on_upload_file(window, name, file);
    }

    fn on_window_cancel_file_upload(&self, window: u64) {
        self.require_open_and_tracked(window);
        self.handler().on_cancel_file_upload(window);
    }

    fn on_window_clipboard_paste_content(&self, window: u64) -> String {
        self.require_open_and_tracked(window);
        self.handler().on_clipboard_paste_content_request(window)
    }

    fn on_window_clipboard_copy_content(&self, window: u64, text: String) {
        self.require_open_and_tracked(window);
        self.handler().on_clipboard_copy_content(window, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct RecordingHandler {
        next_handle: AtomicU64,
        closes: Mutex<Vec<u64>>,
        deny_reason: Option<String>,
    }

    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler { next_handle: AtomicU64::new(1), closes: Mutex::new(Vec::new()), deny_reason: None })
        }

        fn denying(reason: &str) -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler {
                next_handle: AtomicU64::new(1),
                closes: Mutex::new(Vec::new()),
                deny_reason: Some(reason.to_string()),
            })
        }
    }

    impl WindowManagerEventHandler for RecordingHandler {
        fn on_create_window_request(&self) -> Result<u64, String> {
            match &self.deny_reason {
                Some(reason) => Err(reason.clone()),
                None => Ok(self.next_handle.fetch_add(1, Ordering::SeqCst)),
            }
        }
        fn on_create_window_with_uri_request(&self, _uri: String) -> Result<u64, String> {
            self.on_create_window_request()
        }
        fn on_close_window(&self, window: u64) {
            self.closes.lock().unwrap().push(window);
        }
        fn on_fetch_image(&self, _window: u64, func: &mut dyn FnMut(&[u8], usize, usize, usize)) {
            func(&[255, 255, 255, 255], 1, 1, 4);
        }
        fn on_resize_window(&self, _window: u64, _width: usize, _height: usize) {}
        fn on_mouse_down(&self, _window: u64, _x: i64, _y: i64, _button: i32) {}
        fn on_mouse_up(&self, _window: u64, _x: i64, _y: i64, _button: i32) {}
        fn on_mouse_move(&self, _window: u64, _x: i64, _y: i64) {}
        fn on_mouse_double_click(&self, _window: u64, _x: i64, _y: i64, _button: i32) {}
        fn on_mouse_wheel(&self, _window: u64, _x: i64, _y: i64, _delta: i64) {}
        fn on_mouse_leave(&self, _window: u64, _x: i64, _y: i64) {}
        fn on_key_down(&self, _window: u64, _key: i32) {}
        fn on_key_up(&self, _window: u64, _key: i32) {}
        fn on_lose_focus(&self, _window: u64) {}
        fn on_navigate(&self, _window: u64, _direction: i32) {}
        fn on_navigate_to_uri(&self, _window: u64, _uri: String) {}
        fn on_upload_file(&self, _window: u64, _name: String, _file: Arc<FileUpload>) {}
        fn on_cancel_file_upload(&self, _window: u64) {}
        fn on_clipboard_paste_content_request(&self, _window: u64) -> String {
            String::new()
        }
        fn on_clipboard_copy_content(&self, _window: u64, _text: String) {}
    }

    fn test_upload_storage() -> Arc<UploadStorage> {
        Arc::new(UploadStorage::new(Arc::new(crate::upload::TempDir::new().unwrap())))
    }

    fn test_manager() -> (Arc<WindowManager>, Arc<RecordingHandler>) {
        let handler = RecordingHandler::new();
        let weak: Weak<dyn WindowManagerEventHandler> = Arc::downgrade(&handler) as Weak<dyn WindowManagerEventHandler>;
        let manager = WindowManager::new(weak, SecretGenerator::new(), TaskQueue::new(), test_upload_storage(), "retrojsvice".to_string(), 101);
        (manager, handler)
    }

    #[test]
    fn root_get_creates_a_window_and_redirects_into_its_prefix() {
        let (manager, _handler) = test_manager();
        let (request, rx) = crate::http::test_support::make_test_request("GET", "/");
        manager.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 303);
        assert_eq!(manager.windows.lock().unwrap().len(), 1);
    }

    #[test]
    fn denied_window_creation_yields_503_with_reason() {
        let handler = RecordingHandler::denying("out of capacity");
        let weak: Weak<dyn WindowManagerEventHandler> = Arc::downgrade(&handler) as Weak<dyn WindowManagerEventHandler>;
        let manager =
            WindowManager::new(weak, SecretGenerator::new(), TaskQueue::new(), test_upload_storage(), "retrojsvice".to_string(), 101);
        let (request, rx) = crate::http::test_support::make_test_request("GET", "/");
        manager.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 503);
    }

    #[test]
    fn unknown_window_handle_is_400() {
        let (manager, _handler) = test_manager();
        let (request, rx) = crate::http::test_support::make_test_request("GET", "/42/whatever/");
        manager.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 400);
    }

    #[test]
    fn non_numeric_path_is_400() {
        let (manager, _handler) = test_manager();
        let (request, rx) = crate::http::test_support::make_test_request("GET", "/favicon.ico");
        manager.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 400);
    }

    #[test]
    fn close_notifies_host_for_every_open_window_exactly_once() {
        let (manager, handler) = test_manager();
        let (request, rx) = crate::http::test_support::make_test_request("GET", "/");
        manager.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 303);

        manager.close();
        assert_eq!(handler.closes.lock().unwrap().as_slice(), &[1]);
        assert!(manager.windows.lock().unwrap().is_empty());
    }

    #[test]
    fn close_window_is_idempotent_and_silent_when_already_gone() {
        let (manager, _handler) = test_manager();
        manager.close_window(999); // never existed; must not panic
    }

    #[test]
    fn requests_after_close_get_503() {
        let (manager, _handler) = test_manager();
        manager.close();
        let (request, rx) = crate::http::test_support::make_test_request("GET", "/");
        manager.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 503);
    }
}
