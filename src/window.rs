//! C5: the per-session state machine.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/window.hpp` (the
//! declared surface; `window.cpp` in the same tree is an unfinished stub and
//! is not authoritative for behavior). A `Window` is reached only through
//! `WindowManager`, which owns it by strong reference and holds the only
//! path by which the host's callbacks are invoked.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::download::FileDownload;
use crate::http::Request;
use crate::image_compressor::{ImageCompressor, ImageCompressorEventHandler};
use crate::key::{decode_key, Key};
use crate::quality::{has_png_support, max_quality, MAX_QUALITY, MIN_QUALITY};
use crate::secrets::SecretGenerator;
use crate::task_queue::{DelayedTaskTag, TaskQueue};
use crate::upload::FileUpload;
use crate::{info_log, warning_log};

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
const INACTIVITY_TIMEOUT_SHORTENED: Duration = Duration::from_secs(5);
const COMPRESSOR_SEND_TIMEOUT: Duration = Duration::from_millis(200);
const DOWNLOAD_TTL: Duration = Duration::from_secs(30);
const CLIPBOARD_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const QUALITY_STEPS: &[u32] = &[10, 30, 50, 70, 90, 100];

/// Notified of state changes a Window cannot act on by itself: the embedded
/// browser lives on the other side of this boundary. Implemented by
/// `WindowManager`, which simply forwards every call onward to its own
/// event handler (the `Context`), tagging it with the originating handle.
pub trait WindowEventHandler: Send + Sync {
    /// The Window closed itself (was not closed via an external `close()`
    /// call). The Window is already in the `Closed` state by the time this
    /// fires.
    fn on_window_close(&self, window: u64);
    fn on_window_fetch_image(&self, window: u64, func: &mut dyn FnMut(&[u8], usize, usize, usize));
    fn on_window_resize(&self, window: u64, width: usize, height: usize);
    fn on_window_mouse_down(&self, window: u64, x: i64, y: i64, button: i32);
    fn on_window_mouse_up(&self, window: u64, x: i64, y: i64, button: i32);
    fn on_window_mouse_move(&self, window: u64, x: i64, y: i64);
    fn on_window_mouse_double_click(&self, window: u64, x: i64, y: i64, button: i32);
    fn on_window_mouse_wheel(&self, window: u64, x: i64, y: i64, delta: i64);
    fn on_window_mouse_leave(&self, window: u64, x: i64, y: i64);
    fn on_window_key_down(&self, window: u64, key: i32);
    fn on_window_key_up(&self, window: u64, key: i32);
    fn on_window_lose_focus(&self, window: u64);
    fn on_window_navigate(&self, window: u64, direction: i32);
    fn on_window_upload_file(&self, window: u64, name: String, file: Arc<FileUpload>);
    fn on_window_cancel_file_upload(&self, window: u64);
    /// Text currently held by the embedded browser's clipboard, offered to
    /// the legacy client through the paste half of the clipboard handshake.
    fn on_window_clipboard_paste_content(&self, window: u64) -> String;
    /// Text the legacy client copied, to be placed on the embedded
    /// browser's clipboard.
    fn on_window_clipboard_copy_content(&self, window: u64, text: String);
}

struct PendingDownload {
    file: Arc<FileDownload>,
    #[allow(dead_code)]
    expiry: DelayedTaskTag,
}

struct ClipboardExchange {
    token: String,
    #[allow(dead_code)]
    deadline: DelayedTaskTag,
}

struct WindowState {
    width: usize,
    height: usize,
    main_idx: u64,
    img_idx: u64,
    event_idx: u64,
    pre_prev_visited: bool,
    pre_next_visited: bool,
    mouse_buttons_down: HashSet<i32>,
    keys_down: HashSet<i32>,
    downloads: HashMap<u64, PendingDownload>,
    next_download_idx: u64,
    inactivity_tag: Option<DelayedTaskTag>,
    quality: u32,
    in_file_upload_mode: bool,
    iframe_queue: VecDeque<Box<dyn FnOnce(&Request) + Send>>,
    clipboard: Option<ClipboardExchange>,
}

impl WindowState {
    fn new(initial_quality: u32) -> WindowState {
        WindowState {
            width: 800,
            height: 600,
            main_idx: 0,
            img_idx: 0,
            event_idx: 0,
            pre_prev_visited: false,
            pre_next_visited: false,
            mouse_buttons_down: HashSet::new(),
            keys_down: HashSet::new(),
            downloads: HashMap::new(),
            next_download_idx: 0,
            inactivity_tag: None,
            quality: initial_quality,
            in_file_upload_mode: false,
            iframe_queue: VecDeque::new(),
            clipboard: None,
        }
    }
}

/// One browsing session. Reachable at
/// `/<handle>/<csrf_token>/...`; owned by a `WindowManager`, which is the
/// only thing permitted to route HTTP requests or host notifications to it.
pub struct Window {
    handle: u64,
    csrf_token: String,
    path_prefix: String,
    snake_oil_key: Vec<u8>,
    #[allow(dead_code)]
    program_name: String,
    allow_png: bool,
    event_handler: Weak<dyn WindowEventHandler>,
    task_queue: Arc<TaskQueue>,
    image_compressor: Arc<ImageCompressor>,
    upload_storage: Arc<crate::upload::UploadStorage>,
    state: Mutex<WindowState>,
    closed: AtomicBool,
}

impl Window {
    /// Constructs a fresh Window owned by whatever holds the returned `Arc`.
    /// Uses `Arc::new_cyclic` so the Window's own `ImageCompressor` can hold
    /// a `Weak<dyn ImageCompressorEventHandler>` back to it without a
    /// wrapper type.
    pub fn new(
        event_handler: Weak<dyn WindowEventHandler>,
        handle: u64,
        secret_gen: &SecretGenerator,
        task_queue: Arc<TaskQueue>,
        program_name: String,
        allow_png: bool,
        initial_quality: u32,
        upload_storage: Arc<crate::upload::UploadStorage>,
    ) -> Arc<Window> {
        crate::require!(handle != 0, "window handle must be nonzero");
        crate::require!(
            (MIN_QUALITY..=MAX_QUALITY).contains(&initial_quality),
            "initial quality {} out of range",
            initial_quality
        );

        let csrf_token = secret_gen.csrf_token();
        let path_prefix = format!("/{}/{}/", handle, csrf_token);
        let snake_oil_key = secret_gen.snake_oil_cipher_key();

        Arc::new_cyclic(|weak_self| {
            let compressor_handler: Weak<dyn ImageCompressorEventHandler> = weak_self.clone();
            let image_compressor =
                ImageCompressor::new(compressor_handler, Arc::clone(&task_queue), COMPRESSOR_SEND_TIMEOUT, initial_quality);
            Window {
                handle,
                csrf_token,
                path_prefix,
                snake_oil_key,
                program_name,
                allow_png,
                event_handler,
                task_queue,
                image_compressor,
                upload_storage,
                state: Mutex::new(WindowState::new(initial_quality)),
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the Window without notifying the host (the caller is either
    /// the host itself via `WindowManager::close_window`, or a teardown path
    /// that will notify some other way). Idempotent per SPEC_FULL.md §9's
    /// decision #1: only the call that flips the flag from false to true
    /// does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.image_compressor.stop_fetching();
        let mut state = self.state.lock().unwrap();
        state.inactivity_tag = None;
        state.clipboard = None;
        state.downloads.clear();
    }

    /// Closes the Window and, unless this call lost the idempotency race,
    /// notifies the host exactly once.
    fn self_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.image_compressor.stop_fetching();
        {
            let mut state = self.state.lock().unwrap();
            state.inactivity_tag = None;
            state.clipboard = None;
            state.downloads.clear();
        }
        if let Some(handler) = self.event_handler.upgrade() {
            handler.on_window_close(self.handle);
        }
    }

    /// Serves the very first response after the host accepts a new-window
    /// request: a redirect into this Window's own prefix
    /// (`GET / → 303 Location: /1/<csrf>/`).
    pub fn handle_initial_forward_http_request(self: &Arc<Self>, request: Arc<Request>) {
        request.send_redirect(303, self.path_prefix.clone());
    }

    /// Creates a popup Window sharing this Window's program name and PNG
    /// capability, but with fresh per-session secrets.
    pub fn create_popup(self: &Arc<Self>, popup_handle: u64, secret_gen: &SecretGenerator) -> Arc<Window> {
        let quality = self.image_compressor.quality();
        Window::new(
            Weak::clone(&self.event_handler),
            popup_handle,
            secret_gen,
            Arc::clone(&self.task_queue),
            self.program_name.clone(),
            self.allow_png,
            quality,
            Arc::clone(&self.upload_storage),
        )
    }

    pub fn notify_view_changed(self: &Arc<Self>) {
        self.image_compressor.update_notify();
    }

    pub fn set_cursor(self: &Arc<Self>, cursor_signal: i32) {
        self.image_compressor.set_cursor_signal(cursor_signal);
    }

    /// Offered quality labels and the index of the currently selected one.
    /// Always available — grounded on
    /// `window_manager.cpp`'s `needsClipboardButtonQuery`, which always
    /// returns `true` for an existing window; this crate applies the same
    /// "no host gating, just render it" treatment to quality selection.
    pub fn quality_selector_options(&self) -> (Vec<String>, usize) {
        let mut options: Vec<String> = QUALITY_STEPS.iter().map(|q| q.to_string()).collect();
        if self.allow_png {
            options.push("PNG".to_string());
        }
        let current = self.image_compressor.quality();
        let label = if current == MAX_QUALITY { "PNG".to_string() } else { current.to_string() };
        let idx = options.iter().position(|o| o == &label).unwrap_or(0);
        (options, idx)
    }

    pub fn quality_changed(self: &Arc<Self>, quality_idx: usize) {
        let (options, _) = self.quality_selector_options();
        let Some(label) = options.get(quality_idx) else { return };
        let quality = if label == "PNG" { MAX_QUALITY } else { label.parse().unwrap_or(MAX_QUALITY - 1) };
        let quality = quality.min(max_quality(self.allow_png));
        self.image_compressor.set_quality(quality);
        self.state.lock().unwrap().quality = quality;
    }

    /// Starts a clipboard handshake: enqueues an iframe carrying a small
    /// paste/copy form, tagged with a fresh single-use token that expires
    /// after ~1s (SPEC_FULL.md §9 decision #3).
    pub fn clipboard_button_pressed(self: &Arc<Self>) {
        let Some(handler) = self.event_handler.upgrade() else { return };
        let paste_content = handler.on_window_clipboard_paste_content(self.handle);
        let token = generate_clipboard_token();

        let self_clone = Arc::clone(self);
        let token_for_tag = token.clone();
        let deadline = self.task_queue.post_delayed(CLIPBOARD_HANDSHAKE_TIMEOUT, move || {
            self_clone.expire_clipboard_token(&token_for_tag);
        });

        {
            let mut state = self.state.lock().unwrap();
            state.clipboard = Some(ClipboardExchange { token: token.clone(), deadline });
        }
        self.update_inactivity_timeout(true);

        let path_prefix = self.path_prefix.clone();
        self.enqueue_iframe(Box::new(move |request| {
            let body = render_clipboard_page(&path_prefix, &token, &paste_content);
            request.send_html_response(200, body, true);
        }));
    }

    fn expire_clipboard_token(&self, token: &str) {
        let mut state = self.state.lock().unwrap();
        if state.clipboard.as_ref().map(|c| c.token.as_str()) == Some(token) {
            state.clipboard = None;
        }
    }

    fn handle_clipboard_request(self: &Arc<Self>, request: &Request) {
        let token = request.get_form_param("token");
        let text = request.get_form_param("text");

        let matches = {
            let mut state = self.state.lock().unwrap();
            let matches = match (&state.clipboard, &token) {
                (Some(exchange), Some(t)) => crate::secrets::constant_time_eq(exchange.token.as_bytes(), t.as_bytes()),
                _ => false,
            };
            if matches {
                state.clipboard = None; // single-use regardless of outcome
            }
            matches
        };
        self.update_inactivity_timeout(false);

        if !matches {
            request.send_text_response(400, "ERROR: Invalid or expired clipboard token\n".to_string());
            return;
        }

        if let Some(text) = text {
            if let Some(handler) = self.event_handler.upgrade() {
                handler.on_window_clipboard_copy_content(self.handle, text);
            }
        }
        request.send_text_response(200, "OK\n".to_string());
    }

    pub fn put_file_download(self: &Arc<Self>, file: Arc<FileDownload>) {
        let idx = {
            let mut state = self.state.lock().unwrap();
            let idx = state.next_download_idx;
            state.next_download_idx += 1;
            idx
        };

        let self_clone = Arc::clone(self);
        let expiry = self.task_queue.post_delayed(DOWNLOAD_TTL, move || {
            self_clone.state.lock().unwrap().downloads.remove(&idx);
        });
        self.state.lock().unwrap().downloads.insert(idx, PendingDownload { file: Arc::clone(&file), expiry });

        let path_prefix = self.path_prefix.clone();
        let name = file.name().to_string();
        self.enqueue_iframe(Box::new(move |request| {
            let body = render_download_page(&path_prefix, idx, &name);
            request.send_html_response(200, body, true);
        }));
    }

    pub fn start_file_upload(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.in_file_upload_mode {
            return false;
        }
        state.in_file_upload_mode = true;
        let main_idx = state.main_idx;
        drop(state);

        self.update_inactivity_timeout(true);
        self.notify_view_changed();

        let path_prefix = self.path_prefix.clone();
        self.enqueue_iframe(Box::new(move |request| {
            let body = render_upload_page(&path_prefix, main_idx);
            request.send_html_response(200, body, true);
        }));
        true
    }

    pub fn cancel_file_upload(self: &Arc<Self>) {
        let was_uploading = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut state.in_file_upload_mode, false)
        };
        if !was_uploading {
            return;
        }
        self.update_inactivity_timeout(false);
        self.notify_view_changed();
        if let Some(handler) = self.event_handler.upgrade() {
            handler.on_window_cancel_file_upload(self.handle);
        }
    }

    fn enqueue_iframe(&self, producer: Box<dyn FnOnce(&Request) + Send>) {
        self.state.lock().unwrap().iframe_queue.push_back(producer);
    }

    fn update_inactivity_timeout(self: &Arc<Self>, shortened: bool) {
        let timeout = if shortened { INACTIVITY_TIMEOUT_SHORTENED } else { INACTIVITY_TIMEOUT };
        let self_clone = Arc::clone(self);
        let tag = self.task_queue.post_delayed(timeout, move || {
            self_clone.inactivity_timeout_reached();
        });
        self.state.lock().unwrap().inactivity_tag = Some(tag);
    }

    fn inactivity_timeout_reached(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        info_log!("window {} closing due to inactivity", self.handle);
        self.self_close();
    }

    // ---- HTTP request routing -------------------------------------------

    pub fn handle_http_request(self: &Arc<Self>, request: Arc<Request>) {
        if self.closed.load(Ordering::SeqCst) {
            request.send_text_response(400, "ERROR: Window is closed\n".to_string());
            return;
        }

        let path = request.path().to_string();
        let Some(rest) = path.strip_prefix(self.path_prefix.as_str()) else {
            request.send_text_response(400, "ERROR: Invalid window path or CSRF token\n".to_string());
            return;
        };

        if rest.is_empty() {
            self.handle_main_page_request(&request);
        } else if rest == "image" {
            self.handle_image_request(&request);
        } else if let Some(r) = rest.strip_prefix("iframe/") {
            self.handle_iframe_request(&request, r);
        } else if let Some(r) = rest.strip_prefix("close/") {
            self.handle_close_request(&request, r);
        } else if rest == "prev/" {
            self.handle_prev_request(&request);
        } else if rest == "next/" {
            self.handle_next_request(&request);
        } else if rest == "clipboard" {
            self.handle_clipboard_request(&request);
        } else if let Some(r) = rest.strip_prefix("upload/") {
            self.handle_upload_request(request.clone(), r);
        } else if let Some(r) = rest.strip_prefix("download/") {
            self.handle_download_request(&request, r);
        } else {
            request.send_text_response(400, "ERROR: Unknown path\n".to_string());
        }
    }

    fn handle_main_page_request(self: &Arc<Self>, request: &Request) {
        self.update_inactivity_timeout(false);

        let (main_idx, width, height) = {
            let mut state = self.state.lock().unwrap();
            state.main_idx += 1;
            state.event_idx = 0;
            state.pre_prev_visited = false;
            state.pre_next_visited = false;
            (state.main_idx, state.width, state.height)
        };

        let (quality_options, quality_idx) = self.quality_selector_options();
        let body = render_main_page(
            &self.path_prefix,
            &self.csrf_token,
            &self.snake_oil_key,
            main_idx,
            width,
            height,
            &quality_options,
            quality_idx,
        );
        request.send_html_response(200, body, true);
    }

    fn handle_image_request(self: &Arc<Self>, request: &Request) {
        let main = request.get_query_param("main").and_then(|v| v.parse::<u64>().ok());
        let img = request.get_query_param("img").and_then(|v| v.parse::<u64>().ok());
        let imm = request.get_query_param("imm").and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
        let width = request.get_query_param("w").and_then(|v| v.parse::<i64>().ok());
        let height = request.get_query_param("h").and_then(|v| v.parse::<i64>().ok());
        let start_event_idx = request.get_query_param("EI").and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let events = request.get_query_param("e").unwrap_or_default();

        let (Some(main), Some(img)) = (main, img) else {
            request.send_text_response(400, "ERROR: Missing main/img parameters\n".to_string());
            return;
        };

        {
            let state = self.state.lock().unwrap();
            if main != state.main_idx || img <= state.img_idx {
                drop(state);
                request.send_text_response(400, "ERROR: Stale image request\n".to_string());
                return;
            }
        }
        self.state.lock().unwrap().img_idx = img;
        self.update_inactivity_timeout(false);

        self.handle_events(start_event_idx, &events);

        if let (Some(w), Some(h)) = (width, height) {
            let w = w.clamp(64, 4096) as usize;
            let h = h.clamp(64, 4096) as usize;
            let changed = {
                let mut state = self.state.lock().unwrap();
                let changed = state.width != w || state.height != h;
                state.width = w;
                state.height = h;
                changed
            };
            if changed {
                if let Some(handler) = self.event_handler.upgrade() {
                    handler.on_window_resize(self.handle, w, h);
                }
            }
        }

        let request_arc: Arc<dyn crate::image_compressor::ImageResponder> =
            unsafe_clone_request_as_image_responder(request);
        if imm == 1 {
            self.image_compressor.send_compressed_image_now(request_arc);
        } else {
            self.image_compressor.send_compressed_image_wait(request_arc);
        }
    }

    fn handle_events(self: &Arc<Self>, start_event_idx: u64, events: &str) {
        let Some(handler) = self.event_handler.upgrade() else { return };
        let (width, height) = {
            let state = self.state.lock().unwrap();
            (state.width, state.height)
        };

        let mut idx = start_event_idx;
        let mut highest_applied = None;
        for token in events.split('/').filter(|t| !t.is_empty()) {
            let skip = {
                let state = self.state.lock().unwrap();
                idx < state.event_idx
            };
            if !skip {
                if !self.apply_event_token(&handler, token, width, height) {
                    break; // invalid token aborts parsing for this request
                }
                highest_applied = Some(idx);
            }
            idx += 1;
        }

        if let Some(highest) = highest_applied {
            let mut state = self.state.lock().unwrap();
            state.event_idx = state.event_idx.max(highest + 1);
        }
    }

    fn apply_event_token(self: &Arc<Self>, handler: &Arc<dyn WindowEventHandler>, token: &str, width: usize, height: usize) -> bool {
        let mut parts = token.split('_');
        let Some(name) = parts.next() else { return false };
        let args: Vec<&str> = parts.collect();

        let clamp_coord = |v: i64, max: i64| v.clamp(-1000, max + 1000);

        match name {
            "MDN" | "MUP" | "MDBL" => {
                let (Some(x), Some(y)) = (parse_arg::<i64>(&args, 0), parse_arg::<i64>(&args, 1)) else { return false };
                let x = clamp_coord(x, width as i64);
                let y = clamp_coord(y, height as i64);
                if name == "MDBL" {
                    handler.on_window_mouse_double_click(self.handle, x, y, 0);
                    return true;
                }
                let Some(button) = parse_arg::<i32>(&args, 2) else { return false };
                if !(0..=2).contains(&button) {
                    return false;
                }
                let mut state = self.state.lock().unwrap();
                if name == "MDN" {
                    state.mouse_buttons_down.insert(button);
                    drop(state);
                    handler.on_window_mouse_down(self.handle, x, y, button);
                } else {
                    state.mouse_buttons_down.remove(&button);
                    drop(state);
                    handler.on_window_mouse_up(self.handle, x, y, button);
                }
                true
            }
            "MWH" => {
                let (Some(x), Some(y), Some(delta)) =
                    (parse_arg::<i64>(&args, 0), parse_arg::<i64>(&args, 1), parse_arg::<i64>(&args, 2))
                else {
                    return false;
                };
                let x = clamp_coord(x, width as i64);
                let y = clamp_coord(y, height as i64);
                let delta = delta.clamp(-1000, 1000);
                handler.on_window_mouse_wheel(self.handle, x, y, delta);
                true
            }
            "MMO" | "MOUT" => {
                let (Some(x), Some(y)) = (parse_arg::<i64>(&args, 0), parse_arg::<i64>(&args, 1)) else { return false };
                let x = clamp_coord(x, width as i64);
                let y = clamp_coord(y, height as i64);
                if name == "MMO" {
                    handler.on_window_mouse_move(self.handle, x, y);
                } else {
                    handler.on_window_mouse_leave(self.handle, x, y);
                }
                true
            }
            "KDN" | "KUP" | "KPR" => {
                let Some(raw) = parse_arg::<i64>(&args, 0) else { return false };
                let decoded = xor_key(raw, &self.snake_oil_key);
                let Some(key) = decode_key(decoded) else { return false };
                let code = key_code(key);
                let mut state = self.state.lock().unwrap();
                match name {
                    "KDN" => {
                        state.keys_down.insert(code);
                        drop(state);
                        handler.on_window_key_down(self.handle, code);
                    }
                    "KUP" => {
                        state.keys_down.remove(&code);
                        drop(state);
                        handler.on_window_key_up(self.handle, code);
                    }
                    _ => {
                        state.keys_down.insert(code);
                        drop(state);
                        handler.on_window_key_down(self.handle, code);
                        handler.on_window_key_up(self.handle, code);
                    }
                }
                true
            }
            "FOUT" => {
                handler.on_window_lose_focus(self.handle);
                true
            }
            _ => false,
        }
    }

    fn handle_iframe_request(self: &Arc<Self>, request: &Request, rest: &str) {
        let mut parts = rest.trim_end_matches('/').split('/');
        let main_idx = parts.next().and_then(|v| v.parse::<u64>().ok());
        let Some(main_idx) = main_idx else {
            request.send_text_response(400, "ERROR: Invalid iframe request\n".to_string());
            return;
        };
        if main_idx != self.state.lock().unwrap().main_idx {
            request.send_text_response(400, "ERROR: Stale iframe request\n".to_string());
            return;
        }
        let next = self.state.lock().unwrap().iframe_queue.pop_front();
        match next {
            Some(producer) => producer(request),
            None => request.send_text_response(400, "ERROR: No iframe content pending\n".to_string()),
        }
    }

    fn handle_close_request(self: &Arc<Self>, request: &Request, main_idx_str: &str) {
        let Ok(main_idx) = main_idx_str.trim_end_matches('/').parse::<u64>() else {
            request.send_text_response(400, "ERROR: Invalid close request\n".to_string());
            return;
        };
        if main_idx != self.state.lock().unwrap().main_idx {
            request.send_text_response(400, "ERROR: Stale close request\n".to_string());
            return;
        }
        request.send_text_response(200, "Window closed.\n".to_string());
        self.self_close();
    }

    fn handle_prev_request(self: &Arc<Self>, request: &Request) {
        let already_visited = {
            let mut state = self.state.lock().unwrap();
            let was = state.pre_prev_visited;
            state.pre_prev_visited = true;
            was
        };
        if !already_visited {
            request.send_html_response(200, render_pre_nav_page(&self.path_prefix, "prev"), true);
            return;
        }
        if let Some(handler) = self.event_handler.upgrade() {
            handler.on_window_navigate(self.handle, -1);
        }
        request.send_redirect(303, self.path_prefix.clone());
    }

    fn handle_next_request(self: &Arc<Self>, request: &Request) {
        let already_visited = {
            let mut state = self.state.lock().unwrap();
            let was = state.pre_next_visited;
            state.pre_next_visited = true;
            was
        };
        if !already_visited {
            request.send_html_response(200, render_pre_nav_page(&self.path_prefix, "next"), true);
            return;
        }
        if let Some(handler) = self.event_handler.upgrade() {
            handler.on_window_navigate(self.handle, 1);
        }
        request.send_redirect(303, self.path_prefix.clone());
    }

    fn handle_upload_request(self: &Arc<Self>, request: Arc<Request>, main_idx_str: &str) {
        let Ok(main_idx) = main_idx_str.trim_end_matches('/').parse::<u64>() else {
            request.send_text_response(400, "ERROR: Invalid upload request\n".to_string());
            return;
        };
        let in_upload_mode = {
            let state = self.state.lock().unwrap();
            main_idx == state.main_idx && state.in_file_upload_mode
        };
        if !in_upload_mode {
            request.send_text_response(400, "ERROR: Not expecting a file upload\n".to_string());
            return;
        }

        let content_type = request.content_type().unwrap_or_default().to_string();
        let body = request.body().to_vec();
        match parse_multipart_upload(&content_type, body) {
            Some((name, data)) => {
                if let Some(handler) = self.event_handler.upgrade() {
                    let storage = self.upload_storage();
                    if let Some(storage) = storage {
                        if let Some(upload) = storage.upload(&name, &data) {
                            handler.on_window_upload_file(self.handle, name, upload);
                        }
                    }
                }
                self.cancel_file_upload();
                request.send_text_response(200, "OK\n".to_string());
            }
            None => {
                request.send_text_response(400, "ERROR: Could not parse uploaded file\n".to_string());
            }
        }
    }

    /// Upload storage is owned by the Context and shared by every Window it
    /// creates, backed by one per-Context temp directory.
    fn upload_storage(&self) -> Option<Arc<crate::upload::UploadStorage>> {
        Some(Arc::clone(&self.upload_storage))
    }

    fn handle_download_request(self: &Arc<Self>, request: &Request, idx_str: &str) {
        let Ok(idx) = idx_str.trim_end_matches('/').parse::<u64>() else {
            request.send_text_response(400, "ERROR: Invalid download request\n".to_string());
            return;
        };
        let file = self.state.lock().unwrap().downloads.get(&idx).map(|d| Arc::clone(&d.file));
        match file {
            Some(file) => file.serve(request),
            None => request.send_text_response(404, "ERROR: Download not found or expired\n".to_string()),
        }
    }
}

impl ImageCompressorEventHandler for Window {
    fn fetch_image(&self, func: &mut dyn FnMut(&[u8], usize, usize, usize)) {
        let Some(handler) = self.event_handler.upgrade() else { return };
        handler.on_window_fetch_image(self.handle, func);
    }

    fn render_gui(&self, data: &mut [u8], width: usize, height: usize) {
        if self.state.lock().unwrap().in_file_upload_mode {
            crate::gui::render_upload_mode_gui(data, width, height);
        }
    }
}

fn parse_arg<T: std::str::FromStr>(args: &[&str], idx: usize) -> Option<T> {
    args.get(idx).and_then(|s| s.parse().ok())
}

fn xor_key(raw: i64, key: &[u8]) -> i32 {
    if key.is_empty() {
        return raw as i32;
    }
    let mut result = raw;
    for (i, &byte) in key.iter().enumerate().take(8) {
        result ^= (byte as i64) << (i * 8);
    }
    result as i32
}

fn key_code(key: Key) -> i32 {
    match key {
        Key::Named(named) => named as i32,
        Key::Char(c) => c as i32,
    }
}

fn generate_clipboard_token() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..20).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

fn parse_multipart_upload(content_type: &str, body: Vec<u8>) -> Option<(String, Vec<u8>)> {
    let boundary = multer::parse_boundary(content_type).ok()?;
    let stream = futures::stream::once(async move { Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from(body)) });
    let mut multipart = multer::Multipart::new(stream, boundary);
    futures::executor::block_on(async {
        while let Ok(Some(field)) = multipart.next_field().await {
            let filename = field.file_name().unwrap_or("file").to_string();
            if let Ok(data) = field.bytes().await {
                return Some((filename, data.to_vec()));
            }
        }
        None
    })
}

/// `Request` is only ever handed to `Arc<dyn ImageResponder>`/`Arc<dyn
/// DownloadResponder>` consumers as the *original* `Arc<Request>` the HTTP
/// layer produced; this helper just re-wraps the same allocation under the
/// narrower trait object so the compressor's API (which wants
/// `Arc<dyn ImageResponder>`) is satisfied without cloning the request body.
fn unsafe_clone_request_as_image_responder(request: &Arc<Request>) -> Arc<dyn crate::image_compressor::ImageResponder> {
    Arc::clone(request) as Arc<dyn crate::image_compressor::ImageResponder>
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn render_main_page(
    path_prefix: &str,
    csrf_token: &str,
    snake_oil_key: &[u8],
    main_idx: u64,
    width: usize,
    height: usize,
    quality_options: &[String],
    quality_idx: usize,
) -> String {
    let key_hex: String = snake_oil_key.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    let mut options_html = String::new();
    for (i, opt) in quality_options.iter().enumerate() {
        let selected = if i == quality_idx { " selected" } else { "" };
        options_html.push_str(&format!("<option value=\"{i}\"{selected}>{}</option>", escape_html(opt)));
    }
    format!(
        "<html><head><title>{prog}</title></head><body>\n\
         <form method=\"GET\" action=\"{prefix}image\">\n\
         <input type=\"hidden\" name=\"csrf\" value=\"{csrf}\">\n\
         <input type=\"hidden\" name=\"snakeOilKey\" value=\"{key}\">\n\
         <img src=\"{prefix}image?main={main}&amp;img=1&amp;imm=1&amp;w={w}&amp;h={h}&amp;e=&amp;EI=0\" \
         width=\"{w}\" height=\"{h}\" alt=\"view\">\n\
         <select name=\"quality\">{options}</select>\n\
         <a href=\"{prefix}prev/\">Back</a> <a href=\"{prefix}next/\">Forward</a>\n\
         <a href=\"{prefix}close/{main}\">Close</a>\n\
         </form></body></html>",
        prog = "retrojsvice",
        prefix = path_prefix,
        csrf = csrf_token,
        key = key_hex,
        main = main_idx,
        w = width,
        h = height,
        options = options_html,
    )
}

fn render_pre_nav_page(path_prefix: &str, direction: &str) -> String {
    format!(
        "<html><body><form method=\"GET\" action=\"{prefix}{direction}/\">\
         <input type=\"submit\" value=\"Continue\"></form></body></html>",
        prefix = path_prefix,
        direction = direction,
    )
}

fn render_download_page(path_prefix: &str, idx: u64, name: &str) -> String {
    format!(
        "<html><body><a href=\"{prefix}download/{idx}\">Download {name}</a></body></html>",
        prefix = path_prefix,
        idx = idx,
        name = escape_html(name),
    )
}

fn render_upload_page(path_prefix: &str, main_idx: u64) -> String {
    format!(
        "<html><body><form method=\"POST\" action=\"{prefix}upload/{main}\" enctype=\"multipart/form-data\">\
         <input type=\"file\" name=\"file\"><input type=\"submit\" value=\"Upload\"></form></body></html>",
        prefix = path_prefix,
        main = main_idx,
    )
}

fn render_clipboard_page(path_prefix: &str, token: &str, paste_content: &str) -> String {
    format!(
        "<html><body><form method=\"POST\" action=\"{prefix}clipboard\">\
         <input type=\"hidden\" name=\"token\" value=\"{token}\">\
         <textarea name=\"text\">{content}</textarea>\
         <input type=\"submit\" value=\"Copy\"></form></body></html>",
        prefix = path_prefix,
        token = token,
        content = escape_html(paste_content),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct RecordingHandler {
        closes: AtomicU64,
        resizes: Mutex<Vec<(usize, usize)>>,
        keys_down: Mutex<Vec<i32>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler { closes: AtomicU64::new(0), resizes: Mutex::new(Vec::new()), keys_down: Mutex::new(Vec::new()) })
        }
    }

    impl WindowEventHandler for RecordingHandler {
        fn on_window_close(&self, _window: u64) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_window_fetch_image(&self, _window: u64, func: &mut dyn FnMut(&[u8], usize, usize, usize)) {
            func(&[255, 255, 255, 255], 1, 1, 4);
        }
        fn on_window_resize(&self, _window: u64, width: usize, height: usize) {
            self.resizes.lock().unwrap().push((width, height));
        }
        fn on_window_mouse_down(&self, _window: u64, _x: i64, _y: i64, _button: i32) {}
        fn on_window_mouse_up(&self, _window: u64, _x: i64, _y: i64, _button: i32) {}
        fn on_window_mouse_move(&self, _window: u64, _x: i64, _y: i64) {}
        fn on_window_mouse_double_click(&self, _window: u64, _x: i64, _y: i64, _button: i32) {}
        fn on_window_mouse_wheel(&self, _window: u64, _x: i64, _y: i64, _delta: i64) {}
        fn on_window_mouse_leave(&self, _window: u64, _x: i64, _y: i64) {}
        fn on_window_key_down(&self, _window: u64, key: i32) {
            self.keys_down.lock().unwrap().push(key);
        }
        fn on_window_key_up(&self, _window: u64, _key: i32) {}
        fn on_window_lose_focus(&self, _window: u64) {}
        fn on_window_navigate(&self, _window: u64, _direction: i32) {}
        fn on_window_upload_file(&self, _window: u64, _name: String, _file: Arc<FileUpload>) {}
        fn on_window_cancel_file_upload(&self, _window: u64) {}
        fn on_window_clipboard_paste_content(&self, _window: u64) -> String {
            String::new()
        }
        fn on_window_clipboard_copy_content(&self, _window: u64, _text: String) {}
    }

    fn test_window() -> (Arc<Window>, Arc<RecordingHandler>) {
        let handler = RecordingHandler::new();
        let weak: Weak<dyn WindowEventHandler> = Arc::downgrade(&handler) as Weak<dyn WindowEventHandler>;
        let task_queue = TaskQueue::new();
        let secret_gen = SecretGenerator::new();
        let upload_storage = Arc::new(crate::upload::UploadStorage::new(Arc::new(crate::upload::TempDir::new().unwrap())));
        let window = Window::new(weak, 1, &secret_gen, task_queue, "retrojsvice".to_string(), true, 101, upload_storage);
        (window, handler)
    }

    #[test]
    fn path_prefix_embeds_handle_and_csrf_token() {
        let (window, _handler) = test_window();
        assert!(window.path_prefix.starts_with("/1/"));
        assert_eq!(window.csrf_token.len(), 20);
    }

    #[test]
    fn close_is_idempotent_and_notifies_host_once() {
        let (window, handler) = test_window();
        window.self_close();
        window.self_close();
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert!(window.is_closed());
    }

    #[test]
    fn wrong_prefix_yields_400() {
        let (window, _handler) = test_window();
        let (request, rx) = test_request("GET", "/wrong/prefix/");
        window.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 400);
    }

    #[test]
    fn stale_image_request_is_rejected() {
        let (window, _handler) = test_window();
        let (main_request, main_rx) = test_request("GET", &window.path_prefix);
        window.handle_http_request(main_request);
        assert_eq!(main_rx.recv().unwrap(), 200);

        let path = format!("{}image?main=99&img=1&imm=1&w=800&h=600&e=&EI=0", window.path_prefix);
        let (request, rx) = test_request("GET", &path);
        window.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 400);
    }

    #[test]
    fn resize_is_reported_once_per_change() {
        let (window, handler) = test_window();
        let (main_request, main_rx) = test_request("GET", &window.path_prefix);
        window.handle_http_request(main_request);
        assert_eq!(main_rx.recv().unwrap(), 200);

        let path = format!("{}image?main=1&img=1&imm=1&w=320&h=240&e=&EI=0", window.path_prefix);
        let (request, rx) = test_request("GET", &path);
        window.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 200);
        assert_eq!(handler.resizes.lock().unwrap().as_slice(), &[(320, 240)]);
    }

    #[test]
    fn invalid_key_event_aborts_parsing_without_panicking() {
        let (window, _handler) = test_window();
        let (main_request, main_rx) = test_request("GET", &window.path_prefix);
        window.handle_http_request(main_request);
        assert_eq!(main_rx.recv().unwrap(), 200);

        let path = format!("{}image?main=1&img=1&imm=1&w=800&h=600&e=KDN_999999999/&EI=0", window.path_prefix);
        let (request, rx) = test_request("GET", &path);
        window.handle_http_request(request);
        assert_eq!(rx.recv().unwrap(), 200);
    }

    fn test_request(method: &str, path: &str) -> (Arc<Request>, std::sync::mpsc::Receiver<u32>) {
        // `Request` has no public constructor outside `http.rs`; `http::test_support::make_test_request`
        // exposes a crate-visible one for these tests.
        crate::http::test_support::make_test_request(method, path)
    }
}
