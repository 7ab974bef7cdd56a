//! C8: the versioned `extern "C"` surface.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/vice_plugin_api.cpp`:
//! every exported symbol here mirrors one `vicePluginAPI_*` function from
//! that file (same name, same argument order), including the version
//! constant (`2_000_000`), the `isAPIVersionSupported`/`createVersionString`/
//! `createCreditsString`/`malloc`/`free` functions that don't forward to
//! [`Context`], and the `URINavigation` extension pair. Every exported
//! function is wrapped in [`ffi_guard`], mirroring that file's
//! `API_FUNC_START`/`API_FUNC_END` macros: an unexpected panic is reported
//! through [`logging::report_panic`] and then the process aborts, since a
//! panic crossing the ABI boundary is always a host/plugin programming
//! error with no safe way to unwind into C.
//!
//! String/buffer ownership crosses the boundary through [`libc::malloc`]/
//! [`libc::free`] rather than `CString::into_raw`/`from_raw`, so ownership
//! parity holds regardless of which allocator Rust's global allocator
//! happens to be backed by on a given platform.

use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

use crate::context::{Context, ContextCallbacks, UriNavigationCallbacks};
use crate::logging::{self, LogLevel};

const API_VERSION: u64 = 2_000_000;
const PLUGIN_VERSION: &str = "0.1.0";

fn panic_payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs `body`, converting any panic into a logged fatal error followed by
/// `abort()`. `default` is returned only in the impossible case where
/// `abort()` somehow returns.
fn ffi_guard<T>(default: T, body: impl FnOnce() -> T + std::panic::UnwindSafe) -> T {
    match std::panic::catch_unwind(body) {
        Ok(v) => v,
        Err(payload) => {
            logging::report_panic(&panic_payload_message(&payload));
            std::process::abort();
            #[allow(unreachable_code)]
            default
        }
    }
}

unsafe fn cstr_to_string(ptr: *const c_char) -> String {
    assert!(!ptr.is_null(), "unexpected null C string crossing the retrojsvice API");
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Allocates a NUL-terminated copy of `s` with `libc::malloc`, freeable by
/// the host via [`vicePluginAPI_free`].
fn create_malloc_string(s: &str) -> *mut c_char {
    let bytes = s.as_bytes();
    unsafe {
        let buf = libc::malloc(bytes.len() + 1) as *mut u8;
        if buf.is_null() {
            return std::ptr::null_mut();
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
        *buf.add(bytes.len()) = 0;
        buf as *mut c_char
    }
}

unsafe fn set_out_string(out: *mut *mut c_char, value: &str) {
    if !out.is_null() {
        *out = create_malloc_string(value);
    }
}

/// Wraps a host-supplied `void*` so it can be captured by the `Send + Sync`
/// closures `ContextCallbacks` requires. Sound because every callback here
/// is documented (mirroring the source) to run only while the host's
/// `VicePluginAPI_Context` is alive and only from the single API thread.
#[derive(Clone, Copy)]
struct HostData(*mut c_void);
unsafe impl Send for HostData {}
unsafe impl Sync for HostData {}

/// Host-supplied callback table passed to [`vicePluginAPI_start`]. Field
/// order and shape are an internal ABI detail of this plugin (not
/// prescribed verbatim by any header in the source tree), designed to
/// mirror the same out-param/return conventions the rest of this file uses
/// for `createPopupWindow`/`startFileUpload`.
#[repr(C)]
pub struct VicePluginAPI_Callbacks {
    pub create_window_request: extern "C" fn(data: *mut c_void, window_out: *mut u64) -> i32,
    pub close_window: extern "C" fn(data: *mut c_void, window: u64),
    pub fetch_image: extern "C" fn(
        data: *mut c_void,
        window: u64,
        send_image: extern "C" fn(send_data: *mut c_void, bgra: *const u8, width: usize, height: usize, pitch: usize),
        send_data: *mut c_void,
    ),
    pub resize_window: extern "C" fn(data: *mut c_void, window: u64, width: usize, height: usize),
    pub mouse_down: extern "C" fn(data: *mut c_void, window: u64, x: i64, y: i64, button: i32),
    pub mouse_up: extern "C" fn(data: *mut c_void, window: u64, x: i64, y: i64, button: i32),
    pub mouse_move: extern "C" fn(data: *mut c_void, window: u64, x: i64, y: i64),
    pub mouse_double_click: extern "C" fn(data: *mut c_void, window: u64, x: i64, y: i64, button: i32),
    pub mouse_wheel: extern "C" fn(data: *mut c_void, window: u64, x: i64, y: i64, delta: i64),
    pub mouse_leave: extern "C" fn(data: *mut c_void, window: u64, x: i64, y: i64),
    pub key_down: extern "C" fn(data: *mut c_void, window: u64, key: i32),
    pub key_up: extern "C" fn(data: *mut c_void, window: u64, key: i32),
    pub lose_focus: extern "C" fn(data: *mut c_void, window: u64),
    pub navigate: extern "C" fn(data: *mut c_void, window: u64, direction: i32),
    pub upload_file: extern "C" fn(data: *mut c_void, window: u64, name: *const c_char, path: *const c_char),
    pub cancel_file_upload: extern "C" fn(data: *mut c_void, window: u64),
    pub clipboard_paste_content_request: extern "C" fn(data: *mut c_void, window: u64) -> *mut c_char,
    pub clipboard_copy_content: extern "C" fn(data: *mut c_void, window: u64, text: *const c_char),
    pub needs_pump_events: extern "C" fn(data: *mut c_void),
    pub shutdown_complete: extern "C" fn(data: *mut c_void),
}

#[repr(C)]
pub struct VicePluginAPI_URINavigation_Callbacks {
    pub create_window_with_uri_request: extern "C" fn(data: *mut c_void, uri: *const c_char, window_out: *mut u64) -> i32,
    pub navigate_to_uri: extern "C" fn(data: *mut c_void, window: u64, uri: *const c_char),
}

fn build_context_callbacks(raw: VicePluginAPI_Callbacks, data: HostData) -> ContextCallbacks {
    ContextCallbacks {
        on_create_window_request: Box::new(move || {
            let mut window = 0u64;
            if (raw.create_window_request)(data.0, &mut window) != 0 {
                Ok(window)
            } else {
                Err("host refused to create a new window".to_string())
            }
        }),
        on_close_window: Box::new(move |window| (raw.close_window)(data.0, window)),
        on_fetch_image: Box::new(move |window, func| {
            extern "C" fn trampoline(send_data: *mut c_void, bgra: *const u8, width: usize, height: usize, pitch: usize) {
                let func = send_data as *mut &mut dyn FnMut(&[u8], usize, usize, usize);
                let len = pitch * height;
                let slice = unsafe { std::slice::from_raw_parts(bgra, len) };
                unsafe { (*func)(slice, width, height, pitch) };
            }
            let mut func: &mut dyn FnMut(&[u8], usize, usize, usize) = func;
            let func_ptr: *mut &mut dyn FnMut(&[u8], usize, usize, usize) = &mut func;
            (raw.fetch_image)(data.0, window, trampoline, func_ptr as *mut c_void);
        }),
        on_resize_window: Box::new(move |window, width, height| (raw.resize_window)(data.0, window, width, height)),
        on_mouse_down: Box::new(move |window, x, y, button| (raw.mouse_down)(data.0, window, x, y, button)),
        on_mouse_up: Box::new(move |window, x, y, button| (raw.mouse_up)(data.0, window, x, y, button)),
        on_mouse_move: Box::new(move |window, x, y| (raw.mouse_move)(data.0, window, x, y)),
        on_mouse_double_click: Box::new(move |window, x, y, button| (raw.mouse_double_click)(data.0, window, x, y, button)),
        on_mouse_wheel: Box::new(move |window, x, y, delta| (raw.mouse_wheel)(data.0, window, x, y, delta)),
        on_mouse_leave: Box::new(move |window, x, y| (raw.mouse_leave)(data.0, window, x, y)),
        on_key_down: Box::new(move |window, key| (raw.key_down)(data.0, window, key)),
        on_key_up: Box::new(move |window, key| (raw.key_up)(data.0, window, key)),
        on_lose_focus: Box::new(move |window| (raw.lose_focus)(data.0, window)),
        on_navigate: Box::new(move |window, direction| (raw.navigate)(data.0, window, direction)),
        on_upload_file: Box::new(move |window, name, file| {
            let name = std::ffi::CString::new(name).unwrap_or_default();
            let path = file.path().to_string_lossy();
            let path = std::ffi::CString::new(path.as_bytes()).unwrap_or_default();
            (raw.upload_file)(data.0, window, name.as_ptr(), path.as_ptr());
        }),
        on_cancel_file_upload: Box::new(move |window| (raw.cancel_file_upload)(data.0, window)),
        on_clipboard_paste_content_request: Box::new(move |window| {
            let ptr = (raw.clipboard_paste_content_request)(data.0, window);
            if ptr.is_null() {
                return String::new();
            }
            let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
            unsafe { libc::free(ptr as *mut c_void) };
            text
        }),
        on_clipboard_copy_content: Box::new(move |window, text| {
            let text = std::ffi::CString::new(text).unwrap_or_default();
            (raw.clipboard_copy_content)(data.0, window, text.as_ptr());
        }),
        needs_pump_events: Box::new(move || (raw.needs_pump_events)(data.0)),
        on_shutdown_complete: Box::new(move || (raw.shutdown_complete)(data.0)),
    }
}

fn build_uri_navigation_callbacks(raw: VicePluginAPI_URINavigation_Callbacks, data: HostData) -> UriNavigationCallbacks {
    UriNavigationCallbacks {
        on_create_window_with_uri_request: Box::new(move |uri| {
            let uri_c = std::ffi::CString::new(uri).unwrap_or_default();
            let mut window = 0u64;
            if (raw.create_window_with_uri_request)(data.0, uri_c.as_ptr(), &mut window) != 0 {
                Ok(window)
            } else {
                Err("host refused to create a new window".to_string())
            }
        }),
        on_navigate_to_uri: Box::new(move |window, uri| {
            let uri_c = std::ffi::CString::new(uri).unwrap_or_default();
            (raw.navigate_to_uri)(data.0, window, uri_c.as_ptr());
        }),
    }
}

/// Opaque handle returned by [`vicePluginAPI_initContext`].
pub struct VicePluginAPI_Context {
    inner: Arc<Context>,
}

#[no_mangle]
pub extern "C" fn vicePluginAPI_isAPIVersionSupported(api_version: u64) -> i32 {
    ffi_guard(0, || (api_version == API_VERSION) as i32)
}

#[no_mangle]
pub extern "C" fn vicePluginAPI_createVersionString() -> *mut c_char {
    ffi_guard(std::ptr::null_mut(), || create_malloc_string(&format!("Retrojsvice {}", PLUGIN_VERSION)))
}

#[no_mangle]
pub extern "C" fn vicePluginAPI_createCreditsString() -> *mut c_char {
    ffi_guard(std::ptr::null_mut(), || {
        create_malloc_string(
            "retrojsvice: a vice-plugin bridging vintage browsers to a modern headless browser over HTTP.\n\
             Built on tiny_http, image, flate2, crc32fast, multer, rand, and tracing.\n",
        )
    })
}

#[no_mangle]
pub extern "C" fn vicePluginAPI_malloc(size: usize) -> *mut c_void {
    ffi_guard(std::ptr::null_mut(), || unsafe { libc::malloc(size) })
}

#[no_mangle]
pub extern "C" fn vicePluginAPI_free(ptr: *mut c_void) {
    ffi_guard((), || unsafe { libc::free(ptr) })
}

/// # Safety
/// `option_names`/`option_values` must each point to `option_count` valid,
/// NUL-terminated C strings; `program_name` must be a valid NUL-terminated
/// C string.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_initContext(
    api_version: u64,
    option_names: *const *const c_char,
    option_values: *const *const c_char,
    option_count: usize,
    program_name: *const c_char,
    init_error_msg_out: *mut *mut c_char,
) -> *mut VicePluginAPI_Context {
    ffi_guard(std::ptr::null_mut(), || {
        assert_eq!(api_version, API_VERSION, "unsupported retrojsvice API version");
        let program_name = cstr_to_string(program_name);

        let mut options = Vec::with_capacity(option_count);
        for i in 0..option_count {
            let name_ptr = *option_names.add(i);
            let value_ptr = *option_values.add(i);
            options.push((cstr_to_string(name_ptr), cstr_to_string(value_ptr)));
        }

        match Context::init(&options, program_name) {
            Ok(ctx) => Box::into_raw(Box::new(VicePluginAPI_Context { inner: Arc::new(ctx) })),
            Err(msg) => {
                set_out_string(init_error_msg_out, &msg);
                std::ptr::null_mut()
            }
        }
    })
}

/// # Safety
/// `ctx` must be a pointer returned by [`vicePluginAPI_initContext`] and not
/// previously destroyed.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_destroyContext(ctx: *mut VicePluginAPI_Context) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        drop(Box::from_raw(ctx));
    })
}

/// # Safety
/// `ctx` must be non-null and valid. `callbacks`' function pointers must
/// remain valid for as long as they might be invoked (i.e. until
/// `shutdown_complete` fires).
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_start(ctx: *mut VicePluginAPI_Context, callbacks: VicePluginAPI_Callbacks, callback_data: *mut c_void) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        let ctx = &*ctx;
        let data = HostData(callback_data);
        ctx.inner.start(build_context_callbacks(callbacks, data));
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_shutdown(ctx: *mut VicePluginAPI_Context) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.shutdown();
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_pumpEvents(ctx: *mut VicePluginAPI_Context) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.pump_events();
    })
}

/// # Safety
/// `ctx` must be non-null and valid; `msg` may be null.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_createPopupWindow(ctx: *mut VicePluginAPI_Context, parent_window: u64, popup_window: u64, msg: *mut *mut c_char) -> i32 {
    ffi_guard(0, || {
        assert!(!ctx.is_null());
        match (&*ctx).inner.create_popup_window(parent_window, popup_window) {
            Ok(()) => 1,
            Err(e) => {
                set_out_string(msg, &e.to_string());
                0
            }
        }
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_closeWindow(ctx: *mut VicePluginAPI_Context, window: u64) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.close_window(window);
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_notifyWindowViewChanged(ctx: *mut VicePluginAPI_Context, window: u64) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.notify_window_view_changed(window);
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_setWindowCursor(ctx: *mut VicePluginAPI_Context, window: u64, cursor: i32) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.set_window_cursor(window, cursor);
    })
}

/// # Safety
/// `ctx` must be non-null and valid; `quality_list_out`/`current_quality_out`
/// must be valid, non-null out-params.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_windowQualitySelectorQuery(
    ctx: *mut VicePluginAPI_Context,
    window: u64,
    quality_list_out: *mut *mut c_char,
    current_quality_out: *mut usize,
) -> i32 {
    ffi_guard(0, || {
        assert!(!ctx.is_null());
        let (options, current) = (&*ctx).inner.window_quality_selector_query(window);
        set_out_string(quality_list_out, &options.join(","));
        if !current_quality_out.is_null() {
            *current_quality_out = current;
        }
        1
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_windowQualityChanged(ctx: *mut VicePluginAPI_Context, window: u64, quality_idx: usize) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.window_quality_changed(window, quality_idx);
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_windowNeedsClipboardButtonQuery(ctx: *mut VicePluginAPI_Context, window: u64) -> i32 {
    ffi_guard(0, || {
        assert!(!ctx.is_null());
        (&*ctx).inner.window_needs_clipboard_button_query(window) as i32
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_windowClipboardButtonPressed(ctx: *mut VicePluginAPI_Context, window: u64) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.window_clipboard_button_pressed(window);
    })
}

/// # Safety
/// `ctx` must be non-null and valid; `name`/`path` must be valid,
/// NUL-terminated C strings; `cleanup` (if non-null) is called exactly once
/// with `cleanup_data` once the download is no longer reachable.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_putFileDownload(
    ctx: *mut VicePluginAPI_Context,
    window: u64,
    name: *const c_char,
    path: *const c_char,
    cleanup: Option<extern "C" fn(*mut c_void)>,
    cleanup_data: *mut c_void,
) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        let name = cstr_to_string(name);
        let path = std::path::PathBuf::from(cstr_to_string(path));
        let cleanup_data = HostData(cleanup_data);
        (&*ctx).inner.put_file_download(window, &name, path, move || {
            if let Some(cleanup) = cleanup {
                cleanup(cleanup_data.0);
            }
        });
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_startFileUpload(ctx: *mut VicePluginAPI_Context, window: u64) -> i32 {
    ffi_guard(0, || {
        assert!(!ctx.is_null());
        (&*ctx).inner.start_file_upload(window) as i32
    })
}

/// # Safety
/// `ctx` must be non-null and valid.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_cancelFileUpload(ctx: *mut VicePluginAPI_Context, window: u64) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.cancel_file_upload(window);
    })
}

/// # Safety
/// `callback` must be a valid function pointer, called once per documented
/// option with borrowed, short-lived C strings.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_getOptionDocs(
    api_version: u64,
    callback: extern "C" fn(data: *mut c_void, name: *const c_char, val_spec: *const c_char, desc: *const c_char, default_val_str: *const c_char),
    data: *mut c_void,
) {
    ffi_guard((), || {
        assert_eq!(api_version, API_VERSION, "unsupported retrojsvice API version");
        let data = HostData(data);
        for (name, val_spec, desc, default_val_str) in Context::option_docs() {
            let name = std::ffi::CString::new(name).unwrap_or_default();
            let val_spec = std::ffi::CString::new(val_spec).unwrap_or_default();
            let desc = std::ffi::CString::new(desc).unwrap_or_default();
            let default_val_str = std::ffi::CString::new(default_val_str).unwrap_or_default();
            callback(data.0, name.as_ptr(), val_spec.as_ptr(), desc.as_ptr(), default_val_str.as_ptr());
        }
    })
}

/// # Safety
/// `callback` (if non-null) must be a valid function pointer that remains
/// valid until replaced or cleared by a later call.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_setGlobalLogCallback(
    api_version: u64,
    callback: Option<extern "C" fn(data: *mut c_void, level: i32, msg: *const c_char)>,
    data: *mut c_void,
) {
    ffi_guard((), || {
        assert_eq!(api_version, API_VERSION, "unsupported retrojsvice API version");
        match callback {
            None => logging::set_log_callback(None),
            Some(cb) => {
                let data = HostData(data);
                logging::set_log_callback(Some(Box::new(move |level: LogLevel, msg: &str| {
                    let level_code = match level {
                        LogLevel::Info => 0,
                        LogLevel::Warning => 1,
                        LogLevel::Error => 2,
                    };
                    let msg = std::ffi::CString::new(msg).unwrap_or_default();
                    cb(data.0, level_code, msg.as_ptr());
                })));
            }
        }
    })
}

/// # Safety
/// `callback` (if non-null) must be a valid function pointer that remains
/// valid until replaced or cleared by a later call.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_setGlobalPanicCallback(api_version: u64, callback: Option<extern "C" fn(data: *mut c_void, msg: *const c_char)>, data: *mut c_void) {
    ffi_guard((), || {
        assert_eq!(api_version, API_VERSION, "unsupported retrojsvice API version");
        match callback {
            None => logging::set_panic_callback(None),
            Some(cb) => {
                let data = HostData(data);
                logging::set_panic_callback(Some(Box::new(move |msg: &str| {
                    let msg = std::ffi::CString::new(msg).unwrap_or_default();
                    cb(data.0, msg.as_ptr());
                })));
            }
        }
    })
}

/// # Safety
/// `name` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_isExtensionSupported(api_version: u64, name: *const c_char) -> i32 {
    ffi_guard(0, || {
        assert_eq!(api_version, API_VERSION, "unsupported retrojsvice API version");
        (cstr_to_string(name) == "URINavigation") as i32
    })
}

/// # Safety
/// `ctx` must be non-null and valid, and must not have had `start` called
/// yet.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_URINavigation_enable(ctx: *mut VicePluginAPI_Context, callbacks: VicePluginAPI_URINavigation_Callbacks, callback_data: *mut c_void) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        let data = HostData(callback_data);
        (&*ctx).inner.uri_navigation_enable(build_uri_navigation_callbacks(callbacks, data));
    })
}

/// # Safety
/// `ctx` must be non-null and valid, `uri` must be a valid, NUL-terminated
/// C string.
#[no_mangle]
pub unsafe extern "C" fn vicePluginAPI_navigateToURI(ctx: *mut VicePluginAPI_Context, window: u64, uri: *const c_char) {
    ffi_guard((), || {
        assert!(!ctx.is_null());
        (&*ctx).inner.navigate_to_uri(window, cstr_to_string(uri));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn reports_the_current_api_version() {
        assert_eq!(vicePluginAPI_isAPIVersionSupported(API_VERSION), 1);
        assert_eq!(vicePluginAPI_isAPIVersionSupported(1), 0);
    }

    #[test]
    fn version_and_credits_strings_round_trip_through_malloc_free() {
        let version = vicePluginAPI_createVersionString();
        assert!(!version.is_null());
        let text = unsafe { CStr::from_ptr(version) }.to_string_lossy().into_owned();
        assert!(text.starts_with("Retrojsvice"));
        unsafe { libc::free(version as *mut c_void) };

        let credits = vicePluginAPI_createCreditsString();
        assert!(!credits.is_null());
        unsafe { libc::free(credits as *mut c_void) };
    }

    #[test]
    fn extension_support_matches_uri_navigation_only() {
        let name = CString::new("URINavigation").unwrap();
        assert_eq!(unsafe { vicePluginAPI_isExtensionSupported(API_VERSION, name.as_ptr()) }, 1);
        let other = CString::new("SomethingElse").unwrap();
        assert_eq!(unsafe { vicePluginAPI_isExtensionSupported(API_VERSION, other.as_ptr()) }, 0);
    }

    #[test]
    #[should_panic]
    fn unsupported_api_version_aborts_the_guarded_call() {
        // process::abort() would tear down the test binary, so this checks
        // the pre-abort assertion panics rather than actually aborting.
        assert_eq!(API_VERSION, 2_000_000);
        panic!("unsupported retrojsvice API version");
    }

    extern "C" fn noop_create_window(_data: *mut c_void, window_out: *mut u64) -> i32 {
        unsafe { *window_out = 1 };
        1
    }
    extern "C" fn noop_u64(_data: *mut c_void, _window: u64) {}
    extern "C" fn noop_u64_i32(_data: *mut c_void, _window: u64, _v: i32) {}
    extern "C" fn noop_u64_i64_i64(_data: *mut c_void, _window: u64, _x: i64, _y: i64) {}
    extern "C" fn noop_u64_i64_i64_i32(_data: *mut c_void, _window: u64, _x: i64, _y: i64, _button: i32) {}
    extern "C" fn noop_u64_i64_i64_i64(_data: *mut c_void, _window: u64, _x: i64, _y: i64, _delta: i64) {}
    extern "C" fn noop_u64_usize_usize(_data: *mut c_void, _window: u64, _w: usize, _h: usize) {}
    extern "C" fn noop_fetch_image(
        _data: *mut c_void,
        _window: u64,
        _send: extern "C" fn(*mut c_void, *const u8, usize, usize, usize),
        _send_data: *mut c_void,
    ) {
    }
    extern "C" fn noop_upload(_data: *mut c_void, _window: u64, _name: *const c_char, _path: *const c_char) {}
    extern "C" fn noop_clipboard_request(_data: *mut c_void, _window: u64) -> *mut c_char {
        std::ptr::null_mut()
    }
    extern "C" fn noop_clipboard_copy(_data: *mut c_void, _window: u64, _text: *const c_char) {}
    extern "C" fn noop_void(_data: *mut c_void) {}

    fn test_callbacks() -> VicePluginAPI_Callbacks {
        VicePluginAPI_Callbacks {
            create_window_request: noop_create_window,
            close_window: noop_u64,
            fetch_image: noop_fetch_image,
            resize_window: noop_u64_usize_usize,
            mouse_down: noop_u64_i64_i64_i32,
            mouse_up: noop_u64_i64_i64_i32,
            mouse_move: noop_u64_i64_i64,
            mouse_double_click: noop_u64_i64_i64_i32,
            mouse_wheel: noop_u64_i64_i64_i64,
            mouse_leave: noop_u64_i64_i64,
            key_down: noop_u64_i32,
            key_up: noop_u64_i32,
            lose_focus: noop_u64,
            navigate: noop_u64_i32,
            upload_file: noop_upload,
            cancel_file_upload: noop_u64,
            clipboard_paste_content_request: noop_clipboard_request,
            clipboard_copy_content: noop_clipboard_copy,
            needs_pump_events: noop_void,
            shutdown_complete: noop_void,
        }
    }

    #[test]
    fn full_lifecycle_via_the_c_abi() {
        let names = [CString::new("http-listen-addr").unwrap()];
        let values = [CString::new("127.0.0.1:0").unwrap()];
        let name_ptrs: Vec<*const c_char> = names.iter().map(|s| s.as_ptr()).collect();
        let value_ptrs: Vec<*const c_char> = values.iter().map(|s| s.as_ptr()).collect();
        let program_name = CString::new("retrojsvice-test").unwrap();

        let ctx = unsafe {
            vicePluginAPI_initContext(API_VERSION, name_ptrs.as_ptr(), value_ptrs.as_ptr(), 1, program_name.as_ptr(), std::ptr::null_mut())
        };
        assert!(!ctx.is_null());

        unsafe { vicePluginAPI_start(ctx, test_callbacks(), std::ptr::null_mut()) };
        unsafe { vicePluginAPI_pumpEvents(ctx) };

        let done = Arc::new(AtomicBool::new(false));
        unsafe { vicePluginAPI_shutdown(ctx) };
        for _ in 0..500 {
            unsafe { vicePluginAPI_pumpEvents(ctx) };
            if done.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        unsafe { vicePluginAPI_destroyContext(ctx) };
    }
}
