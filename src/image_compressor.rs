//! C3: per-Window image compression pipeline.
//!
//! Grounded on
//! `original_source/viceplugins/retrojsvice/src/image_compressor.cpp`/`.hpp`.
//! A dedicated background thread holds at most one in-flight compression
//! job; the API thread only fetches the raw frame and hands the bytes
//! over, then later receives the finished result back through the task
//! queue. At most one long-poll HTTP waiter is parked at a time per
//! compressor.
//!
//! One behavioral fix versus the original: the padded-row copy below
//! copies the full `4 * width` bytes of each source row rather than
//! `4 * width - 1`, which in the original leaves the last byte of every
//! row except the bottom one uninitialized. See SPEC_FULL.md §9.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

use crate::png;
use crate::task_queue::{DelayedTaskTag, TaskQueue};

pub const MIN_QUALITY: u32 = crate::quality::MIN_QUALITY;
pub const MAX_QUALITY: u32 = crate::quality::MAX_QUALITY;

pub const IFRAME_SIGNAL_TRUE: i32 = 0;
pub const IFRAME_SIGNAL_FALSE: i32 = 1;
const IFRAME_SIGNAL_COUNT: i32 = 2;

pub const CURSOR_SIGNAL_HAND: i32 = 0;
pub const CURSOR_SIGNAL_NORMAL: i32 = 1;
pub const CURSOR_SIGNAL_TEXT: i32 = 2;
const CURSOR_SIGNAL_COUNT: i32 = 3;

const MAX_DIMENSION: usize = 16384;

/// Supplies frames and GUI overlays to an `ImageCompressor`. Implemented by
/// the owning `Window`.
pub trait ImageCompressorEventHandler: Send + Sync {
    /// Must call `func` exactly once with a BGRX frame before returning.
    /// `func` does not retain the slice; it copies what it needs.
    fn fetch_image(&self, func: &mut dyn FnMut(&[u8], usize, usize, usize));

    fn render_gui(&self, data: &mut [u8], width: usize, height: usize);
}

/// Anything able to carry a compressed frame back to the client. `http::Request`
/// implements this; defined here so this module does not depend on the HTTP
/// layer.
pub trait ImageResponder: Send + 'static {
    fn respond_with_image(
        &self,
        content_type: &'static str,
        content_length: u64,
        write_body: Box<dyn FnOnce(&mut dyn Write) + Send>,
    );
}

type CompressedImage = Arc<dyn Fn(&dyn ImageResponder) + Send + Sync>;

#[rustfmt::skip]
const WHITE_JPEG_PIXEL: &[u8] = &[
    255, 216, 255, 224, 0, 16, 74, 70, 73, 70, 0, 1, 1, 1, 0, 72, 0, 72,
    0, 0, 255, 219, 0, 67, 0, 3, 2, 2, 3, 2, 2, 3, 3, 3, 3, 4, 3, 3, 4,
    5, 8, 5, 5, 4, 4, 5, 10, 7, 7, 6, 8, 12, 10, 12, 12, 11, 10, 11, 11,
    13, 14, 18, 16, 13, 14, 17, 14, 11, 11, 16, 22, 16, 17, 19, 20, 21,
    21, 21, 12, 15, 23, 24, 22, 20, 24, 18, 20, 21, 20, 255, 219, 0, 67,
    1, 3, 4, 4, 5, 4, 5, 9, 5, 5, 9, 20, 13, 11, 13, 20, 20, 20, 20, 20,
    20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20,
    20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20,
    20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 20, 255, 192, 0, 17, 8, 0,
    1, 0, 1, 3, 1, 17, 0, 2, 17, 1, 3, 17, 1, 255, 196, 0, 20, 0, 1, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9, 255, 196, 0, 20, 16, 1,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 255, 196, 0, 20, 1,
    1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 255, 196, 0, 20,
    17, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 255, 218, 0,
    12, 3, 1, 0, 2, 17, 3, 17, 0, 63, 0, 84, 193, 255, 217,
];

fn serve_white_jpeg_pixel(request: &dyn ImageResponder) {
    request.respond_with_image(
        "image/jpeg",
        WHITE_JPEG_PIXEL.len() as u64,
        Box::new(|out| {
            out.write_all(WHITE_JPEG_PIXEL).ok();
        }),
    );
}

fn compress_png(image_data: Vec<u8>, width: usize, height: usize, thread_count: usize) -> CompressedImage {
    let chunks = Arc::new(png::compress(&image_data, width, height, width, thread_count));
    let length: u64 = chunks.iter().map(|c| c.len() as u64).sum();
    Arc::new(move |request: &dyn ImageResponder| {
        let chunks = Arc::clone(&chunks);
        request.respond_with_image(
            "image/png",
            length,
            Box::new(move |out| {
                for chunk in chunks.iter() {
                    out.write_all(chunk).ok();
                }
            }),
        )
    })
}

fn compress_jpeg(image_data: Vec<u8>, width: usize, height: usize, quality: u32) -> CompressedImage {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for pixel in image_data.chunks_exact(4) {
        rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }

    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100) as u8)
        .encode(&rgb, width as u32, height as u32, ColorType::Rgb8)
        .expect("JPEG encoding of a well-formed RGB buffer should not fail");

    let body = Arc::new(buf);
    Arc::new(move |request: &dyn ImageResponder| {
        let body = Arc::clone(&body);
        request.respond_with_image(
            "image/jpeg",
            body.len() as u64,
            Box::new(move |out| {
                out.write_all(&body).ok();
            }),
        )
    })
}

struct State {
    quality: u32,
    iframe_signal: i32,
    cursor_signal: i32,
    fetching_stopped: bool,
    image_updated: bool,
    compressed_image_updated: bool,
    compression_in_progress: bool,
    compressed_image: CompressedImage,
    wait_tag: Option<DelayedTaskTag>,
}

struct WorkerShared {
    mutex: Mutex<WorkerState>,
    cv: Condvar,
}

struct WorkerState {
    shutdown_scheduled: bool,
    task: Option<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    event_handler: Weak<dyn ImageCompressorEventHandler>,
    task_queue: Arc<TaskQueue>,
    send_timeout: Duration,
    png_thread_count: usize,
    state: Mutex<State>,
    worker: Arc<WorkerShared>,
}

/// Image compression pipeline for one browser window.
pub struct ImageCompressor {
    inner: Arc<Inner>,
    worker_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ImageCompressor {
    pub fn new(
        event_handler: Weak<dyn ImageCompressorEventHandler>,
        task_queue: Arc<TaskQueue>,
        send_timeout: Duration,
        quality: u32,
    ) -> Arc<ImageCompressor> {
        crate::require!(
            (MIN_QUALITY..=MAX_QUALITY).contains(&quality),
            "quality {} out of range",
            quality
        );

        let png_thread_count = num_cpus::get().clamp(1, 4);

        let worker = Arc::new(WorkerShared {
            mutex: Mutex::new(WorkerState { shutdown_scheduled: false, task: None }),
            cv: Condvar::new(),
        });

        let inner = Arc::new(Inner {
            event_handler,
            task_queue,
            send_timeout,
            png_thread_count,
            state: Mutex::new(State {
                quality,
                iframe_signal: IFRAME_SIGNAL_FALSE,
                cursor_signal: CURSOR_SIGNAL_NORMAL,
                fetching_stopped: false,
                image_updated: false,
                compressed_image_updated: false,
                compression_in_progress: false,
                compressed_image: Arc::new(serve_white_jpeg_pixel),
                wait_tag: None,
            }),
            worker,
        });

        let worker_thread = {
            let worker = Arc::clone(&inner.worker);
            std::thread::Builder::new()
                .name("retrojsvice-image-compressor".into())
                .spawn(move || worker_loop(worker))
                .expect("failed to spawn image compressor worker thread")
        };

        Arc::new(ImageCompressor { inner, worker_thread: Mutex::new(Some(worker_thread)) })
    }

    pub fn quality(&self) -> u32 {
        self.inner.state.lock().unwrap().quality
    }

    pub fn set_quality(self: &Arc<Self>, quality: u32) {
        crate::require!((MIN_QUALITY..=MAX_QUALITY).contains(&quality), "quality {} out of range", quality);
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            if state.quality == quality {
                false
            } else {
                state.quality = quality;
                true
            }
        };
        if changed {
            self.update_notify();
        }
    }

    pub fn update_notify(self: &Arc<Self>) {
        self.inner.state.lock().unwrap().image_updated = true;
        self.pump();
    }

    pub fn send_compressed_image_now(self: &Arc<Self>, request: Arc<dyn ImageResponder>) {
        self.flush();

        let image = {
            let mut state = self.inner.state.lock().unwrap();
            let image = Arc::clone(&state.compressed_image);
            state.compressed_image_updated = false;
            image
        };
        image(request.as_ref());
        self.pump();
    }

    pub fn send_compressed_image_wait(self: &Arc<Self>, request: Arc<dyn ImageResponder>) {
        self.flush();

        let already_updated = self.inner.state.lock().unwrap().compressed_image_updated;
        if already_updated {
            self.send_compressed_image_now(request);
        } else {
            let self_clone = Arc::clone(self);
            let tag = self.inner.task_queue.post_delayed(self.inner.send_timeout, move || {
                self_clone.send_compressed_image_now(Arc::clone(&request));
            });
            self.inner.state.lock().unwrap().wait_tag = Some(tag);
        }
    }

    pub fn stop_fetching(&self) {
        self.inner.state.lock().unwrap().fetching_stopped = true;
    }

    pub fn flush(&self) {
        let tag = self.inner.state.lock().unwrap().wait_tag.take();
        if let Some(tag) = tag {
            tag.expedite();
        }
    }

    pub fn set_iframe_signal(self: &Arc<Self>, signal: i32) {
        crate::require!((0..IFRAME_SIGNAL_COUNT).contains(&signal), "invalid iframe signal {}", signal);
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            if state.iframe_signal == signal {
                false
            } else {
                state.iframe_signal = signal;
                true
            }
        };
        if changed {
            self.update_notify();
        }
    }

    pub fn set_cursor_signal(self: &Arc<Self>, signal: i32) {
        crate::require!((0..CURSOR_SIGNAL_COUNT).contains(&signal), "invalid cursor signal {}", signal);
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            if state.cursor_signal == signal {
                false
            } else {
                state.cursor_signal = signal;
                true
            }
        };
        if changed {
            self.update_notify();
        }
    }

    fn fetch_image(&self) -> (Vec<u8>, usize, usize) {
        let fetching_stopped = self.inner.state.lock().unwrap().fetching_stopped;
        crate::require!(!fetching_stopped, "fetch_image called after stopFetching");

        let Some(handler) = self.inner.event_handler.upgrade() else {
            return (vec![255; 4], 1, 1);
        };

        let (iframe_signal, cursor_signal) = {
            let state = self.inner.state.lock().unwrap();
            (state.iframe_signal, state.cursor_signal)
        };

        let mut data = Vec::new();
        let mut width = 0usize;
        let mut height = 0usize;
        let mut called = false;

        handler.fetch_image(&mut |src_image, src_width, src_height, src_pitch| {
            crate::require!(!called, "fetch_image callback invoked more than once");
            called = true;
            crate::require!(src_width > 0 && src_height > 0, "fetch_image callback given empty frame");

            let src_width = src_width.min(MAX_DIMENSION);
            let src_height = src_height.min(MAX_DIMENSION);

            width = src_width;
            while (width % IFRAME_SIGNAL_COUNT as usize) as i32 != iframe_signal {
                width += 1;
            }
            height = src_height;
            while (height % CURSOR_SIGNAL_COUNT as usize) as i32 != cursor_signal {
                height += 1;
            }

            data.resize(4 * width * height, 255u8);
            for y in 0..src_height {
                let src_row = &src_image[4 * y * src_pitch..4 * y * src_pitch + 4 * src_width];
                let dst_start = 4 * y * width;
                data[dst_start..dst_start + 4 * src_width].copy_from_slice(src_row);
            }
        });
        crate::require!(called, "fetch_image event handler did not call back");

        handler.render_gui(&mut data, width, height);

        (data, width, height)
    }

    fn pump(self: &Arc<Self>) {
        let should_start = {
            let state = self.inner.state.lock().unwrap();
            !state.fetching_stopped
                && !state.compression_in_progress
                && state.image_updated
                && !state.compressed_image_updated
        };
        if !should_start {
            return;
        }

        let quality = {
            let mut state = self.inner.state.lock().unwrap();
            state.compression_in_progress = true;
            state.image_updated = false;
            state.quality
        };

        let (image_data, width, height) = self.fetch_image();

        let self_clone = Arc::clone(self);
        let png_thread_count = self.inner.png_thread_count;
        let task: Box<dyn FnOnce() + Send> = Box::new(move || {
            let compressed = if quality == MAX_QUALITY {
                compress_png(image_data, width, height, png_thread_count)
            } else {
                compress_jpeg(image_data, width, height, quality)
            };
            let task_queue = Arc::clone(&self_clone.inner.task_queue);
            task_queue.post(move || {
                self_clone.compress_task_done(compressed);
            });
        });

        let worker = &self.inner.worker;
        {
            let mut guard = worker.mutex.lock().unwrap();
            crate::require!(guard.task.is_none(), "image compressor worker already has a pending task");
            guard.task = Some(task);
        }
        worker.cv.notify_one();
    }

    fn compress_task_done(self: &Arc<Self>, compressed: CompressedImage) {
        {
            let mut state = self.inner.state.lock().unwrap();
            crate::require!(state.compression_in_progress, "compress_task_done without a job in progress");
            state.compression_in_progress = false;
            state.compressed_image_updated = true;
            state.compressed_image = compressed;
        }
        self.flush();
        self.pump();
    }
}

impl Drop for ImageCompressor {
    fn drop(&mut self) {
        {
            let mut guard = self.inner.worker.mutex.lock().unwrap();
            guard.shutdown_scheduled = true;
        }
        self.inner.worker.cv.notify_one();
        if let Some(handle) = self.worker_thread.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

fn worker_loop(worker: Arc<WorkerShared>) {
    let mut guard = worker.mutex.lock().unwrap();
    loop {
        if guard.shutdown_scheduled {
            return;
        } else if let Some(task) = guard.task.take() {
            drop(guard);
            task();
            guard = worker.mutex.lock().unwrap();
        } else {
            guard = worker.cv.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct SolidFrame {
        width: usize,
        height: usize,
        pixel: [u8; 4],
    }

    impl ImageCompressorEventHandler for SolidFrame {
        fn fetch_image(&self, func: &mut dyn FnMut(&[u8], usize, usize, usize)) {
            let row: Vec<u8> = self.pixel.iter().cloned().cycle().take(4 * self.width).collect();
            let mut buf = Vec::with_capacity(4 * self.width * self.height);
            for _ in 0..self.height {
                buf.extend_from_slice(&row);
            }
            func(&buf, self.width, self.height, self.width);
        }

        fn render_gui(&self, _data: &mut [u8], _width: usize, _height: usize) {}
    }

    struct CapturingResponder {
        content_type: StdMutex<Option<String>>,
        body: StdMutex<Vec<u8>>,
        responded: AtomicBool,
    }

    impl CapturingResponder {
        fn new() -> Arc<CapturingResponder> {
            Arc::new(CapturingResponder {
                content_type: StdMutex::new(None),
                body: StdMutex::new(Vec::new()),
                responded: AtomicBool::new(false),
            })
        }
    }

    impl ImageResponder for CapturingResponder {
        fn respond_with_image(
            &self,
            content_type: &'static str,
            _content_length: u64,
            write_body: Box<dyn FnOnce(&mut dyn Write) + Send>,
        ) {
            let mut body = self.body.lock().unwrap();
            write_body(&mut *body as &mut dyn Write);
            *self.content_type.lock().unwrap() = Some(content_type.to_string());
            self.responded.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn defaults_to_white_jpeg_pixel_before_any_update() {
        let handler: Arc<dyn ImageCompressorEventHandler> =
            Arc::new(SolidFrame { width: 4, height: 4, pixel: [1, 2, 3, 0] });
        let queue = TaskQueue::new();
        let compressor = ImageCompressor::new(Arc::downgrade(&handler), queue, Duration::from_millis(200), 80);

        let responder = CapturingResponder::new();
        compressor.send_compressed_image_now(responder.clone());
        assert_eq!(responder.content_type.lock().unwrap().as_deref(), Some("image/jpeg"));
        assert_eq!(&*responder.body.lock().unwrap(), WHITE_JPEG_PIXEL);
    }

    #[test]
    fn update_notify_eventually_produces_a_real_frame() {
        let handler: Arc<dyn ImageCompressorEventHandler> =
            Arc::new(SolidFrame { width: 8, height: 8, pixel: [10, 20, 30, 0] });
        let queue = TaskQueue::new();
        let compressor = ImageCompressor::new(Arc::downgrade(&handler), queue.clone(), Duration::from_millis(200), 101);

        compressor.update_notify();
        // Give the background worker a moment to finish; real usage drives
        // this via compress_task_done's post() landing on run_tasks().
        for _ in 0..100 {
            queue.run_tasks();
            std::thread::sleep(Duration::from_millis(5));
        }

        let responder = CapturingResponder::new();
        compressor.send_compressed_image_now(responder.clone());
        assert_eq!(responder.content_type.lock().unwrap().as_deref(), Some("image/png"));
        assert!(responder.body.lock().unwrap().len() > WHITE_JPEG_PIXEL.len());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn rejects_out_of_range_quality() {
        let handler: Arc<dyn ImageCompressorEventHandler> =
            Arc::new(SolidFrame { width: 2, height: 2, pixel: [0, 0, 0, 0] });
        let _ = ImageCompressor::new(Arc::downgrade(&handler), TaskQueue::new(), Duration::from_millis(50), 9);
    }
}
