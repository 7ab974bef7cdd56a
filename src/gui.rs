//! Upload-modal overlay rendering.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/gui.cpp`: while
//! a Window is in file-upload mode, every pixel byte in the fetched frame
//! is dimmed identically (halved brightness, top bit forced on) before
//! compression, regardless of whether the pointer currently sits over the
//! modal's cancel button — that position is only used to decide what the
//! *next* client-side click means, not to change the rendering.

/// Overlays the file-upload modal's dimming effect onto a BGRX/RGBA pixel
/// buffer in place.
pub fn render_upload_mode_gui(data: &mut [u8], width: usize, height: usize) {
    assert!(data.len() >= 4 * width * height, "buffer too small for given dimensions");
    for byte in data.iter_mut() {
        *byte = (*byte >> 1) | 0x80;
    }
}

/// Hit-tests the upload modal's cancel button, a fixed small square in the
/// top-right corner of the frame.
///
/// `gui.hpp` declares this function but the retrieved corpus has no body for
/// it; the 32x32 top-right geometry below is this port's own choice, not a
/// port of source behavior.
pub fn is_over_upload_mode_cancel_button(x: i64, y: i64, width: usize, height: usize) -> bool {
    const BUTTON_SIZE: i64 = 32;
    let _ = height;
    let width = width as i64;
    x >= width - BUTTON_SIZE && x < width && y >= 0 && y < BUTTON_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_every_byte_uniformly() {
        let mut data = vec![0xFFu8, 0x00, 0x80, 0x01];
        render_upload_mode_gui(&mut data, 1, 1);
        assert_eq!(data, vec![0xFF, 0x80, 0xC0, 0x80]);
    }

    #[test]
    fn cancel_button_is_top_right_square() {
        assert!(is_over_upload_mode_cancel_button(790, 5, 800, 600));
        assert!(!is_over_upload_mode_cancel_button(400, 5, 800, 600));
        assert!(!is_over_upload_mode_cancel_button(790, 100, 800, 600));
    }
}
