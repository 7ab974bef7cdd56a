//! C3's PNG codec: a hand-rolled, multi-threaded Paeth+DEFLATE pipeline.
//!
//! Grounded directly on
//! `original_source/viceplugins/retrojsvice/src/png.cpp`. No off-the-shelf
//! PNG encoder produces this exact shape (independent per-band zlib
//! streams stitched into one logical stream across multiple `IDAT`
//! chunks, with a synthetic final chunk carrying only the combined
//! Adler-32 checksum), so it is built from `flate2`'s raw `Compress`
//! stream plus `crc32fast` for chunk CRCs rather than through `image`'s
//! PNG support.
//!
//! Image data is 32-bit BGRX (blue, green, red, unused), `pitch` pixels per
//! row; only the first `width` columns of each row are encoded. Output is
//! 8-bit-depth, color-type-2 (RGB), non-interlaced PNG, emitted as a
//! sequence of chunks that must be concatenated in order to form the
//! complete file.

use flate2::{Compress, Compression, FlushCompress, Status};

const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];
const ZLIB_CMF: u8 = 8 | (7 << 4); // deflate, 32K window
const ZLIB_FLG: u8 = 1; // no preset dictionary; satisfies the FCHECK constraint

const ADLER_BASE: u64 = 65521;

fn adler32(data: &[u8]) -> u32 {
    let mut a: u64 = 1;
    let mut b: u64 = 0;
    for &byte in data {
        a = (a + byte as u64) % ADLER_BASE;
        b = (b + a) % ADLER_BASE;
    }
    ((b << 16) | a) as u32
}

/// Combines two Adler-32 checksums of consecutive byte ranges into the
/// checksum of their concatenation, without revisiting the first range's
/// bytes. Identical math to zlib's `adler32_combine`.
fn adler32_combine(adler1: u32, adler2: u32, len2: usize) -> u32 {
    let base = ADLER_BASE;
    let rem = (len2 as u64) % base;
    let sum1_0 = (adler1 & 0xffff) as u64;
    let mut sum2 = (rem * sum1_0) % base;
    let mut sum1 = sum1_0 + (adler2 & 0xffff) as u64 + base - 1;
    sum2 += ((adler1 >> 16) & 0xffff) as u64 + ((adler2 >> 16) & 0xffff) as u64 + base - rem;
    if sum1 >= base {
        sum1 -= base;
    }
    if sum1 >= base {
        sum1 -= base;
    }
    if sum2 >= base << 1 {
        sum2 -= base << 1;
    }
    if sum2 >= base {
        sum2 -= base;
    }
    (sum1 | (sum2 << 16)) as u32
}

fn png_chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(12 + data.len());
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(chunk_type);
    chunk.extend_from_slice(data);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(data);
    chunk.extend_from_slice(&hasher.finalize().to_be_bytes());
    chunk
}

fn paeth_predictor(left: i32, up: i32, up_left: i32) -> i32 {
    let p = left + up - up_left;
    let p_left = (p - left).abs();
    let p_up = (p - up).abs();
    let p_up_left = (p - up_left).abs();
    if p_left <= p_up && p_left <= p_up_left {
        left
    } else if p_up <= p_up_left {
        up
    } else {
        up_left
    }
}

/// Paeth/Sub-filters one horizontal band of rows `[start_y, end_y)` of a
/// BGRX image into raw (unfiltered-PNG-row-prefixed) RGB bytes.
fn filter_band(image: &[u8], width: usize, pitch: usize, start_y: usize, end_y: usize) -> Vec<u8> {
    let height_out = end_y - start_y;
    let mut raw = Vec::with_capacity(height_out * (1 + 3 * width));

    for y in start_y..end_y {
        let row_start = 4 * y * pitch;
        if y == 0 {
            raw.push(1); // filter type: Sub
            let mut left = [0i32; 3];
            for x in 0..width {
                let p = row_start + 4 * x;
                for c in 0..3 {
                    let val = image[p + 2 - c] as i32;
                    raw.push((val - left[c]) as u8);
                    left[c] = val;
                }
            }
        } else {
            let up_row_start = row_start - 4 * pitch;
            raw.push(4); // filter type: Paeth
            let mut left = [0i32; 3];
            let mut up_left = [0i32; 3];
            for x in 0..width {
                let p = row_start + 4 * x;
                let up_p = up_row_start + 4 * x;
                for c in 0..3 {
                    let val = image[p + 2 - c] as i32;
                    let up_val = image[up_p + 2 - c] as i32;
                    let pred = paeth_predictor(left[c], up_val, up_left[c]);
                    raw.push((val - pred) as u8);
                    left[c] = val;
                    up_left[c] = up_val;
                }
            }
        }
    }

    raw
}

fn deflate_band(raw: &[u8], finish: bool) -> (Vec<u8>, u32) {
    let mut compress = Compress::new(Compression::new(1), true);
    let mut out = vec![0u8; raw.len() + 256];
    let flush = if finish { FlushCompress::Finish } else { FlushCompress::Sync };

    loop {
        let in_pos = compress.total_in() as usize;
        let out_pos = compress.total_out() as usize;
        if out.len() - out_pos < 4096 {
            out.resize(out.len() * 2, 0);
        }
        let status = compress
            .compress(&raw[in_pos..], &mut out[out_pos..], flush)
            .expect("deflate of PNG image band failed");
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if compress.total_in() as usize >= raw.len() && !finish {
                    break;
                }
            }
        }
    }

    out.truncate(compress.total_out() as usize);
    assert!(out.len() >= 2, "deflate output missing zlib header");
    assert_eq!(out[0], 0x78, "unexpected zlib compression method/flags byte");

    let mut body = out.split_off(2);
    if finish {
        let trailer_start = body.len() - 4;
        body.truncate(trailer_start);
    }
    (body, adler32(raw))
}

struct BandResult {
    uncompressed_bytes: usize,
    adler32: u32,
    idat_chunk: Vec<u8>,
}

fn run_band(image: &[u8], width: usize, pitch: usize, start_y: usize, end_y: usize, end_stream: bool) -> BandResult {
    let raw = filter_band(image, width, pitch, start_y, end_y);
    let uncompressed_bytes = raw.len();
    let (deflated, adler) = deflate_band(&raw, end_stream);
    BandResult {
        uncompressed_bytes,
        adler32: adler,
        idat_chunk: png_chunk(b"IDAT", &deflated),
    }
}

/// Compresses a BGRX image into PNG, returning the chunks that must be
/// concatenated (after the PNG signature) to form the full file. Splits
/// the image into up to `max_threads` horizontal bands and compresses them
/// in parallel.
pub fn compress(image: &[u8], width: usize, height: usize, pitch: usize, max_threads: usize) -> Vec<Vec<u8>> {
    assert!(width > 0 && height > 0, "PNG compression requires a non-empty image");
    let thread_count = max_threads.max(1).min(height);

    let mut bounds = Vec::with_capacity(thread_count);
    for i in 0..thread_count {
        let start_y = height * i / thread_count;
        let end_y = height * (i + 1) / thread_count;
        bounds.push((start_y, end_y, i + 1 == thread_count));
    }

    let results: Vec<BandResult> = if thread_count == 1 {
        let (start_y, end_y, end_stream) = bounds[0];
        vec![run_band(image, width, pitch, start_y, end_y, end_stream)]
    } else {
        std::thread::scope(|scope| {
            let handles: Vec<_> = bounds
                .into_iter()
                .map(|(start_y, end_y, end_stream)| {
                    scope.spawn(move || run_band(image, width, pitch, start_y, end_y, end_stream))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("PNG band worker panicked")).collect()
        })
    };

    let mut chunks = Vec::with_capacity(results.len() + 3);

    let mut header = Vec::new();
    header.extend_from_slice(&PNG_SIGNATURE);
    let mut ihdr_data = Vec::with_capacity(13);
    ihdr_data.extend_from_slice(&(width as u32).to_be_bytes());
    ihdr_data.extend_from_slice(&(height as u32).to_be_bytes());
    ihdr_data.push(8); // bit depth
    ihdr_data.push(2); // color type: RGB
    ihdr_data.push(0); // compression method
    ihdr_data.push(0); // filter method
    ihdr_data.push(0); // no interlace
    header.extend_from_slice(&png_chunk(b"IHDR", &ihdr_data));
    header.extend_from_slice(&png_chunk(b"IDAT", &[ZLIB_CMF, ZLIB_FLG]));
    chunks.push(header);

    let mut combined_adler: u32 = 1;
    for result in &results {
        combined_adler = adler32_combine(combined_adler, result.adler32, result.uncompressed_bytes);
    }

    for result in results {
        chunks.push(result.idat_chunk);
    }

    let mut footer = Vec::new();
    footer.extend_from_slice(&png_chunk(b"IDAT", &combined_adler.to_be_bytes()));
    footer.extend_from_slice(&png_chunk(b"IEND", &[]));
    chunks.push(footer);

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(chunks: &[Vec<u8>]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    fn solid_image(width: usize, height: usize, bgrx: [u8; 4]) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height * 4);
        for _ in 0..width * height {
            data.extend_from_slice(&bgrx);
        }
        data
    }

    #[test]
    fn single_threaded_output_starts_with_signature_and_ihdr() {
        let image = solid_image(8, 8, [10, 20, 30, 0]);
        let chunks = compress(&image, 8, 8, 8, 1);
        let bytes = flatten(&chunks);
        assert_eq!(&bytes[0..8], &PNG_SIGNATURE);
        assert_eq!(&bytes[12..16], b"IHDR");
    }

    #[test]
    fn multi_threaded_output_is_decodable_by_the_image_crate() {
        let width = 37;
        let height = 29;
        let mut image = Vec::with_capacity(width * height * 4);
        for y in 0..height {
            for x in 0..width {
                image.extend_from_slice(&[(x * 3) as u8, (y * 5) as u8, ((x + y) * 7) as u8, 0]);
            }
        }
        let chunks = compress(&image, width, height, width, 4);
        let bytes = flatten(&chunks);

        let decoded = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)
            .expect("bespoke PNG pipeline produced an undecodable image");
        let rgb = decoded.to_rgb8();
        assert_eq!(rgb.width() as usize, width);
        assert_eq!(rgb.height() as usize, height);

        for y in 0..height {
            for x in 0..width {
                let px = rgb.get_pixel(x as u32, y as u32);
                let expected_b = (x * 3) as u8;
                let expected_g = (y * 5) as u8;
                let expected_r = ((x + y) * 7) as u8;
                assert_eq!(px.0, [expected_r, expected_g, expected_b]);
            }
        }
    }

    #[test]
    fn thread_count_is_clamped_to_height() {
        let image = solid_image(4, 2, [1, 2, 3, 0]);
        // Should not panic even though max_threads (8) exceeds height (2).
        let chunks = compress(&image, 4, 2, 4, 8);
        assert!(!chunks.is_empty());
    }

    #[test]
    fn adler32_combine_matches_direct_computation() {
        let data = b"the quick brown fox jumps over the lazy dog, twice over";
        let whole = adler32(data);

        let split = data.len() / 2;
        let a1 = adler32(&data[..split]);
        let a2 = adler32(&data[split..]);
        let combined = adler32_combine(a1, a2, data.len() - split);

        assert_eq!(whole, combined);
    }
}
