// Conversions between the camera's frame layouts and packed RGB888, plus the
// RGB565 layout SPI preview panels take.

use canonical_error::{CanonicalError, invalid_argument_error};
use image::{Rgb, RgbImage};

use crate::abstract_camera::{PixelFormat, Size};

fn clip(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}

// BT.601 studio swing, integer approximation.
fn rgb_to_yuv(r: i32, g: i32, b: i32) -> (u8, u8, u8) {
    let y = clip(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
    let u = clip(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
    let v = clip(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
    (y, u, v)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [clip((298 * c + 409 * e + 128) >> 8),
     clip((298 * c - 100 * d - 208 * e + 128) >> 8),
     clip((298 * c + 516 * d + 128) >> 8)]
}

/// Byte offsets of (R, G, B) within one pixel of a packed format.
fn rgb_offsets(format: PixelFormat) -> Option<(usize, usize, usize)> {
    match format {
        PixelFormat::Xrgb8888 | PixelFormat::Rgb888 => Some((2, 1, 0)),
        PixelFormat::Xbgr8888 | PixelFormat::Bgr888 => Some((0, 1, 2)),
        PixelFormat::Yuv420 => None,
    }
}

/// Decodes one frame into an RGB image. `data` may be longer than the frame.
pub fn to_rgb_image(format: PixelFormat, size: Size, stride: usize, data: &[u8])
                    -> Result<RgbImage, CanonicalError> {
    let (width, height) = (size.width as usize, size.height as usize);
    let needed = format.frame_size(size, stride);
    if data.len() < needed || stride < width * format.bytes_per_pixel() {
        return Err(invalid_argument_error(
            format!("{} frame {} with stride {} needs {} bytes, got {}",
                    format, size, stride, needed, data.len()).as_str()));
    }
    let mut image = RgbImage::new(size.width, size.height);
    match rgb_offsets(format) {
        Some((r, g, b)) => {
            let bpp = format.bytes_per_pixel();
            for (y, row) in data.chunks(stride).take(height).enumerate() {
                for (x, px) in row[..width * bpp].chunks_exact(bpp).enumerate() {
                    image.put_pixel(x as u32, y as u32, Rgb([px[r], px[g], px[b]]));
                }
            }
        },
        None => {
            let chroma_stride = stride.div_ceil(2);
            let chroma_rows = height.div_ceil(2);
            let u_plane = &data[stride * height..];
            let v_plane = &u_plane[chroma_stride * chroma_rows..];
            for y in 0..height {
                for x in 0..width {
                    let luma = data[y * stride + x];
                    let chroma = (y / 2) * chroma_stride + x / 2;
                    image.put_pixel(x as u32, y as u32,
                                    Rgb(yuv_to_rgb(luma, u_plane[chroma], v_plane[chroma])));
                }
            }
        },
    }
    Ok(image)
}

/// Encodes an RGB image into `format` with the given row stride. Padding
/// bytes are zero.
pub fn pack_rgb_image(image: &RgbImage, format: PixelFormat, stride: usize) -> Vec<u8> {
    let size = Size::new(image.width(), image.height());
    let (width, height) = (size.width as usize, size.height as usize);
    let mut data = vec![0u8; format.frame_size(size, stride)];
    match rgb_offsets(format) {
        Some((r, g, b)) => {
            let bpp = format.bytes_per_pixel();
            for (x, y, px) in image.enumerate_pixels() {
                let base = y as usize * stride + x as usize * bpp;
                data[base + r] = px[0];
                data[base + g] = px[1];
                data[base + b] = px[2];
            }
        },
        None => {
            let chroma_stride = stride.div_ceil(2);
            let chroma_rows = height.div_ceil(2);
            let (y_plane, chroma) = data.split_at_mut(stride * height);
            let (u_plane, v_plane) = chroma.split_at_mut(chroma_stride * chroma_rows);
            for (x, y, px) in image.enumerate_pixels() {
                let (luma, _, _) = rgb_to_yuv(px[0] as i32, px[1] as i32, px[2] as i32);
                y_plane[y as usize * stride + x as usize] = luma;
            }
            // Chroma from the average of each 2x2 block.
            for cy in 0..chroma_rows {
                for cx in 0..width.div_ceil(2) {
                    let (mut r, mut g, mut b, mut n) = (0i32, 0i32, 0i32, 0i32);
                    for y in (2 * cy)..usize::min(2 * cy + 2, height) {
                        for x in (2 * cx)..usize::min(2 * cx + 2, width) {
                            let px = image.get_pixel(x as u32, y as u32);
                            r += px[0] as i32;
                            g += px[1] as i32;
                            b += px[2] as i32;
                            n += 1;
                        }
                    }
                    let (_, u, v) = rgb_to_yuv(r / n, g / n, b / n);
                    u_plane[cy * chroma_stride + cx] = u;
                    v_plane[cy * chroma_stride + cx] = v;
                }
            }
        },
    }
    data
}

/// RGB565, big-endian, as SPI panel controllers expect it.
pub fn to_rgb565(image: &RgbImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 3 * 2);
    for px in image.pixels() {
        let (r, g, b) = (px[0] as u16, px[1] as u16, px[2] as u16);
        let rgb = ((r & 0xF8) << 8) | ((g & 0xFC) << 3) | (b >> 3);
        out.extend_from_slice(&rgb.to_be_bytes());
    }
    out
}
