//! Minimal drawing primitives over packed BGR8 buffers.

/// BGR colour triple.
pub type Bgr = [u8; 3];

pub const GREEN: Bgr = [0, 255, 0];
pub const RED: Bgr = [0, 0, 255];

/// Outline `[left, top, right, bottom]` (inclusive) with a `thickness` pixel border.
pub fn draw_rectangle(
    data: &mut [u8],
    width: i32,
    height: i32,
    rect: [i32; 4],
    color: Bgr,
    thickness: i32,
) {
    if width <= 0 || height <= 0 {
        return;
    }
    let [left, top, right, bottom] = rect;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for t in 0..thickness.max(1) {
        for x in left..=right {
            put_pixel(data, width, height, x, top + t, color);
            put_pixel(data, width, height, x, bottom - t, color);
        }
        for y in top..=bottom {
            put_pixel(data, width, height, left + t, y, color);
            put_pixel(data, width, height, right - t, y, color);
        }
    }
}

fn put_pixel(data: &mut [u8], width: i32, height: i32, x: i32, y: i32, color: Bgr) {
    if x < 0 || y < 0 || x >= width || y >= height {
        return;
    }
    let offset = (y as usize * width as usize + x as usize) * 3;
    if let Some(pixel) = data.get_mut(offset..offset + 3) {
        pixel.copy_from_slice(&color);
    }
}
