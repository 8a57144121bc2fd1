//! Grid motion analyser.
//!
//! Splits each frame into a `rows x cols` grid, compares per-cell luma with
//! the previous frame, and reports cells whose mean absolute difference
//! exceeds a threshold as active entities (`ID_r<row>c<col>`).

use anyhow::{Result, bail};
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::{
    draw::{GREEN, draw_rectangle},
    processor::{ENTITY_KEY_PREFIX, FeaturePacket, FrameProcessor, ProcessedFrame},
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionGridConfig {
    pub rows: usize,
    pub cols: usize,
    /// Mean absolute luma difference (0-255) at which a cell counts as active.
    pub threshold: f64,
}

impl Default for MotionGridConfig {
    fn default() -> Self {
        Self {
            rows: 4,
            cols: 4,
            threshold: 12.0,
        }
    }
}

pub struct MotionGridProcessor {
    config: MotionGridConfig,
    previous: Option<Luma>,
}

struct Luma {
    width: i32,
    height: i32,
    values: Vec<u8>,
}

impl MotionGridProcessor {
    pub fn new(config: MotionGridConfig) -> Self {
        Self {
            config: MotionGridConfig {
                rows: config.rows.max(1),
                cols: config.cols.max(1),
                threshold: config.threshold,
            },
            previous: None,
        }
    }

    /// Grid actually used for a frame: never more cells than pixels per axis.
    fn grid_for(&self, width: i32, height: i32) -> (usize, usize) {
        (
            self.config.rows.min(height as usize),
            self.config.cols.min(width as usize),
        )
    }

    fn cell_difference(&self, current: &Luma, previous: &Luma, bounds: [i32; 4]) -> f64 {
        let [left, top, right, bottom] = bounds;
        let mut total: u64 = 0;
        let mut count: u64 = 0;
        for y in top..=bottom {
            let row_start = y as usize * current.width as usize;
            for x in left..=right {
                let idx = row_start + x as usize;
                total += current.values[idx].abs_diff(previous.values[idx]) as u64;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }
}

/// Inclusive pixel bounds `[left, top, right, bottom]` of a grid cell.
/// `rows`/`cols` must not exceed the frame's height/width.
fn cell_bounds(
    width: i32,
    height: i32,
    (rows, cols): (usize, usize),
    row: usize,
    col: usize,
) -> [i32; 4] {
    let span = |index: usize, count: usize, extent: i32| {
        let (index, count, extent) = (index as i64, count as i64, i64::from(extent));
        let start = index * extent / count;
        let end = ((index + 1) * extent / count - 1).max(start);
        (start as i32, end as i32)
    };
    let (left, right) = span(col, cols, width);
    let (top, bottom) = span(row, rows, height);
    [left, top, right, bottom]
}

impl Default for MotionGridProcessor {
    fn default() -> Self {
        Self::new(MotionGridConfig::default())
    }
}

impl FrameProcessor for MotionGridProcessor {
    fn process(&mut self, frame: Frame) -> Result<ProcessedFrame> {
        if !matches!(frame.format, FrameFormat::Bgr8) {
            bail!("unsupported frame format {:?}", frame.format);
        }
        if frame.width <= 0 || frame.height <= 0 || frame.data.len() != frame.expected_len() {
            bail!(
                "unexpected frame buffer: {} bytes for {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            );
        }

        let luma = Luma {
            width: frame.width,
            height: frame.height,
            values: frame
                .data
                .chunks_exact(3)
                .map(|px| ((29 * px[0] as u32 + 150 * px[1] as u32 + 77 * px[2] as u32) >> 8) as u8)
                .collect(),
        };
        let mean_luma =
            luma.values.iter().map(|&v| v as u64).sum::<u64>() as f64 / luma.values.len() as f64;

        let mut packet = FeaturePacket::new(frame.timestamp_ms);
        packet.insert("mean_luma", mean_luma);

        let mut active = Vec::new();
        let mut motion_total = 0.0;
        let comparable = self
            .previous
            .as_ref()
            .filter(|prev| prev.width == luma.width && prev.height == luma.height);
        let grid = self.grid_for(luma.width, luma.height);
        if let Some(previous) = comparable {
            for row in 0..grid.0 {
                for col in 0..grid.1 {
                    let bounds = cell_bounds(luma.width, luma.height, grid, row, col);
                    let diff = self.cell_difference(&luma, previous, bounds);
                    motion_total += diff;
                    if diff >= self.config.threshold {
                        packet.insert(format!("{ENTITY_KEY_PREFIX}r{row}c{col}"), diff);
                        active.push(bounds);
                    }
                }
            }
        } else if self.previous.is_some() {
            debug!("frame size changed; motion baseline restarted");
        }
        let cells = (grid.0 * grid.1) as f64;
        packet.insert("motion", motion_total / cells);
        packet.insert("active_cells", active.len() as f64);

        let mut annotated = frame;
        for bounds in &active {
            draw_rectangle(
                &mut annotated.data,
                annotated.width,
                annotated.height,
                *bounds,
                GREEN,
                2,
            );
        }

        self.previous = Some(luma);
        Ok(ProcessedFrame {
            features: Some(packet),
            annotated: Some(annotated),
        })
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}
