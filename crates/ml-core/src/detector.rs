use std::{convert::TryFrom, path::Path};

use anyhow::{Result, bail};
use tch::{self, Device, Kind, Tensor};
use tracing::info;
use video_ingest::{Frame, FrameFormat};

use crate::{
    draw::{RED, draw_rectangle},
    processor::{ENTITY_KEY_PREFIX, FeaturePacket, FrameProcessor, InitError, ProcessedFrame},
};

/// Single detection in frame pixel coordinates.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub bbox_xywh: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

/// Parse `cpu`, `cuda`, `cuda:N` or `auto` into a torch device.
pub fn parse_device(spec: &str) -> Result<Device, InitError> {
    let spec = spec.trim().to_ascii_lowercase();
    match spec.as_str() {
        "cpu" => Ok(Device::Cpu),
        "auto" => Ok(Device::cuda_if_available()),
        "cuda" => Ok(Device::Cuda(0)),
        other => other
            .strip_prefix("cuda:")
            .and_then(|index| index.parse::<usize>().ok())
            .map(Device::Cuda)
            .ok_or_else(|| InitError::UnsupportedDevice(spec.clone())),
    }
}

/// TorchScript detector emitting one `ID_<rank>` entity per detection.
pub struct DetectorProcessor {
    module: Option<tch::CModule>,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    max_detections: usize,
}

impl DetectorProcessor {
    pub fn new<P: AsRef<Path>>(model_path: P, device: &str) -> Result<Self, InitError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(InitError::ModelMissing {
                path: model_path.to_path_buf(),
            });
        }
        let device = parse_device(device)?;
        let module = tch::CModule::load_on_device(model_path, device)
            .map_err(|err| InitError::Backend(err.to_string()))?;
        info!("Detector loaded from {} on {device:?}", model_path.display());
        Ok(Self {
            module: Some(module),
            device,
            input_size: (640, 640),
            confidence_threshold: 0.25,
            max_detections: 512,
        })
    }

    /// Nearest-neighbour resize of a BGR frame into a normalised RGB NCHW tensor.
    fn bgr_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        if frame.data.len() != frame.expected_len() || frame.width <= 0 || frame.height <= 0 {
            bail!(
                "unexpected frame buffer size: got {} bytes for {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            );
        }
        let (in_w, in_h) = self.input_size;
        let (src_w, src_h) = (frame.width as i64, frame.height as i64);
        let mut rgb = Vec::with_capacity((in_w * in_h * 3) as usize);
        for y in 0..in_h {
            let sy = (y * src_h / in_h) as usize;
            for x in 0..in_w {
                let sx = (x * src_w / in_w) as usize;
                let offset = (sy * src_w as usize + sx) * 3;
                let px = &frame.data[offset..offset + 3];
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }

        let tensor = Tensor::from_slice(&rgb)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }

    /// Run the module and keep predictions above the confidence threshold,
    /// highest score first.
    fn infer(&self, module: &tch::CModule, input: &Tensor) -> Result<Vec<Detection>> {
        let output = module.forward_ts(&[input])?;
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,conf), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let mut detections: Vec<Detection> = rows
            .into_iter()
            .filter(|row| row.len() >= 5 && row[4] >= self.confidence_threshold)
            .map(|row| Detection {
                bbox_xywh: [row[0], row[1], row[2], row[3]],
                score: row[4],
                class_id: if row.len() > 5 { row[5] as i64 } else { 0 },
            })
            .collect();
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        detections.truncate(self.max_detections);
        Ok(detections)
    }
}

impl FrameProcessor for DetectorProcessor {
    fn process(&mut self, frame: Frame) -> Result<ProcessedFrame> {
        if !matches!(frame.format, FrameFormat::Bgr8) {
            bail!("unsupported frame format {:?}", frame.format);
        }
        let Some(module) = self.module.as_ref() else {
            bail!("detector already released");
        };
        let input = self.bgr_to_tensor(&frame)?;
        let detections = tch::no_grad(|| self.infer(module, &input))?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w as f32;
        let scale_y = frame.height as f32 / in_h as f32;

        let mut packet = FeaturePacket::new(frame.timestamp_ms);
        packet.insert("detections", detections.len() as f64);
        let mut annotated = frame;
        for (rank, detection) in detections.iter().enumerate() {
            packet.insert(format!("{ENTITY_KEY_PREFIX}{rank}"), detection.score as f64);
            let [cx, cy, w, h] = detection.bbox_xywh;
            let rect = [
                ((cx - w / 2.0) * scale_x) as i32,
                ((cy - h / 2.0) * scale_y) as i32,
                ((cx + w / 2.0) * scale_x) as i32,
                ((cy + h / 2.0) * scale_y) as i32,
            ];
            draw_rectangle(
                &mut annotated.data,
                annotated.width,
                annotated.height,
                rect,
                RED,
                2,
            );
        }

        Ok(ProcessedFrame {
            features: Some(packet),
            annotated: Some(annotated),
        })
    }

    fn release(&mut self) {
        self.module = None;
    }
}
