use crate::error::{GymError, Result};
use crate::spaces::{Channels, ObservationSpec};
use crate::transport::codec;
use crate::transport::{DepthBytes, Frame};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbImage};
use ndarray::{Array3, Array4, ArrayView3, Axis};
use std::collections::VecDeque;
use tracing::warn;

type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A processed sensor snapshot conforming to an [`ObservationSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// `(history, height, width, channels)`, oldest frame first.
    pub data: Array4<f32>,
    /// Sequence number of the newest frame in the window.
    pub seq: u64,
    /// The newest frame was not fresh and the last good one was reused.
    pub stale: bool,
}

impl Observation {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// The newest frame of the history window, `(height, width, channels)`.
    pub fn latest(&self) -> ArrayView3<'_, f32> {
        let last = self.data.len_of(Axis(0)) - 1;
        self.data.index_axis(Axis(0), last)
    }

    pub fn conforms_to(&self, spec: &ObservationSpec) -> bool {
        self.data.shape() == spec.shape() && self.data.iter().all(|v| (0.0..=1.0).contains(v))
    }
}

/// Fails if the frame lacks a modality the spec asks for.
pub fn check_modalities(frame: &Frame, spec: &ObservationSpec) -> Result<()> {
    if spec.channels.needs_rgb() && frame.image.is_none() {
        return Err(GymError::ModalityUnavailable("rgb"));
    }
    if spec.channels.needs_depth() && frame.depth.is_none() {
        return Err(GymError::ModalityUnavailable("depth"));
    }
    Ok(())
}

/// Decode, resize, normalise and channel-select a single frame.
pub fn preprocess(frame: &Frame, spec: &ObservationSpec) -> Result<Array3<f32>> {
    check_modalities(frame, spec)?;
    let (w, h) = (spec.width as u32, spec.height as u32);

    let rgb = match (&frame.image, spec.channels.needs_rgb()) {
        (Some(bytes), true) => Some(decode_rgb(bytes, w, h)?),
        _ => None,
    };
    let depth = match (&frame.depth, spec.channels.needs_depth()) {
        (Some(d), true) => Some(decode_depth(d, w, h, spec.depth_max)?),
        _ => None,
    };

    let c = spec.channels.count();
    Ok(Array3::from_shape_fn((spec.height, spec.width, c), |(y, x, ch)| {
        let (x, y) = (x as u32, y as u32);
        match (spec.channels, &rgb, &depth) {
            (Channels::DepthOnly, _, Some(d)) => d.get_pixel(x, y)[0],
            (Channels::RgbOnly, Some(img), _) => img.get_pixel(x, y)[ch] as f32 / 255.,
            (Channels::Rgbd, Some(img), Some(d)) => {
                if ch < 3 {
                    img.get_pixel(x, y)[ch] as f32 / 255.
                } else {
                    d.get_pixel(x, y)[0]
                }
            }
            _ => 0.,
        }
    }))
}

fn decode_rgb(bytes: &[u8], w: u32, h: u32) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    if img.dimensions() == (w, h) {
        Ok(img)
    } else {
        Ok(imageops::resize(&img, w, h, FilterType::Triangle))
    }
}

/// Depth in metres to `[0, 1]`: NaN reads as 0, everything clips to `depth_max`.
fn decode_depth(depth: &DepthBytes, w: u32, h: u32, depth_max: f32) -> Result<DepthImage> {
    let values = codec::f32s_from_le_bytes(&depth.data)?;
    let expected = depth.width as usize * depth.height as usize;
    if values.len() != expected || expected == 0 {
        return Err(GymError::Decode(format!(
            "depth of {}x{} carries {} readings",
            depth.width,
            depth.height,
            values.len()
        )));
    }

    let normalised = values
        .into_iter()
        .map(|v| {
            let v = if v.is_nan() { 0. } else { v };
            v.clamp(0., depth_max) / depth_max
        })
        .collect::<Vec<_>>();
    let img = DepthImage::from_raw(depth.width, depth.height, normalised)
        .ok_or_else(|| GymError::Decode("depth buffer size mismatch".into()))?;

    if img.dimensions() == (w, h) {
        Ok(img)
    } else {
        Ok(imageops::resize(&img, w, h, FilterType::Triangle))
    }
}

/// Build a stand-alone observation from one frame, repeated over the history window.
pub fn build(frame: &Frame, spec: &ObservationSpec) -> Result<Observation> {
    let mut builder = ObservationBuilder::new(*spec);
    builder.reset(frame)
}

/// Stateful observation assembly with a rolling history window.
#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    spec: ObservationSpec,
    window: VecDeque<Array3<f32>>,
    last_good: Option<(Array3<f32>, u64)>,
}

impl ObservationBuilder {
    pub fn new(spec: ObservationSpec) -> Self {
        Self {
            spec,
            window: VecDeque::with_capacity(spec.history),
            last_good: None,
        }
    }

    pub fn spec(&self) -> &ObservationSpec {
        &self.spec
    }

    /// Start a new episode: the window is filled with `history` copies of `frame`.
    pub fn reset(&mut self, frame: &Frame) -> Result<Observation> {
        let processed = preprocess(frame, &self.spec)?;
        self.window.clear();
        for _ in 0..self.spec.history {
            self.window.push_back(processed.clone());
        }
        self.last_good = Some((processed, frame.seq));
        self.assemble(frame.seq, false)
    }

    /// Roll the window forward. A missing or undecodable frame reuses the
    /// last good one and marks the observation stale.
    pub fn push(&mut self, frame: Option<&Frame>) -> Result<Observation> {
        let fresh = match frame {
            Some(frame) => match preprocess(frame, &self.spec) {
                Ok(processed) => Some((processed, frame.seq)),
                Err(e) => {
                    warn!(seq = frame.seq, "reusing last good frame: {e}");
                    None
                }
            },
            None => None,
        };

        let stale = fresh.is_none();
        let (processed, seq) = match fresh {
            Some(fresh) => {
                self.last_good = Some(fresh.clone());
                fresh
            }
            None => self.last_good.clone().ok_or_else(|| {
                GymError::invalid_state("a reset observation window", "empty")
            })?,
        };

        if self.window.len() == self.spec.history {
            self.window.pop_front();
        }
        self.window.push_back(processed);
        // Only reachable before the first reset; pad so the shape always holds.
        while self.window.len() < self.spec.history {
            let first = self.window[0].clone();
            self.window.push_front(first);
        }

        self.assemble(seq, stale)
    }

    fn assemble(&self, seq: u64, stale: bool) -> Result<Observation> {
        let views = self.window.iter().map(|f| f.view()).collect::<Vec<_>>();
        let data = ndarray::stack(Axis(0), &views)
            .map_err(|e| GymError::Decode(format!("stacking history: {e}")))?;

        Ok(Observation { data, seq, stale })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::Telemetry;
    use chrono::Utc;
    use float_eq::assert_float_eq;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn spec(channels: Channels, history: usize) -> ObservationSpec {
        ObservationSpec {
            channels,
            height: 4,
            width: 6,
            history,
            depth_max: 10.,
        }
    }

    fn png(w: u32, h: u32, colour: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb(colour));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn depth(w: u32, h: u32, metres: f32) -> DepthBytes {
        DepthBytes {
            width: w,
            height: h,
            data: codec::f32s_to_le_bytes(&vec![metres; (w * h) as usize]),
        }
    }

    fn frame(seq: u64, image: Option<Vec<u8>>, depth: Option<DepthBytes>) -> Frame {
        Frame {
            seq,
            timestamp: Utc::now(),
            image,
            depth,
            telemetry: Telemetry::default(),
        }
    }

    #[test]
    fn rgbd_is_resized_normalised_and_concatenated() {
        let f = frame(1, Some(png(12, 8, [255, 0, 51])), Some(depth(3, 2, 5.)));
        let obs = build(&f, &spec(Channels::Rgbd, 1)).unwrap();

        assert_eq!(obs.shape(), &[1, 4, 6, 4]);
        let px = obs.latest();
        assert_float_eq!(px[[2, 3, 0]], 1.0, abs <= 1e-6);
        assert_float_eq!(px[[2, 3, 1]], 0.0, abs <= 1e-6);
        assert_float_eq!(px[[2, 3, 2]], 0.2, abs <= 1e-6);
        assert_float_eq!(px[[2, 3, 3]], 0.5, abs <= 1e-6);
        assert!(obs.conforms_to(&spec(Channels::Rgbd, 1)));
    }

    #[test]
    fn depth_is_clipped_and_nan_zeroed() {
        let mut d = depth(6, 4, 25.);
        let mut values = codec::f32s_from_le_bytes(&d.data).unwrap();
        values[0] = f32::NAN;
        d.data = codec::f32s_to_le_bytes(&values);

        let obs = build(&frame(1, None, Some(d)), &spec(Channels::DepthOnly, 1)).unwrap();
        let px = obs.latest();
        assert_eq!(px[[0, 0, 0]], 0.0);
        assert_eq!(px[[1, 1, 0]], 1.0);
    }

    #[test]
    fn missing_modality_is_reported() {
        let err = check_modalities(
            &frame(1, Some(png(6, 4, [0, 0, 0])), None),
            &spec(Channels::Rgbd, 1),
        )
        .unwrap_err();
        assert!(matches!(err, GymError::ModalityUnavailable("depth")));

        let err = check_modalities(&frame(1, None, Some(depth(6, 4, 1.))), &spec(Channels::RgbOnly, 1))
            .unwrap_err();
        assert!(matches!(err, GymError::ModalityUnavailable("rgb")));
    }

    #[test]
    fn reset_fills_history_with_first_frame() {
        let mut builder = ObservationBuilder::new(spec(Channels::DepthOnly, 3));
        let obs = builder.reset(&frame(1, None, Some(depth(6, 4, 2.)))).unwrap();

        assert_eq!(obs.shape(), &[3, 4, 6, 1]);
        for i in 0..3 {
            assert_float_eq!(obs.data[[i, 0, 0, 0]], 0.2, abs <= 1e-6);
        }
    }

    #[test]
    fn push_rolls_the_window() {
        let mut builder = ObservationBuilder::new(spec(Channels::DepthOnly, 2));
        builder.reset(&frame(1, None, Some(depth(6, 4, 2.)))).unwrap();
        let obs = builder
            .push(Some(&frame(2, None, Some(depth(6, 4, 4.)))))
            .unwrap();

        assert_eq!(obs.seq, 2);
        assert_float_eq!(obs.data[[0, 0, 0, 0]], 0.2, abs <= 1e-6);
        assert_float_eq!(obs.data[[1, 0, 0, 0]], 0.4, abs <= 1e-6);
    }

    #[test]
    fn glitches_reuse_last_good_frame() {
        let spec = spec(Channels::DepthOnly, 1);
        let mut builder = ObservationBuilder::new(spec);
        builder.reset(&frame(1, None, Some(depth(6, 4, 3.)))).unwrap();

        let missing = builder.push(None).unwrap();
        assert!(missing.stale);
        assert_eq!(missing.seq, 1);
        assert!(missing.conforms_to(&spec));

        let corrupt = DepthBytes {
            width: 6,
            height: 4,
            data: vec![1, 2, 3],
        };
        let glitched = builder.push(Some(&frame(2, None, Some(corrupt)))).unwrap();
        assert!(glitched.stale);
        assert_float_eq!(glitched.data[[0, 0, 0, 0]], 0.3, abs <= 1e-6);
        assert!(glitched.conforms_to(&spec));
    }

    #[test]
    fn push_before_reset_is_invalid() {
        let mut builder = ObservationBuilder::new(spec(Channels::DepthOnly, 1));
        let err = builder.push(None).unwrap_err();
        assert!(matches!(err, GymError::InvalidState { .. }));
    }
}
