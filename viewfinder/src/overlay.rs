//! Viewfinder overlay drawn on top of the camera picture.
//!
use common::frame::Frame;
use image::{DynamicImage, RgbImage, Rgba, RgbaImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
    rect::Rect,
};

use crate::{
    config::{AlertPolicy, MaskGeometry, PipelineConfig},
    postproc::Inference,
    preproc::CropRect,
};

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
const STROKE_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BOX_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);

/// Show/hide target toggled with the alert flag.
pub trait AlertSignal {
    fn set_visible(&mut self, visible: bool);
}

/// Banner reporting its show/hide transitions in the log.
#[derive(Debug, Default)]
pub struct LogBanner {
    visible: Option<bool>,
}

impl AlertSignal for LogBanner {
    fn set_visible(&mut self, visible: bool) {
        if self.visible != Some(visible) {
            match visible {
                true => log::info!("Banner shown"),
                false => log::info!("Banner hidden"),
            }
            self.visible = Some(visible);
        }
    }
}

/// Overlay of one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayState {
    pub inference: Inference,
    pub alert: bool,
}

/// Derive the alert flag of a frame.
pub fn alert(policy: AlertPolicy, inference: &Inference) -> bool {
    match (policy, inference) {
        (_, Inference::Classification(classification)) => classification.detected,
        (AlertPolicy::Classifier, Inference::Detections(_)) => false,
        (
            AlertPolicy::MinCount {
                min_count,
                score_floor,
            },
            Inference::Detections(detections),
        ) => {
            detections
                .iter()
                .filter(|detection| detection.score >= score_floor)
                .count()
                >= min_count
        }
        (AlertPolicy::AnyDetection, Inference::Detections(detections)) => !detections.is_empty(),
    }
}

/// Transparent cutout of the viewfinder mask in surface pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cutout {
    pub left: i32,
    pub top: i32,
    pub size: u32,
}

/// Place the cutout on a `width` x `height` surface, `None` for an empty cutout.
pub fn cutout(mask: &MaskGeometry, width: u32, height: u32) -> Option<Cutout> {
    let size = (width.min(height) as f32 * mask.size_fraction) as u32;
    if size == 0 {
        return None;
    }

    let left = (width as f32 - size as f32) / 2.0;
    let top = (height as f32 - size as f32) / 2.0 + mask.vertical_offset * height as f32;

    Some(Cutout {
        left: left.round() as i32,
        top: top.round() as i32,
        size,
    })
}

/// Draws the viewfinder mask and drives the alert signal.
pub struct OverlayRenderer {
    mask: MaskGeometry,
    policy: AlertPolicy,
    signal: Option<Box<dyn AlertSignal>>,
}

impl OverlayRenderer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            mask: config.mask,
            policy: config.alert,
            signal: None,
        }
    }

    /// Toggle `signal` on every rendered frame.
    pub fn with_signal(mut self, signal: Box<dyn AlertSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Redraw `surface` for the inference result of the current frame.
    ///
    /// `crop` is the frame region the model saw, used to place detection boxes.
    pub fn render(
        &mut self,
        surface: &mut RgbaImage,
        inference: Inference,
        crop: Option<CropRect>,
    ) -> OverlayState {
        self.draw_mask(surface);

        if self.mask.draw_boxes {
            if let Some(crop) = crop {
                draw_detection_boxes(surface, &inference, crop);
            }
        }

        let alert = alert(self.policy, &inference);
        if let Some(signal) = self.signal.as_mut() {
            signal.set_visible(alert);
        }

        OverlayState { inference, alert }
    }

    fn draw_mask(&self, surface: &mut RgbaImage) {
        let shade = Rgba([0, 0, 0, (self.mask.shade_alpha * 255.0).round() as u8]);
        // Overwrites everything drawn for the previous frame
        surface.pixels_mut().for_each(|pixel| *pixel = shade);

        let Some(cutout) = cutout(&self.mask, surface.width(), surface.height()) else {
            return;
        };

        draw_filled_rect_mut(
            surface,
            Rect::at(cutout.left, cutout.top).of_size(cutout.size, cutout.size),
            TRANSPARENT,
        );

        if let Some(stroke_width) = self.mask.stroke_width {
            // Grow outwards, the cutout stays fully transparent
            for offset in 1..=stroke_width as i32 {
                let size = cutout.size + 2 * offset as u32;
                draw_hollow_rect_mut(
                    surface,
                    Rect::at(cutout.left - offset, cutout.top - offset).of_size(size, size),
                    STROKE_COLOR,
                );
            }
        }
    }
}

/// Draw hollow rectangles around detections, mapped from model input to surface pixels.
fn draw_detection_boxes(surface: &mut RgbaImage, inference: &Inference, crop: CropRect) {
    let scale = crop.size as f32;

    for detection in inference.detections() {
        let [x, y, width, height] = detection.bbox;
        let (x_tl, y_tl) = (crop.x as f32 + x * scale, crop.y as f32 + y * scale);
        let (rect_width, rect_height) = ((width * scale) as u32, (height * scale) as u32);
        if rect_width == 0 || rect_height == 0 {
            continue;
        }

        draw_hollow_rect_mut(
            surface,
            Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width, rect_height),
            BOX_COLOR,
        );
    }
}

/// Blend the overlay `surface` over the camera picture.
pub fn composite(frame: &Frame, surface: &RgbaImage) -> RgbImage {
    let mut picture = frame.as_image().clone();
    image::imageops::overlay(&mut picture, surface, 0, 0);

    DynamicImage::ImageRgba8(picture).into_rgb8()
}

#[cfg(test)]
mod test {

    use std::{cell::Cell, rc::Rc};

    use super::*;
    use crate::{
        config::Preset,
        postproc::{classify, Detection},
    };

    #[derive(Clone, Default)]
    struct Flag(Rc<Cell<Option<bool>>>);

    impl AlertSignal for Flag {
        fn set_visible(&mut self, visible: bool) {
            self.0.set(Some(visible));
        }
    }

    fn detection(score: f32) -> Detection {
        Detection {
            label: "ECOQCODE".into(),
            score,
            bbox: [0.4, 0.4, 0.2, 0.2],
        }
    }

    #[test]
    fn centered_cutout() {
        let mask = MaskGeometry::default();
        assert_eq!(
            cutout(&mask, 640, 480),
            Some(Cutout {
                left: 176,
                top: 96,
                size: 288
            })
        );

        let shifted = MaskGeometry {
            vertical_offset: -0.1,
            ..mask
        };
        assert_eq!(cutout(&shifted, 640, 480).map(|c| c.top), Some(48));
    }

    #[test]
    fn zero_size_mask_has_no_cutout() {
        let mut config = Preset::DetectorRelaxed.config();
        config.mask.size_fraction = 0.0;
        assert_eq!(cutout(&config.mask, 640, 480), None);

        let mut renderer = OverlayRenderer::new(&config);
        let mut surface = RgbaImage::new(64, 48);
        renderer.render(&mut surface, Inference::Detections(vec![]), None);

        let shade = Rgba([0, 0, 0, 191]);
        assert!(surface.pixels().all(|pixel| *pixel == shade));
    }

    #[test]
    fn mask_with_stroke() {
        let config = Preset::Classifier.config();
        let mut renderer = OverlayRenderer::new(&config);
        let mut surface = RgbaImage::from_pixel(100, 50, Rgba([9, 9, 9, 9]));

        renderer.render(&mut surface, Inference::Classification(classify(-1.0, 0.5)), None);

        // 30x30 cutout at (35, 10), two pixels of border around it
        assert_eq!(*surface.get_pixel(50, 25), TRANSPARENT);
        assert_eq!(*surface.get_pixel(35, 10), TRANSPARENT);
        assert_eq!(*surface.get_pixel(64, 39), TRANSPARENT);
        assert_eq!(*surface.get_pixel(34, 25), STROKE_COLOR);
        assert_eq!(*surface.get_pixel(33, 25), STROKE_COLOR);
        assert_eq!(*surface.get_pixel(32, 25), Rgba([0, 0, 0, 191]));
        assert_eq!(*surface.get_pixel(0, 0), Rgba([0, 0, 0, 191]));
    }

    #[test]
    fn cutout_is_clipped_to_the_surface() {
        let mut config = Preset::DetectorRelaxed.config();
        config.mask.vertical_offset = -0.5;
        let mut renderer = OverlayRenderer::new(&config);
        let mut surface = RgbaImage::new(40, 40);

        renderer.render(&mut surface, Inference::Detections(vec![]), None);

        assert_eq!(*surface.get_pixel(20, 0), TRANSPARENT);
    }

    #[test]
    fn alert_policies() {
        let three = Inference::Detections(vec![detection(0.9), detection(0.5), detection(0.7)]);
        let two = Inference::Detections(vec![detection(0.9), detection(0.49), detection(0.7)]);
        let none = Inference::Detections(vec![]);
        let min_count = AlertPolicy::MinCount {
            min_count: 3,
            score_floor: 0.5,
        };

        assert!(alert(min_count, &three));
        assert!(!alert(min_count, &two));
        assert!(alert(AlertPolicy::AnyDetection, &two));
        assert!(!alert(AlertPolicy::AnyDetection, &none));
        assert!(alert(
            AlertPolicy::Classifier,
            &Inference::Classification(classify(2.0, 0.5))
        ));
        assert!(!alert(AlertPolicy::Classifier, &none));
    }

    #[test]
    fn toggles_the_signal() {
        let flag = Flag::default();
        let mut renderer = OverlayRenderer::new(&Preset::DetectorRelaxed.config())
            .with_signal(Box::new(flag.clone()));
        let mut surface = RgbaImage::new(64, 48);

        let state = renderer.render(
            &mut surface,
            Inference::Detections(vec![detection(0.45)]),
            None,
        );
        assert!(state.alert);
        assert_eq!(flag.0.get(), Some(true));

        let state = renderer.render(&mut surface, Inference::Detections(vec![]), None);
        assert!(!state.alert);
        assert_eq!(flag.0.get(), Some(false));
    }

    #[test]
    fn missing_signal_is_tolerated() {
        let mut renderer = OverlayRenderer::new(&Preset::Detector.config());
        let mut surface = RgbaImage::new(64, 48);
        let inference = Inference::Detections(vec![detection(0.9); 3]);

        assert!(renderer.render(&mut surface, inference, None).alert);
    }

    #[test]
    fn composite_blends_the_mask() {
        let frame = Frame::filled(4, 4, [200, 100, 50, 255]);
        let mut surface = RgbaImage::new(4, 4);
        surface.put_pixel(0, 0, Rgba([0, 0, 0, 255]));

        let picture = composite(&frame, &surface);

        assert_eq!(picture.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(picture.get_pixel(3, 3).0, [200, 100, 50]);
    }

    #[test]
    fn draws_detection_boxes() {
        let mut config = Preset::DetectorRelaxed.config();
        config.mask.draw_boxes = true;
        config.mask.size_fraction = 0.0;
        let mut renderer = OverlayRenderer::new(&config);
        let mut surface = RgbaImage::new(200, 200);
        let crop = CropRect {
            x: 50,
            y: 50,
            size: 100,
        };

        renderer.render(
            &mut surface,
            Inference::Detections(vec![detection(0.9)]),
            Some(crop),
        );

        // bbox [0.4, 0.4, 0.2, 0.2] of the crop is (90, 90) to (109, 109) on the surface
        assert_eq!(*surface.get_pixel(90, 90), BOX_COLOR);
        assert_eq!(*surface.get_pixel(109, 90), BOX_COLOR);
        assert_ne!(*surface.get_pixel(100, 100), BOX_COLOR);
    }
}
