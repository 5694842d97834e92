use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::sampler::RenderState;

pub type Rgba = [u8; 4];

pub const DEFAULT_BACKGROUND: Rgba = [16, 18, 24, 255];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("layer '{0}' has zero size")]
    EmptyLayer(String),
    #[error("layer '{name}' expected {expected} bytes but holds {actual}")]
    CorruptLayer {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("surface is held by an export job")]
    HeldByExport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, [0, 0, 0, 0])
    }

    #[must_use]
    pub fn filled(width: u32, height: u32, color: Rgba) -> Self {
        let pixel_count = width as usize * height as usize;
        Self {
            width,
            height,
            pixels: color.repeat(pixel_count),
        }
    }

    #[must_use]
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let slice = self.pixels.get(offset..offset + 4)?;
        Some([slice[0], slice[1], slice[2], slice[3]])
    }

    pub fn fill(&mut self, color: Rgba) {
        for pixel in self.pixels.chunks_exact_mut(4) {
            pixel.copy_from_slice(&color);
        }
    }

    pub fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Rgba) {
        let x_end = x.saturating_add(width).min(self.width);
        let y_end = y.saturating_add(height).min(self.height);
        for row in y.min(self.height)..y_end {
            let start = (row as usize * self.width as usize + x.min(self.width) as usize) * 4;
            let end = (row as usize * self.width as usize + x_end as usize) * 4;
            for pixel in self.pixels[start..end].chunks_exact_mut(4) {
                pixel.copy_from_slice(&color);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub visible: bool,
    pub frame: Frame,
}

impl Layer {
    #[must_use]
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            visible: true,
            frame: Frame::new(width, height),
        }
    }
}

pub trait DrawingSurface: Send {
    fn size(&self) -> (u32, u32);

    fn draw_frame(&mut self, state: &RenderState);

    fn layers(&self) -> &[Layer];
}

pub trait FrameTarget {
    fn draw(&mut self, state: &RenderState);
}

#[must_use]
pub fn even_dimension(value: f64) -> u32 {
    let rounded = value.round().max(2.0) as u32;
    rounded - rounded % 2
}

// Output dimensions are rounded down to even numbers for yuv420.
#[derive(Debug, Clone)]
pub struct Compositor {
    background: Rgba,
    master: Frame,
}

impl Compositor {
    #[must_use]
    pub fn new(source_size: (u32, u32), scale: f64, background: Rgba) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        let width = even_dimension(f64::from(source_size.0) * scale);
        let height = even_dimension(f64::from(source_size.1) * scale);
        Self {
            background,
            master: Frame::filled(width, height, background),
        }
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.master.width, self.master.height)
    }

    #[must_use]
    pub fn blank(&self) -> Frame {
        Frame::filled(self.master.width, self.master.height, self.background)
    }

    pub fn composite(&mut self, layers: &[Layer]) -> Result<&Frame, SurfaceError> {
        for layer in layers.iter().filter(|layer| layer.visible) {
            if layer.frame.width == 0 || layer.frame.height == 0 {
                return Err(SurfaceError::EmptyLayer(layer.name.clone()));
            }
            let expected = layer.frame.expected_len();
            if layer.frame.pixels.len() != expected {
                return Err(SurfaceError::CorruptLayer {
                    name: layer.name.clone(),
                    expected,
                    actual: layer.frame.pixels.len(),
                });
            }
        }

        // Clearing first keeps stale pixels from ghosting into the next frame.
        self.master.fill(self.background);
        let (width, height) = self.size();
        for layer in layers.iter().filter(|layer| layer.visible) {
            blend_scaled(&mut self.master, &layer.frame, width, height);
        }

        trace!(width, height, layers = layers.len(), "layers composited");
        Ok(&self.master)
    }
}

fn blend_scaled(master: &mut Frame, source: &Frame, width: u32, height: u32) {
    let src_width = source.width as usize;
    for y in 0..height as usize {
        let src_y = y * source.height as usize / height as usize;
        for x in 0..width as usize {
            let src_x = x * src_width / width as usize;
            let src = (src_y * src_width + src_x) * 4;
            let dst = (y * width as usize + x) * 4;
            blend_pixel(&mut master.pixels[dst..dst + 4], &source.pixels[src..src + 4]);
        }
    }
}

fn blend_pixel(dst: &mut [u8], src: &[u8]) {
    let alpha = u32::from(src[3]);
    if alpha == 0 {
        return;
    }
    if alpha == 255 {
        dst.copy_from_slice(src);
        return;
    }

    let inverse = 255 - alpha;
    for channel in 0..3 {
        let mixed = (u32::from(src[channel]) * alpha + u32::from(dst[channel]) * inverse + 127) / 255;
        dst[channel] = mixed as u8;
    }
    let out_alpha = alpha + (u32::from(dst[3]) * inverse + 127) / 255;
    dst[3] = out_alpha.min(255) as u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceHolder {
    Idle,
    Live,
    Export,
}

// While an export lease is alive, live draws are dropped.
#[derive(Clone)]
pub struct SharedSurface {
    surface: Arc<Mutex<Box<dyn DrawingSurface>>>,
    holder: Arc<Mutex<SurfaceHolder>>,
}

impl std::fmt::Debug for SharedSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSurface")
            .field("holder", &*self.holder.lock())
            .finish_non_exhaustive()
    }
}

impl SharedSurface {
    #[must_use]
    pub fn new(surface: impl DrawingSurface + 'static) -> Self {
        Self {
            surface: Arc::new(Mutex::new(Box::new(surface))),
            holder: Arc::new(Mutex::new(SurfaceHolder::Idle)),
        }
    }

    #[must_use]
    pub fn holder(&self) -> SurfaceHolder {
        *self.holder.lock()
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        self.surface.lock().size()
    }

    pub fn draw_live(&self, state: &RenderState) -> bool {
        // Lock order is holder then surface; an export cannot be acquired
        // while a live draw is in progress.
        let mut holder = self.holder.lock();
        if *holder == SurfaceHolder::Export {
            trace!(chord_index = state.chord_index, "live draw dropped during export");
            return false;
        }
        *holder = SurfaceHolder::Live;
        self.surface.lock().draw_frame(state);
        true
    }

    pub fn acquire_export(&self) -> Result<SurfaceLease, SurfaceError> {
        let mut holder = self.holder.lock();
        if *holder == SurfaceHolder::Export {
            return Err(SurfaceError::HeldByExport);
        }
        *holder = SurfaceHolder::Export;
        debug!("surface acquired for export");
        Ok(SurfaceLease {
            surface: Arc::clone(&self.surface),
            holder: Arc::clone(&self.holder),
        })
    }

    #[must_use]
    pub fn live_target(&self) -> LiveTarget {
        LiveTarget {
            surface: self.clone(),
        }
    }
}

pub struct SurfaceLease {
    surface: Arc<Mutex<Box<dyn DrawingSurface>>>,
    holder: Arc<Mutex<SurfaceHolder>>,
}

impl SurfaceLease {
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        self.surface.lock().size()
    }

    pub fn draw(&self, state: &RenderState) {
        self.surface.lock().draw_frame(state);
    }

    pub fn composite_into<'c>(
        &self,
        compositor: &'c mut Compositor,
    ) -> Result<&'c Frame, SurfaceError> {
        let surface = self.surface.lock();
        compositor.composite(surface.layers())
    }
}

impl FrameTarget for SurfaceLease {
    fn draw(&mut self, state: &RenderState) {
        SurfaceLease::draw(self, state);
    }
}

impl FrameTarget for &SurfaceLease {
    fn draw(&mut self, state: &RenderState) {
        SurfaceLease::draw(*self, state);
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        *self.holder.lock() = SurfaceHolder::Idle;
        debug!("export surface lease released");
    }
}

#[derive(Debug, Clone)]
pub struct LiveTarget {
    surface: SharedSurface,
}

impl FrameTarget for LiveTarget {
    fn draw(&mut self, state: &RenderState) {
        let _ = self.surface.draw_live(state);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;

    struct Solid {
        layers: Vec<Layer>,
        draws: usize,
    }

    impl Solid {
        fn new() -> Self {
            let mut layer = Layer::new("solid", 4, 4);
            layer.frame.fill([200, 10, 10, 255]);
            Self {
                layers: vec![layer],
                draws: 0,
            }
        }
    }

    impl DrawingSurface for Solid {
        fn size(&self) -> (u32, u32) {
            (4, 4)
        }

        fn draw_frame(&mut self, _state: &RenderState) {
            self.draws += 1;
        }

        fn layers(&self) -> &[Layer] {
            &self.layers
        }
    }

    #[test]
    fn compositor_scales_to_even_dimensions() {
        let compositor = Compositor::new((101, 51), 0.5, DEFAULT_BACKGROUND);
        assert_eq!(compositor.size(), (50, 26));
    }

    #[test]
    fn hidden_layers_are_skipped_and_background_cleared() {
        let mut compositor = Compositor::new((4, 4), 1.0, DEFAULT_BACKGROUND);
        let mut layer = Layer::new("marker", 4, 4);
        layer.frame.fill_rect(0, 0, 2, 2, [255, 255, 255, 255]);
        let frame = compositor.composite(&[layer.clone()]).expect("composite");
        assert_eq!(frame.pixel(0, 0), Some([255, 255, 255, 255]));
        assert_eq!(frame.pixel(3, 3), Some(DEFAULT_BACKGROUND));

        layer.visible = false;
        let frame = compositor.composite(&[layer]).expect("composite");
        assert_eq!(frame.pixel(0, 0), Some(DEFAULT_BACKGROUND));
    }

    #[test]
    fn half_alpha_blends_towards_source() {
        let mut compositor = Compositor::new((2, 2), 1.0, [0, 0, 0, 255]);
        let mut layer = Layer::new("glass", 2, 2);
        layer.frame.fill([255, 255, 255, 128]);
        let frame = compositor.composite(&[layer]).expect("composite");
        let [r, _, _, a] = frame.pixel(1, 1).expect("pixel");
        assert_eq!(r, 128);
        assert_eq!(a, 255);
    }

    #[test]
    fn malformed_layers_fail_the_frame() {
        let mut compositor = Compositor::new((4, 4), 1.0, DEFAULT_BACKGROUND);
        let corrupt = Layer {
            name: "corrupt".to_string(),
            visible: true,
            frame: Frame::from_raw(4, 4, vec![0; 3]),
        };
        assert!(matches!(
            compositor.composite(&[corrupt]),
            Err(SurfaceError::CorruptLayer { .. })
        ));
    }

    #[test]
    fn export_lease_preempts_live_draws() {
        let shared = SharedSurface::new(Solid::new());
        assert!(shared.draw_live(&RenderState::resting()));
        assert_eq!(shared.holder(), SurfaceHolder::Live);

        let lease = shared.acquire_export().expect("export lease");
        assert!(!shared.draw_live(&RenderState::resting()));
        assert!(matches!(
            shared.acquire_export(),
            Err(SurfaceError::HeldByExport)
        ));

        drop(lease);
        assert_eq!(shared.holder(), SurfaceHolder::Idle);
        assert!(shared.draw_live(&RenderState::resting()));
    }

    struct Gated {
        layers: Vec<Layer>,
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl DrawingSurface for Gated {
        fn size(&self) -> (u32, u32) {
            (2, 2)
        }

        fn draw_frame(&mut self, _state: &RenderState) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }

        fn layers(&self) -> &[Layer] {
            &self.layers
        }
    }

    #[test]
    fn export_waits_for_an_in_flight_live_draw() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let shared = SharedSurface::new(Gated {
            layers: vec![Layer::new("gate", 2, 2)],
            entered: entered_tx,
            release: release_rx,
        });

        let live = shared.clone();
        let drawer = thread::spawn(move || live.draw_live(&RenderState::resting()));
        entered_rx.recv().expect("live draw started");

        let (acquired_tx, acquired_rx) = mpsc::channel();
        let exporter = shared.clone();
        let acquirer = thread::spawn(move || {
            let lease = exporter.acquire_export().expect("export lease");
            acquired_tx.send(()).expect("report acquisition");
            lease
        });

        assert!(
            acquired_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "export acquired the surface mid-draw"
        );
        release_tx.send(()).expect("release draw");
        assert!(drawer.join().expect("drawer thread"));
        acquired_rx.recv().expect("export acquired after the draw");

        let lease = acquirer.join().expect("acquirer thread");
        assert_eq!(shared.holder(), SurfaceHolder::Export);
        drop(lease);
    }
}
