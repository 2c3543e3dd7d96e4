//! WebAssembly bindings for the PDF size-target compressor

use crate::{image_inventory, CompressOptions, PageImages, SizeTargetCompressor, TargetWindow};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Serialize;
use wasm_bindgen::prelude::*;

/// Forwards `log` records to the browser console.
struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = JsValue::from(format!("[{}] {}", record.target(), record.args()));
        match record.level() {
            Level::Error => web_sys::console::error_1(&message),
            Level::Warn => web_sys::console::warn_1(&message),
            Level::Info => web_sys::console::info_1(&message),
            Level::Debug | Level::Trace => web_sys::console::debug_1(&message),
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Initialize panic hook and console logging
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Switch console logging to per-probe detail.
#[wasm_bindgen]
pub fn set_verbose(verbose: bool) {
    log::set_max_level(if verbose { LevelFilter::Debug } else { LevelFilter::Info });
}

/// Compress a PDF toward a size window
///
/// # Arguments
/// * `pdf_bytes` - The input PDF file as a byte array
/// * `min_kb` - Lower bound of the window in KB (default: 80)
/// * `max_kb` - Upper bound of the window in KB (default: 100)
/// * `strip_watermarks` - Run the watermark pre-pass (default: false)
///
/// # Returns
/// A `CompressResultJs` with the output PDF and how it was produced, or throws an error
#[wasm_bindgen]
pub fn compress_pdf(
    pdf_bytes: &[u8],
    min_kb: Option<usize>,
    max_kb: Option<usize>,
    strip_watermarks: Option<bool>,
) -> Result<CompressResultJs, JsError> {
    let window = TargetWindow::from_kb(min_kb.unwrap_or(80), max_kb.unwrap_or(100))
        .map_err(|e| JsError::new(&e.to_string()))?;

    let mut options = CompressOptions::default();
    if strip_watermarks.unwrap_or(false) {
        options = options.with_watermark_stripping();
    }

    let result = SizeTargetCompressor::new(options)
        .compress(pdf_bytes, window)
        .map_err(|e| JsError::new(&e.to_string()))?;

    Ok(CompressResultJs {
        fits: result.fits(window),
        stage: result.stage.to_string(),
        probes: result.probes,
        pdf_bytes: result.bytes,
    })
}

/// List the images of a PDF per page as a JSON string
#[wasm_bindgen]
pub fn pdf_image_inventory(pdf_bytes: &[u8]) -> Result<String, JsError> {
    let pages = image_inventory(pdf_bytes).map_err(|e| JsError::new(&e.to_string()))?;
    serde_json::to_string(&pages_to_json(&pages)).map_err(|e| JsError::new(&e.to_string()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PageJson {
    page: u32,
    images: Vec<ImageJson>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageJson {
    object_id: String,
    #[serde(rename = "type")]
    kind: String,
    width: u32,
    height: u32,
    color_space: String,
    bpc: u32,
    filter: String,
    size: usize,
    placements: Vec<[f32; 4]>,
}

fn pages_to_json(pages: &[PageImages]) -> Vec<PageJson> {
    pages
        .iter()
        .map(|page| PageJson {
            page: page.page_number,
            images: page
                .images
                .iter()
                .map(|img| ImageJson {
                    object_id: format!("{} {}", img.object_id.0, img.object_id.1),
                    kind: img.kind.to_string(),
                    width: img.width,
                    height: img.height,
                    color_space: img.color_space.clone(),
                    bpc: img.bits_per_component,
                    filter: img.filter.clone(),
                    size: img.size_bytes,
                    placements: img.placements.iter().map(|r| [r.x0, r.y0, r.x1, r.y1]).collect(),
                })
                .collect(),
        })
        .collect()
}

/// Result of a compression run
#[wasm_bindgen]
pub struct CompressResultJs {
    pdf_bytes: Vec<u8>,
    fits: bool,
    stage: String,
    probes: usize,
}

#[wasm_bindgen]
impl CompressResultJs {
    /// Get the compressed PDF bytes
    #[wasm_bindgen(getter)]
    pub fn pdf_bytes(&self) -> js_sys::Uint8Array {
        js_sys::Uint8Array::from(self.pdf_bytes.as_slice())
    }

    /// Get the output size in bytes
    #[wasm_bindgen(getter)]
    pub fn size(&self) -> usize {
        self.pdf_bytes.len()
    }

    /// Whether the output landed inside the window
    #[wasm_bindgen(getter)]
    pub fn fits(&self) -> bool {
        self.fits
    }

    /// Name of the stage that produced the output
    #[wasm_bindgen(getter)]
    pub fn stage(&self) -> String {
        self.stage.clone()
    }

    /// Number of search and fallback probes spent
    #[wasm_bindgen(getter)]
    pub fn probes(&self) -> usize {
        self.probes
    }
}
