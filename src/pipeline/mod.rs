//! Pipeline stages for tax-form extraction.
//!
//! Each submodule implements one transformation step, so each can be tested
//! on its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ backend chain ──▶ normalize ──▶ consolidate
//! (path)    (pdfium)   (base64)   (retry/fallback)   (schema)      (merge)
//! ```
//!
//! 1. [`input`]: validate the path and open it as a PDF or image document
//! 2. [`render`]: pdfium binding, text-layer reads and rasterisation; runs
//!    in `spawn_blocking` because pdfium is not async-safe
//! 3. [`encode`]: PNG-encode and base64-wrap each page image
//! 4. [`retry`]: the backoff policy every backend call runs under
//! 5. [`normalize`]: reconcile model JSON with the form's canonical schema
//! 6. [`consolidate`]: merge per-page records into one per form instance
//! 7. [`extract`]: drive 3–6 for one detected form range

pub mod consolidate;
pub mod encode;
pub mod extract;
pub mod input;
pub mod normalize;
pub mod render;
pub mod retry;
