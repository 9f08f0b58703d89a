//! PDF access through pdfium: page text and rasterisation.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! Every function here is blocking and is called from
//! `tokio::task::spawn_blocking` by [`crate::document::PdfDocument`], so the
//! Tokio worker threads never stall on CPU-heavy rendering.
//!
//! ## Why bind per call?
//!
//! A `Pdfium` handle is neither `Send` nor cheap to share across the blocking
//! pool. Binding is a `dlopen` of an already-loaded library, so each blocking
//! task binds its own handle, opens the document, does its work and drops
//! everything before returning.

use crate::error::TaxFormError;
use image::DynamicImage;
use pdfium_render::prelude::{PdfRenderConfig, Pdfium};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable pointing at a pdfium shared library (file or directory).
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Bind to pdfium: `$PDFIUM_LIB_PATH` when set, the system library otherwise.
pub fn bind_pdfium() -> Result<Pdfium, TaxFormError> {
    let bindings = match std::env::var_os(PDFIUM_LIB_PATH_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            debug!("Binding pdfium from {}", lib.display());
            Pdfium::bind_to_library(lib)
        }
        None => Pdfium::bind_to_system_library(),
    };

    bindings
        .map(Pdfium::new)
        .map_err(|e| TaxFormError::PdfiumBindingFailed(format!("{e:?}")))
}

/// Map a pdfium load failure onto the password/corruption variants.
fn load_error(pdf_path: &Path, password: Option<&str>, err_str: String) -> TaxFormError {
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            TaxFormError::WrongPassword {
                path: pdf_path.to_path_buf(),
            }
        } else {
            TaxFormError::PasswordRequired {
                path: pdf_path.to_path_buf(),
            }
        }
    } else {
        TaxFormError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail: err_str,
        }
    }
}

/// Open a PDF and return the text layer of every page, in page order.
///
/// Pages whose text cannot be read yield an empty string, which sends them
/// down the filename fallback during classification.
pub fn read_page_texts(pdf_path: &Path, password: Option<&str>) -> Result<Vec<String>, TaxFormError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_error(pdf_path, password, format!("{:?}", e)))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let texts = pages
        .iter()
        .map(|page| page.text().map(|t| t.all()).unwrap_or_default())
        .collect::<Vec<_>>();

    let chars: usize = texts.iter().map(|t| t.chars().count()).sum();
    debug!("Text layer: {} characters over {} pages", chars, total_pages);
    Ok(texts)
}

/// Rasterise 1-based `pages` at `scale` × the page's natural size.
///
/// Failures are reported per page so one unreadable page does not lose its
/// siblings; a document that cannot be opened at all is a fatal error.
pub fn render_pages_blocking(
    pdf_path: &Path,
    password: Option<&str>,
    pages_to_render: &[usize],
    scale: f32,
) -> Result<Vec<(usize, Result<DynamicImage, TaxFormError>)>, TaxFormError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_error(pdf_path, password, format!("{:?}", e)))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

    let mut results = Vec::with_capacity(pages_to_render.len());
    for &page_num in pages_to_render {
        if page_num == 0 || page_num > total_pages {
            results.push((
                page_num,
                Err(TaxFormError::PageOutOfRange {
                    page: page_num,
                    total: total_pages,
                }),
            ));
            continue;
        }

        let rendered = pages
            .get((page_num - 1) as u16)
            .and_then(|page| {
                page.render_with_config(&render_config)
                    .map(|bitmap| bitmap.as_image())
            })
            .map_err(|e| TaxFormError::RasterisationFailed {
                page: page_num,
                detail: format!("{:?}", e),
            });

        if let Ok(image) = &rendered {
            debug!(
                "Rendered page {} → {}x{} px",
                page_num,
                image.width(),
                image.height()
            );
        }
        results.push((page_num, rendered));
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_errors_are_classified() {
        let path = Path::new("locked.pdf");
        let err = load_error(path, None, "PdfiumLibraryInternalError(PasswordError)".into());
        assert!(matches!(err, TaxFormError::PasswordRequired { .. }));
        let err = load_error(path, Some("x"), "PasswordError".into());
        assert!(matches!(err, TaxFormError::WrongPassword { .. }));
        let err = load_error(path, None, "FormatError".into());
        assert!(matches!(err, TaxFormError::CorruptPdf { .. }));
    }
}
