//! Input resolution: validate a user-supplied path and open it as a
//! [`Document`].
//!
//! ## Why sniff magic bytes?
//!
//! Tax documents arrive as PDFs, phone photos and scanner output with
//! whatever extension the uploader chose. The first four bytes decide the
//! reader, so a JPEG named `w2.pdf` is still read as an image and a truncated
//! download fails with a clear error rather than a pdfium crash.

use crate::document::{Document, ImageDocument, PdfDocument};
use crate::error::TaxFormError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File kind detected from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Png,
    Jpeg,
}

impl InputKind {
    pub fn from_magic(magic: &[u8; 4]) -> Option<Self> {
        match magic {
            b"%PDF" => Some(InputKind::Pdf),
            [0x89, b'P', b'N', b'G'] => Some(InputKind::Png),
            [0xFF, 0xD8, 0xFF, _] => Some(InputKind::Jpeg),
            _ => None,
        }
    }

    /// Conventional file extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            InputKind::Pdf => "pdf",
            InputKind::Png => "png",
            InputKind::Jpeg => "jpg",
        }
    }
}

/// Check existence and read permission, then sniff the file kind.
pub fn inspect_input(path: &Path) -> Result<InputKind, TaxFormError> {
    let path_buf = PathBuf::from(path);

    if !path.exists() {
        return Err(TaxFormError::FileNotFound { path: path_buf });
    }

    let mut magic = [0u8; 4];
    match std::fs::File::open(path) {
        Ok(mut f) => {
            // Shorter files keep zeroed bytes and fail the sniff below.
            let _ = f.read(&mut magic);
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(TaxFormError::PermissionDenied { path: path_buf });
        }
        Err(_) => {
            return Err(TaxFormError::FileNotFound { path: path_buf });
        }
    }

    InputKind::from_magic(&magic).ok_or(TaxFormError::UnsupportedInput {
        path: path_buf,
        magic,
    })
}

/// Open `path` as a PDF or single-image document.
pub async fn open_document(
    path: &Path,
    password: Option<&str>,
) -> Result<Box<dyn Document>, TaxFormError> {
    let kind = inspect_input(path)?;
    debug!("Resolved {} as {:?}", path.display(), kind);

    Ok(match kind {
        InputKind::Pdf => Box::new(PdfDocument::open(path, password).await?),
        InputKind::Png | InputKind::Jpeg => Box::new(ImageDocument::open(path).await?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes() {
        assert_eq!(InputKind::from_magic(b"%PDF"), Some(InputKind::Pdf));
        assert_eq!(
            InputKind::from_magic(&[0x89, b'P', b'N', b'G']),
            Some(InputKind::Png)
        );
        assert_eq!(
            InputKind::from_magic(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(InputKind::Jpeg)
        );
        assert_eq!(InputKind::from_magic(b"PK\x03\x04"), None);
    }

    #[test]
    fn missing_file() {
        let err = inspect_input(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, TaxFormError::FileNotFound { .. }));
    }

    #[test]
    fn unsupported_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, b"hello world").unwrap();
        let err = inspect_input(&path).unwrap_err();
        assert!(matches!(err, TaxFormError::UnsupportedInput { magic, .. } if &magic == b"hell"));
    }

    #[test]
    fn tiny_file_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pdf");
        std::fs::write(&path, b"%P").unwrap();
        assert!(inspect_input(&path).is_err());
    }

    #[test]
    fn png_by_content_not_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w2.pdf");
        std::fs::write(&path, [0x89, b'P', b'N', b'G', 0x0D, 0x0A]).unwrap();
        assert_eq!(inspect_input(&path).unwrap(), InputKind::Png);
    }
}
