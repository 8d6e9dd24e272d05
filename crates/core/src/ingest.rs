use crate::extractor::PdfExtractor;
use crate::models::{Document, DocumentFingerprint};
use crate::normalizer::TextNormalizer;
use crate::IngestError;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// A file is taken as-is; a folder is searched recursively for PDFs.
pub fn resolve_pdf_sources(path: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    if !path.is_dir() {
        return Err(IngestError::InvalidArgument(format!(
            "pdf source does not exist: {}",
            path.display()
        )));
    }

    let files = discover_pdf_files(path);
    if files.is_empty() {
        return Err(IngestError::EmptyCorpus(format!(
            "no pdf files found in {}",
            path.display()
        )));
    }
    Ok(files)
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// One document per non-empty page, across every source under `path`.
pub fn load_documents<X>(path: &Path, extractor: &X) -> Result<Vec<Document>, IngestError>
where
    X: PdfExtractor + ?Sized,
{
    let mut documents = Vec::new();

    for source in resolve_pdf_sources(path)? {
        let fingerprint = build_document_fingerprint(&source)?;
        let pages = extractor.extract_pages(&source)?;
        debug!(source = %source.display(), pages = pages.len(), "extracted pdf pages");

        documents.extend(
            pages
                .into_iter()
                .map(|page| Document::from_page(&fingerprint, page.number, page.text)),
        );
    }

    Ok(documents)
}

pub fn normalize_documents(documents: Vec<Document>, normalizer: &TextNormalizer) -> Vec<Document> {
    documents
        .into_iter()
        .filter_map(|mut document| {
            document.content = normalizer.normalize(&document.content);
            if document.content.is_empty() {
                None
            } else {
                Some(document)
            }
        })
        .collect()
}

fn build_document_fingerprint(path: &Path) -> Result<DocumentFingerprint, IngestError> {
    let checksum = digest_file(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;

    Ok(DocumentFingerprint {
        source_id: generate_source_id(path),
        title: name.to_string(),
        source_path: path.to_string_lossy().to_string(),
        checksum,
        ingested_at: Utc::now(),
    })
}

fn generate_source_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}
