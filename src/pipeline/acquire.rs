//! The `acquire` stage: bring the source document into the run's working
//! area as a bounded, well-formed PDF.
//!
//! Uploads arrive as raw bytes; queue-driven runs name an object-store
//! key. Either way the stage sniffs the real content type, converts images
//! to a single-page PDF, enforces the page limit, and records the
//! original filename and size.

use tokio::{fs, task};

use crate::{
    errors::{ErrorCode, PipelineError},
    pdf,
    pipeline::context::{RunContext, RunSource},
    prelude::*,
    server::AppState,
};

/// MIME types accepted from clients.
const PDF_MIME: &str = "application/pdf";
const IMAGE_MIMES: &[&str] = &["image/jpeg", "image/png"];

pub async fn run(state: &AppState, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let (file_name, bytes) = obtain_source(state, ctx).await?;

    if bytes.len() > state.settings.max_upload_bytes {
        return Err(PipelineError::new(
            ErrorCode::PayloadTooLarge,
            format!(
                "document is {} bytes, limit is {}",
                bytes.len(),
                state.settings.max_upload_bytes
            ),
        ));
    }

    // Sniff the real content type; fall back to the filename extension for
    // formats `infer` cannot fingerprint.
    let mime = infer::get(&bytes)
        .map(|kind| kind.mime_type().to_owned())
        .or_else(|| {
            mime_guess::from_path(&file_name)
                .first()
                .map(|guess| guess.essence_str().to_owned())
        })
        .unwrap_or_default();

    let dpi = state.settings.image_dpi;
    let pdf_bytes = if mime == PDF_MIME {
        bytes
    } else if IMAGE_MIMES.contains(&mime.as_str()) {
        // Image decoding is CPU-bound; keep it off the async executor.
        task::spawn_blocking(move || pdf::image_to_pdf(&bytes, dpi))
            .await
            .map_err(|err| {
                PipelineError::new(ErrorCode::InternalError, "image conversion panicked")
                    .with_cause(err.into())
            })?
            .map_err(|err| {
                // Undecodable bytes mean the upload was never a real image.
                PipelineError::new(
                    ErrorCode::UnsupportedMediaType,
                    "file is not a readable image",
                )
                .with_cause(err)
            })?
    } else {
        return Err(PipelineError::new(
            ErrorCode::UnsupportedMediaType,
            format!("unsupported content type {:?} for {:?}", mime, file_name),
        ));
    };

    let counted = pdf_bytes.clone();
    let page_count = task::spawn_blocking(move || pdf::count_pages(&counted))
        .await
        .map_err(|err| {
            PipelineError::new(ErrorCode::InternalError, "page counting panicked")
                .with_cause(err.into())
        })?
        .map_err(|err| {
            // The extension said PDF but the page index is unreadable.
            PipelineError::new(ErrorCode::UnsupportedMediaType, "file is not a readable PDF")
                .with_cause(err)
        })?;
    if page_count > state.settings.max_pdf_pages {
        return Err(PipelineError::new(
            ErrorCode::PdfTooManyPages,
            format!(
                "document has {} pages, limit is {}",
                page_count, state.settings.max_pdf_pages
            ),
        ));
    }

    let dest = ctx.work_path("acquired.pdf");
    fs::write(&dest, &pdf_bytes).await.map_err(|err| {
        PipelineError::new(ErrorCode::FileSaveFailed, "failed to store acquired PDF")
            .with_cause(err.into())
    })?;

    debug!(
        run_id = %ctx.run_id,
        file_name = %file_name,
        size = pdf_bytes.len(),
        page_count,
        "document acquired"
    );
    ctx.file_size_bytes = Some(pdf_bytes.len() as i64);
    ctx.original_file_name = Some(file_name);
    ctx.page_count = Some(page_count);
    ctx.acquired_pdf = Some(dest);
    Ok(())
}

/// Pull the raw document bytes out of the request source.
async fn obtain_source(
    state: &AppState,
    ctx: &mut RunContext,
) -> Result<(String, Vec<u8>), PipelineError> {
    match &mut ctx.request.source {
        RunSource::Upload { file_name, bytes } => {
            if bytes.is_empty() {
                return Err(PipelineError::new(
                    ErrorCode::ValidationError,
                    "uploaded file is empty",
                ));
            }
            Ok((file_name.clone(), std::mem::take(bytes)))
        }
        RunSource::ObjectStore { key } => {
            let key = key.clone();
            let dest = ctx.work_path("source.bin");
            let fetched = state.fetcher.fetch(&key, &dest).await?;
            let bytes = fs::read(&fetched.path).await.map_err(|err| {
                PipelineError::new(
                    ErrorCode::FileSaveFailed,
                    "failed to read downloaded object",
                )
                .with_cause(err.into())
            })?;
            let file_name = key
                .rsplit('/')
                .next()
                .unwrap_or(key.as_str())
                .to_owned();
            Ok((file_name, bytes))
        }
    }
}
