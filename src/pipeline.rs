//! Drive a job from its descriptor to a [`TransferResult`].
//!
//! ```text
//! Validate -> Open -> DecodeTransfer -> Finalize
//!                 \-> Blank ---------/
//! ```
//!
//! Any failure jumps directly to `Finalize`.

use crate::{
    archive, blank, decode,
    source::{self, SourceReader},
    writer::{Destination, DiskWriter},
    ContentType, Context, ImportError, JobDescriptor, SourceKind, SpaceAccountant,
};

/// Outcome of an import.
#[derive(Debug)]
pub enum TransferResult {
    Success { bytes_written: u64 },
    Failure(ImportError),
}

impl TransferResult {
    /// Exit code for the process.
    pub fn exit_code(&self) -> u8 {
        match self {
            TransferResult::Success { .. } => 0,
            TransferResult::Failure(_) => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransferResult::Success { .. })
    }
}

enum State {
    Validate,
    Open(SpaceAccountant),
    Blank(SpaceAccountant),
    DecodeTransfer(SpaceAccountant, Box<dyn SourceReader>),
    Finalize(Result<u64, ImportError>),
}

/// Run the import described by `job`.
pub fn run(job: &JobDescriptor, ctx: &Context) -> TransferResult {
    let _enter = ctx.span.enter();

    tracing::info!(
        source = ?job.source,
        content_type = ?job.content_type,
        endpoint = %job.endpoint,
        available_space = job.available_space,
        image_size = ?job.image_size,
        "Starting import.",
    );

    let mut state = State::Validate;

    loop {
        state = match state {
            State::Validate => match validate(job, ctx) {
                Ok(accountant) => State::Open(accountant),
                Err(e) => State::Finalize(Err(e)),
            },

            State::Open(accountant) => match source::for_job(job) {
                Ok(None) => State::Blank(accountant),
                Ok(Some(source)) => State::DecodeTransfer(accountant, source),
                Err(e) => State::Finalize(Err(e)),
            },

            State::Blank(accountant) => {
                State::Finalize(blank::create_blank_image(&job.write_path, &accountant))
            }

            State::DecodeTransfer(mut accountant, mut source) => {
                let result = transfer(job, ctx, &mut accountant, source.as_mut());
                source.close();
                State::Finalize(result)
            }

            State::Finalize(result) => return finalize(result),
        }
    }
}

/// Check the job before any I/O, and compute the allocation size.
fn validate(job: &JobDescriptor, ctx: &Context) -> Result<SpaceAccountant, ImportError> {
    check_combination(job.source, job.content_type)?;

    // A blank image is never sized to fill the whole destination.
    if job.source == SourceKind::None
        && job.image_size.as_deref().map_or(true, |s| s.trim().is_empty())
    {
        return Err(ImportError::SizeParse(
            job.image_size.clone().unwrap_or_default(),
            "a blank image needs a size",
        ));
    }

    SpaceAccountant::new(
        job.available_space,
        job.image_size.as_deref(),
        ctx.progress.clone(),
    )
}

/// Reject source and content type pairs that can't produce a result.
pub(crate) fn check_combination(
    source: SourceKind,
    content_type: ContentType,
) -> Result<(), ImportError> {
    match (source, content_type) {
        (SourceKind::Registry, ContentType::Archive) => Err(ImportError::InvalidCombination(
            "registry sources only support disk images".into(),
        )),

        (SourceKind::None, ContentType::Archive) => Err(ImportError::InvalidCombination(
            "an archive needs a source".into(),
        )),

        _ => Ok(()),
    }
}

fn transfer(
    job: &JobDescriptor,
    ctx: &Context,
    accountant: &mut SpaceAccountant,
    source: &mut dyn SourceReader,
) -> Result<u64, ImportError> {
    let stream = source.open(ctx)?;
    tracing::info!(length = stream.length, "Source opened.");

    let stream = decode::decompress(stream)?;

    if job.content_type == ContentType::Archive {
        archive::extract(stream.reader, &job.data_dir, accountant)?;
        return Ok(accountant.written());
    }

    let stream = decode::decode_image(stream, &job.scratch_dir)?;

    if let Some(length) = stream.length {
        accountant.check_declared(length)?;
    }

    let mut writer = DiskWriter::open(&job.write_path)?;

    if let Destination::BlockDevice(capacity) = writer.destination() {
        accountant.check_capacity(capacity)?;
    }

    let mut reader = stream.reader;

    match accountant.copy(&mut reader, &mut writer) {
        Ok(_) => writer.finish(),
        Err(e) => {
            writer.discard();
            Err(e)
        }
    }
}

fn finalize(result: Result<u64, ImportError>) -> TransferResult {
    match result {
        Ok(bytes_written) => {
            tracing::info!(bytes_written, "Import completed.");
            TransferResult::Success { bytes_written }
        }

        Err(err) => {
            tracing::error!(kind = err.kind(), %err, "Import failed.");
            TransferResult::Failure(err)
        }
    }
}
