// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zip archives of process state handed to workers.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tempfile::TempPath;
use uuid::Uuid;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::error::EngineError;
use crate::state::{ProcessStateStore, StateSink};

/// [`StateSink`] writing each item as a deflated zip entry.
pub struct ZipSink<W: Write + std::io::Seek + Send> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
    items: usize,
}

impl<W: Write + std::io::Seek + Send> ZipSink<W> {
    /// Start an archive over `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            items: 0,
        }
    }

    /// Number of items written so far.
    pub fn items(&self) -> usize {
        self.items
    }

    /// Write the central directory and return the underlying writer.
    pub fn finish(self) -> Result<W, EngineError> {
        Ok(self.zip.finish()?)
    }
}

impl<W: Write + std::io::Seek + Send> StateSink for ZipSink<W> {
    fn write_item(&mut self, path: &str, data: &[u8]) -> Result<(), EngineError> {
        self.zip.start_file(path, self.options)?;
        self.zip.write_all(data)?;
        self.items += 1;
        Ok(())
    }
}

/// Export the state of `instance_id` into a fresh `payload*.zip` file in `dir`.
///
/// The returned path deletes the file when dropped. On error the partial file
/// is removed.
pub async fn export_to_temp_zip<S>(
    store: &S,
    instance_id: Uuid,
    dir: &Path,
) -> Result<TempPath, EngineError>
where
    S: ProcessStateStore + ?Sized,
{
    let file = tempfile::Builder::new()
        .prefix("payload")
        .suffix(".zip")
        .tempfile_in(dir)?;
    let (handle, path) = file.into_parts();

    let mut sink = ZipSink::new(handle);
    store.export(instance_id, &mut sink).await?;
    let items = sink.items();
    let handle: File = sink.finish()?;
    handle.sync_all()?;

    tracing::debug!(
        instance_id = %instance_id,
        items = items,
        archive = %path.display(),
        "Exported process state"
    );

    Ok(path)
}
