use std::io;
use std::path::Path;

use dropbox_core::{DropboxClient, WriteMode};
use reqwest::Body;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{EngineError, SyncEngine};
use crate::sync::index::{FileIndex, Freshness};
use crate::sync::paths::{local_path_for, remote_key, remote_path_for};
use crate::sync::queue::{Operation, OperationKind};
use crate::sync::scanner::mtime_secs;
use crate::sync::status::format_bytes;

struct OpenedFile {
    file: File,
    mtime: i64,
    size: u64,
}

impl SyncEngine {
    pub(super) async fn apply(
        &self,
        client: &DropboxClient,
        operation: &Operation,
        index: &mut FileIndex,
    ) -> Result<(), EngineError> {
        match operation.kind {
            OperationKind::Add => {
                self.upload_file(client, &operation.path, WriteMode::Add, index)
                    .await
            }
            OperationKind::Update => {
                self.upload_file(client, &operation.path, WriteMode::Overwrite, index)
                    .await
            }
            OperationKind::Delete => self.delete_remote(client, &operation.path, index).await,
        }
    }

    async fn upload_file(
        &self,
        client: &DropboxClient,
        relative: &str,
        mode: WriteMode,
        index: &mut FileIndex,
    ) -> Result<(), EngineError> {
        let local = local_path_for(&self.config.sync_root, relative)?;
        let remote = remote_path_for(&self.config.destination, relative);

        let opened = match open_for_upload(&local).await {
            Ok(opened) => opened,
            Err(err) => {
                // Vanished or unreadable since the scan; a later resync picks
                // it up again if it comes back.
                warn!(path = %relative, error = %err, "cannot read queued file, dropping it");
                return Ok(());
            }
        };
        let mtime = opened.mtime;
        info!(
            path = %relative,
            size = %format_bytes(opened.size),
            mode = ?mode,
            "uploading file"
        );

        match client.upload(&remote, body(opened.file), mode).await {
            Ok(_) => {}
            Err(err) if mode == WriteMode::Add && err.is_conflict() => {
                // An earlier upload landed but its progress was never saved.
                debug!(path = %remote, "file already exists remotely, overwriting");
                let opened = open_for_upload(&local).await?;
                client
                    .upload(&remote, body(opened.file), WriteMode::Overwrite)
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        index.insert(
            remote_key(&self.config.destination, relative),
            Freshness::LocalMtime(mtime),
        );
        Ok(())
    }

    async fn delete_remote(
        &self,
        client: &DropboxClient,
        key: &str,
        index: &mut FileIndex,
    ) -> Result<(), EngineError> {
        info!(path = %key, "deleting remote file");
        match client.delete(key).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(path = %key, "remote file already gone");
            }
            Err(err) => return Err(err.into()),
        }
        index.remove(key);
        Ok(())
    }
}

async fn open_for_upload(path: &Path) -> io::Result<OpenedFile> {
    let file = File::open(path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    Ok(OpenedFile {
        mtime: mtime_secs(&meta)?,
        size: meta.len(),
        file,
    })
}

fn body(file: File) -> Body {
    Body::wrap_stream(ReaderStream::new(file))
}
