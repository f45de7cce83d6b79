use dropbox_core::{DropboxClient, DropboxError, ListFolderResult, Metadata};
use thiserror::Error;
use tracing::debug;

use super::index::{FileIndex, Freshness};
use super::paths::destination_root;

pub const DEFAULT_MAX_PAGES: usize = 10_000;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("api error: {0}")]
    Api(#[from] DropboxError),
    #[error("listing did not finish after {0} pages")]
    TooManyPages(usize),
    #[error("listed file {0} has no content hash")]
    MissingHash(String),
}

/// Builds a [`FileIndex`] from a recursive listing of the destination folder.
pub struct RemoteIndexFetcher<'a> {
    client: &'a DropboxClient,
    max_pages: usize,
}

impl<'a> RemoteIndexFetcher<'a> {
    pub fn new(client: &'a DropboxClient) -> Self {
        Self {
            client,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// A destination that does not exist yet yields an empty index.
    pub async fn fetch(&self, destination: &str) -> Result<FileIndex, RemoteError> {
        let root = destination_root(destination);
        let mut page = match self.client.list_folder(&root, true).await {
            Ok(page) => page,
            Err(err) if err.is_not_found() => {
                debug!(path = %root, "destination folder does not exist yet");
                return Ok(FileIndex::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut index = FileIndex::new();
        let mut pages = 1;
        loop {
            collect_files(&mut index, &page)?;
            if !page.has_more {
                break;
            }
            if pages >= self.max_pages {
                return Err(RemoteError::TooManyPages(pages));
            }
            page = self.client.list_folder_continue(&page.cursor).await?;
            pages += 1;
        }

        debug!(files = index.len(), pages, "fetched remote listing");
        Ok(index)
    }
}

fn collect_files(index: &mut FileIndex, page: &ListFolderResult) -> Result<(), RemoteError> {
    for entry in &page.entries {
        let Metadata::File(file) = entry else {
            continue;
        };
        let hash = file
            .content_hash
            .as_ref()
            .ok_or_else(|| RemoteError::MissingHash(file.path_lower.clone()))?;
        index.insert(
            file.path_lower.to_lowercase(),
            Freshness::ContentHash(hash.clone()),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> DropboxClient {
        DropboxClient::with_base_urls(&server.uri(), &server.uri(), "token", Duration::from_secs(5))
            .unwrap()
    }

    fn file(path_lower: &str, hash: &str) -> serde_json::Value {
        json!({
            ".tag": "file",
            "name": path_lower.rsplit('/').next().unwrap(),
            "path_lower": path_lower,
            "path_display": path_lower,
            "size": 3,
            "content_hash": hash,
        })
    }

    #[tokio::test]
    async fn follows_cursor_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .and(body_json(json!({
                "path": "/box",
                "recursive": true,
                "include_deleted": false,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [
                    {".tag": "folder", "name": "docs", "path_lower": "/box/docs", "id": "id:1"},
                    file("/box/docs/a.txt", "aa"),
                ],
                "cursor": "c1",
                "has_more": true,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder/continue"))
            .and(body_json(json!({"cursor": "c1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [file("/box/b.txt", "bb")],
                "cursor": "c2",
                "has_more": false,
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let index = RemoteIndexFetcher::new(&client).fetch("box").await.unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(
            index.get("/box/docs/a.txt"),
            Some(&Freshness::ContentHash("aa".into()))
        );
        assert_eq!(
            index.get("/box/b.txt"),
            Some(&Freshness::ContentHash("bb".into()))
        );
    }

    #[tokio::test]
    async fn missing_destination_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error_summary": "path/not_found/..",
                "error": {".tag": "path", "path": {".tag": "not_found"}},
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let index = RemoteIndexFetcher::new(&client).fetch("box").await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn endless_pagination_is_an_error() {
        let server = MockServer::start().await;
        let page = json!({"entries": [], "cursor": "again", "has_more": true});
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page.clone()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder/continue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = RemoteIndexFetcher::new(&client)
            .with_max_pages(3)
            .fetch("box")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::TooManyPages(3)));
    }

    #[tokio::test]
    async fn server_errors_abort_the_listing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = RemoteIndexFetcher::new(&client)
            .fetch("box")
            .await
            .unwrap_err();
        match err {
            RemoteError::Api(api) => assert!(api.is_retryable()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_without_hash_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/files/list_folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [{".tag": "file", "name": "a", "path_lower": "/box/a"}],
                "cursor": "c",
                "has_more": false,
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = RemoteIndexFetcher::new(&client)
            .fetch("box")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::MissingHash(path) if path == "/box/a"));
    }
}
