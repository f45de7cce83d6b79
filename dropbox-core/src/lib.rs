mod client;

pub use client::{
    Account, AccountName, ApiErrorClass, DEFAULT_API_URL, DEFAULT_CONTENT_URL, DeletedMetadata,
    DropboxClient, DropboxError, FileMetadata, FolderMetadata, ListFolderResult, Metadata,
    SpaceAllocation, SpaceUsage, WriteMode, header_safe_json,
};
