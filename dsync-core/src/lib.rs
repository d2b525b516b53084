mod client;
mod oauth;

pub use client::{
    Account, AccountName, ApiErrorClass, DeletedMetadata, Download, DropboxClient, DropboxError,
    FileMetadata, FolderMetadata, ListFolderResult, LongPollResult, Metadata, SpaceAllocation,
    SpaceUsage, UploadArg, WriteMode,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
