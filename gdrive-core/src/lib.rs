mod client;
mod oauth;

pub use client::{
    ApiErrorClass, ChangeList, DriveChange, DriveClient, DriveError, DriveFile, FileList,
    ShortcutDetails, FOLDER_MIME_TYPE, SHORTCUT_MIME_TYPE,
};
pub use oauth::{ClientSecret, OAuthClient, OAuthError, OAuthToken};
