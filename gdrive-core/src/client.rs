use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
pub const SHORTCUT_MIME_TYPE: &str = "application/vnd.google-apps.shortcut";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// One page of a files listing. `query` is the Drive query language
    /// expression; `page_token` resumes a previous listing.
    pub async fn list_files(
        &self,
        query: Option<&str>,
        fields: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(query) = query {
                pairs.append_pair("q", query);
            }
            pairs.append_pair("fields", fields);
            pairs.append_pair("pageSize", "1000");
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Drains every page of a files listing into one vector.
    pub async fn list_files_all(
        &self,
        query: Option<&str>,
        fields: &str,
    ) -> Result<Vec<DriveFile>, DriveError> {
        let mut page_token: Option<String> = None;
        let mut files = Vec::new();
        loop {
            let page = self
                .list_files(query, fields, page_token.as_deref())
                .await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    pub async fn get_file(&self, id: &str, fields: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        url.query_pairs_mut().append_pair("fields", fields);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_start_page_token(&self) -> Result<String, DriveError> {
        let url = self.endpoint("/drive/v3/changes/startPageToken")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: StartPageTokenResponse = Self::handle_response(response).await?;
        Ok(payload.start_page_token)
    }

    /// One page of the incremental change feed starting at `page_token`.
    pub async fn list_changes(
        &self,
        page_token: &str,
        fields: &str,
        include_removed: bool,
    ) -> Result<ChangeList, DriveError> {
        let mut url = self.endpoint("/drive/v3/changes")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("pageToken", page_token);
            pairs.append_pair("fields", fields);
            pairs.append_pair("includeRemoved", if include_removed { "true" } else { "false" });
            pairs.append_pair("pageSize", "1000");
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Creates a file or folder entry from metadata alone. Content is
    /// uploaded separately through [`DriveClient::upload_content`].
    pub async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: Option<&str>,
        fields: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", fields);
        let mut metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });
        if let Some(mime_type) = mime_type {
            metadata["mimeType"] = serde_json::json!(mime_type);
        }
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&metadata)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Replaces the content of an existing file with a streamed body.
    pub async fn upload_content(
        &self,
        id: &str,
        body: reqwest::Body,
        fields: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/upload/drive/v3/files/{id}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("uploadType", "media");
            pairs.append_pair("fields", fields);
        }
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Renames and/or reparents a file. Passing `None` leaves the
    /// corresponding attribute untouched.
    pub async fn update_file_metadata(
        &self,
        id: &str,
        new_name: Option<&str>,
        add_parent: Option<&str>,
        remove_parent: Option<&str>,
        fields: &str,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("fields", fields);
            if let Some(parent) = add_parent {
                pairs.append_pair("addParents", parent);
            }
            if let Some(parent) = remove_parent {
                pairs.append_pair("removeParents", parent);
            }
        }
        let metadata = match new_name {
            Some(name) => serde_json::json!({ "name": name }),
            None => serde_json::json!({}),
        };
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&metadata)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_file(&self, id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    /// Starts a media download; the caller drains `bytes_stream()`.
    pub async fn download_file(&self, id: &str) -> Result<reqwest::Response, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriveError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    /// Drive serializes int64 fields as JSON strings.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub modified_time: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub shortcut_details: Option<ShortcutDetails>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
    }

    pub fn is_shortcut(&self) -> bool {
        self.mime_type.as_deref() == Some(SHORTCUT_MIME_TYPE)
    }

    pub fn size_bytes(&self) -> Option<i64> {
        self.size.as_deref().and_then(|value| value.parse().ok())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDetails {
    pub target_id: String,
    #[serde(default)]
    pub target_mime_type: Option<String>,
}

impl ShortcutDetails {
    pub fn targets_folder(&self) -> bool {
        self.target_mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveChange {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub file: Option<DriveFile>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde(default)]
    pub changes: Vec<DriveChange>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartPageTokenResponse {
    start_page_token: String,
}
