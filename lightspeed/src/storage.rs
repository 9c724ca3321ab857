//! Remote storage: the user's Google Drive.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

use crate::config::DriveConfig;
use crate::transfer::io::{ByteStream, response_stream};
use crate::{Error, Result};

/// Metadata of an existing object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_size")]
    pub size: Option<u64>,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
}

/// Result of a successful create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedObject {
    pub id: String,
    /// Size as persisted by the remote, when it reports one.
    #[serde(default, deserialize_with = "de_opt_size")]
    pub size: Option<u64>,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

/// Drive reports sizes as decimal strings.
fn de_opt_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Size>::deserialize(deserializer)? {
        Some(Size::Number(n)) => Some(n),
        Some(Size::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// The storage operations a transfer needs, authorized per call by the
/// user's access token.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn get_metadata(&self, access_token: &str, object_id: &str) -> Result<ObjectMetadata>;

    async fn get_content(&self, access_token: &str, object_id: &str) -> Result<ByteStream>;

    /// Create a new object from `body`. `declared_len` is informational.
    async fn create_object(
        &self,
        access_token: &str,
        name: &str,
        mime_type: &str,
        body: ByteStream,
        declared_len: Option<u64>,
    ) -> Result<CreatedObject>;
}

/// Drive v3 REST client.
#[derive(Debug, Clone)]
pub struct GoogleDrive {
    client: reqwest::Client,
    config: DriveConfig,
}

impl GoogleDrive {
    pub fn new(client: reqwest::Client, config: DriveConfig) -> Self {
        Self { client, config }
    }

    fn file_url(&self, object_id: &str) -> String {
        format!("{}/files/{}", self.config.api_base, object_id)
    }
}

/// Pull the `error.message` out of a Drive error body, falling back to the raw text.
async fn remote_error(response: reqwest::Response) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: Detail,
    }
    #[derive(Deserialize)]
    struct Detail {
        message: String,
    }

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Envelope>(&text) {
        Ok(envelope) => format!("{} ({})", envelope.error.message, status),
        Err(_) if text.trim().is_empty() => status.to_string(),
        Err(_) => format!("{} ({})", text.trim(), status),
    }
}

fn http_error(context: &str, err: reqwest::Error) -> String {
    format!("{context}: {err}")
}

#[async_trait]
impl RemoteStorage for GoogleDrive {
    #[instrument(skip(self, access_token))]
    async fn get_metadata(&self, access_token: &str, object_id: &str) -> Result<ObjectMetadata> {
        let response = self
            .client
            .get(self.file_url(object_id))
            .query(&[("fields", "name,size,mimeType"), ("supportsAllDrives", "true")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::source(http_error("Drive metadata request failed", e)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::unauthenticated(remote_error(response).await));
        }
        if !response.status().is_success() {
            return Err(Error::source(format!(
                "Could not read file metadata: {}",
                remote_error(response).await
            )));
        }

        response
            .json::<ObjectMetadata>()
            .await
            .map_err(|e| Error::source(http_error("Malformed Drive metadata", e)))
    }

    #[instrument(skip(self, access_token))]
    async fn get_content(&self, access_token: &str, object_id: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get(self.file_url(object_id))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::source(http_error("Drive download failed", e)))?;

        if !response.status().is_success() {
            return Err(Error::source(format!(
                "Could not download file: {}",
                remote_error(response).await
            )));
        }

        Ok(response_stream(response))
    }

    #[instrument(skip(self, access_token, body))]
    async fn create_object(
        &self,
        access_token: &str,
        name: &str,
        mime_type: &str,
        body: ByteStream,
        declared_len: Option<u64>,
    ) -> Result<CreatedObject> {
        let boundary = format!("lightspeed-{}", uuid::Uuid::new_v4().simple());
        let metadata = serde_json::json!({ "name": name, "mimeType": mime_type });
        let multipart = MultipartRelated::new(&boundary, &metadata, mime_type, body)?;

        let (tx, rx) = mpsc::channel(8);
        let pump = multipart.pump(tx);

        let url = format!("{}/files", self.config.upload_base);
        let request = self
            .client
            .post(url)
            .query(&[
                ("uploadType", "multipart"),
                ("fields", "id,size"),
                ("supportsAllDrives", "true"),
            ])
            .bearer_auth(access_token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
            .send();

        let (body_error, response) = tokio::join!(pump, request);
        if let Some(e) = body_error {
            return Err(Error::sink(format!("Upload aborted: {e}")));
        }
        let response = response.map_err(|e| Error::sink(http_error("Drive upload failed", e)))?;

        if !response.status().is_success() {
            return Err(Error::sink(remote_error(response).await));
        }

        let created = response
            .json::<CreatedObject>()
            .await
            .map_err(|e| Error::sink(http_error("Malformed Drive upload response", e)))?;
        debug!(id = %created.id, size = ?created.size, ?declared_len, "Drive object created");
        Ok(created)
    }
}

/// A `multipart/related` body: JSON metadata part followed by the media part.
struct MultipartRelated {
    preamble: Bytes,
    media: ByteStream,
    epilogue: Bytes,
}

impl MultipartRelated {
    fn new(
        boundary: &str,
        metadata: &serde_json::Value,
        mime_type: &str,
        media: ByteStream,
    ) -> Result<Self> {
        let metadata = serde_json::to_string(metadata)?;
        let preamble = format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{boundary}\r\nContent-Type: {mime_type}\r\n\r\n"
        );
        Ok(Self {
            preamble: Bytes::from(preamble),
            media,
            epilogue: Bytes::from(format!("\r\n--{boundary}--\r\n")),
        })
    }

    /// Feed the whole body into `tx`; returns the media error that cut it short, if any.
    async fn pump(mut self, tx: mpsc::Sender<io::Result<Bytes>>) -> Option<String> {
        if tx.send(Ok(self.preamble)).await.is_err() {
            return None;
        }
        while let Some(chunk) = self.media.next().await {
            match chunk {
                Ok(chunk) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return None;
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = tx.send(Err(e)).await;
                    return Some(message);
                }
            }
        }
        let _ = tx.send(Ok(self.epilogue)).await;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_metadata_size_from_string() {
        let json = r#"{"name":"raw.mov","size":"10000000","mimeType":"video/quicktime"}"#;
        let meta: ObjectMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.size, Some(10_000_000));
    }

    #[test]
    fn test_metadata_size_optional() {
        let meta: ObjectMetadata = serde_json::from_str(r#"{"name":"doc"}"#).unwrap();
        assert_eq!(meta.size, None);
        assert_eq!(meta.mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_multipart_layout() {
        let media: ByteStream = Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(
            b"MEDIA",
        ))]));
        let metadata = serde_json::json!({ "name": "a.mp4", "mimeType": "video/mp4" });
        let body = MultipartRelated::new("b0", &metadata, "video/mp4", media).unwrap();

        let (tx, rx) = mpsc::channel(8);
        assert!(body.pump(tx).await.is_none());
        let parts: Vec<Bytes> = ReceiverStream::new(rx).try_collect().await.unwrap();
        let text = String::from_utf8(parts.concat()).unwrap();

        assert!(text.starts_with("--b0\r\nContent-Type: application/json"));
        assert!(text.contains(r#""name":"a.mp4""#));
        assert!(text.contains("Content-Type: video/mp4\r\n\r\nMEDIA\r\n--b0--\r\n"));
    }

    #[tokio::test]
    async fn test_media_error_is_forwarded() {
        let media: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"x")),
            Err(io::Error::other("encoder failed")),
        ]));
        let body =
            MultipartRelated::new("b1", &serde_json::json!({}), "video/mp4", media).unwrap();

        let (tx, rx) = mpsc::channel(8);
        let error = body.pump(tx).await;
        assert_eq!(error.as_deref(), Some("encoder failed"));

        let collected: io::Result<Vec<Bytes>> = ReceiverStream::new(rx).try_collect().await;
        assert!(collected.is_err());
    }
}
