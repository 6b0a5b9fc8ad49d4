//! Live upload session over HTTP.
//!
//! Async `reqwest` client authenticated with the user's upload token.

use std::sync::Arc;
use std::time::Duration;

use geoupload_protocol::UserItem;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::chunked::ChunkReader;
use crate::session::{
    ChunkCallback, SessionError, SessionFactory, SessionFuture, SessionRequest, UploadSession,
};
use crate::types::FileHandle;

const DEFAULT_UPLOAD_URL: &str = "https://rupload.geoupload.example/upload";
const DEFAULT_FINISH_URL: &str = "https://graph.geoupload.example/finish_upload";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoints and limits of the ingestion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSessionConfig {
    /// Base URL; sessions live at `{upload_url}/{session_key}`.
    pub upload_url: String,
    /// Endpoint closing a session and returning the cluster id.
    pub finish_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            upload_url: DEFAULT_UPLOAD_URL.into(),
            finish_url: DEFAULT_FINISH_URL.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Deserialize)]
struct OffsetResponse {
    offset: u64,
}

#[derive(Deserialize)]
struct ChunkResponse {
    h: String,
}

#[derive(Deserialize)]
struct FinishResponse {
    cluster_id: String,
}

/// Opens [`HttpUploadSession`]s sharing one connection pool.
pub struct HttpSessionFactory {
    http: reqwest::Client,
    config: Arc<HttpSessionConfig>,
    organization_id: Option<String>,
}

impl HttpSessionFactory {
    /// Builds the client for `user`. The token is sent as `OAuth <token>`.
    pub fn new(config: HttpSessionConfig, user: &UserItem) -> Result<Self, SessionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("OAuth {}", user.user_upload_token))
                .map_err(|_| SessionError::Protocol("invalid upload token".into()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(map_reqwest)?;

        Ok(Self {
            http,
            config: Arc::new(config),
            organization_id: user.organization_key.clone(),
        })
    }
}

impl SessionFactory for HttpSessionFactory {
    fn open(&self, request: SessionRequest) -> Result<Box<dyn UploadSession>, SessionError> {
        Ok(Box::new(HttpUploadSession {
            http: self.http.clone(),
            config: Arc::clone(&self.config),
            organization_id: self.organization_id.clone(),
            request,
        }))
    }
}

/// One resumable upload against the live service.
pub struct HttpUploadSession {
    http: reqwest::Client,
    config: Arc<HttpSessionConfig>,
    organization_id: Option<String>,
    request: SessionRequest,
}

impl HttpUploadSession {
    fn session_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.upload_url.trim_end_matches('/'),
            self.request.session_key
        )
    }

    async fn send_chunk(&self, offset: u64, data: Vec<u8>) -> Result<FileHandle, SessionError> {
        let resp = self
            .http
            .post(self.session_url())
            .header("Offset", offset)
            .header("X-Entity-Length", self.request.entity_size)
            .header("X-Entity-Name", &self.request.session_key)
            .header("X-Entity-Type", self.request.file_type.content_type())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(map_reqwest)?;
        let body: ChunkResponse = check(resp).await?.json().await.map_err(map_reqwest)?;
        Ok(FileHandle(body.h))
    }
}

impl UploadSession for HttpUploadSession {
    fn session_key(&self) -> &str {
        &self.request.session_key
    }

    fn entity_size(&self) -> u64 {
        self.request.entity_size
    }

    fn fetch_offset(&self) -> SessionFuture<'_, u64> {
        Box::pin(async move {
            let resp = self
                .http
                .get(self.session_url())
                .send()
                .await
                .map_err(map_reqwest)?;
            let body: OffsetResponse = check(resp).await?.json().await.map_err(map_reqwest)?;
            debug!(session_key = %self.request.session_key, offset = body.offset, "fetched offset");
            Ok(body.offset)
        })
    }

    fn transfer<'a>(
        &'a self,
        reader: &'a mut ChunkReader,
        offset: u64,
        on_chunk: &'a mut ChunkCallback<'_>,
    ) -> SessionFuture<'a, Option<FileHandle>> {
        Box::pin(async move {
            reader.seek_to(offset)?;
            let mut handle = None;
            while let Some(chunk) = reader.next_chunk()? {
                let len = chunk.len();
                handle = Some(self.send_chunk(chunk.offset, chunk.data).await?);
                if on_chunk(len).is_break() {
                    return Ok(None);
                }
            }
            match handle {
                Some(h) => Ok(Some(h)),
                // Everything was already received; an empty write returns the handle.
                None => self.send_chunk(reader.size(), Vec::new()).await.map(Some),
            }
        })
    }

    fn finish<'a>(&'a self, handle: &'a FileHandle) -> SessionFuture<'a, String> {
        Box::pin(async move {
            let mut payload = serde_json::json!({
                "file_handle": handle.0,
                "file_type": self.request.file_type.as_str(),
            });
            if let Some(org) = &self.organization_id {
                payload["organization_id"] = serde_json::Value::String(org.clone());
            }

            let resp = self
                .http
                .post(&self.config.finish_url)
                .json(&payload)
                .send()
                .await
                .map_err(map_reqwest)?;
            let body: FinishResponse = check(resp).await?.json().await.map_err(map_reqwest)?;
            Ok(body.cluster_id)
        })
    }
}

/// Turns a non-2xx response into `SessionError::Http`.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SessionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SessionError::Http {
        status: status.as_u16(),
        body,
    })
}

fn map_reqwest(e: reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        SessionError::Connection(e.to_string())
    } else if let Some(status) = e.status() {
        SessionError::Http {
            status: status.as_u16(),
            body: String::new(),
        }
    } else {
        SessionError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;
    use std::sync::Mutex;

    use geoupload_protocol::FileType;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct RecordedRequest {
        head: String,
        body: Vec<u8>,
    }

    impl RecordedRequest {
        fn header(&self, name: &str) -> Option<String> {
            self.head.lines().find_map(|line| {
                let (k, v) = line.split_once(':')?;
                k.eq_ignore_ascii_case(name).then(|| v.trim().to_string())
            })
        }
    }

    type Recorded = Arc<Mutex<Vec<RecordedRequest>>>;

    /// Starts a mock HTTP server answering each connection with the next
    /// scripted `(status, body)` pair and recording every request.
    async fn mock_server(
        script: Vec<(u16, &str)>,
    ) -> (String, Recorded, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let recorded: Recorded = Arc::default();
        let log = Arc::clone(&recorded);
        let script: Vec<(u16, String)> = script
            .into_iter()
            .map(|(status, body)| (status, body.to_string()))
            .collect();

        let handle = tokio::spawn(async move {
            for (status, body) in script {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                log.lock().unwrap().push(request);

                let resp = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, recorded, handle)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> RecordedRequest {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                break buf.len();
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let mut request = RecordedRequest {
            head,
            body: buf[head_end..].to_vec(),
        };
        let length: usize = request
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while request.body.len() < length {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            request.body.extend_from_slice(&tmp[..n]);
        }
        request
    }

    fn factory(url: &str) -> HttpSessionFactory {
        let config = HttpSessionConfig {
            upload_url: format!("{url}/upload"),
            finish_url: format!("{url}/finish"),
            timeout: Duration::from_secs(5),
        };
        let mut user = UserItem::new("secret");
        user.organization_key = Some("42".into());
        HttpSessionFactory::new(config, &user).unwrap()
    }

    fn entity(dir: &TempDir, data: &[u8]) -> ChunkReader {
        let path = dir.path().join("entity.zip");
        std::fs::write(&path, data).unwrap();
        ChunkReader::open(&path, 4).unwrap()
    }

    #[tokio::test]
    async fn fetch_offset_reads_json() {
        let (url, recorded, handle) = mock_server(vec![(200, r#"{"offset":7}"#)]).await;
        let session = factory(&url)
            .open(SessionRequest::new("abc", 10, FileType::Zip))
            .unwrap();

        assert_eq!(session.fetch_offset().await.unwrap(), 7);
        let requests = recorded.lock().unwrap().clone();
        assert!(requests[0].head.starts_with("GET /upload/geoupload_abc.zip "));
        assert_eq!(requests[0].header("authorization").unwrap(), "OAuth secret");

        handle.abort();
    }

    #[tokio::test]
    async fn transfer_posts_chunks_from_offset() {
        let (url, recorded, handle) =
            mock_server(vec![(200, r#"{"h":"h1"}"#), (200, r#"{"h":"h2"}"#)]).await;
        let dir = TempDir::new().unwrap();
        let mut reader = entity(&dir, b"0123456789");
        let session = factory(&url)
            .open(SessionRequest::new("abc", 10, FileType::Zip))
            .unwrap();

        let mut acked = Vec::new();
        let mut on_chunk = |n: u64| {
            acked.push(n);
            ControlFlow::Continue(())
        };
        let file_handle = session
            .transfer(&mut reader, 4, &mut on_chunk)
            .await
            .unwrap();
        assert_eq!(file_handle, Some(FileHandle("h2".into())));
        assert_eq!(acked, vec![4, 2]);

        let requests = recorded.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].head.starts_with("POST /upload/geoupload_abc.zip "));
        assert_eq!(requests[0].header("offset").unwrap(), "4");
        assert_eq!(requests[0].header("x-entity-length").unwrap(), "10");
        assert_eq!(requests[0].header("x-entity-type").unwrap(), "application/zip");
        assert_eq!(requests[0].body, b"4567");
        assert_eq!(requests[1].header("offset").unwrap(), "8");
        assert_eq!(requests[1].body, b"89");

        handle.abort();
    }

    #[tokio::test]
    async fn finish_sends_handle_and_organization() {
        let (url, recorded, handle) = mock_server(vec![(200, r#"{"cluster_id":"c-1"}"#)]).await;
        let session = factory(&url)
            .open(SessionRequest::new("abc", 10, FileType::RawVideo))
            .unwrap();

        let cluster = session.finish(&FileHandle("h2".into())).await.unwrap();
        assert_eq!(cluster, "c-1");

        let requests = recorded.lock().unwrap().clone();
        let payload: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(payload["file_handle"], "h2");
        assert_eq!(payload["file_type"], "raw_video");
        assert_eq!(payload["organization_id"], "42");

        handle.abort();
    }

    #[tokio::test]
    async fn client_error_keeps_body_for_classification() {
        let body = r#"{"debug_info":{"retriable":true}}"#;
        let (url, _recorded, handle) = mock_server(vec![(412, body)]).await;
        let session = factory(&url)
            .open(SessionRequest::new("abc", 10, FileType::Zip))
            .unwrap();

        let err = session.fetch_offset().await.unwrap_err();
        assert!(matches!(err, SessionError::Http { status: 412, .. }));
        assert!(err.is_retriable());

        handle.abort();
    }

    #[tokio::test]
    async fn server_error_is_retriable() {
        let (url, _recorded, handle) = mock_server(vec![(503, "")]).await;
        let session = factory(&url)
            .open(SessionRequest::new("abc", 10, FileType::Zip))
            .unwrap();

        let err = session.fetch_offset().await.unwrap_err();
        assert!(err.is_retriable(), "{err}");

        handle.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_retriable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let session = factory(&url)
            .open(SessionRequest::new("abc", 10, FileType::Zip))
            .unwrap();
        let err = session.fetch_offset().await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)), "{err}");
    }

    #[test]
    fn rejects_token_with_newline() {
        let user = UserItem::new("bad\ntoken");
        assert!(HttpSessionFactory::new(HttpSessionConfig::default(), &user).is_err());
    }
}
