// HTTP 分片传输
//
// - 探测请求：GET 目标地址（带分片参数），成功状态码表示服务端已有该分片
// - 上传请求：POST 分片原始字节（application/octet-stream），请求体按块上报进度
// - 中止：每个请求一个 CancellationToken，取消后不再回送任何通知
//
// 网络错误以状态码 0 回送，由管理器按瞬时失败处理

use crate::config::{HttpConfig, UploadConfig};
use crate::uploader::chunk::read_range;
use crate::uploader::driver::DriverHandle;
use crate::uploader::transport::{ChunkRequest, RequestId, RequestKind, Transport, TransportEvent};
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Body, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 基于 reqwest 的分片传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    handle: DriverHandle,
    /// 进行中请求的取消令牌
    tokens: Arc<DashMap<RequestId, CancellationToken>>,
    /// 上传配置（成功状态码判定）
    upload: Arc<UploadConfig>,
    /// 进度上报块大小
    block_size: usize,
}

impl HttpTransport {
    /// 创建 HTTP 传输
    pub fn new(config: &HttpConfig, upload: &UploadConfig, handle: DriverHandle) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("忽略无效的请求头: {}", name),
            }
        }

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .default_headers(headers)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            handle,
            tokens: Arc::new(DashMap::new()),
            upload: Arc::new(upload.clone()),
            block_size: config.progress_block_size.max(1),
        })
    }

    /// 进行中的请求数
    pub fn in_flight(&self) -> usize {
        self.tokens.len()
    }
}

impl Transport for HttpTransport {
    fn start(&mut self, request: ChunkRequest) {
        let token = CancellationToken::new();
        self.tokens.insert(request.id, token.clone());

        let client = self.client.clone();
        let handle = self.handle.clone();
        let tokens = self.tokens.clone();
        let upload = self.upload.clone();
        let block_size = self.block_size;
        let id = request.id;

        tokio::spawn(async move {
            let event = tokio::select! {
                _ = token.cancelled() => None,
                event = perform(client, request, handle.clone(), upload, block_size) => Some(event),
            };

            tokens.remove(&id);
            match event {
                Some(event) if !token.is_cancelled() => {
                    handle.send_transport(event);
                }
                _ => debug!("请求已中止: {}", id),
            }
        });
    }

    fn abort(&mut self, id: RequestId) {
        if let Some((_, token)) = self.tokens.remove(&id) {
            token.cancel();
            debug!("中止请求: {}", id);
        }
    }
}

/// 执行一次请求，返回终态通知
async fn perform(
    client: Client,
    request: ChunkRequest,
    handle: DriverHandle,
    upload: Arc<UploadConfig>,
    block_size: usize,
) -> TransportEvent {
    let id = request.id;
    let result = match request.kind {
        RequestKind::Test => send_test(&client, &request).await,
        RequestKind::Upload => send_upload(&client, &request, handle, block_size).await,
    };

    match result {
        Ok((status, body)) if upload.is_success_status(status) => TransportEvent::Success {
            request: id,
            body,
        },
        Ok((status, body)) => TransportEvent::Failure {
            request: id,
            status,
            body,
        },
        Err(e) => {
            warn!("分片请求失败: {} {}: {:#}", id, request.url, e);
            TransportEvent::Failure {
                request: id,
                status: 0,
                body: format!("{:#}", e),
            }
        }
    }
}

async fn send_test(client: &Client, request: &ChunkRequest) -> Result<(u16, String)> {
    let response = client
        .get(&request.url)
        .send()
        .await
        .context("探测请求失败")?;
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Ok((status, body))
}

async fn send_upload(
    client: &Client,
    request: &ChunkRequest,
    handle: DriverHandle,
    block_size: usize,
) -> Result<(u16, String)> {
    let data = match &request.path {
        Some(path) => read_range(path, request.range.clone()).await?,
        None if request.range.is_empty() => Vec::new(),
        None => anyhow::bail!(
            "分片没有本地数据源: {} bytes={}..{}",
            request.id,
            request.range.start,
            request.range.end
        ),
    };

    let id = request.id;
    let total = data.len() as u64;
    let blocks: Vec<Vec<u8>> = data.chunks(block_size).map(|b| b.to_vec()).collect();
    let mut loaded = 0u64;

    // 请求体每被读取一块就上报一次进度
    let stream = futures::stream::iter(blocks).map(move |block| {
        loaded += block.len() as u64;
        handle.send_transport(TransportEvent::Progress {
            request: id,
            loaded,
            total,
        });
        Ok::<_, std::io::Error>(block)
    });

    let response = client
        .post(&request.url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(Body::wrap_stream(stream))
        .send()
        .await
        .context("上传请求失败")?;

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::driver::DriverMessage;
    use crate::uploader::FileId;
    use std::io::Write;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(
        id: u64,
        kind: RequestKind,
        url: String,
        path: Option<std::path::PathBuf>,
    ) -> ChunkRequest {
        ChunkRequest {
            id: RequestId(id),
            kind,
            file: FileId(1),
            chunk_index: 0,
            range: 2..8,
            path,
            url,
            params: Vec::new(),
        }
    }

    fn source_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file
    }

    fn transport() -> (HttpTransport, mpsc::UnboundedReceiver<DriverMessage>) {
        let (handle, rx) = DriverHandle::channel();
        let transport =
            HttpTransport::new(&HttpConfig::default(), &UploadConfig::default(), handle).unwrap();
        (transport, rx)
    }

    async fn terminal(
        rx: &mut mpsc::UnboundedReceiver<DriverMessage>,
    ) -> (Vec<u64>, TransportEvent) {
        let mut progress = Vec::new();
        while let Some(message) = rx.recv().await {
            if let DriverMessage::Transport(event) = message {
                match event {
                    TransportEvent::Progress { loaded, .. } => progress.push(loaded),
                    other => return (progress, other),
                }
            }
        }
        panic!("channel closed");
    }

    #[tokio::test]
    async fn test_upload_reports_progress_and_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(query_param("chunkNumber", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let file = source_file();

        let (mut transport, mut rx) = transport();
        transport.block_size = 4;
        transport.start(request(
            1,
            RequestKind::Upload,
            format!("{}/upload?chunkNumber=1", server.uri()),
            Some(file.path().to_path_buf()),
        ));

        let (progress, event) = terminal(&mut rx).await;
        assert_eq!(progress.last(), Some(&6));
        assert_eq!(
            event,
            TransportEvent::Success {
                request: RequestId(1),
                body: "ok".to_string()
            }
        );

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].body, b"234567");
    }

    #[tokio::test]
    async fn test_failure_status_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let file = source_file();
        let (mut transport, mut rx) = transport();
        transport.start(request(
            2,
            RequestKind::Upload,
            server.uri(),
            Some(file.path().to_path_buf()),
        ));

        let (_, event) = terminal(&mut rx).await;
        assert_eq!(
            event,
            TransportEvent::Failure {
                request: RequestId(2),
                status: 500,
                body: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let (mut transport, mut rx) = transport();
        transport.start(request(5, RequestKind::Upload, server.uri(), None));

        // 非空范围没有数据源，不能当作成功
        let (_, event) = terminal(&mut rx).await;
        assert!(matches!(
            event,
            TransportEvent::Failure {
                request: RequestId(5),
                status: 0,
                ..
            }
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_range_without_source_sends_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let (mut transport, mut rx) = transport();
        let mut empty = request(6, RequestKind::Upload, server.uri(), None);
        empty.range = 0..0;
        transport.start(empty);

        let (_, event) = terminal(&mut rx).await;
        assert!(matches!(event, TransportEvent::Success { .. }));
        let received = server.received_requests().await.unwrap();
        assert!(received[0].body.is_empty());
    }

    #[tokio::test]
    async fn test_probe_uses_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (mut transport, mut rx) = transport();
        transport.start(request(3, RequestKind::Test, server.uri(), None));

        // 204 不在成功状态码中
        let (_, event) = terminal(&mut rx).await;
        assert!(matches!(event, TransportEvent::Failure { status: 204, .. }));
    }

    #[tokio::test]
    async fn test_success_statuses_come_from_upload_config() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (handle, mut rx) = DriverHandle::channel();
        let upload = UploadConfig {
            success_statuses: vec![200, 204],
            ..UploadConfig::default()
        };
        let mut transport = HttpTransport::new(&HttpConfig::default(), &upload, handle).unwrap();
        transport.start(request(7, RequestKind::Test, server.uri(), None));

        let (_, event) = terminal(&mut rx).await;
        assert!(matches!(event, TransportEvent::Success { .. }));
    }

    #[tokio::test]
    async fn test_abort_suppresses_notifications() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let file = source_file();
        let (mut transport, mut rx) = transport();
        transport.start(request(
            4,
            RequestKind::Upload,
            server.uri(),
            Some(file.path().to_path_buf()),
        ));
        assert_eq!(transport.in_flight(), 1);
        transport.abort(RequestId(4));
        assert_eq!(transport.in_flight(), 0);

        let received = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(received.is_err());
    }
}
