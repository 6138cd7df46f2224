use std::io::Write;

use anyhow::{Context, Result};

use super::{RemoteMessage, RemoteSender, REMOTE_PATH};
use crate::config::RemoteConfig;
use crate::error::StreamError;
use crate::stream::BoxFuture;

/// Sends dispatched records to other nodes as NDJSON over HTTP.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    compression: String,
    batch_size: usize,
}

impl HttpRemoteClient {
    pub fn new(cfg: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building remote HTTP client")?;

        Ok(Self {
            client,
            compression: cfg.compression.clone(),
            batch_size: cfg.batch_size.max(1),
        })
    }

    async fn post(&self, node: &str, messages: &[RemoteMessage]) -> Result<()> {
        let mut buf = Vec::with_capacity(messages.len() * 256);
        for message in messages {
            serde_json::to_writer(&mut buf, message).context("serializing remote message")?;
            buf.push(b'\n');
        }
        let raw_len = buf.len();

        let body = compress(&buf, &self.compression).context("compressing NDJSON body")?;

        let mut request = self
            .client
            .post(endpoint(node))
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = content_encoding(&self.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        let resp = request.send().await.context("sending remote batch")?;
        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            anyhow::bail!("unexpected status: {status}");
        }

        tracing::debug!(
            node,
            messages = messages.len(),
            bytes = raw_len,
            "sent remote batch",
        );

        Ok(())
    }
}

impl RemoteSender for HttpRemoteClient {
    fn send<'a>(
        &'a self,
        node: &'a str,
        messages: Vec<RemoteMessage>,
    ) -> BoxFuture<'a, Result<(), StreamError>> {
        Box::pin(async move {
            for chunk in messages.chunks(self.batch_size) {
                self.post(node, chunk)
                    .await
                    .map_err(|e| StreamError::RemoteUnreachable {
                        node: node.to_string(),
                        reason: format!("{e:#}"),
                    })?;
            }
            Ok(())
        })
    }
}

/// URL of the remote endpoint on `node`.
fn endpoint(node: &str) -> String {
    if node.starts_with("http://") || node.starts_with("https://") {
        format!("{}{REMOTE_PATH}", node.trim_end_matches('/'))
    } else {
        format!("http://{node}{REMOTE_PATH}")
    }
}

fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        other => anyhow::bail!("unsupported compression: {other}"),
    }
}

fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}
