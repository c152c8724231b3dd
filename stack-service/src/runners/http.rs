// HTTP Runner
// Sends a single request; 4xx and 5xx responses fail the hook

use super::{HookContext, HookRunError, HookRunner};
use crate::config::HookSpec;

use reqwest::Method;

/// Response bodies beyond this are dropped
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct HttpRunner {
    client: reqwest::Client,
}

impl HttpRunner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

async fn read_capped(mut resp: reqwest::Response) -> String {
    let mut buf = Vec::new();
    while let Ok(Some(chunk)) = resp.chunk().await {
        let room = MAX_BODY_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= MAX_BODY_BYTES {
            break;
        }
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[async_trait::async_trait]
impl HookRunner for HttpRunner {
    async fn run(&self, hook: &HookSpec, ctx: &HookContext) -> Result<(), HookRunError> {
        let Some(cfg) = hook.http.as_ref().filter(|h| !h.url.trim().is_empty()) else {
            return Err(HookRunError::Invalid("http.url is required".into()));
        };
        let method_name = cfg.effective_method();
        let url = cfg.url.trim();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| HookRunError::Invalid(format!("unsupported http method {:?}", method_name)))?;

        let mut req = self
            .client
            .request(method, url)
            .timeout(ctx.timeout(hook));
        for (k, v) in &cfg.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if !cfg.body.is_empty() {
            req = req.body(cfg.body.clone());
        }

        let fail = |msg: String| HookRunError::Failed(format!("http {} {} failed: {}", method_name, url, msg));
        let resp = req.send().await.map_err(|e| fail(e.to_string()))?;
        let status = resp.status();
        let body = read_capped(resp).await;
        ctx.emit_output(&body);
        if status.as_u16() >= 400 {
            let msg = if body.is_empty() {
                status.to_string()
            } else {
                body
            };
            return Err(fail(msg));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HookType, HttpHookConfig};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response and returns the request head it received
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let resp = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (url, handle)
    }

    fn http_hook(url: &str, body: &str) -> HookSpec {
        HookSpec {
            hook_type: Some(HookType::Http),
            http: Some(HttpHookConfig {
                url: url.to_string(),
                body: body.to_string(),
                headers: [("X-Ktl".to_string(), "yes".to_string())].into_iter().collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_post_with_body_succeeds() {
        let (url, server) = serve_once("200 OK", "ok").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = HookContext {
            on_output: Some(Arc::new(move |l: &str| sink.lock().unwrap().push(l.to_string()))),
            ..Default::default()
        };
        HttpRunner::new().run(&http_hook(&url, "{}"), &ctx).await.unwrap();

        let head = server.await.unwrap();
        assert!(head.starts_with("POST /hook"), "{}", head);
        assert!(head.to_ascii_lowercase().contains("x-ktl: yes"));
        assert_eq!(seen.lock().unwrap().clone(), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_error_status_fails_with_body() {
        let (url, _server) = serve_once("503 Service Unavailable", "down for maintenance").await;
        let err = HttpRunner::new()
            .run(&http_hook(&url, ""), &HookContext::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("http GET {} failed: down for maintenance", url)
        );
    }
}
