//! Drain notification.
//!
//! Before a node goes FINISHING the supervisor tells it to stop taking new
//! work: `POST {url}/notifyWhenIdle` with `{"nodeId": <id>}`. Any 2xx is
//! success. The call is a courtesy; callers log the outcome and move on.

use bytes::Bytes;
use fleet_state::NodeId;
use http::Uri;
use http_body_util::Full;
use tracing::{debug, warn};

use crate::config::NotifyConfig;

/// Outcome of one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Delivered,
    Rejected(u16),
    Failed(String),
}

/// Sends drain notifications with bounded retry.
#[derive(Debug, Clone)]
pub struct DrainNotifier {
    config: NotifyConfig,
}

impl DrainNotifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self { config }
    }

    /// Notify `node_id` at `base_url`. Returns whether any attempt got a 2xx.
    pub async fn notify_when_idle(&self, node_id: NodeId, base_url: &str) -> bool {
        let target = format!("{}/notifyWhenIdle", base_url.trim_end_matches('/'));
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(node_id, url = %target, error = %e, "invalid drain notification url");
                return false;
            }
        };
        let body = Bytes::from(serde_json::json!({ "nodeId": node_id }).to_string());

        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match post_once(&uri, body.clone(), &self.config).await {
                Attempt::Delivered => {
                    debug!(node_id, attempt, "drain notification delivered");
                    return true;
                }
                Attempt::Rejected(status) => {
                    debug!(node_id, attempt, status, "drain notification rejected");
                }
                Attempt::Failed(error) => {
                    debug!(node_id, attempt, %error, "drain notification failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }

        warn!(node_id, url = %target, attempts, "drain notification gave up");
        false
    }
}

async fn post_once(uri: &Uri, body: Bytes, config: &NotifyConfig) -> Attempt {
    let Some(authority) = uri.authority() else {
        return Attempt::Failed(format!("no host in {uri}"));
    };
    if uri.scheme_str().is_some_and(|scheme| scheme != "http") {
        return Attempt::Failed(format!("unsupported scheme in {uri}"));
    }
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

    let result = tokio::time::timeout(config.request_timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => return Attempt::Failed(format!("connect {address}: {e}")),
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => return Attempt::Failed(format!("handshake: {e}")),
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method(http::Method::POST)
            .uri(uri.path_and_query().map_or("/", |path| path.as_str()))
            .header(http::header::HOST, authority.as_str())
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::USER_AGENT, "fleet-supervisor/0.1")
            .body(Full::new(body))
        {
            Ok(req) => req,
            Err(e) => return Attempt::Failed(format!("build request: {e}")),
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => Attempt::Delivered,
            Ok(resp) => Attempt::Rejected(resp.status().as_u16()),
            Err(e) => Attempt::Failed(format!("request: {e}")),
        }
    })
    .await;

    result.unwrap_or_else(|_| Attempt::Failed("timed out".to_string()))
}
