//! Upstream forwarding.
//!
//! The reverse-proxy mechanics (pooling, retries, body rewriting) belong to
//! the upstream collaborator; this client is only the seam the admitted
//! request crosses. Upstream trouble maps onto gateway-neutral statuses so
//! a pipeline failure is never reported as an origin 5xx.

use std::time::Duration;

use log::{error, warn};

use crate::core::chain::RequestContext;
use crate::models::UpstreamConfig;

/// Response the gateway relays back to the client.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lowered = name.to_lowercase();
    HOP_BY_HOP.contains(&lowered.as_str()) || lowered == "host" || lowered == "content-length"
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.response_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Forward an admitted request and relay whatever comes back. Transport
    /// failures yield 502, upstream timeouts 504.
    pub async fn forward(&self, ctx: &RequestContext, body: Vec<u8>) -> ForwardedResponse {
        let url = format!("{}{}", self.base_url, ctx.path);
        let method = match reqwest::Method::from_bytes(ctx.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                warn!("unforwardable method {} - IP: {}", ctx.method, ctx.client_ip);
                return error_response(400);
            }
        };

        let mut request = self.client.request(method, &url);
        for (name, value) in &ctx.headers {
            if !is_hop_by_hop(name) {
                request = request.header(name, value);
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.to_string(), v.to_string()))
                    })
                    .collect();
                let body = match response.bytes().await {
                    Ok(bytes) => bytes.to_vec(),
                    Err(err) => {
                        error!("upstream body read failed - path: {}, error: {}", ctx.path, err);
                        return error_response(502);
                    }
                };
                ForwardedResponse {
                    status,
                    headers,
                    body,
                }
            }
            Err(err) if err.is_timeout() => {
                error!("upstream timeout - path: {}, error: {}", ctx.path, err);
                error_response(504)
            }
            Err(err) => {
                error!("upstream transport failure - path: {}, error: {}", ctx.path, err);
                error_response(502)
            }
        }
    }
}

fn error_response(status: u16) -> ForwardedResponse {
    ForwardedResponse {
        status,
        headers: Vec::new(),
        body: Vec::new(),
    }
}
