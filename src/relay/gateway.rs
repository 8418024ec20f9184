//! 流式转发：把 `/{protocol}://{host}/{path}` 形式的请求经代理域名转发到上游，
//! 响应状态码、响应头与响应体原样回传，响应体边收边发，不落内存。

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, Method, Request, Response};
use futures_core::Stream;
use reqwest::Client;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{RelayError, RelayResult};
use super::proxied_url;
use super::stats::{Counter, StatsCollector};
use super::strategy::DomainSelector;

/// 请求体上限（POST/PUT/PATCH 会先读入内存再转发）。
pub const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// 解析后的上游目标。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    /// 小写的 `http` 或 `https`。
    pub protocol: String,
    /// 可能带端口。
    pub host: String,
    /// 以 `/` 开头，包含查询串。
    pub path: String,
}

impl TargetRef {
    /// 解析 `/{protocol}://{host}/{path}`。前导 `/` 可有可无，
    /// 也接受被客户端合并斜杠后的 `https:/host/...`。
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let raw = raw.trim().trim_start_matches('/');
        let invalid = || RelayError::InvalidInput(format!("not a proxy target: {raw}"));

        let (protocol, rest) = raw.split_once(':').ok_or_else(invalid)?;
        let protocol = protocol.to_ascii_lowercase();
        if protocol != "http" && protocol != "https" {
            return Err(invalid());
        }
        let rest = rest.trim_start_matches('/');

        let split_at = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (host, tail) = rest.split_at(split_at);
        if host.is_empty() {
            return Err(invalid());
        }
        let path = if tail.starts_with('/') {
            tail.to_string()
        } else {
            format!("/{tail}")
        };

        Ok(Self {
            protocol,
            host: host.to_ascii_lowercase(),
            path,
        })
    }

    /// 去掉端口后的主机名。
    pub fn hostname(&self) -> &str {
        match self.host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => &self.host,
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.protocol, self.host, self.path)
    }
}

/// 允许代理的上游域名：精确匹配或其子域名。
#[derive(Debug, Clone)]
pub struct AllowList {
    hosts: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn permits(&self, hostname: &str) -> bool {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        self.hosts.iter().any(|allowed| {
            hostname == *allowed
                || hostname
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn check(&self, target: &TargetRef) -> RelayResult<()> {
        if self.permits(target.hostname()) {
            Ok(())
        } else {
            Err(RelayError::AccessDenied {
                host: target.hostname().to_string(),
            })
        }
    }

    /// 解析并校验：管理 API 与转发入口共用。
    pub fn resolve(&self, raw: &str) -> RelayResult<TargetRef> {
        let target = TargetRef::parse(raw)?;
        self.check(&target)?;
        Ok(target)
    }
}

pub struct GatewayOptions {
    pub relay_scheme: String,
    pub header_timeout: Duration,
    pub idle_timeout: Duration,
}

pub struct RelayGateway {
    client: Client,
    selector: Arc<DomainSelector>,
    allow: AllowList,
    stats: Arc<StatsCollector>,
    options: GatewayOptions,
}

impl RelayGateway {
    pub fn new(
        client: Client,
        selector: Arc<DomainSelector>,
        allow: AllowList,
        stats: Arc<StatsCollector>,
        options: GatewayOptions,
    ) -> Self {
        Self {
            client,
            selector,
            allow,
            stats,
            options,
        }
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    /// 转发一个请求。上游有响应时（包括 4xx/5xx）原样返回；只有拿不到响应才返回错误。
    pub async fn forward(
        &self,
        req: Request<Body>,
        cancel: CancellationToken,
    ) -> RelayResult<Response<Body>> {
        let raw = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| req.uri().path());
        let target = self.allow.resolve(raw)?;

        let relay = self.selector.select().await?;
        let url = proxied_url(&self.options.relay_scheme, &relay, &target.url());

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        headers.remove(HOST);
        headers.remove(CONNECTION);

        let mut upstream = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers);
        if matches!(parts.method, Method::POST | Method::PUT | Method::PATCH) {
            let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY)
                .await
                .map_err(|e| RelayError::InvalidInput(format!("request body: {e}")))?;
            upstream = upstream.body(bytes);
        }
        self.stats
            .increment(Counter::ProxyRequests, 1, Some(&relay));

        let sent = tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::upstream("cancelled")),
            res = tokio::time::timeout(self.options.header_timeout, upstream.send()) => match res {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(RelayError::upstream(e.to_string())),
                Err(_) => Err(RelayError::upstream("timed out waiting for response headers")),
            },
        };
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                self.stats.increment(Counter::Errors, 1, Some(&relay));
                warn!(target: "gateway", relay = %relay, url = %target.url(), error = %e, "转发失败");
                return Err(e);
            }
        };

        let status = resp.status();
        if status.is_server_error() {
            self.stats.increment(Counter::Errors, 1, Some(&relay));
        }
        info!(
            target: "gateway",
            relay = %relay,
            method = %parts.method,
            url = %target.url(),
            status = status.as_u16(),
            "relay"
        );

        let mut out_headers = resp.headers().clone();
        strip_framing_headers(&mut out_headers);

        let meter = ByteMeter::new(self.stats.clone(), relay);
        let body = RelayBody::new(
            resp.bytes_stream(),
            self.options.idle_timeout,
            cancel,
            meter,
        );

        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = status;
        *response.headers_mut() = out_headers;
        Ok(response)
    }
}

fn strip_framing_headers(headers: &mut HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(KEEP_ALIVE);
}

/// 记录一次转发实际传输的字节数；正常结束或被 drop（客户端断开）时各记一次，只生效一次。
struct ByteMeter {
    stats: Arc<StatsCollector>,
    relay: String,
    bytes: u64,
    recorded: bool,
}

impl ByteMeter {
    fn new(stats: Arc<StatsCollector>, relay: String) -> Self {
        Self {
            stats,
            relay,
            bytes: 0,
            recorded: false,
        }
    }

    fn add(&mut self, n: usize) {
        self.bytes += n as u64;
    }

    fn error(&mut self) {
        self.stats.increment(Counter::Errors, 1, Some(&self.relay));
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        self.stats
            .increment(Counter::ProxyBytes, self.bytes, Some(&self.relay));
        debug!(target: "gateway", relay = %self.relay, bytes = self.bytes, "stream finished");
    }
}

impl Drop for ByteMeter {
    fn drop(&mut self) {
        self.record();
    }
}

type UpstreamStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// 上游响应体到下游的管道，带空闲超时与取消。
pub struct RelayBody {
    inner: UpstreamStream,
    idle: Pin<Box<Sleep>>,
    idle_timeout: Duration,
    cancelled: Pin<Box<dyn Future<Output = ()> + Send>>,
    meter: ByteMeter,
    done: bool,
}

impl RelayBody {
    fn new<S>(
        inner: S,
        idle_timeout: Duration,
        cancel: CancellationToken,
        meter: ByteMeter,
    ) -> Self
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_timeout,
            cancelled: Box::pin(async move { cancel.cancelled().await }),
            meter,
            done: false,
        }
    }

    fn fail(&mut self, kind: io::ErrorKind, msg: String) -> Poll<Option<io::Result<Bytes>>> {
        self.done = true;
        self.meter.record();
        Poll::Ready(Some(Err(io::Error::new(kind, msg))))
    }
}

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            return this.fail(io::ErrorKind::Interrupted, "relay cancelled".to_string());
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.meter.add(chunk.len());
                let deadline = Instant::now() + this.idle_timeout;
                this.idle.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.meter.error();
                this.fail(io::ErrorKind::Other, format!("upstream stream error: {e}"))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.meter.record();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    this.meter.error();
                    return this.fail(io::ErrorKind::TimedOut, "upstream idle timeout".to_string());
                }
                Poll::Pending
            }
        }
    }
}
