use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use url::Url;

use proxywoman_core::{decode_response, next_flow_id, Flow, FlowResponse, FlowSink, FlowStore};
use proxywoman_rules::{
    FeatureSet, InterceptPipeline, InterceptedRequest, InterceptedResponse, RuleError,
};
use proxywoman_tls::LeafCache;

use crate::client::{self, PrefixedStream};
use crate::error::ProxyError;
use crate::http1::{
    decode_request_head, header_value, read_body, reason_phrase, serialize_response,
    MessageStream, RequestHead,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    /// Whole-exchange budget for the outbound hop.
    pub origin_timeout: Duration,
    pub max_head_bytes: usize,
    /// Cap on the body bytes kept in the flow record; the wire always
    /// carries the full body.
    pub max_recorded_body_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080"
                .parse()
                .expect("default bind address must parse"),
            origin_timeout: Duration::from_secs(30),
            max_head_bytes: 64 * 1024,
            max_recorded_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// The interception proxy: forward HTTP/1.1 proxy for cleartext, CONNECT
/// splice with a minted leaf for TLS, the pipeline in between.
pub struct ProxyServer {
    config: EngineConfig,
    leaves: Arc<LeafCache>,
    features: Arc<FeatureSet>,
    pipeline: Arc<InterceptPipeline>,
    flows: Arc<FlowStore>,
    sink: Arc<dyn FlowSink>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyServer {
    pub fn new(
        config: EngineConfig,
        leaves: LeafCache,
        features: FeatureSet,
        sink: Arc<dyn FlowSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let pipeline = Arc::new(InterceptPipeline::from_features(&features));
        Self {
            config,
            leaves: Arc::new(leaves),
            features: Arc::new(features),
            pipeline,
            flows: Arc::new(FlowStore::new()),
            sink,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flows(&self) -> Arc<FlowStore> {
        Arc::clone(&self.flows)
    }

    pub fn features(&self) -> Arc<FeatureSet> {
        Arc::clone(&self.features)
    }

    pub fn leaf_cache(&self) -> Arc<LeafCache> {
        Arc::clone(&self.leaves)
    }

    /// Stops accepting, cancels every suspended breakpoint session, and lets
    /// in-flight exchanges finish writing.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.features.breakpoint.cancel_all();
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.bind).await
    }

    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::debug!(bind = %listener.local_addr()?, "proxy listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer.to_string()).await;
                    });
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, client_addr: String) {
        let mut conn = MessageStream::new(stream);
        loop {
            let head = match conn.read_head(self.config.max_head_bytes).await {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(error) => {
                    tracing::debug!(%client_addr, %error, "failed reading request head");
                    return;
                }
            };
            let request_head = match decode_request_head(&head) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::debug!(%client_addr, %error, "unparseable proxy request");
                    let _ = write_plain_response(&mut conn, 400, "invalid proxy request").await;
                    return;
                }
            };

            if request_head.method.eq_ignore_ascii_case("CONNECT") {
                self.handle_connect(conn, request_head, client_addr).await;
                return;
            }

            match self
                .handle_exchange(&mut conn, request_head, "http", None, &client_addr)
                .await
            {
                Ok(false) => continue,
                _ => return,
            }
        }
    }

    /// The CONNECT splice: acknowledge the tunnel, terminate TLS with a leaf
    /// minted for the SNI host, then serve the inner HTTP/1.1 requests like
    /// any cleartext exchange.
    async fn handle_connect(
        self: Arc<Self>,
        mut conn: MessageStream<TcpStream>,
        head: RequestHead,
        client_addr: String,
    ) {
        let authority = if head.target.contains(':') {
            head.target.clone()
        } else {
            format!("{}:443", head.target)
        };
        let hostname = authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&authority)
            .to_string();

        if conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
            return;
        }

        let leaf = match self.leaves.leaf_for(&hostname) {
            Ok(leaf) => leaf,
            Err(error) => {
                tracing::warn!(host = %hostname, %error, "leaf mint failed, dropping tunnel");
                return;
            }
        };

        let (tcp, leftover) = conn.into_parts();
        let acceptor = TlsAcceptor::from(Arc::clone(&leaf.server_config));
        let tls = match acceptor.accept(PrefixedStream::new(leftover, tcp)).await {
            Ok(tls) => tls,
            Err(error) => {
                // Expected when the client pins certificates; it sees RST.
                tracing::warn!(
                    host = %hostname,
                    common_name = %leaf.common_name,
                    dns_names = ?leaf.dns_names,
                    ip_names = ?leaf.ip_names,
                    %error,
                    "TLS handshake with client failed"
                );
                return;
            }
        };

        let mut conn = MessageStream::new(tls);
        loop {
            let head = match conn.read_head(self.config.max_head_bytes).await {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(error) => {
                    tracing::debug!(%client_addr, host = %hostname, %error, "inner read failed");
                    return;
                }
            };
            let request_head = match decode_request_head(&head) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::debug!(%client_addr, %error, "unparseable inner request");
                    let _ = write_plain_response(&mut conn, 400, "invalid request").await;
                    return;
                }
            };
            match self
                .handle_exchange(&mut conn, request_head, "https", Some(&authority), &client_addr)
                .await
            {
                Ok(false) => continue,
                _ => return,
            }
        }
    }

    /// One request/response exchange: build the flow, run the request chain,
    /// take the outbound hop unless a stage already answered, run the
    /// response chain, write back, publish. Returns whether the connection
    /// must close afterwards.
    async fn handle_exchange<S>(
        &self,
        conn: &mut MessageStream<S>,
        head: RequestHead,
        scheme: &str,
        connect_authority: Option<&str>,
        client_addr: &str,
    ) -> Result<bool, ()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let close_after = head.wants_close;

        let url = match resolve_request_url(&head, scheme, connect_authority) {
            Ok(url) => url,
            Err(error) => {
                tracing::debug!(%client_addr, %error, "cannot resolve request target");
                let _ = write_plain_response(conn, 400, "cannot resolve request target").await;
                return Err(());
            }
        };
        let authority = connect_authority
            .map(str::to_string)
            .or_else(|| header_value(&head.headers, "host").map(str::to_string))
            .unwrap_or_else(|| url.host_str().unwrap_or_default().to_string());

        let body = match read_body(conn, head.framing, self.config.max_head_bytes).await {
            Ok(body) => body,
            Err(error) => {
                tracing::debug!(%client_addr, %error, "failed reading request body");
                let _ = write_plain_response(conn, 400, "invalid request body").await;
                return Err(());
            }
        };

        let mut flow = Flow::new(
            next_flow_id(),
            head.method.clone(),
            url.to_string(),
            scheme.to_string(),
            authority,
            url.path().to_string(),
            client_addr.to_string(),
            head.headers.clone(),
        );
        let cap = self.config.max_recorded_body_bytes;
        if body.len() > cap {
            flow.set_request_body(body[..cap].to_vec());
            flow.request_size = body.len() as u64;
            flow.add_tag("body-truncated");
        } else {
            flow.set_request_body(body.clone());
        }

        let mut request =
            InterceptedRequest::new(head.method.clone(), url, head.headers.clone(), body);

        let chain_outcome = self
            .pipeline
            .run_request_chain(&mut flow, &mut request)
            .await;
        let response = match chain_outcome {
            Ok(Some(synthetic)) => synthetic,
            Ok(None) => {
                // The chain may have rewritten the outbound shape; keep the
                // flow's request snapshot aligned with what actually leaves.
                flow.request.method = request.method.clone();
                flow.request.url = request.url.to_string();
                flow.request.headers = request.headers.clone();
                match client::send_request(
                    &request,
                    self.config.origin_timeout,
                    self.config.max_head_bytes,
                )
                .await
                {
                    Ok(mut upstream_response) => {
                        match self
                            .pipeline
                            .run_response_chain(&mut flow, &mut upstream_response)
                            .await
                        {
                            Ok(()) => upstream_response,
                            Err(error) => self.stage_failure_response(&mut flow, error),
                        }
                    }
                    Err(error) => self.origin_failure_response(&mut flow, error),
                }
            }
            Err(error) => self.stage_failure_response(&mut flow, error),
        };

        self.record_response(&mut flow, &response);
        let wire = serialize_response(&response, &request.response_markers, close_after);
        let close = match conn.write_all(&wire).await {
            Ok(()) => close_after,
            Err(error) => {
                tracing::debug!(%client_addr, %error, "client went away mid-response");
                flow.add_tag("client-aborted");
                true
            }
        };

        self.publish(flow);
        Ok(close)
    }

    fn origin_failure_response(&self, flow: &mut Flow, error: ProxyError) -> InterceptedResponse {
        let tag = match &error {
            ProxyError::UpstreamProxy(_) => "upstream-failed",
            _ => "origin-unreachable",
        };
        tracing::debug!(url = %flow.url, %error, "outbound hop failed");
        flow.add_tag(tag);
        InterceptedResponse::new(502, "Bad Gateway")
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(error.to_string().into_bytes())
    }

    fn stage_failure_response(&self, flow: &mut Flow, error: RuleError) -> InterceptedResponse {
        let tag = match &error {
            RuleError::BreakpointCancelled => "breakpoint-cancelled",
            RuleError::LocalFileMissing(_) => "map-local-error",
            _ => "interceptor-error",
        };
        tracing::debug!(url = %flow.url, %error, "pipeline stage failed");
        flow.add_tag(tag);
        InterceptedResponse::new(500, "Internal Server Error")
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(error.to_string().into_bytes())
    }

    /// Stamps the final response shape onto the flow and derives the decoded
    /// views.
    fn record_response(&self, flow: &mut Flow, response: &InterceptedResponse) {
        let cap = self.config.max_recorded_body_bytes;
        let recorded_body = if response.body.len() > cap {
            flow.add_tag("body-truncated");
            response.body[..cap].to_vec()
        } else {
            response.body.clone()
        };
        let mut recorded = FlowResponse {
            status_code: response.status_code,
            status: response.status.clone(),
            headers: response.headers.clone(),
            body: recorded_body,
            ..FlowResponse::default()
        };
        decode_response(&mut recorded);
        flow.set_response(recorded);
        flow.response_size = response.body.len() as u64;
    }

    /// Single publication point: the store insert and the flow callback
    /// happen exactly once per flow, after the response has been written.
    fn publish(&self, flow: Flow) {
        self.flows.insert(flow.clone());
        self.sink.on_flow(&flow);
    }
}

fn resolve_request_url(
    head: &RequestHead,
    scheme: &str,
    connect_authority: Option<&str>,
) -> Result<Url, ProxyError> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return Url::parse(&head.target)
            .map_err(|error| ProxyError::InvalidRequest(format!("bad absolute target: {error}")));
    }

    let authority = connect_authority
        .map(str::to_string)
        .or_else(|| header_value(&head.headers, "host").map(str::to_string))
        .ok_or_else(|| {
            ProxyError::InvalidRequest("origin-form request without Host header".to_string())
        })?;
    Url::parse(&format!("{scheme}://{authority}{}", head.target))
        .map_err(|error| ProxyError::InvalidRequest(format!("bad request target: {error}")))
}

async fn write_plain_response<S>(
    conn: &mut MessageStream<S>,
    status_code: u16,
    message: &str,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = InterceptedResponse::new(status_code, reason_phrase(status_code))
        .with_header("Content-Type", "text/plain; charset=utf-8")
        .with_body(message.as_bytes().to_vec());
    conn.write_all(&serialize_response(&response, &[], true)).await
}
