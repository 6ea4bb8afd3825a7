//! The per-connection relay loop.
//!
//! Each transaction reads one request from the client, sends it to the
//! upstream (an authenticating proxy or the target itself) and returns the
//! response. A 407 from the proxy is answered by the connection: it fetches a
//! credential through the [`ProxyRunner`], rewrites the `Proxy-Authorization`
//! header and sends the request again, at most `retry_count` times.

use super::tunnel;
use crate::credential::BasicCredential;
use crate::error::{is_disconnect, Error, Result};
use crate::http::{error_response, MessageReader, Request, Response, CONNECT_ESTABLISHED, CONTINUE};
use crate::metrics;
use crate::proxy::ProxyRunner;
use crate::resolver::{DnsEndpoint, RequestTarget};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};

const PROXY_AUTHENTICATION_REQUIRED: u16 = 407;

struct ServerConnection {
    endpoint: DnsEndpoint,
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ServerConnection {
    fn new(endpoint: DnsEndpoint, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            endpoint,
            reader: MessageReader::new(reader),
            writer,
        }
    }
}

/// How far the current transaction got, for error reporting.
#[derive(Debug, Default)]
struct Progress {
    request_read: bool,
    response_started: bool,
}

enum Next {
    KeepAlive,
    Close,
    Tunnel,
}

pub(super) struct RelaySession {
    runner: Arc<dyn ProxyRunner>,
    retry_count: usize,
    client: MessageReader<OwnedReadHalf>,
    client_writer: OwnedWriteHalf,
    server: Option<ServerConnection>,
    /// Whether `server` is an upstream proxy rather than the request target.
    connecting_to_proxy: bool,
    /// Credential accepted on the current upstream connection.
    proxy_credential: Option<BasicCredential>,
    realm: String,
}

impl RelaySession {
    pub(super) fn new(stream: TcpStream, runner: Arc<dyn ProxyRunner>, retry_count: usize) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            runner,
            retry_count,
            client: MessageReader::new(reader),
            client_writer: writer,
            server: None,
            connecting_to_proxy: false,
            proxy_credential: None,
            realm: String::new(),
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let mut progress = Progress::default();
            match self.transaction(&mut progress).await {
                Ok(Next::KeepAlive) => {}
                Ok(Next::Close) => break,
                Ok(Next::Tunnel) => return self.tunnel().await,
                Err(e) => {
                    self.fail(e, &progress).await;
                    break;
                }
            }
        }
        trace!("relay finished");
    }

    async fn transaction(&mut self, progress: &mut Progress) -> Result<Next> {
        let Some(head) = self.client.read_head().await? else {
            return Ok(Next::Close);
        };
        let mut request = Request::parse(head)?;
        if request.expects_continue() {
            self.client_writer.write_all(CONTINUE).await?;
        }
        let body = match self.client.read_body(request.framing()).await {
            Ok(body) => body,
            Err(e @ Error::BodyTooLarge(_)) => {
                // The head was read; the client gets a 413.
                progress.request_read = true;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        request.set_body(body);
        progress.request_read = true;
        debug!(method = request.method(), target = %request.target(), "request");

        let target = request.target().clone();
        let mut may_resend = self.connect(&target).await?;

        if request.is_connect() && !self.connecting_to_proxy {
            progress.response_started = true;
            self.client_writer.write_all(CONNECT_ESTABLISHED).await?;
            metrics::record_response(200);
            return Ok(Next::Tunnel);
        }

        if !self.connecting_to_proxy && request.has_proxy_authorization() {
            // Origins never see a credential meant for a proxy.
            let span = request.proxy_authorization_span();
            request.add_modification(span, |_| {});
        }

        let mut sent = None;
        if self.connecting_to_proxy && !request.has_proxy_authorization() {
            sent = self.preemptive_credential().await?;
            if let Some(credential) = &sent {
                trace!(revision = credential.revision(), "sending credential pre-emptively");
                set_credential(&mut request, credential);
            }
        }

        let mut attempt = 0;
        loop {
            let response = match self.exchange(&request).await {
                Ok(Some(response)) => response,
                // A reused upstream socket may have been closed while idle.
                Ok(None) | Err(Error::Io(_)) if may_resend => {
                    debug!("reused upstream connection is gone; reconnecting");
                    may_resend = false;
                    self.reconnect().await?;
                    continue;
                }
                Ok(None) => return Err(Error::UpstreamClosed(self.server_endpoint()?.to_string())),
                Err(e) => return Err(e),
            };
            may_resend = false;

            if response.status() == PROXY_AUTHENTICATION_REQUIRED && self.connecting_to_proxy {
                if attempt < self.retry_count {
                    let realm = response.proxy_authenticate_realm().unwrap_or_default();
                    let endpoint = self.server_endpoint()?.to_string();
                    let credential = self
                        .runner
                        .get_server_basic_credentials(&endpoint, &realm, false, sent.as_ref())
                        .await?;
                    if let Some(credential) = credential {
                        attempt += 1;
                        metrics::record_auth_retry();
                        debug!(attempt, revision = credential.revision(), %realm, "retrying with credential");
                        set_credential(&mut request, &credential);
                        sent = Some(credential);
                        self.realm = realm;
                        if response.keep_alive() {
                            self.server_mut()?.reader.skip_body(response.framing()).await?;
                        } else {
                            self.reconnect().await?;
                        }
                        continue;
                    }
                    debug!(%endpoint, "no credential available; returning challenge to client");
                } else {
                    warn!(
                        retry_count = self.retry_count,
                        "Authentication retry budget exceeded; returning 407 to client"
                    );
                }
            } else if sent.is_some() {
                self.proxy_credential = sent;
            }

            return self.forward(&request, response, progress).await;
        }
    }

    /// Make sure `server` points at a candidate for `target`.
    ///
    /// Returns whether an existing upstream connection was reused.
    async fn connect(&mut self, target: &RequestTarget) -> Result<bool> {
        let (candidates, via_proxy) = match self.runner.upstream_endpoints(target) {
            Some(endpoints) if !endpoints.is_empty() => (endpoints, true),
            _ => (vec![target.endpoint()], false),
        };

        if let Some(server) = &self.server {
            if self.connecting_to_proxy == via_proxy
                && candidates
                    .iter()
                    .any(|c| server.endpoint.matches(&c.host, c.port))
            {
                trace!(endpoint = %server.endpoint, "reusing upstream connection");
                return Ok(true);
            }
            debug!(endpoint = %server.endpoint, "upstream endpoint changed; disconnecting");
            self.disconnect();
        }

        self.connecting_to_proxy = via_proxy;
        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect((candidate.host.as_str(), candidate.port)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(endpoint = %candidate, via_proxy, "connected to upstream");
                    self.server = Some(ServerConnection::new(candidate, stream));
                    return Ok(false);
                }
                Err(e) => {
                    metrics::record_upstream_connect_failure();
                    warn!(endpoint = %candidate, "Failed to connect to upstream: {}", e);
                    last_error = Some((candidate, e));
                }
            }
        }

        match last_error {
            Some((endpoint, source)) => Err(Error::BadGateway {
                target: endpoint.to_string(),
                source,
            }),
            None => Err(Error::NoUpstream(target.to_string())),
        }
    }

    /// Drop the upstream socket and connect to the same endpoint again.
    async fn reconnect(&mut self) -> Result<()> {
        let endpoint = self.server_endpoint()?.clone();
        self.disconnect();
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| {
                metrics::record_upstream_connect_failure();
                Error::BadGateway {
                    target: endpoint.to_string(),
                    source,
                }
            })?;
        let _ = stream.set_nodelay(true);
        trace!(%endpoint, "reconnected to upstream");
        self.server = Some(ServerConnection::new(endpoint, stream));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.server = None;
        self.proxy_credential = None;
    }

    fn server_mut(&mut self) -> Result<&mut ServerConnection> {
        self.server
            .as_mut()
            .ok_or_else(|| Error::NoUpstream("no upstream connection".to_string()))
    }

    fn server_endpoint(&self) -> Result<&DnsEndpoint> {
        self.server
            .as_ref()
            .map(|s| &s.endpoint)
            .ok_or_else(|| Error::NoUpstream("no upstream connection".to_string()))
    }

    /// Credential to send before any challenge.
    ///
    /// A fresh upstream connection asks the cache as a first request. Once a
    /// credential was accepted on this connection it is resent, unless the
    /// cache has meanwhile moved to a newer revision. The source is never
    /// consulted here.
    async fn preemptive_credential(&mut self) -> Result<Option<BasicCredential>> {
        let endpoint = self.server_endpoint()?.to_string();
        let Some(held) = &self.proxy_credential else {
            return self
                .runner
                .get_server_basic_credentials(&endpoint, &self.realm, true, None)
                .await;
        };
        let credential = match self.runner.cached_credential(&endpoint).await {
            Some(cached) if cached.revision() > held.revision() => cached,
            _ => held.clone(),
        };
        Ok(Some(credential))
    }

    /// Send `request` upstream and read the final response head.
    async fn exchange(&mut self, request: &Request) -> Result<Option<Response>> {
        let server = self.server_mut()?;
        request.write_to(&mut server.writer).await?;
        loop {
            let Some(head) = server.reader.read_head().await? else {
                return Ok(None);
            };
            let response = Response::parse(head, request.method())?;
            if response.is_informational() {
                trace!(status = response.status(), "skipping interim response");
                continue;
            }
            return Ok(Some(response));
        }
    }

    async fn forward(&mut self, request: &Request, response: Response, progress: &mut Progress) -> Result<Next> {
        progress.response_started = true;
        let status = response.status();
        trace!(status, "forwarding response");
        self.client_writer.write_all(response.head()).await?;
        metrics::record_response(status);

        if (request.is_connect() && (200..300).contains(&status)) || status == 101 {
            self.client_writer.flush().await?;
            return Ok(Next::Tunnel);
        }

        if let Some(server) = self.server.as_mut() {
            server
                .reader
                .copy_body(response.framing(), &mut self.client_writer)
                .await?;
        }

        if !response.keep_alive() {
            self.disconnect();
            return Ok(Next::Close);
        }
        if !request.keep_alive() {
            return Ok(Next::Close);
        }
        Ok(Next::KeepAlive)
    }

    async fn fail(&mut self, e: Error, progress: &Progress) {
        if !progress.request_read {
            debug!("connection ended before a request was read: {}", e);
            return;
        }
        match &e {
            Error::Io(io) if is_disconnect(io) => debug!("connection ended: {}", e),
            _ => warn!("Request failed: {}", e),
        }
        if progress.response_started {
            return;
        }
        if let Some(status) = e.status_code() {
            let response = error_response(status, &e.to_string());
            if self.client_writer.write_all(&response).await.is_ok() {
                metrics::record_response(status);
            }
            let _ = self.client_writer.shutdown().await;
        }
    }

    async fn tunnel(self) {
        let Some(server) = self.server else {
            return;
        };
        metrics::record_tunnel();
        debug!(endpoint = %server.endpoint, "tunnel established");
        let result = tunnel::relay(self.client, self.client_writer, server.reader, server.writer).await;
        log_tunnel_outcome(&result);
    }
}

fn log_tunnel_outcome(result: &std::io::Result<(u64, u64)>) {
    match result {
        Ok((up, down)) => debug!(up, down, "tunnel closed"),
        Err(e) if is_disconnect(e) => warn!("Tunnel aborted: {}", e),
        Err(e) => error!("Tunnel failed: {}", e),
    }
}

/// Stage `credential` as the request's `Proxy-Authorization` line.
fn set_credential(request: &mut Request, credential: &BasicCredential) {
    let span = request.proxy_authorization_span();
    let line = credential.bytes().clone();
    request.add_modification(span, move |out| out.extend_from_slice(&line));
}
