//! HTTP client for a zone's RPC surface.
//!
//! One pooled `reqwest::Client` is shared by every call; zones are resolved to
//! addresses through a [`ZoneResolver`]. Any non-2xx answer becomes
//! [`ZoneError::Rpc`]. Only [`ZoneClient::healthcheck`] folds failures into
//! `false`. Nothing here retries.

use crate::config::{ClientConfig, ZoneResolver};
use crate::{GraphQueryClient, OperationIssuer, QueryStrategy};
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use url::Url;
use zonegraph_core::{
    DependentZonesDto, EdgeId, Event, EventStats, Permissions, VertexId, VertexType, ZoneError,
    ZoneId, ZoneResult,
};

/// Request/response access to remote zones.
///
/// ```ignore
/// let resolver = StaticResolver::parse(["eu=10.0.0.1:8080"])?;
/// let client = ZoneClient::new(resolver, &ClientConfig::default())?;
/// client.add_edge(&eu, &edge, perms, false).await?;
/// ```
#[derive(Clone)]
pub struct ZoneClient {
    http: reqwest::Client,
    resolver: Arc<dyn ZoneResolver>,
}

impl ZoneClient {
    pub fn new(resolver: impl ZoneResolver + 'static, config: &ClientConfig) -> ZoneResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ZoneError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_http(http, resolver))
    }

    /// Uses an already configured HTTP client.
    pub fn with_http(http: reqwest::Client, resolver: impl ZoneResolver + 'static) -> Self {
        Self {
            http,
            resolver: Arc::new(resolver),
        }
    }

    fn url(&self, zone: &ZoneId, path: &str) -> ZoneResult<Url> {
        let address = self.resolver.resolve(zone)?;
        let base = Url::parse(&format!("http://{address}/"))
            .map_err(|e| ZoneError::InvalidInput(format!("Bad address {address} for {zone}: {e}")))?;
        base.join(path)
            .map_err(|e| ZoneError::Internal(format!("Bad path {path}: {e}")))
    }

    /// Sends the request and rejects anything outside 2xx.
    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> ZoneResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| ZoneError::Transport(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "zone call failed");
            return Err(ZoneError::Rpc {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    async fn post_ack(&self, url: Url, query: &[(&str, String)]) -> ZoneResult<()> {
        tracing::debug!(%url, "post");
        self.send(self.http.post(url.clone()).query(query), &url)
            .await
            .map(|_| ())
    }

    async fn post_json<R: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> ZoneResult<R> {
        tracing::debug!(%url, "post");
        let response = self.send(self.http.post(url.clone()).query(query), &url).await?;
        decode(response, &url).await
    }

    async fn post_text(&self, url: Url, query: &[(&str, String)]) -> ZoneResult<String> {
        tracing::debug!(%url, "post");
        let response = self.send(self.http.post(url.clone()).query(query), &url).await?;
        response
            .text()
            .await
            .map_err(|e| ZoneError::Transport(format!("{url}: {e}")))
    }

    // -- Probes -----------------------------------------------------------

    /// Liveness probe. Unreachable or failing zones yield `false`.
    pub async fn healthcheck(&self, zone: &ZoneId) -> bool {
        let url = match self.url(zone, "healthcheck") {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!(%zone, error = %e, "healthcheck: cannot resolve");
                return false;
            }
        };
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(%zone, error = %e, "healthcheck: unreachable");
                false
            }
        }
    }

    /// Probes every zone concurrently. Results are sorted by zone.
    pub async fn healthcheck_all(&self, zones: impl IntoIterator<Item = ZoneId>) -> Vec<(ZoneId, bool)> {
        let mut tasks = tokio::task::JoinSet::new();
        for zone in zones {
            let client = self.clone();
            tasks.spawn(async move {
                let healthy = client.healthcheck(&zone).await;
                (zone, healthy)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::warn!(error = %e, "healthcheck task panicked"),
            }
        }
        results.sort();
        results
    }

    /// Whether the indexed strategy of `zone` has finished bootstrapping.
    pub async fn index_ready(&self, zone: &ZoneId) -> ZoneResult<bool> {
        let url = self.url(zone, "index_ready")?;
        let response = self.send(self.http.get(url.clone()), &url).await?;
        let ready: Option<bool> = decode(response, &url).await?;
        Ok(ready.unwrap_or(false))
    }

    // -- Adjacency --------------------------------------------------------

    pub async fn is_adjacent(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<bool> {
        let url = self.url(zone, "is_adjacent")?;
        self.post_json(url, &edge_query(edge)).await
    }

    pub async fn list_adjacent(&self, zone: &ZoneId, of: &VertexId) -> ZoneResult<Vec<VertexId>> {
        let url = self.url(zone, "list_adjacent")?;
        self.post_json(url, &[("of", of.to_string())]).await
    }

    pub async fn list_adjacent_reversed(
        &self,
        zone: &ZoneId,
        of: &VertexId,
    ) -> ZoneResult<Vec<VertexId>> {
        let url = self.url(zone, "list_adjacent_reversed")?;
        self.post_json(url, &[("of", of.to_string())]).await
    }

    /// Raw permissions of a single edge.
    pub async fn permissions(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<Permissions> {
        let url = self.url(zone, "permissions")?;
        let text = self.post_text(url, &edge_query(edge)).await?;
        parse_permissions(&text)
    }

    // -- Mutations --------------------------------------------------------

    /// `successive` marks a forwarded propagation, which the receiver must not
    /// forward again.
    pub async fn add_edge(
        &self,
        zone: &ZoneId,
        edge: &EdgeId,
        permissions: Permissions,
        successive: bool,
    ) -> ZoneResult<()> {
        let url = self.url(zone, "graph/edges")?;
        let mut query = edge_query(edge);
        query.push(("permissions", permissions.to_string()));
        query.push(("successive", successive.to_string()));
        self.post_ack(url, &query).await
    }

    pub async fn remove_edge(&self, zone: &ZoneId, edge: &EdgeId, successive: bool) -> ZoneResult<()> {
        let url = self.url(zone, "graph/edges/delete")?;
        let mut query = edge_query(edge);
        query.push(("successive", successive.to_string()));
        self.post_ack(url, &query).await
    }

    pub async fn set_permissions(
        &self,
        zone: &ZoneId,
        edge: &EdgeId,
        permissions: Permissions,
        successive: bool,
    ) -> ZoneResult<()> {
        let url = self.url(zone, "graph/edges/permissions")?;
        let mut query = edge_query(edge);
        query.push(("permissions", permissions.to_string()));
        query.push(("successive", successive.to_string()));
        self.post_ack(url, &query).await
    }

    /// Creates a vertex in the zone that owns it.
    pub async fn add_vertex(&self, id: &VertexId, kind: VertexType) -> ZoneResult<()> {
        let url = self.url(id.owner(), "graph/vertices")?;
        self.post_ack(url, &[("name", id.name().to_string()), ("type", kind.to_string())])
            .await
    }

    // -- Events -----------------------------------------------------------

    /// Delivers an event to the zone owning `id`.
    pub async fn post_event(&self, id: &VertexId, event: &Event) -> ZoneResult<()> {
        let url = self.url(id.owner(), "events")?;
        tracing::debug!(%url, vertex = %id, trace = %event.trace, "post event");
        let request = self
            .http
            .post(url.clone())
            .query(&[("id", id.to_string())])
            .json(event);
        self.send(request, &url).await.map(|_| ())
    }

    pub async fn get_event_stats(&self, zone: &ZoneId) -> ZoneResult<EventStats> {
        let url = self.url(zone, "events/stats")?;
        let response = self.send(self.http.get(url.clone()), &url).await?;
        decode(response, &url).await
    }

    // -- Dependent zones --------------------------------------------------

    pub async fn get_dependent_zones(
        &self,
        zone: &ZoneId,
        exclude: &[ZoneId],
    ) -> ZoneResult<DependentZonesDto> {
        let url = self.url(zone, "dependent_zones")?;
        let response = self
            .send(self.http.post(url.clone()).json(exclude), &url)
            .await?;
        decode(response, &url).await
    }

    /// Every zone transitively depending on `start`, excluding `start`.
    ///
    /// Each hop excludes all zones seen so far, so a zone is asked at most once
    /// and dependency cycles terminate.
    pub async fn resolve_dependent_zones(&self, start: &ZoneId) -> ZoneResult<DependentZonesDto> {
        let mut visited = BTreeSet::from([start.clone()]);
        let mut pending = VecDeque::from([start.clone()]);

        while let Some(zone) = pending.pop_front() {
            let exclude: Vec<ZoneId> = visited.iter().cloned().collect();
            let dependents = self.get_dependent_zones(&zone, &exclude).await?;
            for dependent in dependents.zones {
                if visited.insert(dependent.clone()) {
                    pending.push_back(dependent);
                }
            }
        }

        visited.remove(start);
        tracing::debug!(%start, dependents = visited.len(), "resolved dependent zones");
        Ok(DependentZonesDto { zones: visited })
    }

    // -- Query strategies -------------------------------------------------

    pub fn query(&self, strategy: QueryStrategy) -> StrategyClient {
        StrategyClient {
            client: self.clone(),
            strategy,
        }
    }

    pub fn naive(&self) -> StrategyClient {
        self.query(QueryStrategy::Naive)
    }

    pub fn indexed(&self) -> StrategyClient {
        self.query(QueryStrategy::Indexed)
    }
}

#[async_trait]
impl OperationIssuer for ZoneClient {
    async fn add_edge(&self, zone: &ZoneId, edge: &EdgeId, permissions: Permissions) -> ZoneResult<()> {
        ZoneClient::add_edge(self, zone, edge, permissions, false).await
    }

    async fn remove_edge(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<()> {
        ZoneClient::remove_edge(self, zone, edge, false).await
    }

    async fn set_permissions(
        &self,
        zone: &ZoneId,
        edge: &EdgeId,
        permissions: Permissions,
    ) -> ZoneResult<()> {
        ZoneClient::set_permissions(self, zone, edge, permissions, false).await
    }

    async fn add_vertex(&self, id: &VertexId, kind: VertexType) -> ZoneResult<()> {
        ZoneClient::add_vertex(self, id, kind).await
    }
}

/// A [`GraphQueryClient`] bound to one strategy's endpoints.
#[derive(Clone)]
pub struct StrategyClient {
    client: ZoneClient,
    strategy: QueryStrategy,
}

impl StrategyClient {
    pub fn strategy(&self) -> QueryStrategy {
        self.strategy
    }

    fn url(&self, zone: &ZoneId, endpoint: &str) -> ZoneResult<Url> {
        self.client
            .url(zone, &format!("{}/{endpoint}", self.strategy.path_prefix()))
    }
}

impl std::fmt::Debug for StrategyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GraphQueryClient({})", self.strategy)
    }
}

#[async_trait]
impl GraphQueryClient for StrategyClient {
    async fn reaches(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<bool> {
        let url = self.url(zone, "reaches")?;
        self.client.post_json(url, &edge_query(edge)).await
    }

    async fn members(&self, zone: &ZoneId, of: &VertexId) -> ZoneResult<Vec<VertexId>> {
        let url = self.url(zone, "members")?;
        self.client.post_json(url, &[("of", of.to_string())]).await
    }

    async fn effective_permissions(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<Permissions> {
        let url = self.url(zone, "effective_permissions")?;
        let text = self.client.post_text(url, &edge_query(edge)).await?;
        parse_permissions(&text)
    }
}

fn edge_query(edge: &EdgeId) -> Vec<(&'static str, String)> {
    vec![("from", edge.from.to_string()), ("to", edge.to.to_string())]
}

/// Zones answer permissions either bare (`101`) or as a JSON string (`"101"`).
fn parse_permissions(text: &str) -> ZoneResult<Permissions> {
    text.trim().trim_matches('"').parse()
}

async fn decode<R: serde::de::DeserializeOwned>(response: reqwest::Response, url: &Url) -> ZoneResult<R> {
    let body = response
        .text()
        .await
        .map_err(|e| ZoneError::Transport(format!("{url}: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| ZoneError::Transport(format!("{url}: undecodable body {body:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticResolver;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serves a fixed HTTP response to every connection and reports each raw
    /// request (head and body) on the returned channel.
    async fn stub_zone(status: &'static str, body: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                let _ = tx.send(request);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (addr, rx)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn client_for(zones: &[(&str, SocketAddr)]) -> ZoneClient {
        let mut resolver = StaticResolver::new();
        for (zone, addr) in zones {
            resolver = resolver.with_zone(ZoneId::new(*zone), addr.to_string());
        }
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        ZoneClient::with_http(http, resolver)
    }

    fn edge(from: &str, to: &str) -> EdgeId {
        EdgeId::new(from.parse().unwrap(), to.parse().unwrap())
    }

    #[tokio::test]
    async fn mutation_non_success_is_an_error() {
        let (addr, _rx) = stub_zone("500 Internal Server Error", "").await;
        let client = client_for(&[("a", addr)]);

        let err = client
            .add_edge(&ZoneId::new("a"), &edge("a:u1", "a:g1"), "11".parse().unwrap(), false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn mutation_success_is_acked() {
        let (addr, mut rx) = stub_zone("200 OK", "").await;
        let client = client_for(&[("a", addr)]);

        client
            .add_edge(&ZoneId::new("a"), &edge("a:u1", "a:g1"), "11".parse().unwrap(), true)
            .await
            .unwrap();

        let request = rx.recv().await.unwrap();
        assert!(request.starts_with("POST /graph/edges?"));
        assert!(request.contains("permissions=11"));
        assert!(request.contains("successive=true"));
    }

    #[tokio::test]
    async fn healthcheck_unreachable_is_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(&[("a", addr)]);
        assert!(!client.healthcheck(&ZoneId::new("a")).await);
        assert!(!client.healthcheck(&ZoneId::new("unmapped")).await);
    }

    #[tokio::test]
    async fn healthcheck_all_reports_each_zone() {
        let (up, _rx) = stub_zone("200 OK", "").await;
        let (down, _rx2) = stub_zone("503 Service Unavailable", "").await;
        let client = client_for(&[("a", up), ("b", down)]);

        let results = client
            .healthcheck_all([ZoneId::new("b"), ZoneId::new("a")])
            .await;
        assert_eq!(results, vec![(ZoneId::new("a"), true), (ZoneId::new("b"), false)]);
    }

    #[tokio::test]
    async fn strategy_members_hit_prefixed_endpoint() {
        let (addr, mut rx) = stub_zone("200 OK", r#"["a:u1","b:u2"]"#).await;
        let client = client_for(&[("a", addr)]);

        let members = client
            .indexed()
            .members(&ZoneId::new("a"), &"a:g1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(members, vec!["a:u1".parse().unwrap(), "b:u2".parse().unwrap()]);

        let request = rx.recv().await.unwrap();
        assert!(request.starts_with("POST /indexed/members?of=a%3Ag1"));
    }

    #[tokio::test]
    async fn permissions_accept_bare_text() {
        let (addr, _rx) = stub_zone("200 OK", "101").await;
        let client = client_for(&[("a", addr)]);

        let perms = client
            .naive()
            .effective_permissions(&ZoneId::new("a"), &edge("a:u1", "a:g1"))
            .await
            .unwrap();
        assert_eq!(perms, "101".parse().unwrap());
    }

    #[tokio::test]
    async fn post_event_carries_json_body() {
        let (addr, mut rx) = stub_zone("200 OK", "").await;
        let client = client_for(&[("b", addr)]);
        let target: VertexId = "b:g1".parse().unwrap();
        let event = Event {
            trace: "t-1".into(),
            kind: zonegraph_core::EventType::ChildChange,
            sender: "a:u1".parse().unwrap(),
            original_sender: "a:u1".parse().unwrap(),
            effective_vertices: BTreeSet::new(),
            routes: Default::default(),
        };

        client.post_event(&target, &event).await.unwrap();

        let request = rx.recv().await.unwrap();
        assert!(request.starts_with("POST /events?id=b%3Ag1"));
        assert!(request.contains(r#""type":"child_change""#));
    }

    #[tokio::test]
    async fn dependent_zone_cycles_terminate() {
        // a <- b <- c, and c claims a as a dependent again.
        let (a, _ra) = stub_zone("200 OK", r#"{"zones":["b"]}"#).await;
        let (b, _rb) = stub_zone("200 OK", r#"{"zones":["a","c"]}"#).await;
        let (c, mut rc) = stub_zone("200 OK", r#"{"zones":["a"]}"#).await;
        let client = client_for(&[("a", a), ("b", b), ("c", c)]);

        let resolved = client.resolve_dependent_zones(&ZoneId::new("a")).await.unwrap();
        assert_eq!(
            resolved.zones,
            BTreeSet::from([ZoneId::new("b"), ZoneId::new("c")])
        );

        // c was asked with every previously seen zone excluded.
        let request = rc.recv().await.unwrap();
        assert!(request.contains(r#"["a","b","c"]"#));
    }
}
