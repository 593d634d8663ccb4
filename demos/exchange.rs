//! A self-contained switchboard: one backend service that announces itself
//! through an in-memory coordination store, and an exchange that discovers
//! it and proxies requests.
//!
//! Serve the exchange on `PORT` (default 8080), then try:
//!
//! ```sh
//! curl http://127.0.0.1:8080/users
//! curl http://127.0.0.1:8080/user/42
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use tokio::sync::mpsc;

use switchboard::body::Body;
use switchboard::serve::Server;
use switchboard::service::{Service, ServiceFuture, SharedService};
use switchboard::store::MemoryStore;
use switchboard::{Announcer, Exchange, ExchangeMux, ProxyService, Response, Routes};

#[derive(Clone)]
struct Users;

impl Service<http::Request<Incoming>> for Users {
    type Response = Response;
    type Error = Infallible;

    fn call(&self, req: http::Request<Incoming>) -> impl ServiceFuture<Self::Response, Self::Error> {
        let body = match req.uri().path() {
            "/users" => Body::from(r#"[{"id":1,"name":"ada"},{"id":2,"name":"grace"}]"#),
            path => Body::from(format!(r#"{{"user":"{}"}}"#, path.trim_start_matches("/user/"))),
        };

        std::future::ready(Ok(Response::new(body)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT").ok().and_then(|port| port.parse().ok()).unwrap_or(8080);

    let store = Arc::new(MemoryStore::new());

    // the backend: an HTTP service plus its presence announcer
    let backend = std::net::TcpListener::bind("127.0.0.1:0")?;
    let backend_addr = backend.local_addr()?;
    tokio::spawn(Server::from_tcp(backend).serve(SharedService::new(Users)));

    let mut routes = Routes::new();
    routes.insert("GET".to_owned(), vec!["/users".to_owned(), "/user/:id".to_owned()]);

    let announcer = Announcer::new("services", store.clone(), format!("http://{backend_addr}"), routes);
    tracing::info!("announcing service {} at http://{backend_addr}", announcer.id());

    let (_broadcast_stop, broadcast_stop_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        announcer
            .broadcast(Duration::from_secs(5), Some(Duration::from_secs(10)), broadcast_stop_rx)
            .await
    });

    // the exchange: discovery loop plus the proxy front-end
    let mux = Arc::new(ExchangeMux::new());
    let mut exchange = Exchange::new("services", store, mux.clone());

    let (_watch_stop, watch_stop_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if let Err(err) = exchange.run(watch_stop_rx).await {
            tracing::error!("exchange stopped: {err}");
        }
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("exchange listening on http://{addr}");

    Server::bind(addr).serve(SharedService::new(ProxyService::new(mux))).await?;

    Ok(())
}
