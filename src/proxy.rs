use std::convert::Infallible;
use std::sync::Arc;

use http::StatusCode;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;

use crate::body::Body;
use crate::mux::ExchangeMux;
use crate::service::{Service, ServiceFuture};
use crate::Response;

/// The exchange's HTTP handler: resolves each request against the routing
/// table, forwards it to one of the matched backends picked uniformly at
/// random, and relays the backend's response untouched.
///
/// Unroutable requests answer `404`; a request that cannot be built or
/// delivered answers `500`. There is no retry and no failover to another
/// address, and nothing is kept between requests beyond the pooled client
/// connections.
#[derive(Clone)]
pub struct ProxyService {
    mux: Arc<ExchangeMux>,
    client: Client<HttpConnector, Body>,
}

impl ProxyService {
    pub fn new(mux: Arc<ExchangeMux>) -> Self {
        ProxyService {
            mux,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn mux(&self) -> &Arc<ExchangeMux> {
        &self.mux
    }
}

fn status_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

impl<B> Service<http::Request<B>> for ProxyService
where
    B: Into<Body> + Send + 'static,
{
    type Response = Response;
    type Error = Infallible;

    fn call(&self, req: http::Request<B>) -> impl ServiceFuture<Self::Response, Self::Error> {
        use futures::future::Either;

        let (parts, body) = req.into_parts();
        let body: Body = body.into();
        let path = parts.uri.path();

        let Some(addresses) = self.mux.match_route(parts.method.as_str(), path) else {
            return Either::Left(std::future::ready(Ok(status_response(StatusCode::NOT_FOUND))));
        };

        let address = &addresses[rand::thread_rng().gen_range(0..addresses.len())];

        let mut target = String::with_capacity(address.len() + parts.uri.path().len());
        target.push_str(address);
        target.push_str(path);
        // the raw query is forwarded byte for byte, never re-encoded
        match parts.uri.query() {
            Some(query) if !query.is_empty() => {
                target.push('?');
                target.push_str(query);
            }
            _ => {}
        }

        let outbound = http::Request::builder()
            .method(parts.method)
            .uri(target)
            .body(body);

        let mut outbound = match outbound {
            Ok(outbound) => outbound,
            Err(err) => {
                log::warn!("failed to build backend request: {err}");
                return Either::Left(std::future::ready(Ok(status_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                ))));
            }
        };
        *outbound.headers_mut() = parts.headers;

        let response = self.client.request(outbound);

        Either::Right(async move {
            match response.await {
                Ok(response) => Ok(response.map(Body::from)),
                Err(err) => {
                    log::error!("backend request failed: {err}");
                    Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR))
                }
            }
        })
    }
}
