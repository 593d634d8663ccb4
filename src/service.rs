use std::{error::Error, future::Future, ops::Deref, sync::Arc};

pub trait ServiceFuture<T, E>: Future<Output = Result<T, E>> + Send + 'static {}

impl<F, T, E> ServiceFuture<T, E> for F where F: Future<Output = Result<T, E>> + Send + 'static {}

pub trait Service<Req>: Send + Sync + 'static {
    type Response;
    type Error;

    fn call(&self, req: Req) -> impl ServiceFuture<Self::Response, Self::Error>;
}

impl<R, T> Service<R> for T
where
    T: Deref<Target: Service<R>> + Send + Sync + 'static,
{
    type Response = <<T as Deref>::Target as Service<R>>::Response;
    type Error = <<T as Deref>::Target as Service<R>>::Error;

    fn call(&self, req: R) -> impl ServiceFuture<Self::Response, Self::Error> {
        (**self).call(req)
    }
}

pub trait MakeService<Target, Request> {
    type Service: Service<Request, Error: Into<crate::error::BoxError>> + Send;

    fn make_service(&self, target: Target) -> Self::Service;
}

/// Shares one service instance across every connection.
#[derive(Clone)]
#[repr(transparent)]
pub struct SharedService<S>(Arc<S>)
where
    S: Service<http::Request<hyper::body::Incoming>, Error: Error + Send + Sync + 'static> + Send;

impl<S> SharedService<S>
where
    S: Service<http::Request<hyper::body::Incoming>, Error: Error + Send + Sync + 'static> + Send,
{
    pub fn new(service: S) -> Self {
        Self(Arc::new(service))
    }
}

impl<S, Target> MakeService<Target, http::Request<hyper::body::Incoming>> for SharedService<S>
where
    S: Service<http::Request<hyper::body::Incoming>, Error: Error + Send + Sync + 'static> + Send,
{
    type Service = Arc<S>;

    fn make_service(&self, _target: Target) -> Self::Service {
        self.0.clone()
    }
}
