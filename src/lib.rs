extern crate tracing as log;

pub mod announce;
pub mod body;
pub mod error;
pub mod exchange;
pub mod mux;
pub mod pattern;
pub mod proxy;
pub mod record;
pub mod serve;
pub mod service;
pub mod store;

pub type Request = http::Request<body::Body>;
pub type Response = http::Response<body::Body>;

pub use crate::announce::Announcer;
pub use crate::error::Error;
pub use crate::exchange::Exchange;
pub use crate::mux::ExchangeMux;
pub use crate::proxy::ProxyService;
pub use crate::record::{Routes, ServiceRecord};
pub use crate::service::Service;
pub use crate::store::Store;
