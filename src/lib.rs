//! nimbus_http - Zero-allocation, thread-per-worker HTTP/1.1 server core
//!
//! A performance-oriented HTTP server built on an OS-thread-per-worker
//! model with non-blocking sockets multiplexed via `epoll`/`kqueue`
//! (through [`mio`](https://crates.io/crates/mio)). Designed for
//! services requiring fine-grained control over memory and connection
//! handling without pulling in an async runtime.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, WebSocket upgrade
//! - **HTTP/1.0**: basic protocol support for legacy clients
//!
//! # Features
//!
//! ## Performance & Memory
//! - **Zero-allocation steady state** - each connection gets one read buffer
//!   and one request, allocated on accept and reused for every request on
//!   that connection; each worker reuses a single response buffer in turn.
//! - **Round-robin connection dispatch** - a fixed pool of worker threads,
//!   no work-stealing, no per-request thread spawn.
//!
//! ## Protocol & Management
//! - **WebSocket upgrade** - `Sec-WebSocket-Accept` handshake and a masked
//!   frame reader/writer, handed off to a dedicated event loop.
//! - **Graceful shutdown** - `SIGINT`/`SIGTERM` drain in-flight connections
//!   before the process exits.
//!
//! ## Production Ready
//! - **Fully configurable limits and timeouts** for requests, responses, and connections.
//! - **Resource protection** - automatic closure of connections exceeding set limits;
//!   transport and parse errors close the offending connection locally and never
//!   reach the client as a response body.
//!
//! # Quick Start
//!
//! ```no_run
//! use nimbus_http::{Server, Handler, Request, Response, Handled, StatusCode};
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     fn handle(&self, _req: &Request, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     Server::builder()
//!         .handler(MyHandler)
//!         .build()?
//!         .launch()
//! }
//! ```
//!
//! # Use Cases
//!
//! - **High-throughput microservices** - configurable for specific workloads
//! - **Resource-constrained environments** - predictable memory usage
//! - **Internal APIs** - security-conscious defaults
//! - **Real-time APIs** - WebSocket upgrade from the same worker pool
pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod net {
    pub(crate) mod mux;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod connection;
}
/// WebSocket upgrade and framing, handed off from an HTTP handler.
pub mod ws {
    pub(crate) mod event_loop;
    pub mod frame;
    pub mod handshake;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    server::acceptor::{Handler, Server, ServerBuilder},
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    f(
        &Request::new(&crate::limits::ReqLimits::default()),
        &mut Response::new(&crate::limits::RespLimits::default()),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use nimbus_http::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        impl Handler for $name {
            fn handle(&self, _req: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
