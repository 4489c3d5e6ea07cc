//! Server configuration: bind address, worker topology, and per-request limits.
//!
//! # Memory Consumption
//!
//! Each worker thread owns one fixed-size read buffer and one fixed-size
//! response body buffer, both sized from [`ReqLimits`] and [`RespLimits`].
//! No further allocation happens once workers are spawned.
//!
//! # Examples
//!
//! ```no_run
//! # nimbus_http::impt_default_handler!{MyHandler}
//! use nimbus_http::{Server, limits::{Config, ConnLimits, ReqLimits}};
//!
//! fn main() -> std::io::Result<()> {
//!     Server::builder()
//!         .config(Config {
//!             worker_count: 8,
//!             ..Config::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 32,
//!             ..ReqLimits::default()
//!         })
//!         .handler(MyHandler)
//!         .build()?
//!         .launch()
//! }
//! ```

use std::time::Duration;

/// Server topology: bind address, worker and accept-thread counts, stack size.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listening socket binds to (default: `0.0.0.0`).
    pub bind_addr: [u8; 4],
    /// TCP port the listening socket binds to (default: `8080`).
    pub port: u16,

    /// Number of HTTP worker threads (default: the number of available CPUs).
    ///
    /// Each worker owns its own [multiplexer](crate::Method), [`Request`
    /// ](crate::Request) and [`Response`](crate::Response), and a disjoint
    /// set of connected sockets — there is no work-stealing between workers.
    pub worker_count: usize,

    /// Number of threads calling `accept()` on the listening socket (default: `1`).
    pub accept_thread_count: usize,

    /// Stack size allocated to each spawned thread, in bytes (default: `2 MiB`).
    pub worker_stack_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: [0, 0, 0, 0],
            port: 8080,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            accept_thread_count: 1,
            worker_stack_size: 2 * 1024 * 1024,
            _priv: (),
        }
    }
}

/// Connection-level limits and timeouts applied by the acceptor to each accepted socket.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// `SO_SNDTIMEO` applied to accepted sockets (default: `2.5 seconds`).
    pub socket_send_timeout: Duration,
    /// `SO_RCVTIMEO` applied to accepted sockets (default: `10,000 seconds`).
    ///
    /// Deliberately large — idle connections are bounded by keep-alive
    /// accounting, not by the receive timeout.
    pub socket_recv_timeout: Duration,

    /// Maximum number of requests allowed per connection before it is closed
    /// regardless of keep-alive intent (default: `65535`).
    pub max_requests_per_connection: usize,

    /// Poll timeout passed to the worker's multiplexer `wait` call (default: `50ms`).
    ///
    /// Bounds how promptly the shutdown flag is re-checked between events.
    pub poll_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_send_timeout: Duration::from_millis(2500),
            socket_recv_timeout: Duration::from_secs(10_000),
            max_requests_per_connection: 65535,
            poll_timeout: Duration::from_millis(50),
            _priv: (),
        }
    }
}

/// HTTP request parsing limits and read-buffer pre-allocation strategy.
///
/// Request bodies are never parsed by this crate (see the crate-level
/// Non-goals) — these limits bound only the request line and headers.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum combined length of path + query string, in bytes (default: `256`).
    pub url_size: usize,
    /// Maximum number of `key=value` pairs a query string may contain (default: `8`).
    pub url_query_parts: usize,

    /// Maximum number of headers per request (default: `32`).
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64`).
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `256`).
    pub header_value_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 256,
            url_query_parts: 8,

            header_count: 32,
            header_name_size: 64,
            header_value_size: 256,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the estimated size, in bytes, of the per-worker read buffer
    /// these limits require. Rounded up to the next power of two and padded
    /// to a 16-byte boundary so SIMD line scans never read out of bounds
    /// (see [the line reader](crate::http::request)).
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        let raw = self.precalc.first_line + self.header_count * self.precalc.h_line + 2;
        self.precalc.buffer = raw.next_power_of_two().max(16);

        self
    }

    #[inline(always)]
    // CONNECT /url/test HTTP/1.1\r\n
    // Formula: Method(7) + " " + url_size + " " + Version(8) + "\r\n"
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    // Authorization: Sample%20Data\r\n
    // Formula: Name + ": " + Value + "\r\n"
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    pub(crate) h_line: usize,
}

/// Response buffer allocation limits.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity allocated for the header-serialisation buffer (default: `1024 B`).
    pub default_capacity: usize,
    /// Maximum capacity the header buffer is allowed to retain between
    /// requests before it is reallocated down to `default_capacity` (default: `8192 B`).
    pub max_capacity: usize,

    /// Capacity of the pre-allocated response body buffer (default: `16 KiB`).
    ///
    /// Writing a body larger than this fails with `ResponseBodyBufferTooSmall`.
    pub body_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,
            body_capacity: 16 * 1024,
            _priv: (),
        }
    }
}

/// WebSocket frame buffer limits, applied by the dedicated frame event loop.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Capacity of each connection's pre-allocated frame payload buffer, in
    /// bytes (default: `64 KiB`). A frame whose declared length exceeds this
    /// fails with `PayloadLargerThanBuffer`.
    pub frame_payload_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            frame_payload_capacity: 64 * 1024,
            _priv: (),
        }
    }
}
