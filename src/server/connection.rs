//! The per-thread HTTP worker loop: one [`Multiplexer`] and one shared
//! response buffer for the thread's lifetime, plus a read buffer and
//! request per connection so a request split across readiness events
//! resumes instead of restarting.

use crate::{
    errors::ErrorKind,
    http::{
        request::{read_request, ReadOutcome, ReadProgress, Reader, Request},
        response::Response,
        types::Version,
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    net::mux::Multiplexer,
    server::acceptor::Handler,
};
use crossbeam::channel::{Receiver, Sender};
use mio::{net::TcpStream, Token};
use std::{
    collections::HashMap,
    io::{self, IoSlice, Write},
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::Duration,
};

/// One dispatched socket plus the parse state it's accumulated so far.
///
/// Parsing a request can span several non-blocking readiness events — the
/// reader and the request it's filling in have to survive between them, so
/// they live here instead of in a pair of fields shared across every
/// connection the worker owns.
struct Conn {
    stream: TcpStream,
    reader: Reader,
    request: Request,
    progress: ReadProgress,
}

/// Owns every socket dispatched to this worker and drives each one through
/// read → handle → write on its own thread, never touching a socket another
/// worker owns.
pub(crate) struct HttpWorker<H: Handler> {
    handler: Arc<H>,

    response: Response,

    mux: Multiplexer,
    conns: HashMap<Token, Conn>,
    counters: HashMap<Token, usize>,
    next_token: usize,

    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,

    ws_handoff: Sender<TcpStream>,
}

impl<H: Handler> HttpWorker<H> {
    #[inline]
    pub(crate) fn new(
        handler: Arc<H>,
        conn_limits: ConnLimits,
        req_limits: ReqLimits,
        resp_limits: RespLimits,
        event_capacity: usize,
        ws_handoff: Sender<TcpStream>,
    ) -> io::Result<Self> {
        Ok(Self {
            handler,

            response: Response::new(&resp_limits),

            mux: Multiplexer::new(event_capacity)?,
            conns: HashMap::new(),
            counters: HashMap::new(),
            next_token: 0,

            conn_limits,
            req_limits,
            resp_limits,

            ws_handoff,
        })
    }

    /// Drains `conn_rx` for newly dispatched sockets, polls for readiness,
    /// and processes every ready connection, until `shutdown` is set and
    /// every owned connection has drained.
    pub(crate) fn run(&mut self, conn_rx: &Receiver<TcpStream>, shutdown: &AtomicBool) {
        loop {
            while let Ok(stream) = conn_rx.try_recv() {
                self.register(stream);
            }

            if shutdown.load(Ordering::Relaxed) && self.conns.is_empty() {
                return;
            }

            if let Err(e) = self.mux.wait(self.conn_limits.poll_timeout) {
                log::warn!("worker multiplexer wait failed: {e}");
                continue;
            }

            let ready: Vec<Token> = self.mux.ready_tokens().collect();
            for token in ready {
                self.process_one(token);
            }
        }
    }

    fn register(&mut self, mut stream: TcpStream) {
        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);

        if let Err(e) = self.mux.add(&mut stream, token) {
            log::warn!("failed to register connection: {e}");
            return;
        }

        let conn = Conn {
            stream,
            reader: Reader::new(&self.req_limits),
            request: Request::new(&self.req_limits),
            progress: ReadProgress::RequestLine,
        };
        self.conns.insert(token, conn);
        self.counters.insert(token, 0);
    }

    /// Runs one read → handle → write cycle for `token`. Removes the
    /// connection from the multiplexer unless the cycle ends in keep-alive.
    fn process_one(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };

        let outcome = read_request(
            &mut conn.reader,
            &mut conn.stream,
            &mut conn.request,
            &mut conn.progress,
            &self.req_limits,
        );

        match outcome {
            Ok(ReadOutcome::Pending) => {
                // Request line or headers not fully in yet — keep the
                // buffered bytes and progress, and wait for the next
                // readiness event instead of tearing the connection down.
                self.conns.insert(token, conn);
                return;
            }
            Ok(ReadOutcome::Closed) => {
                let _ = self.mux.remove(&mut conn.stream);
                self.counters.remove(&token);
                return;
            }
            Err(err) => {
                log::warn!("dropping connection after parse error: {err}");
                let _ = self.mux.remove(&mut conn.stream);
                self.counters.remove(&token);
                return;
            }
            Ok(ReadOutcome::Complete) => {}
        }

        self.response.reset(&self.resp_limits);
        apply_keep_alive_default(&conn.request, &mut self.response);

        let _handled = self.handler.handle(&conn.request, &mut self.response);

        if self.response.check_body_capacity(&self.resp_limits).is_err() {
            log::warn!("dropping connection: response body exceeds buffer capacity");
            let _ = self.mux.remove(&mut conn.stream);
            self.counters.remove(&token);
            return;
        }

        let count = self.counters.entry(token).or_insert(0);
        *count += 1;
        // Force-closes one request short of the hard cap, leaving headroom
        // so the final in-flight response is never the one that trips it.
        if *count >= self.conn_limits.max_requests_per_connection.saturating_sub(1) {
            self.response.close();
        }

        let segments = [
            self.response.header_buf(),
            self.response.length_header(),
            self.response.connection_disposition(),
            self.response.body_buf(),
        ];

        if write_gathered(&mut conn.stream, &segments).is_err() {
            let _ = self.mux.remove(&mut conn.stream);
            self.counters.remove(&token);
            return;
        }

        if self.response.is_ws_upgrade() {
            let _ = self.mux.remove(&mut conn.stream);
            self.counters.remove(&token);
            let _ = self.ws_handoff.send(conn.stream);
            return;
        }

        if !self.response.keep_alive {
            let _ = self.mux.remove(&mut conn.stream);
            self.counters.remove(&token);
            return;
        }

        conn.reader.reset();
        conn.request.reset();
        conn.progress = ReadProgress::RequestLine;
        self.conns.insert(token, conn);
    }
}

/// Sets the response's default keep-alive per the request version — HTTP/1.1
/// defaults open, HTTP/1.0 defaults closed — then lets an explicit
/// `Connection` header override that default. Runs before the handler, so
/// a handler that calls [`Response::close`](crate::Response::close) always
/// has the last word.
fn apply_keep_alive_default(request: &Request, response: &mut Response) {
    response.keep_alive = request.version() == Version::Http11;

    match request.header(b"connection") {
        Some(v) if v.eq_ignore_ascii_case(b"close") => response.keep_alive = false,
        Some(v) if v.eq_ignore_ascii_case(b"keep-alive") => response.keep_alive = true,
        _ => {}
    }
}

/// Writes up to four segments (status+headers, an optional explicit
/// `content-length: 0`, the connection-disposition literal, and the body)
/// in one `writev` call, retrying on short writes and `EINTR`/`WouldBlock`.
fn write_gathered(stream: &mut TcpStream, segments: &[&[u8]; 4]) -> Result<(), ErrorKind> {
    let mut bufs: Vec<IoSlice> = segments.iter().filter(|s| !s.is_empty()).map(|s| IoSlice::new(s)).collect();
    let mut bufs = &mut bufs[..];

    while !bufs.is_empty() {
        match stream.write_vectored(bufs) {
            Ok(0) => return Err(ErrorKind::PartialWrite),
            Ok(n) => IoSlice::advance_slices(&mut bufs, n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(ErrorKind::from(e)),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{limits::ReqLimits, Handled, StatusCode};
    use crossbeam::channel::unbounded;
    use mio::net::{TcpListener, TcpStream as MioTcpStream};
    use std::{
        io::Read,
        net::TcpStream as StdTcpStream,
        thread,
        time::Duration,
    };

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
            resp.status(StatusCode::Ok)
                .header("x-path", req.url().path())
                .body("ok")
        }
    }

    fn connected_pair() -> (MioTcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || StdTcpStream::connect(addr).unwrap());
        let (server, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("{e}"),
            }
        };

        (server, client.join().unwrap())
    }

    #[test]
    fn keep_alive_default_follows_version_then_header_override() {
        let limits = ReqLimits::default().precalculate();
        let resp_limits = RespLimits::default();

        let cases = [
            ("GET / HTTP/1.1\r\n\r\n", true),
            ("GET / HTTP/1.0\r\n\r\n", false),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", true),
            ("GET / HTTP/1.1\r\nConnection: Close\r\n\r\n", false),
        ];

        for (raw, expected) in cases {
            let request = crate::http::request::test_parse_buffered(&limits, raw).unwrap();
            let mut response = Response::new(&resp_limits);
            apply_keep_alive_default(&request, &mut response);
            assert_eq!(response.keep_alive, expected, "{raw:?}");
        }
    }

    #[test]
    fn writes_a_complete_response_on_the_wire() {
        let (mut server, mut client) = connected_pair();
        client.write_all(b"GET /hi HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        let req_limits = ReqLimits::default().precalculate();
        let resp_limits = RespLimits::default();
        let (tx, _rx) = unbounded();

        let mut worker = HttpWorker::new(
            Arc::new(Echo),
            ConnLimits::default(),
            req_limits.clone(),
            resp_limits,
            8,
            tx,
        )
        .unwrap();

        let mut reader = Reader::new(&req_limits);
        let mut request = Request::new(&req_limits);
        let mut response = Response::new(&RespLimits::default());
        let mut progress = ReadProgress::RequestLine;

        loop {
            match read_request(&mut reader, &mut server, &mut request, &mut progress, &req_limits)
                .unwrap()
            {
                ReadOutcome::Complete => break,
                ReadOutcome::Pending => continue,
                ReadOutcome::Closed => panic!("connection closed before a request arrived"),
            }
        }
        worker.handler.handle(&request, &mut response);

        let segments = [
            response.header_buf(),
            response.length_header(),
            response.connection_disposition(),
            response.body_buf(),
        ];
        write_gathered(&mut server, &segments).unwrap();

        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("x-path: /hi\r\n"));
        assert!(text.ends_with("ok"));
    }

    #[test]
    fn resumes_a_request_split_across_readiness_events() {
        let (server, mut client) = connected_pair();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        let req_limits = ReqLimits::default().precalculate();
        let resp_limits = RespLimits::default();
        let (tx, _rx) = unbounded();

        let mut worker = HttpWorker::new(
            Arc::new(Echo),
            ConnLimits::default(),
            req_limits,
            resp_limits,
            8,
            tx,
        )
        .unwrap();

        worker.register(server);
        let token = Token(0);

        // Only the request line lands on the first readiness event — the
        // worker must hold the connection open and wait for the rest
        // instead of treating the still-missing headers as an error.
        client.write_all(b"GET /hi HTTP/1.1\r\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        worker.process_one(token);

        let conn = worker
            .conns
            .get(&token)
            .expect("connection must stay registered while headers are still pending");
        assert_eq!(conn.progress, ReadProgress::Headers);
        assert_eq!(crate::tools::str_op(conn.request.url().path()), "/hi");

        client.write_all(b"Host: x\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        worker.process_one(token);

        assert!(
            worker.conns.contains_key(&token),
            "a completed keep-alive request should remain registered"
        );

        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("x-path: /hi\r\n"));
    }
}
