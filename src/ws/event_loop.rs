//! Dedicated event loop draining connections handed off by HTTP workers
//! after a successful upgrade.

use crate::{
    limits::WsLimits,
    net::mux::Multiplexer,
    ws::frame::{write_message, ConnId, Frame, FrameReader, OpCode, WsHandler},
};
use crossbeam::channel::Receiver;
use mio::{net::TcpStream, Token};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

struct Conn {
    stream: TcpStream,
    reader: FrameReader,
    frame: Frame,
    id: ConnId,
}

/// Drains `rx` for newly upgraded sockets and services them until
/// `shutdown` is set and every connection has closed.
pub(crate) fn run(
    rx: Receiver<TcpStream>,
    handler: Option<Arc<dyn WsHandler>>,
    limits: WsLimits,
    poll_timeout: Duration,
    shutdown: &AtomicBool,
) {
    let mut mux = match Multiplexer::new(1024) {
        Ok(m) => m,
        Err(e) => {
            log::error!("websocket event loop failed to start: {e}");
            return;
        }
    };

    let mut conns: HashMap<Token, Conn> = HashMap::new();
    let mut next_token = 0usize;
    let mut next_id = 0usize;

    loop {
        while let Ok(mut stream) = rx.try_recv() {
            let token = Token(next_token);
            next_token = next_token.wrapping_add(1);
            let id = ConnId(next_id);
            next_id = next_id.wrapping_add(1);

            if let Err(e) = mux.add(&mut stream, token) {
                log::warn!("failed to register websocket connection: {e}");
                continue;
            }
            if let Some(h) = &handler {
                h.on_conn(id);
            }
            conns.insert(
                token,
                Conn {
                    stream,
                    reader: FrameReader::new(),
                    frame: Frame::new(&limits),
                    id,
                },
            );
        }

        if shutdown.load(Ordering::Relaxed) && conns.is_empty() {
            return;
        }

        if let Err(e) = mux.wait(poll_timeout) {
            log::warn!("websocket multiplexer wait failed: {e}");
            continue;
        }

        let ready: Vec<Token> = mux.ready_tokens().collect();
        for token in ready {
            process_one(token, &mut conns, &mut mux, &handler, &limits);
        }
    }
}

fn process_one(
    token: Token,
    conns: &mut HashMap<Token, Conn>,
    mux: &mut Multiplexer,
    handler: &Option<Arc<dyn WsHandler>>,
    limits: &WsLimits,
) {
    let Some(conn) = conns.get_mut(&token) else {
        return;
    };

    match conn.reader.read_frame(&mut conn.stream, &mut conn.frame, limits) {
        Ok(true) => match conn.frame.opcode() {
            OpCode::Ping => {
                let payload = conn.frame.payload().to_vec();
                let _ = write_message(&mut conn.stream, OpCode::Pong, &payload);
            }
            OpCode::Close => close_conn(token, conns, mux, handler),
            _ => {
                if let Some(h) = handler {
                    h.on_frame(conn.id, &conn.frame);
                }
            }
        },
        Ok(false) => {}
        Err(_) => close_conn(token, conns, mux, handler),
    }
}

fn close_conn(
    token: Token,
    conns: &mut HashMap<Token, Conn>,
    mux: &mut Multiplexer,
    handler: &Option<Arc<dyn WsHandler>>,
) {
    if let Some(mut conn) = conns.remove(&token) {
        let _ = mux.remove(&mut conn.stream);
        if let Some(h) = handler {
            h.on_disconn(conn.id);
        }
    }
}
