use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::socket;
use thiserror::Error;

use crate::codec::{Progress, RequestReader};
use crate::error::HttpError;
use crate::request::ClientRequest;
use crate::response::{Response, CONTINUE};

/// Requests served on one connection before it is closed.
pub const MAX_REQUESTS: usize = 100;

const RECV_BUFFER_SIZE: usize = 1 << 15;

#[derive(Debug, Error)]
#[error("connection {fd} already has a response pending")]
pub struct ResponsePending {
    pub fd: RawFd,
}

/// Outcome of reading from the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv {
    Open,
    /// The peer is done sending. Requests already buffered are still answered.
    Eof,
    /// The socket failed.
    Closed,
}

/// What the connection needs from the server next.
#[derive(Debug, PartialEq, Eq)]
pub enum Next {
    /// Nothing until more bytes arrive or the pending response is written.
    Idle,
    Request(ClientRequest),
    /// The request could not be read; the connection closes after the error response.
    Error(HttpError),
}

/// Outcome of writing to the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum Sent {
    /// Bytes remain in the write buffer.
    Partial,
    /// The response went out and the connection is ready for the next request.
    Drained,
    /// The connection is finished.
    Close,
}

/// One client socket and the request/response exchange running on it.
#[derive(Debug)]
pub struct Connection {
    socket: TcpStream,
    peer: SocketAddr,
    /// Index of the server whose listener accepted the connection.
    server: usize,
    last_active: Instant,
    reader: RequestReader,
    write_buf: Vec<u8>,
    write_pos: usize,
    /// A response (final or interim) is queued and not fully written.
    pending: bool,
    /// The queued response is `100 Continue`.
    interim: bool,
    /// A request was handed out and its response has not been prepared yet.
    in_flight: bool,
    requests_served: usize,
    keep_alive: bool,
    close_after_write: bool,
    /// The peer shut down its sending side.
    read_closed: bool,
    cgi_fd: Option<RawFd>,
}

impl Connection {
    pub fn new(socket: TcpStream, peer: SocketAddr, server: usize, max_body: usize) -> Self {
        let fd = socket.as_raw_fd();
        Self {
            socket,
            peer,
            server,
            last_active: Instant::now(),
            reader: RequestReader::new(max_body, fd),
            write_buf: Vec::new(),
            write_pos: 0,
            pending: false,
            interim: false,
            in_flight: false,
            requests_served: 0,
            keep_alive: false,
            close_after_write: false,
            read_closed: false,
            cgi_fd: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn server(&self) -> usize {
        self.server
    }

    pub fn cgi_fd(&self) -> Option<RawFd> {
        self.cgi_fd
    }

    pub fn set_cgi_fd(&mut self, cgi_fd: Option<RawFd>) {
        self.cgi_fd = cgi_fd;
    }

    pub fn wants_read(&self) -> bool {
        !self.read_closed
    }

    pub fn wants_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }

    /// Whether the idle sweep may answer this connection with `408`.
    pub fn is_waiting_for_client(&self) -> bool {
        !self.pending && !self.in_flight && self.cgi_fd.is_none()
    }

    /// The peer stopped sending and everything it asked for has been answered.
    pub fn is_finished(&self) -> bool {
        self.read_closed && self.is_waiting_for_client()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    /// Receiving request bytes.
    pub fn poll_recv(&mut self, now: Instant) -> Recv {
        let mut buf = [0; RECV_BUFFER_SIZE];
        loop {
            match socket::recv(self.fd(), &mut buf, socket::MsgFlags::empty()) {
                Ok(0) => {
                    debug!(
                        "connection {} shut down by {} with {} bytes buffered",
                        self.fd(),
                        self.peer,
                        self.reader.buffered()
                    );
                    self.read_closed = true;
                    return Recv::Eof;
                }
                Ok(received) => {
                    trace!("connection {} received {} bytes", self.fd(), received);
                    self.last_active = now;
                    self.reader.feed(&buf[..received]);
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Recv::Open,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => {
                    debug!("connection {} failed to receive: {}", self.fd(), e);
                    return Recv::Closed;
                }
            }
        }
    }

    /// Advance the request reader unless a request is already being answered.
    pub fn next(&mut self) -> Next {
        if self.pending || self.in_flight || self.cgi_fd.is_some() {
            return Next::Idle;
        }
        match self.reader.poll() {
            Ok(Progress::Incomplete) => Next::Idle,
            Ok(Progress::SendContinue) => {
                self.queue(CONTINUE.to_vec());
                self.interim = true;
                Next::Idle
            }
            Ok(Progress::Complete(request)) => {
                self.in_flight = true;
                self.keep_alive = request.wants_keep_alive();
                debug!(
                    "connection {}: {} {} {}{}",
                    self.fd(),
                    request.method,
                    request.uri,
                    request.version.as_str(),
                    if request.chunked { " (chunked body)" } else { "" }
                );
                Next::Request(request)
            }
            Err(e) => {
                self.in_flight = true;
                self.close_after_write = true;
                Next::Error(e)
            }
        }
    }

    fn queue(&mut self, bytes: Vec<u8>) {
        self.write_buf = bytes;
        self.write_pos = 0;
        self.pending = true;
    }

    /// Queue the response to the current request.
    pub fn respond(
        &mut self,
        response: &Response,
        timeout: Duration,
        now: SystemTime,
    ) -> Result<(), ResponsePending> {
        if self.pending {
            return Err(ResponsePending { fd: self.fd() });
        }
        let nothing_more = self.read_closed && self.reader.buffered() == 0;
        if !self.keep_alive || self.requests_served + 1 >= MAX_REQUESTS || nothing_more {
            self.close_after_write = true;
        }
        let keep_alive = if self.close_after_write {
            None
        } else {
            Some(timeout)
        };
        debug!(
            "connection {}: {} ({} byte body)",
            self.fd(),
            response.status,
            response.body.len()
        );
        self.queue(response.serialize(now, keep_alive));
        self.in_flight = false;
        self.last_active = Instant::now();
        Ok(())
    }

    /// Answer with a final response and close afterwards, whatever the client asked for.
    pub fn respond_and_close(
        &mut self,
        response: &Response,
        now: SystemTime,
    ) -> Result<(), ResponsePending> {
        self.close_after_write = true;
        self.respond(response, Duration::from_secs(0), now)
    }

    /// Sending the queued response.
    pub fn poll_send(&mut self, now: Instant) -> Sent {
        while self.wants_write() {
            match socket::send(
                self.fd(),
                &self.write_buf[self.write_pos..],
                socket::MsgFlags::empty(),
            ) {
                Ok(sent) if sent > 0 => {
                    self.write_pos += sent;
                    self.last_active = now;
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Sent::Partial,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                _ => {
                    debug!("connection {} failed to send", self.fd());
                    return Sent::Close;
                }
            }
        }
        if !self.pending {
            return Sent::Drained;
        }

        self.write_buf = Vec::new();
        self.write_pos = 0;
        self.pending = false;
        if self.interim {
            self.interim = false;
            self.reader.continue_sent();
            return Sent::Drained;
        }

        self.requests_served += 1;
        if self.close_after_write {
            return Sent::Close;
        }
        self.recycle();
        Sent::Drained
    }

    /// Recycle a finished exchange for HTTP keep-alive, keeping pipelined bytes.
    fn recycle(&mut self) {
        trace!(
            "connection {} recycled in {:?} with {} bytes buffered",
            self.fd(),
            self.reader.state(),
            self.reader.buffered()
        );
        self.reader.reset();
        self.keep_alive = false;
        self.close_after_write = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::sleep;

    use crate::request::Method;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (socket, peer) = listener.accept().unwrap();
        socket.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (Connection::new(socket, peer, 0, 1024), client)
    }

    /// Read from the socket until the connection has something to report.
    fn next(conn: &mut Connection) -> Next {
        for _ in 0..500 {
            assert_eq!(conn.poll_recv(Instant::now()), Recv::Open);
            match conn.next() {
                Next::Idle => sleep(Duration::from_millis(10)),
                next => return next,
            }
        }
        panic!("no request arrived");
    }

    fn request(conn: &mut Connection) -> ClientRequest {
        match next(conn) {
            Next::Request(request) => request,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    fn read_response(client: &mut TcpStream) -> String {
        let mut buf = [0; 4096];
        let n = client.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    fn ok() -> Response {
        Response::new(200).with_body(b"ok".to_vec())
    }

    #[test]
    fn serves_pipelined_requests() {
        let (mut conn, mut client) = pair();
        client
            .write_all(
                b"GET /one HTTP/1.1\r\nHost: x\r\n\r\n\
                GET /two HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .unwrap();

        assert_eq!(request(&mut conn).path, "/one");
        assert_eq!(conn.next(), Next::Idle);
        conn.respond(&ok(), TIMEOUT, SystemTime::now()).unwrap();
        assert!(conn.wants_write());
        assert_eq!(conn.poll_send(Instant::now()), Sent::Drained);
        let first = read_response(&mut client);
        assert!(first.contains("Keep-Alive: timeout=30\r\n"), "{}", first);

        match conn.next() {
            Next::Request(request) => assert_eq!(request.path, "/two"),
            other => panic!("unexpected {:?}", other),
        }
        conn.respond(&ok(), TIMEOUT, SystemTime::now()).unwrap();
        assert_eq!(conn.poll_send(Instant::now()), Sent::Close);
        assert!(read_response(&mut client).contains("Connection: close\r\n"));
    }

    #[test]
    fn http_10_closes_by_default() {
        let (mut conn, mut client) = pair();
        client.write_all(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").unwrap();
        request(&mut conn);
        conn.respond(&ok(), TIMEOUT, SystemTime::now()).unwrap();
        assert_eq!(conn.poll_send(Instant::now()), Sent::Close);
    }

    #[test]
    fn request_budget_closes() {
        let (mut conn, mut client) = pair();
        conn.requests_served = MAX_REQUESTS - 1;
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        request(&mut conn);
        conn.respond(&ok(), TIMEOUT, SystemTime::now()).unwrap();
        assert_eq!(conn.poll_send(Instant::now()), Sent::Close);
        assert!(read_response(&mut client).contains("Connection: close\r\n"));
    }

    #[test]
    fn second_response_is_refused() {
        let (mut conn, mut client) = pair();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        request(&mut conn);
        conn.respond(&ok(), TIMEOUT, SystemTime::now()).unwrap();
        assert!(conn.respond(&ok(), TIMEOUT, SystemTime::now()).is_err());
    }

    #[test]
    fn protocol_error_closes() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2048\r\n\r\n")
            .unwrap();
        assert_eq!(next(&mut conn), Next::Error(HttpError::BodyTooLarge { limit: 1024 }));
        conn.respond(&Response::new(413), TIMEOUT, SystemTime::now())
            .unwrap();
        assert_eq!(conn.poll_send(Instant::now()), Sent::Close);
        assert!(read_response(&mut client).starts_with("HTTP/1.1 413 Content Too Large\r\n"));
    }

    #[test]
    fn sends_continue_before_body() {
        let (mut conn, mut client) = pair();
        client
            .write_all(
                b"POST /up HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\n\
                Transfer-Encoding: chunked\r\n\r\n",
            )
            .unwrap();
        for _ in 0..500 {
            conn.poll_recv(Instant::now());
            if conn.next() == Next::Idle && conn.wants_write() {
                break;
            }
            sleep(Duration::from_millis(10));
        }
        assert_eq!(conn.poll_send(Instant::now()), Sent::Drained);
        assert_eq!(read_response(&mut client), "HTTP/1.1 100 Continue\r\n\r\n");

        client.write_all(b"4\r\nWiki\r\n0\r\n\r\n").unwrap();
        let request = request(&mut conn);
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.body, b"Wiki");
    }

    /// Read until the peer's shutdown shows up.
    fn recv_until_eof(conn: &mut Connection) {
        for _ in 0..500 {
            if conn.poll_recv(Instant::now()) == Recv::Eof {
                return;
            }
            sleep(Duration::from_millis(10));
        }
        panic!("peer shutdown never arrived");
    }

    #[test]
    fn peer_close_is_reported() {
        let (mut conn, client) = pair();
        drop(client);
        recv_until_eof(&mut conn);
        assert!(!conn.wants_read());
        assert_eq!(conn.next(), Next::Idle);
        assert!(conn.is_finished());
    }

    #[test]
    fn answers_request_sent_before_shutdown() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET /last HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        recv_until_eof(&mut conn);
        assert!(!conn.is_finished());
        match conn.next() {
            Next::Request(request) => assert_eq!(request.path, "/last"),
            other => panic!("unexpected {:?}", other),
        }
        conn.respond(&ok(), TIMEOUT, SystemTime::now()).unwrap();
        assert_eq!(conn.poll_send(Instant::now()), Sent::Close);
        assert!(read_response(&mut client).contains("Connection: close\r\n"));
    }

    #[test]
    fn idle_time() {
        let (conn, _client) = pair();
        assert!(conn.is_waiting_for_client());
        assert!(conn.idle_for(Instant::now() + Duration::from_secs(5)) >= Duration::from_secs(5));
    }
}
