//! The event loop: one epoll instance multiplexing listeners, clients and CGI pipes.

use std::cmp::min;
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;

use crate::cgi::Spawner;
use crate::connection::{Connection, Next, Recv, Sent};
use crate::error::HttpError;
use crate::handler::{self, Outcome, Site};
use crate::request::ClientRequest;
use crate::response::Response;
use crate::table::ConnectionTable;

const MAX_EVENTS: usize = 4096;
const WAIT_TIMEOUT_MS: isize = 1000;
const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// An owned epoll instance. Event data is the registered fd.
#[derive(Debug)]
pub struct Poller {
    epoll: RawFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epoll = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("failed to create epoll instance")?;
        Ok(Self { epoll })
    }

    fn control(&self, op: EpollOp, fd: RawFd, flags: EpollFlags) -> Result<()> {
        let mut event = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epoll, op, fd, &mut event)
            .with_context(|| format!("epoll_ctl {:?} failed for fd {}", op, fd))
    }

    pub fn add(&self, fd: RawFd, flags: EpollFlags) -> Result<()> {
        self.control(EpollOp::EpollCtlAdd, fd, flags)
    }

    pub fn modify(&self, fd: RawFd, flags: EpollFlags) -> Result<()> {
        self.control(EpollOp::EpollCtlMod, fd, flags)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        epoll_ctl(self.epoll, EpollOp::EpollCtlDel, fd, None)
            .with_context(|| format!("failed to deregister fd {}", fd))
    }

    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: isize) -> nix::Result<usize> {
        epoll_wait(self.epoll, events, timeout_ms)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Err(e) = close(self.epoll) {
            warn!("failed to close epoll instance: {}", e);
        }
    }
}

/// Interest for a client socket.
pub fn client_interest(wants_read: bool, wants_write: bool) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if wants_read {
        flags |= EpollFlags::EPOLLIN;
    }
    if wants_write {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

pub struct Reactor {
    poller: Poller,
    /// Listener and the index of its server.
    listeners: HashMap<RawFd, (TcpListener, usize)>,
    table: ConnectionTable,
    site: Site,
    spawner: Box<dyn Spawner>,
    timeout: Duration,
    cleanup_interval: Duration,
    last_cleanup: Instant,
    /// Set from signal handlers to stop the loop.
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    /// `listeners` must be non-blocking.
    pub fn new(
        site: Site,
        listeners: Vec<(TcpListener, usize)>,
        spawner: Box<dyn Spawner>,
        timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let poller = Poller::new()?;
        let mut by_fd = HashMap::new();
        for (listener, server) in listeners {
            let fd = listener.as_raw_fd();
            poller.add(fd, EpollFlags::EPOLLIN)?;
            by_fd.insert(fd, (listener, server));
        }
        Ok(Self {
            poller,
            listeners: by_fd,
            table: ConnectionTable::default(),
            site,
            spawner,
            timeout,
            cleanup_interval: min(MAX_CLEANUP_INTERVAL, timeout),
            last_cleanup: Instant::now(),
            shutdown,
        })
    }

    /// Serve until the shutdown flag is raised.
    pub fn run(&mut self) -> Result<()> {
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        while !self.shutdown.load(Ordering::Relaxed) {
            let ready = match self.poller.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(ready) => ready,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => return Err(e).context("epoll_wait failed"),
            };
            for event in &events[..ready] {
                self.handle_event(event.data() as RawFd, event.events());
            }
            self.cleanup(Instant::now());
        }
        info!("shutting down");
        self.close_all();
        Ok(())
    }

    fn handle_event(&mut self, fd: RawFd, flags: EpollFlags) {
        trace!("fd {} is ready: {:?}", fd, flags);
        if self.listeners.contains_key(&fd) {
            self.accept(fd);
        } else if self.table.is_cgi(fd) {
            self.on_cgi_output(fd);
        } else if self.table.is_cgi_input(fd) {
            self.table.feed_cgi(&self.poller, fd);
        } else if self.table.contains(fd) {
            self.on_client(fd, flags);
        } else {
            // Closed earlier in this batch.
            trace!("ignoring event for closed fd {}", fd);
        }
    }

    fn accept(&mut self, listener_fd: RawFd) {
        let (listener, server) = match self.listeners.get(&listener_fd) {
            Some((listener, server)) => (listener, *server),
            None => return,
        };
        let max_body = self.site.config.servers[server].max_body;
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept() failed: {}", e);
                    break;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                warn!("failed to make connection from {} non-blocking: {}", peer, e);
                continue;
            }
            let conn = Connection::new(stream, peer, server, max_body);
            let fd = conn.fd();
            if let Err(e) = self.table.insert(&self.poller, conn) {
                warn!("dropping connection from {}: {:#}", peer, e);
                continue;
            }
            info!(
                "accepted connection {} from {} ({} open)",
                fd,
                peer,
                self.table.len()
            );
        }
    }

    fn on_client(&mut self, fd: RawFd, flags: EpollFlags) {
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            debug!("connection {} hung up", fd);
            self.close(fd);
            return;
        }
        if flags.contains(EpollFlags::EPOLLIN) {
            let received = match self.table.get_mut(fd) {
                Some(conn) => conn.poll_recv(Instant::now()),
                None => return,
            };
            if received == Recv::Closed {
                self.close(fd);
                return;
            }
        }
        self.advance(fd);
    }

    /// Write what can be written. Returns false if the connection was closed.
    fn flush(&mut self, fd: RawFd) -> bool {
        let sent = match self.table.get_mut(fd) {
            Some(conn) if conn.wants_write() => conn.poll_send(Instant::now()),
            Some(_) => return true,
            None => return false,
        };
        if sent == Sent::Close {
            self.close(fd);
            return false;
        }
        true
    }

    /// Write out queued bytes and handle every request that is already buffered.
    fn advance(&mut self, fd: RawFd) {
        loop {
            if !self.flush(fd) {
                return;
            }
            let next = match self.table.get_mut(fd) {
                Some(conn) if conn.wants_write() => break,
                Some(conn) => conn.next(),
                None => return,
            };
            match next {
                Next::Idle => {
                    let interim = self.table.get_mut(fd).map_or(false, |conn| conn.wants_write());
                    if !interim {
                        break;
                    }
                }
                Next::Request(request) => self.dispatch(fd, request),
                Next::Error(e) => self.reject(fd, e),
            }
        }
        if self.table.get_mut(fd).map_or(false, |conn| conn.is_finished()) {
            debug!("connection {} has nothing left to answer", fd);
            self.close(fd);
            return;
        }
        if let Err(e) = self.table.update_interest(&self.poller, fd) {
            error!("{:#}", e);
            self.close(fd);
        }
    }

    fn dispatch(&mut self, fd: RawFd, request: ClientRequest) {
        let (server, peer) = match self.table.get_mut(fd) {
            Some(conn) => (conn.server(), conn.peer()),
            None => return,
        };
        info!("{} {} {} from {}", fd, request.method, request.uri, peer);
        match handler::dispatch(&self.site, server, request, peer, self.spawner.as_ref()) {
            Outcome::Ready(response) => self.respond(fd, &response),
            Outcome::Cgi(unit) => {
                if let Err(e) = self.table.attach_cgi(&self.poller, unit) {
                    error!("{:#}", e);
                    let response = self.site.error_page(server, 500, "The script failed.");
                    self.respond(fd, &response);
                    return;
                }
                debug!("{} scripts running", self.table.cgi_len());
            }
        }
    }

    fn reject(&mut self, fd: RawFd, e: HttpError) {
        let server = match self.table.get_mut(fd) {
            Some(conn) => conn.server(),
            None => return,
        };
        warn!("bad request on connection {}: {}", fd, e);
        let response = self.site.error_page(server, e.status(), &e.to_string());
        self.respond(fd, &response);
    }

    fn respond(&mut self, fd: RawFd, response: &Response) {
        let result = match self.table.get_mut(fd) {
            Some(conn) => conn.respond(response, self.timeout, SystemTime::now()),
            None => return,
        };
        if let Err(e) = result {
            error!("{}", e);
            self.close(fd);
        }
    }

    fn on_cgi_output(&mut self, cgi_fd: RawFd) {
        let drained = match self.table.cgi_mut(cgi_fd) {
            Some(unit) => unit.drain(),
            None => return,
        };
        let finished = match drained {
            Ok(false) => return,
            Ok(true) => true,
            Err(e) => {
                error!("{:#}", e);
                false
            }
        };
        let unit = match self.table.take_cgi(&self.poller, cgi_fd) {
            Some(unit) => unit,
            None => return,
        };
        let fd = unit.conn_fd();
        let server = match self.table.get_mut(fd) {
            Some(conn) => conn.server(),
            None => return,
        };
        let result = if finished {
            unit.finish()
        } else {
            drop(unit);
            Err(anyhow::anyhow!("lost output of script for connection {}", fd))
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!("{:#}", e);
                self.site.error_page(server, 500, "The script failed.")
            }
        };
        self.respond(fd, &response);
        self.advance(fd);
    }

    /// Enforce the CGI deadline and the idle timeout.
    fn cleanup(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_cleanup) < self.cleanup_interval {
            return;
        }
        self.last_cleanup = now;

        for cgi_fd in self.table.expired_cgi(now) {
            let unit = match self.table.take_cgi(&self.poller, cgi_fd) {
                Some(unit) => unit,
                None => continue,
            };
            let fd = unit.conn_fd();
            warn!("script for connection {} timed out", fd);
            drop(unit);
            let server = match self.table.get_mut(fd) {
                Some(conn) => conn.server(),
                None => continue,
            };
            let response = self.site.error_page(server, 504, "The script took too long.");
            self.respond(fd, &response);
            self.advance(fd);
        }

        for fd in self.table.fds() {
            let conn = match self.table.get_mut(fd) {
                Some(conn) => conn,
                None => continue,
            };
            if conn.cgi_fd().is_some() || conn.idle_for(now) < self.timeout {
                continue;
            }
            if conn.is_waiting_for_client() {
                let response = self.site.error_page(
                    conn.server(),
                    408,
                    "The connection was idle for too long.",
                );
                if conn.respond_and_close(&response, SystemTime::now()).is_ok() {
                    let sent = conn.poll_send(now);
                    trace!("408 to connection {}: {:?}", fd, sent);
                }
            }
            debug!("connection {} timed out", fd);
            self.close(fd);
        }
    }

    fn close(&mut self, fd: RawFd) {
        if self.table.remove(&self.poller, fd) {
            debug!("closed connection {}", fd);
        }
    }

    fn close_all(&mut self) {
        self.table.clear(&self.poller);
        for (fd, _) in self.listeners.drain() {
            if let Err(e) = self.poller.delete(fd) {
                debug!("{:#}", e);
            }
        }
    }
}
