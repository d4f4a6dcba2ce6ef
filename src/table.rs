//! Ownership of every client connection and running script, keyed by fd.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::sys::epoll::EpollFlags;

use crate::cgi::CgiUnit;
use crate::connection::Connection;
use crate::reactor::{client_interest, Poller};

#[derive(Debug)]
struct Entry {
    conn: Connection,
    /// What the fd is currently registered for.
    interest: EpollFlags,
}

/// The single place where connections and CGI units are torn down. Removing an entry deregisters
/// its fd before the fd is closed.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<RawFd, Entry>,
    /// Keyed by the script's stdout.
    cgi: HashMap<RawFd, CgiUnit>,
    /// Stdin of scripts still being fed their body, to their stdout.
    inputs: HashMap<RawFd, RawFd>,
}

/// Stop watching a script's stdin, then close it.
fn release_input(poller: &Poller, inputs: &mut HashMap<RawFd, RawFd>, unit: &mut CgiUnit) {
    if let Some(input_fd) = unit.input_fd() {
        if inputs.remove(&input_fd).is_some() {
            if let Err(e) = poller.delete(input_fd) {
                warn!("{:#}", e);
            }
        }
        unit.close_input();
    }
}

impl ConnectionTable {
    pub fn insert(&mut self, poller: &Poller, conn: Connection) -> Result<()> {
        let fd = conn.fd();
        let interest = client_interest(true, false);
        poller.add(fd, interest)?;
        self.connections.insert(fd, Entry { conn, interest });
        Ok(())
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    pub fn is_cgi(&self, fd: RawFd) -> bool {
        self.cgi.contains_key(&fd)
    }

    pub fn is_cgi_input(&self, fd: RawFd) -> bool {
        self.inputs.contains_key(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd).map(|entry| &mut entry.conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn cgi_len(&self) -> usize {
        self.cgi.len()
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.connections.keys().copied().collect()
    }

    /// Stdout fds of scripts that have run too long.
    pub fn expired_cgi(&self, now: Instant) -> Vec<RawFd> {
        self.cgi
            .iter()
            .filter(|(_, unit)| unit.expired(now))
            .map(|(fd, _)| *fd)
            .collect()
    }

    /// Register for writability while output is queued, and only for reading otherwise.
    pub fn update_interest(&mut self, poller: &Poller, fd: RawFd) -> Result<()> {
        let entry = match self.connections.get_mut(&fd) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let interest = client_interest(entry.conn.wants_read(), entry.conn.wants_write());
        if interest != entry.interest {
            poller.modify(fd, interest)?;
            entry.interest = interest;
        }
        Ok(())
    }

    /// Take ownership of a running script, watch its output and, while body bytes remain, its
    /// input.
    pub fn attach_cgi(&mut self, poller: &Poller, unit: CgiUnit) -> Result<()> {
        let cgi_fd = unit.fd();
        let conn = self
            .connections
            .get_mut(&unit.conn_fd())
            .map(|entry| &mut entry.conn)
            .with_context(|| format!("no connection {} for script output", unit.conn_fd()))?;
        poller.add(cgi_fd, EpollFlags::EPOLLIN)?;
        if let Some(input_fd) = unit.input_fd() {
            if let Err(e) = poller.add(input_fd, EpollFlags::EPOLLOUT) {
                if let Err(e) = poller.delete(cgi_fd) {
                    warn!("{:#}", e);
                }
                return Err(e);
            }
            self.inputs.insert(input_fd, cgi_fd);
        }
        conn.set_cgi_fd(Some(cgi_fd));
        self.cgi.insert(cgi_fd, unit);
        Ok(())
    }

    /// Write more of a script's body now that its stdin is writable.
    pub fn feed_cgi(&mut self, poller: &Poller, input_fd: RawFd) {
        let cgi_fd = match self.inputs.get(&input_fd) {
            Some(cgi_fd) => *cgi_fd,
            None => return,
        };
        let unit = match self.cgi.get_mut(&cgi_fd) {
            Some(unit) => unit,
            None => return,
        };
        let done = match unit.write_input() {
            Ok(done) => done,
            Err(e) => {
                warn!("{:#}", e);
                true
            }
        };
        if done {
            debug!("body of script {} delivered", unit.fd());
            release_input(poller, &mut self.inputs, unit);
        }
    }

    pub fn cgi_mut(&mut self, cgi_fd: RawFd) -> Option<&mut CgiUnit> {
        self.cgi.get_mut(&cgi_fd)
    }

    /// Stop watching a script and hand it back, detached from its connection.
    pub fn take_cgi(&mut self, poller: &Poller, cgi_fd: RawFd) -> Option<CgiUnit> {
        let mut unit = self.cgi.remove(&cgi_fd)?;
        release_input(poller, &mut self.inputs, &mut unit);
        if let Err(e) = poller.delete(cgi_fd) {
            warn!("{:#}", e);
        }
        if let Some(conn) = self.get_mut(unit.conn_fd()) {
            conn.set_cgi_fd(None);
        }
        Some(unit)
    }

    /// Close a connection and kill its script, if any. Returns false if there was no such
    /// connection.
    pub fn remove(&mut self, poller: &Poller, fd: RawFd) -> bool {
        let entry = match self.connections.remove(&fd) {
            Some(entry) => entry,
            None => return false,
        };
        if let Some(cgi_fd) = entry.conn.cgi_fd() {
            if let Some(mut unit) = self.cgi.remove(&cgi_fd) {
                debug!("killing script {} of connection {}", cgi_fd, fd);
                release_input(poller, &mut self.inputs, &mut unit);
                if let Err(e) = poller.delete(cgi_fd) {
                    warn!("{:#}", e);
                }
                drop(unit);
            }
        }
        if let Err(e) = poller.delete(fd) {
            warn!("{:#}", e);
        }
        true
    }

    pub fn clear(&mut self, poller: &Poller) {
        for fd in self.fds() {
            self.remove(poller, fd);
        }
        for (cgi_fd, mut unit) in self.cgi.drain() {
            release_input(poller, &mut self.inputs, &mut unit);
            if let Err(e) = poller.delete(cgi_fd) {
                warn!("{:#}", e);
            }
            drop(unit);
        }
    }
}
