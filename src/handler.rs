//! Turning a parsed request into a response or a running script.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, error, warn};

use crate::builder;
use crate::cgi::{self, CgiCommand, CgiUnit, Spawner};
use crate::config::{Config, Location, Redirect, ServerConfig};
use crate::request::{ClientRequest, Method};
use crate::response::{MimeMap, Response};
use crate::router::{build_full_path, find_best_match, normalize_path, resolve, FileKind, Target};

/// Immutable state shared by every request.
#[derive(Debug)]
pub struct Site {
    pub config: Config,
    /// Prepended to every root, error page and upload path.
    pub prefix: String,
    pub mime: MimeMap,
}

impl Site {
    pub fn new(config: Config, prefix: String) -> Self {
        Self {
            config,
            prefix,
            mime: MimeMap::default(),
        }
    }

    /// Error response for `status`, using the server's custom page when it has one.
    pub fn error_page(&self, server: usize, status: u16, reason: &str) -> Response {
        builder::error_page(
            &self.config.servers[server],
            &self.prefix,
            &self.mime,
            status,
            reason,
            SystemTime::now(),
        )
    }

    /// Prefixed upload directory, made absolute since scripts run in their own directory.
    fn upload_dir(&self, location: &Location) -> Option<String> {
        let upload_path = location.upload_path.as_deref()?;
        let path = if self.prefix.is_empty() {
            PathBuf::from(upload_path)
        } else {
            PathBuf::from(build_full_path(&self.prefix, upload_path, "").trim_end_matches('/'))
        };
        let path = if path.is_relative() {
            env::current_dir().map_or(path.clone(), |dir| dir.join(&path))
        } else {
            path
        };
        Some(path.display().to_string())
    }
}

/// What to do with a request.
#[derive(Debug)]
pub enum Outcome {
    Ready(Response),
    /// The response comes from a script that is now running.
    Cgi(CgiUnit),
}

/// `path` with the request's query string appended.
fn redirect_target(request: &ClientRequest, path: &str) -> String {
    if request.query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, request.query)
    }
}

/// The raw (still encoded) path of the request target.
fn raw_path(request: &ClientRequest) -> &str {
    request.uri.split('?').next().unwrap_or(&request.uri)
}

fn return_directive(
    site: &Site,
    server: usize,
    redirect: &Redirect,
    now: SystemTime,
) -> Response {
    match (redirect.code, &redirect.target) {
        (300..=399, Some(target)) => builder::redirect(redirect.code, target, now),
        (code, _) if code >= 400 => site.error_page(server, code, "Refused by configuration."),
        (code, _) => Response::new(code),
    }
}

/// Script extension and interpreter if `path` is a CGI script for `location`.
fn cgi_interpreter<'a>(location: &'a Location, path: &Path) -> Option<(String, &'a str)> {
    let extension = format!(".{}", path.extension()?.to_str()?);
    let interpreter = location.interpreter(&extension)?;
    Some((extension, interpreter))
}

struct Context<'a> {
    site: &'a Site,
    server_index: usize,
    server: &'a ServerConfig,
    location: &'a Location,
    root: &'a str,
    now: SystemTime,
}

impl<'a> Context<'a> {
    fn error(&self, status: u16, reason: &str) -> Outcome {
        Outcome::Ready(self.site.error_page(self.server_index, status, reason))
    }

    fn file(&self, path: &Path) -> Outcome {
        match builder::file(&self.site.mime, path) {
            Ok(response) => Outcome::Ready(response),
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                self.error(e.status(), "The file could not be read.")
            }
        }
    }

    fn directory(&self, request: &ClientRequest, path: &str, target: &Target) -> Outcome {
        if !path.ends_with('/') {
            let location = redirect_target(request, &format!("{}/", raw_path(request)));
            return Outcome::Ready(builder::redirect(302, &location, self.now));
        }
        if request.method != Method::Get {
            return self.error(501, "Only GET is implemented for directories.");
        }
        if let Some(index) = &self.location.index {
            let index_path = format!("{}{}", path, index);
            match resolve(&self.site.prefix, self.root, &index_path) {
                Ok(index) if index.kind == FileKind::Regular => return self.file(&index.path),
                Ok(_) => {}
                Err(e) => debug!("no index {}: {}", index_path, e),
            }
        }
        if self.location.autoindex {
            return match builder::listing(&target.path, path, self.now) {
                Ok(response) => Outcome::Ready(response),
                Err(e) => {
                    warn!("failed to list {}: {}", target.path.display(), e);
                    self.error(e.status(), "The directory could not be listed.")
                }
            };
        }
        self.error(404, "The requested URL was not found on this server.")
    }

    fn regular(
        &self,
        mut request: ClientRequest,
        path: &str,
        target: &Target,
        peer: SocketAddr,
        spawner: &dyn Spawner,
    ) -> Outcome {
        if path.ends_with('/') {
            let location = redirect_target(&request, raw_path(&request).trim_end_matches('/'));
            return Outcome::Ready(builder::redirect(302, &location, self.now));
        }
        if let Some((extension, interpreter)) = cgi_interpreter(self.location, &target.path) {
            request.extension = Some(extension);
            debug!(
                "running {} with {} for {:?} scripts",
                target.path.display(),
                interpreter,
                request.extension
            );
            let command = CgiCommand::new(
                &request,
                interpreter,
                &target.path,
                self.server,
                peer,
                self.site.upload_dir(self.location),
            );
            return match cgi::start(
                spawner,
                &command,
                std::mem::take(&mut request.body),
                request.client_fd,
            ) {
                Ok(unit) => Outcome::Cgi(unit),
                Err(e) => {
                    error!("failed to start {}: {:#}", target.path.display(), e);
                    self.error(500, "The script could not be started.")
                }
            };
        }
        if request.method != Method::Get {
            return self.error(501, "Only GET is implemented for static files.");
        }
        self.file(&target.path)
    }
}

/// Route `request`, received on a connection of server `server_index`.
pub fn dispatch(
    site: &Site,
    server_index: usize,
    request: ClientRequest,
    peer: SocketAddr,
    spawner: &dyn Spawner,
) -> Outcome {
    let now = SystemTime::now();
    let server = &site.config.servers[server_index];

    let path = match normalize_path(&request.path) {
        Some(path) => path,
        None => {
            warn!("refusing {} from {}: escapes the root", request.path, peer);
            return Outcome::Ready(site.error_page(
                server_index,
                403,
                "You don't have permission to access this URL.",
            ));
        }
    };
    let location = match find_best_match(&path, &server.locations) {
        Some(index) => &server.locations[index],
        None => {
            return Outcome::Ready(site.error_page(
                server_index,
                500,
                "No location is configured for this URL.",
            ))
        }
    };
    debug!("{} matched location {}", path, location.path);

    if let Some(redirect) = &location.redirect {
        return Outcome::Ready(return_directive(site, server_index, redirect, now));
    }
    if !location.allows(request.method) {
        warn!("{} is not allowed for location {}", request.method, location.path);
        return Outcome::Ready(builder::method_not_allowed(
            server,
            &site.prefix,
            &site.mime,
            location,
            now,
        ));
    }
    let root = match &location.root {
        Some(root) => root,
        None => {
            return Outcome::Ready(site.error_page(
                server_index,
                500,
                "The location has no document root.",
            ))
        }
    };
    let context = Context {
        site,
        server_index,
        server,
        location,
        root,
        now,
    };

    let target = match resolve(&site.prefix, root, path.trim_end_matches('/')) {
        Ok(target) => target,
        Err(e) => {
            debug!("cannot resolve {}: {}", path, e);
            let reason = match e.status() {
                404 => "The requested URL was not found on this server.",
                403 => "You don't have permission to access this URL.",
                _ => "The file could not be accessed.",
            };
            return context.error(e.status(), reason);
        }
    };
    match target.kind {
        FileKind::Directory => context.directory(&request, &path, &target),
        FileKind::Regular => context.regular(request, &path, &target, peer, spawner),
        FileKind::Other => context.error(403, "You don't have permission to access this URL."),
    }
}
