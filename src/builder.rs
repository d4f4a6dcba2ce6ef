//! Responses assembled from files, directories and generated HTML.

use std::fmt;
use std::fs::{self, DirEntry};
use std::path::Path;
use std::time::SystemTime;

use log::{debug, warn};

use crate::config::{Location, ServerConfig};
use crate::response::{reason_phrase, GeneratedOn, HtmlEscaped, MimeMap, Response, UrlEncoded};
use crate::router::{build_full_path, ResolveError};

/// A default reply for any (erroneous) occasion.
pub fn default_reply(status: u16, reason: &str, now: SystemTime) -> Response {
    let errname = reason_phrase(status);
    Response::html(
        status,
        format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            {}\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status,
            errname,
            errname,
            HtmlEscaped(reason),
            GeneratedOn(now),
        ),
    )
}

/// The server's custom page for `status` if one is configured and readable, else a default reply.
pub fn error_page(
    server: &ServerConfig,
    prefix: &str,
    mime: &MimeMap,
    status: u16,
    reason: &str,
    now: SystemTime,
) -> Response {
    let custom = server.error_pages.get(&status).and_then(|uri| {
        let root = server.root_location()?.root.as_deref()?;
        let path = build_full_path(prefix, root, uri);
        match fs::read(&path) {
            Ok(body) => Some(
                Response::new(status)
                    .with_header("Content-Type", mime.content_type(Path::new(&path)))
                    .with_body(body),
            ),
            Err(e) => {
                warn!("failed to read error page {}: {}", path, e);
                None
            }
        }
    });
    custom.unwrap_or_else(|| default_reply(status, reason, now))
}

/// `405 Method Not Allowed` listing what the location accepts.
pub fn method_not_allowed(
    server: &ServerConfig,
    prefix: &str,
    mime: &MimeMap,
    location: &Location,
    now: SystemTime,
) -> Response {
    let mut response = error_page(
        server,
        prefix,
        mime,
        405,
        "The method is not allowed for this resource.",
        now,
    );
    response.set_header("Allow", &location.allow_header());
    response
}

/// A redirect reply.
pub fn redirect(status: u16, location: &str, now: SystemTime) -> Response {
    let reason = reason_phrase(status);
    Response::html(
        status,
        format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            Moved to: <a href=\"{}\">{}</a>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status,
            reason,
            reason,
            HtmlEscaped(location),
            HtmlEscaped(location),
            GeneratedOn(now),
        ),
    )
    .with_header("Location", location)
}

/// A regular file, typed by its extension.
pub fn file(mime: &MimeMap, path: &Path) -> Result<Response, ResolveError> {
    let body = fs::read(path)?;
    debug!("serving {} ({} bytes)", path.display(), body.len());
    Ok(Response::new(200)
        .with_header("Content-Type", mime.content_type(path))
        .with_body(body))
}

/// Directory listing.
struct Listing(Vec<DirEntry>);

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .0
            .iter()
            .map(|entry| entry.file_name().to_string_lossy().chars().count())
            .max()
            .unwrap_or(2);

        writeln!(f, "<a href=\"..\">..</a>/")?;

        for entry in &self.0 {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if metadata.is_dir() {
                writeln!(
                    f,
                    "<a href=\"{}/\">{}</a>/",
                    UrlEncoded(&name),
                    HtmlEscaped(&name)
                )?;
            } else {
                writeln!(
                    f,
                    "<a href=\"{}\">{}</a>{:pad$} {:10}",
                    UrlEncoded(&name),
                    HtmlEscaped(&name),
                    "",
                    metadata.len(),
                    pad = width - name.chars().count(),
                )?;
            }
        }
        Ok(())
    }
}

/// A directory listing reply. `url_path` is the decoded request path shown as the title.
pub fn listing(dir: &Path, url_path: &str, now: SystemTime) -> Result<Response, ResolveError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    Ok(Response::html(
        200,
        format!(
            "<html>\n<head>\n<title>{}</title>\n\
            <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
            </head>\n<body>\n<h1>{}</h1>\n<tt><pre>\n\
            {}\
            </pre></tt>\n\
            <hr>\n\
            {}\
            </body>\n</html>\n",
            HtmlEscaped(url_path),
            HtmlEscaped(url_path),
            Listing(entries),
            GeneratedOn(now),
        ),
    ))
}
