//! Mapping request paths onto locations and the filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Location;

/// Why a request path could not be mapped to a file.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("path escapes the location root")]
    Escape,
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("filesystem error: {0}")]
    Io(#[source] io::Error),
}

impl ResolveError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Escape | Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::Io(_) => 500,
        }
    }
}

impl From<io::Error> for ResolveError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ if e.raw_os_error() == Some(libc::ENOTDIR) => Self::NotFound,
            _ => Self::Io(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
    Other,
}

/// A request path mapped onto an existing file under its location root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Canonical path.
    pub path: PathBuf,
    pub kind: FileKind,
}

/// Resolve //, /./, and /../ in a decoded request path.
///
/// Returns None if the path does not start with a slash or climbs above the root.
pub fn normalize_path(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop()?;
            }
            component => components.push(component),
        }
    }
    let mut normalized = format!("/{}", components.join("/"));
    if path.ends_with('/') && !components.is_empty() {
        normalized.push('/');
    }
    Some(normalized)
}

/// Whether `location` covers `path`: equal, or a prefix ending at a component boundary.
fn is_prefix_match(path: &str, location: &str) -> bool {
    if location.is_empty() || location == "/" {
        return true;
    }
    if !path.starts_with(location) {
        return false;
    }
    path.len() == location.len()
        || path.as_bytes()[location.len()] == b'/'
        || location.ends_with('/')
}

/// Index of the location serving `path`. Locations must be sorted longest first.
pub fn find_best_match(path: &str, locations: &[Location]) -> Option<usize> {
    locations
        .iter()
        .position(|location| is_prefix_match(path, &location.path))
}

/// Join prefix, location root and request path with exactly one slash at each boundary.
pub fn build_full_path(prefix: &str, root: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let root = root.trim_end_matches('/');
    let root = if prefix.is_empty() || root.starts_with('/') || root.is_empty() {
        root.to_string()
    } else {
        format!("/{}", root.trim_start_matches("./"))
    };
    if path.starts_with('/') {
        format!("{}{}{}", prefix, root, path)
    } else {
        format!("{}{}/{}", prefix, root, path)
    }
}

/// Map `path` onto the filesystem under `prefix` + `root`, refusing anything that ends up outside
/// the canonical root (through `..` or symlinks).
pub fn resolve(prefix: &str, root: &str, path: &str) -> Result<Target, ResolveError> {
    let canonical_root = fs::canonicalize(build_full_path(prefix, root, "/"))?;
    let full_path = build_full_path(prefix, root, path);
    let canonical = fs::canonicalize(Path::new(&full_path))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(ResolveError::Escape);
    }
    let file_type = fs::metadata(&canonical)?.file_type();
    let kind = if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    };
    Ok(Target {
        path: canonical,
        kind,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::os::unix::fs::symlink;

    use test_case::test_case;

    use crate::config::Config;

    #[test]
    fn normalize_path_works() {
        let test_cases = &[
            ("", None),
            ("/", Some("/")),
            ("/.", Some("/")),
            ("/./", Some("/")),
            ("/.d", Some("/.d")),
            ("//.d", Some("/.d")),
            ("/../", None),
            ("/abc", Some("/abc")),
            ("/abc/", Some("/abc/")),
            ("/abc/.", Some("/abc")),
            ("/abc/./", Some("/abc/")),
            ("/abc/..", Some("/")),
            ("/abc/../def/", Some("/def/")),
            ("/abc/../def/../../", None),
            ("/a/b/c/../../d/", Some("/a/d/")),
            ("/a/b/../../../c", None),
            ("//a///b////c/////", Some("/a/b/c/")),
            ("relative", None),
        ];
        for (path, expected) in test_cases {
            assert_eq!(
                normalize_path(path),
                expected.map(|s| s.to_string()),
                "{}",
                path
            );
        }
    }

    fn locations() -> Vec<Location> {
        Config::parse(
            "server { root /r;
                location /images { }
                location /images/thumbs { }
                location /api/ { }
                location /cgi-bin { }
            }",
        )
        .unwrap()
        .servers
        .remove(0)
        .locations
    }

    #[test_case("/", "/" ; "root")]
    #[test_case("/index.html", "/" ; "fallback")]
    #[test_case("/images", "/images" ; "exact")]
    #[test_case("/images/a.png", "/images" ; "prefix")]
    #[test_case("/images/thumbs/a.png", "/images/thumbs" ; "longest prefix")]
    #[test_case("/imagesx", "/" ; "not at boundary")]
    #[test_case("/api/v1", "/api/" ; "location with trailing slash")]
    #[test_case("/api", "/" ; "shorter than location")]
    fn find_best_match_works(path: &str, expected: &str) {
        let locations = locations();
        let index = find_best_match(path, &locations).unwrap();
        assert_eq!(locations[index].path, expected);
        assert_eq!(find_best_match(path, &locations), Some(index));
    }

    #[test_case("", "/var/www", "/a.html", "/var/www/a.html" ; "no prefix")]
    #[test_case("", "/var/www/", "/a.html", "/var/www/a.html" ; "root with slash")]
    #[test_case("/srv/", "/www", "/a.html", "/srv/www/a.html" ; "prefix with slash")]
    #[test_case("/srv", "./www", "/a.html", "/srv/www/a.html" ; "relative root")]
    #[test_case("", "www", "a.html", "www/a.html" ; "path without slash")]
    fn build_full_path_works(prefix: &str, root: &str, path: &str, expected: &str) {
        assert_eq!(build_full_path(prefix, root, path), expected);
    }

    struct Site {
        dir: tempfile::TempDir,
    }

    impl Site {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("www/sub")).unwrap();
            fs::write(dir.path().join("www/index.html"), "hi").unwrap();
            fs::write(dir.path().join("www/sub/page.html"), "page").unwrap();
            fs::write(dir.path().join("secret.txt"), "secret").unwrap();
            symlink(dir.path().join("secret.txt"), dir.path().join("www/leak.txt")).unwrap();
            symlink(
                dir.path().join("www/sub/page.html"),
                dir.path().join("www/alias.html"),
            )
            .unwrap();
            Self { dir }
        }

        fn resolve(&self, path: &str) -> Result<Target, ResolveError> {
            resolve(self.dir.path().to_str().unwrap(), "www", path)
        }
    }

    #[test]
    fn resolves_files_and_directories() {
        let site = Site::new();
        let target = site.resolve("/index.html").unwrap();
        assert_eq!(target.kind, FileKind::Regular);
        assert!(target.path.ends_with("www/index.html"));
        assert_eq!(site.resolve("/sub/").unwrap().kind, FileKind::Directory);
        assert_eq!(site.resolve("/").unwrap().kind, FileKind::Directory);
    }

    #[test]
    fn symlink_inside_root_is_allowed() {
        let site = Site::new();
        let target = site.resolve("/alias.html").unwrap();
        assert!(target.path.ends_with("www/sub/page.html"));
    }

    #[test_case("/leak.txt" ; "symlink")]
    #[test_case("/../secret.txt" ; "dot dot")]
    #[test_case("/sub/../../secret.txt" ; "nested dot dot")]
    fn refuses_escape(path: &str) {
        let site = Site::new();
        let error = site.resolve(path).unwrap_err();
        assert!(matches!(error, ResolveError::Escape), "{:?}", error);
        assert_eq!(error.status(), 403);
    }

    #[test_case("/missing.html" ; "missing")]
    #[test_case("/index.html/child" ; "file as directory")]
    fn missing_is_not_found(path: &str) {
        let site = Site::new();
        let error = site.resolve(path).unwrap_err();
        assert!(matches!(error, ResolveError::NotFound), "{:?}", error);
        assert_eq!(error.status(), 404);
    }
}
