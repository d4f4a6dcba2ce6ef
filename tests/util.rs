#![allow(dead_code, unused_macros)]

use std::collections::HashMap;
use std::fs::{create_dir_all, write};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(vec![$(($k, $v),)*].into_iter())
    };
}

pub const BINARY: &str = env!("CARGO_BIN_EXE_webserv-rs");

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..500 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(10));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A running server whose document root is `<tempdir>/www`.
pub struct Server {
    _child: ScopedChild,
    port: u16,
    dir: TempDir,
}
impl Server {
    pub fn new(directives: &str) -> Self {
        Self::with_args(directives, &[])
    }
    /// Start the binary with one server block holding `directives`, plus extra arguments.
    pub fn with_args(directives: &str, args: &[&str]) -> Self {
        let dir = tempdir().expect("failed to create tempdir");
        create_dir_all(dir.path().join("www")).expect("failed to create root");

        // Get an unused port. Assumes the port won't be reused before the server binds it.
        let port = get_unused_port().expect("failed to get unused port");

        let config_path = dir.path().join("webserver.conf");
        write(
            &config_path,
            format!(
                "server {{\n\
                listen 127.0.0.1:{};\n\
                root {};\n\
                index index.html;\n\
                {}\n\
                }}\n",
                port,
                dir.path().join("www").display(),
                directives
            ),
        )
        .expect("failed to write config");

        let child = Command::new(BINARY)
            .args(args)
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to server");

        Self {
            _child: child,
            port,
            dir,
        }
    }
    pub fn root(&self) -> PathBuf {
        self.dir.path().join("www")
    }
    pub fn create_dir(&self, name: &str) {
        create_dir_all(self.root().join(name)).expect("failed to create directory");
    }
    pub fn create_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root().join(name);
        write(&path, contents).expect("failed to create file");
        path
    }
    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to server");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
    /// Send raw request bytes on a new connection and read one response.
    pub fn send(&self, request: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }
    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n", path);
        for (header_name, header_value) in headers {
            request.push_str(&format!("{}: {}\r\n", header_name, header_value));
        }
        request.push_str("\r\n");
        self.send(request.as_bytes())
    }
}

/// Run the binary to completion with `args`.
pub fn run(args: &[&str], dir: &Path) -> std::process::Output {
    Command::new(BINARY)
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run server")
}

/// HTTP Response from the server.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}
impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

pub fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
