//! Running CGI scripts.
//!
//! A script is started with its stdin and stdout connected to non-blocking pipes, both handed to
//! the reactor. The request body goes out through [`CgiUnit::write_input`] whenever stdin is
//! writable, and stdin is closed once it is delivered. [`CgiUnit::drain`] collects output
//! whenever stdout is readable. Once the script closes its stdout the unit is
//! [finished](CgiUnit::finish): the process is reaped and its output becomes a [`Response`].
//!
//! Every process is reaped exactly once. A unit that is dropped before it finished (its client
//! went away, or it ran past its deadline) kills its process first.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::net::SocketAddr;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe2, read, write, ForkResult, Pid};

use crate::codec::find;
use crate::config::ServerConfig;
use crate::request::{ClientRequest, Method};
use crate::response::{Response, SERVER_NAME};

/// How long a script may run before it is killed and the client gets `504 Gateway Timeout`.
pub const CGI_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_CONTENT_TYPE: &str = "text/html";

/// Everything needed to start one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiCommand {
    pub interpreter: String,
    pub script: PathBuf,
    /// Working directory of the script.
    pub dir: PathBuf,
    /// The complete environment; nothing is inherited from the server.
    pub env: BTreeMap<String, String>,
}

impl CgiCommand {
    pub fn new(
        request: &ClientRequest,
        interpreter: &str,
        script: &Path,
        server: &ServerConfig,
        peer: SocketAddr,
        upload_dir: Option<String>,
    ) -> Self {
        let mut env = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            env.insert(key.to_string(), value);
        };
        set("GATEWAY_INTERFACE", "CGI/1.1".to_string());
        set("SERVER_SOFTWARE", SERVER_NAME.to_string());
        set("SERVER_PROTOCOL", request.version.as_str().to_string());
        set("SERVER_PORT", server.port.to_string());
        let server_name = request
            .headers
            .get("host")
            .map(|host| host.split(':').next().unwrap_or(host).to_string())
            .unwrap_or_else(|| server.host.to_string());
        set("SERVER_NAME", server_name);
        set("REMOTE_ADDR", peer.ip().to_string());
        set("REDIRECT_STATUS", "200".to_string());
        set("REQUEST_METHOD", request.method.as_str().to_string());
        set("REQUEST_URI", request.uri.clone());
        set("SCRIPT_NAME", request.path.clone());
        set("SCRIPT_FILENAME", script.display().to_string());
        set("QUERY_STRING", request.query.clone());
        if request.method == Method::Post || !request.body.is_empty() {
            set("CONTENT_LENGTH", request.body.len().to_string());
            if let Some(content_type) = request.headers.get("content-type") {
                set("CONTENT_TYPE", content_type.to_string());
            }
        }
        if matches!(request.method, Method::Post | Method::Delete) {
            if let Some(upload_dir) = upload_dir {
                set("UPLOAD_DIR", upload_dir);
            }
        }
        for (name, value) in request.headers.iter() {
            if matches!(name, "content-type" | "content-length") {
                continue;
            }
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            set(&key, value.to_string());
        }

        Self {
            interpreter: interpreter.to_string(),
            script: script.to_path_buf(),
            dir: script
                .parent()
                .map_or_else(|| PathBuf::from("/"), Path::to_path_buf),
            env,
        }
    }
}

/// A started script process.
pub trait CgiProcess: fmt::Debug {
    fn id(&self) -> i32;
    /// Forcefully stop the process.
    fn kill(&mut self) -> Result<()>;
    /// Block until the process exits. Returns its exit code, or 128 plus the signal number if it
    /// was killed by a signal.
    fn wait(&mut self) -> Result<i32>;
}

/// Pipes and handle of a freshly started script.
#[derive(Debug)]
pub struct Spawned {
    pub stdin: File,
    pub stdout: File,
    pub process: Box<dyn CgiProcess>,
}

pub trait Spawner {
    fn spawn(&self, command: &CgiCommand) -> Result<Spawned>;
}

/// Starts scripts with fork and execve.
#[derive(Debug, Default)]
pub struct ForkSpawner;

#[derive(Debug)]
struct ForkProcess {
    pid: Pid,
}

impl CgiProcess for ForkProcess {
    fn id(&self) -> i32 {
        self.pid.as_raw()
    }

    fn kill(&mut self) -> Result<()> {
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::Error::Sys(Errno::ESRCH)) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to kill process {}", self.pid)),
        }
    }

    fn wait(&mut self) -> Result<i32> {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) | Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to wait for process {}", self.pid))
                }
            }
        }
    }
}

fn to_cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).with_context(|| format!("{} contains a NUL byte", what))
}

/// Create a pipe whose ends close on exec.
fn pipe() -> Result<(File, File)> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).context("failed to create pipe")?;
    Ok(unsafe { (File::from_raw_fd(read_end), File::from_raw_fd(write_end)) })
}

impl Spawner for ForkSpawner {
    fn spawn(&self, command: &CgiCommand) -> Result<Spawned> {
        // Nothing may allocate between fork and execve, so the arguments are prepared here.
        let program = to_cstring(command.interpreter.as_bytes(), "interpreter path")?;
        let script = to_cstring(command.script.as_os_str().as_bytes(), "script path")?;
        let dir = to_cstring(command.dir.as_os_str().as_bytes(), "script directory")?;
        let env = command
            .env
            .iter()
            .map(|(key, value)| to_cstring(format!("{}={}", key, value).as_bytes(), key))
            .collect::<Result<Vec<_>>>()?;
        let argv = [program.as_ptr(), script.as_ptr(), ptr::null()];
        let envp: Vec<*const c_char> = env
            .iter()
            .map(|var| var.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        let (stdin_read, stdin_write) = pipe()?;
        let (stdout_read, stdout_write) = pipe()?;

        match unsafe { fork() }.context("failed to fork process")? {
            ForkResult::Child => unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                if libc::dup2(stdin_read.as_raw_fd(), libc::STDIN_FILENO) == -1
                    || libc::dup2(stdout_write.as_raw_fd(), libc::STDOUT_FILENO) == -1
                    || libc::chdir(dir.as_ptr()) == -1
                {
                    libc::_exit(127);
                }
                libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
                libc::_exit(127)
            },
            ForkResult::Parent { child } => {
                debug!(
                    "started {} {} as process {}",
                    command.interpreter,
                    command.script.display(),
                    child
                );
                Ok(Spawned {
                    stdin: stdin_write,
                    stdout: stdout_read,
                    process: Box::new(ForkProcess { pid: child }),
                })
            }
        }
    }
}

/// A running script whose output is being collected for a connection.
#[derive(Debug)]
pub struct CgiUnit {
    process: Box<dyn CgiProcess>,
    /// Open until the whole body is written.
    stdin: Option<File>,
    input: Vec<u8>,
    input_pos: usize,
    stdout: File,
    output: Vec<u8>,
    conn_fd: RawFd,
    started: Instant,
    reaped: bool,
}

fn set_nonblocking(file: &File, what: &str) -> Result<()> {
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .with_context(|| format!("failed to make script {} non-blocking", what))?;
    Ok(())
}

/// Start `command` and return the unit that feeds it `body` and polls for its output.
pub fn start(
    spawner: &dyn Spawner,
    command: &CgiCommand,
    body: Vec<u8>,
    conn_fd: RawFd,
) -> Result<CgiUnit> {
    let Spawned {
        stdin,
        stdout,
        process,
    } = spawner.spawn(command)?;
    // From here on, an early return drops the unit, which kills and reaps the process.
    let mut unit = CgiUnit {
        process,
        stdin: Some(stdin),
        input: body,
        input_pos: 0,
        stdout,
        output: Vec::new(),
        conn_fd,
        started: Instant::now(),
        reaped: false,
    };
    if let Some(stdin) = &unit.stdin {
        set_nonblocking(stdin, "input")?;
    }
    set_nonblocking(&unit.stdout, "output")?;
    if unit.write_input()? {
        unit.close_input();
    }
    info!(
        "process {} runs {} for connection {}{}",
        unit.process.id(),
        command.script.display(),
        conn_fd,
        if unit.stdin.is_some() {
            " (body pending)"
        } else {
            ""
        }
    );
    Ok(unit)
}

impl CgiUnit {
    /// The pollable stdout pipe.
    pub fn fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    /// The stdin pipe, while part of the body is still to be written.
    pub fn input_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn conn_fd(&self) -> RawFd {
        self.conn_fd
    }

    /// Write as much of the body as the pipe takes. Returns true once nothing is left to write,
    /// including when the script closed its stdin early.
    pub fn write_input(&mut self) -> Result<bool> {
        let fd = match self.input_fd() {
            Some(fd) => fd,
            None => return Ok(true),
        };
        while self.input_pos < self.input.len() {
            match write(fd, &self.input[self.input_pos..]) {
                Ok(written) => self.input_pos += written,
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(false),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EPIPE)) => {
                    debug!(
                        "process {} stopped reading after {} of {} bytes",
                        self.process.id(),
                        self.input_pos,
                        self.input.len()
                    );
                    return Ok(true);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to write input of process {}", self.process.id())
                    })
                }
            }
        }
        Ok(true)
    }

    /// Close stdin so the script sees the end of the body. Deregister it first.
    pub fn close_input(&mut self) {
        self.stdin = None;
        self.input = Vec::new();
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= CGI_TIMEOUT
    }

    /// Read whatever output is available. Returns true once the script closed its stdout.
    pub fn drain(&mut self) -> Result<bool> {
        let mut buf = [0; 8192];
        loop {
            match read(self.fd(), &mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => self.output.extend_from_slice(&buf[..n]),
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(false),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to read output of process {}", self.process.id())
                    })
                }
            }
        }
    }

    fn reap(&mut self) -> Result<i32> {
        self.reaped = true;
        self.process.wait()
    }

    /// Reap the process and turn its output into a response.
    pub fn finish(mut self) -> Result<Response> {
        let pid = self.process.id();
        let code = self.reap()?;
        if code != 0 {
            bail!("process {} exited with status {}", pid, code);
        }
        debug!("process {} wrote {} bytes", pid, self.output.len());
        Ok(parse_output(&self.output))
    }
}

impl Drop for CgiUnit {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let pid = self.process.id();
        if let Err(e) = self.process.kill() {
            warn!("{:#}", e);
        }
        match self.reap() {
            Ok(code) => debug!("killed process {} (status {})", pid, code),
            Err(e) => warn!("{:#}", e),
        }
    }
}

/// Split script output into meta headers and body.
pub fn parse_output(output: &[u8]) -> Response {
    let crlf = find(b"\r\n\r\n", output).map(|pos| (pos, pos + 4));
    let lf = find(b"\n\n", output).map(|pos| (pos, pos + 2));
    let (head_end, body_start) = match (crlf, lf) {
        (Some(crlf), Some(lf)) => std::cmp::min(crlf, lf),
        (Some(split), None) | (None, Some(split)) => split,
        (None, None) => {
            return Response::new(200)
                .with_header("Content-Type", DEFAULT_CONTENT_TYPE)
                .with_body(output.to_vec())
        }
    };

    let mut response = Response::new(200).with_body(output[body_start..].to_vec());
    let head = String::from_utf8_lossy(&output[..head_end]);
    let mut status = None;
    for line in head.lines() {
        let (name, value) = match line.find(':') {
            Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
            None => continue,
        };
        if name.eq_ignore_ascii_case("status") {
            let (code, reason) = match value.find(' ') {
                Some(pos) => (&value[..pos], value[pos + 1..].trim()),
                None => (value, ""),
            };
            match code.parse::<u16>() {
                Ok(code) if (100..=599).contains(&code) => {
                    status = Some(code);
                    if !reason.is_empty() {
                        response.reason = Some(reason.to_string());
                    }
                }
                _ => warn!("ignoring invalid CGI status `{}'", value),
            }
        } else if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        } else {
            response.set_header(name, value);
        }
    }
    if response.header("Content-Type").is_none() {
        response.set_header("Content-Type", DEFAULT_CONTENT_TYPE);
    }
    response.status = match status {
        Some(code) => code,
        None if response.header("Location").is_some() => 302,
        None => 200,
    };
    response
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::RefCell;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::rc::Rc;
    use std::thread::sleep;

    use test_case::test_case;

    use crate::config::Config;
    use crate::request::{Headers, Version};

    fn request(method: Method, body: &[u8]) -> ClientRequest {
        let mut headers = Headers::default();
        headers.insert("Host", "example.com:8080");
        headers.insert("User-Agent", "test");
        if !body.is_empty() {
            headers.insert("Content-Type", "application/x-www-form-urlencoded");
            headers.insert("Content-Length", &body.len().to_string());
        }
        ClientRequest {
            method,
            uri: "/cgi-bin/echo.sh?x=1".to_string(),
            path: "/cgi-bin/echo.sh".to_string(),
            query: "x=1".to_string(),
            version: Version::Http11,
            headers,
            body: body.to_vec(),
            chunked: false,
            client_fd: 5,
            extension: Some(".sh".to_string()),
        }
    }

    fn server() -> ServerConfig {
        Config::parse("server { listen 8080; root /srv; }")
            .unwrap()
            .servers
            .remove(0)
    }

    fn command(dir: &Path, script: &str, method: Method, body: &[u8]) -> CgiCommand {
        let path = dir.join("script.sh");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        CgiCommand::new(
            &request(method, body),
            "/bin/sh",
            &path,
            &server(),
            "10.0.0.7:4000".parse().unwrap(),
            Some("/srv/uploads".to_string()),
        )
    }

    fn run(unit: &mut CgiUnit) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !unit.drain().unwrap() {
            assert!(Instant::now() < deadline, "script did not finish");
            sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn environment() {
        let dir = tempfile::tempdir().unwrap();
        let command = command(dir.path(), "", Method::Post, b"a=1");
        let env = &command.env;
        assert_eq!(env["REQUEST_METHOD"], "POST");
        assert_eq!(env["QUERY_STRING"], "x=1");
        assert_eq!(env["SCRIPT_NAME"], "/cgi-bin/echo.sh");
        assert_eq!(env["SCRIPT_FILENAME"], dir.path().join("script.sh").display().to_string());
        assert_eq!(env["CONTENT_LENGTH"], "3");
        assert_eq!(env["CONTENT_TYPE"], "application/x-www-form-urlencoded");
        assert_eq!(env["GATEWAY_INTERFACE"], "CGI/1.1");
        assert_eq!(env["REDIRECT_STATUS"], "200");
        assert_eq!(env["SERVER_NAME"], "example.com");
        assert_eq!(env["SERVER_PORT"], "8080");
        assert_eq!(env["REMOTE_ADDR"], "10.0.0.7");
        assert_eq!(env["UPLOAD_DIR"], "/srv/uploads");
        assert_eq!(env["HTTP_USER_AGENT"], "test");
        assert!(!env.contains_key("HTTP_CONTENT_TYPE"));
        assert!(!env.contains_key("PATH"));
        assert_eq!(command.dir, dir.path());
    }

    #[test]
    fn get_has_no_body_variables() {
        let dir = tempfile::tempdir().unwrap();
        let env = command(dir.path(), "", Method::Get, b"").env;
        assert!(!env.contains_key("CONTENT_LENGTH"));
        assert!(!env.contains_key("UPLOAD_DIR"));
    }

    #[test]
    fn runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let command = command(
            dir.path(),
            "read -r body\n\
            printf 'Content-Type: text/plain\\r\\n\\r\\n%s|%s|%s' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \"$body\"\n",
            Method::Post,
            b"a=1&b=2",
        );
        let mut unit = start(&ForkSpawner, &command, b"a=1&b=2".to_vec(), 5).unwrap();
        assert_eq!(unit.conn_fd(), 5);
        run(&mut unit);
        let response = unit.finish().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.body, b"POST|x=1|a=1&b=2");
    }

    #[test]
    fn runs_in_script_directory() {
        let dir = tempfile::tempdir().unwrap();
        let command = command(dir.path(), "printf '\\n\\n%s' \"$(pwd -P)\"\n", Method::Get, b"");
        let mut unit = start(&ForkSpawner, &command, Vec::new(), 5).unwrap();
        run(&mut unit);
        let response = unit.finish().unwrap();
        assert_eq!(
            Path::new(std::str::from_utf8(&response.body).unwrap()),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn failing_script_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = command(dir.path(), "printf 'partial'\nexit 3\n", Method::Get, b"");
        let mut unit = start(&ForkSpawner, &command, Vec::new(), 5).unwrap();
        run(&mut unit);
        let error = unit.finish().unwrap_err();
        assert!(error.to_string().contains("exited with status 3"), "{}", error);
    }

    #[test]
    fn missing_interpreter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = command(dir.path(), "", Method::Get, b"");
        command.interpreter = "/nonexistent/interpreter".to_string();
        let mut unit = start(&ForkSpawner, &command, Vec::new(), 5).unwrap();
        run(&mut unit);
        assert!(unit.finish().is_err());
    }

    #[test]
    fn dropping_kills_running_script() {
        let dir = tempfile::tempdir().unwrap();
        let command = command(dir.path(), "while :; do :; done\n", Method::Get, b"");
        let mut unit = start(&ForkSpawner, &command, Vec::new(), 5).unwrap();
        assert!(!unit.drain().unwrap());
        let pid = Pid::from_raw(unit.process.id());
        drop(unit);
        // Already reaped, so the pid is gone.
        assert_eq!(
            waitpid(pid, None).unwrap_err(),
            nix::Error::Sys(Errno::ECHILD)
        );
    }

    #[derive(Debug)]
    struct FakeProcess {
        calls: Rc<RefCell<Vec<&'static str>>>,
    }

    impl CgiProcess for FakeProcess {
        fn id(&self) -> i32 {
            42
        }

        fn kill(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("kill");
            Ok(())
        }

        fn wait(&mut self) -> Result<i32> {
            self.calls.borrow_mut().push("wait");
            Ok(0)
        }
    }

    /// Hands out pipes whose other ends stay with the test.
    struct FakeSpawner {
        calls: Rc<RefCell<Vec<&'static str>>>,
        stdout_write: RefCell<Option<File>>,
    }

    impl FakeSpawner {
        fn new() -> Self {
            Self {
                calls: Rc::default(),
                stdout_write: RefCell::new(None),
            }
        }
    }

    impl Spawner for FakeSpawner {
        fn spawn(&self, _command: &CgiCommand) -> Result<Spawned> {
            let (_, stdin) = pipe()?;
            let (stdout, stdout_write) = pipe()?;
            *self.stdout_write.borrow_mut() = Some(stdout_write);
            Ok(Spawned {
                stdin,
                stdout,
                process: Box::new(FakeProcess {
                    calls: self.calls.clone(),
                }),
            })
        }
    }

    fn fake_command() -> CgiCommand {
        CgiCommand::new(
            &request(Method::Get, b""),
            "/bin/sh",
            Path::new("/srv/cgi-bin/echo.sh"),
            &server(),
            "127.0.0.1:1".parse().unwrap(),
            None,
        )
    }

    #[test]
    fn finished_unit_is_reaped_once() {
        let spawner = FakeSpawner::new();
        let mut unit = start(&spawner, &fake_command(), Vec::new(), 5).unwrap();
        let mut stdout = spawner.stdout_write.borrow_mut().take().unwrap();
        stdout.write_all(b"Status: 201 Created\n\ndone").unwrap();
        assert!(!unit.drain().unwrap());
        drop(stdout);
        assert!(unit.drain().unwrap());
        let response = unit.finish().unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, b"done");
        assert_eq!(*spawner.calls.borrow(), vec!["wait"]);
    }

    #[test]
    fn abandoned_unit_is_killed_and_reaped_once() {
        let spawner = FakeSpawner::new();
        let unit = start(&spawner, &fake_command(), Vec::new(), 5).unwrap();
        drop(unit);
        assert_eq!(*spawner.calls.borrow(), vec!["kill", "wait"]);
    }

    #[test]
    fn closed_stdin_ends_input() {
        let spawner = FakeSpawner::new();
        // The read end of stdin is already closed, so writing fails with EPIPE.
        let unit = start(&spawner, &fake_command(), vec![b'x'; 1 << 20], 5).unwrap();
        assert_eq!(unit.input_fd(), None);
        drop(unit);
        assert_eq!(*spawner.calls.borrow(), vec!["kill", "wait"]);
    }

    #[test]
    fn large_body_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![b'x'; 1 << 20];
        let command = command(dir.path(), "sleep 5\n", Method::Post, &body);
        let started = Instant::now();
        let mut unit = start(&ForkSpawner, &command, body, 5).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(unit.input_fd().is_some());
        assert!(!unit.write_input().unwrap());
        assert!(!unit.drain().unwrap());
        drop(unit);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn large_body_is_written_as_script_reads() {
        let dir = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..1u32 << 20).map(|i| b'a' + (i % 26) as u8).collect();
        let command = command(dir.path(), "printf '\\n\\n'\ncat\n", Method::Post, &body);
        let mut unit = start(&ForkSpawner, &command, body.clone(), 5).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if unit.input_fd().is_some() && unit.write_input().unwrap() {
                unit.close_input();
            }
            if unit.drain().unwrap() {
                break;
            }
            assert!(Instant::now() < deadline, "script did not finish");
            sleep(Duration::from_millis(1));
        }
        let response = unit.finish().unwrap();
        assert_eq!(response.body.len(), body.len());
        assert!(response.body == body);
    }

    #[test]
    fn expiry() {
        let spawner = FakeSpawner::new();
        let unit = start(&spawner, &fake_command(), Vec::new(), 5).unwrap();
        assert!(!unit.expired(Instant::now()));
        assert!(unit.expired(Instant::now() + CGI_TIMEOUT));
    }

    #[test_case(b"Content-Type: text/plain\r\n\r\nhi", 200, Some("text/plain"), b"hi" ; "crlf")]
    #[test_case(b"Content-Type: text/plain\n\nhi", 200, Some("text/plain"), b"hi" ; "lf")]
    #[test_case(b"hello", 200, Some("text/html"), b"hello" ; "no headers")]
    #[test_case(b"X-Custom: 1\n\n<p>", 200, Some("text/html"), b"<p>" ; "default content type")]
    #[test_case(b"Status: 404 Not Found\r\n\r\nmissing", 404, Some("text/html"), b"missing" ; "status")]
    #[test_case(b"Location: /elsewhere\r\n\r\n", 302, Some("text/html"), b"" ; "location")]
    #[test_case(b"Status: abc\n\nx", 200, Some("text/html"), b"x" ; "invalid status")]
    fn parse_output_works(output: &[u8], status: u16, content_type: Option<&str>, body: &[u8]) {
        let response = parse_output(output);
        assert_eq!(response.status, status);
        assert_eq!(response.header("Content-Type"), content_type);
        assert_eq!(response.body, body);
    }

    #[test_case(b"Status: 202 Queued\n\n", 202, "Queued" ; "script reason")]
    #[test_case(b"Status: 410\n\n", 410, "Gone" ; "registered reason")]
    #[test_case(b"Status: 299 Almost Fine\r\n\r\n", 299, "Almost Fine" ; "unregistered code")]
    fn parse_output_keeps_reason(output: &[u8], status: u16, reason: &str) {
        let response = parse_output(output);
        assert_eq!(response.status, status);
        assert_eq!(response.reason(), reason);
    }

    #[test]
    fn parse_output_drops_framing_headers() {
        let response = parse_output(b"Content-Length: 99\nConnection: close\nX-A: b\n\nbody");
        assert_eq!(response.header("Content-Length"), None);
        assert_eq!(response.header("Connection"), None);
        assert_eq!(response.header("X-A"), Some("b"));
    }
}
