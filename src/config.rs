//! Site configuration.
//!
//! The file uses an nginx-like grammar:
//!
//! ```text
//! server {
//!     listen 127.0.0.1:8080;
//!     root ./www;
//!     error_page 404 /errors/404.html;
//!     location /cgi-bin {
//!         allowed_methods GET POST;
//!         cgi_ext .py /usr/bin/python3;
//!     }
//! }
//! ```
//!
//! Parsing happens in three passes: tokens, a tree of directives, then validated structs.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use crate::request::Method;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_BODY: usize = 1 << 20;

/// Every configured virtual server, in file order. Indices are stable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
    /// Zero means unlimited.
    pub max_body: usize,
    pub error_pages: HashMap<u16, String>,
    /// Sorted longest path first, ties broken lexicographically. Always contains "/".
    pub locations: Vec<Location>,
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }

    /// The "/" location, which is always present.
    pub fn root_location(&self) -> Option<&Location> {
        self.locations.iter().find(|location| location.path == "/")
    }
}

/// A `return` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub code: u16,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub root: Option<String>,
    pub index: Option<String>,
    pub autoindex: bool,
    /// Empty means every method is allowed.
    pub methods: Vec<Method>,
    pub upload_path: Option<String>,
    /// Script extension (with its dot) to interpreter.
    pub cgi: HashMap<String, String>,
    pub redirect: Option<Redirect>,
}

impl Location {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            root: None,
            index: None,
            autoindex: false,
            methods: Vec::new(),
            upload_path: None,
            cgi: HashMap::new(),
            redirect: None,
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }

    /// Value of the `Allow` header sent with 405.
    pub fn allow_header(&self) -> String {
        let methods: &[Method] = if self.methods.is_empty() {
            &[Method::Get, Method::Post, Method::Delete]
        } else {
            &self.methods
        };
        methods
            .iter()
            .map(|method| method.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Interpreter for a script extension such as ".py".
    pub fn interpreter(&self, extension: &str) -> Option<&str> {
        self.cgi.get(extension).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Semicolon,
    Open,
    Close,
}

/// Split configuration text into tokens tagged with their line number.
fn tokenize(text: &str) -> Vec<(Token, usize)> {
    let mut tokens = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let mut word = String::new();
        for c in line.chars() {
            let token = match c {
                ';' => Some(Token::Semicolon),
                '{' => Some(Token::Open),
                '}' => Some(Token::Close),
                c if c.is_whitespace() => None,
                c => {
                    word.push(c);
                    continue;
                }
            };
            if !word.is_empty() {
                tokens.push((Token::Word(std::mem::take(&mut word)), number + 1));
            }
            if let Some(token) = token {
                tokens.push((token, number + 1));
            }
        }
        if !word.is_empty() {
            tokens.push((Token::Word(word), number + 1));
        }
    }
    tokens
}

/// A directive and, for blocks, its children.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    name: String,
    args: Vec<String>,
    block: bool,
    children: Vec<Node>,
    line: usize,
}

/// Build the directive tree from tokens, starting at `*pos`.
fn parse_nodes(tokens: &[(Token, usize)], pos: &mut usize, nested: bool) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut line = 0;
    while *pos < tokens.len() {
        let (token, token_line) = &tokens[*pos];
        *pos += 1;
        match token {
            Token::Word(word) => {
                if words.is_empty() {
                    line = *token_line;
                }
                words.push(word.clone());
            }
            Token::Semicolon | Token::Open if words.is_empty() => {
                bail!("line {}: unexpected `{}'", token_line, token_text(token));
            }
            Token::Semicolon => {
                let mut args = std::mem::take(&mut words);
                let name = args.remove(0);
                nodes.push(Node {
                    name,
                    args,
                    block: false,
                    children: Vec::new(),
                    line,
                });
            }
            Token::Open => {
                let mut args = std::mem::take(&mut words);
                let name = args.remove(0);
                let children = parse_nodes(tokens, pos, true)?;
                nodes.push(Node {
                    name,
                    args,
                    block: true,
                    children,
                    line,
                });
            }
            Token::Close => {
                if !words.is_empty() {
                    bail!("line {}: missing `;' after `{}'", line, words[0]);
                }
                if !nested {
                    bail!("line {}: unexpected `}}'", token_line);
                }
                return Ok(nodes);
            }
        }
    }
    if !words.is_empty() {
        bail!("line {}: missing `;' after `{}'", line, words[0]);
    }
    if nested {
        bail!("unexpected end of file, missing `}}'");
    }
    Ok(nodes)
}

fn token_text(token: &Token) -> &str {
    match token {
        Token::Word(word) => word,
        Token::Semicolon => ";",
        Token::Open => "{",
        Token::Close => "}",
    }
}

/// Where a directive may appear and how many arguments it takes.
struct Validity {
    name: &'static str,
    contexts: &'static [&'static str],
    block: bool,
    repeatable: bool,
    min_args: usize,
    max_args: usize,
}

#[rustfmt::skip]
const VALID_DIRECTIVES: &[Validity] = &[
    Validity { name: "events", contexts: &["main"], block: true, repeatable: false, min_args: 0, max_args: 0 },
    Validity { name: "http", contexts: &["main"], block: true, repeatable: false, min_args: 0, max_args: 0 },
    Validity { name: "server", contexts: &["main", "http"], block: true, repeatable: true, min_args: 0, max_args: 0 },
    Validity { name: "listen", contexts: &["server"], block: false, repeatable: false, min_args: 1, max_args: 1 },
    Validity { name: "client_max_body_size", contexts: &["server"], block: false, repeatable: false, min_args: 1, max_args: 1 },
    Validity { name: "error_page", contexts: &["server"], block: false, repeatable: true, min_args: 2, max_args: usize::MAX },
    Validity { name: "location", contexts: &["server"], block: true, repeatable: true, min_args: 1, max_args: 1 },
    Validity { name: "root", contexts: &["server", "location"], block: false, repeatable: false, min_args: 1, max_args: 1 },
    Validity { name: "index", contexts: &["server", "location"], block: false, repeatable: false, min_args: 1, max_args: 1 },
    Validity { name: "allowed_methods", contexts: &["server", "location"], block: false, repeatable: false, min_args: 1, max_args: 3 },
    Validity { name: "upload_path", contexts: &["server", "location"], block: false, repeatable: false, min_args: 1, max_args: 1 },
    Validity { name: "cgi_ext", contexts: &["server", "location"], block: false, repeatable: false, min_args: 2, max_args: usize::MAX },
    Validity { name: "autoindex", contexts: &["location"], block: false, repeatable: false, min_args: 1, max_args: 1 },
    Validity { name: "return", contexts: &["location"], block: false, repeatable: false, min_args: 1, max_args: 2 },
];

/// Check context, block-ness, arity and repetition of every directive under `context`.
fn validate(nodes: &[Node], context: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for node in nodes {
        let validity = VALID_DIRECTIVES
            .iter()
            .find(|validity| validity.name == node.name)
            .ok_or_else(|| anyhow!("line {}: unknown directive `{}'", node.line, node.name))?;
        if !validity.contexts.contains(&context) {
            bail!(
                "line {}: directive `{}' is not allowed in `{}'",
                node.line,
                node.name,
                context
            );
        }
        if validity.block != node.block {
            bail!(
                "line {}: directive `{}' {}",
                node.line,
                node.name,
                if validity.block {
                    "must be a block"
                } else {
                    "must end with `;'"
                }
            );
        }
        if !validity.repeatable && !seen.insert(node.name.as_str()) {
            bail!("line {}: duplicate directive `{}'", node.line, node.name);
        }
        if node.args.len() < validity.min_args || node.args.len() > validity.max_args {
            bail!(
                "line {}: wrong number of arguments for `{}'",
                node.line,
                node.name
            );
        }
        if node.name != "events" {
            validate(&node.children, &node.name)?;
        }
    }
    Ok(())
}

/// Parse `host:port`, `:port` or `port`.
fn parse_listen(value: &str) -> Result<(Ipv4Addr, u16)> {
    let (host, port) = match value.rfind(':') {
        Some(pos) => (&value[..pos], &value[pos + 1..]),
        None => ("", value),
    };
    let host = if host.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        host.parse()
            .with_context(|| format!("invalid IPv4 address `{}'", host))?
    };
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid port `{}'", port);
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok((host, port)),
        _ => bail!("port `{}' is out of range", port),
    }
}

/// Parse a size with an optional `k`, `m` or `g` suffix.
pub fn parse_size(value: &str) -> Result<usize> {
    let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 1 << 10),
        Some('m') => (&value[..value.len() - 1], 1 << 20),
        Some('g') => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid size `{}'", value);
    }
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| anyhow!("size `{}' is too large", value))
}

fn parse_methods(args: &[String]) -> Result<Vec<Method>> {
    let mut methods = Vec::new();
    for arg in args {
        let method = arg
            .parse()
            .map_err(|_| anyhow!("unsupported method `{}'", arg))?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    Ok(methods)
}

fn parse_cgi(args: &[String]) -> Result<HashMap<String, String>> {
    if args.len() % 2 != 0 {
        bail!("expected pairs of extension and interpreter");
    }
    let mut cgi = HashMap::new();
    for pair in args.chunks(2) {
        let (extension, interpreter) = (&pair[0], &pair[1]);
        if !extension.starts_with('.') || extension.len() < 2 || extension[1..].contains('.') {
            bail!("invalid extension `{}'", extension);
        }
        cgi.insert(extension.clone(), interpreter.clone());
    }
    Ok(cgi)
}

fn parse_return(args: &[String]) -> Result<Redirect> {
    let code = match args[0].parse::<u16>() {
        Ok(code) => code,
        Err(_) if args.len() == 1 => {
            return Ok(Redirect {
                code: 302,
                target: Some(args[0].clone()),
            })
        }
        Err(_) => bail!("invalid status code `{}'", args[0]),
    };
    if !(100..=599).contains(&code) {
        bail!("status code {} is out of range", code);
    }
    let target = args.get(1).cloned();
    match (code, &target) {
        (300..=399, None) => bail!("redirect {} needs a target", code),
        (300..=399, Some(_)) => {}
        (_, Some(_)) => bail!("status {} does not take a target", code),
        (_, None) => {}
    }
    Ok(Redirect { code, target })
}

fn parse_root(value: &str) -> String {
    let root = value.trim_end_matches('/');
    if root.is_empty() { "/" } else { root }.to_string()
}

fn parse_index(value: &str) -> Result<String> {
    if value.contains('/') || value == "." || value == ".." {
        bail!("index `{}' must be a file name", value);
    }
    Ok(value.to_string())
}

/// Apply a directive valid in both server and location context.
fn apply_shared(location: &mut Location, node: &Node) -> Result<bool> {
    match node.name.as_str() {
        "root" => location.root = Some(parse_root(&node.args[0])),
        "index" => location.index = Some(parse_index(&node.args[0])?),
        "allowed_methods" => location.methods = parse_methods(&node.args)?,
        "upload_path" => location.upload_path = Some(parse_root(&node.args[0])),
        "cgi_ext" => location.cgi = parse_cgi(&node.args)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn build_location(node: &Node, defaults: &Location) -> Result<Location> {
    let path = &node.args[0];
    if !path.starts_with('/') {
        bail!("location path `{}' must start with `/'", path);
    }
    let mut location = Location::new(path);
    let mut set = HashSet::new();
    for child in &node.children {
        let applied = apply_shared(&mut location, child)
            .with_context(|| format!("line {}: invalid `{}'", child.line, child.name))?;
        if applied {
            set.insert(child.name.as_str());
            continue;
        }
        match child.name.as_str() {
            "autoindex" => {
                location.autoindex = match child.args[0].as_str() {
                    "on" => true,
                    "off" => false,
                    _ => bail!("line {}: autoindex must be `on' or `off'", child.line),
                }
            }
            "return" => {
                location.redirect = Some(
                    parse_return(&child.args)
                        .with_context(|| format!("line {}: invalid `return'", child.line))?,
                )
            }
            _ => {}
        }
    }
    inherit(&mut location, defaults, &set);
    Ok(location)
}

/// Fill what a location did not set from the server defaults.
fn inherit(location: &mut Location, defaults: &Location, set: &HashSet<&str>) {
    if !set.contains("root") {
        location.root = defaults.root.clone();
    }
    if !set.contains("index") {
        location.index = defaults.index.clone();
    }
    if !set.contains("allowed_methods") {
        location.methods = defaults.methods.clone();
    }
    if !set.contains("upload_path") {
        location.upload_path = defaults.upload_path.clone();
    }
    if !set.contains("cgi_ext") {
        location.cgi = defaults.cgi.clone();
    }
}

fn build_server(node: &Node) -> Result<ServerConfig> {
    let mut server = ServerConfig {
        host: Ipv4Addr::UNSPECIFIED,
        port: DEFAULT_PORT,
        max_body: DEFAULT_MAX_BODY,
        error_pages: HashMap::new(),
        locations: Vec::new(),
    };
    let mut defaults = Location::new("/");
    for child in &node.children {
        let context = || format!("line {}: invalid `{}'", child.line, child.name);
        if apply_shared(&mut defaults, child).with_context(context)? {
            continue;
        }
        match child.name.as_str() {
            "listen" => {
                let (host, port) = parse_listen(&child.args[0]).with_context(context)?;
                server.host = host;
                server.port = port;
            }
            "client_max_body_size" => {
                server.max_body = parse_size(&child.args[0]).with_context(context)?
            }
            "error_page" => {
                let (uri, codes) = child.args.split_last().ok_or_else(|| anyhow!(context()))?;
                if !uri.starts_with('/') {
                    bail!("{}: page `{}' must start with `/'", context(), uri);
                }
                for code in codes {
                    match code.parse::<u16>() {
                        Ok(code) if (400..=599).contains(&code) => {
                            server.error_pages.insert(code, uri.clone());
                        }
                        _ => bail!("{}: status code `{}' is not 400-599", context(), code),
                    }
                }
            }
            _ => {}
        }
    }

    let mut paths = HashSet::new();
    for child in node.children.iter().filter(|child| child.name == "location") {
        let location = build_location(child, &defaults)?;
        if !paths.insert(location.path.clone()) {
            bail!("line {}: duplicate location `{}'", child.line, location.path);
        }
        server.locations.push(location);
    }
    if !paths.contains("/") {
        let mut location = Location::new("/");
        inherit(&mut location, &defaults, &HashSet::new());
        server.locations.push(location);
    }
    for location in &server.locations {
        if location.root.is_none() && location.redirect.is_none() {
            bail!(
                "line {}: location `{}' has neither `root' nor `return'",
                node.line,
                location.path
            );
        }
    }
    server
        .locations
        .sort_by(|a, b| b.path.len().cmp(&a.path.len()).then_with(|| a.path.cmp(&b.path)));
    Ok(server)
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid configuration {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text);
        let mut pos = 0;
        let nodes = parse_nodes(&tokens, &mut pos, false)?;
        validate(&nodes, "main")?;

        let server_nodes: Vec<&Node> = nodes
            .iter()
            .flat_map(|node| match node.name.as_str() {
                "server" => vec![node],
                "http" => node.children.iter().collect(),
                _ => Vec::new(),
            })
            .filter(|node| node.name == "server")
            .collect();
        if server_nodes.is_empty() {
            bail!("no `server' block");
        }

        let mut servers = Vec::new();
        let mut addrs = HashSet::new();
        for node in server_nodes {
            let server = build_server(node)?;
            if !addrs.insert(server.addr()) {
                bail!("line {}: duplicate listen address {}", node.line, server.addr());
            }
            servers.push(server);
        }
        Ok(Self { servers })
    }
}
