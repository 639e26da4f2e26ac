//! Template rendering of the proxy configuration tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use minijinja::{AutoEscape, Environment, UndefinedBehavior, context};
use serde::Serialize;

use pkg_constants::paths::{CERTS_DIR, HTTP_CONF_FILE, MAIN_CONF_FILE, STREAM_CONF_FILE};
use pkg_store::{Location, Protocol, Snapshot, VirtualService};

use crate::helpers::{build_lua_header_router, build_next_upstream, checked_size};

const MAIN_TEMPLATE: &str = include_str!("templates/nginx.conf.j2");
const HTTP_TEMPLATE: &str = include_str!("templates/http.conf.j2");
const STREAM_TEMPLATE: &str = include_str!("templates/stream.conf.j2");

/// Settings that shape the rendered tree independent of cluster state.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub status_port: u16,
    pub stream_port: u16,
    pub monitor_port: u16,
    pub pid_file: PathBuf,
    /// Empty disables the access log.
    pub access_log: String,
    pub enable_metrics: bool,
    pub enable_ssl_stapling: bool,
    pub retry_non_idempotent: bool,
}

/// Rendered files keyed by path relative to the config directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedConfig {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl RenderedConfig {
    pub fn insert(&mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        self.files.get(path.as_ref()).map(Vec::as_slice)
    }

    pub fn get_str(&self, path: impl AsRef<Path>) -> Option<&str> {
        self.get(path).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn files(&self) -> impl Iterator<Item = (&PathBuf, &Vec<u8>)> {
        self.files.iter()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Serialize)]
struct ProxyView {
    connect_timeout: u32,
    send_timeout: u32,
    read_timeout: u32,
    body_size: Option<String>,
    buffer_size: Option<String>,
    buffers_number: u32,
    buffering: bool,
    request_buffering: bool,
    next_upstream: String,
    next_upstream_tries: u32,
    next_upstream_timeout: u32,
}

#[derive(Serialize)]
struct LocationView {
    matcher: String,
    router: String,
    rewrites: Vec<String>,
    app_root: Option<String>,
    proxy: ProxyView,
}

#[derive(Serialize)]
struct ServerView {
    listen: Vec<String>,
    server_name: String,
    certificate: Option<String>,
    locations: Vec<LocationView>,
}

#[derive(Serialize)]
struct StreamServerView {
    listen: String,
    udp: bool,
    pool: String,
}

pub struct Renderer {
    env: Environment<'static>,
    options: RenderOptions,
}

impl Renderer {
    pub fn new(options: RenderOptions) -> anyhow::Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);
        env.add_template(MAIN_CONF_FILE, MAIN_TEMPLATE)?;
        env.add_template(HTTP_CONF_FILE, HTTP_TEMPLATE)?;
        env.add_template(STREAM_CONF_FILE, STREAM_TEMPLATE)?;
        Ok(Self { env, options })
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Render the complete tree for `snapshot`. Deterministic for equal input.
    pub fn render(&self, snapshot: &Snapshot) -> anyhow::Result<RenderedConfig> {
        let mut out = RenderedConfig::default();
        let o = &self.options;

        let main = self.env.get_template(MAIN_CONF_FILE)?.render(context! {
            pid_file => o.pid_file.display().to_string(),
            status_port => o.status_port,
            stream_port => o.stream_port,
            monitor_port => o.monitor_port,
            access_log => o.access_log.as_str(),
            enable_metrics => o.enable_metrics,
            enable_ssl_stapling => o.enable_ssl_stapling,
        })?;
        out.insert(MAIN_CONF_FILE, main);

        let servers: Vec<ServerView> = snapshot.l7_services.iter().map(|vs| self.server_view(vs)).collect();
        let http = self
            .env
            .get_template(HTTP_CONF_FILE)?
            .render(context! { servers => servers })?;
        out.insert(HTTP_CONF_FILE, http);

        let streams: Vec<StreamServerView> = snapshot
            .l4_services
            .iter()
            .filter_map(|vs| {
                Some(StreamServerView {
                    listen: vs.listening.iter().next()?.clone(),
                    udp: vs.protocol == Protocol::Udp,
                    pool: vs.default_pool.clone()?,
                })
            })
            .collect();
        let stream = self
            .env
            .get_template(STREAM_CONF_FILE)?
            .render(context! { servers => streams })?;
        out.insert(STREAM_CONF_FILE, stream);

        for vs in &snapshot.l7_services {
            if let Some(cert) = &vs.ssl {
                let mut pem = cert.certificate_pem.trim_end().to_string();
                pem.push('\n');
                pem.push_str(cert.private_key_pem.trim_end());
                pem.push('\n');
                out.insert(Path::new(CERTS_DIR).join(cert.file_name()), pem);
            }
        }

        Ok(out)
    }

    fn server_view(&self, vs: &VirtualService) -> ServerView {
        ServerView {
            listen: vs
                .listening
                .iter()
                .map(|l| l.trim_start_matches(':').to_string())
                .collect(),
            server_name: vs.server_name.clone(),
            certificate: vs
                .ssl
                .as_ref()
                .map(|c| format!("{}/{}", CERTS_DIR, c.file_name())),
            locations: vs.locations.iter().map(|l| self.location_view(l)).collect(),
        }
    }

    fn location_view(&self, location: &Location) -> LocationView {
        let matcher = if location.exact {
            format!("= {}", location.path)
        } else {
            location.path.clone()
        };

        let mut rewrites = Vec::new();
        let mut app_root = None;
        if let Some(rw) = &location.rewrite {
            if let Some(target) = &rw.target {
                rewrites.push(format!(
                    "rewrite \"^{}(.*)$\" {}$1 break",
                    location.path.trim_end_matches('/'),
                    target.trim_end_matches('/')
                ));
            }
            for rule in &rw.rules {
                let mut line = format!("rewrite \"{}\" {}", rule.regex, rule.replacement);
                if let Some(flag) = &rule.flag {
                    line.push(' ');
                    line.push_str(flag);
                }
                rewrites.push(line);
            }
            app_root = rw.app_root.clone();
        }

        let p = &location.proxy;
        LocationView {
            matcher,
            router: build_lua_header_router(location),
            rewrites,
            app_root,
            proxy: ProxyView {
                connect_timeout: p.connect_timeout,
                send_timeout: p.send_timeout,
                read_timeout: p.read_timeout,
                body_size: checked_size("proxy-body-size", &p.body_size, true),
                buffer_size: checked_size("proxy-buffer-size", &p.buffer_size, false),
                buffers_number: p.buffers_number,
                buffering: p.buffering,
                request_buffering: p.request_buffering,
                next_upstream: build_next_upstream(&p.next_upstream, self.options.retry_non_idempotent),
                next_upstream_tries: p.next_upstream_tries,
                next_upstream_timeout: p.next_upstream_timeout,
            },
        }
    }
}
