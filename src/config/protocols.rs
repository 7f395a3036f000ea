//! Protocol indirection resolver.
//!
//! String values of the form `<protocol>:<argument>` are replaced by the value
//! the protocol produces:
//!
//! | protocol  | effect                                                  |
//! |-----------|---------------------------------------------------------|
//! | `file`    | contents of the file at the path                        |
//! | `path`    | the path resolved against the tree's base directory     |
//! | `base64`  | decoded payload (`|binary` yields a byte array)         |
//! | `env`     | environment variable (`|d` number, `|b` / `|!b` bool)   |
//! | `require` | parsed JSON/YAML document, itself resolved              |
//! | `exec`    | trimmed stdout of `sh -c <command>`                     |
//! | `glob`    | sorted absolute paths matching the pattern              |
//! | `resolve` | another already loaded value, by dotted path           |
//!
//! A handler's output is resolved again until no token is left, so resolving
//! an already resolved document changes nothing. `resolve` tokens are deferred
//! until every other token of the document has been replaced, so they always
//! see fully resolved values.

use super::merge::deep_merge;
use crate::error::{ConfigError, Result};
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::{BoxFuture, FutureExt, try_join_all};
use regex_lite::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::WalkDir;
use wildmatch::WildMatchPattern;

/// Nesting limit for `require` chains, re-resolved handler output and deferred
/// reference passes.
const MAX_DEPTH: usize = 16;

/// What the `env` protocol does with a variable that is not set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvPolicy {
    /// Fail the token, and with it the whole document.
    #[default]
    Fail,
    /// Substitute `null`.
    Null,
}

/// State handed to a protocol handler for one token.
pub struct ResolveContext<'a> {
    /// Directory relative paths are resolved against.
    pub basedir: &'a Path,
    /// Dotted path of the token inside the document.
    pub key_path: &'a str,
    pub env_policy: EnvPolicy,
    /// Resolved document, present only for deferred handlers.
    pub document: Option<&'a Value>,
    resolver: &'a Resolver,
    depth: usize,
}

impl ResolveContext<'_> {
    /// Resolve a value produced by a handler (e.g. a required document).
    pub async fn resolve_nested(&self, value: Value) -> Result<Value> {
        if self.depth >= MAX_DEPTH {
            return Err(ConfigError::resolution(
                self.key_path,
                "require",
                "nesting limit exceeded",
            ));
        }
        self.resolver.resolve_at_depth(value, None, self.depth + 1).await
    }
}

/// A handler for one protocol identifier.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn resolve(&self, argument: &str, ctx: &ResolveContext<'_>) -> anyhow::Result<Value>;

    /// Deferred handlers run after all non-deferred tokens are resolved.
    fn deferred(&self) -> bool {
        false
    }
}

/// Built-in protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    File,
    Path,
    Base64,
    Env,
    Require,
    Exec,
    Glob,
    Resolve,
}

impl Protocol {
    pub const ALL: [Protocol; 8] = [
        Protocol::File,
        Protocol::Path,
        Protocol::Base64,
        Protocol::Env,
        Protocol::Require,
        Protocol::Exec,
        Protocol::Glob,
        Protocol::Resolve,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::File => "file",
            Protocol::Path => "path",
            Protocol::Base64 => "base64",
            Protocol::Env => "env",
            Protocol::Require => "require",
            Protocol::Exec => "exec",
            Protocol::Glob => "glob",
            Protocol::Resolve => "resolve",
        }
    }
}

#[async_trait]
impl ProtocolHandler for Protocol {
    async fn resolve(&self, argument: &str, ctx: &ResolveContext<'_>) -> anyhow::Result<Value> {
        match self {
            Protocol::File => {
                let path = ctx.basedir.join(argument);
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("cannot read {}", path.display()))?;
                Ok(Value::String(content))
            }
            Protocol::Path => Ok(Value::String(
                ctx.basedir.join(argument).to_string_lossy().into_owned(),
            )),
            Protocol::Base64 => decode_base64(argument),
            Protocol::Env => read_env(argument, ctx.env_policy),
            Protocol::Require => require(argument, ctx).await,
            Protocol::Exec => exec(argument, ctx.basedir).await,
            Protocol::Glob => {
                let pattern = ctx.basedir.join(argument);
                let matches = tokio::task::spawn_blocking(move || expand_glob(&pattern)).await??;
                Ok(Value::Array(matches.into_iter().map(Value::String).collect()))
            }
            Protocol::Resolve => {
                let document = ctx
                    .document
                    .ok_or_else(|| anyhow!("no document to resolve against"))?;
                lookup_reference(document, argument, ctx.key_path)
            }
        }
    }

    fn deferred(&self) -> bool {
        matches!(self, Protocol::Resolve)
    }
}

fn split_filter(argument: &str) -> (&str, Option<&str>) {
    match argument.rsplit_once('|') {
        Some((value, filter)) => (value, Some(filter)),
        None => (argument, None),
    }
}

fn decode_base64(argument: &str) -> anyhow::Result<Value> {
    let (payload, filter) = split_filter(argument);
    let bytes = STANDARD.decode(payload.trim()).context("invalid base64 payload")?;
    match filter {
        Some("binary") => Ok(Value::Array(bytes.into_iter().map(Value::from).collect())),
        Some("utf8") | None => Ok(Value::String(
            String::from_utf8(bytes).context("decoded payload is not UTF-8")?,
        )),
        Some(other) => bail!("unknown base64 filter `{other}`"),
    }
}

fn read_env(argument: &str, policy: EnvPolicy) -> anyhow::Result<Value> {
    let (name, filter) = split_filter(argument);
    let value = std::env::var(name).ok();

    match filter {
        Some("b") => Ok(Value::Bool(env_truthy(value.as_deref()))),
        Some("!b") => Ok(Value::Bool(!env_truthy(value.as_deref()))),
        Some("d") => {
            let Some(raw) = value else {
                return unset_env(name, policy);
            };
            let number: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{name}={raw:?} is not a number"))?;
            // Keep integers integral.
            if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
                Ok(Value::from(number as i64))
            } else {
                Ok(Value::from(number))
            }
        }
        Some(other) => bail!("unknown env filter `{other}`"),
        None => match value {
            Some(raw) => Ok(Value::String(raw)),
            None => unset_env(name, policy),
        },
    }
}

fn env_truthy(value: Option<&str>) -> bool {
    !matches!(value, None | Some("") | Some("0") | Some("false"))
}

fn unset_env(name: &str, policy: EnvPolicy) -> anyhow::Result<Value> {
    match policy {
        EnvPolicy::Fail => bail!("environment variable {name} is not set"),
        EnvPolicy::Null => Ok(Value::Null),
    }
}

async fn require(argument: &str, ctx: &ResolveContext<'_>) -> anyhow::Result<Value> {
    let mut path = ctx.basedir.join(argument);
    if path.extension().is_none() && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        path.set_extension("json");
    }

    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;

    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
            .with_context(|| format!("invalid YAML in {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("invalid JSON in {}", path.display()))?,
    };

    Ok(ctx.resolve_nested(value).await?)
}

async fn exec(command: &str, basedir: &Path) -> anyhow::Result<Value> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    if basedir.is_dir() {
        cmd.current_dir(basedir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("cannot run `{command}`"))?;

    if !output.status.success() {
        bail!(
            "`{command}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Value::String(stdout.trim_end_matches(['\n', '\r']).to_string()))
}

/// Absolute form of `path` with `.` and `..` folded away, without touching disk.
fn normalize(path: &Path) -> std::io::Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

fn expand_glob(pattern: &Path) -> anyhow::Result<Vec<String>> {
    let pattern = normalize(pattern)
        .with_context(|| format!("cannot make {} absolute", pattern.display()))?;

    // Walk from the deepest directory that has no wildcard in it.
    let mut root = PathBuf::new();
    for component in pattern.components() {
        if component.as_os_str().to_string_lossy().contains(['*', '?']) {
            break;
        }
        root.push(component);
    }
    // Matches sit exactly as deep as the pattern.
    let depth = pattern.components().count() - root.components().count();

    let pattern_text = pattern.to_string_lossy();
    let matcher = WildMatchPattern::<'*', '?'>::new(&pattern_text);

    let mut matches: Vec<String> = WalkDir::new(&root)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .filter(|path| matcher.matches(path))
        .collect();
    matches.sort();
    Ok(matches)
}

fn lookup_reference(document: &Value, reference: &str, key_path: &str) -> anyhow::Result<Value> {
    let mut seen = HashSet::from([key_path.to_string()]);
    let mut current = reference.to_string();

    loop {
        if !seen.insert(current.clone()) {
            bail!("reference cycle through `{current}`");
        }
        let value = lookup_path(document, &current)
            .ok_or_else(|| anyhow!("no value at `{current}`"))?;

        // Follow reference chains.
        match value.as_str().and_then(|s| s.strip_prefix("resolve:")) {
            Some(next) => current = next.to_string(),
            None => return Ok(value.clone()),
        }
    }
}

/// Look up a dotted path (`a.b.0.c`) inside a document.
pub fn lookup_path<'v>(document: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(document);
    }
    path.split('.').try_fold(document, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_path_mut<'v>(document: &'v mut Value, path: &[String]) -> Option<&'v mut Value> {
    path.iter().try_fold(document, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

/// A protocol token found in a document.
struct Token {
    path: Vec<String>,
    protocol: String,
    argument: String,
}

/// Resolver for protocol tokens, bound to one source tree's base directory.
#[derive(Clone)]
pub struct Resolver {
    basedir: PathBuf,
    env_policy: EnvPolicy,
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
    token: Regex,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("basedir", &self.basedir)
            .field("env_policy", &self.env_policy)
            .field("protocols", &self.protocols())
            .finish()
    }
}

impl Resolver {
    /// Create a resolver with every built-in protocol registered.
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        let mut resolver = Self {
            basedir: basedir.into(),
            env_policy: EnvPolicy::default(),
            handlers: HashMap::new(),
            token: Regex::new(r"(?s)^([A-Za-z][A-Za-z0-9_-]*):(.*)$")
                .expect("token pattern is valid"),
        };
        for protocol in Protocol::ALL {
            resolver = resolver.with_handler(protocol.name(), Arc::new(protocol));
        }
        resolver
    }

    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.env_policy = policy;
        self
    }

    /// Register (or replace) the handler for a protocol identifier.
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Registered protocol identifiers, sorted.
    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve every protocol token in `document`.
    ///
    /// Either the whole document resolves or an error naming the offending key
    /// path is returned.
    pub async fn resolve(&self, document: Value) -> Result<Value> {
        self.resolve_at_depth(document, None, 0).await
    }

    /// Resolve `document` as an overlay of the already resolved `scope`.
    ///
    /// `resolve` references see `scope` deep-merged with `document`, so an
    /// environment document can refer to values of its tree's defaults. Only
    /// `document` is resolved and returned.
    pub async fn resolve_in_scope(&self, document: Value, scope: &Value) -> Result<Value> {
        self.resolve_at_depth(document, Some(scope), 0).await
    }

    async fn resolve_at_depth(
        &self,
        document: Value,
        scope: Option<&Value>,
        depth: usize,
    ) -> Result<Value> {
        let mut resolved = self.resolve_node(document, Vec::new(), depth).await?;
        self.resolve_deferred(&mut resolved, scope, depth).await?;
        Ok(resolved)
    }

    fn parse_token<'s>(&self, value: &'s str) -> Option<(&'s str, &'s str)> {
        let caps = self.token.captures(value)?;
        let protocol = caps.get(1)?.as_str();
        self.handlers
            .contains_key(protocol)
            .then(|| (protocol, caps.get(2).map_or("", |m| m.as_str())))
    }

    fn resolve_node<'a>(
        &'a self,
        value: Value,
        path: Vec<String>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Value>> {
        async move {
            match value {
                Value::Object(map) => {
                    let children = map.into_iter().map(|(key, child)| {
                        let mut child_path = path.clone();
                        child_path.push(key.clone());
                        async move {
                            let resolved = self.resolve_node(child, child_path, depth).await?;
                            Ok::<_, ConfigError>((key, resolved))
                        }
                    });
                    let entries = try_join_all(children).await?;
                    Ok(Value::Object(entries.into_iter().collect::<Map<_, _>>()))
                }
                Value::Array(items) => {
                    let children = items.into_iter().enumerate().map(|(i, child)| {
                        let mut child_path = path.clone();
                        child_path.push(i.to_string());
                        self.resolve_node(child, child_path, depth)
                    });
                    Ok(Value::Array(try_join_all(children).await?))
                }
                Value::String(text) => {
                    let Some((protocol, argument)) = self.parse_token(&text) else {
                        return Ok(Value::String(text));
                    };
                    let handler = &self.handlers[protocol];
                    if handler.deferred() {
                        return Ok(Value::String(text));
                    }
                    let key_path = display_path(&path);
                    if depth > MAX_DEPTH {
                        return Err(ConfigError::resolution(
                            key_path,
                            protocol,
                            "nesting limit exceeded",
                        ));
                    }
                    trace!(key = %key_path, protocol, "resolving token");
                    let value = self
                        .run_handler(handler.as_ref(), protocol, argument, &key_path, None, depth)
                        .await?;
                    // Handler output may itself be a token.
                    self.resolve_node(value, path, depth + 1).await
                }
                other => Ok(other),
            }
        }
        .boxed()
    }

    async fn run_handler(
        &self,
        handler: &dyn ProtocolHandler,
        protocol: &str,
        argument: &str,
        key_path: &str,
        document: Option<&Value>,
        depth: usize,
    ) -> Result<Value> {
        let ctx = ResolveContext {
            basedir: &self.basedir,
            key_path,
            env_policy: self.env_policy,
            document,
            resolver: self,
            depth,
        };
        handler
            .resolve(argument, &ctx)
            .await
            .map_err(|err| ConfigError::resolution(key_path, protocol, format!("{err:#}")))
    }

    fn collect_deferred(&self, value: &Value, path: &mut Vec<String>, out: &mut Vec<Token>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    path.push(key.clone());
                    self.collect_deferred(child, path, out);
                    path.pop();
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    path.push(i.to_string());
                    self.collect_deferred(child, path, out);
                    path.pop();
                }
            }
            Value::String(text) => {
                if let Some((protocol, argument)) = self.parse_token(text)
                    && self.handlers[protocol].deferred()
                {
                    out.push(Token {
                        path: path.clone(),
                        protocol: protocol.to_string(),
                        argument: argument.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    async fn resolve_deferred(
        &self,
        document: &mut Value,
        scope: Option<&Value>,
        depth: usize,
    ) -> Result<()> {
        for pass in 0..MAX_DEPTH {
            let mut pending = Vec::new();
            self.collect_deferred(document, &mut Vec::new(), &mut pending);
            if pending.is_empty() {
                return Ok(());
            }
            debug!(pass, tokens = pending.len(), "resolving deferred tokens");

            let snapshot = match scope {
                Some(scope) => deep_merge(scope.clone(), document.clone()),
                None => document.clone(),
            };
            for token in pending {
                let key_path = display_path(&token.path);
                let handler = self.handlers[&token.protocol].as_ref();
                let value = self
                    .run_handler(
                        handler,
                        &token.protocol,
                        &token.argument,
                        &key_path,
                        Some(&snapshot),
                        depth,
                    )
                    .await?;
                if let Some(slot) = lookup_path_mut(document, &token.path) {
                    *slot = value;
                }
            }
        }

        let mut pending = Vec::new();
        self.collect_deferred(document, &mut Vec::new(), &mut pending);
        match pending.first() {
            None => Ok(()),
            Some(token) => Err(ConfigError::resolution(
                display_path(&token.path),
                token.protocol.clone(),
                "references are nested too deeply",
            )),
        }
    }
}
