use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, warn};

pub const NGINX_PORT: u16 = 20000;
pub const IOJS_PORT: u16 = 20001;
pub const NODE_PORT: u16 = 20002;
pub const REGISTRY_PORT: u16 = 20003;

pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 600;
const PROBE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Distro,
    Database,
    Language,
    WebServer,
    WebFramework,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Distro => "distro",
            Category::Database => "database",
            Category::Language => "language",
            Category::WebServer => "web-server",
            Category::WebFramework => "web-framework",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Benchmark {
    pub name: &'static str,
    pub repo: &'static str,
    pub category: Category,
}

/// Static execution parameters for one benchmark image.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub env: &'static [(&'static str, &'static str)],
    pub arg: &'static str,
    pub stdin: &'static str,
    pub stdin_sh: Option<&'static str>,
    pub waitline: &'static str,
    pub mount: &'static [(&'static str, &'static str)],
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            env: &[],
            arg: "",
            stdin: "",
            stdin_sh: Some("sh"),
            waitline: "",
            mount: &[],
        }
    }
}

/// Configuration for the HTTP-polled service benchmarks.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub host_port: u16,
    pub container_port: u16,
    pub env: &'static [(&'static str, &'static str)],
    pub mount: Option<(&'static str, &'static str)>,
    pub arg: &'static str,
}

/// How a started container is observed to completion and shut down.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Foreground `echo hello`; the container exits on its own.
    EchoHello,
    /// Foreground run with a fixed argument string.
    ArgOnly(RunArgs),
    /// Background named container; done once a log line contains the
    /// configured substring, then the container is killed.
    ArgWait(RunArgs),
    /// Interactive run fed a payload on stdin; done on process exit.
    StdinPiped(RunArgs),
    /// Background named container polled over HTTP until it responds,
    /// then killed.
    HttpReady(HttpProbe),
}

struct Entry {
    bench: Benchmark,
    strategy: WaitStrategy,
}

pub struct Catalogue {
    entries: Vec<Entry>,
}

fn entry(name: &'static str, category: Category, strategy: WaitStrategy) -> Entry {
    Entry {
        bench: Benchmark {
            name,
            repo: name,
            category,
        },
        strategy,
    }
}

impl Catalogue {
    pub fn new() -> Self {
        use Category::*;
        use WaitStrategy::*;
        let entries = vec![
            entry("alpine", Distro, EchoHello),
            entry("busybox", Distro, EchoHello),
            entry("crux", Distro, EchoHello),
            entry("cirros", Distro, EchoHello),
            entry("debian", Distro, EchoHello),
            entry("ubuntu", Distro, EchoHello),
            entry("ubuntu-upstart", Distro, EchoHello),
            entry("ubuntu-debootstrap", Distro, EchoHello),
            entry("centos", Distro, EchoHello),
            entry("fedora", Distro, EchoHello),
            entry("mageia", Distro, EchoHello),
            entry(
                "mysql",
                Database,
                ArgWait(RunArgs {
                    env: &[("MYSQL_ROOT_PASSWORD", "abc")],
                    waitline: "mysqld: ready for connections",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "percona",
                Database,
                ArgWait(RunArgs {
                    env: &[("MYSQL_ROOT_PASSWORD", "abc")],
                    waitline: "mysqld: ready for connections",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "mariadb",
                Database,
                ArgWait(RunArgs {
                    env: &[("MYSQL_ROOT_PASSWORD", "abc")],
                    waitline: "mysqld: ready for connections",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "postgres",
                Database,
                ArgWait(RunArgs {
                    env: &[("POSTGRES_PASSWORD", "abc")],
                    waitline: "database system is ready to accept connections",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "redis",
                Database,
                ArgWait(RunArgs {
                    waitline: "Ready to accept connections",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "crate",
                Database,
                ArgWait(RunArgs {
                    waitline: "started",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "rethinkdb",
                Database,
                ArgWait(RunArgs {
                    waitline: "Server ready",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "php",
                Language,
                StdinPiped(RunArgs {
                    stdin: r#"php -r "echo \"hello\n\";""#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "ruby",
                Language,
                StdinPiped(RunArgs {
                    stdin: r#"ruby -e "puts \"hello\"""#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "jruby",
                Language,
                StdinPiped(RunArgs {
                    stdin: r#"jruby -e "puts \"hello\"""#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "julia",
                Language,
                StdinPiped(RunArgs {
                    stdin: r#"julia -e 'println("hello")'"#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "perl",
                Language,
                ArgOnly(RunArgs {
                    arg: r#"perl -e 'print("hello\n")'"#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "rakudo-star",
                Language,
                ArgOnly(RunArgs {
                    arg: r#"perl6 -e 'print("hello\n")'"#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "pypy",
                Language,
                ArgOnly(RunArgs {
                    arg: r#"pypy3 -c 'print("hello")'"#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "python",
                Language,
                ArgOnly(RunArgs {
                    arg: r#"python -c 'print("hello")'"#,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "golang",
                Language,
                StdinPiped(RunArgs {
                    stdin: "cd /go/src; go run main.go",
                    mount: &[("go", "/go/src")],
                    ..RunArgs::default()
                }),
            ),
            entry(
                "haskell",
                Language,
                StdinPiped(RunArgs {
                    stdin: r#""hello""#,
                    stdin_sh: None,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "hylang",
                Language,
                StdinPiped(RunArgs {
                    stdin: r#"(print "hello")"#,
                    stdin_sh: None,
                    ..RunArgs::default()
                }),
            ),
            entry(
                "java",
                Language,
                StdinPiped(RunArgs {
                    stdin: "cd /src; javac Main.java; java Main",
                    mount: &[("java", "/src")],
                    ..RunArgs::default()
                }),
            ),
            entry(
                "mono",
                Language,
                StdinPiped(RunArgs {
                    stdin: "cd /src; mcs main.cs; mono main.exe",
                    mount: &[("mono", "/src")],
                    ..RunArgs::default()
                }),
            ),
            entry(
                "r-base",
                Language,
                StdinPiped(RunArgs {
                    stdin: r#"sprintf("hello")"#,
                    stdin_sh: Some("R --no-save"),
                    ..RunArgs::default()
                }),
            ),
            entry(
                "gcc",
                Language,
                StdinPiped(RunArgs {
                    stdin: "cd /src; gcc main.c; ./a.out",
                    mount: &[("gcc", "/src")],
                    ..RunArgs::default()
                }),
            ),
            entry(
                "cassandra",
                Database,
                ArgWait(RunArgs {
                    waitline: "Startup complete",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "mongo",
                Database,
                ArgWait(RunArgs {
                    waitline: "Listening on",
                    ..RunArgs::default()
                }),
            ),
            entry("hello-world", Other, ArgOnly(RunArgs::default())),
            entry(
                "ghost",
                Other,
                ArgWait(RunArgs {
                    waitline: "Ghost boot",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "drupal",
                Other,
                ArgWait(RunArgs {
                    waitline: "apache2 -D FOREGROUND",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "jenkins",
                Other,
                ArgWait(RunArgs {
                    waitline: "Jenkins is fully up and running",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "sonarqube",
                Other,
                ArgWait(RunArgs {
                    waitline: "Process[web] is up",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "rabbitmq",
                Other,
                ArgWait(RunArgs {
                    waitline: "Server startup complete",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "registry",
                Other,
                HttpReady(HttpProbe {
                    host_port: REGISTRY_PORT,
                    container_port: 5000,
                    env: &[("GUNICORN_OPTS", r#"["--preload"]"#)],
                    mount: None,
                    arg: "",
                }),
            ),
            entry(
                "httpd",
                WebServer,
                ArgWait(RunArgs {
                    waitline: "httpd -D FOREGROUND",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "nginx",
                WebServer,
                HttpReady(HttpProbe {
                    host_port: NGINX_PORT,
                    container_port: 80,
                    env: &[],
                    mount: None,
                    arg: "",
                }),
            ),
            entry(
                "glassfish",
                WebServer,
                ArgWait(RunArgs {
                    waitline: "Running GlassFish",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "jetty",
                WebServer,
                ArgWait(RunArgs {
                    waitline: "main: Started",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "tomcat",
                WebServer,
                ArgWait(RunArgs {
                    waitline: "Server startup",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "django",
                WebFramework,
                StdinPiped(RunArgs {
                    stdin: "django-admin startproject hello",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "rails",
                WebFramework,
                StdinPiped(RunArgs {
                    stdin: "rails new hello",
                    ..RunArgs::default()
                }),
            ),
            entry(
                "node",
                WebFramework,
                HttpReady(HttpProbe {
                    host_port: NODE_PORT,
                    container_port: 80,
                    env: &[],
                    mount: Some(("node", "/src")),
                    arg: "node /src/index.js",
                }),
            ),
            entry(
                "iojs",
                WebFramework,
                HttpReady(HttpProbe {
                    host_port: IOJS_PORT,
                    container_port: 80,
                    env: &[],
                    mount: Some(("iojs", "/src")),
                    arg: "iojs /src/index.js",
                }),
            ),
        ];
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Benchmark> {
        self.entries.iter().map(|e| &e.bench)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn strategy(&self, name: &str) -> Result<&WaitStrategy> {
        self.entries
            .iter()
            .find(|e| e.bench.name == name)
            .map(|e| &e.strategy)
            .ok_or_else(|| anyhow!("unknown_benchmark: {}", name))
    }

    /// Resolve a comma-separated selection; any `all` element selects the
    /// whole catalogue.
    pub fn select(&self, names: &str) -> Result<Vec<&Benchmark>> {
        let mut picked = Vec::new();
        for name in names.split(',') {
            if name == "all" {
                return Ok(self.iter().collect());
            }
            let found = self
                .entries
                .iter()
                .find(|e| e.bench.name == name)
                .ok_or_else(|| anyhow!("unknown_benchmark: {}", name))?;
            picked.push(&found.bench);
        }
        Ok(picked)
    }
}

impl Default for Catalogue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Run,
    Pull,
    Push,
    Tag,
    Move,
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Operation::Run),
            "pull" => Ok(Operation::Pull),
            "push" => Ok(Operation::Push),
            "tag" => Ok(Operation::Tag),
            "move" => Ok(Operation::Move),
            other => Err(anyhow!("unknown_operation: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanPolicy {
    None,
    First,
    Each,
}

impl FromStr for CleanPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CleanPolicy::None),
            "first" => Ok(CleanPolicy::First),
            "each" => Ok(CleanPolicy::Each),
            other => Err(anyhow!("unknown_clean_policy: {}", other)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultRecord {
    pub repo: String,
    pub category: Category,
    pub clean_policy: CleanPolicy,
    pub bench: String,
    pub op: Operation,
    pub elapsed: f64,
    pub runtime: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Appends one JSON record per benchmark to the output file and mirrors
/// each record to stdout. Line 1 of the file is the invocation comment.
#[derive(Debug)]
pub struct Reporter {
    out: fs::File,
}

impl Reporter {
    pub fn create(path: &Path, invocation: &str) -> Result<Self> {
        let mut out = fs::File::create(path)
            .with_context(|| format!("cannot open output file {}", path.display()))?;
        writeln!(out, "# {}", invocation)?;
        Ok(Self { out })
    }

    pub fn record(&mut self, record: &ResultRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        println!("{}", line);
        writeln!(self.out, "{}", line)?;
        Ok(())
    }
}

// UTC+9 wall clock, matching the timestamps in existing result logs.
pub fn start_timestamp() -> String {
    (Utc::now() + chrono::Duration::hours(9))
        .format("%Y-%m-%d-%H-%M-%S")
        .to_string()
}

pub fn copy_trace(src: &Path, dir: &Path, repo: &str) -> Result<String> {
    let dst = dir.join(format!("{}.trace", repo));
    fs::copy(src, &dst).with_context(|| {
        format!(
            "trace_copy_failed: {} -> {}",
            src.display(),
            dst.display()
        )
    })?;
    Ok(dst.display().to_string())
}

/// Runs composed command lines through `sh -c` and enforces the
/// zero-exit-code convention of the engine CLI.
#[derive(Debug, Clone, Copy)]
pub struct Invoker {
    pub verbose: bool,
}

impl Invoker {
    pub fn run(&self, cmdline: &str) -> Result<()> {
        debug!(cmd = %cmdline, "exec");
        let status = if self.verbose {
            Command::new("sh").arg("-c").arg(cmdline).status()?
        } else {
            let output = Command::new("sh")
                .arg("-c")
                .arg(cmdline)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()?;
            if !output.status.success() {
                eprint!("{}", String::from_utf8_lossy(&output.stderr));
            }
            output.status
        };
        if !status.success() {
            bail!("engine_command_failed: `{}` exited with {}", cmdline, status);
        }
        Ok(())
    }

    pub fn capture(&self, cmdline: &str) -> Result<String> {
        debug!(cmd = %cmdline, "exec (capture)");
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmdline)
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            bail!(
                "engine_command_failed: `{}` exited with {}",
                cmdline,
                output.status
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Scoped staging area for mount copies. The directory and everything
/// staged into it is removed when the handle drops, on every exit path.
#[derive(Debug)]
pub struct Staging {
    root: TempDir,
    next: u64,
}

impl Staging {
    pub fn new() -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("ibench-")
            .tempdir()
            .context("cannot create staging directory")?;
        Ok(Self { root, next: 0 })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Copy `src` into a fresh numbered subdirectory and return the copy's
    /// path. The container mounts the copy, never the original.
    pub fn stage_copy(&mut self, src: &Path) -> Result<PathBuf> {
        self.next += 1;
        let dst = self.root.path().join(self.next.to_string());
        copy_dir(src, &dst)
            .with_context(|| format!("staging copy of {} failed", src.display()))?;
        Ok(dst)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for item in walkdir::WalkDir::new(src).follow_links(true) {
        let item = item?;
        let rel = item.path().strip_prefix(src)?;
        if rel.as_os_str().is_empty() {
            fs::create_dir_all(dst)?;
            continue;
        }
        let target = dst.join(rel);
        if item.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(item.path(), &target)?;
        }
    }
    Ok(())
}

fn container_name(repo: &str) -> String {
    format!("{}_bench_{}", repo, rand::thread_rng().gen_range(1..=1_000_000))
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// Read lines from a container's output stream until one contains `needle`
/// as a byte substring. Returns the matching line; lines after the match
/// are never examined.
fn watch_for_line<R>(stream: R, needle: &[u8], timeout: Duration) -> Result<Vec<u8>>
where
    R: Read + Send + 'static,
{
    let needle_shown = String::from_utf8_lossy(needle).to_string();
    let (tx, rx) = mpsc::channel();
    // The reader thread ends at EOF or once the receiver is gone.
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.split(b'\n') {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            bail!(
                "readiness_timeout: log line {:?} not seen within {:?}",
                needle_shown,
                timeout
            );
        }
        match rx.recv_timeout(deadline.saturating_duration_since(now)) {
            Ok(line) => {
                debug!(out = %String::from_utf8_lossy(&line), "container output");
                if contains_bytes(&line, needle) {
                    return Ok(line);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                bail!(
                    "readiness_timeout: log line {:?} not seen within {:?}",
                    needle_shown,
                    timeout
                );
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                bail!(
                    "container output closed before log line {:?} appeared",
                    needle_shown
                );
            }
        }
    }
}

/// Poll `http://localhost:<port>/` until a successful response arrives.
fn wait_for_http_ready(port: u16, interval: Duration, timeout: Duration) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let url = format!("http://localhost:{}/", port);
    let deadline = Instant::now() + timeout;
    loop {
        match client.get(&url).send() {
            Ok(response) if response.status().is_success() => {
                let _ = response.bytes();
                return Ok(());
            }
            Ok(_) | Err(_) => {
                if Instant::now() >= deadline {
                    bail!(
                        "readiness_timeout: no HTTP response on port {} within {:?}",
                        port,
                        timeout
                    );
                }
                thread::sleep(interval);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub engine: String,
    pub registry: String,
    pub registry2: Option<String>,
    pub data_dir: PathBuf,
    pub verbose: bool,
    pub ready_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            registry: "docker.io".to_string(),
            registry2: None,
            data_dir: PathBuf::from("."),
            verbose: false,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceSpec {
    pub file: PathBuf,
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub op: Operation,
    pub clean: CleanPolicy,
    pub start_time: String,
    pub trace: Option<TraceSpec>,
}

fn registry_prefix(registry: &str) -> String {
    if registry.is_empty() {
        String::new()
    } else {
        format!("{}/", registry)
    }
}

pub struct BenchRunner {
    engine: String,
    registry: String,
    registry2: String,
    invoker: Invoker,
    staging: Staging,
    data_dir: PathBuf,
    ready_timeout: Duration,
}

impl BenchRunner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let registry = registry_prefix(&config.registry);
        let registry2 = registry_prefix(
            config
                .registry2
                .as_deref()
                .unwrap_or("localhost:5000"),
        );
        Ok(Self {
            engine: config.engine,
            registry,
            registry2,
            invoker: Invoker {
                verbose: config.verbose,
            },
            staging: Staging::new()?,
            data_dir: config.data_dir,
            ready_timeout: config.ready_timeout,
        })
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    /// Run every selected benchmark in order, timing the operation and
    /// emitting one record each. The first failure aborts the batch.
    pub fn execute(
        &mut self,
        catalogue: &Catalogue,
        benches: &[&Benchmark],
        plan: &RunPlan,
        reporter: &mut Reporter,
    ) -> Result<()> {
        if plan.clean != CleanPolicy::None {
            self.clean_images();
        }
        for bench in benches {
            if plan.clean == CleanPolicy::Each {
                self.clean_images();
            }
            debug!(bench = bench.name, "start");
            let start = Instant::now();
            self.operation(plan.op, catalogue, bench)?;
            let elapsed = start.elapsed().as_secs_f64();
            let trace = match &plan.trace {
                Some(trace) => Some(copy_trace(&trace.file, &trace.dir, bench.repo)?),
                None => None,
            };
            let record = ResultRecord {
                repo: bench.repo.to_string(),
                category: bench.category,
                clean_policy: plan.clean,
                bench: bench.name.to_string(),
                op: plan.op,
                elapsed,
                runtime: self.engine.clone(),
                start_time: plan.start_time.clone(),
                trace,
            };
            reporter.record(&record)?;
        }
        Ok(())
    }

    pub fn operation(
        &mut self,
        op: Operation,
        catalogue: &Catalogue,
        bench: &Benchmark,
    ) -> Result<()> {
        match op {
            Operation::Run => {
                let strategy = catalogue.strategy(bench.name)?;
                self.run_strategy(bench.repo, strategy)
            }
            Operation::Pull => self.pull(bench),
            Operation::Push => self.push(bench, false),
            Operation::Tag => self.tag(bench),
            Operation::Move => {
                self.pull(bench)?;
                self.tag(bench)?;
                self.push(bench, true)
            }
        }
    }

    fn run_strategy(&mut self, repo: &str, strategy: &WaitStrategy) -> Result<()> {
        match strategy {
            WaitStrategy::EchoHello => self.run_echo_hello(repo),
            WaitStrategy::ArgOnly(args) => self.run_cmd_arg(repo, args),
            WaitStrategy::ArgWait(args) => self.run_cmd_arg_wait(repo, args),
            WaitStrategy::StdinPiped(args) => self.run_cmd_stdin(repo, args),
            WaitStrategy::HttpReady(probe) => self.run_http_probe(repo, probe),
        }
    }

    fn run_echo_hello(&self, repo: &str) -> Result<()> {
        self.invoker.run(&self.echo_hello_cmd(repo))
    }

    fn run_cmd_arg(&self, repo: &str, args: &RunArgs) -> Result<()> {
        if !args.mount.is_empty() {
            bail!("mounts are not supported for foreground runs: {}", repo);
        }
        self.invoker.run(&self.arg_cmd(repo, args))
    }

    fn run_cmd_arg_wait(&self, repo: &str, args: &RunArgs) -> Result<()> {
        let name = container_name(repo);
        let cmd = self.arg_wait_cmd(&name, repo, args);
        debug!(cmd = %cmd, "run and watch");
        // Several images print their ready line on stderr; fold it in.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("{} 2>&1", cmd))
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout pipe for {}", name))?;
        match watch_for_line(stdout, args.waitline.as_bytes(), self.ready_timeout) {
            Ok(_) => {
                self.invoker.run(&self.kill_cmd(&name))?;
                child.wait()?;
                Ok(())
            }
            Err(err) => {
                let _ = self.invoker.run(&self.kill_cmd(&name));
                let _ = child.wait();
                Err(err)
            }
        }
    }

    fn run_cmd_stdin(&mut self, repo: &str, args: &RunArgs) -> Result<()> {
        let mut staged = Vec::new();
        for &(src, dst) in args.mount {
            let host = self.staging.stage_copy(&self.data_dir.join(src))?;
            staged.push((host, dst));
        }
        let cmd = self.stdin_cmd(repo, args, &staged);
        debug!(cmd = %cmd, stdin = args.stdin, "stdin run");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        command.stderr(if self.invoker.verbose {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        let mut child = command.spawn()?;
        // Feed stdin from its own thread while stdout is drained below, so
        // a container filling the stdout pipe cannot wedge the write.
        let writer = child.stdin.take().map(|mut stdin| {
            let payload = args.stdin;
            thread::spawn(move || {
                let _ = stdin.write_all(payload.as_bytes());
            })
        });
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        debug!(out = %String::from_utf8_lossy(&output.stdout), "container output");
        if !output.status.success() {
            bail!(
                "engine_command_failed: `{}` exited with {}",
                cmd,
                output.status
            );
        }
        Ok(())
    }

    fn run_http_probe(&mut self, repo: &str, probe: &HttpProbe) -> Result<()> {
        let staged = match probe.mount {
            Some((src, _)) => Some(self.staging.stage_copy(&self.data_dir.join(src))?),
            None => None,
        };
        let name = container_name(repo);
        let cmd = self.probe_cmd(&name, repo, probe, staged.as_deref());
        debug!(cmd = %cmd, port = probe.host_port, "run and poll");
        let mut command = Command::new("sh");
        command.arg("-c").arg(&cmd);
        if !self.invoker.verbose {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let mut child: Child = command.spawn()?;
        match wait_for_http_ready(probe.host_port, PROBE_INTERVAL, self.ready_timeout) {
            Ok(()) => {
                self.invoker.run(&self.kill_cmd(&name))?;
                child.wait()?;
                Ok(())
            }
            Err(err) => {
                let _ = self.invoker.run(&self.kill_cmd(&name));
                let _ = child.wait();
                Err(err)
            }
        }
    }

    fn pull(&self, bench: &Benchmark) -> Result<()> {
        self.invoker
            .run(&format!("{} pull {}{}", self.engine, self.registry, bench.name))
    }

    fn push(&self, bench: &Benchmark, to2: bool) -> Result<()> {
        let registry = if to2 { &self.registry2 } else { &self.registry };
        self.invoker
            .run(&format!("{} push {}{}", self.engine, registry, bench.name))
    }

    fn tag(&self, bench: &Benchmark) -> Result<()> {
        self.invoker.run(&format!(
            "{} tag {}{} {}{}",
            self.engine, self.registry, bench.name, self.registry2, bench.name
        ))
    }

    /// Remove all stopped containers and prune unused images. Best-effort:
    /// failures are logged, never fatal.
    pub fn clean_images(&self) {
        self.clean_containers();
        if let Err(err) = self
            .invoker
            .run(&format!("{} image prune -af", self.engine))
        {
            warn!(error = %err, "image prune failed");
        }
    }

    fn clean_containers(&self) {
        let listed = self.invoker.capture(&format!("{} ps -aq", self.engine));
        let ids: Vec<String> = match listed {
            Ok(out) => out.split_whitespace().map(str::to_string).collect(),
            Err(err) => {
                warn!(error = %err, "container listing failed");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        if let Err(err) = self
            .invoker
            .run(&format!("{} rm {}", self.engine, ids.join(" ")))
        {
            warn!(error = %err, "container removal failed");
        }
    }

    fn echo_hello_cmd(&self, repo: &str) -> String {
        format!("{} run {}{} echo hello", self.engine, self.registry, repo)
    }

    fn arg_cmd(&self, repo: &str, args: &RunArgs) -> String {
        let mut cmd = format!("{} run {}{}", self.engine, self.registry, repo);
        if !args.arg.is_empty() {
            cmd.push(' ');
            cmd.push_str(args.arg);
        }
        cmd
    }

    fn arg_wait_cmd(&self, name: &str, repo: &str, args: &RunArgs) -> String {
        let mut cmd = format!("{} run --name={}", self.engine, name);
        for &(key, value) in args.env {
            cmd.push_str(&format!(" -e {}={}", key, value));
        }
        cmd.push_str(&format!(" {}{}", self.registry, repo));
        if !args.arg.is_empty() {
            cmd.push(' ');
            cmd.push_str(args.arg);
        }
        cmd
    }

    fn stdin_cmd(&self, repo: &str, args: &RunArgs, staged: &[(PathBuf, &str)]) -> String {
        let mut cmd = format!("{} run", self.engine);
        for (host, dst) in staged {
            cmd.push_str(&format!(" -v {}:{}", host.display(), dst));
        }
        cmd.push_str(&format!(" -i {}{}", self.registry, repo));
        if let Some(sh) = args.stdin_sh {
            cmd.push(' ');
            cmd.push_str(sh);
        }
        cmd
    }

    fn probe_cmd(
        &self,
        name: &str,
        repo: &str,
        probe: &HttpProbe,
        staged: Option<&Path>,
    ) -> String {
        let mut cmd = format!(
            "{} run --name={} -p {}:{}",
            self.engine, name, probe.host_port, probe.container_port
        );
        for &(key, value) in probe.env {
            cmd.push_str(&format!(" -e {}={}", key, value));
        }
        if let (Some(host), Some((_, dst))) = (staged, probe.mount) {
            cmd.push_str(&format!(" -v {}:{}", host.display(), dst));
        }
        cmd.push_str(&format!(" {}{}", self.registry, repo));
        if !probe.arg.is_empty() {
            cmd.push(' ');
            cmd.push_str(probe.arg);
        }
        cmd
    }

    fn kill_cmd(&self, name: &str) -> String {
        format!("{} kill {}", self.engine, name)
    }
}
