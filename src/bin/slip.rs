//! slip - command-line client for the slipway deployment daemon
//!
//! Usage:
//!   slip init [name]             Register an app and write slipway.toml
//!   slip deploy [app]            Deploy the app's pushed HEAD
//!   slip build [app]             Build an image without deploying it
//!   slip status [app]            Show all apps, or detail for one
//!   slip logs <app>              Tail the running container's logs
//!   slip restart <app>|--all     Re-run the active deployment's container
//!   slip stop <app>              Stop the container and retract the route
//!   slip rollback <app> [seq]    Redeploy a previously built image
//!   slip destroy <app>           Remove the app and everything it owns

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Default API URL
const DEFAULT_API_URL: &str = "http://127.0.0.1:7700";

const EXIT_OK: i32 = 0;
const EXIT_OTHER: i32 = 1;
const EXIT_VALIDATION: i32 = 2;
const EXIT_BUILD: i32 = 3;
const EXIT_DEPLOY: i32 = 4;
const EXIT_NOT_FOUND: i32 = 5;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const WAIT_TIMEOUT: Duration = Duration::from_secs(1800);

/// CLI configuration stored in ~/.slipway/config.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CliConfig {
    /// Daemon endpoint
    api_url: Option<String>,
    /// API token
    api_token: Option<String>,
    /// App this directory was initialized as
    current_app: Option<String>,
}

/// API response wrapper
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Application as the daemon reports it; list responses carry only the
/// leading fields, detail responses fill in the rest.
#[derive(Debug, Deserialize)]
struct AppInfo {
    name: String,
    state: String,
    created_at: String,
    active_seq: Option<i64>,
    in_progress_seq: Option<i64>,
    active_container_name: Option<String>,
    active_port: Option<u16>,
    #[serde(default)]
    degraded: bool,
    hostname: String,
    route: Option<RouteInfo>,
    remote: Option<String>,
    latest: Option<DeploymentInfo>,
    #[serde(default)]
    stages: Vec<StageInfo>,
}

#[derive(Debug, Deserialize)]
struct RouteInfo {
    backend: String,
}

#[derive(Debug, Deserialize)]
struct DeploymentInfo {
    seq: i64,
    revision: String,
    trigger: String,
    image: Option<String>,
    outcome: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    build_log_path: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StageInfo {
    stage: String,
    status: String,
    detail: Option<String>,
}

/// Creation response: app fields plus onboarding material
#[derive(Debug, Deserialize)]
struct CreatedAppInfo {
    name: String,
    hostname: String,
    remote: String,
    manifest_example: String,
}

#[derive(Debug, Deserialize)]
struct LogsInfo {
    container: String,
    lines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StopInfo {
    cancelled_in_flight: bool,
    dropped_pending: bool,
    stopped_container: Option<String>,
}

#[derive(Debug)]
enum Command {
    Init { name: Option<String> },
    Deploy { app: Option<String>, revision: Option<String>, detach: bool },
    Build { app: Option<String>, detach: bool },
    Status { app: Option<String> },
    Logs { app: Option<String>, tail: Option<usize> },
    Restart { app: Option<String>, all: bool },
    Stop { app: String },
    Rollback { app: String, seq: Option<i64> },
    Destroy { app: String, force: bool },
    Config(ConfigCommand),
    Help,
    Version,
    Invalid(String),
}

#[derive(Debug)]
enum ConfigCommand {
    Show,
    ApiUrl { url: Option<String> },
    Token { token: Option<String> },
}

/// Simple HTTP client for API calls
struct ApiClient {
    base_url: String,
    token: String,
}

impl ApiClient {
    fn new() -> Result<Self> {
        let config = load_config()?;
        // Environment wins over the config file
        let base_url = env::var("SLIPWAY_API_URL")
            .ok()
            .or(config.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let token = env::var("SLIPWAY_API_TOKEN")
            .ok()
            .or(config.api_token)
            .unwrap_or_default();

        Ok(Self { base_url, token })
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<(u16, String)> {
        // Parse URL
        let url = format!("{}{}", self.base_url, path);
        let url = url.strip_prefix("http://").unwrap_or(&url);
        let (host_port, path) = if let Some(idx) = url.find('/') {
            (&url[..idx], &url[idx..])
        } else {
            (url, "/")
        };

        // Connect
        let mut stream = TcpStream::connect(host_port).with_context(|| {
            format!("failed to connect to the daemon at {}", self.base_url)
        })?;

        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(30)))?;

        // Build request
        let body_bytes = body.unwrap_or("");
        let request = format!(
            "{} {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Authorization: Bearer {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            method,
            path,
            host_port,
            self.token,
            body_bytes.len(),
            body_bytes
        );

        // Send request
        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        // Read response
        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        let status: u16 = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .context("malformed response from the daemon")?;

        // Body starts after the header block
        let body = response
            .find("\r\n\r\n")
            .map(|idx| response[idx + 4..].to_string())
            .unwrap_or_default();

        Ok((status, body))
    }

    fn get(&self, path: &str) -> Result<(u16, String)> {
        self.request("GET", path, None)
    }

    fn post(&self, path: &str, body: &str) -> Result<(u16, String)> {
        self.request("POST", path, Some(body))
    }

    fn delete(&self, path: &str) -> Result<(u16, String)> {
        self.request("DELETE", path, None)
    }
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<ApiResponse<T>> {
    serde_json::from_str(body).context("failed to parse API response")
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(EXIT_OTHER);
        }
    }
}

fn run() -> Result<i32> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(EXIT_OK);
    }

    match parse_command(&args[1..]) {
        Command::Help => {
            print_help();
            Ok(EXIT_OK)
        }
        Command::Version => {
            println!("slip {}", env!("CARGO_PKG_VERSION"));
            Ok(EXIT_OK)
        }
        Command::Invalid(msg) => {
            eprintln!("{}", msg);
            eprintln!("Run 'slip help' for usage.");
            Ok(EXIT_VALIDATION)
        }
        Command::Init { name } => handle_init(name),
        Command::Deploy { app, revision, detach } => handle_deploy(app, revision, detach),
        Command::Build { app, detach } => handle_build(app, detach),
        Command::Status { app } => handle_status(app),
        Command::Logs { app, tail } => handle_logs(app, tail),
        Command::Restart { app, all } => handle_restart(app, all),
        Command::Stop { app } => handle_stop(&app),
        Command::Rollback { app, seq } => handle_rollback(&app, seq),
        Command::Destroy { app, force } => handle_destroy(&app, force),
        Command::Config(cmd) => handle_config(cmd),
    }
}

fn parse_command(args: &[String]) -> Command {
    if args.is_empty() {
        return Command::Help;
    }

    match args[0].as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-v" => Command::Version,
        "init" | "create" => Command::Init {
            name: positional(&args[1..], 0),
        },
        "deploy" => parse_deploy_command(&args[1..]),
        "build" => Command::Build {
            app: positional(&args[1..], 0),
            detach: has_flag(&args[1..], "--detach", "-d"),
        },
        "status" | "ps" => Command::Status {
            app: positional(&args[1..], 0),
        },
        "logs" | "log" => parse_logs_command(&args[1..]),
        "restart" => Command::Restart {
            app: positional(&args[1..], 0),
            all: has_flag(&args[1..], "--all", "-a"),
        },
        "stop" => match positional(&args[1..], 0) {
            Some(app) => Command::Stop { app },
            None => Command::Invalid("Usage: slip stop <app>".to_string()),
        },
        "rollback" => parse_rollback_command(&args[1..]),
        "destroy" | "delete" | "rm" => match positional(&args[1..], 0) {
            Some(app) => Command::Destroy {
                app,
                force: has_flag(&args[1..], "--force", "-f"),
            },
            None => Command::Invalid("Usage: slip destroy <app>".to_string()),
        },
        "config" => parse_config_command(&args[1..]),
        other => Command::Invalid(format!("Unknown command: {}", other)),
    }
}

/// Nth argument that is not a flag
fn positional(args: &[String], n: usize) -> Option<String> {
    args.iter().filter(|a| !a.starts_with('-')).nth(n).cloned()
}

fn has_flag(args: &[String], long: &str, short: &str) -> bool {
    args.iter().any(|a| a == long || a == short)
}

fn flag_value(args: &[String], long: &str, short: &str) -> Option<String> {
    args.iter()
        .position(|a| a == long || a == short)
        .and_then(|i| args.get(i + 1).cloned())
}

fn parse_deploy_command(args: &[String]) -> Command {
    let revision = flag_value(args, "--revision", "-r");
    // The revision value must not be mistaken for the app name
    let app = args
        .iter()
        .enumerate()
        .filter(|(i, a)| {
            !a.starts_with('-')
                && !(*i > 0 && (args[i - 1] == "--revision" || args[i - 1] == "-r"))
        })
        .map(|(_, a)| a.clone())
        .next();

    Command::Deploy {
        app,
        revision,
        detach: has_flag(args, "--detach", "-d"),
    }
}

fn parse_logs_command(args: &[String]) -> Command {
    let tail = match flag_value(args, "--lines", "-n") {
        Some(raw) => match raw.parse() {
            Ok(n) => Some(n),
            Err(_) => return Command::Invalid(format!("Invalid line count: {}", raw)),
        },
        None => None,
    };
    let app = args
        .iter()
        .enumerate()
        .filter(|(i, a)| {
            !a.starts_with('-')
                && !(*i > 0 && (args[i - 1] == "--lines" || args[i - 1] == "-n"))
        })
        .map(|(_, a)| a.clone())
        .next();

    Command::Logs { app, tail }
}

fn parse_rollback_command(args: &[String]) -> Command {
    let Some(app) = positional(args, 0) else {
        return Command::Invalid("Usage: slip rollback <app> [seq]".to_string());
    };
    let seq = match positional(args, 1) {
        Some(raw) => match raw.parse() {
            Ok(seq) => Some(seq),
            Err(_) => {
                return Command::Invalid(format!("Invalid deployment number: {}", raw))
            }
        },
        None => None,
    };
    Command::Rollback { app, seq }
}

fn parse_config_command(args: &[String]) -> Command {
    if args.is_empty() {
        return Command::Config(ConfigCommand::Show);
    }

    match args[0].as_str() {
        "api-url" | "api_url" | "url" => Command::Config(ConfigCommand::ApiUrl {
            url: args.get(1).cloned(),
        }),
        "api-token" | "api_token" | "token" => Command::Config(ConfigCommand::Token {
            token: args.get(1).cloned(),
        }),
        "show" | "list" => Command::Config(ConfigCommand::Show),
        other => Command::Invalid(format!("Unknown config command: {}", other)),
    }
}

fn handle_init(name: Option<String>) -> Result<i32> {
    let name = name.unwrap_or_else(|| {
        std::env::current_dir()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "my-app".to_string())
    });

    println!("Registering app: {}", name);
    println!();

    let client = ApiClient::new()?;
    let body = serde_json::json!({ "name": name });
    let (status, response) = client.post("/apps", &body.to_string())?;

    if status == 409 {
        // Already registered; connect this directory to it
        let (status, response) = client.get(&format!("/apps/{}", name))?;
        if status != 200 {
            println!("App {} already exists but could not be fetched.", name);
            return Ok(EXIT_OTHER);
        }
        let result: ApiResponse<AppInfo> = parse(&response)?;
        let Some(app) = result.data else {
            return Ok(EXIT_OTHER);
        };

        let mut config = load_config()?;
        config.current_app = Some(name.clone());
        save_config(&config)?;

        println!("App {} already exists; connected to it.", name);
        if let Some(remote) = &app.remote {
            println!();
            println!("Push remote:");
            println!("  git remote add slipway {}", remote);
        }
        return Ok(EXIT_OK);
    }

    if status == 400 {
        let result: ApiResponse<serde_json::Value> = parse(&response)?;
        println!(
            "Invalid app name: {}",
            result.error.unwrap_or_else(|| "rejected by the daemon".to_string())
        );
        return Ok(EXIT_VALIDATION);
    }

    let result: ApiResponse<CreatedAppInfo> = parse(&response)?;
    if !result.success {
        println!(
            "Failed to register app: {}",
            result.error.unwrap_or_default()
        );
        return Ok(EXIT_OTHER);
    }
    let Some(app) = result.data else {
        return Ok(EXIT_OTHER);
    };

    // Starter manifest next to the code; never clobber an existing one
    let manifest_path = std::path::Path::new("slipway.toml");
    if manifest_path.exists() {
        println!("slipway.toml already exists, leaving it untouched");
    } else {
        std::fs::write(manifest_path, &app.manifest_example)
            .context("failed to write slipway.toml")?;
        println!("Wrote slipway.toml");
    }

    let mut config = load_config()?;
    config.current_app = Some(app.name.clone());
    save_config(&config)?;

    println!();
    println!("App {} registered!", app.name);
    println!();
    println!("Next steps:");
    println!();
    println!("  1. Add the git remote:");
    println!("     git remote add slipway {}", app.remote);
    println!();
    println!("  2. Deploy:");
    println!("     git push slipway main");
    println!();
    println!("Your app will be available at: http://{}", app.hostname);

    Ok(EXIT_OK)
}

fn handle_deploy(app: Option<String>, revision: Option<String>, detach: bool) -> Result<i32> {
    let client = ApiClient::new()?;
    let app = target_app(app)?;

    let before = match latest_seq(&client, &app)? {
        LatestSeq::Known(seq) => seq,
        LatestSeq::Missing => return Ok(EXIT_NOT_FOUND),
    };

    let body = match &revision {
        Some(rev) => serde_json::json!({ "revision": rev }).to_string(),
        None => "{}".to_string(),
    };

    println!("Deploying {}...", app);
    let (status, response) = client.post(&format!("/apps/{}/deploy", app), &body)?;
    if let Some(code) = submit_failure(status, &response, &app)? {
        return Ok(code);
    }

    if detach {
        println!("Deployment queued.");
        return Ok(EXIT_OK);
    }

    watch_deployment(&client, &app, before)
}

fn handle_build(app: Option<String>, detach: bool) -> Result<i32> {
    let client = ApiClient::new()?;
    let app = target_app(app)?;

    let before = match latest_seq(&client, &app)? {
        LatestSeq::Known(seq) => seq,
        LatestSeq::Missing => return Ok(EXIT_NOT_FOUND),
    };

    println!("Building {}...", app);
    let (status, response) = client.post(&format!("/apps/{}/build", app), "{}")?;
    if let Some(code) = submit_failure(status, &response, &app)? {
        return Ok(code);
    }

    if detach {
        println!("Build queued.");
        return Ok(EXIT_OK);
    }

    watch_deployment(&client, &app, before)
}

fn handle_status(app: Option<String>) -> Result<i32> {
    let client = ApiClient::new()?;

    let Some(app) = app else {
        return status_overview(&client);
    };

    let (status, response) = client.get(&format!("/apps/{}", app))?;
    if status == 404 {
        println!("App not found: {}", app);
        return Ok(EXIT_NOT_FOUND);
    }
    let result: ApiResponse<AppInfo> = parse(&response)?;
    let Some(info) = result.data else {
        println!(
            "Failed to fetch app: {}",
            result.error.unwrap_or_default()
        );
        return Ok(EXIT_OTHER);
    };

    println!("App: {}", info.name);
    println!();
    println!("State:      {}{}", info.state, if info.degraded { " (degraded)" } else { "" });
    println!("URL:        http://{}", info.hostname);
    if let Some(remote) = &info.remote {
        println!("Remote:     {}", remote);
    }
    println!("Created:    {}", info.created_at);
    if let Some(seq) = info.active_seq {
        let container = info.active_container_name.as_deref().unwrap_or("-");
        let port = info
            .active_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("Active:     v{} ({} on port {})", seq, container, port);
    }
    if let Some(seq) = info.in_progress_seq {
        println!("Deploying:  v{}", seq);
    }
    if let Some(route) = &info.route {
        println!("Backend:    {}", route.backend);
    }

    if let Some(latest) = &info.latest {
        println!();
        println!(
            "Last deployment: v{} ({}) {}",
            latest.seq,
            latest.trigger,
            short_revision(&latest.revision)
        );
        println!("  Started:   {}", latest.started_at);
        if let Some(finished) = &latest.finished_at {
            println!("  Finished:  {}", finished);
        }
        if let Some(image) = &latest.image {
            println!("  Image:     {}", image);
        }
        match latest.outcome.as_deref() {
            Some(outcome) => println!("  Outcome:   {}", outcome),
            None => println!("  Outcome:   in progress"),
        }
        if let Some(kind) = &latest.error_kind {
            println!(
                "  Failure:   {} ({})",
                kind,
                latest.error_message.as_deref().unwrap_or("no detail")
            );
        }
        if let Some(log) = &latest.build_log_path {
            println!("  Build log: {}", log);
        }
        if !info.stages.is_empty() {
            println!();
            println!("  Stages:");
            for st in &info.stages {
                match &st.detail {
                    Some(detail) => println!("    {:<14} {:<10} {}", st.stage, st.status, detail),
                    None => println!("    {:<14} {}", st.stage, st.status),
                }
            }
        }
    }

    Ok(EXIT_OK)
}

fn status_overview(client: &ApiClient) -> Result<i32> {
    let (status, response) = client.get("/apps")?;
    if status == 401 {
        println!("Unauthorized. Set a token with: slip config token <token>");
        return Ok(EXIT_OTHER);
    }
    let result: ApiResponse<Vec<AppInfo>> = parse(&response)?;
    if !result.success {
        println!(
            "Failed to list apps: {}",
            result.error.unwrap_or_default()
        );
        return Ok(EXIT_OTHER);
    }

    let apps = result.data.unwrap_or_default();
    if apps.is_empty() {
        println!("No apps yet. Create one with: slip init <name>");
        return Ok(EXIT_OK);
    }

    println!(
        "  {:<20} {:<16} {:<8} {:<28} {}",
        "NAME", "STATE", "DEPLOY", "HOSTNAME", "CONTAINER"
    );
    for app in &apps {
        let state = if app.degraded {
            format!("{} (degraded)", app.state)
        } else {
            app.state.clone()
        };
        let deploy = app
            .active_seq
            .map(|s| format!("v{}", s))
            .unwrap_or_else(|| "-".to_string());
        let container = app.active_container_name.as_deref().unwrap_or("-");
        println!(
            "  {:<20} {:<16} {:<8} {:<28} {}",
            app.name, state, deploy, app.hostname, container
        );
    }

    // Daemon summary; best effort, the table above is the point
    if let Ok((200, response)) = client.get("/status") {
        if let Ok(result) = parse::<serde_json::Value>(&response) {
            if let Some(data) = result.data {
                let docker = if data["docker"].as_bool().unwrap_or(false) {
                    "reachable"
                } else {
                    "unreachable"
                };
                println!();
                println!(
                    "Daemon {} {} ({} routes, docker {})",
                    data["name"].as_str().unwrap_or("slipway"),
                    data["version"].as_str().unwrap_or("?"),
                    data["routes"].as_u64().unwrap_or(0),
                    docker
                );
            }
        }
    }

    Ok(EXIT_OK)
}

fn handle_logs(app: Option<String>, tail: Option<usize>) -> Result<i32> {
    let client = ApiClient::new()?;
    let app = target_app(app)?;

    let path = match tail {
        Some(n) => format!("/apps/{}/logs?tail={}", app, n),
        None => format!("/apps/{}/logs", app),
    };

    let (status, response) = client.get(&path)?;
    if status == 404 {
        let result: ApiResponse<serde_json::Value> = parse(&response)?;
        println!(
            "{}",
            result
                .error
                .unwrap_or_else(|| format!("App not found: {}", app))
        );
        return Ok(EXIT_NOT_FOUND);
    }

    let result: ApiResponse<LogsInfo> = parse(&response)?;
    let Some(logs) = result.data else {
        println!(
            "Failed to fetch logs: {}",
            result.error.unwrap_or_default()
        );
        return Ok(EXIT_OTHER);
    };

    if logs.lines.is_empty() {
        println!("No log output yet from {}.", logs.container);
    } else {
        for line in &logs.lines {
            println!("{}", line);
        }
    }

    Ok(EXIT_OK)
}

fn handle_restart(app: Option<String>, all: bool) -> Result<i32> {
    let client = ApiClient::new()?;

    if all {
        let (_, response) = client.get("/apps")?;
        let result: ApiResponse<Vec<AppInfo>> = parse(&response)?;
        let apps = result.data.unwrap_or_default();

        let mut queued = 0;
        let mut failed = 0;
        for app in apps.iter().filter(|a| a.active_seq.is_some()) {
            let (status, response) = client.post(&format!("/apps/{}/restart", app.name), "{}")?;
            if status == 202 {
                queued += 1;
            } else {
                failed += 1;
                let result: ApiResponse<serde_json::Value> = parse(&response)?;
                println!(
                    "  {}: {}",
                    app.name,
                    result.error.unwrap_or_else(|| "restart rejected".to_string())
                );
            }
        }

        println!("Queued restarts for {} app(s).", queued);
        return Ok(if failed > 0 { EXIT_OTHER } else { EXIT_OK });
    }

    let app = target_app(app)?;
    let before = match latest_seq(&client, &app)? {
        LatestSeq::Known(seq) => seq,
        LatestSeq::Missing => return Ok(EXIT_NOT_FOUND),
    };

    println!("Restarting {}...", app);
    let (status, response) = client.post(&format!("/apps/{}/restart", app), "{}")?;
    if let Some(code) = submit_failure(status, &response, &app)? {
        return Ok(code);
    }

    watch_deployment(&client, &app, before)
}

fn handle_stop(app: &str) -> Result<i32> {
    let client = ApiClient::new()?;

    println!("Stopping {}...", app);
    let (status, response) = client.post(&format!("/apps/{}/stop", app), "{}")?;
    if status == 404 {
        println!("App not found: {}", app);
        return Ok(EXIT_NOT_FOUND);
    }

    let result: ApiResponse<StopInfo> = parse(&response)?;
    let Some(summary) = result.data else {
        println!("Failed to stop: {}", result.error.unwrap_or_default());
        return Ok(EXIT_OTHER);
    };

    if summary.cancelled_in_flight {
        println!("  cancelled the in-flight deployment");
    }
    if summary.dropped_pending {
        println!("  dropped a queued deployment");
    }
    match &summary.stopped_container {
        Some(container) => println!("  stopped container {}", container),
        None => println!("  no running container"),
    }
    println!("Stopped. Route retracted; deploy again to bring it back.");

    Ok(EXIT_OK)
}

fn handle_rollback(app: &str, seq: Option<i64>) -> Result<i32> {
    let client = ApiClient::new()?;

    let before = match latest_seq(&client, app)? {
        LatestSeq::Known(seq) => seq,
        LatestSeq::Missing => return Ok(EXIT_NOT_FOUND),
    };

    match seq {
        Some(seq) => println!("Rolling back {} to v{}...", app, seq),
        None => println!("Rolling back {} to the previous good deployment...", app),
    }

    let body = match seq {
        Some(seq) => serde_json::json!({ "seq": seq }).to_string(),
        None => "{}".to_string(),
    };
    let (status, response) = client.post(&format!("/apps/{}/rollback", app), &body)?;
    if let Some(code) = submit_failure(status, &response, app)? {
        return Ok(code);
    }

    watch_deployment(&client, app, before)
}

fn handle_destroy(app: &str, force: bool) -> Result<i32> {
    let client = ApiClient::new()?;

    if !force {
        println!("Destroying app: {}", app);
        println!();
        println!("This will:");
        println!("  - Cancel any in-flight deployment and stop the container");
        println!("  - Remove the database container and its data");
        println!("  - Delete the git repository, images, and route");
        println!();

        print!("Type the app name to confirm: ");
        std::io::stdout().flush()?;
        let mut confirmation = String::new();
        std::io::stdin().read_line(&mut confirmation)?;

        if confirmation.trim() != app {
            println!("Aborted - name did not match");
            return Ok(EXIT_OTHER);
        }
    }

    let (status, response) = client.delete(&format!("/apps/{}", app))?;
    if status == 404 {
        println!("App not found: {}", app);
        return Ok(EXIT_NOT_FOUND);
    }

    let result: ApiResponse<serde_json::Value> = parse(&response)?;
    if !result.success {
        println!(
            "Failed to destroy app: {}",
            result.error.unwrap_or_default()
        );
        return Ok(EXIT_OTHER);
    }

    let mut config = load_config()?;
    if config.current_app.as_deref() == Some(app) {
        config.current_app = None;
        save_config(&config)?;
    }

    println!("Destroyed {}.", app);
    Ok(EXIT_OK)
}

fn handle_config(cmd: ConfigCommand) -> Result<i32> {
    let mut config = load_config()?;

    match cmd {
        ConfigCommand::Show => {
            println!("CLI configuration ({}):", config_path().display());
            println!(
                "  API URL:   {}",
                config.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
            );
            println!(
                "  API token: {}",
                if config.api_token.is_some() { "<set>" } else { "<not set>" }
            );
            println!(
                "  App:       {}",
                config.current_app.as_deref().unwrap_or("<not set>")
            );
        }
        ConfigCommand::ApiUrl { url } => {
            if let Some(url) = url {
                config.api_url = Some(url.clone());
                save_config(&config)?;
                println!("API URL set to: {}", url);
            } else {
                println!(
                    "Current API URL: {}",
                    config.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
                );
            }
        }
        ConfigCommand::Token { token } => {
            if let Some(token) = token {
                config.api_token = Some(token);
                save_config(&config)?;
                println!("API token updated");
            } else {
                println!(
                    "Current API token: {}",
                    if config.api_token.is_some() { "<set>" } else { "<not set>" }
                );
            }
        }
    }

    Ok(EXIT_OK)
}

/// Poll the app until a deployment newer than `after` reaches a terminal
/// outcome, streaming stage transitions as they land.
fn watch_deployment(client: &ApiClient, app: &str, after: Option<i64>) -> Result<i32> {
    let started = Instant::now();
    let mut watching: Option<i64> = None;
    let mut printed = 0usize;

    loop {
        if started.elapsed() > WAIT_TIMEOUT {
            println!("Timed out waiting for the deployment; check: slip status {}", app);
            return Ok(EXIT_OTHER);
        }
        std::thread::sleep(POLL_INTERVAL);

        let (status, response) = client.get(&format!("/apps/{}", app))?;
        if status == 404 {
            // Destroyed underneath us
            println!("App not found: {}", app);
            return Ok(EXIT_NOT_FOUND);
        }
        let result: ApiResponse<AppInfo> = parse(&response)?;
        let Some(info) = result.data else { continue };
        let Some(latest) = info.latest.as_ref() else { continue };

        // Not ours yet; the queue may still be draining
        if let Some(after) = after {
            if latest.seq <= after {
                continue;
            }
        }

        if watching != Some(latest.seq) {
            watching = Some(latest.seq);
            printed = 0;
            println!("Deployment v{} ({}) {}", latest.seq, latest.trigger, short_revision(&latest.revision));
        }

        for st in info.stages.iter().skip(printed) {
            match st.status.as_str() {
                "started" => println!("-----> {}", st.stage),
                "succeeded" => {}
                status => match &st.detail {
                    Some(detail) => println!("       {} {}: {}", st.stage, status, detail),
                    None => println!("       {} {}", st.stage, status),
                },
            }
        }
        printed = info.stages.len();

        if latest.outcome.is_some() {
            return Ok(report_outcome(app, &info, latest));
        }
    }
}

fn report_outcome(app: &str, info: &AppInfo, dep: &DeploymentInfo) -> i32 {
    println!();
    match dep.outcome.as_deref() {
        Some("succeeded") => {
            if dep.trigger == "build" {
                println!(
                    "Image built: {}",
                    dep.image.as_deref().unwrap_or("(unknown)")
                );
            } else {
                println!(
                    "Deployed {} v{} ({})",
                    app,
                    dep.seq,
                    short_revision(&dep.revision)
                );
                println!("Serving at: http://{}", info.hostname);
            }
            EXIT_OK
        }
        Some("degraded") => {
            println!(
                "Deployed {} v{}, but not cleanly: {}",
                app,
                dep.seq,
                dep.error_message.as_deref().unwrap_or("see daemon logs")
            );
            println!("The new container is serving; run 'slip deploy' again to converge.");
            EXIT_OK
        }
        Some("rolled_back") => {
            println!(
                "{}",
                rolled_back_summary(dep.seq, dep.error_kind.as_deref(), info.active_seq)
            );
            if let Some(msg) = &dep.error_message {
                println!("  {}", msg);
            }
            if let Some(log) = &dep.build_log_path {
                println!("Build log: {}", log);
            }
            failure_exit_code(dep.error_kind.as_deref())
        }
        _ => {
            println!(
                "Deployment v{} failed ({})",
                dep.seq,
                dep.error_kind.as_deref().unwrap_or("unknown")
            );
            if let Some(msg) = &dep.error_message {
                println!("  {}", msg);
            }
            if let Some(log) = &dep.build_log_path {
                println!("Build log: {}", log);
            }
            failure_exit_code(dep.error_kind.as_deref())
        }
    }
}

/// One-line verdict for a rolled-back deployment. A first deploy can roll
/// back with nothing promoted before it, in which case nothing is serving.
fn rolled_back_summary(seq: i64, kind: Option<&str>, active_seq: Option<i64>) -> String {
    let kind = kind.unwrap_or("unknown");
    match active_seq {
        Some(active) => format!(
            "Deployment v{} failed ({}); v{} is still serving.",
            seq, kind, active
        ),
        None => format!(
            "Deployment v{} failed ({}); no previous version was serving.",
            seq, kind
        ),
    }
}

fn failure_exit_code(kind: Option<&str>) -> i32 {
    match kind {
        Some("build") => EXIT_BUILD,
        Some("config") => EXIT_VALIDATION,
        Some("cancelled") | Some("internal") => EXIT_OTHER,
        _ => EXIT_DEPLOY,
    }
}

/// Map a submit response; `None` means accepted (202).
fn submit_failure(status: u16, response: &str, app: &str) -> Result<Option<i32>> {
    if status == 202 {
        return Ok(None);
    }
    let result: ApiResponse<serde_json::Value> = parse(response)?;
    let error = result.error.unwrap_or_else(|| "rejected".to_string());
    match status {
        404 => {
            println!("App not found: {}", app);
            Ok(Some(EXIT_NOT_FOUND))
        }
        400 => {
            println!("{}", error);
            Ok(Some(EXIT_VALIDATION))
        }
        _ => {
            println!("{}", error);
            Ok(Some(EXIT_OTHER))
        }
    }
}

enum LatestSeq {
    Known(Option<i64>),
    Missing,
}

/// Latest deployment sequence before submitting, so the watcher knows
/// which deployment is ours.
fn latest_seq(client: &ApiClient, app: &str) -> Result<LatestSeq> {
    let (status, response) = client.get(&format!("/apps/{}", app))?;
    if status == 404 {
        println!("App not found: {}. Register it with: slip init {}", app, app);
        return Ok(LatestSeq::Missing);
    }
    let result: ApiResponse<AppInfo> = parse(&response)?;
    Ok(LatestSeq::Known(
        result.data.and_then(|a| a.latest).map(|d| d.seq),
    ))
}

fn short_revision(revision: &str) -> &str {
    &revision[..revision.len().min(8)]
}

fn target_app(explicit: Option<String>) -> Result<String> {
    if let Some(app) = explicit {
        return Ok(app);
    }

    // Check environment variable first
    if let Ok(app) = env::var("SLIPWAY_APP") {
        if !app.is_empty() {
            return Ok(app);
        }
    }

    // Check if we're in a git repo with a slipway remote
    let output = std::process::Command::new("git")
        .args(["remote", "get-url", "slipway"])
        .output();

    if let Ok(output) = output {
        if output.status.success() {
            let url = String::from_utf8_lossy(&output.stdout);
            if let Some(name) = url.trim().rsplit('/').next() {
                let name = name.trim_end_matches(".git");
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
        }
    }

    // Check config file
    let config = load_config()?;
    if let Some(app) = config.current_app {
        return Ok(app);
    }

    // Default to directory name
    std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .context("cannot determine the app; pass a name or run: slip init")
}

fn print_help() {
    println!(
        r#"
slip - deploy applications to your own host with git push

USAGE:
    slip <command> [options]

COMMANDS:
    init [name]              Register an app and write slipway.toml
    deploy [app]             Deploy the app's pushed HEAD
                             (--revision <sha> pins a commit, --detach skips waiting)
    build [app]              Build an image without deploying it
    status [app]             Show all apps, or detail for one
    logs <app>               Tail the running container's logs (-n <lines>)
    restart <app> | --all    Re-run the active deployment's container
    stop <app>               Stop the container and retract the route
    rollback <app> [seq]     Redeploy a previously built image
    destroy <app>            Remove the app and everything it owns (--force skips the prompt)

    config                   Show CLI configuration
    config api-url [url]     Set/get the daemon URL
    config token [token]     Set/get the API token

    help                     Show this help
    version                  Show version

EXIT CODES:
    0  success
    2  validation failure
    3  build failure
    4  deploy or health-check failure
    5  app not found

EXAMPLES:
    slip init blog           Register "blog" and write slipway.toml
    git push slipway main    Deploy via git push
    slip status blog         Inspect the last deployment
    slip rollback blog 4     Return to deployment v4

ENVIRONMENT:
    SLIPWAY_APP              App name override
    SLIPWAY_API_URL          Daemon endpoint (default: http://127.0.0.1:7700)
    SLIPWAY_API_TOKEN        API authentication token
"#
    );
}

fn config_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".slipway")
        .join("config.json")
}

fn load_config() -> Result<CliConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(CliConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("failed to read CLI config")?;
    let config: CliConfig = serde_json::from_str(&content).context("failed to parse CLI config")?;

    Ok(config)
}

fn save_config(config: &CliConfig) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(seq: i64, outcome: &str, kind: Option<&str>) -> DeploymentInfo {
        DeploymentInfo {
            seq,
            revision: "d6bc7579a20557404c9dd8d8".to_string(),
            trigger: "push".to_string(),
            image: Some(format!("slipway-web:v{}", seq)),
            outcome: Some(outcome.to_string()),
            error_kind: kind.map(str::to_string),
            error_message: None,
            build_log_path: None,
            started_at: "2026-08-25T12:00:00Z".to_string(),
            finished_at: Some("2026-08-25T12:01:00Z".to_string()),
        }
    }

    fn app(active_seq: Option<i64>, latest: Option<DeploymentInfo>) -> AppInfo {
        AppInfo {
            name: "web".to_string(),
            state: "failed".to_string(),
            created_at: "2026-08-25T11:00:00Z".to_string(),
            active_seq,
            in_progress_seq: None,
            active_container_name: None,
            active_port: None,
            degraded: false,
            hostname: "web.localhost".to_string(),
            route: None,
            remote: None,
            latest,
            stages: Vec::new(),
        }
    }

    #[test]
    fn test_rolled_back_summary_names_the_serving_version() {
        let line = rolled_back_summary(4, Some("health_check"), Some(3));
        assert_eq!(
            line,
            "Deployment v4 failed (health_check); v3 is still serving."
        );
    }

    #[test]
    fn test_rolled_back_summary_without_a_previous_version() {
        let line = rolled_back_summary(1, Some("health_check"), None);
        assert!(line.contains("no previous version"), "got: {}", line);
        assert!(!line.contains("still serving"), "got: {}", line);
    }

    #[test]
    fn test_report_outcome_maps_failure_kinds_to_exit_codes() {
        // Borrow the deployment out of the payload the way the watcher does
        let info = app(Some(3), Some(deployment(4, "rolled_back", Some("health_check"))));
        let latest = info.latest.as_ref().unwrap();
        assert_eq!(report_outcome("web", &info, latest), EXIT_DEPLOY);

        let info = app(None, Some(deployment(1, "failed", Some("build"))));
        let latest = info.latest.as_ref().unwrap();
        assert_eq!(report_outcome("web", &info, latest), EXIT_BUILD);

        let info = app(Some(2), Some(deployment(2, "succeeded", None)));
        let latest = info.latest.as_ref().unwrap();
        assert_eq!(report_outcome("web", &info, latest), EXIT_OK);
    }

    #[test]
    fn test_short_revision_truncates() {
        assert_eq!(short_revision("d6bc7579a20557404c9dd8d8"), "d6bc7579");
        assert_eq!(short_revision("abc"), "abc");
    }
}
