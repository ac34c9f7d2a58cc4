mod backup;
mod calc;
mod config;
mod db;
mod ipc;
mod report;

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    // stdout carries IPC responses; all diagnostics go to stderr.
    let filter = EnvFilter::try_from_env(config::ENV_LOG)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    tracing::info!("classdiaryd v{}", env!("CARGO_PKG_VERSION"));

    let cfg = match config::Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("invalid configuration: {e:#}");
            return ExitCode::from(2);
        }
    };

    let mut state = ipc::AppState::new(cfg.default_variant);
    if let Some(path) = cfg.workspace.as_ref() {
        // A configured store that cannot be opened is fatal, not per-request.
        if let Err(e) = ipc::open_workspace(&mut state, path, None) {
            tracing::error!(
                workspace = %path.to_string_lossy(),
                "cannot open record store: {e:#}"
            );
            return ExitCode::from(2);
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!("dropping malformed request: {e}");
                let body = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", body);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    ExitCode::SUCCESS
}
