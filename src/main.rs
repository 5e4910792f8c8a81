//! Console front end: wires the orchestration core to stdout delivery and
//! stderr status lines, then runs until Ctrl-C.

use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};

use voxkey::{safe_eprintln, App, Collaborators};

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = voxkey::data_dir::data_dir();
    let settings =
        voxkey::settings::load_settings(&data_dir).context("failed to load settings")?;

    let collaborators = Collaborators {
        deliver: Arc::new(|text| {
            let mut out = std::io::stdout();
            writeln!(out, "{text}").context("stdout delivery failed")?;
            Ok(())
        }),
        report: Arc::new(|status| {
            safe_eprintln!("voxkey: {status}");
        }),
        log_sink: Arc::new(|line| {
            safe_eprintln!("stt: {line}");
            Ok(())
        }),
    };

    let app = App::start(data_dir, settings, collaborators)
        .await
        .context("startup failed")?;
    safe_eprintln!("voxkey: ready (Ctrl-C to exit)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    safe_eprintln!("voxkey: shutting down");
    app.shutdown().await;
    Ok(())
}
