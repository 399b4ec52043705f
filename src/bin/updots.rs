// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use updots::{
    ansi::{AnsiSpan, Color, StyleTag},
    config::UpdaterConfig,
    control::{ControlEvent, ControlHandle, Controller},
    orchestrator::{Orchestrator, UpdateOutcome, UpdateRequest},
    path::default_config_path,
    sink::{FileDecision, UpdateSink},
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select};
use parking_lot::Mutex;
use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::exit,
    sync::Arc,
    thread,
    time::Duration,
};
use tokio::{signal, sync::mpsc, task::JoinHandle};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "updots [options] <updots-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Use configuration file at path instead of the default one.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        match self.command {
            Command::Status => run_status(config).await,
            Command::Update(opts) => run_update(config, opts).await,
            Command::Watch(opts) => run_watch(config, opts).await,
            Command::Config(opts) => run_config(config, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Show how local clone compares to its upstream.
    #[command(override_usage = "updots status [options]")]
    Status,

    /// Pull upstream changes, then run the installer.
    #[command(override_usage = "updots update [options]")]
    Update(UpdateOptions),

    /// Keep refreshing in the background, and take commands from stdin.
    #[command(override_usage = "updots watch [options]")]
    Watch(WatchOptions),

    /// Print active configuration.
    #[command(override_usage = "updots config [options]")]
    Config(ConfigOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpdateOptions {
    /// Only re-run files-only install, without pulling anything.
    #[arg(short, long)]
    pub files_only: bool,

    /// Answer yes to every question instead of prompting.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct WatchOptions {
    /// Answer yes to every question. Otherwise every question is declined.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ConfigOptions {
    /// Print built-in defaults instead.
    #[arg(short, long)]
    pub default: bool,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_config(path: Option<&Path>) -> Result<UpdaterConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !path.exists() {
        info!("no configuration at {}, using defaults", path.display());
        return Ok(UpdaterConfig::default().expand()?);
    }

    let data = std::fs::read_to_string(&path)?;
    Ok(data.parse()?)
}

async fn run_status(config: UpdaterConfig) -> Result<()> {
    let sink = Arc::new(TerminalSink::new(Some(false)));
    let orchestrator = Orchestrator::from_config(config, sink);
    let status = tokio::task::spawn_blocking(move || orchestrator.refresh()).await?;
    print!("{status}");

    if !status.ok {
        bail!("{}", status.headline());
    }

    Ok(())
}

async fn run_update(config: UpdaterConfig, opts: UpdateOptions) -> Result<()> {
    let sink = Arc::new(TerminalSink::new(opts.yes.then_some(true)));
    let (handle, mut events, looper) = start(config, sink);

    let request = if opts.files_only {
        UpdateRequest::ReinstallFiles
    } else {
        UpdateRequest::Update
    };
    handle.update(request)?;

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ControlEvent::Finished(outcome)) => break outcome,
                Some(_) => continue,
                None => bail!("control loop stopped before update finished"),
            },
            _ = signal::ctrl_c() => handle.interrupt()?,
        }
    };

    handle.shutdown()?;
    looper.await??;
    report(&outcome)
}

async fn run_watch(config: UpdaterConfig, opts: WatchOptions) -> Result<()> {
    let sink = Arc::new(TerminalSink::new(Some(opts.yes)));
    let (handle, mut events, looper) = start(config, sink.clone());
    handle.refresh()?;

    sink.append(
        "Commands: u = update, f = reinstall files, r = refresh, i = interrupt,\n\
         y/n/<enter> = answer installer, q = quit. Other text is sent as is.\n",
    );

    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(|line| line.ok()) {
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ControlEvent::Status(status)) => sink.append(&status.to_string()),
                Some(ControlEvent::Finished(outcome)) => {
                    if let Err(error) = report(&outcome) {
                        error!("{error}");
                    }
                }
                Some(ControlEvent::Busy) => {}
                None => break,
            },
            line = lines.recv() => match line {
                Some(line) => {
                    if !dispatch(&handle, line.trim())? {
                        break;
                    }
                }
                None => break,
            },
            _ = signal::ctrl_c() => break,
        }
    }

    handle.shutdown()?;
    looper.await??;
    Ok(())
}

fn run_config(config: UpdaterConfig, opts: ConfigOptions) -> Result<()> {
    if opts.default {
        print!("{}", UpdaterConfig::default());
    } else {
        print!("{config}");
    }

    Ok(())
}

type Started = (
    ControlHandle,
    mpsc::UnboundedReceiver<ControlEvent>,
    JoinHandle<updots::control::Result<()>>,
);

fn start(config: UpdaterConfig, sink: Arc<TerminalSink>) -> Started {
    let orchestrator = Orchestrator::from_config(config, sink.clone());
    let (controller, handle, events) = Controller::new(orchestrator, sink);
    let looper = tokio::spawn(controller.run());
    (handle, events, looper)
}

/// Route one line of watch mode input. Returns `false` when asked to quit.
fn dispatch(handle: &ControlHandle, line: &str) -> Result<bool> {
    match line {
        "q" => return Ok(false),
        "u" => handle.update(UpdateRequest::Update)?,
        "f" => handle.update(UpdateRequest::ReinstallFiles)?,
        "r" => handle.refresh()?,
        "i" => handle.interrupt()?,
        "y" => handle.send_input("y\n")?,
        "n" => handle.send_input("n\n")?,
        "" => handle.send_input("\n")?,
        other => handle.send_input(format!("{other}\n"))?,
    }

    Ok(true)
}

fn report(outcome: &UpdateOutcome) -> Result<()> {
    match (&outcome.error, outcome.success) {
        (_, true) => {
            info!("{}", outcome.title);
            Ok(())
        }
        (Some(error), false) => Err(anyhow!("{}: {error}", outcome.title)),
        (None, false) => Err(anyhow!("{}", outcome.title)),
    }
}

/// Terminal implementation of the operator-facing sink.
///
/// Questions are asked through inquire, unless `assume` holds a canned
/// answer. A spinner shows what the orchestrator is busy with.
struct TerminalSink {
    assume: Option<bool>,
    spinner: Mutex<Option<ProgressBar>>,
}

impl TerminalSink {
    fn new(assume: Option<bool>) -> Self {
        Self {
            assume,
            spinner: Mutex::new(None),
        }
    }

    fn suspend<T>(&self, action: impl FnOnce() -> T) -> T {
        match self.spinner.lock().as_ref() {
            Some(spinner) => spinner.suspend(action),
            None => action(),
        }
    }
}

impl UpdateSink for TerminalSink {
    fn append(&self, text: &str) {
        self.suspend(|| {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        });
    }

    fn append_spans(&self, spans: &[AnsiSpan]) {
        let mut text = String::new();
        for span in spans {
            if span.is_plain() {
                text.push_str(&span.text);
            } else {
                text.push_str(&format!("\x1b[{}m{}\x1b[0m", sgr(span), span.text));
            }
        }
        self.append(&text);
    }

    fn clear(&self) {}

    fn set_busy(&self, busy: bool, hint: &str) {
        let mut spinner = self.spinner.lock();
        if !busy {
            if let Some(spinner) = spinner.take() {
                spinner.finish_and_clear();
            }
            return;
        }

        let bar = spinner.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg}") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        bar.set_message(hint.to_string());
    }

    fn confirm(&self, question: &str) -> bool {
        if let Some(answer) = self.assume {
            self.append(&format!("{question}\n[auto] {}\n", if answer { "yes" } else { "no" }));
            return answer;
        }

        let (title, help) = question.split_once('\n').unwrap_or((question, ""));
        let mut prompt = Confirm::new(title).with_default(false);
        if !help.is_empty() {
            prompt = prompt.with_help_message(help);
        }
        self.suspend(|| prompt.prompt().unwrap_or(false))
    }

    fn prompt_file_decision(&self, path: &Path, diff: &str) -> Option<FileDecision> {
        if let Some(answer) = self.assume {
            return Some(if answer {
                FileDecision::Restore
            } else {
                FileDecision::KeepNew
            });
        }

        let restore = "Restore my version";
        let keep = "Keep installed version";
        self.suspend(|| {
            println!("{diff}");
            let message = format!("{} differs from backup", path.display());
            match Select::new(&message, vec![restore, keep]).prompt() {
                Ok(choice) if choice == restore => Some(FileDecision::Restore),
                Ok(_) => Some(FileDecision::KeepNew),
                Err(_) => None,
            }
        })
    }

    fn notify(&self, title: &str, body: &str) {
        info!("{title}: {body}");
    }
}

fn sgr(span: &AnsiSpan) -> String {
    span.styles
        .iter()
        .map(|style| match style {
            StyleTag::Bold => "1".to_string(),
            StyleTag::Dim => "2".to_string(),
            StyleTag::Italic => "3".to_string(),
            StyleTag::Underline => "4".to_string(),
            StyleTag::Foreground(color) => color_code(*color, 30, 38),
            StyleTag::Background(color) => color_code(*color, 40, 48),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn color_code(color: Color, base: u8, extended: u8) -> String {
    match color {
        Color::Basic(named) => (base + named as u8).to_string(),
        Color::Bright(named) => (base + 60 + named as u8).to_string(),
        Color::Indexed(index) => format!("{extended};5;{index}"),
    }
}
