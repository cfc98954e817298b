mod activity;
mod app;
mod capture;
mod cli;
mod commands;
mod config;
mod contacts;
mod feeds;
mod gallery;
mod live;
mod mjpeg;
mod notify;
mod settings;
mod storage;
mod stream;
mod theme;
mod tui;
mod viewer;
mod weather;

use anyhow::Result;
use app::{AppContext, init_file_tracing, init_stderr_tracing};
use clap::Parser;
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = AppContext::open(cli.data_dir.clone())?;

    let _log_guard = if cli.is_fullscreen() {
        Some(init_file_tracing(&ctx.data_root)?)
    } else {
        init_stderr_tracing();
        None
    };

    match cli.command {
        None | Some(Command::Tui) => tui::run_tui(&ctx).await?,
        Some(Command::View(args)) => viewer::run_view(&args, &ctx).await?,
        Some(Command::Watch) => commands::watch_feeds(&ctx).await?,
        Some(Command::Capture(args)) => commands::capture(&ctx, args).await?,
        Some(Command::Feeds(args)) => commands::feeds(&ctx, args.command)?,
        Some(Command::Gallery(args)) => commands::gallery(&ctx, args.command)?,
        Some(Command::Contacts(args)) => commands::contacts(&ctx, args.command)?,
        Some(Command::Sos(args)) => commands::sos(&ctx, args).await?,
        Some(Command::Sms(args)) => commands::sms(&ctx, args).await?,
        Some(Command::Weather(args)) => commands::weather(&ctx, args).await?,
        Some(Command::Settings(args)) => commands::settings(&ctx, args.command)?,
    }

    Ok(())
}
