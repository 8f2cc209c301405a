use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod catalog;
mod cli;
mod config;
mod eid;
mod errors;
mod lists;
mod search;
mod semantic;
mod storage;
mod sync;
mod task_runner;
#[cfg(test)]
mod tests;
mod web;

use app::App;
use catalog::SearchFilters;
use cli::{Command, ListAction};
use config::Config;
use lists::ListCreate;
use task_runner::{JobHandle, Status};

/// How long CLI commands wait for background jobs to drain.
const CLI_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Block until the queue drains, then fail if the submitted job did not succeed.
fn wait_for(app: &App, handle: &JobHandle) -> anyhow::Result<()> {
    if !app.queue.wait_idle(CLI_JOB_TIMEOUT) {
        bail!("timed out waiting for background jobs");
    }

    match app.queue.get(&handle.id).map(|td| td.status) {
        Some(Status::Error(err)) => bail!("job {} failed: {err}", handle.id),
        _ => Ok(()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let config = Config::load_with(&config::base_path()?)?;
    let app = App::open(config)?;

    match args.command {
        Command::Daemon { addr } => {
            web::start_daemon(app, &addr)?;
            return Ok(());
        }

        Command::Import { feed, no_wait } => {
            app.run_queue()?;
            let handle = app.trigger_sync(&feed)?;
            log::info!("import queued as task {}", handle.id);

            if !no_wait {
                wait_for(&app, &handle)?;
            }
            print_json(&app.job_status(&handle.id).ok())?;
        }

        Command::Embed { sku } => {
            app.run_queue()?;
            let handle = app.trigger_embedding_update(sku)?;
            wait_for(&app, &handle)?;
        }

        Command::Reconcile {} => {
            app.run_queue()?;
            let handle = app.trigger_reconciliation()?;
            wait_for(&app, &handle)?;
        }

        Command::Search {
            query,
            filters,
            page,
            page_size,
        } => {
            let filters = SearchFilters {
                category_ids: filters.category,
                min_price: filters.min_price,
                max_price: filters.max_price,
            };
            print_json(&app.search(&query, &filters, page, page_size)?)?;
        }

        Command::List { session, action } => match action {
            ListAction::Create { name, description } => {
                print_json(&app.lists.create(&session, ListCreate { name, description })?)?;
            }
            ListAction::Add {
                list,
                sku,
                quantity,
                notes,
            } => {
                let list = app
                    .lists
                    .add_item(&list.into(), &session, &sku, quantity, notes)?;
                print_json(&list)?;
            }
            ListAction::Show { list } => {
                print_json(&app.lists.get(&list.into())?)?;
            }
        },

        Command::Share { list, session } => {
            print_json(&app.generate_share_code(&list.into(), &session)?)?;
        }

        Command::Sync { code, session } => {
            print_json(&app.sync_from_code(&code, &session)?)?;
        }
    }

    app.shutdown();

    Ok(())
}
