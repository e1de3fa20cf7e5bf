use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mwimport_core::api::{MediaWikiClient, MediaWikiClientConfig, WikiApi};
use mwimport_core::config::{ImportConfig, SiteContext, load_config};
use mwimport_core::importer::{fold_mapdata, import_page, import_redirect};
use mwimport_core::pool::process_concurrently;
use mwimport_core::records::SideChannels;
use mwimport_core::store::SharedStore;

#[derive(Debug, Parser)]
#[command(
    name = "mwimport",
    version,
    about = "Import a MediaWiki site into a LocalWiki-style store"
)]
struct Cli {
    #[arg(long, global = true, value_name = "URL", help = "MediaWiki api.php endpoint")]
    api_url: Option<String>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Wiki script path, used to recognize internal links"
    )]
    script_path: Option<String>,
    #[arg(long, global = true, value_name = "FILE", help = "SQLite database to write into")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "N", help = "Concurrent import workers")]
    workers: Option<usize>,
    #[arg(long, global = true, value_name = "FILE", default_value = "mwimport.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import the whole site: pages, history, files, redirects, map data
    Run(RunArgs),
    /// Import a single page and print its cleaned HTML
    Page(PageArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Wiki base address, e.g. http://arborwiki.org/
    #[arg(value_name = "URL")]
    url: Option<String>,
    /// Skip the destructive-import confirmation prompt
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(value_name = "TITLE")]
    title: String,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Run(args) => run_import(&cli, args),
        Commands::Page(args) => run_single_page(&cli, args),
    }
}

fn run_import(cli: &Cli, args: &RunArgs) -> Result<()> {
    let config = effective_config(cli, args.url.as_deref())?;
    let client_config = MediaWikiClientConfig::from_config(&config)?;
    let mut client = MediaWikiClient::new(client_config.clone())?;

    // Verify the endpoint answers before anything destructive happens.
    let sitename = client
        .site_name()
        .context("unable to connect to the MediaWiki API, check the address")?;
    println!("Ready to import {sitename}");

    if !args.yes && !confirm_destruction()? {
        println!("Aborted.");
        return Ok(());
    }

    let db_path = config.db_path();
    let store = SharedStore::open(Path::new(&db_path))?;
    println!("Clearing out existing data...");
    store.clear_all()?;

    let started = Instant::now();
    let context = SiteContext::new(config.script_path());
    let records = SideChannels::new();
    let workers = config.workers();
    let show_image_borders = config.show_image_borders();

    println!("Getting master page list...");
    let pages = client.list_pages(false)?;
    println!("Importing {} pages...", pages.len());
    process_concurrently(
        pages,
        "pages",
        workers,
        || MediaWikiClient::new(client_config.clone()),
        |api, page| {
            import_page(
                &page.title,
                page.page_id,
                api,
                &store,
                &records,
                &context,
                show_image_borders,
            )
        },
    );

    println!("Importing redirects...");
    let redirects = client.list_pages(true)?;
    process_concurrently(
        redirects,
        "redirects",
        workers,
        || MediaWikiClient::new(client_config.clone()),
        |api, page| import_redirect(&page.title, api, &store),
    );

    println!("Processing map data...");
    let geometries = fold_mapdata(&records, &store)?;

    println!(
        "Imported {} pages, {} files, {} redirects, {} map geometries into {}",
        store.page_count()?,
        store.file_count()?,
        store.redirect_count()?,
        geometries,
        db_path,
    );
    println!(
        "Import completed in {:.2} minutes",
        started.elapsed().as_secs_f64() / 60.0
    );
    Ok(())
}

fn run_single_page(cli: &Cli, args: &PageArgs) -> Result<()> {
    let config = effective_config(cli, None)?;
    let client_config = MediaWikiClientConfig::from_config(&config)?;
    let mut client = MediaWikiClient::new(client_config)?;

    let Some(page_id) = client.page_id(&args.title)? else {
        bail!("page {} does not exist on the wiki", args.title);
    };

    let db_path = config.db_path();
    let store = SharedStore::open(Path::new(&db_path))?;
    let context = SiteContext::new(config.script_path());
    let records = SideChannels::new();

    import_page(
        &args.title,
        page_id,
        &mut client,
        &store,
        &records,
        &context,
        config.show_image_borders(),
    )?;
    fold_mapdata(&records, &store)?;

    let name = mwimport_core::passes::fix_pagename(&args.title);
    match store.page_content(&name)? {
        Some(content) => println!("{content}"),
        None => println!("(page {} was skipped: empty after processing)", args.title),
    }
    Ok(())
}

fn effective_config(cli: &Cli, url: Option<&str>) -> Result<ImportConfig> {
    let mut config = load_config(&cli.config)?;
    if let Some(url) = url {
        config.site.url = Some(url.to_string());
    }
    if let Some(api_url) = &cli.api_url {
        config.site.api_url = Some(api_url.clone());
    }
    if let Some(script_path) = &cli.script_path {
        config.site.script_path = Some(script_path.clone());
    }
    if let Some(db) = &cli.db {
        config.import.db_path = Some(db.display().to_string());
    }
    if let Some(workers) = cli.workers {
        config.import.workers = Some(workers);
    }
    Ok(config)
}

fn confirm_destruction() -> Result<bool> {
    print!("This import will clear out any existing data in the target store. Continue? (yes/no) ");
    io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}
