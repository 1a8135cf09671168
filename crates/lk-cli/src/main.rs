//! Listkeeper CLI
//!
//! CLI tool for inspecting and modifying a filter store, refreshing
//! subscriptions and checking for application updates.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Parser, Subcommand};

use lk_core::{
    ContentType, FilterListener, FilterStore, FsBackend, MatchKind, RequestClassifier, SuffixList,
};
use lk_sync::{Config, ReqwestClient, Synchronizer, Updater};

#[derive(Parser)]
#[command(name = "lk-cli")]
#[command(about = "Listkeeper filter store tools")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "listkeeper.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List subscriptions and filter counts in the store
    Show,

    /// Add a filter to its default group
    AddFilter {
        /// Filter text
        text: String,
    },

    /// Remove a filter everywhere it appears
    RemoveFilter {
        /// Filter text
        text: String,
    },

    /// Add a subscription by URL and fetch it
    AddSubscription {
        /// Subscription URL
        url: String,
    },

    /// Remove a subscription by URL
    RemoveSubscription {
        /// Subscription URL
        url: String,
    },

    /// Classify a request URL against the store
    Match {
        /// Request URL
        url: String,

        /// Content type (script, image, stylesheet, document, ...)
        #[arg(short = 't', long, default_value = "other")]
        content_type: String,

        /// Document URL the request originates from
        #[arg(short, long)]
        document: Option<String>,
    },

    /// Refresh due subscriptions, or force one by URL
    Sync {
        /// Refresh this subscription regardless of expiration
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Check the update manifest for a newer version
    CheckUpdate,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    let local = tokio::task::LocalSet::new();
    let result = runtime.block_on(local.run_until(run(cli)));
    // Detached downloads and deferred saves finish before exit.
    runtime.block_on(local);

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = Config::load(&cli.config);
    let store = FilterStore::new(FsBackend, config.db_path());
    store.graph.borrow_mut().save_stats = config.save_stats;

    let listener = FilterListener::new({
        let store = store.clone();
        Box::new(move || {
            let store = store.clone();
            tokio::task::spawn_local(async move {
                if let Err(e) = store.save_to_disk(None).await {
                    log::error!("deferred save failed: {e}");
                }
            });
        })
    });
    listener.install(&store.notifier);

    if let Err(e) = store.load_from_disk(None).await {
        log::warn!("starting with an empty store: {e}");
    }

    match cli.command {
        Commands::Show => cmd_show(&store),
        Commands::AddFilter { text } => cmd_add_filter(&store, &text).await,
        Commands::RemoveFilter { text } => cmd_remove_filter(&store, &text).await,
        Commands::AddSubscription { url } => cmd_add_subscription(&store, &config, &url).await,
        Commands::RemoveSubscription { url } => cmd_remove_subscription(&store, &url).await,
        Commands::Match { url, content_type, document } => {
            cmd_match(&store, &listener, &url, &content_type, document.as_deref())
        }
        Commands::Sync { url } => cmd_sync(&store, &config, url.as_deref()),
        Commands::CheckUpdate => cmd_check_update(&cli.config, config).await,
    }
}

fn cmd_show(store: &Rc<FilterStore<FsBackend>>) -> Result<(), String> {
    let graph = store.graph.borrow();
    let count = graph.listed_subscriptions().count();
    println!("{count} subscription(s)");
    for id in graph.listed_subscriptions() {
        let subscription = graph.subscription(id);
        println!();
        println!("{}", subscription.url);
        println!("  Title:    {}", subscription.title);
        println!("  Filters:  {}", subscription.filters.len());
        if subscription.disabled {
            println!("  Disabled: yes");
        }
        if let Some(details) = subscription.downloadable() {
            if let Some(status) = &details.download_status {
                println!("  Status:   {status}");
            }
            if details.last_download != 0 {
                println!("  Fetched:  {} (epoch seconds)", details.last_download);
            }
            if details.errors != 0 {
                println!("  Errors:   {}", details.errors);
            }
        }
    }
    Ok(())
}

async fn cmd_add_filter(store: &Rc<FilterStore<FsBackend>>, text: &str) -> Result<(), String> {
    let filter = {
        let mut graph = store.graph.borrow_mut();
        let filter = graph.filter_from_text(text);
        graph.add_filter(&store.notifier, filter, None, None);
        filter
    };
    save(store).await?;
    println!("Added '{}'", store.graph.borrow().filter(filter).text);
    Ok(())
}

async fn cmd_remove_filter(store: &Rc<FilterStore<FsBackend>>, text: &str) -> Result<(), String> {
    {
        let mut graph = store.graph.borrow_mut();
        let filter = graph.filter_from_text(text);
        graph.remove_filter(&store.notifier, filter, None, None);
    }
    save(store).await?;
    println!("Removed '{text}'");
    Ok(())
}

async fn cmd_add_subscription(
    store: &Rc<FilterStore<FsBackend>>,
    config: &Config,
    url: &str,
) -> Result<(), String> {
    store.graph.borrow_mut().add_subscription(&store.notifier, url);
    save(store).await?;
    println!("Added subscription {url}");

    // Fetch the content right away.
    let synchronizer =
        Synchronizer::new(store.clone(), Rc::new(ReqwestClient::new()), config, None);
    synchronizer.execute(url, true);
    Ok(())
}

async fn cmd_remove_subscription(
    store: &Rc<FilterStore<FsBackend>>,
    url: &str,
) -> Result<(), String> {
    if store.graph.borrow().subscription_by_url(url).is_none() {
        return Err(format!("no subscription with URL '{url}'"));
    }
    store.graph.borrow_mut().remove_subscription(&store.notifier, url);
    save(store).await?;
    println!("Removed subscription {url}");
    Ok(())
}

fn cmd_match(
    store: &Rc<FilterStore<FsBackend>>,
    listener: &Rc<FilterListener>,
    url: &str,
    content_type: &str,
    document: Option<&str>,
) -> Result<(), String> {
    let content_type = ContentType::parse_name(content_type)
        .ok_or_else(|| format!("unknown content type '{content_type}'"))?;
    let classifier = RequestClassifier::new(SuffixList::builtin());
    let graph = store.graph.borrow();
    let hit =
        classifier.check_filter_match(&graph, listener, url, content_type, document.unwrap_or(url));
    match hit.kind {
        MatchKind::NoMatch => println!("No match"),
        kind => {
            println!("{kind:?}: {}", hit.text.as_deref().unwrap_or(""));
            if hit.collapse {
                println!("  (element collapses)");
            }
        }
    }
    Ok(())
}

fn cmd_sync(
    store: &Rc<FilterStore<FsBackend>>,
    config: &Config,
    url: Option<&str>,
) -> Result<(), String> {
    let synchronizer =
        Synchronizer::new(store.clone(), Rc::new(ReqwestClient::new()), config, None);
    match url {
        Some(url) => {
            if store.graph.borrow().subscription_by_url(url).is_none() {
                return Err(format!("no subscription with URL '{url}'"));
            }
            println!("Refreshing {url}");
            synchronizer.execute(url, true);
        }
        None => {
            println!("Refreshing due subscriptions");
            synchronizer.check_now();
        }
    }
    Ok(())
}

async fn cmd_check_update(config_path: &Path, mut config: Config) -> Result<(), String> {
    if config.update_url.is_empty() {
        return Err("no update_url configured".to_string());
    }
    let updater = Updater::new(Rc::new(ReqwestClient::new()), &config);
    updater.check(true).await;
    match updater.update_available() {
        Some(url) => println!("Update available: {url}"),
        None => println!("Up to date ({})", config.app_version),
    }
    updater.state().apply_to(&mut config);
    if let Err(e) = config.save(config_path) {
        log::warn!("failed to persist update state: {e}");
    }
    Ok(())
}

async fn save(store: &Rc<FilterStore<FsBackend>>) -> Result<(), String> {
    store
        .save_to_disk(None)
        .await
        .map_err(|e| format!("failed to save store: {e}"))
}
