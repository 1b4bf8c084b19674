/*!
DataStore CLI - a small "Places" front end for the datastore context topology.

Every command opens the store, does its work through the main and background
contexts, and persists through the writer like any application would.
*/

use anyhow::{bail, Context as _};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use datastore_core::{
    default_store_directory, default_store_path, AttributeKind, DataStore, DataStoreMetrics,
    DuplicateResolution, EntityDescription, FetchRequest, ManagedContext, Record, Schema,
    SortDescriptor, StoreConfig, StoreDirectory, StoreResetOption, Value,
};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{info, warn};

const PLACE: &str = "Place";

#[derive(Parser)]
#[command(name = "datastore")]
#[command(about = "Manage places kept in a datastore store file")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store file path, or memory:// for a throwaway store
    #[arg(short, long, global = true, env = "DATASTORE_STORE")]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum QueueChoice {
    Main,
    Background,
    /// Alternate between main and background
    Mixed,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DirectoryChoice {
    Local,
    Cloud,
}

impl From<DirectoryChoice> for StoreDirectory {
    fn from(choice: DirectoryChoice) -> Self {
        match choice {
            DirectoryChoice::Local => StoreDirectory::Local,
            DirectoryChoice::Cloud => StoreDirectory::Cloud,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SortKey {
    Name,
    Created,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert one or more places
    Add {
        /// Name of the place, numbered when adding several
        #[arg(default_value = "Place")]
        name: String,
        /// Number of places to insert
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Context queue the inserts run on
        #[arg(short, long, value_enum, default_value = "main")]
        queue: QueueChoice,
        /// Insert the whole batch, then save it once
        #[arg(long)]
        atomic: bool,
        /// Pause between inserts, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// List stored places
    List {
        #[arg(long, value_enum, default_value = "created")]
        sort: SortKey,
        #[arg(long)]
        descending: bool,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Print records as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove places sharing a name, keeping the oldest
    Dedupe,
    /// Delete every stored place
    Purge,
    /// Replace the store file with an empty one
    Reset {
        /// Recreate with default options instead of the current ones
        #[arg(long)]
        clear: bool,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Move the store file between the local and cloud directories
    Relocate {
        #[arg(value_enum)]
        to: DirectoryChoice,
        /// Directory holding LocalStore and CloudStore (defaults to the user data directory)
        #[arg(long)]
        base: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct PlaceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Latitude")]
    latitude: String,
    #[tabled(rename = "Longitude")]
    longitude: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl From<&Record> for PlaceRow {
    fn from(place: &Record) -> Self {
        Self {
            name: place.get_str("name").unwrap_or("-").to_string(),
            latitude: format_coordinate(place.get("latitude")),
            longitude: format_coordinate(place.get("longitude")),
            created: format_timestamp(place.get_str("createdAt")),
            id: place.id.to_string(),
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let store = open_store(cli.store.as_deref())?;

    match cli.command {
        Commands::Add {
            name,
            count,
            queue,
            atomic,
            delay_ms,
        } => add_places(&store, &name, count, queue, atomic, Duration::from_millis(delay_ms))?,
        Commands::List {
            sort,
            descending,
            limit,
            json,
        } => list_places(&store, sort, descending, limit, json)?,
        Commands::Dedupe => dedupe_places(&store)?,
        Commands::Purge => purge_places(&store)?,
        Commands::Reset { clear, force } => reset_store(&store, clear, force)?,
        Commands::Relocate { to, base } => relocate_store(&store, to.into(), base)?,
    }

    if cli.verbose {
        if let Some(metrics) = DataStoreMetrics::global() {
            print!("{}", metrics.gather_metrics()?);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("datastore=debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("datastore=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn places_schema() -> Schema {
    Schema::new(vec![EntityDescription::new(PLACE)
        .required("name", AttributeKind::String)
        .attribute("latitude", AttributeKind::Double)
        .attribute("longitude", AttributeKind::Double)
        .required("createdAt", AttributeKind::Date)])
}

fn open_store(uri: Option<&str>) -> Result<DataStore, anyhow::Error> {
    let config = match uri {
        Some(uri) => StoreConfig::from_uri(uri)?,
        None => {
            // A store moved to the cloud directory takes precedence
            let cloud = default_store_path(StoreDirectory::Cloud)?;
            if cloud.exists() {
                StoreConfig::json_file(cloud)
            } else {
                StoreConfig::json_file(default_store_path(StoreDirectory::Local)?)
            }
        }
    };

    info!(backend = ?config.backend, location = ?config.location, "Opening store");
    DataStore::open(places_schema(), config).context("Failed to open the store")
}

fn fill_place(place: &mut Record, name: &str, index: usize) {
    let latitude = ((index * 37) % 180) as f64 - 90.0;
    let longitude = ((index * 71) % 360) as f64 - 180.0;
    place.set("name", name);
    place.set("latitude", latitude);
    place.set("longitude", longitude);
    place.set("createdAt", Utc::now().to_rfc3339());
}

fn runs_on_main(queue: QueueChoice, index: usize) -> bool {
    match queue {
        QueueChoice::Main => true,
        QueueChoice::Background => false,
        QueueChoice::Mixed => index % 2 == 0,
    }
}

fn add_places(
    store: &DataStore,
    name: &str,
    count: usize,
    queue: QueueChoice,
    atomic: bool,
    delay: Duration,
) -> Result<(), anyhow::Error> {
    if count == 0 {
        bail!("Nothing to add, --count must be at least 1");
    }
    let names: Vec<String> = if count == 1 {
        vec![name.to_string()]
    } else {
        (1..=count).map(|i| format!("{name} {i}")).collect()
    };

    if atomic {
        for (index, place_name) in names.into_iter().enumerate() {
            let insert = move |ctx: &ManagedContext| {
                ctx.insert_object(PLACE, |p| fill_place(p, &place_name, index))
                    .map(|_| ())
            };
            if runs_on_main(queue, index) {
                store.perform_on_main_and_wait(insert)??;
            } else {
                store.perform_on_background_and_wait(insert)??;
            }
            thread::sleep(delay);
        }
        store.save_and_wait(None)?;
        info!(count, "Saved batch of places");
    } else {
        let (tx, rx) = mpsc::channel();
        for (index, place_name) in names.into_iter().enumerate() {
            let insert = move |ctx: &ManagedContext| {
                if let Err(error) = ctx.insert_object(PLACE, |p| fill_place(p, &place_name, index)) {
                    warn!(%error, "Insert failed");
                }
            };
            let tx = tx.clone();
            let completion = move |_: &ManagedContext, result: datastore_core::Result<()>| {
                let _ = tx.send(result);
            };
            if runs_on_main(queue, index) {
                store.perform_on_main_and_save(insert, completion)?;
            } else {
                store.perform_on_background_and_save(insert, completion)?;
            }
            thread::sleep(delay);
        }
        drop(tx);

        let mut failures = 0;
        for result in rx.iter() {
            if let Err(error) = result {
                warn!(%error, "Save failed");
                failures += 1;
            }
        }
        if failures > 0 {
            bail!("{failures} of {count} saves failed");
        }
    }

    println!("✓ Added {count} place(s)");
    Ok(())
}

fn list_places(
    store: &DataStore,
    sort: SortKey,
    descending: bool,
    limit: Option<usize>,
    json: bool,
) -> Result<(), anyhow::Error> {
    let key = match sort {
        SortKey::Name => "name",
        SortKey::Created => "createdAt",
    };
    let descriptor = if descending {
        SortDescriptor::descending(key)
    } else {
        SortDescriptor::ascending(key)
    };
    let mut request = FetchRequest::new(PLACE).sorted_by(descriptor);
    if let Some(limit) = limit {
        request = request.with_limit(limit);
    }

    let places = store.perform_on_main_and_wait(move |ctx| ctx.fetch(&request))??;

    if json {
        println!("{}", serde_json::to_string_pretty(&places)?);
    } else if places.is_empty() {
        println!("No places found");
    } else {
        let rows: Vec<PlaceRow> = places.iter().map(PlaceRow::from).collect();
        println!("{}", Table::new(rows));
    }

    Ok(())
}

fn dedupe_places(store: &DataStore) -> Result<(), anyhow::Error> {
    let deleted = store.remove_duplicates(PLACE, "name", |left, right| {
        if left.get_str("createdAt") <= right.get_str("createdAt") {
            DuplicateResolution::DeleteRight
        } else {
            DuplicateResolution::DeleteLeft
        }
    })?;
    store.save_and_wait(None)?;

    println!("✓ Removed {deleted} duplicate place(s)");
    Ok(())
}

fn purge_places(store: &DataStore) -> Result<(), anyhow::Error> {
    store.delete_all_objects(&[PLACE])?;
    println!("✓ Deleted every place");
    Ok(())
}

fn reset_store(store: &DataStore, clear: bool, force: bool) -> Result<(), anyhow::Error> {
    if !force {
        let location = store
            .store_location()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "the in-memory store".to_string());
        print!("Are you sure you want to erase {location}? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let option = if clear {
        StoreResetOption::Clear
    } else {
        StoreResetOption::CopyExisting
    };
    store.reset_store_with(option)?;

    println!("✓ Store reset");
    Ok(())
}

fn relocate_store(
    store: &DataStore,
    directory: StoreDirectory,
    base: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let base = match base {
        Some(base) => base,
        None => default_store_directory()?,
    };

    let location = store.relocate_store(&base, directory)?;
    println!("✓ Store moved to {}", location.display());
    Ok(())
}

fn format_coordinate(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_f64)
        .map(|degrees| format!("{degrees:.2}"))
        .unwrap_or_else(|| "-".to_string())
}

fn format_timestamp(value: Option<&str>) -> String {
    match value.map(DateTime::parse_from_rfc3339) {
        Some(Ok(timestamp)) => timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        _ => value.unwrap_or("-").to_string(),
    }
}
