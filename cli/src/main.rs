use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use claps_kernel::kinds::kind_by_name;
use claps_kernel::query::Scope;
use claps_kernel::{
    bootstrap, catalog, Changes, Condition, EntityId, Fields, Kind, ListOptions, SqliteStore,
    StoreConfig, Value, VersionedRecord, VersionedStore,
};

/// Claps versioned entity store CLI
#[derive(Parser, Debug)]
#[command(name = "claps")]
#[command(about = "Insert-only versioned entity store", long_about = None)]
struct Cli {
    /// Path to store config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overrides config and environment
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create missing tables and report schema drift
    Bootstrap,

    /// Start a new entity
    Create {
        kind: String,
        /// Field assignment, `field=value`
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        set: Vec<String>,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Append a new version of an entity
    Update {
        kind: String,
        entity_id: String,
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        set: Vec<String>,
        /// Set the active flag; carried forward when omitted
        #[arg(long)]
        active: Option<bool>,
        /// Version the change is based on; defaults to the latest row
        #[arg(long)]
        expect: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Soft-delete an entity
    Delete {
        kind: String,
        entity_id: String,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Current row of an entity
    Get {
        kind: String,
        value: String,
        /// Lookup column
        #[arg(long, default_value = "entity_id")]
        by: String,
    },

    /// Rows matching every `--where` filter
    List {
        kind: String,
        #[arg(long = "where", value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        #[arg(long, value_enum, default_value_t = ScopeArg::Current)]
        scope: ScopeArg,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long, requires = "order_by")]
        desc: bool,
    },

    /// Every version of an entity, oldest first
    History { kind: String, entity_id: String },

    /// Check chain invariants of an entity
    Verify { kind: String, entity_id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Current,
    Latest,
    History,
}

impl From<ScopeArg> for Scope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Current => Scope::Current,
            ScopeArg::Latest => Scope::Latest,
            ScopeArg::History => Scope::History,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_json_file(path)?,
        None => StoreConfig::default(),
    }
    .apply_env();
    if let Some(path) = cli.database {
        config.database_path = path;
    }
    debug!(database = %config.database_path.display(), command = ?cli.command, "config loaded");

    let backend = SqliteStore::open(&config)
        .with_context(|| format!("opening {}", config.database_path.display()))?;

    // ----------------------------
    // Run command
    // ----------------------------
    if let Command::Bootstrap = cli.command {
        let report = bootstrap(&backend, &catalog(), &config.drift_policy)?;
        return print_json(&report);
    }

    let store = VersionedStore::new(backend);

    match cli.command {
        Command::Bootstrap => Ok(()),
        Command::Create { kind, set, actor } => {
            let kind = lookup_kind(&kind)?;
            let fields = parse_assignments(&kind, &set)?;
            let actor = parse_actor(actor)?;
            print_json(&store.create(&kind, fields, actor.as_ref())?)
        }
        Command::Update {
            kind,
            entity_id,
            set,
            active,
            expect,
            actor,
        } => {
            let kind = lookup_kind(&kind)?;
            let mut existing = latest_row(&store, &kind, &entity_id)?;
            if let Some(expect) = expect {
                // base the change on the version the caller read
                existing.version = expect.parse()?;
            }
            let changes = Changes {
                fields: parse_assignments(&kind, &set)?,
                active,
            };
            let actor = parse_actor(actor)?;
            print_json(&store.update(&kind, &existing, changes, actor.as_ref())?)
        }
        Command::Delete {
            kind,
            entity_id,
            actor,
        } => {
            let kind = lookup_kind(&kind)?;
            let existing = store
                .get_current(&kind, "entity_id", entity_id.as_str())?
                .ok_or_else(|| anyhow!("no current {} with id {entity_id}", kind.name()))?;
            let actor = parse_actor(actor)?;
            print_json(&store.delete(&kind, &existing, actor.as_ref())?)
        }
        Command::Get { kind, value, by } => {
            let kind = lookup_kind(&kind)?;
            let value = parse_column(&kind, &by, &value)?;
            match store.get_current(&kind, &by, value)? {
                Some(record) => print_json(&record),
                None => bail!("no current {} where {by} matches", kind.name()),
            }
        }
        Command::List {
            kind,
            filters,
            scope,
            limit,
            offset,
            order_by,
            desc,
        } => {
            let kind = lookup_kind(&kind)?;

            let mut condition = Condition::All;
            for filter in &filters {
                let (column, raw) = split_assignment(filter)?;
                condition = condition.and(Condition::Eq(
                    column.to_string(),
                    parse_column(&kind, column, raw)?,
                ));
            }

            let options = ListOptions {
                limit,
                offset,
                ..ListOptions::default()
            };
            let options = match order_by {
                Some(column) => options.order_by(column, desc),
                None => options,
            };

            let rows: Vec<VersionedRecord> = store.list(&kind, scope.into(), condition, options)?.collect();
            print_json(&rows)
        }
        Command::History { kind, entity_id } => {
            let kind = lookup_kind(&kind)?;
            print_json(&store.history(&kind, &entity_id.parse()?)?)
        }
        Command::Verify { kind, entity_id } => {
            let kind = lookup_kind(&kind)?;
            print_json(&store.verify(&kind, &entity_id.parse()?)?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn lookup_kind(name: &str) -> Result<Kind> {
    kind_by_name(name).ok_or_else(|| {
        let known: Vec<_> = catalog().iter().map(|k| k.name().to_string()).collect();
        anyhow!("unknown kind `{name}`, expected one of: {}", known.join(", "))
    })
}

fn parse_actor(actor: Option<String>) -> Result<Option<EntityId>> {
    Ok(actor.map(|a| a.parse()).transpose()?)
}

/// Latest row of an entity, deleted or not, so updates can undelete.
fn latest_row(store: &VersionedStore<SqliteStore>, kind: &Kind, entity_id: &str) -> Result<VersionedRecord> {
    let id: EntityId = entity_id.parse()?;
    store
        .list(
            kind,
            Scope::Latest,
            Condition::eq("entity_id", id.as_str()),
            ListOptions::default().limit(1),
        )?
        .next()
        .ok_or_else(|| anyhow!("no {} with id {entity_id}", kind.name()))
}

fn split_assignment(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .map(|(field, value)| (field.trim(), value))
        .ok_or_else(|| anyhow!("expected FIELD=VALUE, got {raw:?}"))
}

fn parse_column(kind: &Kind, column: &str, raw: &str) -> Result<Value> {
    let field_type = kind
        .column_type(column)
        .ok_or_else(|| anyhow!("kind `{}` has no column `{column}`", kind.name()))?;
    Ok(field_type.parse(column, raw)?)
}

fn parse_assignments(kind: &Kind, assignments: &[String]) -> Result<Fields> {
    let mut fields = Fields::new();
    for assignment in assignments {
        let (field, raw) = split_assignment(assignment)?;
        let field_type = kind
            .field_type(field)
            .ok_or_else(|| anyhow!("kind `{}` has no field `{field}`", kind.name()))?;
        fields.insert(field.to_string(), field_type.parse(field, raw)?);
    }
    Ok(fields)
}
