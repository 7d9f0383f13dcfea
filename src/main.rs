use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use rusty_datavis::data::export::{pretty_format, write_file};
use rusty_datavis::data::loader::{load_file, load_reference};
use rusty_datavis::data::model::{ColumnTypeSpec, Dataset};
use rusty_datavis::engine::geo::{located_only, unlocated_zips, GeoAggregation, GeoJoinSpec};
use rusty_datavis::engine::pivot::{AggFunc, PivotSpec};
use rusty_datavis::engine::reconcile::detect_mixed_type_columns;
use rusty_datavis::state::Session;
use rusty_datavis::{EngineConfig, EngineError};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "rusty-datavis",
    about = "Reconcile column types, pivot tables and join datasets to zip-code coordinates."
)]
struct Cli {
    /// Engine config (JSON). Built-in defaults apply when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Input options shared by `pivot` and `geo`.
#[derive(Args)]
struct DataArgs {
    /// Input dataset (.csv, .json, .parquet).
    file: PathBuf,

    /// Declared column type, e.g. `--type zip=str` (repeatable).
    #[arg(long = "type", value_name = "COLUMN=TYPE")]
    types: Vec<String>,

    /// Keep rows whose column equals a value, e.g. `--where state=CA` (repeatable).
    #[arg(long = "where", value_name = "COLUMN=VALUE")]
    filters: Vec<String>,

    /// Also write the result to a .csv / .json / .parquet file.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GeoAggArg {
    Auto,
    Sum,
    Count,
    ConditionalCount,
}

#[derive(Subcommand)]
enum Command {
    /// Show columns, their runtime types and mixed-type warnings.
    Inspect {
        /// Input dataset (.csv, .json, .parquet).
        file: PathBuf,
    },

    /// Group rows and aggregate a value column into a cross-tab.
    Pivot {
        #[command(flatten)]
        data: DataArgs,

        /// Row grouping columns (comma separated).
        #[arg(long, value_delimiter = ',', required = true)]
        rows: Vec<String>,

        /// Column grouping columns (comma separated).
        #[arg(long, value_delimiter = ',')]
        cols: Vec<String>,

        /// Column to aggregate.
        #[arg(long)]
        values: String,

        /// auto, sum, count or mean.
        #[arg(long, default_value = "auto")]
        agg: AggFunc,
    },

    /// Aggregate a metric per zip code and attach coordinates.
    Geo {
        #[command(flatten)]
        data: DataArgs,

        /// Reference table with zip, latitude and longitude columns.
        #[arg(long, value_name = "PATH")]
        reference: PathBuf,

        /// Zip code column of the input.
        #[arg(long)]
        zip: String,

        /// Metric column of the input.
        #[arg(long)]
        metric: String,

        #[arg(long, value_enum, default_value = "auto")]
        agg: GeoAggArg,

        /// Value counted by conditional-count (defaults to the config marker).
        #[arg(long)]
        marker: Option<String>,

        /// Drop zips without coordinates instead of listing them.
        #[arg(long)]
        drop_unlocated: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Inspect { file } => inspect(&file),
        Command::Pivot {
            data,
            rows,
            cols,
            values,
            agg,
        } => {
            let mut session = open_session(&data, config)?;
            let spec = PivotSpec::new(rows, values).with_col_keys(cols).with_agg(agg);
            let table = session.run_pivot(&spec)?.clone();
            emit(&table, data.output.as_deref())
        }
        Command::Geo {
            data,
            reference,
            zip,
            metric,
            agg,
            marker,
            drop_unlocated,
        } => {
            let mut session = open_session(&data, config)?;
            let aggregation = match agg {
                GeoAggArg::Auto => GeoAggregation::Auto,
                GeoAggArg::Sum => GeoAggregation::Sum,
                GeoAggArg::Count => GeoAggregation::Count,
                GeoAggArg::ConditionalCount => GeoAggregation::ConditionalCount {
                    marker: marker.unwrap_or_else(|| session.config.affirmative_marker.clone()),
                },
            };
            let spec = GeoJoinSpec::new(zip, metric).with_aggregation(aggregation);
            run_geo(&mut session, &spec, &reference, drop_unlocated, data.output.as_deref())
        }
    }
}

fn inspect(file: &Path) -> Result<()> {
    let dataset = load_file(file)?;
    println!(
        "{} row(s), {} column(s)",
        dataset.num_rows(),
        dataset.num_columns()
    );
    for col in dataset.columns() {
        let kinds: Vec<String> = col.kinds().iter().map(ToString::to_string).collect();
        println!(
            "  {:<24} {:<28} {:>6} distinct {:>6} missing",
            col.name(),
            kinds.join("/"),
            col.unique_values().len(),
            col.missing_count()
        );
    }

    let mixed = detect_mixed_type_columns(&dataset);
    if !mixed.is_empty() {
        println!();
        println!("Mixed-type columns (declare one with --type COLUMN=TYPE):");
        for col in mixed.iter() {
            let kinds: Vec<String> = col.kinds.iter().map(ToString::to_string).collect();
            println!("  {} ({})", col.name, kinds.join(", "));
        }
    }
    Ok(())
}

/// Load the input, declare types and apply row filters.
fn open_session(data: &DataArgs, config: EngineConfig) -> Result<Session> {
    let mut session = Session::new(config);
    session.set_dataset(load_file(&data.file)?);

    let undeclared: Vec<&str> = session
        .mixed
        .names()
        .into_iter()
        .filter(|name| !data.types.iter().any(|t| t.starts_with(&format!("{name}="))))
        .collect();
    if !undeclared.is_empty() {
        log::warn!("Mixed-type column(s) without a declared type: {undeclared:?}");
    }

    let spec = ColumnTypeSpec::parse_assignments(&data.types)?;
    if !spec.is_empty() {
        for failure in session.apply_types(&spec)? {
            eprintln!("warning: {failure}");
        }
        if let Some(msg) = &session.status_message {
            log::warn!("{msg}");
        }
    }

    let mut selections: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for item in &data.filters {
        let (column, value) = item
            .split_once('=')
            .with_context(|| format!("expected COLUMN=VALUE, got '{item}'"))?;
        selections.entry(column).or_default().push(value.to_string());
    }
    for (column, values) in selections {
        session.select_by_text(column, &values)?;
    }
    Ok(session)
}

fn run_geo(
    session: &mut Session,
    spec: &GeoJoinSpec,
    reference_path: &Path,
    drop_unlocated: bool,
    output: Option<&Path>,
) -> Result<()> {
    let reference = load_reference(reference_path, &session.config);
    let joined = match session.run_geo(spec, reference.as_ref().map_err(Clone::clone)) {
        Ok(joined) => joined.clone(),
        Err(e @ EngineError::ReferenceUnavailable(_)) => {
            if let Some(aggregate) = &session.zip_aggregate {
                println!("Per-zip aggregate (no coordinates):");
                println!("{}", pretty_format(&aggregate.to_dataset()?)?);
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    let unlocated = unlocated_zips(&joined);
    let table = if drop_unlocated {
        located_only(&joined)
    } else {
        if !unlocated.is_empty() {
            eprintln!(
                "warning: {} zip(s) not found in the reference table: {}",
                unlocated.len(),
                unlocated.join(", ")
            );
        }
        joined
    };
    emit(&table, output)
}

fn emit(table: &Dataset, output: Option<&Path>) -> Result<()> {
    println!("{}", pretty_format(table)?);
    if let Some(path) = output {
        write_file(table, path)?;
    }
    Ok(())
}
