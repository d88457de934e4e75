use std::{
    collections::{BTreeSet, HashSet},
    fmt::Debug,
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use org2html::{Pipeline, WriteOptions};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "org2html",
    about = "Convert Org documents into HTML fragments",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert one Org file to HTML.
    Convert(ConvertArgs),

    /// Print the token stream of Org files.
    Tokens(DumpArgs),

    /// Print the parsed nodes of Org files.
    Parse(DumpArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Org file to convert.
    input: PathBuf,
    /// Write HTML to this path instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Escape HTML special characters in document text.
    #[arg(long)]
    escape_html: bool,
}

#[derive(Debug, Args)]
struct DumpArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Convert(args) => handle_convert(args),
        Commands::Tokens(args) => handle_dump(args, |pipeline, path| pipeline.tokenize_file(path)),
        Commands::Parse(args) => handle_dump(args, |pipeline, path| pipeline.parse_file(path)),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "org2html=debug"
    } else {
        "org2html=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn handle_convert(args: ConvertArgs) -> Result<()> {
    let ConvertArgs {
        input,
        output,
        escape_html,
    } = args;

    let pipeline = Pipeline::default().with_options(WriteOptions { escape_html });
    let nodes = pipeline.parse_file(&input)?;
    tracing::debug!(path = ?input, nodes = nodes.len(), "parsed document");

    match output {
        Some(path) => {
            let file = fs::File::create(&path).with_context(|| format!("creating {:?}", path))?;
            let mut out = BufWriter::new(file);
            pipeline
                .render(&nodes, &mut out)
                .with_context(|| format!("writing {:?}", path))?;
            out.flush().with_context(|| format!("writing {:?}", path))?;
            tracing::info!(path = ?path, "wrote HTML");
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            pipeline.render(&nodes, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn handle_dump<T, F>(args: DumpArgs, load: F) -> Result<()>
where
    T: Serialize + Debug,
    F: Fn(&Pipeline, &Path) -> Result<Vec<T>>,
{
    let DumpArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let pipeline = Pipeline::default();
    let mut loaded = Vec::new();
    for path in expanded {
        tracing::debug!(path = ?path, "loading");
        let items = load(&pipeline, &path)?;
        loaded.push((path, items));
    }

    if json {
        #[derive(Serialize)]
        struct JsonOutput<'a, T> {
            path: String,
            items: &'a [T],
        }

        let payload: Vec<JsonOutput<'_, T>> = loaded
            .iter()
            .map(|(path, items)| JsonOutput {
                path: path.display().to_string(),
                items,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, items)) in loaded.iter().enumerate() {
            if loaded.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", items);
            if loaded.len() > 1 && idx + 1 < loaded.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn is_org_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            tracing::debug!(dir = ?canonical, "scanning directory");
            for file in collect_org_files(&canonical)? {
                if seen.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if seen.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            // Symlinks are skipped so a link cycle cannot recurse forever.
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org_file(&canonical) {
        tracing::trace!(path = ?canonical, "found org file");
        out.push(canonical);
    }
    Ok(())
}
