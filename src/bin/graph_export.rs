//! Entity Graph Export CLI
//!
//! Decodes an entity (or graph) document, rebuilds its graph and prints it as
//! Mermaid or GraphViz DOT.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use versioned_entities::graph::reference_cycles;
use versioned_entities::{
    codec, EntityGraph, ExportFormat, GraphDocument, RegistryConfig, SchemaCatalog,
};

#[derive(Parser)]
#[command(name = "entity-graph-export")]
#[command(about = "Export an entity graph to Mermaid or DOT format")]
struct Cli {
    /// Schema catalog (JSON array of entity schemas)
    #[arg(short, long)]
    schemas: PathBuf,

    /// Entity document to export
    #[arg(short, long)]
    input: PathBuf,

    /// Treat the input as a graph document (root plus edge list)
    #[arg(long)]
    graph: bool,

    /// Output format: mermaid or dot (defaults to the configured format)
    #[arg(short, long)]
    format: Option<ExportFormat>,

    /// Include ids and scalar fields in Mermaid node labels
    #[arg(long)]
    include_fields: bool,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Optional config file
    #[arg(short, long)]
    config: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RegistryConfig::load_from(cli.config.as_deref()).context("loading config")?;

    let catalog_text = std::fs::read_to_string(&cli.schemas)
        .with_context(|| format!("reading schemas from {:?}", cli.schemas))?;
    let catalog = SchemaCatalog::from_json_str(&catalog_text).context("parsing schema catalog")?;

    let input = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("reading input from {:?}", cli.input))?;
    let graph = load_graph(&input, cli.graph, &catalog, &config)?;

    tracing::info!(
        root_id = %graph.root_id(),
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "Graph loaded"
    );
    for cycle in reference_cycles(&graph) {
        tracing::info!(members = cycle.members.len(), "Reference cycle");
    }

    let format = cli.format.unwrap_or(config.export.format);
    let include_fields = cli.include_fields || config.export.include_fields;
    let rendered = graph.render(format, include_fields);

    match cli.output {
        Some(path) => {
            std::fs::write(&path, &rendered)
                .with_context(|| format!("writing output to {:?}", path))?;
            eprintln!("✅ Exported {} nodes to: {:?}", graph.node_count(), path);
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

fn load_graph(
    input: &str,
    as_graph: bool,
    catalog: &SchemaCatalog,
    config: &RegistryConfig,
) -> anyhow::Result<EntityGraph> {
    if as_graph {
        let doc: GraphDocument = serde_json::from_str(input).context("parsing graph document")?;
        return Ok(codec::decode_graph_with(&doc, catalog, &config.graph_builder())?);
    }
    let mut root = codec::from_json_str(input, catalog)?;
    Ok(config.graph_builder().build(&mut root)?)
}
