//! Run the plugins declared in a YAML manifest and print the summary as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use convoy::{LoggingEventSink, Orchestrator, PluginManifest};

#[derive(Parser, Debug)]
#[command(name = "convoy", version, about = "Run package-manager update plugins in dependency waves")]
struct Args {
    /// Plugin manifest (YAML)
    manifest: PathBuf,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the summary
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let manifest = PluginManifest::load_yaml_file(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    let plugins = manifest.plugins()?;

    let orchestrator = Orchestrator::new(manifest.config.clone(), Arc::new(LoggingEventSink));
    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let summary = orchestrator.run_plugins(plugins).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.success {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verbose_and_manifest() {
        let args = Args::try_parse_from(["convoy", "-v", "updates.yaml"]).unwrap();
        assert!(args.verbose);
        assert_eq!(args.manifest, PathBuf::from("updates.yaml"));
    }

    #[test]
    fn test_manifest_is_required() {
        assert!(Args::try_parse_from(["convoy", "--verbose"]).is_err());
    }
}
