//! Command-line interface for gqlmux.
//!
//! # Usage
//!
//! ```bash
//! # Serve the demo schema on http://127.0.0.1:4000/graphql
//! gqlmux serve --port 4000 --max-depth 8
//!
//! # Check operation documents for syntax errors and excessive depth
//! gqlmux check queries/*.graphql --max-depth 10
//! ```

pub mod demo;

use clap::{Parser, Subcommand};
use colored::Colorize;
use gqlmux_core::{DiagnosticBag, SourceLocation};
use gqlmux_sdk::{
    DepthLimit, GqlmuxServer, MaskErrors, PipelineOptions, PubSub, ServerConfig, TelemetryOptions,
};
use miette::{IntoDiagnostic, NamedSource, SourceSpan};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gqlmux")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the demo schema over HTTP and WebSocket
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "4000")]
        port: u16,

        /// Endpoint path
        #[arg(long, default_value = "/graphql")]
        path: String,

        /// Maximum request body size
        #[arg(long, default_value = gqlmux_sdk::server::DEFAULT_UPLOAD_LIMIT)]
        upload_limit: String,

        /// Reject operations nested deeper than this
        #[arg(long)]
        max_depth: Option<usize>,

        /// Fields excluded from the depth count, `/regex/` or exact names
        #[arg(long = "depth-ignore")]
        depth_ignore: Vec<String>,

        /// Send unexpected errors to clients unmasked
        #[arg(long)]
        no_mask: bool,

        /// Attach the original message to masked errors
        #[arg(long, conflicts_with = "no_mask")]
        mask_debug: bool,

        /// Record execution spans under this service name
        #[arg(long)]
        service_name: Option<String>,
    },

    /// Check operation documents for errors
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Maximum allowed query depth
        #[arg(long, default_value = "10")]
        max_depth: usize,

        /// Fields excluded from the depth count
        #[arg(long = "depth-ignore")]
        depth_ignore: Vec<String>,
    },
}

/// A syntax or depth problem in a checked document.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{message}")]
#[diagnostic(code(gqlmux::check))]
struct CheckDiagnostic {
    message: String,
    #[source_code]
    source_code: NamedSource<String>,
    #[label("{label}")]
    span: Option<SourceSpan>,
    label: String,
}

pub async fn run(cli: Cli) -> miette::Result<i32> {
    match cli.command {
        Commands::Serve {
            host,
            port,
            path,
            upload_limit,
            max_depth,
            depth_ignore,
            no_mask,
            mask_debug,
            service_name,
        } => {
            let config = ServerConfig::new()
                .host(host)
                .port(port)
                .path(path)
                .upload_limit(upload_limit);

            let mut options = PipelineOptions::new();
            if no_mask {
                options = options.no_mask_errors();
            } else if mask_debug {
                options = options.mask_errors(MaskErrors::default().debug(true));
            }
            if let Some(max_depth) = max_depth {
                let limit = depth_ignore
                    .into_iter()
                    .fold(DepthLimit::new(max_depth), |limit, entry| limit.ignore(entry));
                options = options.depth_limit(limit);
            }
            if let Some(service_name) = service_name {
                options = options.telemetry(TelemetryOptions::new(service_name));
            }

            serve(config, options).await?;
            Ok(0)
        }
        Commands::Check {
            files,
            max_depth,
            depth_ignore,
        } => {
            let limit = depth_ignore
                .into_iter()
                .fold(DepthLimit::new(max_depth), |limit, entry| limit.ignore(entry));
            check_files(&files, &limit, cli.verbose)
        }
    }
}

async fn serve(config: ServerConfig, options: PipelineOptions) -> miette::Result<()> {
    let pubsub = PubSub::new();
    let schema = demo::schema(&pubsub).into_diagnostic()?;
    let server = GqlmuxServer::builder()
        .config(config)
        .pipeline(options)
        .schema(schema)
        .build()
        .into_diagnostic()?;

    let config = server.config().clone();
    let listener = server.bind().await.into_diagnostic()?;
    let addr = listener.local_addr().into_diagnostic()?;

    println!();
    println!("{}", "gqlmux".green().bold());
    println!("  {}  http://{addr}{}", "GraphQL".blue(), config.path);
    println!("  {}  ws://{addr}{}", "WebSocket".blue(), config.path);
    println!("  {}  http://{addr}/health", "Health".blue());
    println!();

    server
        .serve_with_shutdown(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c");
            }
        })
        .await
        .into_diagnostic()
}

fn check_files(files: &[PathBuf], limit: &DepthLimit, verbose: bool) -> miette::Result<i32> {
    let mut failed = 0;

    for file in files {
        if verbose {
            println!("{} {}", "Checking".blue(), file.display());
        }

        let source = std::fs::read_to_string(file).into_diagnostic()?;
        let problems = check_source(file, &source, limit)?;
        if problems.is_empty() {
            if verbose {
                println!("{} {}", "OK".green(), file.display());
            }
            continue;
        }

        failed += 1;
        for problem in problems {
            eprintln!("{:?}", miette::Report::new(problem));
        }
    }

    if failed > 0 {
        eprintln!(
            "{} {failed} of {} file(s) failed",
            "Error:".red().bold(),
            files.len()
        );
        Ok(1)
    } else {
        println!(
            "{} {} file(s) checked",
            "Success:".green().bold(),
            files.len()
        );
        Ok(0)
    }
}

fn check_source(
    file: &Path,
    source: &str,
    limit: &DepthLimit,
) -> miette::Result<Vec<CheckDiagnostic>> {
    let named = || NamedSource::new(file.display().to_string(), source.to_string());
    let parsed = gqlmux_syntax::parse(source);
    if parsed.has_errors() {
        return Ok(syntax_diagnostics(&parsed.diagnostics, named));
    }

    let errors = limit.check(&parsed.document).into_diagnostic()?;
    Ok(errors
        .into_iter()
        .map(|error| CheckDiagnostic {
            span: error
                .locations
                .as_ref()
                .and_then(|locations| locations.first())
                .map(|location| SourceSpan::from(offset_of(source, *location))),
            label: "operation starts here".to_string(),
            message: error.message,
            source_code: named(),
        })
        .collect())
}

fn syntax_diagnostics(
    bag: &DiagnosticBag,
    named: impl Fn() -> NamedSource<String>,
) -> Vec<CheckDiagnostic> {
    bag.errors()
        .map(|diagnostic| CheckDiagnostic {
            message: diagnostic.client_message(),
            source_code: named(),
            span: diagnostic.primary_span().map(SourceSpan::from),
            label: diagnostic
                .labels
                .first()
                .map(|label| label.message.clone())
                .unwrap_or_default(),
        })
        .collect()
}

/// Byte offset of a 1-based line/column position.
fn offset_of(source: &str, location: SourceLocation) -> usize {
    let line_start: usize = source
        .split_inclusive('\n')
        .take(location.line.saturating_sub(1))
        .map(str::len)
        .sum();
    let column = source[line_start..]
        .char_indices()
        .nth(location.column.saturating_sub(1))
        .map_or(0, |(offset, _)| offset);
    line_start + column
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_serve_defaults() {
        let cli = Cli::try_parse_from(["gqlmux", "serve"]).unwrap();
        match cli.command {
            Commands::Serve {
                port,
                path,
                upload_limit,
                max_depth,
                ..
            } => {
                assert_eq!(port, 4000);
                assert_eq!(path, "/graphql");
                assert_eq!(upload_limit, "20mb");
                assert_eq!(max_depth, None);
            }
            Commands::Check { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn test_mask_flags_conflict() {
        assert!(Cli::try_parse_from(["gqlmux", "serve", "--no-mask", "--mask-debug"]).is_err());
    }

    #[test]
    fn test_check_source() {
        let file = Path::new("q.graphql");
        let limit = DepthLimit::new(2);

        assert!(check_source(file, "{ a { b } }", &limit).unwrap().is_empty());

        let deep = check_source(file, "\n{ a { b { c } } }", &limit).unwrap();
        assert_eq!(deep.len(), 1);
        assert_eq!(
            deep[0].message,
            "Syntax Error: Query depth limit of 2 exceeded, found 3."
        );
        assert_eq!(deep[0].span.map(|s| s.offset()), Some(1));

        let broken = check_source(file, "{ a {", &limit).unwrap();
        assert!(!broken.is_empty());
        assert!(broken[0].message.starts_with("Syntax Error:"));
    }

    #[test]
    fn test_offset_of() {
        let source = "query {\n  héllo\n}";
        assert_eq!(offset_of(source, SourceLocation { line: 1, column: 1 }), 0);
        assert_eq!(offset_of(source, SourceLocation { line: 2, column: 3 }), 10);
    }
}
