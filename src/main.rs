//! Pyramid Cache - command-line front end.
//!
//! Opens the resource manager on the configured database and runs one
//! subcommand against it.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pyramid_cache::{
    config::{Cli, Command, ExportArgs, InfoArgs, ListArgs, LocatorArgs, ThumbgenArgs},
    Handler, Locator, LocatorError, ResourceError, ResourceManager, ResourceMetadata, ResourceUrl,
    ScaleRange,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = cli.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let manager = match ResourceManager::open(cli.manager_config()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to open {}: {}", cli.database_path().display(), e);
            return ExitCode::FAILURE;
        }
    };

    let code = match cli.command {
        Command::Thumbgen(args) => run_thumbgen(&manager, args).await,
        Command::Generate(args) => run_generate(&manager, args).await,
        Command::Info(args) => run_info(&manager, args).await,
        Command::List(args) => run_list(&manager, args).await,
        Command::Cleanup => run_cleanup(&manager).await,
        Command::Export(args) => run_export(&manager, args).await,
    };

    info!(stats = ?manager.stats(), "done");
    manager.shutdown();
    code
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "pyramid_cache=debug"
    } else {
        "pyramid_cache=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Parse a command-line locator. Relative file paths are made absolute so
/// the stored locator does not depend on the working directory.
fn parse_locator(arg: &str) -> Result<Locator, ResourceError> {
    let locator = Locator::parse(arg)?;
    let url = locator.url();
    if !url.is_local() || std::path::Path::new(url.path()).is_absolute() {
        return Ok(locator);
    }

    let path = std::fs::canonicalize(url.path())
        .map_err(|e| LocatorError::InvalidUrl(format!("{}: {}", url.path(), e)))?;
    let handlers: Vec<Handler> = locator.handlers().to_vec();
    Ok(handlers.into_iter().fold(
        Locator::new(ResourceUrl::file(path.to_string_lossy())),
        Locator::with_handler,
    ))
}

/// Resolve metadata for every argument, reporting failures as they come.
async fn resolve_all(manager: &ResourceManager, args: &[String]) -> (Vec<ResourceMetadata>, bool) {
    let mut pending = Vec::with_capacity(args.len());
    let mut ok = true;
    for arg in args {
        match parse_locator(arg) {
            Ok(locator) => pending.push((arg, manager.request_resource_metadata(locator))),
            Err(e) => {
                println!("✗ {}: {}", arg, e);
                ok = false;
            }
        }
    }

    let mut resolved = Vec::with_capacity(pending.len());
    for (arg, request) in pending {
        match request.await {
            Ok(metadata) => resolved.push(metadata),
            Err(e) => {
                println!("✗ {}: {} ({})", arg, e, e.status());
                ok = false;
            }
        }
    }
    (resolved, ok)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// =============================================================================
// Generation Commands
// =============================================================================

async fn run_thumbgen(manager: &ResourceManager, args: ThumbgenArgs) -> ExitCode {
    let (mut resources, mut ok) = resolve_all(manager, &args.locators).await;

    if args.all {
        match manager.list_resources(None).await {
            Ok(stored) => resources.extend(stored.into_iter().filter(|m| m.image.is_some())),
            Err(e) => {
                error!("Failed to list resources: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    if resources.is_empty() {
        warn!("Nothing to do");
        return exit_code(ok);
    }

    let tile_size = manager.tile_size();
    let pending: Vec<_> = resources
        .iter()
        .filter_map(|m| {
            let scale = m.image?.max_scale(tile_size);
            Some((m, manager.request_tiles(m, ScaleRange::single(scale))))
        })
        .collect();

    for (metadata, request) in pending {
        match request.await {
            Ok(0) => println!("  {} (cached)", metadata.locator),
            Ok(tiles) => println!("✓ {} ({} tile(s))", metadata.locator, tiles),
            Err(e) => {
                println!("✗ {}: {}", metadata.locator, e);
                ok = false;
            }
        }
    }
    exit_code(ok)
}

async fn run_generate(manager: &ResourceManager, args: LocatorArgs) -> ExitCode {
    let (resources, mut ok) = resolve_all(manager, &args.locators).await;
    let tile_size = manager.tile_size();

    for metadata in &resources {
        let Some(image) = metadata.image else {
            continue;
        };
        let range = ScaleRange::new(0, image.max_scale(tile_size));
        match manager.request_tiles(metadata, range).await {
            Ok(tiles) => println!(
                "✓ {} ({}x{}, scales {}..={}, {} new tile(s))",
                metadata.locator, image.width, image.height, range.min, range.max, tiles
            ),
            Err(e) => {
                println!("✗ {}: {}", metadata.locator, e);
                ok = false;
            }
        }
    }
    exit_code(ok)
}

// =============================================================================
// Query Commands
// =============================================================================

async fn run_info(manager: &ResourceManager, args: InfoArgs) -> ExitCode {
    let (resources, ok) = resolve_all(manager, &args.target.locators).await;

    if args.json {
        match serde_json::to_string_pretty(&resources) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize metadata: {}", e);
                return ExitCode::FAILURE;
            }
        }
        return exit_code(ok);
    }

    for metadata in &resources {
        print_metadata(metadata, manager.tile_size());
    }
    exit_code(ok)
}

fn print_metadata(metadata: &ResourceMetadata, tile_size: u32) {
    println!("{}", metadata.locator);
    println!("  Id:      {}", metadata.id());
    println!("  Status:  {}", metadata.info.status);
    println!("  Blob:    {}", metadata.info.name.blob);
    println!("  Handler: {}", metadata.info.name.handler);
    if let Some(image) = metadata.image {
        println!("  Size:    {}x{}", image.width, image.height);
        println!("  Scales:  0..={}", image.max_scale(tile_size));
    }
}

async fn run_list(manager: &ResourceManager, args: ListArgs) -> ExitCode {
    let patterns: Vec<Option<&str>> = if args.patterns.is_empty() {
        vec![None]
    } else {
        args.patterns.iter().map(|p| Some(p.as_str())).collect()
    };

    let mut total = 0;
    for pattern in patterns {
        match manager.list_resources(pattern).await {
            Ok(resources) => {
                for metadata in &resources {
                    println!(
                        "{:>6}  {:<15}  {}",
                        metadata.id().raw(),
                        metadata.info.status.as_str(),
                        metadata.locator
                    );
                }
                total += resources.len();
            }
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    println!();
    println!("Total: {} resource(s)", total);
    ExitCode::SUCCESS
}

// =============================================================================
// Maintenance Commands
// =============================================================================

async fn run_cleanup(manager: &ResourceManager) -> ExitCode {
    match manager.cleanup().await {
        Ok(report) => {
            println!("✓ Cleanup finished");
            println!("  Orphan locators removed: {}", report.orphan_locators);
            println!("  Orphan images removed:   {}", report.orphan_images);
            println!("  Orphan tiles removed:    {}", report.orphan_tiles);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Cleanup failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_export(manager: &ResourceManager, args: ExportArgs) -> ExitCode {
    let (resources, _) = resolve_all(manager, std::slice::from_ref(&args.locator)).await;
    let Some(metadata) = resources.first() else {
        return ExitCode::FAILURE;
    };

    let pixels = match manager.assemble(metadata, args.size).await {
        Ok(pixels) => pixels,
        Err(e) => {
            error!("Failed to assemble {}: {}", metadata.locator, e);
            return ExitCode::FAILURE;
        }
    };

    let (width, height) = (pixels.width(), pixels.height());
    let Some(image) = pixels.into_image() else {
        error!("Assembled image has inconsistent dimensions");
        return ExitCode::FAILURE;
    };
    if let Err(e) = image.save_with_format(&args.output, image::ImageFormat::Png) {
        error!("Failed to write {}: {}", args.output.display(), e);
        return ExitCode::FAILURE;
    }

    println!("✓ {} ({}x{}) -> {}", metadata.locator, width, height, args.output.display());
    ExitCode::SUCCESS
}
