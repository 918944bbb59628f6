//! Deploy command - roll a manifest out as the next revision

use console::style;
use std::path::Path;

use super::{Global, load_request};
use crate::backend;
use crate::display;
use crate::error::Result;

/// Run the deploy command
pub async fn run(
    global: &Global,
    release: &str,
    manifest: &Path,
    crds: Option<&Path>,
    output_json: bool,
) -> Result<()> {
    let request = load_request(global, release, manifest, crds)?;
    let settings = global.settings()?;

    if !output_json {
        println!(
            "{} Deploying release {} to namespace {}",
            style("→").blue().bold(),
            style(release).cyan(),
            style(&global.namespace).yellow()
        );
    }

    let deployer = backend::connect(&settings).await?;
    let outcome = deployer.deploy(&request).await?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    print!("{}", display::format_plan(&outcome.plan));
    println!();
    print!("{}", display::format_report(&outcome.report));
    if !outcome.pruned.is_empty() {
        println!(
            "  {} pruned revisions {:?}",
            style("·").dim(),
            outcome.pruned
        );
    }
    println!(
        "\n{} Release {} revision {} {} ({})",
        style("✓").green().bold(),
        style(&outcome.release.name).cyan(),
        style(outcome.release.revision).yellow(),
        display::status_style(outcome.release.status),
        outcome.deploy_type
    );
    if let Some(notes) = &outcome.release.notes {
        println!("\n{}\n{}", style("NOTES").bold().underlined(), notes);
    }

    Ok(())
}
