//! Rollback command - redeploy the resources of an earlier revision

use console::style;

use super::{Global, check_release_name};
use crate::backend;
use crate::display;
use crate::error::Result;

/// Run the rollback command
pub async fn run(global: &Global, release: &str, revision: Option<u32>) -> Result<()> {
    check_release_name(release)?;
    let settings = global.settings()?;

    let target = match revision {
        Some(revision) => format!("revision {}", revision),
        None => "previous".to_string(),
    };
    println!(
        "{} Rolling back release {} to {}",
        style("→").blue().bold(),
        style(release).cyan(),
        style(&target).yellow()
    );

    let deployer = backend::connect(&settings).await?;
    let outcome = deployer
        .rollback(release, &global.namespace, revision)
        .await?;

    print!("{}", display::format_report(&outcome.report));
    println!(
        "\n{} Rolled back {}",
        style("✓").green().bold(),
        style(release).cyan()
    );
    println!("  New revision: {}", style(outcome.release.revision).yellow());
    Ok(())
}
