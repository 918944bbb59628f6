//! Plan command - preview a deploy

use console::style;
use std::path::Path;

use super::{Global, load_request};
use crate::backend;
use crate::display;
use crate::error::Result;

/// Run the plan command
pub async fn run(
    global: &Global,
    release: &str,
    manifest: &Path,
    crds: Option<&Path>,
    output_json: bool,
) -> Result<()> {
    let request = load_request(global, release, manifest, crds)?;
    let settings = global.settings()?;
    let deployer = backend::connect(&settings).await?;
    let preview = deployer.plan_only(&request).await?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(());
    }

    println!(
        "{} {} of release {} as revision {} in namespace {}\n",
        style("→").blue().bold(),
        style(preview.deploy_type).bold(),
        style(release).cyan(),
        style(preview.release.revision).yellow(),
        style(&global.namespace).yellow()
    );
    print!("{}", display::format_plan(&preview.plan));

    if !preview.plan.has_mutations() {
        println!(
            "\n{} No changes to the cluster, only verification",
            style("✓").green().bold()
        );
    }
    Ok(())
}
