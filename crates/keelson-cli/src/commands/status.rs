//! Status command - show the latest revision of a release

use console::style;
use keelson_kube::{History, KubeError};

use super::{Global, check_release_name};
use crate::backend;
use crate::display;
use crate::error::Result;

/// Run the status command
pub async fn run(global: &Global, release: &str, output_json: bool) -> Result<()> {
    check_release_name(release)?;
    let settings = global.settings()?;
    let storage = backend::storage_only(&settings).await?;
    let history = History::load(storage, release, &global.namespace).await?;

    let Some(latest) = history.last_release() else {
        return Err(KubeError::ReleaseNotFound {
            name: release.to_string(),
            namespace: global.namespace.clone(),
        }
        .into());
    };

    if output_json {
        println!("{}", serde_json::to_string_pretty(&latest)?);
        return Ok(());
    }

    println!("{}", style("RELEASE INFO").bold().underlined());
    println!("  Name:         {}", style(&latest.name).cyan());
    println!("  Namespace:    {}", style(&latest.namespace).yellow());
    println!("  Revision:     {}", style(latest.revision).yellow());
    println!("  Status:       {}", display::status_style(latest.status));
    println!(
        "  First deploy: {}",
        latest.first_deployed.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Last deploy:  {}",
        latest.last_deployed.format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Description:  {}", latest.description);
    println!(
        "  Resources:    {} general, {} hooks",
        latest.general_resources.len(),
        latest.hook_resources.len()
    );

    if latest.status.is_pending() {
        println!(
            "\n{} A deploy is in progress or was interrupted; the next deploy takes over once the lock is free",
            style("!").yellow().bold()
        );
    }
    if let Some(deployed) = history.last_deployed_release()
        && deployed.revision != latest.revision
    {
        println!(
            "\n  Last deployed revision: {}",
            style(deployed.revision).yellow()
        );
    }

    if let Some(notes) = &latest.notes {
        println!("\n{}\n{}", style("NOTES").bold().underlined(), notes);
    }
    Ok(())
}
