//! History command - show release history

use console::style;
use keelson_kube::History;

use super::{Global, check_release_name};
use crate::backend;
use crate::display;
use crate::error::Result;

/// Run the history command
pub async fn run(
    global: &Global,
    release: &str,
    max_revisions: Option<usize>,
    output_json: bool,
) -> Result<()> {
    check_release_name(release)?;
    let settings = global.settings()?;
    let storage = backend::storage_only(&settings).await?;
    let history = History::load(storage, release, &global.namespace).await?;

    let mut releases = history.releases();
    if let Some(max) = max_revisions {
        let skip = releases.len().saturating_sub(max);
        releases = releases.split_off(skip);
    }

    if output_json {
        println!("{}", serde_json::to_string_pretty(&releases)?);
        return Ok(());
    }

    if releases.is_empty() {
        println!(
            "No revisions of {} in namespace {}",
            style(release).cyan(),
            style(&global.namespace).yellow()
        );
        return Ok(());
    }

    println!(
        "Release history for {} in namespace {}:\n",
        style(release).cyan(),
        style(&global.namespace).yellow()
    );
    print!("{}", display::format_history(&releases));
    Ok(())
}
