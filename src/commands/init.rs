use std::path::Path;

use colored::Colorize;
use serde_json::json;

use crate::error::Result;
use crate::output::Format;
use crate::store::db::MeshDb;
use crate::store::paths::MeshPaths;

pub fn run(repo_root: &Path, format: Format) -> Result<()> {
    let paths = MeshPaths::for_root(repo_root);
    paths.init()?;
    MeshDb::from_paths(&paths)?;

    match format {
        Format::Json => println!(
            "{}",
            json!({"initialized": paths.state_dir.display().to_string()})
        ),
        Format::Pretty => eprintln!(
            "Initialized {} in {}",
            ".agentmesh/".bold(),
            repo_root.display()
        ),
        Format::Minimal => println!("{}", paths.state_dir.display()),
    }
    Ok(())
}
