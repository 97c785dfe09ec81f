use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::repo::MeshRepo;
use crate::witness::{self, Verdict};

/// Verify a commit's witness. The outcome is always printed; anything but
/// `VERIFIED` is then returned as the matching error.
pub fn verify(repo_root: &Path, rev: &str, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let outcome = witness::verify_commit(repo_root, rev, &repo.keystore, &repo.witnesses)?;

    match format {
        Format::Json => output::print_json(&outcome)?,
        Format::Pretty => {
            let verdict = outcome.verdict.to_string();
            let verdict = if outcome.verdict == Verdict::Verified {
                verdict.green().bold()
            } else {
                verdict.red().bold()
            };
            println!(
                "{} {}",
                outcome.commit_sha.get(..12).unwrap_or(&outcome.commit_sha).bold(),
                verdict
            );
            if !outcome.detail.is_empty() {
                println!("  {}", outcome.detail.dimmed());
            }
            if let Some(ep) = &outcome.episode_id {
                println!("  {} {}", "episode:".dimmed(), ep);
            }
            if let Some(key) = &outcome.key_id {
                println!("  {} {}", "key:".dimmed(), key);
            }
        }
        Format::Minimal => println!("{}", outcome.verdict),
    }

    outcome.into_result().map(|_| ())
}
