use std::fs;
use std::path::{Path, PathBuf};

use colored::Colorize;
use serde_json::json;

use crate::error::Result;
use crate::keystore::KeyInfo;
use crate::output::{self, Format};
use crate::store::repo::MeshRepo;

fn print_key(info: &KeyInfo) {
    let marker = if info.is_default {
        " (default)".green().bold().to_string()
    } else {
        String::new()
    };
    println!("{}{}", info.key_id.cyan().bold(), marker);
    println!("  {} {}", "algorithm:".dimmed(), info.algorithm);
    println!("  {} {}", "active:".dimmed(), info.active);
    println!(
        "  {} {}",
        "private key:".dimmed(),
        if info.has_private { "yes" } else { "no (trusted peer)" }
    );
    println!("  {} {}", "public key:".dimmed(), info.public_key);
}

pub fn generate(repo_root: &Path, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let info = repo.keystore.generate()?;
    match format {
        Format::Json => output::print_json(&info)?,
        Format::Pretty => {
            println!("Generated signing key");
            print_key(&info);
        }
        Format::Minimal => println!("{}", info.key_id),
    }
    Ok(())
}

/// One key when `key_id` is given, otherwise every key in the keystore.
pub fn info(repo_root: &Path, key_id: Option<&str>, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let keys = match key_id {
        Some(id) => vec![repo.keystore.info(id)?],
        None => repo.keystore.list()?,
    };
    match format {
        Format::Json => output::print_json(&keys)?,
        Format::Pretty => {
            if keys.is_empty() {
                println!("{}", "No keys. Run `agentmesh key generate`.".dimmed());
            }
            for key in &keys {
                print_key(key);
            }
        }
        Format::Minimal => {
            for key in &keys {
                println!("{}{}", key.key_id, if key.is_default { " *" } else { "" });
            }
        }
    }
    Ok(())
}

/// Print (or write) the public PEM of a key, the default key if none named.
pub fn export(
    repo_root: &Path,
    key_id: Option<&str>,
    out: Option<PathBuf>,
    format: Format,
) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let (key_id, pem) = repo.keystore.export_public_pem(key_id)?;
    if let Some(path) = &out {
        fs::write(path, &pem)?;
    }
    match (format, &out) {
        (Format::Json, _) => println!(
            "{}",
            json!({
                "key_id": key_id,
                "public_key_pem": pem,
                "path": out.as_ref().map(|p| p.display().to_string()),
            })
        ),
        (_, Some(path)) => println!("{}", path.display()),
        (_, None) => print!("{pem}"),
    }
    Ok(())
}

/// Trust a peer public key read from a PEM file.
pub fn import(repo_root: &Path, pem_path: &Path, format: Format) -> Result<()> {
    let repo = MeshRepo::open(repo_root)?;
    let pem = fs::read_to_string(pem_path)?;
    let info = repo.keystore.import_public_pem(&pem)?;
    match format {
        Format::Json => output::print_json(&info)?,
        Format::Pretty => {
            println!("Imported public key");
            print_key(&info);
        }
        Format::Minimal => println!("{}", info.key_id),
    }
    Ok(())
}
