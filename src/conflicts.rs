//! Soft conflicts: a change to one file drops exported symbols that a file
//! claimed by another agent still imports. Nothing is blocked; affected
//! agents get an `ATTN` message and the log gets a `SOFT_CONFLICT` event.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Serialize;
use serde_json::json;

use crate::error::Result;
use crate::git;
use crate::model::{Claim, EventKind, Severity};
use crate::store::db::MeshDb;
use crate::store::messages::NewMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    Script,
}

impl Language {
    fn for_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(Self::Python),
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(Self::Script),
            _ => None,
        }
    }
}

/// Does an import source name the module `stem`? Python modules match on
/// their last dotted segment, JS paths on their file stem.
fn module_names(module: &str, stem: &str) -> bool {
    let last = if module.contains('/') {
        Path::new(module)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    } else {
        module.rsplit('.').next().unwrap_or(module)
    };
    !stem.is_empty() && last == stem
}

/// A dependent file whose imports a change broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftConflict {
    pub changed_file: String,
    pub symbols: Vec<String>,
    pub affected_agent: String,
    pub affected_file: String,
}

/// Regex-based scanner for top-level exports and imports.
pub struct SymbolScanner {
    py_def: Regex,
    py_const: Regex,
    py_from: Regex,
    py_import: Regex,
    js_export: Regex,
    js_default: Regex,
    js_import: Regex,
}

impl SymbolScanner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            py_def: Regex::new(r"(?m)^(?:async\s+)?(?:def|class)\s+([A-Za-z_]\w*)")?,
            py_const: Regex::new(r"(?m)^([A-Z_][A-Z_0-9]*)\s*(?::[^=\n]*)?=")?,
            py_from: Regex::new(r"(?m)^from\s+([\w.]+)\s+import\s+(.+)$")?,
            py_import: Regex::new(r"(?m)^import\s+([\w.]+)")?,
            js_export: Regex::new(
                r"(?m)^export\s+(?:declare\s+)?(?:async\s+)?(?:function\*?|class|const|let|var|type|interface|enum)\s+([A-Za-z_$][\w$]*)",
            )?,
            js_default: Regex::new(
                r"(?m)^export\s+default\s+(?:async\s+)?(?:function\*?|class)\s+([A-Za-z_$][\w$]*)",
            )?,
            js_import: Regex::new(r#"(?m)^import\s+(?:type\s+)?\{([^}]*)\}\s*from\s*['"]([^'"]+)['"]"#)?,
        })
    }

    /// Top-level names a file exposes: Python `def` / `class` /
    /// UPPER_CASE constants, JS/TS `export` declarations.
    pub fn exports(&self, path: &str, content: &str) -> BTreeSet<String> {
        let captures = |re: &Regex| {
            re.captures_iter(content)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect::<Vec<_>>()
        };
        match Language::for_path(path) {
            Some(Language::Python) => captures(&self.py_def)
                .into_iter()
                .chain(captures(&self.py_const))
                .collect(),
            Some(Language::Script) => captures(&self.js_export)
                .into_iter()
                .chain(captures(&self.js_default))
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// `(module, symbol)` pairs a file imports. `import pkg.mod` yields
    /// `(pkg.mod, mod)`.
    pub fn imports(&self, path: &str, content: &str) -> BTreeSet<(String, String)> {
        let mut out = BTreeSet::new();
        match Language::for_path(path) {
            Some(Language::Python) => {
                for cap in self.py_from.captures_iter(content) {
                    let module = &cap[1];
                    for name in split_names(&cap[2]) {
                        out.insert((module.to_string(), name));
                    }
                }
                for cap in self.py_import.captures_iter(content) {
                    let module = &cap[1];
                    let last = module.rsplit('.').next().unwrap_or(module);
                    out.insert((module.to_string(), last.to_string()));
                }
            }
            Some(Language::Script) => {
                for cap in self.js_import.captures_iter(content) {
                    let module = &cap[2];
                    for name in split_names(&cap[1]) {
                        out.insert((module.to_string(), name));
                    }
                }
            }
            None => {}
        }
        out
    }

    /// Sorted `+name` for added exports, then sorted `-name` for removed.
    pub fn changes(&self, path: &str, before: &str, after: &str) -> Vec<String> {
        let before = self.exports(path, before);
        let after = self.exports(path, after);
        after
            .difference(&before)
            .map(|s| format!("+{s}"))
            .chain(before.difference(&after).map(|s| format!("-{s}")))
            .collect()
    }

    /// Claims on other files that import a symbol `changes` removed from
    /// `changed_file`. Unreadable or non-file claims are skipped.
    pub fn dependents(&self, changed_file: &str, changes: &[String], claims: &[Claim]) -> Vec<SoftConflict> {
        let removed: BTreeSet<&str> = changes.iter().filter_map(|c| c.strip_prefix('-')).collect();
        if removed.is_empty() {
            return Vec::new();
        }
        let stem = Path::new(changed_file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        let mut affected = Vec::new();
        for claim in claims {
            if claim.resource_id == changed_file || !Path::new(&claim.resource_id).is_absolute() {
                continue;
            }
            let Ok(content) = fs::read_to_string(&claim.resource_id) else {
                continue;
            };
            let hit: BTreeSet<String> = self
                .imports(&claim.resource_id, &content)
                .into_iter()
                .filter(|(module, symbol)| removed.contains(symbol.as_str()) && module_names(module, stem))
                .map(|(_, symbol)| symbol)
                .collect();
            if !hit.is_empty() {
                affected.push(SoftConflict {
                    changed_file: changed_file.to_string(),
                    symbols: hit.into_iter().collect(),
                    affected_agent: claim.agent_id.clone(),
                    affected_file: claim.resource_id.clone(),
                });
            }
        }
        affected
    }
}

fn split_names(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_end_matches('\\')
        .split(',')
        .map(|name| name.trim().trim_matches(|c| c == '(' || c == ')').trim())
        .filter_map(|name| name.split(" as ").next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "*")
        .map(String::from)
        .collect()
}

/// Soft conflicts the working-tree version of `file` (an absolute path)
/// would cause against HEAD, among claims not held by `agent_id`.
pub fn working_tree_conflicts(
    db: &MeshDb,
    repo_root: &Path,
    file: &str,
    agent_id: Option<&str>,
) -> Result<Vec<SoftConflict>> {
    let Some(rel) = git::workdir_relative(repo_root, Path::new(file)) else {
        return Ok(Vec::new());
    };
    let before = git::file_at_head(repo_root, &rel)?.unwrap_or_default();
    let after = fs::read_to_string(file).unwrap_or_default();
    let scanner = SymbolScanner::new()?;
    let changes = scanner.changes(file, &before, &after);
    let others = foreign_claims(db, agent_id)?;
    Ok(scanner.dependents(file, &changes, &others))
}

fn foreign_claims(db: &MeshDb, agent_id: Option<&str>) -> Result<Vec<Claim>> {
    Ok(db
        .list_active()?
        .into_iter()
        .filter(|c| Some(c.agent_id.as_str()) != agent_id)
        .collect())
}

/// Export changes per staged file (HEAD vs index), keyed by absolute path.
/// Files without changed exports are omitted.
pub fn staged_changes(repo_root: &Path, files: &[String]) -> Result<Vec<(String, Vec<String>)>> {
    let Some(workdir) = git::workdir(repo_root) else {
        return Ok(Vec::new());
    };
    let scanner = SymbolScanner::new()?;
    let mut out = Vec::new();
    for rel in files {
        let before = git::file_at_head(repo_root, rel)?.unwrap_or_default();
        let after = git::file_in_index(repo_root, rel)?.unwrap_or_default();
        let changes = scanner.changes(rel, &before, &after);
        if changes.iter().any(|c| c.starts_with('-')) {
            let abs = workdir.join(rel).to_string_lossy().into_owned();
            out.push((abs, changes));
        }
    }
    Ok(out)
}

/// Alert every other agent whose claimed file imports a symbol that
/// `changes` removed from `changed_file`.
pub fn post_alerts(
    db: &MeshDb,
    changed_file: &str,
    changes: &[String],
    agent_id: &str,
    episode_id: Option<&str>,
) -> Result<Vec<SoftConflict>> {
    let others = foreign_claims(db, Some(agent_id))?;
    let conflicts = SymbolScanner::new()?.dependents(changed_file, changes, &others);
    let removed: Vec<&str> = changes.iter().filter(|c| c.starts_with('-')).map(String::as_str).collect();

    for conflict in &conflicts {
        let body = format!(
            "Soft conflict: {} changed symbols {}. Your file {} may import these.",
            conflict.changed_file,
            removed.join(", "),
            conflict.affected_file
        );
        db.post_message(&NewMessage {
            from_agent: agent_id,
            to_agent: Some(&conflict.affected_agent),
            channel: "general",
            severity: Severity::Attn,
            body: &body,
            episode_id,
        })?;
        db.append_event(
            EventKind::SoftConflict,
            agent_id,
            json!({
                "changed_file": conflict.changed_file,
                "symbols": conflict.symbols,
                "affected_agent": conflict.affected_agent,
                "affected_file": conflict.affected_file,
                "episode_id": episode_id,
            }),
        )?;
        tracing::info!(
            file = %conflict.changed_file,
            affected = %conflict.affected_agent,
            "soft conflict posted"
        );
    }
    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::claims::ClaimRequest;
    use tempfile::tempdir;

    fn scanner() -> SymbolScanner {
        SymbolScanner::new().unwrap()
    }

    #[test]
    fn python_exports_are_defs_classes_and_constants() {
        let src = "def foo():\n    pass\n\nclass Bar:\n    pass\n\nMAX_SIZE = 100\nlocal_var = 1\n\
                   async def fetch():\n    pass\n    def nested():\n        pass\n";
        let exports = scanner().exports("module.py", src);
        assert_eq!(
            exports.into_iter().collect::<Vec<_>>(),
            ["Bar", "MAX_SIZE", "fetch", "foo"]
        );
    }

    #[test]
    fn script_exports_cover_named_and_default() {
        let src = "export function load() {}\nexport const LIMIT = 3;\nexport interface Shape {}\n\
                   export default class Widget {}\nfunction hidden() {}\n";
        let exports = scanner().exports("widget.ts", src);
        assert_eq!(
            exports.into_iter().collect::<Vec<_>>(),
            ["LIMIT", "Shape", "Widget", "load"]
        );
        assert!(scanner().exports("notes.md", src).is_empty());
    }

    #[test]
    fn imports_split_aliases_and_parentheses() {
        let src = "from models import Agent, Claim as C\nfrom .store import (Db,\nimport json\nimport pkg.util\n";
        let imports = scanner().imports("consumer.py", src);
        assert!(imports.contains(&("models".into(), "Agent".into())));
        assert!(imports.contains(&("models".into(), "Claim".into())));
        assert!(imports.contains(&(".store".into(), "Db".into())));
        assert!(imports.contains(&("json".into(), "json".into())));
        assert!(imports.contains(&("pkg.util".into(), "util".into())));

        let js = "import { load, save as persist } from './io';\n";
        let imports = scanner().imports("app.js", js);
        assert!(imports.contains(&("./io".into(), "load".into())));
        assert!(imports.contains(&("./io".into(), "save".into())));
    }

    #[test]
    fn changes_list_additions_then_removals() {
        let before = "def foo():\n    pass\n\ndef bar():\n    pass\n";
        let after = "def foo():\n    pass\n\ndef baz():\n    pass\n";
        assert_eq!(scanner().changes("m.py", before, after), ["+baz", "-bar"]);
        assert!(scanner().changes("m.py", before, before).is_empty());
    }

    #[test]
    fn module_match_uses_the_last_segment() {
        assert!(module_names("models", "models"));
        assert!(module_names("app.models", "models"));
        assert!(module_names(".models", "models"));
        assert!(module_names("./models", "models"));
        assert!(module_names("../lib/models.js", "models"));
        assert!(!module_names("mymodels", "models"));
    }

    #[test]
    fn removed_symbol_alerts_the_importing_holder() {
        let dir = tempdir().unwrap();
        let models = dir.path().join("models.py");
        let consumer = dir.path().join("consumer.py");
        let bystander = dir.path().join("other.py");
        fs::write(&models, "def Agent():\n    pass\n").unwrap();
        fs::write(&consumer, "from models import OldModel, Agent\n").unwrap();
        fs::write(&bystander, "from models import Agent\n").unwrap();
        let models = models.to_string_lossy().into_owned();
        let consumer = consumer.to_string_lossy().into_owned();
        let bystander = bystander.to_string_lossy().into_owned();

        let db = MeshDb::open_memory().unwrap();
        db.acquire(&ClaimRequest::new(models.as_str(), "a1", 600)).unwrap();
        db.acquire(&ClaimRequest::new(consumer.as_str(), "a2", 600)).unwrap();
        db.acquire(&ClaimRequest::new(bystander.as_str(), "a3", 600)).unwrap();
        db.acquire(&ClaimRequest::new("PORT:8000", "a4", 600)).unwrap();

        let changes = vec!["+NewModel".to_string(), "-OldModel".to_string()];
        let posted = post_alerts(&db, &models, &changes, "a1", None).unwrap();
        assert_eq!(
            posted,
            vec![SoftConflict {
                changed_file: models.clone(),
                symbols: vec!["OldModel".into()],
                affected_agent: "a2".into(),
                affected_file: consumer.clone(),
            }]
        );

        let inbox = db.inbox("a2", false).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].severity, Severity::Attn);
        assert!(inbox[0].body.starts_with("Soft conflict:"));
        assert!(inbox[0].body.contains("-OldModel"));

        let events = db.tail_events(10, Some(EventKind::SoftConflict)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["affected_agent"], "a2");
        assert_eq!(events[0].payload["symbols"], json!(["OldModel"]));
    }

    #[test]
    fn additions_alone_alert_nobody() {
        let db = MeshDb::open_memory().unwrap();
        let posted = post_alerts(&db, "/repo/models.py", &["+Fresh".to_string()], "a1", None).unwrap();
        assert!(posted.is_empty());
        assert_eq!(db.event_count().unwrap(), 0);
    }
}
