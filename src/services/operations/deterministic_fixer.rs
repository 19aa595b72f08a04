//! Deterministic Fixer
//!
//! Pure transformation that resolves typed issues without model inference.
//! Handles the mechanical cases: unused imports are removed, and
//! missing-module diagnostics (`TS2307`) become `bun install` commands.
//! Everything else is reported back as unfixable.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

use crate::models::phase::GeneratedFile;
use crate::services::sandbox::AnalysisIssue;

/// Diagnostic codes for unused imports/declarations.
const UNUSED_CODES: &[&str] = &["TS6133", "TS6192"];
/// Diagnostic code for a missing module.
const MISSING_MODULE_CODE: &str = "TS2307";

/// Outcome of a deterministic fixing pass.
#[derive(Debug, Default)]
pub struct DeterministicFixResult {
    pub modified_files: Vec<GeneratedFile>,
    pub unfixable_issues: Vec<AnalysisIssue>,
    /// Install commands derived from missing-module diagnostics.
    pub install_commands: Vec<String>,
}

impl DeterministicFixResult {
    pub fn fixed_count(&self) -> usize {
        self.modified_files.len()
    }
}

/// Apply deterministic fixes for `type_issues` over `all_files`.
pub fn deterministic_fix(
    all_files: &BTreeMap<String, String>,
    type_issues: &[AnalysisIssue],
) -> DeterministicFixResult {
    let module_re = Regex::new(r"Cannot find module '([^']+)'").expect("static module regex");
    let mut result = DeterministicFixResult::default();
    // Collect line removals per file first so multiple issues against the
    // same file apply in one rewrite.
    let mut removals: BTreeMap<String, Vec<u32>> = BTreeMap::new();

    for issue in type_issues {
        if UNUSED_CODES.contains(&issue.code.as_str()) {
            match (&issue.file_path, issue.line) {
                (Some(path), Some(line)) if all_files.contains_key(path) => {
                    removals.entry(path.clone()).or_default().push(line);
                }
                _ => result.unfixable_issues.push(issue.clone()),
            }
            continue;
        }

        if issue.code == MISSING_MODULE_CODE {
            match module_re
                .captures(&issue.message)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
                .and_then(package_for_module)
            {
                Some(package) => {
                    let command = format!("bun install {package}");
                    if !result.install_commands.contains(&command) {
                        result.install_commands.push(command);
                    }
                }
                None => result.unfixable_issues.push(issue.clone()),
            }
            continue;
        }

        result.unfixable_issues.push(issue.clone());
    }

    for (path, lines) in removals {
        let contents = &all_files[&path];
        if let Some(rewritten) = remove_import_lines(contents, &lines) {
            result
                .modified_files
                .push(GeneratedFile::new(path, rewritten));
        }
    }

    debug!(
        fixed = result.fixed_count(),
        installs = result.install_commands.len(),
        unfixable = result.unfixable_issues.len(),
        "deterministic fix pass"
    );
    result
}

/// Installable package name for an import specifier. Relative and
/// path-alias imports are not installable.
fn package_for_module(specifier: &str) -> Option<String> {
    if specifier.starts_with('.') || specifier.starts_with('/') || specifier.starts_with("@/") {
        return None;
    }
    let segments: Vec<&str> = specifier.split('/').collect();
    let package = if specifier.starts_with('@') {
        if segments.len() < 2 {
            return None;
        }
        format!("{}/{}", segments[0], segments[1])
    } else {
        segments[0].to_string()
    };
    (!package.is_empty()).then_some(package)
}

/// Remove 1-indexed `lines` from `contents` when they are import lines.
/// Returns `None` when nothing was removed.
fn remove_import_lines(contents: &str, lines: &[u32]) -> Option<String> {
    let mut removed_any = false;
    let kept: Vec<&str> = contents
        .lines()
        .enumerate()
        .filter(|(index, line)| {
            let line_number = (*index as u32) + 1;
            if lines.contains(&line_number) && line.trim_start().starts_with("import") {
                removed_any = true;
                false
            } else {
                true
            }
        })
        .map(|(_, line)| line)
        .collect();

    removed_any.then(|| {
        let mut rewritten = kept.join("\n");
        if contents.ends_with('\n') {
            rewritten.push('\n');
        }
        rewritten
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files_with(path: &str, contents: &str) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        files.insert(path.to_string(), contents.to_string());
        files
    }

    #[test]
    fn test_unused_import_removed() {
        let files = files_with(
            "src/a.ts",
            "import { unused } from 'zod';\nimport { used } from 'hono';\nused();\n",
        );
        let issues = vec![AnalysisIssue::new("'unused' is declared but never read", "TS6133")
            .at("src/a.ts", 1)];

        let result = deterministic_fix(&files, &issues);
        assert_eq!(result.fixed_count(), 1);
        let rewritten = &result.modified_files[0].contents;
        assert!(!rewritten.contains("unused"));
        assert!(rewritten.contains("hono"));
        assert!(result.unfixable_issues.is_empty());
    }

    #[test]
    fn test_non_import_line_is_not_removed() {
        let files = files_with("src/a.ts", "const x = 1;\n");
        let issues =
            vec![AnalysisIssue::new("'x' is declared but never read", "TS6133").at("src/a.ts", 1)];
        let result = deterministic_fix(&files, &issues);
        assert_eq!(result.fixed_count(), 0);
    }

    #[test]
    fn test_missing_module_becomes_install_command() {
        let files = files_with("src/a.ts", "import { z } from 'zod';\n");
        let issues = vec![
            AnalysisIssue::new("Cannot find module 'zod'", "TS2307").at("src/a.ts", 1),
            AnalysisIssue::new("Cannot find module 'zod'", "TS2307").at("src/b.ts", 1),
        ];
        let result = deterministic_fix(&files, &issues);
        assert_eq!(result.install_commands, vec!["bun install zod"]);
    }

    #[test]
    fn test_scoped_and_subpath_modules() {
        assert_eq!(package_for_module("lodash/fp").as_deref(), Some("lodash"));
        assert_eq!(
            package_for_module("@tanstack/react-query/core").as_deref(),
            Some("@tanstack/react-query")
        );
        assert_eq!(package_for_module("./local"), None);
        assert_eq!(package_for_module("@/components/ui"), None);
    }

    #[test]
    fn test_relative_module_is_unfixable() {
        let files = files_with("src/a.ts", "import { x } from './missing';\n");
        let issues =
            vec![AnalysisIssue::new("Cannot find module './missing'", "TS2307").at("src/a.ts", 1)];
        let result = deterministic_fix(&files, &issues);
        assert!(result.install_commands.is_empty());
        assert_eq!(result.unfixable_issues.len(), 1);
    }

    #[test]
    fn test_unknown_code_is_unfixable() {
        let files = files_with("src/a.ts", "const x: string = 1;\n");
        let issues = vec![AnalysisIssue::new(
            "Type 'number' is not assignable to type 'string'",
            "TS2322",
        )
        .at("src/a.ts", 1)];
        let result = deterministic_fix(&files, &issues);
        assert_eq!(result.unfixable_issues.len(), 1);
        assert_eq!(result.fixed_count(), 0);
    }
}
