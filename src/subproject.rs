//! Subproject detection for monorepos.
//!
//! A subproject is a subdirectory identified either by explicit
//! configuration or by glob patterns over the repository tree (default
//! `packages/*`, `apps/*`, where `*` matches exactly one path segment).

use glob::{MatchOptions, Pattern};

use crate::config::ConductorConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subproject {
    pub path: String,
    pub name: String,
}

pub struct SubprojectDetector {
    explicit: Vec<Subproject>,
    patterns: Vec<Pattern>,
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

impl SubprojectDetector {
    pub fn from_config(config: &ConductorConfig) -> Self {
        let explicit = config
            .subprojects
            .explicit
            .iter()
            .map(|s| Subproject {
                path: s.path.trim_end_matches('/').to_string(),
                name: s.name.clone(),
            })
            .collect();
        let patterns = if config.subprojects.auto_detect.enabled {
            config
                .subprojects
                .auto_detect
                .patterns
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .collect()
        } else {
            Vec::new()
        };
        Self { explicit, patterns }
    }

    /// Detect subprojects from a repository path listing. Explicit entries
    /// win; otherwise directories matching the auto-detect globs are used.
    pub fn detect(&self, repo_paths: &[String]) -> Vec<Subproject> {
        if !self.explicit.is_empty() {
            return self.explicit.clone();
        }
        let mut found: Vec<Subproject> = Vec::new();
        for path in repo_paths {
            let dir = directory_prefixes(path);
            for candidate in dir {
                if self
                    .patterns
                    .iter()
                    .any(|p| p.matches_with(&candidate, match_options()))
                    && !found.iter().any(|s| s.path == candidate)
                {
                    let name = candidate
                        .rsplit('/')
                        .next()
                        .unwrap_or(candidate.as_str())
                        .to_string();
                    found.push(Subproject {
                        path: candidate,
                        name,
                    });
                }
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found
    }

    /// Map a changed file path to its owning subproject, or `.` when the
    /// path falls outside every known subproject.
    pub fn subproject_for_path(&self, subprojects: &[Subproject], path: &str) -> String {
        for sub in subprojects {
            let prefix = format!("{}/", sub.path);
            if path == sub.path || path.starts_with(&prefix) {
                return sub.path.clone();
            }
        }
        ".".to_string()
    }

    /// Whether a subproject path is valid for a planned subtask.
    pub fn is_known(&self, subprojects: &[Subproject], path: &str) -> bool {
        path == "." || subprojects.iter().any(|s| s.path == path)
    }
}

/// All directory prefixes of a file path, e.g. `a/b/c.rs` -> [`a`, `a/b`].
fn directory_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let segments: Vec<&str> = path.split('/').collect();
    for end in 1..segments.len() {
        prefixes.push(segments[..end].join("/"));
    }
    prefixes
}
