//! Locate the profile the user asked for, tolerating small typos in the name.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// A located profile and, when the name had to be guessed, the message saying so
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub path: PathBuf,
    pub note: Option<String>,
}

fn normalise_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn ovpn_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("ovpn"))
        })
        .collect();
    files.sort();
    files
}

/// Resolve `requested` against the working directory, `base_dir` and `secrets_dir`.
///
/// When no candidate exists, `.ovpn` files next to the requested path and in
/// `secrets_dir` are compared by their lower-case alphanumeric stem.
pub fn resolve_config_path(requested: &Path, base_dir: &Path, secrets_dir: &Path) -> Result<ResolvedConfig> {
    let mut candidates = vec![requested.to_path_buf()];
    if requested.is_relative() {
        candidates.push(base_dir.join(requested));
    }
    if let Some(name) = requested.file_name() {
        candidates.push(secrets_dir.join(name));
    }
    candidates.dedup();

    if let Some(found) = candidates.iter().find(|c| c.is_file()) {
        return Ok(ResolvedConfig {
            path: found.clone(),
            note: None,
        });
    }

    let wanted = requested
        .file_stem()
        .map(|s| normalise_name(&s.to_string_lossy()))
        .unwrap_or_default();

    if !wanted.is_empty() {
        let mut search_dirs: Vec<PathBuf> = Vec::new();
        if let Some(parent) = requested.parent().filter(|p| !p.as_os_str().is_empty()) {
            search_dirs.push(parent.to_path_buf());
            if parent.is_relative() {
                search_dirs.push(base_dir.join(parent));
            }
        }
        search_dirs.push(secrets_dir.to_path_buf());

        for dir in &search_dirs {
            let matched = ovpn_files(dir).into_iter().find(|path| {
                path.file_stem()
                    .is_some_and(|stem| normalise_name(&stem.to_string_lossy()) == wanted)
            });
            if let Some(found) = matched {
                let note = format!(
                    "Resolved '{}' to '{}'",
                    requested.display(),
                    found.display()
                );
                tracing::info!("{}", note);
                return Ok(ResolvedConfig {
                    path: found,
                    note: Some(note),
                });
            }
        }
    }

    let checked: Vec<String> = candidates.iter().map(|c| c.display().to_string()).collect();
    anyhow::bail!(
        "Configuration file not found: {}. Checked: {}",
        requested.display(),
        checked.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_path_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.ovpn");
        fs::write(&path, "client\n").unwrap();

        let resolved = resolve_config_path(&path, dir.path(), dir.path()).unwrap();
        assert_eq!(resolved.path, path);
        assert_eq!(resolved.note, None);
    }

    #[test]
    fn test_bare_name_is_found_in_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join("secrets");
        fs::create_dir_all(&secrets).unwrap();
        fs::write(secrets.join("site.ovpn"), "client\n").unwrap();

        let resolved =
            resolve_config_path(Path::new("elsewhere/site.ovpn"), dir.path(), &secrets).unwrap();
        assert_eq!(resolved.path, secrets.join("site.ovpn"));
    }

    #[test]
    fn test_typo_in_name_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join("secrets");
        fs::create_dir_all(&secrets).unwrap();
        fs::write(secrets.join("Prognoza-UMG-509-PRO.ovpn"), "client\n").unwrap();

        let requested = secrets.join("prognoza_umg 509 pro.ovpn");
        let resolved = resolve_config_path(&requested, dir.path(), &secrets).unwrap();
        assert_eq!(resolved.path, secrets.join("Prognoza-UMG-509-PRO.ovpn"));
        assert!(resolved.note.unwrap().starts_with("Resolved '"));
    }

    #[test]
    fn test_missing_profile_lists_checked_locations() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join("secrets");

        let err = resolve_config_path(Path::new("missing.ovpn"), dir.path(), &secrets).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Configuration file not found: missing.ovpn. Checked: "));
        assert!(message.contains(&secrets.join("missing.ovpn").display().to_string()));
    }
}
