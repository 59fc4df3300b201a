use std::path::PathBuf;

use crate::settings::Settings;

/// Where server binaries are looked for when nothing else is configured.
pub const DEFAULT_ASSETS_DIR: &str = "/usr/local/kubebuilder/bin";

/// Finds the binary for `symbolic_name` (e.g. `kube-apiserver`).
///
/// In order of precedence:
/// 1. `TEST_ASSET_<NAME>`, where `<NAME>` is `symbolic_name` upper-cased with
///    runs of other characters replaced by `_` and leading digits dropped
/// 2. `<KUBEBUILDER_ASSETS>/<symbolic_name>`
/// 3. `/usr/local/kubebuilder/bin/<symbolic_name>`
pub fn bin_path_finder(symbolic_name: &str, settings: &Settings) -> PathBuf {
    if let Some(path) = settings.asset_overrides.get(&sanitize(symbolic_name)) {
        return path.clone();
    }

    match &settings.assets_dir {
        Some(dir) => dir.join(symbolic_name),
        None => PathBuf::from(DEFAULT_ASSETS_DIR).join(symbolic_name),
    }
}

fn sanitize(symbolic_name: &str) -> String {
    let mut sanitized = String::with_capacity(symbolic_name.len());
    for c in symbolic_name.chars().map(|c| c.to_ascii_uppercase()) {
        if c.is_ascii_uppercase() || c.is_ascii_digit() {
            sanitized.push(c);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }

    sanitized.trim_start_matches(|c: char| c.is_ascii_digit()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize("kube-apiserver"), "KUBE_APISERVER");
        assert_eq!(sanitize("etcd"), "ETCD");
        assert_eq!(sanitize("3some-.-bin"), "SOME_BIN");
    }

    #[test]
    fn explicit_override_wins() {
        let mut settings = Settings {
            assets_dir: Some("/assets".into()),
            ..Default::default()
        };
        settings
            .asset_overrides
            .insert("KUBE_APISERVER".into(), "/custom/apiserver".into());

        assert_eq!(
            bin_path_finder("kube-apiserver", &settings),
            PathBuf::from("/custom/apiserver")
        );
        assert_eq!(
            bin_path_finder("etcd", &settings),
            PathBuf::from("/assets/etcd")
        );
    }

    #[test]
    fn falls_back_to_default_dir() {
        assert_eq!(
            bin_path_finder("kine", &Settings::default()),
            PathBuf::from(DEFAULT_ASSETS_DIR).join("kine")
        );
    }
}
