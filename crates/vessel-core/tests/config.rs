use std::env;
use std::path::PathBuf;

use anyhow::Result;
use serial_test::serial;
use tempfile::tempdir;
use vessel_core::config::{ENV_DEPOT_PATH, ENV_IGNORE_HASHES, ENV_PKG_SERVER, ENV_VERIFY_UNPACK};
use vessel_core::{ArtifactHash, Config, Installer, UnpackVerification};

struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    fn set(key: &'static str, value: Option<&str>) -> Self {
        let previous = env::var(key).ok();
        match value {
            Some(value) => env::set_var(key, value),
            None => env::remove_var(key),
        }
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => env::set_var(self.key, value),
            None => env::remove_var(self.key),
        }
    }
}

#[test]
#[serial]
fn config_reads_process_environment() -> Result<()> {
    let temp = tempdir()?;
    let first = temp.path().join("first");
    let second = temp.path().join("second");
    let joined = env::join_paths([&first, &second])?;
    let _depots = EnvGuard::set(ENV_DEPOT_PATH, joined.to_str());
    let _server = EnvGuard::set(ENV_PKG_SERVER, Some("https://pkg.example/"));
    let _ignore = EnvGuard::set(ENV_IGNORE_HASHES, Some("1"));
    let _verify = EnvGuard::set(ENV_VERIFY_UNPACK, Some("0"));

    let config = Config::from_env()?;
    assert_eq!(config.depots, vec![first.clone(), second]);
    assert_eq!(config.primary_depot(), Some(&first));
    assert_eq!(config.pkg_server.as_deref(), Some("https://pkg.example"));
    assert!(config.ignore_hashes);
    assert_eq!(config.unpack_verification, UnpackVerification::TrustExpected);
    Ok(())
}

#[test]
#[serial]
fn config_defaults_without_environment() -> Result<()> {
    let _depots = EnvGuard::set(ENV_DEPOT_PATH, None);
    let _server = EnvGuard::set(ENV_PKG_SERVER, None);
    let _ignore = EnvGuard::set(ENV_IGNORE_HASHES, Some("yes"));
    let _verify = EnvGuard::set(ENV_VERIFY_UNPACK, None);

    let config = Config::from_env()?;
    assert_eq!(config.depots.len(), 1);
    assert!(config.depots[0].ends_with(".vessel"));
    assert_eq!(config.pkg_server, None);
    assert!(!config.ignore_hashes, "only a literal 1 enables the escape hatch");
    assert_eq!(
        config.unpack_verification,
        UnpackVerification::platform_default()
    );
    Ok(())
}

#[test]
fn installer_from_config_uses_primary_depot() -> Result<()> {
    let temp = tempdir()?;
    let depot: PathBuf = temp.path().join("depot");
    let config = Config::with_depots(vec![depot.clone()]);
    let installer = Installer::from_config(&config, std::sync::Arc::new(NoFetch))?;
    assert_eq!(installer.store().primary_root(), depot.join("artifacts"));
    let hash: ArtifactHash = "0".repeat(40).parse()?;
    assert!(installer.store().overrides().lookup(&hash).is_none());
    Ok(())
}

struct NoFetch;

impl vessel_core::Fetcher for NoFetch {
    fn fetch_and_unpack(
        &self,
        url: &str,
        _sha256: Option<&str>,
        _dest: &std::path::Path,
    ) -> Result<(), vessel_core::FetchError> {
        Err(vessel_core::FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}
