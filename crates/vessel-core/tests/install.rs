use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::{tempdir, TempDir};
use vessel_core::{
    is_cancelled, ArtifactError, ArtifactHash, ArtifactStore, BindOptions, DownloadSource,
    Entry, FetchError, Fetcher, GitTreeHasher, Installer, ManifestManager, NoOverrides,
    OverrideTable, Platform, QueryOptions, Redirect, SelectOptions, TreeHasher,
    UnpackVerification,
};

type Files = Vec<(&'static str, &'static [u8])>;

enum Response {
    Serve(Files),
    Fail(u16),
    Cancel,
}

/// Serves canned directory trees keyed by URL and records every request.
#[derive(Default)]
struct FakeFetcher {
    responses: HashMap<String, Response>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn serve(mut self, url: &str, files: Files) -> Self {
        self.responses.insert(url.to_string(), Response::Serve(files));
        self
    }

    fn fail(mut self, url: &str, status: u16) -> Self {
        self.responses.insert(url.to_string(), Response::Fail(status));
        self
    }

    fn cancel(mut self, url: &str) -> Self {
        self.responses.insert(url.to_string(), Response::Cancel);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch_and_unpack(
        &self,
        url: &str,
        _sha256: Option<&str>,
        dest: &Path,
    ) -> Result<(), FetchError> {
        self.calls.lock().expect("calls lock").push(url.to_string());
        match self.responses.get(url) {
            Some(Response::Serve(files)) => {
                for (name, contents) in files {
                    let path = dest.join(name);
                    let io = |source| FetchError::Io {
                        url: url.to_string(),
                        source,
                    };
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(io)?;
                    }
                    fs::write(&path, contents).map_err(io)?;
                }
                Ok(())
            }
            Some(Response::Cancel) => Err(FetchError::Cancelled),
            Some(Response::Fail(status)) => Err(FetchError::Status {
                url: url.to_string(),
                status: *status,
            }),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

fn data_files() -> Files {
    vec![("data.txt", &b"payload\n"[..]), ("nested/info", &b"v1\n"[..])]
}

fn other_files() -> Files {
    vec![("data.txt", &b"something else\n"[..])]
}

fn hash_of(files: &Files) -> Result<ArtifactHash> {
    let temp = tempdir()?;
    for (name, contents) in files {
        let path = temp.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
    }
    GitTreeHasher.tree_hash(temp.path())
}

struct Fixture {
    temp: TempDir,
    fetcher: Arc<FakeFetcher>,
    installer: Installer,
}

impl Fixture {
    fn new(fetcher: FakeFetcher) -> Result<Self> {
        Self::with_overrides(fetcher, OverrideTable::new())
    }

    fn with_overrides(fetcher: FakeFetcher, overrides: OverrideTable) -> Result<Self> {
        let temp = tempdir()?;
        let overrides = Arc::new(overrides);
        let store = ArtifactStore::new(
            vec![temp.path().join("depot")],
            Arc::new(GitTreeHasher),
            overrides.clone(),
        )?;
        let fetcher = Arc::new(fetcher);
        let installer = Installer::new(store, ManifestManager::new(overrides, None), fetcher.clone())
            .with_unpack_verification(UnpackVerification::Verify);
        Ok(Self {
            temp,
            fetcher,
            installer,
        })
    }

    fn manifest(&self) -> std::path::PathBuf {
        self.temp.path().join("Artifacts.toml")
    }

    fn bind(&self, name: &str, hash: ArtifactHash, urls: &[&str]) -> Result<()> {
        let downloads = urls
            .iter()
            .map(|url| DownloadSource::new(*url, "00".repeat(32)))
            .collect();
        self.installer.manifests().bind(
            &self.manifest(),
            name,
            hash,
            BindOptions {
                downloads,
                ..BindOptions::default()
            },
        )
    }

    fn store(&self) -> &ArtifactStore {
        self.installer.store()
    }
}

fn query() -> QueryOptions {
    QueryOptions {
        platform: Platform::new("linux", "x86_64"),
        pkg_context: None,
    }
}

#[test]
fn data_artifact_falls_back_to_second_source() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let fixture = Fixture::new(
        FakeFetcher::default()
            .fail("https://a.example/data.tar.gz", 404)
            .serve("https://b.example/data.tar.gz", data_files()),
    )?;
    fixture.bind(
        "data",
        expected,
        &["https://a.example/data.tar.gz", "https://b.example/data.tar.gz"],
    )?;

    let path = fixture
        .installer
        .ensure_installed("data", &fixture.manifest(), &query())?;
    assert!(path.ends_with(Path::new("artifacts").join(expected.to_hex())));
    assert_eq!(fs::read(path.join("data.txt"))?, b"payload\n");
    assert!(fixture.store().verify(&expected, false)?);

    let again = fixture
        .installer
        .ensure_installed("data", &fixture.manifest(), &query())?;
    assert_eq!(again, path);
    assert_eq!(fixture.fetcher.calls().len(), 2, "installed artifacts skip the network");
    Ok(())
}

#[test]
fn sources_are_tried_in_order_until_one_succeeds() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let urls = [
        "https://one.example/x.tar.gz",
        "https://two.example/x.tar.gz",
        "https://three.example/x.tar.gz",
    ];
    let fixture = Fixture::new(
        FakeFetcher::default()
            .fail(urls[0], 500)
            .fail(urls[1], 404)
            .serve(urls[2], data_files()),
    )?;
    fixture.bind("x", expected, &urls)?;
    fixture
        .installer
        .ensure_installed("x", &fixture.manifest(), &query())?;
    assert_eq!(fixture.fetcher.calls(), urls.to_vec());
    Ok(())
}

#[test]
fn exhausted_sources_report_every_failure() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let urls = ["https://one.example/x.tar.gz", "https://two.example/x.tar.gz"];
    let fixture = Fixture::new(FakeFetcher::default().fail(urls[0], 500))?;
    fixture.bind("x", expected, &urls)?;
    let err = fixture
        .installer
        .ensure_installed("x", &fixture.manifest(), &query())
        .unwrap_err();
    match err.downcast_ref::<ArtifactError>() {
        Some(ArtifactError::DownloadsExhausted { failures, .. }) => {
            let reported: Vec<_> = failures.iter().map(|f| f.url.as_str()).collect();
            assert_eq!(reported, urls.to_vec());
        }
        other => panic!("unexpected error {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("status 500"), "{message}");
    assert!(!fixture.store().exists(&expected));
    Ok(())
}

#[test]
fn mismatched_content_is_rejected() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let actual = hash_of(&other_files())?;
    let url = "https://evil.example/x.tar.gz";
    let fixture = Fixture::new(FakeFetcher::default().serve(url, other_files()))?;

    let err = fixture
        .installer
        .download_artifact(&expected, url, None)
        .unwrap_err();
    match err.downcast_ref::<ArtifactError>() {
        Some(ArtifactError::HashMismatch {
            expected: e,
            actual: a,
        }) => {
            assert_eq!(*e, expected);
            assert_eq!(*a, actual);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!fixture.store().exists(&expected));
    assert!(!fixture.store().exists(&actual));
    assert!(fixture.store().list_installed()?.is_empty());
    Ok(())
}

#[test]
fn mismatching_source_fails_install_without_trying_the_next() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let actual = hash_of(&other_files())?;
    let urls = ["https://evil.example/x.tar.gz", "https://good.example/x.tar.gz"];
    let fixture = Fixture::new(
        FakeFetcher::default()
            .serve(urls[0], other_files())
            .serve(urls[1], data_files()),
    )?;
    fixture.bind("x", expected, &urls)?;

    let err = fixture
        .installer
        .ensure_installed("x", &fixture.manifest(), &query())
        .unwrap_err();
    match err.downcast_ref::<ArtifactError>() {
        Some(mismatch @ ArtifactError::HashMismatch { actual: a, .. }) => {
            assert_eq!(*a, actual);
            assert_eq!(mismatch.code(), "VS130");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(fixture.fetcher.calls(), vec![urls[0].to_string()]);
    assert!(fixture.store().list_installed()?.is_empty());
    Ok(())
}

#[test]
fn mismatching_mirror_fails_install() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let mirror = format!("https://pkg.example/artifact/{expected}");
    let direct = "https://direct.example/x.tar.gz";
    let fixture = Fixture::new(
        FakeFetcher::default()
            .serve(&mirror, other_files())
            .serve(direct, data_files()),
    )?;
    let installer = fixture
        .installer
        .clone()
        .with_pkg_server(Some("https://pkg.example".to_string()));
    fixture.bind("x", expected, &[direct])?;

    let err = installer
        .ensure_installed("x", &fixture.manifest(), &query())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArtifactError>(),
        Some(ArtifactError::HashMismatch { .. })
    ));
    assert_eq!(fixture.fetcher.calls(), vec![mirror]);
    Ok(())
}

#[test]
fn ignore_hashes_installs_under_expected_hash() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let url = "https://evil.example/x.tar.gz";
    let mut fixture = Fixture::new(FakeFetcher::default().serve(url, other_files()))?;
    fixture.installer = fixture.installer.clone().with_ignore_hashes(true);

    assert!(fixture.installer.download_artifact(&expected, url, None)?);
    assert!(fixture.store().exists(&expected));
    assert!(!fixture.store().verify(&expected, false)?);
    Ok(())
}

#[test]
fn trusted_unpack_skips_verification() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let url = "https://mirror.example/x.tar.gz";
    let mut fixture = Fixture::new(FakeFetcher::default().serve(url, other_files()))?;
    fixture.installer = fixture
        .installer
        .clone()
        .with_unpack_verification(UnpackVerification::TrustExpected);
    assert!(fixture.installer.download_artifact(&expected, url, None)?);
    assert_eq!(
        fs::read(fixture.store().path(&expected, false).join("data.txt"))?,
        b"something else\n"
    );
    Ok(())
}

#[test]
fn transport_failures_return_false() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let fixture = Fixture::new(FakeFetcher::default())?;
    assert!(!fixture
        .installer
        .download_artifact(&expected, "https://nowhere.example/x.tar.gz", None)?);
    assert!(fixture.store().list_installed()?.is_empty());
    let leftovers: Vec<_> = match fs::read_dir(fixture.store().primary_root()) {
        Ok(entries) => entries.collect::<std::io::Result<_>>()?,
        Err(_) => Vec::new(),
    };
    assert!(leftovers.is_empty(), "staging directories must be cleaned up");
    Ok(())
}

#[test]
fn mirror_is_tried_first() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let mirror_url = format!("https://pkg.example/artifact/{expected}");
    let fixture = Fixture::new(FakeFetcher::default().serve(&mirror_url, data_files()))?;
    let installer = fixture
        .installer
        .clone()
        .with_pkg_server(Some("https://pkg.example/".to_string()));
    fixture.bind("x", expected, &["https://direct.example/x.tar.gz"])?;

    installer.ensure_installed("x", &fixture.manifest(), &query())?;
    assert_eq!(fixture.fetcher.calls(), vec![mirror_url]);
    Ok(())
}

#[test]
fn mirror_failure_falls_through_to_sources() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let direct = "https://direct.example/x.tar.gz";
    let fixture = Fixture::new(FakeFetcher::default().serve(direct, data_files()))?;
    let installer = fixture
        .installer
        .clone()
        .with_pkg_server(Some("https://pkg.example".to_string()));
    fixture.bind("x", expected, &[direct])?;

    installer.ensure_installed("x", &fixture.manifest(), &query())?;
    assert_eq!(
        fixture.fetcher.calls(),
        vec![format!("https://pkg.example/artifact/{expected}"), direct.to_string()]
    );
    Ok(())
}

#[test]
fn cancellation_stops_the_source_loop() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let urls = ["https://one.example/x.tar.gz", "https://two.example/x.tar.gz"];
    let fixture = Fixture::new(
        FakeFetcher::default()
            .cancel(urls[0])
            .serve(urls[1], data_files()),
    )?;
    fixture.bind("x", expected, &urls)?;
    let err = fixture
        .installer
        .ensure_installed("x", &fixture.manifest(), &query())
        .unwrap_err();
    assert!(is_cancelled(&err));
    assert!(matches!(
        err.downcast_ref::<ArtifactError>(),
        Some(ArtifactError::Cancelled)
    ));
    assert_eq!(fixture.fetcher.calls(), vec![urls[0].to_string()]);
    assert!(!fixture.store().exists(&expected));
    Ok(())
}

#[test]
fn entries_without_downloads_cannot_be_installed() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let fixture = Fixture::new(FakeFetcher::default())?;
    fixture.bind("x", expected, &[])?;
    let err = fixture
        .installer
        .ensure_installed("x", &fixture.manifest(), &query())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArtifactError>(),
        Some(ArtifactError::NoDownloadSource { .. })
    ));
    assert!(fixture.fetcher.calls().is_empty());
    Ok(())
}

#[test]
fn unknown_names_are_not_found() -> Result<()> {
    let fixture = Fixture::new(FakeFetcher::default())?;
    fixture.bind("x", hash_of(&data_files())?, &[])?;
    let err = fixture
        .installer
        .ensure_installed("missing", &fixture.manifest(), &query())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArtifactError>(),
        Some(ArtifactError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn missing_manifest_reports_not_found() -> Result<()> {
    let fixture = Fixture::new(FakeFetcher::default())?;
    let err = fixture
        .installer
        .ensure_installed("data", &fixture.manifest(), &query())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArtifactError>(),
        Some(ArtifactError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn overridden_entries_resolve_without_downloading() -> Result<()> {
    let expected = hash_of(&data_files())?;
    let external = tempdir()?;
    let mut table = OverrideTable::new();
    table.insert_hash(expected, Redirect::Path(external.path().to_path_buf()));
    let fixture = Fixture::with_overrides(FakeFetcher::default(), table)?;
    let entry = Entry::new(expected);
    let path = fixture.installer.ensure_entry_installed(
        "x",
        &entry,
        &fixture.manifest(),
        &query().platform,
    )?;
    assert_eq!(path, external.path());
    assert!(fixture.fetcher.calls().is_empty());
    Ok(())
}

#[test]
fn ensure_all_installs_eager_entries_only() -> Result<()> {
    let eager = hash_of(&data_files())?;
    let lazy = hash_of(&other_files())?;
    let fixture = Fixture::new(
        FakeFetcher::default()
            .serve("https://a.example/eager.tar.gz", data_files())
            .serve("https://a.example/lazy.tar.gz", other_files()),
    )?;
    fixture.bind("eager", eager, &["https://a.example/eager.tar.gz"])?;
    fixture.installer.manifests().bind(
        &fixture.manifest(),
        "lazy",
        lazy,
        BindOptions {
            lazy: true,
            downloads: vec![DownloadSource::new("https://a.example/lazy.tar.gz", "00".repeat(32))],
            ..BindOptions::default()
        },
    )?;

    let mut options = SelectOptions {
        platform: query().platform,
        include_lazy: false,
        pkg_context: None,
    };
    let installed = fixture
        .installer
        .ensure_all_installed(&fixture.manifest(), &options)?;
    assert_eq!(installed.keys().collect::<Vec<_>>(), vec!["eager"]);
    assert!(!fixture.store().exists(&lazy));

    options.include_lazy = true;
    let installed = fixture
        .installer
        .ensure_all_installed(&fixture.manifest(), &options)?;
    assert_eq!(installed.len(), 2);
    assert!(fixture.store().exists(&lazy));
    Ok(())
}

#[test]
fn installers_are_shareable_across_threads() -> Result<()> {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Installer>();
    assert_send_sync::<ArtifactStore>();

    let store = ArtifactStore::new(
        vec![tempdir()?.path().join("depot")],
        Arc::new(GitTreeHasher),
        Arc::new(NoOverrides),
    )?;
    assert!(store.list_installed()?.is_empty());
    Ok(())
}
