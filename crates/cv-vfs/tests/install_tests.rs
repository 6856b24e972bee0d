//! Installer behaviour against real package files

use cv_core::cancel::CancellationToken;
use cv_core::error::{InstallError, PackageError};
use cv_core::title::{Category, Serial, TitleKey};
use cv_loader::PackageBuilder;
use cv_vfs::{
    ContentCatalog, ContentLayout, InstallOptions, InstallOutcome, InstallProgress, Installer,
    NoProgress,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct Fixture {
    dir: tempfile::TempDir,
    installer: Installer,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ContentCatalog::load(dir.path().join("catalog.json")));
        let installer = Installer::new(ContentLayout::new(dir.path().join("content")), catalog);
        Self { dir, installer }
    }

    fn write(&self, name: &str, data: Vec<u8>) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn install(&self, path: &Path, options: &InstallOptions) -> Result<cv_core::InstalledTitle, InstallError> {
        self.installer
            .install_file(path, options, &NoProgress, &CancellationToken::new())
    }

    fn catalog(&self) -> &ContentCatalog {
        self.installer.catalog()
    }
}

fn game(version: &str, category: Category) -> PackageBuilder {
    PackageBuilder::new("CUSA00001", version, category)
        .unwrap()
        .add_dir("sce_sys")
        .add_file("sce_sys/param.sfo", b"PSF".to_vec())
        .add_file("eboot.bin", format!("eboot {}", version).into_bytes())
}

fn serial() -> Serial {
    Serial::parse("CUSA00001").unwrap()
}

#[test]
fn test_base_then_update_then_older_update() {
    let fx = Fixture::new();
    let options = InstallOptions::default();

    let base = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    let title = fx.install(&base, &options).unwrap();
    assert_eq!(title.serial, serial());
    assert_eq!(title.category, Category::Base);
    assert_eq!(title.version.as_str(), "1.00");

    let listed = fx.catalog().list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].version.as_str(), "1.00");
    assert!(title.install_path.join("eboot.bin").is_file());
    assert!(title.install_path.join("sce_sys/param.sfo").is_file());

    let update = fx.write("update.pkg", game("1.05", Category::Update).build().unwrap());
    let update_title = fx.install(&update, &options).unwrap();
    assert_eq!(update_title.version.as_str(), "1.05");
    assert!(update_title.install_path.ends_with("CUSA00001-UPDATE"));
    assert_eq!(fx.catalog().effective_version(&serial()).unwrap().as_str(), "1.05");

    let older = fx.write("older.pkg", game("1.02", Category::Update).build().unwrap());
    let err = fx.install(&older, &options).unwrap_err();
    match err {
        InstallError::VersionConflict {
            installed, incoming, ..
        } => {
            assert_eq!(installed.as_str(), "1.05");
            assert_eq!(incoming.as_str(), "1.02");
        }
        other => panic!("expected VersionConflict, got {:?}", other),
    }

    let key = TitleKey::new(serial(), Category::Update, None);
    assert_eq!(fx.catalog().find(&key).unwrap().version.as_str(), "1.05");
    let eboot = std::fs::read(update_title.install_path.join("eboot.bin")).unwrap();
    assert_eq!(eboot, b"eboot 1.05");
}

#[test]
fn test_version_compare_is_numeric() {
    let fx = Fixture::new();
    let options = InstallOptions::default();

    let v9 = fx.write("v9.pkg", game("9", Category::Update).build().unwrap());
    let v10 = fx.write("v10.pkg", game("10", Category::Update).build().unwrap());
    fx.install(&v9, &options).unwrap();
    fx.install(&v10, &options).unwrap();
    assert!(matches!(
        fx.install(&v9, &options),
        Err(InstallError::VersionConflict { .. })
    ));
}

#[test]
fn test_force_overwrite_allows_downgrade() {
    let fx = Fixture::new();
    let newer = fx.write("newer.pkg", game("1.05", Category::Update).build().unwrap());
    let older = fx.write("older.pkg", game("1.02", Category::Update).build().unwrap());
    fx.install(&newer, &InstallOptions::default()).unwrap();

    let options = InstallOptions {
        force_overwrite: true,
        ..InstallOptions::default()
    };
    let title = fx.install(&older, &options).unwrap();
    assert_eq!(title.version.as_str(), "1.02");
    assert_eq!(
        std::fs::read(title.install_path.join("eboot.bin")).unwrap(),
        b"eboot 1.02"
    );
}

#[test]
fn test_equal_version_is_caller_decision() {
    let fx = Fixture::new();
    let pkg = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    let first = fx.install(&pkg, &InstallOptions::default()).unwrap();

    match fx.install(&pkg, &InstallOptions::default()) {
        Err(InstallError::AlreadyInstalled { existing }) => {
            assert_eq!(existing.installed_at, first.installed_at);
        }
        other => panic!("expected AlreadyInstalled, got {:?}", other),
    }

    let options = InstallOptions {
        overwrite_same_version: true,
        ..InstallOptions::default()
    };
    let second = fx.install(&pkg, &options).unwrap();
    assert!(second.installed_at >= first.installed_at);
    assert_eq!(fx.catalog().len(), 1);
}

#[test]
fn test_cancel_mid_extraction_keeps_previous_install() {
    let fx = Fixture::new();
    let old = fx.write("old.pkg", game("1.00", Category::Base).build().unwrap());
    let installed = fx.install(&old, &InstallOptions::default()).unwrap();

    let new = fx.write("new.pkg", game("1.01", Category::Base).build().unwrap());
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let progress = move |p: InstallProgress| {
        if p.entries_completed == 1 {
            token.cancel();
        }
    };

    let result = fx
        .installer
        .install_file(&new, &InstallOptions::default(), &progress, &cancel);
    assert!(matches!(result, Err(InstallError::Cancelled)));

    let key = TitleKey::new(serial(), Category::Base, None);
    let record = fx.catalog().find(&key).unwrap();
    assert_eq!(record.version.as_str(), "1.00");
    assert_eq!(record.installed_at, installed.installed_at);
    assert_eq!(
        std::fs::read(installed.install_path.join("eboot.bin")).unwrap(),
        b"eboot 1.00"
    );

    let staging = fx.installer.layout().staging_root();
    assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    assert!(!fx.installer.registry().is_in_flight(&key));
}

#[test]
fn test_cancel_before_first_install_records_nothing() {
    let fx = Fixture::new();
    let pkg = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = fx
        .installer
        .install_file(&pkg, &InstallOptions::default(), &NoProgress, &cancel);
    assert!(matches!(result, Err(InstallError::Cancelled)));
    assert!(fx.catalog().is_empty());
}

#[test]
fn test_unsafe_entry_path_aborts_before_writing() {
    let fx = Fixture::new();
    let mut data = PackageBuilder::new("CUSA00001", "1.00", Category::Base)
        .unwrap()
        .add_file("good.bin", vec![1, 2, 3])
        .add_file("xx/evil", vec![4, 5, 6])
        .build()
        .unwrap();

    // Rewrite the stored name; the builder refuses to emit it directly
    let pos = data.windows(7).position(|w| w == b"xx/evil").unwrap();
    data[pos..pos + 2].copy_from_slice(b"..");
    let pkg = fx.write("evil.pkg", data);

    let err = fx.install(&pkg, &InstallOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        InstallError::Package(PackageError::UnsafeEntryPath(_))
    ));
    assert!(fx.catalog().is_empty());
    assert!(!fx.dir.path().join("content/CUSA00001").exists());
    assert!(!fx.dir.path().join("content/evil").exists());
}

#[test]
fn test_dlc_id_cannot_leave_content_root() {
    let fx = Fixture::new();
    let mut data = PackageBuilder::new("CUSA00001", "1.00", Category::Dlc)
        .unwrap()
        .dlc_id("ZZZZZZZZZZZZZ")
        .add_file("payload.bin", vec![7; 16])
        .build()
        .unwrap();

    // Sub-identifier lives at 0x48..0x58 in the header
    data[0x48..0x55].copy_from_slice(b"../../../evil");
    let pkg = fx.write("evil-dlc.pkg", data);

    let err = fx.install(&pkg, &InstallOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        InstallError::Package(PackageError::UnsafeEntryPath(_))
    ));
    assert!(fx.catalog().is_empty());
    assert!(!fx.dir.path().join("evil").exists());
    assert!(!fx.dir.path().join("content/addcont").exists());
}

#[test]
fn test_corrupt_entry_leaves_previous_install() {
    let fx = Fixture::new();
    let old = fx.write("old.pkg", game("1.00", Category::Base).build().unwrap());
    fx.install(&old, &InstallOptions::default()).unwrap();

    let mut data = game("1.01", Category::Base).build().unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    let bad = fx.write("bad.pkg", data);

    match fx.install(&bad, &InstallOptions::default()) {
        Err(InstallError::CorruptEntries { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].path, "eboot.bin");
        }
        other => panic!("expected CorruptEntries, got {:?}", other),
    }

    let key = TitleKey::new(serial(), Category::Base, None);
    let record = fx.catalog().find(&key).unwrap();
    assert_eq!(record.version.as_str(), "1.00");
    assert_eq!(
        std::fs::read(record.install_path.join("eboot.bin")).unwrap(),
        b"eboot 1.00"
    );
}

#[test]
fn test_truncated_package_is_structural() {
    let fx = Fixture::new();
    let mut data = game("1.00", Category::Base).build().unwrap();
    data.truncate(data.len() - 4);
    let pkg = fx.write("short.pkg", data);

    assert!(matches!(
        fx.install(&pkg, &InstallOptions::default()),
        Err(InstallError::Package(PackageError::TruncatedPackage { .. }))
    ));
}

#[test]
fn test_dlc_units_tracked_by_sub_id() {
    let fx = Fixture::new();
    let dlc = |id: &str| {
        PackageBuilder::new("CUSA00001", "1.00", Category::Dlc)
            .unwrap()
            .dlc_id(id)
            .add_file("content.dat", id.as_bytes().to_vec())
            .build()
            .unwrap()
    };
    let a = fx.write("a.pkg", dlc("SKINPACK1"));
    let b = fx.write("b.pkg", dlc("SKINPACK2"));

    let title_a = fx.install(&a, &InstallOptions::default()).unwrap();
    let title_b = fx.install(&b, &InstallOptions::default()).unwrap();
    assert_ne!(title_a.install_path, title_b.install_path);
    assert!(title_a.install_path.ends_with("addcont/CUSA00001/SKINPACK1"));

    let report = fx.installer.install_many(
        &[a.clone(), b.clone()],
        &InstallOptions::default(),
        &NoProgress,
        &CancellationToken::new(),
    );
    let already: Vec<_> = report
        .already_installed()
        .map(|t| t.dlc_id.clone().unwrap())
        .collect();
    assert_eq!(already, vec!["SKINPACK1", "SKINPACK2"]);
    assert_eq!(fx.catalog().find_for_serial(&serial()).len(), 2);
}

#[test]
fn test_concurrent_install_of_same_key_rejected() {
    let fx = Fixture::new();
    let pkg = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    let key = TitleKey::new(serial(), Category::Base, None);

    let guard = fx.installer.registry().try_begin(key).unwrap();
    assert!(matches!(
        fx.install(&pkg, &InstallOptions::default()),
        Err(InstallError::InstallInProgress { .. })
    ));
    drop(guard);
    assert!(fx.install(&pkg, &InstallOptions::default()).is_ok());
}

#[test]
fn test_install_many_itemizes_outcomes() {
    let fx = Fixture::new();
    let base = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    let update = fx.write("update.pkg", game("1.01", Category::Update).build().unwrap());
    let missing = fx.dir.path().join("missing.pkg");

    let report = fx.installer.install_many(
        &[base.clone(), missing.clone(), update, base],
        &InstallOptions::default(),
        &NoProgress,
        &CancellationToken::new(),
    );

    assert_eq!(report.items.len(), 4);
    assert_eq!(report.installed().count(), 2);
    assert_eq!(report.already_installed().count(), 1);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, missing.as_path());
    assert!(!report.all_succeeded());
    assert!(matches!(report.items[1].outcome, InstallOutcome::Failed(_)));
}

#[test]
fn test_progress_reports_every_entry() {
    let fx = Fixture::new();
    let pkg = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    let seen = parking_lot::Mutex::new(Vec::new());
    let progress = |p: InstallProgress| seen.lock().push(p);

    fx.installer
        .install_file(&pkg, &InstallOptions::default(), &progress, &CancellationToken::new())
        .unwrap();

    let seen = seen.into_inner();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].entries_completed, 3);
    assert_eq!(seen[2].entries_total, 3);
    assert_eq!(seen[2].bytes_transferred, 3 + "eboot 1.00".len() as u64);
}

#[test]
fn test_uninstall() {
    let fx = Fixture::new();
    let pkg = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    let title = fx.install(&pkg, &InstallOptions::default()).unwrap();

    let removed = fx.installer.uninstall(&title.key()).unwrap();
    assert_eq!(removed.version.as_str(), "1.00");
    assert!(!title.install_path.exists());
    assert!(fx.catalog().is_empty());
    assert!(matches!(
        fx.installer.uninstall(&title.key()),
        Err(InstallError::NotInstalled(_))
    ));
}

#[test]
fn test_catalog_survives_reload() {
    let fx = Fixture::new();
    let pkg = fx.write("base.pkg", game("1.00", Category::Base).build().unwrap());
    fx.install(&pkg, &InstallOptions::default()).unwrap();

    let reloaded = ContentCatalog::load(fx.dir.path().join("catalog.json"));
    assert_eq!(reloaded.list().len(), 1);
    assert_eq!(reloaded.list()[0].serial, serial());
}
