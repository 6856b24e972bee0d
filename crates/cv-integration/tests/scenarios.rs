//! End-to-end scenarios through the content manager

use cv_core::cancel::CancellationToken;
use cv_core::config::{Config, PathConfig};
use cv_core::error::InstallError;
use cv_core::title::{Category, Serial, TitleKey};
use cv_integration::{ContentManager, InstallEvent};
use cv_loader::PackageBuilder;
use cv_patch::ParseWarningKind;
use std::path::{Path, PathBuf};

fn manager(base: &Path) -> ContentManager {
    let config = Config {
        paths: PathConfig::with_base(base),
        ..Config::default()
    };
    ContentManager::open(config).unwrap()
}

fn package(dir: &Path, name: &str, version: &str, category: Category) -> PathBuf {
    let path = dir.join(name);
    let data = PackageBuilder::new("CUSA00001", version, category)
        .unwrap()
        .compress(true)
        .add_dir("sce_sys")
        .add_file("sce_sys/param.sfo", b"PSF\x01".to_vec())
        .add_file("eboot.bin", vec![0x7F; 4096])
        .build()
        .unwrap();
    std::fs::write(&path, data).unwrap();
    path
}

fn serial() -> Serial {
    Serial::parse("CUSA00001").unwrap()
}

#[test]
fn test_install_update_and_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    let options = cm.install_options();

    let base = package(dir.path(), "base.pkg", "1.00", Category::Base);
    cm.install_package(&base, &options).unwrap();
    let listed = cm.list_installed();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].serial, serial());
    assert_eq!(listed[0].category, Category::Base);
    assert_eq!(listed[0].version.as_str(), "1.00");

    let update = package(dir.path(), "update.pkg", "1.05", Category::Update);
    cm.install_package(&update, &options).unwrap();
    assert_eq!(cm.launch_version(&serial()).unwrap().as_str(), "1.05");

    let older = package(dir.path(), "older.pkg", "1.02", Category::Update);
    assert!(matches!(
        cm.install_package(&older, &options),
        Err(InstallError::VersionConflict { .. })
    ));
    let update_key = TitleKey::new(serial(), Category::Update, None);
    assert_eq!(
        cm.catalog().find(&update_key).unwrap().version.as_str(),
        "1.05"
    );
}

#[test]
fn test_background_install_streams_progress() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    let pkg = package(dir.path(), "base.pkg", "1.00", Category::Base);

    let task = cm.spawn_install(&pkg, cm.install_options());
    let mut progress = Vec::new();
    let result = task.wait_with(|p| progress.push(p));

    let title = result.unwrap();
    assert_eq!(title.entry_count, 3);
    assert_eq!(progress.len(), 3);
    assert_eq!(progress.last().unwrap().entries_completed, 3);
    assert_eq!(progress.last().unwrap().bytes_transferred, 4 + 4096);
}

#[test]
fn test_background_install_events_end_with_result() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    let pkg = package(dir.path(), "base.pkg", "1.00", Category::Base);

    let task = cm.spawn_install(&pkg, cm.install_options());
    let mut finished = None;
    for event in task.events().iter() {
        if let InstallEvent::Finished(result) = event {
            finished = Some(result);
            break;
        }
    }
    assert!(finished.unwrap().is_ok());
    assert_eq!(cm.list_installed().len(), 1);
}

#[test]
fn test_cancelled_background_install_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    let pkg = package(dir.path(), "base.pkg", "1.00", Category::Base);

    let task = cm.spawn_install(&pkg, cm.install_options());
    let token = task.cancel_token();
    let result = task.wait_with(|_| token.cancel());

    // The last entry may already be written when the request lands
    match result {
        Err(InstallError::Cancelled) => assert!(cm.list_installed().is_empty()),
        Ok(_) => assert_eq!(cm.list_installed().len(), 1),
        Err(other) => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_batch_install_itemizes() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    let base = package(dir.path(), "base.pkg", "1.00", Category::Base);
    let garbage = dir.path().join("garbage.pkg");
    std::fs::write(&garbage, vec![0u8; 512]).unwrap();

    let report = cm.install_packages(&[base.clone(), garbage, base], &cm.install_options());
    assert_eq!(report.installed().count(), 1);
    assert_eq!(report.already_installed().count(), 1);
    assert_eq!(report.failures().count(), 1);
}

#[test]
fn test_patches_for_launch() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    cm.install_package(
        &package(dir.path(), "base.pkg", "1.00", Category::Base),
        &cm.install_options(),
    )
    .unwrap();
    cm.install_package(
        &package(dir.path(), "update.pkg", "1.05", Category::Update),
        &cm.install_options(),
    )
    .unwrap();

    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(
        repo.join("CUSA00001.xml"),
        r#"<PatchRepository name="local">
  <Patch id="fps60" name="60 FPS" serial="CUSA00001" version="1.05">
    <Op address="0x1000" kind="byte" payload="00"/>
    <Op address="0xFFFFFFFF" kind="byte" payload="01"/>
  </Patch>
  <Patch id="other-game" serial="CUSA00002" version="1.05">
    <Op address="0x0" kind="byte" payload="00"/>
  </Patch>
  <Patch id="bad" serial="CUSA00001" version="1.05"/>
</PatchRepository>"#,
    )
    .unwrap();

    let url = format!("file://{}", repo.display());
    let outcome = cm
        .fetch_patch_definitions(&serial(), &url, &CancellationToken::new())
        .unwrap();
    assert_eq!(outcome.definitions.len(), 1);
    let kinds: Vec<_> = outcome.warnings.iter().map(|w| w.kind).collect();
    assert!(kinds.contains(&ParseWarningKind::EmptyOps));
    assert!(kinds.contains(&ParseWarningKind::InvalidSerial));

    let listed = cm.list_patches(&serial());
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].enabled);

    cm.set_patch_enabled(&serial(), "fps60", true).unwrap();

    let version = cm.launch_version(&serial()).unwrap();
    let mut image = vec![0xCCu8; 0x2000];
    let report = cm
        .apply_patches_for_launch(&serial(), &version, &mut image, &CancellationToken::new())
        .unwrap();
    assert_eq!(report.applied_count(), 1);
    assert_eq!(report.out_of_bounds().count(), 1);
    assert_eq!(image[0x1000], 0x00);
}

#[test]
fn test_malformed_refetch_keeps_stored_patches() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let document = repo.join("CUSA00001.xml");
    let url = format!("file://{}", repo.display());

    std::fs::write(
        &document,
        r#"<PatchRepository name="local">
  <Patch id="fps60" name="60 FPS" serial="CUSA00001" version="1.00">
    <Op address="0x10" kind="byte" payload="00"/>
  </Patch>
</PatchRepository>"#,
    )
    .unwrap();
    cm.fetch_patch_definitions(&serial(), &url, &CancellationToken::new())
        .unwrap();
    cm.set_patch_enabled(&serial(), "fps60", true).unwrap();

    std::fs::write(&document, "<html><body>502 Bad Gateway").unwrap();
    let outcome = cm
        .fetch_patch_definitions(&serial(), &url, &CancellationToken::new())
        .unwrap();
    assert!(outcome.definitions.is_empty());
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].kind, ParseWarningKind::Document);

    let listed = cm.list_patches(&serial());
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].definition.id, "fps60");
    assert!(listed[0].enabled);
}

#[test]
fn test_uninstall_then_launch_version_missing() {
    let dir = tempfile::tempdir().unwrap();
    let cm = manager(&dir.path().join("data"));
    let title = cm
        .install_package(
            &package(dir.path(), "base.pkg", "1.00", Category::Base),
            &cm.install_options(),
        )
        .unwrap();

    cm.uninstall(&title.key()).unwrap();
    assert!(cm.list_installed().is_empty());
    assert!(cm.launch_version(&serial()).is_err());
}

#[test]
fn test_reopen_cleans_stale_staging() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    {
        let cm = manager(&base);
        let stale = cm.config().paths.content_root.join(".staging/leftover");
        std::fs::create_dir_all(&stale).unwrap();
    }
    let cm = manager(&base);
    let staging = cm.config().paths.content_root.join(".staging");
    assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
}
