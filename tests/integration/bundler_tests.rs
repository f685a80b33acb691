mod common;

use async_trait::async_trait;
use common::*;
use kiln::core::*;
use kiln::utils::{KilnError, Result, SourceLocation};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn assets(paths: &[&str]) -> Vec<std::path::PathBuf> {
    paths.iter().map(|path| p(path)).collect()
}

#[tokio::test]
async fn test_dynamic_import_opens_child_bundle() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./b.js"), Dependency::new("./c.js").dynamic()]);
    project.file("/src/b.js", "b()", vec![]);
    project.file("/src/c.js", "c()", vec![]);
    let h = harness(&project, "/src/a.js");

    let report = h.bundler.bundle().await.unwrap();

    let root = report.root().unwrap();
    assert_eq!(root.name, h.out("a.js"));
    assert_eq!(root.assets, assets(&["/src/a.js", "/src/b.js"]));

    let child = report.bundle_for_entry(&p("/src/c.js")).unwrap();
    assert_eq!(child.assets, assets(&["/src/c.js"]));
    assert_eq!(child.parent.as_deref(), Some(root.name.as_path()));

    let written: Vec<_> = h.packager.take().into_iter().map(|b| b.name).collect();
    assert_eq!(written, vec![root.name.clone(), child.name.clone()]);
    assert!(!h.bundler.is_errored());
    assert!(!h.bundler.is_pending());
}

#[tokio::test]
async fn test_edit_recompiles_and_repackages_only_affected_bundle() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./b.js"), Dependency::new("./c.js").dynamic()]);
    project.file("/src/b.js", "b()", vec![]);
    project.file("/src/c.js", "c()", vec![]);
    let h = harness(&project, "/src/a.js");

    let first = h.bundler.bundle().await.unwrap();
    h.packager.take();

    project.edit("/src/c.js", "c2()");
    assert!(h.bundler.queue_change(Path::new("/src/c.js")));
    assert_eq!(h.bundler.queued_assets(), assets(&["/src/c.js"]));

    let second = h.bundler.bundle().await.unwrap();

    assert_eq!(project.compile_count("/src/a.js"), 1);
    assert_eq!(project.compile_count("/src/b.js"), 1);
    assert_eq!(project.compile_count("/src/c.js"), 2);

    let old_child = first.bundle_for_entry(&p("/src/c.js")).unwrap();
    let new_child = second.bundle_for_entry(&p("/src/c.js")).unwrap();
    assert_eq!(old_child.name, new_child.name);
    assert_ne!(old_child.hash, new_child.hash);
    assert_eq!(first.root().unwrap().hash, second.root().unwrap().hash);

    assert_eq!(second.packaged, vec![new_child.name.clone()]);
    let written = h.packager.take();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].assets[0].content, "c2()");
    assert!(h.bundler.queued_assets().is_empty());
}

#[tokio::test]
async fn test_asset_shared_by_sibling_splits_is_hoisted_to_root() {
    let project = Project::new();
    project.file(
        "/src/a.js",
        "a()",
        vec![Dependency::new("./b1.js").dynamic(), Dependency::new("./b2.js").dynamic()],
    );
    project.file("/src/b1.js", "b1()", vec![Dependency::new("./x.js")]);
    project.file("/src/b2.js", "b2()", vec![Dependency::new("./x.js")]);
    project.file("/src/x.js", "x()", vec![]);
    let h = harness(&project, "/src/a.js");

    let report = h.bundler.bundle().await.unwrap();

    assert_eq!(report.primary_bundle(&p("/src/x.js")).unwrap().name, h.out("a.js"));
    assert_eq!(report.bundles_containing(&p("/src/x.js")).len(), 1);
    assert_eq!(
        report.bundle_for_entry(&p("/src/b1.js")).unwrap().assets,
        assets(&["/src/b1.js"])
    );
    assert_eq!(
        report.bundle_for_entry(&p("/src/b2.js")).unwrap().assets,
        assets(&["/src/b2.js"])
    );
}

#[tokio::test]
async fn test_static_import_inside_split_stays_in_ancestor() {
    let project = Project::new();
    project.file(
        "/src/a.js",
        "a()",
        vec![Dependency::new("./b.js"), Dependency::new("./c.js").dynamic()],
    );
    project.file("/src/b.js", "b()", vec![]);
    project.file("/src/c.js", "c()", vec![Dependency::new("./b.js")]);
    let h = harness(&project, "/src/a.js");

    let report = h.bundler.bundle().await.unwrap();

    assert_eq!(report.primary_bundle(&p("/src/b.js")).unwrap().name, h.out("a.js"));
    assert_eq!(
        report.bundle_for_entry(&p("/src/c.js")).unwrap().assets,
        assets(&["/src/c.js"])
    );
}

#[tokio::test]
async fn test_stylesheet_imported_from_script_goes_to_sibling_bundle() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./style.css")]);
    project.file("/src/style.css", "body {}", vec![]);
    let h = harness(&project, "/src/a.js");

    let report = h.bundler.bundle().await.unwrap();

    assert_eq!(report.bundle(&h.out("a.js")).unwrap().assets, assets(&["/src/a.js"]));
    assert_eq!(report.bundle(&h.out("a.css")).unwrap().assets, assets(&["/src/style.css"]));

    let written = h.packager.take();
    let css = written.iter().find(|b| b.kind == AssetKind::css()).unwrap();
    assert_eq!(css.assets[0].content, "body {}");
}

#[tokio::test]
async fn test_unreferenced_assets_are_unloaded_and_unwatched() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./b.js")]);
    project.file("/src/b.js", "b()", vec![Dependency::new("./y.js")]);
    project.file("/src/y.js", "y()", vec![]);
    let h = harness(&project, "/src/a.js");

    h.bundler.bundle().await.unwrap();
    assert!(h.watcher.is_watching("/src/y.js"));

    project.set_deps("/src/b.js", vec![]);
    h.bundler.queue_change(Path::new("/src/b.js"));
    let report = h.bundler.bundle().await.unwrap();

    assert_eq!(h.bundler.asset_paths(), assets(&["/src/a.js", "/src/b.js"]));
    assert!(!h.watcher.is_watching("/src/y.js"));
    assert!(h.watcher.is_watching("/src/b.js"));
    assert_eq!(report.root().unwrap().assets, assets(&["/src/a.js", "/src/b.js"]));
    assert!(!h.bundler.queue_change(Path::new("/src/y.js")));

    // Importing it again loads it from scratch
    project.set_deps("/src/b.js", vec![Dependency::new("./y.js")]);
    h.bundler.queue_change(Path::new("/src/b.js"));
    h.bundler.bundle().await.unwrap();

    assert_eq!(project.compile_count("/src/y.js"), 2);
    assert!(h.watcher.is_watching("/src/y.js"));
}

#[tokio::test]
async fn test_change_during_compile_is_not_lost() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./b.js")]);
    project.file("/src/b.js", "b()", vec![]);
    let h = harness(&project, "/src/a.js");
    let bundler = Arc::new(h.bundler);
    bundler.bundle().await.unwrap();
    h.packager.take();

    // A second edit lands while the first one is compiling
    let fired = Arc::new(AtomicBool::new(false));
    let (weak_bundler, weak_project) = (Arc::downgrade(&bundler), Arc::downgrade(&project));
    project.on_compile(move |path| {
        if path != Path::new("/src/b.js") || fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Some(bundler), Some(project)) = (weak_bundler.upgrade(), weak_project.upgrade()) {
            project.edit("/src/b.js", "b3()");
            assert!(bundler.queue_change(path));
        }
    });

    project.edit("/src/b.js", "b2()");
    assert!(bundler.queue_change(Path::new("/src/b.js")));
    bundler.bundle().await.unwrap();

    assert_eq!(project.compile_count("/src/b.js"), 3);
    assert_eq!(project.compile_count("/src/a.js"), 1);
    assert!(bundler.queued_assets().is_empty());
    let written = h.packager.take();
    assert_eq!(written.len(), 1);
    let b = written[0].assets.iter().find(|a| a.identity == p("/src/b.js")).unwrap();
    assert_eq!(b.content, "b3()");
}

#[tokio::test]
async fn test_each_asset_compiled_once_per_pass() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./b.js"), Dependency::new("./c.js")]);
    project.file("/src/b.js", "b()", vec![Dependency::new("./d.js")]);
    project.file("/src/c.js", "c()", vec![Dependency::new("./d.js")]);
    project.file("/src/d.js", "d()", vec![Dependency::new("./a.js")]);
    let h = harness(&project, "/src/a.js");

    let report = h.bundler.bundle().await.unwrap();

    for path in ["/src/a.js", "/src/b.js", "/src/c.js", "/src/d.js"] {
        assert_eq!(project.compile_count(path), 1, "{}", path);
    }
    assert_eq!(project.total_compiles(), 4);
    assert_eq!(report.root().unwrap().assets.len(), 4);
    assert_eq!(report.bundles.len(), 1);
}

#[tokio::test]
async fn test_missing_import_reports_importer_and_location() {
    let project = Project::new();
    project.file(
        "/src/a.js",
        "a()",
        vec![Dependency::new("./missing.js").at(SourceLocation::new(3, 8))],
    );
    let h = harness(&project, "/src/a.js");
    let mut events = h.bundler.subscribe();

    let err = h.bundler.bundle().await.unwrap_err();
    match &err {
        KilnError::Resolution { specifier, context } => {
            assert_eq!(specifier, "./missing.js");
            assert_eq!(context.file_path.as_deref(), Some(Path::new("/src/a.js")));
            assert_eq!(context.location, Some(SourceLocation::new(3, 8)));
        }
        other => panic!("expected a resolution error, got {:?}", other),
    }
    assert_eq!(err.file_path(), Some(Path::new("/src/a.js")));
    assert!(h.bundler.is_errored());
    assert_eq!(h.bundler.queued_assets(), assets(&["/src/a.js"]));

    assert_eq!(events.try_recv().unwrap(), BuildEvent::BuildStart);
    assert_eq!(events.try_recv().unwrap(), BuildEvent::BuildEnd { errored: true });

    // Creating the file lets the next pass succeed
    project.file("/src/missing.js", "m()", vec![]);
    let report = h.bundler.bundle().await.unwrap();

    assert!(!h.bundler.is_errored());
    assert_eq!(report.root().unwrap().assets, assets(&["/src/a.js", "/src/missing.js"]));
}

#[tokio::test]
async fn test_compile_error_is_retried_on_next_pass() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./b.js")]);
    project.file("/src/b.js", "b(", vec![]);
    project.fail("/src/b.js", Some("Unexpected end of input"));
    let h = harness(&project, "/src/a.js");

    let err = h.bundler.bundle().await.unwrap_err();
    assert!(matches!(err, KilnError::Compile { .. }));
    assert!(err.to_string().contains("Unexpected end of input"));
    assert!(h.bundler.queued_assets().contains(&p("/src/b.js")));

    project.edit("/src/b.js", "b()");
    project.fail("/src/b.js", None);
    let report = h.bundler.bundle().await.unwrap();

    assert_eq!(project.compile_count("/src/b.js"), 2);
    assert_eq!(report.root().unwrap().assets, assets(&["/src/a.js", "/src/b.js"]));
    assert!(h.bundler.queued_assets().is_empty());
}

#[tokio::test]
async fn test_hmr_receives_updates_after_rebuilds_only() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./c.js").dynamic()]);
    project.file("/src/c.js", "c()", vec![]);
    let h = harness(&project, "/src/a.js");
    let hmr = Arc::new(RecordingHmr::default());
    let bundler = h.bundler.with_hmr(hmr.clone());

    bundler.bundle().await.unwrap();
    assert!(hmr.updates.lock().is_empty());

    project.edit("/src/c.js", "c2()");
    bundler.queue_change(Path::new("/src/c.js"));
    bundler.bundle().await.unwrap();
    assert_eq!(*hmr.updates.lock(), vec![assets(&["/src/c.js"])]);

    project.fail("/src/c.js", Some("boom"));
    bundler.queue_change(Path::new("/src/c.js"));
    assert!(bundler.bundle().await.is_err());
    assert_eq!(hmr.errors.lock().len(), 1);
}

struct ExtraDependencies;

#[async_trait]
impl BuildDelegate for ExtraDependencies {
    async fn implicit_dependencies(&self, asset: &Path, _kind: &AssetKind) -> Result<Option<Vec<Dependency>>> {
        if asset.ends_with("a.js") {
            Ok(Some(vec![Dependency::new("./runtime.js")]))
        } else {
            Ok(None)
        }
    }
}

#[tokio::test]
async fn test_delegate_adds_implicit_dependencies() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![]);
    project.file("/src/runtime.js", "runtime()", vec![]);
    let h = harness(&project, "/src/a.js");
    let bundler = h.bundler.with_delegate(Arc::new(ExtraDependencies));

    let report = bundler.bundle().await.unwrap();

    assert_eq!(report.root().unwrap().assets, assets(&["/src/a.js", "/src/runtime.js"]));
}

#[tokio::test]
async fn test_inlined_import_is_an_alias_of_its_parent() {
    let project = Project::new();
    project.file("/src/theme.less", "@c: red;", vec![Dependency::new("./vars.less").included_in_parent()]);
    project.file("/src/vars.less", "@red: #f00;", vec![]);
    let h = harness(&project, "/src/theme.less");

    let report = h.bundler.bundle().await.unwrap();

    assert_eq!(report.root().unwrap().name, h.out("theme.css"));
    assert_eq!(h.bundler.asset_paths(), assets(&["/src/theme.less"]));
    assert!(h.watcher.is_watching("/src/vars.less"));
    assert_eq!(project.compile_count("/src/vars.less"), 0);

    assert!(h.bundler.queue_change(Path::new("/src/vars.less")));
    assert_eq!(h.bundler.queued_assets(), assets(&["/src/theme.less"]));

    h.bundler.bundle().await.unwrap();
    assert_eq!(project.compile_count("/src/theme.less"), 2);
}

#[tokio::test]
async fn test_registration_rejected_once_bundling_started() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![]);
    let h = harness(&project, "/src/a.js");

    h.bundler.bundle().await.unwrap();

    let err = h
        .bundler
        .add_packager(AssetKind::new("wasm"), h.packager.clone())
        .unwrap_err();
    assert!(matches!(err, KilnError::Config(_)));
    assert!(h
        .bundler
        .add_asset_type("vue", AssetKind::js(), project.clone())
        .is_err());
}

#[tokio::test]
async fn test_overlapping_bundle_calls_run_one_after_another() {
    let project = Project::new();
    project.file("/src/a.js", "a()", vec![Dependency::new("./b.js")]);
    project.file("/src/b.js", "b()", vec![]);
    let h = harness(&project, "/src/a.js");
    let mut events = h.bundler.subscribe();

    let (first, second) = tokio::join!(h.bundler.bundle(), h.bundler.bundle());
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.packaged.len(), 1);
    assert!(second.packaged.is_empty());
    assert_eq!(project.total_compiles(), 2);

    let mut sequence = Vec::new();
    while let Ok(event) = events.try_recv() {
        sequence.push(match event {
            BuildEvent::BuildStart => "start",
            BuildEvent::Bundled { .. } => "bundled",
            BuildEvent::BuildEnd { .. } => "end",
        });
    }
    assert_eq!(sequence, vec!["start", "bundled", "end", "start", "bundled", "end"]);
}

#[tokio::test]
async fn test_build_from_disk_with_default_collaborators() {
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("index.js"),
        "import './style.css';\nimport('./lazy.js');\nconsole.log('index');\n",
    )
    .unwrap();
    std::fs::write(src.join("lazy.js"), "console.log('lazy');\n").unwrap();
    std::fs::write(
        src.join("style.css"),
        "@import './print.css' print;\nbody { color: red; }\n",
    )
    .unwrap();
    std::fs::write(src.join("print.css"), "a { color: black; }\n").unwrap();

    let out_dir = temp_dir.path().join("dist");
    let bundler = Bundler::new(
        src.join("index.js"),
        BundlerOptions {
            out_dir: Some(out_dir.clone()),
            cache: Some(false),
            minify: Some(false),
            log_level: Some(0),
            ..Default::default()
        },
    )
    .with_worker_context(Arc::new(kiln::infrastructure::WorkerContext::with_workers(1)));

    let report = bundler.bundle().await.unwrap();

    let script = std::fs::read_to_string(out_dir.join("index.js")).unwrap();
    assert!(script.contains("console.log('index');"));
    assert!(!script.contains("lazy');"));

    let styles = std::fs::read_to_string(out_dir.join("index.css")).unwrap();
    assert!(styles.contains("body { color: red; }"));
    assert!(styles.contains("@media print {\na { color: black; }\n}"));
    assert!(!styles.contains("@import"));

    let lazy = std::fs::canonicalize(src.join("lazy.js")).unwrap();
    let split = report.bundle_for_entry(&lazy).unwrap();
    assert!(std::fs::read_to_string(&split.name).unwrap().contains("console.log('lazy');"));
}

#[tokio::test]
async fn test_html_entry_references_sibling_files_by_url() {
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(
        src.join("index.html"),
        "<html><body><script src=\"main.js\"></script></body></html>\n",
    )
    .unwrap();
    std::fs::write(src.join("main.js"), "console.log('main');\n").unwrap();

    let out_dir = temp_dir.path().join("dist");
    let bundler = Bundler::new(
        src.join("index.html"),
        BundlerOptions {
            out_dir: Some(out_dir.clone()),
            cache: Some(false),
            minify: Some(false),
            log_level: Some(0),
            ..Default::default()
        },
    )
    .with_worker_context(Arc::new(kiln::infrastructure::WorkerContext::with_workers(1)));

    bundler.bundle().await.unwrap();

    let script = std::fs::read_to_string(out_dir.join("index.js")).unwrap();
    assert!(script.contains("console.log('main');"));
    assert!(out_dir.join("index.html").exists());
}

/// Default compiler that counts how often it runs
#[derive(Default)]
struct CountingCompiler(std::sync::atomic::AtomicUsize);

impl Compiler for CountingCompiler {
    fn compile(&self, path: &Path, package: &PackageMetadata, options: &BuildOptions) -> Result<CompiledUnit> {
        self.0.fetch_add(1, Ordering::SeqCst);
        kiln::infrastructure::SourceCompiler.compile(path, package, options)
    }
}

/// Fresh bundler over `root/src/theme.less` with a persistent cache; returns
/// the number of compiles the pass needed
async fn build_cached(root: &Path) -> usize {
    let compiler = Arc::new(CountingCompiler::default());
    let bundler = Bundler::new(
        root.join("src/theme.less"),
        BundlerOptions {
            out_dir: Some(root.join("dist")),
            cache: Some(true),
            cache_dir: Some(root.join("cache")),
            log_level: Some(0),
            ..Default::default()
        },
    )
    .with_compiler(compiler.clone())
    .with_worker_context(Arc::new(kiln::infrastructure::WorkerContext::with_workers(1)));
    bundler.bundle().await.unwrap();
    bundler.stop();
    drop(bundler);
    compiler.0.load(Ordering::SeqCst)
}

#[tokio::test]
async fn test_persistent_cache_tracks_extensionless_inlined_import() {
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("theme.less"), "@import 'vars';\n.a { color: @red; }\n").unwrap();
    std::fs::write(src.join("vars.less"), "@red: #f00;\n").unwrap();

    assert_eq!(build_cached(temp_dir.path()).await, 1);
    assert_eq!(build_cached(temp_dir.path()).await, 0);

    std::thread::sleep(std::time::Duration::from_millis(50));
    std::fs::write(src.join("vars.less"), "@red: #e00;\n").unwrap();
    assert_eq!(build_cached(temp_dir.path()).await, 1);
}
