use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, UNIX_EPOCH};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::{TempDir, tempdir};

const CONFIG: &str = r#"
[loader]
server = "/w/load.php"

[modules.jquery]
scripts = ["resources/jquery.js"]

[modules.mediawiki]
scripts = ["resources/mediawiki.js"]
dependencies = ["jquery"]
group = "core"
styles = ["resources/skins/main.css"]
messages = ["hello"]

[modules.site]
kind = "site"
"#;

fn write(root: &Path, relative: &str, content: &str, mtime: u64) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(&path, content).expect("write");
    let file = OpenOptions::new().write(true).open(&path).expect("open");
    file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
        .expect("set mtime");
}

fn resourceloader(root: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_resourceloader"));
    command
        .current_dir(root)
        .arg("--project-root")
        .arg(root)
        .env_remove("RESOURCELOADER_ROOT")
        .env_remove("RESOURCELOADER_DATA_DIR")
        .env_remove("RESOURCELOADER_CONFIG")
        .env_remove("RESOURCELOADER_SERVER")
        .env_remove("RUST_LOG");
    command
}

fn installed() -> TempDir {
    let temp = tempdir().expect("tempdir");
    resourceloader(temp.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote_config: true"))
        .stdout(predicate::str::contains("applied_migrations: 2"));

    let root = temp.path();
    fs::write(root.join(".resourceloader/config.toml"), CONFIG).expect("config");
    write(root, "resources/startup.js", "/* startup */", 1_000);
    write(root, "resources/jquery.js", "var jQuery;", 1_300_000_049);
    write(root, "resources/mediawiki.js", "var mediaWiki;", 1_200_000_000);
    write(
        root,
        "resources/skins/main.css",
        ".logo { background: url(images/logo.png); }",
        1_200_000_000,
    );
    write(root, "resources/skins/images/logo.png", "png", 1_200_000_000);
    temp
}

#[test]
fn init_is_idempotent() {
    let temp = installed();
    resourceloader(temp.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote_config: false"))
        .stdout(predicate::str::contains("applied_migrations: 0"));
}

#[test]
fn mtime_reports_module_freshness() {
    let temp = installed();
    resourceloader(temp.path())
        .args(["mtime", "jquery"])
        .assert()
        .success()
        .stdout("1300000049\n");

    resourceloader(temp.path())
        .args(["mtime", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown module: missing"));
}

#[test]
fn mtime_fails_when_a_module_file_is_missing() {
    let temp = installed();
    fs::remove_file(temp.path().join("resources/mediawiki.js")).expect("remove");
    resourceloader(temp.path())
        .args(["mtime", "mediawiki"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mediawiki.js"));
}

#[test]
fn styles_record_file_dependencies() {
    let temp = installed();
    resourceloader(temp.path())
        .args(["styles", "mediawiki"])
        .assert()
        .success()
        .stdout(predicate::str::contains("url(resources/skins/images/logo.png)"));

    resourceloader(temp.path())
        .args(["deps", "mediawiki"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dependencies: jquery"))
        .stdout(predicate::str::contains(
            "file_dependencies.vector: resources/skins/images/logo.png",
        ));

    write(
        temp.path(),
        "resources/skins/images/logo.png",
        "png",
        1_400_000_000,
    );
    resourceloader(temp.path())
        .args(["mtime", "mediawiki"])
        .assert()
        .success()
        .stdout("1400000000\n");
}

#[test]
fn blob_timestamp_feeds_module_freshness() {
    let temp = installed();
    resourceloader(temp.path())
        .args([
            "blob",
            "set",
            "mediawiki",
            "en",
            r#"{"hello":"Hello"}"#,
            "--timestamp",
            "1500000000",
        ])
        .assert()
        .success();

    resourceloader(temp.path())
        .args(["mtime", "mediawiki"])
        .assert()
        .success()
        .stdout("1500000000\n");
    resourceloader(temp.path())
        .args(["mtime", "mediawiki", "--lang", "de"])
        .assert()
        .success()
        .stdout("1200000000\n");

    resourceloader(temp.path())
        .args(["db", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("msg_resource_rows: 1"));
}

#[test]
fn modules_lists_registrations() {
    let temp = installed();
    resourceloader(temp.path())
        .arg("modules")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "jquery: mtime=1300000049 group=- dependencies=<none>",
        ))
        .stdout(predicate::str::contains(
            "mediawiki: mtime=1200000000 group=core dependencies=jquery",
        ))
        .stdout(predicate::str::contains("site: mtime=1 "))
        .stdout(predicate::str::contains("startup: mtime=1300000049 maxage=300"));
}

#[test]
fn startup_and_load_render_client_script() {
    let temp = installed();
    resourceloader(temp.path())
        .args(["startup", "--only", "scripts"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            r#"["mediawiki",1200000000,["jquery"],"core"]"#,
        ))
        .stdout(predicate::str::contains("/w/load.php?modules=jquery%7Cmediawiki"))
        .stdout(predicate::str::contains("version=2011-03-13T07%3A06%3A40Z"));

    resourceloader(temp.path())
        .args(["load", "jquery", "ghost"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "mediaWiki.loader.implement( \"jquery\", function() {\nvar jQuery;\n\n\n}, {}, {} );",
        ))
        .stdout(predicate::str::contains(
            "mediaWiki.loader.state( {\"ghost\":\"missing\"} );",
        ));

    resourceloader(temp.path())
        .args(["startup", "--only", "everything"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown `only` selector"));
}
