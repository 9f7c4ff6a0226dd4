//! Drives the `cogworks` binary against the compiled `alpha` demo unit.
//!
//! Both are built with `-C prefer-dynamic` into a private target directory so
//! the host and the unit share one `cogworks` and one tokio runtime.
#![cfg(target_os = "linux")]

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const LINE_WAIT: Duration = Duration::from_secs(30);

struct Artifacts {
    host: PathBuf,
    unit: PathBuf,
    library_path: String,
}

#[test]
fn native_unit_load_unload_reclaim_reload() {
    let artifacts = build_artifacts();
    let temp = tempfile::tempdir().expect("create temp dir");
    let units_dir = temp.path().join("units");
    std::fs::create_dir_all(&units_dir).expect("create units dir");
    std::fs::copy(&artifacts.unit, units_dir.join("alpha.so")).expect("install alpha unit");

    let config = temp.path().join("cogworks.yaml");
    std::fs::write(
        &config,
        format!(
            "units:\n  directory: {}\nreclamation:\n  sweep_interval_ms: 50\n",
            units_dir.display()
        ),
    )
    .expect("write config");

    let mut child = Command::new(&artifacts.host)
        .arg("--config")
        .arg(&config)
        .env("LD_LIBRARY_PATH", &artifacts.library_path)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn cogworks host");
    let mut stdin = child.stdin.take().expect("host stdin");
    let lines = spawn_line_reader(child.stdout.take().expect("host stdout"));
    let mut seen = Vec::new();

    send(&mut stdin, "load alpha");
    expect_line(&lines, &mut seen, "Loaded unit `alpha` (2 modules).");
    send(&mut stdin, "load alpha");
    expect_line(&lines, &mut seen, "already loaded");

    // Ticker polls its drain flag once a second, so the unit lingers.
    send(&mut stdin, "unload alpha");
    expect_line(&lines, &mut seen, "Unloaded unit `alpha`.");
    send(&mut stdin, "load alpha");
    expect_line(&lines, &mut seen, "still unloading");

    let deadline = Instant::now() + LINE_WAIT;
    loop {
        assert!(Instant::now() < deadline, "alpha was never reclaimed: {seen:#?}");
        thread::sleep(Duration::from_millis(200));
        send(&mut stdin, "load alpha");
        let line = expect_any(&lines, &mut seen, &["Loaded unit `alpha`", "still unloading"]);
        if line.starts_with("Loaded unit") {
            assert_eq!(line, "Loaded unit `alpha` (2 modules).");
            break;
        }
    }

    send(&mut stdin, "unload alpha");
    expect_line(&lines, &mut seen, "Unloaded unit `alpha`.");
    send(&mut stdin, "quit");
    drop(stdin);

    let status = child.wait().expect("wait for host");
    seen.extend(lines.try_iter());
    assert!(status.success(), "host exited with {status}: {seen:#?}");
    assert!(
        !seen.iter().any(|line| line.contains("Exception")),
        "unexpected module exception: {seen:#?}"
    );
    assert_eq!(
        seen.iter()
            .filter(|line| line.as_str() == "Loaded unit `alpha` (2 modules).")
            .count(),
        2
    );
}

fn send(stdin: &mut ChildStdin, command: &str) {
    writeln!(stdin, "{command}").expect("write host command");
    stdin.flush().expect("flush host command");
}

fn spawn_line_reader(stdout: impl std::io::Read + Send + 'static) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn expect_line(lines: &Receiver<String>, seen: &mut Vec<String>, needle: &str) -> String {
    expect_any(lines, seen, &[needle])
}

fn expect_any(lines: &Receiver<String>, seen: &mut Vec<String>, needles: &[&str]) -> String {
    loop {
        let line = lines
            .recv_timeout(LINE_WAIT)
            .unwrap_or_else(|_| panic!("no line matching {needles:?}; output so far: {seen:#?}"));
        seen.push(line.clone());
        if needles.iter().any(|needle| line.contains(needle)) {
            return line;
        }
    }
}

fn build_artifacts() -> Artifacts {
    let crate_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let target_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("native-units");
    let triple = host_triple();

    // An explicit target keeps RUSTFLAGS away from proc-macro builds.
    let status = Command::new(cargo_bin())
        .args(["build", "-p", "cogworks", "-p", "alpha", "--lib", "--bins"])
        .arg("--target")
        .arg(&triple)
        .env("CARGO_TARGET_DIR", &target_dir)
        .env("RUSTFLAGS", "-C prefer-dynamic")
        .env_remove("CARGO_ENCODED_RUSTFLAGS")
        .current_dir(&crate_root)
        .status()
        .expect("spawn cargo build for native units");
    assert!(status.success(), "native unit build failed");

    let out = target_dir.join(&triple).join("debug");
    let std_dir = rustc_output(&["--print", "target-libdir", "--target", &triple]);
    Artifacts {
        host: out.join("cogworks"),
        unit: out.join("libalpha.so"),
        library_path: join_paths(&[&out, &out.join("deps"), Path::new(std_dir.trim())]),
    }
}

fn host_triple() -> String {
    rustc_output(&["-vV"])
        .lines()
        .find_map(|line| line.strip_prefix("host: "))
        .map(str::to_string)
        .expect("rustc reports a host triple")
}

fn rustc_output(args: &[&str]) -> String {
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let output = Command::new(rustc).args(args).output().expect("run rustc");
    assert!(output.status.success(), "rustc {args:?} failed");
    String::from_utf8(output.stdout).expect("rustc output is utf-8")
}

fn cargo_bin() -> String {
    std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string())
}

fn join_paths(paths: &[&Path]) -> String {
    std::env::join_paths(paths)
        .expect("library paths contain no separator")
        .to_string_lossy()
        .into_owned()
}
